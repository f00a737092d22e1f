//! Applies console commands to a node.
//!
//! Commands go through the same controller methods as bus telegrams, so a
//! console session exercises exactly the code paths the field bus does.

use core::fmt;

use heapless::Vec;

use super::grammar::{self, Command, OutputCommand, PwmAction, ShaderAction};
use crate::clock::{Clock, Millis};
use crate::codec::ShaderSetup;
use crate::digital::{OutputDriver, OutputError};
use crate::node::{Node, NodeAction};
use crate::persist::Storage;
use crate::pwm::{PwmDriver, PwmError};
use crate::shader::ShaderError;

/// Most node actions collected from a single `rx` line.
pub const MAX_RX_ACTIONS: usize = 4;

/// One line per command, printed by `help`.
pub const HELP: &[&str] = &[
    "shader <ch> pos <0-100>",
    "shader <ch> stop",
    "shader <ch> setup <power> <direction> <open> <close>",
    "pwm <ch> on|off|toggle",
    "pwm <ch> level <n>",
    "pwm <ch> fade <start> <target> <duration>",
    "pwm <ch> delay-off <duration>",
    "out <ch> on|off|toggle|trigger",
    "out <ch> delay-on|delay-off <duration>",
    "out <ch> pulse <on> <off>",
    "switch <mask>",
    "rx <hex bytes>",
    "tick <duration>",
    "status | snapshot | restore | help",
];

/// Errors surfaced while executing a console line.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ConsoleError {
    Parse(grammar::ParseError),
    Shader(ShaderError),
    Pwm(PwmError),
    Output(OutputError),
}

impl fmt::Display for ConsoleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConsoleError::Parse(error) => write!(f, "{error}"),
            ConsoleError::Shader(error) => write!(f, "{error}"),
            ConsoleError::Pwm(error) => write!(f, "{error}"),
            ConsoleError::Output(error) => write!(f, "{error}"),
        }
    }
}

impl From<grammar::ParseError> for ConsoleError {
    fn from(error: grammar::ParseError) -> Self {
        Self::Parse(error)
    }
}

impl From<ShaderError> for ConsoleError {
    fn from(error: ShaderError) -> Self {
        Self::Shader(error)
    }
}

impl From<PwmError> for ConsoleError {
    fn from(error: PwmError) -> Self {
        Self::Pwm(error)
    }
}

impl From<OutputError> for ConsoleError {
    fn from(error: OutputError) -> Self {
        Self::Output(error)
    }
}

/// What the front-end should do after a command ran.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outcome {
    Done,
    /// Simulated time should move forward; the caller owns the clock.
    Advance(Millis),
    /// Print the node status.
    Status,
    /// Print [`HELP`].
    Help,
    /// Actions raised by telegrams decoded from injected bytes.
    Received { actions: Vec<NodeAction, MAX_RX_ACTIONS> },
    Snapshot,
    /// Whether a saved state was found.
    Restored(bool),
}

/// Parses and executes one console line.
///
/// # Errors
///
/// Returns the parse failure or the controller rejection.
pub fn execute_line<C, D, P, S>(
    node: &mut Node<C, D, P, S>,
    line: &str,
) -> Result<Outcome, ConsoleError>
where
    C: Clock,
    D: OutputDriver,
    P: PwmDriver,
    S: Storage,
{
    let command = grammar::parse_command(line)?;
    execute(node, command)
}

/// Executes a parsed command against `node`.
///
/// # Errors
///
/// Returns the controller rejection; the node is left unchanged on error.
pub fn execute<C, D, P, S>(
    node: &mut Node<C, D, P, S>,
    command: Command,
) -> Result<Outcome, ConsoleError>
where
    C: Clock,
    D: OutputDriver,
    P: PwmDriver,
    S: Storage,
{
    match command {
        Command::Shader { channel, action } => shader(node, channel, action)?,
        Command::Pwm { channel, action } => pwm(node, channel, action)?,
        Command::Output { channel, action } => output(node, channel, action)?,
        Command::Switch(mask) => {
            for channel in 0..2 {
                if node.outputs().is_reserved(channel) {
                    return Err(OutputError::Reserved(channel).into());
                }
            }
            for channel in 0..2 {
                node.outputs_mut().set(channel, mask & (1 << channel) != 0)?;
            }
        }
        Command::Receive(bytes) => {
            let mut actions = Vec::new();
            for byte in bytes {
                if let Some(action) = node.bus_poll(byte) {
                    // Only the first few actions of a burst are reported.
                    let _ = actions.push(action);
                }
            }
            return Ok(Outcome::Received { actions });
        }
        Command::Tick(ms) => return Ok(Outcome::Advance(ms)),
        Command::Status => return Ok(Outcome::Status),
        Command::Snapshot => {
            node.power_fail();
            return Ok(Outcome::Snapshot);
        }
        Command::Restore => return Ok(Outcome::Restored(node.restore())),
        Command::Help => return Ok(Outcome::Help),
    }
    Ok(Outcome::Done)
}

fn shader<C, D, P, S>(
    node: &mut Node<C, D, P, S>,
    channel: usize,
    action: ShaderAction,
) -> Result<(), ShaderError>
where
    C: Clock,
    D: OutputDriver,
    P: PwmDriver,
    S: Storage,
{
    match action {
        ShaderAction::Position(position) => node.shaders_mut().set_position(channel, position),
        ShaderAction::Stop => node.shaders_mut().stop(channel),
        ShaderAction::Setup {
            power,
            direction,
            open_ms,
            close_ms,
        } => node.configure_shader(
            channel,
            ShaderSetup {
                power,
                direction,
                open_ds: ms_to_ds(open_ms),
                close_ds: ms_to_ds(close_ms),
            },
        ),
    }
}

fn pwm<C, D, P, S>(
    node: &mut Node<C, D, P, S>,
    channel: usize,
    action: PwmAction,
) -> Result<(), PwmError>
where
    C: Clock,
    D: OutputDriver,
    P: PwmDriver,
    S: Storage,
{
    let (clock, pwm) = node.clock_and_pwm();
    match action {
        PwmAction::On => pwm.on(channel),
        PwmAction::Off => pwm.off(channel),
        PwmAction::Toggle => pwm.toggle(channel),
        PwmAction::Level(level) => pwm.set_level(channel, level),
        PwmAction::Fade {
            start,
            target,
            duration_ms,
        } => pwm.fade(clock, channel, start, target, duration_ms),
        PwmAction::DelayOff(delay_ms) => pwm.delay_off(clock, channel, delay_ms),
    }
}

fn output<C, D, P, S>(
    node: &mut Node<C, D, P, S>,
    channel: usize,
    action: OutputCommand,
) -> Result<(), OutputError>
where
    C: Clock,
    D: OutputDriver,
    P: PwmDriver,
    S: Storage,
{
    let (clock, outputs) = node.clock_and_outputs();
    match action {
        OutputCommand::On => outputs.set(channel, true),
        OutputCommand::Off => outputs.set(channel, false),
        OutputCommand::Toggle => outputs.toggle(channel),
        OutputCommand::Trigger => outputs.trigger(clock, channel),
        OutputCommand::DelayOn(delay_ms) => outputs.on_delay(clock, channel, delay_ms),
        OutputCommand::DelayOff(delay_ms) => outputs.off_delay(clock, channel, delay_ms),
        OutputCommand::Pulse { on_ms, off_ms } => {
            outputs.on_off_delay(clock, channel, on_ms, off_ms)
        }
    }
}

/// Travel times are stored in deciseconds.
fn ms_to_ds(ms: Millis) -> u16 {
    u16::try_from(ms / 100).unwrap_or(u16::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::codec::DeviceType;
    use crate::config::NodeConfig;
    use crate::digital::NoopOutputDriver;
    use crate::persist::RamStorage;
    use crate::pwm::NoopPwmDriver;

    type TestNode<'a> = Node<&'a ManualClock, NoopOutputDriver, NoopPwmDriver, RamStorage>;

    fn node(clock: &ManualClock, device_type: DeviceType) -> TestNode<'_> {
        Node::new(
            clock,
            NodeConfig::new(0x10, device_type),
            NoopOutputDriver,
            NoopPwmDriver,
            RamStorage::new(),
        )
    }

    #[test]
    fn configures_and_moves_shader() {
        let clock = ManualClock::new(0);
        let mut node = node(&clock, DeviceType::ShaderPanel);
        assert_eq!(
            execute_line(&mut node, "shader 0 setup 4 5 30s 25s"),
            Ok(Outcome::Done)
        );
        assert_eq!(node.config().shader_setup[0].open_ds, 300);
        assert!(node.outputs().is_reserved(4));

        assert_eq!(execute_line(&mut node, "shader 0 pos 50"), Ok(Outcome::Done));
        assert_eq!(
            execute_line(&mut node, "out 4 on"),
            Err(ConsoleError::Output(OutputError::Reserved(4)))
        );
    }

    #[test]
    fn switch_and_pulse_drive_outputs() {
        let clock = ManualClock::new(0);
        let mut node = node(&clock, DeviceType::SwitchPanel);
        assert_eq!(execute_line(&mut node, "switch 3"), Ok(Outcome::Done));
        assert_eq!(node.switch_state(), 0b11);

        execute_line(&mut node, "out 2 pulse 100 200").unwrap();
        assert_eq!(node.outputs().is_on(2), Some(false));
        clock.advance(100);
        for _ in 0..32 {
            node.check();
        }
        assert_eq!(node.outputs().is_on(2), Some(true));
    }

    #[test]
    fn tick_and_status_are_left_to_the_caller() {
        let clock = ManualClock::new(0);
        let mut node = node(&clock, DeviceType::PwmPanel);
        assert_eq!(execute_line(&mut node, "tick 2s"), Ok(Outcome::Advance(2000)));
        assert_eq!(execute_line(&mut node, "status"), Ok(Outcome::Status));
        assert!(matches!(
            execute_line(&mut node, "pwm 20 on"),
            Err(ConsoleError::Pwm(PwmError::InvalidChannel(20)))
        ));
        assert!(matches!(
            execute_line(&mut node, "bogus"),
            Err(ConsoleError::Parse(_))
        ));
    }

    #[test]
    fn snapshot_then_restore() {
        let clock = ManualClock::new(0);
        let mut node = node(&clock, DeviceType::PwmPanel);
        execute_line(&mut node, "pwm 1 level 80").unwrap();
        execute_line(&mut node, "pwm 1 on").unwrap();
        assert_eq!(execute_line(&mut node, "snapshot"), Ok(Outcome::Snapshot));
        execute_line(&mut node, "pwm 1 off").unwrap();
        assert_eq!(execute_line(&mut node, "restore"), Ok(Outcome::Restored(true)));
        assert_eq!(node.pwm().is_enabled(1), Some(true));
        assert_eq!(node.pwm().level(1), Some(80));
    }
}
