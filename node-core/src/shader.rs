//! Blind (shader) positioning with interlocked relay sequencing.
//!
//! Each channel drives a motor through two relays: a power relay that
//! energises the motor and a direction relay that selects open or close.
//! The controller never switches both relays in the same poll tick and
//! always de-energises the motor before the direction relay changes.
//! Position is estimated open-loop from elapsed run time against the
//! configured travel durations; `100` is fully open and `0` fully closed.

use core::fmt;

use crate::clock::{Clock, Millis, elapsed};
use crate::codec::telegram::SHADER_CHANNELS;

/// Number of shader channels a node supports.
pub const MAX_SHADERS: usize = SHADER_CHANNELS;

/// Fully open position.
pub const POSITION_OPEN: u8 = 100;
/// Fully closed position.
pub const POSITION_CLOSED: u8 = 0;
/// Offset added to reported positions while a channel is manually overridden.
pub const MANUAL_POSITION_OFFSET: u8 = 128;

/// Direction relay level that selects closing.
const DIRECTION_CLOSE: bool = true;

/// Settle times between relay operations.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct ShaderTiming {
    /// Wait between switching one relay and the other.
    pub relay_settle_ms: Millis,
    /// Pause with the motor off before reversing.
    pub direction_change_ms: Millis,
    /// Run time, as a percentage of the travel duration, before a move to
    /// an end stop counts as complete.
    pub end_stop_margin_percent: u32,
}

impl ShaderTiming {
    pub const DEFAULT_RELAY_SETTLE_MS: Millis = 20;
    pub const DEFAULT_DIRECTION_CHANGE_MS: Millis = 500;
    pub const DEFAULT_END_STOP_MARGIN_PERCENT: u32 = 110;
}

impl Default for ShaderTiming {
    fn default() -> Self {
        Self {
            relay_settle_ms: Self::DEFAULT_RELAY_SETTLE_MS,
            direction_change_ms: Self::DEFAULT_DIRECTION_CHANGE_MS,
            end_stop_margin_percent: Self::DEFAULT_END_STOP_MARGIN_PERCENT,
        }
    }
}

/// Relay outputs that shader channels switch.
pub trait RelayBank {
    /// Drives the relay on output `channel`.
    fn switch_relay(&mut self, channel: u8, on: bool);
}

/// Motor direction.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Direction {
    None,
    Open,
    Close,
}

/// Control state of one channel.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ShaderState {
    Stopped,
    /// Direction relay set to open, waiting to energise the motor.
    OpenInit,
    Opening,
    /// Direction relay set to close, waiting to energise the motor.
    CloseInit,
    Closing,
    /// Motor off after closing; waiting before flipping to open.
    DirChangeOpenInit,
    /// Motor off after opening; waiting before flipping to close.
    DirChangeCloseInit,
    /// Motor off, waiting to release the direction relay.
    Exit,
}

impl ShaderState {
    /// Returns `true` while the power relay is energised.
    #[must_use]
    pub const fn is_moving(self) -> bool {
        matches!(self, ShaderState::Opening | ShaderState::Closing)
    }
}

/// Command latched for the next poll.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ShaderCommand {
    None,
    Move,
    Stop,
}

/// Rejections raised by the shader controller.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ShaderError {
    InvalidChannel(usize),
    /// The channel has no relays or travel times yet.
    Unconfigured(usize),
    InvalidPosition(u8),
    /// Only end positions are accepted after a manual stop.
    ManualOverride(usize),
    /// Travel durations must be non-zero.
    InvalidDuration,
    /// Power and direction must be distinct, free outputs.
    RelayConflict,
    /// The channel must be stopped for this operation.
    Busy(usize),
}

impl fmt::Display for ShaderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShaderError::InvalidChannel(channel) => write!(f, "shader {channel} does not exist"),
            ShaderError::Unconfigured(channel) => write!(f, "shader {channel} is not configured"),
            ShaderError::InvalidPosition(position) => {
                write!(f, "position {position} outside 0..=100")
            }
            ShaderError::ManualOverride(channel) => {
                write!(f, "shader {channel} is manually overridden")
            }
            ShaderError::InvalidDuration => f.write_str("travel duration must be non-zero"),
            ShaderError::RelayConflict => f.write_str("relay outputs are shared or unavailable"),
            ShaderError::Busy(channel) => write!(f, "shader {channel} is moving"),
        }
    }
}

/// Output pair driving one motor.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct RelayPair {
    pub power: u8,
    pub direction: u8,
}

/// Notable transitions reported by [`ShaderController::check`].
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ShaderEvent {
    Started { channel: usize, direction: Direction },
    Reversing { channel: usize },
    Stopped { channel: usize, position: u8 },
}

/// Full state of one channel.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Shader {
    pub relays: Option<RelayPair>,
    pub open_ms: Millis,
    pub close_ms: Millis,
    pub set_position: u8,
    pub actual_position: u8,
    pub starting_position: u8,
    pub last_action_at: Millis,
    pub state: ShaderState,
    pub pending: ShaderCommand,
    /// Direction of the current or interrupted move.
    pub direction: Direction,
    /// Direction of the most recently finished move.
    pub last_direction: Direction,
    pub manual_override: bool,
}

impl Shader {
    const UNCONFIGURED: Self = Self {
        relays: None,
        open_ms: 0,
        close_ms: 0,
        set_position: 0,
        actual_position: 0,
        starting_position: 0,
        last_action_at: 0,
        state: ShaderState::Stopped,
        pending: ShaderCommand::None,
        direction: Direction::None,
        last_direction: Direction::None,
        manual_override: false,
    };

    /// Position as reported on the bus, offset while manually overridden.
    #[must_use]
    pub const fn reported_position(&self) -> u8 {
        if self.manual_override {
            self.actual_position + MANUAL_POSITION_OFFSET
        } else {
            self.actual_position
        }
    }

    fn enter(&mut self, state: ShaderState, now: Millis) {
        self.state = state;
        self.last_action_at = now;
    }

    fn wanted_direction(&self) -> Direction {
        match self.set_position.cmp(&self.actual_position) {
            core::cmp::Ordering::Greater => Direction::Open,
            core::cmp::Ordering::Less => Direction::Close,
            core::cmp::Ordering::Equal => Direction::None,
        }
    }

    fn travel_ms(&self, direction: Direction) -> Millis {
        match direction {
            Direction::Close => self.close_ms,
            Direction::Open | Direction::None => self.open_ms,
        }
    }

    fn estimate(&mut self, run_ms: Millis) {
        let duration = u64::from(self.travel_ms(self.direction).max(1));
        let travelled = (u64::from(run_ms) * u64::from(POSITION_OPEN) / duration)
            .min(u64::from(POSITION_OPEN));
        let travelled = u8::try_from(travelled).unwrap_or(POSITION_OPEN);

        self.actual_position = match self.direction {
            Direction::Open => self.starting_position.saturating_add(travelled).min(POSITION_OPEN),
            Direction::Close => self.starting_position.saturating_sub(travelled),
            Direction::None => self.actual_position,
        };
    }

    fn move_complete(&self, run_ms: Millis, margin_percent: u32) -> bool {
        let end_stop_reached = || {
            let limit = u64::from(self.travel_ms(self.direction)) * u64::from(margin_percent) / 100;
            u64::from(run_ms) > limit
        };
        match self.direction {
            Direction::Open if self.set_position >= POSITION_OPEN => end_stop_reached(),
            Direction::Open => self.actual_position >= self.set_position,
            Direction::Close if self.set_position == POSITION_CLOSED => end_stop_reached(),
            Direction::Close => self.actual_position <= self.set_position,
            Direction::None => true,
        }
    }
}

/// Controller for `N` shader channels.
pub struct ShaderController<const N: usize = MAX_SHADERS> {
    shaders: [Shader; N],
    timing: ShaderTiming,
    cursor: usize,
}

impl<const N: usize> ShaderController<N> {
    #[must_use]
    pub const fn new(timing: ShaderTiming) -> Self {
        Self {
            shaders: [Shader::UNCONFIGURED; N],
            timing,
            cursor: 0,
        }
    }

    #[must_use]
    pub const fn timing(&self) -> ShaderTiming {
        self.timing
    }

    #[must_use]
    pub fn shader(&self, channel: usize) -> Option<&Shader> {
        self.shaders.get(channel)
    }

    /// Reported position of `channel`, `+128` while manually overridden.
    #[must_use]
    pub fn position(&self, channel: usize) -> Option<u8> {
        self.shaders.get(channel).map(Shader::reported_position)
    }

    #[must_use]
    pub fn state(&self, channel: usize) -> Option<ShaderState> {
        self.shaders.get(channel).map(|shader| shader.state)
    }

    /// Direction of the last completed move on `channel`.
    #[must_use]
    pub fn last_direction(&self, channel: usize) -> Option<Direction> {
        self.shaders.get(channel).map(|shader| shader.last_direction)
    }

    /// Reported positions of every channel.
    #[must_use]
    pub fn positions(&self) -> [u8; N] {
        core::array::from_fn(|channel| self.shaders[channel].reported_position())
    }

    /// Returns `true` when no channel is running or settling.
    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.shaders
            .iter()
            .all(|shader| shader.state == ShaderState::Stopped && shader.pending == ShaderCommand::None)
    }

    /// Assigns relays and travel durations to `channel`.
    ///
    /// The caller reserves both relay outputs in the digital controller.
    ///
    /// # Errors
    ///
    /// Rejects unknown channels, zero durations and a shared relay output.
    pub fn configure(
        &mut self,
        channel: usize,
        relays: RelayPair,
        open_ms: Millis,
        close_ms: Millis,
    ) -> Result<(), ShaderError> {
        let shader = self
            .shaders
            .get_mut(channel)
            .ok_or(ShaderError::InvalidChannel(channel))?;
        if shader.state != ShaderState::Stopped {
            return Err(ShaderError::Busy(channel));
        }
        if open_ms == 0 || close_ms == 0 {
            return Err(ShaderError::InvalidDuration);
        }
        if relays.power == relays.direction {
            return Err(ShaderError::RelayConflict);
        }
        shader.relays = Some(relays);
        shader.open_ms = open_ms;
        shader.close_ms = close_ms;
        Ok(())
    }

    /// Removes the relay assignment of an idle channel.
    ///
    /// # Errors
    ///
    /// Rejects unknown and moving channels.
    pub fn unconfigure(&mut self, channel: usize) -> Result<Option<RelayPair>, ShaderError> {
        let shader = self
            .shaders
            .get_mut(channel)
            .ok_or(ShaderError::InvalidChannel(channel))?;
        if shader.state != ShaderState::Stopped {
            return Err(ShaderError::Busy(channel));
        }
        let relays = shader.relays.take();
        *shader = Shader::UNCONFIGURED;
        Ok(relays)
    }

    /// Seeds the position of `channel` without moving it, e.g. at boot.
    pub fn restore_position(&mut self, channel: usize, reported: u8) {
        if let Some(shader) = self.shaders.get_mut(channel) {
            let manual = reported >= MANUAL_POSITION_OFFSET;
            let position = if manual {
                reported - MANUAL_POSITION_OFFSET
            } else {
                reported
            }
            .min(POSITION_OPEN);
            shader.actual_position = position;
            shader.set_position = position;
            shader.manual_override = manual;
        }
    }

    /// Checks whether [`Self::set_position`] would accept the request.
    ///
    /// # Errors
    ///
    /// Rejects unknown or unconfigured channels, positions above `100`, and
    /// intermediate positions while the channel is manually overridden.
    pub fn validate_position(&self, channel: usize, position: u8) -> Result<(), ShaderError> {
        let shader = self
            .shaders
            .get(channel)
            .ok_or(ShaderError::InvalidChannel(channel))?;
        if shader.relays.is_none() {
            return Err(ShaderError::Unconfigured(channel));
        }
        if position > POSITION_OPEN {
            return Err(ShaderError::InvalidPosition(position));
        }
        let end_position = position == POSITION_OPEN || position == POSITION_CLOSED;
        if shader.manual_override && !end_position {
            return Err(ShaderError::ManualOverride(channel));
        }
        Ok(())
    }

    /// Requests a move of `channel` to `position`.
    ///
    /// An end position clears a manual override.
    ///
    /// # Errors
    ///
    /// See [`Self::validate_position`].
    pub fn set_position(&mut self, channel: usize, position: u8) -> Result<(), ShaderError> {
        self.validate_position(channel, position)?;
        let shader = self.configured(channel)?;
        if position == POSITION_OPEN || position == POSITION_CLOSED {
            shader.manual_override = false;
        }
        shader.set_position = position;
        shader.pending = ShaderCommand::Move;
        Ok(())
    }

    /// Requests a stop of `channel` and marks it manually overridden.
    ///
    /// Does nothing while the channel is stopped with no move queued.
    ///
    /// # Errors
    ///
    /// Rejects unknown or unconfigured channels.
    pub fn stop(&mut self, channel: usize) -> Result<(), ShaderError> {
        let shader = self.configured(channel)?;
        if shader.state == ShaderState::Stopped && shader.pending != ShaderCommand::Move {
            return Ok(());
        }
        shader.pending = ShaderCommand::Stop;
        shader.manual_override = true;
        Ok(())
    }

    /// Advances one channel per call in round-robin order.
    pub fn check<C, R>(&mut self, clock: &C, relays: &mut R) -> Option<ShaderEvent>
    where
        C: Clock,
        R: RelayBank,
    {
        if N == 0 {
            return None;
        }
        let channel = self.cursor;
        self.cursor = (self.cursor + 1) % N;
        self.check_channel(channel, clock, relays)
    }

    /// Advances the state machine of a single channel.
    pub fn check_channel<C, R>(
        &mut self,
        channel: usize,
        clock: &C,
        bank: &mut R,
    ) -> Option<ShaderEvent>
    where
        C: Clock,
        R: RelayBank,
    {
        let timing = self.timing;
        let now = clock.now_ms();
        let shader = self.shaders.get_mut(channel)?;
        let relays = shader.relays?;
        let waited = elapsed(shader.last_action_at, now);

        match shader.state {
            ShaderState::Stopped => {
                if core::mem::replace(&mut shader.pending, ShaderCommand::None)
                    != ShaderCommand::Move
                {
                    return None;
                }
                match shader.wanted_direction() {
                    Direction::Close => {
                        bank.switch_relay(relays.direction, DIRECTION_CLOSE);
                        shader.direction = Direction::Close;
                        shader.enter(ShaderState::CloseInit, now);
                    }
                    Direction::Open => {
                        bank.switch_relay(relays.direction, !DIRECTION_CLOSE);
                        shader.direction = Direction::Open;
                        shader.enter(ShaderState::OpenInit, now);
                    }
                    Direction::None => {}
                }
                None
            }
            ShaderState::OpenInit | ShaderState::CloseInit => {
                if shader.pending == ShaderCommand::Stop {
                    shader.pending = ShaderCommand::None;
                    shader.enter(ShaderState::Exit, now);
                    return None;
                }
                if waited < timing.relay_settle_ms {
                    return None;
                }
                bank.switch_relay(relays.power, true);
                shader.starting_position = shader.actual_position;
                let (state, direction) = if shader.state == ShaderState::OpenInit {
                    (ShaderState::Opening, Direction::Open)
                } else {
                    (ShaderState::Closing, Direction::Close)
                };
                shader.enter(state, now);
                Some(ShaderEvent::Started { channel, direction })
            }
            ShaderState::Opening | ShaderState::Closing => {
                shader.estimate(waited);
                match core::mem::replace(&mut shader.pending, ShaderCommand::None) {
                    ShaderCommand::Stop => {
                        bank.switch_relay(relays.power, false);
                        shader.enter(ShaderState::Exit, now);
                        return None;
                    }
                    ShaderCommand::Move => {
                        let wanted = shader.wanted_direction();
                        if wanted != shader.direction && wanted != Direction::None {
                            bank.switch_relay(relays.power, false);
                            let state = if wanted == Direction::Open {
                                ShaderState::DirChangeOpenInit
                            } else {
                                ShaderState::DirChangeCloseInit
                            };
                            shader.enter(state, now);
                            return Some(ShaderEvent::Reversing { channel });
                        }
                    }
                    ShaderCommand::None => {}
                }
                if shader.move_complete(waited, timing.end_stop_margin_percent) {
                    bank.switch_relay(relays.power, false);
                    shader.enter(ShaderState::Exit, now);
                }
                None
            }
            ShaderState::DirChangeOpenInit | ShaderState::DirChangeCloseInit => {
                let reverse_to = if shader.state == ShaderState::DirChangeOpenInit {
                    Direction::Open
                } else {
                    Direction::Close
                };
                match core::mem::replace(&mut shader.pending, ShaderCommand::None) {
                    ShaderCommand::Stop => {
                        shader.enter(ShaderState::Exit, now);
                        return None;
                    }
                    ShaderCommand::Move => {
                        let wanted = shader.wanted_direction();
                        if wanted == Direction::None {
                            shader.enter(ShaderState::Exit, now);
                            return None;
                        }
                        if wanted != reverse_to {
                            // Back to the original direction: the direction
                            // relay never moved, so only the relay settle
                            // from the power-off applies.
                            shader.state = if wanted == Direction::Open {
                                ShaderState::OpenInit
                            } else {
                                ShaderState::CloseInit
                            };
                            return None;
                        }
                    }
                    ShaderCommand::None => {}
                }
                if waited < timing.direction_change_ms {
                    return None;
                }
                bank.switch_relay(relays.direction, reverse_to == Direction::Close);
                shader.direction = reverse_to;
                let state = if reverse_to == Direction::Open {
                    ShaderState::OpenInit
                } else {
                    ShaderState::CloseInit
                };
                shader.enter(state, now);
                None
            }
            ShaderState::Exit => {
                if waited < timing.relay_settle_ms {
                    return None;
                }
                bank.switch_relay(relays.direction, !DIRECTION_CLOSE);
                shader.last_direction = shader.direction;
                shader.direction = Direction::None;
                shader.state = ShaderState::Stopped;
                Some(ShaderEvent::Stopped {
                    channel,
                    position: shader.actual_position,
                })
            }
        }
    }

    fn configured(&mut self, channel: usize) -> Result<&mut Shader, ShaderError> {
        let shader = self
            .shaders
            .get_mut(channel)
            .ok_or(ShaderError::InvalidChannel(channel))?;
        if shader.relays.is_none() {
            return Err(ShaderError::Unconfigured(channel));
        }
        Ok(shader)
    }
}

impl<const N: usize> Default for ShaderController<N> {
    fn default() -> Self {
        Self::new(ShaderTiming::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    #[derive(Default)]
    struct Relays {
        power: bool,
        direction: bool,
        switches: usize,
    }

    impl RelayBank for Relays {
        fn switch_relay(&mut self, channel: u8, on: bool) {
            self.switches += 1;
            match channel {
                0 => self.power = on,
                _ => self.direction = on,
            }
        }
    }

    fn controller() -> ShaderController<1> {
        let mut shaders = ShaderController::default();
        shaders
            .configure(0, RelayPair { power: 0, direction: 1 }, 10_000, 10_000)
            .unwrap();
        shaders
    }

    #[test]
    fn stop_while_stopped_is_a_no_op() {
        let mut shaders = controller();
        shaders.restore_position(0, 40);
        shaders.stop(0).unwrap();
        assert_eq!(shaders.position(0), Some(40));
        assert_eq!(shaders.shader(0).unwrap().pending, ShaderCommand::None);
        shaders.set_position(0, 60).unwrap();
    }

    #[test]
    fn stop_sets_manual_override_and_limits_targets() {
        let clock = ManualClock::new(0);
        let mut relays = Relays::default();
        let mut shaders = controller();
        shaders.set_position(0, 60).unwrap();
        shaders.check_channel(0, &clock, &mut relays);
        shaders.stop(0).unwrap();
        assert_eq!(shaders.position(0), Some(MANUAL_POSITION_OFFSET));
        assert_eq!(shaders.set_position(0, 40), Err(ShaderError::ManualOverride(0)));
        shaders.set_position(0, 100).unwrap();
        assert_eq!(shaders.position(0), Some(0));
    }

    #[test]
    fn rejects_bad_requests_without_mutation() {
        let mut shaders = controller();
        assert_eq!(shaders.set_position(0, 101), Err(ShaderError::InvalidPosition(101)));
        assert_eq!(shaders.set_position(3, 50), Err(ShaderError::InvalidChannel(3)));
        assert_eq!(shaders.shader(0).unwrap().pending, ShaderCommand::None);
    }

    #[test]
    fn stop_during_init_never_energises_motor() {
        let clock = ManualClock::new(0);
        let mut relays = Relays::default();
        let mut shaders = controller();

        shaders.set_position(0, 60).unwrap();
        shaders.check_channel(0, &clock, &mut relays);
        assert_eq!(shaders.state(0), Some(ShaderState::OpenInit));

        shaders.stop(0).unwrap();
        clock.advance(5);
        shaders.check_channel(0, &clock, &mut relays);
        assert_eq!(shaders.state(0), Some(ShaderState::Exit));
        assert!(!relays.power);

        clock.advance(ShaderTiming::DEFAULT_RELAY_SETTLE_MS);
        shaders.check_channel(0, &clock, &mut relays);
        assert_eq!(shaders.state(0), Some(ShaderState::Stopped));
        assert!(!relays.power);
    }

    #[test]
    fn move_to_current_position_is_a_no_op() {
        let clock = ManualClock::new(0);
        let mut relays = Relays::default();
        let mut shaders = controller();
        shaders.restore_position(0, 40);

        shaders.set_position(0, 40).unwrap();
        shaders.check_channel(0, &clock, &mut relays);
        assert_eq!(shaders.state(0), Some(ShaderState::Stopped));
        assert_eq!(relays.switches, 0);
    }
}
