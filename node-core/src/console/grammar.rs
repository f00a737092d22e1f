#![allow(clippy::module_name_repetitions)]

//! Parser for the node service console.
//!
//! Lines are short ASCII commands such as `shader 0 pos 50` or
//! `pwm 2 fade 0 255 2s`. Durations accept an `ms` or `s` suffix and default
//! to milliseconds.

use core::fmt;

use heapless::Vec;
use winnow::ascii::{dec_uint, hex_digit1, space0, space1};
use winnow::combinator::{alt, cut_err, eof, opt, preceded, repeat, terminated};
use winnow::error::{ErrMode, ParserError};
use winnow::prelude::*;

use crate::clock::Millis;

/// Most bytes accepted by one `rx` command.
pub const MAX_RX_BYTES: usize = 64;

/// Raw bytes injected with `rx`.
pub type RawBytes = Vec<u8, MAX_RX_BYTES>;

/// Shader sub-commands.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ShaderAction {
    Position(u8),
    Stop,
    Setup {
        power: u8,
        direction: u8,
        open_ms: Millis,
        close_ms: Millis,
    },
}

/// PWM sub-commands.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PwmAction {
    On,
    Off,
    Toggle,
    Level(u16),
    Fade {
        start: u16,
        target: u16,
        duration_ms: Millis,
    },
    DelayOff(Millis),
}

/// Digital output sub-commands.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum OutputCommand {
    On,
    Off,
    Toggle,
    Trigger,
    DelayOn(Millis),
    DelayOff(Millis),
    Pulse { on_ms: Millis, off_ms: Millis },
}

/// One parsed console line.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Command {
    Shader { channel: usize, action: ShaderAction },
    Pwm { channel: usize, action: PwmAction },
    Output { channel: usize, action: OutputCommand },
    /// Sets the two switch outputs from a bitmask.
    Switch(u8),
    /// Feeds raw bus bytes into the decoder.
    Receive(RawBytes),
    /// Advances simulated time.
    Tick(Millis),
    Status,
    /// Saves the output state as on power-fail.
    Snapshot,
    /// Restores the newest saved output state.
    Restore,
    Help,
}

/// Parse failure with the byte offset where it occurred.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ParseError {
    pub offset: usize,
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "syntax error at column {}", self.offset + 1)
    }
}

/// Parses a single console line.
///
/// # Errors
///
/// Returns the offset of the first byte that does not fit the grammar.
pub fn parse_command(line: &str) -> Result<Command, ParseError> {
    let trimmed = line.trim_end_matches(['\r', '\n']);
    let leading = trimmed.len() - trimmed.trim_start().len();
    terminated(command, (space0, eof))
        .parse(trimmed.trim_start())
        .map_err(|error| ParseError {
            offset: leading + error.offset(),
        })
}

fn command(input: &mut &str) -> ModalResult<Command> {
    alt((
        shader_command,
        pwm_command,
        output_command,
        preceded(("switch", space1), dec_uint).map(Command::Switch),
        preceded(("rx", space1), raw_bytes).map(Command::Receive),
        preceded(("tick", space1), duration).map(Command::Tick),
        "status".value(Command::Status),
        "snapshot".value(Command::Snapshot),
        "restore".value(Command::Restore),
        "help".value(Command::Help),
    ))
    .parse_next(input)
}

fn channel(input: &mut &str) -> ModalResult<usize> {
    dec_uint::<_, u8, _>.map(usize::from).parse_next(input)
}

fn shader_command(input: &mut &str) -> ModalResult<Command> {
    let channel = preceded(("shader", space1), channel).parse_next(input)?;
    space1.parse_next(input)?;
    let action = cut_err(alt((
        preceded(("pos", space1), dec_uint).map(ShaderAction::Position),
        "stop".value(ShaderAction::Stop),
        preceded(
            ("setup", space1),
            (
                terminated(dec_uint, space1),
                terminated(dec_uint, space1),
                terminated(duration, space1),
                duration,
            ),
        )
        .map(|(power, direction, open_ms, close_ms)| ShaderAction::Setup {
            power,
            direction,
            open_ms,
            close_ms,
        }),
    )))
    .parse_next(input)?;
    Ok(Command::Shader { channel, action })
}

fn pwm_command(input: &mut &str) -> ModalResult<Command> {
    let channel = preceded(("pwm", space1), channel).parse_next(input)?;
    space1.parse_next(input)?;
    let action = cut_err(alt((
        preceded(
            ("fade", space1),
            (
                terminated(dec_uint, space1),
                terminated(dec_uint, space1),
                duration,
            ),
        )
        .map(|(start, target, duration_ms)| PwmAction::Fade {
            start,
            target,
            duration_ms,
        }),
        preceded(("level", space1), dec_uint).map(PwmAction::Level),
        preceded(("delay-off", space1), duration).map(PwmAction::DelayOff),
        "toggle".value(PwmAction::Toggle),
        "off".value(PwmAction::Off),
        "on".value(PwmAction::On),
    )))
    .parse_next(input)?;
    Ok(Command::Pwm { channel, action })
}

fn output_command(input: &mut &str) -> ModalResult<Command> {
    let channel = preceded(("out", space1), channel).parse_next(input)?;
    space1.parse_next(input)?;
    let action = cut_err(alt((
        preceded(("delay-on", space1), duration).map(OutputCommand::DelayOn),
        preceded(("delay-off", space1), duration).map(OutputCommand::DelayOff),
        preceded(("pulse", space1), (terminated(duration, space1), duration))
            .map(|(on_ms, off_ms)| OutputCommand::Pulse { on_ms, off_ms }),
        "trigger".value(OutputCommand::Trigger),
        "toggle".value(OutputCommand::Toggle),
        "off".value(OutputCommand::Off),
        "on".value(OutputCommand::On),
    )))
    .parse_next(input)?;
    Ok(Command::Output { channel, action })
}

/// Milliseconds with an optional `ms` or `s` suffix.
fn duration(input: &mut &str) -> ModalResult<Millis> {
    let value: Millis = dec_uint.parse_next(input)?;
    let scale = opt(alt(("ms".value(1), "s".value(1000)))).parse_next(input)?;
    Ok(value.saturating_mul(scale.unwrap_or(1)))
}

fn hex_byte(input: &mut &str) -> ModalResult<u8> {
    let start = *input;
    let digits = hex_digit1.parse_next(input)?;
    if digits.len() > 2 {
        *input = start;
        return Err(ErrMode::from_input(input));
    }
    u8::from_str_radix(digits, 16).map_err(|_| ErrMode::from_input(input))
}

fn raw_bytes(input: &mut &str) -> ModalResult<RawBytes> {
    let first = hex_byte.parse_next(input)?;
    let mut bytes = RawBytes::new();
    // A fresh buffer always has room for one byte.
    let _ = bytes.push(first);
    repeat(0.., preceded(space1, hex_byte))
        .fold(
            move || (bytes.clone(), false),
            |(mut bytes, overflow), byte| {
                let overflow = overflow || bytes.push(byte).is_err();
                (bytes, overflow)
            },
        )
        .verify(|state: &(RawBytes, bool)| !state.1)
        .map(|(bytes, _)| bytes)
        .parse_next(input)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_shader_commands() {
        assert_eq!(
            parse_command("shader 0 pos 50"),
            Ok(Command::Shader {
                channel: 0,
                action: ShaderAction::Position(50)
            })
        );
        assert_eq!(
            parse_command("shader 3 setup 0 1 30s 25000\n"),
            Ok(Command::Shader {
                channel: 3,
                action: ShaderAction::Setup {
                    power: 0,
                    direction: 1,
                    open_ms: 30_000,
                    close_ms: 25_000,
                }
            })
        );
    }

    #[test]
    fn parses_pwm_and_output_commands() {
        assert_eq!(
            parse_command("pwm 2 fade 0 255 2000"),
            Ok(Command::Pwm {
                channel: 2,
                action: PwmAction::Fade {
                    start: 0,
                    target: 255,
                    duration_ms: 2000
                }
            })
        );
        assert_eq!(
            parse_command("out 4 pulse 100ms 1s"),
            Ok(Command::Output {
                channel: 4,
                action: OutputCommand::Pulse {
                    on_ms: 100,
                    off_ms: 1000
                }
            })
        );
        assert_eq!(
            parse_command("out 1 delay-off 250"),
            Ok(Command::Output {
                channel: 1,
                action: OutputCommand::DelayOff(250)
            })
        );
    }

    #[test]
    fn parses_raw_bytes() {
        let Ok(Command::Receive(bytes)) = parse_command("rx 02 05 01 1B fd") else {
            panic!("rx should parse");
        };
        assert_eq!(bytes.as_slice(), &[0x02, 0x05, 0x01, 0x1B, 0xFD]);
    }

    #[test]
    fn reports_error_offset() {
        let error = parse_command("shader 0 spin").unwrap_err();
        assert!(error.offset >= 9);
        assert!(parse_command("status extra").is_err());
        assert!(parse_command("rx 123").is_err());
    }
}
