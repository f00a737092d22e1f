//! Service console on the debug UART.
//!
//! The console task assembles typed bytes into lines here; the bus task,
//! which owns the node, executes each line and renders the reply as text.

use core::fmt::{self, Write as _};
use core::mem;
use core::str;

use heapless::{String, Vec};
use node_core::Node;
use node_core::clock::Clock;
use node_core::console::{ConsoleError, HELP, Outcome, StatusFormatter};
use node_core::digital::OutputDriver;
use node_core::persist::Storage;
use node_core::pwm::PwmDriver;

/// Maximum number of bytes accepted on a single console line.
pub const MAX_LINE_LEN: usize = 96;
/// Capacity of one rendered reply.
pub const MAX_REPLY_LEN: usize = 1024;

pub type ConsoleLine = String<MAX_LINE_LEN>;
pub type ConsoleReply = String<MAX_REPLY_LEN>;

/// Errors raised while assembling a line.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum LineError {
    /// The line was longer than [`MAX_LINE_LEN`] and has been discarded.
    Overflow,
    InvalidUtf8,
}

impl fmt::Display for LineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LineError::Overflow => write!(f, "line longer than {MAX_LINE_LEN} bytes"),
            LineError::InvalidUtf8 => f.write_str("line is not valid UTF-8"),
        }
    }
}

/// Byte-at-a-time line editor with backspace support.
#[derive(Debug, Default)]
pub struct LineBuffer {
    bytes: Vec<u8, MAX_LINE_LEN>,
    overflowed: bool,
}

impl LineBuffer {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            bytes: Vec::new(),
            overflowed: false,
        }
    }

    /// Feeds one received byte; returns the finished line on CR or LF.
    ///
    /// Empty lines are swallowed.
    pub fn ingest(&mut self, byte: u8) -> Option<Result<ConsoleLine, LineError>> {
        match byte {
            b'\r' | b'\n' => self.finish(),
            0x08 | 0x7f => {
                self.bytes.pop();
                None
            }
            value => {
                if self.bytes.push(value).is_err() {
                    self.overflowed = true;
                }
                None
            }
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    fn finish(&mut self) -> Option<Result<ConsoleLine, LineError>> {
        if mem::take(&mut self.overflowed) {
            self.bytes.clear();
            return Some(Err(LineError::Overflow));
        }
        if self.bytes.is_empty() {
            return None;
        }

        let line = str::from_utf8(&self.bytes)
            .map_err(|_| LineError::InvalidUtf8)
            .and_then(|text| ConsoleLine::try_from(text).map_err(|_| LineError::Overflow));
        self.bytes.clear();
        Some(line)
    }
}

/// Writes the reply for an executed console line, one `\n` per line.
///
/// # Errors
///
/// Fails when `writer` runs out of room.
pub fn render_reply<C, D, P, S, W>(
    writer: &mut W,
    node: &Node<C, D, P, S>,
    result: &Result<Outcome, ConsoleError>,
) -> fmt::Result
where
    C: Clock,
    D: OutputDriver,
    P: PwmDriver,
    S: Storage,
    W: fmt::Write,
{
    let outcome = match result {
        Ok(outcome) => outcome,
        Err(error) => return writeln!(writer, "error: {error}"),
    };

    match outcome {
        Outcome::Done => writeln!(writer, "ok"),
        Outcome::Advance(_) => writeln!(writer, "tick ignored: the clock runs in real time"),
        Outcome::Status => StatusFormatter::new(node).write_all(writer),
        Outcome::Help => {
            for line in HELP {
                writeln!(writer, "{line}")?;
            }
            Ok(())
        }
        Outcome::Received { actions } => {
            for action in actions {
                writeln!(writer, "action {action:?}")?;
            }
            writeln!(writer, "ok")
        }
        Outcome::Snapshot => writeln!(writer, "state saved"),
        Outcome::Restored(true) => writeln!(writer, "state restored"),
        Outcome::Restored(false) => writeln!(writer, "no saved state"),
    }
}

/// Text sent when a line could not be assembled.
#[must_use]
pub fn line_error_reply(error: LineError) -> ConsoleReply {
    let mut reply = ConsoleReply::new();
    // The message is far shorter than the reply buffer.
    let _ = writeln!(reply, "error: {error}");
    reply
}
