//! Structured event history for the node.
//!
//! Controllers report notable transitions through the node, which stamps
//! them with the current time and keeps the most recent ones in a ring.
//! The firmware drains the ring into its logger and the emulator prints it.

use core::fmt;

use heapless::HistoryBuf;

use crate::clock::Millis;
use crate::codec::{DecodeError, MessageKind};
use crate::node::DispatchError;
use crate::shader::Direction;

/// Number of events retained in memory.
pub const TELEMETRY_RING_CAPACITY: usize = 64;

/// Monotonic identifier assigned to each record.
pub type EventId = u32;

/// Classification of a telemetry record.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum TelemetryEventKind {
    TelegramReceived { sender: u8, kind: MessageKind },
    TelegramSent { kind: MessageKind },
    FramingError(DecodeError),
    Rejected { kind: MessageKind, error: DispatchError },
    OutputSwitched { channel: u8, on: bool },
    ShaderStarted { channel: u8, direction: Direction },
    ShaderReversing { channel: u8 },
    ShaderStopped { channel: u8, position: u8 },
    FadeComplete { channel: u8, level: u16 },
    PwmSwitchedOff { channel: u8 },
    SwitchStateChanged { state: u8 },
    ClientConfirmed { address: u8 },
    ClientRetry { address: u8, attempt: u8 },
    ClientGaveUp { address: u8 },
    ConfirmWalkAborted,
    StateSaved,
    StateRestored,
    TransmitOverflow,
}

impl fmt::Display for TelemetryEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TelemetryEventKind::TelegramReceived { sender, kind } => {
                write!(f, "rx {kind:?} from 0x{sender:02X}")
            }
            TelemetryEventKind::TelegramSent { kind } => write!(f, "tx {kind:?}"),
            TelemetryEventKind::FramingError(error) => write!(f, "framing error: {error}"),
            TelemetryEventKind::Rejected { kind, error } => write!(f, "rejected {kind:?}: {error}"),
            TelemetryEventKind::OutputSwitched { channel, on } => {
                write!(f, "output {channel} {}", if *on { "on" } else { "off" })
            }
            TelemetryEventKind::ShaderStarted { channel, direction } => {
                write!(f, "shader {channel} started {direction:?}")
            }
            TelemetryEventKind::ShaderReversing { channel } => {
                write!(f, "shader {channel} reversing")
            }
            TelemetryEventKind::ShaderStopped { channel, position } => {
                write!(f, "shader {channel} stopped at {position}")
            }
            TelemetryEventKind::FadeComplete { channel, level } => {
                write!(f, "pwm {channel} reached {level}")
            }
            TelemetryEventKind::PwmSwitchedOff { channel } => write!(f, "pwm {channel} off"),
            TelemetryEventKind::SwitchStateChanged { state } => {
                write!(f, "switch state 0b{state:02b}")
            }
            TelemetryEventKind::ClientConfirmed { address } => {
                write!(f, "client 0x{address:02X} confirmed")
            }
            TelemetryEventKind::ClientRetry { address, attempt } => {
                write!(f, "client 0x{address:02X} retry {attempt}")
            }
            TelemetryEventKind::ClientGaveUp { address } => {
                write!(f, "client 0x{address:02X} gave up")
            }
            TelemetryEventKind::ConfirmWalkAborted => f.write_str("confirmation walk aborted"),
            TelemetryEventKind::StateSaved => f.write_str("state saved"),
            TelemetryEventKind::StateRestored => f.write_str("state restored"),
            TelemetryEventKind::TransmitOverflow => f.write_str("transmit queue full"),
        }
    }
}

/// Telemetry record stored in the ring buffer.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct TelemetryRecord {
    pub id: EventId,
    pub timestamp_ms: Millis,
    pub event: TelemetryEventKind,
}

/// Records telemetry events into a fixed-size ring buffer.
pub struct TelemetryRecorder<const CAPACITY: usize = TELEMETRY_RING_CAPACITY> {
    ring: HistoryBuf<TelemetryRecord, CAPACITY>,
    next_event_id: EventId,
}

impl<const CAPACITY: usize> TelemetryRecorder<CAPACITY> {
    /// Creates a new telemetry recorder with an empty history.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            ring: HistoryBuf::new(),
            next_event_id: 0,
        }
    }

    /// Records an event and returns its identifier.
    pub fn record(&mut self, event: TelemetryEventKind, timestamp_ms: Millis) -> EventId {
        let id = self.next_event_id;
        self.next_event_id = self.next_event_id.wrapping_add(1);
        self.ring.write(TelemetryRecord {
            id,
            timestamp_ms,
            event,
        });
        id
    }

    /// Returns an iterator over the recorded telemetry in chronological order.
    pub fn oldest_first(&self) -> impl Iterator<Item = &TelemetryRecord> + '_ {
        self.ring.oldest_ordered()
    }

    /// Records with an identifier at or after `id`, oldest first.
    pub fn since(&self, id: EventId) -> impl Iterator<Item = &TelemetryRecord> + '_ {
        self.ring
            .oldest_ordered()
            .filter(move |record| record.id.wrapping_sub(id) < 0x8000_0000)
    }

    /// Identifier the next record will receive.
    #[must_use]
    pub const fn next_id(&self) -> EventId {
        self.next_event_id
    }

    /// Returns the most recent telemetry record, if available.
    pub fn latest(&self) -> Option<&TelemetryRecord> {
        self.ring.recent()
    }

    pub fn len(&self) -> usize {
        self.ring.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }
}

impl<const CAPACITY: usize> Default for TelemetryRecorder<CAPACITY> {
    fn default() -> Self {
        Self::new()
    }
}
