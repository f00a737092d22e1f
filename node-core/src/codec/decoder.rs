//! Byte-at-a-time telegram decoder.
//!
//! The decoder is fed straight from the UART receive path. It never blocks
//! and never allocates; every call to [`Decoder::push`] either finishes a
//! telegram, reports a framing error, or asks for more bytes.

use core::fmt;

use super::layout::{Body, decode_body};
use super::telegram::{DeviceType, MessageKind, Telegram};
use super::{CHECKSUM_SEED, ESC, STX};

/// Which field the decoder expects next.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum DecodeState {
    /// Hunting for a start marker.
    WaitStart,
    WaitSender,
    WaitKind,
    WaitReceiver,
    WaitDeviceType,
    /// Collecting the fixed-size payload.
    WaitPayload,
    WaitChecksum,
    /// Skipping a telegram of a kind or device type this firmware does not know.
    Ignore,
}

/// Framing failures. All of them are recovered by the next start marker.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum DecodeError {
    /// The transmitted checksum did not match the running sum.
    Checksum { expected: u8, received: u8 },
    /// A start marker arrived before the previous telegram was complete.
    Interrupted,
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecodeError::Checksum { expected, received } => write!(
                f,
                "checksum mismatch (expected 0x{expected:02X}, received 0x{received:02X})"
            ),
            DecodeError::Interrupted => f.write_str("telegram interrupted by start marker"),
        }
    }
}

/// Result of feeding one byte.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum DecodeStatus {
    /// More bytes are needed.
    Pending,
    /// A complete, checksum-verified telegram.
    Ok(Telegram),
    /// The in-progress telegram was dropped.
    Error(DecodeError),
}

/// Streaming decoder state.
#[derive(Debug)]
pub struct Decoder {
    state: DecodeState,
    escaped: bool,
    checksum: u8,
    sender: u8,
    kind: MessageKind,
    remaining: usize,
    body: Body,
}

impl Decoder {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            state: DecodeState::WaitStart,
            escaped: false,
            checksum: CHECKSUM_SEED,
            sender: 0,
            kind: MessageKind::DevStartup,
            remaining: 0,
            body: Body::new(),
        }
    }

    /// Returns the field currently expected.
    #[must_use]
    pub const fn state(&self) -> DecodeState {
        self.state
    }

    /// Drops any partial telegram and waits for the next start marker.
    pub fn reset(&mut self) {
        self.state = DecodeState::WaitStart;
        self.escaped = false;
    }

    /// Feeds one raw byte from the wire.
    pub fn push(&mut self, raw: u8) -> DecodeStatus {
        if raw == STX && !self.escaped {
            let interrupted = !matches!(self.state, DecodeState::WaitStart | DecodeState::Ignore);
            self.begin();
            return if interrupted {
                DecodeStatus::Error(DecodeError::Interrupted)
            } else {
                DecodeStatus::Pending
            };
        }

        if self.state == DecodeState::WaitStart {
            return DecodeStatus::Pending;
        }

        let byte = if self.escaped {
            self.escaped = false;
            !raw
        } else if raw == ESC {
            self.escaped = true;
            return DecodeStatus::Pending;
        } else {
            raw
        };

        match self.state {
            DecodeState::WaitStart | DecodeState::Ignore => DecodeStatus::Pending,
            DecodeState::WaitChecksum => self.finish(byte),
            _ => {
                self.checksum = self.checksum.wrapping_add(byte);
                self.field(byte);
                DecodeStatus::Pending
            }
        }
    }

    fn begin(&mut self) {
        self.state = DecodeState::WaitSender;
        self.escaped = false;
        self.checksum = CHECKSUM_SEED.wrapping_add(STX);
        self.body.clear();
        self.remaining = 0;
    }

    fn field(&mut self, byte: u8) {
        match self.state {
            DecodeState::WaitSender => {
                self.sender = byte;
                self.state = DecodeState::WaitKind;
            }
            DecodeState::WaitKind => match MessageKind::from_raw(byte) {
                Some(kind) => {
                    self.kind = kind;
                    self.state = if kind.has_receiver() {
                        DecodeState::WaitReceiver
                    } else if kind.has_device_type() {
                        DecodeState::WaitDeviceType
                    } else {
                        self.payload_state(None)
                    };
                }
                None => self.state = DecodeState::Ignore,
            },
            DecodeState::WaitReceiver => {
                self.store(byte);
                self.state = if self.kind.has_device_type() {
                    DecodeState::WaitDeviceType
                } else {
                    self.payload_state(None)
                };
            }
            DecodeState::WaitDeviceType => match DeviceType::from_raw(byte) {
                Some(device) => {
                    self.store(byte);
                    self.state = self.payload_state(Some(device));
                }
                None => self.state = DecodeState::Ignore,
            },
            DecodeState::WaitPayload => {
                self.store(byte);
                self.remaining = self.remaining.saturating_sub(1);
                if self.remaining == 0 {
                    self.state = DecodeState::WaitChecksum;
                }
            }
            DecodeState::WaitStart | DecodeState::WaitChecksum | DecodeState::Ignore => {}
        }
    }

    fn payload_state(&mut self, device: Option<DeviceType>) -> DecodeState {
        match self.kind.payload_len(device) {
            Some(0) => DecodeState::WaitChecksum,
            Some(len) => {
                self.remaining = len;
                DecodeState::WaitPayload
            }
            None => DecodeState::Ignore,
        }
    }

    fn store(&mut self, byte: u8) {
        // Sizes come from the kind table and never exceed the body capacity.
        if self.body.push(byte).is_err() {
            self.state = DecodeState::Ignore;
        }
    }

    fn finish(&mut self, received: u8) -> DecodeStatus {
        let expected = self.checksum;
        self.state = DecodeState::WaitStart;

        if expected != received {
            return DecodeStatus::Error(DecodeError::Checksum { expected, received });
        }

        match decode_body(self.kind, &self.body) {
            Some(message) => DecodeStatus::Ok(Telegram::new(self.sender, message)),
            None => DecodeStatus::Pending,
        }
    }
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::Message;

    fn feed(decoder: &mut Decoder, bytes: &[u8]) -> Option<DecodeStatus> {
        bytes
            .iter()
            .map(|byte| decoder.push(*byte))
            .find(|status| *status != DecodeStatus::Pending)
    }

    #[test]
    fn decodes_a_hand_built_frame() {
        // STX, sender 0x05, ReqReboot, receiver 0x10
        let sum = CHECKSUM_SEED
            .wrapping_add(STX)
            .wrapping_add(0x05)
            .wrapping_add(0x01)
            .wrapping_add(0x10);
        let mut decoder = Decoder::new();
        let status = feed(&mut decoder, &[STX, 0x05, 0x01, 0x10, sum]);
        assert_eq!(
            status,
            Some(DecodeStatus::Ok(Telegram::new(
                0x05,
                Message::ReqReboot { receiver: 0x10 }
            )))
        );
        assert_eq!(decoder.state(), DecodeState::WaitStart);
    }

    #[test]
    fn start_marker_mid_frame_restarts_decoding() {
        let mut decoder = Decoder::new();
        assert_eq!(decoder.push(STX), DecodeStatus::Pending);
        assert_eq!(decoder.push(0x05), DecodeStatus::Pending);
        assert_eq!(
            decoder.push(STX),
            DecodeStatus::Error(DecodeError::Interrupted)
        );
        assert_eq!(decoder.state(), DecodeState::WaitSender);
    }

    #[test]
    fn unknown_kind_is_skipped_without_error() {
        let mut decoder = Decoder::new();
        assert_eq!(feed(&mut decoder, &[STX, 0x05, 0x7E, 0x10, 0x20, 0x30]), None);
        assert_eq!(decoder.state(), DecodeState::Ignore);
        assert_eq!(decoder.push(STX), DecodeStatus::Pending);
        assert_eq!(decoder.state(), DecodeState::WaitSender);
    }

    #[test]
    fn bytes_before_a_start_marker_are_dropped() {
        let mut decoder = Decoder::new();
        assert_eq!(feed(&mut decoder, &[0x10, ESC, 0x44, 0xFF]), None);
        assert_eq!(decoder.state(), DecodeState::WaitStart);
    }
}
