//! Wire codec for the half-duplex node bus.
//!
//! A telegram travels as `STX, sender, kind, [fields...], checksum`. Every
//! byte after the start marker is byte-stuffed: `STX` and `ESC` are sent as
//! `ESC` followed by the bitwise complement of the original byte. The checksum
//! is an 8-bit running sum seeded with [`CHECKSUM_SEED`] over the unstuffed
//! bytes from the start marker through the last field byte.

pub mod decoder;
pub mod encoder;
mod layout;
pub mod telegram;

use core::fmt;

use heapless::Vec;

pub use decoder::{DecodeError, DecodeState, DecodeStatus, Decoder};
pub use encoder::{EncodeError, Frame, encode};
pub use telegram::{
    DeviceState, DeviceType, DeviceValue, Message, MessageKind, PwmCommand, SetState,
    ShaderSetup, Telegram,
};

/// Frame start marker.
pub const STX: u8 = 0x02;
/// Escape marker introducing a complemented byte.
pub const ESC: u8 = 0x1B;
/// Seed of the running checksum.
pub const CHECKSUM_SEED: u8 = 0x82;
/// Receiver address every node accepts.
pub const BROADCAST: u8 = 0xFF;

/// Largest number of unstuffed bytes following the kind byte.
pub const MAX_BODY: usize = 92;
/// Largest encoded frame: marker plus every other byte stuffed.
pub const MAX_FRAME: usize = 1 + 2 * (2 + MAX_BODY + 1);

/// Returns `true` when `byte` must be escaped on the wire.
#[must_use]
pub const fn needs_escape(byte: u8) -> bool {
    byte == STX || byte == ESC
}

/// Adds `bytes` to a running checksum.
#[must_use]
pub fn accumulate(sum: u8, bytes: &[u8]) -> u8 {
    bytes.iter().fold(sum, |acc, byte| acc.wrapping_add(*byte))
}

/// Errors reported by the raw stuffing helpers.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum StuffingError {
    /// The output buffer cannot hold the result.
    Overflow,
    /// The input ended with a dangling escape marker.
    DanglingEscape,
}

impl fmt::Display for StuffingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StuffingError::Overflow => f.write_str("stuffing buffer overflow"),
            StuffingError::DanglingEscape => f.write_str("input ends inside an escape"),
        }
    }
}

/// Appends `bytes` to `out`, escaping reserved markers.
///
/// # Errors
///
/// Returns [`StuffingError::Overflow`] when `out` fills up.
pub fn stuff_into<const N: usize>(bytes: &[u8], out: &mut Vec<u8, N>) -> Result<(), StuffingError> {
    for &byte in bytes {
        if needs_escape(byte) {
            out.push(ESC).map_err(|_| StuffingError::Overflow)?;
            out.push(!byte).map_err(|_| StuffingError::Overflow)?;
        } else {
            out.push(byte).map_err(|_| StuffingError::Overflow)?;
        }
    }
    Ok(())
}

/// Appends the unescaped form of `bytes` to `out`.
///
/// # Errors
///
/// Returns [`StuffingError::Overflow`] when `out` fills up and
/// [`StuffingError::DanglingEscape`] when the input ends right after `ESC`.
pub fn unstuff_into<const N: usize>(
    bytes: &[u8],
    out: &mut Vec<u8, N>,
) -> Result<(), StuffingError> {
    let mut escaped = false;
    for &byte in bytes {
        let value = if escaped {
            escaped = false;
            !byte
        } else if byte == ESC {
            escaped = true;
            continue;
        } else {
            byte
        };
        out.push(value).map_err(|_| StuffingError::Overflow)?;
    }

    if escaped {
        Err(StuffingError::DanglingEscape)
    } else {
        Ok(())
    }
}
