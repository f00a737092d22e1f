//! Telegram serialisation.

use core::fmt;

use heapless::Vec;

use super::layout::{Body, encode_body};
use super::telegram::Telegram;
use super::{CHECKSUM_SEED, MAX_FRAME, STX, StuffingError, accumulate, stuff_into};

/// Encoded frame ready for the transmitter.
pub type Frame = Vec<u8, MAX_FRAME>;

/// Errors raised while serialising a telegram.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum EncodeError {
    /// The frame buffer cannot hold the telegram.
    Overflow,
}

impl fmt::Display for EncodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EncodeError::Overflow => f.write_str("telegram exceeds frame buffer"),
        }
    }
}

impl From<StuffingError> for EncodeError {
    fn from(_: StuffingError) -> Self {
        EncodeError::Overflow
    }
}

/// Encodes `telegram` into a stuffed, checksummed frame.
///
/// # Errors
///
/// Returns [`EncodeError::Overflow`] if the frame does not fit in [`MAX_FRAME`].
pub fn encode(telegram: &Telegram) -> Result<Frame, EncodeError> {
    let mut body = Body::new();
    encode_body(&telegram.message, &mut body).ok_or(EncodeError::Overflow)?;

    let header = [telegram.sender, telegram.kind().to_raw()];
    let checksum = accumulate(accumulate(CHECKSUM_SEED.wrapping_add(STX), &header), &body);

    let mut frame = Frame::new();
    frame.push(STX).map_err(|_| EncodeError::Overflow)?;
    stuff_into(&header, &mut frame)?;
    stuff_into(&body, &mut frame)?;
    stuff_into(&[checksum], &mut frame)?;
    Ok(frame)
}
