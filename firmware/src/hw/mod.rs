//! Peripheral adapters behind the node's driver traits.
//!
//! The conversions here are plain functions so they can be tested on the
//! host; the peripheral wrappers themselves live in `board` and only build
//! for the MCU.

pub mod flash;
pub mod power;
pub mod reset;

#[cfg(target_os = "none")]
mod board;

#[cfg(target_os = "none")]
pub use board::{EmbassyClock, RELAY_COUNT, RelayOutputs, Rs485, StoragePage, TimerPwm};

use node_core::clock::Millis;

/// Low 32 bits of a 64-bit millisecond count, wrapping like the node clock.
#[must_use]
pub fn wrap_millis(ms: u64) -> Millis {
    let bytes = ms.to_le_bytes();
    Millis::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

/// Rescales a duty in `0..=full_scale` to a timer compare value in `0..=max`.
#[must_use]
pub fn scale_duty(duty: u16, full_scale: u16, max: u16) -> u16 {
    if full_scale == 0 {
        return 0;
    }
    let duty = u32::from(duty.min(full_scale));
    let scaled = duty * u32::from(max) / u32::from(full_scale);
    u16::try_from(scaled).unwrap_or(max)
}
