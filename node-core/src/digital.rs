//! Digital outputs with delayed switching.
//!
//! Each output can be switched immediately, after a delay, or on-then-off
//! after two chained delays. Outputs reserved for a shader's relays are
//! owned by the shader controller: the generic setters refuse them and bulk
//! operations skip them.

use core::fmt;

use crate::clock::{Clock, Millis, elapsed};
use crate::shader::RelayBank;

/// Maximum number of digital outputs a node exposes.
pub const MAX_DIGITAL_OUTPUTS: usize = 32;

/// Default pulse length used by [`DigitalOutputs::trigger`].
pub const DEFAULT_TRIGGER_MS: Millis = 500;

/// Hardware seam for the output pins.
pub trait OutputDriver {
    /// Drives output `channel` high (`true`) or low.
    fn set(&mut self, channel: usize, on: bool);
}

/// Driver that ignores every write.
#[derive(Copy, Clone, Debug, Default)]
pub struct NoopOutputDriver;

impl OutputDriver for NoopOutputDriver {
    fn set(&mut self, _channel: usize, _on: bool) {}
}

/// Pending delayed action of one output.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum DelayState {
    NoDelay,
    /// Switch on once the on-delay expires.
    DelayOn,
    /// Switch off once the off-delay expires.
    DelayOff,
    /// Switch on after the on-delay, then off after the off-delay.
    DelayOnOff,
}

/// 2-bit action code used by set-state requests.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum OutputAction {
    Unchanged,
    Off,
    On,
    Toggle,
}

impl OutputAction {
    /// Decodes the low two bits of `bits`.
    #[must_use]
    pub const fn from_bits(bits: u8) -> Self {
        match bits & 0b11 {
            0 => OutputAction::Unchanged,
            1 => OutputAction::Off,
            2 => OutputAction::On,
            _ => OutputAction::Toggle,
        }
    }

    /// Returns the action for output `index` in a packed action array.
    #[must_use]
    pub fn unpack(packed: &[u8], index: usize) -> Self {
        packed
            .get(index / 4)
            .map_or(OutputAction::Unchanged, |byte| {
                Self::from_bits(byte >> ((index % 4) * 2))
            })
    }
}

/// Rejections raised by the output controller.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum OutputError {
    /// Channel number beyond the configured outputs.
    InvalidChannel(usize),
    /// The output drives a shader relay.
    Reserved(usize),
}

impl fmt::Display for OutputError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutputError::InvalidChannel(channel) => write!(f, "output {channel} does not exist"),
            OutputError::Reserved(channel) => write!(f, "output {channel} is reserved by a shader"),
        }
    }
}

/// A delayed switch that fired during [`DigitalOutputs::check`].
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct OutputChange {
    pub channel: usize,
    pub on: bool,
}

/// Per-output bookkeeping.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct DigitalOutput {
    pub delay: DelayState,
    pub on_delay_ms: Millis,
    pub off_delay_ms: Millis,
    pub delay_started_at: Millis,
    pub shader_reserved: bool,
    pub on: bool,
}

impl DigitalOutput {
    const IDLE: Self = Self {
        delay: DelayState::NoDelay,
        on_delay_ms: 0,
        off_delay_ms: 0,
        delay_started_at: 0,
        shader_reserved: false,
        on: false,
    };
}

/// Controller for a bank of `N` digital outputs.
pub struct DigitalOutputs<D, const N: usize = MAX_DIGITAL_OUTPUTS> {
    driver: D,
    outputs: [DigitalOutput; N],
    cursor: usize,
}

impl<D, const N: usize> DigitalOutputs<D, N>
where
    D: OutputDriver,
{
    /// Creates the controller and drives every output low.
    pub fn new(mut driver: D) -> Self {
        for channel in 0..N {
            driver.set(channel, false);
        }
        Self {
            driver,
            outputs: [DigitalOutput::IDLE; N],
            cursor: 0,
        }
    }

    /// Number of outputs handled by this controller.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        N
    }

    pub fn driver(&self) -> &D {
        &self.driver
    }

    pub fn driver_mut(&mut self) -> &mut D {
        &mut self.driver
    }

    #[must_use]
    pub fn output(&self, channel: usize) -> Option<&DigitalOutput> {
        self.outputs.get(channel)
    }

    /// Returns the last level written to `channel`.
    #[must_use]
    pub fn is_on(&self, channel: usize) -> Option<bool> {
        self.outputs.get(channel).map(|output| output.on)
    }

    #[must_use]
    pub fn is_reserved(&self, channel: usize) -> bool {
        self.outputs
            .get(channel)
            .is_some_and(|output| output.shader_reserved)
    }

    /// Hands `channel` to the shader controller.
    ///
    /// # Errors
    ///
    /// Returns [`OutputError::InvalidChannel`] when the channel does not exist.
    pub fn reserve(&mut self, channel: usize) -> Result<(), OutputError> {
        let output = self
            .outputs
            .get_mut(channel)
            .ok_or(OutputError::InvalidChannel(channel))?;
        output.shader_reserved = true;
        output.delay = DelayState::NoDelay;
        Ok(())
    }

    /// Returns `channel` to general use, driven low.
    pub fn release(&mut self, channel: usize) {
        if let Some(output) = self.outputs.get_mut(channel) {
            output.shader_reserved = false;
            output.on = false;
            self.driver.set(channel, false);
        }
    }

    /// Switches `channel` immediately and cancels any pending delay.
    ///
    /// # Errors
    ///
    /// Fails for unknown or shader-reserved channels.
    pub fn set(&mut self, channel: usize, on: bool) -> Result<(), OutputError> {
        self.available(channel)?;
        self.outputs[channel].delay = DelayState::NoDelay;
        self.write(channel, on);
        Ok(())
    }

    /// Inverts `channel` immediately.
    ///
    /// # Errors
    ///
    /// Fails for unknown or shader-reserved channels.
    pub fn toggle(&mut self, channel: usize) -> Result<(), OutputError> {
        let on = self.available(channel)?.on;
        self.set(channel, !on)
    }

    /// Applies a 2-bit action code to `channel`.
    ///
    /// # Errors
    ///
    /// Fails for unknown or shader-reserved channels.
    pub fn apply(&mut self, channel: usize, action: OutputAction) -> Result<(), OutputError> {
        match action {
            OutputAction::Unchanged => self.available(channel).map(|_| ()),
            OutputAction::Off => self.set(channel, false),
            OutputAction::On => self.set(channel, true),
            OutputAction::Toggle => self.toggle(channel),
        }
    }

    /// Applies packed 2-bit actions to every output, skipping reserved ones.
    pub fn apply_packed(&mut self, packed: &[u8]) {
        for channel in 0..N.min(packed.len() * 4) {
            if self.outputs[channel].shader_reserved {
                continue;
            }
            // Channel is in range and unreserved, so this cannot fail.
            let _ = self.apply(channel, OutputAction::unpack(packed, channel));
        }
    }

    /// Switches `channel` on after `delay_ms`.
    ///
    /// # Errors
    ///
    /// Fails for unknown or shader-reserved channels.
    pub fn on_delay<C: Clock>(
        &mut self,
        clock: &C,
        channel: usize,
        delay_ms: Millis,
    ) -> Result<(), OutputError> {
        self.schedule(clock, channel, DelayState::DelayOn, delay_ms, 0)
    }

    /// Switches `channel` off after `delay_ms`.
    ///
    /// # Errors
    ///
    /// Fails for unknown or shader-reserved channels.
    pub fn off_delay<C: Clock>(
        &mut self,
        clock: &C,
        channel: usize,
        delay_ms: Millis,
    ) -> Result<(), OutputError> {
        self.schedule(clock, channel, DelayState::DelayOff, 0, delay_ms)
    }

    /// Switches `channel` on after `on_ms`, then off `off_ms` later.
    ///
    /// # Errors
    ///
    /// Fails for unknown or shader-reserved channels.
    pub fn on_off_delay<C: Clock>(
        &mut self,
        clock: &C,
        channel: usize,
        on_ms: Millis,
        off_ms: Millis,
    ) -> Result<(), OutputError> {
        self.schedule(clock, channel, DelayState::DelayOnOff, on_ms, off_ms)
    }

    /// Switches `channel` on now and off after [`DEFAULT_TRIGGER_MS`].
    ///
    /// # Errors
    ///
    /// Fails for unknown or shader-reserved channels.
    pub fn trigger<C: Clock>(&mut self, clock: &C, channel: usize) -> Result<(), OutputError> {
        self.set(channel, true)?;
        self.off_delay(clock, channel, DEFAULT_TRIGGER_MS)
    }

    /// Bitmask of unreserved outputs that are on; bit `n` is output `n`.
    #[must_use]
    pub fn state_mask(&self) -> u32 {
        self.outputs
            .iter()
            .enumerate()
            .take(32)
            .filter(|(_, output)| output.on && !output.shader_reserved)
            .fold(0, |mask, (channel, _)| mask | (1 << channel))
    }

    /// Drives unreserved outputs to match `mask`, e.g. after a reboot.
    pub fn restore_mask(&mut self, mask: u32) {
        for channel in 0..N.min(32) {
            if !self.outputs[channel].shader_reserved {
                self.outputs[channel].delay = DelayState::NoDelay;
                self.write(channel, mask & (1 << channel) != 0);
            }
        }
    }

    /// Services one output per call in round-robin order.
    pub fn check<C: Clock>(&mut self, clock: &C) -> Option<OutputChange> {
        if N == 0 {
            return None;
        }
        let channel = self.cursor;
        self.cursor = (self.cursor + 1) % N;
        self.check_channel(clock, channel)
    }

    /// Services a single output; returns the switch it performed, if any.
    pub fn check_channel<C: Clock>(&mut self, clock: &C, channel: usize) -> Option<OutputChange> {
        let now = clock.now_ms();
        let output = *self.outputs.get(channel)?;
        let waited = elapsed(output.delay_started_at, now);

        match output.delay {
            DelayState::NoDelay => None,
            DelayState::DelayOn if waited >= output.on_delay_ms => {
                self.outputs[channel].delay = DelayState::NoDelay;
                self.write(channel, true);
                Some(OutputChange { channel, on: true })
            }
            DelayState::DelayOff if waited >= output.off_delay_ms => {
                self.outputs[channel].delay = DelayState::NoDelay;
                self.write(channel, false);
                Some(OutputChange { channel, on: false })
            }
            DelayState::DelayOnOff if waited >= output.on_delay_ms => {
                let slot = &mut self.outputs[channel];
                slot.delay = DelayState::DelayOff;
                slot.delay_started_at = now;
                self.write(channel, true);
                Some(OutputChange { channel, on: true })
            }
            DelayState::DelayOn | DelayState::DelayOff | DelayState::DelayOnOff => None,
        }
    }

    fn available(&self, channel: usize) -> Result<&DigitalOutput, OutputError> {
        let output = self
            .outputs
            .get(channel)
            .ok_or(OutputError::InvalidChannel(channel))?;
        if output.shader_reserved {
            return Err(OutputError::Reserved(channel));
        }
        Ok(output)
    }

    fn schedule<C: Clock>(
        &mut self,
        clock: &C,
        channel: usize,
        delay: DelayState,
        on_ms: Millis,
        off_ms: Millis,
    ) -> Result<(), OutputError> {
        self.available(channel)?;
        let output = &mut self.outputs[channel];
        output.delay = delay;
        output.on_delay_ms = on_ms;
        output.off_delay_ms = off_ms;
        output.delay_started_at = clock.now_ms();
        Ok(())
    }

    fn write(&mut self, channel: usize, on: bool) {
        self.outputs[channel].on = on;
        self.driver.set(channel, on);
    }
}

impl<D, const N: usize> RelayBank for DigitalOutputs<D, N>
where
    D: OutputDriver,
{
    fn switch_relay(&mut self, channel: u8, on: bool) {
        let channel = usize::from(channel);
        if self.is_reserved(channel) {
            self.write(channel, on);
        }
    }
}
