//! Dimmer channels with timed fades.
//!
//! A fade walks the level from a start value to a target in fixed steps.
//! When one level per step would need a shorter interval than the timer can
//! honour, the step grows instead so the fade still takes about the
//! requested time.

mod gamma;

use core::fmt;

use crate::clock::{Clock, Millis, is_due};
use crate::codec::telegram::PWM_CHANNELS;

pub use gamma::GAMMA_8BIT;

/// Number of PWM channels a node supports.
pub const MAX_PWM_CHANNELS: usize = PWM_CHANNELS;

/// Hardware seam for the PWM timers.
pub trait PwmDriver {
    /// Writes the raw compare value for `channel`.
    fn write_duty(&mut self, channel: usize, duty: u16);
}

/// Driver that ignores every write.
#[derive(Copy, Clone, Debug, Default)]
pub struct NoopPwmDriver;

impl PwmDriver for NoopPwmDriver {
    fn write_duty(&mut self, _channel: usize, _duty: u16) {}
}

/// Output resolution of the PWM hardware.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum PwmResolution {
    /// Levels `0..=255`, gamma corrected.
    Bits8,
    /// Levels `0..=4095`, written unmodified.
    Bits12,
}

impl PwmResolution {
    #[must_use]
    pub const fn max_level(self) -> u16 {
        match self {
            PwmResolution::Bits8 => 255,
            PwmResolution::Bits12 => 4095,
        }
    }

    /// Compare value for a brightness level.
    #[must_use]
    pub fn duty(self, level: u16) -> u16 {
        match self {
            PwmResolution::Bits8 => {
                let index = usize::from(level.min(self.max_level()));
                u16::from(GAMMA_8BIT[index])
            }
            PwmResolution::Bits12 => level.min(self.max_level()),
        }
    }
}

/// Fade tuning.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct FadeConfig {
    pub resolution: PwmResolution,
    /// Shortest interval between two fade steps.
    pub min_step_interval_ms: Millis,
}

impl FadeConfig {
    pub const DEFAULT_MIN_STEP_INTERVAL_MS: Millis = 4;
}

impl Default for FadeConfig {
    fn default() -> Self {
        Self {
            resolution: PwmResolution::Bits8,
            min_step_interval_ms: Self::DEFAULT_MIN_STEP_INTERVAL_MS,
        }
    }
}

/// Timed activity of one channel.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum FadeState {
    NoFade,
    FadeUp,
    FadeDown,
    /// Waiting to switch off.
    DelayOff,
}

/// Rejections raised by the PWM controller.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum PwmError {
    InvalidChannel(usize),
    /// Level above the hardware resolution.
    InvalidLevel(u16),
}

impl fmt::Display for PwmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PwmError::InvalidChannel(channel) => write!(f, "pwm channel {channel} does not exist"),
            PwmError::InvalidLevel(level) => write!(f, "level {level} out of range"),
        }
    }
}

/// Completed timed actions reported by [`PwmController::check`].
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum PwmEvent {
    FadeComplete { channel: usize, level: u16 },
    SwitchedOff { channel: usize },
}

/// Step size and interval of a fade.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct FadePlan {
    pub step: u16,
    pub interval_ms: Millis,
}

/// Plans a fade across `levels` levels lasting `duration_ms`.
#[must_use]
pub fn plan_fade(levels: u16, duration_ms: Millis, min_interval_ms: Millis) -> FadePlan {
    let span = u64::from(levels.max(1));
    let duration = u64::from(duration_ms);
    let min_interval = u64::from(min_interval_ms);

    let interval = duration / span;
    if interval >= min_interval {
        return FadePlan {
            step: 1,
            interval_ms: Millis::try_from(interval).unwrap_or(Millis::MAX),
        };
    }

    let step = (min_interval * span).div_ceil(duration.max(1)).min(span);
    let interval = duration * step / span;
    FadePlan {
        step: u16::try_from(step).unwrap_or(u16::MAX),
        interval_ms: Millis::try_from(interval).unwrap_or(Millis::MAX),
    }
}

/// Full state of one channel.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct PwmChannel {
    pub level: u16,
    pub enabled: bool,
    pub fade_state: FadeState,
    pub fade_target: u16,
    pub fade_step: u16,
    pub fade_interval_ms: Millis,
    pub next_step_at: Millis,
    pub delay_off_at: Millis,
}

impl PwmChannel {
    const OFF: Self = Self {
        level: 0,
        enabled: false,
        fade_state: FadeState::NoFade,
        fade_target: 0,
        fade_step: 1,
        fade_interval_ms: 0,
        next_step_at: 0,
        delay_off_at: 0,
    };
}

/// Controller for `N` PWM channels.
pub struct PwmController<D, const N: usize = MAX_PWM_CHANNELS> {
    driver: D,
    channels: [PwmChannel; N],
    config: FadeConfig,
    cursor: usize,
}

impl<D, const N: usize> PwmController<D, N>
where
    D: PwmDriver,
{
    /// Creates the controller with every channel dark.
    pub fn new(mut driver: D, config: FadeConfig) -> Self {
        for channel in 0..N {
            driver.write_duty(channel, 0);
        }
        Self {
            driver,
            channels: [PwmChannel::OFF; N],
            config,
            cursor: 0,
        }
    }

    pub fn driver(&self) -> &D {
        &self.driver
    }

    #[must_use]
    pub const fn config(&self) -> FadeConfig {
        self.config
    }

    #[must_use]
    pub fn channel(&self, channel: usize) -> Option<&PwmChannel> {
        self.channels.get(channel)
    }

    #[must_use]
    pub fn level(&self, channel: usize) -> Option<u16> {
        self.channels.get(channel).map(|state| state.level)
    }

    #[must_use]
    pub fn is_enabled(&self, channel: usize) -> Option<bool> {
        self.channels.get(channel).map(|state| state.enabled)
    }

    #[must_use]
    pub fn fade_state(&self, channel: usize) -> Option<FadeState> {
        self.channels.get(channel).map(|state| state.fade_state)
    }

    /// Bitmask of enabled channels; bit `n` is channel `n`.
    #[must_use]
    pub fn enabled_mask(&self) -> u16 {
        self.channels
            .iter()
            .enumerate()
            .take(16)
            .filter(|(_, state)| state.enabled)
            .fold(0, |mask, (channel, _)| mask | (1 << channel))
    }

    /// Stored level of every channel.
    #[must_use]
    pub fn levels(&self) -> [u16; N] {
        core::array::from_fn(|channel| self.channels[channel].level)
    }

    /// Reinstates enable bits and levels, e.g. after a reboot.
    pub fn restore(&mut self, enabled: u16, levels: &[u16]) {
        let max = self.config.resolution.max_level();
        for channel in 0..N {
            let state = &mut self.channels[channel];
            *state = PwmChannel::OFF;
            state.level = levels.get(channel).copied().unwrap_or(0).min(max);
            state.enabled = channel < 16 && enabled & (1 << channel) != 0;
            self.write(channel);
        }
    }

    /// Stores `level` for `channel` and cancels any fade.
    ///
    /// # Errors
    ///
    /// Rejects unknown channels and levels above the resolution.
    pub fn set_level(&mut self, channel: usize, level: u16) -> Result<(), PwmError> {
        self.validate(channel, level)?;
        let state = &mut self.channels[channel];
        state.level = level;
        state.fade_state = FadeState::NoFade;
        self.write(channel);
        Ok(())
    }

    /// Enables `channel`; a stored level of zero lights it fully.
    ///
    /// # Errors
    ///
    /// Rejects unknown channels.
    pub fn on(&mut self, channel: usize) -> Result<(), PwmError> {
        let max = self.config.resolution.max_level();
        let state = self.slot(channel)?;
        state.enabled = true;
        state.fade_state = FadeState::NoFade;
        if state.level == 0 {
            state.level = max;
        }
        self.write(channel);
        Ok(())
    }

    /// Disables `channel`, keeping its stored level.
    ///
    /// # Errors
    ///
    /// Rejects unknown channels.
    pub fn off(&mut self, channel: usize) -> Result<(), PwmError> {
        let state = self.slot(channel)?;
        state.enabled = false;
        state.fade_state = FadeState::NoFade;
        self.write(channel);
        Ok(())
    }

    /// Flips the enable state of `channel`.
    ///
    /// # Errors
    ///
    /// Rejects unknown channels.
    pub fn toggle(&mut self, channel: usize) -> Result<(), PwmError> {
        if self.slot(channel)?.enabled {
            self.off(channel)
        } else {
            self.on(channel)
        }
    }

    /// Fades `channel` from `start` to `target` over `duration_ms`.
    ///
    /// # Errors
    ///
    /// Rejects unknown channels and levels above the resolution.
    pub fn fade<C: Clock>(
        &mut self,
        clock: &C,
        channel: usize,
        start: u16,
        target: u16,
        duration_ms: Millis,
    ) -> Result<(), PwmError> {
        self.validate(channel, start)?;
        self.validate(channel, target)?;

        let now = clock.now_ms();
        let plan = plan_fade(start.abs_diff(target), duration_ms, self.config.min_step_interval_ms);
        let state = &mut self.channels[channel];

        if start == target || duration_ms == 0 {
            state.level = target;
            state.enabled = target > 0;
            state.fade_state = FadeState::NoFade;
        } else {
            state.level = start;
            state.enabled = true;
            state.fade_target = target;
            state.fade_step = plan.step.max(1);
            state.fade_interval_ms = plan.interval_ms;
            state.next_step_at = now.wrapping_add(plan.interval_ms);
            state.fade_state = if target > start {
                FadeState::FadeUp
            } else {
                FadeState::FadeDown
            };
        }
        self.write(channel);
        Ok(())
    }

    /// Fades `channel` from its current output to `target`.
    ///
    /// # Errors
    ///
    /// Rejects unknown channels and levels above the resolution.
    pub fn fade_to<C: Clock>(
        &mut self,
        clock: &C,
        channel: usize,
        target: u16,
        duration_ms: Millis,
    ) -> Result<(), PwmError> {
        let state = self.slot(channel)?;
        let start = if state.enabled { state.level } else { 0 };
        self.fade(clock, channel, start, target, duration_ms)
    }

    /// Switches `channel` off after `delay_ms`.
    ///
    /// # Errors
    ///
    /// Rejects unknown channels.
    pub fn delay_off<C: Clock>(
        &mut self,
        clock: &C,
        channel: usize,
        delay_ms: Millis,
    ) -> Result<(), PwmError> {
        let now = clock.now_ms();
        let state = self.slot(channel)?;
        state.fade_state = FadeState::DelayOff;
        state.delay_off_at = now.wrapping_add(delay_ms);
        Ok(())
    }

    /// Services one channel per call in round-robin order.
    pub fn check<C: Clock>(&mut self, clock: &C) -> Option<PwmEvent> {
        if N == 0 {
            return None;
        }
        let channel = self.cursor;
        self.cursor = (self.cursor + 1) % N;
        self.check_channel(clock, channel)
    }

    /// Services a single channel.
    pub fn check_channel<C: Clock>(&mut self, clock: &C, channel: usize) -> Option<PwmEvent> {
        let now = clock.now_ms();
        let state = self.channels.get_mut(channel)?;

        let event = match state.fade_state {
            FadeState::NoFade => return None,
            FadeState::DelayOff => {
                if !is_due(state.delay_off_at, now) {
                    return None;
                }
                state.fade_state = FadeState::NoFade;
                state.enabled = false;
                Some(PwmEvent::SwitchedOff { channel })
            }
            FadeState::FadeUp | FadeState::FadeDown => {
                if !is_due(state.next_step_at, now) {
                    return None;
                }
                // A channel serviced late takes every step that fell due since.
                while is_due(state.next_step_at, now) && state.level != state.fade_target {
                    state.level = if state.fade_state == FadeState::FadeUp {
                        state.level.saturating_add(state.fade_step).min(state.fade_target)
                    } else {
                        state.level.saturating_sub(state.fade_step).max(state.fade_target)
                    };
                    state.next_step_at = state.next_step_at.wrapping_add(state.fade_interval_ms);
                }

                if state.level == state.fade_target {
                    state.fade_state = FadeState::NoFade;
                    if state.level == 0 {
                        state.enabled = false;
                    }
                    Some(PwmEvent::FadeComplete {
                        channel,
                        level: state.level,
                    })
                } else {
                    None
                }
            }
        };
        self.write(channel);
        event
    }

    fn slot(&mut self, channel: usize) -> Result<&mut PwmChannel, PwmError> {
        self.channels
            .get_mut(channel)
            .ok_or(PwmError::InvalidChannel(channel))
    }

    fn validate(&self, channel: usize, level: u16) -> Result<(), PwmError> {
        if channel >= N {
            return Err(PwmError::InvalidChannel(channel));
        }
        if level > self.config.resolution.max_level() {
            return Err(PwmError::InvalidLevel(level));
        }
        Ok(())
    }

    fn write(&mut self, channel: usize) {
        let state = self.channels[channel];
        let duty = if state.enabled {
            self.config.resolution.duty(state.level)
        } else {
            0
        };
        self.driver.write_duty(channel, duty);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slow_fades_step_one_level_at_a_time() {
        assert_eq!(
            plan_fade(100, 2000, 4),
            FadePlan {
                step: 1,
                interval_ms: 20
            }
        );
    }

    #[test]
    fn fast_fades_take_bigger_steps() {
        let plan = plan_fade(255, 500, 4);
        assert_eq!(plan.step, 3);
        assert_eq!(plan.interval_ms, 5);
        assert!(plan.interval_ms >= 4);
    }

    #[test]
    fn instant_fade_uses_single_step() {
        let plan = plan_fade(255, 0, 4);
        assert_eq!(plan.step, 255);
    }

    #[test]
    fn twelve_bit_levels_pass_through() {
        assert_eq!(PwmResolution::Bits12.duty(1234), 1234);
        assert_eq!(PwmResolution::Bits8.duty(255), 255);
        assert_eq!(PwmResolution::Bits8.duty(1000), 255);
    }
}
