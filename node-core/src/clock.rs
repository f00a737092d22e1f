//! Monotonic millisecond time shared by every controller.
//!
//! Timestamps are plain `u32` millisecond counters that wrap roughly every
//! 49 days. All comparisons go through [`elapsed`] and [`is_due`], which use
//! wrapping arithmetic so a counter rollover never stalls a timer.

use core::cell::Cell;

/// Millisecond timestamp that wraps at `u32::MAX`.
pub type Millis = u32;

/// Source of the current time for the controllers.
pub trait Clock {
    /// Returns the current monotonic time in milliseconds.
    fn now_ms(&self) -> Millis;
}

impl<C> Clock for &C
where
    C: Clock + ?Sized,
{
    fn now_ms(&self) -> Millis {
        (**self).now_ms()
    }
}

/// Returns the time that passed between `since` and `now`, tolerating wrap.
#[must_use]
pub const fn elapsed(since: Millis, now: Millis) -> Millis {
    now.wrapping_sub(since)
}

/// Returns `true` once `now` has reached or passed `deadline`.
///
/// Deadlines more than half the counter range in the past read as future.
#[must_use]
pub const fn is_due(deadline: Millis, now: Millis) -> bool {
    now.wrapping_sub(deadline) < 0x8000_0000
}

/// Clock advanced by hand, used by tests and the host emulator.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: Cell<Millis>,
}

impl ManualClock {
    /// Creates a clock reading `start`.
    #[must_use]
    pub const fn new(start: Millis) -> Self {
        Self {
            now: Cell::new(start),
        }
    }

    /// Moves the clock forward by `ms`.
    pub fn advance(&self, ms: Millis) {
        self.now.set(self.now.get().wrapping_add(ms));
    }

    /// Jumps the clock to `ms`.
    pub fn set(&self, ms: Millis) {
        self.now.set(ms);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> Millis {
        self.now.get()
    }
}
