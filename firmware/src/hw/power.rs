//! Supply-loss detection.
//!
//! The supply monitor pulls a GPIO low when the input voltage collapses. The
//! interrupt side only latches the event; the bus task saves the output state
//! from its own context.

use portable_atomic::{AtomicBool, Ordering};

#[cfg(target_os = "none")]
use embassy_stm32::exti::ExtiInput;
#[cfg(target_os = "none")]
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
#[cfg(target_os = "none")]
use embassy_sync::signal::Signal;

/// Set once per outage so a bouncing sense line saves only once.
pub struct PowerFailLatch {
    tripped: AtomicBool,
}

impl PowerFailLatch {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            tripped: AtomicBool::new(false),
        }
    }

    /// Latches the outage; `true` only for the first trip since [`Self::clear`].
    pub fn trip(&self) -> bool {
        !self.tripped.swap(true, Ordering::AcqRel)
    }

    /// Re-arms the latch once the supply has recovered.
    pub fn clear(&self) {
        self.tripped.store(false, Ordering::Release);
    }

    #[must_use]
    pub fn is_tripped(&self) -> bool {
        self.tripped.load(Ordering::Acquire)
    }
}

impl Default for PowerFailLatch {
    fn default() -> Self {
        Self::new()
    }
}

pub static POWER_FAIL: PowerFailLatch = PowerFailLatch::new();

/// Raised towards the bus task on the first trip of an outage.
#[cfg(target_os = "none")]
pub static POWER_FAIL_SIGNAL: Signal<CriticalSectionRawMutex, ()> = Signal::new();

#[cfg(target_os = "none")]
#[embassy_executor::task]
pub async fn monitor(mut sense: ExtiInput<'static>) -> ! {
    loop {
        sense.wait_for_falling_edge().await;
        if POWER_FAIL.trip() {
            defmt::warn!("power: supply lost");
            POWER_FAIL_SIGNAL.signal(());
        }
        sense.wait_for_rising_edge().await;
        POWER_FAIL.clear();
        defmt::info!("power: supply restored");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn latch_fires_once_per_outage() {
        let latch = PowerFailLatch::new();
        assert!(!latch.is_tripped());
        assert!(latch.trip());
        assert!(!latch.trip());
        assert!(latch.is_tripped());

        latch.clear();
        assert!(latch.trip());
    }
}
