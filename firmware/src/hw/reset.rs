//! Restart bookkeeping for the bus task.
//!
//! Every restart goes through a reset: the watchdog for reboots and supply
//! loss, a software reset for the bootloader. The node restores its saved
//! outputs on the next boot.

/// Restart the loop is heading for.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PendingReset {
    None,
    /// Reboot requested over the bus; keep serving until the watchdog bites.
    Watchdog,
    /// Reset as soon as the acknowledgement has gone out; the bootloader
    /// waits for update data after every reset.
    Bootloader,
    /// Outputs saved on supply loss; nothing runs until the watchdog bites.
    PowerFail,
}

impl PendingReset {
    /// Records a new request. Supply loss overrides everything else.
    pub fn request(&mut self, next: Self) {
        if next.rank() > self.rank() {
            *self = next;
        }
    }

    #[must_use]
    pub const fn feeds_watchdog(self) -> bool {
        matches!(self, Self::None)
    }

    /// Returns `false` once the loop must stop touching bus and outputs.
    #[must_use]
    pub const fn keeps_running(self) -> bool {
        !matches!(self, Self::PowerFail)
    }

    const fn rank(self) -> u8 {
        match self {
            Self::None => 0,
            Self::Watchdog => 1,
            Self::Bootloader => 2,
            Self::PowerFail => 3,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn power_fail_halts_and_starves_the_watchdog() {
        let mut reset = PendingReset::None;
        assert!(reset.feeds_watchdog());

        reset.request(PendingReset::PowerFail);
        assert!(!reset.feeds_watchdog());
        assert!(!reset.keeps_running());

        reset.request(PendingReset::Bootloader);
        assert_eq!(reset, PendingReset::PowerFail);
    }

    #[test]
    fn reboot_keeps_serving_until_reset() {
        let mut reset = PendingReset::None;
        reset.request(PendingReset::Watchdog);
        assert!(!reset.feeds_watchdog());
        assert!(reset.keeps_running());

        reset.request(PendingReset::Bootloader);
        assert_eq!(reset, PendingReset::Bootloader);
        reset.request(PendingReset::Watchdog);
        assert_eq!(reset, PendingReset::Bootloader);
    }
}
