//! Write-back cache for the node's non-volatile storage.
//!
//! The node writes configuration and the state log byte by byte. Flash can
//! only be programmed a page at a time, so the image lives in RAM and is
//! programmed once writes have been quiet for [`COMMIT_QUIET_MS`], or
//! immediately before a restart or on supply loss.

use node_core::clock::{Millis, elapsed};
use node_core::persist::{STORAGE_SIZE, Storage};

/// Quiet time after the last write before the image is programmed.
pub const COMMIT_QUIET_MS: Millis = 1_000;

/// Storage image as it is laid out in flash.
pub type StorageImage = [u8; STORAGE_SIZE];

/// One flash page holding the storage image.
pub trait FlashPage {
    type Error;

    /// Reads the stored image.
    ///
    /// # Errors
    ///
    /// Returns the flash controller error.
    fn load(&mut self, image: &mut StorageImage) -> Result<(), Self::Error>;

    /// Erases the page and programs `image`.
    ///
    /// # Errors
    ///
    /// Returns the flash controller error.
    fn program(&mut self, image: &StorageImage) -> Result<(), Self::Error>;
}

/// RAM copy of the storage page.
pub struct ShadowStorage {
    image: StorageImage,
    dirty: bool,
    touched: bool,
    quiet_since: Millis,
}

impl ShadowStorage {
    /// Image of an erased page.
    #[must_use]
    pub const fn erased() -> Self {
        Self {
            image: [0xFF; STORAGE_SIZE],
            dirty: false,
            touched: false,
            quiet_since: 0,
        }
    }

    /// Reads the image from `page`.
    ///
    /// # Errors
    ///
    /// Returns the flash error; callers usually fall back to [`Self::erased`].
    pub fn load<F: FlashPage>(page: &mut F) -> Result<Self, F::Error> {
        let mut storage = Self::erased();
        page.load(&mut storage.image)?;
        Ok(storage)
    }

    /// Whether the RAM image differs from flash.
    #[must_use]
    pub const fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Programs the image if it changed; returns whether flash was written.
    ///
    /// # Errors
    ///
    /// Returns the flash error and keeps the image dirty.
    pub fn commit<F: FlashPage>(&mut self, page: &mut F) -> Result<bool, F::Error> {
        if !self.dirty {
            return Ok(false);
        }
        page.program(&self.image)?;
        self.dirty = false;
        Ok(true)
    }

    /// Programs the image once writes have settled.
    ///
    /// # Errors
    ///
    /// Returns the flash error; the next call retries.
    pub fn poll_commit<F: FlashPage>(&mut self, page: &mut F, now: Millis) -> Result<bool, F::Error> {
        if self.touched {
            self.touched = false;
            self.quiet_since = now;
            return Ok(false);
        }
        if self.dirty && elapsed(self.quiet_since, now) >= COMMIT_QUIET_MS {
            return self.commit(page);
        }
        Ok(false)
    }
}

impl Default for ShadowStorage {
    fn default() -> Self {
        Self::erased()
    }
}

impl Storage for ShadowStorage {
    fn read(&self, address: u16) -> u8 {
        self.image.get(usize::from(address)).copied().unwrap_or(0xFF)
    }

    fn write(&mut self, address: u16, value: u8) {
        let Some(byte) = self.image.get_mut(usize::from(address)) else {
            return;
        };
        if *byte != value {
            *byte = value;
            self.dirty = true;
            self.touched = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FakePage {
        image: StorageImage,
        programs: usize,
        fail: bool,
    }

    impl FakePage {
        fn new() -> Self {
            Self {
                image: [0xFF; STORAGE_SIZE],
                programs: 0,
                fail: false,
            }
        }
    }

    impl FlashPage for FakePage {
        type Error = ();

        fn load(&mut self, image: &mut StorageImage) -> Result<(), ()> {
            image.copy_from_slice(&self.image);
            Ok(())
        }

        fn program(&mut self, image: &StorageImage) -> Result<(), ()> {
            if self.fail {
                return Err(());
            }
            self.image.copy_from_slice(image);
            self.programs += 1;
            Ok(())
        }
    }

    #[test]
    fn writes_are_programmed_after_a_quiet_period() {
        let mut page = FakePage::new();
        let mut storage = ShadowStorage::load(&mut page).unwrap();

        storage.write(0x000, 0x42);
        assert_eq!(storage.poll_commit(&mut page, 100), Ok(false));
        storage.write(0x001, 0x01);
        assert_eq!(storage.poll_commit(&mut page, 600), Ok(false));
        assert_eq!(storage.poll_commit(&mut page, 1_500), Ok(false));
        assert_eq!(storage.poll_commit(&mut page, 1_600), Ok(true));

        assert_eq!(page.programs, 1);
        assert_eq!(&page.image[..2], &[0x42, 0x01]);
        assert!(!storage.is_dirty());
        assert_eq!(storage.poll_commit(&mut page, 5_000), Ok(false));
    }

    #[test]
    fn unchanged_bytes_do_not_dirty_the_image() {
        let mut page = FakePage::new();
        let mut storage = ShadowStorage::load(&mut page).unwrap();
        storage.write(0x010, 0xFF);
        assert!(!storage.is_dirty());
        assert_eq!(storage.commit(&mut page), Ok(false));
        assert_eq!(page.programs, 0);
    }

    #[test]
    fn failed_commit_keeps_the_image_dirty() {
        let mut page = FakePage::new();
        let mut storage = ShadowStorage::erased();
        storage.write(0x100, 0xA5);

        page.fail = true;
        assert_eq!(storage.commit(&mut page), Err(()));
        assert!(storage.is_dirty());

        page.fail = false;
        assert_eq!(storage.commit(&mut page), Ok(true));
        assert_eq!(page.image[0x100], 0xA5);
        assert_eq!(storage.read(0x100), 0xA5);
        assert_eq!(storage.read(0xFFFF), 0xFF);
    }
}
