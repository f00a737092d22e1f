//! Non-volatile storage layout and the rotating output-state log.
//!
//! The node keeps its address, client table and shader wiring at fixed
//! offsets. Output state is written on power-fail into a ring of slots so
//! the same cells are not rewritten on every outage; boot restores from the
//! newest valid slot.

use crate::codec::telegram::{PWM_CHANNELS, SHADER_CHANNELS};

/// Bytes of non-volatile storage the layout expects.
pub const STORAGE_SIZE: usize = 0x400;

/// Offset of the node address.
pub const ADDRESS_OFFSET: u16 = 0x000;
/// Offset of the device type.
pub const DEVICE_TYPE_OFFSET: u16 = 0x001;
/// Offset of the client address table.
pub const CLIENTS_OFFSET: u16 = 0x010;
/// Offset of the per-client retry limits.
pub const RETRIES_OFFSET: u16 = 0x020;
/// Offset of the shader setup table, six bytes per channel.
pub const SHADER_SETUP_OFFSET: u16 = 0x040;
/// Offset of the first state log slot.
pub const STATE_LOG_OFFSET: u16 = 0x100;
/// Number of slots in the state log.
pub const STATE_LOG_SLOTS: usize = 8;
/// Size of one state log record.
pub const STATE_RECORD_LEN: usize = 1 + 1 + 4 + SHADER_CHANNELS + 2 + 2 * PWM_CHANNELS;

const VALID_MARKER: u8 = 0xA5;
const CLEARED_MARKER: u8 = 0x00;

/// Byte-addressed non-volatile memory.
pub trait Storage {
    /// Reads one byte; addresses past the end read as erased (`0xFF`).
    fn read(&self, address: u16) -> u8;

    /// Writes one byte; addresses past the end are ignored.
    fn write(&mut self, address: u16, value: u8);

    fn read_into(&self, address: u16, out: &mut [u8]) {
        for (offset, byte) in (0u16..).zip(out.iter_mut()) {
            *byte = self.read(address.wrapping_add(offset));
        }
    }

    fn write_all(&mut self, address: u16, bytes: &[u8]) {
        for (offset, byte) in (0u16..).zip(bytes) {
            self.write(address.wrapping_add(offset), *byte);
        }
    }
}

/// Storage backed by RAM, erased to `0xFF`.
#[derive(Clone, Debug)]
pub struct RamStorage<const SIZE: usize = STORAGE_SIZE> {
    bytes: [u8; SIZE],
}

impl<const SIZE: usize> RamStorage<SIZE> {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            bytes: [0xFF; SIZE],
        }
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }
}

impl<const SIZE: usize> Default for RamStorage<SIZE> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const SIZE: usize> Storage for RamStorage<SIZE> {
    fn read(&self, address: u16) -> u8 {
        self.bytes.get(usize::from(address)).copied().unwrap_or(0xFF)
    }

    fn write(&mut self, address: u16, value: u8) {
        if let Some(byte) = self.bytes.get_mut(usize::from(address)) {
            *byte = value;
        }
    }
}

/// Output state captured on power-fail.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct StateSnapshot {
    /// Digital outputs, bit `n` is output `n`.
    pub digital: u32,
    /// Reported shader positions.
    pub shader: [u8; SHADER_CHANNELS],
    pub pwm_enabled: u16,
    pub pwm_level: [u16; PWM_CHANNELS],
}

impl StateSnapshot {
    /// Snapshot with every output off.
    pub const EMPTY: Self = Self {
        digital: 0,
        shader: [0; SHADER_CHANNELS],
        pwm_enabled: 0,
        pwm_level: [0; PWM_CHANNELS],
    };

    fn encode(&self, sequence: u8) -> [u8; STATE_RECORD_LEN] {
        let mut record = [0u8; STATE_RECORD_LEN];
        record[0] = VALID_MARKER;
        record[1] = sequence;
        record[2..6].copy_from_slice(&self.digital.to_le_bytes());
        record[6..6 + SHADER_CHANNELS].copy_from_slice(&self.shader);
        let pwm = 6 + SHADER_CHANNELS;
        record[pwm..pwm + 2].copy_from_slice(&self.pwm_enabled.to_le_bytes());
        for (index, level) in self.pwm_level.iter().enumerate() {
            let at = pwm + 2 + index * 2;
            record[at..at + 2].copy_from_slice(&level.to_le_bytes());
        }
        record
    }

    fn decode(record: &[u8; STATE_RECORD_LEN]) -> Option<(u8, Self)> {
        if record[0] != VALID_MARKER {
            return None;
        }
        let mut snapshot = Self::EMPTY;
        snapshot.digital = u32::from_le_bytes([record[2], record[3], record[4], record[5]]);
        snapshot
            .shader
            .copy_from_slice(&record[6..6 + SHADER_CHANNELS]);
        let pwm = 6 + SHADER_CHANNELS;
        snapshot.pwm_enabled = u16::from_le_bytes([record[pwm], record[pwm + 1]]);
        for (index, level) in snapshot.pwm_level.iter_mut().enumerate() {
            let at = pwm + 2 + index * 2;
            *level = u16::from_le_bytes([record[at], record[at + 1]]);
        }
        Some((record[1], snapshot))
    }
}

/// Wear-levelled ring of state records.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct StateLog {
    slot: Option<usize>,
    sequence: u8,
}

impl StateLog {
    /// Finds the newest valid record.
    pub fn scan<S: Storage>(storage: &S) -> (Self, Option<StateSnapshot>) {
        let mut newest: Option<(usize, u8, StateSnapshot)> = None;

        for slot in 0..STATE_LOG_SLOTS {
            let mut record = [0u8; STATE_RECORD_LEN];
            storage.read_into(slot_address(slot), &mut record);
            let Some((sequence, snapshot)) = StateSnapshot::decode(&record) else {
                continue;
            };
            let replace = newest.is_none_or(|(_, best, _)| sequence_newer(sequence, best));
            if replace {
                newest = Some((slot, sequence, snapshot));
            }
        }

        match newest {
            Some((slot, sequence, snapshot)) => (
                Self {
                    slot: Some(slot),
                    sequence,
                },
                Some(snapshot),
            ),
            None => (
                Self {
                    slot: None,
                    sequence: 0,
                },
                None,
            ),
        }
    }

    /// Slot holding the newest record, if any.
    #[must_use]
    pub const fn current_slot(&self) -> Option<usize> {
        self.slot
    }

    /// Writes `snapshot` into the next slot, then invalidates the old one.
    pub fn append<S: Storage>(&mut self, storage: &mut S, snapshot: &StateSnapshot) {
        let next = self.slot.map_or(0, |slot| (slot + 1) % STATE_LOG_SLOTS);
        let sequence = self.sequence.wrapping_add(1);
        let record = snapshot.encode(sequence);

        // Marker goes last so a torn write never reads as valid.
        let address = slot_address(next);
        storage.write_all(address + 1, &record[1..]);
        storage.write(address, VALID_MARKER);

        if let Some(previous) = self.slot {
            storage.write(slot_address(previous), CLEARED_MARKER);
        }
        self.slot = Some(next);
        self.sequence = sequence;
    }
}

fn slot_address(slot: usize) -> u16 {
    let offset = u16::try_from(slot * STATE_RECORD_LEN).unwrap_or(0);
    STATE_LOG_OFFSET + offset
}

/// Wrapping comparison of 8-bit sequence numbers.
fn sequence_newer(candidate: u8, current: u8) -> bool {
    let delta = candidate.wrapping_sub(current);
    delta != 0 && delta < 0x80
}
