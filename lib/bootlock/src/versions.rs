// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Rollback-version slots.
//!
//! A small fixed table of opaque 8-byte records, independent of the
//! lock arena and gated only by the execution mode: loads are always
//! allowed, stores only while the device hasn't shipped or while it is
//! executing in the bootloader context. The engine treats the contents
//! as opaque; the boot chain gives them rollback-counter meaning.

use crate::global::Modes;
use crate::LockError;

pub const VERSION_SLOTS: usize = 8;
pub const VERSION_SLOT_LEN: usize = 8;

/// Format tag prefixed to the backup record so a future layout change
/// can be told apart from corruption.
const FORMAT: u8 = 1;

/// Backup record: format tag plus every slot.
pub const RECORD_LEN: usize = 1 + VERSION_SLOTS * VERSION_SLOT_LEN;

pub struct VersionStorage {
    slots: [[u8; VERSION_SLOT_LEN]; VERSION_SLOTS],
}

impl Default for VersionStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl VersionStorage {
    pub fn new() -> Self {
        Self {
            slots: [[0; VERSION_SLOT_LEN]; VERSION_SLOTS],
        }
    }

    pub fn load(
        &self,
        slot: usize,
    ) -> Result<&[u8; VERSION_SLOT_LEN], LockError> {
        self.slots.get(slot).ok_or(LockError::MalformedInput)
    }

    pub fn store(
        &mut self,
        modes: Modes,
        slot: usize,
        value: &[u8; VERSION_SLOT_LEN],
    ) -> Result<(), LockError> {
        if modes.in_production && !modes.in_bootloader {
            return Err(LockError::PolicyDenied);
        }
        *self.slots.get_mut(slot).ok_or(LockError::MalformedInput)? = *value;
        Ok(())
    }

    pub fn backup(&self) -> [u8; RECORD_LEN] {
        let mut out = [0u8; RECORD_LEN];
        out[0] = FORMAT;
        for (i, slot) in self.slots.iter().enumerate() {
            out[1 + i * VERSION_SLOT_LEN..][..VERSION_SLOT_LEN]
                .copy_from_slice(slot);
        }
        out
    }

    /// Rejects anything shorter than the full record or carrying an
    /// unrecognized format tag; trailing bytes are tolerated for the
    /// sake of future extension.
    pub fn restore(&mut self, data: &[u8]) -> Result<(), LockError> {
        if data.len() < RECORD_LEN {
            return Err(LockError::MalformedInput);
        }
        if data[0] != FORMAT {
            return Err(LockError::MalformedInput);
        }
        for (i, slot) in self.slots.iter_mut().enumerate() {
            slot.copy_from_slice(
                &data[1 + i * VERSION_SLOT_LEN..][..VERSION_SLOT_LEN],
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FACTORY: Modes = Modes {
        in_bootloader: false,
        in_production: false,
    };
    const PRODUCTION_HLOS: Modes = Modes {
        in_bootloader: false,
        in_production: true,
    };
    const PRODUCTION_BOOTLOADER: Modes = Modes {
        in_bootloader: true,
        in_production: true,
    };

    #[test]
    fn store_and_load_round_trip() {
        let mut v = VersionStorage::new();
        v.store(FACTORY, 0, &[1; 8]).unwrap();
        v.store(FACTORY, 7, &[7; 8]).unwrap();

        assert_eq!(v.load(0).unwrap(), &[1; 8]);
        assert_eq!(v.load(7).unwrap(), &[7; 8]);
        assert_eq!(v.load(3).unwrap(), &[0; 8]);
    }

    #[test]
    fn slot_index_is_range_checked() {
        let mut v = VersionStorage::new();
        assert_eq!(v.load(8), Err(LockError::MalformedInput));
        assert_eq!(
            v.store(FACTORY, 8, &[0; 8]),
            Err(LockError::MalformedInput)
        );
    }

    #[test]
    fn production_stores_require_bootloader_context() {
        let mut v = VersionStorage::new();
        assert_eq!(
            v.store(PRODUCTION_HLOS, 0, &[9; 8]),
            Err(LockError::PolicyDenied)
        );
        v.store(PRODUCTION_BOOTLOADER, 0, &[9; 8]).unwrap();
        assert_eq!(v.load(0).unwrap(), &[9; 8]);
    }

    #[test]
    fn backup_restore_round_trip() {
        let mut v = VersionStorage::new();
        for i in 0..VERSION_SLOTS {
            v.store(FACTORY, i, &[i as u8; 8]).unwrap();
        }

        let record = v.backup();
        let mut fresh = VersionStorage::new();
        fresh.restore(&record).unwrap();
        for i in 0..VERSION_SLOTS {
            assert_eq!(fresh.load(i).unwrap(), &[i as u8; 8]);
        }
    }

    #[test]
    fn restore_rejects_short_input() {
        let mut v = VersionStorage::new();
        let record = v.backup();
        assert_eq!(
            v.restore(&record[..RECORD_LEN - 1]),
            Err(LockError::MalformedInput)
        );
    }

    #[test]
    fn restore_rejects_unknown_format() {
        let mut v = VersionStorage::new();
        v.store(FACTORY, 2, &[5; 8]).unwrap();

        let mut record = v.backup();
        record[0] = 0xee;
        assert_eq!(v.restore(&record), Err(LockError::MalformedInput));
        // Rejected input must not have touched the slots.
        assert_eq!(v.load(2).unwrap(), &[5; 8]);
    }
}
