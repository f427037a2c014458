// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Storage allocation and request dispatch.
//!
//! The engine owns the arena, the execution-mode state, the version
//! slots, and the configured locks. At configuration time it walks the
//! fixed lock list in declaration order, asking each lock what it needs
//! before any storage is bound, and binds each to the next free span;
//! not fitting is fatal and aborts provisioning. At runtime it is a
//! thin router that validates the lock index and forwards the call; it
//! never writes lock bytes itself.

use crate::arena::Arena;
use crate::backup;
use crate::global::{BootSignal, GlobalState};
use crate::lock::{LockKind, Peers};
use crate::versions::{VersionStorage, VERSION_SLOT_LEN};
use crate::LockError;

pub const ENGINE_VERSION: u32 = 1;

/// Structured snapshot for the `get_state` operation.
pub struct EngineState<'a> {
    pub version: u32,
    pub raw_boot_signal: u8,
    pub in_bootloader: bool,
    pub in_production: bool,
    /// One status code per configured lock; 0 means its storage bound
    /// cleanly at provisioning.
    pub lock_init_errors: &'a [u32],
    /// The raw backing buffer.
    pub storage: &'a [u8],
}

pub struct Engine<S, const N: usize> {
    global: GlobalState<S>,
    arena: Arena,
    locks: [LockKind; N],
    versions: VersionStorage,
    init_errors: [u32; N],
}

impl<S: BootSignal, const N: usize> Engine<S, N> {
    /// Provisions the engine: assigns every lock its span and zero-fills
    /// the buffer. A lock set that doesn't fit aborts with
    /// `StorageOverflow`; any other per-lock binding failure is recorded
    /// in the state snapshot and leaves that lock answering
    /// `NotInitialized`.
    pub fn new(signal: S, mut locks: [LockKind; N]) -> Result<Self, LockError> {
        let mut arena = Arena::new();
        let mut init_errors = [0u32; N];
        for (i, lock) in locks.iter_mut().enumerate() {
            let span = arena.claim(lock.storage_needed())?;
            if let Err(e) = lock.initialize(span) {
                init_errors[i] = e.into();
            }
        }
        Ok(Self {
            global: GlobalState::new(signal),
            arena,
            locks,
            versions: VersionStorage::new(),
            init_errors,
        })
    }

    /// Resolves any write interrupted by power loss; call once on
    /// activation before serving requests.
    pub fn recover(&mut self) {
        self.arena.recover();
    }

    pub fn state(&self) -> EngineState<'_> {
        EngineState {
            version: ENGINE_VERSION,
            raw_boot_signal: self.global.raw_signal(),
            in_bootloader: self.global.in_bootloader(),
            in_production: self.global.in_production(),
            lock_init_errors: &self.init_errors,
            storage: self.arena.raw(),
        }
    }

    pub fn set_production(&mut self, to: bool) -> Result<(), LockError> {
        self.global.set_production(to)
    }

    pub fn get_lock(&self, index: usize) -> Result<u8, LockError> {
        self.lock(index)?.get(&self.arena)
    }

    pub fn lock_metadata(&self, index: usize) -> Result<&[u8], LockError> {
        self.lock(index)?.metadata(&self.arena)
    }

    pub fn set_lock(
        &mut self,
        index: usize,
        value: u8,
        metadata: &[u8],
    ) -> Result<(), LockError> {
        let lock = self.locks.get(index).ok_or(LockError::MalformedInput)?;
        let modes = self.global.modes();
        let peers = Peers::new(&self.locks);
        lock.set(modes, &mut self.arena, &peers, value, metadata)
    }

    pub fn load_version_slot(
        &self,
        slot: usize,
    ) -> Result<&[u8; VERSION_SLOT_LEN], LockError> {
        self.versions.load(slot)
    }

    pub fn store_version_slot(
        &mut self,
        slot: usize,
        value: &[u8; VERSION_SLOT_LEN],
    ) -> Result<(), LockError> {
        let modes = self.global.modes();
        self.versions.store(modes, slot, value)
    }

    /// Zero-fills the entire backing buffer. Only permitted while the
    /// device hasn't shipped; storage corruption in the field is never
    /// auto-repaired.
    pub fn reset_locks(&mut self) -> Result<(), LockError> {
        if self.global.in_production() {
            return Err(LockError::PolicyDenied);
        }
        self.arena.fill_zero();
        Ok(())
    }

    pub fn backup(&self, out: &mut [u8]) -> Result<usize, LockError> {
        backup::backup(&self.versions, &self.locks, &self.arena, out)
    }

    pub fn restore(&mut self, data: &[u8]) -> Result<(), LockError> {
        backup::restore(
            &mut self.versions,
            &self.locks,
            &mut self.arena,
            data,
        )
    }

    fn lock(&self, index: usize) -> Result<&LockKind, LockError> {
        self.locks.get(index).ok_or(LockError::MalformedInput)
    }
}
