// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Request surface for the verified-boot lock storage engine.
//!
//! The transport hands this server one decoded request at a time;
//! requests are single-threaded and run to completion. Methods here
//! mirror the external operations one-for-one and return `Result`s
//! whose error discriminants are the wire status codes (see
//! `drv-bootlock-api`).
//!
//! Metadata-bearing writes are staged: the caller loads bytes into a
//! scratch buffer with `load_metadata` and then issues
//! `set_lock(..., use_metadata = true)`, which consumes the staged
//! bytes. The staging buffer is scrubbed after successful consumption
//! (it can carry device-identifying data) but survives a denied set, so
//! a caller can change mode and retry without re-staging.

#![cfg_attr(not(test), no_std)]

use bootlock::carrier::{
    self, CarrierLock, UnlockKey, DEVICE_DATA_HASH_LEN, NONCE_LEN,
};
use bootlock::lock::{BasicLock, ExecutionGate, LockKind, LockPolicy};
use bootlock::versions::VERSION_SLOT_LEN;
use bootlock::{BootSignal, Engine, EngineState, LockError};
use drv_bootlock_api::{status_code, MetadataOp, ResetScope};
use tracebuf::{trace, TraceBuf};
use zeroize::Zeroize;

/// Lock indices of the reference deployment.
pub const LOCK_CARRIER: usize = 0;
pub const LOCK_DEVICE: usize = 1;
pub const LOCK_BOOT: usize = 2;
pub const LOCK_OWNER: usize = 3;
pub const REFERENCE_LOCKS: usize = 4;

/// The owner lock's metadata region carries the owner key blob.
pub const OWNER_METADATA_CAPACITY: usize = 64;

/// Capacity of the staging buffer. Sized for the largest
/// metadata-bearing request: a carrier unlock token (version byte,
/// nonce, RSA-2048 signature), with headroom for device-data blobs.
pub const MAX_STAGED_METADATA: usize = 512;

const BOOT_PREREQUISITES: &[usize] = &[LOCK_CARRIER, LOCK_DEVICE];
const OWNER_PREREQUISITES: &[usize] = &[LOCK_BOOT];

#[derive(Copy, Clone, PartialEq)]
enum Trace {
    None,
    Start,
    GetState,
    GetLock(u8),
    SetLock { index: u8, value: u8 },
    SetProduction(bool),
    LoadMetadata { len: usize },
    VersionLoad(u8),
    VersionStore(u8),
    Reset,
    Backup,
    Restore,
    TestVector,
    Status(u32),
}

pub struct LockServer<S, const N: usize> {
    engine: Engine<S, N>,
    key: UnlockKey,
    staged: [u8; MAX_STAGED_METADATA],
    staged_len: usize,
    trace: TraceBuf<Trace, 32>,
}

impl<S: BootSignal> LockServer<S, REFERENCE_LOCKS> {
    /// The reference deployment: a carrier lock, a device-management
    /// lock, a bootloader lock that needs both of those released first,
    /// and an owner lock chained behind the bootloader lock.
    pub fn new_reference(signal: S) -> Result<Self, LockError> {
        Self::with_key(signal, UnlockKey::builtin())
    }

    /// Same lock set with a caller-supplied carrier unlock key.
    pub fn with_key(signal: S, key: UnlockKey) -> Result<Self, LockError> {
        let locks = [
            LockKind::Carrier(CarrierLock::new(key.clone())),
            LockKind::Basic(BasicLock::new(LockPolicy::NONE, 0)),
            LockKind::Basic(BasicLock::new(
                LockPolicy {
                    gate: ExecutionGate::BootloaderOnly,
                    require_metadata_on_lock: false,
                    prerequisites: BOOT_PREREQUISITES,
                },
                0,
            )),
            LockKind::Basic(BasicLock::new(
                LockPolicy {
                    gate: ExecutionGate::Any,
                    require_metadata_on_lock: true,
                    prerequisites: OWNER_PREREQUISITES,
                },
                OWNER_METADATA_CAPACITY,
            )),
        ];
        Self::new(signal, locks, key)
    }
}

impl<S: BootSignal, const N: usize> LockServer<S, N> {
    pub fn new(
        signal: S,
        locks: [LockKind; N],
        key: UnlockKey,
    ) -> Result<Self, LockError> {
        let mut engine = Engine::new(signal, locks)?;
        // Resolve any write a power loss interrupted before we serve
        // anything.
        engine.recover();

        let mut server = Self {
            engine,
            key,
            staged: [0; MAX_STAGED_METADATA],
            staged_len: 0,
            trace: TraceBuf::new(Trace::None),
        };
        trace!(server.trace, Trace::Start);
        Ok(server)
    }

    pub fn get_state(&mut self) -> EngineState<'_> {
        trace!(self.trace, Trace::GetState);
        self.engine.state()
    }

    pub fn get_lock(
        &mut self,
        index: usize,
        with_metadata: bool,
    ) -> Result<(u8, Option<&[u8]>), LockError> {
        trace!(self.trace, Trace::GetLock(index as u8));
        let value = self.engine.get_lock(index)?;
        let metadata = if with_metadata {
            Some(self.engine.lock_metadata(index)?)
        } else {
            None
        };
        Ok((value, metadata))
    }

    pub fn set_lock(
        &mut self,
        index: usize,
        value: u8,
        use_metadata: bool,
    ) -> Result<(), LockError> {
        trace!(
            self.trace,
            Trace::SetLock {
                index: index as u8,
                value
            }
        );
        let metadata: &[u8] = if use_metadata {
            &self.staged[..self.staged_len]
        } else {
            &[]
        };
        let result = self.engine.set_lock(index, value, metadata);
        if result.is_ok() && use_metadata {
            self.staged.zeroize();
            self.staged_len = 0;
        }
        self.finish(result)
    }

    pub fn set_production(&mut self, enable: bool) -> Result<(), LockError> {
        trace!(self.trace, Trace::SetProduction(enable));
        let result = self.engine.set_production(enable);
        self.finish(result)
    }

    /// Stages bytes for the next metadata-bearing `set_lock`.
    pub fn load_metadata(
        &mut self,
        op: MetadataOp,
        bytes: &[u8],
    ) -> Result<(), LockError> {
        trace!(self.trace, Trace::LoadMetadata { len: bytes.len() });
        if op == MetadataOp::Clear {
            self.staged.zeroize();
            self.staged_len = 0;
        }
        if bytes.len() > MAX_STAGED_METADATA - self.staged_len {
            return self.finish(Err(LockError::MalformedInput));
        }
        self.staged[self.staged_len..][..bytes.len()].copy_from_slice(bytes);
        self.staged_len += bytes.len();
        self.finish(Ok(()))
    }

    pub fn load_version_slot(
        &mut self,
        slot: usize,
    ) -> Result<&[u8; VERSION_SLOT_LEN], LockError> {
        trace!(self.trace, Trace::VersionLoad(slot as u8));
        self.engine.load_version_slot(slot)
    }

    pub fn store_version_slot(
        &mut self,
        slot: usize,
        value: &[u8; VERSION_SLOT_LEN],
    ) -> Result<(), LockError> {
        trace!(self.trace, Trace::VersionStore(slot as u8));
        let result = self.engine.store_version_slot(slot, value);
        self.finish(result)
    }

    pub fn reset(&mut self, scope: ResetScope) -> Result<(), LockError> {
        trace!(self.trace, Trace::Reset);
        let result = match scope {
            ResetScope::LocksOnly => self.engine.reset_locks(),
        };
        self.finish(result)
    }

    pub fn backup(&mut self, out: &mut [u8]) -> Result<usize, LockError> {
        trace!(self.trace, Trace::Backup);
        let result = self.engine.backup(out);
        self.finish(result)
    }

    pub fn restore(&mut self, data: &[u8]) -> Result<(), LockError> {
        trace!(self.trace, Trace::Restore);
        let result = self.engine.restore(data);
        self.finish(result)
    }

    /// Diagnostic: runs the carrier unlock verification against
    /// caller-supplied fake state, never touching persisted state.
    /// `blob` is `device-data hash (32) || stored nonce (8, LE) ||
    /// unlock token`.
    pub fn carrier_unlock_test_vector(
        &mut self,
        blob: &[u8],
    ) -> Result<(), LockError> {
        trace!(self.trace, Trace::TestVector);
        let result = self.verify_test_vector(blob);
        self.finish(result)
    }

    fn verify_test_vector(&self, blob: &[u8]) -> Result<(), LockError> {
        if blob.len() < DEVICE_DATA_HASH_LEN + NONCE_LEN {
            return Err(LockError::MalformedInput);
        }
        let mut hash = [0u8; DEVICE_DATA_HASH_LEN];
        hash.copy_from_slice(&blob[..DEVICE_DATA_HASH_LEN]);
        let mut nonce = [0u8; NONCE_LEN];
        nonce.copy_from_slice(
            &blob[DEVICE_DATA_HASH_LEN..DEVICE_DATA_HASH_LEN + NONCE_LEN],
        );
        let token = &blob[DEVICE_DATA_HASH_LEN + NONCE_LEN..];

        carrier::verify_unlock_token(
            &self.key,
            u64::from_le_bytes(nonce),
            &hash,
            token,
        )
        .map(|_| ())
    }

    fn finish<T>(&mut self, result: Result<T, LockError>) -> Result<T, LockError> {
        trace!(self.trace, Trace::Status(status_code(&result)));
        result
    }
}
