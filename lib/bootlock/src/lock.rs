// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The lock capability and its declarative policy.
//!
//! A lock is one persisted byte (`0` = unlocked, nonzero = locked) plus
//! an optional metadata region, both living in a contiguous arena span
//! assigned once at configuration time. What may change a lock, and
//! when, is described by a [`LockPolicy`] fixed at construction; the
//! engine never writes lock bytes directly.
//!
//! Dispatch over the two variants ([`BasicLock`] here, the carrier lock
//! in [`crate::carrier`]) is a tagged enum, [`LockKind`]; the policy
//! check, the atomic write, and the metadata handling are the explicit
//! match arms.

use crate::arena::{Arena, Span};
use crate::carrier::CarrierLock;
use crate::global::Modes;
use crate::journal::MAX_RECORD;
use crate::LockError;
use static_assertions::const_assert;

/// Largest metadata region a [`BasicLock`] may be configured with. Keeps
/// every lock span inside one journal record.
pub const MAX_METADATA: usize = 128;
const_assert!(1 + MAX_METADATA <= MAX_RECORD);

/// Which execution context may change a lock once the device is in
/// production. The bootloader/HLOS requirements are mutually exclusive,
/// so they are one choice, not two flags.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ExecutionGate {
    Any,
    BootloaderOnly,
    HlosOnly,
}

/// Declarative change policy, configured at construction and immutable
/// thereafter.
#[derive(Copy, Clone, Debug)]
pub struct LockPolicy {
    pub gate: ExecutionGate,
    /// Locking (but never unlocking) must supply nonempty metadata.
    pub require_metadata_on_lock: bool,
    /// Indices of locks that must all read as unlocked for this lock to
    /// change.
    pub prerequisites: &'static [usize],
}

impl LockPolicy {
    /// No restrictions beyond the ones every lock carries.
    pub const NONE: LockPolicy = LockPolicy {
        gate: ExecutionGate::Any,
        require_metadata_on_lock: false,
        prerequisites: &[],
    };
}

/// Read-only directory of every configured lock, assembled by the
/// engine per dispatch so prerequisite reads don't alias the arena.
pub struct Peers<'a> {
    locks: &'a [LockKind],
}

impl<'a> Peers<'a> {
    pub fn new(locks: &'a [LockKind]) -> Self {
        Self { locks }
    }

    /// Current lock byte of lock `index`. An unknown index reads as a
    /// failure, which prerequisite checks treat as locked.
    pub fn lock_byte(
        &self,
        arena: &Arena,
        index: usize,
    ) -> Result<u8, LockError> {
        self.locks
            .get(index)
            .ok_or(LockError::NotInitialized)?
            .get(arena)
    }
}

/// A plain policy-gated lock.
pub struct BasicLock {
    policy: LockPolicy,
    metadata_capacity: usize,
    span: Option<Span>,
}

impl BasicLock {
    /// Panics if `metadata_capacity` exceeds [`MAX_METADATA`]; lock sets
    /// are fixed at build time, so this is a build defect, not input.
    pub fn new(policy: LockPolicy, metadata_capacity: usize) -> Self {
        assert!(metadata_capacity <= MAX_METADATA);
        Self {
            policy,
            metadata_capacity,
            span: None,
        }
    }

    pub fn storage_needed(&self) -> usize {
        1 + self.metadata_capacity
    }

    pub fn initialize(&mut self, span: Span) -> Result<(), LockError> {
        if span.len() != self.storage_needed() {
            return Err(LockError::MalformedInput);
        }
        self.span = Some(span);
        Ok(())
    }

    pub fn span(&self) -> Option<Span> {
        self.span
    }

    pub fn get(&self, arena: &Arena) -> Result<u8, LockError> {
        let span = self.span.ok_or(LockError::NotInitialized)?;
        Ok(arena.bytes(span)[0])
    }

    pub fn metadata<'a>(
        &self,
        arena: &'a Arena,
    ) -> Result<&'a [u8], LockError> {
        let span = self.span.ok_or(LockError::NotInitialized)?;
        Ok(&arena.bytes(span)[1..])
    }

    pub fn set(
        &self,
        modes: Modes,
        arena: &mut Arena,
        peers: &Peers<'_>,
        value: u8,
        metadata: &[u8],
    ) -> Result<(), LockError> {
        let span = self.span.ok_or(LockError::NotInitialized)?;
        if metadata.len() > self.metadata_capacity {
            return Err(LockError::MalformedInput);
        }

        // Locking may require metadata; unlocking never does.
        if self.policy.require_metadata_on_lock
            && value != 0
            && metadata.is_empty()
        {
            return Err(LockError::PolicyDenied);
        }

        // Re-locking requires an intervening unlock, so a key baked into
        // the metadata can't be silently replaced.
        if value != 0 && arena.bytes(span)[0] != 0 {
            return Err(LockError::PolicyDenied);
        }

        if modes.in_production {
            match self.policy.gate {
                ExecutionGate::Any => {}
                ExecutionGate::BootloaderOnly if !modes.in_bootloader => {
                    return Err(LockError::PolicyDenied)
                }
                ExecutionGate::HlosOnly if modes.in_bootloader => {
                    return Err(LockError::PolicyDenied)
                }
                _ => {}
            }
        }

        // Every prerequisite must currently read as unlocked; a
        // prerequisite that can't be read fails closed.
        for &p in self.policy.prerequisites {
            match peers.lock_byte(arena, p) {
                Ok(0) => {}
                _ => return Err(LockError::PolicyDenied),
            }
        }

        // Metadata lands before the lock byte is raised, all under one
        // journal record. Unlocking with no metadata clears the region;
        // caller-supplied metadata is stored as given, zero-padded.
        let mut txn = arena.transaction(span);
        txn.write(1, metadata);
        txn.fill_zero(1 + metadata.len(), self.metadata_capacity - metadata.len());
        txn.write(0, &[value]);
        txn.commit();
        Ok(())
    }
}

/// The configured lock variants, dispatched by the engine.
pub enum LockKind {
    Basic(BasicLock),
    Carrier(CarrierLock),
}

impl LockKind {
    /// Callable before any storage is bound.
    pub fn storage_needed(&self) -> usize {
        match self {
            LockKind::Basic(l) => l.storage_needed(),
            LockKind::Carrier(l) => l.storage_needed(),
        }
    }

    pub fn initialize(&mut self, span: Span) -> Result<(), LockError> {
        match self {
            LockKind::Basic(l) => l.initialize(span),
            LockKind::Carrier(l) => l.initialize(span),
        }
    }

    pub fn span(&self) -> Option<Span> {
        match self {
            LockKind::Basic(l) => l.span(),
            LockKind::Carrier(l) => l.span(),
        }
    }

    pub fn get(&self, arena: &Arena) -> Result<u8, LockError> {
        match self {
            LockKind::Basic(l) => l.get(arena),
            LockKind::Carrier(l) => l.get(arena),
        }
    }

    pub fn metadata<'a>(
        &self,
        arena: &'a Arena,
    ) -> Result<&'a [u8], LockError> {
        match self {
            LockKind::Basic(l) => l.metadata(arena),
            LockKind::Carrier(l) => l.metadata(arena),
        }
    }

    pub fn set(
        &self,
        modes: Modes,
        arena: &mut Arena,
        peers: &Peers<'_>,
        value: u8,
        metadata: &[u8],
    ) -> Result<(), LockError> {
        match self {
            LockKind::Basic(l) => l.set(modes, arena, peers, value, metadata),
            // The carrier lock has no prerequisite list; its policy is
            // the unlock protocol itself.
            LockKind::Carrier(l) => l.set(modes, arena, value, metadata),
        }
    }
}
