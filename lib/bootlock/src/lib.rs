// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Verified-boot lock storage engine.
//!
//! This crate persists device lock state (carrier, device-management,
//! bootloader and owner locks) in a fixed backing buffer, enforces a
//! policy graph over when each lock may change, verifies the signed
//! carrier unlock protocol, and serializes everything into a tagged
//! stream that survives firmware updates.
//!
//! The pieces, leaf first:
//!
//! - [`global`]: execution-mode tracking (bootloader context, production
//!   mode) that every policy decision consults.
//! - [`arena`] / [`journal`]: the shared persistent byte region, handed
//!   out as disjoint spans, with power-loss-atomic multi-field writes.
//! - [`lock`]: the lock capability, its declarative policy, and the
//!   plain [`lock::BasicLock`] variant.
//! - [`carrier`]: the carrier lock and its RSA-signed anti-replay unlock
//!   protocol.
//! - [`versions`]: rollback-version slots, independent of the locks.
//! - [`backup`]: the tagged upgrade-survival stream.
//! - [`engine`]: storage allocation and request dispatch over all of the
//!   above.
//!
//! Execution is single-threaded and run-to-completion; the only hazard
//! modeled is power loss mid-write, which the journal bounds to
//! "exactly pre-write or exactly post-write".

#![cfg_attr(not(test), no_std)]

pub mod arena;
pub mod backup;
pub mod carrier;
pub mod engine;
pub mod global;
pub mod journal;
pub mod lock;
pub mod versions;

use hubpack::SerializedSize;
use num_derive::FromPrimitive;
use serde::{Deserialize, Serialize};

pub use arena::{Arena, Span, BACKING_LEN};
pub use engine::{Engine, EngineState, ENGINE_VERSION};
pub use global::{BootSignal, GlobalState, Modes, SignalError};
pub use lock::{BasicLock, ExecutionGate, LockKind, LockPolicy};

/// Errors surfaced by every engine operation.
///
/// The discriminants are the wire status codes (0 is reserved for
/// success) and must never be renumbered.
#[derive(
    Copy,
    Clone,
    Debug,
    Eq,
    PartialEq,
    FromPrimitive,
    Serialize,
    Deserialize,
    SerializedSize,
)]
#[repr(u32)]
pub enum LockError {
    /// A mode, prerequisite, or metadata-requirement check failed. The
    /// caller may retry after changing mode or prerequisites.
    PolicyDenied = 1,
    /// The engine or the addressed lock has no storage bound yet.
    NotInitialized = 2,
    /// Signature, nonce-freshness, or version-tag mismatch in the unlock
    /// protocol. Recoverable only by obtaining a fresh valid token.
    VerificationFailed = 3,
    /// The configured lock set does not fit the backing buffer. Raised
    /// at configuration time only; aborts provisioning.
    StorageOverflow = 4,
    /// Wrong-length, wrong-tag, or otherwise unparseable input.
    MalformedInput = 5,
}

impl From<LockError> for u32 {
    fn from(e: LockError) -> Self {
        e as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use num_traits::FromPrimitive;

    #[test]
    fn status_codes_are_stable() {
        assert_eq!(u32::from(LockError::PolicyDenied), 1);
        assert_eq!(u32::from(LockError::NotInitialized), 2);
        assert_eq!(u32::from(LockError::VerificationFailed), 3);
        assert_eq!(u32::from(LockError::StorageOverflow), 4);
        assert_eq!(u32::from(LockError::MalformedInput), 5);
    }

    #[test]
    fn codes_round_trip_through_the_wire() {
        for code in 1..=5u32 {
            let e = LockError::from_u32(code).unwrap();
            assert_eq!(u32::from(e), code);
        }
        assert!(LockError::from_u32(0).is_none());
        assert!(LockError::from_u32(6).is_none());
    }
}
