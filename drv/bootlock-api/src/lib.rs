// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! API crate for the verified-boot lock storage engine.
//!
//! The transport that carries requests to the engine deals in opaque
//! operation codes it owns; this crate holds what both sides must agree
//! on regardless of framing: the status codes, the small request
//! enums, and the protocol constants.

#![cfg_attr(not(test), no_std)]

use hubpack::SerializedSize;
use serde::{Deserialize, Serialize};

pub use bootlock::carrier::{
    DEVICE_DATA_HASH_LEN, NONCE_LEN, UNLOCK_TOKEN_VERSION,
};
pub use bootlock::lock::MAX_METADATA;
pub use bootlock::versions::{VERSION_SLOTS, VERSION_SLOT_LEN};
pub use bootlock::{
    EngineState, LockError, BACKING_LEN, ENGINE_VERSION,
};

/// Every response carries a numeric status; zero is success and each
/// nonzero value is a stable [`LockError`] discriminant.
pub const STATUS_OK: u32 = 0;

pub fn status_code<T>(result: &Result<T, LockError>) -> u32 {
    match result {
        Ok(_) => STATUS_OK,
        Err(e) => (*e).into(),
    }
}

/// How a `load_metadata` request treats the staging buffer.
#[derive(
    Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize, SerializedSize,
)]
pub enum MetadataOp {
    Clear,
    Append,
}

/// What a `reset` request wipes.
#[derive(
    Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize, SerializedSize,
)]
pub enum ResetScope {
    LocksOnly,
}
