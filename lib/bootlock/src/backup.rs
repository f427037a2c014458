// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The upgrade-survival stream.
//!
//! At a firmware-upgrade boundary the engine's persistable objects
//! (the version slots, then each configured lock in index order) are
//! walked into a tagged, length-prefixed byte stream:
//!
//! ```text
//! header { version: u32, magic: [u8; 12] }     (hubpack)
//! ( tag: u32 LE | len: u32 LE | payload )*     (one per object)
//! zero padding to BACKUP_ALIGN
//! ```
//!
//! Tags are positions in the fixed object list (0 = version slots,
//! 1 + i = lock i), so restore can never apply a payload to the wrong
//! object: incoming triples are matched strictly in tag order, and a
//! tag that is out of order, duplicated, or unconfigured is skipped.
//! An object whose payload is absent (length 0) or malformed is also
//! skipped while the rest of restore proceeds; only an unrecognized
//! header aborts, because nothing after it can be attributed.

use crate::arena::Arena;
use crate::lock::LockKind;
use crate::versions::VersionStorage;
use crate::LockError;
use hubpack::SerializedSize;
use serde::{Deserialize, Serialize};
use zerocopy::byteorder::little_endian::U32;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

pub const BACKUP_VERSION: u32 = 1;
pub const BACKUP_MAGIC: [u8; 12] = *b"vboot-locks\0";

/// Streams are zero-padded to the platform's flash block write size.
pub const BACKUP_ALIGN: usize = 64;

#[derive(Serialize, Deserialize, SerializedSize)]
pub struct BackupHeader {
    pub version: u32,
    pub magic: [u8; 12],
}

#[derive(FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
struct EntryHeader {
    tag: U32,
    len: U32,
}

const ENTRY_HEADER_LEN: usize = core::mem::size_of::<EntryHeader>();

/// Serializes every persistable object into `out`, returning the padded
/// stream length. A destination too small for the configured objects is
/// the caller's defect, reported as `MalformedInput`.
pub fn backup(
    versions: &VersionStorage,
    locks: &[LockKind],
    arena: &Arena,
    out: &mut [u8],
) -> Result<usize, LockError> {
    let header = BackupHeader {
        version: BACKUP_VERSION,
        magic: BACKUP_MAGIC,
    };
    let mut cursor = hubpack::serialize(out, &header)
        .map_err(|_| LockError::MalformedInput)?;

    let record = versions.backup();
    cursor = put_entry(out, cursor, 0, &record)?;

    for (i, lock) in locks.iter().enumerate() {
        // An uninitialized lock is recorded as absent.
        let payload = match lock.span() {
            Some(span) => arena.bytes(span),
            None => &[],
        };
        cursor = put_entry(out, cursor, (i + 1) as u32, payload)?;
    }

    let padded = cursor
        .checked_next_multiple_of(BACKUP_ALIGN)
        .ok_or(LockError::MalformedInput)?;
    if padded > out.len() {
        return Err(LockError::MalformedInput);
    }
    out[cursor..padded].fill(0);
    Ok(padded)
}

fn put_entry(
    out: &mut [u8],
    cursor: usize,
    tag: u32,
    payload: &[u8],
) -> Result<usize, LockError> {
    let total = ENTRY_HEADER_LEN + payload.len();
    if out.len() - cursor < total {
        return Err(LockError::MalformedInput);
    }
    let header = EntryHeader {
        tag: U32::new(tag),
        len: U32::new(payload.len() as u32),
    };
    out[cursor..cursor + ENTRY_HEADER_LEN]
        .copy_from_slice(header.as_bytes());
    out[cursor + ENTRY_HEADER_LEN..cursor + total].copy_from_slice(payload);
    Ok(cursor + total)
}

/// Applies a stream produced by [`backup`], strictly by tag order.
pub fn restore(
    versions: &mut VersionStorage,
    locks: &[LockKind],
    arena: &mut Arena,
    data: &[u8],
) -> Result<(), LockError> {
    let (header, mut rest) = hubpack::deserialize::<BackupHeader>(data)
        .map_err(|_| LockError::MalformedInput)?;
    if header.version != BACKUP_VERSION || header.magic != BACKUP_MAGIC {
        return Err(LockError::MalformedInput);
    }

    let object_count = locks.len() + 1;
    let mut next_tag = 0usize;
    while rest.len() >= ENTRY_HEADER_LEN {
        let Ok(entry) =
            EntryHeader::read_from_bytes(&rest[..ENTRY_HEADER_LEN])
        else {
            break;
        };
        rest = &rest[ENTRY_HEADER_LEN..];

        let len = entry.len.get() as usize;
        if len > rest.len() {
            // Truncated trailing entry; nothing after it is usable.
            break;
        }
        let payload = &rest[..len];
        rest = &rest[len..];

        let tag = entry.tag.get() as usize;
        if tag < next_tag || tag >= object_count {
            // Out of order, duplicated, or unconfigured: never applied
            // to the wrong object. (Block padding parses as such
            // entries too.)
            continue;
        }
        next_tag = tag + 1;
        if payload.is_empty() {
            continue;
        }

        if tag == 0 {
            // A malformed record skips this object only.
            let _ = versions.restore(payload);
        } else {
            let lock = &locks[tag - 1];
            let Some(span) = lock.span() else {
                continue;
            };
            if payload.len() != span.len() {
                continue;
            }
            let mut txn = arena.transaction(span);
            txn.write(0, payload);
            txn.commit();
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::global::Modes;
    use crate::lock::{BasicLock, LockPolicy, Peers};
    use crate::versions::RECORD_LEN;

    const FACTORY: Modes = Modes {
        in_bootloader: false,
        in_production: false,
    };

    fn fixture() -> (Arena, [LockKind; 2], VersionStorage) {
        let mut arena = Arena::new();
        let mut locks = [
            LockKind::Basic(BasicLock::new(LockPolicy::NONE, 4)),
            LockKind::Basic(BasicLock::new(LockPolicy::NONE, 0)),
        ];
        for lock in &mut locks {
            let span = arena.claim(lock.storage_needed()).unwrap();
            lock.initialize(span).unwrap();
        }
        (arena, locks, VersionStorage::new())
    }

    fn populate(arena: &mut Arena, locks: &[LockKind]) {
        let peers = Peers::new(locks);
        locks[0]
            .set(FACTORY, arena, &peers, 1, &[0xaa, 0xbb])
            .unwrap();
        let peers = Peers::new(locks);
        locks[1].set(FACTORY, arena, &peers, 3, &[]).unwrap();
    }

    #[test]
    fn round_trip_is_byte_identical() {
        let (mut arena, locks, mut versions) = fixture();
        populate(&mut arena, &locks);
        versions.store(FACTORY, 1, &[9; 8]).unwrap();

        let mut stream = [0u8; 512];
        let n = backup(&versions, &locks, &arena, &mut stream).unwrap();
        assert_eq!(n % BACKUP_ALIGN, 0);

        let (mut arena2, locks2, mut versions2) = fixture();
        restore(&mut versions2, &locks2, &mut arena2, &stream[..n]).unwrap();

        for (a, b) in locks.iter().zip(locks2.iter()) {
            assert_eq!(
                arena.bytes(a.span().unwrap()),
                arena2.bytes(b.span().unwrap())
            );
        }
        assert_eq!(versions2.load(1).unwrap(), &[9; 8]);
    }

    #[test]
    fn unrecognized_header_aborts() {
        let (mut arena, locks, mut versions) = fixture();
        let mut stream = [0u8; 512];
        let n = backup(&versions, &locks, &arena, &mut stream).unwrap();

        let mut bad = stream;
        bad[0] ^= 0xff; // version
        assert_eq!(
            restore(&mut versions, &locks, &mut arena, &bad[..n]),
            Err(LockError::MalformedInput)
        );

        let mut bad = stream;
        bad[4] ^= 0xff; // magic
        assert_eq!(
            restore(&mut versions, &locks, &mut arena, &bad[..n]),
            Err(LockError::MalformedInput)
        );
    }

    fn manual_stream(entries: &[(u32, &[u8])]) -> Vec<u8> {
        let header = BackupHeader {
            version: BACKUP_VERSION,
            magic: BACKUP_MAGIC,
        };
        let mut out = vec![0u8; BackupHeader::MAX_SIZE];
        let n = hubpack::serialize(&mut out, &header).unwrap();
        out.truncate(n);
        for &(tag, payload) in entries {
            out.extend_from_slice(&tag.to_le_bytes());
            out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
            out.extend_from_slice(payload);
        }
        out
    }

    #[test]
    fn out_of_order_tag_is_never_applied() {
        let (mut arena, locks, mut versions) = fixture();

        let span1 = locks[0].span().unwrap();
        let good = [1u8, 0xde, 0xad, 0, 0];
        assert_eq!(good.len(), span1.len());

        // Lock 1's entry (tag 2) arrives before lock 0's (tag 1): the
        // tag-1 entry is out of order and must be skipped, not applied
        // to lock 1.
        let stream = manual_stream(&[(2, &[7u8]), (1, &good)]);
        restore(&mut versions, &locks, &mut arena, &stream).unwrap();

        assert_eq!(locks[1].get(&arena).unwrap(), 7);
        assert_eq!(locks[0].get(&arena).unwrap(), 0);
    }

    #[test]
    fn unconfigured_tag_is_skipped() {
        let (mut arena, locks, mut versions) = fixture();
        let stream = manual_stream(&[(9, &[1, 2, 3]), (2, &[5u8])]);
        restore(&mut versions, &locks, &mut arena, &stream).unwrap();
        // The entry after the unknown tag still applied.
        assert_eq!(locks[1].get(&arena).unwrap(), 5);
    }

    #[test]
    fn absent_and_wrong_length_payloads_leave_state_alone() {
        let (mut arena, locks, mut versions) = fixture();
        populate(&mut arena, &locks);
        let before = arena.bytes(locks[0].span().unwrap()).to_vec();

        let stream = manual_stream(&[
            (0, &[]),            // absent
            (1, &[1, 2]),        // wrong length for lock 0
            (2, &[0u8]),         // valid: unlocks lock 1
        ]);
        restore(&mut versions, &locks, &mut arena, &stream).unwrap();

        assert_eq!(arena.bytes(locks[0].span().unwrap()), &before[..]);
        assert_eq!(locks[1].get(&arena).unwrap(), 0);
    }

    #[test]
    fn malformed_version_record_skips_only_that_object() {
        let (mut arena, locks, mut versions) = fixture();

        let mut record = [0u8; RECORD_LEN];
        record[0] = 0xee; // unknown format tag
        let stream = manual_stream(&[(0, &record), (2, &[4u8])]);
        restore(&mut versions, &locks, &mut arena, &stream).unwrap();

        assert_eq!(versions.load(0).unwrap(), &[0; 8]);
        assert_eq!(locks[1].get(&arena).unwrap(), 4);
    }

    #[test]
    fn truncated_stream_stops_cleanly() {
        let (mut arena, locks, mut versions) = fixture();
        populate(&mut arena, &locks);

        let mut stream = [0u8; 512];
        let n = backup(&versions, &locks, &arena, &mut stream).unwrap();

        let (mut arena2, locks2, mut versions2) = fixture();
        // Chop mid-entry; whatever parsed before the cut still applies.
        restore(&mut versions2, &locks2, &mut arena2, &stream[..n - 70])
            .unwrap();
    }

    #[test]
    fn destination_too_small_is_reported() {
        let (arena, locks, versions) = fixture();
        let mut tiny = [0u8; 16];
        assert_eq!(
            backup(&versions, &locks, &arena, &mut tiny),
            Err(LockError::MalformedInput)
        );
    }
}
