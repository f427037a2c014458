// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The carrier lock and its signed unlock protocol.
//!
//! Unlike a [`crate::lock::BasicLock`], the carrier lock is not gated on
//! execution mode or prerequisite locks: its policy is the protocol.
//! Locking (factory only) binds a SHA-256 digest of carrier-supplied
//! device data into the persisted state; unlocking in production
//! requires a token whose RSA signature covers both a candidate nonce
//! and that digest, and whose nonce is strictly fresher than the stored
//! one. A consumed token can never be replayed, because the accepted
//! nonce ratchets forward, and a successful unlock erases the digest,
//! so re-engaging the lock requires a full re-provisioning cycle.
//!
//! Persisted layout, one contiguous 41-byte span:
//!
//! ```text
//! +------+----------------+----------------------+
//! | lock | nonce (u64 LE) | device-data hash     |
//! | byte | 8 bytes        | 32 bytes (SHA-256)   |
//! +------+----------------+----------------------+
//! ```

use crate::arena::{Arena, Span};
use crate::global::Modes;
use crate::LockError;
use hex_literal::hex;
use rsa::{BigUint, Pkcs1v15Sign, RsaPublicKey};
use sha2::{Digest, Sha256};

pub const NONCE_LEN: usize = 8;
pub const DEVICE_DATA_HASH_LEN: usize = 32;
pub const CARRIER_STORAGE: usize = 1 + NONCE_LEN + DEVICE_DATA_HASH_LEN;

/// Unlock tokens are `version || nonce || signature`.
pub const UNLOCK_TOKEN_VERSION: u8 = 1;

const NONCE_OFF: usize = 1;
const HASH_OFF: usize = 1 + NONCE_LEN;

/// The device key authorized to sign carrier unlock tokens, baked into
/// the production image. RSA-2048, e = 65537.
const BUILTIN_MODULUS: [u8; 256] = hex!(
    "c178fb3f83d65a55a8d8aef5243fd936377e131758de3a9800eff56be2d341f0"
    "12596af4ac5f289834c5c49754707ab4cd0b9196cf4a0a70d371666e3b37f112"
    "ea42d018f8525fadb402def12e22bcad63d053906fbb2489c82ba82fcc7c024d"
    "e9cdf36f47ea6547a13836294222665ac89f8b094f6be55c8a6e84c0366f88b4"
    "89508e6b19262e89b93a1c9e49e1242a18bfa08e825ea73b4a0e8a419042ff63"
    "1679c1417802a3d2db64099823cb94e49c357428589b2277d84598a1325c63cd"
    "fa6fc6b20bf3eb86e4033f2ac3d4423ddefe616c391efa6b751d0b30b8d98dad"
    "71e82370bf8c89aba3881ae04fed874706ba9f101a98c841d1de8fb475994be7"
);
const BUILTIN_EXPONENT: u32 = 65537;

/// Verifying key for the unlock protocol. Injectable at construction so
/// tests can pair it with a signing key they hold.
#[derive(Clone)]
pub struct UnlockKey {
    key: RsaPublicKey,
}

impl UnlockKey {
    pub fn new(key: RsaPublicKey) -> Self {
        Self { key }
    }

    pub fn builtin() -> Self {
        let n = BigUint::from_bytes_be(&BUILTIN_MODULUS);
        let e = BigUint::from(BUILTIN_EXPONENT);
        match RsaPublicKey::new(n, e) {
            Ok(key) => Self { key },
            // The modulus is a build-time constant; rejection here is a
            // build defect, not runtime input.
            Err(_) => panic!(),
        }
    }
}

/// Checks an unlock token against the given stored state and returns
/// the accepted candidate nonce.
///
/// This is the single verification routine for both the real unlock
/// path and the diagnostic test-vector operation, so the two cannot
/// drift apart. Checks, in order: token framing and version tag, the
/// PKCS#1 v1.5 / SHA-256 signature over `candidate_nonce || stored
/// device-data hash`, then strict nonce freshness.
pub fn verify_unlock_token(
    key: &UnlockKey,
    stored_nonce: u64,
    stored_hash: &[u8; DEVICE_DATA_HASH_LEN],
    token: &[u8],
) -> Result<u64, LockError> {
    if token.len() <= 1 + NONCE_LEN {
        return Err(LockError::VerificationFailed);
    }
    if token[0] != UNLOCK_TOKEN_VERSION {
        return Err(LockError::VerificationFailed);
    }

    let mut candidate = [0u8; NONCE_LEN];
    candidate.copy_from_slice(&token[1..1 + NONCE_LEN]);
    let signature = &token[1 + NONCE_LEN..];

    let mut message = [0u8; NONCE_LEN + DEVICE_DATA_HASH_LEN];
    message[..NONCE_LEN].copy_from_slice(&candidate);
    message[NONCE_LEN..].copy_from_slice(stored_hash);
    let digest = Sha256::digest(message);

    key.key
        .verify(Pkcs1v15Sign::new::<Sha256>(), &digest, signature)
        .map_err(|_| LockError::VerificationFailed)?;

    let candidate = u64::from_le_bytes(candidate);
    if candidate <= stored_nonce {
        return Err(LockError::VerificationFailed);
    }
    Ok(candidate)
}

pub struct CarrierLock {
    key: UnlockKey,
    span: Option<Span>,
}

impl CarrierLock {
    pub fn new(key: UnlockKey) -> Self {
        Self { key, span: None }
    }

    pub fn storage_needed(&self) -> usize {
        CARRIER_STORAGE
    }

    pub fn initialize(&mut self, span: Span) -> Result<(), LockError> {
        if span.len() != CARRIER_STORAGE {
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

    /// The exported metadata region: nonce followed by device-data hash.
    pub fn metadata<'a>(
        &self,
        arena: &'a Arena,
    ) -> Result<&'a [u8], LockError> {
        let span = self.span.ok_or(LockError::NotInitialized)?;
        Ok(&arena.bytes(span)[NONCE_OFF..])
    }

    pub fn nonce(&self, arena: &Arena) -> Result<u64, LockError> {
        let span = self.span.ok_or(LockError::NotInitialized)?;
        Ok(u64::from_le_bytes(stored_nonce_bytes(arena.bytes(span))))
    }

    /// Locking stores the digest of `payload` (the device-data blob);
    /// unlocking consumes `payload` as an unlock token.
    pub fn set(
        &self,
        modes: Modes,
        arena: &mut Arena,
        value: u8,
        payload: &[u8],
    ) -> Result<(), LockError> {
        let span = self.span.ok_or(LockError::NotInitialized)?;
        if value != 0 {
            self.engage(modes, arena, span, value, payload)
        } else {
            self.release(modes, arena, span, payload)
        }
    }

    /// Only the factory may engage the carrier lock, and only from the
    /// unlocked state. The nonce is never modified by locking.
    fn engage(
        &self,
        modes: Modes,
        arena: &mut Arena,
        span: Span,
        value: u8,
        blob: &[u8],
    ) -> Result<(), LockError> {
        if modes.in_production {
            return Err(LockError::PolicyDenied);
        }
        if arena.bytes(span)[0] != 0 {
            return Err(LockError::PolicyDenied);
        }

        let digest = Sha256::digest(blob);
        let mut txn = arena.transaction(span);
        txn.write(HASH_OFF, &digest);
        txn.write(0, &[value]);
        txn.commit();
        Ok(())
    }

    fn release(
        &self,
        modes: Modes,
        arena: &mut Arena,
        span: Span,
        token: &[u8],
    ) -> Result<(), LockError> {
        if modes.in_production {
            let stored = arena.bytes(span);
            let stored_nonce =
                u64::from_le_bytes(stored_nonce_bytes(stored));
            let mut stored_hash = [0u8; DEVICE_DATA_HASH_LEN];
            stored_hash.copy_from_slice(&stored[HASH_OFF..]);

            let fresh = verify_unlock_token(
                &self.key,
                stored_nonce,
                &stored_hash,
                token,
            )?;

            // Two atomic regions, lock byte first: interruption between
            // them leaves "unlocked with stale nonce/hash", never
            // "locked with a torn hash".
            let mut txn = arena.transaction(span.sub(0, 1));
            txn.write(0, &[0]);
            txn.commit();

            let mut txn = arena
                .transaction(span.sub(NONCE_OFF, NONCE_LEN + DEVICE_DATA_HASH_LEN));
            txn.write(0, &fresh.to_le_bytes());
            txn.fill_zero(NONCE_LEN, DEVICE_DATA_HASH_LEN);
            txn.commit();
        } else {
            // Factory flow: verification skipped, nonce untouched. The
            // hash is still erased so re-engaging needs fresh device
            // data.
            let mut txn = arena.transaction(span.sub(0, 1));
            txn.write(0, &[0]);
            txn.commit();

            let mut txn =
                arena.transaction(span.sub(HASH_OFF, DEVICE_DATA_HASH_LEN));
            txn.fill_zero(0, DEVICE_DATA_HASH_LEN);
            txn.commit();
        }
        Ok(())
    }
}

fn stored_nonce_bytes(span_bytes: &[u8]) -> [u8; NONCE_LEN] {
    let mut out = [0u8; NONCE_LEN];
    out.copy_from_slice(&span_bytes[NONCE_OFF..NONCE_OFF + NONCE_LEN]);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use rsa::RsaPrivateKey;
    use std::sync::OnceLock;

    const FACTORY: Modes = Modes {
        in_bootloader: false,
        in_production: false,
    };
    const PRODUCTION: Modes = Modes {
        in_bootloader: false,
        in_production: true,
    };

    /// Generating an RSA-2048 key is slow enough to share one across
    /// the whole test binary.
    fn signing_key() -> &'static RsaPrivateKey {
        static KEY: OnceLock<RsaPrivateKey> = OnceLock::new();
        KEY.get_or_init(|| {
            RsaPrivateKey::new(&mut rand::thread_rng(), 2048).unwrap()
        })
    }

    fn fixture() -> (Arena, CarrierLock) {
        let mut arena = Arena::new();
        let verifying =
            UnlockKey::new(signing_key().to_public_key());
        let mut lock = CarrierLock::new(verifying);
        let span = arena.claim(lock.storage_needed()).unwrap();
        lock.initialize(span).unwrap();
        (arena, lock)
    }

    fn token(nonce: u64, hash: &[u8; 32]) -> Vec<u8> {
        let mut message = [0u8; 40];
        message[..8].copy_from_slice(&nonce.to_le_bytes());
        message[8..].copy_from_slice(hash);
        let digest = Sha256::digest(message);
        let signature = signing_key()
            .sign(Pkcs1v15Sign::new::<Sha256>(), &digest)
            .unwrap();

        let mut out = vec![UNLOCK_TOKEN_VERSION];
        out.extend_from_slice(&nonce.to_le_bytes());
        out.extend_from_slice(&signature);
        out
    }

    #[test]
    fn storage_is_the_fixed_41_byte_span() {
        let (_, lock) = fixture();
        assert_eq!(lock.storage_needed(), 41);
    }

    #[test]
    fn factory_lock_stores_the_device_data_digest() {
        let (mut arena, lock) = fixture();
        lock.set(FACTORY, &mut arena, 1, b"device data").unwrap();

        assert_eq!(lock.get(&arena).unwrap(), 1);
        assert_eq!(lock.nonce(&arena).unwrap(), 0);

        let expected = Sha256::digest(b"device data");
        assert_eq!(&lock.metadata(&arena).unwrap()[8..], expected.as_slice());
    }

    #[test]
    fn locking_in_production_is_denied() {
        let (mut arena, lock) = fixture();
        assert_eq!(
            lock.set(PRODUCTION, &mut arena, 1, b"blob"),
            Err(LockError::PolicyDenied)
        );
    }

    #[test]
    fn relocking_requires_an_unlock_cycle() {
        let (mut arena, lock) = fixture();
        lock.set(FACTORY, &mut arena, 1, b"one").unwrap();
        assert_eq!(
            lock.set(FACTORY, &mut arena, 1, b"two"),
            Err(LockError::PolicyDenied)
        );
    }

    #[test]
    fn factory_unlock_skips_verification_and_keeps_the_nonce() {
        let (mut arena, lock) = fixture();
        lock.set(FACTORY, &mut arena, 1, b"blob").unwrap();

        lock.set(FACTORY, &mut arena, 0, &[]).unwrap();
        assert_eq!(lock.get(&arena).unwrap(), 0);
        assert_eq!(lock.nonce(&arena).unwrap(), 0);
        assert_eq!(&lock.metadata(&arena).unwrap()[8..], &[0u8; 32]);
    }

    #[test]
    fn verified_unlock_ratchets_the_nonce_and_erases_the_hash() {
        let (mut arena, lock) = fixture();
        lock.set(FACTORY, &mut arena, 1, b"blob").unwrap();

        // Move the stored nonce to 3 with a first verified unlock.
        let hash: [u8; 32] = Sha256::digest(b"blob").into();
        lock.set(PRODUCTION, &mut arena, 0, &token(3, &hash)).unwrap();
        assert_eq!(lock.nonce(&arena).unwrap(), 3);

        // Re-provision and unlock with nonce 5.
        lock.set(FACTORY, &mut arena, 1, b"blob").unwrap();
        let t5 = token(5, &hash);
        lock.set(PRODUCTION, &mut arena, 0, &t5).unwrap();

        assert_eq!(lock.get(&arena).unwrap(), 0);
        assert_eq!(lock.nonce(&arena).unwrap(), 5);
        assert_eq!(&lock.metadata(&arena).unwrap()[8..], &[0u8; 32]);

        // Replaying the identical token fails: the nonce moved forward
        // and the hash it signed is gone.
        lock.set(FACTORY, &mut arena, 1, b"blob").unwrap();
        assert_eq!(
            lock.set(PRODUCTION, &mut arena, 0, &t5),
            Err(LockError::VerificationFailed)
        );
    }

    #[test]
    fn stale_nonce_is_rejected() {
        let (mut arena, lock) = fixture();
        lock.set(FACTORY, &mut arena, 1, b"blob").unwrap();
        let hash: [u8; 32] = Sha256::digest(b"blob").into();
        lock.set(PRODUCTION, &mut arena, 0, &token(7, &hash)).unwrap();

        lock.set(FACTORY, &mut arena, 1, b"blob").unwrap();
        // Equal is not strictly greater.
        assert_eq!(
            lock.set(PRODUCTION, &mut arena, 0, &token(7, &hash)),
            Err(LockError::VerificationFailed)
        );
        assert_eq!(
            lock.set(PRODUCTION, &mut arena, 0, &token(6, &hash)),
            Err(LockError::VerificationFailed)
        );
        // The failed attempts must not have moved anything.
        assert_eq!(lock.get(&arena).unwrap(), 1);
        assert_eq!(lock.nonce(&arena).unwrap(), 7);
    }

    #[test]
    fn wrong_version_tag_is_rejected() {
        let (mut arena, lock) = fixture();
        lock.set(FACTORY, &mut arena, 1, b"blob").unwrap();
        let hash: [u8; 32] = Sha256::digest(b"blob").into();

        let mut t = token(4, &hash);
        t[0] = 2;
        assert_eq!(
            lock.set(PRODUCTION, &mut arena, 0, &t),
            Err(LockError::VerificationFailed)
        );
    }

    #[test]
    fn tampered_signature_is_rejected() {
        let (mut arena, lock) = fixture();
        lock.set(FACTORY, &mut arena, 1, b"blob").unwrap();
        let hash: [u8; 32] = Sha256::digest(b"blob").into();

        let mut t = token(4, &hash);
        let last = t.len() - 1;
        t[last] ^= 1;
        assert_eq!(
            lock.set(PRODUCTION, &mut arena, 0, &t),
            Err(LockError::VerificationFailed)
        );
    }

    #[test]
    fn signature_over_the_wrong_nonce_is_rejected() {
        let (mut arena, lock) = fixture();
        lock.set(FACTORY, &mut arena, 1, b"blob").unwrap();
        let hash: [u8; 32] = Sha256::digest(b"blob").into();

        // Valid signature for nonce 4, token claims nonce 9.
        let mut t = token(4, &hash);
        t[1..9].copy_from_slice(&9u64.to_le_bytes());
        assert_eq!(
            lock.set(PRODUCTION, &mut arena, 0, &t),
            Err(LockError::VerificationFailed)
        );
    }

    #[test]
    fn truncated_token_is_rejected() {
        let (mut arena, lock) = fixture();
        lock.set(FACTORY, &mut arena, 1, b"blob").unwrap();
        assert_eq!(
            lock.set(PRODUCTION, &mut arena, 0, &[UNLOCK_TOKEN_VERSION; 9]),
            Err(LockError::VerificationFailed)
        );
        assert_eq!(
            lock.set(PRODUCTION, &mut arena, 0, &[]),
            Err(LockError::VerificationFailed)
        );
    }

    #[test]
    fn builtin_key_parses() {
        let _ = UnlockKey::builtin();
    }
}
