// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The shared persistent byte region.
//!
//! The arena owns the single fixed-size backing buffer behind all lock
//! state. Storage is handed out once, at configuration time, as disjoint
//! [`Span`] handles claimed in declaration order; a lock holds only its
//! handle, never a reference into the buffer, so ownership and bounds
//! stay explicit. All mutation goes through journal-backed
//! [`Transaction`]s (see [`crate::journal`]).

use crate::journal::{Journal, MAX_RECORD};
use crate::LockError;

/// Size of the backing buffer shared by every configured lock.
pub const BACKING_LEN: usize = 4096;

/// An (offset, length) handle to a claimed sub-range of the arena.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Span {
    offset: usize,
    len: usize,
}

impl Span {
    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// A sub-range of this span, relative to its start.
    pub fn sub(&self, rel: usize, len: usize) -> Span {
        assert!(rel + len <= self.len);
        Span {
            offset: self.offset + rel,
            len,
        }
    }
}

pub struct Arena {
    buf: [u8; BACKING_LEN],
    next_free: usize,
    journal: Journal,
}

impl Default for Arena {
    fn default() -> Self {
        Self::new()
    }
}

impl Arena {
    /// A freshly provisioned arena: zero-filled, nothing claimed.
    pub fn new() -> Self {
        Self {
            buf: [0; BACKING_LEN],
            next_free: 0,
            journal: Journal::new(),
        }
    }

    /// Claims the next `len` free bytes. Claims are never returned or
    /// reassigned; running out is a configuration-time fatal error.
    pub fn claim(&mut self, len: usize) -> Result<Span, LockError> {
        let end = self
            .next_free
            .checked_add(len)
            .ok_or(LockError::StorageOverflow)?;
        if end > BACKING_LEN {
            return Err(LockError::StorageOverflow);
        }
        let span = Span {
            offset: self.next_free,
            len,
        };
        self.next_free = end;
        Ok(span)
    }

    pub fn bytes(&self, span: Span) -> &[u8] {
        &self.buf[span.offset..span.offset + span.len]
    }

    /// The whole backing buffer, for the state snapshot and diagnostics.
    pub fn raw(&self) -> &[u8] {
        &self.buf
    }

    /// Zero-fills the entire backing buffer. Claim assignments are
    /// permanent and survive this.
    pub fn fill_zero(&mut self) {
        self.buf.fill(0);
    }

    /// Opens an all-or-nothing write over `span`. Spans are bounded by
    /// [`MAX_RECORD`] at claim time, enforced again here.
    pub fn transaction(&mut self, span: Span) -> Transaction<'_> {
        assert!(span.len <= MAX_RECORD);
        assert!(span.offset + span.len <= self.next_free);
        self.journal.begin(span.offset, span.len, &self.buf);
        Transaction {
            buf: &mut self.buf,
            journal: &mut self.journal,
        }
    }

    /// Resolves an interrupted transaction after a reset; see
    /// [`Journal::recover_into`].
    pub fn recover(&mut self) {
        self.journal.recover_into(&mut self.buf);
    }
}

/// Scoped all-or-nothing write. Sub-writes overlay the span's current
/// contents; nothing reaches the backing buffer until [`commit`].
/// Dropping without committing discards every staged byte.
///
/// [`commit`]: Transaction::commit
pub struct Transaction<'a> {
    buf: &'a mut [u8; BACKING_LEN],
    journal: &'a mut Journal,
}

impl Transaction<'_> {
    /// Stages `bytes` at `rel` bytes past the span start.
    pub fn write(&mut self, rel: usize, bytes: &[u8]) {
        self.journal.stage(rel, bytes);
    }

    /// Stages zeros over `len` bytes at `rel`.
    pub fn fill_zero(&mut self, rel: usize, len: usize) {
        self.journal.stage_zero(rel, len);
    }

    pub fn commit(self) {
        self.journal.commit_into(self.buf);
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        // No-op after commit; discards a record left staged.
        self.journal.abort();
    }
}
