// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Power-loss-atomic write journal.
//!
//! Every multi-byte state transition that must never be observed
//! half-written goes through here. The journal is a single-record redo
//! log: a transaction stages the new contents of one contiguous region
//! (seeded from the current contents, so partial updates overlay the
//! pre-image), then commit raises the committed flag before the bytes
//! are copied into the backing region. On resume after an interruption,
//! [`Journal::recover_into`] re-applies a committed record and discards
//! an uncommitted one, so the persisted state is exactly the pre-write
//! state or exactly the post-write state, never a mix.
//!
//! There is exactly one record in flight at a time; the execution model
//! is run-to-completion, so nesting cannot arise.

/// Upper bound on one atomic record. Must cover the largest lock span
/// (lock byte plus metadata capacity).
pub const MAX_RECORD: usize = 256;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum State {
    Idle,
    /// Record staged, commit flag not yet raised. Lost on interruption.
    Staged,
    /// Commit flag raised, bytes not yet (fully) applied. Re-applied on
    /// recovery.
    Committed,
}

pub struct Journal {
    state: State,
    offset: usize,
    len: usize,
    data: [u8; MAX_RECORD],
}

impl Journal {
    pub(crate) const fn new() -> Self {
        Self {
            state: State::Idle,
            offset: 0,
            len: 0,
            data: [0; MAX_RECORD],
        }
    }

    /// Opens a record over `backing[offset..offset + len]`, seeding the
    /// staged image from the current contents.
    pub(crate) fn begin(&mut self, offset: usize, len: usize, backing: &[u8]) {
        assert!(self.state == State::Idle);
        assert!(len <= MAX_RECORD);
        self.offset = offset;
        self.len = len;
        self.data[..len].copy_from_slice(&backing[offset..offset + len]);
        self.state = State::Staged;
    }

    pub(crate) fn stage(&mut self, rel: usize, bytes: &[u8]) {
        assert!(self.state == State::Staged);
        self.data[rel..rel + bytes.len()].copy_from_slice(bytes);
    }

    pub(crate) fn stage_zero(&mut self, rel: usize, len: usize) {
        assert!(self.state == State::Staged);
        self.data[rel..rel + len].fill(0);
    }

    /// Raises the commit flag and applies the record. Split into two
    /// steps so recovery after an interruption between them re-applies
    /// rather than discards.
    pub(crate) fn commit_into(&mut self, backing: &mut [u8]) {
        self.mark_committed();
        self.apply(backing);
    }

    pub(crate) fn abort(&mut self) {
        if self.state == State::Staged {
            self.state = State::Idle;
        }
    }

    /// Resolves whatever the journal holds after a reset: a committed
    /// record is applied (applying is idempotent), an uncommitted one
    /// is discarded.
    pub(crate) fn recover_into(&mut self, backing: &mut [u8]) {
        match self.state {
            State::Idle => {}
            State::Staged => self.state = State::Idle,
            State::Committed => self.apply(backing),
        }
    }

    fn mark_committed(&mut self) {
        assert!(self.state == State::Staged);
        self.state = State::Committed;
    }

    fn apply(&mut self, backing: &mut [u8]) {
        assert!(self.state == State::Committed);
        backing[self.offset..self.offset + self.len]
            .copy_from_slice(&self.data[..self.len]);
        self.state = State::Idle;
    }
}
