// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Trace ring for instrumenting the lock storage engine.
//!
//! This is a fixed-capacity ring of `Copy + PartialEq` event entries,
//! designed to be embedded in a server struct and inspected from a
//! debugger or a diagnostic dump. Each entry records the source line that
//! generated it, a generation counter for the slot, and a repeat count:
//! recording the same event from the same line as the most recent entry
//! bumps the count instead of consuming a fresh slot, so a tight retry
//! loop doesn't evict the interesting history around it.
//!
//! Use the [`trace!`] macro rather than calling [`TraceBuf::record`]
//! directly; it captures `line!()` for you:
//!
//! ```ignore
//! trace!(self.trace, Trace::SetLock(index));
//! ```

#![cfg_attr(not(test), no_std)]

/// One slot in a [`TraceBuf`].
#[derive(Debug, Copy, Clone)]
pub struct TraceEntry<T: Copy + PartialEq> {
    pub line: u16,
    pub generation: u16,
    pub count: u32,
    pub payload: T,
}

/// Fixed-capacity event ring. `N` is the slot count; the initial payload
/// fills unused slots and is what repeat-coalescing compares against, so
/// pick a dedicated "nothing happened" variant for it.
#[derive(Debug)]
pub struct TraceBuf<T: Copy + PartialEq, const N: usize> {
    last: Option<usize>,
    entries: [TraceEntry<T>; N],
}

/// Records `payload` into the given [`TraceBuf`], stamping the current
/// source line.
#[macro_export]
macro_rules! trace {
    ($buf:expr, $payload:expr) => {
        $crate::TraceBuf::record(&mut $buf, line!() as u16, $payload)
    };
}

impl<T: Copy + PartialEq, const N: usize> TraceBuf<T, N> {
    pub const fn new(fill: T) -> Self {
        Self {
            last: None,
            entries: [TraceEntry {
                line: 0,
                generation: 0,
                count: 0,
                payload: fill,
            }; N],
        }
    }

    /// Deposits an entry, coalescing with the most recent one when both
    /// the line and the payload match and the count has headroom.
    pub fn record(&mut self, line: u16, payload: T) {
        // An untouched ring has no last index; treating that as
        // out-of-range makes the get_mut below skip coalescing and the
        // wrapping advance land on slot 0.
        let last = self.last.unwrap_or(usize::MAX);

        if let Some(ent) = self.entries.get_mut(last) {
            if ent.line == line && ent.payload == payload {
                if let Some(bumped) = ent.count.checked_add(1) {
                    ent.count = bumped;
                    return;
                }
            }
        }

        let ndx = {
            let next = last.wrapping_add(1);
            // Not a remainder: the targets this runs on lack hardware
            // divide, and wrapping usize::MAX to 0 handles the first
            // insertion without a special case.
            if next >= N {
                0
            } else {
                next
            }
        };

        let ent = &mut self.entries[ndx];
        *ent = TraceEntry {
            line,
            payload,
            count: 1,
            generation: ent.generation.wrapping_add(1),
        };
        self.last = Some(ndx);
    }

    /// Entries in ring order, oldest slot first. Unused slots still carry
    /// the fill payload with a zero count.
    pub fn entries(&self) -> &[TraceEntry<T>; N] {
        &self.entries
    }

    /// The most recently recorded entry, if anything has been recorded.
    pub fn latest(&self) -> Option<&TraceEntry<T>> {
        self.entries.get(self.last?)
    }
}
