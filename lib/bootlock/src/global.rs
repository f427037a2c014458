// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Execution-mode tracking.
//!
//! Two independent facts gate every mutation in this engine: whether the
//! device is currently executing in the bootloader context (a
//! hardware-latched signal), and whether it has left manufacturing
//! ("production" mode). The bootloader signal comes from a [`BootSignal`]
//! source injected at construction so tests can substitute a fake latch;
//! production mode is a one-way transition with a single escape hatch
//! reserved for bootloader-context RMA flows.

use crate::LockError;

/// The bootloader latch could not be read.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct SignalError;

/// Source of the hardware-latched bootloader signal. Nonzero means the
/// device is executing in the bootloader context.
pub trait BootSignal {
    fn read(&self) -> Result<u8, SignalError>;
}

/// Mode snapshot handed to locks at dispatch time. Requests are
/// single-threaded and run to completion, so a snapshot taken at entry
/// is equivalent to live reads.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Modes {
    pub in_bootloader: bool,
    pub in_production: bool,
}

pub struct GlobalState<S> {
    signal: S,
    in_production: bool,
}

impl<S: BootSignal> GlobalState<S> {
    /// Constructed once at engine start. Devices come up in
    /// manufacturing mode; nothing here is ever serialized.
    pub fn new(signal: S) -> Self {
        Self {
            signal,
            in_production: false,
        }
    }

    /// The raw latch value, 0 if the read failed. Exposed for the state
    /// snapshot only; policy goes through [`Self::in_bootloader`].
    pub fn raw_signal(&self) -> u8 {
        self.signal.read().unwrap_or(0)
    }

    /// Whether we are executing in the bootloader context. A latch read
    /// failure reports false: fail closed, never fail open.
    pub fn in_bootloader(&self) -> bool {
        matches!(self.signal.read(), Ok(v) if v != 0)
    }

    pub fn in_production(&self) -> bool {
        self.in_production
    }

    /// Entering production is always permitted; leaving it only while in
    /// the bootloader context.
    pub fn set_production(&mut self, to: bool) -> Result<(), LockError> {
        if self.in_production && !to && !self.in_bootloader() {
            return Err(LockError::PolicyDenied);
        }
        self.in_production = to;
        Ok(())
    }

    pub fn modes(&self) -> Modes {
        Modes {
            in_bootloader: self.in_bootloader(),
            in_production: self.in_production,
        }
    }
}
