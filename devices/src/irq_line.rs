// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;

/// A level triggered interrupt line driven by a device backend.
///
/// The device asserts the line while it has work for the guest and deasserts it once the guest
/// has drained that work. Implementations forward the level to the VM's interrupt controller.
pub trait IrqLine: Send {
    fn set_level(&self, asserted: bool);
}

/// An `IrqLine` that only records its level, for interrupt controllers that poll device lines.
///
/// Clones share the same line.
#[derive(Clone, Debug, Default)]
pub struct IrqLevelState {
    asserted: Arc<AtomicBool>,
    raises: Arc<AtomicU64>,
}

impl IrqLevelState {
    pub fn new() -> IrqLevelState {
        Default::default()
    }

    pub fn is_asserted(&self) -> bool {
        self.asserted.load(Ordering::Acquire)
    }

    /// Number of low-to-high transitions seen so far.
    pub fn raise_count(&self) -> u64 {
        self.raises.load(Ordering::Acquire)
    }
}

impl IrqLine for IrqLevelState {
    fn set_level(&self, asserted: bool) {
        let was_asserted = self.asserted.swap(asserted, Ordering::AcqRel);
        if asserted && !was_asserted {
            self.raises.fetch_add(1, Ordering::AcqRel);
        }
    }
}
