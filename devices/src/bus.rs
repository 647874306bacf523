// Copyright 2017 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Handles routing to devices in an address space.

use std::cmp::Ord;
use std::cmp::Ordering;
use std::cmp::PartialEq;
use std::cmp::PartialOrd;
use std::collections::BTreeMap;
use std::fmt;
use std::result;
use std::sync::Arc;

use base::debug;
use remain::sorted;
use sync::Mutex;
use thiserror::Error;

use crate::Suspendable;

/// Information about how a device was accessed.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct BusAccessInfo {
    /// Offset from base address that the device was accessed at.
    pub offset: u64,
    /// Absolute address of the device's access in its address space.
    pub address: u64,
}

impl std::fmt::Display for BusAccessInfo {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Trait for devices that respond to reads or writes in an arbitrary address space.
///
/// The device does not care where it exists in address space as each method is only given an offset
/// into its allocated portion of address space.
#[allow(unused_variables)]
pub trait BusDevice: Send + Suspendable {
    /// Returns a label suitable for debug output.
    fn debug_label(&self) -> String;
    /// Reads at `offset` from this device
    fn read(&mut self, offset: BusAccessInfo, data: &mut [u8]) {}
    /// Writes at `offset` into this device
    fn write(&mut self, offset: BusAccessInfo, data: &[u8]) {}
    /// Invoked when the VM is reset.
    fn reset(&mut self) {}
}

#[sorted]
#[derive(Error, Debug)]
pub enum Error {
    #[error("device range at {0:#x} is empty")]
    EmptyRange(u64),
    /// The insertion failed because the new device overlapped with an old device.
    #[error("new device {base:#x},{len:#x} overlaps with an old device {other_base:#x},{other_len:#x}")]
    Overlap {
        base: u64,
        len: u64,
        other_base: u64,
        other_len: u64,
    },
}

pub type Result<T> = result::Result<T, Error>;

/// Holds a base and length representing the address space occupied by a `BusDevice`.
///
/// * base - The address at which the range start.
/// * len - The length of the range in bytes.
#[derive(Copy, Clone, Debug)]
struct BusRange {
    base: u64,
    len: u64,
}

impl BusRange {
    /// Returns true if `addr` is within the range.
    fn contains(&self, addr: u64) -> bool {
        self.base <= addr && addr < self.base.saturating_add(self.len)
    }

    /// Returns true if there is overlap with the given range.
    fn overlaps(&self, base: u64, len: u64) -> bool {
        self.base < base.saturating_add(len) && base < self.base.saturating_add(self.len)
    }
}

impl Eq for BusRange {}

impl PartialEq for BusRange {
    fn eq(&self, other: &BusRange) -> bool {
        self.base == other.base
    }
}

impl Ord for BusRange {
    fn cmp(&self, other: &BusRange) -> Ordering {
        self.base.cmp(&other.base)
    }
}

impl PartialOrd for BusRange {
    fn partial_cmp(&self, other: &BusRange) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// A device container for routing reads and writes over some address space.
///
/// This doesn't have any restrictions on what kind of device or address space this applies to. The
/// only restriction is that no two devices can overlap in this address space.
#[derive(Clone, Default)]
pub struct Bus {
    devices: Arc<Mutex<BTreeMap<BusRange, Arc<Mutex<dyn BusDevice>>>>>,
}

impl Bus {
    /// Constructs an a bus with an empty address space.
    pub fn new() -> Bus {
        Default::default()
    }

    fn get_device(&self, addr: u64) -> Option<(u64, Arc<Mutex<dyn BusDevice>>)> {
        let devices = self.devices.lock();
        let (range, dev) = devices
            .range(..=BusRange { base: addr, len: 1 })
            .next_back()?;
        if range.contains(addr) {
            Some((addr - range.base, dev.clone()))
        } else {
            None
        }
    }

    /// Puts the given device at the given address space.
    pub fn insert(&self, device: Arc<Mutex<dyn BusDevice>>, base: u64, len: u64) -> Result<()> {
        if len == 0 {
            return Err(Error::EmptyRange(base));
        }

        // Reject all cases where the new device's range overlaps with an existing device.
        let mut devices = self.devices.lock();
        devices.keys().try_for_each(|range| {
            if range.overlaps(base, len) {
                Err(Error::Overlap {
                    base,
                    len,
                    other_base: range.base,
                    other_len: range.len,
                })
            } else {
                Ok(())
            }
        })?;

        debug!(
            "bus: inserting {} at {:#x}+{:#x}",
            device.lock().debug_label(),
            base,
            len
        );
        devices.insert(BusRange { base, len }, device);
        Ok(())
    }

    /// Reads data from the device that owns the range containing `addr` and puts it into `data`.
    ///
    /// Returns true on success, otherwise `data` is untouched.
    pub fn read(&self, addr: u64, data: &mut [u8]) -> bool {
        match self.get_device(addr) {
            Some((offset, dev)) => {
                let io = BusAccessInfo {
                    address: addr,
                    offset,
                };
                dev.lock().read(io, data);
                true
            }
            None => false,
        }
    }

    /// Writes `data` to the device that owns the range containing `addr`.
    ///
    /// Returns true on success, otherwise `data` is untouched.
    pub fn write(&self, addr: u64, data: &[u8]) -> bool {
        match self.get_device(addr) {
            Some((offset, dev)) => {
                let io = BusAccessInfo {
                    address: addr,
                    offset,
                };
                dev.lock().write(io, data);
                true
            }
            None => false,
        }
    }

    /// Resets every device on the bus.
    pub fn reset_devices(&self) {
        let devices: Vec<_> = self.devices.lock().values().cloned().collect();
        for dev in devices {
            dev.lock().reset();
        }
    }
}
