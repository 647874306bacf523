// Copyright 2017 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Track memory regions that are mapped to the guest VM.

use std::ops::Range;
use std::result;
use std::sync::Arc;
use std::sync::MutexGuard;

use remain::sorted;
use sync::Mutex;
use thiserror::Error;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;

use crate::guest_address::GuestAddress;

#[sorted]
#[derive(Error, Debug, PartialEq, Eq)]
pub enum Error {
    #[error("invalid guest address {0}")]
    InvalidGuestAddress(GuestAddress),
    #[error("range {0}+{1:#x} is not backed by a single memory region")]
    InvalidRange(GuestAddress, u64),
    #[error("memory regions overlap")]
    MemoryRegionOverlap,
    #[error("memory region size {0:#x} is invalid")]
    MemoryRegionSize(u64),
    #[error("mapping at {0} is read-only")]
    ReadOnlyMapping(GuestAddress),
    #[error("incomplete read of {completed} instead of {expected} bytes")]
    ShortRead { expected: usize, completed: usize },
    #[error("incomplete write of {completed} instead of {expected} bytes")]
    ShortWrite { expected: usize, completed: usize },
}
pub type Result<T> = result::Result<T, Error>;

/// A region of guest RAM and where it is placed in the guest physical address space.
struct MemoryRegion {
    guest_base: GuestAddress,
    size: u64,
    mem: Mutex<Box<[u8]>>,
}

impl MemoryRegion {
    fn start(&self) -> GuestAddress {
        self.guest_base
    }

    fn end(&self) -> GuestAddress {
        // unchecked_add is safe as the region bounds were checked when it was created.
        self.guest_base.unchecked_add(self.size)
    }

    fn contains(&self, addr: GuestAddress) -> bool {
        addr >= self.start() && addr < self.end()
    }
}

/// Whether a mapping may be written through.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Access {
    Read,
    Write,
}

/// Tracks memory regions and where they are mapped in the guest.
///
/// Cloning is cheap: every clone refers to the same backing memory.
#[derive(Clone)]
pub struct GuestMemory {
    regions: Arc<[MemoryRegion]>,
}

impl GuestMemory {
    /// Creates a container for guest memory regions.
    /// Valid memory regions are specified as a Vec of (Address, Size) tuples sorted by Address.
    pub fn new(ranges: &[(GuestAddress, u64)]) -> Result<GuestMemory> {
        let mut regions = Vec::<MemoryRegion>::new();

        for &(base, size) in ranges {
            if size == 0 || usize::try_from(size).is_err() || base.checked_add(size).is_none() {
                return Err(Error::MemoryRegionSize(size));
            }
            if let Some(last) = regions.last() {
                if last.end() > base {
                    return Err(Error::MemoryRegionOverlap);
                }
            }
            regions.push(MemoryRegion {
                guest_base: base,
                size,
                mem: Mutex::new(vec![0u8; size as usize].into_boxed_slice()),
            });
        }

        Ok(GuestMemory {
            regions: regions.into(),
        })
    }

    /// Returns the end address of memory.
    pub fn end_addr(&self) -> GuestAddress {
        self.regions
            .iter()
            .map(MemoryRegion::end)
            .max()
            .unwrap_or(GuestAddress(0))
    }

    /// Returns the total size of memory in bytes.
    pub fn memory_size(&self) -> u64 {
        self.regions.iter().map(|r| r.size).sum()
    }

    /// Returns true if the given address is within the memory range available to the guest.
    pub fn address_in_range(&self, addr: GuestAddress) -> bool {
        self.regions.iter().any(|r| r.contains(addr))
    }

    /// Returns the number of memory regions.
    pub fn num_regions(&self) -> u64 {
        self.regions.len() as u64
    }

    /// Finds the region holding all of `[addr, addr + len)` and the byte range within it.
    fn find_range(&self, addr: GuestAddress, len: u64) -> Result<(&MemoryRegion, Range<usize>)> {
        let region = self
            .regions
            .iter()
            .find(|r| r.contains(addr) || (len == 0 && r.end() == addr))
            .ok_or(Error::InvalidGuestAddress(addr))?;
        let end = addr
            .checked_add(len)
            .ok_or(Error::InvalidRange(addr, len))?;
        if end > region.end() {
            return Err(Error::InvalidRange(addr, len));
        }
        let start = addr.offset_from(region.start()) as usize;
        Ok((region, start..start + len as usize))
    }

    /// Maps `len` bytes starting at `addr` for direct access.
    ///
    /// The range has to be backed by a single region. The region stays locked until the returned
    /// mapping is dropped, so callers must not hold a mapping across unrelated work.
    pub fn map(&self, addr: GuestAddress, len: u64, access: Access) -> Result<GuestMapping> {
        let (region, range) = self.find_range(addr, len)?;
        Ok(GuestMapping {
            addr,
            access,
            range,
            guard: region.mem.lock(),
        })
    }

    /// Writes the entire contents of a slice to guest memory at the specified guest address.
    pub fn write_all_at_addr(&self, buf: &[u8], guest_addr: GuestAddress) -> Result<()> {
        let mut mapping = self
            .map(guest_addr, buf.len() as u64, Access::Write)
            .map_err(|_| Error::ShortWrite {
                expected: buf.len(),
                completed: 0,
            })?;
        mapping.as_mut_slice()?.copy_from_slice(buf);
        Ok(())
    }

    /// Reads from guest memory at the specified address to fill the entire buffer.
    pub fn read_exact_at_addr(&self, buf: &mut [u8], guest_addr: GuestAddress) -> Result<()> {
        let mapping = self
            .map(guest_addr, buf.len() as u64, Access::Read)
            .map_err(|_| Error::ShortRead {
                expected: buf.len(),
                completed: 0,
            })?;
        buf.copy_from_slice(mapping.as_slice());
        Ok(())
    }

    /// Reads an object from guest memory at the given guest address.
    pub fn read_obj_from_addr<T: FromBytes>(&self, guest_addr: GuestAddress) -> Result<T> {
        let mapping = self.map(guest_addr, std::mem::size_of::<T>() as u64, Access::Read)?;
        T::read_from_bytes(mapping.as_slice()).map_err(|_| Error::ShortRead {
            expected: std::mem::size_of::<T>(),
            completed: mapping.len(),
        })
    }

    /// Writes an object to the memory region at the specified guest address.
    pub fn write_obj_at_addr<T: IntoBytes + Immutable>(
        &self,
        val: T,
        guest_addr: GuestAddress,
    ) -> Result<()> {
        self.write_all_at_addr(val.as_bytes(), guest_addr)
    }
}

/// A window onto guest memory valid for the lifetime of the value.
///
/// Dropping the mapping releases the backing region.
pub struct GuestMapping<'a> {
    addr: GuestAddress,
    access: Access,
    range: Range<usize>,
    guard: MutexGuard<'a, Box<[u8]>>,
}

impl GuestMapping<'_> {
    /// Guest address of the first mapped byte.
    pub fn addr(&self) -> GuestAddress {
        self.addr
    }

    pub fn len(&self) -> usize {
        self.range.len()
    }

    pub fn is_empty(&self) -> bool {
        self.range.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.guard[self.range.clone()]
    }

    /// Returns the mapped bytes for writing, failing on mappings created with `Access::Read`.
    pub fn as_mut_slice(&mut self) -> Result<&mut [u8]> {
        if self.access != Access::Write {
            return Err(Error::ReadOnlyMapping(self.addr));
        }
        Ok(&mut self.guard[self.range.clone()])
    }
}

#[cfg(test)]
mod tests {
    use zerocopy::FromBytes;
    use zerocopy::Immutable;
    use zerocopy::IntoBytes;
    use zerocopy::KnownLayout;

    use super::*;

    #[test]
    fn test_alignment() {
        let start_addr1 = GuestAddress(0x0);
        let start_addr2 = GuestAddress(0x10000);

        assert!(GuestMemory::new(&[(start_addr1, 0x100), (start_addr2, 0x400)]).is_ok());
        assert_eq!(
            GuestMemory::new(&[(start_addr1, 0)]).err(),
            Some(Error::MemoryRegionSize(0))
        );
    }

    #[test]
    fn two_regions() {
        let start_addr1 = GuestAddress(0x0);
        let start_addr2 = GuestAddress(0x10000);
        let gm = GuestMemory::new(&[(start_addr1, 0x10000), (start_addr2, 0x10000)]).unwrap();
        assert_eq!(gm.num_regions(), 2);
        assert_eq!(gm.memory_size(), 0x20000);
        assert_eq!(gm.end_addr(), GuestAddress(0x20000));
    }

    #[test]
    fn overlap_memory() {
        let start_addr1 = GuestAddress(0x0);
        let start_addr2 = GuestAddress(0x10000);
        assert_eq!(
            GuestMemory::new(&[(start_addr1, 0x20000), (start_addr2, 0x20000)]).err(),
            Some(Error::MemoryRegionOverlap)
        );
    }

    #[test]
    fn region_hole() {
        let gm = GuestMemory::new(&[(GuestAddress(0x0), 0x1000), (GuestAddress(0x2000), 0x1000)])
            .unwrap();
        assert!(gm.address_in_range(GuestAddress(0xfff)));
        assert!(!gm.address_in_range(GuestAddress(0x1000)));
        assert!(gm.address_in_range(GuestAddress(0x2000)));
        assert!(!gm.address_in_range(GuestAddress(0x3000)));
    }

    #[test]
    fn mapping_must_fit_in_one_region() {
        let gm = GuestMemory::new(&[(GuestAddress(0x0), 0x1000), (GuestAddress(0x1000), 0x1000)])
            .unwrap();
        assert!(gm.map(GuestAddress(0x800), 0x800, Access::Read).is_ok());
        assert_eq!(
            gm.map(GuestAddress(0x800), 0x801, Access::Read).err(),
            Some(Error::InvalidRange(GuestAddress(0x800), 0x801))
        );
        assert_eq!(
            gm.map(GuestAddress(0x5000), 1, Access::Read).err(),
            Some(Error::InvalidGuestAddress(GuestAddress(0x5000)))
        );
        // An empty mapping at the very end of a region is still inside it.
        assert!(gm.map(GuestAddress(0x2000), 0, Access::Read).is_ok());
    }

    #[test]
    fn read_only_mapping() {
        let gm = GuestMemory::new(&[(GuestAddress(0x0), 0x1000)]).unwrap();
        let mut mapping = gm.map(GuestAddress(0x10), 4, Access::Read).unwrap();
        assert_eq!(
            mapping.as_mut_slice().err(),
            Some(Error::ReadOnlyMapping(GuestAddress(0x10)))
        );
    }

    #[test]
    fn mapping_released_on_drop() {
        let gm = GuestMemory::new(&[(GuestAddress(0x0), 0x1000)]).unwrap();
        {
            let mut mapping = gm.map(GuestAddress(0x100), 3, Access::Write).unwrap();
            mapping.as_mut_slice().unwrap().copy_from_slice(b"abc");
        }
        let mut buf = [0u8; 3];
        gm.read_exact_at_addr(&mut buf, GuestAddress(0x100)).unwrap();
        assert_eq!(&buf, b"abc");
    }

    #[derive(Copy, Clone, Debug, Default, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
    #[repr(C)]
    struct Pair {
        a: u32,
        b: u32,
    }

    #[test]
    fn obj_round_trip() {
        let gm = GuestMemory::new(&[(GuestAddress(0x1000), 0x1000)]).unwrap();
        let val = Pair { a: 7, b: 0xdead };
        gm.write_obj_at_addr(val, GuestAddress(0x1ff8)).unwrap();
        assert_eq!(gm.read_obj_from_addr::<Pair>(GuestAddress(0x1ff8)).unwrap(), val);
        assert!(gm.read_obj_from_addr::<Pair>(GuestAddress(0x1ffc)).is_err());
    }
}
