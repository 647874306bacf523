// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Turns the guest's (address, size) pairs into host-accessible windows on guest RAM.

use remain::sorted;
use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;
use vm_memory::Access;
use vm_memory::GuestAddress;
use vm_memory::GuestMapping;
use vm_memory::GuestMemory;
use vm_memory::GuestMemoryError;

pub const GUEST_PAGE_SIZE: u64 = 4096;

/// How buffer addresses written by the guest are interpreted.
///
/// Devices start out in `Virtual` mode. The first read of the version register moves them to
/// `Physical` for good.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum AddressMode {
    Virtual,
    Physical,
}

/// Resolves guest virtual addresses through the current guest page tables.
pub trait PageTranslator: Send {
    /// Returns the guest physical address backing the byte at `va`.
    fn translate(&self, va: u64) -> Option<GuestAddress>;
}

#[sorted]
#[derive(Error, Debug, PartialEq, Eq)]
pub enum MapError {
    #[error("guest buffer is not backed by RAM: {0}")]
    GuestMemory(GuestMemoryError),
    #[error("virtual buffer {addr:#x}+{size:#x} is not physically contiguous")]
    NonContiguous { addr: u64, size: u64 },
    #[error("virtual address {0:#x} cannot be translated without a page translator")]
    NoTranslator(u64),
    #[error("virtual address {0:#x} is not mapped in the guest")]
    Unmapped(u64),
}

pub type Result<T> = std::result::Result<T, MapError>;

/// Maps guest buffers for the duration of a single pipe command.
pub struct GuestBufferMapper {
    mem: GuestMemory,
    translator: Option<Box<dyn PageTranslator>>,
}

impl GuestBufferMapper {
    pub fn new(mem: GuestMemory) -> GuestBufferMapper {
        GuestBufferMapper {
            mem,
            translator: None,
        }
    }

    /// Creates a mapper that can also serve guests still using virtual buffer addresses.
    pub fn with_translator(
        mem: GuestMemory,
        translator: Box<dyn PageTranslator>,
    ) -> GuestBufferMapper {
        GuestBufferMapper {
            mem,
            translator: Some(translator),
        }
    }

    pub fn memory(&self) -> &GuestMemory {
        &self.mem
    }

    /// Returns the guest physical address of a `size` byte buffer at `addr`.
    ///
    /// In virtual mode every page the buffer touches must translate, and the translated pages must
    /// follow each other in physical memory.
    pub fn translate(&self, mode: AddressMode, addr: u64, size: u64) -> Result<GuestAddress> {
        if mode == AddressMode::Physical {
            return Ok(GuestAddress(addr));
        }
        let translator = self
            .translator
            .as_ref()
            .ok_or(MapError::NoTranslator(addr))?;
        let start = translator.translate(addr).ok_or(MapError::Unmapped(addr))?;
        if size == 0 {
            return Ok(start);
        }

        let last = addr
            .checked_add(size - 1)
            .ok_or(MapError::NonContiguous { addr, size })?;
        let mut page = (addr & !(GUEST_PAGE_SIZE - 1)) + GUEST_PAGE_SIZE;
        while page <= last {
            let pa = translator.translate(page).ok_or(MapError::Unmapped(page))?;
            if start.checked_add(page - addr) != Some(pa) {
                return Err(MapError::NonContiguous { addr, size });
            }
            page = match page.checked_add(GUEST_PAGE_SIZE) {
                Some(next) => next,
                None => break,
            };
        }
        Ok(start)
    }

    /// Maps exactly `size` bytes of the guest buffer at `addr`.
    pub fn map(
        &self,
        mode: AddressMode,
        addr: u64,
        size: u64,
        access: Access,
    ) -> Result<GuestMapping> {
        let pa = self.translate(mode, addr, size)?;
        self.mem.map(pa, size, access).map_err(MapError::GuestMemory)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;

    /// Page table keyed by virtual page number.
    struct PageTable(BTreeMap<u64, u64>);

    impl PageTranslator for PageTable {
        fn translate(&self, va: u64) -> Option<GuestAddress> {
            let pfn = self.0.get(&(va / GUEST_PAGE_SIZE))?;
            Some(GuestAddress(pfn * GUEST_PAGE_SIZE + va % GUEST_PAGE_SIZE))
        }
    }

    fn mapper(pages: &[(u64, u64)]) -> GuestBufferMapper {
        let mem = GuestMemory::new(&[(GuestAddress(0), 0x10000)]).unwrap();
        GuestBufferMapper::with_translator(mem, Box::new(PageTable(pages.iter().copied().collect())))
    }

    #[test]
    fn physical_addresses_are_used_directly() {
        let mapper = mapper(&[]);
        mapper
            .memory()
            .write_all_at_addr(b"hello", GuestAddress(0x2ffe))
            .unwrap();
        let mapping = mapper
            .map(AddressMode::Physical, 0x2ffe, 5, Access::Read)
            .unwrap();
        assert_eq!(mapping.as_slice(), b"hello");
    }

    #[test]
    fn physical_out_of_range() {
        let mapper = mapper(&[]);
        assert!(matches!(
            mapper.map(AddressMode::Physical, 0xfff0, 0x20, Access::Write),
            Err(MapError::GuestMemory(_))
        ));
        assert!(matches!(
            mapper.map(AddressMode::Physical, 0x20000, 1, Access::Read),
            Err(MapError::GuestMemory(_))
        ));
    }

    #[test]
    fn zero_length_mapping() {
        let mapper = mapper(&[(8, 3)]);
        assert!(mapper
            .map(AddressMode::Physical, 0x10000, 0, Access::Read)
            .unwrap()
            .is_empty());
        assert_eq!(
            mapper.translate(AddressMode::Virtual, 0x8010, 0),
            Ok(GuestAddress(0x3010))
        );
    }

    #[test]
    fn virtual_contiguous_pages() {
        let mapper = mapper(&[(8, 3), (9, 4), (10, 5)]);
        assert_eq!(
            mapper.translate(AddressMode::Virtual, 0x8800, 0x2000),
            Ok(GuestAddress(0x3800))
        );
        let mut mapping = mapper
            .map(AddressMode::Virtual, 0x8ffc, 8, Access::Write)
            .unwrap();
        mapping.as_mut_slice().unwrap().copy_from_slice(b"01234567");
        drop(mapping);

        let mut out = [0u8; 8];
        mapper
            .memory()
            .read_exact_at_addr(&mut out, GuestAddress(0x3ffc))
            .unwrap();
        assert_eq!(&out, b"01234567");
    }

    #[test]
    fn virtual_discontiguous_pages() {
        let mapper = mapper(&[(8, 3), (9, 7)]);
        assert_eq!(
            mapper.translate(AddressMode::Virtual, 0x8ff0, 0x20),
            Err(MapError::NonContiguous {
                addr: 0x8ff0,
                size: 0x20
            })
        );
        // Staying inside one page never needs the second translation.
        assert!(mapper
            .map(AddressMode::Virtual, 0x8f00, 0x100, Access::Read)
            .is_ok());
    }

    #[test]
    fn virtual_unmapped_page() {
        let mapper = mapper(&[(8, 3)]);
        assert_eq!(
            mapper.translate(AddressMode::Virtual, 0x8ff0, 0x20),
            Err(MapError::Unmapped(0x9000))
        );
        assert_eq!(
            mapper.translate(AddressMode::Virtual, 0x1000, 1),
            Err(MapError::Unmapped(0x1000))
        );
    }

    #[test]
    fn virtual_without_translator() {
        let mem = GuestMemory::new(&[(GuestAddress(0), 0x1000)]).unwrap();
        let mapper = GuestBufferMapper::new(mem);
        assert_eq!(
            mapper.translate(AddressMode::Virtual, 0x10, 4),
            Err(MapError::NoTranslator(0x10))
        );
    }
}
