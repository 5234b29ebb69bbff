//! # Physical Memory Access
//!
//! The memory services manage memory they do not own: pool headers, free
//! block markers and zeroed pages are written through a [`PhysMemory`]
//! implementation rather than through language pointers.
//!
//! - [`IdentityMemory`] is used on firmware, where physical memory is identity
//!   mapped and every tracked address can be dereferenced directly.
//! - [`TestRam`] backs host tests. Pages are materialized lazily on first
//!   write, so maps describing gigabytes of RAM cost only the pages touched.
//!
//! All accessors take `&self`; writes go through interior mutability because
//! the memory being written is not part of any Rust object.

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use core::cell::RefCell;
use fw_memory_addresses::{PAGE_SIZE, PhysicalAddress};

/// Access to physical memory at explicit addresses.
///
/// Word accessors are only used on naturally aligned addresses.
pub trait PhysMemory {
    fn read_u32(&self, addr: PhysicalAddress) -> u32;
    fn write_u32(&self, addr: PhysicalAddress, value: u32);
    fn read_u64(&self, addr: PhysicalAddress) -> u64;
    fn write_u64(&self, addr: PhysicalAddress, value: u64);

    /// Sets `len` bytes starting at `addr` to `byte`.
    fn fill(&self, addr: PhysicalAddress, len: u64, byte: u8);
}

/// [`PhysMemory`] for identity mapped firmware address spaces.
pub struct IdentityMemory {
    _private: (),
}

#[allow(unsafe_code)]
impl IdentityMemory {
    /// # Safety
    /// Every address handed to the memory services must be mapped one to one
    /// and writable for as long as the services run.
    #[must_use]
    pub const unsafe fn new() -> Self {
        Self { _private: () }
    }

    #[allow(clippy::cast_possible_truncation)]
    const fn ptr<T>(addr: PhysicalAddress) -> *mut T {
        addr.as_u64() as usize as *mut T
    }
}

#[allow(unsafe_code)]
impl PhysMemory for IdentityMemory {
    fn read_u32(&self, addr: PhysicalAddress) -> u32 {
        // SAFETY: guaranteed by the contract of `IdentityMemory::new`.
        unsafe { Self::ptr::<u32>(addr).read_volatile() }
    }

    fn write_u32(&self, addr: PhysicalAddress, value: u32) {
        // SAFETY: guaranteed by the contract of `IdentityMemory::new`.
        unsafe { Self::ptr::<u32>(addr).write_volatile(value) }
    }

    fn read_u64(&self, addr: PhysicalAddress) -> u64 {
        // SAFETY: guaranteed by the contract of `IdentityMemory::new`.
        unsafe { Self::ptr::<u64>(addr).read_volatile() }
    }

    fn write_u64(&self, addr: PhysicalAddress, value: u64) {
        // SAFETY: guaranteed by the contract of `IdentityMemory::new`.
        unsafe { Self::ptr::<u64>(addr).write_volatile(value) }
    }

    #[allow(clippy::cast_possible_truncation)]
    fn fill(&self, addr: PhysicalAddress, len: u64, byte: u8) {
        // SAFETY: guaranteed by the contract of `IdentityMemory::new`.
        unsafe { core::ptr::write_bytes(Self::ptr::<u8>(addr), byte, len as usize) }
    }
}

type Page = Box<[u8; PAGE_SIZE as usize]>;

/// Sparse RAM image for host tests.
///
/// Unwritten memory reads as zero.
#[derive(Default)]
pub struct TestRam {
    pages: RefCell<BTreeMap<u64, Page>>,
}

impl TestRam {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of pages that were written at least once.
    #[must_use]
    pub fn touched_pages(&self) -> usize {
        self.pages.borrow().len()
    }

    /// Reads a single byte.
    #[must_use]
    pub fn read_u8(&self, addr: PhysicalAddress) -> u8 {
        let (page, offset) = Self::split(addr);
        self.pages.borrow().get(&page).map_or(0, |p| p[offset])
    }

    #[allow(clippy::cast_possible_truncation)]
    const fn split(addr: PhysicalAddress) -> (u64, usize) {
        (
            addr.as_u64() / PAGE_SIZE,
            (addr.as_u64() % PAGE_SIZE) as usize,
        )
    }

    fn read<const N: usize>(&self, addr: PhysicalAddress) -> [u8; N] {
        let (page, offset) = Self::split(addr);
        let mut out = [0u8; N];
        if let Some(p) = self.pages.borrow().get(&page) {
            out.copy_from_slice(&p[offset..offset + N]);
        }
        out
    }

    fn write(&self, addr: PhysicalAddress, bytes: &[u8]) {
        let (page, offset) = Self::split(addr);
        let mut pages = self.pages.borrow_mut();
        let p = pages
            .entry(page)
            .or_insert_with(|| Box::new([0u8; PAGE_SIZE as usize]));
        p[offset..offset + bytes.len()].copy_from_slice(bytes);
    }
}

impl PhysMemory for TestRam {
    fn read_u32(&self, addr: PhysicalAddress) -> u32 {
        u32::from_le_bytes(self.read::<4>(addr))
    }

    fn write_u32(&self, addr: PhysicalAddress, value: u32) {
        self.write(addr, &value.to_le_bytes());
    }

    fn read_u64(&self, addr: PhysicalAddress) -> u64 {
        u64::from_le_bytes(self.read::<8>(addr))
    }

    fn write_u64(&self, addr: PhysicalAddress, value: u64) {
        self.write(addr, &value.to_le_bytes());
    }

    #[allow(clippy::cast_possible_truncation)]
    fn fill(&self, addr: PhysicalAddress, len: u64, byte: u8) {
        let mut cursor = addr.as_u64();
        let end = cursor + len;
        while cursor < end {
            let in_page = PAGE_SIZE - cursor % PAGE_SIZE;
            let chunk = in_page.min(end - cursor);
            // Untouched pages already read as zero.
            if byte != 0 || self.pages.borrow().contains_key(&(cursor / PAGE_SIZE)) {
                let (page, offset) = Self::split(PhysicalAddress::new(cursor));
                let mut pages = self.pages.borrow_mut();
                let p = pages
                    .entry(page)
                    .or_insert_with(|| Box::new([0u8; PAGE_SIZE as usize]));
                p[offset..offset + chunk as usize].fill(byte);
            }
            cursor += chunk;
        }
    }
}
