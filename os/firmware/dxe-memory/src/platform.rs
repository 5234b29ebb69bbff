//! # Platform Collaborators
//!
//! Services the memory manager consumes but does not implement:
//!
//! * [`PageProtection`]: the CPU service that changes page table permissions.
//!   Used only to arm and disarm guard pages.
//! * [`ResourcePool`]: the address space resource map. Reports regions that
//!   are not tracked as allocatable memory and promotes untested memory.
//! * [`AllocationEventSink`]: optional profiling hook.
//! * [`MemoryMapListener`]: change notification fired after every map
//!   mutation.
//!
//! [`PageAllocator`] is the reverse direction: the page API handed to the
//! protection backend so it can allocate page tables while it runs.

use crate::error::{MemoryError, ProtectionError};
use alloc::vec::Vec;
use core::panic::Location;
use fw_memory_addresses::PhysicalAddress;
use uefi::mem::memory_map::{MemoryAttribute, MemoryType};

/// Page services available while the protection backend runs.
///
/// Allocations made through this interface are never guarded.
pub trait PageAllocator {
    /// Allocates `pages` pages of `memory_type` anywhere.
    ///
    /// # Errors
    /// Any error of the page allocation path.
    fn allocate_pages(
        &self,
        memory_type: MemoryType,
        pages: u64,
    ) -> Result<PhysicalAddress, MemoryError>;

    /// Returns pages obtained from [`allocate_pages`](Self::allocate_pages).
    ///
    /// # Errors
    /// Any error of the page free path.
    fn free_pages(&self, base: PhysicalAddress, pages: u64) -> Result<(), MemoryError>;
}

/// Changes the mapping of single pages.
pub trait PageProtection {
    /// Unmaps `page` so that any access faults.
    ///
    /// # Errors
    /// Returns an error when the mapping cannot be changed.
    fn set_not_present(
        &self,
        allocator: &dyn PageAllocator,
        page: PhysicalAddress,
    ) -> Result<(), ProtectionError>;

    /// Maps `page` again with `attributes`.
    ///
    /// # Errors
    /// Returns an error when the mapping cannot be changed.
    fn set_present(
        &self,
        allocator: &dyn PageAllocator,
        page: PhysicalAddress,
        attributes: MemoryAttribute,
    ) -> Result<(), ProtectionError>;
}

/// Kind of a region reported outside of the page map.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ResourceKind {
    Reserved,
    Mmio,
    Persistent,
}

impl ResourceKind {
    /// The memory type such a region has in the memory map.
    #[must_use]
    pub const fn memory_type(self) -> MemoryType {
        match self {
            Self::Reserved => MemoryType::RESERVED,
            Self::Mmio => MemoryType::MMIO,
            Self::Persistent => MemoryType::PERSISTENT_MEMORY,
        }
    }
}

/// A physical range known to the resource map.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct ResourceRange {
    pub kind: ResourceKind,
    pub start: PhysicalAddress,
    /// Length in bytes, a multiple of the page size.
    pub length: u64,
    /// Cacheability and reliability capabilities of the range.
    pub attribute: MemoryAttribute,
}

/// Promoted memory, ready to be tracked as conventional memory.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct PromotedRange {
    pub start: PhysicalAddress,
    pub length: u64,
    pub attribute: MemoryAttribute,
}

/// The address space resource map.
pub trait ResourcePool {
    /// Regions that appear in memory map snapshots without being tracked.
    fn out_of_band_regions(&self) -> Vec<ResourceRange>;

    /// Turns present but untested memory into tested memory.
    ///
    /// Returns the promoted ranges; empty when nothing was left to promote.
    fn promote_untested(&mut self) -> Vec<PromotedRange>;
}

/// A resource map with nothing to report.
#[derive(Debug, Default, Copy, Clone)]
pub struct NoResources;

impl ResourcePool for NoResources {
    fn out_of_band_regions(&self) -> Vec<ResourceRange> {
        Vec::new()
    }

    fn promote_untested(&mut self) -> Vec<PromotedRange> {
        Vec::new()
    }
}

/// The operation an [`AllocationEvent`] reports.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum AllocationAction {
    AllocatePages,
    FreePages,
    AllocatePool,
    FreePool,
}

/// A successful allocation or free, as seen by the profiler.
#[derive(Debug, Copy, Clone)]
pub struct AllocationEvent {
    /// Source location of the caller of the memory service.
    pub caller: &'static Location<'static>,
    pub action: AllocationAction,
    pub memory_type: MemoryType,
    /// Size in bytes.
    pub size: u64,
    pub buffer: PhysicalAddress,
}

/// The profiler refused a record.
#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
#[error("allocation event was not recorded")]
pub struct SinkError;

/// Receives [`AllocationEvent`]s. Failures are logged and otherwise ignored.
pub trait AllocationEventSink {
    /// # Errors
    /// Returns [`SinkError`] when the event could not be stored.
    fn record(&self, event: &AllocationEvent) -> Result<(), SinkError>;
}

/// Notified after the memory map changed.
pub trait MemoryMapListener {
    fn memory_map_changed(&self, map_key: usize);
}
