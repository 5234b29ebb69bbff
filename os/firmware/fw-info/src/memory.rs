//! # Memory Layout

use fw_memory_addresses::GRANULE_64K;
use uefi::mem::memory_map::MemoryDescriptor;

/// The UEFI page size. Every page count in the memory services uses it.
pub const PAGE_SIZE: u64 = fw_memory_addresses::PAGE_SIZE;

/// Allocation granularity of boot-time types.
pub const DEFAULT_GRANULARITY: u64 = PAGE_SIZE;

/// Allocation granularity for runtime types on 64 KiB page operating systems.
pub const RUNTIME_GRANULARITY_64K: u64 = GRANULE_64K;

/// Depth of the bootstrap descriptor scratch stack.
///
/// A single map mutation may split at most this many new descriptors before
/// the drain moves them into permanent storage.
pub const MAX_MAP_DEPTH: usize = 6;

/// Number of map descriptor slots carved from one provisioned page.
pub const DESCRIPTORS_PER_PAGE: usize = 64;

/// Padding added to the natural descriptor size in snapshots.
///
/// Consumers must step through the buffer by the reported stride.
pub const DESCRIPTOR_PADDING: usize = 8;

/// Byte stride between descriptors in a memory map snapshot.
pub const DESCRIPTOR_STRIDE: usize = size_of::<MemoryDescriptor>() + DESCRIPTOR_PADDING;

/// Format version of snapshot descriptors.
pub const DESCRIPTOR_VERSION: u32 = MemoryDescriptor::VERSION;

/// The highest address allocations may use by default.
pub const MAX_ALLOC_ADDRESS: u64 = u64::MAX;

/// Pool allocations are 8-byte aligned.
pub const POOL_ALIGNMENT: u64 = 8;

const _: () = {
    assert!(PAGE_SIZE.is_power_of_two());
    assert!(RUNTIME_GRANULARITY_64K.is_multiple_of(PAGE_SIZE));
    assert!(DESCRIPTOR_STRIDE > size_of::<MemoryDescriptor>());
    assert!(DESCRIPTOR_STRIDE.is_multiple_of(8));
    assert!(MAX_MAP_DEPTH >= 3);
};
