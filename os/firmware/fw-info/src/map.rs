//! # Memory Map Metadata

/// Describes a memory map written into a caller buffer.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct MemoryMapInfo {
    /// Generation key of the map at the time of the snapshot.
    pub map_key: usize,

    /// Length of the written map in **bytes**.
    pub map_size: usize,

    /// Size of a single descriptor in bytes. Always larger than the
    /// natural size of `EFI_MEMORY_DESCRIPTOR`.
    pub descriptor_size: usize,

    /// Descriptor version.
    pub descriptor_version: u32,
}

impl MemoryMapInfo {
    /// Number of descriptors in the map.
    #[must_use]
    pub const fn entry_count(&self) -> usize {
        if self.descriptor_size == 0 {
            0
        } else {
            self.map_size / self.descriptor_size
        }
    }
}
