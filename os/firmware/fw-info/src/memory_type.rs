//! # Memory Types
//!
//! Classification of [`MemoryType`] values as seen by the allocator.
//!
//! ```
//! # use fw_info::MemoryTypeExt;
//! # use uefi::mem::memory_map::MemoryType;
//! assert!(MemoryType::BOOT_SERVICES_DATA.is_valid_allocation_type());
//! assert!(!MemoryType::CONVENTIONAL.is_valid_allocation_type());
//! assert!(MemoryType(0x7000_0001).is_oem());
//! assert!(MemoryType::RUNTIME_SERVICES_DATA.needs_runtime_granularity());
//! ```

use uefi::mem::memory_map::MemoryType;

/// First OEM defined memory type.
pub const OEM_RESERVED_MIN: u32 = 0x7000_0000;

/// Last OEM defined memory type.
pub const OEM_RESERVED_MAX: u32 = 0x7FFF_FFFF;

/// First OS loader defined memory type.
pub const OS_RESERVED_MIN: u32 = 0x8000_0000;

/// Number of standard UEFI memory types (`EfiMaxMemoryType`).
pub const STANDARD_TYPE_COUNT: u32 = 16;

/// Number of statistics slots: one per standard type plus OEM and OS.
pub const STATISTICS_SLOTS: usize = STANDARD_TYPE_COUNT as usize + 2;

/// Standard types in declaration order.
pub const STANDARD_TYPES: [MemoryType; STANDARD_TYPE_COUNT as usize] = [
    MemoryType::RESERVED,
    MemoryType::LOADER_CODE,
    MemoryType::LOADER_DATA,
    MemoryType::BOOT_SERVICES_CODE,
    MemoryType::BOOT_SERVICES_DATA,
    MemoryType::RUNTIME_SERVICES_CODE,
    MemoryType::RUNTIME_SERVICES_DATA,
    MemoryType::CONVENTIONAL,
    MemoryType::UNUSABLE,
    MemoryType::ACPI_RECLAIM,
    MemoryType::ACPI_NON_VOLATILE,
    MemoryType::MMIO,
    MemoryType::MMIO_PORT_SPACE,
    MemoryType::PAL_CODE,
    MemoryType::PERSISTENT_MEMORY,
    MemoryType::UNACCEPTED,
];

/// Classification helpers for [`MemoryType`].
pub trait MemoryTypeExt: Copy {
    /// Type in the OEM defined range.
    fn is_oem(self) -> bool;

    /// Type in the OS loader defined range.
    fn is_os(self) -> bool;

    /// Whether callers may request memory of this type.
    fn is_valid_allocation_type(self) -> bool;

    /// Whether base and length must follow the runtime granularity.
    fn needs_runtime_granularity(self) -> bool;

    /// Whether the type survives into the OS runtime.
    fn is_runtime(self) -> bool;

    /// Whether the type gets a dedicated bin below the default ceiling.
    fn is_special(self) -> bool;

    /// Slot of the type in per-type tables, see [`STATISTICS_SLOTS`].
    fn statistics_index(self) -> usize;
}

impl MemoryTypeExt for MemoryType {
    #[inline]
    fn is_oem(self) -> bool {
        (OEM_RESERVED_MIN..=OEM_RESERVED_MAX).contains(&self.0)
    }

    #[inline]
    fn is_os(self) -> bool {
        self.0 >= OS_RESERVED_MIN
    }

    fn is_valid_allocation_type(self) -> bool {
        if self.is_oem() || self.is_os() {
            return true;
        }
        self.0 < STANDARD_TYPE_COUNT
            && self != MemoryType::CONVENTIONAL
            && self != MemoryType::PERSISTENT_MEMORY
            && self != MemoryType::UNACCEPTED
    }

    fn needs_runtime_granularity(self) -> bool {
        matches!(
            self,
            MemoryType::ACPI_RECLAIM
                | MemoryType::ACPI_NON_VOLATILE
                | MemoryType::RUNTIME_SERVICES_CODE
                | MemoryType::RUNTIME_SERVICES_DATA
        )
    }

    fn is_runtime(self) -> bool {
        matches!(
            self,
            MemoryType::RUNTIME_SERVICES_CODE | MemoryType::RUNTIME_SERVICES_DATA
        )
    }

    fn is_special(self) -> bool {
        matches!(
            self,
            MemoryType::RESERVED
                | MemoryType::RUNTIME_SERVICES_CODE
                | MemoryType::RUNTIME_SERVICES_DATA
                | MemoryType::ACPI_RECLAIM
                | MemoryType::ACPI_NON_VOLATILE
                | MemoryType::PAL_CODE
        )
    }

    fn statistics_index(self) -> usize {
        let standard = STANDARD_TYPE_COUNT as usize;
        if self.is_oem() {
            standard
        } else if self.is_os() {
            standard + 1
        } else {
            // Non-standard values below the OEM range share the OEM slot.
            (self.0 as usize).min(standard)
        }
    }
}
