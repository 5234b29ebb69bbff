//! # Memory Services Configuration
//!
//! Policy inputs decided by the platform: which memory types are guarded,
//! how many pages each type's bin reserves, and the runtime granularity.

use alloc::vec::Vec;
use bitfield_struct::bitfield;
use fw_info::MemoryTypeExt;
use fw_info::memory::{DEFAULT_GRANULARITY, MAX_ALLOC_ADDRESS, PAGE_SIZE};
use fw_memory_addresses::PhysicalAddress;
use uefi::mem::memory_map::MemoryType;
use utils_accessors_derive::Setters;

/// Heap guard feature switches.
#[bitfield(u8)]
#[derive(PartialEq, Eq)]
pub struct HeapGuardProperty {
    /// Bit 0: guard page allocations of the types in the page mask.
    pub page_guard: bool,

    /// Bit 1: guard pool allocations of the types in the pool mask.
    pub pool_guard: bool,

    #[bits(2)]
    __: u8,

    /// Bit 4: poison freed memory. Accepted, but cannot be combined with
    /// page or pool guards and has no effect.
    pub freed_guard: bool,

    __: bool,

    /// Bit 6: keep page 0 unmapped, so it is never zero-filled on add.
    pub null_detection: bool,

    /// Bit 7: place guarded pool allocations flush to the head guard
    /// (underflow detection) instead of the tail guard.
    pub pool_head_aligned: bool,
}

/// Whether a guard decision is made for a page or a pool allocation.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum AllocationKind {
    Page,
    Pool,
}

/// Placement of a page allocation.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum AllocateType {
    /// Anywhere below the configured maximum address.
    AnyPages,
    /// Anywhere at or below the given address.
    MaxAddress(PhysicalAddress),
    /// Exactly at the given base.
    Address(PhysicalAddress),
}

/// Which allocations get guard pages.
///
/// The masks are indexed by memory type; bit 62 covers all OEM types and
/// bit 63 all OS types.
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq, Setters)]
pub struct GuardPolicy {
    pub page_type_mask: u64,
    pub pool_type_mask: u64,
    pub property: HeapGuardProperty,
}

impl GuardPolicy {
    const OEM_BIT: u64 = 1 << 62;
    const OS_BIT: u64 = 1 << 63;

    /// A policy that guards nothing.
    #[must_use]
    pub const fn disabled() -> Self {
        Self {
            page_type_mask: 0,
            pool_type_mask: 0,
            property: HeapGuardProperty::new(),
        }
    }

    /// Whether any allocation may be guarded at all.
    #[must_use]
    pub const fn is_enabled(&self) -> bool {
        (self.property.page_guard() && self.page_type_mask != 0)
            || (self.property.pool_guard() && self.pool_type_mask != 0)
    }

    /// The mask bit standing for `memory_type`.
    #[must_use]
    pub fn type_bit(memory_type: MemoryType) -> u64 {
        if memory_type.is_os() {
            Self::OS_BIT
        } else if memory_type.is_oem() {
            Self::OEM_BIT
        } else if memory_type.0 < 62 {
            1 << memory_type.0
        } else {
            0
        }
    }

    /// Whether allocations of `memory_type` made through `kind` are guarded.
    #[must_use]
    pub fn guards(&self, memory_type: MemoryType, kind: AllocationKind) -> bool {
        let (enabled, mask) = match kind {
            AllocationKind::Page => (self.property.page_guard(), self.page_type_mask),
            AllocationKind::Pool => (self.property.pool_guard(), self.pool_type_mask),
        };
        enabled && mask & Self::type_bit(memory_type) != 0
    }
}

/// Cross-boot hint of how many pages a memory type needs.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct MemoryTypeInformation {
    pub memory_type: MemoryType,
    pub pages: u64,
}

/// The configuration was rejected.
#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("freed memory guard cannot be combined with page or pool guard")]
    FreedGuardCombined,
    #[error("runtime granularity {0:#x} is not a power-of-two multiple of the page size")]
    Granularity(u64),
    #[error("memory type {0:?} cannot have a bin")]
    BinType(MemoryType),
}

/// Configuration of the memory services.
#[derive(Debug, Clone, Setters)]
pub struct MemoryConfig {
    pub guard: GuardPolicy,

    /// Bin sizes learned on a previous boot.
    #[setters(runtime)]
    pub memory_type_information: Vec<MemoryTypeInformation>,

    /// Granularity of runtime memory types, in bytes.
    pub runtime_granularity: u64,

    /// The highest address any allocation may use.
    pub max_address: PhysicalAddress,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            guard: GuardPolicy::disabled(),
            memory_type_information: Vec::new(),
            runtime_granularity: DEFAULT_GRANULARITY,
            max_address: PhysicalAddress::new(MAX_ALLOC_ADDRESS),
        }
    }
}

impl MemoryConfig {
    /// Checks the combination of settings.
    ///
    /// # Errors
    /// See [`ConfigError`].
    pub fn validate(&self) -> Result<(), ConfigError> {
        let property = self.guard.property;
        if property.freed_guard() && (property.page_guard() || property.pool_guard()) {
            return Err(ConfigError::FreedGuardCombined);
        }
        let granularity = self.runtime_granularity;
        if !granularity.is_power_of_two() || granularity < PAGE_SIZE {
            return Err(ConfigError::Granularity(granularity));
        }
        if let Some(info) = self
            .memory_type_information
            .iter()
            .find(|info| !info.memory_type.is_valid_allocation_type())
        {
            return Err(ConfigError::BinType(info.memory_type));
        }
        Ok(())
    }

    /// Allocation granularity of `memory_type` in bytes.
    #[must_use]
    pub fn granularity(&self, memory_type: MemoryType) -> u64 {
        if memory_type.needs_runtime_granularity() {
            self.runtime_granularity
        } else {
            DEFAULT_GRANULARITY
        }
    }
}
