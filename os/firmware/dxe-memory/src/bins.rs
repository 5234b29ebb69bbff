//! # Memory Type Bins
//!
//! Memory types listed in the configured type information get a contiguous
//! bin stacked downward from the top of memory the first time enough
//! conventional memory is available. Allocations of such a type are served
//! from its bin first, which keeps runtime memory at the same addresses
//! from one boot to the next. Everything below the lowest bin is the
//! default region used by types without a bin.
//!
//! Placement is planned before anything is recorded, so a pass that runs
//! out of memory part way leaves no bin behind and is retried when more
//! memory is added.

use crate::config::{MemoryConfig, MemoryTypeInformation};
use crate::guard::GuardManager;
use crate::memory_map::{BinRange, MemoryMap};
use alloc::vec::Vec;
use fw_info::MemoryTypeExt;
use fw_info::memory_type::STANDARD_TYPES;
use fw_memory_addresses::{PhysicalAddress, align_up, bytes_to_pages, pages_to_bytes};
use log::{info, warn};
use uefi::mem::memory_map::MemoryType;

/// Address range reserved for one memory type.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct MemoryTypeBin {
    pub memory_type: MemoryType,
    pub base: PhysicalAddress,
    /// Last byte of the bin (inclusive).
    pub max: PhysicalAddress,
    pub reserved_pages: u64,
    pub is_special: bool,
    pub is_runtime: bool,
}

impl MemoryTypeBin {
    const fn range(&self) -> BinRange {
        BinRange {
            memory_type: self.memory_type,
            start: self.base,
            end: self.max,
        }
    }
}

/// Per-type view reported by the memory services.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct MemoryTypeStatistics {
    pub memory_type: MemoryType,
    pub base: PhysicalAddress,
    pub max: PhysicalAddress,
    pub reserved_pages: u64,
    pub current_pages: u64,
    pub is_special: bool,
    pub is_runtime: bool,
}

pub struct BinManager {
    information: Vec<MemoryTypeInformation>,
    bins: Vec<MemoryTypeBin>,
    default_ceiling: PhysicalAddress,
    max_address: PhysicalAddress,
    initialized: bool,
}

impl BinManager {
    #[must_use]
    pub fn new(config: &MemoryConfig) -> Self {
        Self {
            information: config.memory_type_information.clone(),
            bins: Vec::new(),
            default_ceiling: config.max_address,
            max_address: config.max_address,
            initialized: false,
        }
    }

    /// Whether placement succeeded, or there was nothing to place.
    #[must_use]
    pub const fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Highest address of the default region.
    #[must_use]
    pub const fn default_ceiling(&self) -> PhysicalAddress {
        self.default_ceiling
    }

    #[must_use]
    pub const fn max_address(&self) -> PhysicalAddress {
        self.max_address
    }

    #[must_use]
    pub fn bins(&self) -> &[MemoryTypeBin] {
        &self.bins
    }

    #[must_use]
    pub fn bin(&self, memory_type: MemoryType) -> Option<&MemoryTypeBin> {
        self.bins.iter().find(|bin| bin.memory_type == memory_type)
    }

    /// Ranges of the bins whose free memory is reported with their type.
    pub fn special_ranges(&self) -> impl Iterator<Item = BinRange> + '_ {
        self.bins
            .iter()
            .filter(|bin| bin.is_special)
            .map(MemoryTypeBin::range)
    }

    /// Requested bins as `(type, bytes, granularity)`, sized up to the
    /// type's granularity.
    fn requests<'a>(
        &'a self,
        config: &'a MemoryConfig,
    ) -> impl Iterator<Item = Option<(MemoryType, u64, u64)>> + 'a {
        self.information
            .iter()
            .filter(|info| info.pages > 0)
            .map(|info| {
                let granularity = config.granularity(info.memory_type);
                let bytes = pages_to_bytes(info.pages).and_then(|b| align_up(b, granularity))?;
                Some((info.memory_type, bytes, granularity))
            })
    }

    fn bin_at(memory_type: MemoryType, base: u64, bytes: u64) -> MemoryTypeBin {
        MemoryTypeBin {
            memory_type,
            base: PhysicalAddress::new(base),
            max: PhysicalAddress::new(base + bytes - 1),
            reserved_pages: bytes_to_pages(bytes),
            is_special: memory_type.is_special(),
            is_runtime: memory_type.is_runtime(),
        }
    }

    /// Places all bins top-down in the free memory of `map`.
    ///
    /// Returns `false` and records nothing if any bin does not fit.
    pub fn reserve_from_map(&mut self, map: &MemoryMap, config: &MemoryConfig) -> bool {
        if self.initialized {
            return true;
        }
        let mut ceiling = self.max_address;
        let mut planned = Vec::new();
        for request in self.requests(config) {
            let Some((memory_type, bytes, granularity)) = request else {
                warn!("Memory type bin size overflows");
                return false;
            };
            let pages = bytes_to_pages(bytes);
            let Some(base) =
                map.find_free_pages(ceiling, PhysicalAddress::zero(), pages, granularity, None)
            else {
                warn!(
                    "No room for {pages} pages of {memory_type:?}, dropping {} planned bins",
                    planned.len()
                );
                return false;
            };
            planned.push(Self::bin_at(memory_type, base.as_u64(), bytes));
            ceiling = base - 1;
        }
        self.install(planned);
        true
    }

    /// Places all bins top-down inside `[start, start + length)`, whether
    /// or not that memory is tracked yet.
    ///
    /// Returns `false` and records nothing if the range is too small.
    pub fn reserve_in_range(
        &mut self,
        start: PhysicalAddress,
        length: u64,
        config: &MemoryConfig,
    ) -> bool {
        if self.initialized {
            return false;
        }
        let Some(mut top) = start.as_u64().checked_add(length) else {
            return false;
        };
        let mut planned = Vec::new();
        for request in self.requests(config) {
            let Some((memory_type, bytes, granularity)) = request else {
                return false;
            };
            let Some(base) = top
                .checked_sub(bytes)
                .map(|base| base & !(granularity - 1))
                .filter(|&base| base >= start.as_u64())
            else {
                warn!("{memory_type:?} bin does not fit below {top:#x}");
                return false;
            };
            planned.push(Self::bin_at(memory_type, base, bytes));
            top = base;
        }
        self.install(planned);
        true
    }

    fn install(&mut self, planned: Vec<MemoryTypeBin>) {
        if let Some(lowest) = planned.iter().map(|bin| bin.base).min() {
            self.default_ceiling = lowest - 1;
        }
        for bin in &planned {
            info!(
                "{:?} bin: {}..={} ({} pages)",
                bin.memory_type, bin.base, bin.max, bin.reserved_pages
            );
        }
        self.bins = planned;
        self.initialized = true;
    }

    /// Drops every placed bin so that placement is tried again.
    pub fn reset(&mut self) {
        self.bins.clear();
        self.default_ceiling = self.max_address;
        self.initialized = false;
    }

    /// Finds `pages` free pages for `memory_type` at or below `ceiling`.
    ///
    /// Tries the type's bin, then the default region, then any memory up
    /// to `ceiling`.
    #[must_use]
    pub fn find_pages(
        &self,
        map: &MemoryMap,
        memory_type: MemoryType,
        pages: u64,
        ceiling: PhysicalAddress,
        alignment: u64,
        guard: Option<&GuardManager>,
    ) -> Option<PhysicalAddress> {
        let ceiling = ceiling.min(self.max_address);
        if let Some(bin) = self.bin(memory_type)
            && ceiling >= bin.max
            && let Some(base) = map.find_free_pages(bin.max, bin.base, pages, alignment, guard)
        {
            return Some(base);
        }
        if ceiling >= self.default_ceiling
            && let Some(base) = map.find_free_pages(
                self.default_ceiling,
                PhysicalAddress::zero(),
                pages,
                alignment,
                guard,
            )
        {
            return Some(base);
        }
        map.find_free_pages(ceiling, PhysicalAddress::zero(), pages, alignment, guard)
    }

    /// Statistics of every standard memory type.
    #[must_use]
    pub fn statistics(&self, map: &MemoryMap) -> Vec<MemoryTypeStatistics> {
        STANDARD_TYPES
            .iter()
            .map(|&memory_type| {
                let (base, max, reserved_pages) = self.bin(memory_type).map_or(
                    (PhysicalAddress::zero(), self.default_ceiling, 0),
                    |bin| (bin.base, bin.max, bin.reserved_pages),
                );
                MemoryTypeStatistics {
                    memory_type,
                    base,
                    max,
                    reserved_pages,
                    current_pages: map.pages_of(memory_type),
                    is_special: memory_type.is_special(),
                    is_runtime: memory_type.is_runtime(),
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fw_info::memory::RUNTIME_GRANULARITY_64K;
    use fw_memory_addresses::PAGE_SIZE;
    use uefi::mem::memory_map::MemoryAttribute;

    const TOP: u64 = 0x100_0000;

    fn pa(v: u64) -> PhysicalAddress {
        PhysicalAddress::new(v)
    }

    fn config(info: &[(MemoryType, u64)]) -> MemoryConfig {
        MemoryConfig::default().with_memory_type_information(
            info.iter()
                .map(|&(memory_type, pages)| MemoryTypeInformation { memory_type, pages })
                .collect(),
        )
    }

    fn map() -> MemoryMap {
        let mut map = MemoryMap::new();
        map.add_range(
            MemoryType::CONVENTIONAL,
            pa(0x10_0000),
            pa(TOP - 1),
            MemoryAttribute::WRITE_BACK,
        )
        .expect("add");
        map
    }

    #[test]
    fn bins_stack_downward() {
        let config = config(&[
            (MemoryType::RUNTIME_SERVICES_DATA, 16),
            (MemoryType::BOOT_SERVICES_DATA, 8),
        ]);
        let mut bins = BinManager::new(&config);
        assert!(bins.reserve_from_map(&map(), &config));
        let rt = bins.bin(MemoryType::RUNTIME_SERVICES_DATA).expect("bin");
        assert_eq!((rt.base, rt.max), (pa(TOP - 0x1_0000), pa(TOP - 1)));
        assert!(rt.is_special && rt.is_runtime);
        let bs = bins.bin(MemoryType::BOOT_SERVICES_DATA).expect("bin");
        assert_eq!(bs.max, pa(TOP - 0x1_0001));
        assert!(!bs.is_special);
        assert_eq!(bins.default_ceiling(), pa(TOP - 0x1_8001));
        assert_eq!(bins.special_ranges().count(), 1);
    }

    #[test]
    fn runtime_bins_follow_runtime_granularity() {
        let config = config(&[(MemoryType::ACPI_NON_VOLATILE, 3), (MemoryType::RUNTIME_SERVICES_CODE, 1)])
            .with_runtime_granularity(RUNTIME_GRANULARITY_64K);
        let mut bins = BinManager::new(&config);
        assert!(bins.reserve_in_range(pa(0x20_0000), 0x2_0000, &config));
        let nvs = bins.bin(MemoryType::ACPI_NON_VOLATILE).expect("bin");
        assert_eq!((nvs.base, nvs.reserved_pages), (pa(0x21_0000), 16));
        let code = bins.bin(MemoryType::RUNTIME_SERVICES_CODE).expect("bin");
        assert_eq!(code.base, pa(0x20_0000));
    }

    #[test]
    fn failed_placement_records_nothing() {
        let config = config(&[
            (MemoryType::RUNTIME_SERVICES_DATA, 16),
            (MemoryType::ACPI_RECLAIM, 0x10_0000),
        ]);
        let mut bins = BinManager::new(&config);
        assert!(!bins.reserve_from_map(&map(), &config));
        assert!(!bins.is_initialized());
        assert!(bins.bins().is_empty());
        assert_eq!(bins.default_ceiling(), config.max_address);
        assert!(!bins.reserve_in_range(pa(0x10_0000), 0x1000, &config));
    }

    #[test]
    fn search_order_is_bin_default_anywhere() {
        let config = config(&[(MemoryType::RUNTIME_SERVICES_DATA, 16)]);
        let mut bins = BinManager::new(&config);
        let map = map();
        assert!(bins.reserve_from_map(&map, &config));
        let any = pa(u64::MAX);

        let rt = bins.find_pages(&map, MemoryType::RUNTIME_SERVICES_DATA, 1, any, PAGE_SIZE, None);
        assert_eq!(rt, Some(pa(TOP - PAGE_SIZE)));

        let bs = bins.find_pages(&map, MemoryType::BOOT_SERVICES_DATA, 1, any, PAGE_SIZE, None);
        assert_eq!(bs, Some(pa(TOP - 0x1_0000 - PAGE_SIZE)));

        // Below the default ceiling only the default region is searched.
        let low = bins.find_pages(&map, MemoryType::RUNTIME_SERVICES_DATA, 1, pa(0x20_0000), PAGE_SIZE, None);
        assert_eq!(low, Some(pa(0x1F_F000)));

        // Larger than the default region: taken from anywhere.
        let huge = bins.find_pages(&map, MemoryType::LOADER_DATA, 0xF00, any, PAGE_SIZE, None);
        assert_eq!(huge, Some(pa(0x10_0000)));

        let stats = bins.statistics(&map);
        assert_eq!(stats.len(), STANDARD_TYPES.len());
        let conventional = stats
            .iter()
            .find(|s| s.memory_type == MemoryType::CONVENTIONAL)
            .expect("listed");
        assert_eq!(conventional.current_pages, 0xF00);
    }
}
