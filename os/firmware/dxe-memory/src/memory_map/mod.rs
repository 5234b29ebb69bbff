//! # Memory Map
//!
//! Tracks every page the firmware knows about as a sorted set of
//! non-overlapping ranges. Adjacent ranges of the same kind are always
//! merged, so the map stays as small as the memory layout allows.
//!
//! Mutations stage the entries they create in a [`ScratchStack`]; the owner
//! calls [`MemoryMap::drain`] afterwards to move them into permanent
//! storage, carving a page for new descriptors when it runs low. Mutations
//! are all-or-nothing: a request that cannot be completed leaves the map
//! untouched.

pub mod entry;
pub mod scratch;
pub mod snapshot;

use crate::error::MemoryMapError;
use crate::guard::GuardManager;
use alloc::collections::BTreeMap;
use alloc::vec::Vec;
use entry::{EntryHandle, EntrySlab, MemoryMapEntry};
use fw_info::MemoryTypeExt;
use fw_info::memory::{DESCRIPTORS_PER_PAGE, MAX_MAP_DEPTH};
use fw_info::memory_type::STATISTICS_SLOTS;
use fw_memory_addresses::{PAGE_SIZE, PhysicalAddress, pages_to_bytes};
use log::{debug, trace, warn};
use scratch::ScratchStack;
use uefi::mem::memory_map::{MemoryAttribute, MemoryType};

const PAGE_MASK: u64 = PAGE_SIZE - 1;

/// Free slots kept in permanent storage after a drain, so the next mutation
/// and the page carve it may need always fit.
const DRAIN_HEADROOM: usize = MAX_MAP_DEPTH + 2;

/// New entries a single-page conversion can create.
const PROVISION_SPLITS: usize = 2;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum Home {
    Scratch(usize),
    Slab(EntryHandle),
}

/// What [`MemoryMap::convert_range`] changes.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Conversion {
    /// Allocate free pages as, or free pages of, the given type.
    Type(MemoryType),
    /// Replace the attributes and keep the type.
    Attributes(MemoryAttribute),
}

/// Address range of a special memory type bin.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct BinRange {
    pub memory_type: MemoryType,
    pub start: PhysicalAddress,
    /// Last byte of the bin (inclusive).
    pub end: PhysicalAddress,
}

/// The page-range tracker.
pub struct MemoryMap {
    index: BTreeMap<u64, Home>,
    slab: EntrySlab,
    scratch: ScratchStack,
    bins: Vec<BinRange>,
    pages_by_type: [u64; STATISTICS_SLOTS],
    map_key: usize,
    zero_page_requested: bool,
    descriptor_pages: Vec<PhysicalAddress>,
}

impl Default for MemoryMap {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryMap {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            index: BTreeMap::new(),
            slab: EntrySlab::new(),
            scratch: ScratchStack::new(),
            bins: Vec::new(),
            pages_by_type: [0; STATISTICS_SLOTS],
            map_key: 0,
            zero_page_requested: false,
            descriptor_pages: Vec::new(),
        }
    }

    /// Changes with every successful mutation.
    #[must_use]
    pub const fn map_key(&self) -> usize {
        self.map_key
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.index.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    #[must_use]
    pub const fn scratch(&self) -> &ScratchStack {
        &self.scratch
    }

    #[must_use]
    pub const fn slab(&self) -> &EntrySlab {
        &self.slab
    }

    /// Pages carved for descriptor storage.
    #[must_use]
    pub fn descriptor_pages(&self) -> &[PhysicalAddress] {
        &self.descriptor_pages
    }

    #[must_use]
    pub fn bins(&self) -> &[BinRange] {
        &self.bins
    }

    /// Pages currently tracked as `memory_type`.
    #[must_use]
    pub fn pages_of(&self, memory_type: MemoryType) -> u64 {
        self.pages_by_type[memory_type.statistics_index()]
    }

    /// Whether a mutation released the page at address zero since the last
    /// call.
    pub const fn take_zero_page_request(&mut self) -> bool {
        core::mem::replace(&mut self.zero_page_requested, false)
    }

    fn entry(&self, home: Home) -> Option<&MemoryMapEntry> {
        match home {
            Home::Scratch(index) => self.scratch.get(index),
            Home::Slab(handle) => self.slab.get(handle),
        }
    }

    /// All entries in ascending address order.
    pub fn iter(&self) -> impl Iterator<Item = &MemoryMapEntry> + '_ {
        self.index.values().filter_map(|home| self.entry(*home))
    }

    /// The entry containing `addr`.
    #[must_use]
    pub fn find(&self, addr: PhysicalAddress) -> Option<&MemoryMapEntry> {
        let (_, home) = self.index.range(..=addr.as_u64()).next_back()?;
        self.entry(*home).filter(|entry| entry.contains(addr))
    }

    /// Whether every page of `[start, start + pages)` is tracked and
    /// allocated.
    #[must_use]
    pub fn is_allocated(&self, start: PhysicalAddress, pages: u64) -> bool {
        let Some(last) = pages_to_bytes(pages)
            .filter(|_| pages > 0)
            .and_then(|bytes| start.checked_add(bytes - 1))
        else {
            return false;
        };
        let mut cursor = start;
        while let Some(entry) = self.find(cursor) {
            if entry.is_free() {
                return false;
            }
            if entry.end >= last {
                return true;
            }
            cursor = entry.end + 1;
        }
        false
    }

    /// Entries overlapping `[start, end]` plus the neighbors touching it.
    fn window(&self, start: u64, end: u64) -> Vec<MemoryMapEntry> {
        let lo = start.saturating_sub(1);
        let hi = end.saturating_add(1);
        let first = self
            .index
            .range(..=lo)
            .next_back()
            .map_or(lo, |(key, _)| *key);
        self.index
            .range(first..=hi)
            .filter_map(|(_, home)| self.entry(*home).copied())
            .filter(|entry| entry.end.as_u64() >= lo && entry.start.as_u64() <= hi)
            .collect()
    }

    /// Replaces the `old` entries by `new`, reusing their storage first.
    ///
    /// Fails without side effects when the extra entries do not fit the
    /// scratch stack.
    fn replace_window(
        &mut self,
        old: &[MemoryMapEntry],
        new: Vec<MemoryMapEntry>,
    ) -> Result<(), MemoryMapError> {
        let needed = new.len().saturating_sub(old.len());
        if needed > self.scratch.available() {
            return Err(MemoryMapError::ScratchExhausted {
                depth: self.scratch.depth() + needed,
            });
        }

        let mut homes: Vec<Home> = old
            .iter()
            .filter_map(|entry| self.index.remove(&entry.start.as_u64()))
            .collect();
        for entry in new {
            let home = match homes.pop() {
                Some(home) => {
                    self.store(home, entry);
                    home
                }
                None => Home::Scratch(self.scratch.push(entry)?),
            };
            self.index.insert(entry.start.as_u64(), home);
        }
        for home in homes {
            self.release(home);
        }
        Ok(())
    }

    fn store(&mut self, home: Home, entry: MemoryMapEntry) {
        let slot = match home {
            Home::Scratch(index) => self.scratch.get_mut(index),
            Home::Slab(handle) => self.slab.get_mut(handle),
        };
        if let Some(slot) = slot {
            *slot = entry;
        }
    }

    fn release(&mut self, home: Home) {
        match home {
            Home::Scratch(index) => {
                self.scratch.take(index);
            }
            Home::Slab(handle) => {
                self.slab.remove(handle);
            }
        }
    }

    /// Sorts fragments and merges the ones that touch and agree in kind.
    fn normalize(mut fragments: Vec<MemoryMapEntry>) -> Vec<MemoryMapEntry> {
        fragments.sort_unstable_by_key(|entry| entry.start);
        let mut merged: Vec<MemoryMapEntry> = Vec::with_capacity(fragments.len());
        for entry in fragments {
            match merged.last_mut() {
                Some(last) if last.can_merge(&entry) => last.end = entry.end,
                _ => merged.push(entry),
            }
        }
        merged
    }

    /// Splits a free fragment at special bin boundaries and tags the parts
    /// inside a bin with its type.
    fn tag_free(&self, fragment: MemoryMapEntry, out: &mut Vec<MemoryMapEntry>) {
        let end = fragment.end.as_u64();
        let mut cursor = fragment.start.as_u64();
        let untagged = |start: u64, end: u64| MemoryMapEntry {
            bin: None,
            ..fragment.clipped(PhysicalAddress::new(start), PhysicalAddress::new(end))
        };

        for bin in &self.bins {
            let (bin_start, bin_end) = (bin.start.as_u64(), bin.end.as_u64());
            if bin_end < cursor || bin_start > end {
                continue;
            }
            if bin_start > cursor {
                out.push(untagged(cursor, bin_start - 1));
            }
            let part_end = bin_end.min(end);
            out.push(MemoryMapEntry {
                bin: Some(bin.memory_type),
                ..fragment.clipped(
                    PhysicalAddress::new(bin_start.max(cursor)),
                    PhysicalAddress::new(part_end),
                )
            });
            if part_end == end {
                return;
            }
            cursor = part_end + 1;
        }
        out.push(untagged(cursor, end));
    }

    fn check_range(start: PhysicalAddress, end: PhysicalAddress) -> Result<(), MemoryMapError> {
        let aligned = start.is_aligned(PAGE_SIZE) && end.as_u64() & PAGE_MASK == PAGE_MASK;
        if aligned && start < end {
            Ok(())
        } else {
            Err(MemoryMapError::InvalidRange { start, end })
        }
    }

    fn note_released(&mut self, entry: &MemoryMapEntry) {
        if entry.is_free() && entry.start.is_null() && entry.end.as_u64() >= PAGE_MASK {
            self.zero_page_requested = true;
        }
    }

    /// Starts tracking `[start, end]` as `memory_type`.
    ///
    /// Only the parts not yet tracked are added; they merge with matching
    /// neighbors. Returns the number of pages added.
    ///
    /// # Errors
    /// - [`MemoryMapError::InvalidRange`] for unaligned or empty ranges.
    /// - [`MemoryMapError::AlreadyTracked`] when every page is tracked.
    /// - [`MemoryMapError::ScratchExhausted`] when the range splits into
    ///   more entries than the scratch stack holds.
    pub fn add_range(
        &mut self,
        memory_type: MemoryType,
        start: PhysicalAddress,
        end: PhysicalAddress,
        attribute: MemoryAttribute,
    ) -> Result<u64, MemoryMapError> {
        Self::check_range(start, end)?;
        let (s, e) = (start.as_u64(), end.as_u64());
        let window = self.window(s, e);

        let mut gaps = Vec::new();
        let mut cursor = s;
        let mut covered = false;
        for entry in window
            .iter()
            .filter(|entry| entry.end.as_u64() >= s && entry.start.as_u64() <= e)
        {
            if entry.start.as_u64() > cursor {
                gaps.push((cursor, entry.start.as_u64() - 1));
            }
            if entry.end.as_u64() >= e {
                covered = true;
                break;
            }
            cursor = entry.end.as_u64() + 1;
        }
        if !covered {
            gaps.push((cursor, e));
        }
        if gaps.is_empty() {
            return Err(MemoryMapError::AlreadyTracked);
        }

        let mut fragments = window.clone();
        let mut added_entries = Vec::with_capacity(gaps.len());
        for (gap_start, gap_end) in gaps {
            let entry = MemoryMapEntry::new(
                memory_type,
                PhysicalAddress::new(gap_start),
                PhysicalAddress::new(gap_end),
                attribute,
            );
            if entry.is_free() {
                self.tag_free(entry, &mut fragments);
            } else {
                fragments.push(entry);
            }
            added_entries.push(entry);
        }
        self.replace_window(&window, Self::normalize(fragments))?;

        let added = added_entries.iter().map(MemoryMapEntry::pages).sum();
        self.pages_by_type[memory_type.statistics_index()] += added;
        for entry in &added_entries {
            self.note_released(entry);
        }
        self.map_key = self.map_key.wrapping_add(1);
        trace!("Added {added} pages of {memory_type:?} in {start}..={end}");
        Ok(added)
    }

    /// Changes the type or the attributes of `pages` pages at `start`.
    ///
    /// Type changes must either allocate free pages or free allocated pages.
    /// Allocations must lie within a single entry; frees and attribute
    /// changes may span several contiguous entries.
    ///
    /// # Errors
    /// - [`MemoryMapError::InvalidRange`] for unaligned or empty requests.
    /// - [`MemoryMapError::NotFound`] when a page is untracked or the
    ///   conversion is not allowed for one of the covering entries.
    /// - [`MemoryMapError::ScratchExhausted`] when the result does not fit.
    pub fn convert_range(
        &mut self,
        start: PhysicalAddress,
        pages: u64,
        conversion: Conversion,
    ) -> Result<(), MemoryMapError> {
        let end = pages_to_bytes(pages)
            .filter(|_| pages > 0)
            .and_then(|bytes| start.checked_add(bytes - 1))
            .ok_or(MemoryMapError::InvalidRange { start, end: start })?;
        Self::check_range(start, end)?;
        let (s, e) = (start.as_u64(), end.as_u64());
        let window = self.window(s, e);
        let overlaps = |entry: &&MemoryMapEntry| entry.end.as_u64() >= s && entry.start.as_u64() <= e;

        let mut cursor = s;
        let mut covered = false;
        let mut pieces = 0;
        for entry in window.iter().filter(overlaps) {
            if entry.start.as_u64() > cursor {
                break;
            }
            if let Conversion::Type(new) = conversion
                && entry.is_free() == (new == MemoryType::CONVENTIONAL)
            {
                debug!(
                    "Cannot convert {:?} at {} to {new:?}",
                    entry.memory_type, entry.start
                );
                return Err(MemoryMapError::NotFound);
            }
            pieces += 1;
            if entry.end.as_u64() >= e {
                covered = true;
                break;
            }
            cursor = entry.end.as_u64() + 1;
        }
        if !covered {
            debug!("Range {start}..={end} is not tracked");
            return Err(MemoryMapError::NotFound);
        }
        if matches!(conversion, Conversion::Type(new) if new != MemoryType::CONVENTIONAL)
            && pieces > 1
        {
            debug!("Range {start}..={end} covers {pieces} entries");
            return Err(MemoryMapError::NotFound);
        }

        let mut fragments = Vec::with_capacity(window.len() + 2);
        let mut moved = Vec::new();
        for entry in &window {
            if !overlaps(&entry) {
                fragments.push(*entry);
                continue;
            }
            if entry.start < start {
                fragments.push(entry.clipped(entry.start, start - 1));
            }
            if entry.end > end {
                fragments.push(entry.clipped(end + 1, entry.end));
            }
            let mut inner = entry.clipped(start, end);
            match conversion {
                Conversion::Type(new) => {
                    moved.push((entry.memory_type, inner.pages()));
                    inner.memory_type = new;
                    inner.bin = None;
                    if inner.is_free() {
                        self.tag_free(inner, &mut fragments);
                    } else {
                        fragments.push(inner);
                    }
                }
                Conversion::Attributes(attribute) => {
                    inner.attribute = attribute;
                    fragments.push(inner);
                }
            }
        }
        self.replace_window(&window, Self::normalize(fragments))?;

        if let Conversion::Type(new) = conversion {
            for (old, count) in moved {
                let slot = &mut self.pages_by_type[old.statistics_index()];
                *slot = slot.saturating_sub(count);
                self.pages_by_type[new.statistics_index()] += count;
            }
            self.note_released(&MemoryMapEntry::new(new, start, end, MemoryAttribute::empty()));
        }
        self.map_key = self.map_key.wrapping_add(1);
        trace!("Converted {pages} pages at {start} to {conversion:?}");
        Ok(())
    }

    /// Finds the highest free range of `pages` pages at or below `ceiling`
    /// and at or above `floor`, ending on an `alignment` boundary.
    ///
    /// With a guard manager, room for the guard pages is reserved and the
    /// returned base is the payload's. Page zero is never returned.
    #[must_use]
    pub fn find_free_pages(
        &self,
        ceiling: PhysicalAddress,
        floor: PhysicalAddress,
        pages: u64,
        alignment: u64,
        guard: Option<&GuardManager>,
    ) -> Option<PhysicalAddress> {
        let mut max = ceiling.as_u64();
        if max < PAGE_MASK || pages == 0 {
            return None;
        }
        if max & PAGE_MASK != PAGE_MASK {
            max = ((max - PAGE_SIZE) & !PAGE_MASK) | PAGE_MASK;
        }
        let bytes = pages_to_bytes(pages)?;
        let min = floor.as_u64();
        let align_mask = alignment.max(PAGE_SIZE) - 1;

        let mut target = 0;
        for entry in self.iter().filter(|entry| entry.is_free()) {
            let start = entry.start.as_u64();
            if start > max || entry.end.as_u64() < min {
                continue;
            }
            let clipped = entry.end.as_u64().min(max);
            let aligned = clipped.wrapping_add(1) & !align_mask;
            if aligned == 0 && clipped != u64::MAX {
                continue;
            }
            let end = aligned.wrapping_sub(1);
            if end < start {
                continue;
            }
            let size = (end - start).saturating_add(1);
            if size < bytes || end - (bytes - 1) < min || end <= target {
                continue;
            }
            let end = match guard {
                Some(guard) => match guard.search_end(start, size, bytes) {
                    Some(end) if end - (bytes - 1) >= min => end,
                    _ => continue,
                },
                None => end,
            };
            target = target.max(end);
        }

        let base = target.checked_sub(bytes - 1)?;
        if target == 0 || base == 0 || base & PAGE_MASK != 0 {
            return None;
        }
        Some(PhysicalAddress::new(base))
    }

    /// Records a special bin and tags the free memory inside it.
    ///
    /// # Errors
    /// [`MemoryMapError::InvalidRange`] for overlapping bins and
    /// [`MemoryMapError::ScratchExhausted`] when tagging needs more splits
    /// than the scratch stack holds. The bin is not recorded on error.
    pub fn register_bin(&mut self, bin: BinRange) -> Result<(), MemoryMapError> {
        Self::check_range(bin.start, bin.end)?;
        if self
            .bins
            .iter()
            .any(|other| other.start <= bin.end && bin.start <= other.end)
        {
            return Err(MemoryMapError::InvalidRange {
                start: bin.start,
                end: bin.end,
            });
        }
        let position = self.bins.partition_point(|other| other.start < bin.start);
        self.bins.insert(position, bin);

        let (s, e) = (bin.start.as_u64(), bin.end.as_u64());
        let window = self.window(s, e);
        let mut fragments = Vec::with_capacity(window.len() + 2);
        for entry in &window {
            if !entry.is_free() || entry.end < bin.start || entry.start > bin.end {
                fragments.push(*entry);
                continue;
            }
            if entry.start < bin.start {
                fragments.push(entry.clipped(entry.start, bin.start - 1));
            }
            if entry.end > bin.end {
                fragments.push(entry.clipped(bin.end + 1, entry.end));
            }
            self.tag_free(entry.clipped(bin.start, bin.end), &mut fragments);
        }
        if let Err(error) = self.replace_window(&window, Self::normalize(fragments)) {
            self.bins.remove(position);
            return Err(error);
        }
        self.map_key = self.map_key.wrapping_add(1);
        debug!(
            "{:?} bin at {}..={}",
            bin.memory_type, bin.start, bin.end
        );
        Ok(())
    }

    /// Forgets a special bin and clears the tag of the free memory inside
    /// it. Only merges entries, so it never needs scratch space.
    ///
    /// # Errors
    /// [`MemoryMapError::NotFound`] when `bin` is not registered.
    pub fn unregister_bin(&mut self, bin: BinRange) -> Result<(), MemoryMapError> {
        let position = self
            .bins
            .iter()
            .position(|other| *other == bin)
            .ok_or(MemoryMapError::NotFound)?;
        self.bins.remove(position);

        let window = self.window(bin.start.as_u64(), bin.end.as_u64());
        let fragments = window
            .iter()
            .map(|entry| {
                let inside = entry.start >= bin.start && entry.end <= bin.end;
                if inside && entry.bin == Some(bin.memory_type) {
                    MemoryMapEntry { bin: None, ..*entry }
                } else {
                    *entry
                }
            })
            .collect();
        self.replace_window(&window, Self::normalize(fragments))?;
        self.map_key = self.map_key.wrapping_add(1);
        debug!("Dropped {:?} bin at {}..={}", bin.memory_type, bin.start, bin.end);
        Ok(())
    }

    /// Moves staged entries into permanent storage.
    ///
    /// Carves a page of boot services data for descriptors whenever storage
    /// runs low, preferring memory at or below `preferred` and falling back
    /// to anything at or below `ceiling`. Staged entries stay valid map
    /// entries if no page can be found.
    ///
    /// # Errors
    /// [`MemoryMapError::DescriptorExhausted`] when entries remain staged.
    pub fn drain(
        &mut self,
        preferred: PhysicalAddress,
        ceiling: PhysicalAddress,
    ) -> Result<(), MemoryMapError> {
        loop {
            self.migrate();
            if self.scratch.depth() == 0 && self.slab.free_slots() >= DRAIN_HEADROOM {
                return Ok(());
            }
            if self.scratch.available() < PROVISION_SPLITS || !self.provision(preferred, ceiling) {
                if self.scratch.depth() == 0 {
                    debug!("Only {} descriptor slots left", self.slab.free_slots());
                    return Ok(());
                }
                warn!(
                    "{} map entries remain staged, no memory for descriptors",
                    self.scratch.depth()
                );
                return Err(MemoryMapError::DescriptorExhausted);
            }
        }
    }

    fn migrate(&mut self) {
        while let Some(index) = self.scratch.top() {
            let Some(entry) = self.scratch.get(index).copied() else {
                break;
            };
            let Some(handle) = self.slab.insert(entry) else {
                break;
            };
            self.scratch.take(index);
            self.index.insert(entry.start.as_u64(), Home::Slab(handle));
        }
    }

    fn provision(&mut self, preferred: PhysicalAddress, ceiling: PhysicalAddress) -> bool {
        let Some(page) = self
            .find_free_pages(preferred, PhysicalAddress::zero(), 1, PAGE_SIZE, None)
            .or_else(|| self.find_free_pages(ceiling, PhysicalAddress::zero(), 1, PAGE_SIZE, None))
        else {
            return false;
        };
        match self.convert_range(page, 1, Conversion::Type(MemoryType::BOOT_SERVICES_DATA)) {
            Ok(()) => {
                self.slab.provision(DESCRIPTORS_PER_PAGE);
                self.descriptor_pages.push(page);
                debug!("Descriptor page at {page}");
                true
            }
            Err(error) => {
                warn!("Failed to carve descriptor page at {page}: {error}");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const P: u64 = PAGE_SIZE;
    const WB: MemoryAttribute = MemoryAttribute::WRITE_BACK;

    fn pa(v: u64) -> PhysicalAddress {
        PhysicalAddress::new(v)
    }

    fn free_map(start: u64, pages: u64) -> MemoryMap {
        let mut map = MemoryMap::new();
        map.add_range(MemoryType::CONVENTIONAL, pa(start), pa(start + pages * P - 1), WB)
            .expect("add");
        map.drain(PhysicalAddress::new(u64::MAX), PhysicalAddress::new(u64::MAX))
            .expect("drain");
        map
    }

    #[test]
    fn add_merges_with_neighbors() {
        let mut map = MemoryMap::new();
        map.add_range(MemoryType::CONVENTIONAL, pa(0x2000), pa(0x2FFF), WB).expect("add");
        map.add_range(MemoryType::CONVENTIONAL, pa(0x4000), pa(0x4FFF), WB).expect("add");
        map.add_range(MemoryType::CONVENTIONAL, pa(0x3000), pa(0x3FFF), WB).expect("add");
        assert_eq!(map.len(), 1);
        assert_eq!(map.pages_of(MemoryType::CONVENTIONAL), 3);
        assert_eq!(map.scratch().depth(), 1);
    }

    #[test]
    fn add_rejects_bad_ranges() {
        let mut map = MemoryMap::new();
        assert!(matches!(
            map.add_range(MemoryType::CONVENTIONAL, pa(0x1001), pa(0x1FFF), WB),
            Err(MemoryMapError::InvalidRange { .. })
        ));
        assert!(matches!(
            map.add_range(MemoryType::CONVENTIONAL, pa(0x1000), pa(0x1FFE), WB),
            Err(MemoryMapError::InvalidRange { .. })
        ));
        map.add_range(MemoryType::CONVENTIONAL, pa(0x1000), pa(0x1FFF), WB).expect("add");
        assert_eq!(
            map.add_range(MemoryType::LOADER_DATA, pa(0x1000), pa(0x1FFF), WB),
            Err(MemoryMapError::AlreadyTracked)
        );
    }

    #[test]
    fn convert_is_all_or_nothing() {
        let mut map = free_map(0x10_0000, 16);
        let key = map.map_key();
        // Extends past the end of tracked memory.
        assert_eq!(
            map.convert_range(pa(0x10_E000), 4, Conversion::Type(MemoryType::LOADER_DATA)),
            Err(MemoryMapError::NotFound)
        );
        assert_eq!(map.map_key(), key);

        map.convert_range(pa(0x10_4000), 2, Conversion::Type(MemoryType::LOADER_DATA))
            .expect("allocate");
        // Already allocated.
        assert_eq!(
            map.convert_range(pa(0x10_4000), 1, Conversion::Type(MemoryType::LOADER_CODE)),
            Err(MemoryMapError::NotFound)
        );
        // Freeing free memory.
        assert_eq!(
            map.convert_range(pa(0x10_0000), 1, Conversion::Type(MemoryType::CONVENTIONAL)),
            Err(MemoryMapError::NotFound)
        );
        assert_eq!(map.pages_of(MemoryType::LOADER_DATA), 2);
        assert_eq!(map.len(), 4, "three ranges plus the descriptor page");
    }

    #[test]
    fn free_spanning_entries_merges_back() {
        let mut map = free_map(0x10_0000, 16);
        map.convert_range(pa(0x10_4000), 1, Conversion::Type(MemoryType::LOADER_DATA))
            .expect("allocate");
        map.convert_range(pa(0x10_5000), 1, Conversion::Type(MemoryType::LOADER_CODE))
            .expect("allocate");
        map.convert_range(pa(0x10_4000), 2, Conversion::Type(MemoryType::CONVENTIONAL))
            .expect("free both");
        assert_eq!(map.pages_of(MemoryType::LOADER_DATA), 0);
        assert_eq!(map.pages_of(MemoryType::LOADER_CODE), 0);
        assert_eq!(map.iter().filter(|e| e.is_free()).count(), 1);
    }

    #[test]
    fn search_prefers_high_memory() {
        let mut map = MemoryMap::new();
        map.add_range(MemoryType::CONVENTIONAL, pa(0x1_0000), pa(0x1_FFFF), WB).expect("add");
        map.add_range(MemoryType::CONVENTIONAL, pa(0x8_0000), pa(0x8_3FFF), WB).expect("add");
        let top = pa(u64::MAX);
        assert_eq!(map.find_free_pages(top, pa(0), 2, P, None), Some(pa(0x8_2000)));
        // Larger than the upper range.
        assert_eq!(map.find_free_pages(top, pa(0), 8, P, None), Some(pa(0x1_8000)));
        // An unaligned ceiling is rounded down to a page end.
        assert_eq!(map.find_free_pages(pa(0x8_1800), pa(0), 1, P, None), Some(pa(0x8_0000)));
        // Floor excludes the lower range.
        assert_eq!(map.find_free_pages(top, pa(0x2_0000), 8, P, None), None);
        // 64 KiB aligned.
        assert_eq!(map.find_free_pages(top, pa(0), 1, 0x1_0000, None), Some(pa(0x1_F000)));
    }

    #[test]
    fn page_zero_is_never_found() {
        let mut map = MemoryMap::new();
        map.add_range(MemoryType::CONVENTIONAL, pa(0), pa(0xFFF), WB).expect("add");
        assert!(map.take_zero_page_request());
        assert!(!map.take_zero_page_request());
        assert_eq!(map.find_free_pages(pa(u64::MAX), pa(0), 1, P, None), None);
    }

    #[test]
    fn bins_tag_free_memory() {
        let mut map = free_map(0x10_0000, 32);
        map.register_bin(BinRange {
            memory_type: MemoryType::ACPI_NON_VOLATILE,
            start: pa(0x10_8000),
            end: pa(0x10_BFFF),
        })
        .expect("bin");
        let tagged: Vec<_> = map.iter().filter(|e| e.bin.is_some()).collect();
        assert_eq!(tagged.len(), 1);
        assert_eq!((tagged[0].start, tagged[0].pages()), (pa(0x10_8000), 4));

        // Freed memory inside the bin is tagged again.
        map.convert_range(pa(0x10_A000), 1, Conversion::Type(MemoryType::ACPI_NON_VOLATILE))
            .expect("allocate");
        map.convert_range(pa(0x10_A000), 1, Conversion::Type(MemoryType::CONVENTIONAL))
            .expect("free");
        assert_eq!(map.iter().filter(|e| e.bin.is_some()).count(), 1);
    }

    #[test]
    fn unregistered_bin_merges_back() {
        let mut map = free_map(0x10_0000, 32);
        let before = map.len();
        let bin = BinRange {
            memory_type: MemoryType::RESERVED,
            start: pa(0x10_8000),
            end: pa(0x10_BFFF),
        };
        map.register_bin(bin).expect("bin");
        assert_eq!(map.len(), before + 2);

        map.unregister_bin(bin).expect("drop");
        assert_eq!(map.len(), before);
        assert!(map.bins().is_empty());
        assert!(map.iter().all(|e| e.bin.is_none()));
        assert_eq!(map.unregister_bin(bin), Err(MemoryMapError::NotFound));
    }

    #[test]
    fn drain_carves_descriptor_pages() {
        let map = free_map(0x10_0000, 16);
        assert_eq!(map.scratch().depth(), 0);
        assert_eq!(map.descriptor_pages(), [pa(0x10_F000)]);
        assert_eq!(map.slab().capacity(), DESCRIPTORS_PER_PAGE);
        assert_eq!(map.pages_of(MemoryType::BOOT_SERVICES_DATA), 1);
    }

    #[test]
    fn drain_without_memory_keeps_entries_staged() {
        let mut map = MemoryMap::new();
        map.add_range(MemoryType::RESERVED, pa(0x1000), pa(0x1FFF), WB).expect("add");
        assert_eq!(
            map.drain(pa(u64::MAX), pa(u64::MAX)),
            Err(MemoryMapError::DescriptorExhausted)
        );
        assert_eq!(map.iter().count(), 1);
    }
}
