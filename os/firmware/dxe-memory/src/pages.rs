//! Page allocation paths. Everything here runs under the memory lock.

use crate::bins::BinManager;
use crate::config::{AllocateType, MemoryConfig};
use crate::error::{MemoryError, MemoryMapError};
use crate::guard::{GuardManager, GuardPlan};
use crate::memory_map::snapshot;
use crate::memory_map::{BinRange, Conversion, MemoryMap};
use crate::platform::ResourcePool;
use alloc::boxed::Box;
use alloc::vec::Vec;
use fw_memory_addresses::{PAGE_SHIFT, PAGE_SIZE, PhysicalAddress, align_up, pages_to_bytes};
use log::{debug, warn};
use uefi::mem::memory_map::{MemoryAttribute, MemoryDescriptor, MemoryType};

/// A free that has been validated and unguarded but not yet released.
///
/// Guard pages in `plan` must be remapped before `release` is returned to
/// free memory.
#[derive(Debug)]
pub struct PendingFree {
    pub memory_type: MemoryType,
    /// Pages that go back to free memory, if any.
    pub release: Option<(PhysicalAddress, u64)>,
    pub plan: GuardPlan,
    /// The guarded payload whose guards `plan` drops.
    pub unguarded: Option<(PhysicalAddress, u64)>,
}

/// State guarded by the memory lock.
pub struct PageState {
    pub map: MemoryMap,
    pub bins: BinManager,
    pub guard: GuardManager,
    pub resources: Box<dyn ResourcePool>,
}

impl PageState {
    #[must_use]
    pub fn new(config: &MemoryConfig, resources: Box<dyn ResourcePool>) -> Self {
        Self {
            map: MemoryMap::new(),
            bins: BinManager::new(config),
            guard: GuardManager::new(config.guard),
            resources,
        }
    }

    /// Moves staged map entries into permanent storage.
    fn drain(&mut self) {
        if let Err(error) = self
            .map
            .drain(self.bins.default_ceiling(), self.bins.max_address())
        {
            debug!("Map drain incomplete: {error}");
        }
    }

    /// Tracks new memory and places the type bins once conventional memory
    /// is available.
    ///
    /// # Errors
    /// [`MemoryError::InvalidParameter`] for empty or overflowing ranges and
    /// anything [`MemoryMap::add_range`] reports.
    pub fn add_memory(
        &mut self,
        memory_type: MemoryType,
        start: PhysicalAddress,
        pages: u64,
        attribute: MemoryAttribute,
        config: &MemoryConfig,
    ) -> Result<u64, MemoryError> {
        let end = pages_to_bytes(pages)
            .filter(|_| pages > 0)
            .and_then(|bytes| start.checked_add(bytes - 1))
            .ok_or(MemoryError::InvalidParameter)?;
        let added = self.map.add_range(memory_type, start, end, attribute)?;

        // Bins go first so that descriptor pages land below them.
        if memory_type == MemoryType::CONVENTIONAL
            && !self.bins.is_initialized()
            && self.bins.reserve_from_map(&self.map, config)
        {
            self.register_bins()?;
        }
        self.drain();
        Ok(added)
    }

    /// Places the type bins inside a given range instead of the top of
    /// memory.
    ///
    /// # Errors
    /// [`MemoryError::OutOfResources`] when the bins do not fit or were
    /// already placed.
    pub fn set_bin_range(
        &mut self,
        start: PhysicalAddress,
        length: u64,
        config: &MemoryConfig,
    ) -> Result<(), MemoryError> {
        if !self.bins.reserve_in_range(start, length, config) {
            return Err(MemoryError::OutOfResources);
        }
        self.register_bins()
    }

    /// Records the planned bins in the map. Either all of them are
    /// recorded or none is, and placement is retried later.
    fn register_bins(&mut self) -> Result<(), MemoryError> {
        let ranges: Vec<BinRange> = self.bins.special_ranges().collect();
        for (done, range) in ranges.iter().enumerate() {
            if let Err(error) = self.map.register_bin(*range) {
                warn!("Cannot record {:?} bin: {error}", range.memory_type);
                for registered in ranges[..done].iter().rev() {
                    if let Err(error) = self.map.unregister_bin(*registered) {
                        warn!("Cannot drop {:?} bin: {error}", registered.memory_type);
                    }
                }
                self.bins.reset();
                return Err(error.into());
            }
            self.drain();
        }
        Ok(())
    }

    /// Asks the resource map for more memory. Returns whether any was added.
    fn promote(&mut self) -> bool {
        let mut promoted = false;
        for range in self.resources.promote_untested() {
            let Some(end) = range
                .start
                .checked_add(range.length)
                .and_then(|end| end.checked_sub(1))
                .filter(|_| range.length >> PAGE_SHIFT > 0)
            else {
                continue;
            };
            match self
                .map
                .add_range(MemoryType::CONVENTIONAL, range.start, end, range.attribute)
            {
                Ok(pages) => {
                    debug!("Promoted {pages} pages at {}", range.start);
                    promoted = true;
                }
                Err(error) => warn!("Cannot track promoted memory at {}: {error}", range.start),
            }
            self.drain();
        }
        promoted
    }

    fn find_pages(
        &mut self,
        memory_type: MemoryType,
        pages: u64,
        ceiling: PhysicalAddress,
        alignment: u64,
        need_guard: bool,
    ) -> Option<PhysicalAddress> {
        let found = self.bins.find_pages(
            &self.map,
            memory_type,
            pages,
            ceiling,
            alignment,
            need_guard.then_some(&self.guard),
        );
        if found.is_some() || !self.promote() {
            return found;
        }
        self.bins.find_pages(
            &self.map,
            memory_type,
            pages,
            ceiling,
            alignment,
            need_guard.then_some(&self.guard),
        )
    }

    /// Allocates `pages` pages of `memory_type`.
    ///
    /// `pages` must already be a multiple of `alignment`. Guarded
    /// allocations return the payload base and the guard pages to unmap.
    ///
    /// # Errors
    /// - [`MemoryError::InvalidParameter`] for a misaligned exact address or
    ///   a ceiling below the first page.
    /// - [`MemoryError::NotFound`] when an exact range is not free.
    /// - [`MemoryError::OutOfResources`] when no free range fits.
    pub fn allocate(
        &mut self,
        allocate: AllocateType,
        memory_type: MemoryType,
        pages: u64,
        alignment: u64,
        need_guard: bool,
    ) -> Result<(PhysicalAddress, GuardPlan), MemoryError> {
        let bytes = pages_to_bytes(pages).ok_or(MemoryError::OutOfResources)?;
        let ceiling = match allocate {
            AllocateType::Address(base) => {
                self.allocate_at(base, pages, bytes, memory_type, alignment)?;
                return Ok((base, GuardPlan::default()));
            }
            AllocateType::MaxAddress(ceiling) if ceiling.as_u64() < PAGE_SIZE - 1 => {
                return Err(MemoryError::InvalidParameter);
            }
            AllocateType::MaxAddress(ceiling) => ceiling,
            AllocateType::AnyPages => self.bins.max_address(),
        };

        let base = self
            .find_pages(memory_type, pages, ceiling, alignment, need_guard)
            .ok_or(MemoryError::OutOfResources)?;
        let plan = if need_guard {
            let (start, count) = self.guard.allocation_span(base, pages);
            self.map
                .convert_range(start, count, Conversion::Type(memory_type))?;
            self.guard.place_guards(base, pages)
        } else {
            self.map
                .convert_range(base, pages, Conversion::Type(memory_type))?;
            GuardPlan::default()
        };
        self.drain();
        Ok((base, plan))
    }

    fn allocate_at(
        &mut self,
        base: PhysicalAddress,
        pages: u64,
        bytes: u64,
        memory_type: MemoryType,
        alignment: u64,
    ) -> Result<(), MemoryError> {
        if !base.is_aligned(alignment) {
            return Err(MemoryError::InvalidParameter);
        }
        let end = base
            .checked_add(bytes - 1)
            .filter(|end| *end <= self.bins.max_address())
            .ok_or(MemoryError::NotFound)?;
        let conversion = Conversion::Type(memory_type);
        match self.map.convert_range(base, pages, conversion) {
            Err(MemoryMapError::NotFound) if self.promote() => {
                self.map.convert_range(base, pages, conversion)?;
            }
            result => result?,
        }
        debug!("Allocated {base}..={end} as {memory_type:?}");
        self.drain();
        Ok(())
    }

    /// Validates a page free and drops its guard bookkeeping.
    ///
    /// Nothing is returned to free memory yet, see [`finish_free`](Self::finish_free).
    ///
    /// # Errors
    /// - [`MemoryError::InvalidParameter`] for a zero count or a base not
    ///   aligned to the type's granularity.
    /// - [`MemoryError::NotFound`] when a page is not allocated.
    pub fn begin_free(
        &mut self,
        base: PhysicalAddress,
        pages: u64,
        config: &MemoryConfig,
    ) -> Result<PendingFree, MemoryError> {
        if pages == 0 {
            return Err(MemoryError::InvalidParameter);
        }
        let entry = self
            .map
            .find(base)
            .filter(|entry| !entry.is_free())
            .ok_or(MemoryError::NotFound)?;
        let memory_type = entry.memory_type;
        let granularity = config.granularity(memory_type);
        if !base.is_aligned(granularity) {
            return Err(MemoryError::InvalidParameter);
        }
        let pages = align_up(pages, granularity >> PAGE_SHIFT).ok_or(MemoryError::NotFound)?;
        if !self.map.is_allocated(base, pages) {
            return Err(MemoryError::NotFound);
        }

        if !self.guard.is_guarded(base) {
            return Ok(PendingFree {
                memory_type,
                release: Some((base, pages)),
                plan: GuardPlan::default(),
                unguarded: None,
            });
        }
        let (start, count) = self.guard.free_span(base, pages);
        let plan = self.guard.remove_guards(base, pages);
        Ok(PendingFree {
            memory_type,
            release: (count > 0).then_some((start, count)),
            plan,
            unguarded: Some((base, pages)),
        })
    }

    /// Returns the pages of a validated free to free memory.
    ///
    /// # Errors
    /// Anything [`MemoryMap::convert_range`] reports.
    pub fn finish_free(&mut self, pending: &PendingFree) -> Result<(), MemoryError> {
        if let Some((start, pages)) = pending.release {
            self.map
                .convert_range(start, pages, Conversion::Type(MemoryType::CONVENTIONAL))?;
            self.drain();
        }
        Ok(())
    }

    /// Re-arms the guards of a free whose [`finish_free`](Self::finish_free)
    /// failed. The returned plan undoes `pending.plan`.
    pub fn abort_free(&mut self, pending: &PendingFree) -> GuardPlan {
        match pending.unguarded {
            Some((base, pages)) => self.guard.restore_guards(base, pages, &pending.plan),
            None => GuardPlan::default(),
        }
    }

    /// Descriptors of the current map plus the out-of-band regions.
    #[must_use]
    pub fn descriptors(&self) -> Vec<MemoryDescriptor> {
        snapshot::descriptors(&self.map, &self.resources.out_of_band_regions())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{GuardPolicy, HeapGuardProperty};
    use crate::platform::NoResources;

    const BS: MemoryType = MemoryType::BOOT_SERVICES_DATA;

    fn guarded_state() -> (PageState, MemoryConfig) {
        let config = MemoryConfig::default().with_guard(
            GuardPolicy::default()
                .with_page_type_mask(GuardPolicy::type_bit(BS))
                .with_property(HeapGuardProperty::new().with_page_guard(true)),
        );
        let mut state = PageState::new(&config, Box::new(NoResources));
        state
            .add_memory(
                MemoryType::CONVENTIONAL,
                PhysicalAddress::new(0x10_0000),
                256,
                MemoryAttribute::WRITE_BACK,
                &config,
            )
            .expect("add");
        (state, config)
    }

    #[test]
    fn aborted_free_rearms_the_guards() {
        let (mut state, config) = guarded_state();
        let (base, placed) = state
            .allocate(AllocateType::AnyPages, BS, 3, PAGE_SIZE, true)
            .expect("alloc");
        let top = base + 2 * PAGE_SIZE;

        let pending = state.begin_free(top, 1, &config).expect("begin");
        assert_eq!(pending.unguarded, Some((top, 1)));
        assert!(!state.guard.is_guarded(top));

        let undo = state.abort_free(&pending);
        assert_eq!(undo.unmap, pending.plan.remap);
        assert_eq!(undo.remap, pending.plan.unmap);
        assert!(state.guard.is_guarded(top));
        assert_eq!(state.guard.armed_guards().unmap, placed.unmap);
        assert!(state.map.is_allocated(base, 3));

        // The pages are still ours to free.
        let pending = state.begin_free(base, 3, &config).expect("begin");
        state.finish_free(&pending).expect("finish");
        assert!(!state.guard.is_guarded(base));
    }

    #[test]
    fn unguarded_free_has_nothing_to_rearm() {
        let (mut state, config) = guarded_state();
        let (base, _) = state
            .allocate(AllocateType::AnyPages, MemoryType::LOADER_DATA, 2, PAGE_SIZE, false)
            .expect("alloc");
        let pending = state.begin_free(base, 2, &config).expect("begin");
        assert_eq!(pending.unguarded, None);
        assert!(state.abort_free(&pending).is_empty());
    }
}
