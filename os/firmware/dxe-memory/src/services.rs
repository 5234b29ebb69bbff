//! # Memory Services
//!
//! [`MemoryServices`] owns all allocator state for one boot session and
//! exposes the page, pool and memory map operations.
//!
//! ## Locking
//!
//! ```text
//!  allocate_pool / free_pool
//!          │  pool lock
//!          ▼
//!  PoolState ──(pool pages)──▶ allocate / free page range
//!                                      │  memory lock
//!                                      ▼
//!                                  PageState
//! ```
//!
//! The pool lock is always taken before the memory lock. Guard pages are
//! armed and disarmed after the memory lock was released, because the page
//! protection backend allocates page tables through [`PageAllocator`].

use crate::bins::MemoryTypeStatistics;
use crate::config::{AllocateType, AllocationKind, ConfigError, MemoryConfig};
use crate::error::MemoryError;
use crate::guard::GuardPlan;
use crate::memory_map::snapshot;
use crate::pages::PageState;
use crate::phys_memory::PhysMemory;
use crate::platform::{
    AllocationAction, AllocationEvent, AllocationEventSink, MemoryMapListener, NoResources,
    PageAllocator, PageProtection, ResourcePool,
};
use crate::pool::{PoolPageSource, PoolState};
use alloc::boxed::Box;
use alloc::vec::Vec;
use core::cell::OnceCell;
use core::panic::Location;
use core::sync::atomic::{AtomicBool, Ordering};
use fw_info::MemoryTypeExt;
use fw_info::map::MemoryMapInfo;
use fw_info::memory::{DESCRIPTOR_STRIDE, DESCRIPTOR_VERSION};
use fw_memory_addresses::{PAGE_SHIFT, PAGE_SIZE, PhysicalAddress, align_up};
use fw_sync::{Tpl, TplMutex};
use log::{debug, error, warn};
use uefi::mem::memory_map::{MemoryAttribute, MemoryDescriptor, MemoryType};

/// Page, pool and memory map services of one boot session.
pub struct MemoryServices<M: PhysMemory> {
    memory: M,
    config: MemoryConfig,
    pages: TplMutex<PageState>,
    pools: TplMutex<PoolState>,
    protection: OnceCell<Box<dyn PageProtection>>,
    in_protection_call: AtomicBool,
    events: Option<Box<dyn AllocationEventSink>>,
    listener: Option<Box<dyn MemoryMapListener>>,
}

impl<M: PhysMemory> MemoryServices<M> {
    /// Creates the services with an empty memory map.
    ///
    /// # Errors
    /// Returns the [`ConfigError`] of an inconsistent configuration.
    pub fn new(memory: M, config: MemoryConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            pages: TplMutex::new(
                Tpl::NOTIFY,
                "memory lock",
                PageState::new(&config, Box::new(NoResources)),
            ),
            pools: TplMutex::new(Tpl::NOTIFY, "pool lock", PoolState::new()),
            protection: OnceCell::new(),
            in_protection_call: AtomicBool::new(false),
            events: None,
            listener: None,
            memory,
            config,
        })
    }

    /// Uses `resources` for promotion and out-of-band snapshot regions.
    #[must_use]
    pub fn with_resources(mut self, resources: Box<dyn ResourcePool>) -> Self {
        self.pages.get_mut().resources = resources;
        self
    }

    #[must_use]
    pub fn with_event_sink(mut self, sink: Box<dyn AllocationEventSink>) -> Self {
        self.events = Some(sink);
        self
    }

    #[must_use]
    pub fn with_listener(mut self, listener: Box<dyn MemoryMapListener>) -> Self {
        self.listener = Some(listener);
        self
    }

    #[must_use]
    pub const fn config(&self) -> &MemoryConfig {
        &self.config
    }

    #[must_use]
    pub const fn memory(&self) -> &M {
        &self.memory
    }

    /// The current generation key of the memory map.
    #[must_use]
    pub fn map_key(&self) -> usize {
        self.pages.lock().map.map_key()
    }

    /// Tracks `pages` pages at `start` as `memory_type` and returns the
    /// number of pages that were not tracked before.
    ///
    /// Adding the first conventional memory places the memory type bins.
    ///
    /// # Errors
    /// - [`MemoryError::InvalidParameter`] for an empty, misaligned or
    ///   overflowing range.
    /// - [`MemoryError::OutOfResources`] when the bootstrap descriptor
    ///   stack cannot hold the entries the range needs.
    pub fn add_memory_descriptor(
        &self,
        memory_type: MemoryType,
        start: PhysicalAddress,
        pages: u64,
        attribute: MemoryAttribute,
    ) -> Result<u64, MemoryError> {
        if !start.is_aligned(PAGE_SIZE) {
            return Err(MemoryError::InvalidParameter);
        }
        let (added, key) = self.mutate(|state, config| {
            state.add_memory(memory_type, start, pages, attribute, config)
        })?;
        self.notify(key);
        Ok(added)
    }

    /// Places the memory type bins inside `[start, start + length)`.
    ///
    /// # Errors
    /// [`MemoryError::OutOfResources`] when the bins were already placed or
    /// do not fit.
    pub fn set_memory_type_information_range(
        &self,
        start: PhysicalAddress,
        length: u64,
    ) -> Result<(), MemoryError> {
        let ((), key) = self.mutate(|state, config| state.set_bin_range(start, length, config))?;
        self.notify(key);
        Ok(())
    }

    /// Runs `f` under the memory lock. Returns the new map key if the map
    /// changed.
    fn mutate<T>(
        &self,
        f: impl FnOnce(&mut PageState, &MemoryConfig) -> Result<T, MemoryError>,
    ) -> Result<(T, Option<usize>), MemoryError> {
        let mut state = self.pages.lock();
        let before = state.map.map_key();
        let result = f(&mut *state, &self.config);
        if state.map.take_zero_page_request() && !self.config.guard.property.null_detection() {
            self.memory.fill(PhysicalAddress::zero(), PAGE_SIZE, 0);
        }
        let after = state.map.map_key();
        Ok((result?, (after != before).then_some(after)))
    }

    fn notify(&self, key: Option<usize>) {
        if let (Some(listener), Some(key)) = (&self.listener, key) {
            listener.memory_map_changed(key);
        }
    }

    fn record(
        &self,
        caller: &'static Location<'static>,
        action: AllocationAction,
        memory_type: MemoryType,
        size: u64,
        buffer: PhysicalAddress,
    ) {
        let Some(sink) = &self.events else {
            return;
        };
        let event = AllocationEvent {
            caller,
            action,
            memory_type,
            size,
            buffer,
        };
        if let Err(error) = sink.record(&event) {
            warn!("{error}: {action:?} of {size} bytes at {buffer} from {caller}");
        }
    }

    fn should_guard(
        &self,
        memory_type: MemoryType,
        kind: AllocationKind,
        allocate: AllocateType,
    ) -> bool {
        let reentrant = self.in_protection_call.load(Ordering::Acquire);
        self.pages.lock().guard.should_guard(
            memory_type,
            kind,
            allocate,
            self.config.granularity(memory_type),
            reentrant,
        )
    }

    /// Allocates `pages` pages of `memory_type`.
    ///
    /// Runtime types are rounded up to the runtime granularity.
    ///
    /// # Errors
    /// - [`MemoryError::InvalidParameter`] for a zero count, a type that
    ///   cannot be allocated, a misaligned exact address or a ceiling below
    ///   the first page.
    /// - [`MemoryError::NotFound`] when an exact range is not free.
    /// - [`MemoryError::OutOfResources`] when no free range fits.
    #[track_caller]
    pub fn allocate_pages(
        &self,
        allocate: AllocateType,
        memory_type: MemoryType,
        pages: u64,
    ) -> Result<PhysicalAddress, MemoryError> {
        let caller = Location::caller();
        let need_guard = self.should_guard(memory_type, AllocationKind::Page, allocate);
        let base = self.allocate_page_range(allocate, memory_type, pages, need_guard)?;
        self.record(
            caller,
            AllocationAction::AllocatePages,
            memory_type,
            pages << PAGE_SHIFT,
            base,
        );
        Ok(base)
    }

    fn allocate_page_range(
        &self,
        allocate: AllocateType,
        memory_type: MemoryType,
        pages: u64,
        need_guard: bool,
    ) -> Result<PhysicalAddress, MemoryError> {
        if pages == 0 || !memory_type.is_valid_allocation_type() {
            return Err(MemoryError::InvalidParameter);
        }
        let granularity = self.config.granularity(memory_type);
        let pages = align_up(pages, granularity >> PAGE_SHIFT).ok_or(MemoryError::OutOfResources)?;
        let ((base, plan), key) = self.mutate(|state, _| {
            state.allocate(allocate, memory_type, pages, granularity, need_guard)
        })?;
        if need_guard {
            debug!("Guarded {pages} pages of {memory_type:?} at {base}");
        }
        self.apply_plan(&plan);
        self.notify(key);
        Ok(base)
    }

    /// Returns `pages` pages at `base` to free memory.
    ///
    /// # Errors
    /// - [`MemoryError::InvalidParameter`] for a zero count or a base not
    ///   aligned to the granularity of its type.
    /// - [`MemoryError::NotFound`] when any page of the range is not
    ///   allocated.
    #[track_caller]
    pub fn free_pages(&self, base: PhysicalAddress, pages: u64) -> Result<(), MemoryError> {
        let caller = Location::caller();
        let memory_type = self.free_page_range(base, pages)?;
        self.record(
            caller,
            AllocationAction::FreePages,
            memory_type,
            pages << PAGE_SHIFT,
            base,
        );
        Ok(())
    }

    /// Guard pages are remapped outside the lock, between validating the
    /// free and releasing the pages. A failed release re-arms the guards.
    fn free_page_range(
        &self,
        base: PhysicalAddress,
        pages: u64,
    ) -> Result<MemoryType, MemoryError> {
        let pending = self.pages.lock().begin_free(base, pages, &self.config)?;
        self.apply_plan(&pending.plan);
        let key = match self.mutate(|state, _| state.finish_free(&pending)) {
            Ok(((), key)) => key,
            Err(error) => {
                warn!("Free of {pages} pages at {base} failed: {error}");
                let undo = self.pages.lock().abort_free(&pending);
                self.apply_plan(&undo);
                return Err(error);
            }
        };
        self.notify(key);
        Ok(pending.memory_type)
    }

    /// Writes a snapshot of the memory map into `buffer`.
    ///
    /// # Errors
    /// [`MemoryError::BufferTooSmall`] with the number of bytes the snapshot
    /// needs. Nothing is written in that case.
    pub fn get_memory_map(&self, buffer: &mut [u8]) -> Result<MemoryMapInfo, MemoryError> {
        let state = self.pages.lock();
        let descriptors = state.descriptors();
        let map_size = snapshot::encode(&descriptors, buffer)?;
        Ok(MemoryMapInfo {
            map_key: state.map.map_key(),
            map_size,
            descriptor_size: DESCRIPTOR_STRIDE,
            descriptor_version: DESCRIPTOR_VERSION,
        })
    }

    /// The memory map snapshot as descriptors, with its map key.
    #[must_use]
    pub fn memory_map_descriptors(&self) -> (Vec<MemoryDescriptor>, usize) {
        let state = self.pages.lock();
        (state.descriptors(), state.map.map_key())
    }

    /// Allocates `size` bytes of `memory_type`, 8-byte aligned.
    ///
    /// # Errors
    /// - [`MemoryError::InvalidParameter`] for a zero size or a type that
    ///   cannot be allocated.
    /// - [`MemoryError::OutOfResources`] when no pages are left.
    #[track_caller]
    pub fn allocate_pool(
        &self,
        memory_type: MemoryType,
        size: u64,
    ) -> Result<PhysicalAddress, MemoryError> {
        let caller = Location::caller();
        if !memory_type.is_valid_allocation_type() {
            return Err(MemoryError::InvalidParameter);
        }
        let need_guard =
            self.should_guard(memory_type, AllocationKind::Pool, AllocateType::AnyPages);
        let buffer = self.pools.lock().allocate(
            &self.memory,
            &PoolPages(self),
            &self.config,
            memory_type,
            size,
            need_guard,
        )?;
        self.record(
            caller,
            AllocationAction::AllocatePool,
            memory_type,
            size,
            buffer,
        );
        Ok(buffer)
    }

    /// Releases a buffer obtained from [`allocate_pool`](Self::allocate_pool).
    ///
    /// # Errors
    /// - [`MemoryError::InvalidParameter`] for a null or foreign buffer.
    /// - [`MemoryError::Corruption`] when the block was overrun or already
    ///   freed.
    #[track_caller]
    pub fn free_pool(&self, buffer: PhysicalAddress) -> Result<(), MemoryError> {
        let caller = Location::caller();
        if buffer.is_null() {
            return Err(MemoryError::InvalidParameter);
        }
        let freed = self
            .pools
            .lock()
            .free(&self.memory, &PoolPages(self), &self.config, buffer)?;
        self.record(
            caller,
            AllocationAction::FreePool,
            freed.memory_type,
            freed.size,
            buffer,
        );
        Ok(())
    }

    /// Bytes in use in the pool of `memory_type`.
    #[must_use]
    pub fn pool_usage(&self, memory_type: MemoryType) -> u64 {
        self.pools.lock().usage(memory_type)
    }

    /// Bin and usage figures of every memory type.
    #[must_use]
    pub fn memory_type_statistics(&self) -> Vec<MemoryTypeStatistics> {
        let state = self.pages.lock();
        state.bins.statistics(&state.map)
    }

    /// Whether `addr` lies in a guarded allocation.
    #[must_use]
    pub fn is_guarded(&self, addr: PhysicalAddress) -> bool {
        self.pages.lock().guard.is_guarded(addr)
    }

    /// Makes page protection available and arms every guard page recorded
    /// so far.
    ///
    /// # Errors
    /// [`MemoryError::InvalidParameter`] when a backend is already installed.
    pub fn install_page_protection(
        &self,
        protection: Box<dyn PageProtection>,
    ) -> Result<(), MemoryError> {
        if self.protection.set(protection).is_err() {
            return Err(MemoryError::InvalidParameter);
        }
        let plan = self.pages.lock().guard.armed_guards();
        if !plan.is_empty() {
            warn!("Arming {} deferred guard pages", plan.unmap.len());
        }
        self.apply_plan(&plan);
        Ok(())
    }

    /// Changes the page tables as `plan` requires. Must not run under the
    /// memory lock.
    fn apply_plan(&self, plan: &GuardPlan) {
        if plan.is_empty() {
            return;
        }
        let Some(protection) = self.protection.get() else {
            return;
        };
        let outer = self.in_protection_call.swap(true, Ordering::AcqRel);
        for &page in &plan.remap {
            if let Err(error) = protection.set_present(self, page, MemoryAttribute::empty()) {
                error!("Cannot remap former guard page {page}: {error}");
            }
        }
        for &page in &plan.unmap {
            if let Err(error) = protection.set_not_present(self, page) {
                error!("Cannot unmap guard page {page}: {error}");
            }
        }
        self.in_protection_call.store(outer, Ordering::Release);
    }
}

impl<M: PhysMemory> PageAllocator for MemoryServices<M> {
    fn allocate_pages(
        &self,
        memory_type: MemoryType,
        pages: u64,
    ) -> Result<PhysicalAddress, MemoryError> {
        self.allocate_page_range(AllocateType::AnyPages, memory_type, pages, false)
    }

    fn free_pages(&self, base: PhysicalAddress, pages: u64) -> Result<(), MemoryError> {
        self.free_page_range(base, pages).map(|_| ())
    }
}

/// The page path as seen from the pool allocator.
struct PoolPages<'a, M: PhysMemory>(&'a MemoryServices<M>);

impl<M: PhysMemory> PoolPageSource for PoolPages<'_, M> {
    fn allocate_pool_pages(
        &self,
        memory_type: MemoryType,
        pages: u64,
        guarded: bool,
    ) -> Result<PhysicalAddress, MemoryError> {
        self.0
            .allocate_page_range(AllocateType::AnyPages, memory_type, pages, guarded)
    }

    fn free_pool_pages(&self, base: PhysicalAddress, pages: u64) -> Result<(), MemoryError> {
        self.0.free_page_range(base, pages).map(|_| ())
    }

    fn is_guarded(&self, addr: PhysicalAddress) -> bool {
        self.0.is_guarded(addr)
    }
}
