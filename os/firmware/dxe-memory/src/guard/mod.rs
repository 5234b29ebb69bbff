//! # Heap Guard
//!
//! Surrounds guarded page allocations with not-present pages so that
//! overruns fault immediately. Adjacent guarded allocations share the guard
//! page between them.
//!
//! The manager only does bookkeeping. Whatever needs to change in the page
//! tables is returned as a [`GuardPlan`], which the caller applies once it
//! released the memory lock.

pub mod bitmap;

use crate::config::{AllocateType, AllocationKind, GuardPolicy};
use alloc::vec::Vec;
use bitmap::GuardBitmap;
use fw_memory_addresses::{PAGE_SHIFT, PAGE_SIZE, PhysicalAddress};
use log::{debug, trace};
use uefi::mem::memory_map::MemoryType;

/// Page table changes produced by a guard operation.
#[derive(Debug, Default, Clone, Eq, PartialEq)]
pub struct GuardPlan {
    /// Pages that became guard pages.
    pub unmap: Vec<PhysicalAddress>,
    /// Former guard pages that are ordinary memory again.
    pub remap: Vec<PhysicalAddress>,
}

impl GuardPlan {
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.unmap.is_empty() && self.remap.is_empty()
    }

    fn unmap(&mut self, page: PhysicalAddress) {
        if !self.unmap.contains(&page) {
            self.unmap.push(page);
        }
    }

    fn remap(&mut self, page: PhysicalAddress) {
        if !self.remap.contains(&page) {
            self.remap.push(page);
        }
    }
}

/// Guard policy plus the per-page guarded state.
pub struct GuardManager {
    policy: GuardPolicy,
    bitmap: GuardBitmap,
}

impl GuardManager {
    #[must_use]
    pub const fn new(policy: GuardPolicy) -> Self {
        Self {
            policy,
            bitmap: GuardBitmap::new(),
        }
    }

    #[must_use]
    pub const fn policy(&self) -> &GuardPolicy {
        &self.policy
    }

    #[must_use]
    pub const fn bitmap(&self) -> &GuardBitmap {
        &self.bitmap
    }

    #[must_use]
    pub fn is_guarded(&self, addr: PhysicalAddress) -> bool {
        self.bitmap.is_guarded(addr)
    }

    /// Decides whether a new allocation gets guard pages.
    ///
    /// Exact-address requests and types allocated in units larger than a
    /// page are never guarded, and neither is anything the page protection
    /// backend allocates for itself (`reentrant`).
    #[must_use]
    pub fn should_guard(
        &self,
        memory_type: MemoryType,
        kind: AllocationKind,
        allocate: AllocateType,
        granularity: u64,
        reentrant: bool,
    ) -> bool {
        !reentrant
            && !matches!(allocate, AllocateType::Address(_))
            && granularity == PAGE_SIZE
            && self.policy.guards(memory_type, kind)
    }

    /// Reads the marks of the two pages directly below `addr`.
    ///
    /// Bit 0 is the page at `addr - 2 pages`, bit 1 the page right below.
    fn two_below(&self, addr: PhysicalAddress) -> u64 {
        match addr.checked_sub(2 * PAGE_SIZE) {
            Some(below) => self.bitmap.get_bits(below, 2),
            None => match addr.checked_sub(PAGE_SIZE) {
                Some(below) => self.bitmap.get_bits(below, 1) << 1,
                None => 0,
            },
        }
    }

    fn is_guard_page_at(&self, addr: Option<PhysicalAddress>) -> bool {
        addr.is_some_and(|a| self.bitmap.is_guard_page(a))
    }

    /// Highest usable end address for a guarded allocation of `requested`
    /// bytes inside the free range `[start, start + size)`.
    ///
    /// Room is left for a tail guard unless the page above the range already
    /// is one, and for a head guard unless the page below the allocation
    /// already is one. `None` when the range cannot host the allocation.
    #[must_use]
    pub fn search_end(&self, start: u64, size: u64, requested: u64) -> Option<u64> {
        let top = start.checked_add(size)?;
        let mut target = top.checked_sub(requested)?;
        if target == 0 {
            return None;
        }
        if !self.is_guard_page_at(Some(PhysicalAddress::new(top))) {
            target = target.checked_sub(PAGE_SIZE)?;
        }
        if target < start {
            return None;
        }
        if target == start
            && !self.is_guard_page_at(PhysicalAddress::new(target).checked_sub(PAGE_SIZE))
        {
            return None;
        }
        Some(target + requested - 1)
    }

    /// Widens the payload `[base, base + pages)` by the guard pages it does
    /// not share with a neighbor. The result is what gets allocated.
    #[must_use]
    pub fn allocation_span(&self, base: PhysicalAddress, pages: u64) -> (PhysicalAddress, u64) {
        let mut start = base;
        let mut count = pages;
        if !self.is_guard_page_at(base.checked_add(pages << PAGE_SHIFT)) {
            count += 1;
        }
        if !self.is_guard_page_at(base.checked_sub(PAGE_SIZE))
            && let Some(head) = base.checked_sub(PAGE_SIZE)
        {
            start = head;
            count += 1;
        }
        (start, count)
    }

    /// Records the payload `[base, base + pages)` as guarded.
    ///
    /// Guard pages already guarding a neighbor are left alone.
    pub fn place_guards(&mut self, base: PhysicalAddress, pages: u64) -> GuardPlan {
        let mut plan = GuardPlan::default();
        if let Some(head) = base.checked_sub(PAGE_SIZE)
            && !self.bitmap.is_guard_page(head)
        {
            plan.unmap(head);
        }
        if let Some(tail) = base.checked_add(pages << PAGE_SHIFT)
            && !self.bitmap.is_guard_page(tail)
        {
            plan.unmap(tail);
        }
        self.bitmap.set_bits(base, pages);
        trace!("Guarding {pages} pages at {base}");
        plan
    }

    /// Range to return to free memory when releasing the guarded payload
    /// `[base, base + pages)`.
    ///
    /// Unshared guard pages are released with the payload. When the freed
    /// pages border payload that stays allocated, the bordering page is
    /// kept back to become that payload's new guard.
    #[must_use]
    pub fn free_span(&self, base: PhysicalAddress, pages: u64) -> (PhysicalAddress, u64) {
        if pages == 0 {
            return (base, 0);
        }
        let mut start = base;
        let mut count = pages;

        let below = self.two_below(base);
        if below & 0b10 == 0 {
            if below & 0b01 == 0
                && let Some(head) = base.checked_sub(PAGE_SIZE)
            {
                start = head;
                count += 1;
            }
        } else {
            start += PAGE_SIZE;
            count -= 1;
        }

        let end = base + (pages << PAGE_SHIFT);
        let above = self.bitmap.get_bits(end, 2);
        if above & 0b01 == 0 {
            if above & 0b10 == 0 {
                count += 1;
            }
        } else if count > 0 {
            count -= 1;
        }
        (start, count)
    }

    /// Forgets the guarded payload `[base, base + pages)`.
    ///
    /// Guard pages nobody needs anymore are restored. Pages at the edges of
    /// a partial free become the guards of the payload that stays.
    pub fn remove_guards(&mut self, base: PhysicalAddress, pages: u64) -> GuardPlan {
        let mut plan = GuardPlan::default();
        if pages == 0 {
            return plan;
        }

        let below = self.two_below(base);
        if below & 0b10 == 0 {
            if below & 0b01 == 0
                && let Some(head) = base.checked_sub(PAGE_SIZE)
            {
                plan.remap(head);
            }
        } else {
            plan.unmap(base);
        }

        let end = base + (pages << PAGE_SHIFT);
        let above = self.bitmap.get_bits(end, 2);
        if above & 0b01 == 0 {
            if above & 0b10 == 0 {
                plan.remap(end);
            }
        } else {
            plan.unmap(end - PAGE_SIZE);
        }

        self.bitmap.clear_bits(base, pages);
        trace!("Unguarding {pages} pages at {base}");
        plan
    }

    /// Takes back a [`remove_guards`](Self::remove_guards) whose pages could
    /// not be released. Returns the page table changes that undo `removed`.
    pub fn restore_guards(
        &mut self,
        base: PhysicalAddress,
        pages: u64,
        removed: &GuardPlan,
    ) -> GuardPlan {
        self.bitmap.set_bits(base, pages);
        debug!("Re-guarding {pages} pages at {base}");
        GuardPlan {
            unmap: removed.remap.clone(),
            remap: removed.unmap.clone(),
        }
    }

    /// Every guard page currently implied by the bitmap.
    ///
    /// Used to arm the guards of allocations made before page protection
    /// was available.
    #[must_use]
    pub fn armed_guards(&self) -> GuardPlan {
        let mut plan = GuardPlan::default();
        for (start, pages) in self.bitmap.guarded_runs() {
            if let Some(head) = start.checked_sub(PAGE_SIZE) {
                plan.unmap(head);
            }
            if let Some(tail) = start.checked_add(pages << PAGE_SHIFT) {
                plan.unmap(tail);
            }
        }
        debug!("{} guard pages pending", plan.unmap.len());
        plan
    }
}
