//! # Pool Allocator
//!
//! Sub-page allocations, one pool per memory type. Each pool serves small
//! requests from per-class free lists and carves fresh pages (of the type's
//! allocation granularity) when a list runs dry:
//!
//! ```text
//!  granularity-sized pool page
//! +---------+--------------------+----------+----+
//! | request |   larger blocks    |   ...    | 64 |
//! +---------+--------------------+----------+----+
//!  ^ served  ^ carved into free blocks, largest class first
//! ```
//!
//! Requests too large for the pooled classes and guarded requests get
//! pages of their own. A pool page whose blocks are all free again goes
//! back to the page allocator.

pub mod free_list;
pub mod header;
pub mod size_class;

use crate::config::MemoryConfig;
use crate::error::{CorruptionKind, MemoryError};
use crate::phys_memory::PhysMemory;
use alloc::collections::BTreeMap;
use alloc::vec::Vec;
use free_list::FreeLists;
use fw_info::MemoryTypeExt;
use fw_info::memory::POOL_ALIGNMENT;
use fw_memory_addresses::{PAGE_SHIFT, PAGE_SIZE, PhysicalAddress, align_up, bytes_to_pages};
use header::{
    POOL_FREE_SIGNATURE, POOL_HEAD_SIGNATURE, POOL_HEAD_SIZE, POOL_OVERHEAD, POOL_TAIL_SIGNATURE,
    POOL_TAIL_SIZE, PoolHead, PoolTail,
};
use log::{debug, error, trace, warn};
use size_class::{POOL_CLASSES, class_for, class_size, pooled_classes};
use uefi::mem::memory_map::MemoryType;

/// Page services the pool allocator draws from.
pub trait PoolPageSource {
    /// Allocates `pages` pages of `memory_type`, aligned to the type's
    /// granularity.
    ///
    /// # Errors
    /// Any error of the page allocation path.
    fn allocate_pool_pages(
        &self,
        memory_type: MemoryType,
        pages: u64,
        guarded: bool,
    ) -> Result<PhysicalAddress, MemoryError>;

    /// Returns pages obtained from [`allocate_pool_pages`](Self::allocate_pool_pages).
    ///
    /// # Errors
    /// Any error of the page free path.
    fn free_pool_pages(&self, base: PhysicalAddress, pages: u64) -> Result<(), MemoryError>;

    /// Whether `addr` lies in a guarded allocation.
    fn is_guarded(&self, addr: PhysicalAddress) -> bool;
}

/// A released pool buffer.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct FreedPool {
    pub memory_type: MemoryType,
    /// Block size including head and tail.
    pub size: u64,
}

struct Pool {
    memory_type: MemoryType,
    used: u64,
    free: FreeLists,
}

impl Pool {
    const fn new(memory_type: MemoryType) -> Self {
        Self {
            memory_type,
            used: 0,
            free: FreeLists::new(),
        }
    }
}

fn corrupted(head: PhysicalAddress, kind: CorruptionKind) -> MemoryError {
    error!("Pool block at {head}: {kind}");
    MemoryError::Corruption(kind)
}

/// State guarded by the pool lock.
#[derive(Default)]
pub struct PoolState {
    pools: BTreeMap<u32, Pool>,
}

impl PoolState {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            pools: BTreeMap::new(),
        }
    }

    /// Bytes in use in the pool of `memory_type`, bookkeeping included.
    #[must_use]
    pub fn usage(&self, memory_type: MemoryType) -> u64 {
        self.pools.get(&memory_type.0).map_or(0, |pool| pool.used)
    }

    /// Free blocks listed in the pool of `memory_type`.
    #[must_use]
    pub fn free_blocks(&self, memory_type: MemoryType) -> usize {
        self.pools.get(&memory_type.0).map_or(0, |pool| pool.free.len())
    }

    /// Whether a pool for `memory_type` exists.
    #[must_use]
    pub fn has_pool(&self, memory_type: MemoryType) -> bool {
        self.pools.contains_key(&memory_type.0)
    }

    /// Allocates `size` bytes of `memory_type` and returns the buffer.
    ///
    /// # Errors
    /// - [`MemoryError::InvalidParameter`] for a zero size.
    /// - [`MemoryError::OutOfResources`] when the size overflows or no
    ///   pages are left.
    pub fn allocate(
        &mut self,
        memory: &impl PhysMemory,
        pages: &impl PoolPageSource,
        config: &MemoryConfig,
        memory_type: MemoryType,
        size: u64,
        need_guard: bool,
    ) -> Result<PhysicalAddress, MemoryError> {
        if size == 0 {
            return Err(MemoryError::InvalidParameter);
        }
        let total = align_up(size, POOL_ALIGNMENT)
            .and_then(|aligned| aligned.checked_add(POOL_OVERHEAD))
            .ok_or(MemoryError::OutOfResources)?;
        let granularity = config.granularity(memory_type);
        let class = class_for(total);
        let pool = self
            .pools
            .entry(memory_type.0)
            .or_insert_with(|| Pool::new(memory_type));

        let (head, size, has_tail) = if class >= pooled_classes(granularity) || need_guard {
            let has_tail = !need_guard || config.guard.property.pool_head_aligned();
            let total = if has_tail { total } else { total - POOL_TAIL_SIZE };
            let count = align_up(bytes_to_pages(total), granularity >> PAGE_SHIFT)
                .ok_or(MemoryError::OutOfResources)?;
            let base = pages.allocate_pool_pages(memory_type, count, need_guard)?;
            let head = if has_tail {
                base
            } else {
                // Flush against the tail guard.
                base + ((count << PAGE_SHIFT) - total)
            };
            (head, total, has_tail)
        } else {
            let block = match pool.free.pop(class) {
                Some(block) => block,
                None => Self::carve(pool, memory, pages, class, granularity)?,
            };
            (block, total, true)
        };

        PoolHead::new(memory_type, size).write(memory, head);
        if has_tail && let Some(tail) = PoolTail::locate(head, size) {
            PoolTail::new(size).write(memory, tail);
        }
        pool.used += size;
        trace!("Pool {memory_type:?}: {size} bytes at {head}");
        Ok(head + POOL_HEAD_SIZE)
    }

    /// Takes a block of `class` out of a larger free block or a fresh pool
    /// page and files the remainder as free blocks.
    fn carve(
        pool: &mut Pool,
        memory: &impl PhysMemory,
        pages: &impl PoolPageSource,
        class: usize,
        granularity: u64,
    ) -> Result<PhysicalAddress, MemoryError> {
        let limit = pooled_classes(granularity);
        let larger = (class + 1..limit).find_map(|c| pool.free.pop(c).map(|block| (block, c)));
        let (block, end, mut next) = match larger {
            Some((block, c)) => (block, class_size(c), c),
            None => {
                let page =
                    pages.allocate_pool_pages(pool.memory_type, granularity >> PAGE_SHIFT, false)?;
                debug!("New {:?} pool page at {page}", pool.memory_type);
                (page, granularity, limit)
            }
        };

        let mut offset = class_size(class);
        while offset < end && next > 0 {
            next -= 1;
            let size = class_size(next);
            while offset + size <= end {
                let free = block + offset;
                header::mark_free(memory, free, next);
                pool.free.push(next, free);
                offset += size;
            }
        }
        debug_assert_eq!(offset, end);
        Ok(block)
    }

    /// Releases a buffer returned by [`allocate`](Self::allocate).
    ///
    /// # Errors
    /// - [`MemoryError::InvalidParameter`] for addresses that cannot be a
    ///   pool buffer or belong to no pool.
    /// - [`MemoryError::Corruption`] when head or tail are damaged or the
    ///   block is already free.
    pub fn free(
        &mut self,
        memory: &impl PhysMemory,
        pages: &impl PoolPageSource,
        config: &MemoryConfig,
        buffer: PhysicalAddress,
    ) -> Result<FreedPool, MemoryError> {
        let head = buffer
            .checked_sub(POOL_HEAD_SIZE)
            .filter(|_| buffer.is_aligned(POOL_ALIGNMENT))
            .ok_or(MemoryError::InvalidParameter)?;
        let pool_head = PoolHead::read(memory, head);
        match pool_head.signature {
            POOL_HEAD_SIGNATURE => {}
            POOL_FREE_SIGNATURE => return Err(corrupted(head, CorruptionKind::DoubleFree)),
            _ => return Err(corrupted(head, CorruptionKind::HeadSignature)),
        }

        let size = pool_head.size;
        let guarded = pages.is_guarded(head);
        if !guarded || config.guard.property.pool_head_aligned() {
            let tail = PoolTail::locate(head, size)
                .filter(|_| size >= POOL_OVERHEAD)
                .map(|tail| PoolTail::read(memory, tail))
                .ok_or_else(|| corrupted(head, CorruptionKind::SizeMismatch))?;
            if tail.signature != POOL_TAIL_SIGNATURE {
                return Err(corrupted(head, CorruptionKind::TailSignature));
            }
            if tail.size != size {
                return Err(corrupted(head, CorruptionKind::SizeMismatch));
            }
        }

        let memory_type = pool_head.memory_type;
        let Some(pool) = self.pools.get_mut(&memory_type.0) else {
            error!("Pool block at {head} names {memory_type:?}, which has no pool");
            return Err(MemoryError::InvalidParameter);
        };

        let granularity = config.granularity(memory_type);
        let class = class_for(size);
        if class >= pooled_classes(granularity) || guarded {
            let count = align_up(bytes_to_pages(size), granularity >> PAGE_SHIFT)
                .ok_or(MemoryError::InvalidParameter)?;
            let base = if guarded { head.align_down(PAGE_SIZE) } else { head };
            // The head is unreachable once the pages are released.
            memory.write_u32(head, 0);
            if let Err(error) = pages.free_pool_pages(base, count) {
                memory.write_u32(head, POOL_HEAD_SIGNATURE);
                return Err(error);
            }
        } else {
            header::mark_free(memory, head, class);
            pool.free.push(class, head);
            Self::reclaim(pool, memory, pages, head, granularity);
        }
        pool.used = pool.used.saturating_sub(size);

        if (memory_type.is_oem() || memory_type.is_os()) && pool.used == 0 {
            self.pools.remove(&memory_type.0);
        }
        Ok(FreedPool { memory_type, size })
    }

    /// Returns the pool page holding `block` once all its blocks are free.
    ///
    /// A page the page services refuse to take back stays in the pool with
    /// its blocks listed.
    fn reclaim(
        pool: &mut Pool,
        memory: &impl PhysMemory,
        pages: &impl PoolPageSource,
        block: PhysicalAddress,
        granularity: u64,
    ) {
        let page = block.align_down(granularity);
        let mut blocks = Vec::new();
        let mut offset = 0;
        while offset < granularity {
            let at = page + offset;
            let Some(class) = header::free_class(memory, at).filter(|&c| c < POOL_CLASSES) else {
                return;
            };
            blocks.push((class, at));
            offset += class_size(class);
        }
        if offset != granularity {
            return;
        }
        for &(class, at) in &blocks {
            pool.free.remove(class, at);
        }
        debug!("Releasing {:?} pool page {page}", pool.memory_type);
        if let Err(error) = pages.free_pool_pages(page, granularity >> PAGE_SHIFT) {
            warn!("Keeping {:?} pool page {page}: {error}", pool.memory_type);
            for (class, at) in blocks {
                pool.free.push(class, at);
            }
        }
    }
}
