//! Free pool blocks, one list per size class.
//!
//! Blocks are identified by address; the block itself only carries a
//! marker (see [`header`](super::header)). List order carries no meaning.
//!
//! # Invariants
//! - A block is on at most one list, at most once.
//! - Every listed block is marked free in memory with the list's class.

use super::size_class::POOL_CLASSES;
use alloc::vec::Vec;
use fw_memory_addresses::PhysicalAddress;

pub struct FreeLists {
    lists: [Vec<PhysicalAddress>; POOL_CLASSES],
}

impl Default for FreeLists {
    fn default() -> Self {
        Self::new()
    }
}

impl FreeLists {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            lists: [const { Vec::new() }; POOL_CLASSES],
        }
    }

    pub fn push(&mut self, class: usize, block: PhysicalAddress) {
        debug_assert!(!self.contains(class, block), "{block} listed twice");
        self.lists[class].push(block);
    }

    pub fn pop(&mut self, class: usize) -> Option<PhysicalAddress> {
        self.lists[class].pop()
    }

    /// Unlinks `block`; returns whether it was listed.
    pub fn remove(&mut self, class: usize, block: PhysicalAddress) -> bool {
        let list = &mut self.lists[class];
        list.iter()
            .position(|&listed| listed == block)
            .map(|index| list.swap_remove(index))
            .is_some()
    }

    #[must_use]
    pub fn contains(&self, class: usize, block: PhysicalAddress) -> bool {
        self.lists[class].contains(&block)
    }

    #[must_use]
    pub fn class_len(&self, class: usize) -> usize {
        self.lists[class].len()
    }

    /// Total number of free blocks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lists.iter().map(Vec::len).sum()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lists.iter().all(Vec::is_empty)
    }
}
