//! Fixed-capacity staging area for entries created by a map mutation.
//!
//! Every entry a mutation creates lands here first, because creating it may
//! itself require carving a page for descriptors. The map drains the stack
//! into permanent storage once the mutation completed.

use super::entry::MemoryMapEntry;
use crate::error::MemoryMapError;
use fw_info::memory::MAX_MAP_DEPTH;

pub struct ScratchStack {
    slots: [Option<MemoryMapEntry>; MAX_MAP_DEPTH],
    high_water: usize,
}

impl Default for ScratchStack {
    fn default() -> Self {
        Self::new()
    }
}

impl ScratchStack {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            slots: [None; MAX_MAP_DEPTH],
            high_water: 0,
        }
    }

    /// Number of staged entries.
    #[must_use]
    pub fn depth(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    #[must_use]
    pub fn available(&self) -> usize {
        MAX_MAP_DEPTH - self.depth()
    }

    /// Deepest the stack has been since creation.
    #[must_use]
    pub const fn high_water(&self) -> usize {
        self.high_water
    }

    /// Stages `entry` and returns its slot.
    pub fn push(&mut self, entry: MemoryMapEntry) -> Result<usize, MemoryMapError> {
        let Some(index) = self.slots.iter().position(Option::is_none) else {
            return Err(MemoryMapError::ScratchExhausted {
                depth: MAX_MAP_DEPTH + 1,
            });
        };
        self.slots[index] = Some(entry);
        self.high_water = self.high_water.max(self.depth());
        Ok(index)
    }

    #[must_use]
    pub fn get(&self, index: usize) -> Option<&MemoryMapEntry> {
        self.slots.get(index)?.as_ref()
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut MemoryMapEntry> {
        self.slots.get_mut(index)?.as_mut()
    }

    pub fn take(&mut self, index: usize) -> Option<MemoryMapEntry> {
        self.slots.get_mut(index)?.take()
    }

    /// Slot of the most recently staged entry still present.
    #[must_use]
    pub fn top(&self) -> Option<usize> {
        self.slots.iter().rposition(Option::is_some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fw_memory_addresses::PhysicalAddress;
    use uefi::mem::memory_map::{MemoryAttribute, MemoryType};

    fn entry(n: u64) -> MemoryMapEntry {
        MemoryMapEntry::new(
            MemoryType::CONVENTIONAL,
            PhysicalAddress::new(n << 12),
            PhysicalAddress::new((n << 12) | 0xFFF),
            MemoryAttribute::empty(),
        )
    }

    #[test]
    fn push_until_full() {
        let mut stack = ScratchStack::new();
        for n in 0..MAX_MAP_DEPTH as u64 {
            stack.push(entry(n)).expect("room");
        }
        assert_eq!(stack.available(), 0);
        assert!(matches!(
            stack.push(entry(99)),
            Err(MemoryMapError::ScratchExhausted { .. })
        ));
        assert_eq!(stack.high_water(), MAX_MAP_DEPTH);
    }

    #[test]
    fn freed_slots_are_reused() {
        let mut stack = ScratchStack::new();
        let a = stack.push(entry(1)).expect("room");
        let b = stack.push(entry(2)).expect("room");
        assert_eq!(stack.top(), Some(b));
        assert!(stack.take(a).is_some());
        assert_eq!(stack.depth(), 1);
        assert_eq!(stack.push(entry(3)).expect("room"), a);
        assert_eq!(stack.high_water(), 2);
    }
}
