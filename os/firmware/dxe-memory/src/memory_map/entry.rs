//! Map entries and their permanent storage.

use alloc::vec::Vec;
use fw_memory_addresses::{PAGE_SHIFT, PhysicalAddress};
use uefi::mem::memory_map::{MemoryAttribute, MemoryType};

/// One contiguous range of a single type and attribute.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct MemoryMapEntry {
    pub memory_type: MemoryType,
    pub start: PhysicalAddress,
    /// Last byte of the range (inclusive).
    pub end: PhysicalAddress,
    pub attribute: MemoryAttribute,
    pub virtual_start: u64,
    /// Type of the special bin a free range lies in. Always `None` for
    /// allocated ranges.
    pub bin: Option<MemoryType>,
}

impl MemoryMapEntry {
    #[must_use]
    pub const fn new(
        memory_type: MemoryType,
        start: PhysicalAddress,
        end: PhysicalAddress,
        attribute: MemoryAttribute,
    ) -> Self {
        Self {
            memory_type,
            start,
            end,
            attribute,
            virtual_start: 0,
            bin: None,
        }
    }

    #[must_use]
    pub fn is_free(&self) -> bool {
        self.memory_type == MemoryType::CONVENTIONAL
    }

    #[must_use]
    pub const fn pages(&self) -> u64 {
        ((self.end.as_u64() - self.start.as_u64()) >> PAGE_SHIFT) + 1
    }

    #[must_use]
    pub const fn contains(&self, addr: PhysicalAddress) -> bool {
        self.start.as_u64() <= addr.as_u64() && addr.as_u64() <= self.end.as_u64()
    }

    /// Whether both entries describe memory of the same kind.
    #[must_use]
    pub fn same_kind(&self, other: &Self) -> bool {
        self.memory_type == other.memory_type
            && self.attribute == other.attribute
            && self.bin == other.bin
    }

    /// Whether `next` directly follows this entry and can be absorbed by it.
    #[must_use]
    pub fn can_merge(&self, next: &Self) -> bool {
        self.end.checked_add(1) == Some(next.start) && self.same_kind(next)
    }

    /// Copy of the entry restricted to `[start, end]`.
    #[must_use]
    pub const fn clipped(&self, start: PhysicalAddress, end: PhysicalAddress) -> Self {
        let mut part = *self;
        if start.as_u64() > part.start.as_u64() {
            part.start = start;
        }
        if end.as_u64() < part.end.as_u64() {
            part.end = end;
        }
        part
    }
}

/// Stable reference to an entry in the [`EntrySlab`].
///
/// A handle outlives the entry it named; lookups through a stale handle
/// fail instead of returning the slot's new occupant.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct EntryHandle {
    slot: u32,
    generation: u32,
}

struct Slot {
    generation: u32,
    entry: Option<MemoryMapEntry>,
}

/// Permanent descriptor storage.
///
/// Capacity only grows through [`provision`](Self::provision), which the map
/// calls once it carved a page of memory for descriptors.
#[derive(Default)]
pub struct EntrySlab {
    slots: Vec<Slot>,
    free: Vec<u32>,
}

impl EntrySlab {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
        }
    }

    /// Adds `count` empty slots.
    #[allow(clippy::cast_possible_truncation)]
    pub fn provision(&mut self, count: usize) {
        let first = self.slots.len();
        self.slots.reserve(count);
        for index in first..first + count {
            self.slots.push(Slot {
                generation: 0,
                entry: None,
            });
            self.free.push(index as u32);
        }
        // Hand out low slots first.
        self.free.sort_unstable_by(|a, b| b.cmp(a));
    }

    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.slots.len()
    }

    #[must_use]
    pub const fn free_slots(&self) -> usize {
        self.free.len()
    }

    #[must_use]
    pub const fn len(&self) -> usize {
        self.slots.len() - self.free.len()
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stores `entry`; `None` when no slot is free.
    pub fn insert(&mut self, entry: MemoryMapEntry) -> Option<EntryHandle> {
        let slot = self.free.pop()?;
        let s = &mut self.slots[slot as usize];
        s.entry = Some(entry);
        Some(EntryHandle {
            slot,
            generation: s.generation,
        })
    }

    fn slot(&self, handle: EntryHandle) -> Option<&Slot> {
        self.slots
            .get(handle.slot as usize)
            .filter(|s| s.generation == handle.generation)
    }

    #[must_use]
    pub fn get(&self, handle: EntryHandle) -> Option<&MemoryMapEntry> {
        self.slot(handle)?.entry.as_ref()
    }

    pub fn get_mut(&mut self, handle: EntryHandle) -> Option<&mut MemoryMapEntry> {
        self.slots
            .get_mut(handle.slot as usize)
            .filter(|s| s.generation == handle.generation)?
            .entry
            .as_mut()
    }

    /// Removes the entry and retires the handle.
    pub fn remove(&mut self, handle: EntryHandle) -> Option<MemoryMapEntry> {
        let s = self
            .slots
            .get_mut(handle.slot as usize)
            .filter(|s| s.generation == handle.generation)?;
        let entry = s.entry.take()?;
        s.generation = s.generation.wrapping_add(1);
        self.free.push(handle.slot);
        Some(entry)
    }
}
