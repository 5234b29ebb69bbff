//! In-memory layout of pool blocks.
//!
//! An allocated block carries a head before the caller's buffer and, unless
//! it ends flush against a guard page, a tail after it:
//!
//! ```text
//! +-----------+-----------+-----------+-----------+-----------+-------------+-----------+-----------+-----------+
//! | sig "phd0"| reserved  |   type    |  padding  | size (u64)|   buffer    | sig "ptal"| reserved  | size (u64)|
//! +-----------+-----------+-----------+-----------+-----------+-------------+-----------+-----------+-----------+
//! ^ head                                                      ^ head + 24                           ^ head + size
//! ```
//!
//! `size` covers head, buffer and tail. A block on a free list is reused as
//! a marker holding its size class:
//!
//! ```text
//! +-----------+-----------+
//! | sig "pfr0"|   class   |
//! +-----------+-----------+
//! ```

use crate::phys_memory::PhysMemory;
use fw_memory_addresses::PhysicalAddress;
use uefi::mem::memory_map::MemoryType;

const fn signature(tag: &[u8; 4]) -> u32 {
    u32::from_le_bytes(*tag)
}

pub const POOL_HEAD_SIGNATURE: u32 = signature(b"phd0");
pub const POOL_TAIL_SIGNATURE: u32 = signature(b"ptal");
pub const POOL_FREE_SIGNATURE: u32 = signature(b"pfr0");

/// Bytes in front of the caller's buffer.
pub const POOL_HEAD_SIZE: u64 = 24;

/// Bytes behind the caller's buffer.
pub const POOL_TAIL_SIZE: u64 = 16;

/// Total bookkeeping bytes of a block with a tail.
pub const POOL_OVERHEAD: u64 = POOL_HEAD_SIZE + POOL_TAIL_SIZE;

const HEAD_TYPE: u64 = 8;
const HEAD_SIZE: u64 = 16;
const TAIL_SIZE: u64 = 8;
const FREE_CLASS: u64 = 4;

/// Head of an allocated block.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct PoolHead {
    pub signature: u32,
    pub memory_type: MemoryType,
    pub size: u64,
}

impl PoolHead {
    #[must_use]
    pub const fn new(memory_type: MemoryType, size: u64) -> Self {
        Self {
            signature: POOL_HEAD_SIGNATURE,
            memory_type,
            size,
        }
    }

    pub fn read(memory: &impl PhysMemory, head: PhysicalAddress) -> Self {
        Self {
            signature: memory.read_u32(head),
            memory_type: MemoryType(memory.read_u32(head + HEAD_TYPE)),
            size: memory.read_u64(head + HEAD_SIZE),
        }
    }

    pub fn write(&self, memory: &impl PhysMemory, head: PhysicalAddress) {
        memory.write_u32(head, self.signature);
        memory.write_u32(head + 4, 0);
        memory.write_u32(head + HEAD_TYPE, self.memory_type.0);
        memory.write_u32(head + HEAD_TYPE + 4, 0);
        memory.write_u64(head + HEAD_SIZE, self.size);
    }
}

/// Tail of an allocated block.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct PoolTail {
    pub signature: u32,
    pub size: u64,
}

impl PoolTail {
    #[must_use]
    pub const fn new(size: u64) -> Self {
        Self {
            signature: POOL_TAIL_SIGNATURE,
            size,
        }
    }

    /// Address of the tail of a block with the given head and total size.
    #[must_use]
    pub fn locate(head: PhysicalAddress, size: u64) -> Option<PhysicalAddress> {
        head.checked_add(size)?.checked_sub(POOL_TAIL_SIZE)
    }

    pub fn read(memory: &impl PhysMemory, tail: PhysicalAddress) -> Self {
        Self {
            signature: memory.read_u32(tail),
            size: memory.read_u64(tail + TAIL_SIZE),
        }
    }

    pub fn write(&self, memory: &impl PhysMemory, tail: PhysicalAddress) {
        memory.write_u32(tail, self.signature);
        memory.write_u32(tail + 4, 0);
        memory.write_u64(tail + TAIL_SIZE, self.size);
    }
}

/// Marks `block` as free in size class `class`.
pub fn mark_free(memory: &impl PhysMemory, block: PhysicalAddress, class: usize) {
    memory.write_u32(block, POOL_FREE_SIGNATURE);
    #[allow(clippy::cast_possible_truncation)]
    memory.write_u32(block + FREE_CLASS, class as u32);
}

/// Size class of a free block, `None` if `block` is not marked free.
pub fn free_class(memory: &impl PhysMemory, block: PhysicalAddress) -> Option<usize> {
    (memory.read_u32(block) == POOL_FREE_SIGNATURE)
        .then(|| memory.read_u32(block + FREE_CLASS) as usize)
}
