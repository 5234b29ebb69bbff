//! Memory map snapshots in the firmware descriptor format.
//!
//! Free memory inside a special bin is reported with the bin's type, so the
//! map looks the same across boots even if the bin is only partly used.
//! Descriptors are written at [`DESCRIPTOR_STRIDE`], which is larger than
//! the descriptor itself; consumers must step by the reported stride.

use super::MemoryMap;
use crate::error::MemoryError;
use crate::platform::ResourceRange;
use alloc::vec::Vec;
use core::mem::offset_of;
use fw_info::MemoryTypeExt;
use fw_info::memory::DESCRIPTOR_STRIDE;
use fw_memory_addresses::{PAGE_SHIFT, PhysicalAddress};
use uefi::mem::memory_map::{MemoryAttribute, MemoryDescriptor, MemoryType};

fn descriptor(
    memory_type: MemoryType,
    start: PhysicalAddress,
    pages: u64,
    attribute: MemoryAttribute,
) -> MemoryDescriptor {
    let mut att = attribute;
    if memory_type.is_runtime() {
        att |= MemoryAttribute::RUNTIME;
    }
    MemoryDescriptor {
        ty: memory_type,
        phys_start: start.as_u64(),
        virt_start: 0,
        page_count: pages,
        att,
    }
}

const fn end_of(desc: &MemoryDescriptor) -> u64 {
    desc.phys_start + (desc.page_count << PAGE_SHIFT)
}

/// Builds the sorted, merged descriptor list for `map` plus the regions the
/// resource map reports on its own.
#[must_use]
pub fn descriptors(map: &MemoryMap, out_of_band: &[ResourceRange]) -> Vec<MemoryDescriptor> {
    let mut all: Vec<MemoryDescriptor> = map
        .iter()
        .map(|entry| {
            let memory_type = match entry.bin {
                Some(bin) if entry.is_free() => bin,
                _ => entry.memory_type,
            };
            descriptor(memory_type, entry.start, entry.pages(), entry.attribute)
        })
        .collect();
    all.extend(
        out_of_band
            .iter()
            .filter(|range| range.length >> PAGE_SHIFT > 0)
            .map(|range| {
                descriptor(
                    range.kind.memory_type(),
                    range.start,
                    range.length >> PAGE_SHIFT,
                    range.attribute,
                )
            }),
    );
    all.sort_unstable_by_key(|desc| desc.phys_start);

    let mut merged: Vec<MemoryDescriptor> = Vec::with_capacity(all.len());
    for desc in all {
        match merged.last_mut() {
            Some(last)
                if last.ty == desc.ty && last.att == desc.att && end_of(last) == desc.phys_start =>
            {
                last.page_count += desc.page_count;
            }
            _ => merged.push(desc),
        }
    }
    merged
}

/// Bytes needed to hold `count` descriptors.
#[must_use]
pub const fn required_size(count: usize) -> usize {
    count * DESCRIPTOR_STRIDE
}

/// Writes `descriptors` into `buffer` and returns the number of bytes used.
///
/// # Errors
/// [`MemoryError::BufferTooSmall`] with the required size; nothing is
/// written in that case.
pub fn encode(descriptors: &[MemoryDescriptor], buffer: &mut [u8]) -> Result<usize, MemoryError> {
    let required = required_size(descriptors.len());
    if buffer.len() < required {
        return Err(MemoryError::BufferTooSmall { required });
    }
    for (desc, slot) in descriptors.iter().zip(buffer.chunks_exact_mut(DESCRIPTOR_STRIDE)) {
        slot.fill(0);
        put(slot, offset_of!(MemoryDescriptor, ty), &desc.ty.0.to_le_bytes());
        put(slot, offset_of!(MemoryDescriptor, phys_start), &desc.phys_start.to_le_bytes());
        put(slot, offset_of!(MemoryDescriptor, virt_start), &desc.virt_start.to_le_bytes());
        put(slot, offset_of!(MemoryDescriptor, page_count), &desc.page_count.to_le_bytes());
        put(slot, offset_of!(MemoryDescriptor, att), &desc.att.bits().to_le_bytes());
    }
    Ok(required)
}

fn put(slot: &mut [u8], offset: usize, bytes: &[u8]) {
    slot[offset..offset + bytes.len()].copy_from_slice(bytes);
}

fn get<const N: usize>(slot: &[u8], offset: usize) -> [u8; N] {
    let mut bytes = [0; N];
    bytes.copy_from_slice(&slot[offset..offset + N]);
    bytes
}

/// Reads the descriptors of a snapshot of `size` bytes taken with `stride`.
#[must_use]
pub fn decode(buffer: &[u8], size: usize, stride: usize) -> Vec<MemoryDescriptor> {
    if stride < size_of::<MemoryDescriptor>() {
        return Vec::new();
    }
    buffer[..size.min(buffer.len())]
        .chunks_exact(stride)
        .map(|slot| MemoryDescriptor {
            ty: MemoryType(u32::from_le_bytes(get(slot, offset_of!(MemoryDescriptor, ty)))),
            phys_start: u64::from_le_bytes(get(slot, offset_of!(MemoryDescriptor, phys_start))),
            virt_start: u64::from_le_bytes(get(slot, offset_of!(MemoryDescriptor, virt_start))),
            page_count: u64::from_le_bytes(get(slot, offset_of!(MemoryDescriptor, page_count))),
            att: MemoryAttribute::from_bits_retain(u64::from_le_bytes(get(
                slot,
                offset_of!(MemoryDescriptor, att),
            ))),
        })
        .collect()
}
