//! # Physical Memory Address Types
//!
//! [`PhysicalAddress`] wraps the 64-bit addresses the boot-time memory
//! manager works with. Page counts are always in UEFI pages of
//! [`PAGE_SIZE`] bytes; [`GRANULE_64K`] is the coarser runtime granule some
//! architectures require.
//!
//! The free helpers [`align_up`], [`align_down`], [`pages_to_bytes`] and
//! [`bytes_to_pages`] are `const fn` so they can size static tables.
//!
//! ```rust
//! # use fw_memory_addresses::*;
//! assert_eq!(bytes_to_pages(1), 1);
//! assert_eq!(bytes_to_pages(4097), 2);
//! assert_eq!(pages_to_bytes(3), Some(3 * 4096));
//! assert_eq!(align_up(0x1001, 0x1000), Some(0x2000));
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]

mod physical_address;

pub use physical_address::PhysicalAddress;

/// Number of low address bits covered by a UEFI page.
pub const PAGE_SHIFT: u32 = 12;

/// Size of a UEFI page in bytes.
pub const PAGE_SIZE: u64 = 1 << PAGE_SHIFT;

/// Runtime allocation granule on 64 KiB page operating systems.
pub const GRANULE_64K: u64 = 0x1_0000;

/// Align `x` up to the next multiple of `align` (power of two).
///
/// Returns `None` when the result does not fit in `u64`.
///
/// ```
/// # use fw_memory_addresses::align_up;
/// assert_eq!(align_up(0, 4096), Some(0));
/// assert_eq!(align_up(1, 4096), Some(4096));
/// assert_eq!(align_up(u64::MAX, 4096), None);
/// ```
#[inline]
#[must_use]
pub const fn align_up(x: u64, align: u64) -> Option<u64> {
    debug_assert!(align.is_power_of_two());
    match x.checked_add(align - 1) {
        Some(v) => Some(v & !(align - 1)),
        None => None,
    }
}

/// Align `x` down to a multiple of `align` (power of two).
#[inline]
#[must_use]
pub const fn align_down(x: u64, align: u64) -> u64 {
    debug_assert!(align.is_power_of_two());
    x & !(align - 1)
}

/// Byte length of `pages` UEFI pages, `None` on overflow.
#[inline]
#[must_use]
pub const fn pages_to_bytes(pages: u64) -> Option<u64> {
    pages.checked_mul(PAGE_SIZE)
}

/// Number of UEFI pages needed to hold `bytes`.
#[inline]
#[must_use]
pub const fn bytes_to_pages(bytes: u64) -> u64 {
    (bytes >> PAGE_SHIFT) + if bytes & (PAGE_SIZE - 1) == 0 { 0 } else { 1 }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_number_and_offset() {
        let pa = PhysicalAddress::new(0x0000_0010_2000_0042);
        assert_eq!(pa.page_number(), 0x0102_0000);
        assert_eq!(pa.page_offset(), 0x42);
        assert_eq!(pa.align_down(PAGE_SIZE).as_u64(), 0x0000_0010_2000_0000);
    }

    #[test]
    fn runtime_granule() {
        let pa = PhysicalAddress::new(0x1_2345);
        assert_eq!(pa.align_down(GRANULE_64K).as_u64(), 0x1_0000);
        assert!(!pa.is_aligned(GRANULE_64K));
        assert_eq!(pa.align_up(GRANULE_64K), Some(PhysicalAddress::new(0x2_0000)));
    }

    #[test]
    fn alignment_helpers() {
        assert_eq!(align_down(0x1FFF, 0x1000), 0x1000);
        assert_eq!(align_up(0x1000, 0x1000), Some(0x1000));
        assert_eq!(align_up(u64::MAX - 1, 2), Some(u64::MAX - 1));
        assert_eq!(align_up(u64::MAX, 2), None);
        assert_eq!(align_up(u64::MAX - 0xFFE, 0x1000), None);
        assert_eq!(bytes_to_pages(0), 0);
        assert_eq!(bytes_to_pages(4096), 1);
        assert_eq!(pages_to_bytes(u64::MAX), None);
    }

    #[test]
    fn checked_arithmetic() {
        let pa = PhysicalAddress::new(0x1000);
        assert_eq!(pa.checked_sub(0x1001), None);
        assert_eq!(pa.checked_add(0x10), Some(PhysicalAddress::new(0x1010)));
        assert_eq!(PhysicalAddress::MAX.checked_add(1), None);
        assert_eq!(PhysicalAddress::new(0x3000) - pa, 0x2000);
    }

    #[test]
    fn formatting() {
        let pa = PhysicalAddress::new(0xDEAD_B000);
        assert_eq!(format!("{pa:?}"), "PA(0x00000000DEADB000)");
        assert_eq!(format!("{pa}"), "0x00000000DEADB000");
    }
}
