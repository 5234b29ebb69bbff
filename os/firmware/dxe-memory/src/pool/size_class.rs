//! Pool block size classes.
//!
//! Block sizes grow roughly like a Fibonacci sequence, so splitting a large
//! block leaves remainders that fit the smaller classes without waste. Every
//! size is a multiple of 64, which lets any carve tile a page exactly.

/// Block sizes in bytes, smallest first.
pub const POOL_SIZES: [u64; POOL_CLASSES] = [
    64, 128, 192, 320, 512, 832, 1344, 2176, 3520, 5696, 9216, 14912, 24128, 39040, 63168,
];

/// Number of size classes.
pub const POOL_CLASSES: usize = 15;

/// Smallest class holding `size` bytes; [`POOL_CLASSES`] when none does.
#[must_use]
pub fn class_for(size: u64) -> usize {
    POOL_SIZES.partition_point(|&class| class < size)
}

/// Block size of `class`.
#[must_use]
pub const fn class_size(class: usize) -> u64 {
    POOL_SIZES[class]
}

/// Number of classes served from pool pages of `granularity` bytes.
///
/// Requests needing a larger class go straight to the page allocator.
#[must_use]
pub fn pooled_classes(granularity: u64) -> usize {
    class_for(granularity)
}

const _: () = {
    let mut i = 0;
    while i < POOL_CLASSES {
        assert!(POOL_SIZES[i] % 64 == 0);
        if i > 0 {
            assert!(POOL_SIZES[i] > POOL_SIZES[i - 1]);
        }
        i += 1;
    }
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn class_lookup() {
        assert_eq!(class_for(1), 0);
        assert_eq!(class_for(64), 0);
        assert_eq!(class_for(65), 1);
        assert_eq!(class_for(2176), 7);
        assert_eq!(class_for(63_168), 14);
        assert_eq!(class_for(63_169), POOL_CLASSES);
    }

    #[test]
    fn granularity_limits_pooled_classes() {
        assert_eq!(pooled_classes(0x1000), 9);
        assert_eq!(class_size(pooled_classes(0x1000) - 1), 3520);
        assert_eq!(pooled_classes(0x1_0000), POOL_CLASSES);
    }
}
