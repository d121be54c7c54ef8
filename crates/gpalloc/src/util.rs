/// Align `value` up to the next multiple of `align`.
/// `align` must be a power of two.
#[inline(always)]
pub const fn align_up(value: usize, align: usize) -> usize {
    debug_assert!(align.is_power_of_two());
    (value + align - 1) & !(align - 1)
}

/// Align `value` down to the previous multiple of `align`.
/// `align` must be a power of two.
#[inline(always)]
pub const fn align_down(value: usize, align: usize) -> usize {
    debug_assert!(align.is_power_of_two());
    value & !(align - 1)
}

/// Check if `value` is aligned to `align`.
#[inline(always)]
pub const fn is_aligned(value: usize, align: usize) -> bool {
    value & (align - 1) == 0
}

/// Largest alignment handed out when the caller does not ask for one
/// (matches max_align_t on 64-bit).
pub const MIN_ALIGN: usize = 16;

/// Largest power of two that is <= `x`. `x` must be non-zero.
#[inline(always)]
pub const fn pow2_floor(x: usize) -> usize {
    debug_assert!(x != 0);
    1 << (usize::BITS - 1 - x.leading_zeros())
}

/// Alignment used for a request of `size` bytes with no explicit alignment.
///
/// Small requests get their natural alignment rather than `MIN_ALIGN`, so a
/// right-aligned 3 byte allocation ends exactly one byte before the guard
/// page instead of 13 bytes before it.
#[inline]
pub const fn default_alignment(size: usize) -> usize {
    if size == 0 {
        return 1;
    }
    let natural = pow2_floor(size);
    if natural < MIN_ALIGN {
        natural
    } else {
        MIN_ALIGN
    }
}

/// Poison byte written over freed slots.
pub const POISON_BYTE: u8 = 0xFE;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alignment_helpers() {
        assert_eq!(align_up(1, 16), 16);
        assert_eq!(align_up(32, 16), 32);
        assert_eq!(align_down(4095, 4096), 0);
        assert_eq!(align_down(4032 + 7, 16), 4032);
        assert!(is_aligned(4096, 4096));
        assert!(!is_aligned(4097, 2));
    }

    #[test]
    fn default_alignment_tracks_size() {
        assert_eq!(default_alignment(1), 1);
        assert_eq!(default_alignment(3), 2);
        assert_eq!(default_alignment(8), 8);
        assert_eq!(default_alignment(12), 8);
        assert_eq!(default_alignment(64), MIN_ALIGN);
        assert_eq!(default_alignment(4096), MIN_ALIGN);
    }
}
