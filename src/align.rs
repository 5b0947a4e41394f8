use std::mem;

/// Pointer size in bytes on the current machine. Fixed free list blocks are
/// rounded up to it so that every block is aligned for its free link.
pub(crate) const POINTER_SIZE: usize = mem::size_of::<usize>();

/// Rounds `value` up to the next multiple of `alignment`, which must be a
/// power of two. Wraps on overflow, see [`checked_align_up`] when `value`
/// comes from the outside world.
#[inline]
pub const fn align_up(value: usize, alignment: usize) -> usize {
    debug_assert!(alignment.is_power_of_two());
    (value + alignment - 1) & !(alignment - 1)
}

/// Same as [`align_up`] but returns `None` instead of overflowing.
#[inline]
pub fn checked_align_up(value: usize, alignment: usize) -> Option<usize> {
    debug_assert!(alignment.is_power_of_two());
    Some(value.checked_add(alignment - 1)? & !(alignment - 1))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn align_up_to_larger_powers() {
        assert_eq!(align_up(0, 16), 0);
        assert_eq!(align_up(1, 16), 16);
        assert_eq!(align_up(4097, 4096), 8192);
        assert_eq!(checked_align_up(usize::MAX, 16), None);
        assert_eq!(checked_align_up(usize::MAX - 15, 16), Some(usize::MAX - 15));
    }
}
