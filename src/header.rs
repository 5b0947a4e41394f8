use std::ptr::NonNull;

use crate::list::Node;

/// Chunk headers of both free lists are linked list nodes that live at the
/// start of the mapping they describe. This alias is used whenever we talk
/// about a chunk header rather than about list plumbing.
pub(crate) type Header<T> = Node<T>;

impl<T> Header<T> {
    /// Returns the first address after the header.
    ///
    /// ```text
    /// +-------------+
    /// |  Header<T>  | <- `header`
    /// +-------------+
    /// |   Content   | <- returned address
    /// +-------------+
    /// |     ...     |
    /// +-------------+
    /// ```
    ///
    /// # Safety
    ///
    /// `header` must be valid and followed by at least one more byte of the
    /// same mapping.
    ///
    /// # Notes
    ///
    /// Written as `Header::content_address_of(header)` instead of a method on
    /// `&self` so that no intermediate reference to the header is created,
    /// which keeps Miri's
    /// [Stacked Borrows](https://github.com/rust-lang/unsafe-code-guidelines/blob/master/wip/stacked-borrows.md)
    /// checks quiet.
    #[inline]
    pub unsafe fn content_address_of(header: NonNull<Self>) -> NonNull<u8> {
        NonNull::new_unchecked(header.as_ptr().offset(1)).cast()
    }

    /// Address of the first byte of the header, for range arithmetic.
    #[inline]
    pub fn address_of(header: NonNull<Self>) -> usize {
        header.as_ptr() as usize
    }
}
