use std::{mem, ptr::NonNull};

use crate::{align::checked_align_up, chunk::Chunk, header::Header, Pointer};

/// Block header size in bytes. Payloads start right after the header, so
/// this is also the distance between a block and the address we hand out.
pub(crate) const BLOCK_HEADER_SIZE: usize = mem::size_of::<Block>();

/// Every payload address and size is a multiple of this.
pub(crate) const PAYLOAD_ALIGN: usize = 16;

/// Smallest payload a block can have. Splitting never leaves behind a block
/// smaller than this.
pub(crate) const MIN_PAYLOAD: usize = 16;

/// Variable size block header. Blocks tile the payload area of their chunk
/// without gaps, so only the previous block needs a link. The next one is
/// always `BLOCK_HEADER_SIZE + size` bytes away:
///
/// ```text
/// +----------------------------+          <------+
/// | pointer to owning chunk    |                 |
/// +----------------------------+                 |
/// | pointer to prev block      |                 | Block
/// +----------------------------+                 |
/// | payload size               |                 |
/// +----------------------------+                 |
/// | is free flag + padding     |                 |
/// +----------------------------+          <------+
/// |          Payload           |   <------+
/// |            ...             |          | `size` bytes, handed out to
/// |            ...             |          | the caller.
/// +----------------------------+   <------+
/// | next block header          |
/// +----------------------------+
/// ```
///
/// The chunk pointer makes `free` O(1): given a payload address we step back
/// one header and know exactly which chunk, and therefore which category,
/// the block belongs to.
#[repr(C, align(16))]
pub(crate) struct Block {
    /// Chunk where this block is located.
    pub chunk: NonNull<Header<Chunk>>,
    /// Physically previous block, `None` for the first block of a chunk.
    pub prev: Pointer<Block>,
    /// Payload size, excluding [`BLOCK_HEADER_SIZE`].
    pub size: usize,
    pub is_free: bool,
}

impl Block {
    /// Returns the block header of a payload address handed out earlier.
    ///
    /// # Safety
    ///
    /// `address` must have been returned by the segregated free list and the
    /// block must still be alive, otherwise this points to garbage.
    #[inline]
    pub unsafe fn from_payload(address: NonNull<u8>) -> NonNull<Self> {
        NonNull::new_unchecked(address.as_ptr().sub(BLOCK_HEADER_SIZE).cast())
    }

    /// First byte after the header.
    #[inline]
    pub unsafe fn payload_of(block: NonNull<Self>) -> NonNull<u8> {
        NonNull::new_unchecked(block.as_ptr().cast::<u8>().add(BLOCK_HEADER_SIZE))
    }

    /// Physically next block in the same chunk, if any.
    ///
    /// # Safety
    ///
    /// `block` must be valid. The computed address is checked against the
    /// chunk bounds, never against anything the caller wrote.
    #[inline]
    pub unsafe fn next_of(block: NonNull<Self>) -> Pointer<Self> {
        let next = block.as_ptr() as usize + block.as_ref().total_size();
        let end = Chunk::end_of(block.as_ref().chunk);

        assert!(
            next <= end,
            "block at {block:p} runs past the end of its chunk"
        );

        (next < end).then(|| NonNull::new_unchecked(next as *mut Self))
    }

    /// Block size including [`BLOCK_HEADER_SIZE`].
    #[inline]
    pub fn total_size(&self) -> usize {
        BLOCK_HEADER_SIZE + self.size
    }
}

/// Rounds a requested size up to a valid payload size, `None` on overflow.
#[inline]
pub(crate) fn payload_size_for(size: usize) -> Option<usize> {
    checked_align_up(size.max(MIN_PAYLOAD), PAYLOAD_ALIGN)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_keeps_payloads_aligned() {
        assert_eq!(BLOCK_HEADER_SIZE % PAYLOAD_ALIGN, 0);
        assert_eq!(mem::align_of::<Block>(), PAYLOAD_ALIGN);
    }

    #[test]
    fn payload_sizes() {
        assert_eq!(payload_size_for(0), Some(MIN_PAYLOAD));
        assert_eq!(payload_size_for(1), Some(16));
        assert_eq!(payload_size_for(17), Some(32));
        assert_eq!(payload_size_for(64), Some(64));
        assert_eq!(payload_size_for(usize::MAX), None);
    }
}
