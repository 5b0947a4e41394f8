use std::{mem, ptr::NonNull};

use crate::{
    block::{Block, BLOCK_HEADER_SIZE, MIN_PAYLOAD},
    header::Header,
    mmap, Pointer,
};

/// Chunk header size in bytes. See [`Header<T>`] and [`Chunk`].
pub(crate) const CHUNK_HEADER_SIZE: usize = mem::size_of::<Header<Chunk>>();

/// Chunk specific data. The complete header is [`Header<Chunk>`], so chunks
/// of one category form a doubly linked list and any of them can be
/// unlinked from the middle of the chain.
///
/// We map chunks with [`mmap::map`], and mappings are not adjacent, so each
/// chunk carries its own blocks. Blocks tile the rest of the mapping:
///
/// ```text
/// +---------------+-------+---------+-------+---------+-------+----------+
/// | Header<Chunk> | Block | payload | Block | payload | Block | payload  |
/// +---------------+-------+---------+-------+---------+-------+----------+
/// ^                                                                      ^
/// chunk                                                    chunk + size
/// ```
#[repr(align(16))]
#[derive(Debug)]
pub(crate) struct Chunk {
    /// Mapping length, including [`CHUNK_HEADER_SIZE`].
    pub size: usize,
    /// Index of the category that owns this chunk.
    pub category: usize,
    /// Payload size of the largest free block in this chunk. Zero means
    /// the chunk is full and there's no point in looking at its blocks.
    pub largest_free: usize,
}

impl Chunk {
    /// Address right after the last byte of the chunk.
    #[inline]
    pub unsafe fn end_of(chunk: NonNull<Header<Self>>) -> usize {
        Header::address_of(chunk) + chunk.as_ref().data.size
    }

    /// Returns a pointer to the first block in this chunk. There is always
    /// at least one block.
    #[inline]
    pub unsafe fn first_block(chunk: NonNull<Header<Self>>) -> NonNull<Block> {
        Header::content_address_of(chunk).cast()
    }

    /// Iterates over the blocks in address order.
    ///
    /// # Safety
    ///
    /// `chunk` must be valid and blocks can't be split or merged while the
    /// iterator is alive.
    pub unsafe fn blocks(chunk: NonNull<Header<Self>>) -> Blocks {
        Blocks {
            current: Some(Self::first_block(chunk)),
        }
    }

    /// Turns the whole payload area into one free block, forgetting every
    /// block that was there before.
    pub unsafe fn reset(mut chunk: NonNull<Header<Self>>) {
        let size = chunk.as_ref().data.size - CHUNK_HEADER_SIZE - BLOCK_HEADER_SIZE;

        Self::first_block(chunk).as_ptr().write(Block {
            chunk,
            prev: None,
            size,
            is_free: true,
        });

        chunk.as_mut().data.largest_free = size;
    }

    /// Walks every block to find the largest free one.
    pub unsafe fn refresh_largest_free(chunk: NonNull<Header<Self>>) {
        Self::refresh_largest_free_from(chunk, Self::first_block(chunk), 0);
    }

    /// Recomputes [`Chunk::largest_free`] walking only `from` and the blocks
    /// after it. Free blocks before `from` must hold at most `largest_before`
    /// bytes of payload.
    pub unsafe fn refresh_largest_free_from(
        mut chunk: NonNull<Header<Self>>,
        from: NonNull<Block>,
        largest_before: usize,
    ) {
        let blocks = Blocks {
            current: Some(from),
        };

        let largest = blocks
            .filter(|block| block.as_ref().is_free)
            .map(|block| block.as_ref().size)
            .fold(largest_before, usize::max);

        chunk.as_mut().data.largest_free = largest;
    }

    /// Accounts for a free block of `size` bytes that appeared through a
    /// free or a merge. Merging only makes free blocks larger, so the hint
    /// stays exact.
    #[inline]
    pub unsafe fn note_free_block(mut chunk: NonNull<Header<Self>>, size: usize) {
        let largest = &mut chunk.as_mut().data.largest_free;
        *largest = (*largest).max(size);
    }

    /// Whether the chunk is a single free block, meaning nothing in it is in
    /// use and it can be unmapped.
    pub unsafe fn is_unused(chunk: NonNull<Header<Self>>) -> bool {
        let first = Self::first_block(chunk);
        first.as_ref().is_free && Block::next_of(first).is_none()
    }
}

/// See [`Chunk::blocks`].
pub(crate) struct Blocks {
    current: Pointer<Block>,
}

impl Iterator for Blocks {
    type Item = NonNull<Block>;

    fn next(&mut self) -> Option<Self::Item> {
        self.current.map(|block| {
            // SAFETY: Upheld by the caller of `Chunk::blocks`.
            self.current = unsafe { Block::next_of(block) };
            block
        })
    }
}

/// Calculates the length in bytes that we should call `mmap` with to serve a
/// dedicated chunk holding a single payload of `size` bytes, `None` on
/// overflow.
pub(crate) fn dedicated_chunk_length(size: usize) -> Option<usize> {
    CHUNK_HEADER_SIZE
        .checked_add(BLOCK_HEADER_SIZE)?
        .checked_add(size)
        .and_then(mmap::page_align)
}

/// Largest payload that fits in a fresh chunk of `length` bytes.
pub(crate) const fn chunk_capacity(length: usize) -> usize {
    length - CHUNK_HEADER_SIZE - BLOCK_HEADER_SIZE
}

/// Whether splitting `available` bytes of payload to serve `size` leaves
/// enough room for another block.
#[inline]
pub(crate) fn can_split(available: usize, size: usize) -> bool {
    available >= size + BLOCK_HEADER_SIZE + MIN_PAYLOAD
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_keeps_blocks_aligned() {
        assert_eq!(CHUNK_HEADER_SIZE % 16, 0);
    }

    #[test]
    fn dedicated_length() {
        let page = mmap::page_size();

        assert_eq!(dedicated_chunk_length(16), Some(page));
        assert_eq!(
            dedicated_chunk_length(page - CHUNK_HEADER_SIZE - BLOCK_HEADER_SIZE),
            Some(page)
        );
        assert_eq!(
            dedicated_chunk_length(page - CHUNK_HEADER_SIZE - BLOCK_HEADER_SIZE + 1),
            Some(page * 2)
        );
        assert_eq!(dedicated_chunk_length(usize::MAX), None);
    }

    #[test]
    fn reset_and_walk() {
        unsafe {
            let length = mmap::page_size();
            let address = mmap::map(length).unwrap();
            let chunk = address.cast::<Header<Chunk>>();
            chunk.as_ptr().write(Header {
                next: None,
                prev: None,
                data: Chunk {
                    size: length,
                    category: 0,
                    largest_free: 0,
                },
            });

            Chunk::reset(chunk);
            assert_eq!(chunk.as_ref().data.largest_free, chunk_capacity(length));
            assert!(Chunk::is_unused(chunk));
            assert_eq!(Chunk::blocks(chunk).count(), 1);

            // Carve a used block out of the front by hand.
            let first = Chunk::first_block(chunk);
            let rest = first.as_ptr().cast::<u8>().add(BLOCK_HEADER_SIZE + 64);
            rest.cast::<Block>().write(Block {
                chunk,
                prev: Some(first),
                size: chunk_capacity(length) - 64 - BLOCK_HEADER_SIZE,
                is_free: true,
            });
            (*first.as_ptr()).size = 64;
            (*first.as_ptr()).is_free = false;

            assert_eq!(Chunk::blocks(chunk).count(), 2);
            assert!(!Chunk::is_unused(chunk));

            Chunk::refresh_largest_free(chunk);
            assert_eq!(
                chunk.as_ref().data.largest_free,
                chunk_capacity(length) - 64 - BLOCK_HEADER_SIZE
            );

            mmap::unmap(address, length);
        }
    }

    #[test]
    fn split_threshold() {
        assert!(!can_split(64, 64));
        assert!(!can_split(64 + BLOCK_HEADER_SIZE + MIN_PAYLOAD - 1, 64));
        assert!(can_split(64 + BLOCK_HEADER_SIZE + MIN_PAYLOAD, 64));
    }
}
