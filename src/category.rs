use std::ptr::NonNull;

use crate::{
    block::{Block, BLOCK_HEADER_SIZE},
    chunk::{self, Chunk},
    error::{AllocError, AllocResult},
    header::Header,
    list::LinkedList,
    mmap, Pointer,
};

/// Usage counters of one category.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CategoryStats {
    /// Chunks currently mapped.
    pub chunks: usize,
    /// Bytes mapped for this category, headers included.
    pub total_memory_usage: usize,
    /// Payload bytes of the blocks currently handed out.
    pub total_user_memory_usage: usize,
}

/// One size class of the segregated free list. Each category owns its own
/// chain of chunks and never touches chunks of other categories:
///
/// ```text
///             +---------+-----------------------+      +---------+-----------------------+
///             |         | +------+    +-------+ |      |         | +------+    +-------+ |
/// chunks ---> |  Chunk  | | Used | -> | Free  | | <--> |  Chunk  | | Free | -> | Used  | |
///             |         | +------+    +-------+ |      |         | +------+    +-------+ |
///             +---------+-----------------------+      +---------+-----------------------+
///               largest_free = size of Free              largest_free = size of Free
/// ```
///
/// Shared categories map chunks of a fixed size and carve blocks out of them,
/// splitting free blocks on allocation and merging neighbours on free. The
/// dedicated category (no `chunk_size`) maps one chunk per allocation, sized
/// for it, and never splits.
pub(crate) struct Category {
    /// Position in the segregated free list, stored in every chunk.
    index: usize,
    /// Mapping length of each chunk, `None` for dedicated chunks.
    chunk_size: Option<usize>,
    pub chunks: LinkedList<Chunk>,
    pub total_memory_usage: usize,
    pub total_user_memory_usage: usize,
}

impl Category {
    /// No chunks are mapped until the first allocation.
    pub const fn new(index: usize, chunk_size: Option<usize>) -> Self {
        Self {
            index,
            chunk_size,
            chunks: LinkedList::new(),
            total_memory_usage: 0,
            total_user_memory_usage: 0,
        }
    }

    pub fn stats(&self) -> CategoryStats {
        CategoryStats {
            chunks: self.chunks.len(),
            total_memory_usage: self.total_memory_usage,
            total_user_memory_usage: self.total_user_memory_usage,
        }
    }

    /// Finds (or maps) a free block with at least `size` bytes of payload
    /// and marks it as used. `size` must already be a valid payload size,
    /// see [`crate::block::payload_size_for`].
    pub unsafe fn allocate(&mut self, size: usize) -> AllocResult<NonNull<Block>> {
        let (block, largest_before) = match self.find_free_block(size) {
            Some(found) => found,
            None => (Chunk::first_block(self.request_chunk(size)?), 0),
        };

        let chunk = block.as_ref().chunk;
        let taken = block.as_ref().size;

        if self.chunk_size.is_some() {
            self.split_free_block_if_possible(block, size);
        }

        self.mark_used(block);

        // Any other free block is at most as large as the one we took, so
        // the hint only changes if we took the largest.
        if taken == chunk.as_ref().data.largest_free {
            Chunk::refresh_largest_free_from(chunk, block, largest_before);
        }

        Ok(block)
    }

    /// Marks `block` as free and merges it with free neighbours. Pages are
    /// never returned to the kernel here, see [`Self::trim`].
    ///
    /// # Panics
    ///
    /// If the block is already free.
    pub unsafe fn deallocate(&mut self, mut block: NonNull<Block>) {
        assert!(
            !block.as_ref().is_free,
            "segregated free list: double free of block at {block:p}"
        );

        self.total_user_memory_usage -= block.as_ref().size;
        block.as_mut().is_free = true;

        let block = self.merge_free_blocks_if_possible(block);
        Chunk::note_free_block(block.as_ref().chunk, block.as_ref().size);
    }

    /// Shrinks a used block to `size` bytes of payload, giving the tail back
    /// to the chunk if it's big enough to form a block.
    pub unsafe fn shrink_in_place(&mut self, block: NonNull<Block>, size: usize) {
        debug_assert!(size <= block.as_ref().size);

        if self.chunk_size.is_none() {
            return;
        }

        let old_size = block.as_ref().size;

        if let Some(remainder) = self.split_free_block_if_possible(block, size) {
            self.total_user_memory_usage -= old_size - block.as_ref().size;
            let merged = self.merge_free_blocks_if_possible(remainder);
            Chunk::note_free_block(block.as_ref().chunk, merged.as_ref().size);
        }
    }

    /// Grows a used block to at least `size` bytes of payload by absorbing
    /// the next block, if that one is free and big enough. Returns whether
    /// it worked. On failure nothing changes.
    pub unsafe fn grow_in_place(&mut self, block: NonNull<Block>, size: usize) -> bool {
        if self.chunk_size.is_none() {
            return false;
        }

        let Some(next) = Block::next_of(block).filter(|next| next.as_ref().is_free) else {
            return false;
        };

        let old_size = block.as_ref().size;
        if old_size + next.as_ref().total_size() < size {
            return false;
        }

        let chunk = block.as_ref().chunk;
        let absorbed = next.as_ref().size;

        // The free block we absorb can't have a free neighbour, so neither
        // can the remainder of the split.
        self.merge_next_block(block);
        self.split_free_block_if_possible(block, size);

        self.total_user_memory_usage += block.as_ref().size - old_size;

        if absorbed == chunk.as_ref().data.largest_free {
            Chunk::refresh_largest_free(chunk);
        }

        true
    }

    /// Forgets every allocation. Chunks stay mapped, each one becomes a
    /// single free block.
    pub unsafe fn clear(&mut self) {
        for chunk in self.chunks.iter() {
            Chunk::reset(chunk);
        }
        self.total_user_memory_usage = 0;
    }

    /// Unmaps chunks that have nothing in use. Returns the number of bytes
    /// given back to the kernel.
    pub unsafe fn trim(&mut self) -> usize {
        let unused: Vec<_> = self
            .chunks
            .iter()
            .filter(|chunk| Chunk::is_unused(*chunk))
            .collect();

        unused
            .into_iter()
            .map(|chunk| self.release_chunk(chunk))
            .sum()
    }

    /// Unmaps every chunk.
    pub unsafe fn release_all(&mut self) {
        while let Some(chunk) = self.chunks.first() {
            self.release_chunk(chunk);
        }
        self.total_user_memory_usage = 0;
    }

    /// Maps a new chunk that can serve at least `size` bytes. The chunk is
    /// initialized with a single free block that spans across all of it.
    unsafe fn request_chunk(&mut self, size: usize) -> AllocResult<NonNull<Header<Chunk>>> {
        let length = match self.chunk_size {
            Some(length) => length,
            None => chunk::dedicated_chunk_length(size).ok_or(AllocError::Overflow)?,
        };

        debug_assert!(chunk::chunk_capacity(length) >= size);

        let address = mmap::map(length).ok_or(AllocError::OutOfMemory { size: length })?;

        let chunk = self.chunks.append(
            Chunk {
                size: length,
                category: self.index,
                largest_free: 0,
            },
            address,
        );

        Chunk::reset(chunk);
        self.total_memory_usage += length;

        log::debug!(
            "category {} chained chunk #{} at {address:p} ({length} bytes)",
            self.index,
            self.chunks.len()
        );

        Ok(chunk)
    }

    /// Removes `chunk` from the chain and unmaps it.
    unsafe fn release_chunk(&mut self, chunk: NonNull<Header<Chunk>>) -> usize {
        let length = chunk.as_ref().data.size;

        self.chunks.remove(chunk);
        mmap::unmap(chunk.cast(), length);
        self.total_memory_usage -= length;

        log::debug!("category {} released chunk of {length} bytes", self.index);

        length
    }

    /// First fit. Chunks whose largest free block is too small are skipped
    /// without looking at their blocks. Along with the block, returns the
    /// payload size of the largest free block walked past in its chunk.
    unsafe fn find_free_block(&self, size: usize) -> Option<(NonNull<Block>, usize)> {
        self.chunks
            .iter()
            .filter(|chunk| chunk.as_ref().data.largest_free >= size)
            .find_map(|chunk| {
                let mut largest_before = 0;

                let found = Chunk::blocks(chunk).find(|block| {
                    let block = block.as_ref();
                    if !block.is_free {
                        return false;
                    }
                    if block.size >= size {
                        return true;
                    }
                    largest_before = largest_before.max(block.size);
                    false
                });

                found.map(|block| (block, largest_before))
            })
    }

    unsafe fn mark_used(&mut self, mut block: NonNull<Block>) {
        block.as_mut().is_free = false;
        self.total_user_memory_usage += block.as_ref().size;
    }

    /// Block splitting. Let's say we have a block that can hold 256 bytes and
    /// a request to allocate 64 bytes has been made:
    ///
    /// ```text
    ///         +-->  +-----------+                   +-->  +-----------+
    ///         |     |   Header  |                   |     |   Header  |
    /// Block   |     +-----------+           Block 1 |     +-----------+
    ///         |     |  Payload  | 256               |     |  Payload  | 64
    ///         +-->  +-----------+                   +-->  +-----------+
    ///                                               |     |   Header  |
    ///                                       Block 2 |     +-----------+
    ///                                               |     |  Payload  | 256 - 64 - H
    ///                                               +-->  +-----------+
    /// ```
    ///
    /// Block 2 is free. Returns it, or `None` if the leftover space can't
    /// hold a block.
    unsafe fn split_free_block_if_possible(
        &mut self,
        mut block: NonNull<Block>,
        size: usize,
    ) -> Pointer<Block> {
        if !chunk::can_split(block.as_ref().size, size) {
            return None;
        }

        let following = Block::next_of(block);

        let address = Block::payload_of(block).as_ptr().add(size).cast::<Block>();
        let remainder = NonNull::new_unchecked(address);
        remainder.as_ptr().write(Block {
            chunk: block.as_ref().chunk,
            prev: Some(block),
            size: block.as_ref().size - size - BLOCK_HEADER_SIZE,
            is_free: true,
        });

        block.as_mut().size = size;

        if let Some(mut following) = following {
            following.as_mut().prev = Some(remainder);
        }

        Some(remainder)
    }

    /// Inverse of [`Self::split_free_block_if_possible`]. `block` must be
    /// free. Merges it with the next block and then with the previous one,
    /// whichever of them is free. Returns the resulting block, which starts
    /// at the previous block if that one was merged.
    unsafe fn merge_free_blocks_if_possible(&mut self, mut block: NonNull<Block>) -> NonNull<Block> {
        if Block::next_of(block).is_some_and(|next| next.as_ref().is_free) {
            self.merge_next_block(block);
        }

        if let Some(prev) = block.as_ref().prev.filter(|prev| prev.as_ref().is_free) {
            block = prev;
            self.merge_next_block(block);
        }

        block
    }

    /// Merges the block right after `block` into `block`. The next block must
    /// exist.
    ///
    /// ```text
    /// +----------------+---------------+
    /// |    Block A     |   Block B     |
    /// +----------------+---------------+
    ///        ^                 |
    ///        |                 |
    ///        +-----------------+
    ///           Merge B into A
    /// ```
    unsafe fn merge_next_block(&mut self, mut block: NonNull<Block>) {
        let Some(next) = Block::next_of(block) else {
            return;
        };

        let following = Block::next_of(next);
        block.as_mut().size += next.as_ref().total_size();

        if let Some(mut following) = following {
            following.as_mut().prev = Some(block);
        }
    }
}
