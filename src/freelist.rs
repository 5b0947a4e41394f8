//! Fixed-block free list. Every allocation has the same size, so chunks are
//! just arrays of blocks and a free block only needs to know where the next
//! free block is:
//!
//! ```text
//! +-------------------+---------+---------+---------+---------+---------+
//! | Header<FixedChunk>| Block 0 | Block 1 | Block 2 | Block 3 |   ...   |
//! |   free ---------------------------------+       |         |         |
//! +-------------------+---------+---------+-|-------+---------+---------+
//!                                   ^       |           ^
//!                                   |       v           |
//!                                   +--- FreeBlock      +--- rest_free
//!                                      { next, .. } ------>  { .., true }
//! ```
//!
//! A freshly mapped (or cleared) chunk doesn't link all its blocks together.
//! Its first block is marked with `rest_free`, meaning "me and every block
//! after me are free". Taking such a block moves the mark one block forward,
//! so handing out untouched blocks never walks the chunk.
//!
//! Chunks are chained on demand when every block of every chunk is in use.
//! Freeing looks for the owning chunk by address range, which is linear in
//! the number of chunks.

use std::{fmt, mem, ptr::NonNull};

use crate::{
    align::{align_up, checked_align_up, POINTER_SIZE},
    error::{AllocError, AllocResult},
    header::Header,
    list::LinkedList,
    mmap, Pointer,
};

/// Chunk length used by [`FixedFreeList::new`] unless a single block needs
/// more.
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

/// Space reserved for the chunk header. Blocks start right after it.
const CHUNK_HEADER_SIZE: usize = align_up(mem::size_of::<Header<FixedChunk>>(), 16);

/// Blocks must be able to hold a [`FreeBlock`] once they are freed.
const MIN_BLOCK_SIZE: usize = mem::size_of::<FreeBlock>();

/// Smallest chunk for blocks of `block_size` bytes: the header plus one
/// block, and never less than two headers.
fn min_chunk_size(block_size: usize) -> Option<usize> {
    Some(
        CHUNK_HEADER_SIZE
            .checked_add(block_size)?
            .max(2 * CHUNK_HEADER_SIZE),
    )
}

/// Chunk specific data stored at the beginning of each mapping.
struct FixedChunk {
    /// Head of this chunk's free chain.
    free: Pointer<FreeBlock>,
    /// Mapping length in bytes, header included.
    size: usize,
    /// Blocks handed out and not freed yet.
    in_use: usize,
}

/// Contents of a block while it's free.
struct FreeBlock {
    next: Pointer<FreeBlock>,
    /// This block and all the blocks after it in the chunk are free and
    /// not linked. `next` is meaningless when set.
    rest_free: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedFreeListConfig {
    /// Bytes per block. Rounded up to the pointer size.
    pub block_size: usize,
    /// Bytes per chunk, header included. Rounded up to the page size.
    pub chunk_size: usize,
    /// Map a new chunk when all blocks are in use instead of failing.
    pub chain_on_demand: bool,
}

impl FixedFreeListConfig {
    pub const fn new(block_size: usize) -> Self {
        Self {
            block_size,
            chunk_size: DEFAULT_CHUNK_SIZE,
            chain_on_demand: true,
        }
    }

    pub const fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    pub const fn with_chain_on_demand(mut self, chain_on_demand: bool) -> Self {
        self.chain_on_demand = chain_on_demand;
        self
    }
}

pub struct FixedFreeList {
    chunks: LinkedList<FixedChunk>,
    block_size: usize,
    chunk_size: usize,
    blocks_per_chunk: usize,
    chain_on_demand: bool,
    in_use: usize,
}

// Chunks are exclusively owned by the list.
unsafe impl Send for FixedFreeList {}

impl FixedFreeList {
    /// Free list of `block_size` byte blocks, chunks of
    /// [`DEFAULT_CHUNK_SIZE`] (or whatever one block needs) and chaining
    /// enabled. Maps the first chunk right away.
    pub fn new(block_size: usize) -> AllocResult<Self> {
        let block = checked_align_up(block_size, POINTER_SIZE).ok_or(AllocError::Overflow)?;
        let chunk_size = min_chunk_size(block)
            .ok_or(AllocError::Overflow)?
            .max(DEFAULT_CHUNK_SIZE);

        Self::with_config(FixedFreeListConfig::new(block_size).with_chunk_size(chunk_size))
    }

    /// Maps the first chunk right away.
    pub fn with_config(config: FixedFreeListConfig) -> AllocResult<Self> {
        let block_size = checked_align_up(config.block_size, POINTER_SIZE)
            .ok_or(AllocError::Overflow)?
            .max(MIN_BLOCK_SIZE);
        let chunk_size = mmap::page_align(config.chunk_size).ok_or(AllocError::Overflow)?;

        if chunk_size < min_chunk_size(block_size).ok_or(AllocError::Overflow)? {
            return Err(AllocError::ChunkTooSmall {
                chunk_size: config.chunk_size,
                block_size,
            });
        }

        let mut list = Self {
            chunks: LinkedList::new(),
            block_size,
            chunk_size,
            blocks_per_chunk: (chunk_size - CHUNK_HEADER_SIZE) / block_size,
            chain_on_demand: config.chain_on_demand,
            in_use: 0,
        };

        // SAFETY: The list is empty, nothing else is touched.
        unsafe { list.chain()? };

        Ok(list)
    }

    #[inline]
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    #[inline]
    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    #[inline]
    pub fn blocks_per_chunk(&self) -> usize {
        self.blocks_per_chunk
    }

    #[inline]
    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    /// Blocks currently handed out.
    #[inline]
    pub fn in_use(&self) -> usize {
        self.in_use
    }

    /// Whether `address` points into the block area of one of our chunks.
    pub fn contains(&self, address: NonNull<u8>) -> bool {
        self.owner_of(address).is_some()
    }

    /// Returns a zeroed block that can hold at least `size` bytes.
    ///
    /// Asking for more than [`Self::block_size`] bytes is not a bug, callers
    /// are expected to try lists of different block sizes, so it fails with
    /// [`AllocError::BlockTooLarge`] and leaves the list untouched. When all
    /// blocks are taken a new chunk is mapped, or the call fails with
    /// [`AllocError::Exhausted`] if chaining is disabled.
    pub fn alloc(&mut self, size: usize) -> AllocResult<NonNull<u8>> {
        if size > self.block_size {
            return Err(AllocError::BlockTooLarge {
                requested: size,
                block_size: self.block_size,
            });
        }

        // SAFETY: Chunks and their free chains are only touched by us.
        unsafe {
            let available = self
                .chunks
                .iter()
                .find_map(|chunk| chunk.as_ref().data.free.map(|block| (chunk, block)));

            let (chunk, block) = match available {
                Some(found) => found,
                None if self.chain_on_demand => {
                    let chunk = self.chain()?;
                    (chunk, Self::first_block_of(chunk))
                }
                None => {
                    log::warn!(
                        "fixed free list exhausted: {} blocks of {} bytes in use",
                        self.in_use,
                        self.block_size
                    );
                    return Err(AllocError::Exhausted);
                }
            };

            let address = self.take(chunk, block);
            log::trace!("fixed free list handed out {address:p}");

            Ok(address)
        }
    }

    /// Puts a block back on the free chain of its chunk.
    ///
    /// # Safety
    ///
    /// `address` must have been returned by [`Self::alloc`] on this list and
    /// not freed since. Nothing may access the block afterwards.
    ///
    /// # Panics
    ///
    /// If `address` is not the start of a block owned by this list.
    pub unsafe fn free(&mut self, address: NonNull<u8>) {
        let Some(mut chunk) = self.owner_of(address) else {
            panic!("fixed free list: {address:p} does not belong to any chunk");
        };

        let offset = address.as_ptr() as usize - Self::first_block_of(chunk).as_ptr() as usize;
        assert!(
            offset % self.block_size == 0,
            "fixed free list: {address:p} is not the start of a block"
        );
        assert!(
            chunk.as_ref().data.in_use > 0,
            "fixed free list: {address:p} freed but its chunk has no blocks in use"
        );

        let block = address.cast::<FreeBlock>();
        block.as_ptr().write(FreeBlock {
            next: chunk.as_ref().data.free,
            rest_free: false,
        });

        chunk.as_mut().data.free = Some(block);
        chunk.as_mut().data.in_use -= 1;
        self.in_use -= 1;

        log::trace!("fixed free list got back {address:p}");
    }

    /// Marks every block of every chunk as free. Pages stay mapped and every
    /// block handed out so far becomes invalid.
    pub fn clear(&mut self) {
        // SAFETY: We own the chunks, resetting them only writes headers.
        unsafe {
            for chunk in self.chunks.iter() {
                Self::reset(chunk);
            }
        }
        self.in_use = 0;
    }

    /// Maps a new chunk and appends it to the chain.
    unsafe fn chain(&mut self) -> AllocResult<NonNull<Header<FixedChunk>>> {
        let address = mmap::map(self.chunk_size).ok_or(AllocError::OutOfMemory {
            size: self.chunk_size,
        })?;

        let chunk = self.chunks.append(
            FixedChunk {
                free: None,
                size: self.chunk_size,
                in_use: 0,
            },
            address,
        );

        Self::reset(chunk);

        log::debug!(
            "fixed free list chained chunk #{} at {address:p} ({} blocks of {} bytes)",
            self.chunks.len(),
            self.blocks_per_chunk,
            self.block_size
        );

        Ok(chunk)
    }

    /// Unlinks `block` from the free chain of `chunk` and zeroes it.
    unsafe fn take(
        &mut self,
        mut chunk: NonNull<Header<FixedChunk>>,
        block: NonNull<FreeBlock>,
    ) -> NonNull<u8> {
        let FreeBlock { next, rest_free } = block.as_ptr().read();

        let next = if rest_free {
            let following = block.as_ptr() as usize + self.block_size;
            let end = Header::address_of(chunk) + chunk.as_ref().data.size;

            if following + self.block_size <= end {
                let following = NonNull::new_unchecked(following as *mut FreeBlock);
                following.as_ptr().write(FreeBlock {
                    next: None,
                    rest_free: true,
                });
                Some(following)
            } else {
                None
            }
        } else {
            next
        };

        chunk.as_mut().data.free = next;
        chunk.as_mut().data.in_use += 1;
        self.in_use += 1;

        let address = block.cast::<u8>();
        address.as_ptr().write_bytes(0, self.block_size);

        address
    }

    /// Chunk whose block area contains `address`.
    fn owner_of(&self, address: NonNull<u8>) -> Pointer<Header<FixedChunk>> {
        let address = address.as_ptr() as usize;
        let blocks_len = self.blocks_per_chunk * self.block_size;

        self.chunks.iter().find(|chunk| {
            let start = Header::address_of(*chunk) + CHUNK_HEADER_SIZE;
            (start..start + blocks_len).contains(&address)
        })
    }

    /// Makes every block in `chunk` free.
    unsafe fn reset(mut chunk: NonNull<Header<FixedChunk>>) {
        let first = Self::first_block_of(chunk);
        first.as_ptr().write(FreeBlock {
            next: None,
            rest_free: true,
        });
        chunk.as_mut().data.free = Some(first);
        chunk.as_mut().data.in_use = 0;
    }

    #[inline]
    unsafe fn first_block_of(chunk: NonNull<Header<FixedChunk>>) -> NonNull<FreeBlock> {
        NonNull::new_unchecked((Header::address_of(chunk) + CHUNK_HEADER_SIZE) as *mut FreeBlock)
    }
}

impl fmt::Debug for FixedFreeList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FixedFreeList")
            .field("block_size", &self.block_size)
            .field("chunk_size", &self.chunk_size)
            .field("chunks", &self.chunks.len())
            .field("in_use", &self.in_use)
            .finish()
    }
}

impl Drop for FixedFreeList {
    fn drop(&mut self) {
        log::debug!(
            "fixed free list releasing {} chunks of {} bytes",
            self.chunks.len(),
            self.chunk_size
        );

        // SAFETY: Each chunk is removed from the chain before unmapping it.
        unsafe {
            while let Some(chunk) = self.chunks.first() {
                let size = chunk.as_ref().data.size;
                self.chunks.remove(chunk);
                mmap::unmap(chunk.cast(), size);
            }
        }
    }
}
