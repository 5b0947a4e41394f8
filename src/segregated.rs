//! Segregated free list. Requests are sorted by size into six categories,
//! each one with its own chain of chunks, so small and large allocations
//! never fragment each other's chunks. Once you've read [`crate::header`],
//! [`crate::block`], [`crate::chunk`] and [`crate::category`], this is where
//! the circle gets completed:
//!
//! ```text
//!                  +---------+------------------------+      +---------+------------------------+
//!                  |         | +------+    +--------+ |      |         | +------+    +--------+ |
//! categories[0] -> |  Chunk  | | Used | -> |  Free  | | <--> |  Chunk  | | Free | -> |  Used  | |   64 KiB chunks
//!                  |         | +------+    +--------+ |      |         | +------+    +--------+ |
//!                  +---------+------------------------+      +---------+------------------------+
//!
//! ..............................................................................................
//!
//!                  +---------+------------------------+
//!                  |         | +------+    +--------+ |
//! categories[4] -> |  Chunk  | | Used | -> |  Used  | |                                            8 MiB chunks
//!                  |         | +------+    +--------+ |
//!                  +---------+------------------------+
//!
//!                  +---------+-------------+      +---------+----------------------+
//!                  |         | +---------+ |      |         | +------------------+ |
//! categories[5] -> |  Chunk  | |  Used   | | <--> |  Chunk  | |       Used       | |   one chunk per block
//!                  |         | +---------+ |      |         | +------------------+ |
//!                  +---------+-------------+      +---------+----------------------+
//! ```
//!
//! | Category | Payload up to | Chunk size       |
//! |----------|---------------|------------------|
//! | 0        | 64 B          | 64 KiB           |
//! | 1        | 512 B         | 256 KiB          |
//! | 2        | 4 KiB         | 1 MiB            |
//! | 3        | 32 KiB        | 4 MiB            |
//! | 4        | 256 KiB       | 8 MiB            |
//! | 5        | unbounded     | fits the payload |
//!
//! Payloads are 16 byte aligned. Freed blocks are merged with free
//! neighbours right away, but chunks stay mapped until [`SegregatedFreeList::trim`]
//! or drop.
//!
//! ```rust
//! use mapalloc::SegregatedFreeList;
//!
//! let mut list = SegregatedFreeList::new();
//!
//! let address = list.alloc(100, true).unwrap();
//! assert_eq!(address.as_ptr() as usize % 16, 0);
//!
//! unsafe {
//!     assert!(list.usable_size(address) >= 100);
//!     list.free(address);
//! }
//! ```

use std::{fmt, ptr::NonNull};

use crate::{
    block::{payload_size_for, Block},
    category::{Category, CategoryStats},
    error::{AllocError, AllocResult},
    realloc::{Realloc, ReallocMethod},
};

/// Number of size categories.
pub const CATEGORY_COUNT: usize = 6;

/// Largest payload served by each shared category. Anything bigger goes to
/// the dedicated category.
const LIMITS: [usize; CATEGORY_COUNT - 1] = [64, 512, 4 << 10, 32 << 10, 256 << 10];

/// Chunk mapping length of each category, `None` for dedicated chunks.
const CHUNK_SIZES: [Option<usize>; CATEGORY_COUNT] = [
    Some(64 << 10),
    Some(256 << 10),
    Some(1 << 20),
    Some(4 << 20),
    Some(8 << 20),
    None,
];

pub struct SegregatedFreeList {
    categories: [Category; CATEGORY_COUNT],
}

// Chunks are exclusively owned by the list.
unsafe impl Send for SegregatedFreeList {}

impl SegregatedFreeList {
    /// No memory is mapped until the first allocation.
    pub const fn new() -> Self {
        Self {
            categories: [
                Category::new(0, CHUNK_SIZES[0]),
                Category::new(1, CHUNK_SIZES[1]),
                Category::new(2, CHUNK_SIZES[2]),
                Category::new(3, CHUNK_SIZES[3]),
                Category::new(4, CHUNK_SIZES[4]),
                Category::new(5, CHUNK_SIZES[5]),
            ],
        }
    }

    /// Index of the category that serves requests of `size` bytes.
    pub fn category_of(size: usize) -> usize {
        LIMITS
            .iter()
            .position(|limit| size <= *limit)
            .unwrap_or(CATEGORY_COUNT - 1)
    }

    /// Usage counters of category `index`.
    ///
    /// # Panics
    ///
    /// If `index >= CATEGORY_COUNT`.
    pub fn stats(&self, index: usize) -> CategoryStats {
        self.categories[index].stats()
    }

    /// Returns a 16 byte aligned address where at least `size` bytes can be
    /// written, zero filled if `zero` is set. Fails only when the category
    /// needs a new chunk and the kernel refuses to map it.
    pub fn alloc(&mut self, size: usize, zero: bool) -> AllocResult<NonNull<u8>> {
        let size = payload_size_for(size).ok_or(AllocError::Overflow)?;
        let index = Self::category_of(size);

        // SAFETY: Categories only touch chunks they own.
        unsafe {
            let block = self.categories[index].allocate(size).map_err(|err| {
                log::warn!("segregated free list failed to allocate {size} bytes: {err}");
                err
            })?;

            let address = Block::payload_of(block);
            if zero {
                address.as_ptr().write_bytes(0, block.as_ref().size);
            }

            log::trace!("category {index} allocated {size} bytes at {address:p}");

            Ok(address)
        }
    }

    /// Gives a block back to its category. The owner is found through the
    /// block header, no searching involved.
    ///
    /// # Safety
    ///
    /// `address` must have been returned by [`Self::alloc`] or
    /// [`Self::realloc`] on this list and not freed since.
    ///
    /// # Panics
    ///
    /// On double free, if it can be detected.
    pub unsafe fn free(&mut self, address: NonNull<u8>) {
        let block = Block::from_payload(address);
        let index = block.as_ref().chunk.as_ref().data.category;

        assert!(
            index < CATEGORY_COUNT,
            "segregated free list: {address:p} was not allocated here"
        );
        debug_assert!(self.categories[index]
            .chunks
            .iter()
            .any(|chunk| chunk == block.as_ref().chunk));

        log::trace!("category {index} freed {} bytes at {address:p}", block.as_ref().size);

        self.categories[index].deallocate(block);
    }

    /// Reallocation algorithm. If the new size belongs to the same category
    /// the block is shrunk or grown where it is when possible. Otherwise the
    /// contents move to a new block in the right category and the old block
    /// is freed. `None` behaves like [`Self::alloc`].
    ///
    /// With `zero` set, bytes past the old size are zero filled. On failure
    /// the old block is left untouched.
    ///
    /// # Safety
    ///
    /// Same as [`Self::free`]. If the block moves, the old address must not
    /// be used anymore.
    pub unsafe fn realloc(
        &mut self,
        address: Option<NonNull<u8>>,
        size: usize,
        zero: bool,
    ) -> AllocResult<NonNull<u8>> {
        let Some(address) = address else {
            return self.alloc(size, zero);
        };

        let new_size = payload_size_for(size).ok_or(AllocError::Overflow)?;
        let realloc = Realloc::new(address, new_size);

        let current_category = realloc.block.as_ref().chunk.as_ref().data.category;
        let ideal_category = Self::category_of(new_size);

        if current_category == ideal_category && self.reallocate_in_place(&realloc, zero) {
            return Ok(address);
        }

        let new_address = self.alloc(new_size, false)?;
        let usable = Block::from_payload(new_address).as_ref().size;

        new_address
            .as_ptr()
            .copy_from_nonoverlapping(address.as_ptr(), realloc.count());

        if zero {
            new_address
                .as_ptr()
                .add(realloc.count())
                .write_bytes(0, usable - realloc.count());
        }

        log::trace!("moved {} bytes from {address:p} to {new_address:p}", realloc.count());

        self.free(address);

        Ok(new_address)
    }

    /// Payload bytes available at `address`, at least what was requested.
    ///
    /// # Safety
    ///
    /// Same as [`Self::free`].
    pub unsafe fn usable_size(&self, address: NonNull<u8>) -> usize {
        Block::from_payload(address).as_ref().size
    }

    /// Forgets every allocation in every category. Chunks stay mapped and
    /// every address handed out so far becomes invalid.
    pub fn clear(&mut self) {
        for category in &mut self.categories {
            // SAFETY: Resetting only writes to chunks we own.
            unsafe { category.clear() };
        }
    }

    /// Unmaps every chunk with nothing in use. Returns the number of bytes
    /// given back to the kernel.
    pub fn trim(&mut self) -> usize {
        self.categories
            .iter_mut()
            // SAFETY: Only unused chunks are released.
            .map(|category| unsafe { category.trim() })
            .sum()
    }

    /// Tries to satisfy `realloc` without moving. Returns whether it worked.
    unsafe fn reallocate_in_place(&mut self, realloc: &Realloc, zero: bool) -> bool {
        let index = realloc.block.as_ref().chunk.as_ref().data.category;
        let category = &mut self.categories[index];

        match realloc.method {
            ReallocMethod::Shrink => {
                category.shrink_in_place(realloc.block, realloc.new_size);
                true
            }
            ReallocMethod::Grow => {
                if !category.grow_in_place(realloc.block, realloc.new_size) {
                    return false;
                }

                if zero {
                    let grown = realloc.block.as_ref().size;
                    realloc
                        .address
                        .as_ptr()
                        .add(realloc.old_size)
                        .write_bytes(0, grown - realloc.old_size);
                }

                true
            }
        }
    }
}

impl Default for SegregatedFreeList {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for SegregatedFreeList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.categories.iter().map(Category::stats))
            .finish()
    }
}

impl Drop for SegregatedFreeList {
    fn drop(&mut self) {
        for category in &mut self.categories {
            // SAFETY: Nobody can use our addresses after drop.
            unsafe { category.release_all() };
        }
    }
}
