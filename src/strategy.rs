//! Allocation strategy dispatch. An allocator picks one [`AllocStrategy`],
//! one [`ReallocStrategy`] and one [`DeallocStrategy`] when it is built and
//! routes every request for backing storage through the functions below.
//!
//! ```text
//!                      +---------------------+
//!  AllocStrategy   --> | std::alloc (zeroed) | <-- HeapFree
//!  ReallocStrategy --> | std::alloc::realloc |
//!                      +---------------------+
//!                      +---------------------+
//!  AllocStrategy   --> | mmap::map           | <-- PageUnmap
//!  ReallocStrategy --> | mmap::remap         |
//!                      +---------------------+
//! ```
//!
//! Heap and page-mapped memory must never be mixed: a region allocated with
//! one family has to be reallocated and released by the same family.
//! [`Strategies::new`] enforces that.

use std::{
    alloc::{self, Layout},
    ptr::{self, NonNull},
};

use crate::{
    config::{MemoryConfig, POISON_BYTE},
    error::{AllocError, AllocResult},
    mmap::{self, Protection},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AllocStrategy {
    /// Global heap, abort the process if it fails.
    HeapOrAbort,
    /// Global heap, report failures to the caller.
    HeapOrFail,
    /// Zero filled global heap memory, abort on failure.
    HeapZeroedOrAbort,
    /// Zero filled global heap memory, report failures.
    HeapZeroedOrFail,
    /// Anonymous pages straight from the kernel. Always zero filled.
    PageMap,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReallocStrategy {
    /// Never moves and never grows. Shrinking succeeds trivially, growing
    /// fails. For allocators sized up front for their worst case.
    NoOp,
    HeapOrAbort,
    HeapOrFail,
    /// Remap pages, the kernel may pick a new address.
    RemapMayMove,
    /// Remap pages, fail unless the mapping can stay where it is.
    RemapKeepAddress,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeallocStrategy {
    HeapFree,
    PageUnmap,
}

/// Memory family a strategy belongs to. Used to validate pairings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Family {
    Heap,
    Pages,
}

impl AllocStrategy {
    fn family(self) -> Family {
        match self {
            Self::HeapOrAbort | Self::HeapOrFail | Self::HeapZeroedOrAbort | Self::HeapZeroedOrFail => {
                Family::Heap
            }
            Self::PageMap => Family::Pages,
        }
    }

    fn aborts(self) -> bool {
        matches!(self, Self::HeapOrAbort | Self::HeapZeroedOrAbort)
    }
}

impl ReallocStrategy {
    /// `None` means the strategy works with any family.
    fn family(self) -> Option<Family> {
        match self {
            Self::NoOp => None,
            Self::HeapOrAbort | Self::HeapOrFail => Some(Family::Heap),
            Self::RemapMayMove | Self::RemapKeepAddress => Some(Family::Pages),
        }
    }

    /// Whether a region reallocated with this strategy may change address.
    pub fn may_move(self) -> bool {
        matches!(
            self,
            Self::HeapOrAbort | Self::HeapOrFail | Self::RemapMayMove
        )
    }
}

impl DeallocStrategy {
    fn family(self) -> Family {
        match self {
            Self::HeapFree => Family::Heap,
            Self::PageUnmap => Family::Pages,
        }
    }
}

/// The three strategies an allocator instance is configured with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Strategies {
    pub alloc: AllocStrategy,
    pub realloc: ReallocStrategy,
    pub dealloc: DeallocStrategy,
}

impl Strategies {
    /// Heap memory that fails gracefully and may move when it grows.
    pub const HEAP: Self = Self {
        alloc: AllocStrategy::HeapOrFail,
        realloc: ReallocStrategy::HeapOrFail,
        dealloc: DeallocStrategy::HeapFree,
    };

    /// Kernel pages that may move when they grow.
    pub const PAGE_MAP: Self = Self {
        alloc: AllocStrategy::PageMap,
        realloc: ReallocStrategy::RemapMayMove,
        dealloc: DeallocStrategy::PageUnmap,
    };

    /// Heap memory that never grows.
    pub const FIXED_HEAP: Self = Self {
        alloc: AllocStrategy::HeapOrFail,
        realloc: ReallocStrategy::NoOp,
        dealloc: DeallocStrategy::HeapFree,
    };

    /// Kernel pages that never grow.
    pub const FIXED_PAGE_MAP: Self = Self {
        alloc: AllocStrategy::PageMap,
        realloc: ReallocStrategy::NoOp,
        dealloc: DeallocStrategy::PageUnmap,
    };

    /// Bundles the three strategies.
    ///
    /// # Panics
    ///
    /// If they don't belong to the same memory family, for example heap
    /// allocation paired with page unmapping.
    pub fn new(alloc: AllocStrategy, realloc: ReallocStrategy, dealloc: DeallocStrategy) -> Self {
        let strategies = Self {
            alloc,
            realloc,
            dealloc,
        };

        assert!(
            strategies.is_consistent(),
            "mismatched strategies: {strategies:?}"
        );

        strategies
    }

    /// Heap memory must be freed to the heap and pages must be unmapped.
    pub fn is_consistent(&self) -> bool {
        let family = self.alloc.family();
        family == self.dealloc.family()
            && self.realloc.family().map_or(true, |realloc| realloc == family)
    }

    /// Whether regions managed with these strategies can change address.
    pub fn can_move(&self) -> bool {
        self.realloc.may_move()
    }
}

/// Layout of a heap request, rejecting zero sizes since the global allocator
/// doesn't support them.
fn heap_layout(size: usize, align: usize) -> AllocResult<Layout> {
    if size == 0 {
        return Err(AllocError::InvalidLayout { size, align });
    }

    Layout::from_size_align(size, align).map_err(|_| AllocError::InvalidLayout { size, align })
}

/// Terminates the process for the "or abort" strategies.
fn abort(layout: Layout) -> ! {
    log::error!(
        "heap allocation of {} bytes (align {}) failed, aborting",
        layout.size(),
        layout.align()
    );
    alloc::handle_alloc_error(layout)
}

/// Allocates at least `size` bytes aligned to `align`. The returned slice
/// covers the usable region, which for [`AllocStrategy::PageMap`] is the
/// whole number of pages that was mapped. Page mappings are always page
/// aligned, so any `align` up to the page size is honored.
pub fn allocate(strategy: AllocStrategy, size: usize, align: usize) -> AllocResult<NonNull<[u8]>> {
    match strategy {
        AllocStrategy::PageMap => {
            if size == 0 || !align.is_power_of_two() || align > mmap::page_size() {
                return Err(AllocError::InvalidLayout { size, align });
            }
            let length = mmap::page_align(size).ok_or(AllocError::Overflow)?;
            let address = mmap::map(length).ok_or(AllocError::OutOfMemory { size: length })?;

            Ok(NonNull::slice_from_raw_parts(address, length))
        }
        heap => {
            let layout = heap_layout(size, align)?;

            // SAFETY: Layout has non-zero size.
            let address = unsafe {
                match heap {
                    AllocStrategy::HeapZeroedOrAbort | AllocStrategy::HeapZeroedOrFail => {
                        alloc::alloc_zeroed(layout)
                    }
                    _ => alloc::alloc(layout),
                }
            };

            match NonNull::new(address) {
                Some(address) => Ok(NonNull::slice_from_raw_parts(address, size)),
                None if heap.aborts() => abort(layout),
                None => {
                    log::warn!("heap refused {size} bytes");
                    Err(AllocError::OutOfMemory { size })
                }
            }
        }
    }
}

/// Resizes a region from `old_size` to `new_size` bytes. On failure the
/// original region is untouched and still owned by the caller. On success
/// the old address must be considered dead unless it equals the new one.
///
/// With [`MemoryConfig::debug_memory_layer`] every strategy that is allowed
/// to move will move, and the abandoned region is poisoned so that stale
/// pointers into it blow up (pages) or read garbage (heap).
///
/// # Safety
///
/// `address`, `old_size` and `align` must describe a live region obtained
/// through [`allocate`] with a strategy of the same family.
pub unsafe fn reallocate(
    strategy: ReallocStrategy,
    address: NonNull<u8>,
    old_size: usize,
    new_size: usize,
    align: usize,
    config: &MemoryConfig,
) -> AllocResult<NonNull<[u8]>> {
    match strategy {
        ReallocStrategy::NoOp => {
            if new_size <= old_size {
                Ok(NonNull::slice_from_raw_parts(address, old_size))
            } else {
                Err(AllocError::CannotGrow {
                    capacity: old_size,
                    requested: new_size,
                })
            }
        }

        ReallocStrategy::HeapOrAbort | ReallocStrategy::HeapOrFail => {
            let alloc_strategy = match strategy {
                ReallocStrategy::HeapOrAbort => AllocStrategy::HeapOrAbort,
                _ => AllocStrategy::HeapOrFail,
            };

            if config.debug_memory_layer {
                return move_heap_region(alloc_strategy, address, old_size, new_size, align);
            }

            let old_layout = heap_layout(old_size, align)?;
            // Validates the new size against the alignment.
            let new_layout = heap_layout(new_size, align)?;

            match NonNull::new(alloc::realloc(address.as_ptr(), old_layout, new_size)) {
                Some(new_address) => Ok(NonNull::slice_from_raw_parts(new_address, new_size)),
                None if alloc_strategy.aborts() => abort(new_layout),
                None => {
                    log::warn!("heap refused to grow {old_size} -> {new_size} bytes");
                    Err(AllocError::OutOfMemory { size: new_size })
                }
            }
        }

        ReallocStrategy::RemapMayMove | ReallocStrategy::RemapKeepAddress => {
            let old_length = mmap::page_align(old_size).ok_or(AllocError::Overflow)?;
            let new_length = mmap::page_align(new_size).ok_or(AllocError::Overflow)?;
            let may_move = strategy == ReallocStrategy::RemapMayMove;

            if may_move && config.debug_memory_layer && new_length > 0 {
                return move_mapping(address, old_length, new_length);
            }

            if new_length == 0 {
                return Err(AllocError::InvalidLayout {
                    size: new_size,
                    align,
                });
            }

            match mmap::remap(address, old_length, new_length, may_move) {
                Some(new_address) => Ok(NonNull::slice_from_raw_parts(new_address, new_length)),
                None if may_move => Err(AllocError::OutOfMemory { size: new_length }),
                None => Err(AllocError::CannotGrow {
                    capacity: old_length,
                    requested: new_length,
                }),
            }
        }
    }
}

/// Forces `address` to move to a fresh region of `new_size` bytes even if it
/// would fit where it is. Used to shake out code that holds on to raw
/// pointers across operations that are *allowed* to move memory. Strategies
/// that can never move refuse with [`AllocError::CannotGrow`].
///
/// # Safety
///
/// Same as [`reallocate`].
pub unsafe fn relocate(
    strategies: &Strategies,
    address: NonNull<u8>,
    old_size: usize,
    new_size: usize,
    align: usize,
    config: &MemoryConfig,
) -> AllocResult<NonNull<[u8]>> {
    if !strategies.can_move() {
        return Err(AllocError::CannotGrow {
            capacity: old_size,
            requested: new_size,
        });
    }

    if config.debug_memory_layer {
        return reallocate(strategies.realloc, address, old_size, new_size, align, config);
    }

    let new_region = allocate(strategies.alloc, new_size, align)?;
    ptr::copy_nonoverlapping(
        address.as_ptr(),
        new_region.cast::<u8>().as_ptr(),
        old_size.min(new_region.len()),
    );
    deallocate(strategies.dealloc, address, old_size, align);

    log::debug!(
        "relocated {old_size} bytes from {address:p} to {:p}",
        new_region.cast::<u8>()
    );

    Ok(new_region)
}

/// Releases a region.
///
/// # Safety
///
/// `address`, `size` and `align` must describe a live region obtained
/// through [`allocate`] (or [`reallocate`]) with a strategy of the same
/// family. For page mappings `size` may be the requested size, it's rounded
/// up to pages here.
///
/// # Panics
///
/// If `size` and `align` can't describe a heap region, or if the pages can't
/// be unmapped.
pub unsafe fn deallocate(strategy: DeallocStrategy, address: NonNull<u8>, size: usize, align: usize) {
    match strategy {
        DeallocStrategy::HeapFree => match heap_layout(size, align) {
            Ok(layout) => alloc::dealloc(address.as_ptr(), layout),
            Err(err) => panic!("cannot free heap region at {address:p}: {err}"),
        },
        DeallocStrategy::PageUnmap => match mmap::page_align(size) {
            Some(length) => mmap::unmap(address, length),
            None => panic!("cannot unmap region of {size} bytes at {address:p}"),
        },
    }
}

/// Debug layer for heap regions: new allocation, copy, poison and free the
/// old one.
unsafe fn move_heap_region(
    strategy: AllocStrategy,
    address: NonNull<u8>,
    old_size: usize,
    new_size: usize,
    align: usize,
) -> AllocResult<NonNull<[u8]>> {
    let new_region = allocate(strategy, new_size, align)?;
    ptr::copy_nonoverlapping(
        address.as_ptr(),
        new_region.cast::<u8>().as_ptr(),
        old_size.min(new_size),
    );

    address.as_ptr().write_bytes(POISON_BYTE, old_size);
    deallocate(DeallocStrategy::HeapFree, address, old_size, align);

    log::debug!(
        "debug layer moved heap region {address:p} -> {:p}",
        new_region.cast::<u8>()
    );

    Ok(new_region)
}

/// Debug layer for page mappings: new mapping, copy, and make the old one
/// inaccessible. The old mapping is never returned to the kernel so its
/// address can't be recycled while dangling pointers to it still exist.
unsafe fn move_mapping(
    address: NonNull<u8>,
    old_length: usize,
    new_length: usize,
) -> AllocResult<NonNull<[u8]>> {
    let new_address = mmap::map(new_length).ok_or(AllocError::OutOfMemory { size: new_length })?;
    ptr::copy_nonoverlapping(
        address.as_ptr(),
        new_address.as_ptr(),
        old_length.min(new_length),
    );

    if !mmap::protect(address, old_length, Protection::NONE) {
        // Can't fault on access, make it obvious at least.
        log::warn!("could not protect stale mapping at {address:p}, poisoning instead");
        address.as_ptr().write_bytes(POISON_BYTE, old_length);
    }

    log::debug!("debug layer moved mapping {address:p} -> {new_address:p}, old pages poisoned");

    Ok(NonNull::slice_from_raw_parts(new_address, new_length))
}
