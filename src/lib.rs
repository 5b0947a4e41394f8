//! Memory allocators built directly on top of kernel page mappings.
//!
//! Three allocators share one page mapping layer ([`mmap`]) and one strategy
//! layer ([`strategy`]) that decides whether backing storage comes from the
//! global heap or straight from the kernel:
//!
//! - [`Arena`]: one growable buffer used as a stack. Allocations are addressed
//!   by [`ArenaRef`] offsets, which stay valid when the buffer moves.
//! - [`FixedFreeList`]: chunks of equally sized blocks.
//! - [`SegregatedFreeList`]: variable sized blocks sorted into six size
//!   categories, each with its own chunks.
//!
//! None of them lock. Wrap them in a mutex or keep one per thread.
//!
//! # Example
//!
//! ```rust
//! use mapalloc::{Arena, FixedFreeList, SegregatedFreeList};
//!
//! let mut arena = Arena::new(64).unwrap();
//! let reference = arena.push_u64(42).unwrap();
//! assert_eq!(arena.fetch_u64(reference), 42);
//!
//! let mut blocks = FixedFreeList::new(64).unwrap();
//! let block = blocks.alloc(48).unwrap();
//! unsafe { blocks.free(block) };
//!
//! let mut list = SegregatedFreeList::new();
//! let address = list.alloc(1000, true).unwrap();
//! unsafe { list.free(address) };
//! ```

use std::ptr::NonNull;

mod align;
mod arena;
mod block;
mod category;
mod chunk;
mod config;
mod error;
mod freelist;
mod header;
mod list;
pub mod mmap;
mod platform;
mod realloc;
mod segregated;
pub mod strategy;

/// Non-null pointer to `T`. We use this in most cases instead of `*mut T`
/// because the compiler will yell at us if we don't write code for the `None`
/// case.
pub(crate) type Pointer<T> = Option<NonNull<T>>;

pub use align::{align_up, checked_align_up};
pub use arena::{Arena, ArenaRef, MIN_OFFSET};
pub use category::CategoryStats;
pub use config::{MemoryConfig, POISON_BYTE};
pub use error::{AllocError, AllocResult};
pub use freelist::{FixedFreeList, FixedFreeListConfig, DEFAULT_CHUNK_SIZE};
pub use segregated::{SegregatedFreeList, CATEGORY_COUNT};
pub use strategy::{AllocStrategy, DeallocStrategy, ReallocStrategy, Strategies};
