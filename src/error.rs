//! Recoverable allocation failures. Everything listed here is an expected
//! outcome that callers are supposed to check and react to (retry with a
//! different size, grow, give up). Broken invariants are not represented
//! here, those panic at the point where they are detected.

use thiserror::Error;

/// Shorter syntax for allocation return types.
pub type AllocResult<T> = Result<T, AllocError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AllocError {
    /// The heap or the kernel refused to hand out more memory.
    #[error("out of memory while requesting {size} bytes")]
    OutOfMemory { size: usize },

    /// Zero sized request or alignment that is not a power of two.
    #[error("invalid layout: size {size}, alignment {align}")]
    InvalidLayout { size: usize, align: usize },

    /// The reallocation strategy is not allowed to move the region and the
    /// region cannot be extended where it is.
    #[error("cannot grow from {capacity} to {requested} bytes without moving")]
    CannotGrow { capacity: usize, requested: usize },

    /// Fixed-block free lists only serve requests up to their block size.
    #[error("requested {requested} bytes but blocks hold {block_size} bytes")]
    BlockTooLarge { requested: usize, block_size: usize },

    /// Every chunk is full and chaining new chunks is disabled.
    #[error("every chunk is full and chaining new chunks is disabled")]
    Exhausted,

    /// Chunk cannot hold its header plus at least one block, or is smaller
    /// than two chunk headers.
    #[error("chunk of {chunk_size} bytes cannot hold blocks of {block_size} bytes")]
    ChunkTooSmall { chunk_size: usize, block_size: usize },

    /// Size computation overflowed `usize`.
    #[error("size computation overflowed")]
    Overflow,
}
