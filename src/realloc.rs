use std::ptr::NonNull;

use crate::block::Block;

/// This is used to carry realloc metadata around the code as we don't want to
/// pass the same parameters over and over again. For the real reallocation
/// business, see [`crate::segregated::SegregatedFreeList::realloc`].
pub(crate) struct Realloc {
    /// Source block, or the block whose contents we are trying to reallocate.
    pub block: NonNull<Block>,
    /// Current user pointer, the payload of `block`.
    pub address: NonNull<u8>,
    /// Payload size of `block` before reallocating.
    pub old_size: usize,
    /// Payload size the block should end up with, already rounded.
    pub new_size: usize,
    pub method: ReallocMethod,
}

/// Whether the caller wants more or less than what the block holds now.
/// Asking for the same size counts as shrinking, nothing has to move.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum ReallocMethod {
    Shrink,
    Grow,
}

impl Realloc {
    /// Builds a new [`Realloc`]. Caller must ensure that `address` is valid
    /// because we'll read the header of the block where it's located.
    pub unsafe fn new(address: NonNull<u8>, new_size: usize) -> Self {
        let block = Block::from_payload(address);
        let old_size = block.as_ref().size;

        let method = if new_size <= old_size {
            ReallocMethod::Shrink
        } else {
            ReallocMethod::Grow
        };

        Self {
            block,
            address,
            old_size,
            new_size,
            method,
        }
    }

    /// Number of bytes that should be copied if the block has to move. If
    /// we are shrinking, we only need to copy enough bytes to fill the new
    /// block, otherwise we'll copy everything from the previous one.
    pub fn count(&self) -> usize {
        match self.method {
            ReallocMethod::Shrink => self.new_size,
            ReallocMethod::Grow => self.old_size,
        }
    }
}
