//! Property-based tests for the allocators.
//!
//! Uses proptest to generate random operation sequences and verify that the
//! invariants of each allocator hold.

use std::{
    collections::HashSet,
    panic::{self, AssertUnwindSafe},
};

use mapalloc::{
    AllocError, Arena, ArenaRef, FixedFreeList, FixedFreeListConfig, MemoryConfig,
    SegregatedFreeList, Strategies,
};
use proptest::prelude::*;

/// Strategy for generating the payload of one push.
fn payload() -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(any::<u8>(), 1..24)
}

/// Strategy for generating arena backing strategies that can grow.
fn growable() -> impl Strategy<Value = Strategies> {
    prop_oneof![Just(Strategies::HEAP), Just(Strategies::PAGE_MAP)]
}

/// Strategy for generating fixed free list operations: `None` allocates,
/// `Some(i)` frees the i-th live block (modulo the live count).
fn fixed_operations() -> impl Strategy<Value = Vec<Option<usize>>> {
    prop::collection::vec(prop::option::of(any::<usize>()), 1..200)
}

fn push_all(arena: &mut Arena, payloads: &[Vec<u8>]) -> Vec<ArenaRef> {
    payloads
        .iter()
        .map(|bytes| arena.push_bytes(bytes).unwrap())
        .collect()
}

proptest! {
    /// Popping keeps everything before the reference and rejects everything
    /// from the reference on.
    #[test]
    fn arena_stack_discipline(
        payloads in prop::collection::vec(payload(), 1..40),
        pop in any::<prop::sample::Index>(),
    ) {
        let mut arena = Arena::new(64).unwrap();
        let references = push_all(&mut arena, &payloads);

        let popped = pop.index(references.len());
        arena.pop_upto(references[popped]);

        prop_assert_eq!(arena.len(), references[popped].offset());

        for (reference, bytes) in references.iter().zip(&payloads).take(popped) {
            prop_assert_eq!(arena.get(*reference, bytes.len()), bytes.as_slice());
        }

        let rejected = panic::catch_unwind(AssertUnwindSafe(|| {
            arena.get(references[popped], payloads[popped].len());
        }));
        prop_assert!(rejected.is_err());
    }

    /// A build that fails anywhere leaves the arena exactly as it was, and a
    /// dismissed build does the same.
    #[test]
    fn arena_build_atomicity(
        capacity in 32usize..512,
        prefix in prop::collection::vec(payload(), 0..4),
        build in prop::collection::vec(payload(), 1..40),
    ) {
        let mut arena =
            Arena::with_strategies(capacity, Strategies::FIXED_HEAP, MemoryConfig::default())
                .unwrap();

        let prefix_fits = prefix.iter().map(Vec::len).sum::<usize>() + arena.len() <= arena.capacity();
        prop_assume!(prefix_fits);
        push_all(&mut arena, &prefix);

        let before = arena.len();
        let fits = build.iter().map(Vec::len).sum::<usize>() + before <= arena.capacity();

        arena.begin();
        for bytes in &build {
            let _ = arena.add_bytes(bytes);
        }
        let committed = arena.commit();

        if fits {
            prop_assert_eq!(committed.unwrap().offset(), before);
        } else {
            prop_assert!(
                matches!(committed, Err(AllocError::CannotGrow { .. })),
                "unexpected commit result {:?}",
                committed
            );
            prop_assert_eq!(arena.len(), before);
        }

        arena.pop_upto(ArenaRef::from_offset(before).unwrap());
        arena.begin();
        for bytes in &build {
            let _ = arena.add_bytes(bytes);
        }
        arena.dismiss();
        prop_assert_eq!(arena.len(), before);
    }

    /// References stay valid through any number of relocating growths.
    #[test]
    fn arena_reference_stability(
        strategies in growable(),
        debug_layer in any::<bool>(),
        payloads in prop::collection::vec(payload(), 1..300),
    ) {
        let config = MemoryConfig::new().with_debug_memory_layer(debug_layer);
        let mut arena = Arena::with_strategies(16, strategies, config).unwrap();
        let mut references = Vec::new();

        for bytes in &payloads {
            references.push(arena.push_bytes(bytes).unwrap());
        }

        for (reference, bytes) in references.iter().zip(&payloads) {
            prop_assert_eq!(arena.get(*reference, bytes.len()), bytes.as_slice());
        }
    }

    /// Within one chunk, an address is never handed out twice while in use.
    #[test]
    fn fixed_free_list_conservation(
        block_size in 1usize..512,
        operations in fixed_operations(),
    ) {
        let mut list = FixedFreeList::new(block_size).unwrap();
        let capacity = list.blocks_per_chunk();
        let mut live = Vec::new();
        let mut issued = HashSet::new();
        let mut freed = HashSet::new();

        for operation in operations {
            match operation {
                Some(i) if !live.is_empty() => {
                    let address = live.swap_remove(i % live.len());
                    unsafe { list.free(address) };
                    freed.insert(address);
                }
                _ if live.len() < capacity => {
                    let address = list.alloc(block_size).unwrap();
                    prop_assert!(!live.contains(&address));
                    prop_assert!(freed.contains(&address) || !issued.contains(&address));
                    issued.insert(address);
                    live.push(address);
                }
                _ => {}
            }

            prop_assert_eq!(list.in_use(), live.len());
        }

        prop_assert_eq!(list.chunk_count(), 1);
    }

    /// Oversized requests fail without touching the free chain.
    #[test]
    fn fixed_free_list_rejection(
        block_size in 1usize..1024,
        excess in 1usize..4096,
        chain_on_demand in any::<bool>(),
    ) {
        let config = FixedFreeListConfig::new(block_size).with_chain_on_demand(chain_on_demand);
        let mut list = FixedFreeList::with_config(config).unwrap();
        let first = list.alloc(block_size).unwrap();

        let requested = list.block_size() + excess;
        prop_assert_eq!(
            list.alloc(requested),
            Err(AllocError::BlockTooLarge { requested, block_size: list.block_size() })
        );
        prop_assert_eq!(list.in_use(), 1);

        let second = list.alloc(list.block_size()).unwrap();
        prop_assert_ne!(first, second);
        prop_assert_eq!(list.in_use(), 2);
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Zeroed allocations read as zero after the same size was freed, and
    /// freeing restores the usage counters.
    #[test]
    fn segregated_round_trip(size in 1usize..700_000) {
        let mut list = SegregatedFreeList::new();
        let category = SegregatedFreeList::category_of(size);
        let before = list.stats(category).total_user_memory_usage;

        unsafe {
            let first = list.alloc(size, true).unwrap();
            first.as_ptr().write_bytes(0x5A, size);
            list.free(first);
            prop_assert_eq!(list.stats(category).total_user_memory_usage, before);

            let second = list.alloc(size, true).unwrap();
            let bytes = std::slice::from_raw_parts(second.as_ptr(), size);
            prop_assert!(bytes.iter().all(|byte| *byte == 0));

            list.free(second);
            prop_assert_eq!(list.stats(category).total_user_memory_usage, before);
        }
    }

    /// Random alloc, realloc and free sequences never corrupt payloads.
    #[test]
    fn segregated_payloads_survive(
        sizes in prop::collection::vec(1usize..10_000, 1..40),
        grow_to in prop::collection::vec(1usize..20_000, 1..40),
    ) {
        let mut list = SegregatedFreeList::new();
        let mut live = Vec::new();

        for (i, size) in sizes.iter().enumerate() {
            let address = list.alloc(*size, false).unwrap();
            unsafe { address.as_ptr().write_bytes(i as u8, *size) };
            live.push((address, *size, i as u8));
        }

        for (slot, new_size) in live.iter_mut().zip(&grow_to) {
            let (address, size, tag) = *slot;
            let moved = unsafe { list.realloc(Some(address), *new_size, false).unwrap() };
            let kept = size.min(*new_size);
            let bytes = unsafe { std::slice::from_raw_parts(moved.as_ptr(), kept) };
            prop_assert!(bytes.iter().all(|byte| *byte == tag));

            unsafe { moved.as_ptr().write_bytes(tag, *new_size) };
            *slot = (moved, *new_size, tag);
        }

        for (address, size, tag) in live {
            let bytes = unsafe { std::slice::from_raw_parts(address.as_ptr(), size) };
            prop_assert!(bytes.iter().all(|byte| *byte == tag));
            unsafe { list.free(address) };
        }

        for category in 0..mapalloc::CATEGORY_COUNT {
            prop_assert_eq!(list.stats(category).total_user_memory_usage, 0);
        }
    }
}
