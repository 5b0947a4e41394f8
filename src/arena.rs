//! Growable reference arena. One contiguous buffer used as a bump/stack
//! allocator where allocations are addressed by their offset from the start
//! of the buffer instead of by raw pointers:
//!
//! ```text
//!  offset 0          16                                        len      capacity
//!  +-----------------+----------+-------------+-----------------+------------+
//!  | reserved (zero) | region A | region B    | region C        |   unused   |
//!  +-----------------+----------+-------------+-----------------+------------+
//!                    ^          ^             ^
//!                    ref A      ref B         ref C
//! ```
//!
//! Offsets survive the buffer moving around when it grows, raw pointers
//! don't. That's why the only way to read through a reference is to ask the
//! arena, and the arena refuses while a build is in progress: any `add_*`
//! may relocate the buffer.
//!
//! # Builds
//!
//! Writing happens in builds. [`Arena::begin`] opens one, `add_*` appends to
//! it and [`Arena::commit`] closes it returning a reference to the first
//! byte written. If any `add_*` fails (the buffer could not grow), the build
//! is marked failed: later `add_*` calls are accepted but do nothing and
//! `commit` rolls everything back, exactly like [`Arena::dismiss`] would.
//!
//! ```rust
//! use mapalloc::Arena;
//!
//! let mut arena = Arena::new(64).unwrap();
//!
//! arena.begin();
//! arena.add_u32(0xDEADBEEF).unwrap();
//! arena.add_cstr("hi").unwrap();
//! let reference = arena.commit().unwrap();
//!
//! assert_eq!(arena.fetch_u32(reference), 0xDEADBEEF);
//! ```
//!
//! # Freeing
//!
//! There's no way to free one allocation. [`Arena::pop_upto`] discards a
//! reference and everything allocated after it, [`Arena::clear`] discards
//! everything. The buffer itself is released when the arena is dropped.

use std::{
    ffi::CStr,
    fmt, mem,
    num::NonZeroUsize,
    ptr::NonNull,
    slice,
};

use crate::{
    align::{align_up, checked_align_up},
    config::MemoryConfig,
    error::{AllocError, AllocResult},
    strategy::{self, Strategies},
};

/// Offsets below this value are never handed out, so that a zero offset can
/// stand for "no reference".
pub const MIN_OFFSET: usize = 16;

/// Alignment of the buffer itself. Offsets aligned to this value are also
/// aligned in memory.
const ARENA_ALIGN: usize = 16;

/// Offset of an allocation inside an [`Arena`]. Zero is never a valid
/// offset, so `Option<ArenaRef>` is the nullable version and costs nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ArenaRef(NonZeroUsize);

impl ArenaRef {
    /// Wraps a raw offset. `None` for zero.
    pub const fn from_offset(offset: usize) -> Option<Self> {
        match NonZeroUsize::new(offset) {
            Some(offset) => Some(Self(offset)),
            None => None,
        }
    }

    pub const fn offset(self) -> usize {
        self.0.get()
    }
}

/// State of an in-progress build.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Build {
    /// Arena length when [`Arena::begin`] was called.
    start: usize,
    /// First failure of this build, if any.
    failure: Option<AllocError>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BuildState {
    Idle,
    Building(Build),
}

pub struct Arena {
    /// Start of the buffer. May change whenever the arena grows.
    buffer: NonNull<u8>,
    /// Bytes in use, including the reserved [`MIN_OFFSET`] prefix and the
    /// bytes staged by an in-progress build.
    len: usize,
    /// Bytes owned.
    capacity: usize,
    strategies: Strategies,
    config: MemoryConfig,
    state: BuildState,
}

// The arena exclusively owns its buffer.
unsafe impl Send for Arena {}

impl Arena {
    /// Arena backed by kernel pages that may move when they grow.
    pub fn new(capacity: usize) -> AllocResult<Self> {
        Self::with_strategies(capacity, Strategies::PAGE_MAP, MemoryConfig::default())
    }

    /// Builds an arena that can hold at least `capacity` bytes (reserved
    /// prefix included) before growing for the first time.
    ///
    /// Use [`Strategies::FIXED_HEAP`] or [`Strategies::FIXED_PAGE_MAP`] for
    /// an arena that never grows past its initial capacity.
    ///
    /// # Panics
    ///
    /// If `strategies` mix heap and page-mapped memory.
    pub fn with_strategies(
        capacity: usize,
        strategies: Strategies,
        config: MemoryConfig,
    ) -> AllocResult<Self> {
        assert!(
            strategies.is_consistent(),
            "mismatched arena strategies: {strategies:?}"
        );

        let capacity = checked_align_up(capacity.max(MIN_OFFSET), ARENA_ALIGN)
            .ok_or(AllocError::Overflow)?;
        let region = strategy::allocate(strategies.alloc, capacity, ARENA_ALIGN)?;
        let buffer = region.cast::<u8>();

        // SAFETY: The region is at least MIN_OFFSET bytes long.
        unsafe { buffer.as_ptr().write_bytes(0, MIN_OFFSET) };

        log::debug!(
            "arena created with {} bytes at {buffer:p} ({strategies:?})",
            region.len()
        );

        Ok(Self {
            buffer,
            len: MIN_OFFSET,
            capacity: region.len(),
            strategies,
            config,
            state: BuildState::Idle,
        })
    }

    /// Bytes in use, including the reserved prefix.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether nothing has been allocated since creation or the last
    /// [`Arena::clear`].
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == MIN_OFFSET
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[inline]
    pub fn is_building(&self) -> bool {
        matches!(self.state, BuildState::Building(_))
    }

    #[inline]
    pub fn strategies(&self) -> Strategies {
        self.strategies
    }

    #[inline]
    pub fn config(&self) -> MemoryConfig {
        self.config
    }

    /// Starts a build.
    ///
    /// # Panics
    ///
    /// If a build is already in progress. Every `begin` must be paired with
    /// exactly one [`Arena::commit`] or [`Arena::dismiss`].
    pub fn begin(&mut self) {
        assert!(
            !self.is_building(),
            "arena: begin called while a build is in progress"
        );

        self.state = BuildState::Building(Build {
            start: self.len,
            failure: None,
        });
    }

    /// Finishes the current build. Returns a reference to the first byte it
    /// wrote, or the error that made it fail, in which case the arena is
    /// back to the length it had before [`Arena::begin`].
    ///
    /// # Panics
    ///
    /// If no build is in progress.
    pub fn commit(&mut self) -> AllocResult<ArenaRef> {
        let build = self.finish("commit");

        if let Some(err) = build.failure {
            log::warn!("arena build failed, rolling back to {}: {err}", build.start);
            self.len = build.start;
            return Err(err);
        }

        debug_assert!(build.start >= MIN_OFFSET);
        log::trace!("arena committed {} bytes at {}", self.len - build.start, build.start);

        // SAFETY: Builds start at MIN_OFFSET or later.
        Ok(ArenaRef(unsafe { NonZeroUsize::new_unchecked(build.start) }))
    }

    /// Discards everything written by the current build.
    ///
    /// # Panics
    ///
    /// If no build is in progress.
    pub fn dismiss(&mut self) {
        let build = self.finish("dismiss");
        self.len = build.start;
    }

    /// Appends raw bytes to the current build.
    ///
    /// # Panics
    ///
    /// If no build is in progress. Applies to every `add_*` method.
    pub fn add_bytes(&mut self, bytes: &[u8]) -> AllocResult<()> {
        self.stage(bytes.len(), |destination| destination.copy_from_slice(bytes))
    }

    /// Appends `count` zero bytes to the current build.
    pub fn add_zeroes(&mut self, count: usize) -> AllocResult<()> {
        self.stage(count, |destination| destination.fill(0))
    }

    /// Pads the current build with zeroes until the arena length is a
    /// multiple of `alignment`. Nothing is aligned automatically, call this
    /// between fields that need it. Alignments up to 16 are also honored in
    /// memory, larger ones only relative to the start of the buffer.
    ///
    /// # Panics
    ///
    /// If `alignment` is not a power of two.
    pub fn add_align(&mut self, alignment: usize) -> AllocResult<()> {
        assert!(
            alignment.is_power_of_two(),
            "arena: alignment {alignment} is not a power of two"
        );
        let padding = align_up(self.len, alignment) - self.len;
        self.add_zeroes(padding)
    }

    /// Appends a pointer-sized value holding the address of `pointer`.
    pub fn add_ptr<T>(&mut self, pointer: *const T) -> AllocResult<()> {
        self.add_usize(pointer as usize)
    }

    /// Appends the bytes of `value` followed by a NUL terminator. Reading it
    /// back with [`Arena::get_cstr`] stops at the first NUL, so strings with
    /// interior NULs come back truncated.
    pub fn add_cstr(&mut self, value: &str) -> AllocResult<()> {
        self.stage(value.len() + 1, |destination| {
            let (text, nul) = destination.split_at_mut(value.len());
            text.copy_from_slice(value.as_bytes());
            nul[0] = 0;
        })
    }

    /// Appends a native endian `u32` length followed by the bytes of `value`.
    pub fn add_str(&mut self, value: &str) -> AllocResult<()> {
        self.add_prefixed(value.as_bytes())
    }

    /// Appends a native endian `u32` length followed by `bytes`.
    pub fn add_prefixed(&mut self, bytes: &[u8]) -> AllocResult<()> {
        let length = match u32::try_from(bytes.len()) {
            Ok(length) => length,
            Err(_) => return self.fail(AllocError::Overflow),
        };
        self.add_u32(length)?;
        self.add_bytes(bytes)
    }

    /// `begin`, `add_bytes`, `commit`.
    pub fn push_bytes(&mut self, bytes: &[u8]) -> AllocResult<ArenaRef> {
        self.push_with(|arena| arena.add_bytes(bytes))
    }

    /// `begin`, `add_zeroes`, `commit`.
    pub fn push_zeroes(&mut self, count: usize) -> AllocResult<ArenaRef> {
        self.push_with(|arena| arena.add_zeroes(count))
    }

    /// `begin`, `add_ptr`, `commit`.
    pub fn push_ptr<T>(&mut self, pointer: *const T) -> AllocResult<ArenaRef> {
        self.push_with(|arena| arena.add_ptr(pointer))
    }

    /// `begin`, `add_cstr`, `commit`.
    pub fn push_cstr(&mut self, value: &str) -> AllocResult<ArenaRef> {
        self.push_with(|arena| arena.add_cstr(value))
    }

    /// `begin`, `add_str`, `commit`.
    pub fn push_str(&mut self, value: &str) -> AllocResult<ArenaRef> {
        self.push_with(|arena| arena.add_str(value))
    }

    /// Copies `output.len()` bytes starting at `reference` into `output`.
    ///
    /// # Panics
    ///
    /// While a build is in progress, or if the range is not entirely inside
    /// the part of the arena that is in use (popped, cleared, or never
    /// allocated). Applies to every `fetch_*` and `get_*` method.
    pub fn fetch(&self, reference: ArenaRef, output: &mut [u8]) {
        output.copy_from_slice(self.get(reference, output.len()));
    }

    /// Borrows `len` bytes starting at `reference`.
    pub fn get(&self, reference: ArenaRef, len: usize) -> &[u8] {
        let start = self.check(reference, len);
        &self.used()[start..start + len]
    }

    /// Mutably borrows `len` bytes starting at `reference`.
    pub fn get_mut(&mut self, reference: ArenaRef, len: usize) -> &mut [u8] {
        let start = self.check(reference, len);
        &mut self.used_mut()[start..start + len]
    }

    /// Borrows the NUL terminated string written by [`Arena::add_cstr`].
    /// `None` if there's no terminator before the end of the arena.
    pub fn get_cstr(&self, reference: ArenaRef) -> Option<&CStr> {
        let start = self.check(reference, 0);
        CStr::from_bytes_until_nul(&self.used()[start..]).ok()
    }

    /// Borrows the bytes written by [`Arena::add_prefixed`].
    pub fn get_prefixed(&self, reference: ArenaRef) -> &[u8] {
        let length = self.fetch_u32(reference) as usize;
        let start = self.check(reference, mem::size_of::<u32>() + length);
        let data = start + mem::size_of::<u32>();
        &self.used()[data..data + length]
    }

    /// Borrows the string written by [`Arena::add_str`]. `None` if the bytes
    /// are not valid UTF-8.
    pub fn get_str(&self, reference: ArenaRef) -> Option<&str> {
        std::str::from_utf8(self.get_prefixed(reference)).ok()
    }

    /// Discards `reference` and everything allocated after it.
    ///
    /// # Panics
    ///
    /// While a build is in progress or if `reference` is already beyond the
    /// end of the arena.
    pub fn pop_upto(&mut self, reference: ArenaRef) {
        self.assert_idle("pop_upto");
        let offset = reference.offset();
        assert!(
            (MIN_OFFSET..=self.len).contains(&offset),
            "arena: cannot pop to {offset}, arena length is {}",
            self.len
        );

        log::trace!("arena popped {} bytes", self.len - offset);
        self.len = offset;
    }

    /// Discards everything. The buffer is kept.
    ///
    /// # Panics
    ///
    /// While a build is in progress.
    pub fn clear(&mut self) {
        self.assert_idle("clear");
        self.len = MIN_OFFSET;
    }

    /// Makes sure at least `additional` more bytes fit without growing.
    ///
    /// # Panics
    ///
    /// While a build is in progress.
    pub fn reserve(&mut self, additional: usize) -> AllocResult<()> {
        self.assert_idle("reserve");
        self.grow_for(additional)
    }

    /// Gives unused capacity back. Arenas that can't move keep their buffer
    /// as is.
    ///
    /// # Panics
    ///
    /// While a build is in progress.
    pub fn shrink_to_fit(&mut self) -> AllocResult<()> {
        self.assert_idle("shrink_to_fit");

        let target = align_up(self.len, ARENA_ALIGN);
        if target >= self.capacity || !self.strategies.can_move() {
            return Ok(());
        }

        // SAFETY: Buffer and capacity describe the region we own.
        let region = unsafe {
            strategy::reallocate(
                self.strategies.realloc,
                self.buffer,
                self.capacity,
                target,
                ARENA_ALIGN,
                &self.config,
            )?
        };

        self.adopt(region);
        Ok(())
    }

    /// Shared implementation of `push_*`.
    fn push_with(
        &mut self,
        add: impl FnOnce(&mut Self) -> AllocResult<()>,
    ) -> AllocResult<ArenaRef> {
        self.begin();
        match add(self) {
            Ok(()) => self.commit(),
            Err(err) => {
                self.dismiss();
                Err(err)
            }
        }
    }

    /// Reserves `len` bytes at the end of the current build and lets `fill`
    /// write them.
    fn stage(&mut self, len: usize, fill: impl FnOnce(&mut [u8])) -> AllocResult<()> {
        let failure = match self.state {
            BuildState::Idle => panic!("arena: add called without begin"),
            BuildState::Building(build) => build.failure,
        };

        if let Some(err) = failure {
            return Err(err);
        }

        if let Err(err) = self.grow_for(len) {
            return self.fail(err);
        }

        // SAFETY: grow_for guarantees len + self.len <= capacity.
        let destination =
            unsafe { slice::from_raw_parts_mut(self.buffer.as_ptr().add(self.len), len) };
        fill(destination);
        self.len += len;

        Ok(())
    }

    /// Marks the current build as failed.
    fn fail(&mut self, err: AllocError) -> AllocResult<()> {
        log::warn!("arena add failed: {err}");
        if let BuildState::Building(build) = &mut self.state {
            build.failure.get_or_insert(err);
        }
        Err(err)
    }

    /// Growth policy: at least double the capacity. With
    /// [`MemoryConfig::force_realloc_on_push`] the buffer moves on every
    /// check, whether it grows or the bytes already fit.
    fn grow_for(&mut self, additional: usize) -> AllocResult<()> {
        let needed = self
            .len
            .checked_add(additional)
            .ok_or(AllocError::Overflow)?;

        let force = self.config.force_realloc_on_push && self.strategies.can_move();

        if needed <= self.capacity && !force {
            return Ok(());
        }

        let new_capacity = if needed <= self.capacity {
            self.capacity
        } else {
            let doubled = self.capacity.checked_mul(2).ok_or(AllocError::Overflow)?;
            checked_align_up(doubled.max(needed), ARENA_ALIGN).ok_or(AllocError::Overflow)?
        };

        // SAFETY: Buffer and capacity describe the region we own.
        let region = unsafe {
            if force {
                strategy::relocate(
                    &self.strategies,
                    self.buffer,
                    self.capacity,
                    new_capacity,
                    ARENA_ALIGN,
                    &self.config,
                )?
            } else {
                strategy::reallocate(
                    self.strategies.realloc,
                    self.buffer,
                    self.capacity,
                    new_capacity,
                    ARENA_ALIGN,
                    &self.config,
                )?
            }
        };

        self.adopt(region);
        Ok(())
    }

    /// Takes ownership of a region returned by the strategy layer.
    fn adopt(&mut self, region: NonNull<[u8]>) {
        let buffer = region.cast::<u8>();
        if buffer != self.buffer {
            log::debug!(
                "arena buffer moved {:p} -> {buffer:p}, {} -> {} bytes",
                self.buffer,
                self.capacity,
                region.len()
            );
        }
        self.buffer = buffer;
        self.capacity = region.len();
    }

    /// Leaves the building state, returning the build that was in progress.
    fn finish(&mut self, operation: &str) -> Build {
        match mem::replace(&mut self.state, BuildState::Idle) {
            BuildState::Building(build) => build,
            BuildState::Idle => panic!("arena: {operation} called without begin"),
        }
    }

    fn assert_idle(&self, operation: &str) {
        assert!(
            !self.is_building(),
            "arena: {operation} while a build is in progress"
        );
    }

    /// Validates `len` bytes at `reference` for reading and returns the
    /// start offset.
    fn check(&self, reference: ArenaRef, len: usize) -> usize {
        assert!(
            !self.is_building(),
            "arena: reference dereferenced while a build is in progress"
        );

        let offset = reference.offset();
        assert!(
            offset >= MIN_OFFSET && offset < self.len && len <= self.len - offset,
            "arena: reference {offset} (+{len} bytes) out of range, arena length is {}",
            self.len
        );

        offset
    }

    fn used(&self) -> &[u8] {
        // SAFETY: The first `len` bytes are initialized and owned by us.
        unsafe { slice::from_raw_parts(self.buffer.as_ptr(), self.len) }
    }

    fn used_mut(&mut self) -> &mut [u8] {
        // SAFETY: The first `len` bytes are initialized and owned by us.
        unsafe { slice::from_raw_parts_mut(self.buffer.as_ptr(), self.len) }
    }
}

/// `add_*`, `push_*` and `fetch_*` for every integer type, native endian.
macro_rules! integer_operations {
    ($($ty:ty => $add:ident, $push:ident, $fetch:ident;)*) => {
        impl Arena {
            $(
                #[doc = concat!("Appends a `", stringify!($ty), "` to the current build.")]
                pub fn $add(&mut self, value: $ty) -> AllocResult<()> {
                    self.add_bytes(&value.to_ne_bytes())
                }

                #[doc = concat!("`begin`, `", stringify!($add), "`, `commit`.")]
                pub fn $push(&mut self, value: $ty) -> AllocResult<ArenaRef> {
                    self.push_with(|arena| arena.$add(value))
                }

                #[doc = concat!("Reads the `", stringify!($ty), "` stored at `reference`.")]
                pub fn $fetch(&self, reference: ArenaRef) -> $ty {
                    let mut bytes = [0; mem::size_of::<$ty>()];
                    self.fetch(reference, &mut bytes);
                    <$ty>::from_ne_bytes(bytes)
                }
            )*
        }
    };
}

integer_operations! {
    u8 => add_u8, push_u8, fetch_u8;
    u16 => add_u16, push_u16, fetch_u16;
    u32 => add_u32, push_u32, fetch_u32;
    u64 => add_u64, push_u64, fetch_u64;
    i8 => add_i8, push_i8, fetch_i8;
    i16 => add_i16, push_i16, fetch_i16;
    i32 => add_i32, push_i32, fetch_i32;
    i64 => add_i64, push_i64, fetch_i64;
    usize => add_usize, push_usize, fetch_usize;
    isize => add_isize, push_isize, fetch_isize;
}

impl fmt::Debug for Arena {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Arena")
            .field("buffer", &self.buffer)
            .field("len", &self.len)
            .field("capacity", &self.capacity)
            .field("strategies", &self.strategies)
            .field("state", &self.state)
            .finish()
    }
}

impl Drop for Arena {
    fn drop(&mut self) {
        log::debug!("arena released {} bytes at {:p}", self.capacity, self.buffer);

        // SAFETY: We own the buffer and nobody can reach it after this.
        unsafe {
            strategy::deallocate(
                self.strategies.dealloc,
                self.buffer,
                self.capacity,
                ARENA_ALIGN,
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        mmap,
        strategy::{AllocStrategy, DeallocStrategy, ReallocStrategy},
    };

    fn heap_arena(capacity: usize) -> Arena {
        Arena::with_strategies(capacity, Strategies::HEAP, MemoryConfig::default()).unwrap()
    }

    fn fixed_arena(capacity: usize) -> Arena {
        Arena::with_strategies(capacity, Strategies::FIXED_HEAP, MemoryConfig::default()).unwrap()
    }

    #[test]
    fn build_and_fetch() {
        let mut arena = Arena::new(64).unwrap();
        assert!(arena.is_empty());
        assert_eq!(arena.capacity(), mmap::page_size());

        arena.begin();
        assert!(arena.add_u32(0xDEADBEEF).is_ok());
        assert!(arena.add_cstr("hi").is_ok());
        let reference = arena.commit().unwrap();

        assert_eq!(reference.offset(), MIN_OFFSET);
        assert_eq!(arena.len(), MIN_OFFSET + 4 + 3);

        let mut out = [0; 4];
        arena.fetch(reference, &mut out);
        assert_eq!(u32::from_ne_bytes(out), 0xDEADBEEF);

        let text = ArenaRef::from_offset(reference.offset() + 4).unwrap();
        assert_eq!(arena.get_cstr(text).unwrap().to_bytes(), b"hi");
    }

    #[test]
    fn zero_is_not_a_reference() {
        assert_eq!(ArenaRef::from_offset(0), None);
        assert_eq!(ArenaRef::from_offset(16).unwrap().offset(), 16);
        assert_eq!(mem::size_of::<Option<ArenaRef>>(), mem::size_of::<usize>());
    }

    #[test]
    fn push_every_integer_width() {
        let mut arena = heap_arena(16);

        let a = arena.push_u8(0xAB).unwrap();
        let b = arena.push_i16(-2).unwrap();
        let c = arena.push_u64(u64::MAX - 1).unwrap();
        let d = arena.push_isize(-12345).unwrap();
        let e = arena.push_i8(-1).unwrap();

        assert_eq!(arena.fetch_u8(a), 0xAB);
        assert_eq!(arena.fetch_i16(b), -2);
        assert_eq!(arena.fetch_u64(c), u64::MAX - 1);
        assert_eq!(arena.fetch_isize(d), -12345);
        assert_eq!(arena.fetch_i8(e), -1);

        // No padding between pushes.
        assert_eq!(b.offset(), a.offset() + 1);
        assert_eq!(c.offset(), b.offset() + 2);
    }

    #[test]
    fn explicit_alignment() {
        let mut arena = heap_arena(64);

        arena.begin();
        arena.add_u8(1).unwrap();
        arena.add_align(8).unwrap();
        assert_eq!(arena.len() % 8, 0);
        arena.add_u64(2).unwrap();
        let reference = arena.commit().unwrap();

        let value = ArenaRef::from_offset(reference.offset() + 8).unwrap();
        assert_eq!(arena.fetch_u64(value), 2);
        assert_eq!(arena.get(reference, 8), &[1, 0, 0, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn failed_build_rolls_back() {
        let mut arena = fixed_arena(64);
        arena.push_u32(7).unwrap();
        let before = arena.len();

        arena.begin();
        assert!(arena.add_bytes(&[1; 32]).is_ok());
        let err = arena.add_bytes(&[2; 32]).unwrap_err();
        assert!(matches!(err, AllocError::CannotGrow { .. }));

        // Failed builds keep accepting calls, they just don't do anything.
        assert_eq!(arena.add_u8(3), Err(err));
        assert_eq!(arena.add_cstr("ignored"), Err(err));

        assert_eq!(arena.commit(), Err(err));
        assert_eq!(arena.len(), before);

        // Arena still usable afterwards.
        let reference = arena.push_u16(9).unwrap();
        assert_eq!(arena.fetch_u16(reference), 9);
    }

    #[test]
    fn dismiss_rolls_back() {
        let mut arena = heap_arena(64);
        let before = arena.len();

        arena.begin();
        arena.add_u64(1).unwrap();
        arena.add_str("discarded").unwrap();
        arena.dismiss();

        assert_eq!(arena.len(), before);
        assert!(!arena.is_building());
    }

    #[test]
    fn failed_push_leaves_arena_untouched() {
        let mut arena = fixed_arena(32);
        let before = arena.len();
        assert!(arena.push_bytes(&[0; 64]).is_err());
        assert_eq!(arena.len(), before);
        assert!(!arena.is_building());
    }

    #[test]
    fn references_survive_growth() {
        let mut arena = heap_arena(16);
        let initial_capacity = arena.capacity();

        let references: Vec<_> = (0..1000u32)
            .map(|i| arena.push_u32(i * 3).unwrap())
            .collect();

        assert!(arena.capacity() > initial_capacity);
        for (i, reference) in references.iter().enumerate() {
            assert_eq!(arena.fetch_u32(*reference), i as u32 * 3);
        }
    }

    #[test]
    fn growth_at_least_doubles() {
        let mut arena = heap_arena(64);
        arena.push_bytes(&[1; 48]).unwrap();
        arena.push_u8(1).unwrap();
        assert_eq!(arena.capacity(), 128);

        // Bigger than double, take exactly what's needed.
        arena.push_bytes(&[0; 1000]).unwrap();
        assert_eq!(arena.capacity(), align_up(MIN_OFFSET + 48 + 1 + 1000, ARENA_ALIGN));
    }

    #[test]
    fn pop_upto_discards_later_references() {
        let mut arena = heap_arena(64);
        let a = arena.push_u32(1).unwrap();
        let b = arena.push_u32(2).unwrap();
        let c = arena.push_u32(3).unwrap();

        arena.pop_upto(b);
        assert_eq!(arena.len(), b.offset());
        assert_eq!(arena.fetch_u32(a), 1);

        // Reuses the popped space.
        let d = arena.push_u32(4).unwrap();
        assert_eq!(d, b);
        assert_eq!(arena.fetch_u32(d), 4);
        assert!(c > d);
    }

    #[test]
    #[should_panic(expected = "out of range")]
    fn fetch_after_pop_panics() {
        let mut arena = heap_arena(64);
        let a = arena.push_u32(1).unwrap();
        let b = arena.push_u32(2).unwrap();
        arena.pop_upto(a);
        arena.fetch_u32(b);
    }

    #[test]
    #[should_panic(expected = "while a build is in progress")]
    fn fetch_while_building_panics() {
        let mut arena = heap_arena(64);
        let a = arena.push_u32(1).unwrap();
        arena.begin();
        arena.fetch_u32(a);
    }

    #[test]
    #[should_panic(expected = "begin called while a build is in progress")]
    fn nested_builds_panic() {
        let mut arena = heap_arena(64);
        arena.begin();
        arena.begin();
    }

    #[test]
    #[should_panic(expected = "commit called without begin")]
    fn commit_without_begin_panics() {
        let mut arena = heap_arena(64);
        let _ = arena.commit();
    }

    #[test]
    #[should_panic(expected = "add called without begin")]
    fn add_without_begin_panics() {
        let mut arena = heap_arena(64);
        let _ = arena.add_u8(1);
    }

    #[test]
    #[should_panic(expected = "out of range")]
    fn fetch_past_end_panics() {
        let mut arena = heap_arena(64);
        let a = arena.push_u16(1).unwrap();
        arena.fetch_u32(a);
    }

    #[test]
    fn clear_keeps_buffer() {
        let mut arena = heap_arena(64);
        arena.push_bytes(&[7; 200]).unwrap();
        let capacity = arena.capacity();

        arena.clear();
        assert!(arena.is_empty());
        assert_eq!(arena.capacity(), capacity);

        let reference = arena.push_u8(1).unwrap();
        assert_eq!(reference.offset(), MIN_OFFSET);
    }

    #[test]
    fn strings() {
        let mut arena = heap_arena(64);
        let c = arena.push_cstr("hello").unwrap();
        let s = arena.push_str("prefixed").unwrap();
        let raw = arena.push_bytes(&[0xFF, 0xFE]).unwrap();

        assert_eq!(arena.get_cstr(c).unwrap().to_str().unwrap(), "hello");
        assert_eq!(arena.get_str(s), Some("prefixed"));
        assert_eq!(arena.fetch_u32(s), 8);
        assert_eq!(arena.get(raw, 2), &[0xFF, 0xFE]);
    }

    #[test]
    fn pointers() {
        let mut arena = heap_arena(64);
        let value = 5u64;
        let reference = arena.push_ptr(&value as *const u64).unwrap();
        assert_eq!(arena.fetch_usize(reference), &value as *const u64 as usize);
    }

    #[test]
    fn get_mut_writes_through() {
        let mut arena = heap_arena(64);
        let reference = arena.push_zeroes(4).unwrap();
        arena.get_mut(reference, 4).copy_from_slice(&42u32.to_ne_bytes());
        assert_eq!(arena.fetch_u32(reference), 42);
    }

    #[test]
    fn forced_relocation_moves_every_push() {
        let config = MemoryConfig::new().with_force_realloc(true);
        let mut arena = Arena::with_strategies(1024, Strategies::HEAP, config).unwrap();

        let mut references = Vec::new();
        for i in 0..32u64 {
            let before = arena.buffer;
            references.push(arena.push_u64(i).unwrap());
            assert_ne!(arena.buffer, before);
        }

        for (i, reference) in references.iter().enumerate() {
            assert_eq!(arena.fetch_u64(*reference), i as u64);
        }
    }

    #[test]
    fn forced_relocation_moves_growing_pushes() {
        let config = MemoryConfig::new().with_force_realloc(true);
        let mut arenas = [
            Arena::with_strategies(64, Strategies::HEAP, config).unwrap(),
            Arena::with_strategies(64, Strategies::PAGE_MAP, config).unwrap(),
        ];

        for arena in &mut arenas {
            let first = arena.push_u64(7).unwrap();

            for _ in 0..8 {
                let before = arena.buffer;
                let overflow = arena.capacity() - arena.len() + 1;
                let reference = arena.push_zeroes(overflow).unwrap();

                assert_ne!(arena.buffer, before);
                assert!(arena.capacity() >= arena.len());
                assert!(arena.get(reference, overflow).iter().all(|byte| *byte == 0));
            }

            assert_eq!(arena.fetch_u64(first), 7);
        }
    }

    #[test]
    fn forced_relocation_ignored_for_fixed_arenas() {
        let config = MemoryConfig::new().with_force_realloc(true);
        let mut arena = Arena::with_strategies(1024, Strategies::FIXED_HEAP, config).unwrap();
        let before = arena.buffer;
        arena.push_u64(1).unwrap();
        assert_eq!(arena.buffer, before);
    }

    #[test]
    fn debug_layer_page_arena() {
        let config = MemoryConfig::new().with_debug_memory_layer(true);
        let mut arena = Arena::with_strategies(64, Strategies::PAGE_MAP, config).unwrap();

        let first = arena.push_u32(11).unwrap();
        let before = arena.buffer;
        arena.push_bytes(&vec![1; mmap::page_size() * 2]).unwrap();
        assert_ne!(arena.buffer, before);
        assert_eq!(arena.fetch_u32(first), 11);
    }

    #[test]
    fn reserve_and_shrink() {
        let mut arena = heap_arena(64);
        arena.reserve(4000).unwrap();
        assert!(arena.capacity() >= MIN_OFFSET + 4000);

        let reference = arena.push_u32(99).unwrap();
        arena.shrink_to_fit().unwrap();
        assert_eq!(arena.capacity(), align_up(arena.len(), ARENA_ALIGN));
        assert_eq!(arena.fetch_u32(reference), 99);
    }

    #[test]
    fn keep_address_arena_grows_in_place_or_fails() {
        let strategies = Strategies::new(
            AllocStrategy::PageMap,
            ReallocStrategy::RemapKeepAddress,
            DeallocStrategy::PageUnmap,
        );
        let mut arena = Arena::with_strategies(64, strategies, MemoryConfig::default()).unwrap();
        let first = arena.push_u32(21).unwrap();
        let buffer = arena.buffer;
        let capacity = arena.capacity();

        match arena.push_zeroes(capacity) {
            Ok(reference) => {
                assert!(arena.capacity() > capacity);
                assert_eq!(arena.get(reference, capacity).len(), capacity);
            }
            Err(err) => {
                assert!(matches!(err, AllocError::CannotGrow { .. }));
                assert_eq!(arena.capacity(), capacity);
                assert_eq!(arena.len(), MIN_OFFSET + 4);
            }
        }

        assert_eq!(arena.buffer, buffer);
        assert_eq!(arena.fetch_u32(first), 21);
    }

    #[test]
    fn fixed_page_arena_cannot_grow() {
        let mut arena =
            Arena::with_strategies(64, Strategies::FIXED_PAGE_MAP, MemoryConfig::default())
                .unwrap();
        let capacity = arena.capacity();

        assert!(arena.push_bytes(&vec![0; capacity - MIN_OFFSET]).is_ok());
        assert!(matches!(
            arena.push_u8(1),
            Err(AllocError::CannotGrow { .. })
        ));
        assert_eq!(arena.capacity(), capacity);
    }
}
