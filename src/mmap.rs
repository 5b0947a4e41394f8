//! Page-mapping primitive. Every allocator in this crate gets its backing
//! storage from here, either directly or through [`crate::strategy`].
//!
//! Failures to obtain memory are reported as `None`. Failures to give memory
//! back or to unmap with a bogus length are bugs in the caller and panic.

use std::ptr::NonNull;

use bitflags::bitflags;

use crate::{align::checked_align_up, platform, Pointer};

bitflags! {
    /// Page protection. The empty set means no access at all.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Protection: u8 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXEC = 1 << 2;
    }
}

impl Protection {
    /// No access, reading or writing faults.
    pub const NONE: Self = Self::empty();
    /// Regular data pages.
    pub const READ_WRITE: Self = Self::READ.union(Self::WRITE);
}

bitflags! {
    /// Mapping type. Flags the current platform cannot honor are ignored.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct MapFlags: u8 {
        const PRIVATE = 1 << 0;
        const SHARED = 1 << 1;
        const ANONYMOUS = 1 << 2;
        /// Lock the pages in RAM (Linux only).
        const LOCKED = 1 << 3;
        /// Prefault the pages (Linux only).
        const POPULATE = 1 << 4;
        /// Back the mapping with 2 MiB huge pages (Linux only).
        const HUGE_2MB = 1 << 5;
        /// Back the mapping with 1 GiB huge pages (Linux only).
        const HUGE_1GB = 1 << 6;
    }
}

/// Everything the kernel needs to know to hand out a region of pages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MapRequest {
    /// Where we'd like the mapping to start. The kernel is free to ignore it.
    pub address_hint: Pointer<u8>,
    /// Length in bytes. Must be a multiple of [`page_size`].
    pub size: usize,
    pub protection: Protection,
    pub flags: MapFlags,
}

impl MapRequest {
    /// Private, anonymous, read-write pages. This is what the allocators use.
    pub const fn anonymous(size: usize) -> Self {
        Self {
            address_hint: None,
            size,
            protection: Protection::READ_WRITE,
            flags: MapFlags::PRIVATE.union(MapFlags::ANONYMOUS),
        }
    }
}

/// Virtual memory page size in bytes, queried once.
#[inline]
pub fn page_size() -> usize {
    platform::page_size()
}

/// Rounds `size` up to a whole number of pages, `None` on overflow.
#[inline]
pub fn page_align(size: usize) -> Option<usize> {
    checked_align_up(size, page_size())
}

/// Maps at least `size` bytes of private anonymous read-write memory. The
/// actual mapping length is `page_align(size)`, keep that around because
/// [`unmap`] wants it back.
pub fn map(size: usize) -> Pointer<u8> {
    let length = page_align(size)?;
    map_with(&MapRequest::anonymous(length))
}

/// Maps a region as described by `request`.
///
/// # Panics
///
/// If `request.size` is not a multiple of the page size.
pub fn map_with(request: &MapRequest) -> Pointer<u8> {
    assert!(
        request.size % page_size() == 0,
        "mapping length {} is not page aligned",
        request.size
    );

    if request.size == 0 {
        return None;
    }

    // SAFETY: We only hand the kernel a length and flags, no pointers of ours
    // are dereferenced.
    let address = unsafe { platform::request_memory(request) };

    match address {
        Some(address) => log::trace!("mapped {} bytes at {address:p}", request.size),
        None => log::warn!("kernel refused to map {} bytes", request.size),
    }

    address
}

/// Returns a region obtained from [`map`] or [`map_with`] to the kernel.
///
/// # Safety
///
/// `address` and `size` must describe a live mapping obtained from this
/// module, and nothing may access it afterwards.
///
/// # Panics
///
/// If `size` is not page aligned or if the kernel rejects the call. Both mean
/// our bookkeeping is wrong.
pub unsafe fn unmap(address: NonNull<u8>, size: usize) {
    assert!(
        size % page_size() == 0,
        "unmapping length {size} is not page aligned"
    );

    log::trace!("unmapping {size} bytes at {address:p}");

    assert!(
        platform::return_memory(address, size),
        "failed to unmap {size} bytes at {address:p}"
    );
}

/// Changes the protection of `length` bytes starting at `address`. Returns
/// whether the kernel applied it.
///
/// # Safety
///
/// `address` must be page aligned and the range must belong to a mapping
/// obtained from this module. Taking away access from memory that is still
/// referenced turns every later access into a fault, that's the point.
pub unsafe fn protect(address: NonNull<u8>, length: usize, protection: Protection) -> bool {
    platform::protect_memory(address, length, protection)
}

/// Resizes a mapping. Both lengths must be page aligned. If `may_move` is
/// false the mapping either grows or shrinks where it is or the call fails.
/// On failure the original mapping is left untouched.
///
/// # Safety
///
/// `address` and `old_size` must describe a live mapping obtained from this
/// module. If the mapping moves, the old address must not be used anymore.
pub unsafe fn remap(
    address: NonNull<u8>,
    old_size: usize,
    new_size: usize,
    may_move: bool,
) -> Pointer<u8> {
    assert!(
        old_size % page_size() == 0 && new_size % page_size() == 0,
        "remapping lengths {old_size} -> {new_size} are not page aligned"
    );

    let new_address = platform::resize_memory(address, old_size, new_size, may_move);

    match new_address {
        Some(new_address) if new_address != address => {
            log::debug!("mapping moved from {address:p} to {new_address:p} ({new_size} bytes)");
        }
        Some(_) => log::trace!("mapping at {address:p} resized to {new_size} bytes"),
        None => log::warn!("failed to remap {old_size} -> {new_size} bytes at {address:p}"),
    }

    new_address
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn map_rounds_up_to_pages() {
        unsafe {
            let address = map(1).unwrap();
            // Whole page must be writable.
            address.as_ptr().write_bytes(7, page_size());
            assert_eq!(*address.as_ptr().add(page_size() - 1), 7);
            unmap(address, page_size());
        }
    }

    #[test]
    fn map_zero_fails() {
        assert!(map(0).is_none());
    }

    #[test]
    fn anonymous_pages_are_zeroed() {
        unsafe {
            let length = page_size() * 2;
            let address = map(length).unwrap();
            for i in 0..length {
                assert_eq!(*address.as_ptr().add(i), 0);
            }
            unmap(address, length);
        }
    }

    #[test]
    #[should_panic(expected = "not page aligned")]
    fn unmap_requires_page_alignment() {
        unsafe {
            let address = map(page_size()).unwrap();
            unmap(address, page_size() - 1);
        }
    }

    #[test]
    fn remap_preserves_contents() {
        unsafe {
            let address = map(page_size()).unwrap();
            *address.as_ptr() = 42;

            let grown = remap(address, page_size(), page_size() * 4, true).unwrap();
            assert_eq!(*grown.as_ptr(), 42);
            *grown.as_ptr().add(page_size() * 4 - 1) = 24;

            unmap(grown, page_size() * 4);
        }
    }

    #[cfg(all(unix, not(miri)))]
    #[test]
    fn protect_round_trip() {
        unsafe {
            let address = map(page_size()).unwrap();
            assert!(protect(address, page_size(), Protection::READ));
            assert_eq!(*address.as_ptr(), 0);
            assert!(protect(address, page_size(), Protection::READ_WRITE));
            *address.as_ptr() = 1;
            unmap(address, page_size());
        }
    }

    #[test]
    fn map_with_address_hint() {
        unsafe {
            let length = page_size() * 2;
            let hint = map(length).unwrap();
            unmap(hint, length);

            // The kernel may or may not honor the hint, either way we get
            // usable pages.
            let request = MapRequest {
                address_hint: Some(hint),
                ..MapRequest::anonymous(length)
            };
            let address = map_with(&request).unwrap();
            assert_eq!(address.as_ptr() as usize % page_size(), 0);
            address.as_ptr().write_bytes(3, length);
            assert_eq!(*address.as_ptr().add(length - 1), 3);

            unmap(address, length);
        }
    }

    #[test]
    fn map_with_populate() {
        unsafe {
            let length = page_size() * 4;
            let request = MapRequest {
                flags: MapFlags::PRIVATE | MapFlags::ANONYMOUS | MapFlags::POPULATE,
                ..MapRequest::anonymous(length)
            };
            let address = map_with(&request).unwrap();
            for i in (0..length).step_by(page_size()) {
                assert_eq!(*address.as_ptr().add(i), 0);
                *address.as_ptr().add(i) = 1;
            }

            unmap(address, length);
        }
    }

    #[test]
    fn map_with_shared_anonymous() {
        unsafe {
            let request = MapRequest {
                flags: MapFlags::SHARED | MapFlags::ANONYMOUS,
                ..MapRequest::anonymous(page_size())
            };
            let address = map_with(&request).unwrap();
            assert_eq!(*address.as_ptr(), 0);
            *address.as_ptr().add(page_size() - 1) = 9;
            assert_eq!(*address.as_ptr().add(page_size() - 1), 9);

            unmap(address, page_size());
        }
    }

    #[test]
    fn remap_keep_address_shrinks_in_place() {
        unsafe {
            let length = page_size() * 4;
            let address = map(length).unwrap();
            *address.as_ptr() = 5;

            let shrunk = remap(address, length, page_size(), false).unwrap();
            assert_eq!(shrunk, address);
            assert_eq!(*shrunk.as_ptr(), 5);

            unmap(shrunk, page_size());
        }
    }

    #[test]
    fn remap_keep_address_never_moves() {
        unsafe {
            let address = map(page_size()).unwrap();
            *address.as_ptr() = 8;

            match remap(address, page_size(), page_size() * 2, false) {
                Some(grown) => {
                    assert_eq!(grown, address);
                    *grown.as_ptr().add(page_size() * 2 - 1) = 1;
                    unmap(grown, page_size() * 2);
                }
                None => {
                    assert_eq!(*address.as_ptr(), 8);
                    unmap(address, page_size());
                }
            }
        }
    }

    #[test]
    fn page_align_overflow() {
        assert_eq!(page_align(usize::MAX), None);
        assert_eq!(page_align(page_size() + 1), Some(page_size() * 2));
    }
}
