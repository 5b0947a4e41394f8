use std::{
    ptr::NonNull,
    sync::atomic::{AtomicUsize, Ordering},
};

use crate::{
    mmap::{MapRequest, Protection},
    Pointer,
};

/// Abstraction for platform specific memory handling. The allocators only
/// need to request pages of memory, change their protection, resize them and
/// return them back when they are no longer in use, but they don't care about
/// the APIs offered by the underlying kernel or libraries.
trait PlatformSpecificMemory {
    /// Requests a memory region from the kernel as described by `request`.
    /// `request.size` is already a multiple of the page size.
    unsafe fn request_memory(request: &MapRequest) -> Pointer<u8>;

    /// Attempts to return `length` bytes starting from `address` to the
    /// underlying kernel. Returns whether the kernel accepted.
    unsafe fn return_memory(address: NonNull<u8>, length: usize) -> bool;

    /// Changes the protection of the pages in `address..address + length`.
    unsafe fn protect_memory(address: NonNull<u8>, length: usize, protection: Protection) -> bool;

    /// Resizes a mapping previously obtained from [`Self::request_memory`].
    /// If `may_move` is false the returned address must equal `address`.
    unsafe fn resize_memory(
        address: NonNull<u8>,
        old_length: usize,
        new_length: usize,
        may_move: bool,
    ) -> Pointer<u8>;

    /// Virtual memory page size in bytes.
    unsafe fn page_size() -> usize;
}

/// Zero sized type that implements [`PlatformSpecificMemory`] for each OS.
pub(crate) struct Platform;

/// Virtual memory page size. 4096 bytes on most computers. This should be a
/// constant but we don't know the value at compile time. Zero means "not
/// queried yet".
static PAGE_SIZE: AtomicUsize = AtomicUsize::new(0);

/// We only know the value of the page size at runtime by calling into C
/// libraries, so we'll cache it and reuse it afterwards.
#[inline]
pub(crate) fn page_size() -> usize {
    match PAGE_SIZE.load(Ordering::Relaxed) {
        0 => {
            let size = unsafe { Platform::page_size() };
            PAGE_SIZE.store(size, Ordering::Relaxed);
            size
        }
        size => size,
    }
}

/// Convenience wrapper for [`PlatformSpecificMemory::request_memory`].
#[inline]
pub(crate) unsafe fn request_memory(request: &MapRequest) -> Pointer<u8> {
    Platform::request_memory(request)
}

/// Convenience wrapper for [`PlatformSpecificMemory::return_memory`].
#[inline]
pub(crate) unsafe fn return_memory(address: NonNull<u8>, length: usize) -> bool {
    Platform::return_memory(address, length)
}

/// Convenience wrapper for [`PlatformSpecificMemory::protect_memory`].
#[inline]
pub(crate) unsafe fn protect_memory(
    address: NonNull<u8>,
    length: usize,
    protection: Protection,
) -> bool {
    Platform::protect_memory(address, length, protection)
}

/// Convenience wrapper for [`PlatformSpecificMemory::resize_memory`].
#[inline]
pub(crate) unsafe fn resize_memory(
    address: NonNull<u8>,
    old_length: usize,
    new_length: usize,
    may_move: bool,
) -> Pointer<u8> {
    Platform::resize_memory(address, old_length, new_length, may_move)
}

/// Resizing for platforms without a native remap call. Shrinking and equal
/// lengths stay in place, the platform has already given the tail back if it
/// can. Growing needs a fresh mapping, so it only works if the caller allows
/// moving.
#[cfg(any(not(target_os = "linux"), miri))]
unsafe fn resize_by_copy(
    address: NonNull<u8>,
    old_length: usize,
    new_length: usize,
    may_move: bool,
) -> Pointer<u8> {
    if new_length <= old_length {
        return Some(address);
    }

    if !may_move {
        return None;
    }

    let new_address = Platform::request_memory(&MapRequest::anonymous(new_length))?;
    std::ptr::copy_nonoverlapping(address.as_ptr(), new_address.as_ptr(), old_length);

    assert!(
        Platform::return_memory(address, old_length),
        "failed to unmap {old_length} bytes at {address:p} after copying"
    );

    Some(new_address)
}

#[cfg(unix)]
#[cfg(not(miri))]
mod unix {
    use std::ptr::{self, NonNull};

    use libc;

    use super::{Platform, PlatformSpecificMemory};
    use crate::{
        mmap::{MapFlags, MapRequest, Protection},
        Pointer,
    };

    /// `MAP_HUGE_SHIFT` from `<linux/mman.h>`. Huge page sizes are encoded as
    /// log2 of the size shifted by this amount.
    #[cfg(target_os = "linux")]
    const MAP_HUGE_SHIFT: libc::c_int = 26;

    fn protection_bits(protection: Protection) -> libc::c_int {
        let mut bits = libc::PROT_NONE;
        if protection.contains(Protection::READ) {
            bits |= libc::PROT_READ;
        }
        if protection.contains(Protection::WRITE) {
            bits |= libc::PROT_WRITE;
        }
        if protection.contains(Protection::EXEC) {
            bits |= libc::PROT_EXEC;
        }
        bits
    }

    fn flag_bits(flags: MapFlags) -> libc::c_int {
        let mut bits = 0;
        if flags.contains(MapFlags::SHARED) {
            bits |= libc::MAP_SHARED;
        } else {
            bits |= libc::MAP_PRIVATE;
        }
        if flags.contains(MapFlags::ANONYMOUS) {
            bits |= libc::MAP_ANONYMOUS;
        }

        // Everything below is Linux only. Other unices simply don't get the
        // hint, the mapping still works.
        #[cfg(target_os = "linux")]
        {
            if flags.contains(MapFlags::LOCKED) {
                bits |= libc::MAP_LOCKED;
            }
            if flags.contains(MapFlags::POPULATE) {
                bits |= libc::MAP_POPULATE;
            }
            if flags.contains(MapFlags::HUGE_2MB) {
                bits |= libc::MAP_HUGETLB | (21 << MAP_HUGE_SHIFT);
            } else if flags.contains(MapFlags::HUGE_1GB) {
                bits |= libc::MAP_HUGETLB | (30 << MAP_HUGE_SHIFT);
            }
        }

        bits
    }

    impl PlatformSpecificMemory for Platform {
        unsafe fn request_memory(request: &MapRequest) -> Pointer<u8> {
            let hint = request
                .address_hint
                .map_or(ptr::null_mut(), |address| address.as_ptr().cast());

            // For all the configuration options that `mmap` accepts see
            // https://man7.org/linux/man-pages/man2/mmap.2.html
            match libc::mmap(
                hint,
                request.size,
                protection_bits(request.protection),
                flag_bits(request.flags),
                -1,
                0,
            ) {
                libc::MAP_FAILED => None,
                address => Some(NonNull::new_unchecked(address).cast()),
            }
        }

        unsafe fn return_memory(address: NonNull<u8>, length: usize) -> bool {
            libc::munmap(address.cast().as_ptr(), length) == 0
        }

        unsafe fn protect_memory(
            address: NonNull<u8>,
            length: usize,
            protection: Protection,
        ) -> bool {
            libc::mprotect(address.cast().as_ptr(), length, protection_bits(protection)) == 0
        }

        #[cfg(target_os = "linux")]
        unsafe fn resize_memory(
            address: NonNull<u8>,
            old_length: usize,
            new_length: usize,
            may_move: bool,
        ) -> Pointer<u8> {
            let flags = if may_move { libc::MREMAP_MAYMOVE } else { 0 };

            match libc::mremap(address.cast().as_ptr(), old_length, new_length, flags) {
                libc::MAP_FAILED => None,
                address => Some(NonNull::new_unchecked(address).cast()),
            }
        }

        #[cfg(not(target_os = "linux"))]
        unsafe fn resize_memory(
            address: NonNull<u8>,
            old_length: usize,
            new_length: usize,
            may_move: bool,
        ) -> Pointer<u8> {
            // Shrinking only needs the tail unmapped.
            if new_length < old_length {
                let tail = address.as_ptr().add(new_length);
                let released = libc::munmap(tail.cast(), old_length - new_length) == 0;
                return released.then_some(address);
            }

            super::resize_by_copy(address, old_length, new_length, may_move)
        }

        unsafe fn page_size() -> usize {
            libc::sysconf(libc::_SC_PAGE_SIZE) as usize
        }
    }
}

#[cfg(windows)]
#[cfg(not(miri))]
mod windows {
    use std::{mem::MaybeUninit, ptr::NonNull};

    use windows::Win32::System::{Memory, SystemInformation};

    use super::{Platform, PlatformSpecificMemory};
    use crate::{
        mmap::{MapRequest, Protection},
        Pointer,
    };

    fn protection_flags(protection: Protection) -> Memory::PAGE_PROTECTION_FLAGS {
        let read = protection.contains(Protection::READ);
        let write = protection.contains(Protection::WRITE);
        let exec = protection.contains(Protection::EXEC);

        // Windows has no write-only pages, writing implies reading.
        match (exec, read || write, write) {
            (false, false, _) => Memory::PAGE_NOACCESS,
            (false, true, false) => Memory::PAGE_READONLY,
            (false, true, true) => Memory::PAGE_READWRITE,
            (true, false, _) => Memory::PAGE_EXECUTE,
            (true, true, false) => Memory::PAGE_EXECUTE_READ,
            (true, true, true) => Memory::PAGE_EXECUTE_READWRITE,
        }
    }

    impl PlatformSpecificMemory for Platform {
        unsafe fn request_memory(request: &MapRequest) -> Pointer<u8> {
            // This works a little bit different from mmap, memory has to be
            // reserved first and then committed in order to become usable. We
            // can do both at the same time with one single call. Sharing,
            // locking and huge pages are not supported here.
            let flags = Memory::MEM_RESERVE | Memory::MEM_COMMIT;
            let hint = request
                .address_hint
                .map(|address| address.as_ptr().cast_const().cast());

            let address = Memory::VirtualAlloc(
                hint,
                request.size,
                flags,
                protection_flags(request.protection),
            );

            NonNull::new(address.cast())
        }

        unsafe fn return_memory(address: NonNull<u8>, _length: usize) -> bool {
            // We can skip decommitting by specifying length of 0 and
            // MEM_RELEASE flag. See the docs for details:
            // https://learn.microsoft.com/en-us/windows/win32/api/memoryapi/nf-memoryapi-virtualfree#parameters
            Memory::VirtualFree(address.cast().as_ptr(), 0, Memory::MEM_RELEASE).as_bool()
        }

        unsafe fn protect_memory(
            address: NonNull<u8>,
            length: usize,
            protection: Protection,
        ) -> bool {
            let mut old = Memory::PAGE_PROTECTION_FLAGS::default();
            Memory::VirtualProtect(
                address.as_ptr().cast_const().cast(),
                length,
                protection_flags(protection),
                &mut old,
            )
            .as_bool()
        }

        unsafe fn resize_memory(
            address: NonNull<u8>,
            old_length: usize,
            new_length: usize,
            may_move: bool,
        ) -> Pointer<u8> {
            // The reservation keeps its original size, only the tail pages
            // are decommitted. Releasing later frees the whole reservation.
            if new_length < old_length {
                let tail = address.as_ptr().add(new_length);
                let decommitted =
                    Memory::VirtualFree(tail.cast(), old_length - new_length, Memory::MEM_DECOMMIT)
                        .as_bool();
                if !decommitted {
                    return None;
                }
            }

            super::resize_by_copy(address, old_length, new_length, may_move)
        }

        unsafe fn page_size() -> usize {
            let mut system_info = MaybeUninit::uninit();
            SystemInformation::GetSystemInfo(system_info.as_mut_ptr());

            system_info.assume_init().dwPageSize as usize
        }
    }
}

#[cfg(miri)]
mod miri {
    //! When using Miri, we can't rely on system calls such as `mmap` because
    //! there's no FFI support, so instead we'll use the global allocator to
    //! mock low level memory managament. This is also useful for detecting
    //! memory leaks in our own allocators (chunks that are not returned back
    //! to the kernel).

    use std::{alloc, ptr::NonNull};

    use super::{page_size, Platform, PlatformSpecificMemory};
    use crate::{
        mmap::{MapRequest, Protection},
        Pointer,
    };

    fn to_layout(length: usize) -> Option<alloc::Layout> {
        alloc::Layout::from_size_align(length, page_size()).ok()
    }

    // Each mock mapping is preceded by one extra page whose first word holds
    // the allocated length. Mappings shrunk in place keep that length, so
    // they are deallocated with the layout they were allocated with.
    impl PlatformSpecificMemory for Platform {
        unsafe fn request_memory(request: &MapRequest) -> Pointer<u8> {
            let total = request.size.checked_add(page_size())?;
            // Anonymous mappings are zero filled, so is this.
            let base = NonNull::new(alloc::alloc_zeroed(to_layout(total)?))?;
            base.as_ptr().cast::<usize>().write(total);

            NonNull::new(base.as_ptr().add(page_size()))
        }

        unsafe fn return_memory(address: NonNull<u8>, _length: usize) -> bool {
            let base = address.as_ptr().sub(page_size());
            match to_layout(base.cast::<usize>().read()) {
                Some(layout) => {
                    alloc::dealloc(base, layout);
                    true
                }
                None => false,
            }
        }

        unsafe fn protect_memory(_: NonNull<u8>, _: usize, _: Protection) -> bool {
            false
        }

        unsafe fn resize_memory(
            address: NonNull<u8>,
            old_length: usize,
            new_length: usize,
            may_move: bool,
        ) -> Pointer<u8> {
            super::resize_by_copy(address, old_length, new_length, may_move)
        }

        unsafe fn page_size() -> usize {
            4096
        }
    }
}
