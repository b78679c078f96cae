//! Thin wrapper around the operating system's virtual memory calls.
//!
//! The metadata region `M` and the payload region `D` (see
//! [`crate::state`]) are each obtained through this module as calls to
//! [`reserve_region`]/[`reserve_region_fixed`]. Unlike a general
//! `Mapper` abstraction, msmalloc only ever needs anonymous,
//! read/write, process-private memory, so we keep this to the bare
//! minimum: no guard pages, no alternate backends.

use std::ffi::c_void;
use std::ptr::NonNull;

fn page_size_or_die() -> usize {
    let ret = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };

    if ret <= 0 {
        panic!("unable to determine page size");
    }

    ret as usize
}

lazy_static::lazy_static! {
    static ref PAGE_SIZE: usize = page_size_or_die();
}

/// Returns the system page size.
#[inline]
pub fn page_size() -> usize {
    *PAGE_SIZE
}

/// Rounds `size` up to the next multiple of the page size.
#[inline]
pub fn round_up_to_page(size: usize) -> usize {
    let page = page_size();
    (size + page - 1) & !(page - 1)
}

fn mmap_at(hint: *mut c_void, size: usize) -> Result<(NonNull<c_void>, usize), i32> {
    let ptr = unsafe {
        libc::mmap(
            hint,
            size,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            0,
        )
    };

    if ptr == libc::MAP_FAILED {
        return Err(unsafe { *libc::__errno_location() });
    }

    let base = NonNull::new(ptr).expect("mmap succeeded but returned a null pointer");
    Ok((base, size))
}

/// Reserves and backs a fresh anonymous, read/write region of at
/// least `size` bytes (rounded up to a whole number of pages).
///
/// Returns the base address and the actual (page-rounded) size on
/// success, or the raw `errno` on failure.
pub fn reserve_region(size: usize) -> Result<(NonNull<c_void>, usize), i32> {
    assert!(size > 0, "reserve_region called with a zero size");
    mmap_at(std::ptr::null_mut(), round_up_to_page(size))
}

/// Reserves exactly `size` bytes at `at`, failing rather than
/// silently relocating if that address range is unavailable.
///
/// Used by [`crate::grow`] to keep the payload region `D` contiguous:
/// growth always asks for memory immediately past the current
/// `data_end`, and a relocated mapping there would violate the
/// address-ordering invariant on chunk records (spec.md §3 invariant
/// 1). `size` must already be a multiple of the page size.
#[cfg(target_os = "linux")]
pub fn reserve_region_fixed(at: *mut c_void, size: usize) -> Result<NonNull<c_void>, i32> {
    let ptr = unsafe {
        libc::mmap(
            at,
            size,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_FIXED_NOREPLACE,
            -1,
            0,
        )
    };

    if ptr == libc::MAP_FAILED {
        return Err(unsafe { *libc::__errno_location() });
    }

    Ok(NonNull::new(ptr).expect("mmap succeeded but returned a null pointer"))
}

/// Reserves exactly `size` bytes at `at`.
///
/// Non-Linux unix targets lack `MAP_FIXED_NOREPLACE`; we fall back to
/// plain `MAP_FIXED`, which can silently clobber an existing mapping
/// at that address. That risk is confined to the (rare) case where
/// something else raced us for the address right past `data_end` --
/// acceptable for msmalloc's single-mutator model (spec.md §5).
#[cfg(all(unix, not(target_os = "linux")))]
pub fn reserve_region_fixed(at: *mut c_void, size: usize) -> Result<NonNull<c_void>, i32> {
    let ptr = unsafe {
        libc::mmap(
            at,
            size,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_FIXED,
            -1,
            0,
        )
    };

    if ptr == libc::MAP_FAILED {
        return Err(unsafe { *libc::__errno_location() });
    }

    Ok(NonNull::new(ptr).expect("mmap succeeded but returned a null pointer"))
}

/// Releases a region previously obtained from this module.
pub fn release_region(base: NonNull<c_void>, size: usize) -> Result<(), i32> {
    if size == 0 {
        return Ok(());
    }

    let ret = unsafe { libc::munmap(base.as_ptr(), size) };

    if ret == 0 {
        Ok(())
    } else {
        Err(unsafe { *libc::__errno_location() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_size() {
        assert_ne!(page_size(), 0);
        assert_eq!(page_size() % 4096, 0);
    }

    #[test]
    fn round_up_is_idempotent_on_multiples() {
        let page = page_size();
        assert_eq!(round_up_to_page(page), page);
        assert_eq!(round_up_to_page(page + 1), 2 * page);
    }

    #[test]
    fn reserve_and_release_roundtrip() {
        let (base, size) = reserve_region(4096).expect("reserve should succeed");
        assert_eq!(size, page_size());
        release_region(base, size).expect("release should succeed");
    }
}
