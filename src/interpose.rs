//! Symbol interposition shim (spec.md §6).
//!
//! Enabled by the `interpose` Cargo feature: exports `malloc`,
//! `free`, `calloc`, and `realloc` under their standard names so this
//! crate can be built as a `cdylib`/`staticlib` and `LD_PRELOAD`ed
//! into an unmodified host program, the same role the original C
//! implementation's `#ifdef DYNAMIC` block plays.
//!
//! # Safety
//!
//! These functions are called by arbitrary C code across the process
//! with no way to check argument validity beyond what `crate::alloc`
//! already does.

use std::os::raw::c_void;

/// # Safety
///
/// Same contract as the C standard library's `malloc`.
#[no_mangle]
pub unsafe extern "C" fn malloc(size: usize) -> *mut c_void {
    crate::allocate(size) as *mut c_void
}

/// # Safety
///
/// Same contract as the C standard library's `free`. `ptr` must be
/// either null or a value previously returned by `malloc`/`calloc`/
/// `realloc` from this allocator and not already freed.
#[no_mangle]
pub unsafe extern "C" fn free(ptr: *mut c_void) {
    crate::release(ptr as *mut u8)
}

/// # Safety
///
/// Same contract as the C standard library's `calloc`.
#[no_mangle]
pub unsafe extern "C" fn calloc(nmemb: usize, size: usize) -> *mut c_void {
    crate::zeroed_allocate(nmemb, size) as *mut c_void
}

/// # Safety
///
/// Same contract as the C standard library's `realloc`.
#[no_mangle]
pub unsafe extern "C" fn realloc(ptr: *mut c_void, size: usize) -> *mut c_void {
    crate::resize(ptr as *mut u8, size) as *mut c_void
}
