//! The four entry points (spec.md §4.6-§4.9) and the exit-time
//! cleanup stages they share with `crate::init`'s hooks (§4.11).

use std::ptr::NonNull;

use crate::canary;
use crate::chunk::{ChunkRecord, ChunkState};
use crate::freelist;
use crate::grow::{self, GrowError};
use crate::init;
use crate::state::{AllocatorState, STATE};

/// Rounds `size` up so that the resulting payload address stays
/// 16-byte aligned across an arbitrary number of splits and growths
/// (spec.md §3 invariant 5, §4.6).
///
/// A plain "round up to 16" would not do: each record's on-disk span
/// is `size + CANARY_SIZE` bytes, and `CANARY_SIZE` (one machine word,
/// 8 bytes on every platform this crate targets) is not itself a
/// multiple of 16. Rounding `size` up to the next value congruent to
/// `8 mod 16` instead means `payload + size + CANARY_SIZE` lands back
/// on a 16-byte boundary whenever `payload` started on one -- which
/// holds inductively from the first chunk (carved out of a
/// page-aligned mapping) onward, with zero slack bytes needed between
/// chunks to re-align.
fn align_request(size: usize) -> usize {
    debug_assert_eq!(canary::CANARY_SIZE, 8, "alignment math assumes an 8-byte canary");

    let to_eight = (size + 7) & !7;
    if to_eight % 16 == 8 {
        to_eight
    } else {
        to_eight + 8
    }
}

/// Looks up the record whose payload address is exactly `ptr`.
///
/// Identity, not arithmetic: a pointer into the middle of a live
/// allocation must not alias the record that owns it (spec.md §4.7).
fn get_chunk(state: &AllocatorState, ptr: *mut u8) -> Option<NonNull<ChunkRecord>> {
    state.iter().find(|&node| unsafe { node.as_ref() }.payload == ptr)
}

/// `allocate(n)` (spec.md §4.6, `my_malloc`).
pub(crate) fn my_malloc(size: usize) -> *mut u8 {
    if size == 0 {
        return std::ptr::null_mut();
    }

    let aligned = align_request(size);

    let mut guard = match init::ensure_initialized() {
        Ok(guard) => guard,
        Err(()) => return std::ptr::null_mut(),
    };
    let state = guard.as_mut().expect("ensure_initialized always leaves Some");

    if let Some(free_node) = freelist::find_free_chunk(state, aligned) {
        match freelist::split_chunk(state, free_node, aligned) {
            Ok(ptr) => ptr,
            Err(_) => {
                log::error!("my_malloc - metadata region exhausted");
                std::ptr::null_mut()
            }
        }
    } else {
        match grow::allocate_chunk(state, aligned) {
            Ok(ptr) => ptr,
            Err(GrowError::Mapper(errno)) => {
                log::error!("my_malloc - can't grow heap for {} bytes (errno {})", size, errno);
                std::ptr::null_mut()
            }
            Err(GrowError::MetadataExhausted) => {
                log::error!("my_malloc - metadata region exhausted");
                std::ptr::null_mut()
            }
        }
    }
}

/// `release(ptr)` (spec.md §4.7, `my_free`).
pub(crate) fn my_free(ptr: *mut u8) {
    if ptr.is_null() {
        log::warn!("my_free - null pointer given");
        return;
    }

    let mut guard = match init::ensure_initialized() {
        Ok(guard) => guard,
        Err(()) => {
            log::warn!("my_free - heap is not initialized, ignoring {:p}", ptr);
            return;
        }
    };
    let state = guard.as_mut().expect("ensure_initialized always leaves Some");

    let node = match get_chunk(state, ptr) {
        Some(node) => node,
        None => {
            log::warn!("my_free - unknown pointer {:p}", ptr);
            return;
        }
    };

    let (is_free, payload, size, expected_canary) = {
        let record = unsafe { node.as_ref() };
        (record.is_free(), record.payload, record.size, record.canary)
    };

    if is_free {
        log::warn!("my_free - double free at {:p}", ptr);
        return;
    }

    if !unsafe { canary::trailer_matches(payload, size, expected_canary) } {
        log::error!("my_free - canary corrupted at {:p}", ptr);
        // Integrity violations are reported, not fatal (spec.md §4.10,
        // §7): we still release the chunk so the program can continue.
    }

    unsafe { (*node.as_ptr()).state = ChunkState::Free };
    freelist::coalesce(state);
}

/// `zeroed_allocate(count, elem_size)` (spec.md §4.9, `my_calloc`).
pub(crate) fn my_calloc(nmemb: usize, size: usize) -> *mut u8 {
    let total = match nmemb.checked_mul(size) {
        Some(total) => total,
        None => {
            log::error!("my_calloc - {} * {} overflows", nmemb, size);
            return std::ptr::null_mut();
        }
    };

    let ptr = my_malloc(total);
    if !ptr.is_null() {
        unsafe { std::ptr::write_bytes(ptr, 0, total) };
    }
    ptr
}

/// `resize(ptr, n)` (spec.md §4.8, `my_realloc`).
pub(crate) fn my_realloc(ptr: *mut u8, size: usize) -> *mut u8 {
    if ptr.is_null() {
        log::info!("my_realloc - null pointer given, allocating a new chunk");
        return my_malloc(size);
    }

    if size == 0 {
        log::info!("my_realloc - zero size given, freeing chunk at {:p}", ptr);
        my_free(ptr);
        return std::ptr::null_mut();
    }

    let existing_size = {
        let mut guard = match init::ensure_initialized() {
            Ok(guard) => guard,
            Err(()) => return std::ptr::null_mut(),
        };
        let state = guard.as_mut().expect("ensure_initialized always leaves Some");

        match get_chunk(state, ptr) {
            Some(node) => unsafe { node.as_ref() }.size,
            None => {
                log::warn!("my_realloc - unknown pointer {:p}", ptr);
                return std::ptr::null_mut();
            }
        }
        // `guard` drops here: my_malloc/my_free below re-lock the same
        // mutex, and std::sync::Mutex is not reentrant.
    };

    if existing_size >= size {
        return ptr;
    }

    let new_ptr = my_malloc(size);
    if new_ptr.is_null() {
        log::warn!("my_realloc - allocation failed while growing {:p}", ptr);
        return std::ptr::null_mut();
    }

    unsafe { std::ptr::copy_nonoverlapping(ptr, new_ptr, existing_size.min(size)) };
    my_free(ptr);

    new_ptr
}

/// Exit hook stage 1 (spec.md §4.11): report and release every
/// remaining `USED` record.
pub(crate) fn leak_scan() {
    let leaked: Vec<(*mut u8, usize)> = {
        let guard = STATE.lock().unwrap();
        match guard.as_ref() {
            Some(state) => state
                .iter()
                .filter_map(|node| {
                    let record = unsafe { node.as_ref() };
                    if record.is_used() {
                        Some((record.payload, record.size))
                    } else {
                        None
                    }
                })
                .collect(),
            None => return,
        }
    };

    for (payload, size) in leaked {
        log::warn!("leak_scan - leaked allocation at {:p} with size {}", payload, size);
        my_free(payload);
    }
}

/// Exit hook stage 2 (spec.md §4.11): unmap `M` and `D` and reset
/// global state so a later initialization is well-defined.
pub(crate) fn teardown() {
    let mut guard = STATE.lock().unwrap();
    *guard = None;
}
