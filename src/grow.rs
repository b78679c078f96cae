//! Growing the payload region `D` when no `FREE` record can satisfy a
//! request (spec.md §4.4, `allocate_chunk` in the original).

#[cfg(any(
    all(test, feature = "check_contracts_in_tests"),
    feature = "check_contracts"
))]
use contracts::*;
#[cfg(not(any(
    all(test, feature = "check_contracts_in_tests"),
    feature = "check_contracts"
)))]
use disabled_contracts::*;

use crate::canary;
use crate::chunk::{ChunkRecord, ChunkState};
use crate::map;
use crate::state::AllocatorState;

/// How many page-sized addresses past `data_end` we're willing to try
/// before giving up, in case something else raced us for the
/// requested range (see `map::reserve_region_fixed`).
const PLACEMENT_RETRIES: usize = 8;

#[derive(Debug)]
pub enum GrowError {
    Mapper(i32),
    MetadataExhausted,
}

impl From<crate::state::MetadataExhausted> for GrowError {
    fn from(_: crate::state::MetadataExhausted) -> Self {
        GrowError::MetadataExhausted
    }
}

/// Extends `D` by at least `aligned_size + sizeof(canary)` bytes,
/// appends a fresh `USED` record covering the request, and -- if the
/// page grant left a useful remainder -- a trailing `FREE` record for
/// it.
///
/// On any failure, `state` is left unchanged (spec.md §5's "any early
/// return from grow must undo its partial region request").
#[requires(aligned_size % 16 == 8, "caller must have already aligned the request to 8 mod 16")]
#[ensures(ret.is_ok() -> state.data_end as usize > old(state.data_end) as usize,
          "success always grows D")]
pub fn allocate_chunk(
    state: &mut AllocatorState,
    aligned_size: usize,
) -> Result<*mut u8, GrowError> {
    let needed = aligned_size + canary::CANARY_SIZE;
    let grow_size = map::round_up_to_page(needed);

    let mut hint = state.data_end as *mut std::ffi::c_void;
    let mut base = None;
    let mut last_errno = 0;

    for _ in 0..PLACEMENT_RETRIES {
        match map::reserve_region_fixed(hint, grow_size) {
            Ok(mapped) => {
                base = Some(mapped);
                break;
            }
            Err(errno) => {
                last_errno = errno;
                hint = unsafe { hint.add(map::page_size()) };
            }
        }
    }

    let base = match base {
        Some(base) => base.as_ptr() as *mut u8,
        None => return Err(GrowError::Mapper(last_errno)),
    };

    let payload = base;
    let canary_value = state.rng.draw_canary();

    let used_record = ChunkRecord {
        next: None,
        payload,
        size: aligned_size,
        state: ChunkState::Used,
        canary: canary_value,
    };

    let used_node = match state.meta.materialize(used_record) {
        Ok(node) => node,
        Err(exhausted) => {
            // Undo the partial region request before reporting failure.
            let _ = map::release_region(
                unsafe { std::ptr::NonNull::new_unchecked(base as *mut std::ffi::c_void) },
                grow_size,
            );
            return Err(exhausted.into());
        }
    };

    unsafe { canary::write_trailer(payload, aligned_size, canary_value) };
    state.append(used_node);

    let region_end = base as usize + grow_size;
    let consumed_end = payload as usize + aligned_size + canary::CANARY_SIZE;
    let leftover = region_end - consumed_end;

    // `leftover` is raw unreserved bytes past the used chunk's trailer.
    // A remainder record's own `size` must exclude its own trailer (the
    // same convention `ChunkRecord::size` keeps everywhere else), so the
    // record only gets to claim `leftover - CANARY_SIZE` payload bytes --
    // otherwise its trailer write would land past `region_end`, outside
    // what this call actually mapped.
    if leftover >= 2 * canary::CANARY_SIZE {
        let remainder_size = leftover - canary::CANARY_SIZE;
        let remainder_payload = consumed_end as *mut u8;
        let remainder_canary = state.rng.draw_canary();

        let remainder_record = ChunkRecord {
            next: None,
            payload: remainder_payload,
            size: remainder_size,
            state: ChunkState::Free,
            canary: remainder_canary,
        };

        // The remainder record is purely cosmetic bookkeeping for
        // unused tail bytes; if metadata is already exhausted we
        // simply leave those bytes unreachable rather than fail the
        // allocation that triggered growth.
        if let Ok(remainder_node) = state.meta.materialize(remainder_record) {
            unsafe { canary::write_trailer(remainder_payload, remainder_size, remainder_canary) };
            state.append(remainder_node);
        }
    }

    state.data_end = region_end as *mut u8;

    Ok(payload)
}
