//! Free-list search, split, and coalesce (spec.md §4.2, §4.3, §4.5).

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

use std::ptr::NonNull;

use crate::canary;
use crate::chunk::{ChunkRecord, ChunkState};
use crate::state::AllocatorState;

/// First-fit search: the first `FREE` record whose `size` can hold
/// `aligned_size` plus a trailing canary.
///
/// First-fit keeps list order identical to address order (no
/// reordering on allocate), which is what lets [`coalesce`] get away
/// with a single forward pass -- see spec.md §4.2's rationale and
/// §9's note on why a singly-linked, non-cyclic list suffices.
#[ensures(ret.is_some() -> unsafe { ret.unwrap().as_ref() }.is_free(),
          "a hit is always a FREE record")]
pub fn find_free_chunk(
    state: &AllocatorState,
    aligned_size: usize,
) -> Option<NonNull<ChunkRecord>> {
    state.iter().find(|&node| {
        let record = unsafe { node.as_ref() };
        record.is_free() && record.size >= aligned_size + canary::CANARY_SIZE
    })
}

/// Splits `free_node` (which must be `FREE`) to satisfy `aligned_size`.
///
/// If the remainder after carving out `aligned_size` bytes plus a
/// trailer is too small to be worth its own record (less than two
/// canary widths, spec.md §4.3), the whole chunk is handed over
/// as-is. Otherwise a new `FREE` record is materialized for the
/// remainder and spliced in right after the freshly `USED` chunk,
/// preserving address order.
#[requires(unsafe { free_node.as_ref() }.is_free(), "can only split a FREE record")]
#[requires(aligned_size % 16 == 8, "caller must have already aligned the request to 8 mod 16")]
pub fn split_chunk(
    state: &mut AllocatorState,
    mut free_node: NonNull<ChunkRecord>,
    aligned_size: usize,
) -> Result<*mut u8, crate::state::MetadataExhausted> {
    let free_size = unsafe { free_node.as_ref().size };

    if free_size < aligned_size + 2 * canary::CANARY_SIZE {
        let record = unsafe { free_node.as_mut() };
        record.state = ChunkState::Used;
        record.canary = state.rng.draw_canary();
        unsafe { canary::write_trailer(record.payload, record.size, record.canary) };
        return Ok(record.payload);
    }

    let (payload, next, remainder_payload, remainder_size) = {
        let record = unsafe { free_node.as_ref() };
        let remainder_payload = unsafe { record.payload.add(aligned_size + canary::CANARY_SIZE) };
        let remainder_size = record.size - aligned_size - canary::CANARY_SIZE;
        (record.payload, record.next, remainder_payload, remainder_size)
    };

    let remainder_canary = state.rng.draw_canary();
    let remainder = ChunkRecord {
        next,
        payload: remainder_payload,
        size: remainder_size,
        state: ChunkState::Free,
        canary: remainder_canary,
    };
    unsafe { canary::write_trailer(remainder_payload, remainder_size, remainder_canary) };

    let remainder_node = state.meta.materialize(remainder)?;
    if state.tail == Some(free_node) {
        state.tail = Some(remainder_node);
    }

    let record = unsafe { free_node.as_mut() };
    record.size = aligned_size;
    record.state = ChunkState::Used;
    record.next = Some(remainder_node);
    record.canary = state.rng.draw_canary();
    unsafe { canary::write_trailer(record.payload, record.size, record.canary) };

    Ok(payload)
}

/// Single left-to-right pass merging address-adjacent `FREE`
/// neighbours (spec.md §4.5).
///
/// The non-adjacency guard matters: growth (`crate::grow`) can start
/// a fresh OS region that does not immediately follow the previous
/// one, in which case two `FREE` records may be logically consecutive
/// in the list without being physically contiguous, and must not be
/// merged.
pub fn coalesce(state: &mut AllocatorState) {
    let mut current = state.head;

    while let Some(mut current_node) = current {
        loop {
            let (is_free, next) = {
                let record = unsafe { current_node.as_ref() };
                (record.is_free(), record.next)
            };

            if !is_free {
                break;
            }

            let next_node = match next {
                Some(n) => n,
                None => break,
            };
            let next_record = unsafe { next_node.as_ref() };

            if !next_record.is_free() {
                break;
            }

            let current_record = unsafe { current_node.as_ref() };
            let adjacent =
                current_record.payload as usize + current_record.size + canary::CANARY_SIZE
                    == next_record.payload as usize;

            if !adjacent {
                break;
            }

            let merged_size = current_record.size + next_record.size + canary::CANARY_SIZE;
            let merged_canary = next_record.canary;
            let merged_next = next_record.next;
            let merged_payload = current_record.payload;

            if state.tail == Some(next_node) {
                state.tail = Some(current_node);
            }

            let current_mut = unsafe { current_node.as_mut() };
            current_mut.size = merged_size;
            current_mut.canary = merged_canary;
            current_mut.next = merged_next;
            unsafe { canary::write_trailer(merged_payload, merged_size, merged_canary) };
        }

        current = unsafe { current_node.as_ref() }.next;
    }
}
