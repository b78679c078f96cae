//! Checks for the six structural invariants of spec.md §3, run after
//! every externally visible operation in tests (spec.md §8).
//!
//! These are assertions for test and debug use, not part of the
//! allocator's hot path -- walking the whole list on every call would
//! defeat the point of a general-purpose allocator.

use crate::canary;
use crate::state::AllocatorState;

#[derive(Debug)]
pub enum Violation {
    NotStrictlyIncreasing { at: usize },
    AdjacentFreeChunks { at: usize },
    CanaryMismatch { payload: *mut u8 },
    Misaligned { payload: *mut u8 },
    OutOfBounds { payload: *mut u8, size: usize },
}

/// Walks the list once and checks invariants 1 through 5. Returns the
/// first violation found, if any.
pub fn check(state: &AllocatorState) -> Result<(), Violation> {
    let mut previous_end: Option<usize> = None;
    let mut previous_was_free = false;

    for (index, node) in state.iter().enumerate() {
        let record = unsafe { node.as_ref() };
        let payload_addr = record.payload as usize;

        // Invariant 1: strictly increasing payload addresses.
        if let Some(prev_end) = previous_end {
            if payload_addr < prev_end {
                return Err(Violation::NotStrictlyIncreasing { at: index });
            }
        }

        // Invariant 3: no two adjacent FREE records.
        if record.is_free() && previous_was_free {
            return Err(Violation::AdjacentFreeChunks { at: index });
        }

        // Invariant 4: USED records' trailers match their canary.
        if record.is_used()
            && !unsafe { canary::trailer_matches(record.payload, record.size, record.canary) }
        {
            return Err(Violation::CanaryMismatch { payload: record.payload });
        }

        // Invariant 5: 16-byte aligned payloads.
        if payload_addr % 16 != 0 {
            return Err(Violation::Misaligned { payload: record.payload });
        }

        // Invariant 6: payload range inside [data_base, data_end).
        let range_start = payload_addr;
        let range_end = payload_addr + record.size;
        if range_start < state.data_base as usize || range_end > state.data_end as usize {
            return Err(Violation::OutOfBounds {
                payload: record.payload,
                size: record.size,
            });
        }

        previous_end = Some(record.end());
        previous_was_free = record.is_free();
    }

    Ok(())
}
