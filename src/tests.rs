//! End-to-end scenarios from spec.md §8, driven through the public
//! API. These share process-wide allocator state, so every test takes
//! [`TEST_LOCK`] and resets the heap first -- cargo runs tests in
//! parallel threads by default, and msmalloc's heap is explicitly not
//! thread-safe (spec.md §5).

use std::sync::{Mutex, MutexGuard};

use proptest::prelude::*;

use crate::canary::CANARY_SIZE;
use crate::chunk::ChunkState;

static TEST_LOCK: Mutex<()> = Mutex::new(());

fn locked_test() -> MutexGuard<'static, ()> {
    let guard = TEST_LOCK.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    crate::init::reset_for_test();
    guard
}

fn used_records() -> Vec<(*mut u8, usize)> {
    let guard = crate::state::STATE.lock().unwrap();
    guard
        .as_ref()
        .expect("heap should be initialized by this point in the test")
        .iter()
        .filter_map(|node| {
            let record = unsafe { node.as_ref() };
            if record.state == ChunkState::Used {
                Some((record.payload, record.size))
            } else {
                None
            }
        })
        .collect()
}

fn assert_invariants() {
    let guard = crate::state::STATE.lock().unwrap();
    if let Some(state) = guard.as_ref() {
        if let Err(violation) = crate::invariants::check(state) {
            drop(guard);
            panic!("allocator invariant violated: {:?}", violation);
        }
    }
}

fn free_records() -> Vec<(*mut u8, usize)> {
    let guard = crate::state::STATE.lock().unwrap();
    guard
        .as_ref()
        .expect("heap should be initialized by this point in the test")
        .iter()
        .filter_map(|node| {
            let record = unsafe { node.as_ref() };
            if record.state == ChunkState::Free {
                Some((record.payload, record.size))
            } else {
                None
            }
        })
        .collect()
}

#[test]
fn grow_and_reuse() {
    let _guard = locked_test();

    let p1 = crate::allocate(1000);
    let p2 = crate::allocate(4096);
    let p3 = crate::allocate(1000);

    assert!(!p1.is_null());
    assert!(!p2.is_null());
    assert!(!p3.is_null());
    assert_ne!(p1, p2);
    assert_ne!(p2, p3);
    assert_ne!(p1, p3);

    unsafe {
        std::ptr::copy_nonoverlapping(b"first".as_ptr(), p1, 5);
        std::ptr::copy_nonoverlapping(b"second".as_ptr(), p2, 6);
        std::ptr::copy_nonoverlapping(b"third!".as_ptr(), p3, 6);
    }

    unsafe {
        assert_eq!(std::slice::from_raw_parts(p1, 5), b"first");
        assert_eq!(std::slice::from_raw_parts(p2, 6), b"second");
        assert_eq!(std::slice::from_raw_parts(p3, 6), b"third!");
    }

    assert_invariants();

    crate::release(p1);
    crate::release(p2);
    crate::release(p3);

    assert!(used_records().is_empty(), "nothing should remain USED after releasing everything");
    assert_invariants();
}

#[test]
fn double_free_is_a_noop_not_a_crash() {
    let _guard = locked_test();

    let p = crate::allocate(100);
    assert!(!p.is_null());

    crate::release(p);
    assert!(free_records().iter().any(|&(payload, _)| payload == p));

    // Second release of the same pointer must not panic, corrupt the
    // list, or flip anything back to USED.
    crate::release(p);
    assert!(free_records().iter().any(|&(payload, _)| payload == p));
    assert_invariants();
}

#[test]
fn unknown_pointer_release_is_a_noop() {
    let _guard = locked_test();

    // Establish a heap so there is state to leave untouched.
    let p = crate::allocate(64);
    assert!(!p.is_null());

    let before = used_records();
    crate::release(0xDEAD_BEEF_usize as *mut u8);
    let after = used_records();

    assert_eq!(before, after);
    assert_invariants();
}

#[test]
fn canary_overwrite_is_reported_and_record_still_frees() {
    let _guard = locked_test();

    let p = crate::allocate(100);
    assert!(!p.is_null());

    // Corrupt the trailer canary bytes right after the payload.
    unsafe {
        std::ptr::write_bytes(p.add(100), 0xFF, CANARY_SIZE);
    }

    crate::release(p);

    // The corrupted record still transitions to FREE: integrity
    // violations are reported, never fatal (spec.md §4.10).
    assert!(free_records().iter().any(|&(payload, _)| payload == p));
    assert_invariants();
}

#[test]
fn calloc_zeroes_every_byte() {
    let _guard = locked_test();

    let p = crate::zeroed_allocate(10, 20);
    assert!(!p.is_null());

    let bytes = unsafe { std::slice::from_raw_parts(p, 200) };
    assert!(bytes.iter().all(|&b| b == 0));
    assert_invariants();

    crate::release(p);
}

#[test]
fn calloc_overflow_returns_null() {
    let _guard = locked_test();

    let p = crate::zeroed_allocate(usize::MAX, 2);
    assert!(p.is_null());
    assert_invariants();
}

#[test]
fn zero_size_allocate_returns_null() {
    let _guard = locked_test();

    assert!(crate::allocate(0).is_null());
    assert_invariants();
}

#[test]
fn leak_scan_reports_and_frees_outstanding_allocations() {
    let _guard = locked_test();

    let p = crate::allocate(100);
    assert!(!p.is_null());
    assert!(!used_records().is_empty());

    crate::alloc::leak_scan();

    assert!(used_records().is_empty(), "leak scan should release every USED record");
    assert_invariants();
}

#[test]
fn realloc_null_pointer_behaves_like_allocate() {
    let _guard = locked_test();

    let p = crate::resize(std::ptr::null_mut(), 50);
    assert!(!p.is_null());
    assert_invariants();
    crate::release(p);
}

#[test]
fn realloc_zero_size_behaves_like_release() {
    let _guard = locked_test();

    let p = crate::allocate(50);
    assert!(!p.is_null());

    let result = crate::resize(p, 0);
    assert!(result.is_null());
    assert!(free_records().iter().any(|&(payload, _)| payload == p));
    assert_invariants();
}

#[test]
fn realloc_growth_preserves_prefix_and_no_shrink_in_place() {
    let _guard = locked_test();

    let p = crate::allocate(32);
    assert!(!p.is_null());
    unsafe { std::ptr::copy_nonoverlapping(b"0123456789abcdef".as_ptr(), p, 16) };

    let grown = crate::resize(p, 256);
    assert!(!grown.is_null());
    unsafe {
        assert_eq!(std::slice::from_raw_parts(grown, 16), b"0123456789abcdef");
    }

    // Shrinking must not move the allocation (spec.md §4.8's
    // "no shrink" policy).
    let shrunk = crate::resize(grown, 8);
    assert_eq!(shrunk, grown);
    assert_invariants();

    crate::release(grown);
}

#[test]
fn every_live_payload_is_sixteen_byte_aligned() {
    let _guard = locked_test();

    let sizes = [1usize, 7, 8, 9, 15, 16, 17, 100, 1000, 4096, 8192];
    let mut pointers = Vec::new();

    for &size in &sizes {
        let p = crate::allocate(size);
        assert!(!p.is_null());
        assert_eq!(p as usize % 16, 0, "payload for size {} was not 16-aligned", size);
        pointers.push(p);
    }
    assert_invariants();

    for p in pointers {
        crate::release(p);
    }
}

#[derive(Debug, Clone, Copy)]
enum Op {
    Alloc(usize),
    FreeOldest,
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => (1usize..4096).prop_map(Op::Alloc),
        1 => Just(Op::FreeOldest),
    ]
}

proptest! {
    // Bulk allocate and free in FIFO-ish order, driving the free list
    // through repeated split and coalesce, and check the structural
    // invariants hold after every single operation.
    #[test]
    fn random_alloc_free_sequences_preserve_invariants(ops in proptest::collection::vec(op_strategy(), 1..100)) {
        let _guard = locked_test();
        let mut live: Vec<*mut u8> = Vec::new();

        for op in ops {
            match op {
                Op::Alloc(size) => {
                    let p = crate::allocate(size);
                    if !p.is_null() {
                        live.push(p);
                    }
                }
                Op::FreeOldest => {
                    if !live.is_empty() {
                        crate::release(live.remove(0));
                    }
                }
            }
            assert_invariants();
        }

        for p in live {
            crate::release(p);
        }
        assert_invariants();
    }
}
