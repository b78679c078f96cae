//! Lazy initialization and exit-time cleanup (spec.md §4.1, §4.11).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::MutexGuard;

use crate::canary::{self, Rng};
use crate::chunk::{ChunkRecord, ChunkState};
use crate::map;
use crate::state::{AllocatorState, Metadata, DEFAULT_METADATA_CAPACITY, STATE};

/// Sticky flag set when initialization has failed once. Spec.md §4.1:
/// "refuse to serve allocations (return null from every subsequent
/// call)" -- retrying a failed `mmap` on every request would just
/// thrash the kernel for no benefit.
static INIT_FAILED: AtomicBool = AtomicBool::new(false);
static HOOKS_REGISTERED: AtomicBool = AtomicBool::new(false);

/// Ensures the heap is initialized and returns the locked state.
///
/// Returns `Err(())` if initialization has not happened yet and
/// cannot succeed (either this call's `mmap`s failed, or a previous
/// call's did).
pub fn ensure_initialized() -> Result<MutexGuard<'static, Option<AllocatorState>>, ()> {
    crate::logging::init_logging();

    let mut guard = STATE.lock().unwrap();

    if guard.is_some() {
        return Ok(guard);
    }

    if INIT_FAILED.load(Ordering::Relaxed) {
        return Err(());
    }

    match init_heap() {
        Ok(state) => {
            *guard = Some(state);
            register_exit_hooks();
            Ok(guard)
        }
        Err(()) => {
            INIT_FAILED.store(true, Ordering::Relaxed);
            Err(())
        }
    }
}

fn init_heap() -> Result<AllocatorState, ()> {
    log::info!("init_heap - initializing pools of memory");

    let meta = match Metadata::reserve(DEFAULT_METADATA_CAPACITY) {
        Ok(meta) => meta,
        Err(errno) => {
            log::error!("init_heap - failed to allocate metadata pool (errno {})", errno);
            return Err(());
        }
    };

    let page = map::page_size();
    let (data_base, mapped_size) = match map::reserve_region(page) {
        Ok(region) => region,
        Err(errno) => {
            log::error!("init_heap - failed to allocate data pool (errno {})", errno);
            return Err(());
        }
    };

    let mut state = AllocatorState {
        meta,
        head: None,
        tail: None,
        data_base: data_base.as_ptr() as *mut u8,
        data_end: unsafe { (data_base.as_ptr() as *mut u8).add(mapped_size) },
        rng: Rng::seed_from_entropy(),
    };

    let canary = state.rng.draw_canary();
    let first_record_size = mapped_size - canary::CANARY_SIZE;

    let record = ChunkRecord {
        next: None,
        payload: state.data_base,
        size: first_record_size,
        state: ChunkState::Free,
        canary,
    };
    unsafe { canary::write_trailer(state.data_base, first_record_size, canary) };

    let node = state
        .meta
        .materialize(record)
        .expect("a freshly reserved metadata region always has room for one record");
    state.append(node);

    Ok(state)
}

fn register_exit_hooks() {
    if HOOKS_REGISTERED.swap(true, Ordering::Relaxed) {
        return;
    }

    // `atexit` runs handlers in reverse registration order, so
    // teardown is registered first and leak-scan second: at exit,
    // leak-scan fires before teardown, as spec.md §4.11 requires.
    unsafe {
        libc::atexit(teardown_hook);
        libc::atexit(leak_scan_hook);
    }
}

extern "C" fn leak_scan_hook() {
    crate::alloc::leak_scan();
}

extern "C" fn teardown_hook() {
    crate::alloc::teardown();
    log::info!("teardown - heap unmapped");
}

/// Resets all global allocator state, including the sticky failure
/// flag. Exit hooks remain registered (idempotent no-ops against an
/// uninitialized heap) so a later `ensure_initialized` can re-arm a
/// fresh heap for a new init/teardown cycle within the same process --
/// e.g. across independent tests.
#[cfg(test)]
pub(crate) fn reset_for_test() {
    let mut guard = STATE.lock().unwrap();
    *guard = None;
    INIT_FAILED.store(false, Ordering::Relaxed);
}
