//! Process-wide allocator state (spec.md §3 `AllocatorState`).
//!
//! There is exactly one heap per process -- the four entry points
//! (`malloc`/`free`/`calloc`/`realloc`) mirror the standard
//! allocator's signatures and carry no context argument, so the state
//! is unavoidably a single global behind a lock (same shape as the
//! teacher's `lazy_static! { static ref CLASSES: Mutex<...> }` in
//! `class.rs`).

use std::ptr::NonNull;

use crate::canary::Rng;
use crate::chunk::ChunkRecord;

/// Default capacity of the metadata region, in records. Falls in the
/// 10^4-10^5 range spec.md §4.1 asks for; shrunk drastically under
/// `test_only_small_constants` so tests can exercise metadata
/// exhaustion without mapping hundreds of megabytes.
#[cfg(not(feature = "test_only_small_constants"))]
pub const DEFAULT_METADATA_CAPACITY: usize = 1 << 16;
#[cfg(feature = "test_only_small_constants")]
pub const DEFAULT_METADATA_CAPACITY: usize = 64;

/// The metadata region `M`: a fixed-capacity array of `ChunkRecord`s.
///
/// Slots are materialized in order as records are created; per
/// spec.md §3 and §9, a slot is never reclaimed for reuse even once
/// its record is coalesced away, so `used` only grows.
pub struct Metadata {
    base: NonNull<ChunkRecord>,
    region_size: usize,
    capacity: usize,
    used: usize,
}

/// Returned when the metadata region has no remaining slots.
#[derive(Debug, Clone, Copy)]
pub struct MetadataExhausted;

impl Metadata {
    /// Reserves a fresh metadata region able to hold `capacity`
    /// records.
    pub fn reserve(capacity: usize) -> Result<Metadata, i32> {
        let region_size = capacity * std::mem::size_of::<ChunkRecord>();
        let (base, mapped_size) = crate::map::reserve_region(region_size)?;

        Ok(Metadata {
            base: base.cast(),
            region_size: mapped_size,
            capacity,
            used: 0,
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn used(&self) -> usize {
        self.used
    }

    /// Writes `record` into the next free slot and returns a stable
    /// pointer to it.
    pub fn materialize(&mut self, record: ChunkRecord) -> Result<NonNull<ChunkRecord>, MetadataExhausted> {
        if self.used >= self.capacity {
            return Err(MetadataExhausted);
        }

        let slot = unsafe { self.base.as_ptr().add(self.used) };
        unsafe { slot.write(record) };
        self.used += 1;

        Ok(unsafe { NonNull::new_unchecked(slot) })
    }

    fn unmap(&mut self) {
        if self.region_size > 0 {
            let _ = crate::map::release_region(self.base.cast(), self.region_size);
        }
    }
}

impl Drop for Metadata {
    fn drop(&mut self) {
        self.unmap();
    }
}

/// The heap: the metadata region, the free/used list threaded through
/// it, and the payload region `D`.
pub struct AllocatorState {
    pub meta: Metadata,
    pub head: Option<NonNull<ChunkRecord>>,
    /// Tracks the last record in address order for O(1) append in
    /// `crate::grow`, the same bookkeeping `cl_metadata_tail` performs
    /// in the original C implementation.
    pub tail: Option<NonNull<ChunkRecord>>,
    pub data_base: *mut u8,
    pub data_end: *mut u8,
    pub rng: Rng,
}

impl AllocatorState {
    /// Appends `node` as the new tail of the address-ordered list.
    pub fn append(&mut self, node: NonNull<ChunkRecord>) {
        match self.tail {
            Some(mut tail) => unsafe { tail.as_mut().next = Some(node) },
            None => self.head = Some(node),
        }
        self.tail = Some(node);
    }
}

impl Drop for AllocatorState {
    fn drop(&mut self) {
        if !self.data_base.is_null() {
            let size = self.data_end as usize - self.data_base as usize;
            if size > 0 {
                let base = unsafe {
                    NonNull::new_unchecked(self.data_base as *mut std::ffi::c_void)
                };
                let _ = crate::map::release_region(base, size);
            }
        }
    }
}

// The allocator is single-threaded cooperative per spec.md §5: the
// embedding program must serialize calls itself. The lock below only
// protects against accidental concurrent misuse; it is not a
// performance feature.
unsafe impl Send for AllocatorState {}

lazy_static::lazy_static! {
    pub static ref STATE: std::sync::Mutex<Option<AllocatorState>> = std::sync::Mutex::new(None);
}

/// Walks the list from `head`, yielding records in address order
/// (spec.md §3 invariant 1).
pub struct Chunks {
    next: Option<NonNull<ChunkRecord>>,
}

impl AllocatorState {
    pub fn iter(&self) -> Chunks {
        Chunks { next: self.head }
    }
}

impl Iterator for Chunks {
    type Item = NonNull<ChunkRecord>;

    fn next(&mut self) -> Option<NonNull<ChunkRecord>> {
        let current = self.next?;
        self.next = unsafe { current.as_ref() }.next;
        Some(current)
    }
}
