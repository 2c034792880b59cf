//! Reference memory system over the process heap.
//!
//! Every block carries a hidden [`BlockHeader`] immediately below the user
//! pointer, so `deallocate` needs nothing but the address. The header also
//! guarantees a bookkeeping gap between any two blocks.

pub mod size_class;

use std::alloc::{self, Layout};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use crate::stats::{MemoryStatistics, StatisticsCounters};
use crate::system::{AllocFlags, MemorySystem, MemorySystemError};

/// Default and minimum block alignment.
pub const MIN_ALIGN: usize = 16;

#[repr(C)]
struct BlockHeader {
    /// Usable capacity after class/page rounding.
    capacity: usize,
    /// Size the caller asked for; statistics account this.
    requested: usize,
    /// Alignment of the underlying raw allocation.
    align: usize,
    /// Distance from the raw base to the user pointer.
    offset: usize,
}

const HEADER_SIZE: usize = size_of::<BlockHeader>();

/// Size-classed allocator backed by `std::alloc`.
pub struct HeapMemorySystem {
    initialized: AtomicBool,
    counters: StatisticsCounters,
    thread_finalizations: AtomicU64,
    lifecycles: AtomicU64,
}

impl HeapMemorySystem {
    #[must_use]
    pub fn new() -> Self {
        Self {
            initialized: AtomicBool::new(false),
            counters: StatisticsCounters::default(),
            thread_finalizations: AtomicU64::new(0),
            lifecycles: AtomicU64::new(0),
        }
    }

    /// Whether `initialize` has run without a matching `finalize`.
    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    /// Number of `thread_finalize` calls observed.
    #[must_use]
    pub fn thread_finalizations(&self) -> u64 {
        self.thread_finalizations.load(Ordering::Relaxed)
    }

    /// Number of completed initialize/finalize cycles.
    #[must_use]
    pub fn lifecycles(&self) -> u64 {
        self.lifecycles.load(Ordering::Relaxed)
    }
}

impl Default for HeapMemorySystem {
    fn default() -> Self {
        Self::new()
    }
}

/// # Safety
///
/// `ptr` must have been produced by [`HeapMemorySystem::allocate`].
unsafe fn header_of(ptr: NonNull<u8>) -> NonNull<BlockHeader> {
    // SAFETY: the header occupies the HEADER_SIZE bytes below the user pointer.
    unsafe { ptr.sub(HEADER_SIZE).cast::<BlockHeader>() }
}

impl MemorySystem for HeapMemorySystem {
    fn name(&self) -> &str {
        "heap"
    }

    fn initialize(&self) -> Result<(), MemorySystemError> {
        self.initialized
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(|_| MemorySystemError::AlreadyInitialized)
    }

    fn allocate(
        &self,
        _hint: Option<NonNull<u8>>,
        size: usize,
        align: usize,
        flags: AllocFlags,
    ) -> Option<NonNull<u8>> {
        if !self.is_initialized() {
            return None;
        }
        let align = if align == 0 { MIN_ALIGN } else { align.max(MIN_ALIGN) };
        if !align.is_power_of_two() {
            return None;
        }
        let size = size.max(1);
        let (capacity, virtual_backed) = size_class::block_capacity(size)?;

        // Round the header slot up to `align` so the user pointer stays aligned.
        let offset = HEADER_SIZE.next_multiple_of(align);
        let total = offset.checked_add(capacity)?;
        let layout = Layout::from_size_align(total, align).ok()?;

        // SAFETY: `layout` has non-zero size.
        let raw = unsafe {
            if flags.contains(AllocFlags::ZERO_INITIALIZED) {
                alloc::alloc_zeroed(layout)
            } else {
                alloc::alloc(layout)
            }
        };
        let raw = NonNull::new(raw)?;

        // SAFETY: `offset + capacity == total`, so the user pointer and the
        // header below it are inside the allocation.
        let user = unsafe { raw.add(offset) };
        unsafe {
            header_of(user).write(BlockHeader {
                capacity,
                requested: size,
                align,
                offset,
            });
        }

        self.counters.record_alloc(size, virtual_backed);
        Some(user)
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>) {
        // SAFETY: caller guarantees `ptr` is live and ours.
        let header = unsafe { header_of(ptr).read() };
        let total = header.offset + header.capacity;
        self.counters.record_free(
            header.requested,
            header.capacity > size_class::MAX_SMALL_SIZE,
        );
        // SAFETY: reconstructs the exact layout used in `allocate`.
        unsafe {
            let layout = Layout::from_size_align_unchecked(total, header.align);
            alloc::dealloc(ptr.sub(header.offset).as_ptr(), layout);
        }
    }

    fn thread_finalize(&self) {
        self.thread_finalizations.fetch_add(1, Ordering::Relaxed);
    }

    fn finalize(&self) {
        if self
            .initialized
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            self.lifecycles.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn statistics(&self) -> Option<MemoryStatistics> {
        Some(self.counters.snapshot())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn initialized() -> HeapMemorySystem {
        let heap = HeapMemorySystem::new();
        heap.initialize().expect("fresh heap initializes");
        heap
    }

    #[test]
    fn allocate_requires_initialize() {
        let heap = HeapMemorySystem::new();
        assert!(heap.allocate(None, 64, 0, AllocFlags::PERSISTENT).is_none());
        heap.initialize().unwrap();
        let ptr = heap.allocate(None, 64, 0, AllocFlags::PERSISTENT).unwrap();
        unsafe { heap.deallocate(ptr) };
    }

    #[test]
    fn double_initialize_is_rejected() {
        let heap = initialized();
        assert_eq!(heap.initialize(), Err(MemorySystemError::AlreadyInitialized));
    }

    #[test]
    fn finalize_without_initialize_is_a_no_op() {
        let heap = HeapMemorySystem::new();
        heap.finalize();
        assert!(!heap.is_initialized());
        assert_eq!(heap.lifecycles(), 0);
        assert_eq!(heap.initialize(), Ok(()));
        heap.finalize();
        heap.finalize();
        assert_eq!(heap.lifecycles(), 1);
    }

    #[test]
    fn reinitialize_after_finalize() {
        let heap = initialized();
        heap.thread_finalize();
        heap.finalize();
        assert!(!heap.is_initialized());
        heap.initialize().unwrap();
        assert_eq!(heap.lifecycles(), 1);
        assert_eq!(heap.thread_finalizations(), 1);
        let ptr = heap.allocate(None, 500, 0, AllocFlags::PERSISTENT).unwrap();
        unsafe { heap.deallocate(ptr) };
    }

    #[test]
    fn blocks_are_aligned_and_sized() {
        let heap = initialized();
        for align in [0, 8, 16, 64, 256, 4096] {
            let ptr = heap.allocate(None, 100, align, AllocFlags::NONE).unwrap();
            assert_eq!(ptr.as_ptr() as usize % align.max(MIN_ALIGN), 0);
            assert_eq!(unsafe { header_of(ptr).read().capacity }, 112);
            unsafe { heap.deallocate(ptr) };
        }
    }

    #[test]
    fn non_power_of_two_alignment_fails() {
        let heap = initialized();
        assert!(heap.allocate(None, 100, 48, AllocFlags::NONE).is_none());
    }

    #[test]
    fn zero_initialized_flag_zeroes() {
        let heap = initialized();
        let ptr = heap
            .allocate(None, 1000, 0, AllocFlags::ZERO_INITIALIZED)
            .unwrap();
        let bytes = unsafe { std::slice::from_raw_parts(ptr.as_ptr(), 1000) };
        assert!(bytes.iter().all(|&b| b == 0));
        unsafe { heap.deallocate(ptr) };
    }

    #[test]
    fn statistics_track_regular_and_virtual() {
        let heap = initialized();
        let small = heap.allocate(None, 500, 0, AllocFlags::PERSISTENT).unwrap();
        let large = heap.allocate(None, 40_000, 0, AllocFlags::PERSISTENT).unwrap();

        let stats = heap.statistics().unwrap();
        assert_eq!(stats.allocations_current, 1);
        assert_eq!(stats.allocated_current, 500);
        assert_eq!(stats.allocations_current_virtual, 1);
        assert_eq!(stats.allocated_current_virtual, 40_000);

        unsafe {
            heap.deallocate(small);
            heap.deallocate(large);
        }
        let stats = heap.statistics().unwrap();
        assert!(stats.is_quiescent());
        assert_eq!(stats.allocations_total, 1);
        assert_eq!(stats.allocations_total_virtual, 1);
    }

    #[test]
    fn consecutive_blocks_keep_a_gap() {
        let heap = initialized();
        let blocks: Vec<_> = (0..64)
            .map(|_| heap.allocate(None, 500, 0, AllocFlags::PERSISTENT).unwrap())
            .collect();
        let mut addrs: Vec<usize> = blocks.iter().map(|p| p.as_ptr() as usize).collect();
        addrs.sort_unstable();
        for pair in addrs.windows(2) {
            assert!(pair[0] + 500 < pair[1]);
        }
        for ptr in blocks {
            unsafe { heap.deallocate(ptr) };
        }
    }
}
