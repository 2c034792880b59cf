//! Fault injection for negative testing.
//!
//! [`FaultyMemorySystem`] forwards to an inner memory system and, on a
//! configurable cadence, misbehaves the way a broken allocator would:
//! returning null, handing out a block that is already live, or stomping
//! on a live block. Injected faults stay memory-safe: aliased blocks are
//! released to the inner system only when their last holder frees them,
//! and scribbles only touch bytes inside a live block.

use std::collections::HashMap;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::{self, ThreadId};

use parking_lot::Mutex;

use crate::stats::MemoryStatistics;
use crate::system::{AllocFlags, MemorySystem, MemorySystemError};

/// Cadence of each fault kind, counted in allocation calls. `None` disables.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FaultPlan {
    /// Return `None` on every Nth allocation.
    pub null_every: Option<u64>,
    /// Return the calling thread's previous live block on every Nth allocation.
    pub alias_every: Option<u64>,
    /// Flip the first byte of the calling thread's previous live block on
    /// every Nth allocation.
    pub scribble_every: Option<u64>,
}

impl FaultPlan {
    #[must_use]
    pub fn null_every(n: u64) -> Self {
        Self {
            null_every: Some(n),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn alias_every(n: u64) -> Self {
        Self {
            alias_every: Some(n),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn scribble_every(n: u64) -> Self {
        Self {
            scribble_every: Some(n),
            ..Self::default()
        }
    }
}

/// Counts of faults actually injected.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FaultCounts {
    pub nulls: u64,
    pub aliases: u64,
    pub scribbles: u64,
}

#[derive(Clone, Copy)]
struct LastBlock {
    addr: usize,
    size: usize,
}

#[derive(Default)]
struct FaultState {
    /// Most recent live block handed to each thread.
    last: HashMap<ThreadId, LastBlock>,
    /// Extra holders of aliased blocks (addr -> outstanding aliases).
    aliases: HashMap<usize, u64>,
}

/// A memory system wrapper that injects allocator defects.
pub struct FaultyMemorySystem<M> {
    inner: M,
    plan: FaultPlan,
    calls: AtomicU64,
    nulls: AtomicU64,
    aliases: AtomicU64,
    scribbles: AtomicU64,
    state: Mutex<FaultState>,
    name: String,
}

impl<M: MemorySystem> FaultyMemorySystem<M> {
    #[must_use]
    pub fn new(inner: M, plan: FaultPlan) -> Self {
        let name = format!("faulty({})", inner.name());
        Self {
            inner,
            plan,
            calls: AtomicU64::new(0),
            nulls: AtomicU64::new(0),
            aliases: AtomicU64::new(0),
            scribbles: AtomicU64::new(0),
            state: Mutex::new(FaultState::default()),
            name,
        }
    }

    /// The wrapped memory system.
    #[must_use]
    pub fn inner(&self) -> &M {
        &self.inner
    }

    #[must_use]
    pub fn injected(&self) -> FaultCounts {
        FaultCounts {
            nulls: self.nulls.load(Ordering::Relaxed),
            aliases: self.aliases.load(Ordering::Relaxed),
            scribbles: self.scribbles.load(Ordering::Relaxed),
        }
    }
}

fn due(every: Option<u64>, call: u64) -> bool {
    every.is_some_and(|n| n > 0 && call % n == 0)
}

impl<M: MemorySystem> MemorySystem for FaultyMemorySystem<M> {
    fn name(&self) -> &str {
        &self.name
    }

    fn initialize(&self) -> Result<(), MemorySystemError> {
        self.inner.initialize()
    }

    fn allocate(
        &self,
        hint: Option<NonNull<u8>>,
        size: usize,
        align: usize,
        flags: AllocFlags,
    ) -> Option<NonNull<u8>> {
        let call = self.calls.fetch_add(1, Ordering::Relaxed) + 1;
        let thread = thread::current().id();

        if due(self.plan.null_every, call) {
            self.nulls.fetch_add(1, Ordering::Relaxed);
            return None;
        }

        let mut state = self.state.lock();
        let previous = state.last.get(&thread).copied();

        if let Some(prev) = previous
            && due(self.plan.scribble_every, call)
        {
            // SAFETY: `prev` is live and owned by this thread; one byte in bounds.
            unsafe {
                let byte = prev.addr as *mut u8;
                byte.write(byte.read() ^ 0xff);
            }
            self.scribbles.fetch_add(1, Ordering::Relaxed);
        }

        if let Some(prev) = previous
            && size <= prev.size
            && due(self.plan.alias_every, call)
        {
            *state.aliases.entry(prev.addr).or_insert(0) += 1;
            self.aliases.fetch_add(1, Ordering::Relaxed);
            return NonNull::new(prev.addr as *mut u8);
        }
        drop(state);

        let ptr = self.inner.allocate(hint, size, align, flags)?;
        self.state.lock().last.insert(
            thread,
            LastBlock {
                addr: ptr.as_ptr() as usize,
                size,
            },
        );
        Some(ptr)
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>) {
        let addr = ptr.as_ptr() as usize;
        {
            let mut state = self.state.lock();
            if let Some(holders) = state.aliases.get_mut(&addr) {
                *holders -= 1;
                if *holders == 0 {
                    state.aliases.remove(&addr);
                }
                return;
            }
            state.last.retain(|_, block| block.addr != addr);
        }
        // SAFETY: the last holder of `ptr` is releasing it.
        unsafe { self.inner.deallocate(ptr) };
    }

    fn thread_finalize(&self) {
        self.state.lock().last.remove(&thread::current().id());
        self.inner.thread_finalize();
    }

    fn finalize(&self) {
        self.inner.finalize();
    }

    fn statistics(&self) -> Option<MemoryStatistics> {
        self.inner.statistics()
    }
}
