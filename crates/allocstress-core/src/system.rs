//! The allocator-facing contract.

use std::fmt;
use std::ops::{BitOr, BitOrAssign};
use std::ptr::NonNull;

use thiserror::Error;

use crate::stats::MemoryStatistics;

/// Lifetime and initialization hints passed with every allocation.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct AllocFlags(u32);

impl AllocFlags {
    /// No hints.
    pub const NONE: Self = Self(0);
    /// Short-lived allocation; may be served from scratch space.
    pub const TEMPORARY: Self = Self(1 << 0);
    /// Allocation outlives the current scope.
    pub const PERSISTENT: Self = Self(1 << 1);
    /// Allocation is only ever touched by the allocating thread.
    pub const THREAD_LOCAL: Self = Self(1 << 2);
    /// Returned memory must be zeroed.
    pub const ZERO_INITIALIZED: Self = Self(1 << 3);

    /// Raw bit value.
    #[must_use]
    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Construct from raw bits, dropping unknown ones.
    #[must_use]
    pub const fn from_bits_truncate(bits: u32) -> Self {
        Self(bits & 0xf)
    }

    /// Returns true if every bit in `other` is set in `self`.
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for AllocFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for AllocFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl fmt::Debug for AllocFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: [(AllocFlags, &str); 4] = [
            (AllocFlags::TEMPORARY, "TEMPORARY"),
            (AllocFlags::PERSISTENT, "PERSISTENT"),
            (AllocFlags::THREAD_LOCAL, "THREAD_LOCAL"),
            (AllocFlags::ZERO_INITIALIZED, "ZERO_INITIALIZED"),
        ];
        let set: Vec<&str> = NAMES
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, name)| *name)
            .collect();
        if set.is_empty() {
            f.write_str("AllocFlags(NONE)")
        } else {
            write!(f, "AllocFlags({})", set.join(" | "))
        }
    }
}

/// Lifecycle errors reported by a memory system.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MemorySystemError {
    #[error("memory system already initialized")]
    AlreadyInitialized,
    #[error("memory system not initialized")]
    NotInitialized,
    #[error("unsupported: {0}")]
    Unsupported(String),
}

/// A pluggable dynamic-memory allocator.
///
/// One instance is shared by every thread of a test scenario, so all methods
/// take `&self`. The harness imposes no locking of its own; any
/// synchronization is the implementation's responsibility.
pub trait MemorySystem: Send + Sync {
    /// Short identifier used in logs and reports.
    fn name(&self) -> &str;

    /// Prepare global state. Must succeed again after [`finalize`](Self::finalize).
    ///
    /// Calling it twice without a `finalize` in between returns
    /// [`MemorySystemError::AlreadyInitialized`] and leaves the system as it was.
    fn initialize(&self) -> Result<(), MemorySystemError>;

    /// Allocate at least `size` usable bytes.
    ///
    /// `align == 0` selects the default alignment. Returns `None` only on
    /// resource exhaustion (or when not initialized).
    fn allocate(
        &self,
        hint: Option<NonNull<u8>>,
        size: usize,
        align: usize,
        flags: AllocFlags,
    ) -> Option<NonNull<u8>>;

    /// Release a block returned by [`allocate`](Self::allocate).
    ///
    /// # Safety
    ///
    /// `ptr` must be live: returned by `allocate` on this instance and not yet
    /// deallocated.
    unsafe fn deallocate(&self, ptr: NonNull<u8>);

    /// Release resources owned by the calling thread.
    fn thread_finalize(&self);

    /// Release all global resources.
    ///
    /// On a system that is not initialized this is a no-op, so callers may
    /// finalize unconditionally on their shutdown path.
    fn finalize(&self);

    /// Detailed counters, if the implementation keeps them.
    fn statistics(&self) -> Option<MemoryStatistics> {
        None
    }
}
