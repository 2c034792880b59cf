//! Allocator contract for allocstress.
//!
//! This crate provides:
//! - [`MemorySystem`]: the narrow lifecycle + allocation contract every
//!   allocator under test implements.
//! - [`MemoryStatistics`]: optional point-in-time counters, split into
//!   regular and virtual-backed categories.
//! - [`HeapMemorySystem`]: a size-classed reference allocator over the
//!   process heap.
//! - [`FaultyMemorySystem`]: a wrapper that injects null returns, aliased
//!   blocks and scribbles for negative testing of the harness.

pub mod fault;
pub mod heap;
pub mod stats;
pub mod system;

pub use fault::{FaultPlan, FaultyMemorySystem};
pub use heap::HeapMemorySystem;
pub use stats::MemoryStatistics;
pub use system::{AllocFlags, MemorySystem, MemorySystemError};
