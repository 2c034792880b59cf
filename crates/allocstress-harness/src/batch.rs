//! A batch of simultaneously live blocks owned by one thread.
//!
//! Both runners drive the same cycle: allocate and fill every block of the
//! batch, check the live set for overlaps, read every block back, free.
//! Null allocations leave a hole in the batch; the remaining blocks are
//! still checked.

use std::ptr::NonNull;

use allocstress_core::{AllocFlags, MemorySystem};

use crate::failure::{Failure, FailureLedger, Site};
use crate::verify::{self, BlockRecord, OverlapPolicy, OverlapViolation};

struct LiveBlock {
    slot: usize,
    ptr: NonNull<u8>,
    size: usize,
}

pub struct LiveBatch {
    phase: String,
    iteration: u64,
    blocks: Vec<LiveBlock>,
    records: Vec<BlockRecord>,
}

impl LiveBatch {
    #[must_use]
    pub fn new(phase: impl Into<String>, capacity: usize) -> Self {
        Self {
            phase: phase.into(),
            iteration: 0,
            blocks: Vec::with_capacity(capacity),
            records: Vec::with_capacity(capacity),
        }
    }

    /// Start a new iteration. The previous one must have been released.
    pub fn begin(&mut self, iteration: u64) {
        debug_assert!(self.blocks.is_empty(), "batch not released");
        self.iteration = iteration;
    }

    fn site(&self, index: usize) -> Site {
        Site {
            phase: self.phase.clone(),
            iteration: self.iteration,
            index,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Allocate `data.len()` bytes for batch slot `slot` and fill them with `data`.
    ///
    /// Returns false and records a failure when the memory system returns null.
    pub fn allocate(
        &mut self,
        system: &dyn MemorySystem,
        slot: usize,
        data: &[u8],
        ledger: &mut FailureLedger,
    ) -> bool {
        let size = data.len();
        let Some(ptr) = system.allocate(None, size, 0, AllocFlags::PERSISTENT) else {
            ledger.fail(Failure::AllocationFailed {
                site: self.site(slot),
                size,
            });
            return false;
        };
        // SAFETY: the memory system hands out at least `size` writable bytes.
        unsafe { verify::fill_block(ptr, data) };
        self.blocks.push(LiveBlock { slot, ptr, size });
        self.records.push(BlockRecord::new(ptr, size));
        ledger.pass();
        true
    }

    /// Check every pair of live blocks against `policy`.
    ///
    /// A clean batch counts as one passed check; every violating pair is
    /// its own failure, reported with batch slot indices.
    pub fn check_overlaps(&self, policy: OverlapPolicy, ledger: &mut FailureLedger) {
        let violations = verify::find_overlaps(&self.records, policy);
        if violations.is_empty() {
            ledger.pass();
            return;
        }
        for v in violations {
            let violation = OverlapViolation {
                lower_index: self.blocks[v.lower_index].slot,
                upper_index: self.blocks[v.upper_index].slot,
                ..v
            };
            ledger.fail(Failure::Overlap {
                site: self.site(violation.upper_index.max(violation.lower_index)),
                violation,
            });
        }
    }

    fn verify_block(&self, block: &LiveBlock, data: &[u8], ledger: &mut FailureLedger) {
        // SAFETY: the block is live and was handed out with `block.size` bytes.
        let mismatch = unsafe { verify::compare_block(block.ptr, &data[..block.size]) };
        ledger.check(match mismatch {
            None => Ok(()),
            Some(mismatch) => Err(Failure::ContentMismatch {
                site: self.site(block.slot),
                size: block.size,
                mismatch,
            }),
        });
    }

    /// Compare every live block against the prefix of `data` it was filled with.
    pub fn verify(&self, data: &[u8], ledger: &mut FailureLedger) {
        for block in &self.blocks {
            self.verify_block(block, data, ledger);
        }
    }

    /// Free every live block.
    pub fn release(&mut self, system: &dyn MemorySystem) {
        for block in self.blocks.drain(..) {
            // SAFETY: each live block is released exactly once.
            unsafe { system.deallocate(block.ptr) };
        }
        self.records.clear();
    }

    /// Compare each block and free it right away.
    pub fn verify_and_release(
        &mut self,
        system: &dyn MemorySystem,
        data: &[u8],
        ledger: &mut FailureLedger,
    ) {
        let blocks = std::mem::take(&mut self.blocks);
        for block in &blocks {
            self.verify_block(block, data, ledger);
            // SAFETY: each live block is released exactly once.
            unsafe { system.deallocate(block.ptr) };
        }
        self.blocks = blocks;
        self.blocks.clear();
        self.records.clear();
    }
}
