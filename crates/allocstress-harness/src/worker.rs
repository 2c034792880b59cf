//! The per-thread allocate / write / verify / free loop.

use std::time::Duration;

use allocstress_core::MemorySystem;
use rand::Rng;
use serde::Serialize;

use crate::batch::LiveBatch;
use crate::config::{ConcurrentConfig, MAX_PASSES, MAX_SIZES};
use crate::failure::{FailureLedger, HarnessError};
use crate::verify::{OverlapPolicy, byte_pattern};

/// Size offsets cycle with the loop index modulo this value.
const LOOP_SIZE_PERIOD: u64 = 1024;

/// Read-only description of one worker's workload, shared by every worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkerTask {
    /// Phase name used in failure sites (`warmup0`, `workers`, ...).
    pub label: String,
    pub loops: u64,
    pub passes: usize,
    pub sizes: Vec<usize>,
    /// Content written into every block; long enough for the largest size.
    #[serde(skip)]
    pattern: Vec<u8>,
}

impl WorkerTask {
    pub fn new(
        label: impl Into<String>,
        loops: u64,
        passes: usize,
        sizes: Vec<usize>,
    ) -> Result<Self, HarnessError> {
        if passes == 0 || passes > MAX_PASSES {
            return Err(HarnessError::InvalidConfig(format!(
                "passes must be in 1..={MAX_PASSES}, got {passes}"
            )));
        }
        if sizes.is_empty() || sizes.len() > MAX_SIZES {
            return Err(HarnessError::InvalidConfig(format!(
                "worker needs 1..={MAX_SIZES} candidate sizes, got {}",
                sizes.len()
            )));
        }
        if sizes.contains(&0) {
            return Err(HarnessError::InvalidConfig(
                "worker sizes must be positive".to_string(),
            ));
        }
        let max_offset = loops.saturating_sub(1).min(LOOP_SIZE_PERIOD - 1) as usize;
        let longest = sizes.iter().copied().max().unwrap_or(0) + max_offset;
        Ok(Self {
            label: label.into(),
            loops,
            passes,
            sizes,
            pattern: byte_pattern(longest),
        })
    }

    /// The concurrent workload of `config`.
    pub fn from_config(config: &ConcurrentConfig) -> Result<Self, HarnessError> {
        Self::new("workers", config.loops, config.passes, config.sizes.clone())
    }

    /// Size of block `pass` in loop `lp` for a worker that drew `jitter`.
    #[must_use]
    pub fn size_at(&self, lp: u64, pass: usize, jitter: u64) -> usize {
        let n = self.sizes.len() as u64;
        let pick = (lp + pass as u64 + jitter) % n;
        self.sizes[pick as usize] + (lp % LOOP_SIZE_PERIOD) as usize
    }
}

/// What one worker did and what it observed.
#[derive(Debug, Clone)]
pub struct WorkerOutcome {
    pub worker: usize,
    pub jitter: u64,
    pub loops: u64,
    pub allocations: u64,
    pub ledger: FailureLedger,
}

/// Run `task` on the calling thread with a fixed `jitter`, then finalize
/// the thread's allocator state.
pub fn run_worker(
    system: &dyn MemorySystem,
    task: &WorkerTask,
    worker: usize,
    jitter: u64,
) -> WorkerOutcome {
    let mut ledger = FailureLedger::new();
    let mut batch = LiveBatch::new(task.label.as_str(), task.passes);
    let mut allocations = 0u64;

    for lp in 0..task.loops {
        batch.begin(lp);
        for pass in 0..task.passes {
            let size = task.size_at(lp, pass, jitter);
            if batch.allocate(system, pass, &task.pattern[..size], &mut ledger) {
                allocations += 1;
            }
        }
        // Sizes vary within a pass, so no bookkeeping gap is assumed.
        batch.check_overlaps(OverlapPolicy::Strict, &mut ledger);
        batch.verify_and_release(system, &task.pattern, &mut ledger);
    }

    system.thread_finalize();

    WorkerOutcome {
        worker,
        jitter,
        loops: task.loops,
        allocations,
        ledger,
    }
}

/// Draw a startup jitter in `0..=max_jitter_ms`, sleep that long, then run.
///
/// The drawn value also offsets the worker's size sequence.
pub fn run_worker_with_jitter(
    system: &dyn MemorySystem,
    task: &WorkerTask,
    worker: usize,
    max_jitter_ms: u64,
) -> WorkerOutcome {
    let jitter = rand::thread_rng().gen_range(0..=max_jitter_ms);
    std::thread::sleep(Duration::from_millis(jitter));
    run_worker(system, task, worker, jitter)
}
