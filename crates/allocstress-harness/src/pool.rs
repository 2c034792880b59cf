//! Worker thread orchestration.
//!
//! Workers are spawned as named scoped threads that borrow the memory
//! system under test. Each one reports "started" on a [`Latch`], then
//! parks on a [`Gate`] until the runner has seen every worker start.
//! Completion is reported on a second latch from a drop guard, so a
//! panicking worker still counts as finished.

use std::sync::Arc;
use std::thread::{self, Scope, ScopedJoinHandle};

use allocstress_core::MemorySystem;
use parking_lot::{Condvar, Mutex};

use crate::failure::{Failure, HarnessError};
use crate::worker::{WorkerOutcome, WorkerTask, run_worker_with_jitter};

/// Count-down latch.
pub struct Latch {
    remaining: Mutex<usize>,
    cond: Condvar,
}

impl Latch {
    #[must_use]
    pub fn new(count: usize) -> Self {
        Self {
            remaining: Mutex::new(count),
            cond: Condvar::new(),
        }
    }

    pub fn count_down(&self) {
        let mut remaining = self.remaining.lock();
        *remaining = remaining.saturating_sub(1);
        if *remaining == 0 {
            self.cond.notify_all();
        }
    }

    /// Block until the count reaches zero.
    pub fn wait(&self) {
        let mut remaining = self.remaining.lock();
        while *remaining > 0 {
            self.cond.wait(&mut remaining);
        }
    }

    #[must_use]
    pub fn remaining(&self) -> usize {
        *self.remaining.lock()
    }
}

/// Counts the latch down when dropped, including during unwinding.
struct CountDownOnDrop<'a>(&'a Latch);

impl Drop for CountDownOnDrop<'_> {
    fn drop(&mut self) {
        self.0.count_down();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GateState {
    Closed,
    Open,
    Cancelled,
}

/// One-shot gate that holds workers until the runner lets them go.
pub struct Gate {
    state: Mutex<GateState>,
    cond: Condvar,
}

impl Gate {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(GateState::Closed),
            cond: Condvar::new(),
        }
    }

    pub fn open(&self) {
        self.set(GateState::Open);
    }

    /// Release waiters without letting them run their workload.
    pub fn cancel(&self) {
        self.set(GateState::Cancelled);
    }

    fn set(&self, next: GateState) {
        let mut state = self.state.lock();
        if *state == GateState::Closed {
            *state = next;
        }
        self.cond.notify_all();
    }

    /// Block while closed. Returns true if the gate was opened.
    pub fn wait(&self) -> bool {
        let mut state = self.state.lock();
        while *state == GateState::Closed {
            self.cond.wait(&mut state);
        }
        *state == GateState::Open
    }
}

impl Default for Gate {
    fn default() -> Self {
        Self::new()
    }
}

/// Synchronization shared by the runner and its workers.
pub struct PoolSync {
    pub started: Latch,
    pub finished: Latch,
    pub gate: Gate,
}

impl PoolSync {
    #[must_use]
    pub fn new(workers: usize) -> Self {
        Self {
            started: Latch::new(workers),
            finished: Latch::new(workers),
            gate: Gate::new(),
        }
    }
}

/// Handles of a running set of workers.
pub struct WorkerPool<'scope> {
    handles: Vec<(usize, ScopedJoinHandle<'scope, Option<WorkerOutcome>>)>,
    sync: &'scope PoolSync,
}

impl<'scope> WorkerPool<'scope> {
    /// Spawn `sync`'s worth of workers named `allocator-<n>` inside `scope`.
    ///
    /// If a spawn fails the already running workers are cancelled and
    /// joined before the error is returned.
    pub fn spawn<'env>(
        scope: &'scope Scope<'scope, 'env>,
        count: usize,
        sync: &'scope PoolSync,
        task: &Arc<WorkerTask>,
        system: &'scope dyn MemorySystem,
        max_jitter_ms: u64,
    ) -> Result<Self, HarnessError> {
        let mut pool = Self {
            handles: Vec::with_capacity(count),
            sync,
        };
        for worker in 0..count {
            let task = Arc::clone(task);
            let spawned = thread::Builder::new()
                .name(format!("allocator-{worker}"))
                .spawn_scoped(scope, move || {
                    let _finished = CountDownOnDrop(&sync.finished);
                    sync.started.count_down();
                    if !sync.gate.wait() {
                        return None;
                    }
                    Some(run_worker_with_jitter(system, &task, worker, max_jitter_ms))
                });
            match spawned {
                Ok(handle) => pool.handles.push((worker, handle)),
                Err(source) => return Err(pool.abandon(worker, source)),
            }
        }
        Ok(pool)
    }

    /// Cancel the gate, join what was spawned and describe the failure.
    fn abandon(self, worker: usize, source: std::io::Error) -> HarnessError {
        self.sync.gate.cancel();
        let panicked = self
            .join_all()
            .into_iter()
            .filter_map(Result::err)
            .collect();
        HarnessError::Spawn {
            worker,
            source,
            panicked,
        }
    }

    /// Block until every worker has started.
    pub fn wait_started(&self) {
        self.sync.started.wait();
    }

    /// Let the workers run.
    pub fn release(&self) {
        self.sync.gate.open();
    }

    /// Block until every worker has finished or unwound.
    pub fn wait_finished(&self) {
        self.sync.finished.wait();
    }

    /// Join every worker, in spawn order.
    pub fn join_all(self) -> Vec<Result<WorkerOutcome, Failure>> {
        self.handles
            .into_iter()
            .filter_map(|(worker, handle)| match handle.join() {
                Ok(Some(outcome)) => Some(Ok(outcome)),
                Ok(None) => None,
                Err(payload) => Some(Err(Failure::WorkerPanicked {
                    worker,
                    message: panic_message(payload.as_ref()),
                })),
            })
            .collect()
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use allocstress_core::{AllocFlags, HeapMemorySystem, MemoryStatistics, MemorySystemError};
    use std::ptr::NonNull;
    use std::time::Duration;

    /// Heap that records how many workers were still starting at each allocation.
    struct StartWatcher<'a> {
        heap: HeapMemorySystem,
        sync: &'a PoolSync,
        still_starting: Mutex<Vec<usize>>,
    }

    impl MemorySystem for StartWatcher<'_> {
        fn name(&self) -> &str {
            "start-watcher"
        }

        fn initialize(&self) -> Result<(), MemorySystemError> {
            self.heap.initialize()
        }

        fn allocate(
            &self,
            hint: Option<NonNull<u8>>,
            size: usize,
            align: usize,
            flags: AllocFlags,
        ) -> Option<NonNull<u8>> {
            self.still_starting.lock().push(self.sync.started.remaining());
            self.heap.allocate(hint, size, align, flags)
        }

        unsafe fn deallocate(&self, ptr: NonNull<u8>) {
            unsafe { self.heap.deallocate(ptr) }
        }

        fn thread_finalize(&self) {
            self.heap.thread_finalize();
        }

        fn finalize(&self) {
            self.heap.finalize();
        }

        fn statistics(&self) -> Option<MemoryStatistics> {
            self.heap.statistics()
        }
    }

    fn task() -> Arc<WorkerTask> {
        Arc::new(WorkerTask::new("workers", 3, 32, vec![19, 249, 797]).unwrap())
    }

    #[test]
    fn latch_releases_at_zero() {
        let latch = Latch::new(3);
        thread::scope(|s| {
            for _ in 0..3 {
                s.spawn(|| latch.count_down());
            }
            latch.wait();
        });
        assert_eq!(latch.remaining(), 0);
        latch.count_down();
        assert_eq!(latch.remaining(), 0);
    }

    #[test]
    fn gate_holds_until_opened() {
        let gate = Gate::new();
        let passed = Mutex::new(false);
        thread::scope(|s| {
            s.spawn(|| {
                assert!(gate.wait());
                *passed.lock() = true;
            });
            thread::sleep(Duration::from_millis(20));
            assert!(!*passed.lock());
            gate.open();
        });
        assert!(*passed.lock());
    }

    #[test]
    fn cancelled_gate_stays_cancelled() {
        let gate = Gate::new();
        gate.cancel();
        gate.open();
        assert!(!gate.wait());
    }

    #[test]
    fn pool_runs_every_worker_once() {
        let system = HeapMemorySystem::new();
        system.initialize().unwrap();
        let task = task();
        let sync = PoolSync::new(4);

        let results = thread::scope(|s| {
            let pool = WorkerPool::spawn(s, 4, &sync, &task, &system, 1).unwrap();
            pool.wait_started();
            pool.release();
            pool.wait_finished();
            pool.join_all()
        });

        let workers: Vec<_> = results
            .into_iter()
            .map(|r| {
                let outcome = r.unwrap();
                assert!(outcome.ledger.is_clean());
                assert_eq!(outcome.allocations, 3 * 32);
                outcome.worker
            })
            .collect();
        assert_eq!(workers, vec![0, 1, 2, 3]);
        assert_eq!(system.thread_finalizations(), 4);
        assert!(system.statistics().unwrap().is_quiescent());
    }

    #[test]
    fn no_worker_allocates_before_all_have_started() {
        let sync = PoolSync::new(6);
        let system = StartWatcher {
            heap: HeapMemorySystem::new(),
            sync: &sync,
            still_starting: Mutex::new(Vec::new()),
        };
        system.initialize().unwrap();
        let task = task();

        let results = thread::scope(|s| {
            let pool = WorkerPool::spawn(s, 6, &sync, &task, &system, 0).unwrap();
            pool.wait_started();
            thread::sleep(Duration::from_millis(20));
            assert!(system.still_starting.lock().is_empty());
            pool.release();
            pool.wait_finished();
            pool.join_all()
        });

        assert_eq!(results.len(), 6);
        let seen = system.still_starting.lock();
        assert_eq!(seen.len(), 6 * 3 * 32);
        assert!(seen.iter().all(|&remaining| remaining == 0), "{seen:?}");
    }

    #[test]
    fn cancelled_pool_runs_nothing() {
        let system = HeapMemorySystem::new();
        system.initialize().unwrap();
        let task = task();
        let sync = PoolSync::new(3);

        let results = thread::scope(|s| {
            let pool = WorkerPool::spawn(s, 3, &sync, &task, &system, 0).unwrap();
            pool.wait_started();
            sync.gate.cancel();
            pool.wait_finished();
            pool.join_all()
        });

        assert!(results.is_empty());
        assert_eq!(system.statistics().unwrap().allocations_total, 0);
        assert_eq!(system.thread_finalizations(), 0);
    }

    #[test]
    fn abandoned_pool_reports_the_failed_spawn() {
        let system = HeapMemorySystem::new();
        system.initialize().unwrap();
        let task = task();
        let sync = PoolSync::new(3);

        let err = thread::scope(|s| {
            let pool = WorkerPool::spawn(s, 2, &sync, &task, &system, 0).unwrap();
            pool.abandon(2, std::io::Error::other("thread limit"))
        });

        match err {
            HarnessError::Spawn {
                worker, panicked, ..
            } => {
                assert_eq!(worker, 2);
                assert!(panicked.is_empty());
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(system.statistics().unwrap().allocations_total, 0);
        assert_eq!(system.thread_finalizations(), 0);
    }

    #[test]
    fn panic_payloads_become_messages() {
        let boxed: Box<dyn std::any::Any + Send> = Box::new("boom");
        assert_eq!(panic_message(boxed.as_ref()), "boom");
        let boxed: Box<dyn std::any::Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(boxed.as_ref()), "bang");
        let boxed: Box<dyn std::any::Any + Send> = Box::new(7u8);
        assert_eq!(panic_message(boxed.as_ref()), "non-string panic payload");
    }
}
