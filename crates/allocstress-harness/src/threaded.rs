//! Concurrent multi-threaded stress scenario.
//!
//! Sequence: initialize, optional statistics, synchronous warm-up passes
//! on the calling thread, then a pool of workers sharing the memory
//! system. Workers start behind a gate that opens once all of them are
//! running. After every worker has joined, the memory system is
//! finalized and each worker's result is checked.

use std::sync::Arc;
use std::time::Instant;

use allocstress_core::MemorySystem;

use crate::config::ConcurrentConfig;
use crate::failure::{Failure, FailureLedger, HarnessError};
use crate::pool::{PoolSync, WorkerPool};
use crate::report::{ScenarioLog, ScenarioReport, WorkerSummary};
use crate::structured_log::{LogEmitter, LogLevel, Outcome};
use crate::worker::{WorkerOutcome, WorkerTask, run_worker_with_jitter};

pub const SCENARIO_NAME: &str = "threaded";

/// Fold a worker's own checks into `ledger`, plus one check for its result.
fn settle_worker(ledger: &mut FailureLedger, outcome: WorkerOutcome) -> WorkerSummary {
    let summary = WorkerSummary {
        worker: outcome.worker,
        jitter_ms: outcome.jitter,
        loops: outcome.loops,
        allocations: outcome.allocations,
        checks: outcome.ledger.checks(),
        failed: outcome.ledger.failed(),
    };
    let failures = outcome.ledger.failed();
    ledger.absorb(outcome.ledger);
    ledger.check(if failures == 0 {
        Ok(())
    } else {
        Err(Failure::WorkerFailed {
            worker: summary.worker,
            failures,
        })
    });
    summary
}

/// Spawn, gate, join and check the worker pool.
fn run_pool(
    system: &dyn MemorySystem,
    config: &ConcurrentConfig,
    task: &Arc<WorkerTask>,
    workers: usize,
    log: &mut ScenarioLog<'_>,
    report: &mut ScenarioReport,
    ledger: &mut FailureLedger,
) -> Result<(), HarnessError> {
    log.emit(
        log.entry(LogLevel::Info, "workers.spawn")
            .with_phase(task.label.as_str())
            .with_details(serde_json::json!({
                "workers": workers,
                "hardware_threads": num_cpus::get(),
            })),
    )?;

    let sync = PoolSync::new(workers);
    let workers_start = Instant::now();
    let results = std::thread::scope(|scope| -> Result<_, HarnessError> {
        let pool = WorkerPool::spawn(scope, workers, &sync, task, system, config.max_jitter_ms)?;
        pool.wait_started();
        pool.release();
        pool.wait_finished();
        Ok(pool.join_all())
    })?;

    // Settle every result before logging so a log error loses none of them.
    let mut entries = Vec::with_capacity(results.len());
    for result in results {
        match result {
            Ok(outcome) => {
                let summary = settle_worker(ledger, outcome);
                entries.push(
                    log.entry(LogLevel::Debug, "worker.finish")
                        .with_phase(task.label.as_str())
                        .with_worker(summary.worker)
                        .with_outcome(Outcome::from_passed(summary.failed == 0))
                        .with_details(serde_json::to_value(&summary)?),
                );
                report.workers.push(summary);
            }
            Err(failure) => {
                if let Failure::WorkerPanicked { worker, message } = &failure {
                    entries.push(
                        log.entry(LogLevel::Error, "worker.panicked")
                            .with_phase(task.label.as_str())
                            .with_worker(*worker)
                            .with_outcome(Outcome::Fail)
                            .with_details(serde_json::json!({ "message": message })),
                    );
                }
                ledger.fail(failure);
            }
        }
    }
    for entry in entries {
        log.emit(entry)?;
    }
    log.emit(
        log.entry(LogLevel::Info, "workers.joined")
            .with_phase(task.label.as_str())
            .with_duration_ms(workers_start.elapsed().as_millis() as u64),
    )?;
    Ok(())
}

/// Everything between initialize and shutdown.
#[allow(clippy::too_many_arguments)]
fn drive(
    system: &dyn MemorySystem,
    config: &ConcurrentConfig,
    warmups: &[WorkerTask],
    task: &Arc<WorkerTask>,
    workers: usize,
    log: &mut ScenarioLog<'_>,
    report: &mut ScenarioReport,
    ledger: &mut FailureLedger,
) -> Result<(), HarnessError> {
    if config.statistics.enabled() {
        log.statistics(report, "after_initialize", system.statistics())?;
    }

    for warmup in warmups {
        let outcome = run_worker_with_jitter(system, warmup, 0, config.max_jitter_ms);
        let entry = log
            .entry(LogLevel::Info, "warmup.finish")
            .with_phase(warmup.label.as_str())
            .with_outcome(Outcome::from_passed(outcome.ledger.is_clean()))
            .with_details(serde_json::json!({
                "sizes": &warmup.sizes,
                "allocations": outcome.allocations,
                "failed": outcome.ledger.failed(),
            }));
        settle_worker(ledger, outcome);
        log.emit(entry)?;
    }

    run_pool(system, config, task, workers, log, report, ledger)
}

/// Statistics after the test, global teardown, statistics after shutdown.
///
/// Teardown happens even if the first snapshot cannot be logged.
fn shutdown(
    system: &dyn MemorySystem,
    config: &ConcurrentConfig,
    log: &mut ScenarioLog<'_>,
    report: &mut ScenarioReport,
) -> Result<(), HarnessError> {
    let after_test = if config.statistics.enabled() {
        log.statistics(report, "after_test", system.statistics())
    } else {
        Ok(())
    };
    system.thread_finalize();
    system.finalize();
    after_test?;
    if config.statistics.enabled() {
        log.statistics(report, "after_shutdown", system.statistics())?;
    }
    Ok(())
}

/// Run the concurrent scenario against `system`.
///
/// Once initialized, the memory system is finalized before returning,
/// also when a worker cannot be spawned or logging fails.
pub fn run_threaded(
    system: &dyn MemorySystem,
    config: &ConcurrentConfig,
    emitter: &mut LogEmitter,
) -> Result<ScenarioReport, HarnessError> {
    let start = Instant::now();

    let task = Arc::new(WorkerTask::from_config(config)?);
    let warmups = config
        .warmup_sizes
        .iter()
        .enumerate()
        .map(|(i, sizes)| {
            WorkerTask::new(format!("warmup{i}"), config.loops, config.passes, sizes.clone())
        })
        .collect::<Result<Vec<_>, _>>()?;
    if config.min_threads == 0 || config.min_threads > config.max_threads {
        return Err(HarnessError::InvalidConfig(format!(
            "worker range [{}, {}] is empty",
            config.min_threads, config.max_threads
        )));
    }
    let workers = config.resolve_workers(num_cpus::get());

    let mut log = ScenarioLog::new(emitter, SCENARIO_NAME, system.name());
    let mut report = ScenarioReport::new(SCENARIO_NAME, system.name());
    let mut ledger = FailureLedger::new();

    log.emit(
        log.entry(LogLevel::Info, "scenario.start")
            .with_details(serde_json::to_value(config)?),
    )?;

    ledger.check(system.initialize().map_err(|source| Failure::Lifecycle {
        stage: "initialize",
        source,
    }));
    let driven = drive(
        system,
        config,
        &warmups,
        &task,
        workers,
        &mut log,
        &mut report,
        &mut ledger,
    );
    let shut_down = shutdown(system, config, &mut log, &mut report);
    driven?;
    shut_down?;

    report.finish(&ledger, start.elapsed());
    log.finish(&report)?;
    Ok(report)
}
