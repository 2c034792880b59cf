//! Single-threaded bulk stress scenario.
//!
//! After an optional lifecycle probe, every configured phase runs its
//! iterations as allocate-batch, overlap check, read-back, free-batch.
//! A phase completes fully before the next one starts.

use std::time::Instant;

use allocstress_core::MemorySystem;

use crate::batch::LiveBatch;
use crate::config::{BulkConfig, PhaseConfig, SizePlan};
use crate::failure::{Failure, FailureLedger, HarnessError};
use crate::report::{PhaseSummary, ScenarioLog, ScenarioReport};
use crate::structured_log::{LogEmitter, LogLevel, Outcome};
use crate::verify::reference_data;

pub const SCENARIO_NAME: &str = "alloc";

/// `initialize`, `thread_finalize`, `finalize`, then `initialize` again.
///
/// The memory system is left initialized either way.
pub fn lifecycle_probe(system: &dyn MemorySystem, ledger: &mut FailureLedger) {
    ledger.check(
        system
            .initialize()
            .map_err(|source| Failure::Lifecycle {
                stage: "initialize",
                source,
            }),
    );
    system.thread_finalize();
    system.finalize();
    ledger.check(
        system
            .initialize()
            .map_err(|source| Failure::Lifecycle {
                stage: "reinitialize",
                source,
            }),
    );
}

/// Run one phase and summarize it.
pub fn run_phase(
    system: &dyn MemorySystem,
    phase: &PhaseConfig,
    reference: &[u8],
    ledger: &mut FailureLedger,
) -> PhaseSummary {
    let start = Instant::now();
    let mut phase_ledger = FailureLedger::new();
    let mut batch = LiveBatch::new(phase.name.as_str(), phase.blocks);
    let mut allocations = 0u64;

    for iteration in 0..phase.iterations {
        batch.begin(iteration);
        for index in 0..phase.blocks {
            let size = phase.sizes.size_at(index);
            if batch.allocate(system, index, &reference[..size], &mut phase_ledger) {
                allocations += 1;
            }
        }
        batch.check_overlaps(phase.overlap, &mut phase_ledger);
        batch.verify(reference, &mut phase_ledger);
        batch.release(system);
    }

    let summary = PhaseSummary {
        name: phase.name.clone(),
        iterations: phase.iterations,
        blocks: phase.blocks,
        overlap: phase.overlap,
        allocations,
        checks: phase_ledger.checks(),
        failed: phase_ledger.failed(),
        duration_ms: start.elapsed().as_millis() as u64,
    };
    ledger.absorb(phase_ledger);
    summary
}

/// Reject phases that cannot be run.
fn validate(config: &BulkConfig) -> Result<(), HarnessError> {
    for phase in &config.phases {
        if phase.blocks == 0 {
            return Err(HarnessError::InvalidConfig(format!(
                "phase '{}' has no blocks",
                phase.name
            )));
        }
        if let SizePlan::GrowingCycle { sizes } = &phase.sizes
            && sizes.is_empty()
        {
            return Err(HarnessError::InvalidConfig(format!(
                "phase '{}' has no candidate sizes",
                phase.name
            )));
        }
        if (0..phase.blocks).any(|i| phase.sizes.size_at(i) == 0) {
            return Err(HarnessError::InvalidConfig(format!(
                "phase '{}' has a zero block size",
                phase.name
            )));
        }
    }
    Ok(())
}

/// Everything between initialize and shutdown.
fn drive(
    system: &dyn MemorySystem,
    config: &BulkConfig,
    log: &mut ScenarioLog<'_>,
    report: &mut ScenarioReport,
    ledger: &mut FailureLedger,
) -> Result<(), HarnessError> {
    if config.lifecycle_probe {
        let mut probe = FailureLedger::new();
        lifecycle_probe(system, &mut probe);
        let passed = probe.is_clean();
        ledger.absorb(probe);
        log.emit(
            log.entry(LogLevel::Info, "lifecycle.probe")
                .with_outcome(Outcome::from_passed(passed)),
        )?;
    } else {
        ledger.check(system.initialize().map_err(|source| Failure::Lifecycle {
            stage: "initialize",
            source,
        }));
    }

    let reference = reference_data(config.reference_len());
    for phase in &config.phases {
        log.emit(
            log.entry(LogLevel::Debug, "phase.start")
                .with_phase(phase.name.as_str())
                .with_details(serde_json::json!({
                    "iterations": phase.iterations,
                    "blocks": phase.blocks,
                    "overlap": phase.overlap,
                })),
        )?;
        let summary = run_phase(system, phase, &reference, ledger);
        let entry = log
            .entry(LogLevel::Info, "phase.finish")
            .with_phase(phase.name.as_str())
            .with_outcome(Outcome::from_passed(summary.failed == 0))
            .with_duration_ms(summary.duration_ms)
            .with_details(serde_json::json!({
                "allocations": summary.allocations,
                "checks": summary.checks,
                "failed": summary.failed,
            }));
        report.phases.push(summary);
        log.emit(entry)?;
    }
    Ok(())
}

/// Run the bulk scenario against `system`.
///
/// The memory system is finalized before returning, also when logging
/// fails part-way.
pub fn run_bulk(
    system: &dyn MemorySystem,
    config: &BulkConfig,
    emitter: &mut LogEmitter,
) -> Result<ScenarioReport, HarnessError> {
    let start = Instant::now();
    validate(config)?;

    let mut log = ScenarioLog::new(emitter, SCENARIO_NAME, system.name());
    let mut report = ScenarioReport::new(SCENARIO_NAME, system.name());
    let mut ledger = FailureLedger::new();

    log.emit(
        log.entry(LogLevel::Info, "scenario.start")
            .with_details(serde_json::to_value(config)?),
    )?;

    let driven = drive(system, config, &mut log, &mut report, &mut ledger);
    system.thread_finalize();
    system.finalize();
    driven?;

    report.finish(&ledger, start.elapsed());
    log.finish(&report)?;
    Ok(report)
}
