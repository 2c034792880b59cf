//! Scenario reports and the per-scenario logging context.

use std::collections::BTreeMap;
use std::time::Duration;

use allocstress_core::MemoryStatistics;
use serde::Serialize;

use crate::failure::{Failure, FailureLedger};
use crate::structured_log::{LogEmitter, LogEntry, LogLevel, Outcome};
use crate::verify::OverlapPolicy;

/// Per-phase results of the bulk scenario.
#[derive(Debug, Clone, Serialize)]
pub struct PhaseSummary {
    pub name: String,
    pub iterations: u64,
    pub blocks: usize,
    pub overlap: OverlapPolicy,
    pub allocations: u64,
    pub checks: u64,
    pub failed: u64,
    pub duration_ms: u64,
}

/// Per-worker results of the concurrent scenario.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerSummary {
    pub worker: usize,
    pub jitter_ms: u64,
    pub loops: u64,
    pub allocations: u64,
    pub checks: u64,
    pub failed: u64,
}

/// A labelled allocator statistics snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct StatisticsSnapshot {
    pub label: String,
    pub statistics: MemoryStatistics,
}

/// Machine-readable result of one scenario run.
#[derive(Debug, Clone, Serialize)]
pub struct ScenarioReport {
    pub scenario: String,
    pub memory_system: String,
    pub outcome: Outcome,
    pub checks: u64,
    pub failed: u64,
    /// Failures counted but not listed in `failures`.
    pub suppressed: u64,
    /// Failure count per kind, over the listed failures.
    pub failure_kinds: BTreeMap<String, u64>,
    pub failures: Vec<String>,
    pub phases: Vec<PhaseSummary>,
    pub workers: Vec<WorkerSummary>,
    pub statistics: Vec<StatisticsSnapshot>,
    pub duration_ms: u64,
}

impl ScenarioReport {
    #[must_use]
    pub fn new(scenario: impl Into<String>, memory_system: impl Into<String>) -> Self {
        Self {
            scenario: scenario.into(),
            memory_system: memory_system.into(),
            outcome: Outcome::Skip,
            checks: 0,
            failed: 0,
            suppressed: 0,
            failure_kinds: BTreeMap::new(),
            failures: Vec::new(),
            phases: Vec::new(),
            workers: Vec::new(),
            statistics: Vec::new(),
            duration_ms: 0,
        }
    }

    /// Fill in the totals from the scenario's ledger.
    pub fn finish(&mut self, ledger: &FailureLedger, elapsed: Duration) {
        self.checks = ledger.checks();
        self.failed = ledger.failed();
        self.suppressed = ledger.suppressed();
        self.failures = ledger.recorded().iter().map(Failure::to_string).collect();
        self.failure_kinds.clear();
        for failure in ledger.recorded() {
            *self.failure_kinds.entry(failure.kind().to_string()).or_insert(0) += 1;
        }
        self.outcome = Outcome::from_passed(ledger.is_clean());
        self.duration_ms = elapsed.as_millis() as u64;
    }

    #[must_use]
    pub fn passed(&self) -> bool {
        self.outcome == Outcome::Pass
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}

/// Logging context of one scenario run.
pub struct ScenarioLog<'a> {
    emitter: &'a mut LogEmitter,
    scenario: &'a str,
    memory_system: String,
}

impl<'a> ScenarioLog<'a> {
    pub fn new(emitter: &'a mut LogEmitter, scenario: &'a str, memory_system: &str) -> Self {
        Self {
            emitter,
            scenario,
            memory_system: memory_system.to_string(),
        }
    }

    /// An entry pre-filled with scenario and memory system; the emitter
    /// assigns the trace id.
    #[must_use]
    pub fn entry(&self, level: LogLevel, event: &str) -> LogEntry {
        LogEntry::new("", level, event)
            .with_scenario(self.scenario)
            .with_memory_system(self.memory_system.as_str())
    }

    pub fn emit(&mut self, entry: LogEntry) -> std::io::Result<()> {
        self.emitter.emit_entry(entry)
    }

    /// Log one `statistics.snapshot` event and keep the snapshot in `report`.
    pub fn statistics(
        &mut self,
        report: &mut ScenarioReport,
        label: &str,
        statistics: Option<MemoryStatistics>,
    ) -> std::io::Result<()> {
        let Some(statistics) = statistics else {
            let entry = self
                .entry(LogLevel::Debug, "statistics.unavailable")
                .with_details(serde_json::json!({ "label": label }));
            return self.emit(entry);
        };
        let entry = self
            .entry(LogLevel::Info, "statistics.snapshot")
            .with_details(serde_json::json!({
                "label": label,
                "statistics": statistics,
            }));
        self.emit(entry)?;
        report.statistics.push(StatisticsSnapshot {
            label: label.to_string(),
            statistics,
        });
        Ok(())
    }

    /// Log every recorded failure, then the scenario verdict.
    pub fn finish(&mut self, report: &ScenarioReport) -> std::io::Result<()> {
        for failure in &report.failures {
            let entry = self
                .entry(LogLevel::Error, "check.failed")
                .with_outcome(Outcome::Fail)
                .with_details(serde_json::json!({ "message": failure }));
            self.emit(entry)?;
        }
        let level = if report.passed() {
            LogLevel::Info
        } else {
            LogLevel::Error
        };
        let entry = self
            .entry(level, "scenario.finish")
            .with_outcome(report.outcome)
            .with_duration_ms(report.duration_ms)
            .with_details(serde_json::json!({
                "checks": report.checks,
                "failed": report.failed,
                "suppressed": report.suppressed,
            }));
        self.emit(entry)?;
        self.emitter.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::failure::Site;
    use crate::structured_log::validate_log_line;

    #[test]
    fn clean_ledger_passes() {
        let mut ledger = FailureLedger::new();
        ledger.pass_many(12);
        let mut report = ScenarioReport::new("alloc", "heap");
        assert!(!report.passed());
        report.finish(&ledger, Duration::from_millis(7));
        assert!(report.passed());
        assert_eq!(report.checks, 12);
        assert_eq!(report.duration_ms, 7);
    }

    #[test]
    fn failures_are_listed_and_grouped() {
        let mut ledger = FailureLedger::new();
        for index in 0..3 {
            ledger.fail(Failure::AllocationFailed {
                site: Site {
                    phase: "uniform".to_string(),
                    iteration: 0,
                    index,
                },
                size: 500,
            });
        }
        ledger.fail(Failure::WorkerFailed {
            worker: 1,
            failures: 9,
        });
        let mut report = ScenarioReport::new("threaded", "heap");
        report.finish(&ledger, Duration::ZERO);
        assert!(!report.passed());
        assert_eq!(report.failures.len(), 4);
        assert_eq!(report.failure_kinds["allocation_failed"], 3);
        assert_eq!(report.failure_kinds["worker_failed"], 1);

        let json: serde_json::Value = serde_json::from_str(&report.to_json().unwrap()).unwrap();
        assert_eq!(json["outcome"], "fail");
        assert_eq!(json["failed"], 4);
        assert!(json["failures"][0].as_str().unwrap().contains("returned null"));
    }

    #[test]
    fn scenario_log_emits_valid_lines() {
        let (mut emitter, buffer) = LogEmitter::to_buffer("allocstress", "test");
        let mut report = ScenarioReport::new("threaded", "heap");
        {
            let mut log = ScenarioLog::new(&mut emitter, "threaded", "heap");
            log.statistics(&mut report, "after_initialize", Some(MemoryStatistics::default()))
                .unwrap();
            log.statistics(&mut report, "after_test", None).unwrap();
            report.finish(&FailureLedger::new(), Duration::ZERO);
            log.finish(&report).unwrap();
        }
        assert_eq!(report.statistics.len(), 1);
        assert_eq!(report.statistics[0].label, "after_initialize");

        let lines: Vec<_> = buffer.contents().lines().map(str::to_string).collect();
        assert_eq!(lines.len(), 3);
        let entries: Vec<_> = lines
            .iter()
            .enumerate()
            .map(|(i, l)| validate_log_line(l, i + 1).unwrap())
            .collect();
        assert_eq!(entries[0].event, "statistics.snapshot");
        assert_eq!(entries[1].event, "statistics.unavailable");
        assert_eq!(entries[2].event, "scenario.finish");
        assert_eq!(entries[2].outcome, Some(Outcome::Pass));
        assert!(entries.iter().all(|e| e.scenario.as_deref() == Some("threaded")));
    }
}
