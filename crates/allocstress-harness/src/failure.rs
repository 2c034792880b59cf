//! Failure taxonomy and the non-aborting assertion ledger.

use serde::Serialize;
use thiserror::Error;

use allocstress_core::MemorySystemError;

use crate::verify::{ContentMismatch, OverlapViolation};

/// Where in a scenario a failure was observed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Site {
    pub phase: String,
    pub iteration: u64,
    pub index: usize,
}

impl std::fmt::Display for Site {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}[{}].{}", self.phase, self.iteration, self.index)
    }
}

/// A single failed check.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Failure {
    #[error("{site}: allocation of {size} bytes returned null")]
    AllocationFailed { site: Site, size: usize },
    #[error(
        "{site}: blocks #{} [{:#x}, {:#x}) and #{} [{:#x}, {:#x}) overlap",
        .violation.lower_index, .violation.lower.addr, .violation.lower.end(),
        .violation.upper_index, .violation.upper.addr, .violation.upper.end()
    )]
    Overlap {
        site: Site,
        violation: OverlapViolation,
    },
    #[error(
        "{site}: content mismatch in {size}-byte block at offset {}: expected {:#04x}, read {:#04x}",
        .mismatch.offset, .mismatch.expected, .mismatch.actual
    )]
    ContentMismatch {
        site: Site,
        size: usize,
        mismatch: ContentMismatch,
    },
    #[error("lifecycle step `{stage}` failed: {source}")]
    Lifecycle {
        stage: &'static str,
        #[source]
        source: MemorySystemError,
    },
    #[error("worker {worker} finished with {failures} failed check(s)")]
    WorkerFailed { worker: usize, failures: u64 },
    #[error("worker {worker} panicked: {message}")]
    WorkerPanicked { worker: usize, message: String },
}

impl Failure {
    /// Stable short name of the failure kind.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::AllocationFailed { .. } => "allocation_failed",
            Self::Overlap { .. } => "overlap",
            Self::ContentMismatch { .. } => "content_mismatch",
            Self::Lifecycle { .. } => "lifecycle",
            Self::WorkerFailed { .. } => "worker_failed",
            Self::WorkerPanicked { .. } => "worker_panicked",
        }
    }
}

/// Failures kept verbatim; later ones are only counted.
pub const MAX_RECORDED_FAILURES: usize = 64;

/// Collects check outcomes without aborting the batch under test.
#[derive(Debug, Clone, Default)]
pub struct FailureLedger {
    checks: u64,
    failed: u64,
    recorded: Vec<Failure>,
}

impl FailureLedger {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one passed check.
    pub fn pass(&mut self) {
        self.checks += 1;
    }

    /// Record `n` passed checks at once.
    pub fn pass_many(&mut self, n: u64) {
        self.checks += n;
    }

    /// Record one failed check.
    pub fn fail(&mut self, failure: Failure) {
        self.checks += 1;
        self.failed += 1;
        if self.recorded.len() < MAX_RECORDED_FAILURES {
            self.recorded.push(failure);
        }
    }

    /// Record `result` as a pass or a failure.
    pub fn check(&mut self, result: Result<(), Failure>) {
        match result {
            Ok(()) => self.pass(),
            Err(failure) => self.fail(failure),
        }
    }

    /// Fold another ledger into this one.
    pub fn absorb(&mut self, other: FailureLedger) {
        self.checks += other.checks;
        self.failed += other.failed;
        let room = MAX_RECORDED_FAILURES.saturating_sub(self.recorded.len());
        self.recorded.extend(other.recorded.into_iter().take(room));
    }

    #[must_use]
    pub fn checks(&self) -> u64 {
        self.checks
    }

    #[must_use]
    pub fn failed(&self) -> u64 {
        self.failed
    }

    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.failed == 0
    }

    #[must_use]
    pub fn recorded(&self) -> &[Failure] {
        &self.recorded
    }

    /// Failures seen but not kept verbatim.
    #[must_use]
    pub fn suppressed(&self) -> u64 {
        self.failed - self.recorded.len() as u64
    }
}

/// Errors of the tooling around the stress engine.
#[derive(Debug, Error)]
pub enum HarnessError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unknown scenario '{0}', expected one of: alloc, threaded, all")]
    UnknownScenario(String),
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error(
        "failed to spawn worker {worker}: {source} ({} earlier worker(s) panicked)",
        .panicked.len()
    )]
    Spawn {
        worker: usize,
        #[source]
        source: std::io::Error,
        /// Panics of workers that were already running when the spawn failed.
        panicked: Vec<Failure>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn site() -> Site {
        Site {
            phase: "uniform".to_string(),
            iteration: 3,
            index: 7,
        }
    }

    #[test]
    fn ledger_counts_and_caps() {
        let mut ledger = FailureLedger::new();
        ledger.pass_many(10);
        for _ in 0..(MAX_RECORDED_FAILURES + 5) {
            ledger.fail(Failure::AllocationFailed {
                site: site(),
                size: 500,
            });
        }
        assert_eq!(ledger.checks(), 10 + MAX_RECORDED_FAILURES as u64 + 5);
        assert_eq!(ledger.failed(), MAX_RECORDED_FAILURES as u64 + 5);
        assert_eq!(ledger.recorded().len(), MAX_RECORDED_FAILURES);
        assert_eq!(ledger.suppressed(), 5);
        assert!(!ledger.is_clean());
    }

    #[test]
    fn absorb_merges_counts() {
        let mut a = FailureLedger::new();
        a.pass();
        let mut b = FailureLedger::new();
        b.check(Err(Failure::WorkerFailed {
            worker: 2,
            failures: 4,
        }));
        b.check(Ok(()));
        a.absorb(b);
        assert_eq!(a.checks(), 3);
        assert_eq!(a.failed(), 1);
        assert_eq!(a.recorded()[0].kind(), "worker_failed");
    }

    #[test]
    fn failure_messages_name_both_ranges() {
        use crate::verify::BlockRecord;
        let failure = Failure::Overlap {
            site: site(),
            violation: OverlapViolation {
                lower_index: 1,
                lower: BlockRecord {
                    addr: 0x1000,
                    size: 0x200,
                },
                upper_index: 4,
                upper: BlockRecord {
                    addr: 0x1100,
                    size: 0x200,
                },
            },
        };
        let msg = failure.to_string();
        assert!(msg.starts_with("uniform[3].7:"), "{msg}");
        assert!(msg.contains("#1 [0x1000, 0x1200)"), "{msg}");
        assert!(msg.contains("#4 [0x1100, 0x1300)"), "{msg}");
    }

    #[test]
    fn lifecycle_failure_carries_source() {
        let failure = Failure::Lifecycle {
            stage: "reinitialize",
            source: MemorySystemError::AlreadyInitialized,
        };
        assert_eq!(
            failure.to_string(),
            "lifecycle step `reinitialize` failed: memory system already initialized"
        );
        assert!(std::error::Error::source(&failure).is_some());
    }
}
