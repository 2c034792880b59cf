//! Stress-test harness for pluggable memory allocators.
//!
//! This crate provides:
//! - Verification: reference data, byte-exact read-back, overlap sweeps
//! - Bulk scenario: single-threaded allocate / verify / free batches
//! - Threaded scenario: a gated pool of workers sharing one allocator
//! - Structured JSONL logging and machine-readable scenario reports

pub mod batch;
pub mod bulk;
pub mod config;
pub mod failure;
pub mod pool;
pub mod report;
pub mod scenario;
pub mod structured_log;
pub mod threaded;
pub mod verify;
pub mod worker;

pub use config::{BulkConfig, ConcurrentConfig, ScenarioConfig, StatisticsMode};
pub use failure::{Failure, FailureLedger, HarnessError};
pub use report::ScenarioReport;
pub use scenario::Scenario;
