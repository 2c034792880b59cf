//! CLI entrypoint for the allocstress harness.

use std::path::PathBuf;

use allocstress_core::HeapMemorySystem;
use allocstress_harness::structured_log::{LogEmitter, LogLevel, validate_log_file};
use allocstress_harness::{Scenario, ScenarioConfig, StatisticsMode};
use clap::{Parser, Subcommand, ValueEnum};

const LOG_SUITE: &str = "allocstress";

/// Stress-test tooling for memory allocators.
#[derive(Debug, Parser)]
#[command(name = "allocstress-harness")]
#[command(about = "Allocator correctness and stress-test harness")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum StatisticsArg {
    On,
    Off,
}

impl From<StatisticsArg> for StatisticsMode {
    fn from(arg: StatisticsArg) -> Self {
        match arg {
            StatisticsArg::On => Self::On,
            StatisticsArg::Off => Self::Off,
        }
    }
}

#[derive(Debug, Subcommand)]
enum Command {
    /// List the available scenarios.
    List,
    /// Run one scenario, or all of them, against the heap memory system.
    Run {
        /// Scenario name (`alloc`, `threaded`) or `all`.
        #[arg(long, default_value = "all")]
        scenario: String,
        /// Divide loop and iteration counts by this factor.
        #[arg(long, default_value_t = 1)]
        scale: u64,
        /// Worker count for the threaded scenario, clamped to [3, 32].
        #[arg(long)]
        threads: Option<usize>,
        /// Capture allocator statistics; defaults to ALLOCSTRESS_STATISTICS.
        #[arg(long, value_enum)]
        statistics: Option<StatisticsArg>,
        /// Structured JSONL log path (if omitted, logs to stderr).
        #[arg(long)]
        log: Option<PathBuf>,
        /// Output JSON report path (if omitted, prints to stdout).
        #[arg(long)]
        report: Option<PathBuf>,
    },
    /// Validate a structured JSONL log file.
    ValidateLog {
        /// Structured JSONL log path.
        #[arg(long)]
        log: PathBuf,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    match cli.command {
        Command::List => {
            for scenario in Scenario::all() {
                println!("{:<10} {}", scenario.name(), scenario.description());
            }
        }
        Command::Run {
            scenario,
            scale,
            threads,
            statistics,
            log,
            report,
        } => {
            let scenarios = Scenario::select(&scenario)?;
            let mut config = ScenarioConfig::default().scaled(scale);
            if threads.is_some() {
                config.concurrent.threads = threads;
            }
            if let Some(mode) = statistics {
                config.concurrent.statistics = mode.into();
            }

            let run_id = format!("run-{}", std::process::id());
            let mut emitter = match &log {
                Some(path) => LogEmitter::to_file(path, LOG_SUITE, &run_id)?,
                None => LogEmitter::to_stderr(LOG_SUITE, &run_id),
            };

            emitter.emit(LogLevel::Info, "run.start")?;
            let mut reports = Vec::with_capacity(scenarios.len());
            for scenario in scenarios {
                let system = HeapMemorySystem::new();
                let result = scenario.run(&system, &config, &mut emitter)?;
                eprintln!(
                    "{}: {} (checks={}, failed={}, {} ms)",
                    result.scenario,
                    if result.passed() { "PASS" } else { "FAIL" },
                    result.checks,
                    result.failed,
                    result.duration_ms
                );
                reports.push(result);
            }
            let verdict = if reports.iter().all(|r| r.passed()) {
                LogLevel::Info
            } else {
                LogLevel::Error
            };
            emitter.emit(verdict, "run.finish")?;
            emitter.flush()?;

            let json = serde_json::to_string_pretty(&reports)?;
            match report {
                Some(path) => {
                    std::fs::write(&path, json)?;
                    eprintln!("Wrote report to {}", path.display());
                }
                None => println!("{json}"),
            }

            let failed: Vec<_> = reports
                .iter()
                .filter(|r| !r.passed())
                .map(|r| r.scenario.as_str())
                .collect();
            if !failed.is_empty() {
                return Err(format!("Scenario(s) failed: {}", failed.join(", ")).into());
            }
        }
        Command::ValidateLog { log } => {
            let (lines, errors) = validate_log_file(&log)?;
            for error in &errors {
                eprintln!("{error}");
            }
            eprintln!(
                "Validated {lines} line(s) in {}: {} error(s)",
                log.display(),
                errors.len()
            );
            if !errors.is_empty() {
                return Err("Structured log validation failed".into());
            }
        }
    }

    Ok(())
}
