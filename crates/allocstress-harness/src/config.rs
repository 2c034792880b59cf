//! Scenario configuration.
//!
//! Defaults reproduce the full-strength workloads. `scaled` divides loop
//! counts for smoke runs without changing batch shapes.
//!
//! Statistics capture is controlled by the `ALLOCSTRESS_STATISTICS`
//! environment variable (`on` / `off`, default `off`) unless a caller sets
//! [`StatisticsMode`] explicitly.

use serde::Serialize;

use crate::verify::OverlapPolicy;

/// Environment variable that enables statistics capture.
pub const STATISTICS_ENV: &str = "ALLOCSTRESS_STATISTICS";

/// Whether allocator statistics snapshots are captured and logged.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StatisticsMode {
    #[default]
    Off,
    On,
}

impl StatisticsMode {
    /// Parse from string (case-insensitive); unknown values mean `Off`.
    #[must_use]
    pub fn from_str_loose(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "on" | "1" | "true" | "yes" | "detailed" => Self::On,
            _ => Self::Off,
        }
    }

    /// Resolve from [`STATISTICS_ENV`].
    #[must_use]
    pub fn from_env() -> Self {
        std::env::var(STATISTICS_ENV)
            .map(|v| Self::from_str_loose(&v))
            .unwrap_or_default()
    }

    #[must_use]
    pub const fn enabled(self) -> bool {
        matches!(self, Self::On)
    }
}

/// How block sizes are chosen within a batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum SizePlan {
    /// Every block has the same size.
    Fixed { size: usize },
    /// Block `i` gets `sizes[i % len] + i`, so sizes grow across the batch.
    GrowingCycle { sizes: Vec<usize> },
}

impl SizePlan {
    /// Size of block `index` in the batch.
    #[must_use]
    pub fn size_at(&self, index: usize) -> usize {
        match self {
            Self::Fixed { size } => *size,
            Self::GrowingCycle { sizes } => sizes[index % sizes.len()] + index,
        }
    }

    /// Largest size this plan yields in a batch of `blocks`.
    #[must_use]
    pub fn max_size(&self, blocks: usize) -> usize {
        (0..blocks).map(|i| self.size_at(i)).max().unwrap_or(0)
    }
}

/// One allocate-batch / verify-batch / free-batch phase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PhaseConfig {
    pub name: String,
    pub iterations: u64,
    pub blocks: usize,
    pub sizes: SizePlan,
    pub overlap: OverlapPolicy,
}

/// Preset sizes of the growing-size phase.
pub const BULK_VARYING_SIZES: [usize; 7] = [473, 39, 195, 24, 73, 376, 245];

/// Configuration of the bulk single-thread scenario.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BulkConfig {
    /// Run the initialize / thread_finalize / finalize / initialize probe first.
    pub lifecycle_probe: bool,
    pub phases: Vec<PhaseConfig>,
}

impl Default for BulkConfig {
    fn default() -> Self {
        Self {
            lifecycle_probe: true,
            phases: vec![
                PhaseConfig {
                    name: "uniform".to_string(),
                    iterations: 64,
                    blocks: 8142,
                    sizes: SizePlan::Fixed { size: 500 },
                    overlap: OverlapPolicy::Margin,
                },
                PhaseConfig {
                    name: "varying".to_string(),
                    iterations: 64,
                    blocks: 1024,
                    sizes: SizePlan::GrowingCycle {
                        sizes: BULK_VARYING_SIZES.to_vec(),
                    },
                    overlap: OverlapPolicy::DistinctOnly,
                },
                PhaseConfig {
                    name: "uniform_small".to_string(),
                    iterations: 128,
                    blocks: 1024,
                    sizes: SizePlan::Fixed { size: 500 },
                    overlap: OverlapPolicy::Margin,
                },
            ],
        }
    }
}

impl BulkConfig {
    /// Divide every phase's iteration count by `divisor` (at least one iteration).
    #[must_use]
    pub fn scaled(mut self, divisor: u64) -> Self {
        let divisor = divisor.max(1);
        for phase in &mut self.phases {
            phase.iterations = (phase.iterations / divisor).max(1);
        }
        self
    }

    /// Size of the reference buffer needed to fill the largest block.
    #[must_use]
    pub fn reference_len(&self) -> usize {
        self.phases
            .iter()
            .map(|p| p.sizes.max_size(p.blocks))
            .max()
            .unwrap_or(0)
    }
}

/// Sizes the concurrent workers draw from.
pub const WORKER_SIZES: [usize; 7] = [19, 249, 797, 3, 79, 34, 389];

/// Configuration of the concurrent multi-thread scenario.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConcurrentConfig {
    pub loops: u64,
    pub passes: usize,
    pub sizes: Vec<usize>,
    /// Size sets for the synchronous warm-up passes, run in order.
    pub warmup_sizes: Vec<Vec<usize>>,
    pub min_threads: usize,
    pub max_threads: usize,
    /// Fixed worker count; `None` derives it from hardware parallelism.
    pub threads: Option<usize>,
    /// Upper bound of the per-worker startup jitter, in milliseconds.
    pub max_jitter_ms: u64,
    pub statistics: StatisticsMode,
}

/// Maximum live blocks per worker pass.
pub const MAX_PASSES: usize = 4096;

/// Maximum number of candidate sizes per worker.
pub const MAX_SIZES: usize = 32;

impl Default for ConcurrentConfig {
    fn default() -> Self {
        Self {
            loops: 100_000,
            passes: 1024,
            sizes: WORKER_SIZES.to_vec(),
            warmup_sizes: vec![WORKER_SIZES.to_vec(), vec![500; WORKER_SIZES.len()]],
            min_threads: 3,
            max_threads: 32,
            threads: None,
            max_jitter_ms: 10,
            statistics: StatisticsMode::from_env(),
        }
    }
}

impl ConcurrentConfig {
    /// Divide the loop count by `divisor` (at least one loop).
    #[must_use]
    pub fn scaled(mut self, divisor: u64) -> Self {
        self.loops = (self.loops / divisor.max(1)).max(1);
        self
    }

    /// Worker count for a machine with `hardware_threads` hardware threads.
    ///
    /// An explicit `threads` replaces the hardware-derived count but is
    /// still held to `[min_threads, max_threads]`.
    #[must_use]
    pub fn resolve_workers(&self, hardware_threads: usize) -> usize {
        match self.threads {
            Some(threads) => threads.clamp(self.min_threads, self.max_threads),
            None => worker_count(hardware_threads, self.min_threads, self.max_threads),
        }
    }
}

/// Configuration of every scenario.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ScenarioConfig {
    pub bulk: BulkConfig,
    pub concurrent: ConcurrentConfig,
}

impl ScenarioConfig {
    #[must_use]
    pub fn scaled(self, divisor: u64) -> Self {
        Self {
            bulk: self.bulk.scaled(divisor),
            concurrent: self.concurrent.scaled(divisor),
        }
    }
}

/// `hardware_threads + 1`, clamped to `[min, max]`.
#[must_use]
pub fn worker_count(hardware_threads: usize, min: usize, max: usize) -> usize {
    hardware_threads.saturating_add(1).clamp(min, max)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_statistics_modes() {
        assert_eq!(StatisticsMode::from_str_loose("on"), StatisticsMode::On);
        assert_eq!(StatisticsMode::from_str_loose("ON"), StatisticsMode::On);
        assert_eq!(StatisticsMode::from_str_loose(" true "), StatisticsMode::On);
        assert_eq!(StatisticsMode::from_str_loose("detailed"), StatisticsMode::On);
        assert_eq!(StatisticsMode::from_str_loose("off"), StatisticsMode::Off);
        assert_eq!(StatisticsMode::from_str_loose("bogus"), StatisticsMode::Off);
        assert_eq!(StatisticsMode::default(), StatisticsMode::Off);
    }

    #[test]
    fn worker_count_clamps() {
        assert_eq!(worker_count(0, 3, 32), 3);
        assert_eq!(worker_count(1, 3, 32), 3);
        assert_eq!(worker_count(2, 3, 32), 3);
        assert_eq!(worker_count(3, 3, 32), 4);
        assert_eq!(worker_count(15, 3, 32), 16);
        assert_eq!(worker_count(31, 3, 32), 32);
        assert_eq!(worker_count(128, 3, 32), 32);
        assert_eq!(worker_count(usize::MAX, 3, 32), 32);
    }

    #[test]
    fn explicit_thread_count_wins() {
        let config = ConcurrentConfig {
            threads: Some(5),
            ..ConcurrentConfig::default()
        };
        assert_eq!(config.resolve_workers(64), 5);
    }

    #[test]
    fn explicit_thread_count_is_clamped() {
        let with = |threads| ConcurrentConfig {
            threads: Some(threads),
            ..ConcurrentConfig::default()
        };
        assert_eq!(with(0).resolve_workers(64), 3);
        assert_eq!(with(1).resolve_workers(64), 3);
        assert_eq!(with(32).resolve_workers(1), 32);
        assert_eq!(with(500).resolve_workers(1), 32);
    }

    #[test]
    fn default_bulk_phases() {
        let config = BulkConfig::default();
        let shape: Vec<_> = config
            .phases
            .iter()
            .map(|p| (p.name.as_str(), p.iterations, p.blocks, p.overlap))
            .collect();
        assert_eq!(
            shape,
            vec![
                ("uniform", 64, 8142, OverlapPolicy::Margin),
                ("varying", 64, 1024, OverlapPolicy::DistinctOnly),
                ("uniform_small", 128, 1024, OverlapPolicy::Margin),
            ]
        );
    }

    #[test]
    fn growing_cycle_sizes() {
        let plan = SizePlan::GrowingCycle {
            sizes: BULK_VARYING_SIZES.to_vec(),
        };
        assert_eq!(plan.size_at(0), 473);
        assert_eq!(plan.size_at(1), 40);
        assert_eq!(plan.size_at(7), 480);
        assert_eq!(plan.size_at(1023), BULK_VARYING_SIZES[1023 % 7] + 1023);
        assert_eq!(plan.max_size(1024), 473 + 1022);
    }

    #[test]
    fn reference_len_covers_largest_block() {
        assert_eq!(BulkConfig::default().reference_len(), 1495);
    }

    #[test]
    fn scaled_keeps_at_least_one_iteration() {
        let bulk = BulkConfig::default().scaled(1000);
        assert!(bulk.phases.iter().all(|p| p.iterations == 1));
        assert_eq!(bulk.phases[0].blocks, 8142);

        let concurrent = ConcurrentConfig::default().scaled(1000);
        assert_eq!(concurrent.loops, 100);
        assert_eq!(ConcurrentConfig::default().scaled(0).loops, 100_000);
    }
}
