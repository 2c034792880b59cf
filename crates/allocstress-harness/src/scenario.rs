//! Named scenario registry.

use allocstress_core::MemorySystem;

use crate::bulk;
use crate::config::ScenarioConfig;
use crate::failure::HarnessError;
use crate::report::ScenarioReport;
use crate::structured_log::LogEmitter;
use crate::threaded;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scenario {
    /// Single-threaded bulk allocate / verify / free batches.
    Bulk,
    /// Worker threads sharing one memory system.
    Threaded,
}

impl Scenario {
    #[must_use]
    pub const fn all() -> [Self; 2] {
        [Self::Bulk, Self::Threaded]
    }

    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Bulk => bulk::SCENARIO_NAME,
            Self::Threaded => threaded::SCENARIO_NAME,
        }
    }

    #[must_use]
    pub const fn description(self) -> &'static str {
        match self {
            Self::Bulk => "bulk single-thread stress: lifecycle probe and three batch phases",
            Self::Threaded => "concurrent multi-thread stress: warm-ups and a worker pool",
        }
    }

    pub fn from_name(name: &str) -> Result<Self, HarnessError> {
        Self::all()
            .into_iter()
            .find(|s| s.name().eq_ignore_ascii_case(name.trim()))
            .ok_or_else(|| HarnessError::UnknownScenario(name.to_string()))
    }

    /// Resolve a scenario name, or `all` for every scenario.
    pub fn select(name: &str) -> Result<Vec<Self>, HarnessError> {
        if name.trim().eq_ignore_ascii_case("all") {
            return Ok(Self::all().to_vec());
        }
        Self::from_name(name).map(|s| vec![s])
    }

    pub fn run(
        self,
        system: &dyn MemorySystem,
        config: &ScenarioConfig,
        emitter: &mut LogEmitter,
    ) -> Result<ScenarioReport, HarnessError> {
        match self {
            Self::Bulk => bulk::run_bulk(system, &config.bulk, emitter),
            Self::Threaded => threaded::run_threaded(system, &config.concurrent, emitter),
        }
    }
}

impl std::fmt::Display for Scenario {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}
