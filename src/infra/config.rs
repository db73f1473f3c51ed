// src/infra/config.rs — Engine configuration (TOML)

use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub session: SessionConfig,

    #[serde(default)]
    pub eval: EvalConfig,

    #[serde(default)]
    pub bash: BashConfig,

    #[serde(default)]
    pub policy: PolicyConfig,

    #[serde(default)]
    pub snapshots: SnapshotConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Hard bound on iterations; the driving agent may `finish` earlier.
    pub max_iterations: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self { max_iterations: 25 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvalConfig {
    /// Maximum eval cases in flight at once.
    pub concurrency: usize,
    /// Per-case wall-clock limit.
    pub timeout_secs: u64,
}

impl Default for EvalConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            timeout_secs: 600,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BashConfig {
    pub timeout_secs: u64,
}

impl Default for BashConfig {
    fn default() -> Self {
        Self { timeout_secs: 120 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyConfig {
    /// Pass-rate drop (percentage points) below the best recorded suite
    /// result that counts as a regression. Evals are non-deterministic, so
    /// this is a policy parameter rather than a fixed rule.
    pub regression_threshold_pct: f64,
    /// Consecutive failing iterations after which an eval becomes a
    /// known-limitation candidate.
    pub limitation_candidate_after: u32,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            regression_threshold_pct: 5.0,
            limitation_candidate_after: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotConfig {
    /// How many iteration snapshots to retain. The baseline (iteration 0)
    /// snapshot is never evicted.
    pub retention: usize,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self { retention: 5 }
    }
}

impl EngineConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&raw)?)
    }
}
