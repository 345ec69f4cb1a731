use crate::error::{ConveyorError, ConveyorResult};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// How the work distributor picks an agent for a coordinated task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DistributionStrategy {
    RoundRobin,
    #[default]
    LeastBusy,
    LoadBalanced,
    CapabilityMatch,
}

/// Construction-time options recognized across the execution core.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConveyorConfig {
    /// Upper bound on worker handles, before resource-based reduction.
    pub max_workers: usize,
    /// Fraction of host capacity kept free when sizing the pool (0.0..1.0).
    pub worker_headroom_pct: f64,
    /// Seconds without a heartbeat before an agent is marked offline.
    pub heartbeat_timeout_s: u64,
    /// Agent-selection strategy for coordinated tasks.
    pub distribution_strategy: DistributionStrategy,
    /// Default retry budget for failing tasks.
    pub max_retry_attempts: u32,
    /// Base delay for exponential retry backoff, in seconds.
    pub retry_backoff_base_s: f64,
    /// Hard per-task execution timeout, in seconds.
    pub task_timeout_s: u64,
    /// Resource usage (pct) above which new admissions pause.
    pub throttle_threshold_pct: f64,
    /// Resource usage (pct) above which everything is rejected.
    pub emergency_threshold_pct: f64,
}

impl Default for ConveyorConfig {
    fn default() -> Self {
        Self {
            max_workers: 4,
            worker_headroom_pct: 0.30,
            heartbeat_timeout_s: 30,
            distribution_strategy: DistributionStrategy::LeastBusy,
            max_retry_attempts: 3,
            retry_backoff_base_s: 1.0,
            task_timeout_s: 300,
            throttle_threshold_pct: 75.0,
            emergency_threshold_pct: 90.0,
        }
    }
}

impl ConveyorConfig {
    /// Load configuration from a TOML file, falling back to defaults for
    /// any omitted field.
    pub fn from_toml_file(path: &Path) -> ConveyorResult<Self> {
        let raw = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&raw)
            .map_err(|e| ConveyorError::Config(format!("failed to parse {}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> ConveyorResult<()> {
        if self.max_workers == 0 {
            return Err(ConveyorError::Config("max_workers must be at least 1".into()));
        }
        if !(0.0..1.0).contains(&self.worker_headroom_pct) {
            return Err(ConveyorError::Config(
                "worker_headroom_pct must be in [0.0, 1.0)".into(),
            ));
        }
        if self.throttle_threshold_pct >= self.emergency_threshold_pct {
            return Err(ConveyorError::Config(
                "throttle threshold must be below emergency threshold".into(),
            ));
        }
        Ok(())
    }
}
