use chrono::{DateTime, Utc};
use conveyor_core::{ConveyorError, ConveyorResult};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use sysinfo::System;
use tokio::sync::{Mutex, RwLock};
use tracing::warn;

/// One reading of host memory and CPU usage, as percentages of capacity.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ResourceSample {
    pub mem_used_pct: f64,
    pub cpu_used_pct: f64,
    pub taken_at: DateTime<Utc>,
}

impl ResourceSample {
    /// The binding resource: whichever of memory or CPU is more loaded.
    pub fn peak_pct(&self) -> f64 {
        self.mem_used_pct.max(self.cpu_used_pct)
    }
}

/// Three-tier admission policy derived from resource usage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourcePressure {
    /// Admit freely.
    Normal,
    /// Pause new admissions.
    Throttle,
    /// Reject everything and surface an alert.
    Emergency,
}

/// Thresholds driving [`ResourcePressure`] and pool sizing.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ResourceThresholds {
    /// Fraction of capacity kept free when sizing workers (0.0..1.0).
    pub headroom_pct: f64,
    /// Usage pct at which new admissions pause.
    pub throttle_pct: f64,
    /// Usage pct at which everything is rejected.
    pub emergency_pct: f64,
}

impl Default for ResourceThresholds {
    fn default() -> Self {
        Self {
            headroom_pct: 0.30,
            throttle_pct: 75.0,
            emergency_pct: 90.0,
        }
    }
}

impl ResourceThresholds {
    pub fn validate(&self) -> ConveyorResult<()> {
        if self.throttle_pct >= self.emergency_pct {
            return Err(ConveyorError::Config(
                "throttle_pct must be below emergency_pct".into(),
            ));
        }
        if !(0.0..1.0).contains(&self.headroom_pct) {
            return Err(ConveyorError::Config(
                "headroom_pct must be in [0.0, 1.0)".into(),
            ));
        }
        Ok(())
    }
}

/// Source of host resource readings. Swappable so tests can inject
/// synthetic samples.
pub trait ResourceProbe: Send + Sync {
    fn sample(&mut self) -> ConveyorResult<ResourceSample>;
}

/// Probe backed by the `sysinfo` crate.
pub struct SysinfoProbe {
    system: System,
}

impl SysinfoProbe {
    pub fn new() -> Self {
        Self {
            system: System::new(),
        }
    }
}

impl Default for SysinfoProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceProbe for SysinfoProbe {
    fn sample(&mut self) -> ConveyorResult<ResourceSample> {
        self.system.refresh_memory();
        self.system.refresh_cpu_usage();

        let total = self.system.total_memory();
        if total == 0 {
            return Err(ConveyorError::StaleResourceSample(
                "sysinfo reported zero total memory".into(),
            ));
        }
        let mem_used_pct = self.system.used_memory() as f64 / total as f64 * 100.0;
        let cpu_used_pct = f64::from(self.system.global_cpu_usage());

        Ok(ResourceSample {
            mem_used_pct,
            cpu_used_pct,
            taken_at: Utc::now(),
        })
    }
}

/// Samples host memory/CPU, computes a safe worker ceiling, and signals
/// throttling. A failed probe never reports healthy: pressure degrades to
/// [`ResourcePressure::Throttle`] on error or stale data.
pub struct ResourceMonitor {
    probe: Mutex<Box<dyn ResourceProbe>>,
    thresholds: ResourceThresholds,
    last_sample: RwLock<Option<ResourceSample>>,
    stale_after: Duration,
}

impl ResourceMonitor {
    pub fn new(probe: Box<dyn ResourceProbe>, thresholds: ResourceThresholds) -> ConveyorResult<Self> {
        thresholds.validate()?;
        Ok(Self {
            probe: Mutex::new(probe),
            thresholds,
            last_sample: RwLock::new(None),
            stale_after: Duration::from_secs(30),
        })
    }

    /// Monitor backed by the real host via `sysinfo`.
    pub fn with_sysinfo(thresholds: ResourceThresholds) -> ConveyorResult<Self> {
        Self::new(Box::new(SysinfoProbe::new()), thresholds)
    }

    pub fn with_stale_after(mut self, stale_after: Duration) -> Self {
        self.stale_after = stale_after;
        self
    }

    /// Take a fresh sample. On probe failure the error propagates and the
    /// cached sample is left untouched.
    pub async fn sample(&self) -> ConveyorResult<ResourceSample> {
        let result = self.probe.lock().await.sample();
        match result {
            Ok(sample) => {
                *self.last_sample.write().await = Some(sample);
                Ok(sample)
            }
            Err(e) => {
                warn!(error = %e, "resource probe failed");
                Err(e)
            }
        }
    }

    /// Number of workers that fit under the headroom target, given an
    /// estimated per-worker cost in percentage points of host capacity.
    ///
    /// Monotonically non-increasing as measured usage increases.
    pub async fn safe_worker_count(&self, per_worker_cost_pct: f64) -> usize {
        if per_worker_cost_pct <= 0.0 {
            return 0;
        }
        let usage = match self.sample().await {
            Ok(s) => s.peak_pct(),
            // No reading: size for zero new workers rather than guessing.
            Err(_) => return 0,
        };
        let ceiling = (1.0 - self.thresholds.headroom_pct) * 100.0;
        let available = ceiling - usage;
        if available <= 0.0 {
            return 0;
        }
        (available / per_worker_cost_pct).floor() as usize
    }

    /// Current admission tier. A probe error or a stale cached sample is
    /// treated conservatively as [`ResourcePressure::Throttle`].
    pub async fn pressure(&self) -> ResourcePressure {
        let sample = match self.sample().await {
            Ok(s) => s,
            Err(_) => match *self.last_sample.read().await {
                Some(cached)
                    if Utc::now().signed_duration_since(cached.taken_at).to_std().ok()
                        .is_some_and(|age| age < self.stale_after) =>
                {
                    cached
                }
                _ => return ResourcePressure::Throttle,
            },
        };

        let peak = sample.peak_pct();
        if peak >= self.thresholds.emergency_pct {
            ResourcePressure::Emergency
        } else if peak >= self.thresholds.throttle_pct {
            ResourcePressure::Throttle
        } else {
            ResourcePressure::Normal
        }
    }

    /// True when new admissions should pause (throttle or emergency tier).
    pub async fn should_throttle(&self) -> bool {
        self.pressure().await != ResourcePressure::Normal
    }
}
