//! Resource admission control for the execution core.
//!
//! # Main types
//!
//! - [`ResourceMonitor`]: samples host memory/CPU, computes a safe worker
//!   ceiling, signals the three-tier admission policy.
//! - [`WorkerPool`]: bounded pool of expensive worker handles with
//!   timed acquire, lazy and eager health checks, recycle, and resize.

/// Host resource sampling and admission tiers.
pub mod monitor;
/// Bounded worker handle pool.
pub mod pool;

pub use monitor::{
    ResourceMonitor, ResourcePressure, ResourceProbe, ResourceSample, ResourceThresholds,
    SysinfoProbe,
};
pub use pool::{PooledWorker, WorkerFactory, WorkerPool};
