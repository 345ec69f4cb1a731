//! Shared types for the Conveyor execution core: the task model, error
//! taxonomy, configuration, and the durable-store and submission seams.
//!
//! # Main types
//!
//! - [`Task`] / [`TaskPayload`] / [`TaskStatus`] / [`TaskPriority`]: the unit of work.
//! - [`ConveyorError`] / [`ConveyorResult`]: error taxonomy for the whole core.
//! - [`ConveyorConfig`]: construction-time options.
//! - [`TaskStore`]: narrow repository interface (memory and file backends included).
//! - [`TaskSubmitter`]: seam the coordination layer uses to reach the queue.

/// Construction-time configuration.
pub mod config;
/// Error taxonomy.
pub mod error;
/// Durable store traits and backends.
pub mod store;
/// Queue submission seam.
pub mod submit;
/// Task model.
pub mod task;

pub use config::{ConveyorConfig, DistributionStrategy};
pub use error::{ConveyorError, ConveyorResult};
pub use store::{
    FileRecordStore, FileTaskStore, MemoryRecordStore, MemoryTaskStore, RecordStore, TaskStore,
};
pub use submit::TaskSubmitter;
pub use task::{Task, TaskOutcome, TaskPayload, TaskPriority, TaskStatus};
