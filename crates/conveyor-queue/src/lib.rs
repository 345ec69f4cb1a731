//! Durable task queue and scheduling.
//!
//! [`TaskQueueProcessor`] admits prioritized, dependency-gated tasks onto a
//! bounded worker pool, with retry backoff, per-task timeouts, and
//! cancellation. [`TaskScheduler`] fires cron, one-time, event, and
//! on-demand definitions into the processor.

mod executor;
mod processor;
mod queue;
mod scheduler;

pub use executor::TaskExecutor;
pub use processor::{ProcessorOptions, RetryPolicy, TaskQueueProcessor};
pub use scheduler::{
    FireRecord, ScheduledTaskDefinition, TaskScheduler, TaskTemplate, Trigger,
};
