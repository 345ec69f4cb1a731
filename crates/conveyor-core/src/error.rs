use thiserror::Error;

pub type ConveyorResult<T> = Result<T, ConveyorError>;

#[derive(Error, Debug)]
pub enum ConveyorError {
    /// WorkerPool saturated past the acquire timeout. Callers retry later.
    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    /// Executor raised or the per-task timeout elapsed.
    #[error("Task execution failed: {0}")]
    TaskExecutionFailed(String),

    /// Workflow graph validation found a dependency cycle.
    #[error("Cycle detected in workflow graph: {0}")]
    CycleDetected(String),

    /// Cron or trigger expression rejected at registration.
    #[error("Invalid schedule expression: {0}")]
    InvalidSchedule(String),

    /// No active agent matches the distribution criteria.
    #[error("No agent available: {0}")]
    AgentUnavailable(String),

    /// Optimistic write lost the race; caller must re-read and retry.
    #[error("Version conflict on '{key}': expected {expected}, actual {actual}")]
    VersionConflict {
        key: String,
        expected: u64,
        actual: u64,
    },

    /// The OS resource probe failed; treated as throttle, never as healthy.
    #[error("Stale resource sample: {0}")]
    StaleResourceSample(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Task not found: {0}")]
    TaskNotFound(uuid::Uuid),

    #[error("Workflow not found: {0}")]
    WorkflowNotFound(uuid::Uuid),

    #[error("Shutdown in progress")]
    ShuttingDown,

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
