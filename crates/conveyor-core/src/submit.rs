use crate::error::ConveyorResult;
use crate::task::{Task, TaskStatus};
use async_trait::async_trait;
use uuid::Uuid;

/// Seam between the coordination layer and the local execution queue.
///
/// Implemented by the queue processor; lets the fleet facade route work to
/// the local agent without depending on the queue crate.
#[async_trait]
pub trait TaskSubmitter: Send + Sync {
    /// Enqueue a pre-built task. Returns its id.
    async fn submit(&self, task: Task) -> ConveyorResult<Uuid>;

    /// Current status of a previously submitted task.
    async fn status(&self, id: Uuid) -> ConveyorResult<TaskStatus>;

    /// Cancel a task: pending tasks are removed, running tasks are aborted
    /// best-effort.
    async fn cancel(&self, id: Uuid) -> ConveyorResult<()>;
}
