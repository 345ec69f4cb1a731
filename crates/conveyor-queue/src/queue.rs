use chrono::{DateTime, Utc};
use conveyor_core::{Task, TaskStatus};
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

/// A task plus its queue bookkeeping: enqueue sequence for FIFO-within-
/// priority ordering, and the earliest re-admission time after a retry.
#[derive(Debug, Clone)]
pub(crate) struct QueuedTask {
    pub task: Task,
    pub seq: u64,
    pub retry_after: Option<DateTime<Utc>>,
}

/// Priority queue with dependency gating.
///
/// Dequeue order is highest priority first, FIFO within a priority level.
/// A task is admissible only when every dependency has succeeded and any
/// retry backoff has elapsed. All mutation happens behind the processor's
/// single mutex; this type itself is not synchronized.
///
/// Terminal tasks are evicted once persisted and broadcast so the map holds
/// only live work; the succeeded id set is kept for dependency gating.
#[derive(Default)]
pub(crate) struct TaskQueue {
    tasks: HashMap<Uuid, QueuedTask>,
    succeeded: HashSet<Uuid>,
    next_seq: u64,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, task: Task) -> Uuid {
        let id = task.id;
        let seq = self.next_seq;
        self.next_seq += 1;
        self.tasks.insert(
            id,
            QueuedTask {
                task,
                seq,
                retry_after: None,
            },
        );
        id
    }

    /// Whether `id` is live in the queue or already succeeded and evicted.
    /// Used to validate dependency references at submission time.
    pub fn is_known(&self, id: Uuid) -> bool {
        self.tasks.contains_key(&id) || self.succeeded.contains(&id)
    }

    pub fn get(&self, id: Uuid) -> Option<&Task> {
        self.tasks.get(&id).map(|q| &q.task)
    }

    /// Pop the best admissible task and mark it running.
    pub fn pop_ready(&mut self, now: DateTime<Utc>) -> Option<Task> {
        let best = self
            .tasks
            .values()
            .filter(|q| {
                q.task.is_ready(&self.succeeded)
                    && q.retry_after.map_or(true, |due| due <= now)
            })
            .max_by_key(|q| (q.task.priority, std::cmp::Reverse(q.seq)))
            .map(|q| q.task.id)?;

        let queued = self.tasks.get_mut(&best)?;
        queued.task.status = TaskStatus::Running;
        queued.task.started_at = Some(now);
        queued.task.attempt_count += 1;
        queued.retry_after = None;
        Some(queued.task.clone())
    }

    /// Put an admitted task back to pending (worker acquisition failed);
    /// the attempt is not counted.
    pub fn unadmit(&mut self, id: Uuid) {
        if let Some(queued) = self.tasks.get_mut(&id) {
            queued.task.status = TaskStatus::Pending;
            queued.task.started_at = None;
            queued.task.attempt_count = queued.task.attempt_count.saturating_sub(1);
        }
    }

    pub fn record_success(&mut self, id: Uuid, result: serde_json::Value) -> Option<Task> {
        let queued = self.tasks.get_mut(&id)?;
        queued.task.status = TaskStatus::Succeeded;
        queued.task.completed_at = Some(Utc::now());
        queued.task.result = Some(result);
        self.succeeded.insert(id);
        Some(queued.task.clone())
    }

    /// Record a failed attempt. Returns the updated task and whether it was
    /// re-queued for retry (`true`) or is terminally failed (`false`).
    pub fn record_failure(
        &mut self,
        id: Uuid,
        reason: &str,
        retry_after: Option<DateTime<Utc>>,
    ) -> Option<(Task, bool)> {
        let queued = self.tasks.get_mut(&id)?;
        if queued.task.attempt_count < queued.task.max_attempts {
            queued.task.status = TaskStatus::Pending;
            queued.task.started_at = None;
            queued.retry_after = retry_after;
            Some((queued.task.clone(), true))
        } else {
            queued.task.status = TaskStatus::Failed {
                reason: reason.to_string(),
            };
            queued.task.completed_at = Some(Utc::now());
            Some((queued.task.clone(), false))
        }
    }

    pub fn record_cancelled(&mut self, id: Uuid) -> Option<Task> {
        let queued = self.tasks.get_mut(&id)?;
        queued.task.status = TaskStatus::Cancelled;
        queued.task.completed_at = Some(Utc::now());
        Some(queued.task.clone())
    }

    /// Standalone (non-workflow) pending tasks transitively blocked by the
    /// terminal failure or cancellation of `root`. Workflow members are left
    /// to the orchestrator, which owns blocked/partial resolution.
    pub fn blocked_standalone_dependents(&self, root: Uuid) -> Vec<Uuid> {
        let mut blocked = Vec::new();
        let mut frontier = vec![root];
        while let Some(failed) = frontier.pop() {
            for queued in self.tasks.values() {
                if queued.task.status == TaskStatus::Pending
                    && queued.task.workflow_instance.is_none()
                    && queued.task.dependency_ids.contains(&failed)
                    && !blocked.contains(&queued.task.id)
                {
                    blocked.push(queued.task.id);
                    frontier.push(queued.task.id);
                }
            }
        }
        blocked
    }

    pub fn mark_failed(&mut self, id: Uuid, reason: String) -> Option<Task> {
        let queued = self.tasks.get_mut(&id)?;
        queued.task.status = TaskStatus::Failed { reason };
        queued.task.completed_at = Some(Utc::now());
        Some(queued.task.clone())
    }

    /// Earliest retry-backoff deadline among pending tasks, for the
    /// admission loop's sleep computation.
    pub fn earliest_retry(&self) -> Option<DateTime<Utc>> {
        self.tasks
            .values()
            .filter(|q| q.task.status == TaskStatus::Pending)
            .filter_map(|q| q.retry_after)
            .min()
    }

    /// Drop a terminal task from the live map. Callers persist and broadcast
    /// the terminal record first; reads fall through to the store afterwards.
    pub fn evict_terminal(&mut self, id: Uuid) {
        if self
            .tasks
            .get(&id)
            .map_or(false, |q| q.task.status.is_terminal())
        {
            self.tasks.remove(&id);
        }
    }

    pub fn running_ids(&self) -> Vec<Uuid> {
        self.tasks
            .values()
            .filter(|q| q.task.status == TaskStatus::Running)
            .map(|q| q.task.id)
            .collect()
    }
}
