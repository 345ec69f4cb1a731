use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use uuid::Uuid;

/// Priority of a task in the execution queue. Higher variants are dequeued first.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum TaskPriority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

/// Status of a task in the execution queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Succeeded,
    Failed { reason: String },
    Cancelled,
}

impl TaskStatus {
    /// A terminal status admits no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Succeeded | TaskStatus::Failed { .. } | TaskStatus::Cancelled
        )
    }
}

/// The unit of work handed to the external executor.
///
/// `kind` is the task-type tag used for routing and capability matching;
/// `params` is an opaque action descriptor the core never interprets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskPayload {
    pub kind: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

impl TaskPayload {
    pub fn new(kind: impl Into<String>, params: serde_json::Value) -> Self {
        Self {
            kind: kind.into(),
            params,
        }
    }
}

/// A unit of work owned by the queue processor once enqueued.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub payload: TaskPayload,
    pub priority: TaskPriority,
    pub status: TaskStatus,
    pub attempt_count: u32,
    pub max_attempts: u32,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Task ids that must reach a terminal success state before admission.
    #[serde(default)]
    pub dependency_ids: Vec<Uuid>,
    /// Workflow instance this task belongs to, if any.
    #[serde(default)]
    pub workflow_instance: Option<Uuid>,
    /// Result value captured from the executor on success.
    #[serde(default)]
    pub result: Option<serde_json::Value>,
}

impl Task {
    pub fn new(payload: TaskPayload) -> Self {
        Self {
            id: Uuid::new_v4(),
            payload,
            priority: TaskPriority::Normal,
            status: TaskStatus::Pending,
            attempt_count: 0,
            max_attempts: 3,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            dependency_ids: Vec::new(),
            workflow_instance: None,
            result: None,
        }
    }

    pub fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_dependencies(mut self, deps: Vec<Uuid>) -> Self {
        self.dependency_ids = deps;
        self
    }

    pub fn with_max_attempts(mut self, max: u32) -> Self {
        self.max_attempts = max;
        self
    }

    pub fn in_workflow(mut self, instance_id: Uuid) -> Self {
        self.workflow_instance = Some(instance_id);
        self
    }

    /// A task is ready when it is pending and every dependency has succeeded.
    pub fn is_ready(&self, succeeded_ids: &HashSet<Uuid>) -> bool {
        self.status == TaskStatus::Pending
            && self
                .dependency_ids
                .iter()
                .all(|dep| succeeded_ids.contains(dep))
    }
}

/// Terminal outcome record broadcast by the queue processor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskOutcome {
    pub task_id: Uuid,
    pub status: TaskStatus,
    pub workflow_instance: Option<Uuid>,
    pub result: Option<serde_json::Value>,
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_task_creation_defaults() {
        let task = Task::new(TaskPayload::new("navigate", serde_json::json!({"url": "x"})));
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.priority, TaskPriority::Normal);
        assert_eq!(task.attempt_count, 0);
        assert!(task.dependency_ids.is_empty());
    }

    #[test]
    fn test_priority_ordering() {
        assert!(TaskPriority::Critical > TaskPriority::High);
        assert!(TaskPriority::High > TaskPriority::Normal);
        assert!(TaskPriority::Normal > TaskPriority::Low);
    }

    #[test]
    fn test_is_ready_no_deps() {
        let task = Task::new(TaskPayload::new("click", serde_json::Value::Null));
        assert!(task.is_ready(&HashSet::new()));
    }

    #[test]
    fn test_is_ready_with_deps() {
        let dep = Uuid::new_v4();
        let task =
            Task::new(TaskPayload::new("extract", serde_json::Value::Null))
                .with_dependencies(vec![dep]);
        assert!(!task.is_ready(&HashSet::new()));
        assert!(task.is_ready(&HashSet::from([dep])));
    }

    #[test]
    fn test_not_ready_when_running() {
        let mut task = Task::new(TaskPayload::new("fill", serde_json::Value::Null));
        task.status = TaskStatus::Running;
        assert!(!task.is_ready(&HashSet::new()));
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(TaskStatus::Succeeded.is_terminal());
        assert!(TaskStatus::Failed {
            reason: "boom".into()
        }
        .is_terminal());
        assert!(TaskStatus::Cancelled.is_terminal());
        assert!(!TaskStatus::Pending.is_terminal());
        assert!(!TaskStatus::Running.is_terminal());
    }

    #[test]
    fn test_status_serialization_round_trip() {
        let status = TaskStatus::Failed {
            reason: "timeout".to_string(),
        };
        let json = serde_json::to_string(&status).unwrap();
        assert!(json.contains("timeout"));
        let parsed: TaskStatus = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, status);
    }
}
