use crate::distributor::WorkDistributor;
use crate::health::AgentHealthMonitor;
use crate::registry::{AgentInfo, AgentRegistry};
use crate::shared_state::SharedStateManager;
use chrono::{DateTime, Utc};
use conveyor_core::{
    ConveyorConfig, ConveyorResult, Task, TaskPayload, TaskPriority, TaskStatus, TaskSubmitter,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

/// One assignment of a task to an agent. `epoch` is the offline epoch of
/// the agent being abandoned (0 for the initial assignment), so repeated
/// health sweeps can tell a fresh outage from one already handled.
#[derive(Debug, Clone)]
pub struct AssignmentRecord {
    pub agent_id: String,
    pub assigned_at: DateTime<Utc>,
    pub epoch: u64,
}

/// A task tracked at the coordination layer, with its current assignment
/// and the full assignment history. At most one current assignment.
#[derive(Debug, Clone)]
pub struct CoordinatedTask {
    pub task: Task,
    pub assigned_agent_id: Option<String>,
    pub subtask_ids: Vec<Uuid>,
    pub attempt_history: Vec<AssignmentRecord>,
}

pub(crate) type TaskBoard = Mutex<HashMap<Uuid, CoordinatedTask>>;

/// Facade over the coordination layer: registry, distribution, health
/// sweeping, and shared state, submitting work through the queue seam.
pub struct AgentCoordinator {
    registry: Arc<AgentRegistry>,
    distributor: Arc<WorkDistributor>,
    shared_state: Arc<SharedStateManager>,
    health: Arc<AgentHealthMonitor>,
    tasks: Arc<TaskBoard>,
    submitter: Arc<dyn TaskSubmitter>,
    local_agent_id: String,
    health_handle: Mutex<Option<JoinHandle<()>>>,
}

impl AgentCoordinator {
    /// Build the coordination layer and register the local agent.
    pub async fn new(
        config: &ConveyorConfig,
        local_agent: AgentInfo,
        submitter: Arc<dyn TaskSubmitter>,
    ) -> Arc<Self> {
        let local_agent_id = local_agent.agent_id.clone();
        let registry = Arc::new(AgentRegistry::new());
        registry.register(local_agent).await;

        let distributor = Arc::new(WorkDistributor::new(
            Arc::clone(&registry),
            config.distribution_strategy,
        ));
        let tasks: Arc<TaskBoard> = Arc::new(Mutex::new(HashMap::new()));
        let health = Arc::new(AgentHealthMonitor::new(
            Arc::clone(&registry),
            Arc::clone(&distributor),
            Arc::clone(&tasks),
            Duration::from_secs(config.heartbeat_timeout_s),
        ));

        Arc::new(Self {
            registry,
            distributor,
            shared_state: Arc::new(SharedStateManager::new()),
            health,
            tasks,
            submitter,
            local_agent_id,
            health_handle: Mutex::new(None),
        })
    }

    /// Start the background health sweep.
    pub async fn start(&self) {
        let mut handle = self.health_handle.lock().await;
        if handle.is_none() {
            *handle = Some(self.health.spawn_sweep_loop());
            info!(agent_id = %self.local_agent_id, "coordinator started");
        }
    }

    /// Route a task to an agent and submit it to the queue.
    pub async fn submit_task(
        &self,
        payload: TaskPayload,
        priority: TaskPriority,
    ) -> ConveyorResult<Uuid> {
        let agent_id = self.distributor.select(&payload.kind).await?;
        let task = Task::new(payload).with_priority(priority);
        let task_id = self.submitter.submit(task.clone()).await?;

        self.tasks.lock().await.insert(
            task_id,
            CoordinatedTask {
                task,
                assigned_agent_id: Some(agent_id.clone()),
                subtask_ids: Vec::new(),
                attempt_history: vec![AssignmentRecord {
                    agent_id: agent_id.clone(),
                    assigned_at: Utc::now(),
                    epoch: 0,
                }],
            },
        );

        if let Some(agent) = self.registry.get(&agent_id).await {
            if let Err(e) = self
                .registry
                .update_workload(&agent_id, agent.workload + 1)
                .await
            {
                warn!(agent_id = %agent_id, error = %e, "workload update failed");
            }
        }
        Ok(task_id)
    }

    pub async fn get_status(&self, task_id: Uuid) -> ConveyorResult<TaskStatus> {
        self.submitter.status(task_id).await
    }

    pub async fn get_coordinated(&self, task_id: Uuid) -> Option<CoordinatedTask> {
        self.tasks.lock().await.get(&task_id).cloned()
    }

    pub fn registry(&self) -> &Arc<AgentRegistry> {
        &self.registry
    }

    pub fn distributor(&self) -> &Arc<WorkDistributor> {
        &self.distributor
    }

    pub fn shared_state(&self) -> &Arc<SharedStateManager> {
        &self.shared_state
    }

    pub fn health(&self) -> &Arc<AgentHealthMonitor> {
        &self.health
    }

    /// Stop the health loop and deregister the local agent.
    pub async fn shutdown(&self) {
        if let Some(handle) = self.health_handle.lock().await.take() {
            handle.abort();
        }
        if let Err(e) = self.registry.deregister(&self.local_agent_id).await {
            warn!(agent_id = %self.local_agent_id, error = %e, "deregistration failed");
        }
        info!(agent_id = %self.local_agent_id, "coordinator shut down");
    }
}
