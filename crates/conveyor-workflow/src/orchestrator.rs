use crate::graph::{EdgeKind, WorkflowDefinition};
use chrono::{DateTime, Utc};
use conveyor_core::{
    ConveyorError, ConveyorResult, MemoryRecordStore, RecordStore, Task, TaskOutcome, TaskStatus,
    TaskSubmitter,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// How an instance walks its ready-set.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionPolicy {
    /// Submit every ready node at once; pool capacity is the throttle.
    Parallel,
    /// One node in flight at a time, in topological order.
    Sequential,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    Running,
    /// Every node succeeded.
    Completed,
    /// Some nodes succeeded, some terminally failed or were cancelled.
    Partial,
    /// Terminal with no node succeeding.
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeRunStatus {
    Pending,
    Submitted,
    Succeeded,
    Failed,
    /// Never ran: an upstream success requirement can no longer be met.
    Cancelled,
}

impl NodeRunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }
}

/// Per-node execution state within one instance.
#[derive(Debug, Clone)]
pub struct NodeRun {
    pub status: NodeRunStatus,
    pub task_id: Option<Uuid>,
    pub result: Option<serde_json::Value>,
    pub failure: Option<String>,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl NodeRun {
    fn pending() -> Self {
        Self {
            status: NodeRunStatus::Pending,
            task_id: None,
            result: None,
            failure: None,
            resolved_at: None,
        }
    }
}

/// One run of a workflow definition. Snapshot-cloneable for inspection.
#[derive(Debug, Clone)]
pub struct WorkflowInstance {
    pub id: Uuid,
    pub definition: WorkflowDefinition,
    pub policy: ExecutionPolicy,
    pub status: InstanceStatus,
    pub nodes: HashMap<String, NodeRun>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    order: Vec<String>,
    task_to_node: HashMap<Uuid, String>,
}

impl WorkflowInstance {
    /// Results of succeeded nodes, keyed by node key.
    pub fn results(&self) -> HashMap<String, serde_json::Value> {
        self.nodes
            .iter()
            .filter(|(_, run)| run.status == NodeRunStatus::Succeeded)
            .filter_map(|(key, run)| run.result.clone().map(|r| (key.clone(), r)))
            .collect()
    }

    pub fn node_status(&self, key: &str) -> Option<NodeRunStatus> {
        self.nodes.get(key).map(|run| run.status)
    }

    fn record(&self) -> WorkflowInstanceRecord {
        WorkflowInstanceRecord {
            id: self.id,
            definition_id: self.definition.id,
            status: self.status,
            started_at: self.started_at,
            completed_at: self.completed_at,
        }
    }
}

/// Durable snapshot of an instance, written at start and on resolution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowInstanceRecord {
    pub id: Uuid,
    pub definition_id: Uuid,
    pub status: InstanceStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Drives workflow instances: submits nodes as their edges allow, consumes
/// the processor's outcome broadcast, and resolves each instance to
/// Completed, Partial, or Failed.
pub struct WorkflowOrchestrator {
    definitions: RwLock<HashMap<Uuid, WorkflowDefinition>>,
    instances: Mutex<HashMap<Uuid, WorkflowInstance>>,
    submitter: Arc<dyn TaskSubmitter>,
    store: Arc<dyn RecordStore<WorkflowInstanceRecord>>,
}

impl WorkflowOrchestrator {
    pub fn new(submitter: Arc<dyn TaskSubmitter>) -> Arc<Self> {
        Self::with_store(submitter, Arc::new(MemoryRecordStore::new()))
    }

    /// Like [`new`](Self::new) with a durable instance-snapshot store; every
    /// instance is recorded at start and again when it resolves.
    pub fn with_store(
        submitter: Arc<dyn TaskSubmitter>,
        store: Arc<dyn RecordStore<WorkflowInstanceRecord>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            definitions: RwLock::new(HashMap::new()),
            instances: Mutex::new(HashMap::new()),
            submitter,
            store,
        })
    }

    /// Validate and store a definition. Cyclic graphs never get this far.
    pub async fn register(&self, definition: WorkflowDefinition) -> ConveyorResult<Uuid> {
        definition.validate()?;
        let id = definition.id;
        self.definitions.write().await.insert(id, definition);
        debug!(definition_id = %id, "workflow definition registered");
        Ok(id)
    }

    /// Start an instance. `inputs` (a JSON object) is merged into every
    /// node's params; the definition is copied so later edits cannot touch
    /// this run.
    pub async fn start(
        self: &Arc<Self>,
        definition_id: Uuid,
        inputs: serde_json::Value,
        policy: ExecutionPolicy,
    ) -> ConveyorResult<Uuid> {
        let mut definition = self
            .definitions
            .read()
            .await
            .get(&definition_id)
            .cloned()
            .ok_or(ConveyorError::WorkflowNotFound(definition_id))?;
        let order = definition.validate()?;

        if let serde_json::Value::Object(extra) = &inputs {
            for node in &mut definition.nodes {
                if let serde_json::Value::Object(params) = &mut node.payload.params {
                    for (k, v) in extra {
                        params.insert(k.clone(), v.clone());
                    }
                } else if node.payload.params.is_null() {
                    node.payload.params = inputs.clone();
                }
            }
        }

        let instance = WorkflowInstance {
            id: Uuid::new_v4(),
            nodes: definition
                .nodes
                .iter()
                .map(|n| (n.key.clone(), NodeRun::pending()))
                .collect(),
            definition,
            policy,
            status: InstanceStatus::Running,
            started_at: Utc::now(),
            completed_at: None,
            order,
            task_to_node: HashMap::new(),
        };
        let instance_id = instance.id;
        let record = instance.record();
        self.store.put(&instance_id.to_string(), &record).await?;
        self.instances.lock().await.insert(instance_id, instance);
        info!(instance_id = %instance_id, definition_id = %definition_id, "workflow instance started");

        self.advance(instance_id).await;
        Ok(instance_id)
    }

    pub async fn get_instance(&self, id: Uuid) -> ConveyorResult<WorkflowInstance> {
        self.instances
            .lock()
            .await
            .get(&id)
            .cloned()
            .ok_or(ConveyorError::WorkflowNotFound(id))
    }

    /// Consume terminal task outcomes from the queue processor.
    pub fn spawn_outcome_listener(
        self: &Arc<Self>,
        mut outcomes: broadcast::Receiver<TaskOutcome>,
    ) -> JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                match outcomes.recv().await {
                    Ok(outcome) => {
                        let Some(instance_id) = outcome.workflow_instance else {
                            continue;
                        };
                        this.apply_outcome(instance_id, outcome).await;
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        // Dropped outcomes may include terminal ones; re-query
                        // in-flight nodes so no instance is stranded Running.
                        warn!(skipped, "workflow outcome listener lagged, resynchronizing");
                        this.resync().await;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    /// Re-query the status of every submitted node in every running
    /// instance and apply any terminal result found. Recovery path for
    /// missed outcome broadcasts; results dropped with the broadcast are
    /// not recoverable through the status seam.
    pub async fn resync(self: &Arc<Self>) {
        let submitted: Vec<(Uuid, Uuid)> = {
            let instances = self.instances.lock().await;
            instances
                .values()
                .filter(|instance| instance.status == InstanceStatus::Running)
                .flat_map(|instance| {
                    instance
                        .nodes
                        .values()
                        .filter(|run| run.status == NodeRunStatus::Submitted)
                        .filter_map(|run| run.task_id.map(|task_id| (instance.id, task_id)))
                        .collect::<Vec<_>>()
                })
                .collect()
        };

        for (instance_id, task_id) in submitted {
            match self.submitter.status(task_id).await {
                Ok(status) if status.is_terminal() => {
                    self.apply_outcome(
                        instance_id,
                        TaskOutcome {
                            task_id,
                            status,
                            workflow_instance: Some(instance_id),
                            result: None,
                        },
                    )
                    .await;
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(task_id = %task_id, error = %e, "status query failed during resync");
                }
            }
        }
    }

    async fn apply_outcome(self: &Arc<Self>, instance_id: Uuid, outcome: TaskOutcome) {
        {
            let mut instances = self.instances.lock().await;
            let Some(instance) = instances.get_mut(&instance_id) else {
                return;
            };
            let Some(key) = instance.task_to_node.get(&outcome.task_id).cloned() else {
                return;
            };
            let Some(run) = instance.nodes.get_mut(&key) else {
                return;
            };
            match outcome.status {
                TaskStatus::Succeeded => {
                    run.status = NodeRunStatus::Succeeded;
                    run.result = outcome.result;
                }
                TaskStatus::Failed { reason } => {
                    run.status = NodeRunStatus::Failed;
                    run.failure = Some(reason);
                }
                TaskStatus::Cancelled => {
                    run.status = NodeRunStatus::Cancelled;
                }
                // Only terminal outcomes are broadcast.
                TaskStatus::Pending | TaskStatus::Running => return,
            }
            run.resolved_at = Some(Utc::now());
            debug!(instance_id = %instance_id, node = %key, status = ?run.status, "workflow node resolved");
        }
        self.advance(instance_id).await;
    }

    /// Move the instance forward: cancel unreachable nodes, submit newly
    /// ready ones, arm timers for time edges, resolve if nothing remains.
    async fn advance(self: &Arc<Self>, instance_id: Uuid) {
        loop {
            let (to_submit, next_due) = {
                let mut instances = self.instances.lock().await;
                let Some(instance) = instances.get_mut(&instance_id) else {
                    return;
                };
                if instance.status != InstanceStatus::Running {
                    return;
                }

                propagate_cancellations(instance);

                let now = Utc::now();
                let (ready, next_due) = ready_nodes(instance, now);
                let selected = select_for_policy(instance, ready);

                let mut to_submit = Vec::with_capacity(selected.len());
                for key in selected {
                    let Some(template) = instance.definition.node(&key).cloned() else {
                        continue;
                    };
                    let task = Task::new(template.payload)
                        .with_priority(template.priority)
                        .with_max_attempts(template.max_attempts)
                        .in_workflow(instance_id);
                    if let Some(run) = instance.nodes.get_mut(&key) {
                        run.status = NodeRunStatus::Submitted;
                        run.task_id = Some(task.id);
                    }
                    instance.task_to_node.insert(task.id, key.clone());
                    to_submit.push((key, task));
                }

                if to_submit.is_empty() && next_due.is_none() {
                    let record = resolve_if_done(instance).then(|| instance.record());
                    drop(instances);
                    if let Some(record) = record {
                        if let Err(e) = self.store.put(&record.id.to_string(), &record).await {
                            warn!(instance_id = %record.id, error = %e, "failed to persist instance resolution");
                        }
                    }
                    return;
                }
                (to_submit, next_due)
            };

            if let Some(due) = next_due {
                self.arm_timer(instance_id, due);
            }
            if to_submit.is_empty() {
                return;
            }

            let mut submit_failed = false;
            for (key, task) in to_submit {
                let task_id = task.id;
                if let Err(e) = self.submitter.submit(task).await {
                    warn!(instance_id = %instance_id, node = %key, error = %e, "workflow node submission failed");
                    let mut instances = self.instances.lock().await;
                    if let Some(instance) = instances.get_mut(&instance_id) {
                        if let Some(run) = instance.nodes.get_mut(&key) {
                            run.status = NodeRunStatus::Failed;
                            run.failure = Some(e.to_string());
                            run.resolved_at = Some(Utc::now());
                        }
                        instance.task_to_node.remove(&task_id);
                    }
                    submit_failed = true;
                } else {
                    debug!(instance_id = %instance_id, node = %key, "workflow node submitted");
                }
            }
            // A failed submission may cancel downstream nodes or finish the
            // instance; re-evaluate. Otherwise outcomes drive the next step.
            if !submit_failed {
                return;
            }
        }
    }

    /// Wake the instance when a time edge comes due.
    fn arm_timer(self: &Arc<Self>, instance_id: Uuid, due: DateTime<Utc>) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let wait = (due - Utc::now()).to_std().unwrap_or_default();
            tokio::time::sleep(wait).await;
            this.advance(instance_id).await;
        });
    }
}

/// Cancel pending nodes whose success requirements can no longer be met,
/// transitively. They never run and are never silently dropped.
fn propagate_cancellations(instance: &mut WorkflowInstance) {
    loop {
        let mut doomed = Vec::new();
        for (key, run) in &instance.nodes {
            if run.status != NodeRunStatus::Pending {
                continue;
            }
            let unreachable = instance.definition.incoming(key).any(|edge| {
                edge.kind == EdgeKind::RequiresSuccess
                    && matches!(
                        instance.nodes.get(&edge.from).map(|r| r.status),
                        Some(NodeRunStatus::Failed) | Some(NodeRunStatus::Cancelled)
                    )
            });
            if unreachable {
                doomed.push(key.clone());
            }
        }
        if doomed.is_empty() {
            return;
        }
        for key in doomed {
            if let Some(run) = instance.nodes.get_mut(&key) {
                run.status = NodeRunStatus::Cancelled;
                run.resolved_at = Some(Utc::now());
            }
            debug!(instance_id = %instance.id, node = %key, "workflow node cancelled, upstream requirement unmet");
        }
    }
}

/// Pending nodes whose edges are all satisfied now, plus the earliest
/// future instant at which a time-gated node could become ready.
fn ready_nodes(
    instance: &WorkflowInstance,
    now: DateTime<Utc>,
) -> (Vec<String>, Option<DateTime<Utc>>) {
    let mut ready = Vec::new();
    let mut next_due: Option<DateTime<Utc>> = None;
    let mut note_due = |due: DateTime<Utc>, next: &mut Option<DateTime<Utc>>| {
        *next = Some(next.map_or(due, |cur| cur.min(due)));
    };

    'nodes: for (key, run) in &instance.nodes {
        if run.status != NodeRunStatus::Pending {
            continue;
        }
        for edge in instance.definition.incoming(key) {
            let Some(parent) = instance.nodes.get(&edge.from) else {
                continue 'nodes;
            };
            match edge.kind {
                EdgeKind::RequiresSuccess => {
                    if parent.status != NodeRunStatus::Succeeded {
                        continue 'nodes;
                    }
                }
                EdgeKind::RequiresCompletion => {
                    if !parent.status.is_terminal() {
                        continue 'nodes;
                    }
                }
                EdgeKind::AfterDelay(secs) => {
                    if !parent.status.is_terminal() {
                        continue 'nodes;
                    }
                    let Some(resolved_at) = parent.resolved_at else {
                        continue 'nodes;
                    };
                    let due = resolved_at + chrono::Duration::seconds(secs as i64);
                    if now < due {
                        note_due(due, &mut next_due);
                        continue 'nodes;
                    }
                }
                EdgeKind::AfterTime(at) => {
                    if !parent.status.is_terminal() {
                        continue 'nodes;
                    }
                    if now < at {
                        note_due(at, &mut next_due);
                        continue 'nodes;
                    }
                }
            }
        }
        ready.push(key.clone());
    }
    (ready, next_due)
}

/// Apply the execution policy to the ready set.
fn select_for_policy(instance: &WorkflowInstance, ready: Vec<String>) -> Vec<String> {
    match instance.policy {
        ExecutionPolicy::Parallel => ready,
        ExecutionPolicy::Sequential => {
            let in_flight = instance
                .nodes
                .values()
                .any(|run| run.status == NodeRunStatus::Submitted);
            if in_flight {
                return Vec::new();
            }
            instance
                .order
                .iter()
                .find(|key| ready.contains(*key))
                .cloned()
                .into_iter()
                .collect()
        }
    }
}

/// If every node is terminal, settle the instance status. Returns whether
/// the instance resolved on this call.
fn resolve_if_done(instance: &mut WorkflowInstance) -> bool {
    let all_terminal = instance
        .nodes
        .values()
        .all(|run| run.status.is_terminal());
    if !all_terminal {
        return false;
    }
    let succeeded = instance
        .nodes
        .values()
        .filter(|run| run.status == NodeRunStatus::Succeeded)
        .count();
    instance.status = if succeeded == instance.nodes.len() {
        InstanceStatus::Completed
    } else if succeeded > 0 {
        InstanceStatus::Partial
    } else {
        InstanceStatus::Failed
    };
    instance.completed_at = Some(Utc::now());
    info!(instance_id = %instance.id, status = ?instance.status, "workflow instance resolved");
    true
}
