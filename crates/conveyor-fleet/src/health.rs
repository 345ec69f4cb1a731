use crate::coordinator::{AssignmentRecord, TaskBoard};
use crate::distributor::WorkDistributor;
use crate::registry::{AgentRegistry, AgentStatus};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Detects dead agents by heartbeat age and reassigns their in-flight work.
///
/// Reassignment is idempotent per outage: once a task is moved off an
/// offline agent it no longer points at it, so the next sweep finds nothing
/// to do unless the agent went down again (a new offline epoch).
pub struct AgentHealthMonitor {
    registry: Arc<AgentRegistry>,
    distributor: Arc<WorkDistributor>,
    tasks: Arc<TaskBoard>,
    heartbeat_timeout: Duration,
}

impl AgentHealthMonitor {
    pub fn new(
        registry: Arc<AgentRegistry>,
        distributor: Arc<WorkDistributor>,
        tasks: Arc<TaskBoard>,
        heartbeat_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            distributor,
            tasks,
            heartbeat_timeout,
        }
    }

    /// One pass: mark stale agents Offline, then find every non-terminal
    /// task that is unassigned or assigned to an offline agent and route it
    /// to a live one. Returns the number of tasks reassigned.
    pub async fn sweep(&self, now: DateTime<Utc>) -> usize {
        let max_age = chrono::Duration::from_std(self.heartbeat_timeout)
            .unwrap_or_else(|_| chrono::Duration::seconds(30));

        for agent in self.registry.list_all().await {
            if agent.status != AgentStatus::Offline
                && now.signed_duration_since(agent.last_heartbeat) > max_age
            {
                self.registry.mark_offline(&agent.agent_id).await;
            }
        }

        let offline_epochs: HashMap<String, u64> = self
            .registry
            .list_all()
            .await
            .into_iter()
            .filter(|a| a.status == AgentStatus::Offline)
            .map(|a| (a.agent_id, a.offline_epoch))
            .collect();

        let mut reassigned = 0;
        let mut board = self.tasks.lock().await;
        for coordinated in board.values_mut() {
            if coordinated.task.status.is_terminal() {
                continue;
            }
            let orphaned_from = match &coordinated.assigned_agent_id {
                None => None,
                Some(agent_id) if offline_epochs.contains_key(agent_id) => {
                    Some(agent_id.clone())
                }
                Some(_) => continue,
            };

            match self.distributor.select(&coordinated.task.payload.kind).await {
                Ok(new_agent) => {
                    let epoch = orphaned_from
                        .as_deref()
                        .and_then(|a| offline_epochs.get(a).copied())
                        .unwrap_or(0);
                    info!(
                        task_id = %coordinated.task.id,
                        from = orphaned_from.as_deref().unwrap_or("<unassigned>"),
                        to = %new_agent,
                        "task reassigned"
                    );
                    coordinated.assigned_agent_id = Some(new_agent.clone());
                    coordinated.attempt_history.push(AssignmentRecord {
                        agent_id: new_agent,
                        assigned_at: now,
                        epoch,
                    });
                    reassigned += 1;
                }
                Err(e) => {
                    // Left unassigned; the next sweep retries.
                    warn!(task_id = %coordinated.task.id, error = %e, "no agent available for reassignment");
                    coordinated.assigned_agent_id = None;
                }
            }
        }
        reassigned
    }

    /// Run [`sweep`](Self::sweep) at half the heartbeat timeout.
    pub fn spawn_sweep_loop(self: &Arc<Self>) -> JoinHandle<()> {
        let monitor = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(monitor.heartbeat_timeout / 2);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                monitor.sweep(Utc::now()).await;
            }
        })
    }
}
