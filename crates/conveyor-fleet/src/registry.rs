use chrono::{DateTime, Utc};
use conveyor_core::{ConveyorError, ConveyorResult, MemoryRecordStore, RecordStore};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Active,
    Idle,
    Busy,
    Offline,
}

/// A registered agent process and its advertised capacity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentInfo {
    pub agent_id: String,
    /// Task kinds this agent can run; used by capability-match distribution.
    pub capabilities: Vec<String>,
    pub workload: u32,
    pub capacity: u32,
    pub status: AgentStatus,
    pub last_heartbeat: DateTime<Utc>,
    /// Incremented on each transition to Offline. Assignment records carry
    /// the epoch so a reassignment happens once per outage, not once per sweep.
    pub offline_epoch: u64,
}

impl AgentInfo {
    pub fn new(agent_id: impl Into<String>, capabilities: Vec<String>, capacity: u32) -> Self {
        Self {
            agent_id: agent_id.into(),
            capabilities,
            workload: 0,
            capacity,
            status: AgentStatus::Idle,
            last_heartbeat: Utc::now(),
            offline_epoch: 0,
        }
    }
}

/// Membership and liveness bookkeeping for the agent fleet.
pub struct AgentRegistry {
    agents: RwLock<HashMap<String, AgentInfo>>,
    store: Arc<dyn RecordStore<AgentInfo>>,
}

impl Default for AgentRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::with_store(Arc::new(MemoryRecordStore::new()))
    }

    /// Like [`new`](Self::new) with a durable agent-record store; every
    /// membership or status change is written through, and
    /// [`restore`](Self::restore) reloads records after a restart.
    pub fn with_store(store: Arc<dyn RecordStore<AgentInfo>>) -> Self {
        Self {
            agents: RwLock::new(HashMap::new()),
            store,
        }
    }

    /// Reload persisted agent records. Their liveness is re-proven by the
    /// next heartbeat or sweep, not assumed.
    pub async fn restore(&self) -> ConveyorResult<usize> {
        let records = self.store.load_all().await?;
        let count = records.len();
        let mut agents = self.agents.write().await;
        for record in records {
            agents.insert(record.agent_id.clone(), record);
        }
        info!(count, "agent records restored");
        Ok(count)
    }

    pub async fn register(&self, info: AgentInfo) {
        info!(agent_id = %info.agent_id, capacity = info.capacity, "agent registered");
        self.persist(&info).await;
        self.agents.write().await.insert(info.agent_id.clone(), info);
    }

    pub async fn deregister(&self, agent_id: &str) -> ConveyorResult<()> {
        self.agents
            .write()
            .await
            .remove(agent_id)
            .map(|_| info!(agent_id, "agent deregistered"))
            .ok_or_else(|| ConveyorError::AgentUnavailable(format!("unknown agent '{agent_id}'")))?;
        self.store.remove(agent_id).await
    }

    /// Refresh an agent's liveness timestamp. A heartbeat from an Offline
    /// agent revives it.
    pub async fn heartbeat(&self, agent_id: &str) -> ConveyorResult<()> {
        let snapshot = {
            let mut agents = self.agents.write().await;
            let agent = agents.get_mut(agent_id).ok_or_else(|| {
                ConveyorError::AgentUnavailable(format!("unknown agent '{agent_id}'"))
            })?;
            agent.last_heartbeat = Utc::now();
            if agent.status == AgentStatus::Offline {
                info!(agent_id, "offline agent revived by heartbeat");
                agent.status = if agent.workload == 0 {
                    AgentStatus::Idle
                } else {
                    AgentStatus::Active
                };
            }
            agent.clone()
        };
        self.persist(&snapshot).await;
        Ok(())
    }

    /// Record the agent's current workload and derive its status from it.
    /// Offline agents stay Offline until a heartbeat revives them.
    pub async fn update_workload(&self, agent_id: &str, workload: u32) -> ConveyorResult<()> {
        let snapshot = {
            let mut agents = self.agents.write().await;
            let agent = agents.get_mut(agent_id).ok_or_else(|| {
                ConveyorError::AgentUnavailable(format!("unknown agent '{agent_id}'"))
            })?;
            agent.workload = workload;
            if agent.status != AgentStatus::Offline {
                agent.status = if workload == 0 {
                    AgentStatus::Idle
                } else if workload >= agent.capacity {
                    AgentStatus::Busy
                } else {
                    AgentStatus::Active
                };
            }
            debug!(agent_id, workload, status = ?agent.status, "agent workload updated");
            agent.clone()
        };
        self.persist(&snapshot).await;
        Ok(())
    }

    /// Transition an agent to Offline, bumping its epoch. Returns the new
    /// epoch, or `None` if the agent is unknown or already Offline.
    pub async fn mark_offline(&self, agent_id: &str) -> Option<u64> {
        let snapshot = {
            let mut agents = self.agents.write().await;
            let agent = agents.get_mut(agent_id)?;
            if agent.status == AgentStatus::Offline {
                return None;
            }
            agent.status = AgentStatus::Offline;
            agent.offline_epoch += 1;
            warn!(agent_id, epoch = agent.offline_epoch, "agent marked offline");
            agent.clone()
        };
        let epoch = snapshot.offline_epoch;
        self.persist(&snapshot).await;
        Some(epoch)
    }

    async fn persist(&self, agent: &AgentInfo) {
        if let Err(e) = self.store.put(&agent.agent_id, agent).await {
            warn!(agent_id = %agent.agent_id, error = %e, "failed to persist agent record");
        }
    }

    pub async fn get(&self, agent_id: &str) -> Option<AgentInfo> {
        self.agents.read().await.get(agent_id).cloned()
    }

    /// All agents that can take work. Offline agents never appear here.
    pub async fn list_active(&self) -> Vec<AgentInfo> {
        let mut active: Vec<AgentInfo> = self
            .agents
            .read()
            .await
            .values()
            .filter(|a| a.status != AgentStatus::Offline)
            .cloned()
            .collect();
        // Deterministic order for distribution strategies.
        active.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
        active
    }

    pub async fn list_all(&self) -> Vec<AgentInfo> {
        self.agents.read().await.values().cloned().collect()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_heartbeat_revives_offline_agent() {
        let registry = AgentRegistry::new();
        registry.register(AgentInfo::new("a1", vec![], 4)).await;

        assert_eq!(registry.mark_offline("a1").await, Some(1));
        assert!(registry.list_active().await.is_empty());

        registry.heartbeat("a1").await.unwrap();
        let agent = registry.get("a1").await.unwrap();
        assert_eq!(agent.status, AgentStatus::Idle);
        assert_eq!(agent.offline_epoch, 1);
        assert_eq!(registry.list_active().await.len(), 1);
    }

    #[tokio::test]
    async fn test_mark_offline_is_single_shot_per_outage() {
        let registry = AgentRegistry::new();
        registry.register(AgentInfo::new("a1", vec![], 4)).await;

        assert_eq!(registry.mark_offline("a1").await, Some(1));
        // Already offline: no new epoch.
        assert_eq!(registry.mark_offline("a1").await, None);

        registry.heartbeat("a1").await.unwrap();
        assert_eq!(registry.mark_offline("a1").await, Some(2));
    }

    #[tokio::test]
    async fn test_workload_drives_status() {
        let registry = AgentRegistry::new();
        registry.register(AgentInfo::new("a1", vec![], 2)).await;

        registry.update_workload("a1", 1).await.unwrap();
        assert_eq!(registry.get("a1").await.unwrap().status, AgentStatus::Active);
        registry.update_workload("a1", 2).await.unwrap();
        assert_eq!(registry.get("a1").await.unwrap().status, AgentStatus::Busy);
        registry.update_workload("a1", 0).await.unwrap();
        assert_eq!(registry.get("a1").await.unwrap().status, AgentStatus::Idle);
    }

    #[tokio::test]
    async fn test_unknown_agent_operations_error() {
        let registry = AgentRegistry::new();
        assert!(registry.heartbeat("ghost").await.is_err());
        assert!(registry.deregister("ghost").await.is_err());
        assert!(registry.update_workload("ghost", 1).await.is_err());
    }

    #[tokio::test]
    async fn test_agent_records_survive_restart() {
        let store: Arc<MemoryRecordStore<AgentInfo>> = Arc::new(MemoryRecordStore::new());
        let registry = AgentRegistry::with_store(store.clone());
        registry.register(AgentInfo::new("a1", vec!["scrape".into()], 4)).await;
        registry.update_workload("a1", 2).await.unwrap();
        registry.mark_offline("a1").await.unwrap();

        // Written through on every mutation.
        let record = store.get("a1").await.unwrap().unwrap();
        assert_eq!(record.status, AgentStatus::Offline);
        assert_eq!(record.offline_epoch, 1);
        assert_eq!(record.workload, 2);

        // Fresh registry against the same store, as after a restart.
        let revived = AgentRegistry::with_store(store.clone());
        assert_eq!(revived.restore().await.unwrap(), 1);
        let agent = revived.get("a1").await.unwrap();
        assert_eq!(agent.capabilities, vec!["scrape".to_string()]);
        assert_eq!(agent.offline_epoch, 1);

        revived.deregister("a1").await.unwrap();
        assert!(store.get("a1").await.unwrap().is_none());
    }
}
