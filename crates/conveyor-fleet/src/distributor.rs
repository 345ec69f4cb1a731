use crate::registry::{AgentInfo, AgentRegistry};
use conveyor_core::{ConveyorError, ConveyorResult, DistributionStrategy};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

/// Picks an agent for each unit of work.
///
/// The strategy is chosen per task kind when an override exists, falling
/// back to the configured default.
pub struct WorkDistributor {
    registry: Arc<AgentRegistry>,
    default_strategy: DistributionStrategy,
    overrides: RwLock<HashMap<String, DistributionStrategy>>,
    rr_cursor: AtomicUsize,
}

impl WorkDistributor {
    pub fn new(registry: Arc<AgentRegistry>, default_strategy: DistributionStrategy) -> Self {
        Self {
            registry,
            default_strategy,
            overrides: RwLock::new(HashMap::new()),
            rr_cursor: AtomicUsize::new(0),
        }
    }

    /// Route all tasks of `kind` with a specific strategy.
    pub async fn set_override(&self, kind: impl Into<String>, strategy: DistributionStrategy) {
        self.overrides.write().await.insert(kind.into(), strategy);
    }

    pub async fn strategy_for(&self, kind: &str) -> DistributionStrategy {
        self.overrides
            .read()
            .await
            .get(kind)
            .copied()
            .unwrap_or(self.default_strategy)
    }

    /// Select an agent for a task of the given kind.
    pub async fn select(&self, task_kind: &str) -> ConveyorResult<String> {
        let active = self.registry.list_active().await;
        if active.is_empty() {
            return Err(ConveyorError::AgentUnavailable(
                "no active agents registered".into(),
            ));
        }

        let strategy = self.strategy_for(task_kind).await;
        let chosen = match strategy {
            DistributionStrategy::RoundRobin => {
                let cursor = self.rr_cursor.fetch_add(1, Ordering::Relaxed);
                active[cursor % active.len()].agent_id.clone()
            }
            DistributionStrategy::LeastBusy => least_busy(&active)
                .ok_or_else(|| ConveyorError::AgentUnavailable("no active agents".into()))?,
            DistributionStrategy::LoadBalanced => active
                .iter()
                .min_by(|a, b| {
                    utilization(a)
                        .partial_cmp(&utilization(b))
                        .unwrap_or(std::cmp::Ordering::Equal)
                })
                .map(|a| a.agent_id.clone())
                .ok_or_else(|| ConveyorError::AgentUnavailable("no active agents".into()))?,
            DistributionStrategy::CapabilityMatch => {
                let capable: Vec<AgentInfo> = active
                    .into_iter()
                    .filter(|a| a.capabilities.iter().any(|c| c == task_kind))
                    .collect();
                least_busy(&capable).ok_or_else(|| {
                    ConveyorError::AgentUnavailable(format!(
                        "no active agent is capable of '{task_kind}'"
                    ))
                })?
            }
        };
        debug!(task_kind, ?strategy, agent_id = %chosen, "work routed");
        Ok(chosen)
    }
}

fn least_busy(agents: &[AgentInfo]) -> Option<String> {
    agents
        .iter()
        .min_by_key(|a| a.workload)
        .map(|a| a.agent_id.clone())
}

/// Fraction of capacity in use; zero-capacity agents count as saturated.
fn utilization(agent: &AgentInfo) -> f64 {
    if agent.capacity == 0 {
        return f64::INFINITY;
    }
    f64::from(agent.workload) / f64::from(agent.capacity)
}
