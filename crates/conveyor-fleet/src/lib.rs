//! Multi-agent coordination: membership, work distribution, health-driven
//! reassignment, and optimistically versioned shared state, fronted by
//! [`AgentCoordinator`].

mod coordinator;
mod distributor;
mod health;
mod registry;
mod shared_state;

pub use coordinator::{AgentCoordinator, AssignmentRecord, CoordinatedTask};
pub use distributor::WorkDistributor;
pub use health::AgentHealthMonitor;
pub use registry::{AgentInfo, AgentRegistry, AgentStatus};
pub use shared_state::{SharedStateEntry, SharedStateManager};
