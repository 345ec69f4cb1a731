//! Multi-step orchestration on top of the task queue.
//!
//! [`WorkflowDefinition`] is a validated DAG of named task nodes;
//! [`WorkflowOrchestrator`] runs instances of it, gating each node on its
//! edges and resolving the run to completed, partial, or failed.
//! [`BatchTaskProcessor`] is the degenerate fan-out case: one template
//! applied to N items.

mod batch;
mod graph;
mod orchestrator;

pub use batch::{BatchRecord, BatchResult, BatchTaskProcessor};
pub use graph::{Edge, EdgeKind, NodeTemplate, WorkflowDefinition};
pub use orchestrator::{
    ExecutionPolicy, InstanceStatus, NodeRun, NodeRunStatus, WorkflowInstance,
    WorkflowInstanceRecord, WorkflowOrchestrator,
};
