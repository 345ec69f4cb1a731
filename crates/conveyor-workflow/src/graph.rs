use chrono::{DateTime, Utc};
use conveyor_core::{ConveyorError, ConveyorResult, TaskPayload, TaskPriority};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use uuid::Uuid;

/// How an edge gates its downstream node.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeKind {
    /// Downstream runs only if the upstream node succeeded.
    RequiresSuccess,
    /// Downstream runs once the upstream node is terminal, whatever the outcome.
    RequiresCompletion,
    /// Downstream waits this many seconds after the upstream node resolves.
    AfterDelay(u64),
    /// Downstream waits for an absolute instant (and upstream completion).
    AfterTime(DateTime<Utc>),
}

/// A node in a workflow definition: the task it materializes, keyed by name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeTemplate {
    pub key: String,
    pub payload: TaskPayload,
    #[serde(default)]
    pub priority: TaskPriority,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

fn default_max_attempts() -> u32 {
    3
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Edge {
    pub from: String,
    pub to: String,
    pub kind: EdgeKind,
}

/// An immutable DAG of named task nodes. Instances copy the definition at
/// start, so later edits never affect runs in flight.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub id: Uuid,
    pub name: String,
    pub version: u32,
    pub nodes: Vec<NodeTemplate>,
    pub edges: Vec<Edge>,
}

impl WorkflowDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            version: 1,
            nodes: Vec::new(),
            edges: Vec::new(),
        }
    }

    pub fn with_node(mut self, key: impl Into<String>, payload: TaskPayload) -> Self {
        self.nodes.push(NodeTemplate {
            key: key.into(),
            payload,
            priority: TaskPriority::Normal,
            max_attempts: default_max_attempts(),
        });
        self
    }

    pub fn with_edge(
        mut self,
        from: impl Into<String>,
        to: impl Into<String>,
        kind: EdgeKind,
    ) -> Self {
        self.edges.push(Edge {
            from: from.into(),
            to: to.into(),
            kind,
        });
        self
    }

    pub fn node(&self, key: &str) -> Option<&NodeTemplate> {
        self.nodes.iter().find(|n| n.key == key)
    }

    /// Edges pointing at `key`.
    pub fn incoming<'a>(&'a self, key: &'a str) -> impl Iterator<Item = &'a Edge> {
        self.edges.iter().filter(move |e| e.to == key)
    }

    /// Edges leaving `key`.
    pub fn outgoing<'a>(&'a self, key: &'a str) -> impl Iterator<Item = &'a Edge> {
        self.edges.iter().filter(move |e| e.from == key)
    }

    /// Validate the graph and return a topological order of node keys.
    ///
    /// Rejects duplicate or unknown node keys and any cycle, so a bad graph
    /// never reaches execution.
    pub fn validate(&self) -> ConveyorResult<Vec<String>> {
        let mut keys = HashSet::new();
        for node in &self.nodes {
            if !keys.insert(node.key.as_str()) {
                return Err(ConveyorError::CycleDetected(format!(
                    "workflow '{}': duplicate node key '{}'",
                    self.name, node.key
                )));
            }
        }
        for edge in &self.edges {
            for end in [&edge.from, &edge.to] {
                if !keys.contains(end.as_str()) {
                    return Err(ConveyorError::CycleDetected(format!(
                        "workflow '{}': edge references unknown node '{end}'",
                        self.name
                    )));
                }
            }
            if edge.from == edge.to {
                return Err(ConveyorError::CycleDetected(format!(
                    "workflow '{}': node '{}' depends on itself",
                    self.name, edge.from
                )));
            }
        }

        // Kahn's algorithm: whatever is left at the end sits on a cycle.
        let mut in_degree: HashMap<&str, usize> =
            self.nodes.iter().map(|n| (n.key.as_str(), 0)).collect();
        for edge in &self.edges {
            if let Some(d) = in_degree.get_mut(edge.to.as_str()) {
                *d += 1;
            }
        }
        let mut ready: VecDeque<&str> = self
            .nodes
            .iter()
            .filter(|n| in_degree[n.key.as_str()] == 0)
            .map(|n| n.key.as_str())
            .collect();
        let mut order = Vec::with_capacity(self.nodes.len());
        while let Some(key) = ready.pop_front() {
            order.push(key.to_string());
            for edge in self.outgoing(key) {
                if let Some(d) = in_degree.get_mut(edge.to.as_str()) {
                    *d -= 1;
                    if *d == 0 {
                        ready.push_back(edge.to.as_str());
                    }
                }
            }
        }

        if order.len() != self.nodes.len() {
            let stuck: Vec<&str> = in_degree
                .iter()
                .filter(|(_, d)| **d > 0)
                .map(|(k, _)| *k)
                .collect();
            return Err(ConveyorError::CycleDetected(format!(
                "workflow '{}': cycle through nodes {:?}",
                self.name, stuck
            )));
        }
        Ok(order)
    }
}
