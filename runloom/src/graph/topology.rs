use std::sync::Arc;

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use super::node::{GraphError, GraphNode};
use crate::observe::{EventKind, RunEvent};

/// Read-only description of one node for UI rendering.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NodeSpec {
    pub id: String,
    /// Node category ("agent", "router", "transform", …).
    pub kind: String,
    pub label: String,
    pub x: f32,
    pub y: f32,
}

impl NodeSpec {
    #[must_use]
    pub fn new(id: &str, kind: &str, label: &str, x: f32, y: f32) -> Self {
        Self {
            id: id.to_string(),
            kind: kind.to_string(),
            label: label.to_string(),
            x,
            y,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TopologyEdge {
    pub from: String,
    pub to: String,
}

/// Read-only topology exposed for UI introspection.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TopologyView {
    pub workflow: String,
    pub nodes: Vec<NodeSpec>,
    pub edges: Vec<TopologyEdge>,
}

/// Per-node execution metrics derived from a run event stream.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NodeRollup {
    pub node_id: String,
    pub executions: u64,
    pub failures: u64,
    pub failure_rate: f64,
    pub avg_latency_ms: f64,
}

impl TopologyView {
    /// Aggregate events into per-node rollups. Checkpoint events count as
    /// executions; error events as failures; latency averages over events
    /// that carried a duration.
    #[must_use]
    pub fn rollup(&self, events: &[RunEvent]) -> Vec<NodeRollup> {
        self.nodes
            .iter()
            .map(|spec| {
                let mut executions = 0u64;
                let mut failures = 0u64;
                let mut latency_total = 0u64;
                let mut latency_count = 0u64;
                for event in events.iter().filter(|e| e.node_id.as_deref() == Some(&spec.id)) {
                    match event.kind {
                        EventKind::Error => failures += 1,
                        EventKind::Checkpoint | EventKind::Generate | EventKind::Router => {
                            executions += 1
                        }
                        _ => {}
                    }
                    if let Some(ms) = event.duration_ms {
                        latency_total += ms;
                        latency_count += 1;
                    }
                }
                let observed = executions + failures;
                NodeRollup {
                    node_id: spec.id.clone(),
                    executions,
                    failures,
                    failure_rate: if observed == 0 {
                        0.0
                    } else {
                        failures as f64 / observed as f64
                    },
                    avg_latency_ms: if latency_count == 0 {
                        0.0
                    } else {
                        latency_total as f64 / latency_count as f64
                    },
                }
            })
            .collect()
    }
}

/// A named workflow topology: executable nodes plus static edges.
#[derive(Clone)]
pub struct Workflow {
    name: String,
    entry: String,
    nodes: FxHashMap<String, Arc<dyn GraphNode>>,
    specs: Vec<NodeSpec>,
    edges: FxHashMap<String, Vec<String>>,
}

impl std::fmt::Debug for Workflow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Workflow")
            .field("name", &self.name)
            .field("entry", &self.entry)
            .field("nodes", &self.specs.iter().map(|s| &s.id).collect::<Vec<_>>())
            .finish()
    }
}

impl Workflow {
    #[must_use]
    pub fn builder(name: &str) -> WorkflowBuilder {
        WorkflowBuilder::new(name)
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn entry(&self) -> &str {
        &self.entry
    }

    #[must_use]
    pub fn node(&self, id: &str) -> Option<Arc<dyn GraphNode>> {
        self.nodes.get(id).cloned()
    }

    /// Static successors of a node; empty for terminal nodes.
    #[must_use]
    pub fn successors(&self, id: &str) -> &[String] {
        self.edges.get(id).map(Vec::as_slice).unwrap_or_default()
    }

    /// Read-only topology for UI rendering.
    #[must_use]
    pub fn topology(&self) -> TopologyView {
        let mut edges = Vec::new();
        for (from, targets) in &self.edges {
            for to in targets {
                edges.push(TopologyEdge {
                    from: from.clone(),
                    to: to.clone(),
                });
            }
        }
        edges.sort_by(|a, b| (&a.from, &a.to).cmp(&(&b.from, &b.to)));
        TopologyView {
            workflow: self.name.clone(),
            nodes: self.specs.clone(),
            edges,
        }
    }
}

/// Fluent builder for workflow topologies.
pub struct WorkflowBuilder {
    name: String,
    entry: Option<String>,
    nodes: FxHashMap<String, Arc<dyn GraphNode>>,
    specs: Vec<NodeSpec>,
    edges: FxHashMap<String, Vec<String>>,
}

impl WorkflowBuilder {
    #[must_use]
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            entry: None,
            nodes: FxHashMap::default(),
            specs: Vec::new(),
            edges: FxHashMap::default(),
        }
    }

    /// Register a node with its UI spec. The first added node becomes the
    /// entry unless [`entry`](Self::entry) overrides it.
    #[must_use]
    pub fn add_node(mut self, spec: NodeSpec, node: impl GraphNode + 'static) -> Self {
        if self.entry.is_none() {
            self.entry = Some(spec.id.clone());
        }
        self.nodes.insert(spec.id.clone(), Arc::new(node));
        self.specs.push(spec);
        self
    }

    #[must_use]
    pub fn add_edge(mut self, from: &str, to: &str) -> Self {
        self.edges
            .entry(from.to_string())
            .or_default()
            .push(to.to_string());
        self
    }

    #[must_use]
    pub fn entry(mut self, id: &str) -> Self {
        self.entry = Some(id.to_string());
        self
    }

    /// Validate and build: an entry must exist and every edge endpoint must
    /// name a registered node.
    pub fn build(self) -> Result<Workflow, GraphError> {
        let entry = self.entry.ok_or_else(|| GraphError::InvalidWorkflow {
            message: format!("workflow {:?} has no nodes", self.name),
        })?;
        if !self.nodes.contains_key(&entry) {
            return Err(GraphError::InvalidWorkflow {
                message: format!("entry node {entry:?} is not registered"),
            });
        }
        for (from, targets) in &self.edges {
            if !self.nodes.contains_key(from) {
                return Err(GraphError::InvalidWorkflow {
                    message: format!("edge source {from:?} is not registered"),
                });
            }
            for to in targets {
                if !self.nodes.contains_key(to) {
                    return Err(GraphError::InvalidWorkflow {
                        message: format!("edge target {to:?} is not registered"),
                    });
                }
            }
        }
        Ok(Workflow {
            name: self.name,
            entry,
            nodes: self.nodes,
            specs: self.specs,
            edges: self.edges,
        })
    }
}
