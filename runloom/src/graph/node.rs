use std::sync::Arc;

use async_trait::async_trait;
use miette::Diagnostic;
use rustc_hash::FxHashMap;
use serde_json::Value;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::agent::ProviderError;
use crate::observe::{EventSink, RunEvent};
use crate::store::StoreError;

/// Shared state object threaded through a workflow's nodes.
///
/// A plain JSON map: nodes read what they need and return deltas that the
/// engine merges back in. The run input arrives under `"input"`; by
/// convention the final answer lands under `"output"`.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct GraphState {
    values: FxHashMap<String, Value>,
}

impl GraphState {
    #[must_use]
    pub fn new_with_input(input: &str) -> Self {
        let mut values = FxHashMap::default();
        values.insert("input".to_string(), Value::String(input.to_string()));
        Self { values }
    }

    #[must_use]
    pub fn from_values(values: FxHashMap<String, Value>) -> Self {
        Self { values }
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    #[must_use]
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.values.get(key).and_then(Value::as_str)
    }

    pub fn merge(&mut self, delta: FxHashMap<String, Value>) {
        for (k, v) in delta {
            self.values.insert(k, v);
        }
    }

    #[must_use]
    pub fn values(&self) -> &FxHashMap<String, Value> {
        &self.values
    }
}

/// What a node produced: a state delta, explicit successor edges (empty
/// means "follow the static topology"), and whether the boundary must be
/// checkpointed. Non-pure nodes and tool-invoking LLM nodes always set
/// `checkpoint`.
#[derive(Clone, Debug, Default)]
pub struct NodeOutcome {
    pub delta: FxHashMap<String, Value>,
    pub next: Vec<String>,
    pub checkpoint: bool,
}

impl NodeOutcome {
    #[must_use]
    pub fn advance() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: Value) -> Self {
        self.delta.insert(key.into(), value);
        self
    }

    #[must_use]
    pub fn to(mut self, next: impl Into<String>) -> Self {
        self.next.push(next.into());
        self
    }

    #[must_use]
    pub fn checkpointed(mut self) -> Self {
        self.checkpoint = true;
        self
    }
}

/// Execution context handed to a node.
#[derive(Clone)]
pub struct GraphContext {
    pub run_id: String,
    pub node_id: String,
    /// Operator override consulted by router nodes before classifying.
    pub forced_route: Option<String>,
    pub events: Arc<dyn EventSink>,
    pub cancel: CancellationToken,
}

impl GraphContext {
    /// Emit an event tagged with this node's identity. Emission failures
    /// never surface into node execution.
    pub async fn emit(&self, event: RunEvent) {
        let _ = self.events.emit(event.with_node(&self.node_id)).await;
    }
}

/// A unit of work in a workflow graph.
#[async_trait]
pub trait GraphNode: Send + Sync {
    async fn execute(
        &self,
        ctx: &GraphContext,
        state: &GraphState,
    ) -> Result<NodeOutcome, GraphError>;
}

#[derive(Debug, Error, Diagnostic)]
pub enum GraphError {
    #[error("workflow {workflow} has no node {node_id}")]
    #[diagnostic(code(runloom::graph::unknown_node))]
    UnknownNode { workflow: String, node_id: String },

    #[error("invalid workflow: {message}")]
    #[diagnostic(code(runloom::graph::invalid_workflow))]
    InvalidWorkflow { message: String },

    #[error("node {node_id} missing expected state key {key:?}")]
    #[diagnostic(code(runloom::graph::missing_state))]
    MissingState { node_id: String, key: String },

    #[error(transparent)]
    #[diagnostic(code(runloom::graph::provider))]
    Provider(#[from] ProviderError),

    #[error(transparent)]
    #[diagnostic(code(runloom::graph::store))]
    Store(#[from] StoreError),

    #[error("graph execution cancelled")]
    #[diagnostic(code(runloom::graph::cancelled))]
    Cancelled,
}

impl GraphError {
    /// Stable machine code surfaced into `Run.error`.
    #[must_use]
    pub fn machine_code(&self) -> &'static str {
        match self {
            GraphError::Provider(ProviderError::RateLimited { .. }) => "ProviderRateLimited",
            GraphError::Provider(_) => "ProviderError",
            GraphError::Store(_) => "StoreUnavailable",
            GraphError::Cancelled => "Cancelled",
            _ => "GraphError",
        }
    }
}
