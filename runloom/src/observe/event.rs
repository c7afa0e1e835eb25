use std::fmt;

use chrono::{DateTime, Utc};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Category of a cognitive event.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    /// An LLM generation completed (attributes carry token usage).
    Generate,
    /// A tool invocation completed or failed.
    Tool,
    /// A router node chose a branch.
    Router,
    /// A retry was scheduled (attributes carry the computed delay).
    Retry,
    /// A graph checkpoint was persisted.
    Checkpoint,
    /// An operator-visible failure.
    Error,
    /// Queue lifecycle: enqueued, redelivered, dead-lettered, delivered.
    Queue,
    /// An operator intervention was applied.
    Intervention,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            EventKind::Generate => "generate",
            EventKind::Tool => "tool",
            EventKind::Router => "router",
            EventKind::Retry => "retry",
            EventKind::Checkpoint => "checkpoint",
            EventKind::Error => "error",
            EventKind::Queue => "queue",
            EventKind::Intervention => "intervention",
        };
        write!(f, "{label}")
    }
}

/// One signal on a run's cognitive event stream.
///
/// Per-run events are ordered by `timestamp`, then arrival order. Events are
/// normalized before they enter the async pipeline so consumers never see a
/// zero timestamp or a blank id.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RunEvent {
    pub event_id: String,
    pub run_id: String,
    pub kind: EventKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(default)]
    pub attributes: FxHashMap<String, Value>,
    pub timestamp: DateTime<Utc>,
}

impl RunEvent {
    #[must_use]
    pub fn new(run_id: impl Into<String>, kind: EventKind) -> Self {
        Self {
            event_id: uuid::Uuid::new_v4().simple().to_string(),
            run_id: run_id.into(),
            kind,
            node_id: None,
            duration_ms: None,
            attributes: FxHashMap::default(),
            timestamp: Utc::now(),
        }
    }

    #[must_use]
    pub fn with_node(mut self, node_id: impl Into<String>) -> Self {
        self.node_id = Some(node_id.into());
        self
    }

    #[must_use]
    pub fn with_duration_ms(mut self, ms: u64) -> Self {
        self.duration_ms = Some(ms);
        self
    }

    #[must_use]
    pub fn with_attr(mut self, key: impl Into<String>, value: Value) -> Self {
        self.attributes.insert(key.into(), value);
        self
    }

    /// Default the timestamp and id when a producer left them unset.
    pub fn normalize(&mut self) {
        if self.event_id.is_empty() {
            self.event_id = uuid::Uuid::new_v4().simple().to_string();
        }
        if self.timestamp.timestamp_millis() == 0 {
            self.timestamp = Utc::now();
        }
    }
}

impl fmt::Display for RunEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.node_id {
            Some(node) => write!(f, "[{} {}@{}]", self.kind, self.run_id, node),
            None => write!(f, "[{} {}]", self.kind, self.run_id),
        }
    }
}
