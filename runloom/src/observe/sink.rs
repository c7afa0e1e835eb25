use std::sync::Arc;

use async_trait::async_trait;
use miette::Diagnostic;
use parking_lot::Mutex;
use thiserror::Error;

use super::event::RunEvent;
use crate::store::StateStore;

/// Errors surfaced by event sinks. Only fatal pipeline failures return an
/// error; backpressure inside [`super::AsyncSink`] is handled by dropping.
#[derive(Debug, Error, Diagnostic)]
pub enum SinkError {
    #[error("event sink closed")]
    #[diagnostic(code(runloom::observe::closed))]
    Closed,

    #[error("downstream sink failed: {message}")]
    #[diagnostic(code(runloom::observe::downstream))]
    Downstream { message: String },
}

/// Abstraction over a consumer of run events.
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Handle one structured event. The sink decides how to serialize,
    /// format, or forward it.
    async fn emit(&self, event: RunEvent) -> Result<(), SinkError>;
}

/// Sink that discards every event.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopSink;

#[async_trait]
impl EventSink for NoopSink {
    async fn emit(&self, _event: RunEvent) -> Result<(), SinkError> {
        Ok(())
    }
}

/// In-memory sink for testing and snapshots.
#[derive(Clone, Default)]
pub struct MemorySink {
    entries: Arc<Mutex<Vec<RunEvent>>>,
}

impl MemorySink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of all captured events, in arrival order.
    #[must_use]
    pub fn snapshot(&self) -> Vec<RunEvent> {
        self.entries.lock().clone()
    }

    /// Events captured for one run, in arrival order.
    #[must_use]
    pub fn for_run(&self, run_id: &str) -> Vec<RunEvent> {
        self.entries
            .lock()
            .iter()
            .filter(|e| e.run_id == run_id)
            .cloned()
            .collect()
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }
}

#[async_trait]
impl EventSink for MemorySink {
    async fn emit(&self, event: RunEvent) -> Result<(), SinkError> {
        self.entries.lock().push(event);
        Ok(())
    }
}

/// Sink that logs events through `tracing` at info level.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingSink;

#[async_trait]
impl EventSink for TracingSink {
    async fn emit(&self, event: RunEvent) -> Result<(), SinkError> {
        tracing::info!(
            target: "runloom::events",
            run_id = %event.run_id,
            kind = %event.kind,
            node_id = event.node_id.as_deref(),
            duration_ms = event.duration_ms,
            "run event"
        );
        Ok(())
    }
}

/// Fan one event out to several downstream sinks, stopping on the first
/// error.
pub struct MultiSink {
    sinks: Vec<Arc<dyn EventSink>>,
}

impl MultiSink {
    /// Build a fan-out sink. Degenerate cases collapse: zero sinks behave
    /// like [`NoopSink`].
    #[must_use]
    pub fn new(sinks: Vec<Arc<dyn EventSink>>) -> Self {
        Self { sinks }
    }
}

#[async_trait]
impl EventSink for MultiSink {
    async fn emit(&self, event: RunEvent) -> Result<(), SinkError> {
        for sink in &self.sinks {
            sink.emit(event.clone()).await?;
        }
        Ok(())
    }
}

/// Sink that persists events into the state store so `list_events` can
/// replay a run's stream.
pub struct StoreSink {
    store: Arc<dyn StateStore>,
}

impl StoreSink {
    #[must_use]
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl EventSink for StoreSink {
    async fn emit(&self, event: RunEvent) -> Result<(), SinkError> {
        self.store
            .append_event(event)
            .await
            .map_err(|e| SinkError::Downstream {
                message: e.to_string(),
            })
    }
}
