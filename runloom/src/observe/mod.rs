//! Cognitive event stream: structured signals emitted while runs execute.
//!
//! Events flow from the agent loop, graph engine, queue, and intervention
//! paths into an [`EventSink`]. The production pipeline wraps a downstream
//! sink in an [`AsyncSink`] so the runtime hot path never blocks on
//! observability: emission is a bounded-channel send that drops silently
//! under pressure.

mod async_sink;
mod event;
mod sink;

pub use async_sink::AsyncSink;
pub use event::{EventKind, RunEvent};
pub use sink::{EventSink, MemorySink, MultiSink, NoopSink, SinkError, StoreSink, TracingSink};
