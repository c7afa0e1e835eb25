//! Durable work queue with consumer-group semantics.
//!
//! Delivery contract: a claimed task is invisible to other workers for the
//! visibility window; workers acknowledge, extend, or nack explicitly. An
//! unacknowledged task becomes claimable again when its visibility expires,
//! with its delivery count intact — the coordinator parks over-delivered
//! tasks in the dead-letter queue.
//!
//! The queue makes no per-run ordering promise; per-run exclusion is the
//! attempt ledger's job.

mod memory;
#[cfg(feature = "sqlite")]
mod sqlite;

pub use memory::MemoryQueue;
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteQueue;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use miette::Diagnostic;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::store::RunMode;

/// Wire format of an enqueued task.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TaskPayload {
    pub run_id: String,
    pub session_id: String,
    pub input: String,
    pub mode: RunMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow: Option<String>,
    pub attempt_hint: u32,
    #[serde(default)]
    pub metadata: FxHashMap<String, Value>,
    pub enqueued_at: DateTime<Utc>,
}

/// A task handed to a worker by [`WorkQueue::claim`].
#[derive(Clone, Debug, PartialEq)]
pub struct ClaimedTask {
    pub task_id: String,
    pub payload: TaskPayload,
    /// Total deliveries of this task, including the current one.
    pub delivery_count: u32,
}

/// Observability record for a claimed-but-unacknowledged task.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PendingRecord {
    pub task_id: String,
    pub consumer: String,
    pub idle_ms: u64,
    pub delivery_count: u32,
}

/// Terminal parking spot for a task that exceeded `max_deliveries`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DeadLetter {
    pub dlq_id: String,
    pub task: TaskPayload,
    pub received_at: DateTime<Utc>,
    pub failure_reason: String,
    pub delivery_count: u32,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub stream_length: u64,
    pub pending: u64,
    pub dlq_length: u64,
}

#[derive(Debug, Error, Diagnostic)]
pub enum QueueError {
    #[error("a task for run {run_id} is already in flight")]
    #[diagnostic(code(runloom::queue::duplicate_in_flight))]
    DuplicateInFlight { run_id: String },

    #[error("task {task_id} not found")]
    #[diagnostic(code(runloom::queue::task_not_found))]
    TaskNotFound { task_id: String },

    #[error("dead letter {dlq_id} not found")]
    #[diagnostic(code(runloom::queue::dead_letter_not_found))]
    DeadLetterNotFound { dlq_id: String },

    #[error("task {task_id} is not claimed by worker {worker_id}")]
    #[diagnostic(
        code(runloom::queue::wrong_consumer),
        help("The visibility window likely expired and another worker claimed the task.")
    )]
    WrongConsumer { task_id: String, worker_id: String },

    #[error(transparent)]
    #[diagnostic(code(runloom::queue::serde))]
    Serde(#[from] serde_json::Error),

    #[error("queue backend unavailable: {message}")]
    #[diagnostic(code(runloom::queue::unavailable))]
    Unavailable { message: String },
}

pub type Result<T> = std::result::Result<T, QueueError>;

/// Capability set of the durable work queue.
#[async_trait]
pub trait WorkQueue: Send + Sync {
    /// Enqueue a task. Rejects a duplicate in-flight enqueue for the same
    /// `run_id` with [`QueueError::DuplicateInFlight`].
    async fn enqueue(&self, task: TaskPayload) -> Result<String>;

    /// Enqueue a task that becomes claimable only after `delay` (re-enqueue
    /// backoff path).
    async fn enqueue_after(&self, task: TaskPayload, delay: Duration) -> Result<String>;

    /// Claim up to `count` tasks, blocking up to `block_for` when the queue
    /// is empty. Each returned task starts a visibility timer.
    async fn claim(
        &self,
        worker_id: &str,
        count: u32,
        block_for: Duration,
    ) -> Result<Vec<ClaimedTask>>;

    /// Push the visibility deadline of a claimed task `duration` into the
    /// future (keepalive).
    async fn extend(&self, task_id: &str, worker_id: &str, duration: Duration) -> Result<()>;

    /// Remove a claimed task from pending.
    async fn ack(&self, task_id: &str, worker_id: &str) -> Result<()>;

    /// Return a claimed task to the queue, claimable after `requeue_after`.
    async fn nack(&self, task_id: &str, worker_id: &str, requeue_after: Duration) -> Result<()>;

    async fn list_pending(&self) -> Result<Vec<PendingRecord>>;

    /// Park a task in the dead-letter queue, returning the DLQ id.
    async fn move_dead_letter(&self, task_id: &str, reason: &str) -> Result<String>;

    async fn get_dead_letter(&self, dlq_id: &str) -> Result<Option<DeadLetter>>;

    async fn list_dead_letters(&self) -> Result<Vec<DeadLetter>>;

    /// Move a dead letter back onto the queue, returning the new task id.
    async fn requeue_dlq(&self, dlq_id: &str) -> Result<String>;

    async fn stats(&self) -> Result<QueueStats>;
}

/// Distributed lease used to keep the lost-worker sweeper a singleton. The
/// leader key lives in the queue's underlying store.
#[async_trait]
pub trait LeaderLease: Send + Sync {
    /// Acquire (or refresh) the named lease for `holder`. Returns `false`
    /// when another live holder owns it.
    async fn try_acquire(&self, name: &str, holder: &str, ttl: Duration) -> Result<bool>;
}
