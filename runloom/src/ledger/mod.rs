//! Attempt ledger: who tried to execute each run, and when.
//!
//! The ledger's unique-in-flight constraint is the single source of truth
//! for execution exclusion: at most one attempt per run may be `in-flight`
//! at any time, and `open_attempt` rejects a second one atomically. Workers
//! treat that conflict as "another worker beat us" and back off.
//!
//! Worker registrations live here too; the lost-worker sweeper consumes
//! attempts and registrations in a single scan.

mod memory;
#[cfg(feature = "sqlite")]
mod sqlite;

pub use memory::MemoryLedger;
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteLedger;

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Outcome of one attempt at executing a run.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AttemptStatus {
    InFlight,
    Succeeded,
    Failed,
    /// The owning worker stopped heartbeating mid-attempt.
    Lost,
}

impl AttemptStatus {
    #[must_use]
    pub fn encode(&self) -> &'static str {
        match self {
            AttemptStatus::InFlight => "in-flight",
            AttemptStatus::Succeeded => "succeeded",
            AttemptStatus::Failed => "failed",
            AttemptStatus::Lost => "lost",
        }
    }

    #[must_use]
    pub fn decode(s: &str) -> Self {
        match s {
            "in-flight" => AttemptStatus::InFlight,
            "succeeded" => AttemptStatus::Succeeded,
            "lost" => AttemptStatus::Lost,
            _ => AttemptStatus::Failed,
        }
    }
}

impl fmt::Display for AttemptStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.encode())
    }
}

/// One worker's claim of a run. `attempt` is 1-indexed and contiguous per
/// run.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Attempt {
    pub run_id: String,
    pub attempt: u32,
    pub worker_id: String,
    pub status: AttemptStatus,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerStatus {
    Active,
    Draining,
    Disabled,
    Lost,
}

impl WorkerStatus {
    #[must_use]
    pub fn encode(&self) -> &'static str {
        match self {
            WorkerStatus::Active => "active",
            WorkerStatus::Draining => "draining",
            WorkerStatus::Disabled => "disabled",
            WorkerStatus::Lost => "lost",
        }
    }

    #[must_use]
    pub fn decode(s: &str) -> Self {
        match s {
            "draining" => WorkerStatus::Draining,
            "disabled" => WorkerStatus::Disabled,
            "lost" => WorkerStatus::Lost,
            _ => WorkerStatus::Active,
        }
    }
}

/// Last-writer-wins registration row, refreshed by worker heartbeats.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WorkerRegistration {
    pub worker_id: String,
    pub status: WorkerStatus,
    pub last_heartbeat_at: DateTime<Utc>,
    pub active_task_count: u32,
}

#[derive(Debug, Error, Diagnostic)]
pub enum LedgerError {
    #[error("run {run_id} already has an in-flight attempt")]
    #[diagnostic(
        code(runloom::ledger::duplicate_in_flight),
        help("Another worker holds the run; nack the task and back off.")
    )]
    DuplicateInFlight { run_id: String },

    #[error("run {run_id} has no open attempt")]
    #[diagnostic(code(runloom::ledger::no_open_attempt))]
    NoOpenAttempt { run_id: String },

    #[error("attempt {attempt} for run {run_id} not found")]
    #[diagnostic(code(runloom::ledger::attempt_not_found))]
    AttemptNotFound { run_id: String, attempt: u32 },

    #[error("worker {worker_id} not registered")]
    #[diagnostic(code(runloom::ledger::worker_not_found))]
    WorkerNotFound { worker_id: String },

    #[error("ledger backend unavailable: {message}")]
    #[diagnostic(code(runloom::ledger::unavailable))]
    Unavailable { message: String },
}

pub type Result<T> = std::result::Result<T, LedgerError>;

/// Capability set of the attempt ledger.
#[async_trait]
pub trait AttemptLedger: Send + Sync {
    /// Open a new attempt for `run_id`, returning the 1-indexed attempt
    /// number. Atomic: a second in-flight attempt for the same run is
    /// rejected with [`LedgerError::DuplicateInFlight`].
    async fn open_attempt(&self, run_id: &str, worker_id: &str) -> Result<u32>;

    async fn close_attempt(
        &self,
        run_id: &str,
        attempt: u32,
        status: AttemptStatus,
        error: Option<String>,
    ) -> Result<()>;

    async fn list_attempts(&self, run_id: &str) -> Result<Vec<Attempt>>;

    async fn current_in_flight(&self, run_id: &str) -> Result<Option<Attempt>>;

    /// Close the current in-flight attempt as `lost`. Returns the closed
    /// attempt number, or `None` when nothing was open.
    async fn mark_lost(&self, run_id: &str) -> Result<Option<u32>>;

    /// In-flight attempts currently owned by `worker_id`.
    async fn open_attempts_for_worker(&self, worker_id: &str) -> Result<Vec<Attempt>>;

    async fn upsert_heartbeat(
        &self,
        worker_id: &str,
        status: WorkerStatus,
        active_task_count: u32,
    ) -> Result<()>;

    async fn list_workers(&self) -> Result<Vec<WorkerRegistration>>;

    async fn get_worker(&self, worker_id: &str) -> Result<Option<WorkerRegistration>>;

    async fn set_worker_status(&self, worker_id: &str, status: WorkerStatus) -> Result<()>;

    /// Workers whose last heartbeat is older than `cutoff` and that are not
    /// already `disabled` or `lost`.
    async fn stale_workers(&self, cutoff: DateTime<Utc>) -> Result<Vec<WorkerRegistration>>;
}
