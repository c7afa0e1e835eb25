//! Durable session/run/message/checkpoint persistence.
//!
//! The [`StateStore`] capability is the single source of truth for run
//! lifecycle state. All mutations are single-statement transactional;
//! `update_run` supports optimistic status guarding so racing workers lose
//! cleanly with [`StoreError::StaleState`] instead of clobbering each other.
//!
//! Two backends ship: [`MemoryStateStore`] for tests and single-process
//! development, and [`SqliteStateStore`] for durable deployments.

mod memory;
#[cfg(feature = "sqlite")]
mod sqlite;

pub use memory::MemoryStateStore;
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteStateStore;

/// Shared sqlx helpers for the sibling SQLite backends (ledger, queue, audit).
#[cfg(feature = "sqlite")]
pub(crate) mod sqlite_support {
    pub(crate) use super::sqlite::{open_pool, parse_ts};
}

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use miette::Diagnostic;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::observe::RunEvent;

/// Lifecycle status of a run.
///
/// Terminal statuses (`Succeeded`, `Failed`, `Cancelled`, `DeadLetter`) are
/// absorbing: once entered they can only be left through a recorded
/// intervention.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RunStatus {
    Pending,
    Claimed,
    Running,
    Paused,
    Succeeded,
    Failed,
    Cancelled,
    DeadLetter,
}

impl RunStatus {
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Succeeded | RunStatus::Failed | RunStatus::Cancelled | RunStatus::DeadLetter
        )
    }

    /// Encode into the persisted string form.
    #[must_use]
    pub fn encode(&self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::Claimed => "claimed",
            RunStatus::Running => "running",
            RunStatus::Paused => "paused",
            RunStatus::Succeeded => "succeeded",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
            RunStatus::DeadLetter => "dead-letter",
        }
    }

    /// Decode the persisted string form. Unknown values map to `Failed` so
    /// a corrupted row cannot resurrect as schedulable.
    #[must_use]
    pub fn decode(s: &str) -> Self {
        match s {
            "pending" => RunStatus::Pending,
            "claimed" => RunStatus::Claimed,
            "running" => RunStatus::Running,
            "paused" => RunStatus::Paused,
            "succeeded" => RunStatus::Succeeded,
            "cancelled" => RunStatus::Cancelled,
            "dead-letter" => RunStatus::DeadLetter,
            _ => RunStatus::Failed,
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.encode())
    }
}

/// Execution mode requested at submit time.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RunMode {
    /// Single agent-loop execution.
    Run,
    /// Multi-node workflow execution.
    GraphRun,
    /// Workflow execution resumed from the last persisted checkpoint.
    Resume,
}

impl RunMode {
    #[must_use]
    pub fn encode(&self) -> &'static str {
        match self {
            RunMode::Run => "run",
            RunMode::GraphRun => "graph-run",
            RunMode::Resume => "resume",
        }
    }

    #[must_use]
    pub fn decode(s: &str) -> Self {
        match s {
            "graph-run" => RunMode::GraphRun,
            "resume" => RunMode::Resume,
            _ => RunMode::Run,
        }
    }
}

/// Groups runs that share a user/agent configuration. Created on first run;
/// only metadata merges after that.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub session_id: String,
    pub metadata: FxHashMap<String, Value>,
    pub created_at: DateTime<Utc>,
}

/// A single requested execution.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Run {
    pub run_id: String,
    pub session_id: String,
    pub input: String,
    pub mode: RunMode,
    pub workflow: Option<String>,
    pub status: RunStatus,
    pub provider: Option<String>,
    pub max_attempts: u32,
    pub attempts_used: u32,
    pub output: Option<String>,
    pub error: Option<String>,
    pub metadata: FxHashMap<String, Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Partial update applied to a run through [`StateStore::update_run`].
///
/// `metadata` entries merge into the existing map; all other fields replace
/// when set. `override_terminal` is reserved for the designated intervention
/// paths that may leave a terminal status.
#[derive(Clone, Debug, Default)]
pub struct RunPatch {
    pub status: Option<RunStatus>,
    pub attempts_used: Option<u32>,
    pub output: Option<String>,
    pub error: Option<Option<String>>,
    pub metadata: FxHashMap<String, Value>,
    pub override_terminal: bool,
}

impl RunPatch {
    #[must_use]
    pub fn status(status: RunStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    #[must_use]
    pub fn with_attempts_used(mut self, attempts: u32) -> Self {
        self.attempts_used = Some(attempts);
        self
    }

    #[must_use]
    pub fn with_output(mut self, output: impl Into<String>) -> Self {
        self.output = Some(output.into());
        self
    }

    #[must_use]
    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(Some(error.into()));
        self
    }

    #[must_use]
    pub fn clear_error(mut self) -> Self {
        self.error = Some(None);
        self
    }

    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    #[must_use]
    pub fn allow_terminal(mut self) -> Self {
        self.override_terminal = true;
        self
    }
}

/// An entry in a run's conversation history. Append-only per run.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub message_id: String,
    pub run_id: String,
    pub role: String,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_args: Option<Value>,
    pub created_at: DateTime<Utc>,
}

impl ChatMessage {
    pub const USER: &'static str = "user";
    pub const ASSISTANT: &'static str = "assistant";
    pub const SYSTEM: &'static str = "system";
    pub const TOOL: &'static str = "tool";

    #[must_use]
    pub fn new(run_id: impl Into<String>, role: &str, content: impl Into<String>) -> Self {
        Self {
            message_id: uuid::Uuid::new_v4().simple().to_string(),
            run_id: run_id.into(),
            role: role.to_string(),
            content: content.into(),
            tool_name: None,
            tool_args: None,
            created_at: Utc::now(),
        }
    }

    #[must_use]
    pub fn user(run_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self::new(run_id, Self::USER, content)
    }

    #[must_use]
    pub fn assistant(run_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self::new(run_id, Self::ASSISTANT, content)
    }

    #[must_use]
    pub fn system(run_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self::new(run_id, Self::SYSTEM, content)
    }

    /// A tool-role message carrying the named tool's result (or error text).
    #[must_use]
    pub fn tool(
        run_id: impl Into<String>,
        tool_name: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        let mut msg = Self::new(run_id, Self::TOOL, content);
        msg.tool_name = Some(tool_name.into());
        msg
    }
}

/// Snapshot of graph execution state at a node boundary.
///
/// `seq` values per run form a dense sequence starting at 1. `frontier`
/// holds the successor node ids to re-enter on resume.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RunCheckpoint {
    pub run_id: String,
    pub seq: u64,
    pub node_id: String,
    pub output: Value,
    pub state: FxHashMap<String, Value>,
    pub frontier: Vec<String>,
    pub created_at: DateTime<Utc>,
}

/// Filter for [`StateStore::list_runs`].
#[derive(Clone, Debug, Default)]
pub struct RunFilter {
    pub session_id: Option<String>,
    pub status: Option<RunStatus>,
}

#[derive(Debug, Error, Diagnostic)]
pub enum StoreError {
    #[error("optimistic update lost a race on run {run_id}: expected {expected}, found {actual}")]
    #[diagnostic(
        code(runloom::store::stale_state),
        help("Reload the run and retry, or abandon the transition.")
    )]
    StaleState {
        run_id: String,
        expected: RunStatus,
        actual: RunStatus,
    },

    #[error("run {run_id} is terminal ({status}) and cannot be mutated")]
    #[diagnostic(code(runloom::store::already_terminal))]
    AlreadyTerminal { run_id: String, status: RunStatus },

    #[error("{what} not found: {id}")]
    #[diagnostic(code(runloom::store::not_found))]
    NotFound { what: &'static str, id: String },

    #[error("checkpoint seq {got} for run {run_id} breaks the dense sequence (expected {expected})")]
    #[diagnostic(code(runloom::store::checkpoint_gap))]
    CheckpointGap {
        run_id: String,
        expected: u64,
        got: u64,
    },

    #[error("duplicate id: {id}")]
    #[diagnostic(code(runloom::store::duplicate))]
    Duplicate { id: String },

    #[error(transparent)]
    #[diagnostic(code(runloom::store::serde))]
    Serde(#[from] serde_json::Error),

    #[error("store backend unavailable: {message}")]
    #[diagnostic(code(runloom::store::unavailable))]
    Unavailable { message: String },
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Capability set of the state store: the single source of truth for run
/// lifecycle state.
///
/// Implementations must be safe under concurrent callers and sequentially
/// consistent per `run_id`.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn create_session(&self, session: Session) -> Result<Session>;
    async fn get_session(&self, session_id: &str) -> Result<Option<Session>>;

    async fn create_run(&self, run: Run) -> Result<Run>;
    async fn get_run(&self, run_id: &str) -> Result<Run>;

    /// Apply `patch` to a run. When `expected_status` is set the update only
    /// succeeds if the current status matches; otherwise `StaleState`.
    /// Mutating a terminal run fails with `AlreadyTerminal` unless the patch
    /// carries `override_terminal` (intervention paths only).
    async fn update_run(
        &self,
        run_id: &str,
        patch: RunPatch,
        expected_status: Option<RunStatus>,
    ) -> Result<Run>;

    async fn list_runs(&self, filter: RunFilter, limit: u32) -> Result<Vec<Run>>;

    async fn append_message(&self, message: ChatMessage) -> Result<()>;
    /// Messages in append order; `since` skips entries created at or before
    /// the given instant.
    async fn list_messages(
        &self,
        run_id: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<ChatMessage>>;

    /// Persist a checkpoint. `seq` must extend the dense per-run sequence.
    async fn save_checkpoint(&self, checkpoint: RunCheckpoint) -> Result<()>;
    async fn list_checkpoints(&self, run_id: &str, until_seq: Option<u64>)
        -> Result<Vec<RunCheckpoint>>;
    /// Highest-`seq` checkpoint at or below `until_seq` (or the latest).
    async fn latest_checkpoint(
        &self,
        run_id: &str,
        until_seq: Option<u64>,
    ) -> Result<Option<RunCheckpoint>>;
    /// Discard checkpoints with `seq > after_seq` (resume_checkpoint path).
    async fn truncate_checkpoints(&self, run_id: &str, after_seq: u64) -> Result<()>;

    async fn append_event(&self, event: RunEvent) -> Result<()>;
    /// Events ordered by timestamp, then arrival order.
    async fn list_events(&self, run_id: &str) -> Result<Vec<RunEvent>>;
}

pub(crate) fn merge_metadata(
    target: &mut FxHashMap<String, Value>,
    incoming: &FxHashMap<String, Value>,
) {
    for (k, v) in incoming {
        target.insert(k.clone(), v.clone());
    }
}

pub(crate) fn apply_patch(run: &mut Run, patch: &RunPatch) {
    if let Some(status) = patch.status {
        run.status = status;
    }
    if let Some(attempts) = patch.attempts_used {
        run.attempts_used = attempts;
    }
    if let Some(output) = &patch.output {
        run.output = Some(output.clone());
    }
    if let Some(error) = &patch.error {
        run.error = error.clone();
    }
    merge_metadata(&mut run.metadata, &patch.metadata);
    run.updated_at = Utc::now();
}
