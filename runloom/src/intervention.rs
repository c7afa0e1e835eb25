//! Operator interventions: human signals applied to a run between steps.
//!
//! Every action is an atomic guarded state transition, emitted as an
//! `intervention` event and recorded in the audit log. Repeat delivery is
//! idempotent: each request carries an id, and applied ids are remembered
//! in run metadata so a redelivered intervention becomes a no-op.

use std::sync::Arc;

use chrono::Utc;
use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tracing::instrument;

use crate::audit::{AuditEntry, AuditStore};
use crate::observe::{EventKind, EventSink, RunEvent};
use crate::queue::{QueueError, TaskPayload, WorkQueue};
use crate::store::{ChatMessage, Run, RunMode, RunPatch, RunStatus, StateStore, StoreError};

const APPLIED_KEY: &str = "applied_interventions";

/// Operator actions. Serialized with an `action` tag so they map directly
/// onto the HTTP intervention endpoint.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum InterventionAction {
    /// Let the current step finish, then stop scheduling further steps.
    Pause,
    /// Return a paused run to the queue.
    Resume,
    /// Terminal; in-flight steps abort at the next suspension point.
    Cancel,
    /// Failed run back to pending, optionally ignoring the attempt budget.
    ForceRetry {
        #[serde(default)]
        ignore_budget: bool,
    },
    /// Pin the branch router nodes take on the next step.
    OverrideRouter { route: String },
    /// Append a synthetic tool-role message to the conversation.
    InjectToolResult { tool_name: String, result: String },
    /// Rewind to a checkpoint, discarding later ones, and re-enqueue.
    ResumeCheckpoint { seq: u64 },
}

impl InterventionAction {
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            InterventionAction::Pause => "pause",
            InterventionAction::Resume => "resume",
            InterventionAction::Cancel => "cancel",
            InterventionAction::ForceRetry { .. } => "force_retry",
            InterventionAction::OverrideRouter { .. } => "override_router",
            InterventionAction::InjectToolResult { .. } => "inject_tool_result",
            InterventionAction::ResumeCheckpoint { .. } => "resume_checkpoint",
        }
    }
}

/// One intervention request, as issued by an operator.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InterventionRequest {
    /// Delivery id; reuse it to make redelivery idempotent. Generated when
    /// absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(flatten)]
    pub action: InterventionAction,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub actor: String,
}

/// Result of applying an intervention. `applied` is false when the request
/// was a duplicate or the run was already in the target state.
#[derive(Clone, Debug)]
pub struct InterventionOutcome {
    pub run: Run,
    pub applied: bool,
}

#[derive(Debug, Error, Diagnostic)]
pub enum InterventionError {
    #[error("{action} is not valid while run {run_id} is {status}")]
    #[diagnostic(code(runloom::intervention::invalid_transition))]
    InvalidTransition {
        run_id: String,
        status: RunStatus,
        action: &'static str,
    },

    #[error("run {run_id} has exhausted its attempt budget")]
    #[diagnostic(
        code(runloom::intervention::attempts_exhausted),
        help("Pass ignore_budget=true to retry past the budget.")
    )]
    AttemptsExhausted { run_id: String },

    #[error("run {run_id} has no checkpoint at seq {seq}")]
    #[diagnostic(code(runloom::intervention::checkpoint_not_found))]
    CheckpointNotFound { run_id: String, seq: u64 },

    #[error(transparent)]
    #[diagnostic(code(runloom::intervention::store))]
    Store(#[from] StoreError),

    #[error(transparent)]
    #[diagnostic(code(runloom::intervention::queue))]
    Queue(#[from] QueueError),
}

pub type Result<T> = std::result::Result<T, InterventionError>;

/// Applies operator interventions against the store and queue.
pub struct Interventions {
    store: Arc<dyn StateStore>,
    queue: Arc<dyn WorkQueue>,
    events: Arc<dyn EventSink>,
    audit: Arc<dyn AuditStore>,
}

impl Interventions {
    #[must_use]
    pub fn new(
        store: Arc<dyn StateStore>,
        queue: Arc<dyn WorkQueue>,
        events: Arc<dyn EventSink>,
        audit: Arc<dyn AuditStore>,
    ) -> Self {
        Self {
            store,
            queue,
            events,
            audit,
        }
    }

    #[instrument(skip(self, request), fields(action = request.action.label()), err)]
    pub async fn apply(
        &self,
        run_id: &str,
        request: InterventionRequest,
    ) -> Result<InterventionOutcome> {
        let run = self.store.get_run(run_id).await?;
        let intervention_id = request
            .id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().simple().to_string());
        if applied_ids(&run).contains(&intervention_id) {
            return Ok(InterventionOutcome {
                run,
                applied: false,
            });
        }

        let updated = match &request.action {
            InterventionAction::Pause => self.pause(&run, &intervention_id).await?,
            InterventionAction::Resume => self.resume(&run, &intervention_id).await?,
            InterventionAction::Cancel => self.cancel(&run, &intervention_id).await?,
            InterventionAction::ForceRetry { ignore_budget } => {
                self.force_retry(&run, *ignore_budget, &intervention_id).await?
            }
            InterventionAction::OverrideRouter { route } => {
                self.override_router(&run, route, &intervention_id).await?
            }
            InterventionAction::InjectToolResult { tool_name, result } => {
                self.inject_tool_result(&run, tool_name, result, &intervention_id)
                    .await?
            }
            InterventionAction::ResumeCheckpoint { seq } => {
                self.resume_checkpoint(&run, *seq, &intervention_id).await?
            }
        };

        let Some(updated) = updated else {
            return Ok(InterventionOutcome {
                run,
                applied: false,
            });
        };

        let payload = serde_json::to_string(&request).unwrap_or_default();
        let _ = self
            .audit
            .record(AuditEntry::new(
                &request.actor,
                &format!("intervention:{}", request.action.label()),
                &format!("runs/{run_id}"),
                &payload,
            ))
            .await;
        let _ = self
            .events
            .emit(
                RunEvent::new(run_id, EventKind::Intervention)
                    .with_attr("action", json!(request.action.label()))
                    .with_attr("reason", json!(request.reason))
                    .with_attr("actor", json!(request.actor))
                    .with_attr("intervention_id", json!(intervention_id)),
            )
            .await;

        Ok(InterventionOutcome {
            run: updated,
            applied: true,
        })
    }

    async fn pause(&self, run: &Run, id: &str) -> Result<Option<Run>> {
        match run.status {
            RunStatus::Paused => Ok(None),
            RunStatus::Pending | RunStatus::Claimed | RunStatus::Running => {
                let patch = record_id(RunPatch::status(RunStatus::Paused), run, id);
                Ok(Some(
                    self.store
                        .update_run(&run.run_id, patch, Some(run.status))
                        .await?,
                ))
            }
            status => Err(InterventionError::InvalidTransition {
                run_id: run.run_id.clone(),
                status,
                action: "pause",
            }),
        }
    }

    async fn resume(&self, run: &Run, id: &str) -> Result<Option<Run>> {
        match run.status {
            RunStatus::Pending => Ok(None),
            RunStatus::Paused => {
                let patch = record_id(RunPatch::status(RunStatus::Pending), run, id);
                let updated = self
                    .store
                    .update_run(&run.run_id, patch, Some(RunStatus::Paused))
                    .await?;
                self.enqueue_tolerant(&updated, RunMode::Resume).await?;
                Ok(Some(updated))
            }
            status => Err(InterventionError::InvalidTransition {
                run_id: run.run_id.clone(),
                status,
                action: "resume",
            }),
        }
    }

    async fn cancel(&self, run: &Run, id: &str) -> Result<Option<Run>> {
        match run.status {
            RunStatus::Cancelled => Ok(None),
            status if status.is_terminal() => Err(InterventionError::InvalidTransition {
                run_id: run.run_id.clone(),
                status,
                action: "cancel",
            }),
            _ => {
                let patch = record_id(
                    RunPatch::status(RunStatus::Cancelled).with_error("Cancelled"),
                    run,
                    id,
                );
                Ok(Some(self.store.update_run(&run.run_id, patch, None).await?))
            }
        }
    }

    async fn force_retry(&self, run: &Run, ignore_budget: bool, id: &str) -> Result<Option<Run>> {
        if run.status != RunStatus::Failed {
            return Err(InterventionError::InvalidTransition {
                run_id: run.run_id.clone(),
                status: run.status,
                action: "force_retry",
            });
        }
        if run.attempts_used >= run.max_attempts && !ignore_budget {
            return Err(InterventionError::AttemptsExhausted {
                run_id: run.run_id.clone(),
            });
        }
        let patch = record_id(
            RunPatch::status(RunStatus::Pending).clear_error().allow_terminal(),
            run,
            id,
        );
        let updated = self
            .store
            .update_run(&run.run_id, patch, Some(RunStatus::Failed))
            .await?;
        self.enqueue_tolerant(&updated, updated.mode).await?;
        Ok(Some(updated))
    }

    async fn override_router(&self, run: &Run, route: &str, id: &str) -> Result<Option<Run>> {
        if run.status.is_terminal() {
            return Err(InterventionError::InvalidTransition {
                run_id: run.run_id.clone(),
                status: run.status,
                action: "override_router",
            });
        }
        let patch = record_id(
            RunPatch::default().with_metadata("forced_route", json!(route)),
            run,
            id,
        );
        Ok(Some(self.store.update_run(&run.run_id, patch, None).await?))
    }

    async fn inject_tool_result(
        &self,
        run: &Run,
        tool_name: &str,
        result: &str,
        id: &str,
    ) -> Result<Option<Run>> {
        if run.status.is_terminal() {
            return Err(InterventionError::InvalidTransition {
                run_id: run.run_id.clone(),
                status: run.status,
                action: "inject_tool_result",
            });
        }
        self.store
            .append_message(ChatMessage::tool(&run.run_id, tool_name, result))
            .await?;
        let patch = record_id(RunPatch::default(), run, id);
        Ok(Some(self.store.update_run(&run.run_id, patch, None).await?))
    }

    async fn resume_checkpoint(&self, run: &Run, seq: u64, id: &str) -> Result<Option<Run>> {
        if matches!(run.status, RunStatus::Cancelled | RunStatus::DeadLetter) {
            return Err(InterventionError::InvalidTransition {
                run_id: run.run_id.clone(),
                status: run.status,
                action: "resume_checkpoint",
            });
        }
        let checkpoint = self
            .store
            .latest_checkpoint(&run.run_id, Some(seq))
            .await?
            .filter(|cp| cp.seq == seq)
            .ok_or_else(|| InterventionError::CheckpointNotFound {
                run_id: run.run_id.clone(),
                seq,
            })?;
        self.store.truncate_checkpoints(&run.run_id, seq).await?;
        let patch = record_id(
            RunPatch::status(RunStatus::Pending)
                .clear_error()
                .with_metadata("last_node_id", json!(checkpoint.node_id))
                .allow_terminal(),
            run,
            id,
        );
        let updated = self.store.update_run(&run.run_id, patch, None).await?;
        self.enqueue_tolerant(&updated, RunMode::Resume).await?;
        Ok(Some(updated))
    }

    /// Re-enqueue a run, tolerating an existing in-flight task (makes the
    /// queue leg of interventions idempotent).
    async fn enqueue_tolerant(&self, run: &Run, mode: RunMode) -> Result<()> {
        let task = TaskPayload {
            run_id: run.run_id.clone(),
            session_id: run.session_id.clone(),
            input: run.input.clone(),
            mode,
            workflow: run.workflow.clone(),
            attempt_hint: run.attempts_used + 1,
            metadata: run.metadata.clone(),
            enqueued_at: Utc::now(),
        };
        match self.queue.enqueue(task).await {
            Ok(_) | Err(QueueError::DuplicateInFlight { .. }) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

fn applied_ids(run: &Run) -> Vec<String> {
    run.metadata
        .get(APPLIED_KEY)
        .and_then(Value::as_array)
        .map(|a| {
            a.iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

fn record_id(patch: RunPatch, run: &Run, id: &str) -> RunPatch {
    let mut ids = applied_ids(run);
    ids.push(id.to_string());
    patch.with_metadata(APPLIED_KEY, json!(ids))
}
