//! Run lifecycle coordination: submit, dispatch, finalize.
//!
//! The [`Coordinator`] owns the capability set (store, ledger, queue,
//! events, audit, registries, provider) and exposes the operator surface:
//! submit, run inspection, DLQ handling, worker administration, and
//! interventions. [`Worker`] instances share the same capabilities and
//! drive the claim/execute/finalize protocol; the [`Sweeper`] closes
//! attempts abandoned by lost workers.

mod sweeper;
mod worker;

pub use sweeper::{Sweeper, SWEEPER_LEASE};
pub use worker::Worker;

use std::sync::Arc;

use chrono::Utc;
use miette::Diagnostic;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tracing::instrument;

use crate::agent::{AgentOptions, Provider, Tool};
use crate::audit::{AuditEntry, AuditStore};
use crate::config::RuntimeSettings;
use crate::delivery::{self, DeliveryTarget};
use crate::graph::{TopologyView, Workflow};
use crate::intervention::{
    InterventionError, InterventionOutcome, InterventionRequest, Interventions,
};
use crate::ledger::{Attempt, AttemptLedger, LedgerError, WorkerRegistration, WorkerStatus};
use crate::observe::{EventKind, EventSink, RunEvent};
use crate::queue::{QueueError, QueueStats, TaskPayload, WorkQueue};
use crate::registry::{FlowDefinition, Registry};
use crate::store::{
    ChatMessage, Run, RunFilter, RunMode, RunPatch, RunStatus, Session, StateStore, StoreError,
};

/// A request to execute an agent run.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SubmitRequest {
    pub input: String,
    #[serde(default = "default_mode")]
    pub mode: RunMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow: Option<String>,
    /// Named flow (a reusable agent configuration) to resolve workflow and
    /// system prompt from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flow: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_attempts: Option<u32>,
    #[serde(default)]
    pub metadata: FxHashMap<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delivery: Option<DeliveryTarget>,
}

fn default_mode() -> RunMode {
    RunMode::Run
}

/// Identifiers returned by a successful submit.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SubmitReceipt {
    pub run_id: String,
    pub session_id: String,
    pub task_id: String,
}

#[derive(Debug, Error, Diagnostic)]
pub enum CoordinatorError {
    #[error("invalid submit request: {message}")]
    #[diagnostic(code(runloom::coordinator::validation))]
    Validation { message: String },

    #[error("unknown workflow {name:?}")]
    #[diagnostic(code(runloom::coordinator::unknown_workflow))]
    UnknownWorkflow { name: String },

    #[error("run {run_id} has exhausted its attempt budget")]
    #[diagnostic(
        code(runloom::coordinator::attempts_exhausted),
        help("Requeue with ignore_budget=true to override.")
    )]
    AttemptsExhausted { run_id: String },

    #[error(transparent)]
    #[diagnostic(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Ledger(#[from] LedgerError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Intervention(#[from] InterventionError),
}

pub type Result<T> = std::result::Result<T, CoordinatorError>;

/// The distributed run coordinator.
pub struct Coordinator {
    pub(crate) store: Arc<dyn StateStore>,
    pub(crate) ledger: Arc<dyn AttemptLedger>,
    pub(crate) queue: Arc<dyn WorkQueue>,
    pub(crate) events: Arc<dyn EventSink>,
    pub(crate) audit: Arc<dyn AuditStore>,
    pub(crate) workflows: Arc<Registry<Workflow>>,
    pub(crate) flows: Arc<Registry<FlowDefinition>>,
    pub(crate) tools: Arc<Registry<Arc<dyn Tool>>>,
    pub(crate) provider: Arc<dyn Provider>,
    pub(crate) agent_options: AgentOptions,
    pub(crate) settings: RuntimeSettings,
    interventions: Interventions,
}

impl Coordinator {
    #[allow(clippy::too_many_arguments)]
    #[must_use]
    pub fn new(
        store: Arc<dyn StateStore>,
        ledger: Arc<dyn AttemptLedger>,
        queue: Arc<dyn WorkQueue>,
        events: Arc<dyn EventSink>,
        audit: Arc<dyn AuditStore>,
        workflows: Arc<Registry<Workflow>>,
        tools: Arc<Registry<Arc<dyn Tool>>>,
        provider: Arc<dyn Provider>,
        settings: RuntimeSettings,
    ) -> Self {
        let agent_options = AgentOptions {
            retry: settings.retry,
            ..Default::default()
        };
        let interventions =
            Interventions::new(store.clone(), queue.clone(), events.clone(), audit.clone());
        Self {
            store,
            ledger,
            queue,
            events,
            audit,
            workflows,
            flows: Arc::new(Registry::new("flow")),
            tools,
            provider,
            agent_options,
            settings,
            interventions,
        }
    }

    /// Registry of named flows. Register at process start; submitters refer
    /// to them by name.
    #[must_use]
    pub fn flows(&self) -> Arc<Registry<FlowDefinition>> {
        self.flows.clone()
    }

    /// Override the agent-loop options used by workers built from this
    /// coordinator.
    #[must_use]
    pub fn with_agent_options(mut self, options: AgentOptions) -> Self {
        self.agent_options = options;
        self
    }

    #[must_use]
    pub fn settings(&self) -> &RuntimeSettings {
        &self.settings
    }

    /// Validate the request, create the session and run, enqueue the task,
    /// and emit a `queue` event.
    #[instrument(skip(self, request), err)]
    pub async fn submit(&self, request: SubmitRequest) -> Result<SubmitReceipt> {
        let input = request.input.trim().to_string();
        if input.is_empty() {
            return Err(CoordinatorError::Validation {
                message: "input is required".to_string(),
            });
        }
        let max_attempts = request
            .max_attempts
            .unwrap_or(self.settings.default_max_attempts);
        if max_attempts == 0 {
            return Err(CoordinatorError::Validation {
                message: "max_attempts must be at least 1".to_string(),
            });
        }
        let mut workflow = request.workflow.clone();
        let mut metadata = request.metadata.clone();
        if let Some(flow_name) = &request.flow {
            let flow =
                self.flows
                    .get(flow_name)
                    .ok_or_else(|| CoordinatorError::Validation {
                        message: format!("unknown flow {flow_name:?}"),
                    })?;
            if workflow.is_none() {
                workflow = flow.workflow.clone();
            }
            if let Some(prompt) = &flow.system_prompt {
                metadata
                    .entry("system_prompt".to_string())
                    .or_insert_with(|| json!(prompt));
            }
            metadata.insert("flow".to_string(), json!(flow_name));
        }
        if matches!(request.mode, RunMode::GraphRun | RunMode::Resume) {
            let name = workflow
                .as_deref()
                .ok_or_else(|| CoordinatorError::Validation {
                    message: "graph modes require a workflow name".to_string(),
                })?;
            if self.workflows.get(name).is_none() {
                return Err(CoordinatorError::UnknownWorkflow {
                    name: name.to_string(),
                });
            }
        }

        let session_id = match &request.session_id {
            Some(id) => {
                if self.store.get_session(id).await?.is_none() {
                    self.store
                        .create_session(Session {
                            session_id: id.clone(),
                            metadata: FxHashMap::default(),
                            created_at: Utc::now(),
                        })
                        .await?;
                }
                id.clone()
            }
            None => {
                let session = Session {
                    session_id: uuid::Uuid::new_v4().simple().to_string(),
                    metadata: FxHashMap::default(),
                    created_at: Utc::now(),
                };
                self.store.create_session(session.clone()).await?;
                session.session_id
            }
        };

        if let Some(target) = request.delivery.as_ref().and_then(DeliveryTarget::normalize) {
            metadata.insert(delivery::METADATA_KEY.to_string(), target.to_value());
        }
        let now = Utc::now();
        let run = Run {
            run_id: uuid::Uuid::new_v4().simple().to_string(),
            session_id: session_id.clone(),
            input: input.clone(),
            mode: request.mode,
            workflow: workflow.clone(),
            status: RunStatus::Pending,
            provider: request.provider.clone(),
            max_attempts,
            attempts_used: 0,
            output: None,
            error: None,
            metadata: metadata.clone(),
            created_at: now,
            updated_at: now,
        };
        let run = self.store.create_run(run).await?;
        self.store
            .append_message(ChatMessage::user(&run.run_id, &input))
            .await?;

        let task_id = self
            .queue
            .enqueue(TaskPayload {
                run_id: run.run_id.clone(),
                session_id: session_id.clone(),
                input,
                mode: request.mode,
                workflow,
                attempt_hint: 1,
                metadata,
                enqueued_at: Utc::now(),
            })
            .await?;

        let _ = self
            .events
            .emit(
                RunEvent::new(&run.run_id, EventKind::Queue)
                    .with_attr("phase", json!("enqueued"))
                    .with_attr("task_id", json!(task_id)),
            )
            .await;

        Ok(SubmitReceipt {
            run_id: run.run_id,
            session_id,
            task_id,
        })
    }

    pub async fn get_run(&self, run_id: &str) -> Result<Run> {
        Ok(self.store.get_run(run_id).await?)
    }

    pub async fn list_runs(&self, filter: RunFilter, limit: u32) -> Result<Vec<Run>> {
        Ok(self.store.list_runs(filter, limit).await?)
    }

    pub async fn run_events(&self, run_id: &str) -> Result<Vec<RunEvent>> {
        Ok(self.store.list_events(run_id).await?)
    }

    pub async fn list_attempts(&self, run_id: &str) -> Result<Vec<Attempt>> {
        Ok(self.ledger.list_attempts(run_id).await?)
    }

    pub async fn queue_stats(&self) -> Result<QueueStats> {
        Ok(self.queue.stats().await?)
    }

    pub async fn dead_letters(&self) -> Result<Vec<crate::queue::DeadLetter>> {
        Ok(self.queue.list_dead_letters().await?)
    }

    pub async fn workers(&self) -> Result<Vec<WorkerRegistration>> {
        Ok(self.ledger.list_workers().await?)
    }

    pub async fn worker_registration(
        &self,
        worker_id: &str,
    ) -> Result<Option<WorkerRegistration>> {
        Ok(self.ledger.get_worker(worker_id).await?)
    }

    pub async fn set_worker_status(&self, worker_id: &str, status: WorkerStatus) -> Result<()> {
        Ok(self.ledger.set_worker_status(worker_id, status).await?)
    }

    /// Apply an operator intervention to a run.
    pub async fn intervene(
        &self,
        run_id: &str,
        request: InterventionRequest,
    ) -> Result<InterventionOutcome> {
        Ok(self.interventions.apply(run_id, request).await?)
    }

    /// Return a dead letter to the queue and flip its run back to pending.
    ///
    /// Without `ignore_budget`, fails with `AttemptsExhausted` when the run
    /// has no attempts left; the override is recorded in the audit log.
    #[instrument(skip(self), err)]
    pub async fn requeue_dead_letter(&self, dlq_id: &str, ignore_budget: bool) -> Result<Run> {
        let dead = self
            .queue
            .get_dead_letter(dlq_id)
            .await?
            .ok_or_else(|| QueueError::DeadLetterNotFound {
                dlq_id: dlq_id.to_string(),
            })?;
        let run = self.store.get_run(&dead.task.run_id).await?;
        // The ledger is the authoritative attempt count; crashed deliveries
        // leave lost attempts that never made it into the run row.
        let attempts = self.ledger.list_attempts(&run.run_id).await?.len() as u32;
        let over_budget = attempts.max(run.attempts_used) >= run.max_attempts;
        if over_budget && !ignore_budget {
            return Err(CoordinatorError::AttemptsExhausted {
                run_id: run.run_id,
            });
        }
        let task_id = self.queue.requeue_dlq(dlq_id).await?;
        let updated = self
            .store
            .update_run(
                &run.run_id,
                RunPatch::status(RunStatus::Pending)
                    .with_attempts_used(run.attempts_used + 1)
                    .clear_error()
                    .allow_terminal(),
                Some(RunStatus::DeadLetter),
            )
            .await?;
        if over_budget {
            let _ = self
                .audit
                .record(AuditEntry::new(
                    "",
                    "dlq:ignore_budget",
                    &format!("runs/{}", run.run_id),
                    &json!({ "dlq_id": dlq_id }).to_string(),
                ))
                .await;
        }
        let _ = self
            .events
            .emit(
                RunEvent::new(&updated.run_id, EventKind::Queue)
                    .with_attr("phase", json!("dlq-requeued"))
                    .with_attr("task_id", json!(task_id)),
            )
            .await;
        Ok(updated)
    }

    /// Read-only topology of a registered workflow, for UI rendering.
    #[must_use]
    pub fn topology(&self, workflow: &str) -> Option<TopologyView> {
        self.workflows.get(workflow).map(|w| w.topology())
    }

    /// Build a worker loop sharing this coordinator's capabilities.
    #[must_use]
    pub fn worker(&self, worker_id: &str) -> Worker {
        Worker::new(worker_id, self)
    }

    /// Build the lost-worker sweeper. Pass a lease when multiple
    /// coordinator processes run, so at most one sweeper is active per
    /// sweep window.
    #[must_use]
    pub fn sweeper(
        &self,
        lease: Option<Arc<dyn crate::queue::LeaderLease>>,
    ) -> Sweeper {
        Sweeper::new(self, lease)
    }
}
