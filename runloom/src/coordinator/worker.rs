use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use super::{Coordinator, Result};
use crate::agent::{AgentError, AgentLoop, AgentOptions, JitterSource, Provider, Sleeper, Tool};
use crate::config::RuntimeSettings;
use crate::graph::{GraphEngine, GraphError, Workflow};
use crate::ledger::{AttemptLedger, AttemptStatus, LedgerError, WorkerStatus};
use crate::observe::{EventKind, EventSink, RunEvent};
use crate::queue::{ClaimedTask, TaskPayload, WorkQueue};
use crate::registry::Registry;
use crate::store::{Run, RunMode, RunPatch, RunStatus, StateStore, StoreError};

/// Delay before another worker may retry a run we failed to guard.
const CONTENTION_NACK_DELAY: Duration = Duration::from_secs(1);

/// How long a single claim call blocks before the loop re-checks shutdown.
const CLAIM_BLOCK: Duration = Duration::from_secs(1);

/// One cooperative worker loop: claim a task, guard it through the attempt
/// ledger, execute the step, finalize, repeat.
///
/// A worker owns at most one in-flight task at a time; a process may host
/// several workers. Crash recovery relies on nothing here: visibility
/// expiry redelivers the task and the next claimant closes the orphaned
/// attempt as lost.
pub struct Worker {
    id: String,
    store: Arc<dyn StateStore>,
    ledger: Arc<dyn AttemptLedger>,
    queue: Arc<dyn WorkQueue>,
    events: Arc<dyn EventSink>,
    workflows: Arc<Registry<Workflow>>,
    tools: Arc<Registry<Arc<dyn Tool>>>,
    provider: Arc<dyn Provider>,
    agent_options: AgentOptions,
    settings: RuntimeSettings,
    cancel: CancellationToken,
    sleeper: Option<Sleeper>,
    jitter: Option<JitterSource>,
}

impl Worker {
    #[must_use]
    pub fn new(worker_id: &str, coordinator: &Coordinator) -> Self {
        Self {
            id: worker_id.to_string(),
            store: coordinator.store.clone(),
            ledger: coordinator.ledger.clone(),
            queue: coordinator.queue.clone(),
            events: coordinator.events.clone(),
            workflows: coordinator.workflows.clone(),
            tools: coordinator.tools.clone(),
            provider: coordinator.provider.clone(),
            agent_options: coordinator.agent_options.clone(),
            settings: coordinator.settings.clone(),
            cancel: CancellationToken::new(),
            sleeper: None,
            jitter: None,
        }
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Token that stops the loop; also propagated into steps so they abort
    /// at the next suspension point.
    #[must_use]
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Replace the agent-loop options.
    #[must_use]
    pub fn with_agent_options(mut self, options: AgentOptions) -> Self {
        self.agent_options = options;
        self
    }

    /// Replace the agent loop's sleep implementation (tests record backoff
    /// delays instead of waiting them out).
    #[must_use]
    pub fn with_sleeper(mut self, sleeper: Sleeper) -> Self {
        self.sleeper = Some(sleeper);
        self
    }

    /// Replace the agent loop's jitter source (tests pin it).
    #[must_use]
    pub fn with_jitter(mut self, jitter: JitterSource) -> Self {
        self.jitter = Some(jitter);
        self
    }

    /// Run until cancelled: heartbeat, claim, process.
    #[instrument(skip(self), fields(worker_id = %self.id))]
    pub async fn run(&self) {
        let mut last_heartbeat = tokio::time::Instant::now();
        self.heartbeat(0).await;
        while !self.cancel.is_cancelled() {
            if last_heartbeat.elapsed() >= self.settings.heartbeat_interval {
                self.heartbeat(0).await;
                last_heartbeat = tokio::time::Instant::now();
            }
            match self.ledger.get_worker(&self.id).await {
                Ok(Some(reg))
                    if matches!(reg.status, WorkerStatus::Draining | WorkerStatus::Disabled) =>
                {
                    break;
                }
                _ => {}
            }
            if let Err(error) = self.run_once(CLAIM_BLOCK).await {
                tracing::warn!(worker_id = %self.id, %error, "worker iteration failed");
                tokio::time::sleep(Duration::from_millis(200)).await;
            }
        }
    }

    /// Claim and process at most one task. Returns whether a task was
    /// handled. Exposed so tests can step the protocol deterministically.
    pub async fn run_once(&self, block_for: Duration) -> Result<bool> {
        self.heartbeat(0).await;
        let mut claimed = self.queue.claim(&self.id, 1, block_for).await?;
        let Some(task) = claimed.pop() else {
            return Ok(false);
        };
        self.heartbeat(1).await;
        let outcome = self.process(task).await;
        self.heartbeat(0).await;
        outcome.map(|_| true)
    }

    /// Refresh the registration without clobbering an operator-set status
    /// (a drained worker stays draining).
    async fn heartbeat(&self, active: u32) {
        let status = match self.ledger.get_worker(&self.id).await {
            Ok(Some(registration)) => registration.status,
            _ => WorkerStatus::Active,
        };
        let _ = self.ledger.upsert_heartbeat(&self.id, status, active).await;
    }

    #[instrument(skip(self, task), fields(worker_id = %self.id, run_id = %task.payload.run_id))]
    async fn process(&self, task: ClaimedTask) -> Result<()> {
        let run_id = task.payload.run_id.clone();

        // Over-delivered tasks park in the DLQ and their run goes
        // dead-letter.
        if task.delivery_count > self.settings.max_deliveries {
            let dlq_id = self
                .queue
                .move_dead_letter(&task.task_id, "max deliveries exceeded")
                .await?;
            let patch = RunPatch::status(RunStatus::DeadLetter)
                .with_error("max deliveries exceeded");
            if let Err(error) = self.store.update_run(&run_id, patch, None).await {
                tracing::debug!(%run_id, %error, "dead-letter run update skipped");
            }
            self.emit(
                RunEvent::new(&run_id, EventKind::Queue)
                    .with_attr("phase", json!("dead-lettered"))
                    .with_attr("dlq_id", json!(dlq_id))
                    .with_attr("delivery_count", json!(task.delivery_count)),
            )
            .await;
            return Ok(());
        }

        let run = match self.store.get_run(&run_id).await {
            Ok(run) => run,
            Err(StoreError::NotFound { .. }) => {
                self.queue.ack(&task.task_id, &self.id).await?;
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };
        if run.status.is_terminal() || run.status == RunStatus::Paused {
            self.queue.ack(&task.task_id, &self.id).await?;
            return Ok(());
        }

        // Orphan recovery: an in-flight attempt whose worker has stopped
        // heartbeating is closed as lost; a live one means we lost the
        // race.
        if let Some(open) = self.ledger.current_in_flight(&run_id).await? {
            let stale = match self.ledger.get_worker(&open.worker_id).await? {
                Some(reg) => {
                    Utc::now() - reg.last_heartbeat_at
                        > chrono::Duration::from_std(self.settings.heartbeat_timeout)
                            .unwrap_or_default()
                }
                None => true,
            };
            if stale {
                if let Some(attempt) = self.ledger.mark_lost(&run_id).await? {
                    self.emit(
                        RunEvent::new(&run_id, EventKind::Queue)
                            .with_attr("phase", json!("attempt-lost"))
                            .with_attr("attempt", json!(attempt))
                            .with_attr("worker_id", json!(open.worker_id)),
                    )
                    .await;
                }
            } else {
                self.queue
                    .nack(&task.task_id, &self.id, CONTENTION_NACK_DELAY)
                    .await?;
                return Ok(());
            }
        }

        let attempt = match self.ledger.open_attempt(&run_id, &self.id).await {
            Ok(attempt) => attempt,
            Err(LedgerError::DuplicateInFlight { .. }) => {
                self.queue
                    .nack(&task.task_id, &self.id, CONTENTION_NACK_DELAY)
                    .await?;
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        // Transition {pending, failed} -> claimed under the optimistic
        // guard; a stale status (cancelled, another claim) releases the
        // attempt.
        let claim_patch = RunPatch::status(RunStatus::Claimed).with_attempts_used(attempt);
        let claimed_run = match self
            .store
            .update_run(&run_id, claim_patch.clone(), Some(RunStatus::Pending))
            .await
        {
            Ok(run) => Ok(run),
            Err(StoreError::StaleState { .. }) => {
                self.store
                    .update_run(&run_id, claim_patch, Some(RunStatus::Failed))
                    .await
            }
            Err(e) => Err(e),
        };
        match claimed_run {
            Ok(_) => {}
            Err(StoreError::StaleState { .. }) | Err(StoreError::AlreadyTerminal { .. }) => {
                self.ledger
                    .close_attempt(
                        &run_id,
                        attempt,
                        AttemptStatus::Failed,
                        Some("run not claimable".to_string()),
                    )
                    .await?;
                self.queue.ack(&task.task_id, &self.id).await?;
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        }
        let run = self
            .store
            .update_run(&run_id, RunPatch::status(RunStatus::Running), Some(RunStatus::Claimed))
            .await?;

        // Keepalive: extend visibility while the step executes.
        let keepalive = self.spawn_keepalive(task.task_id.clone());

        let step = self.execute(&run, &task.payload).await;

        keepalive.cancel();

        match step {
            Ok(output) => {
                self.ledger
                    .close_attempt(&run_id, attempt, AttemptStatus::Succeeded, None)
                    .await?;
                let patch = RunPatch::status(RunStatus::Succeeded)
                    .with_attempts_used(attempt)
                    .with_output(&output)
                    .clear_error();
                match self.store.update_run(&run_id, patch, Some(RunStatus::Running)).await {
                    Ok(updated) => {
                        self.emit(completion_event(&updated)).await;
                    }
                    Err(StoreError::StaleState { .. }) | Err(StoreError::AlreadyTerminal { .. }) => {
                        // Cancelled or intervened mid-finalize; the attempt
                        // record stands.
                    }
                    Err(e) => return Err(e.into()),
                }
                self.queue.ack(&task.task_id, &self.id).await?;
            }
            Err((code, message)) => {
                self.ledger
                    .close_attempt(
                        &run_id,
                        attempt,
                        AttemptStatus::Failed,
                        Some(message.clone()),
                    )
                    .await?;
                let retriable = code != "Cancelled" && attempt < run.max_attempts;
                let status = if retriable {
                    RunStatus::Pending
                } else {
                    RunStatus::Failed
                };
                let patch = RunPatch::status(status)
                    .with_attempts_used(attempt)
                    .with_error(format!("{code}: {message}"));
                match self.store.update_run(&run_id, patch, Some(RunStatus::Running)).await {
                    Ok(_) => {}
                    Err(StoreError::StaleState { .. }) | Err(StoreError::AlreadyTerminal { .. }) => {
                        self.queue.ack(&task.task_id, &self.id).await?;
                        return Ok(());
                    }
                    Err(e) => return Err(e.into()),
                }
                self.emit(
                    RunEvent::new(&run_id, EventKind::Error)
                        .with_attr("code", json!(code))
                        .with_attr("message", json!(message))
                        .with_attr("attempt", json!(attempt))
                        .with_attr("retriable", json!(retriable)),
                )
                .await;
                self.queue.ack(&task.task_id, &self.id).await?;
                if retriable {
                    let delay = self
                        .settings
                        .retry
                        .normalize()
                        .backoff_for_attempt(attempt);
                    let next = TaskPayload {
                        attempt_hint: attempt + 1,
                        enqueued_at: Utc::now(),
                        ..task.payload.clone()
                    };
                    self.queue.enqueue_after(next, delay).await?;
                    self.emit(
                        RunEvent::new(&run_id, EventKind::Retry)
                            .with_attr("category", json!("re-enqueue"))
                            .with_attr("attempt_hint", json!(attempt + 1))
                            .with_attr("delay_ms", json!(delay.as_millis() as u64)),
                    )
                    .await;
                }
            }
        }
        Ok(())
    }

    /// Dispatch by mode: agent loop for `run`, graph engine for
    /// `graph-run` / `resume`. Errors come back as (machine code, message).
    async fn execute(
        &self,
        run: &Run,
        payload: &TaskPayload,
    ) -> std::result::Result<String, (&'static str, String)> {
        match run.mode {
            RunMode::Run => {
                let mut agent = AgentLoop::new(
                    self.provider.clone(),
                    self.tools.clone(),
                    self.store.clone(),
                    self.events.clone(),
                    self.agent_options.clone(),
                );
                if let Some(sleeper) = &self.sleeper {
                    agent = agent.with_sleeper(sleeper.clone());
                }
                if let Some(jitter) = &self.jitter {
                    agent = agent.with_jitter(jitter.clone());
                }
                agent
                    .run(run, &self.cancel)
                    .await
                    .map_err(|e: AgentError| (e.machine_code(), e.to_string()))
            }
            RunMode::GraphRun | RunMode::Resume => {
                let name = payload
                    .workflow
                    .as_deref()
                    .or(run.workflow.as_deref())
                    .unwrap_or_default();
                let workflow = self
                    .workflows
                    .get(name)
                    .ok_or_else(|| ("ValidationError", format!("unknown workflow {name:?}")))?;
                let engine = GraphEngine::new(self.store.clone(), self.events.clone());
                engine
                    .run(&workflow, run, &self.cancel)
                    .await
                    .map(|report| report.output)
                    .map_err(|e: GraphError| (e.machine_code(), e.to_string()))
            }
        }
    }

    fn spawn_keepalive(&self, task_id: String) -> CancellationToken {
        let token = self.cancel.child_token();
        let stop = token.clone();
        let queue = self.queue.clone();
        let worker_id = self.id.clone();
        let interval = self.settings.extend_interval();
        let visibility = self.settings.task_visibility;
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {
                        if queue.extend(&task_id, &worker_id, visibility).await.is_err() {
                            break;
                        }
                    }
                }
            }
        });
        token
    }

    async fn emit(&self, event: RunEvent) {
        let _ = self.events.emit(event).await;
    }
}

fn completion_event(run: &Run) -> RunEvent {
    let mut event = RunEvent::new(&run.run_id, EventKind::Queue)
        .with_attr("phase", json!("completed"))
        .with_attr("status", json!(run.status.encode()));
    if let Some(target) = crate::delivery::DeliveryTarget::from_metadata(&run.metadata) {
        event = event.with_attr("delivery", target.to_value());
    }
    event
}
