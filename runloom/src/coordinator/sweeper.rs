use std::sync::Arc;

use chrono::Utc;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use super::{Coordinator, Result};
use crate::config::RuntimeSettings;
use crate::ledger::{AttemptLedger, WorkerStatus};
use crate::observe::{EventKind, EventSink, RunEvent};
use crate::queue::LeaderLease;

/// Leader key guarding the sweeper when several coordinator processes run.
pub const SWEEPER_LEASE: &str = "runloom:sweeper";

/// Periodic background task that detects lost workers.
///
/// A worker with no heartbeat past `heartbeat_timeout` is marked lost and
/// its in-flight attempts are closed as `lost`. The tasks themselves
/// redeliver through queue visibility expiry; the sweeper only repairs the
/// ledger. With a lease configured, at most one sweeper is active per
/// cluster per sweep window.
pub struct Sweeper {
    id: String,
    ledger: Arc<dyn AttemptLedger>,
    events: Arc<dyn EventSink>,
    lease: Option<Arc<dyn LeaderLease>>,
    settings: RuntimeSettings,
}

impl Sweeper {
    #[must_use]
    pub fn new(coordinator: &Coordinator, lease: Option<Arc<dyn LeaderLease>>) -> Self {
        Self {
            id: format!("sweeper-{}", uuid::Uuid::new_v4().simple()),
            ledger: coordinator.ledger.clone(),
            events: coordinator.events.clone(),
            lease,
            settings: coordinator.settings.clone(),
        }
    }

    /// Run sweep passes every `heartbeat_interval` until cancelled.
    #[instrument(skip(self, cancel), fields(sweeper_id = %self.id))]
    pub async fn run(&self, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.settings.heartbeat_interval) => {
                    if let Err(error) = self.sweep_once().await {
                        tracing::warn!(%error, "sweep pass failed");
                    }
                }
            }
        }
    }

    /// One sweep pass. Returns the number of attempts closed as lost.
    pub async fn sweep_once(&self) -> Result<u32> {
        if let Some(lease) = &self.lease {
            let window = self.settings.heartbeat_interval * 2;
            if !lease.try_acquire(SWEEPER_LEASE, &self.id, window).await? {
                return Ok(0);
            }
        }
        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.settings.heartbeat_timeout).unwrap_or_default();
        let mut closed = 0u32;
        for worker in self.ledger.stale_workers(cutoff).await? {
            for attempt in self
                .ledger
                .open_attempts_for_worker(&worker.worker_id)
                .await?
            {
                if let Some(number) = self.ledger.mark_lost(&attempt.run_id).await? {
                    closed += 1;
                    let _ = self
                        .events
                        .emit(
                            RunEvent::new(&attempt.run_id, EventKind::Queue)
                                .with_attr("phase", json!("attempt-lost"))
                                .with_attr("attempt", json!(number))
                                .with_attr("worker_id", json!(worker.worker_id)),
                        )
                        .await;
                }
            }
            self.ledger
                .set_worker_status(&worker.worker_id, WorkerStatus::Lost)
                .await?;
        }
        Ok(closed)
    }
}
