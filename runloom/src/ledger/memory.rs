use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use super::{
    Attempt, AttemptLedger, AttemptStatus, LedgerError, Result, WorkerRegistration, WorkerStatus,
};

#[derive(Default)]
struct Inner {
    attempts: FxHashMap<String, Vec<Attempt>>,
    workers: FxHashMap<String, WorkerRegistration>,
}

/// Volatile ledger for tests. The single lock makes check-and-insert in
/// `open_attempt` atomic.
#[derive(Default)]
pub struct MemoryLedger {
    inner: Mutex<Inner>,
}

impl MemoryLedger {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AttemptLedger for MemoryLedger {
    async fn open_attempt(&self, run_id: &str, worker_id: &str) -> Result<u32> {
        let mut inner = self.inner.lock();
        let attempts = inner.attempts.entry(run_id.to_string()).or_default();
        if attempts
            .iter()
            .any(|a| a.status == AttemptStatus::InFlight)
        {
            return Err(LedgerError::DuplicateInFlight {
                run_id: run_id.to_string(),
            });
        }
        let attempt = attempts.len() as u32 + 1;
        attempts.push(Attempt {
            run_id: run_id.to_string(),
            attempt,
            worker_id: worker_id.to_string(),
            status: AttemptStatus::InFlight,
            started_at: Utc::now(),
            ended_at: None,
            error: None,
        });
        Ok(attempt)
    }

    async fn close_attempt(
        &self,
        run_id: &str,
        attempt: u32,
        status: AttemptStatus,
        error: Option<String>,
    ) -> Result<()> {
        let mut inner = self.inner.lock();
        let attempts = inner
            .attempts
            .get_mut(run_id)
            .ok_or_else(|| LedgerError::AttemptNotFound {
                run_id: run_id.to_string(),
                attempt,
            })?;
        let entry = attempts
            .iter_mut()
            .find(|a| a.attempt == attempt)
            .ok_or_else(|| LedgerError::AttemptNotFound {
                run_id: run_id.to_string(),
                attempt,
            })?;
        entry.status = status;
        entry.ended_at = Some(Utc::now());
        entry.error = error;
        Ok(())
    }

    async fn list_attempts(&self, run_id: &str) -> Result<Vec<Attempt>> {
        Ok(self
            .inner
            .lock()
            .attempts
            .get(run_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn current_in_flight(&self, run_id: &str) -> Result<Option<Attempt>> {
        Ok(self
            .inner
            .lock()
            .attempts
            .get(run_id)
            .and_then(|v| v.iter().find(|a| a.status == AttemptStatus::InFlight))
            .cloned())
    }

    async fn mark_lost(&self, run_id: &str) -> Result<Option<u32>> {
        let mut inner = self.inner.lock();
        let Some(attempts) = inner.attempts.get_mut(run_id) else {
            return Ok(None);
        };
        for entry in attempts.iter_mut() {
            if entry.status == AttemptStatus::InFlight {
                entry.status = AttemptStatus::Lost;
                entry.ended_at = Some(Utc::now());
                return Ok(Some(entry.attempt));
            }
        }
        Ok(None)
    }

    async fn open_attempts_for_worker(&self, worker_id: &str) -> Result<Vec<Attempt>> {
        Ok(self
            .inner
            .lock()
            .attempts
            .values()
            .flatten()
            .filter(|a| a.status == AttemptStatus::InFlight && a.worker_id == worker_id)
            .cloned()
            .collect())
    }

    async fn upsert_heartbeat(
        &self,
        worker_id: &str,
        status: WorkerStatus,
        active_task_count: u32,
    ) -> Result<()> {
        self.inner.lock().workers.insert(
            worker_id.to_string(),
            WorkerRegistration {
                worker_id: worker_id.to_string(),
                status,
                last_heartbeat_at: Utc::now(),
                active_task_count,
            },
        );
        Ok(())
    }

    async fn list_workers(&self) -> Result<Vec<WorkerRegistration>> {
        let mut workers: Vec<_> = self.inner.lock().workers.values().cloned().collect();
        workers.sort_by(|a, b| a.worker_id.cmp(&b.worker_id));
        Ok(workers)
    }

    async fn get_worker(&self, worker_id: &str) -> Result<Option<WorkerRegistration>> {
        Ok(self.inner.lock().workers.get(worker_id).cloned())
    }

    async fn set_worker_status(&self, worker_id: &str, status: WorkerStatus) -> Result<()> {
        let mut inner = self.inner.lock();
        let worker = inner
            .workers
            .get_mut(worker_id)
            .ok_or_else(|| LedgerError::WorkerNotFound {
                worker_id: worker_id.to_string(),
            })?;
        worker.status = status;
        Ok(())
    }

    async fn stale_workers(&self, cutoff: DateTime<Utc>) -> Result<Vec<WorkerRegistration>> {
        Ok(self
            .inner
            .lock()
            .workers
            .values()
            .filter(|w| {
                w.last_heartbeat_at < cutoff
                    && !matches!(w.status, WorkerStatus::Disabled | WorkerStatus::Lost)
            })
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn second_in_flight_attempt_is_rejected() {
        let ledger = MemoryLedger::new();
        let first = ledger.open_attempt("run-1", "w1").await.unwrap();
        assert_eq!(first, 1);
        let err = ledger.open_attempt("run-1", "w2").await.unwrap_err();
        assert!(matches!(err, LedgerError::DuplicateInFlight { .. }));

        ledger
            .close_attempt("run-1", 1, AttemptStatus::Failed, Some("boom".into()))
            .await
            .unwrap();
        let second = ledger.open_attempt("run-1", "w2").await.unwrap();
        assert_eq!(second, 2);
    }

    #[tokio::test]
    async fn mark_lost_closes_the_open_attempt() {
        let ledger = MemoryLedger::new();
        ledger.open_attempt("run-1", "w1").await.unwrap();
        assert_eq!(ledger.mark_lost("run-1").await.unwrap(), Some(1));
        assert_eq!(ledger.mark_lost("run-1").await.unwrap(), None);
        let attempts = ledger.list_attempts("run-1").await.unwrap();
        assert_eq!(attempts[0].status, AttemptStatus::Lost);
    }
}
