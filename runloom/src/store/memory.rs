use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use super::{
    apply_patch, ChatMessage, Result, Run, RunCheckpoint, RunFilter, RunPatch, Session, StateStore,
    StoreError,
};
use crate::observe::RunEvent;

#[derive(Default)]
struct Inner {
    sessions: FxHashMap<String, Session>,
    runs: FxHashMap<String, Run>,
    messages: FxHashMap<String, Vec<ChatMessage>>,
    checkpoints: FxHashMap<String, Vec<RunCheckpoint>>,
    events: FxHashMap<String, Vec<RunEvent>>,
}

/// Volatile state store for tests and single-process development.
///
/// One lock guards everything, which trivially satisfies the per-run
/// sequential consistency requirement.
#[derive(Default)]
pub struct MemoryStateStore {
    inner: Mutex<Inner>,
}

impl MemoryStateStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn create_session(&self, session: Session) -> Result<Session> {
        let mut inner = self.inner.lock();
        if inner.sessions.contains_key(&session.session_id) {
            return Err(StoreError::Duplicate {
                id: session.session_id,
            });
        }
        inner
            .sessions
            .insert(session.session_id.clone(), session.clone());
        Ok(session)
    }

    async fn get_session(&self, session_id: &str) -> Result<Option<Session>> {
        Ok(self.inner.lock().sessions.get(session_id).cloned())
    }

    async fn create_run(&self, run: Run) -> Result<Run> {
        let mut inner = self.inner.lock();
        if inner.runs.contains_key(&run.run_id) {
            return Err(StoreError::Duplicate { id: run.run_id });
        }
        inner.runs.insert(run.run_id.clone(), run.clone());
        Ok(run)
    }

    async fn get_run(&self, run_id: &str) -> Result<Run> {
        self.inner
            .lock()
            .runs
            .get(run_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound {
                what: "run",
                id: run_id.to_string(),
            })
    }

    async fn update_run(
        &self,
        run_id: &str,
        patch: RunPatch,
        expected_status: Option<super::RunStatus>,
    ) -> Result<Run> {
        let mut inner = self.inner.lock();
        let run = inner
            .runs
            .get_mut(run_id)
            .ok_or_else(|| StoreError::NotFound {
                what: "run",
                id: run_id.to_string(),
            })?;
        if let Some(expected) = expected_status {
            if run.status != expected {
                return Err(StoreError::StaleState {
                    run_id: run_id.to_string(),
                    expected,
                    actual: run.status,
                });
            }
        }
        if run.status.is_terminal() && !patch.override_terminal {
            return Err(StoreError::AlreadyTerminal {
                run_id: run_id.to_string(),
                status: run.status,
            });
        }
        apply_patch(run, &patch);
        Ok(run.clone())
    }

    async fn list_runs(&self, filter: RunFilter, limit: u32) -> Result<Vec<Run>> {
        let inner = self.inner.lock();
        let mut runs: Vec<Run> = inner
            .runs
            .values()
            .filter(|r| {
                filter
                    .session_id
                    .as_ref()
                    .map_or(true, |s| &r.session_id == s)
                    && filter.status.map_or(true, |st| r.status == st)
            })
            .cloned()
            .collect();
        runs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        runs.truncate(limit as usize);
        Ok(runs)
    }

    async fn append_message(&self, message: ChatMessage) -> Result<()> {
        self.inner
            .lock()
            .messages
            .entry(message.run_id.clone())
            .or_default()
            .push(message);
        Ok(())
    }

    async fn list_messages(
        &self,
        run_id: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<ChatMessage>> {
        let inner = self.inner.lock();
        let messages = inner.messages.get(run_id).cloned().unwrap_or_default();
        Ok(match since {
            Some(since) => messages
                .into_iter()
                .filter(|m| m.created_at > since)
                .collect(),
            None => messages,
        })
    }

    async fn save_checkpoint(&self, checkpoint: RunCheckpoint) -> Result<()> {
        let mut inner = self.inner.lock();
        let entries = inner.checkpoints.entry(checkpoint.run_id.clone()).or_default();
        let expected = entries.last().map_or(1, |c| c.seq + 1);
        if checkpoint.seq != expected {
            return Err(StoreError::CheckpointGap {
                run_id: checkpoint.run_id,
                expected,
                got: checkpoint.seq,
            });
        }
        entries.push(checkpoint);
        Ok(())
    }

    async fn list_checkpoints(
        &self,
        run_id: &str,
        until_seq: Option<u64>,
    ) -> Result<Vec<RunCheckpoint>> {
        let inner = self.inner.lock();
        let entries = inner.checkpoints.get(run_id).cloned().unwrap_or_default();
        Ok(match until_seq {
            Some(until) => entries.into_iter().filter(|c| c.seq <= until).collect(),
            None => entries,
        })
    }

    async fn latest_checkpoint(
        &self,
        run_id: &str,
        until_seq: Option<u64>,
    ) -> Result<Option<RunCheckpoint>> {
        Ok(self
            .list_checkpoints(run_id, until_seq)
            .await?
            .into_iter()
            .last())
    }

    async fn truncate_checkpoints(&self, run_id: &str, after_seq: u64) -> Result<()> {
        if let Some(entries) = self.inner.lock().checkpoints.get_mut(run_id) {
            entries.retain(|c| c.seq <= after_seq);
        }
        Ok(())
    }

    async fn append_event(&self, event: RunEvent) -> Result<()> {
        self.inner
            .lock()
            .events
            .entry(event.run_id.clone())
            .or_default()
            .push(event);
        Ok(())
    }

    async fn list_events(&self, run_id: &str) -> Result<Vec<RunEvent>> {
        let inner = self.inner.lock();
        let mut events = inner.events.get(run_id).cloned().unwrap_or_default();
        // Stable sort keeps arrival order among equal timestamps.
        events.sort_by_key(|e| e.timestamp);
        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{RunMode, RunStatus};

    fn run(id: &str) -> Run {
        Run {
            run_id: id.to_string(),
            session_id: "sess-1".to_string(),
            input: "hi".to_string(),
            mode: RunMode::Run,
            workflow: None,
            status: RunStatus::Pending,
            provider: None,
            max_attempts: 3,
            attempts_used: 0,
            output: None,
            error: None,
            metadata: FxHashMap::default(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn guarded_update_rejects_stale_status() {
        let store = MemoryStateStore::new();
        store.create_run(run("r1")).await.unwrap();
        store
            .update_run("r1", RunPatch::status(RunStatus::Claimed), Some(RunStatus::Pending))
            .await
            .unwrap();
        let err = store
            .update_run("r1", RunPatch::status(RunStatus::Claimed), Some(RunStatus::Pending))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::StaleState { .. }));
    }

    #[tokio::test]
    async fn terminal_runs_are_immutable() {
        let store = MemoryStateStore::new();
        store.create_run(run("r1")).await.unwrap();
        store
            .update_run("r1", RunPatch::status(RunStatus::Succeeded), None)
            .await
            .unwrap();
        let err = store
            .update_run("r1", RunPatch::status(RunStatus::Pending), None)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::AlreadyTerminal { .. }));

        // The designated intervention path may leave a terminal status.
        store
            .update_run(
                "r1",
                RunPatch::status(RunStatus::Pending).allow_terminal(),
                None,
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn checkpoint_sequence_is_dense() {
        let store = MemoryStateStore::new();
        let cp = |seq| RunCheckpoint {
            run_id: "r1".to_string(),
            seq,
            node_id: "n".to_string(),
            output: serde_json::Value::Null,
            state: FxHashMap::default(),
            frontier: vec![],
            created_at: Utc::now(),
        };
        store.save_checkpoint(cp(1)).await.unwrap();
        let err = store.save_checkpoint(cp(3)).await.unwrap_err();
        assert!(matches!(err, StoreError::CheckpointGap { expected: 2, .. }));
        store.save_checkpoint(cp(2)).await.unwrap();
        store.truncate_checkpoints("r1", 1).await.unwrap();
        let latest = store.latest_checkpoint("r1", None).await.unwrap().unwrap();
        assert_eq!(latest.seq, 1);
    }
}
