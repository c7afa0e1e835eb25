use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use super::{
    ClaimedTask, DeadLetter, LeaderLease, PendingRecord, QueueError, QueueStats, Result,
    TaskPayload, WorkQueue,
};

const CLAIM_POLL: Duration = Duration::from_millis(10);

#[derive(Clone)]
struct ReadyTask {
    task_id: String,
    payload: TaskPayload,
    delivery_count: u32,
    not_before: DateTime<Utc>,
}

#[derive(Clone)]
struct InFlightTask {
    payload: TaskPayload,
    consumer: String,
    claimed_at: DateTime<Utc>,
    deadline: DateTime<Utc>,
    delivery_count: u32,
}

#[derive(Clone)]
struct Lease {
    holder: String,
    expires_at: DateTime<Utc>,
}

#[derive(Default)]
struct Inner {
    ready: Vec<ReadyTask>,
    in_flight: FxHashMap<String, InFlightTask>,
    dead_letters: Vec<DeadLetter>,
    leases: FxHashMap<String, Lease>,
}

impl Inner {
    /// Release tasks whose visibility window expired.
    fn sweep(&mut self, now: DateTime<Utc>) {
        let expired: Vec<String> = self
            .in_flight
            .iter()
            .filter(|(_, t)| t.deadline <= now)
            .map(|(id, _)| id.clone())
            .collect();
        for task_id in expired {
            if let Some(task) = self.in_flight.remove(&task_id) {
                self.ready.push(ReadyTask {
                    task_id,
                    payload: task.payload,
                    delivery_count: task.delivery_count,
                    not_before: now,
                });
            }
        }
    }

    fn has_in_flight_run(&self, run_id: &str) -> bool {
        self.ready.iter().any(|t| t.payload.run_id == run_id)
            || self.in_flight.values().any(|t| t.payload.run_id == run_id)
    }
}

/// In-process queue for tests and single-node development. Mirrors the
/// durable backend's semantics: visibility windows, delivery counts, nack
/// delays, and a dead-letter parking lot.
pub struct MemoryQueue {
    inner: Mutex<Inner>,
    visibility: Duration,
}

impl MemoryQueue {
    #[must_use]
    pub fn new(visibility: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            visibility,
        }
    }

    fn enqueue_inner(&self, task: TaskPayload, not_before: DateTime<Utc>) -> Result<String> {
        let mut inner = self.inner.lock();
        if inner.has_in_flight_run(&task.run_id) {
            return Err(QueueError::DuplicateInFlight {
                run_id: task.run_id,
            });
        }
        let task_id = uuid::Uuid::new_v4().simple().to_string();
        inner.ready.push(ReadyTask {
            task_id: task_id.clone(),
            payload: task,
            delivery_count: 0,
            not_before,
        });
        Ok(task_id)
    }
}

#[async_trait]
impl WorkQueue for MemoryQueue {
    async fn enqueue(&self, task: TaskPayload) -> Result<String> {
        self.enqueue_inner(task, Utc::now())
    }

    async fn enqueue_after(&self, task: TaskPayload, delay: Duration) -> Result<String> {
        let not_before = Utc::now() + chrono::Duration::from_std(delay).unwrap_or_default();
        self.enqueue_inner(task, not_before)
    }

    async fn claim(
        &self,
        worker_id: &str,
        count: u32,
        block_for: Duration,
    ) -> Result<Vec<ClaimedTask>> {
        let deadline = tokio::time::Instant::now() + block_for;
        loop {
            let claimed = {
                let mut inner = self.inner.lock();
                let now = Utc::now();
                inner.sweep(now);
                let mut claimed = Vec::new();
                while claimed.len() < count as usize {
                    let Some(pos) = inner.ready.iter().position(|t| t.not_before <= now) else {
                        break;
                    };
                    let ready = inner.ready.remove(pos);
                    let delivery_count = ready.delivery_count + 1;
                    inner.in_flight.insert(
                        ready.task_id.clone(),
                        InFlightTask {
                            payload: ready.payload.clone(),
                            consumer: worker_id.to_string(),
                            claimed_at: now,
                            deadline: now
                                + chrono::Duration::from_std(self.visibility).unwrap_or_default(),
                            delivery_count,
                        },
                    );
                    claimed.push(ClaimedTask {
                        task_id: ready.task_id,
                        payload: ready.payload,
                        delivery_count,
                    });
                }
                claimed
            };
            if !claimed.is_empty() || tokio::time::Instant::now() >= deadline {
                return Ok(claimed);
            }
            tokio::time::sleep(CLAIM_POLL).await;
        }
    }

    async fn extend(&self, task_id: &str, worker_id: &str, duration: Duration) -> Result<()> {
        let mut inner = self.inner.lock();
        let task = inner
            .in_flight
            .get_mut(task_id)
            .ok_or_else(|| QueueError::TaskNotFound {
                task_id: task_id.to_string(),
            })?;
        if task.consumer != worker_id {
            return Err(QueueError::WrongConsumer {
                task_id: task_id.to_string(),
                worker_id: worker_id.to_string(),
            });
        }
        task.deadline = Utc::now() + chrono::Duration::from_std(duration).unwrap_or_default();
        Ok(())
    }

    async fn ack(&self, task_id: &str, worker_id: &str) -> Result<()> {
        let mut inner = self.inner.lock();
        match inner.in_flight.remove(task_id) {
            Some(task) if task.consumer == worker_id => Ok(()),
            Some(task) => {
                inner.in_flight.insert(task_id.to_string(), task);
                Err(QueueError::WrongConsumer {
                    task_id: task_id.to_string(),
                    worker_id: worker_id.to_string(),
                })
            }
            None => Err(QueueError::TaskNotFound {
                task_id: task_id.to_string(),
            }),
        }
    }

    async fn nack(&self, task_id: &str, worker_id: &str, requeue_after: Duration) -> Result<()> {
        let mut inner = self.inner.lock();
        match inner.in_flight.remove(task_id) {
            Some(task) if task.consumer == worker_id => {
                inner.ready.push(ReadyTask {
                    task_id: task_id.to_string(),
                    payload: task.payload,
                    delivery_count: task.delivery_count,
                    not_before: Utc::now()
                        + chrono::Duration::from_std(requeue_after).unwrap_or_default(),
                });
                Ok(())
            }
            Some(task) => {
                inner.in_flight.insert(task_id.to_string(), task);
                Err(QueueError::WrongConsumer {
                    task_id: task_id.to_string(),
                    worker_id: worker_id.to_string(),
                })
            }
            None => Err(QueueError::TaskNotFound {
                task_id: task_id.to_string(),
            }),
        }
    }

    async fn list_pending(&self) -> Result<Vec<PendingRecord>> {
        let inner = self.inner.lock();
        let now = Utc::now();
        Ok(inner
            .in_flight
            .iter()
            .map(|(task_id, task)| PendingRecord {
                task_id: task_id.clone(),
                consumer: task.consumer.clone(),
                idle_ms: (now - task.claimed_at).num_milliseconds().max(0) as u64,
                delivery_count: task.delivery_count,
            })
            .collect())
    }

    async fn move_dead_letter(&self, task_id: &str, reason: &str) -> Result<String> {
        let mut inner = self.inner.lock();
        let (payload, delivery_count) = if let Some(task) = inner.in_flight.remove(task_id) {
            (task.payload, task.delivery_count)
        } else if let Some(pos) = inner.ready.iter().position(|t| t.task_id == task_id) {
            let task = inner.ready.remove(pos);
            (task.payload, task.delivery_count)
        } else {
            return Err(QueueError::TaskNotFound {
                task_id: task_id.to_string(),
            });
        };
        let dlq_id = uuid::Uuid::new_v4().simple().to_string();
        inner.dead_letters.push(DeadLetter {
            dlq_id: dlq_id.clone(),
            task: payload,
            received_at: Utc::now(),
            failure_reason: reason.to_string(),
            delivery_count,
        });
        Ok(dlq_id)
    }

    async fn get_dead_letter(&self, dlq_id: &str) -> Result<Option<DeadLetter>> {
        Ok(self
            .inner
            .lock()
            .dead_letters
            .iter()
            .find(|d| d.dlq_id == dlq_id)
            .cloned())
    }

    async fn list_dead_letters(&self) -> Result<Vec<DeadLetter>> {
        Ok(self.inner.lock().dead_letters.clone())
    }

    async fn requeue_dlq(&self, dlq_id: &str) -> Result<String> {
        let mut inner = self.inner.lock();
        let pos = inner
            .dead_letters
            .iter()
            .position(|d| d.dlq_id == dlq_id)
            .ok_or_else(|| QueueError::DeadLetterNotFound {
                dlq_id: dlq_id.to_string(),
            })?;
        let dead = inner.dead_letters.remove(pos);
        let task_id = uuid::Uuid::new_v4().simple().to_string();
        inner.ready.push(ReadyTask {
            task_id: task_id.clone(),
            payload: dead.task,
            delivery_count: 0,
            not_before: Utc::now(),
        });
        Ok(task_id)
    }

    async fn stats(&self) -> Result<QueueStats> {
        let inner = self.inner.lock();
        Ok(QueueStats {
            stream_length: (inner.ready.len() + inner.in_flight.len()) as u64,
            pending: inner.in_flight.len() as u64,
            dlq_length: inner.dead_letters.len() as u64,
        })
    }
}

#[async_trait]
impl LeaderLease for MemoryQueue {
    async fn try_acquire(&self, name: &str, holder: &str, ttl: Duration) -> Result<bool> {
        let mut inner = self.inner.lock();
        let now = Utc::now();
        match inner.leases.get(name) {
            Some(lease) if lease.holder != holder && lease.expires_at > now => Ok(false),
            _ => {
                inner.leases.insert(
                    name.to_string(),
                    Lease {
                        holder: holder.to_string(),
                        expires_at: now + chrono::Duration::from_std(ttl).unwrap_or_default(),
                    },
                );
                Ok(true)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::RunMode;

    fn task(run_id: &str) -> TaskPayload {
        TaskPayload {
            run_id: run_id.to_string(),
            session_id: "sess".to_string(),
            input: "hi".to_string(),
            mode: RunMode::Run,
            workflow: None,
            attempt_hint: 1,
            metadata: FxHashMap::default(),
            enqueued_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn duplicate_in_flight_enqueue_is_rejected() {
        let queue = MemoryQueue::new(Duration::from_secs(30));
        queue.enqueue(task("run-1")).await.unwrap();
        let err = queue.enqueue(task("run-1")).await.unwrap_err();
        assert!(matches!(err, QueueError::DuplicateInFlight { .. }));
    }

    #[tokio::test]
    async fn visibility_expiry_makes_task_claimable_again() {
        let queue = MemoryQueue::new(Duration::from_millis(20));
        queue.enqueue(task("run-1")).await.unwrap();
        let first = queue
            .claim("w1", 1, Duration::from_millis(50))
            .await
            .unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].delivery_count, 1);

        tokio::time::sleep(Duration::from_millis(40)).await;
        let second = queue
            .claim("w2", 1, Duration::from_millis(50))
            .await
            .unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].delivery_count, 2);

        // The original claimant lost the task along with its visibility.
        let err = queue.ack(&first[0].task_id, "w1").await.unwrap_err();
        assert!(matches!(err, QueueError::WrongConsumer { .. }));
    }

    #[tokio::test]
    async fn dead_letter_round_trip() {
        let queue = MemoryQueue::new(Duration::from_secs(30));
        queue.enqueue(task("run-1")).await.unwrap();
        let claimed = queue
            .claim("w1", 1, Duration::from_millis(10))
            .await
            .unwrap();
        let dlq_id = queue
            .move_dead_letter(&claimed[0].task_id, "max deliveries exceeded")
            .await
            .unwrap();
        assert_eq!(queue.stats().await.unwrap().dlq_length, 1);

        queue.requeue_dlq(&dlq_id).await.unwrap();
        let stats = queue.stats().await.unwrap();
        assert_eq!(stats.dlq_length, 0);
        assert_eq!(stats.stream_length, 1);
    }
}
