/*!
SQLite work queue.

Tasks live in one table with a `state` discriminator (`ready` / `claimed`);
visibility expiry is handled lazily inside the claim transaction, so a
crashed worker's tasks return to `ready` the next time anyone claims. The
sweeper's leader key lives in the `leases` table of the same database.
*/

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use tracing::instrument;

use super::{
    ClaimedTask, DeadLetter, LeaderLease, PendingRecord, QueueError, QueueStats, Result,
    TaskPayload, WorkQueue,
};
use crate::store::sqlite_support;

const CLAIM_POLL: Duration = Duration::from_millis(50);

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS tasks (
  id             TEXT PRIMARY KEY,
  run_id         TEXT NOT NULL,
  payload        TEXT NOT NULL,
  state          TEXT NOT NULL DEFAULT 'ready',
  consumer       TEXT,
  delivery_count INTEGER NOT NULL DEFAULT 0,
  not_before     TEXT NOT NULL,
  deadline       TEXT,
  claimed_at     TEXT,
  enqueued_at    TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_tasks_state ON tasks(state, not_before);
CREATE INDEX IF NOT EXISTS idx_tasks_run ON tasks(run_id);
CREATE TABLE IF NOT EXISTS dead_letters (
  id             TEXT PRIMARY KEY,
  task_json      TEXT NOT NULL,
  received_at    TEXT NOT NULL,
  failure_reason TEXT NOT NULL,
  delivery_count INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS leases (
  name       TEXT PRIMARY KEY,
  holder     TEXT NOT NULL,
  expires_at TEXT NOT NULL
);
"#;

/// Durable queue backed by SQLite through sqlx.
pub struct SqliteQueue {
    pool: Arc<SqlitePool>,
    visibility: Duration,
}

impl SqliteQueue {
    /// Open (or create) the queue database at `path`. `visibility` is the
    /// window applied to every claim.
    #[instrument(skip(path))]
    pub async fn connect(path: &str, visibility: Duration) -> Result<Self> {
        let pool = sqlite_support::open_pool(path)
            .await
            .map_err(|e| QueueError::Unavailable {
                message: e.to_string(),
            })?;
        sqlx::raw_sql(SCHEMA)
            .execute(&pool)
            .await
            .map_err(unavailable)?;
        Ok(Self {
            pool: Arc::new(pool),
            visibility,
        })
    }

    async fn enqueue_inner(&self, task: TaskPayload, not_before: DateTime<Utc>) -> Result<String> {
        let payload = serde_json::to_string(&task)?;
        let mut tx = self.pool.begin().await.map_err(unavailable)?;
        let existing: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM tasks WHERE run_id = ?1")
            .bind(&task.run_id)
            .fetch_one(&mut *tx)
            .await
            .map_err(unavailable)?;
        if existing > 0 {
            return Err(QueueError::DuplicateInFlight {
                run_id: task.run_id,
            });
        }
        let task_id = uuid::Uuid::new_v4().simple().to_string();
        sqlx::query(
            r#"
            INSERT INTO tasks (id, run_id, payload, state, not_before, enqueued_at)
            VALUES (?1, ?2, ?3, 'ready', ?4, ?5)
            "#,
        )
        .bind(&task_id)
        .bind(&task.run_id)
        .bind(&payload)
        .bind(not_before.to_rfc3339())
        .bind(task.enqueued_at.to_rfc3339())
        .execute(&mut *tx)
        .await
        .map_err(unavailable)?;
        tx.commit().await.map_err(unavailable)?;
        Ok(task_id)
    }

    /// One claim pass: release expired visibility windows, then take up to
    /// `count` ready tasks.
    async fn claim_once(&self, worker_id: &str, count: u32) -> Result<Vec<ClaimedTask>> {
        let now = Utc::now();
        let deadline = now + chrono::Duration::from_std(self.visibility).unwrap_or_default();
        let mut tx = self.pool.begin().await.map_err(unavailable)?;
        sqlx::query(
            "UPDATE tasks SET state = 'ready', consumer = NULL, not_before = ?1
             WHERE state = 'claimed' AND deadline <= ?1",
        )
        .bind(now.to_rfc3339())
        .execute(&mut *tx)
        .await
        .map_err(unavailable)?;

        let rows = sqlx::query(
            "SELECT id, payload, delivery_count FROM tasks
             WHERE state = 'ready' AND not_before <= ?1
             ORDER BY enqueued_at ASC LIMIT ?2",
        )
        .bind(now.to_rfc3339())
        .bind(count as i64)
        .fetch_all(&mut *tx)
        .await
        .map_err(unavailable)?;

        let mut claimed = Vec::with_capacity(rows.len());
        for row in rows {
            let task_id: String = row.get("id");
            let payload: String = row.get("payload");
            let delivery_count = row.get::<i64, _>("delivery_count") as u32 + 1;
            sqlx::query(
                "UPDATE tasks SET state = 'claimed', consumer = ?2, delivery_count = ?3,
                        deadline = ?4, claimed_at = ?5
                 WHERE id = ?1",
            )
            .bind(&task_id)
            .bind(worker_id)
            .bind(delivery_count as i64)
            .bind(deadline.to_rfc3339())
            .bind(now.to_rfc3339())
            .execute(&mut *tx)
            .await
            .map_err(unavailable)?;
            claimed.push(ClaimedTask {
                task_id,
                payload: serde_json::from_str(&payload)?,
                delivery_count,
            });
        }
        tx.commit().await.map_err(unavailable)?;
        Ok(claimed)
    }

    /// Guarded single-row transition for ack/nack/extend.
    async fn owned_task(&self, task_id: &str, worker_id: &str) -> Result<()> {
        let row = sqlx::query("SELECT consumer, state FROM tasks WHERE id = ?1")
            .bind(task_id)
            .fetch_optional(&*self.pool)
            .await
            .map_err(unavailable)?
            .ok_or_else(|| QueueError::TaskNotFound {
                task_id: task_id.to_string(),
            })?;
        let state: String = row.get("state");
        let consumer: Option<String> = row.get("consumer");
        if state != "claimed" || consumer.as_deref() != Some(worker_id) {
            return Err(QueueError::WrongConsumer {
                task_id: task_id.to_string(),
                worker_id: worker_id.to_string(),
            });
        }
        Ok(())
    }

    fn row_to_dead_letter(row: &SqliteRow) -> Result<DeadLetter> {
        let task_json: String = row.get("task_json");
        Ok(DeadLetter {
            dlq_id: row.get("id"),
            task: serde_json::from_str(&task_json)?,
            received_at: sqlite_support::parse_ts(row.get::<String, _>("received_at").as_str()),
            failure_reason: row.get("failure_reason"),
            delivery_count: row.get::<i64, _>("delivery_count") as u32,
        })
    }
}

fn unavailable(e: sqlx::Error) -> QueueError {
    QueueError::Unavailable {
        message: e.to_string(),
    }
}

#[async_trait]
impl WorkQueue for SqliteQueue {
    async fn enqueue(&self, task: TaskPayload) -> Result<String> {
        self.enqueue_inner(task, Utc::now()).await
    }

    async fn enqueue_after(&self, task: TaskPayload, delay: Duration) -> Result<String> {
        let not_before = Utc::now() + chrono::Duration::from_std(delay).unwrap_or_default();
        self.enqueue_inner(task, not_before).await
    }

    #[instrument(skip(self), err)]
    async fn claim(
        &self,
        worker_id: &str,
        count: u32,
        block_for: Duration,
    ) -> Result<Vec<ClaimedTask>> {
        let wait_until = tokio::time::Instant::now() + block_for;
        loop {
            let claimed = self.claim_once(worker_id, count).await?;
            if !claimed.is_empty() || tokio::time::Instant::now() >= wait_until {
                return Ok(claimed);
            }
            tokio::time::sleep(CLAIM_POLL).await;
        }
    }

    async fn extend(&self, task_id: &str, worker_id: &str, duration: Duration) -> Result<()> {
        self.owned_task(task_id, worker_id).await?;
        let deadline = Utc::now() + chrono::Duration::from_std(duration).unwrap_or_default();
        sqlx::query("UPDATE tasks SET deadline = ?2 WHERE id = ?1")
            .bind(task_id)
            .bind(deadline.to_rfc3339())
            .execute(&*self.pool)
            .await
            .map_err(unavailable)?;
        Ok(())
    }

    async fn ack(&self, task_id: &str, worker_id: &str) -> Result<()> {
        self.owned_task(task_id, worker_id).await?;
        sqlx::query("DELETE FROM tasks WHERE id = ?1")
            .bind(task_id)
            .execute(&*self.pool)
            .await
            .map_err(unavailable)?;
        Ok(())
    }

    async fn nack(&self, task_id: &str, worker_id: &str, requeue_after: Duration) -> Result<()> {
        self.owned_task(task_id, worker_id).await?;
        let not_before = Utc::now() + chrono::Duration::from_std(requeue_after).unwrap_or_default();
        sqlx::query(
            "UPDATE tasks SET state = 'ready', consumer = NULL, not_before = ?2 WHERE id = ?1",
        )
        .bind(task_id)
        .bind(not_before.to_rfc3339())
        .execute(&*self.pool)
        .await
        .map_err(unavailable)?;
        Ok(())
    }

    async fn list_pending(&self) -> Result<Vec<PendingRecord>> {
        let now = Utc::now();
        let rows = sqlx::query(
            "SELECT id, consumer, claimed_at, delivery_count FROM tasks WHERE state = 'claimed'",
        )
        .fetch_all(&*self.pool)
        .await
        .map_err(unavailable)?;
        Ok(rows
            .iter()
            .map(|r| {
                let claimed_at = r
                    .get::<Option<String>, _>("claimed_at")
                    .map(|s| sqlite_support::parse_ts(&s))
                    .unwrap_or(now);
                PendingRecord {
                    task_id: r.get("id"),
                    consumer: r.get::<Option<String>, _>("consumer").unwrap_or_default(),
                    idle_ms: (now - claimed_at).num_milliseconds().max(0) as u64,
                    delivery_count: r.get::<i64, _>("delivery_count") as u32,
                }
            })
            .collect())
    }

    #[instrument(skip(self), err)]
    async fn move_dead_letter(&self, task_id: &str, reason: &str) -> Result<String> {
        let mut tx = self.pool.begin().await.map_err(unavailable)?;
        let row = sqlx::query("SELECT payload, delivery_count FROM tasks WHERE id = ?1")
            .bind(task_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(unavailable)?
            .ok_or_else(|| QueueError::TaskNotFound {
                task_id: task_id.to_string(),
            })?;
        let payload: String = row.get("payload");
        let delivery_count: i64 = row.get("delivery_count");
        sqlx::query("DELETE FROM tasks WHERE id = ?1")
            .bind(task_id)
            .execute(&mut *tx)
            .await
            .map_err(unavailable)?;
        let dlq_id = uuid::Uuid::new_v4().simple().to_string();
        sqlx::query(
            r#"
            INSERT INTO dead_letters (id, task_json, received_at, failure_reason, delivery_count)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
        )
        .bind(&dlq_id)
        .bind(&payload)
        .bind(Utc::now().to_rfc3339())
        .bind(reason)
        .bind(delivery_count)
        .execute(&mut *tx)
        .await
        .map_err(unavailable)?;
        tx.commit().await.map_err(unavailable)?;
        Ok(dlq_id)
    }

    async fn get_dead_letter(&self, dlq_id: &str) -> Result<Option<DeadLetter>> {
        let row = sqlx::query("SELECT * FROM dead_letters WHERE id = ?1")
            .bind(dlq_id)
            .fetch_optional(&*self.pool)
            .await
            .map_err(unavailable)?;
        row.as_ref().map(Self::row_to_dead_letter).transpose()
    }

    async fn list_dead_letters(&self) -> Result<Vec<DeadLetter>> {
        let rows = sqlx::query("SELECT * FROM dead_letters ORDER BY received_at ASC")
            .fetch_all(&*self.pool)
            .await
            .map_err(unavailable)?;
        rows.iter().map(Self::row_to_dead_letter).collect()
    }

    #[instrument(skip(self), err)]
    async fn requeue_dlq(&self, dlq_id: &str) -> Result<String> {
        let mut tx = self.pool.begin().await.map_err(unavailable)?;
        let row = sqlx::query("SELECT task_json FROM dead_letters WHERE id = ?1")
            .bind(dlq_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(unavailable)?
            .ok_or_else(|| QueueError::DeadLetterNotFound {
                dlq_id: dlq_id.to_string(),
            })?;
        let task_json: String = row.get("task_json");
        let task: TaskPayload = serde_json::from_str(&task_json)?;
        sqlx::query("DELETE FROM dead_letters WHERE id = ?1")
            .bind(dlq_id)
            .execute(&mut *tx)
            .await
            .map_err(unavailable)?;
        let task_id = uuid::Uuid::new_v4().simple().to_string();
        sqlx::query(
            r#"
            INSERT INTO tasks (id, run_id, payload, state, not_before, enqueued_at)
            VALUES (?1, ?2, ?3, 'ready', ?4, ?5)
            "#,
        )
        .bind(&task_id)
        .bind(&task.run_id)
        .bind(&task_json)
        .bind(Utc::now().to_rfc3339())
        .bind(task.enqueued_at.to_rfc3339())
        .execute(&mut *tx)
        .await
        .map_err(unavailable)?;
        tx.commit().await.map_err(unavailable)?;
        Ok(task_id)
    }

    async fn stats(&self) -> Result<QueueStats> {
        let stream_length: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM tasks")
            .fetch_one(&*self.pool)
            .await
            .map_err(unavailable)?;
        let pending: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM tasks WHERE state = 'claimed'")
                .fetch_one(&*self.pool)
                .await
                .map_err(unavailable)?;
        let dlq_length: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM dead_letters")
            .fetch_one(&*self.pool)
            .await
            .map_err(unavailable)?;
        Ok(QueueStats {
            stream_length: stream_length as u64,
            pending: pending as u64,
            dlq_length: dlq_length as u64,
        })
    }
}

#[async_trait]
impl LeaderLease for SqliteQueue {
    async fn try_acquire(&self, name: &str, holder: &str, ttl: Duration) -> Result<bool> {
        let now = Utc::now();
        let expires = now + chrono::Duration::from_std(ttl).unwrap_or_default();
        let updated = sqlx::query(
            r#"
            INSERT INTO leases (name, holder, expires_at) VALUES (?1, ?2, ?3)
            ON CONFLICT(name) DO UPDATE SET holder = excluded.holder, expires_at = excluded.expires_at
            WHERE leases.holder = excluded.holder OR leases.expires_at <= ?4
            "#,
        )
        .bind(name)
        .bind(holder)
        .bind(expires.to_rfc3339())
        .bind(now.to_rfc3339())
        .execute(&*self.pool)
        .await
        .map_err(unavailable)?;
        Ok(updated.rows_affected() > 0)
    }
}
