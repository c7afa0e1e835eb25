/*!
SQLite attempt ledger.

The unique-in-flight constraint is a partial unique index on
`attempts(run_id) WHERE status = 'in-flight'`; `open_attempt` relies on the
resulting constraint violation to reject concurrent claims atomically.
*/

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use tracing::instrument;

use super::{
    Attempt, AttemptLedger, AttemptStatus, LedgerError, Result, WorkerRegistration, WorkerStatus,
};
use crate::store::sqlite_support;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS attempts (
  run_id     TEXT NOT NULL,
  attempt    INTEGER NOT NULL,
  worker_id  TEXT NOT NULL,
  status     TEXT NOT NULL,
  started_at TEXT NOT NULL,
  ended_at   TEXT,
  error      TEXT,
  PRIMARY KEY (run_id, attempt)
);
CREATE UNIQUE INDEX IF NOT EXISTS idx_attempts_in_flight
  ON attempts(run_id) WHERE status = 'in-flight';
CREATE INDEX IF NOT EXISTS idx_attempts_worker
  ON attempts(worker_id) WHERE status = 'in-flight';
CREATE TABLE IF NOT EXISTS workers (
  id                TEXT PRIMARY KEY,
  status            TEXT NOT NULL,
  last_heartbeat_at TEXT NOT NULL,
  active_task_count INTEGER NOT NULL DEFAULT 0
);
"#;

/// Durable attempt ledger backed by SQLite.
pub struct SqliteLedger {
    pool: Arc<SqlitePool>,
}

impl SqliteLedger {
    /// Open (or create) the ledger database at `path`.
    #[instrument(skip(path))]
    pub async fn connect(path: &str) -> Result<Self> {
        let pool = sqlite_support::open_pool(path).await.map_err(to_ledger)?;
        sqlx::raw_sql(SCHEMA)
            .execute(&pool)
            .await
            .map_err(|e| LedgerError::Unavailable {
                message: e.to_string(),
            })?;
        Ok(Self {
            pool: Arc::new(pool),
        })
    }

    fn row_to_attempt(row: &SqliteRow) -> Attempt {
        Attempt {
            run_id: row.get("run_id"),
            attempt: row.get::<i64, _>("attempt") as u32,
            worker_id: row.get("worker_id"),
            status: AttemptStatus::decode(row.get::<String, _>("status").as_str()),
            started_at: sqlite_support::parse_ts(row.get::<String, _>("started_at").as_str()),
            ended_at: row
                .get::<Option<String>, _>("ended_at")
                .map(|s| sqlite_support::parse_ts(&s)),
            error: row.get("error"),
        }
    }

    fn row_to_worker(row: &SqliteRow) -> WorkerRegistration {
        WorkerRegistration {
            worker_id: row.get("id"),
            status: WorkerStatus::decode(row.get::<String, _>("status").as_str()),
            last_heartbeat_at: sqlite_support::parse_ts(
                row.get::<String, _>("last_heartbeat_at").as_str(),
            ),
            active_task_count: row.get::<i64, _>("active_task_count") as u32,
        }
    }
}

fn to_ledger(e: crate::store::StoreError) -> LedgerError {
    LedgerError::Unavailable {
        message: e.to_string(),
    }
}

fn unavailable(e: sqlx::Error) -> LedgerError {
    LedgerError::Unavailable {
        message: e.to_string(),
    }
}

fn is_unique_violation(e: &sqlx::Error) -> bool {
    matches!(e, sqlx::Error::Database(db) if db.message().contains("UNIQUE constraint failed"))
}

#[async_trait]
impl AttemptLedger for SqliteLedger {
    #[instrument(skip(self), err)]
    async fn open_attempt(&self, run_id: &str, worker_id: &str) -> Result<u32> {
        let mut tx = self.pool.begin().await.map_err(unavailable)?;
        let last: Option<i64> =
            sqlx::query_scalar("SELECT MAX(attempt) FROM attempts WHERE run_id = ?1")
                .bind(run_id)
                .fetch_one(&mut *tx)
                .await
                .map_err(unavailable)?;
        let attempt = last.unwrap_or(0) as u32 + 1;
        let insert = sqlx::query(
            r#"
            INSERT INTO attempts (run_id, attempt, worker_id, status, started_at)
            VALUES (?1, ?2, ?3, 'in-flight', ?4)
            "#,
        )
        .bind(run_id)
        .bind(attempt as i64)
        .bind(worker_id)
        .bind(Utc::now().to_rfc3339())
        .execute(&mut *tx)
        .await;
        match insert {
            Ok(_) => {}
            Err(e) if is_unique_violation(&e) => {
                return Err(LedgerError::DuplicateInFlight {
                    run_id: run_id.to_string(),
                });
            }
            Err(e) => return Err(unavailable(e)),
        }
        tx.commit().await.map_err(unavailable)?;
        Ok(attempt)
    }

    async fn close_attempt(
        &self,
        run_id: &str,
        attempt: u32,
        status: AttemptStatus,
        error: Option<String>,
    ) -> Result<()> {
        let updated = sqlx::query(
            "UPDATE attempts SET status = ?3, ended_at = ?4, error = ?5 WHERE run_id = ?1 AND attempt = ?2",
        )
        .bind(run_id)
        .bind(attempt as i64)
        .bind(status.encode())
        .bind(Utc::now().to_rfc3339())
        .bind(&error)
        .execute(&*self.pool)
        .await
        .map_err(unavailable)?;
        if updated.rows_affected() == 0 {
            return Err(LedgerError::AttemptNotFound {
                run_id: run_id.to_string(),
                attempt,
            });
        }
        Ok(())
    }

    async fn list_attempts(&self, run_id: &str) -> Result<Vec<Attempt>> {
        let rows = sqlx::query("SELECT * FROM attempts WHERE run_id = ?1 ORDER BY attempt ASC")
            .bind(run_id)
            .fetch_all(&*self.pool)
            .await
            .map_err(unavailable)?;
        Ok(rows.iter().map(Self::row_to_attempt).collect())
    }

    async fn current_in_flight(&self, run_id: &str) -> Result<Option<Attempt>> {
        let row =
            sqlx::query("SELECT * FROM attempts WHERE run_id = ?1 AND status = 'in-flight'")
                .bind(run_id)
                .fetch_optional(&*self.pool)
                .await
                .map_err(unavailable)?;
        Ok(row.as_ref().map(Self::row_to_attempt))
    }

    async fn mark_lost(&self, run_id: &str) -> Result<Option<u32>> {
        let row = sqlx::query(
            r#"
            UPDATE attempts SET status = 'lost', ended_at = ?2
            WHERE run_id = ?1 AND status = 'in-flight'
            RETURNING attempt
            "#,
        )
        .bind(run_id)
        .bind(Utc::now().to_rfc3339())
        .fetch_optional(&*self.pool)
        .await
        .map_err(unavailable)?;
        Ok(row.map(|r| r.get::<i64, _>("attempt") as u32))
    }

    async fn open_attempts_for_worker(&self, worker_id: &str) -> Result<Vec<Attempt>> {
        let rows =
            sqlx::query("SELECT * FROM attempts WHERE worker_id = ?1 AND status = 'in-flight'")
                .bind(worker_id)
                .fetch_all(&*self.pool)
                .await
                .map_err(unavailable)?;
        Ok(rows.iter().map(Self::row_to_attempt).collect())
    }

    async fn upsert_heartbeat(
        &self,
        worker_id: &str,
        status: WorkerStatus,
        active_task_count: u32,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO workers (id, status, last_heartbeat_at, active_task_count)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(id) DO UPDATE SET
                status = excluded.status,
                last_heartbeat_at = excluded.last_heartbeat_at,
                active_task_count = excluded.active_task_count
            "#,
        )
        .bind(worker_id)
        .bind(status.encode())
        .bind(Utc::now().to_rfc3339())
        .bind(active_task_count as i64)
        .execute(&*self.pool)
        .await
        .map_err(unavailable)?;
        Ok(())
    }

    async fn list_workers(&self) -> Result<Vec<WorkerRegistration>> {
        let rows = sqlx::query("SELECT * FROM workers ORDER BY id ASC")
            .fetch_all(&*self.pool)
            .await
            .map_err(unavailable)?;
        Ok(rows.iter().map(Self::row_to_worker).collect())
    }

    async fn get_worker(&self, worker_id: &str) -> Result<Option<WorkerRegistration>> {
        let row = sqlx::query("SELECT * FROM workers WHERE id = ?1")
            .bind(worker_id)
            .fetch_optional(&*self.pool)
            .await
            .map_err(unavailable)?;
        Ok(row.as_ref().map(Self::row_to_worker))
    }

    async fn set_worker_status(&self, worker_id: &str, status: WorkerStatus) -> Result<()> {
        let updated = sqlx::query("UPDATE workers SET status = ?2 WHERE id = ?1")
            .bind(worker_id)
            .bind(status.encode())
            .execute(&*self.pool)
            .await
            .map_err(unavailable)?;
        if updated.rows_affected() == 0 {
            return Err(LedgerError::WorkerNotFound {
                worker_id: worker_id.to_string(),
            });
        }
        Ok(())
    }

    async fn stale_workers(&self, cutoff: DateTime<Utc>) -> Result<Vec<WorkerRegistration>> {
        let rows = sqlx::query(
            "SELECT * FROM workers WHERE last_heartbeat_at < ?1 AND status IN ('active', 'draining')",
        )
        .bind(cutoff.to_rfc3339())
        .fetch_all(&*self.pool)
        .await
        .map_err(unavailable)?;
        Ok(rows.iter().map(Self::row_to_worker).collect())
    }
}
