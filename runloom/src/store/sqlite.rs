/*!
SQLite state store.

Maps the logical model onto four tables:

- `sessions(id, metadata_json, created_at)`
- `runs(id, session_id, input, mode, workflow, status, provider,
  max_attempts, attempts_used, output, error, metadata_json,
  created_at, updated_at)`
- `messages(rowid, id, run_id, role, content, tool_name, tool_args_json, created_at)`
- `checkpoints(run_id, seq, node_id, output_json, state_json, frontier_json, created_at)`
- `events(rowid, id, run_id, kind, node_id, duration_ms, attributes_json, timestamp)`

Schema bootstrap is idempotent DDL executed on connect; guarded updates run
inside one transaction so optimistic checks and writes are atomic.
*/

use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use tracing::instrument;

use super::{
    apply_patch, ChatMessage, Result, Run, RunCheckpoint, RunFilter, RunMode, RunPatch, RunStatus,
    Session, StateStore, StoreError,
};
use crate::observe::{EventKind, RunEvent};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS sessions (
  id            TEXT PRIMARY KEY,
  metadata_json TEXT NOT NULL DEFAULT '{}',
  created_at    TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS runs (
  id             TEXT PRIMARY KEY,
  session_id     TEXT NOT NULL,
  input          TEXT NOT NULL,
  mode           TEXT NOT NULL,
  workflow       TEXT,
  status         TEXT NOT NULL,
  provider       TEXT,
  max_attempts   INTEGER NOT NULL,
  attempts_used  INTEGER NOT NULL DEFAULT 0,
  output         TEXT,
  error          TEXT,
  metadata_json  TEXT NOT NULL DEFAULT '{}',
  created_at     TEXT NOT NULL,
  updated_at     TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_runs_session ON runs(session_id);
CREATE INDEX IF NOT EXISTS idx_runs_status ON runs(status);
CREATE TABLE IF NOT EXISTS messages (
  id             TEXT NOT NULL,
  run_id         TEXT NOT NULL,
  role           TEXT NOT NULL,
  content        TEXT NOT NULL,
  tool_name      TEXT,
  tool_args_json TEXT,
  created_at     TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_messages_run ON messages(run_id, rowid);
CREATE TABLE IF NOT EXISTS checkpoints (
  run_id        TEXT NOT NULL,
  seq           INTEGER NOT NULL,
  node_id       TEXT NOT NULL,
  output_json   TEXT NOT NULL,
  state_json    TEXT NOT NULL,
  frontier_json TEXT NOT NULL,
  created_at    TEXT NOT NULL,
  PRIMARY KEY (run_id, seq)
);
CREATE TABLE IF NOT EXISTS events (
  id              TEXT NOT NULL,
  run_id          TEXT NOT NULL,
  kind            TEXT NOT NULL,
  node_id         TEXT,
  duration_ms     INTEGER,
  attributes_json TEXT NOT NULL DEFAULT '{}',
  timestamp       TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_events_run ON events(run_id, timestamp, rowid);
"#;

/// Durable state store backed by SQLite through sqlx.
pub struct SqliteStateStore {
    pool: Arc<SqlitePool>,
}

impl std::fmt::Debug for SqliteStateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStateStore").finish()
    }
}

impl SqliteStateStore {
    /// Open (or create) the database at `path` and ensure the schema.
    #[instrument(skip(path))]
    pub async fn connect(path: &str) -> Result<Self> {
        let pool = open_pool(path).await?;
        sqlx::raw_sql(SCHEMA)
            .execute(&pool)
            .await
            .map_err(backend_err)?;
        Ok(Self {
            pool: Arc::new(pool),
        })
    }

    fn row_to_run(row: &SqliteRow) -> Result<Run> {
        let metadata_json: String = row.get("metadata_json");
        Ok(Run {
            run_id: row.get("id"),
            session_id: row.get("session_id"),
            input: row.get("input"),
            mode: RunMode::decode(row.get::<String, _>("mode").as_str()),
            workflow: row.get("workflow"),
            status: RunStatus::decode(row.get::<String, _>("status").as_str()),
            provider: row.get("provider"),
            max_attempts: row.get::<i64, _>("max_attempts") as u32,
            attempts_used: row.get::<i64, _>("attempts_used") as u32,
            output: row.get("output"),
            error: row.get("error"),
            metadata: serde_json::from_str(&metadata_json)?,
            created_at: parse_ts(row.get::<String, _>("created_at").as_str()),
            updated_at: parse_ts(row.get::<String, _>("updated_at").as_str()),
        })
    }
}

pub(crate) async fn open_pool(path: &str) -> Result<SqlitePool> {
    if let Some(parent) = std::path::Path::new(path).parent() {
        let _ = std::fs::create_dir_all(parent);
    }
    let options = SqliteConnectOptions::from_str(&format!("sqlite://{path}"))
        .map_err(backend_err)?
        .create_if_missing(true);
    SqlitePoolOptions::new()
        .max_connections(4)
        .connect_with(options)
        .await
        .map_err(backend_err)
}

pub(crate) fn backend_err(e: impl std::fmt::Display) -> StoreError {
    StoreError::Unavailable {
        message: e.to_string(),
    }
}

pub(crate) fn parse_ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

#[async_trait]
impl StateStore for SqliteStateStore {
    #[instrument(skip(self, session), err)]
    async fn create_session(&self, session: Session) -> Result<Session> {
        let metadata = serde_json::to_string(&session.metadata)?;
        let inserted = sqlx::query(
            "INSERT OR IGNORE INTO sessions (id, metadata_json, created_at) VALUES (?1, ?2, ?3)",
        )
        .bind(&session.session_id)
        .bind(&metadata)
        .bind(session.created_at.to_rfc3339())
        .execute(&*self.pool)
        .await
        .map_err(backend_err)?;
        if inserted.rows_affected() == 0 {
            return Err(StoreError::Duplicate {
                id: session.session_id,
            });
        }
        Ok(session)
    }

    async fn get_session(&self, session_id: &str) -> Result<Option<Session>> {
        let row = sqlx::query("SELECT id, metadata_json, created_at FROM sessions WHERE id = ?1")
            .bind(session_id)
            .fetch_optional(&*self.pool)
            .await
            .map_err(backend_err)?;
        row.map(|r| {
            let metadata_json: String = r.get("metadata_json");
            Ok(Session {
                session_id: r.get("id"),
                metadata: serde_json::from_str(&metadata_json)?,
                created_at: parse_ts(r.get::<String, _>("created_at").as_str()),
            })
        })
        .transpose()
    }

    #[instrument(skip(self, run), err)]
    async fn create_run(&self, run: Run) -> Result<Run> {
        let metadata = serde_json::to_string(&run.metadata)?;
        let inserted = sqlx::query(
            r#"
            INSERT OR IGNORE INTO runs (
                id, session_id, input, mode, workflow, status, provider,
                max_attempts, attempts_used, output, error, metadata_json,
                created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
            "#,
        )
        .bind(&run.run_id)
        .bind(&run.session_id)
        .bind(&run.input)
        .bind(run.mode.encode())
        .bind(&run.workflow)
        .bind(run.status.encode())
        .bind(&run.provider)
        .bind(run.max_attempts as i64)
        .bind(run.attempts_used as i64)
        .bind(&run.output)
        .bind(&run.error)
        .bind(&metadata)
        .bind(run.created_at.to_rfc3339())
        .bind(run.updated_at.to_rfc3339())
        .execute(&*self.pool)
        .await
        .map_err(backend_err)?;
        if inserted.rows_affected() == 0 {
            return Err(StoreError::Duplicate { id: run.run_id });
        }
        Ok(run)
    }

    async fn get_run(&self, run_id: &str) -> Result<Run> {
        let row = sqlx::query("SELECT * FROM runs WHERE id = ?1")
            .bind(run_id)
            .fetch_optional(&*self.pool)
            .await
            .map_err(backend_err)?
            .ok_or_else(|| StoreError::NotFound {
                what: "run",
                id: run_id.to_string(),
            })?;
        Self::row_to_run(&row)
    }

    #[instrument(skip(self, patch), err)]
    async fn update_run(
        &self,
        run_id: &str,
        patch: RunPatch,
        expected_status: Option<RunStatus>,
    ) -> Result<Run> {
        let mut tx = self.pool.begin().await.map_err(backend_err)?;
        let row = sqlx::query("SELECT * FROM runs WHERE id = ?1")
            .bind(run_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(backend_err)?
            .ok_or_else(|| StoreError::NotFound {
                what: "run",
                id: run_id.to_string(),
            })?;
        let mut run = Self::row_to_run(&row)?;
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
        apply_patch(&mut run, &patch);
        let metadata = serde_json::to_string(&run.metadata)?;
        sqlx::query(
            r#"
            UPDATE runs SET
                status = ?2, attempts_used = ?3, output = ?4, error = ?5,
                metadata_json = ?6, updated_at = ?7
            WHERE id = ?1
            "#,
        )
        .bind(run_id)
        .bind(run.status.encode())
        .bind(run.attempts_used as i64)
        .bind(&run.output)
        .bind(&run.error)
        .bind(&metadata)
        .bind(run.updated_at.to_rfc3339())
        .execute(&mut *tx)
        .await
        .map_err(backend_err)?;
        tx.commit().await.map_err(backend_err)?;
        Ok(run)
    }

    async fn list_runs(&self, filter: RunFilter, limit: u32) -> Result<Vec<Run>> {
        let mut sql = String::from("SELECT * FROM runs WHERE 1=1");
        if filter.session_id.is_some() {
            sql.push_str(" AND session_id = ?1");
        }
        if filter.status.is_some() {
            sql.push_str(" AND status = ?2");
        }
        sql.push_str(" ORDER BY created_at DESC LIMIT ?3");
        let rows = sqlx::query(&sql)
            .bind(filter.session_id.clone().unwrap_or_default())
            .bind(filter.status.map(|s| s.encode()).unwrap_or_default())
            .bind(limit as i64)
            .fetch_all(&*self.pool)
            .await
            .map_err(backend_err)?;
        rows.iter().map(Self::row_to_run).collect()
    }

    async fn append_message(&self, message: ChatMessage) -> Result<()> {
        let tool_args = message
            .tool_args
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        sqlx::query(
            r#"
            INSERT INTO messages (id, run_id, role, content, tool_name, tool_args_json, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
        )
        .bind(&message.message_id)
        .bind(&message.run_id)
        .bind(&message.role)
        .bind(&message.content)
        .bind(&message.tool_name)
        .bind(&tool_args)
        .bind(message.created_at.to_rfc3339())
        .execute(&*self.pool)
        .await
        .map_err(backend_err)?;
        Ok(())
    }

    async fn list_messages(
        &self,
        run_id: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<ChatMessage>> {
        let rows = sqlx::query(
            "SELECT * FROM messages WHERE run_id = ?1 AND created_at > ?2 ORDER BY rowid ASC",
        )
        .bind(run_id)
        .bind(
            since
                .map(|t| t.to_rfc3339())
                .unwrap_or_else(|| "0000".to_string()),
        )
        .fetch_all(&*self.pool)
        .await
        .map_err(backend_err)?;
        rows.iter()
            .map(|r| {
                let tool_args_json: Option<String> = r.get("tool_args_json");
                Ok(ChatMessage {
                    message_id: r.get("id"),
                    run_id: r.get("run_id"),
                    role: r.get("role"),
                    content: r.get("content"),
                    tool_name: r.get("tool_name"),
                    tool_args: tool_args_json
                        .map(|j| serde_json::from_str::<Value>(&j))
                        .transpose()?,
                    created_at: parse_ts(r.get::<String, _>("created_at").as_str()),
                })
            })
            .collect()
    }

    #[instrument(skip(self, checkpoint), err)]
    async fn save_checkpoint(&self, checkpoint: RunCheckpoint) -> Result<()> {
        let output = serde_json::to_string(&checkpoint.output)?;
        let state = serde_json::to_string(&checkpoint.state)?;
        let frontier = serde_json::to_string(&checkpoint.frontier)?;
        let mut tx = self.pool.begin().await.map_err(backend_err)?;
        let last: Option<i64> =
            sqlx::query_scalar("SELECT MAX(seq) FROM checkpoints WHERE run_id = ?1")
                .bind(&checkpoint.run_id)
                .fetch_one(&mut *tx)
                .await
                .map_err(backend_err)?;
        let expected = last.unwrap_or(0) as u64 + 1;
        if checkpoint.seq != expected {
            return Err(StoreError::CheckpointGap {
                run_id: checkpoint.run_id,
                expected,
                got: checkpoint.seq,
            });
        }
        sqlx::query(
            r#"
            INSERT INTO checkpoints (run_id, seq, node_id, output_json, state_json, frontier_json, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
        )
        .bind(&checkpoint.run_id)
        .bind(checkpoint.seq as i64)
        .bind(&checkpoint.node_id)
        .bind(&output)
        .bind(&state)
        .bind(&frontier)
        .bind(checkpoint.created_at.to_rfc3339())
        .execute(&mut *tx)
        .await
        .map_err(backend_err)?;
        tx.commit().await.map_err(backend_err)?;
        Ok(())
    }

    async fn list_checkpoints(
        &self,
        run_id: &str,
        until_seq: Option<u64>,
    ) -> Result<Vec<RunCheckpoint>> {
        let rows = sqlx::query(
            "SELECT * FROM checkpoints WHERE run_id = ?1 AND seq <= ?2 ORDER BY seq ASC",
        )
        .bind(run_id)
        .bind(until_seq.unwrap_or(i64::MAX as u64) as i64)
        .fetch_all(&*self.pool)
        .await
        .map_err(backend_err)?;
        rows.iter()
            .map(|r| {
                let output_json: String = r.get("output_json");
                let state_json: String = r.get("state_json");
                let frontier_json: String = r.get("frontier_json");
                Ok(RunCheckpoint {
                    run_id: r.get("run_id"),
                    seq: r.get::<i64, _>("seq") as u64,
                    node_id: r.get("node_id"),
                    output: serde_json::from_str(&output_json)?,
                    state: serde_json::from_str(&state_json)?,
                    frontier: serde_json::from_str(&frontier_json)?,
                    created_at: parse_ts(r.get::<String, _>("created_at").as_str()),
                })
            })
            .collect()
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
        sqlx::query("DELETE FROM checkpoints WHERE run_id = ?1 AND seq > ?2")
            .bind(run_id)
            .bind(after_seq as i64)
            .execute(&*self.pool)
            .await
            .map_err(backend_err)?;
        Ok(())
    }

    async fn append_event(&self, event: RunEvent) -> Result<()> {
        let attributes = serde_json::to_string(&event.attributes)?;
        sqlx::query(
            r#"
            INSERT INTO events (id, run_id, kind, node_id, duration_ms, attributes_json, timestamp)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
        )
        .bind(&event.event_id)
        .bind(&event.run_id)
        .bind(event.kind.to_string())
        .bind(&event.node_id)
        .bind(event.duration_ms.map(|d| d as i64))
        .bind(&attributes)
        .bind(event.timestamp.to_rfc3339())
        .execute(&*self.pool)
        .await
        .map_err(backend_err)?;
        Ok(())
    }

    async fn list_events(&self, run_id: &str) -> Result<Vec<RunEvent>> {
        let rows = sqlx::query(
            "SELECT * FROM events WHERE run_id = ?1 ORDER BY timestamp ASC, rowid ASC",
        )
        .bind(run_id)
        .fetch_all(&*self.pool)
        .await
        .map_err(backend_err)?;
        rows.iter()
            .map(|r| {
                let attributes_json: String = r.get("attributes_json");
                let kind: String = r.get("kind");
                Ok(RunEvent {
                    event_id: r.get("id"),
                    run_id: r.get("run_id"),
                    kind: serde_json::from_value(Value::String(kind))
                        .unwrap_or(EventKind::Error),
                    node_id: r.get("node_id"),
                    duration_ms: r.get::<Option<i64>, _>("duration_ms").map(|d| d as u64),
                    attributes: serde_json::from_str(&attributes_json)?,
                    timestamp: parse_ts(r.get::<String, _>("timestamp").as_str()),
                })
            })
            .collect()
    }
}
