use std::sync::Arc;

use async_trait::async_trait;
use sqlx::{Row, SqlitePool};
use tracing::instrument;

use super::{AuditEntry, AuditError, AuditStore, Result};
use crate::store::sqlite_support;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS audit_logs (
  id           INTEGER PRIMARY KEY AUTOINCREMENT,
  actor_key_id TEXT,
  action       TEXT NOT NULL,
  resource     TEXT NOT NULL,
  payload      TEXT NOT NULL,
  created_at   TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_audit_logs_created_at ON audit_logs(created_at DESC);
"#;

/// Durable audit store backed by SQLite.
pub struct SqliteAuditStore {
    pool: Arc<SqlitePool>,
}

impl SqliteAuditStore {
    #[instrument(skip(path))]
    pub async fn connect(path: &str) -> Result<Self> {
        let pool = sqlite_support::open_pool(path)
            .await
            .map_err(|e| AuditError::Unavailable {
                message: e.to_string(),
            })?;
        sqlx::raw_sql(SCHEMA)
            .execute(&pool)
            .await
            .map_err(unavailable)?;
        Ok(Self {
            pool: Arc::new(pool),
        })
    }
}

fn unavailable(e: sqlx::Error) -> AuditError {
    AuditError::Unavailable {
        message: e.to_string(),
    }
}

#[async_trait]
impl AuditStore for SqliteAuditStore {
    async fn record(&self, entry: AuditEntry) -> Result<()> {
        if entry.action.is_empty() || entry.resource.is_empty() {
            return Ok(());
        }
        sqlx::query(
            r#"
            INSERT INTO audit_logs (actor_key_id, action, resource, payload, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
        )
        .bind(&entry.actor_key_id)
        .bind(&entry.action)
        .bind(&entry.resource)
        .bind(&entry.payload)
        .bind(entry.created_at.to_rfc3339())
        .execute(&*self.pool)
        .await
        .map_err(unavailable)?;
        Ok(())
    }

    async fn list(&self, limit: u32, offset: u32) -> Result<Vec<AuditEntry>> {
        let rows = sqlx::query(
            r#"
            SELECT actor_key_id, action, resource, payload, created_at
            FROM audit_logs
            ORDER BY created_at DESC, id DESC
            LIMIT ?1 OFFSET ?2
            "#,
        )
        .bind(limit.max(1) as i64)
        .bind(offset as i64)
        .fetch_all(&*self.pool)
        .await
        .map_err(unavailable)?;
        Ok(rows
            .iter()
            .map(|r| AuditEntry {
                actor_key_id: r
                    .get::<Option<String>, _>("actor_key_id")
                    .unwrap_or_default(),
                action: r.get("action"),
                resource: r.get("resource"),
                payload: r.get("payload"),
                created_at: sqlite_support::parse_ts(r.get::<String, _>("created_at").as_str()),
            })
            .collect())
    }
}
