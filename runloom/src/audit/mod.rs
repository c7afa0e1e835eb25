//! Audit log: every mutating operator call, recorded.
//!
//! Entries are `{actor_key_id, action, resource, payload, created_at}`.
//! Entries with a blank action or resource are ignored rather than
//! rejected, so callers can record unconditionally.

#[cfg(feature = "sqlite")]
mod sqlite;

#[cfg(feature = "sqlite")]
pub use sqlite::SqliteAuditStore;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use miette::Diagnostic;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A single audit record.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub actor_key_id: String,
    pub action: String,
    pub resource: String,
    pub payload: String,
    pub created_at: DateTime<Utc>,
}

impl AuditEntry {
    #[must_use]
    pub fn new(actor_key_id: &str, action: &str, resource: &str, payload: &str) -> Self {
        Self {
            actor_key_id: actor_key_id.to_string(),
            action: action.to_string(),
            resource: resource.to_string(),
            payload: payload.to_string(),
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Error, Diagnostic)]
pub enum AuditError {
    #[error("audit backend unavailable: {message}")]
    #[diagnostic(code(runloom::audit::unavailable))]
    Unavailable { message: String },
}

pub type Result<T> = std::result::Result<T, AuditError>;

#[async_trait]
pub trait AuditStore: Send + Sync {
    async fn record(&self, entry: AuditEntry) -> Result<()>;

    /// Newest-first listing.
    async fn list(&self, limit: u32, offset: u32) -> Result<Vec<AuditEntry>>;
}

/// In-memory audit store for tests.
#[derive(Clone, Default)]
pub struct MemoryAuditStore {
    entries: Arc<Mutex<Vec<AuditEntry>>>,
}

impl MemoryAuditStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn snapshot(&self) -> Vec<AuditEntry> {
        self.entries.lock().clone()
    }
}

#[async_trait]
impl AuditStore for MemoryAuditStore {
    async fn record(&self, entry: AuditEntry) -> Result<()> {
        if entry.action.is_empty() || entry.resource.is_empty() {
            return Ok(());
        }
        self.entries.lock().push(entry);
        Ok(())
    }

    async fn list(&self, limit: u32, offset: u32) -> Result<Vec<AuditEntry>> {
        let entries = self.entries.lock();
        Ok(entries
            .iter()
            .rev()
            .skip(offset as usize)
            .take(limit.max(1) as usize)
            .cloned()
            .collect())
    }
}
