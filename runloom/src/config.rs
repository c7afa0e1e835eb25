//! Runtime settings for the coordinator, workers, queue, and event sink.
//!
//! Every knob has a production default; `RuntimeSettings::from_env` layers
//! `RUNLOOM_*` environment variables (with `.env` support via dotenvy) on
//! top of those defaults so deployments can tune without code changes.

use std::time::Duration;

use crate::agent::RetryPolicy;

/// Tunables shared by the coordinator, workers, sweeper, and sinks.
#[derive(Clone, Debug)]
pub struct RuntimeSettings {
    /// How often workers upsert their registration row.
    pub heartbeat_interval: Duration,
    /// A worker with no heartbeat for this long is considered lost.
    pub heartbeat_timeout: Duration,
    /// Visibility window for claimed queue tasks. Must be at least twice
    /// the expected maximum step duration.
    pub task_visibility: Duration,
    /// Deliveries after which a task is parked in the dead-letter queue.
    pub max_deliveries: u32,
    /// Default per-run attempt budget when the submitter leaves it unset.
    pub default_max_attempts: u32,
    /// Step-level retry policy (generic and rate-limit axes).
    pub retry: RetryPolicy,
    /// Bounded capacity of the async event sink channel.
    pub event_buffer: usize,
    /// Namespace prefix for queue keys.
    pub queue_prefix: String,
    /// Consumer group name shared by all workers.
    pub queue_group: String,
    /// Filesystem path for the state store database.
    pub state_db_path: String,
    /// Filesystem path for the attempt ledger database.
    pub ledger_db_path: String,
    /// Filesystem path for the queue database.
    pub queue_db_path: String,
    /// Filesystem path for the audit log database.
    pub audit_db_path: String,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(10),
            heartbeat_timeout: Duration::from_secs(45),
            task_visibility: Duration::from_secs(60),
            max_deliveries: 5,
            default_max_attempts: 3,
            retry: RetryPolicy::default(),
            event_buffer: 256,
            queue_prefix: "runloom:queue".to_string(),
            queue_group: "workers".to_string(),
            state_db_path: "./.runloom/state.db".to_string(),
            ledger_db_path: "./.runloom/attempts.db".to_string(),
            queue_db_path: "./.runloom/queue.db".to_string(),
            audit_db_path: "./.runloom/audit.db".to_string(),
        }
    }
}

impl RuntimeSettings {
    /// Build settings from the environment, falling back to defaults.
    ///
    /// Durations are read as integer milliseconds (`RUNLOOM_HEARTBEAT_INTERVAL_MS`,
    /// `RUNLOOM_HEARTBEAT_TIMEOUT_MS`, `RUNLOOM_TASK_VISIBILITY_MS`), counts as
    /// integers, and paths/names as plain strings.
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();
        let mut settings = Self::default();
        if let Some(ms) = env_u64("RUNLOOM_HEARTBEAT_INTERVAL_MS") {
            settings.heartbeat_interval = Duration::from_millis(ms);
        }
        if let Some(ms) = env_u64("RUNLOOM_HEARTBEAT_TIMEOUT_MS") {
            settings.heartbeat_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = env_u64("RUNLOOM_TASK_VISIBILITY_MS") {
            settings.task_visibility = Duration::from_millis(ms);
        }
        if let Some(n) = env_u64("RUNLOOM_MAX_DELIVERIES") {
            settings.max_deliveries = n as u32;
        }
        if let Some(n) = env_u64("RUNLOOM_MAX_ATTEMPTS") {
            settings.default_max_attempts = (n as u32).max(1);
        }
        if let Some(ms) = env_u64("RUNLOOM_RETRY_BASE_BACKOFF_MS") {
            settings.retry.base_backoff = Duration::from_millis(ms);
        }
        if let Some(ms) = env_u64("RUNLOOM_RETRY_MAX_BACKOFF_MS") {
            settings.retry.max_backoff = Duration::from_millis(ms);
        }
        if let Some(n) = env_u64("RUNLOOM_RATE_LIMIT_MAX_ATTEMPTS") {
            settings.retry.rate_limit_max_attempts = n as u32;
        }
        if let Some(ms) = env_u64("RUNLOOM_RATE_LIMIT_BASE_BACKOFF_MS") {
            settings.retry.rate_limit_base_backoff = Duration::from_millis(ms);
        }
        if let Some(ms) = env_u64("RUNLOOM_RATE_LIMIT_MAX_BACKOFF_MS") {
            settings.retry.rate_limit_max_backoff = Duration::from_millis(ms);
        }
        if let Some(n) = env_u64("RUNLOOM_EVENT_BUFFER") {
            settings.event_buffer = n as usize;
        }
        if let Some(v) = env_str("RUNLOOM_QUEUE_PREFIX") {
            settings.queue_prefix = v;
        }
        if let Some(v) = env_str("RUNLOOM_QUEUE_GROUP") {
            settings.queue_group = v;
        }
        if let Some(v) = env_str("RUNLOOM_STATE_DB") {
            settings.state_db_path = v;
        }
        if let Some(v) = env_str("RUNLOOM_LEDGER_DB") {
            settings.ledger_db_path = v;
        }
        if let Some(v) = env_str("RUNLOOM_QUEUE_DB") {
            settings.queue_db_path = v;
        }
        if let Some(v) = env_str("RUNLOOM_AUDIT_DB") {
            settings.audit_db_path = v;
        }
        settings.retry = settings.retry.normalize();
        settings
    }

    /// Keepalive period for visibility extension while a step executes.
    #[must_use]
    pub fn extend_interval(&self) -> Duration {
        self.task_visibility / 2
    }
}

fn env_str(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_u64(key: &str) -> Option<u64> {
    env_str(key).and_then(|v| v.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let s = RuntimeSettings::default();
        assert_eq!(s.heartbeat_interval, Duration::from_secs(10));
        assert_eq!(s.heartbeat_timeout, Duration::from_secs(45));
        assert_eq!(s.task_visibility, Duration::from_secs(60));
        assert_eq!(s.max_deliveries, 5);
        assert_eq!(s.default_max_attempts, 3);
        assert_eq!(s.event_buffer, 256);
        assert_eq!(s.extend_interval(), Duration::from_secs(30));
    }
}
