//! Operator HTTP surface for runloom.
//!
//! A thin axum layer over [`runloom::coordinator::Coordinator`]: submit,
//! run inspection, event replay, interventions, worker administration,
//! DLQ requeue, and queue stats. Requests authenticate with a shared API
//! key header (`x-api-key`); every mutating call is recorded in the audit
//! log with the caller's key id.

mod auth;
mod handlers;

pub use auth::{ApiKey, ActorKey};

use std::sync::Arc;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;

use runloom::audit::AuditStore;
use runloom::coordinator::{Coordinator, CoordinatorError};
use runloom::intervention::InterventionError;
use runloom::queue::QueueError;
use runloom::store::StoreError;

/// Shared state behind every handler.
#[derive(Clone)]
pub struct OpsState {
    pub coordinator: Arc<Coordinator>,
    pub audit: Arc<dyn AuditStore>,
    pub api_keys: Arc<Vec<ApiKey>>,
}

impl OpsState {
    #[must_use]
    pub fn new(
        coordinator: Arc<Coordinator>,
        audit: Arc<dyn AuditStore>,
        api_keys: Vec<ApiKey>,
    ) -> Self {
        Self {
            coordinator,
            audit,
            api_keys: Arc::new(api_keys),
        }
    }
}

/// Build the operator router with API-key auth applied to every route.
#[must_use]
pub fn router(state: OpsState) -> Router {
    Router::new()
        .route("/submit", post(handlers::submit))
        .route("/runs", get(handlers::list_runs))
        .route("/runs/:id", get(handlers::get_run))
        .route("/runs/:id/events", get(handlers::run_events))
        .route("/runs/:id/interventions", post(handlers::intervene))
        .route("/flows", get(handlers::list_flows))
        .route("/runtime/workers", get(handlers::list_workers))
        .route(
            "/runtime/workers/:id/:action",
            post(handlers::worker_action),
        )
        .route("/runtime/dlq", get(handlers::list_dead_letters))
        .route("/runtime/dlq/requeue", post(handlers::requeue_dlq))
        .route("/runtime/queue-stats", get(handlers::queue_stats))
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            auth::require_api_key,
        ))
        .with_state(state)
}

/// JSON error body carrying the stable machine code.
pub struct ApiError {
    pub status: StatusCode,
    pub code: &'static str,
    pub message: String,
}

impl ApiError {
    #[must_use]
    pub fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "code": self.code,
            "message": self.message,
        }));
        (self.status, body).into_response()
    }
}

impl From<CoordinatorError> for ApiError {
    fn from(error: CoordinatorError) -> Self {
        let message = error.to_string();
        let (status, code) = match &error {
            CoordinatorError::Validation { .. } => (StatusCode::BAD_REQUEST, "ValidationError"),
            CoordinatorError::UnknownWorkflow { .. } => {
                (StatusCode::BAD_REQUEST, "ValidationError")
            }
            CoordinatorError::AttemptsExhausted { .. } => {
                (StatusCode::CONFLICT, "AttemptsExhausted")
            }
            CoordinatorError::Store(StoreError::NotFound { .. }) => {
                (StatusCode::NOT_FOUND, "NotFound")
            }
            CoordinatorError::Store(StoreError::StaleState { .. }) => {
                (StatusCode::CONFLICT, "StaleState")
            }
            CoordinatorError::Store(StoreError::AlreadyTerminal { .. }) => {
                (StatusCode::CONFLICT, "AlreadyTerminal")
            }
            CoordinatorError::Queue(QueueError::DuplicateInFlight { .. }) => {
                (StatusCode::CONFLICT, "DuplicateInFlight")
            }
            CoordinatorError::Queue(
                QueueError::TaskNotFound { .. } | QueueError::DeadLetterNotFound { .. },
            ) => (StatusCode::NOT_FOUND, "NotFound"),
            CoordinatorError::Intervention(InterventionError::InvalidTransition { .. }) => {
                (StatusCode::CONFLICT, "InvalidTransition")
            }
            CoordinatorError::Intervention(InterventionError::AttemptsExhausted { .. }) => {
                (StatusCode::CONFLICT, "AttemptsExhausted")
            }
            CoordinatorError::Intervention(InterventionError::CheckpointNotFound { .. }) => {
                (StatusCode::NOT_FOUND, "NotFound")
            }
            CoordinatorError::Queue(_) => {
                (StatusCode::SERVICE_UNAVAILABLE, "QueueUnavailable")
            }
            CoordinatorError::Store(_) => {
                (StatusCode::SERVICE_UNAVAILABLE, "StoreUnavailable")
            }
            CoordinatorError::Ledger(_) => {
                (StatusCode::SERVICE_UNAVAILABLE, "StoreUnavailable")
            }
            CoordinatorError::Intervention(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "InternalError")
            }
        };
        Self::new(status, code, message)
    }
}
