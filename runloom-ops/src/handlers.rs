use axum::extract::{Extension, Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use runloom::audit::{AuditEntry, AuditStore};
use runloom::coordinator::{SubmitReceipt, SubmitRequest};
use runloom::intervention::InterventionRequest;
use runloom::ledger::WorkerStatus;
use runloom::observe::RunEvent;
use runloom::queue::{DeadLetter, QueueStats};
use runloom::store::{Run, RunFilter, RunStatus};

use crate::auth::ActorKey;
use crate::{ApiError, OpsState};

async fn record_audit(state: &OpsState, actor: &ActorKey, action: &str, resource: &str, payload: Value) {
    let _ = state
        .audit
        .record(AuditEntry::new(
            &actor.0,
            action,
            resource,
            &payload.to_string(),
        ))
        .await;
}

pub async fn submit(
    State(state): State<OpsState>,
    Extension(actor): Extension<ActorKey>,
    Json(request): Json<SubmitRequest>,
) -> Result<Json<SubmitReceipt>, ApiError> {
    let payload = serde_json::to_value(&request).unwrap_or(Value::Null);
    let receipt = state.coordinator.submit(request).await?;
    record_audit(
        &state,
        &actor,
        "submit",
        &format!("runs/{}", receipt.run_id),
        payload,
    )
    .await;
    Ok(Json(receipt))
}

#[derive(Debug, Deserialize)]
pub struct ListRunsQuery {
    pub session_id: Option<String>,
    pub status: Option<String>,
    pub limit: Option<u32>,
}

pub async fn list_runs(
    State(state): State<OpsState>,
    Query(query): Query<ListRunsQuery>,
) -> Result<Json<Vec<Run>>, ApiError> {
    let filter = RunFilter {
        session_id: query.session_id,
        status: query.status.as_deref().map(RunStatus::decode),
    };
    let runs = state
        .coordinator
        .list_runs(filter, query.limit.unwrap_or(100))
        .await?;
    Ok(Json(runs))
}

pub async fn get_run(
    State(state): State<OpsState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let run = state.coordinator.get_run(&id).await?;
    let attempts = state.coordinator.list_attempts(&id).await?;
    Ok(Json(json!({ "run": run, "attempts": attempts })))
}

pub async fn run_events(
    State(state): State<OpsState>,
    Path(id): Path<String>,
) -> Result<Json<Vec<RunEvent>>, ApiError> {
    // Surface NotFound for unknown runs instead of an empty stream.
    state.coordinator.get_run(&id).await?;
    Ok(Json(state.coordinator.run_events(&id).await?))
}

pub async fn intervene(
    State(state): State<OpsState>,
    Extension(actor): Extension<ActorKey>,
    Path(id): Path<String>,
    Json(mut request): Json<InterventionRequest>,
) -> Result<Json<Value>, ApiError> {
    if request.actor.is_empty() {
        request.actor = actor.0.clone();
    }
    let outcome = state.coordinator.intervene(&id, request).await?;
    Ok(Json(json!({
        "applied": outcome.applied,
        "run": outcome.run,
    })))
}

pub async fn list_flows(State(state): State<OpsState>) -> Json<Vec<runloom::registry::FlowDefinition>> {
    Json(state.coordinator.flows().list())
}

pub async fn list_workers(
    State(state): State<OpsState>,
) -> Result<Json<Value>, ApiError> {
    let workers = state.coordinator.workers().await?;
    Ok(Json(json!({ "workers": workers })))
}

pub async fn worker_action(
    State(state): State<OpsState>,
    Extension(actor): Extension<ActorKey>,
    Path((id, action)): Path<(String, String)>,
) -> Result<Json<Value>, ApiError> {
    match action.as_str() {
        "drain" | "disable" => {
            let status = if action == "drain" {
                WorkerStatus::Draining
            } else {
                WorkerStatus::Disabled
            };
            state.coordinator.set_worker_status(&id, status).await?;
            record_audit(
                &state,
                &actor,
                &format!("worker:{action}"),
                &format!("workers/{id}"),
                Value::Null,
            )
            .await;
            Ok(Json(json!({ "worker_id": id, "status": action })))
        }
        "inspect" => {
            let registration = state.coordinator.worker_registration(&id).await?;
            match registration {
                Some(registration) => Ok(Json(json!({ "worker": registration }))),
                None => Err(ApiError::new(
                    StatusCode::NOT_FOUND,
                    "NotFound",
                    format!("worker {id} not registered"),
                )),
            }
        }
        other => Err(ApiError::new(
            StatusCode::BAD_REQUEST,
            "ValidationError",
            format!("unknown worker action {other:?}"),
        )),
    }
}

pub async fn list_dead_letters(
    State(state): State<OpsState>,
) -> Result<Json<Vec<DeadLetter>>, ApiError> {
    Ok(Json(state.coordinator.dead_letters().await?))
}

#[derive(Debug, Deserialize)]
pub struct RequeueDlqRequest {
    pub dlq_id: String,
    #[serde(default)]
    pub ignore_budget: bool,
}

pub async fn requeue_dlq(
    State(state): State<OpsState>,
    Extension(actor): Extension<ActorKey>,
    Json(request): Json<RequeueDlqRequest>,
) -> Result<Json<Run>, ApiError> {
    let run = state
        .coordinator
        .requeue_dead_letter(&request.dlq_id, request.ignore_budget)
        .await?;
    record_audit(
        &state,
        &actor,
        "dlq:requeue",
        &format!("runs/{}", run.run_id),
        json!({ "dlq_id": request.dlq_id, "ignore_budget": request.ignore_budget }),
    )
    .await;
    Ok(Json(run))
}

pub async fn queue_stats(
    State(state): State<OpsState>,
) -> Result<Json<QueueStats>, ApiError> {
    Ok(Json(state.coordinator.queue_stats().await?))
}
