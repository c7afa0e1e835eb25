//! Operator API: auth, submit, inspection, interventions, and audit.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::ServiceExt;

use runloom::agent::{ScriptedProvider, Tool};
use runloom::audit::MemoryAuditStore;
use runloom::config::RuntimeSettings;
use runloom::coordinator::Coordinator;
use runloom::graph::{install_builtins, Workflow};
use runloom::ledger::MemoryLedger;
use runloom::observe::{EventSink, MemorySink, MultiSink, StoreSink};
use runloom::queue::MemoryQueue;
use runloom::registry::Registry;
use runloom::store::{MemoryStateStore, StateStore};

use runloom_ops::{router, ApiKey, OpsState};

struct TestApp {
    app: axum::Router,
    coordinator: Arc<Coordinator>,
    audit: Arc<MemoryAuditStore>,
}

fn test_app() -> TestApp {
    let mut settings = RuntimeSettings::default();
    settings.task_visibility = Duration::from_millis(500);
    let provider = Arc::new(ScriptedProvider::always("hello from the agent"));
    let store = Arc::new(MemoryStateStore::new());
    let ledger = Arc::new(MemoryLedger::new());
    let queue = Arc::new(MemoryQueue::new(settings.task_visibility));
    let audit = Arc::new(MemoryAuditStore::new());
    let events: Arc<dyn EventSink> = Arc::new(MultiSink::new(vec![
        Arc::new(MemorySink::new()) as Arc<dyn EventSink>,
        Arc::new(StoreSink::new(store.clone() as Arc<dyn StateStore>)),
    ]));
    let workflows = Arc::new(Registry::<Workflow>::new("workflow"));
    install_builtins(&workflows, provider.clone()).unwrap();
    let tools: Arc<Registry<Arc<dyn Tool>>> = Arc::new(Registry::new("tool"));
    let coordinator = Arc::new(Coordinator::new(
        store,
        ledger,
        queue,
        events,
        audit.clone(),
        workflows,
        tools,
        provider,
        settings,
    ));
    let state = OpsState::new(
        coordinator.clone(),
        audit.clone(),
        vec![ApiKey::new("ops-key-1", "secret-token")],
    );
    TestApp {
        app: router(state),
        coordinator,
        audit,
    }
}

fn authed(request: axum::http::request::Builder) -> axum::http::request::Builder {
    request.header("x-api-key", "secret-token")
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn requests_without_a_key_are_unauthorized() {
    let app = test_app().app;
    let response = app
        .oneshot(
            Request::builder()
                .uri("/runtime/queue-stats")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let body = body_json(response).await;
    assert_eq!(body["code"], "Unauthorized");
}

#[tokio::test]
async fn submit_then_inspect_run_and_events() {
    let TestApp {
        app, coordinator, ..
    } = test_app();

    let response = app
        .clone()
        .oneshot(
            authed(Request::builder().method("POST").uri("/submit"))
                .header("content-type", "application/json")
                .body(Body::from(
                    json!({
                        "input": "hi there",
                        "mode": "run",
                        "workflow": "basic",
                        "max_attempts": 1
                    })
                    .to_string(),
                ))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let receipt = body_json(response).await;
    let run_id = receipt["run_id"].as_str().unwrap().to_string();

    // Drive the run with an in-process worker.
    let worker = coordinator.worker("w1");
    worker.run_once(Duration::from_millis(100)).await.unwrap();

    let response = app
        .clone()
        .oneshot(
            authed(Request::builder().uri(format!("/runs/{run_id}")))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["run"]["status"], "succeeded");
    assert_eq!(body["run"]["output"], "hello from the agent");
    assert_eq!(body["attempts"].as_array().unwrap().len(), 1);

    let response = app
        .clone()
        .oneshot(
            authed(Request::builder().uri(format!("/runs/{run_id}/events")))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    let events = body_json(response).await;
    assert!(!events.as_array().unwrap().is_empty());

    let response = app
        .oneshot(
            authed(Request::builder().uri("/runs/missing/events"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn interventions_authenticate_and_audit() {
    let TestApp { app, audit, .. } = test_app();

    let response = app
        .clone()
        .oneshot(
            authed(Request::builder().method("POST").uri("/submit"))
                .header("content-type", "application/json")
                .body(Body::from(
                    json!({ "input": "pause me", "max_attempts": 1 }).to_string(),
                ))
                .unwrap(),
        )
        .await
        .unwrap();
    let run_id = body_json(response).await["run_id"]
        .as_str()
        .unwrap()
        .to_string();

    let response = app
        .clone()
        .oneshot(
            authed(
                Request::builder()
                    .method("POST")
                    .uri(format!("/runs/{run_id}/interventions")),
            )
            .header("content-type", "application/json")
            .body(Body::from(
                json!({ "action": "pause", "reason": "maintenance" }).to_string(),
            ))
            .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["applied"], true);
    assert_eq!(body["run"]["status"], "paused");

    // The audit record carries the key id, not the secret.
    let entries = audit.snapshot();
    let pause = entries
        .iter()
        .find(|e| e.action == "intervention:pause")
        .expect("pause audited");
    assert_eq!(pause.actor_key_id, "ops-key-1");
    assert!(!pause.payload.contains("secret-token"));
}

#[tokio::test]
async fn worker_admin_and_queue_stats() {
    let TestApp {
        app, coordinator, ..
    } = test_app();

    // Register a worker via a heartbeat-driven claim pass.
    let worker = coordinator.worker("w9");
    let _ = worker.run_once(Duration::from_millis(10)).await;

    let response = app
        .clone()
        .oneshot(
            authed(Request::builder().uri("/runtime/workers"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = app
        .clone()
        .oneshot(
            authed(
                Request::builder()
                    .method("POST")
                    .uri("/runtime/workers/w9/drain"),
            )
            .body(Body::empty())
            .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = app
        .clone()
        .oneshot(
            authed(
                Request::builder()
                    .method("POST")
                    .uri("/runtime/workers/w9/inspect"),
            )
            .body(Body::empty())
            .unwrap(),
        )
        .await
        .unwrap();
    let body = body_json(response).await;
    assert_eq!(body["worker"]["status"], "draining");

    let response = app
        .oneshot(
            authed(Request::builder().uri("/runtime/queue-stats"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let stats = body_json(response).await;
    assert!(stats.get("stream_length").is_some());
}
