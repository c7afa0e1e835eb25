//! Submit → claim → execute → finalize lifecycle over memory backends.

mod common;

use std::sync::Arc;

use common::Harness;
use runloom::agent::{text_response, ProviderError, ScriptedProvider};
use runloom::coordinator::{CoordinatorError, SubmitRequest};
use runloom::ledger::{AttemptLedger, AttemptStatus};
use runloom::observe::EventKind;
use runloom::queue::WorkQueue;
use runloom::store::{RunMode, RunStatus, StateStore};

fn submit_request(input: &str, max_attempts: u32) -> SubmitRequest {
    SubmitRequest {
        input: input.to_string(),
        mode: RunMode::Run,
        workflow: Some("basic".to_string()),
        flow: None,
        session_id: None,
        provider: None,
        max_attempts: Some(max_attempts),
        metadata: Default::default(),
        delivery: None,
    }
}

#[tokio::test]
async fn happy_path_single_step() {
    let provider = Arc::new(ScriptedProvider::always("hello"));
    let harness = Harness::new(provider);
    let receipt = harness
        .coordinator
        .submit(submit_request("hi", 1))
        .await
        .unwrap();

    let worker = harness.coordinator.worker("w1");
    let run = harness.drive_to_terminal(&worker, &receipt.run_id).await;

    assert_eq!(run.status, RunStatus::Succeeded);
    assert_eq!(run.output.as_deref(), Some("hello"));

    let attempts = harness.ledger.list_attempts(&receipt.run_id).await.unwrap();
    assert_eq!(attempts.len(), 1);
    assert_eq!(attempts[0].attempt, 1);
    assert_eq!(attempts[0].status, AttemptStatus::Succeeded);

    let messages = harness
        .store
        .list_messages(&receipt.run_id, None)
        .await
        .unwrap();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0].role, "user");
    assert_eq!(messages[0].content, "hi");
    assert_eq!(messages[1].role, "assistant");
    assert_eq!(messages[1].content, "hello");

    let checkpoints = harness
        .store
        .list_checkpoints(&receipt.run_id, None)
        .await
        .unwrap();
    assert!(checkpoints.is_empty());

    // The task was acknowledged and nothing is left pending.
    let stats = harness.queue.stats().await.unwrap();
    assert_eq!(stats.stream_length, 0);
    assert_eq!(stats.pending, 0);
}

#[tokio::test]
async fn transient_provider_failure_retries_across_attempts() {
    let provider = Arc::new(ScriptedProvider::new(vec![
        Err(ProviderError::Failed {
            message: "upstream exploded".to_string(),
        }),
        Err(ProviderError::Failed {
            message: "upstream exploded again".to_string(),
        }),
        Ok(text_response("recovered")),
    ]));
    let harness = Harness::new(provider);
    let receipt = harness
        .coordinator
        .submit(submit_request("investigate", 3))
        .await
        .unwrap();

    let worker = harness.coordinator.worker("w1");
    let run = harness.drive_to_terminal(&worker, &receipt.run_id).await;

    assert_eq!(run.status, RunStatus::Succeeded);
    assert_eq!(run.output.as_deref(), Some("recovered"));
    assert_eq!(run.attempts_used, 3);

    let attempts = harness.ledger.list_attempts(&receipt.run_id).await.unwrap();
    let statuses: Vec<AttemptStatus> = attempts.iter().map(|a| a.status).collect();
    assert_eq!(
        statuses,
        vec![
            AttemptStatus::Failed,
            AttemptStatus::Failed,
            AttemptStatus::Succeeded
        ]
    );

    // Re-enqueue backoff starts at the base and doubles.
    let delays: Vec<u64> = harness
        .sink
        .for_run(&receipt.run_id)
        .into_iter()
        .filter(|e| {
            e.kind == EventKind::Retry
                && e.attributes.get("category").and_then(|v| v.as_str()) == Some("re-enqueue")
        })
        .filter_map(|e| e.attributes.get("delay_ms").and_then(|v| v.as_u64()))
        .collect();
    assert_eq!(delays.len(), 2);
    let base = harness.coordinator.settings().retry.base_backoff.as_millis() as u64;
    assert_eq!(delays[0], base);
    assert_eq!(delays[1], base * 2);
}

#[tokio::test]
async fn attempts_exhausted_leaves_run_failed() {
    let provider = Arc::new(ScriptedProvider::new(vec![Err(ProviderError::Failed {
        message: "always broken".to_string(),
    })]));
    let harness = Harness::new(provider);
    let receipt = harness
        .coordinator
        .submit(submit_request("doomed", 2))
        .await
        .unwrap();

    let worker = harness.coordinator.worker("w1");
    let run = harness.drive_to_terminal(&worker, &receipt.run_id).await;

    assert_eq!(run.status, RunStatus::Failed);
    let error = run.error.unwrap();
    assert!(error.starts_with("ProviderError"), "error was {error}");
    let attempts = harness.ledger.list_attempts(&receipt.run_id).await.unwrap();
    assert_eq!(attempts.len(), 2);
    assert!(attempts.iter().all(|a| a.status == AttemptStatus::Failed));
}

#[tokio::test]
async fn submit_validation() {
    let harness = Harness::new(Arc::new(ScriptedProvider::always("ok")));

    let empty = SubmitRequest {
        input: "   ".to_string(),
        ..submit_request("x", 1)
    };
    assert!(matches!(
        harness.coordinator.submit(empty).await.unwrap_err(),
        CoordinatorError::Validation { .. }
    ));

    let graph_without_workflow = SubmitRequest {
        mode: RunMode::GraphRun,
        workflow: None,
        ..submit_request("hello", 1)
    };
    assert!(matches!(
        harness
            .coordinator
            .submit(graph_without_workflow)
            .await
            .unwrap_err(),
        CoordinatorError::Validation { .. }
    ));

    let unknown_workflow = SubmitRequest {
        mode: RunMode::GraphRun,
        workflow: Some("nope".to_string()),
        ..submit_request("hello", 1)
    };
    assert!(matches!(
        harness
            .coordinator
            .submit(unknown_workflow)
            .await
            .unwrap_err(),
        CoordinatorError::UnknownWorkflow { .. }
    ));
}

#[tokio::test]
async fn submit_by_flow_resolves_workflow_and_system_prompt() {
    let provider = Arc::new(ScriptedProvider::always("triaged"));
    let harness = Harness::new(provider.clone());
    harness
        .coordinator
        .flows()
        .register(
            "triage",
            runloom::registry::FlowDefinition {
                name: "triage".to_string(),
                description: "Incident triage".to_string(),
                workflow: Some("basic".to_string()),
                system_prompt: Some("You triage incidents.".to_string()),
                ..Default::default()
            },
        )
        .unwrap();

    let receipt = harness
        .coordinator
        .submit(SubmitRequest {
            workflow: None,
            flow: Some("triage".to_string()),
            ..submit_request("disk full on db-3", 1)
        })
        .await
        .unwrap();

    let run = harness.store.get_run(&receipt.run_id).await.unwrap();
    assert_eq!(run.workflow.as_deref(), Some("basic"));
    assert_eq!(
        run.metadata.get("flow").and_then(|v| v.as_str()),
        Some("triage")
    );

    let worker = harness.coordinator.worker("w1");
    let run = harness.drive_to_terminal(&worker, &receipt.run_id).await;
    assert_eq!(run.status, RunStatus::Succeeded);

    // The flow's system prompt reached the provider.
    let requests = provider.requests();
    assert_eq!(
        requests[0].system_prompt.as_deref(),
        Some("You triage incidents.")
    );

    // Unknown flows are a validation failure.
    let err = harness
        .coordinator
        .submit(SubmitRequest {
            flow: Some("nope".to_string()),
            ..submit_request("x", 1)
        })
        .await
        .unwrap_err();
    assert!(matches!(err, CoordinatorError::Validation { .. }));
}

#[tokio::test]
async fn submit_reuses_sessions_and_emits_queue_event() {
    let harness = Harness::new(Arc::new(ScriptedProvider::always("ok")));
    let first = harness
        .coordinator
        .submit(submit_request("one", 1))
        .await
        .unwrap();
    let second = harness
        .coordinator
        .submit(SubmitRequest {
            session_id: Some(first.session_id.clone()),
            ..submit_request("two", 1)
        })
        .await
        .unwrap();
    assert_eq!(first.session_id, second.session_id);
    assert_ne!(first.run_id, second.run_id);

    let events = harness.sink.for_run(&first.run_id);
    assert!(events
        .iter()
        .any(|e| e.kind == EventKind::Queue
            && e.attributes.get("phase").and_then(|v| v.as_str()) == Some("enqueued")));
}
