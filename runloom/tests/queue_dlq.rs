//! Dead-letter handling: over-delivered tasks park in the DLQ, their runs
//! go dead-letter, and requeue honors the attempt budget.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::Harness;
use runloom::agent::ScriptedProvider;
use runloom::coordinator::{CoordinatorError, SubmitRequest};
use runloom::ledger::AttemptLedger;
use runloom::queue::WorkQueue;
use runloom::store::{RunMode, RunStatus, StateStore};

fn submit(max_attempts: u32) -> SubmitRequest {
    SubmitRequest {
        input: "poisoned".to_string(),
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

/// Simulate a worker that claims the task, opens an attempt, and dies
/// before acknowledging: the attempt is orphaned and the visibility window
/// expires.
async fn crash_one_delivery(harness: &Harness, run_id: &str, worker_id: &str) {
    let claimed = harness
        .queue
        .claim(worker_id, 1, Duration::from_millis(100))
        .await
        .unwrap();
    assert_eq!(claimed.len(), 1, "expected the task to be claimable");
    harness
        .ledger
        .open_attempt(run_id, worker_id)
        .await
        .unwrap();
    // The crashed worker never heartbeats again; close the orphan the way
    // recovery would.
    harness.ledger.mark_lost(run_id).await.unwrap();
    // Wait out the visibility window so the task redelivers.
    tokio::time::sleep(harness.coordinator.settings().task_visibility + Duration::from_millis(30))
        .await;
}

#[tokio::test]
async fn over_delivered_task_moves_to_dlq_and_requeue_honors_budget() {
    let provider = Arc::new(ScriptedProvider::always("never runs"));
    let mut settings = common::fast_settings();
    settings.task_visibility = Duration::from_millis(40);
    settings.max_deliveries = 5;
    let harness = Harness::with_settings(provider, settings);
    let receipt = harness.coordinator.submit(submit(1)).await.unwrap();

    // Six crashed deliveries exceed max_deliveries = 5.
    for i in 0..6 {
        crash_one_delivery(&harness, &receipt.run_id, &format!("crashed-{i}")).await;
    }

    // The next claimant parks the task instead of executing it.
    let worker = harness.coordinator.worker("w-live");
    worker.run_once(Duration::from_millis(100)).await.unwrap();

    assert_eq!(
        harness.run_status(&receipt.run_id).await,
        RunStatus::DeadLetter
    );
    let dead_letters = harness.queue.list_dead_letters().await.unwrap();
    assert_eq!(dead_letters.len(), 1);
    assert_eq!(dead_letters[0].task.run_id, receipt.run_id);
    assert_eq!(dead_letters[0].delivery_count, 7);

    // Budget exhausted (six lost attempts against max_attempts = 1).
    let err = harness
        .coordinator
        .requeue_dead_letter(&dead_letters[0].dlq_id, false)
        .await
        .unwrap_err();
    assert!(matches!(err, CoordinatorError::AttemptsExhausted { .. }));
    assert_eq!(
        harness.run_status(&receipt.run_id).await,
        RunStatus::DeadLetter
    );

    // Overriding the budget restores the run and bumps attempts_used.
    let before = harness
        .store
        .get_run(&receipt.run_id)
        .await
        .unwrap()
        .attempts_used;
    let run = harness
        .coordinator
        .requeue_dead_letter(&dead_letters[0].dlq_id, true)
        .await
        .unwrap();
    assert_eq!(run.status, RunStatus::Pending);
    assert_eq!(run.attempts_used, before + 1);
    assert_eq!(harness.queue.stats().await.unwrap().dlq_length, 0);
    assert_eq!(harness.queue.stats().await.unwrap().stream_length, 1);
}

#[tokio::test]
async fn visibility_expiry_causes_exactly_one_redelivery() {
    let provider = Arc::new(ScriptedProvider::always("answer"));
    let mut settings = common::fast_settings();
    settings.task_visibility = Duration::from_millis(40);
    let harness = Harness::with_settings(provider, settings);
    let receipt = harness.coordinator.submit(submit(2)).await.unwrap();

    // Worker A claims, opens its attempt, and dies without ever closing it
    // or heartbeating. Recovery is worker B's job this time.
    let claimed = harness
        .queue
        .claim("worker-a", 1, Duration::from_millis(100))
        .await
        .unwrap();
    assert_eq!(claimed.len(), 1);
    harness
        .ledger
        .open_attempt(&receipt.run_id, "worker-a")
        .await
        .unwrap();
    tokio::time::sleep(
        harness.coordinator.settings().task_visibility + Duration::from_millis(30),
    )
    .await;

    // Worker B sees the orphaned in-flight attempt with no live heartbeat,
    // closes it as lost, and completes the run on a fresh attempt.
    let worker_b = harness.coordinator.worker("worker-b");
    let run = harness.drive_to_terminal(&worker_b, &receipt.run_id).await;

    assert_eq!(run.status, RunStatus::Succeeded);
    let attempts = harness.ledger.list_attempts(&receipt.run_id).await.unwrap();
    assert_eq!(attempts.len(), 2);
    assert_eq!(attempts[0].status, runloom::ledger::AttemptStatus::Lost);
    assert_eq!(attempts[1].status, runloom::ledger::AttemptStatus::Succeeded);
    assert_eq!(attempts[1].worker_id, "worker-b");
}
