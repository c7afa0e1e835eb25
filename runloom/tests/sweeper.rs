//! Lost-worker detection: heartbeat lapses close in-flight attempts.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::Harness;
use runloom::agent::ScriptedProvider;
use runloom::coordinator::SubmitRequest;
use runloom::ledger::{AttemptLedger, AttemptStatus, WorkerStatus};
use runloom::queue::{LeaderLease, WorkQueue};
use runloom::store::{RunMode, RunStatus};

fn submit() -> SubmitRequest {
    SubmitRequest {
        input: "sweep me".to_string(),
        mode: RunMode::Run,
        workflow: Some("basic".to_string()),
        flow: None,
        session_id: None,
        provider: None,
        max_attempts: Some(2),
        metadata: Default::default(),
        delivery: None,
    }
}

#[tokio::test]
async fn sweeper_closes_attempts_of_stale_workers() {
    let harness = Harness::new(Arc::new(ScriptedProvider::always("late answer")));
    let receipt = harness.coordinator.submit(submit()).await.unwrap();

    // A worker registers, claims, opens its attempt, then goes silent.
    harness
        .ledger
        .upsert_heartbeat("doomed-worker", WorkerStatus::Active, 1)
        .await
        .unwrap();
    harness
        .queue
        .claim("doomed-worker", 1, Duration::from_millis(50))
        .await
        .unwrap();
    harness
        .ledger
        .open_attempt(&receipt.run_id, "doomed-worker")
        .await
        .unwrap();

    let sweeper = harness.coordinator.sweeper(None);

    // Heartbeat still fresh: nothing to sweep.
    assert_eq!(sweeper.sweep_once().await.unwrap(), 0);

    tokio::time::sleep(
        harness.coordinator.settings().heartbeat_timeout + Duration::from_millis(30),
    )
    .await;
    assert_eq!(sweeper.sweep_once().await.unwrap(), 1);

    let attempts = harness.ledger.list_attempts(&receipt.run_id).await.unwrap();
    assert_eq!(attempts.len(), 1);
    assert_eq!(attempts[0].status, AttemptStatus::Lost);
    let worker = harness
        .ledger
        .get_worker("doomed-worker")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(worker.status, WorkerStatus::Lost);

    // A second sweep finds nothing: lost workers are skipped.
    assert_eq!(sweeper.sweep_once().await.unwrap(), 0);

    // After visibility expiry the task redelivers and a live worker
    // finishes the run on attempt 2.
    tokio::time::sleep(
        harness.coordinator.settings().task_visibility + Duration::from_millis(30),
    )
    .await;
    let live = harness.coordinator.worker("live-worker");
    let run = harness.drive_to_terminal(&live, &receipt.run_id).await;
    assert_eq!(run.status, RunStatus::Succeeded);
    let attempts = harness.ledger.list_attempts(&receipt.run_id).await.unwrap();
    assert_eq!(attempts.len(), 2);
    assert_eq!(attempts[1].status, AttemptStatus::Succeeded);
}

#[tokio::test]
async fn sweeper_lease_keeps_a_single_sweeper_active() {
    let harness = Harness::new(Arc::new(ScriptedProvider::always("ok")));
    let lease: Arc<dyn LeaderLease> = harness.queue.clone();

    // Two holders: only the first acquires within the window.
    assert!(lease
        .try_acquire("runloom:sweeper", "sweeper-a", Duration::from_secs(5))
        .await
        .unwrap());
    assert!(!lease
        .try_acquire("runloom:sweeper", "sweeper-b", Duration::from_secs(5))
        .await
        .unwrap());
    // The incumbent refreshes freely.
    assert!(lease
        .try_acquire("runloom:sweeper", "sweeper-a", Duration::from_secs(5))
        .await
        .unwrap());
}
