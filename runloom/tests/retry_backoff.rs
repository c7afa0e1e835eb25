//! Rate-limit backoff runs inside a single attempt with its own schedule.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{fixed_jitter, Harness, RecordingSleeper};
use runloom::agent::{text_response, ProviderError, ScriptedProvider};
use runloom::coordinator::SubmitRequest;
use runloom::ledger::{AttemptLedger, AttemptStatus};
use runloom::observe::EventKind;
use runloom::store::{RunMode, RunStatus};

fn submit(input: &str) -> SubmitRequest {
    SubmitRequest {
        input: input.to_string(),
        mode: RunMode::Run,
        workflow: Some("basic".to_string()),
        flow: None,
        session_id: None,
        provider: None,
        max_attempts: Some(1),
        metadata: Default::default(),
        delivery: None,
    }
}

#[tokio::test]
async fn rate_limit_error_uses_the_rate_limit_schedule() {
    // Untyped provider error: detection falls back to the substring test.
    let provider = Arc::new(ScriptedProvider::new(vec![
        Err(ProviderError::Failed {
            message: "HTTP 429 Too Many Requests".to_string(),
        }),
        Ok(text_response("eventually")),
    ]));
    // Default retry policy: the rate-limit axis must kick in even though
    // generic max_attempts is 1.
    let mut settings = common::fast_settings();
    settings.retry = runloom::agent::RetryPolicy::default();
    let harness = Harness::with_settings(provider, settings);
    let receipt = harness.coordinator.submit(submit("hi")).await.unwrap();

    let sleeper = RecordingSleeper::new();
    let worker = harness
        .coordinator
        .worker("w1")
        .with_sleeper(sleeper.as_sleeper())
        .with_jitter(fixed_jitter());
    let run = harness.drive_to_terminal(&worker, &receipt.run_id).await;

    assert_eq!(run.status, RunStatus::Succeeded);
    assert_eq!(run.output.as_deref(), Some("eventually"));

    // One sleep on the rate-limit schedule: 30 s ± 20 % (midpoint jitter
    // pins it to exactly 30 s).
    let delays = sleeper.delays();
    assert_eq!(delays.len(), 1);
    assert!(delays[0] >= Duration::from_secs(24), "slept {:?}", delays[0]);
    assert!(delays[0] <= Duration::from_secs(36), "slept {:?}", delays[0]);

    // The whole dance happened inside one attempt.
    let attempts = harness.ledger.list_attempts(&receipt.run_id).await.unwrap();
    assert_eq!(attempts.len(), 1);
    assert_eq!(attempts[0].status, AttemptStatus::Succeeded);

    let retries: Vec<_> = harness
        .sink
        .for_run(&receipt.run_id)
        .into_iter()
        .filter(|e| e.kind == EventKind::Retry)
        .collect();
    assert_eq!(retries.len(), 1);
    assert_eq!(
        retries[0].attributes.get("category").and_then(|v| v.as_str()),
        Some("rate-limit")
    );
}

#[tokio::test]
async fn typed_rate_limit_errors_are_detected_without_substrings() {
    let provider = Arc::new(ScriptedProvider::new(vec![
        Err(ProviderError::RateLimited {
            message: "please slow down".to_string(),
        }),
        Ok(text_response("done")),
    ]));
    let mut settings = common::fast_settings();
    settings.retry = runloom::agent::RetryPolicy::default();
    let harness = Harness::with_settings(provider, settings);
    let receipt = harness.coordinator.submit(submit("hi")).await.unwrap();

    let sleeper = RecordingSleeper::new();
    let worker = harness
        .coordinator
        .worker("w1")
        .with_sleeper(sleeper.as_sleeper())
        .with_jitter(fixed_jitter());
    let run = harness.drive_to_terminal(&worker, &receipt.run_id).await;

    assert_eq!(run.status, RunStatus::Succeeded);
    assert_eq!(sleeper.delays(), vec![Duration::from_secs(30)]);
}

#[tokio::test]
async fn rate_limit_retries_exhaust_and_fail_the_attempt() {
    let provider = Arc::new(ScriptedProvider::new(vec![Err(
        ProviderError::RateLimited {
            message: "hard ceiling".to_string(),
        },
    )]));
    let mut settings = common::fast_settings();
    settings.retry = runloom::agent::RetryPolicy::default();
    let harness = Harness::with_settings(provider, settings);
    let receipt = harness.coordinator.submit(submit("hi")).await.unwrap();

    let sleeper = RecordingSleeper::new();
    let worker = harness
        .coordinator
        .worker("w1")
        .with_sleeper(sleeper.as_sleeper())
        .with_jitter(fixed_jitter());
    let run = harness.drive_to_terminal(&worker, &receipt.run_id).await;

    assert_eq!(run.status, RunStatus::Failed);
    let error = run.error.unwrap();
    assert!(error.starts_with("ProviderRateLimited"), "error was {error}");

    // rate_limit_max_attempts = 3: two sleeps (30 s, 45 s), then give up.
    let delays = sleeper.delays();
    assert_eq!(delays.len(), 2);
    assert_eq!(delays[0], Duration::from_secs(30));
    assert_eq!(delays[1], Duration::from_secs(45));
}
