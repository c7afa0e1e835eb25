//! Graph execution: checkpoint density, resume from the last checkpoint,
//! router overrides, and topology introspection.

mod common;

use std::sync::Arc;

use common::Harness;
use runloom::agent::{text_response, ProviderError, ScriptedProvider};
use runloom::coordinator::SubmitRequest;
use runloom::intervention::{InterventionAction, InterventionRequest};
use runloom::ledger::{AttemptLedger, AttemptStatus};
use runloom::observe::EventKind;
use runloom::store::{RunMode, RunStatus, StateStore};

fn graph_submit(workflow: &str, input: &str, max_attempts: u32) -> SubmitRequest {
    SubmitRequest {
        input: input.to_string(),
        mode: RunMode::GraphRun,
        workflow: Some(workflow.to_string()),
        flow: None,
        session_id: None,
        provider: None,
        max_attempts: Some(max_attempts),
        metadata: Default::default(),
        delivery: None,
    }
}

#[tokio::test]
async fn chain_resumes_from_last_checkpoint_after_mid_run_failure() {
    // Attempt 1: "plan" succeeds (checkpoint 1), "execute" blows up.
    // Attempt 2: resumes at "execute"; "plan" is never re-run.
    let provider = Arc::new(ScriptedProvider::new(vec![
        Ok(text_response("the plan")),
        Err(ProviderError::Failed {
            message: "mid-run crash".to_string(),
        }),
        Ok(text_response("the draft")),
        Ok(text_response("the summary")),
    ]));
    let harness = Harness::new(provider.clone());
    let receipt = harness
        .coordinator
        .submit(graph_submit("chain", "ship it", 2))
        .await
        .unwrap();

    let worker = harness.coordinator.worker("w1");
    let run = harness.drive_to_terminal(&worker, &receipt.run_id).await;

    assert_eq!(run.status, RunStatus::Succeeded);
    assert_eq!(run.output.as_deref(), Some("the summary"));

    let attempts = harness.ledger.list_attempts(&receipt.run_id).await.unwrap();
    let statuses: Vec<AttemptStatus> = attempts.iter().map(|a| a.status).collect();
    assert_eq!(statuses, vec![AttemptStatus::Failed, AttemptStatus::Succeeded]);

    // Dense checkpoint sequence, one per committed node.
    let checkpoints = harness
        .store
        .list_checkpoints(&receipt.run_id, None)
        .await
        .unwrap();
    let seqs: Vec<u64> = checkpoints.iter().map(|c| c.seq).collect();
    assert_eq!(seqs, vec![1, 2, 3]);
    let nodes: Vec<&str> = checkpoints.iter().map(|c| c.node_id.as_str()).collect();
    assert_eq!(nodes, vec!["plan", "execute", "summarize"]);

    // Exactly four provider calls: plan, failed execute, execute, summarize.
    assert_eq!(provider.call_count(), 4);
}

#[tokio::test]
async fn map_reduce_fans_out_and_combines() {
    let provider = Arc::new(ScriptedProvider::new(vec![
        Ok(text_response("alpha-done")),
        Ok(text_response("beta-done")),
        Ok(text_response("combined")),
    ]));
    let harness = Harness::new(provider);
    let receipt = harness
        .coordinator
        .submit(graph_submit("map-reduce", "alpha\nbeta", 1))
        .await
        .unwrap();

    let worker = harness.coordinator.worker("w1");
    let run = harness.drive_to_terminal(&worker, &receipt.run_id).await;

    assert_eq!(run.status, RunStatus::Succeeded);
    assert_eq!(run.output.as_deref(), Some("combined"));

    // Split is pure (no checkpoint); map and reduce each commit one.
    let checkpoints = harness
        .store
        .list_checkpoints(&receipt.run_id, None)
        .await
        .unwrap();
    let nodes: Vec<&str> = checkpoints.iter().map(|c| c.node_id.as_str()).collect();
    assert_eq!(nodes, vec!["map", "reduce"]);
}

#[tokio::test]
async fn router_honors_forced_route_without_classifying() {
    // Only one provider call: the "action" agent node. The classifier is
    // bypassed by the forced route.
    let provider = Arc::new(ScriptedProvider::new(vec![Ok(text_response(
        "did the thing",
    ))]));
    let harness = Harness::new(provider.clone());
    let receipt = harness
        .coordinator
        .submit(graph_submit("router", "do something", 1))
        .await
        .unwrap();
    harness
        .coordinator
        .intervene(
            &receipt.run_id,
            InterventionRequest {
                id: None,
                action: InterventionAction::OverrideRouter {
                    route: "action".to_string(),
                },
                reason: "operator override".to_string(),
                actor: "ops-key".to_string(),
            },
        )
        .await
        .unwrap();

    let worker = harness.coordinator.worker("w1");
    let run = harness.drive_to_terminal(&worker, &receipt.run_id).await;

    assert_eq!(run.status, RunStatus::Succeeded);
    assert_eq!(run.output.as_deref(), Some("did the thing"));
    assert_eq!(provider.call_count(), 1);

    let router_events: Vec<_> = harness
        .sink
        .for_run(&receipt.run_id)
        .into_iter()
        .filter(|e| e.kind == EventKind::Router)
        .collect();
    assert_eq!(router_events.len(), 1);
    assert_eq!(
        router_events[0].attributes.get("route").and_then(|v| v.as_str()),
        Some("action")
    );
    assert_eq!(
        router_events[0].attributes.get("forced").and_then(|v| v.as_bool()),
        Some(true)
    );
}

#[tokio::test]
async fn resume_checkpoint_discards_later_state_and_converges() {
    let provider = Arc::new(ScriptedProvider::new(vec![
        Ok(text_response("plan-1")),
        Ok(text_response("draft-1")),
        Ok(text_response("summary-1")),
        // Replays after the rewind:
        Ok(text_response("draft-2")),
        Ok(text_response("summary-2")),
    ]));
    let harness = Harness::new(provider);
    let receipt = harness
        .coordinator
        .submit(graph_submit("chain", "twice", 3))
        .await
        .unwrap();
    let worker = harness.coordinator.worker("w1");
    let first = harness.drive_to_terminal(&worker, &receipt.run_id).await;
    assert_eq!(first.output.as_deref(), Some("summary-1"));

    // Rewind to checkpoint 1 (after "plan") and re-run the tail.
    let request = InterventionRequest {
        id: Some("rewind-1".to_string()),
        action: InterventionAction::ResumeCheckpoint { seq: 1 },
        reason: "replay the tail".to_string(),
        actor: "ops-key".to_string(),
    };
    let outcome = harness
        .coordinator
        .intervene(&receipt.run_id, request.clone())
        .await
        .unwrap();
    assert!(outcome.applied);

    // Redelivery of the same intervention id is a no-op.
    let repeat = harness
        .coordinator
        .intervene(&receipt.run_id, request)
        .await
        .unwrap();
    assert!(!repeat.applied);

    let second = harness.drive_to_terminal(&worker, &receipt.run_id).await;
    assert_eq!(second.status, RunStatus::Succeeded);
    assert_eq!(second.output.as_deref(), Some("summary-2"));

    let checkpoints = harness
        .store
        .list_checkpoints(&receipt.run_id, None)
        .await
        .unwrap();
    let seqs: Vec<u64> = checkpoints.iter().map(|c| c.seq).collect();
    assert_eq!(seqs, vec![1, 2, 3]);
    assert_eq!(checkpoints[0].node_id, "plan");
}

#[tokio::test]
async fn topology_exposes_nodes_edges_and_rollups() {
    let provider = Arc::new(ScriptedProvider::always("ok"));
    let harness = Harness::new(provider);
    let topology = harness.coordinator.topology("chain").unwrap();
    let ids: Vec<&str> = topology.nodes.iter().map(|n| n.id.as_str()).collect();
    assert_eq!(ids, vec!["plan", "execute", "summarize"]);
    assert_eq!(topology.edges.len(), 2);

    let receipt = harness
        .coordinator
        .submit(graph_submit("chain", "hello", 1))
        .await
        .unwrap();
    let worker = harness.coordinator.worker("w1");
    harness.drive_to_terminal(&worker, &receipt.run_id).await;

    let events = harness.coordinator.run_events(&receipt.run_id).await.unwrap();
    let rollups = topology.rollup(&events);
    let plan = rollups.iter().find(|r| r.node_id == "plan").unwrap();
    assert!(plan.executions >= 1);
    assert_eq!(plan.failures, 0);
    assert_eq!(plan.failure_rate, 0.0);
}
