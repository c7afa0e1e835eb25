use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use super::node::{GraphContext, GraphError, GraphState};
use super::topology::Workflow;
use crate::observe::{EventKind, EventSink, RunEvent};
use crate::store::{Run, RunCheckpoint, StateStore};

/// Result of driving a workflow to completion.
#[derive(Clone, Debug)]
pub struct GraphReport {
    /// Final answer, taken from the `"output"` state key.
    pub output: String,
    /// Nodes executed in this invocation (excludes checkpointed history).
    pub executed_nodes: u64,
    /// Checkpoint the invocation resumed from, if any.
    pub resumed_from: Option<u64>,
}

/// Drives workflow topologies: node scheduling, checkpointing, and resume
/// from the last persisted checkpoint.
pub struct GraphEngine {
    store: Arc<dyn StateStore>,
    events: Arc<dyn EventSink>,
}

impl GraphEngine {
    #[must_use]
    pub fn new(store: Arc<dyn StateStore>, events: Arc<dyn EventSink>) -> Self {
        Self { store, events }
    }

    /// Execute `workflow` for `run`, resuming from the latest checkpoint
    /// when one exists.
    ///
    /// Checkpoints are written after every node that requires one: `seq` is
    /// monotonic from 1 and each checkpoint carries the merged state plus
    /// the frontier to re-enter, so a resumed attempt continues exactly
    /// where the crashed one left off.
    #[instrument(skip(self, workflow, run, cancel), fields(run_id = %run.run_id, workflow = workflow.name()), err)]
    pub async fn run(
        &self,
        workflow: &Workflow,
        run: &Run,
        cancel: &CancellationToken,
    ) -> Result<GraphReport, GraphError> {
        let latest = self.store.latest_checkpoint(&run.run_id, None).await?;
        let (mut state, mut frontier, mut seq, resumed_from) = match latest {
            Some(cp) => {
                let frontier: VecDeque<String> = if cp.frontier.is_empty() {
                    workflow.successors(&cp.node_id).iter().cloned().collect()
                } else {
                    cp.frontier.iter().cloned().collect()
                };
                (
                    GraphState::from_values(cp.state.clone()),
                    frontier,
                    cp.seq,
                    Some(cp.seq),
                )
            }
            None => (
                GraphState::new_with_input(&run.input),
                VecDeque::from([workflow.entry().to_string()]),
                0,
                None,
            ),
        };

        let forced_route = run
            .metadata
            .get("forced_route")
            .and_then(|v| v.as_str())
            .map(str::to_string);

        let mut executed_nodes = 0u64;
        while let Some(node_id) = frontier.pop_front() {
            if cancel.is_cancelled() {
                return Err(GraphError::Cancelled);
            }
            let node = workflow
                .node(&node_id)
                .ok_or_else(|| GraphError::UnknownNode {
                    workflow: workflow.name().to_string(),
                    node_id: node_id.clone(),
                })?;
            let ctx = GraphContext {
                run_id: run.run_id.clone(),
                node_id: node_id.clone(),
                forced_route: forced_route.clone(),
                events: self.events.clone(),
                cancel: cancel.clone(),
            };
            let started = Instant::now();
            let outcome = node.execute(&ctx, &state).await?;
            executed_nodes += 1;

            let delta_value = json!(outcome.delta.clone());
            state.merge(outcome.delta);

            let next = if outcome.next.is_empty() {
                workflow.successors(&node_id).to_vec()
            } else {
                outcome.next
            };
            for target in next {
                if !frontier.contains(&target) {
                    frontier.push_back(target);
                }
            }

            if outcome.checkpoint {
                seq += 1;
                self.store
                    .save_checkpoint(RunCheckpoint {
                        run_id: run.run_id.clone(),
                        seq,
                        node_id: node_id.clone(),
                        output: delta_value,
                        state: state.values().clone(),
                        frontier: frontier.iter().cloned().collect(),
                        created_at: Utc::now(),
                    })
                    .await?;
                let _ = self
                    .events
                    .emit(
                        RunEvent::new(&run.run_id, EventKind::Checkpoint)
                            .with_node(&node_id)
                            .with_duration_ms(started.elapsed().as_millis() as u64)
                            .with_attr("seq", json!(seq)),
                    )
                    .await;
            }
        }

        Ok(GraphReport {
            output: state.get_str("output").unwrap_or_default().to_string(),
            executed_nodes,
            resumed_from,
        })
    }
}
