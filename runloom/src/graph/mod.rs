//! Workflow graph execution with checkpoint-driven resume.
//!
//! A workflow is a directed graph of nodes over a shared JSON state. The
//! engine executes nodes from an entry frontier, merges each node's state
//! delta, persists a checkpoint at every committed non-pure node, and
//! follows the node's chosen edges (falling back to the static topology).
//! Resume loads the latest checkpoint and re-enters the persisted frontier
//! as a fresh attempt.

mod builtins;
mod engine;
mod node;
mod topology;

pub use builtins::{
    install_builtins, AgentStepNode, MapNode, ReduceNode, RouterNode, SplitNode,
};
pub use engine::{GraphEngine, GraphReport};
pub use node::{GraphContext, GraphError, GraphNode, GraphState, NodeOutcome};
pub use topology::{
    NodeRollup, NodeSpec, TopologyEdge, TopologyView, Workflow, WorkflowBuilder,
};
