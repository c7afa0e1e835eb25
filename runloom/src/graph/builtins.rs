//! Built-in workflow topologies: `basic`, `chain`, `router`, `map-reduce`.
//!
//! All four are LLM-backed over the shared state object. They are
//! registered by name at process start and submitted via `mode=graph-run`.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures_util::future::join_all;
use serde_json::{json, Value};

use super::node::{GraphContext, GraphError, GraphNode, GraphState, NodeOutcome};
use super::topology::{NodeSpec, Workflow};
use crate::agent::{GenerateRequest, Provider};
use crate::observe::{EventKind, RunEvent};
use crate::registry::{Registry, RegistryError};
use crate::store::ChatMessage;

/// One LLM step: reads `input_key`, writes the assistant answer to
/// `output_key`. Always checkpointed.
pub struct AgentStepNode {
    provider: Arc<dyn Provider>,
    system_prompt: Option<String>,
    input_key: String,
    output_key: String,
}

impl AgentStepNode {
    #[must_use]
    pub fn new(provider: Arc<dyn Provider>, input_key: &str, output_key: &str) -> Self {
        Self {
            provider,
            system_prompt: None,
            input_key: input_key.to_string(),
            output_key: output_key.to_string(),
        }
    }

    #[must_use]
    pub fn with_system_prompt(mut self, prompt: &str) -> Self {
        self.system_prompt = Some(prompt.to_string());
        self
    }
}

#[async_trait]
impl GraphNode for AgentStepNode {
    async fn execute(
        &self,
        ctx: &GraphContext,
        state: &GraphState,
    ) -> Result<NodeOutcome, GraphError> {
        let input = state
            .get_str(&self.input_key)
            .ok_or_else(|| GraphError::MissingState {
                node_id: ctx.node_id.clone(),
                key: self.input_key.clone(),
            })?;
        let started = Instant::now();
        let response = self
            .provider
            .generate(GenerateRequest {
                system_prompt: self.system_prompt.clone(),
                messages: vec![ChatMessage::user(&ctx.run_id, input)],
                ..Default::default()
            })
            .await?;
        ctx.emit(
            RunEvent::new(&ctx.run_id, EventKind::Generate)
                .with_duration_ms(started.elapsed().as_millis() as u64)
                .with_attr("input_tokens", json!(response.usage.input_tokens))
                .with_attr("output_tokens", json!(response.usage.output_tokens)),
        )
        .await;
        Ok(NodeOutcome::advance()
            .with(&self.output_key, Value::String(response.message.content))
            .checkpointed())
    }
}

/// Conditional branch by classifier output. An operator's
/// `metadata.forced_route` wins over classification; otherwise the LLM
/// answer is matched against the route names, falling back to the default.
pub struct RouterNode {
    provider: Arc<dyn Provider>,
    routes: Vec<String>,
    default_route: String,
}

impl RouterNode {
    #[must_use]
    pub fn new(provider: Arc<dyn Provider>, routes: Vec<String>, default_route: &str) -> Self {
        Self {
            provider,
            routes,
            default_route: default_route.to_string(),
        }
    }

    async fn classify(&self, ctx: &GraphContext, input: &str) -> Result<String, GraphError> {
        let prompt = format!(
            "Classify the request into exactly one of: {}. Answer with the label only.\n\nRequest: {input}",
            self.routes.join(", ")
        );
        let response = self
            .provider
            .generate(GenerateRequest {
                messages: vec![ChatMessage::user(&ctx.run_id, &prompt)],
                ..Default::default()
            })
            .await?;
        let answer = response.message.content.trim().to_lowercase();
        Ok(self
            .routes
            .iter()
            .find(|r| answer.contains(&r.to_lowercase()))
            .cloned()
            .unwrap_or_else(|| self.default_route.clone()))
    }
}

#[async_trait]
impl GraphNode for RouterNode {
    async fn execute(
        &self,
        ctx: &GraphContext,
        state: &GraphState,
    ) -> Result<NodeOutcome, GraphError> {
        let input = state.get_str("input").unwrap_or_default().to_string();
        let (route, forced) = match &ctx.forced_route {
            Some(route) if self.routes.contains(route) => (route.clone(), true),
            _ => (self.classify(ctx, &input).await?, false),
        };
        ctx.emit(
            RunEvent::new(&ctx.run_id, EventKind::Router)
                .with_attr("route", json!(route))
                .with_attr("forced", json!(forced)),
        )
        .await;
        Ok(NodeOutcome::advance()
            .with("route", Value::String(route.clone()))
            .to(route)
            .checkpointed())
    }
}

/// Pure fan-out preparation: splits `input` into parts on newlines.
pub struct SplitNode;

#[async_trait]
impl GraphNode for SplitNode {
    async fn execute(
        &self,
        _ctx: &GraphContext,
        state: &GraphState,
    ) -> Result<NodeOutcome, GraphError> {
        let input = state.get_str("input").unwrap_or_default();
        let parts: Vec<Value> = input
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(|l| Value::String(l.to_string()))
            .collect();
        // Pure transform: no checkpoint required.
        Ok(NodeOutcome::advance().with("parts", Value::Array(parts)))
    }
}

/// Fan-out over the prepared parts: one concurrent LLM call per part, then
/// collect. The fan-out is node-internal so the checkpoint sequence stays
/// dense.
pub struct MapNode {
    provider: Arc<dyn Provider>,
}

impl MapNode {
    #[must_use]
    pub fn new(provider: Arc<dyn Provider>) -> Self {
        Self { provider }
    }
}

#[async_trait]
impl GraphNode for MapNode {
    async fn execute(
        &self,
        ctx: &GraphContext,
        state: &GraphState,
    ) -> Result<NodeOutcome, GraphError> {
        let parts: Vec<String> = state
            .get("parts")
            .and_then(Value::as_array)
            .map(|a| {
                a.iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .ok_or_else(|| GraphError::MissingState {
                node_id: ctx.node_id.clone(),
                key: "parts".to_string(),
            })?;
        let calls = parts.iter().map(|part| {
            self.provider.generate(GenerateRequest {
                messages: vec![ChatMessage::user(&ctx.run_id, part)],
                ..Default::default()
            })
        });
        let mut mapped = Vec::with_capacity(parts.len());
        for result in join_all(calls).await {
            mapped.push(Value::String(result?.message.content));
        }
        Ok(NodeOutcome::advance()
            .with("mapped", Value::Array(mapped))
            .checkpointed())
    }
}

/// Combine the mapped results into a single answer.
pub struct ReduceNode {
    provider: Arc<dyn Provider>,
}

impl ReduceNode {
    #[must_use]
    pub fn new(provider: Arc<dyn Provider>) -> Self {
        Self { provider }
    }
}

#[async_trait]
impl GraphNode for ReduceNode {
    async fn execute(
        &self,
        ctx: &GraphContext,
        state: &GraphState,
    ) -> Result<NodeOutcome, GraphError> {
        let mapped = state
            .get("mapped")
            .and_then(Value::as_array)
            .ok_or_else(|| GraphError::MissingState {
                node_id: ctx.node_id.clone(),
                key: "mapped".to_string(),
            })?;
        let combined = mapped
            .iter()
            .filter_map(Value::as_str)
            .collect::<Vec<_>>()
            .join("\n");
        let response = self
            .provider
            .generate(GenerateRequest {
                system_prompt: Some("Combine the partial results into one answer.".to_string()),
                messages: vec![ChatMessage::user(&ctx.run_id, &combined)],
                ..Default::default()
            })
            .await?;
        Ok(NodeOutcome::advance()
            .with("output", Value::String(response.message.content))
            .checkpointed())
    }
}

/// Register the four built-in topologies under their canonical names.
pub fn install_builtins(
    workflows: &Registry<Workflow>,
    provider: Arc<dyn Provider>,
) -> Result<(), RegistryError> {
    let basic = Workflow::builder("basic")
        .add_node(
            NodeSpec::new("agent", "agent", "Agent", 80.0, 120.0),
            AgentStepNode::new(provider.clone(), "input", "output"),
        )
        .build()
        .expect("basic workflow is well-formed");
    workflows.register("basic", basic)?;

    let chain = Workflow::builder("chain")
        .add_node(
            NodeSpec::new("plan", "agent", "Plan", 80.0, 120.0),
            AgentStepNode::new(provider.clone(), "input", "plan")
                .with_system_prompt("Produce a short plan for the request."),
        )
        .add_node(
            NodeSpec::new("execute", "agent", "Execute", 240.0, 120.0),
            AgentStepNode::new(provider.clone(), "plan", "draft")
                .with_system_prompt("Carry out the plan."),
        )
        .add_node(
            NodeSpec::new("summarize", "agent", "Summarize", 400.0, 120.0),
            AgentStepNode::new(provider.clone(), "draft", "output")
                .with_system_prompt("Summarize the result for the user."),
        )
        .add_edge("plan", "execute")
        .add_edge("execute", "summarize")
        .build()
        .expect("chain workflow is well-formed");
    workflows.register("chain", chain)?;

    let router = Workflow::builder("router")
        .add_node(
            NodeSpec::new("classify", "router", "Classify", 80.0, 120.0),
            RouterNode::new(
                provider.clone(),
                vec![
                    "research".to_string(),
                    "action".to_string(),
                    "respond".to_string(),
                ],
                "respond",
            ),
        )
        .add_node(
            NodeSpec::new("research", "agent", "Research", 240.0, 40.0),
            AgentStepNode::new(provider.clone(), "input", "output")
                .with_system_prompt("Research the question and report findings."),
        )
        .add_node(
            NodeSpec::new("action", "agent", "Action", 240.0, 120.0),
            AgentStepNode::new(provider.clone(), "input", "output")
                .with_system_prompt("Propose the concrete next actions."),
        )
        .add_node(
            NodeSpec::new("respond", "agent", "Respond", 240.0, 200.0),
            AgentStepNode::new(provider.clone(), "input", "output"),
        )
        .add_edge("classify", "respond")
        .entry("classify")
        .build()
        .expect("router workflow is well-formed");
    workflows.register("router", router)?;

    let map_reduce = Workflow::builder("map-reduce")
        .add_node(
            NodeSpec::new("split", "transform", "Split", 80.0, 120.0),
            SplitNode,
        )
        .add_node(
            NodeSpec::new("map", "agent", "Map", 240.0, 120.0),
            MapNode::new(provider.clone()),
        )
        .add_node(
            NodeSpec::new("reduce", "agent", "Reduce", 400.0, 120.0),
            ReduceNode::new(provider),
        )
        .add_edge("split", "map")
        .add_edge("map", "reduce")
        .build()
        .expect("map-reduce workflow is well-formed");
    workflows.register("map-reduce", map_reduce)?;

    Ok(())
}
