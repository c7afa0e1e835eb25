use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use miette::Diagnostic;
use serde_json::json;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use super::provider::{GenerateRequest, GenerateResponse, Provider, ProviderError};
use super::retry::RetryPolicy;
use super::tool::Tool;
use crate::observe::{EventKind, EventSink, RunEvent};
use crate::registry::Registry;
use crate::store::{ChatMessage, Run, StateStore, StoreError};

/// Async sleep indirection so backoff tests can record delays instead of
/// waiting them out.
pub type Sleeper = Arc<dyn Fn(Duration) -> BoxFuture<'static, ()> + Send + Sync>;

/// Uniform `[0, 1)` sample source feeding rate-limit jitter.
pub type JitterSource = Arc<dyn Fn() -> f64 + Send + Sync>;

fn tokio_sleeper() -> Sleeper {
    Arc::new(|d| tokio::time::sleep(d).boxed())
}

fn random_jitter() -> JitterSource {
    Arc::new(rand::random::<f64>)
}

/// Options for one agent-loop execution.
#[derive(Clone, Debug)]
pub struct AgentOptions {
    /// Iterations (LLM call + tool round) before the step fails.
    pub max_iterations: u32,
    pub system_prompt: Option<String>,
    pub model: Option<String>,
    pub retry: RetryPolicy,
}

impl Default for AgentOptions {
    fn default() -> Self {
        Self {
            max_iterations: 10,
            system_prompt: None,
            model: None,
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Debug, Error, Diagnostic)]
pub enum AgentError {
    #[error("agent loop hit the iteration budget ({max_iterations}) without a final answer")]
    #[diagnostic(
        code(runloom::agent::iteration_budget_exceeded),
        help("Raise max_iterations or check for a tool-call loop.")
    )]
    IterationBudgetExceeded { max_iterations: u32 },

    #[error(transparent)]
    #[diagnostic(code(runloom::agent::provider))]
    Provider(#[from] ProviderError),

    #[error(transparent)]
    #[diagnostic(code(runloom::agent::store))]
    Store(#[from] StoreError),

    #[error("agent step cancelled")]
    #[diagnostic(code(runloom::agent::cancelled))]
    Cancelled,
}

impl AgentError {
    /// Stable machine code surfaced into `Run.error`.
    #[must_use]
    pub fn machine_code(&self) -> &'static str {
        match self {
            AgentError::IterationBudgetExceeded { .. } => "IterationBudgetExceeded",
            AgentError::Provider(ProviderError::RateLimited { .. }) => "ProviderRateLimited",
            AgentError::Provider(_) => "ProviderError",
            AgentError::Store(_) => "StoreUnavailable",
            AgentError::Cancelled => "Cancelled",
        }
    }
}

/// Single-run execution: prompt → LLM → tool calls → iterate.
///
/// Tool errors are fed back into the conversation as tool-role messages and
/// never fail the run directly. Provider errors trigger the retry policy;
/// the rate-limit axis is consulted first, everything else uses the generic
/// schedule.
pub struct AgentLoop {
    provider: Arc<dyn Provider>,
    tools: Arc<Registry<Arc<dyn Tool>>>,
    store: Arc<dyn StateStore>,
    events: Arc<dyn EventSink>,
    options: AgentOptions,
    sleeper: Sleeper,
    jitter: JitterSource,
}

impl AgentLoop {
    #[must_use]
    pub fn new(
        provider: Arc<dyn Provider>,
        tools: Arc<Registry<Arc<dyn Tool>>>,
        store: Arc<dyn StateStore>,
        events: Arc<dyn EventSink>,
        options: AgentOptions,
    ) -> Self {
        Self {
            provider,
            tools,
            store,
            events,
            options,
            sleeper: tokio_sleeper(),
            jitter: random_jitter(),
        }
    }

    /// Replace the sleep implementation (tests).
    #[must_use]
    pub fn with_sleeper(mut self, sleeper: Sleeper) -> Self {
        self.sleeper = sleeper;
        self
    }

    /// Replace the jitter source (tests).
    #[must_use]
    pub fn with_jitter(mut self, jitter: JitterSource) -> Self {
        self.jitter = jitter;
        self
    }

    /// Execute one step of the run to a final assistant answer.
    #[instrument(skip(self, run, cancel), fields(run_id = %run.run_id), err)]
    pub async fn run(&self, run: &Run, cancel: &CancellationToken) -> Result<String, AgentError> {
        let mut history = self.store.list_messages(&run.run_id, None).await?;
        let tool_schemas: Vec<_> = self
            .tools
            .list()
            .into_iter()
            .map(|t| t.schema())
            .collect();
        // A flow-resolved prompt on the run wins over the loop default.
        let system_prompt = run
            .metadata
            .get("system_prompt")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .or_else(|| self.options.system_prompt.clone());

        for _ in 0..self.options.max_iterations {
            if cancel.is_cancelled() {
                return Err(AgentError::Cancelled);
            }
            let request = GenerateRequest {
                model: self.options.model.clone(),
                system_prompt: system_prompt.clone(),
                messages: history.clone(),
                tool_schemas: tool_schemas.clone(),
                response_schema: None,
            };
            let started = Instant::now();
            let response = self.generate_with_retry(run, request, cancel).await?;
            self.emit(
                RunEvent::new(&run.run_id, EventKind::Generate)
                    .with_duration_ms(started.elapsed().as_millis() as u64)
                    .with_attr("input_tokens", json!(response.usage.input_tokens))
                    .with_attr("output_tokens", json!(response.usage.output_tokens))
                    .with_attr("tool_calls", json!(response.message.tool_calls.len())),
            )
            .await;

            if response.message.tool_calls.is_empty() {
                let answer = response.message.content;
                let message = ChatMessage::assistant(&run.run_id, &answer);
                self.store.append_message(message).await?;
                return Ok(answer);
            }

            if !response.message.content.is_empty() {
                let message = ChatMessage::assistant(&run.run_id, &response.message.content);
                self.store.append_message(message.clone()).await?;
                history.push(message);
            }

            for call in &response.message.tool_calls {
                if cancel.is_cancelled() {
                    return Err(AgentError::Cancelled);
                }
                let tool_started = Instant::now();
                let (content, errored) = match self.tools.get(&call.name) {
                    Some(tool) => match tool.invoke(call.arguments.clone()).await {
                        Ok(result) => (result.to_string(), false),
                        Err(e) => (e.to_string(), true),
                    },
                    None => (format!("tool not found: {}", call.name), true),
                };
                let mut event = RunEvent::new(&run.run_id, EventKind::Tool)
                    .with_duration_ms(tool_started.elapsed().as_millis() as u64)
                    .with_attr("tool", json!(call.name));
                if errored {
                    event = event.with_attr("error", json!(content));
                }
                self.emit(event).await;

                let mut message = ChatMessage::tool(&run.run_id, &call.name, &content);
                message.tool_args = Some(call.arguments.clone());
                self.store.append_message(message.clone()).await?;
                history.push(message);
            }
        }

        Err(AgentError::IterationBudgetExceeded {
            max_iterations: self.options.max_iterations,
        })
    }

    /// Call the provider, retrying per policy. Rate-limit failures use the
    /// dedicated schedule with jitter; everything else doubles from the
    /// generic base.
    async fn generate_with_retry(
        &self,
        run: &Run,
        request: GenerateRequest,
        cancel: &CancellationToken,
    ) -> Result<GenerateResponse, AgentError> {
        let policy = self.options.retry.normalize();
        let mut generic_failures = 0u32;
        let mut rate_limit_failures = 0u32;
        loop {
            if cancel.is_cancelled() {
                return Err(AgentError::Cancelled);
            }
            match self.provider.generate(request.clone()).await {
                Ok(response) => return Ok(response),
                Err(error) => {
                    let (delay, category) = if error.is_rate_limited() {
                        rate_limit_failures += 1;
                        if rate_limit_failures >= policy.rate_limit_max_attempts {
                            return Err(error.into());
                        }
                        (
                            policy.rate_limit_backoff_for_attempt(
                                rate_limit_failures,
                                (self.jitter)(),
                            ),
                            "rate-limit",
                        )
                    } else {
                        generic_failures += 1;
                        if generic_failures >= policy.max_attempts {
                            return Err(error.into());
                        }
                        (policy.backoff_for_attempt(generic_failures), "generic")
                    };
                    self.emit(
                        RunEvent::new(&run.run_id, EventKind::Retry)
                            .with_attr("category", json!(category))
                            .with_attr("delay_ms", json!(delay.as_millis() as u64))
                            .with_attr("error", json!(error.to_string())),
                    )
                    .await;
                    (self.sleeper)(delay).await;
                }
            }
        }
    }

    async fn emit(&self, event: RunEvent) {
        // Observability never fails the hot path.
        let _ = self.events.emit(event).await;
    }
}
