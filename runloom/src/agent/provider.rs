use async_trait::async_trait;
use miette::Diagnostic;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use super::retry::is_rate_limit_message;
use super::tool::ToolSchema;
use crate::store::ChatMessage;

/// Request handed to a [`Provider`]. Providers must be stateless across
/// calls; everything they need is in the request.
#[derive(Clone, Debug, Default)]
pub struct GenerateRequest {
    pub model: Option<String>,
    pub system_prompt: Option<String>,
    pub messages: Vec<ChatMessage>,
    pub tool_schemas: Vec<ToolSchema>,
    pub response_schema: Option<Value>,
}

/// A tool invocation requested by the model.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub name: String,
    pub arguments: Value,
}

/// The assistant message of a generation: free text, tool calls, or both.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct AssistantTurn {
    pub content: String,
    #[serde(default)]
    pub tool_calls: Vec<ToolCall>,
}

/// Token accounting reported by the provider, when available.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct GenerateResponse {
    pub message: AssistantTurn,
    pub usage: Usage,
}

#[derive(Debug, Error, Diagnostic)]
pub enum ProviderError {
    /// Typed rate-limit signal. Providers that can classify upstream 429s
    /// should use this variant; the substring fallback exists for the rest.
    #[error("provider rate limited: {message}")]
    #[diagnostic(code(runloom::provider::rate_limited))]
    RateLimited { message: String },

    #[error("provider call failed: {message}")]
    #[diagnostic(code(runloom::provider::failed))]
    Failed { message: String },

    #[error("provider call cancelled")]
    #[diagnostic(code(runloom::provider::cancelled))]
    Cancelled,
}

impl ProviderError {
    /// Rate-limit classification: the typed variant wins, untyped failures
    /// fall back to the substring test.
    #[must_use]
    pub fn is_rate_limited(&self) -> bool {
        match self {
            ProviderError::RateLimited { .. } => true,
            ProviderError::Failed { message } => is_rate_limit_message(message),
            ProviderError::Cancelled => false,
        }
    }
}

/// Opaque `generate(request) -> response` contract over an LLM backend.
#[async_trait]
pub trait Provider: Send + Sync {
    async fn generate(&self, request: GenerateRequest)
        -> Result<GenerateResponse, ProviderError>;
}

type ScriptedResult = Result<GenerateResponse, ProviderError>;

/// Deterministic provider that replays a scripted sequence of results.
///
/// The workhorse of the integration tests: failures, rate limits, and tool
/// call turns can be staged in order. Once the script is exhausted the last
/// response repeats.
pub struct ScriptedProvider {
    script: Mutex<Vec<ScriptedResult>>,
    calls: Mutex<Vec<GenerateRequest>>,
}

impl ScriptedProvider {
    #[must_use]
    pub fn new(script: Vec<ScriptedResult>) -> Self {
        Self {
            script: Mutex::new(script),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Provider that always answers with plain text.
    #[must_use]
    pub fn always(text: &str) -> Self {
        Self::new(vec![Ok(text_response(text))])
    }

    /// Requests observed so far, in call order.
    #[must_use]
    pub fn requests(&self) -> Vec<GenerateRequest> {
        self.calls.lock().clone()
    }

    #[must_use]
    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }
}

/// Build a plain-text assistant response.
#[must_use]
pub fn text_response(text: &str) -> GenerateResponse {
    GenerateResponse {
        message: AssistantTurn {
            content: text.to_string(),
            tool_calls: vec![],
        },
        usage: Usage {
            input_tokens: 10,
            output_tokens: 5,
        },
    }
}

#[async_trait]
impl Provider for ScriptedProvider {
    async fn generate(
        &self,
        request: GenerateRequest,
    ) -> Result<GenerateResponse, ProviderError> {
        self.calls.lock().push(request);
        let mut script = self.script.lock();
        if script.len() > 1 {
            return script.remove(0);
        }
        match script.first() {
            Some(Ok(response)) => Ok(response.clone()),
            Some(Err(ProviderError::RateLimited { message })) => Err(ProviderError::RateLimited {
                message: message.clone(),
            }),
            Some(Err(ProviderError::Failed { message })) => Err(ProviderError::Failed {
                message: message.clone(),
            }),
            Some(Err(ProviderError::Cancelled)) | None => Err(ProviderError::Cancelled),
        }
    }
}
