use async_trait::async_trait;
use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Declared surface of a tool, shipped to the LLM alongside the prompt.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    /// JSON schema of the accepted arguments.
    pub parameters: Value,
}

#[derive(Debug, Error, Diagnostic)]
pub enum ToolError {
    #[error("invalid tool arguments: {message}")]
    #[diagnostic(code(runloom::tool::invalid_args))]
    InvalidArgs { message: String },

    #[error("tool failed: {message}")]
    #[diagnostic(code(runloom::tool::failed))]
    Failed { message: String },
}

/// Opaque `invoke(args) -> result` contract. Tool errors are surfaced into
/// the conversation as tool-role messages; they never fail a run by
/// themselves.
#[async_trait]
pub trait Tool: Send + Sync {
    fn schema(&self) -> ToolSchema;

    async fn invoke(&self, args: Value) -> Result<Value, ToolError>;
}
