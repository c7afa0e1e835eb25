//! Single-run agent execution: prompt assembly, LLM calls, tool dispatch,
//! and the two-axis retry policy.

mod provider;
mod retry;
mod runner;
mod tool;

pub use provider::{
    text_response, AssistantTurn, GenerateRequest, GenerateResponse, Provider, ProviderError,
    ScriptedProvider, ToolCall, Usage,
};
pub use retry::{is_rate_limit_message, RetryPolicy};
pub use runner::{AgentError, AgentLoop, AgentOptions, JitterSource, Sleeper};
pub use tool::{Tool, ToolError, ToolSchema};
