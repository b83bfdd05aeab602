//! Provider contract: request shape and the `LlmProvider` trait the
//! orchestrator and critique loop run against. Tests substitute a
//! scripted fake; production wires `AnthropicClient`.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use herald_core::types::TokenUsage;
use herald_core::Result;

use crate::stream::{StopReason, StreamEvent};
use crate::tokens;

/// One block of the system prompt. Blocks flagged `cache` get an ephemeral
/// cache_control breakpoint; the volatile file manifest never does.
#[derive(Debug, Clone)]
pub struct SystemBlock {
    pub text: String,
    pub cache: bool,
}

/// Client-side tool definition sent to the LLM API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub input_schema: serde_json::Value,
}

/// Provider-executed tools: the request declares them, the provider runs
/// them, and the stream carries only their results.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerTool {
    WebSearch { max_uses: u32 },
    WebFetch { max_uses: u32 },
}

/// A tool call extracted from a (non-streaming) response.
#[derive(Debug, Clone)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub input: serde_json::Value,
}

/// Request to the LLM. `messages` are raw API content blocks — the agent
/// loop needs tool_use / tool_result / thinking blocks that plain strings
/// cannot carry.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub model_id: String,
    pub system: Vec<SystemBlock>,
    pub messages: Vec<serde_json::Value>,
    pub tools: Vec<ToolDefinition>,
    pub server_tools: Vec<ServerTool>,
    pub max_tokens: u32,
    /// Extended-thinking budget; `None` disables the thinking block.
    pub thinking_budget: Option<u32>,
    /// Only set for models whose spec advertises effort support.
    pub effort: Option<String>,
}

/// Non-streaming response (critique path).
#[derive(Debug, Clone)]
pub struct ChatResponse {
    pub content: String,
    pub tool_calls: Vec<ToolCall>,
    pub stop_reason: StopReason,
    pub usage: TokenUsage,
}

#[async_trait]
pub trait LlmProvider: Send + Sync {
    fn name(&self) -> &str;

    /// Stream one turn's events through the channel. Always terminates the
    /// stream with either `MessageStop` or `Error` before returning.
    async fn send_stream(&self, req: &ChatRequest, tx: mpsc::Sender<StreamEvent>) -> Result<()>;

    /// Non-streaming send — used by the subordinate critique session.
    async fn send(&self, req: &ChatRequest) -> Result<ChatResponse>;

    /// Synchronous token estimate for context budgeting.
    fn count_tokens(&self, text: &str) -> u32 {
        tokens::estimate_text(text)
    }
}
