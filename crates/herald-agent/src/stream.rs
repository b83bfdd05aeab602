//! Events emitted during LLM streaming, and SSE line parsing.

use serde::{Deserialize, Serialize};

use herald_core::types::TokenUsage;

/// Why a turn stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    EndTurn,
    MaxTokens,
    ToolUse,
    ContextWindowExceeded,
    Refusal,
}

impl StopReason {
    pub fn parse(s: &str) -> Self {
        match s {
            "max_tokens" => StopReason::MaxTokens,
            "tool_use" => StopReason::ToolUse,
            "context_window_exceeded" => StopReason::ContextWindowExceeded,
            "refusal" => StopReason::Refusal,
            // "end_turn", "stop_sequence", and anything new end the turn.
            _ => StopReason::EndTurn,
        }
    }
}

/// Events emitted during an LLM streaming response.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    /// Turn opened. Carries the input-side token counts so a cancelled
    /// turn can still be billed for what the provider already consumed.
    MessageStart { usage: TokenUsage },

    /// Incremental visible text.
    TextDelta { text: String },

    /// Incremental reasoning text (separate channel, collapsible in the UI).
    ThinkingDelta { text: String },

    /// Cryptographic signature chunk for the current thinking block.
    SignatureDelta { signature: String },

    /// A thinking block closed. Carries the full accumulated text and
    /// signature — the signature must be echoed back verbatim when this
    /// block is replayed in a later request.
    ThinkingDone { thinking: String, signature: String },

    /// The model requests a tool call (input JSON fully accumulated).
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },

    /// Result of a provider-executed tool (web_search / web_fetch),
    /// surfaced for display only — the provider already fed it back.
    ServerToolResult { text: String },

    /// Terminal event: the turn is over.
    MessageStop {
        stop_reason: StopReason,
        usage: TokenUsage,
    },

    /// Stream-level failure.
    Error { message: String },
}

/// Parse a single SSE line: `event: <type>` or `data: <json>`.
pub fn parse_sse_line(line: &str) -> Option<SseParsed> {
    if let Some(event_type) = line.strip_prefix("event: ") {
        Some(SseParsed::Event(event_type.to_string()))
    } else {
        line.strip_prefix("data: ")
            .map(|data| SseParsed::Data(data.to_string()))
    }
}

#[derive(Debug)]
pub enum SseParsed {
    Event(String),
    Data(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stop_reason_parsing() {
        assert_eq!(StopReason::parse("end_turn"), StopReason::EndTurn);
        assert_eq!(StopReason::parse("tool_use"), StopReason::ToolUse);
        assert_eq!(StopReason::parse("max_tokens"), StopReason::MaxTokens);
        assert_eq!(StopReason::parse("refusal"), StopReason::Refusal);
        assert_eq!(
            StopReason::parse("context_window_exceeded"),
            StopReason::ContextWindowExceeded
        );
        assert_eq!(StopReason::parse("stop_sequence"), StopReason::EndTurn);
    }

    #[test]
    fn sse_line_parsing() {
        assert!(matches!(
            parse_sse_line("event: message_start"),
            Some(SseParsed::Event(e)) if e == "message_start"
        ));
        assert!(matches!(
            parse_sse_line("data: {\"x\":1}"),
            Some(SseParsed::Data(d)) if d == "{\"x\":1}"
        ));
        assert!(parse_sse_line(": keepalive").is_none());
    }
}
