//! SSE processing for the Anthropic streaming endpoint.
//!
//! Reads the byte stream, reassembles SSE lines, and emits `StreamEvent`s.
//! Thinking blocks are accumulated (text + signature) so the terminal
//! `ThinkingDone` carries everything a later request must echo verbatim.

use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use herald_core::types::TokenUsage;

use crate::stream::{parse_sse_line, SseParsed, StopReason, StreamEvent};

#[derive(Default)]
struct StreamState {
    current_event: String,
    /// Block type from `content_block_start`, so deltas know what to emit.
    block_type: String,
    thinking_text: String,
    thinking_signature: String,
    tool_use_id: String,
    tool_use_name: String,
    tool_use_input_json: String,
    usage: TokenUsage,
    stop_reason: Option<StopReason>,
}

/// Parse the SSE response and forward events until the server closes the
/// stream or the receiver goes away. Always ends the stream with a
/// `MessageStop` (or nothing if the receiver dropped).
pub async fn process_stream(resp: reqwest::Response, tx: mpsc::Sender<StreamEvent>) {
    use futures_util::StreamExt;

    let mut state = StreamState::default();
    let mut line_buf = String::new();
    let mut byte_stream = resp.bytes_stream();

    while let Some(chunk) = byte_stream.next().await {
        let chunk = match chunk {
            Ok(c) => c,
            Err(e) => {
                let _ = tx
                    .send(StreamEvent::Error {
                        message: e.to_string(),
                    })
                    .await;
                return;
            }
        };

        let text = match std::str::from_utf8(&chunk) {
            Ok(t) => t,
            Err(_) => continue,
        };

        line_buf.push_str(text);
        let lines: Vec<&str> = line_buf.split('\n').collect();
        let (complete, remainder) = lines.split_at(lines.len() - 1);
        let remainder = remainder.first().unwrap_or(&"").to_string();

        for line in complete {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            if let Some(parsed) = parse_sse_line(line) {
                match parsed {
                    SseParsed::Event(ev) => state.current_event = ev,
                    SseParsed::Data(data) => {
                        for event in handle_data(&mut state, &data) {
                            if tx.send(event).await.is_err() {
                                return; // receiver dropped
                            }
                        }
                    }
                }
            }
        }

        line_buf = remainder;
    }

    let _ = tx
        .send(StreamEvent::MessageStop {
            stop_reason: state.stop_reason.unwrap_or(StopReason::EndTurn),
            usage: state.usage,
        })
        .await;
}

/// Handle one SSE data payload; may yield zero, one, or two events
/// (a thinking block close yields `ThinkingDone`).
fn handle_data(state: &mut StreamState, data: &str) -> Vec<StreamEvent> {
    match state.current_event.as_str() {
        "message_start" => {
            if let Ok(msg) = serde_json::from_str::<MessageStart>(data) {
                state.usage.input = msg.message.usage.input_tokens;
                state.usage.cache_read = msg.message.usage.cache_read_input_tokens.unwrap_or(0);
                state.usage.cache_write =
                    msg.message.usage.cache_creation_input_tokens.unwrap_or(0);
                return vec![StreamEvent::MessageStart { usage: state.usage }];
            }
            Vec::new()
        }

        "content_block_start" => {
            if let Ok(start) = serde_json::from_str::<ContentBlockStart>(data) {
                state.block_type = start.content_block.block_type.clone();
                match start.content_block.block_type.as_str() {
                    "tool_use" => {
                        state.tool_use_id = start.content_block.id.unwrap_or_default();
                        state.tool_use_name = start.content_block.name.unwrap_or_default();
                        state.tool_use_input_json.clear();
                    }
                    "thinking" => {
                        state.thinking_text.clear();
                        state.thinking_signature.clear();
                    }
                    "web_search_tool_result" | "web_fetch_tool_result" => {
                        // Provider-executed tool result; surface for display.
                        let summary = start
                            .content_block
                            .content
                            .map(summarize_server_result)
                            .unwrap_or_default();
                        return vec![StreamEvent::ServerToolResult { text: summary }];
                    }
                    _ => {}
                }
            }
            Vec::new()
        }

        "content_block_delta" => {
            let Ok(delta) = serde_json::from_str::<ContentBlockDelta>(data) else {
                return Vec::new();
            };
            match delta.delta.delta_type.as_str() {
                "text_delta" => delta
                    .delta
                    .text
                    .map(|text| vec![StreamEvent::TextDelta { text }])
                    .unwrap_or_default(),
                "thinking_delta" => {
                    if let Some(text) = delta.delta.thinking {
                        state.thinking_text.push_str(&text);
                        return vec![StreamEvent::ThinkingDelta { text }];
                    }
                    Vec::new()
                }
                "signature_delta" => {
                    if let Some(sig) = delta.delta.signature {
                        state.thinking_signature.push_str(&sig);
                        return vec![StreamEvent::SignatureDelta { signature: sig }];
                    }
                    Vec::new()
                }
                "input_json_delta" => {
                    if let Some(partial) = delta.delta.partial_json {
                        state.tool_use_input_json.push_str(&partial);
                    }
                    Vec::new()
                }
                other => {
                    debug!(delta_type = other, "unhandled delta type");
                    Vec::new()
                }
            }
        }

        "content_block_stop" => {
            let block_type = std::mem::take(&mut state.block_type);
            match block_type.as_str() {
                "tool_use" => {
                    let input = serde_json::from_str::<serde_json::Value>(
                        &state.tool_use_input_json,
                    )
                    .unwrap_or(serde_json::Value::Object(Default::default()));
                    state.tool_use_input_json.clear();
                    vec![StreamEvent::ToolUse {
                        id: std::mem::take(&mut state.tool_use_id),
                        name: std::mem::take(&mut state.tool_use_name),
                        input,
                    }]
                }
                "thinking" => vec![StreamEvent::ThinkingDone {
                    thinking: std::mem::take(&mut state.thinking_text),
                    signature: std::mem::take(&mut state.thinking_signature),
                }],
                _ => Vec::new(),
            }
        }

        "message_delta" => {
            if let Ok(delta) = serde_json::from_str::<MessageDelta>(data) {
                state.usage.output = delta.usage.output_tokens;
                state.usage.thinking = delta.usage.thinking_tokens.unwrap_or(0);
                if let Some(reason) = delta.delta.stop_reason {
                    state.stop_reason = Some(StopReason::parse(&reason));
                }
            }
            Vec::new()
        }

        "error" => {
            warn!(data, "anthropic stream error event");
            vec![StreamEvent::Error {
                message: data.to_string(),
            }]
        }

        // ping and unknown events need no action
        _ => Vec::new(),
    }
}

/// Flatten a server tool result block into a short display string.
fn summarize_server_result(content: serde_json::Value) -> String {
    match &content {
        serde_json::Value::Array(items) => {
            let titles: Vec<String> = items
                .iter()
                .filter_map(|item| {
                    item.get("title")
                        .or_else(|| item.get("url"))
                        .and_then(|v| v.as_str())
                        .map(str::to_string)
                })
                .collect();
            titles.join(", ")
        }
        serde_json::Value::Object(map) => map
            .get("url")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string(),
        _ => String::new(),
    }
}

// SSE data types (deserialization only).

#[derive(Deserialize)]
struct MessageStart {
    message: MessageStartInner,
}

#[derive(Deserialize)]
struct MessageStartInner {
    usage: InputUsage,
}

#[derive(Deserialize)]
struct InputUsage {
    input_tokens: u32,
    cache_read_input_tokens: Option<u32>,
    cache_creation_input_tokens: Option<u32>,
}

#[derive(Deserialize)]
struct ContentBlockStart {
    content_block: ContentBlockMeta,
}

#[derive(Deserialize)]
struct ContentBlockMeta {
    #[serde(rename = "type")]
    block_type: String,
    id: Option<String>,
    name: Option<String>,
    /// Populated for server tool result blocks.
    content: Option<serde_json::Value>,
}

#[derive(Deserialize)]
struct ContentBlockDelta {
    delta: DeltaContent,
}

#[derive(Deserialize)]
struct DeltaContent {
    #[serde(rename = "type")]
    delta_type: String,
    text: Option<String>,
    thinking: Option<String>,
    signature: Option<String>,
    partial_json: Option<String>,
}

#[derive(Deserialize)]
struct MessageDelta {
    delta: MessageDeltaInner,
    usage: OutputUsage,
}

#[derive(Deserialize)]
struct MessageDeltaInner {
    stop_reason: Option<String>,
}

#[derive(Deserialize)]
struct OutputUsage {
    output_tokens: u32,
    thinking_tokens: Option<u32>,
}
