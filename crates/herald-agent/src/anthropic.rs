//! Anthropic Messages API client: streaming and non-streaming.

use async_trait::async_trait;
use rand::Rng;
use serde::Deserialize;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use herald_core::config::AnthropicConfig;
use herald_core::types::TokenUsage;
use herald_core::{HeraldError, Result};

use crate::provider::{ChatRequest, ChatResponse, LlmProvider, ServerTool, ToolCall};
use crate::stream::{StopReason, StreamEvent};

const API_VERSION: &str = "2023-06-01";
const WEB_SEARCH_TOOL_TYPE: &str = "web_search_20250305";
const WEB_FETCH_TOOL_TYPE: &str = "web_fetch_20250910";
const WEB_FETCH_BETA: &str = "web-fetch-2025-09-10";

pub struct AnthropicClient {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    stream_timeout: Duration,
}

impl AnthropicClient {
    pub fn new(cfg: &AnthropicConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key: cfg.api_key.clone(),
            base_url: cfg.base_url.clone(),
            stream_timeout: Duration::from_secs(cfg.stream_timeout_secs),
        }
    }

    fn request(&self, body: &serde_json::Value, needs_fetch_beta: bool) -> reqwest::RequestBuilder {
        let mut builder = self
            .client
            .post(format!("{}/v1/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .header("content-type", "application/json");
        if needs_fetch_beta {
            builder = builder.header("anthropic-beta", WEB_FETCH_BETA);
        }
        builder.json(body)
    }

    /// Issue the HTTP request, retrying once with jitter on transient
    /// failures (rate limit, connect error). Retries happen only before
    /// any stream bytes flow, so events are never duplicated.
    async fn send_with_retry(
        &self,
        body: &serde_json::Value,
        needs_fetch_beta: bool,
    ) -> Result<reqwest::Response> {
        let mut last_err: Option<HeraldError> = None;
        for attempt in 0..2u32 {
            if attempt > 0 {
                let backoff = match &last_err {
                    Some(HeraldError::RateLimited { retry_after_ms }) => *retry_after_ms,
                    _ => 500 + rand::thread_rng().gen_range(0..500),
                };
                debug!(attempt, backoff_ms = backoff, "retrying provider request");
                tokio::time::sleep(Duration::from_millis(backoff)).await;
            }

            let resp = match self.request(body, needs_fetch_beta).send().await {
                Ok(r) => r,
                Err(e) => {
                    let err = if e.is_timeout() {
                        HeraldError::ProviderTimeout {
                            ms: self.stream_timeout.as_millis() as u64,
                        }
                    } else {
                        HeraldError::ProviderConnection(e.to_string())
                    };
                    last_err = Some(err);
                    continue;
                }
            };

            let status = resp.status().as_u16();
            if status == 429 {
                let retry_after_ms = resp
                    .headers()
                    .get("retry-after")
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.parse::<u64>().ok())
                    .map(|secs| secs * 1000)
                    .unwrap_or(5000);
                last_err = Some(HeraldError::RateLimited { retry_after_ms });
                continue;
            }

            if !resp.status().is_success() {
                let text = resp.text().await.unwrap_or_default();
                warn!(status, body = %text, "Anthropic API error");
                // Over-long prompts come back as a 400 naming the token count.
                if status == 400 && text.contains("prompt is too long") {
                    return Err(HeraldError::ContextWindowExceeded);
                }
                return Err(HeraldError::ProviderApi {
                    status,
                    message: text,
                });
            }

            return Ok(resp);
        }
        Err(last_err.unwrap_or_else(|| HeraldError::Internal("retry loop exhausted".into())))
    }
}

#[async_trait]
impl LlmProvider for AnthropicClient {
    fn name(&self) -> &str {
        "anthropic"
    }

    async fn send_stream(&self, req: &ChatRequest, tx: mpsc::Sender<StreamEvent>) -> Result<()> {
        let mut body = build_request_body(req);
        body["stream"] = serde_json::json!(true);

        debug!(model = %req.model_id, "opening streaming request");
        let resp = self
            .send_with_retry(&body, wants_fetch_beta(req))
            .await
            .inspect_err(|e| {
                debug!(error = %e, "streaming request failed before first event");
            })?;

        // The whole stream runs under one outer timeout.
        match tokio::time::timeout(
            self.stream_timeout,
            crate::anthropic_stream::process_stream(resp, tx.clone()),
        )
        .await
        {
            Ok(()) => Ok(()),
            Err(_) => {
                let ms = self.stream_timeout.as_millis() as u64;
                let _ = tx
                    .send(StreamEvent::Error {
                        message: format!("stream timed out after {ms}ms"),
                    })
                    .await;
                Err(HeraldError::ProviderTimeout { ms })
            }
        }
    }

    async fn send(&self, req: &ChatRequest) -> Result<ChatResponse> {
        let body = build_request_body(req);
        debug!(model = %req.model_id, "sending non-streaming request");
        let resp = self.send_with_retry(&body, wants_fetch_beta(req)).await?;
        let api_resp: ApiResponse = resp
            .json()
            .await
            .map_err(|e| HeraldError::ProviderConnection(e.to_string()))?;
        Ok(parse_response(api_resp))
    }
}

fn wants_fetch_beta(req: &ChatRequest) -> bool {
    req.server_tools
        .iter()
        .any(|t| matches!(t, ServerTool::WebFetch { .. }))
}

pub(crate) fn build_request_body(req: &ChatRequest) -> serde_json::Value {
    let system: Vec<serde_json::Value> = req
        .system
        .iter()
        .map(|block| {
            if block.cache {
                serde_json::json!({
                    "type": "text",
                    "text": block.text,
                    "cache_control": { "type": "ephemeral" }
                })
            } else {
                serde_json::json!({ "type": "text", "text": block.text })
            }
        })
        .collect();

    let mut body = serde_json::json!({
        "model": req.model_id,
        "max_tokens": req.max_tokens,
        "system": system,
        "messages": req.messages,
        "stream": false,
    });

    let mut tools: Vec<serde_json::Value> = req
        .tools
        .iter()
        .map(|t| {
            serde_json::json!({
                "name": t.name,
                "description": t.description,
                "input_schema": t.input_schema,
            })
        })
        .collect();
    for server_tool in &req.server_tools {
        tools.push(match server_tool {
            ServerTool::WebSearch { max_uses } => serde_json::json!({
                "type": WEB_SEARCH_TOOL_TYPE,
                "name": "web_search",
                "max_uses": max_uses,
            }),
            ServerTool::WebFetch { max_uses } => serde_json::json!({
                "type": WEB_FETCH_TOOL_TYPE,
                "name": "web_fetch",
                "max_uses": max_uses,
            }),
        });
    }
    if !tools.is_empty() {
        body["tools"] = serde_json::Value::Array(tools);
        body["tool_choice"] = serde_json::json!({ "type": "auto" });
    }

    if let Some(budget) = req.thinking_budget {
        if budget > 0 {
            body["thinking"] = serde_json::json!({
                "type": "enabled",
                "budget_tokens": budget,
            });
        }
    }
    if let Some(effort) = &req.effort {
        body["effort"] = serde_json::json!(effort);
    }

    body
}

fn parse_response(resp: ApiResponse) -> ChatResponse {
    let mut text_parts: Vec<String> = Vec::new();
    let mut tool_calls: Vec<ToolCall> = Vec::new();

    for block in resp.content {
        match block {
            ContentBlock::Text { text } => text_parts.push(text),
            ContentBlock::ToolUse { id, name, input } => {
                tool_calls.push(ToolCall { id, name, input });
            }
            _ => {}
        }
    }

    ChatResponse {
        content: text_parts.join(""),
        tool_calls,
        stop_reason: StopReason::parse(resp.stop_reason.as_deref().unwrap_or("end_turn")),
        usage: TokenUsage {
            input: resp.usage.input_tokens,
            output: resp.usage.output_tokens,
            cache_read: resp.usage.cache_read_input_tokens.unwrap_or(0),
            cache_write: resp.usage.cache_creation_input_tokens.unwrap_or(0),
            thinking: 0,
        },
    }
}

// Response types (deserialization only).

#[derive(Deserialize)]
struct ApiResponse {
    content: Vec<ContentBlock>,
    stop_reason: Option<String>,
    usage: Usage,
}

#[derive(Deserialize)]
#[serde(tag = "type")]
enum ContentBlock {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "thinking")]
    #[allow(dead_code)]
    Thinking { thinking: String },
    #[serde(rename = "tool_use")]
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },
    #[serde(other)]
    Unknown,
}

#[derive(Deserialize)]
struct Usage {
    input_tokens: u32,
    output_tokens: u32,
    cache_read_input_tokens: Option<u32>,
    cache_creation_input_tokens: Option<u32>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::SystemBlock;

    fn base_request() -> ChatRequest {
        ChatRequest {
            model_id: "claude-sonnet-4-5".into(),
            system: vec![
                SystemBlock {
                    text: "static".into(),
                    cache: true,
                },
                SystemBlock {
                    text: "manifest".into(),
                    cache: false,
                },
            ],
            messages: vec![serde_json::json!({ "role": "user", "content": "hi" })],
            tools: vec![],
            server_tools: vec![],
            max_tokens: 1024,
            thinking_budget: None,
            effort: None,
        }
    }

    #[test]
    fn cache_control_only_on_flagged_blocks() {
        let body = build_request_body(&base_request());
        let system = body["system"].as_array().unwrap();
        assert!(system[0].get("cache_control").is_some());
        assert!(system[1].get("cache_control").is_none());
    }

    #[test]
    fn server_tools_use_provider_native_types() {
        let mut req = base_request();
        req.server_tools = vec![
            ServerTool::WebSearch { max_uses: 5 },
            ServerTool::WebFetch { max_uses: 5 },
        ];
        let body = build_request_body(&req);
        let tools = body["tools"].as_array().unwrap();
        assert_eq!(tools[0]["type"], WEB_SEARCH_TOOL_TYPE);
        assert_eq!(tools[1]["type"], WEB_FETCH_TOOL_TYPE);
        assert_eq!(body["tool_choice"]["type"], "auto");
    }

    #[test]
    fn thinking_block_emitted_only_with_budget() {
        let mut req = base_request();
        assert!(build_request_body(&req).get("thinking").is_none());
        req.thinking_budget = Some(8192);
        let body = build_request_body(&req);
        assert_eq!(body["thinking"]["budget_tokens"], 8192);
    }

    #[test]
    fn no_tools_means_no_tool_choice() {
        let body = build_request_body(&base_request());
        assert!(body.get("tool_choice").is_none());
    }
}
