//! Subordinate self-critique session.
//!
//! Runs a non-streaming tool loop on a fixed premium model with an
//! adversarial system prompt and a reduced tool set. The verdict comes
//! back as JSON; parsing is lenient because models wrap JSON in prose.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use herald_core::types::{Thread, TokenUsage};
use herald_core::{HeraldError, Result};
use rust_decimal::Decimal;

use crate::pricing;
use crate::provider::{ChatRequest, SystemBlock};
use crate::runtime::AgentContext;
use crate::stream::StopReason;
use crate::tools::ToolSet;

const CRITIQUE_SYSTEM: &str = "You are an adversarial reviewer. Your job is to find what is \
wrong with the assistant's work before the user does. Inspect the work with the tools \
available to you (run code, open files, analyze images and documents). Hunt for factual \
errors, broken code, unmet requirements, and misleading claims. Do not be polite; be right. \
When done, respond with ONLY a JSON object: \
{\"verdict\":\"PASS|FAIL|NEEDS_IMPROVEMENT\",\"alignment_score\":0-100,\
\"issues\":[\"...\"],\"recommendations\":[\"...\"]}";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum Verdict {
    #[serde(rename = "PASS")]
    Pass,
    #[serde(rename = "FAIL")]
    Fail,
    #[serde(rename = "NEEDS_IMPROVEMENT")]
    NeedsImprovement,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CritiqueReport {
    pub verdict: Verdict,
    pub alignment_score: u8,
    #[serde(default)]
    pub issues: Vec<String>,
    #[serde(default)]
    pub recommendations: Vec<String>,
    #[serde(skip_deserializing)]
    pub cost_usd: Decimal,
}

/// Run the critique loop over `task` (what to verify) in the context of a
/// thread. Returns the parsed report and the LLM cost of the session.
pub async fn run_critique(
    ctx: &Arc<AgentContext>,
    thread: &Thread,
    task: &str,
) -> Result<CritiqueReport> {
    let (_, spec) = ctx.config.model(Some(&ctx.config.critique.model))?;
    let tools = ToolSet::build_critique(Arc::clone(ctx), thread);
    let tool_defs = tools.definitions();

    let mut messages: Vec<serde_json::Value> = vec![serde_json::json!({
        "role": "user",
        "content": format!("Critique the following work:\n\n{task}"),
    })];

    let mut total_usage = TokenUsage::default();
    let mut tool_cost = Decimal::ZERO;
    let max_iterations = ctx.config.critique.max_iterations;

    for iteration in 0..max_iterations {
        let request = ChatRequest {
            model_id: spec.id.clone(),
            system: vec![SystemBlock {
                text: CRITIQUE_SYSTEM.to_string(),
                cache: false,
            }],
            messages: messages.clone(),
            tools: tool_defs.clone(),
            server_tools: Vec::new(),
            max_tokens: spec.max_output.min(4096),
            thinking_budget: None,
            effort: None,
        };

        debug!(iteration, "critique loop iteration");
        let response = ctx.provider.send(&request).await?;
        total_usage.add(&response.usage);

        if response.stop_reason != StopReason::ToolUse || response.tool_calls.is_empty() {
            let mut report = parse_report(&response.content)?;
            report.cost_usd = pricing::turn_cost(&total_usage, spec) + tool_cost;
            info!(
                verdict = ?report.verdict,
                score = report.alignment_score,
                cost = %report.cost_usd,
                "critique complete"
            );
            return Ok(report);
        }

        // Assistant turn: text + tool_use blocks.
        let mut assistant_content: Vec<serde_json::Value> = Vec::new();
        if !response.content.is_empty() {
            assistant_content.push(serde_json::json!({
                "type": "text",
                "text": response.content,
            }));
        }
        for call in &response.tool_calls {
            assistant_content.push(serde_json::json!({
                "type": "tool_use",
                "id": call.id,
                "name": call.name,
                "input": call.input,
            }));
        }
        messages.push(serde_json::json!({
            "role": "assistant",
            "content": assistant_content,
        }));

        // Execute tools; deferred outputs are dropped — the critic only
        // inspects, it never delivers.
        let mut results: Vec<serde_json::Value> = Vec::new();
        for call in &response.tool_calls {
            let outcome = match tools.get(&call.name) {
                Some(tool) => tool.execute(call.input.clone()).await,
                None => crate::tools::ToolOutcome::error(format!("unknown tool: {}", call.name)),
            };
            tool_cost += outcome.cost_usd;
            results.push(serde_json::json!({
                "type": "tool_result",
                "tool_use_id": call.id,
                "content": outcome.content,
                "is_error": outcome.is_error,
            }));
        }
        messages.push(serde_json::json!({ "role": "user", "content": results }));
    }

    warn!(max_iterations, "critique loop hit iteration bound");
    Err(HeraldError::Tool {
        tool: "self_critique".into(),
        reason: format!("no verdict after {max_iterations} iterations"),
    })
}

/// Extract the verdict object from the final text, tolerating surrounding
/// prose and code fences.
fn parse_report(text: &str) -> Result<CritiqueReport> {
    if let Ok(report) = serde_json::from_str::<CritiqueReport>(text.trim()) {
        return Ok(report);
    }
    // Find the outermost brace pair and try again.
    if let (Some(start), Some(end)) = (text.find('{'), text.rfind('}')) {
        if start < end {
            if let Ok(report) = serde_json::from_str::<CritiqueReport>(&text[start..=end]) {
                return Ok(report);
            }
        }
    }
    Err(HeraldError::Tool {
        tool: "self_critique".into(),
        reason: format!("unparseable verdict: {}", text.chars().take(200).collect::<String>()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_bare_json() {
        let report = parse_report(
            r#"{"verdict":"PASS","alignment_score":92,"issues":[],"recommendations":[]}"#,
        )
        .unwrap();
        assert_eq!(report.verdict, Verdict::Pass);
        assert_eq!(report.alignment_score, 92);
    }

    #[test]
    fn parses_json_wrapped_in_prose() {
        let text = "Here is my assessment:\n```json\n{\"verdict\":\"NEEDS_IMPROVEMENT\",\
                    \"alignment_score\":55,\"issues\":[\"off by one\"],\
                    \"recommendations\":[\"fix loop bound\"]}\n```\nDone.";
        let report = parse_report(text).unwrap();
        assert_eq!(report.verdict, Verdict::NeedsImprovement);
        assert_eq!(report.issues, vec!["off by one"]);
    }

    #[test]
    fn garbage_is_an_error() {
        assert!(parse_report("I think it's fine").is_err());
    }
}
