//! Tool: self_critique — adversarial review by a subordinate session.

use std::sync::Arc;

use async_trait::async_trait;

use herald_core::types::Thread;

use crate::critique;
use crate::runtime::AgentContext;

use super::{required_str, Tool, ToolOutcome};

pub struct SelfCritiqueTool {
    ctx: Arc<AgentContext>,
    thread: Thread,
}

impl SelfCritiqueTool {
    pub fn new(ctx: Arc<AgentContext>, thread: Thread) -> Self {
        Self { ctx, thread }
    }
}

#[async_trait]
impl Tool for SelfCritiqueTool {
    fn name(&self) -> &str {
        "self_critique"
    }

    fn description(&self) -> &str {
        "Have an independent adversarial reviewer verify work before \
         presenting it: code, analysis, generated files, claims. Returns a \
         verdict with issues and recommendations. Costs real money — use \
         for substantial deliverables, not trivia."
    }

    fn input_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "task": {
                    "type": "string",
                    "description": "What was asked, what was produced, and what to verify. \
                                    Include temp ids / file ids the reviewer should open."
                }
            },
            "required": ["task"]
        })
    }

    fn is_paid(&self) -> bool {
        true
    }

    async fn execute(&self, input: serde_json::Value) -> ToolOutcome {
        let task = match required_str(&input, "task") {
            Ok(v) => v,
            Err(outcome) => return outcome,
        };

        // The critique session runs a premium model; require headroom
        // beyond the ordinary positive-balance gate.
        let min = self.ctx.config.critique.min_balance;
        match self.ctx.gate.balance(self.thread.user_id).await {
            Ok(balance) if balance >= min => {}
            Ok(balance) => {
                return ToolOutcome::error(format!(
                    "self_critique requires a balance of at least ${min} (current: ${balance})"
                ));
            }
            Err(e) => return ToolOutcome::error(format!("balance check failed: {e}")),
        }

        match critique::run_critique(&self.ctx, &self.thread, task).await {
            Ok(report) => {
                let cost = report.cost_usd;
                match serde_json::to_string_pretty(&report) {
                    Ok(json) => ToolOutcome::success(json).with_cost(cost),
                    Err(e) => ToolOutcome::error(format!("verdict serialization failed: {e}")),
                }
            }
            Err(e) => ToolOutcome::error(format!("critique failed: {e}")),
        }
    }
}
