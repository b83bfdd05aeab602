//! Tool: render_latex — renders LaTeX to PNG as a deferred-delivery
//! artifact. The model calls `deliver_file` when it wants the user to see
//! the result, which lets it write prose between deliveries.

use std::sync::Arc;

use async_trait::async_trait;

use herald_core::types::Thread;

use crate::runtime::AgentContext;

use super::{required_str, OutFile, Tool, ToolOutcome};

const DEFAULT_DPI: u32 = 300;

pub struct RenderLatexTool {
    ctx: Arc<AgentContext>,
    thread: Thread,
}

impl RenderLatexTool {
    pub fn new(ctx: Arc<AgentContext>, thread: Thread) -> Self {
        Self { ctx, thread }
    }
}

#[async_trait]
impl Tool for RenderLatexTool {
    fn name(&self) -> &str {
        "render_latex"
    }

    fn description(&self) -> &str {
        "Render LaTeX source to a PNG image. The result is stored as a \
         pending file; call deliver_file with its temp id to send it."
    }

    fn input_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "source": {
                    "type": "string",
                    "description": "LaTeX source (a formula or full document body)."
                },
                "filename": {
                    "type": "string",
                    "description": "Output filename (optional, defaults to formula.png)."
                }
            },
            "required": ["source"]
        })
    }

    fn is_paid(&self) -> bool {
        true
    }

    fn estimated_cost(&self) -> rust_decimal::Decimal {
        self.ctx.config.pricing.latex_render
    }

    async fn execute(&self, input: serde_json::Value) -> ToolOutcome {
        let source = match required_str(&input, "source") {
            Ok(v) => v,
            Err(outcome) => return outcome,
        };
        let filename = input
            .get("filename")
            .and_then(|v| v.as_str())
            .unwrap_or("formula.png");

        match self.ctx.latex.render(source, DEFAULT_DPI).await {
            Ok(bytes) => {
                let summary = summarize_source(source);
                let mut outcome = ToolOutcome::success(format!(
                    "LaTeX rendered to {filename} ({} bytes); pending delivery in thread {}.",
                    bytes.len(),
                    self.thread.id
                ))
                .with_cost(self.ctx.config.pricing.latex_render);
                outcome.output_files.push(OutFile {
                    filename: filename.to_string(),
                    mime: "image/png".to_string(),
                    bytes,
                    context: Some(format!("rendered from: {summary}")),
                });
                outcome
            }
            Err(e) => ToolOutcome::error(format!("LaTeX rendering failed: {e}")),
        }
    }
}

fn summarize_source(source: &str) -> String {
    let flat = source.replace('\n', " ");
    if flat.chars().count() > 80 {
        let head: String = flat.chars().take(80).collect();
        format!("{head}…")
    } else {
        flat
    }
}
