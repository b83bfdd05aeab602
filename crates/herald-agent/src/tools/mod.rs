//! Tool system for the agent loop.
//!
//! Nine client-side executors implement the `Tool` trait below;
//! `web_search` and `web_fetch` are provider-executed and appear only as
//! server tool entries on the request (the stream carries their results).
//! Executors are parallel-safe: shared state is limited to the cache and
//! durable store, which are concurrency-safe on their own.

pub mod analyze_file;
pub mod deliver_file;
pub mod execute_python;
pub mod generate_image;
pub mod preview_file;
pub mod render_latex;
pub mod self_critique;
pub mod transcribe_audio;

use std::sync::Arc;

use async_trait::async_trait;
use rust_decimal::Decimal;

use herald_core::types::Thread;

use crate::provider::ToolDefinition;
use crate::runtime::AgentContext;

/// A file a tool produced.
#[derive(Debug, Clone)]
pub struct OutFile {
    pub filename: String,
    pub mime: String,
    pub bytes: Vec<u8>,
    /// What this file is / why it was made — shown in the file manifest.
    pub context: Option<String>,
}

/// Structured result of one tool execution.
#[derive(Debug, Default)]
pub struct ToolOutcome {
    /// LLM-visible payload.
    pub content: String,
    pub is_error: bool,
    /// Immediate delivery: sent to the frontend and recorded as UserFiles.
    pub file_contents: Vec<OutFile>,
    /// Deferred delivery: parked as ExecArtifacts for `deliver_file`.
    pub output_files: Vec<OutFile>,
    /// Billable cost of this execution; zero for free tools.
    pub cost_usd: Decimal,
    /// Stop requesting more tool calls after this batch's results.
    pub force_turn_break: bool,
}

impl ToolOutcome {
    pub fn success(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            ..Default::default()
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            content: message.into(),
            is_error: true,
            ..Default::default()
        }
    }

    pub fn with_cost(mut self, cost: Decimal) -> Self {
        self.cost_usd = cost;
        self
    }
}

/// Trait every client-side tool implements.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    /// JSON Schema for the tool's input parameters.
    fn input_schema(&self) -> serde_json::Value;
    /// Paid tools are balance-checked before dispatch and charged after.
    fn is_paid(&self) -> bool {
        false
    }
    /// Known-ahead cost for fixed-price tools (image generation, LaTeX).
    /// Used by the dispatch gate so parallel calls in one batch cannot
    /// collectively overdraw; variable-cost tools return zero and are
    /// billed from their reported `cost_usd`.
    fn estimated_cost(&self) -> Decimal {
        Decimal::ZERO
    }
    async fn execute(&self, input: serde_json::Value) -> ToolOutcome;
}

/// Per-turn tool set: executors bound to one thread.
pub struct ToolSet {
    tools: Vec<Arc<dyn Tool>>,
}

impl ToolSet {
    /// Assemble a set from explicit executors (tests, custom subsets).
    pub fn from_tools(tools: Vec<Arc<dyn Tool>>) -> Self {
        Self { tools }
    }

    /// The full registry for a user turn.
    pub fn build(ctx: Arc<AgentContext>, thread: &Thread) -> Self {
        let tools: Vec<Arc<dyn Tool>> = vec![
            Arc::new(analyze_file::AnalyzeImageTool::new(ctx.clone(), thread.clone())),
            Arc::new(analyze_file::AnalyzePdfTool::new(ctx.clone(), thread.clone())),
            Arc::new(transcribe_audio::TranscribeAudioTool::new(
                ctx.clone(),
                thread.clone(),
            )),
            Arc::new(generate_image::GenerateImageTool::new(ctx.clone())),
            Arc::new(render_latex::RenderLatexTool::new(ctx.clone(), thread.clone())),
            Arc::new(execute_python::ExecutePythonTool::new(
                ctx.clone(),
                thread.clone(),
            )),
            Arc::new(preview_file::PreviewFileTool::new(ctx.clone(), thread.clone())),
            Arc::new(deliver_file::DeliverFileTool::new(ctx.clone(), thread.clone())),
            Arc::new(self_critique::SelfCritiqueTool::new(ctx, thread.clone())),
        ];
        Self { tools }
    }

    /// Reduced set for the subordinate critique session.
    pub fn build_critique(ctx: Arc<AgentContext>, thread: &Thread) -> Self {
        let tools: Vec<Arc<dyn Tool>> = vec![
            Arc::new(analyze_file::AnalyzeImageTool::new(ctx.clone(), thread.clone())),
            Arc::new(analyze_file::AnalyzePdfTool::new(ctx.clone(), thread.clone())),
            Arc::new(execute_python::ExecutePythonTool::new(
                ctx.clone(),
                thread.clone(),
            )),
            Arc::new(preview_file::PreviewFileTool::new(ctx, thread.clone())),
        ];
        Self { tools }
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.iter().find(|t| t.name() == name).cloned()
    }

    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.tools
            .iter()
            .map(|t| ToolDefinition {
                name: t.name().to_string(),
                description: t.description().to_string(),
                input_schema: t.input_schema(),
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

/// Read a required string parameter, or produce the standard error outcome.
pub(crate) fn required_str<'a>(
    input: &'a serde_json::Value,
    key: &str,
) -> std::result::Result<&'a str, ToolOutcome> {
    input
        .get(key)
        .and_then(|v| v.as_str())
        .ok_or_else(|| ToolOutcome::error(format!("missing required parameter: {key}")))
}
