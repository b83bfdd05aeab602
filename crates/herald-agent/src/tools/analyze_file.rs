//! Tools: analyze_image / analyze_pdf — vision and document analysis via a
//! subordinate non-streaming LLM call against a file already in the thread.
//!
//! These tools never fetch arbitrary URLs; the model is expected to use
//! `web_fetch` for that. The file must be one of the thread's UserFiles.

use std::sync::Arc;

use async_trait::async_trait;

use herald_core::types::{FileKind, Thread, UserFile};

use crate::pricing;
use crate::provider::ChatRequest;
use crate::runtime::AgentContext;

use super::{required_str, Tool, ToolOutcome};

pub struct AnalyzeImageTool {
    ctx: Arc<AgentContext>,
    thread: Thread,
}

pub struct AnalyzePdfTool {
    ctx: Arc<AgentContext>,
    thread: Thread,
}

impl AnalyzeImageTool {
    pub fn new(ctx: Arc<AgentContext>, thread: Thread) -> Self {
        Self { ctx, thread }
    }
}

impl AnalyzePdfTool {
    pub fn new(ctx: Arc<AgentContext>, thread: Thread) -> Self {
        Self { ctx, thread }
    }
}

/// Find a thread file by provider file id, cache-first.
async fn thread_file(
    ctx: &AgentContext,
    thread_id: &str,
    provider_file_id: &str,
) -> Option<UserFile> {
    let files = match ctx.cache.get_files(thread_id).await {
        Some(list) => list,
        None => {
            let list = ctx.store.list_thread_files(thread_id).ok()?;
            ctx.cache.put_files(thread_id, &list).await;
            list
        }
    };
    files
        .into_iter()
        .find(|f| f.provider_file_id == provider_file_id)
}

async fn analyze(
    ctx: &AgentContext,
    thread: &Thread,
    input: &serde_json::Value,
    tool_name: &str,
    block_type: &str,
    accepted: &[FileKind],
) -> ToolOutcome {
    let file_id = match required_str(input, "file_id") {
        Ok(v) => v,
        Err(outcome) => return outcome,
    };
    let question = input
        .get("question")
        .and_then(|v| v.as_str())
        .unwrap_or("Describe this file in detail.");

    let Some(file) = thread_file(ctx, &thread.id, file_id).await else {
        return ToolOutcome::error(format!(
            "file {file_id} is not part of this conversation; only files from the manifest can be analyzed"
        ));
    };
    if !accepted.contains(&file.kind) {
        return ToolOutcome::error(format!(
            "{} is a {} file; {tool_name} cannot analyze it",
            file.filename,
            file.kind.as_str()
        ));
    }

    let (_, spec) = match ctx.config.model(thread.model_key.as_deref()) {
        Ok(m) => m,
        Err(e) => return ToolOutcome::error(e.to_string()),
    };

    let request = ChatRequest {
        model_id: spec.id.clone(),
        system: Vec::new(),
        messages: vec![serde_json::json!({
            "role": "user",
            "content": [
                {
                    "type": block_type,
                    "source": { "type": "file", "file_id": file.provider_file_id }
                },
                { "type": "text", "text": question }
            ]
        })],
        tools: Vec::new(),
        server_tools: Vec::new(),
        max_tokens: 2048,
        thinking_budget: None,
        effort: None,
    };

    match ctx.provider.send(&request).await {
        Ok(resp) => {
            let cost = pricing::turn_cost(&resp.usage, spec);
            ToolOutcome::success(resp.content).with_cost(cost)
        }
        Err(e) => ToolOutcome::error(format!("analysis failed: {e}")),
    }
}

#[async_trait]
impl Tool for AnalyzeImageTool {
    fn name(&self) -> &str {
        "analyze_image"
    }

    fn description(&self) -> &str {
        "Analyze an image that is already part of this conversation. \
         Pass the file id from the file manifest and an optional question."
    }

    fn input_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "file_id": {
                    "type": "string",
                    "description": "Provider file id from the manifest."
                },
                "question": {
                    "type": "string",
                    "description": "What to look for (optional)."
                }
            },
            "required": ["file_id"]
        })
    }

    fn is_paid(&self) -> bool {
        true
    }

    async fn execute(&self, input: serde_json::Value) -> ToolOutcome {
        analyze(
            &self.ctx,
            &self.thread,
            &input,
            "analyze_image",
            "image",
            &[FileKind::Image, FileKind::Generated],
        )
        .await
    }
}

#[async_trait]
impl Tool for AnalyzePdfTool {
    fn name(&self) -> &str {
        "analyze_pdf"
    }

    fn description(&self) -> &str {
        "Analyze a PDF or document already part of this conversation. \
         Pass the file id from the file manifest and an optional question."
    }

    fn input_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "file_id": {
                    "type": "string",
                    "description": "Provider file id from the manifest."
                },
                "question": {
                    "type": "string",
                    "description": "What to extract or answer (optional)."
                }
            },
            "required": ["file_id"]
        })
    }

    fn is_paid(&self) -> bool {
        true
    }

    async fn execute(&self, input: serde_json::Value) -> ToolOutcome {
        analyze(
            &self.ctx,
            &self.thread,
            &input,
            "analyze_pdf",
            "document",
            &[FileKind::Pdf, FileKind::Document],
        )
        .await
    }
}
