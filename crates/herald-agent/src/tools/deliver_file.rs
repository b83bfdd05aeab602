//! Tool: deliver_file — promote a pending artifact to immediate delivery.
//!
//! Consumes the artifact: on success it is removed from the thread's
//! pending index so a second delivery of the same temp id fails. With
//! `sequential: true` the result carries a turn break so the model can
//! write prose before its next delivery.

use std::sync::Arc;

use async_trait::async_trait;

use herald_core::types::Thread;

use crate::runtime::AgentContext;

use super::{required_str, OutFile, Tool, ToolOutcome};

pub struct DeliverFileTool {
    ctx: Arc<AgentContext>,
    thread: Thread,
}

impl DeliverFileTool {
    pub fn new(ctx: Arc<AgentContext>, thread: Thread) -> Self {
        Self { ctx, thread }
    }
}

#[async_trait]
impl Tool for DeliverFileTool {
    fn name(&self) -> &str {
        "deliver_file"
    }

    fn description(&self) -> &str {
        "Send a pending file (from execute_python, render_latex, …) to the \
         user. Pass sequential=true to pause tool calling after this \
         delivery and write text first."
    }

    fn input_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "temp_id": {
                    "type": "string",
                    "description": "Temp id of the pending file."
                },
                "caption": {
                    "type": "string",
                    "description": "Caption to send with the file (optional)."
                },
                "sequential": {
                    "type": "boolean",
                    "description": "Stop requesting tools after this delivery."
                }
            },
            "required": ["temp_id"]
        })
    }

    async fn execute(&self, input: serde_json::Value) -> ToolOutcome {
        let temp_id = match required_str(&input, "temp_id") {
            Ok(v) => v,
            Err(outcome) => return outcome,
        };
        let sequential = input
            .get("sequential")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        let caption = input
            .get("caption")
            .and_then(|v| v.as_str())
            .map(str::to_string);

        let Some(artifact) = self.ctx.cache.take_artifact(temp_id).await else {
            return ToolOutcome::error(format!(
                "no pending file with temp id {temp_id} (already delivered or expired)"
            ));
        };
        if artifact.thread_id != self.thread.id {
            // Re-park it: it belongs to another conversation.
            self.ctx.cache.put_artifact(&artifact).await;
            return ToolOutcome::error(format!(
                "pending file {temp_id} belongs to another conversation"
            ));
        }

        let mut outcome = ToolOutcome::success(format!(
            "{} delivered to the user.",
            artifact.filename
        ));
        outcome.force_turn_break = sequential;
        outcome.file_contents.push(OutFile {
            filename: artifact.filename,
            mime: artifact.mime,
            bytes: artifact.bytes,
            context: caption.or(artifact.context),
        });
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::providers::Format;
    use chrono::Utc;
    use herald_cache::{CacheHandle, MemoryBackend};
    use herald_core::config::{CacheConfig, HeraldConfig};
    use herald_core::types::ExecArtifact;
    use herald_store::Store;

    use crate::provider::{ChatRequest, ChatResponse, LlmProvider};
    use crate::stream::StreamEvent;
    use async_trait::async_trait;
    use tokio::sync::mpsc;

    struct NullProvider;

    #[async_trait]
    impl LlmProvider for NullProvider {
        fn name(&self) -> &str {
            "null"
        }
        async fn send_stream(
            &self,
            _req: &ChatRequest,
            _tx: mpsc::Sender<StreamEvent>,
        ) -> herald_core::Result<()> {
            unimplemented!("not used in this test")
        }
        async fn send(&self, _req: &ChatRequest) -> herald_core::Result<ChatResponse> {
            unimplemented!("not used in this test")
        }
    }

    fn test_config() -> HeraldConfig {
        figment::Figment::new()
            .merge(figment::providers::Toml::string(
                "[telegram]\nbot_token = \"t\"\n[anthropic]\napi_key = \"k\"\n",
            ))
            .extract()
            .unwrap()
    }

    async fn setup() -> (Arc<AgentContext>, Thread) {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let thread = store
            .get_or_create_thread(&herald_core::types::ThreadKey::new(1, 2, None))
            .unwrap();
        let cache = Arc::new(CacheHandle::new(
            Arc::new(MemoryBackend::new()),
            &CacheConfig::default(),
        ));
        let ctx = Arc::new(AgentContext::new(
            test_config(),
            store,
            cache,
            Arc::new(NullProvider),
        ));
        (ctx, thread)
    }

    fn artifact(temp_id: &str, thread_id: &str) -> ExecArtifact {
        ExecArtifact {
            temp_id: temp_id.into(),
            thread_id: thread_id.into(),
            filename: "plot.png".into(),
            mime: "image/png".into(),
            context: Some("histogram of X".into()),
            bytes: vec![1, 2, 3],
            preview: None,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn delivery_consumes_artifact() {
        let (ctx, thread) = setup().await;
        ctx.cache.put_artifact(&artifact("t1", &thread.id)).await;
        let tool = DeliverFileTool::new(ctx.clone(), thread.clone());

        let outcome = tool
            .execute(serde_json::json!({ "temp_id": "t1" }))
            .await;
        assert!(!outcome.is_error);
        assert_eq!(outcome.file_contents.len(), 1);
        assert!(!outcome.force_turn_break);
        assert!(ctx.cache.list_artifacts(&thread.id).await.is_empty());

        // Second delivery of the same temp id fails.
        let second = tool.execute(serde_json::json!({ "temp_id": "t1" })).await;
        assert!(second.is_error);
    }

    #[tokio::test]
    async fn sequential_sets_turn_break() {
        let (ctx, thread) = setup().await;
        ctx.cache.put_artifact(&artifact("t2", &thread.id)).await;
        let tool = DeliverFileTool::new(ctx, thread);
        let outcome = tool
            .execute(serde_json::json!({ "temp_id": "t2", "sequential": true }))
            .await;
        assert!(outcome.force_turn_break);
    }

    #[tokio::test]
    async fn cross_thread_delivery_rejected_and_artifact_kept() {
        let (ctx, thread) = setup().await;
        ctx.cache.put_artifact(&artifact("t3", "other-thread")).await;
        let tool = DeliverFileTool::new(ctx.clone(), thread);
        let outcome = tool.execute(serde_json::json!({ "temp_id": "t3" })).await;
        assert!(outcome.is_error);
        assert!(ctx.cache.get_artifact("t3").await.is_some());
    }
}
