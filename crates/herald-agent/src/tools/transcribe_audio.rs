//! Tool: transcribe_audio — speech-to-text for audio files in the thread.

use std::sync::Arc;

use async_trait::async_trait;
use rust_decimal::Decimal;

use herald_core::types::{FileKind, Thread};

use crate::runtime::AgentContext;

use super::{required_str, Tool, ToolOutcome};

pub struct TranscribeAudioTool {
    ctx: Arc<AgentContext>,
    thread: Thread,
}

impl TranscribeAudioTool {
    pub fn new(ctx: Arc<AgentContext>, thread: Thread) -> Self {
        Self { ctx, thread }
    }
}

#[async_trait]
impl Tool for TranscribeAudioTool {
    fn name(&self) -> &str {
        "transcribe_audio"
    }

    fn description(&self) -> &str {
        "Transcribe an audio or voice file from this conversation to text. \
         Pass the file id from the file manifest."
    }

    fn input_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "file_id": {
                    "type": "string",
                    "description": "Provider file id from the manifest."
                }
            },
            "required": ["file_id"]
        })
    }

    fn is_paid(&self) -> bool {
        true
    }

    async fn execute(&self, input: serde_json::Value) -> ToolOutcome {
        let file_id = match required_str(&input, "file_id") {
            Ok(v) => v,
            Err(outcome) => return outcome,
        };

        let files = match self.ctx.cache.get_files(&self.thread.id).await {
            Some(list) => list,
            None => self
                .ctx
                .store
                .list_thread_files(&self.thread.id)
                .unwrap_or_default(),
        };
        let Some(file) = files.iter().find(|f| f.provider_file_id == file_id) else {
            return ToolOutcome::error(format!("file {file_id} is not part of this conversation"));
        };
        if !matches!(file.kind, FileKind::Audio | FileKind::Voice | FileKind::Video) {
            return ToolOutcome::error(format!(
                "{} is a {} file; transcribe_audio needs audio, voice, or video",
                file.filename,
                file.kind.as_str()
            ));
        }

        let bytes = match self
            .ctx
            .files
            .download(&self.ctx.cache, &file.provider_file_id)
            .await
        {
            Ok(b) => b,
            Err(e) => return ToolOutcome::error(format!("download failed: {e}")),
        };

        match self
            .ctx
            .transcriber
            .transcribe(&file.filename, &file.mime, bytes)
            .await
        {
            Ok(t) => {
                let minutes = Decimal::from_f64_retain(t.duration_seconds / 60.0)
                    .unwrap_or_default();
                let cost = (minutes * self.ctx.config.pricing.transcription_per_minute)
                    .round_dp(6);
                let mut content = format!(
                    "Transcription ({}, {:.0}s):\n{}",
                    if t.language.is_empty() { "unknown" } else { &t.language },
                    t.duration_seconds,
                    t.text
                );
                if t.text.is_empty() {
                    content = "Transcription produced no text (silent or unintelligible audio)."
                        .to_string();
                }
                ToolOutcome::success(content).with_cost(cost)
            }
            Err(e) => ToolOutcome::error(format!("transcription failed: {e}")),
        }
    }
}
