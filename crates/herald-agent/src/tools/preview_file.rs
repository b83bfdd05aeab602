//! Tool: preview_file — inspect without delivering.
//!
//! Previews pending artifacts (by temp id) and thread files (by provider
//! file id): text head, CSV row sample, or basic metadata for binaries.

use std::sync::Arc;

use async_trait::async_trait;

use herald_core::types::Thread;

use crate::runtime::AgentContext;

use super::{required_str, Tool, ToolOutcome};

const TEXT_HEAD_CHARS: usize = 4000;
const CSV_SAMPLE_ROWS: usize = 10;

pub struct PreviewFileTool {
    ctx: Arc<AgentContext>,
    thread: Thread,
}

impl PreviewFileTool {
    pub fn new(ctx: Arc<AgentContext>, thread: Thread) -> Self {
        Self { ctx, thread }
    }
}

#[async_trait]
impl Tool for PreviewFileTool {
    fn name(&self) -> &str {
        "preview_file"
    }

    fn description(&self) -> &str {
        "Inspect a file without delivering it: text head, CSV row sample, \
         or metadata. Accepts a pending temp id or a file id from the manifest."
    }

    fn input_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "file_id": {
                    "type": "string",
                    "description": "Pending temp id or provider file id from the manifest."
                }
            },
            "required": ["file_id"]
        })
    }

    async fn execute(&self, input: serde_json::Value) -> ToolOutcome {
        let file_id = match required_str(&input, "file_id") {
            Ok(v) => v,
            Err(outcome) => return outcome,
        };

        // Pending artifact first — temp ids only exist in the cache.
        if let Some(artifact) = self.ctx.cache.get_artifact(file_id).await {
            if artifact.thread_id != self.thread.id {
                return ToolOutcome::error(format!(
                    "pending file {file_id} belongs to another conversation"
                ));
            }
            return ToolOutcome::success(preview(
                &artifact.filename,
                &artifact.mime,
                &artifact.bytes,
            ));
        }

        // Otherwise a thread file from the store.
        let files = match self.ctx.cache.get_files(&self.thread.id).await {
            Some(list) => list,
            None => self
                .ctx
                .store
                .list_thread_files(&self.thread.id)
                .unwrap_or_default(),
        };
        let Some(file) = files.iter().find(|f| f.provider_file_id == file_id) else {
            return ToolOutcome::error(format!(
                "file {file_id} is not part of this conversation"
            ));
        };
        match self.ctx.files.download(&self.ctx.cache, file_id).await {
            Ok(bytes) => ToolOutcome::success(preview(&file.filename, &file.mime, &bytes)),
            Err(e) => ToolOutcome::error(format!("download failed: {e}")),
        }
    }
}

fn preview(filename: &str, mime: &str, bytes: &[u8]) -> String {
    if mime.starts_with("text/csv") || filename.ends_with(".csv") {
        return preview_csv(filename, bytes);
    }
    if mime.starts_with("text/") || mime == "application/json" {
        return preview_text(filename, bytes);
    }
    if mime.starts_with("image/") {
        return format!(
            "{filename}: {mime} image, {} bytes. Use analyze_image on a manifest \
             file id for a visual description.",
            bytes.len()
        );
    }
    format!("{filename}: {mime}, {} bytes (binary, no text preview)", bytes.len())
}

fn preview_text(filename: &str, bytes: &[u8]) -> String {
    let text = String::from_utf8_lossy(bytes);
    let head: String = text.chars().take(TEXT_HEAD_CHARS).collect();
    let truncated = text.chars().count() > TEXT_HEAD_CHARS;
    format!(
        "{filename} (first {} chars{}):\n{head}",
        head.chars().count(),
        if truncated { ", truncated" } else { "" }
    )
}

fn preview_csv(filename: &str, bytes: &[u8]) -> String {
    let text = String::from_utf8_lossy(bytes);
    let mut lines = text.lines();
    let header = lines.next().unwrap_or("");
    let total_rows = text.lines().count().saturating_sub(1);
    let sample: Vec<&str> = lines.take(CSV_SAMPLE_ROWS).collect();
    format!(
        "{filename}: {} columns, {} data rows\nheader: {header}\nsample:\n{}",
        header.split(',').count(),
        total_rows,
        sample.join("\n")
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn csv_preview_counts_rows_and_columns() {
        let csv = "a,b,c\n1,2,3\n4,5,6\n";
        let out = preview_csv("data.csv", csv.as_bytes());
        assert!(out.contains("3 columns"));
        assert!(out.contains("2 data rows"));
        assert!(out.contains("1,2,3"));
    }

    #[test]
    fn binary_preview_reports_metadata_only() {
        let out = preview("blob.bin", "application/octet-stream", &[0u8; 64]);
        assert!(out.contains("64 bytes"));
        assert!(out.contains("no text preview"));
    }

    #[test]
    fn text_preview_truncates_long_files() {
        let long = "x".repeat(TEXT_HEAD_CHARS + 100);
        let out = preview_text("big.txt", long.as_bytes());
        assert!(out.contains("truncated"));
    }
}
