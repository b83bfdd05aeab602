//! Tool: execute_python — sandboxed code execution with internet and pip.
//!
//! Input files are staged from the file store into the sandbox; files the
//! code leaves under the output directory are harvested as deferred
//! ExecArtifacts. Billed by wall time.

use std::sync::Arc;

use async_trait::async_trait;
use rust_decimal::Decimal;

use herald_core::types::Thread;

use crate::runtime::AgentContext;
use crate::services::sandbox::OUTPUT_DIR;

use super::{required_str, OutFile, Tool, ToolOutcome};

/// Stdout/stderr cap so one print-loop can't flood the context window.
const MAX_OUTPUT_CHARS: usize = 20_000;

pub struct ExecutePythonTool {
    ctx: Arc<AgentContext>,
    thread: Thread,
}

impl ExecutePythonTool {
    pub fn new(ctx: Arc<AgentContext>, thread: Thread) -> Self {
        Self { ctx, thread }
    }
}

#[async_trait]
impl Tool for ExecutePythonTool {
    fn name(&self) -> &str {
        "execute_python"
    }

    fn description(&self) -> &str {
        "Run Python code in a sandbox with internet and pip access. Files \
         from this conversation can be staged in via input_files; anything \
         written under /output becomes a pending file for deliver_file."
    }

    fn input_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "code": {
                    "type": "string",
                    "description": "Python source to execute."
                },
                "input_files": {
                    "type": "array",
                    "items": { "type": "string" },
                    "description": "Provider file ids from the manifest to stage into the working directory."
                },
                "timeout_seconds": {
                    "type": "integer",
                    "description": "Execution timeout (default 180, max 3600)."
                }
            },
            "required": ["code"]
        })
    }

    fn is_paid(&self) -> bool {
        true
    }

    async fn execute(&self, input: serde_json::Value) -> ToolOutcome {
        let code = match required_str(&input, "code") {
            Ok(v) => v,
            Err(outcome) => return outcome,
        };
        let timeout = input
            .get("timeout_seconds")
            .and_then(|v| v.as_u64())
            .unwrap_or(self.ctx.config.services.python_timeout_secs)
            .min(self.ctx.config.services.python_timeout_cap_secs);

        let handle = match self
            .ctx
            .sandbox
            .ensure_sandbox(&self.ctx.cache, &self.thread.id)
            .await
        {
            Ok(h) => h,
            Err(e) => return ToolOutcome::error(format!("sandbox unavailable: {e}")),
        };

        // Stage requested input files from the file store.
        if let Some(ids) = input.get("input_files").and_then(|v| v.as_array()) {
            let files = match self.ctx.cache.get_files(&self.thread.id).await {
                Some(list) => list,
                None => self
                    .ctx
                    .store
                    .list_thread_files(&self.thread.id)
                    .unwrap_or_default(),
            };
            for id in ids.iter().filter_map(|v| v.as_str()) {
                let Some(file) = files.iter().find(|f| f.provider_file_id == id) else {
                    return ToolOutcome::error(format!(
                        "input file {id} is not part of this conversation"
                    ));
                };
                let bytes = match self.ctx.files.download(&self.ctx.cache, id).await {
                    Ok(b) => b,
                    Err(e) => {
                        return ToolOutcome::error(format!(
                            "staging {} failed: {e}",
                            file.filename
                        ))
                    }
                };
                if let Err(e) = self
                    .ctx
                    .sandbox
                    .upload_file(&handle, &file.filename, bytes)
                    .await
                {
                    return ToolOutcome::error(format!("staging {} failed: {e}", file.filename));
                }
            }
        }

        let started = chrono::Utc::now().to_rfc3339();
        let result = match self.ctx.sandbox.run(&handle, code, timeout).await {
            Ok(r) => r,
            Err(e) => return ToolOutcome::error(format!("execution failed: {e}")),
        };

        let seconds = Decimal::from_f64_retain(result.duration_seconds).unwrap_or_default();
        let cost = (seconds * self.ctx.config.pricing.sandbox_per_second).round_dp(6);

        let mut content = String::new();
        if !result.stdout.is_empty() {
            content.push_str("stdout:\n");
            content.push_str(truncate(&result.stdout));
            content.push('\n');
        }
        if !result.stderr.is_empty() {
            content.push_str("stderr:\n");
            content.push_str(truncate(&result.stderr));
            content.push('\n');
        }
        content.push_str(&format!(
            "exit code {} in {:.1}s",
            result.exit_code, result.duration_seconds
        ));

        let mut outcome = if result.exit_code == 0 {
            ToolOutcome::success(content)
        } else {
            ToolOutcome::error(content)
        }
        .with_cost(cost);

        // Harvest files the code left under the output directory.
        match self
            .ctx
            .sandbox
            .list_new_files(&handle, OUTPUT_DIR, &started)
            .await
        {
            Ok(new_files) => {
                for file in new_files {
                    match self.ctx.sandbox.download_file(&handle, &file.id).await {
                        Ok(bytes) => {
                            let filename = file
                                .path
                                .rsplit('/')
                                .next()
                                .unwrap_or("output.bin")
                                .to_string();
                            let mime = guess_mime(&filename);
                            outcome.output_files.push(OutFile {
                                filename,
                                mime,
                                bytes,
                                context: Some("produced by code execution".to_string()),
                            });
                        }
                        Err(e) => {
                            outcome
                                .content
                                .push_str(&format!("\n(failed to retrieve {}: {e})", file.path));
                        }
                    }
                }
            }
            Err(e) => {
                outcome
                    .content
                    .push_str(&format!("\n(output file listing failed: {e})"));
            }
        }

        if !outcome.output_files.is_empty() {
            outcome.content.push_str(&format!(
                "\n{} output file(s) pending delivery",
                outcome.output_files.len()
            ));
        }
        outcome
    }
}

fn truncate(s: &str) -> &str {
    match s.char_indices().nth(MAX_OUTPUT_CHARS) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

fn guess_mime(filename: &str) -> String {
    let ext = filename.rsplit('.').next().unwrap_or("");
    match ext {
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "svg" => "image/svg+xml",
        "pdf" => "application/pdf",
        "csv" => "text/csv",
        "txt" | "log" => "text/plain",
        "json" => "application/json",
        "html" => "text/html",
        "zip" => "application/zip",
        "xlsx" => "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
        _ => "application/octet-stream",
    }
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mime_guessing() {
        assert_eq!(guess_mime("plot.png"), "image/png");
        assert_eq!(guess_mime("data.csv"), "text/csv");
        assert_eq!(guess_mime("weird"), "application/octet-stream");
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        let s = "é".repeat(MAX_OUTPUT_CHARS + 10);
        let t = truncate(&s);
        assert_eq!(t.chars().count(), MAX_OUTPUT_CHARS);
    }
}
