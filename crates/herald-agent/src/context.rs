//! Context builder: system prompt assembly and history trimming.
//!
//! The system prompt is [operator instructions + user personality +
//! per-thread prompt] (one ephemeral cache breakpoint, only when large
//! enough for the provider to accept caching) followed by the dynamic file
//! manifest (never cached — it changes every turn). History is trimmed
//! newest-backward to fit the model's input budget, then restored to
//! chronological order.

use chrono::Utc;

use herald_core::config::{HeraldConfig, ModelSpec, PROMPT_CACHE_MIN_TOKENS};
use herald_core::types::{ExecArtifact, Role, StoredMessage, Thread, User, UserFile};

use crate::provider::{ChatRequest, ServerTool, SystemBlock, ToolDefinition};
use crate::tokens;

/// Share of the context window held back as estimation slack.
const SAFETY_BUFFER_DIVISOR: u32 = 10;
const SERVER_TOOL_MAX_USES: u32 = 5;

pub struct ContextInput<'a> {
    pub spec: &'a ModelSpec,
    pub user: &'a User,
    pub thread: &'a Thread,
    pub history: &'a [StoredMessage],
    pub files: &'a [UserFile],
    pub artifacts: &'a [ExecArtifact],
    pub tools: Vec<ToolDefinition>,
}

pub fn build_request(cfg: &HeraldConfig, input: ContextInput<'_>) -> ChatRequest {
    let spec = input.spec;

    let mut static_text = cfg.prompt.system.clone();
    if let Some(personality) = &input.user.custom_personality {
        if !personality.is_empty() {
            static_text.push_str("\n\n## User personality preferences\n");
            static_text.push_str(personality);
        }
    }
    if let Some(thread_prompt) = &input.thread.system_prompt {
        if !thread_prompt.is_empty() {
            static_text.push_str("\n\n## Thread instructions\n");
            static_text.push_str(thread_prompt);
        }
    }

    // Caching below the provider minimum would be refused outright.
    let cache_static = tokens::estimate_text(&static_text) >= PROMPT_CACHE_MIN_TOKENS;

    let mut system = vec![SystemBlock {
        text: static_text,
        cache: cache_static,
    }];
    let manifest = file_manifest(input.files, input.artifacts);
    if !manifest.is_empty() {
        system.push(SystemBlock {
            text: manifest,
            cache: false,
        });
    }

    let system_tokens: u32 = system.iter().map(|b| tokens::estimate_text(&b.text)).sum();
    let thinking_budget = spec
        .supports_thinking
        .then_some(spec.thinking_budget)
        .filter(|b| *b > 0);

    let safety = spec.context_window / SAFETY_BUFFER_DIVISOR;
    let history_budget = spec
        .context_window
        .saturating_sub(spec.max_output)
        .saturating_sub(thinking_budget.unwrap_or(0))
        .saturating_sub(safety)
        .saturating_sub(system_tokens);

    let messages = trim_and_render(input.history, history_budget);

    ChatRequest {
        model_id: spec.id.clone(),
        system,
        messages,
        tools: input.tools,
        server_tools: vec![
            ServerTool::WebSearch {
                max_uses: SERVER_TOOL_MAX_USES,
            },
            ServerTool::WebFetch {
                max_uses: SERVER_TOOL_MAX_USES,
            },
        ],
        max_tokens: spec.max_output,
        thinking_budget,
        effort: spec.supports_effort.then(|| "high".to_string()),
    }
}

/// Manifest entry per thread file and per pending artifact, so the model
/// knows what each file is and why it is there.
fn file_manifest(files: &[UserFile], artifacts: &[ExecArtifact]) -> String {
    if files.is_empty() && artifacts.is_empty() {
        return String::new();
    }
    let now = Utc::now();
    let mut out = String::from("## Files available in this conversation\n");
    for file in files {
        let age = humanize_age((now - file.uploaded_at).num_seconds().max(0));
        out.push_str(&format!(
            "- {} ({}, {}, {} old, file id {})",
            file.filename,
            file.kind.as_str(),
            humanize_size(file.size),
            age,
            file.provider_file_id,
        ));
        if let Some(context) = &file.upload_context {
            out.push_str(&format!(" — uploaded with: \"{context}\""));
        }
        out.push('\n');
    }
    for artifact in artifacts {
        let age = humanize_age((now - artifact.created_at).num_seconds().max(0));
        out.push_str(&format!(
            "- {} ({}, {} old, pending delivery, temp id {})",
            artifact.filename,
            artifact.mime,
            age,
            artifact.temp_id,
        ));
        if let Some(context) = &artifact.context {
            out.push_str(&format!(" — generated for: \"{context}\""));
        }
        out.push('\n');
    }
    out
}

/// Walk newest-first until the budget runs out, then restore chronological
/// order and render to API message JSON.
fn trim_and_render(history: &[StoredMessage], budget: u32) -> Vec<serde_json::Value> {
    let mut kept: Vec<&StoredMessage> = Vec::new();
    let mut used: u32 = 0;
    for msg in history.iter().rev() {
        if msg.role == Role::System {
            continue;
        }
        let cost = tokens::estimate_message(msg);
        if used + cost > budget && !kept.is_empty() {
            break;
        }
        if used + cost > budget {
            // Even the newest message alone overflows; keep it anyway and
            // let the provider report overflow rather than sending nothing.
            kept.push(msg);
            break;
        }
        used += cost;
        kept.push(msg);
    }
    kept.reverse();

    // Merge consecutive same-role messages — the API requires alternation.
    let mut messages: Vec<serde_json::Value> = Vec::new();
    for msg in kept {
        let role = msg.role.as_str();
        let blocks = render_content(msg);
        match messages.last_mut() {
            Some(last) if last["role"] == role => {
                if let Some(arr) = last["content"].as_array_mut() {
                    arr.extend(blocks);
                }
            }
            _ => {
                messages.push(serde_json::json!({ "role": role, "content": blocks }));
            }
        }
    }
    messages
}

/// One stored message as API content blocks. Raw blocks (tool turns,
/// thinking with signatures) are replayed verbatim.
fn render_content(msg: &StoredMessage) -> Vec<serde_json::Value> {
    if let Some(blocks) = &msg.content_blocks {
        if let Some(arr) = blocks.as_array() {
            return arr.clone();
        }
    }

    let mut blocks = Vec::new();
    let mut text = msg.text.clone();
    if let Some(caption) = &msg.caption {
        if !caption.is_empty() {
            if !text.is_empty() {
                text.push_str("\n\n");
            }
            text.push_str(caption);
        }
    }
    if !text.is_empty() {
        blocks.push(serde_json::json!({ "type": "text", "text": text }));
    }
    for attachment in &msg.attachments {
        let block_type = match attachment.kind {
            herald_core::types::FileKind::Image => "image",
            _ => "document",
        };
        blocks.push(serde_json::json!({
            "type": block_type,
            "source": { "type": "file", "file_id": attachment.provider_file_id }
        }));
    }
    if blocks.is_empty() {
        // The API rejects empty content; placeholder keeps the turn.
        blocks.push(serde_json::json!({ "type": "text", "text": "[empty message]" }));
    }
    blocks
}

fn humanize_age(secs: i64) -> String {
    if secs < 60 {
        format!("{secs}s")
    } else if secs < 3600 {
        format!("{}m", secs / 60)
    } else if secs < 86_400 {
        format!("{}h", secs / 3600)
    } else {
        format!("{}d", secs / 86_400)
    }
}

fn humanize_size(bytes: i64) -> String {
    if bytes < 1024 {
        format!("{bytes} B")
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::providers::Format;
    use chrono::Utc;
    use herald_core::types::{FileKind, FileOrigin};
    use rust_decimal::Decimal;

    fn fixture() -> (HeraldConfig, User, Thread) {
        let cfg: HeraldConfig = figment::Figment::new()
            .merge(figment::providers::Toml::string(
                r#"
                [telegram]
                bot_token = "t"
                [anthropic]
                api_key = "k"
                [prompt]
                system = "You are a helpful assistant."
                "#,
            ))
            .extract()
            .unwrap();
        let user = User {
            id: 2,
            display_name: "alice".into(),
            preferred_model: None,
            custom_personality: None,
            balance: Decimal::ONE,
            is_premium: false,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        let thread = Thread {
            id: "th".into(),
            chat_id: 1,
            user_id: 2,
            topic_id: None,
            model_key: None,
            system_prompt: None,
            created_at: Utc::now(),
        };
        (cfg, user, thread)
    }

    fn spec() -> ModelSpec {
        ModelSpec {
            id: "claude-sonnet-4-5".into(),
            context_window: 10_000,
            max_output: 2_000,
            thinking_budget: 0,
            input_price: Decimal::ONE,
            output_price: Decimal::ONE,
            supports_thinking: false,
            supports_effort: false,
            supports_interleaved_thinking: false,
        }
    }

    fn msg(thread: &Thread, role: Role, text: &str) -> StoredMessage {
        StoredMessage::internal(thread, role, text)
    }

    #[test]
    fn small_system_prompt_is_not_cached() {
        let (cfg, user, thread) = fixture();
        let req = build_request(
            &cfg,
            ContextInput {
                spec: &spec(),
                user: &user,
                thread: &thread,
                history: &[],
                files: &[],
                artifacts: &[],
                tools: vec![],
            },
        );
        assert!(!req.system[0].cache);
    }

    #[test]
    fn large_system_prompt_gets_cache_breakpoint() {
        let (mut cfg, user, thread) = fixture();
        cfg.prompt.system = "x".repeat(5000); // ≥ 1024 estimated tokens
        let req = build_request(
            &cfg,
            ContextInput {
                spec: &spec(),
                user: &user,
                thread: &thread,
                history: &[],
                files: &[],
                artifacts: &[],
                tools: vec![],
            },
        );
        assert!(req.system[0].cache);
    }

    #[test]
    fn manifest_lists_files_and_artifacts_uncached() {
        let (cfg, user, thread) = fixture();
        let file = UserFile {
            id: "f1".into(),
            thread_id: thread.id.clone(),
            source_ref: None,
            provider_file_id: "file_abc".into(),
            filename: "homework.pdf".into(),
            kind: FileKind::Pdf,
            mime: "application/pdf".into(),
            size: 2048,
            uploaded_at: Utc::now(),
            expires_at: Utc::now(),
            origin: FileOrigin::User,
            upload_context: Some("check my homework".into()),
            metadata: None,
        };
        let artifact = ExecArtifact {
            temp_id: "tmp1".into(),
            thread_id: thread.id.clone(),
            filename: "plot.png".into(),
            mime: "image/png".into(),
            context: Some("histogram of X".into()),
            bytes: vec![],
            preview: None,
            created_at: Utc::now(),
        };
        let req = build_request(
            &cfg,
            ContextInput {
                spec: &spec(),
                user: &user,
                thread: &thread,
                history: &[],
                files: std::slice::from_ref(&file),
                artifacts: std::slice::from_ref(&artifact),
                tools: vec![],
            },
        );
        let manifest = &req.system[1];
        assert!(!manifest.cache);
        assert!(manifest.text.contains("file_abc"));
        assert!(manifest.text.contains("check my homework"));
        assert!(manifest.text.contains("tmp1"));
        assert!(manifest.text.contains("histogram of X"));
    }

    #[test]
    fn trimming_keeps_newest_in_chronological_order() {
        let (cfg, user, thread) = fixture();
        // Each message ≈ 258 tokens (1000 chars / 4 + overhead). Budget:
        // 10000 − 2000 − 1000 safety − system ≈ 6990 → ~27 fit out of 40.
        let history: Vec<StoredMessage> = (0..40)
            .map(|i| {
                msg(
                    &thread,
                    if i % 2 == 0 { Role::User } else { Role::Assistant },
                    &format!("{i:04}{}", "x".repeat(996)),
                )
            })
            .collect();
        let req = build_request(
            &cfg,
            ContextInput {
                spec: &spec(),
                user: &user,
                thread: &thread,
                history: &history,
                files: &[],
                artifacts: &[],
                tools: vec![],
            },
        );
        assert!(req.messages.len() < 40);
        assert!(!req.messages.is_empty());
        // Last rendered message must be the newest stored message.
        let last_text = req.messages.last().unwrap()["content"][0]["text"]
            .as_str()
            .unwrap();
        assert!(last_text.starts_with("0039"));
        // Budget property: system + messages + max_output + safety ≤ window.
        // History alternates roles, so no merging happened: rendered turn
        // count equals kept message count.
        let kept = req.messages.len();
        let system_tokens: u32 = req.system.iter().map(|b| tokens::estimate_text(&b.text)).sum();
        let message_tokens: u32 = history[40 - kept..].iter().map(tokens::estimate_message).sum();
        assert!(
            system_tokens + message_tokens + spec().max_output + spec().context_window / 10
                <= spec().context_window
        );
    }

    #[test]
    fn consecutive_user_messages_merge_into_one_turn() {
        let (cfg, user, thread) = fixture();
        let history = vec![
            msg(&thread, Role::User, "photo caption"),
            msg(&thread, Role::User, "follow-up text"),
        ];
        let req = build_request(
            &cfg,
            ContextInput {
                spec: &spec(),
                user: &user,
                thread: &thread,
                history: &history,
                files: &[],
                artifacts: &[],
                tools: vec![],
            },
        );
        assert_eq!(req.messages.len(), 1);
        assert_eq!(req.messages[0]["content"].as_array().unwrap().len(), 2);
    }

    #[test]
    fn raw_blocks_replayed_verbatim() {
        let (cfg, user, thread) = fixture();
        let mut tool_turn = msg(&thread, Role::Assistant, "");
        tool_turn.content_blocks = Some(serde_json::json!([
            { "type": "thinking", "thinking": "hmm", "signature": "c2ln" },
            { "type": "tool_use", "id": "tu_1", "name": "web_search", "input": {} }
        ]));
        let req = build_request(
            &cfg,
            ContextInput {
                spec: &spec(),
                user: &user,
                thread: &thread,
                history: std::slice::from_ref(&tool_turn),
                files: &[],
                artifacts: &[],
                tools: vec![],
            },
        );
        assert_eq!(req.messages[0]["content"][0]["signature"], "c2ln");
        assert_eq!(req.messages[0]["content"][1]["id"], "tu_1");
    }
}
