//! Agent loop orchestrator: one batch of user messages in, one fully
//! streamed-and-billed assistant response out.
//!
//! Flow per batch: claim the generation slot → append user turns → pre-turn
//! balance gate → up to N_MAX streamed LLM iterations with parallel tool
//! dispatch between them → finalize the draft → charge the turn → persist
//! the final assistant message → release the slot. Cancellation can land
//! between any two stream events; every exit path finalizes and charges
//! what was actually consumed.

use std::sync::Arc;

use rust_decimal::Decimal;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use herald_cache::{QueueItem, WriteOp};
use herald_core::types::{
    ExecArtifact, FileKind, FileOrigin, ProcessedMessage, Role, StoredMessage, Thread,
    ThreadKey, TokenUsage, User, UserFile,
};
use herald_core::{HeraldError, Result};

use crate::context::{self, ContextInput};
use crate::display::Display;
use crate::draft::Draft;
use crate::outbound::Outbound;
use crate::pricing;
use crate::runtime::AgentContext;
use crate::stream::{StopReason, StreamEvent};
use crate::tools::{ToolOutcome, ToolSet};
use crate::tracker::Generation;

const OUT_OF_FUNDS: &str =
    "Your balance is empty. Top up to keep the conversation going.";
const CONTEXT_OVERFLOW_NOTE: &str =
    "\n\n[conversation too long for the model's context window]";
const MAX_TOKENS_NOTE: &str =
    "\n\n[response hit the per-turn output limit; say \"continue\" for more]";

type ToolFactory = dyn Fn(&Thread) -> ToolSet + Send + Sync;

pub struct Orchestrator {
    ctx: Arc<AgentContext>,
    outbound: Arc<dyn Outbound>,
    tool_factory: Box<ToolFactory>,
}

/// One staged tool call from the current assistant turn.
struct StagedCall {
    id: String,
    name: String,
    input: serde_json::Value,
}

impl Orchestrator {
    pub fn new(ctx: Arc<AgentContext>, outbound: Arc<dyn Outbound>) -> Self {
        let factory_ctx = Arc::clone(&ctx);
        Self {
            ctx,
            outbound,
            tool_factory: Box::new(move |thread| ToolSet::build(Arc::clone(&factory_ctx), thread)),
        }
    }

    /// Test seam: substitute the tool set built per thread.
    pub fn with_tool_factory(
        ctx: Arc<AgentContext>,
        outbound: Arc<dyn Outbound>,
        factory: impl Fn(&Thread) -> ToolSet + Send + Sync + 'static,
    ) -> Self {
        Self {
            ctx,
            outbound,
            tool_factory: Box::new(factory),
        }
    }

    /// Run one batch for a thread. The caller (per-thread batcher) already
    /// guarantees batches for one thread arrive here serially.
    pub async fn run_batch(&self, batch: Vec<ProcessedMessage>) -> Result<()> {
        let Some(first) = batch.first() else {
            return Ok(());
        };
        let key = first.key;

        let generation = self.ctx.tracker.start(key);
        let result = self.run_inner(key, &batch, &generation).await;
        self.ctx.tracker.clear(&key, &generation);
        result
    }

    async fn run_inner(
        &self,
        key: ThreadKey,
        batch: &[ProcessedMessage],
        generation: &Generation,
    ) -> Result<()> {
        let user = self.resolve_user(key.user_id).await?;
        let thread = self.resolve_thread(&key).await?;

        // Load history once; it stays authoritative for the whole batch.
        let mut history = self.load_history(&thread).await;

        // Append the user turns, oldest event first.
        let mut user_turns = Vec::with_capacity(batch.len());
        for pm in batch {
            user_turns.push(user_turn_to_message(&thread, pm));
        }
        history.extend(user_turns.iter().cloned());
        self.ctx.cache.put_messages(&thread.id, &history).await;
        for msg in &user_turns {
            self.ctx
                .cache
                .push_write(QueueItem::new(WriteOp::Message(msg.clone())))
                .await;
        }

        // Pre-turn gate.
        if !self.ctx.gate.has_funds(key.user_id).await? {
            self.outbound
                .send_text(key.chat_id, OUT_OF_FUNDS, false)
                .await?;
            return Ok(());
        }

        let (model_key, spec) = self
            .ctx
            .config
            .model(thread.model_key.as_deref().or(user.preferred_model.as_deref()))?;
        let model_key = model_key.to_string();
        let spec = spec.clone();

        let tools = (self.tool_factory)(&thread);
        let tool_defs = tools.definitions();

        let mut draft = Draft::new(
            Arc::clone(&self.outbound),
            key.chat_id,
            std::time::Duration::from_millis(self.ctx.config.telegram.draft_edit_ms),
        );
        let mut display = Display::new();
        let mut total_usage = TokenUsage::default();
        let mut server_tool_calls: u32 = 0;
        let mut cancelled = false;
        let mut trailing_note = "";
        // Visible text of the last iteration only — earlier iterations'
        // text is already persisted inside their tool-use turns.
        let mut last_iteration_text = String::new();

        let max_continuations = self.ctx.config.anthropic.max_continuations;
        'turns: for iteration in 0..max_continuations {
            let files = self.load_files(&thread).await;
            let artifacts = self.ctx.cache.list_artifacts(&thread.id).await;
            let request = context::build_request(
                &self.ctx.config,
                ContextInput {
                    spec: &spec,
                    user: &user,
                    thread: &thread,
                    history: &history,
                    files: &files,
                    artifacts: &artifacts,
                    tools: tool_defs.clone(),
                },
            );

            debug!(iteration, model = %model_key, "opening llm stream");
            let (tx, mut rx) = mpsc::channel::<StreamEvent>(64);
            let provider = Arc::clone(&self.ctx.provider);
            let stream_task =
                tokio::spawn(async move { provider.send_stream(&request, tx).await });

            let mut staged: Vec<StagedCall> = Vec::new();
            let mut thinking_blocks: Vec<(String, String)> = Vec::new();
            let mut iteration_text = String::new();
            let mut iteration_thinking_len: usize = 0;
            let mut iteration_usage = TokenUsage::default();
            let mut stop_reason: Option<StopReason> = None;
            let mut stream_failed: Option<String> = None;

            loop {
                let event = tokio::select! {
                    event = rx.recv() => event,
                    _ = generation.token.cancelled() => {
                        cancelled = true;
                        break;
                    }
                };
                let Some(event) = event else { break };

                display.apply(&event);
                match event {
                    StreamEvent::MessageStart { usage } => {
                        iteration_usage = usage;
                    }
                    StreamEvent::TextDelta { text } => {
                        iteration_text.push_str(&text);
                        draft.update(&display.render()).await;
                    }
                    StreamEvent::ThinkingDelta { text } => {
                        iteration_thinking_len += text.len();
                        draft.update(&display.render()).await;
                    }
                    StreamEvent::ThinkingDone { thinking, signature } => {
                        thinking_blocks.push((thinking, signature));
                    }
                    StreamEvent::ToolUse { id, name, input } => {
                        draft.update(&display.render()).await;
                        staged.push(StagedCall { id, name, input });
                    }
                    StreamEvent::ServerToolResult { .. } => {
                        server_tool_calls += 1;
                        draft.update(&display.render()).await;
                    }
                    StreamEvent::MessageStop { stop_reason: reason, usage } => {
                        iteration_usage = usage;
                        stop_reason = Some(reason);
                        break;
                    }
                    StreamEvent::Error { message } => {
                        stream_failed = Some(message);
                        break;
                    }
                    StreamEvent::SignatureDelta { .. } => {}
                }
            }
            if cancelled && iteration_usage.output == 0 {
                // No terminal usage arrived: estimate the output side from
                // what was streamed so the partial turn is still billed.
                iteration_usage.output =
                    crate::tokens::estimate_text(&iteration_text) + (iteration_thinking_len as u32) / 4;
            }
            total_usage.add(&iteration_usage);
            last_iteration_text = iteration_text.clone();

            if cancelled {
                // Cooperative cancellation: the in-flight HTTP stream is
                // not allowed to start another iteration.
                stream_task.abort();
                break 'turns;
            }
            if let Some(message) = stream_failed {
                warn!(error = %message, "stream failed mid-turn");
                stream_task.abort();
                trailing_note = "\n\n[the model stream failed; please try again]";
                break 'turns;
            }
            if stop_reason.is_none() {
                // Channel closed without a terminal event: the request
                // failed before the first stream byte. The task is done.
                match stream_task.await {
                    Ok(Err(HeraldError::ContextWindowExceeded)) => {
                        trailing_note = CONTEXT_OVERFLOW_NOTE;
                    }
                    Ok(Err(e)) => {
                        warn!(error = %e, "llm request failed");
                        trailing_note = "\n\n[the model request failed; please try again]";
                    }
                    _ => {}
                }
                break 'turns;
            }
            stream_task.abort();

            match stop_reason {
                Some(StopReason::ToolUse) if !staged.is_empty() => {
                    let (results, turn_break) = self
                        .dispatch_staged(&thread, key.user_id, &tools, &staged, generation)
                        .await;

                    // Assistant turn: preserved thinking blocks, text, then
                    // the tool_use blocks — replayed verbatim next request.
                    let mut assistant_blocks: Vec<serde_json::Value> = Vec::new();
                    for (thinking, signature) in &thinking_blocks {
                        assistant_blocks.push(serde_json::json!({
                            "type": "thinking",
                            "thinking": thinking,
                            "signature": signature,
                        }));
                    }
                    if !iteration_text.is_empty() {
                        assistant_blocks.push(serde_json::json!({
                            "type": "text",
                            "text": iteration_text,
                        }));
                    }
                    for call in &staged {
                        assistant_blocks.push(serde_json::json!({
                            "type": "tool_use",
                            "id": call.id,
                            "name": call.name,
                            "input": call.input,
                        }));
                    }
                    let mut assistant_msg =
                        StoredMessage::internal(&thread, Role::Assistant, iteration_text.clone());
                    assistant_msg.content_blocks =
                        Some(serde_json::Value::Array(assistant_blocks));

                    let mut result_msg = StoredMessage::internal(&thread, Role::User, String::new());
                    result_msg.content_blocks = Some(serde_json::Value::Array(results));

                    self.append_pair(&mut history, &thread, assistant_msg, result_msg)
                        .await;
                    // This iteration's text now lives in the tool-use turn;
                    // don't repeat it in the final assistant message.
                    last_iteration_text.clear();

                    if turn_break {
                        debug!("turn break requested by tool result");
                        break 'turns;
                    }
                }
                Some(StopReason::ToolUse) => {
                    // tool_use stop with nothing staged — treat as end.
                    break 'turns;
                }
                Some(StopReason::EndTurn) | None => break 'turns,
                Some(StopReason::ContextWindowExceeded) => {
                    trailing_note = CONTEXT_OVERFLOW_NOTE;
                    break 'turns;
                }
                Some(StopReason::MaxTokens) => {
                    trailing_note = MAX_TOKENS_NOTE;
                    break 'turns;
                }
                Some(StopReason::Refusal) => break 'turns,
            }

            if iteration + 1 == max_continuations {
                info!(max_continuations, "continuation bound reached");
            }
        }

        if cancelled {
            display.mark_interrupted();
        }

        // Finalize the draft on every path; charge what was consumed even
        // when the turn was cancelled mid-stream.
        let mut final_text = display.render();
        final_text.push_str(trailing_note);
        // A frontend failure must not skip the charge below.
        let final_message_id = match draft.finalize(&final_text).await {
            Ok(id) => id,
            Err(e) => {
                warn!(error = %e, "draft finalize failed");
                None
            }
        };

        // Operator-set margin scales the LLM side of the charge.
        let margin = self.ctx.store.model_margin(&model_key);
        let llm_cost = pricing::turn_cost(&total_usage, &spec) * margin;
        let server_cost =
            Decimal::from(server_tool_calls) * self.ctx.config.pricing.web_search;
        let turn_cost = llm_cost + server_cost;
        if turn_cost > Decimal::ZERO {
            let description = if server_tool_calls > 0 {
                format!("{model_key} turn + {server_tool_calls} web call(s)")
            } else {
                format!("{model_key} turn")
            };
            self.ctx
                .gate
                .charge(
                    key.user_id,
                    turn_cost,
                    &description,
                    final_message_id.map(|id| id.to_string()),
                    Some(total_usage),
                )
                .await?;
        }

        // Persist the final assistant message (last iteration's text; the
        // earlier iterations live in their tool-use turns).
        let mut final_msg =
            StoredMessage::internal(&thread, Role::Assistant, last_iteration_text);
        if cancelled {
            final_msg.text.push_str("\n\n[interrupted]");
        }
        final_msg.external_id = final_message_id;
        final_msg.usage = total_usage;
        history.push(final_msg.clone());
        self.ctx.cache.put_messages(&thread.id, &history).await;
        self.ctx
            .cache
            .push_write(QueueItem::new(WriteOp::Message(final_msg)))
            .await;

        if cancelled {
            info!(thread = %thread.id, "turn cancelled and finalized");
        }
        Ok(())
    }

    /// Dispatch one turn's staged calls in parallel and assemble the
    /// tool_result blocks in staging order. Paid calls are balance-checked
    /// at dispatch time; unknown tools and gated calls become synthetic
    /// error results instead of aborting the turn.
    async fn dispatch_staged(
        &self,
        thread: &Thread,
        user_id: i64,
        tools: &ToolSet,
        staged: &[StagedCall],
        generation: &Generation,
    ) -> (Vec<serde_json::Value>, bool) {
        let mut handles: Vec<(usize, tokio::task::JoinHandle<ToolOutcome>)> = Vec::new();
        let mut outcomes: Vec<Option<ToolOutcome>> = Vec::with_capacity(staged.len());
        outcomes.resize_with(staged.len(), || None);

        // Cost already committed by earlier calls in this batch. Parallel
        // siblings must not collectively overdraw: once committed spend
        // eats the balance, later paid calls are rejected pre-dispatch.
        let mut committed = Decimal::ZERO;

        for (idx, call) in staged.iter().enumerate() {
            // Cancellation is consulted before every dispatch; calls
            // already in flight are allowed to finish.
            if generation.token.is_cancelled() {
                outcomes[idx] = Some(ToolOutcome::error("cancelled before dispatch"));
                continue;
            }
            let Some(tool) = tools.get(&call.name) else {
                outcomes[idx] = Some(ToolOutcome::error(format!("unknown tool: {}", call.name)));
                continue;
            };
            if tool.is_paid() {
                let balance = self
                    .ctx
                    .gate
                    .balance(user_id)
                    .await
                    .unwrap_or(Decimal::ZERO);
                if balance - committed <= Decimal::ZERO {
                    outcomes[idx] = Some(ToolOutcome::error("insufficient balance"));
                    continue;
                }
                committed += tool.estimated_cost();
            }
            let input = call.input.clone();
            handles.push((idx, tokio::spawn(async move { tool.execute(input).await })));
        }

        for (idx, handle) in handles {
            outcomes[idx] = Some(match handle.await {
                Ok(outcome) => outcome,
                Err(e) => ToolOutcome::error(format!("tool task failed: {e}")),
            });
        }

        let mut results = Vec::with_capacity(staged.len());
        let mut turn_break = false;
        for (call, outcome) in staged.iter().zip(outcomes.into_iter()) {
            let mut outcome = outcome.expect("every staged call resolves");
            turn_break |= outcome.force_turn_break;

            // Charge this tool before anything else — the charge is its own
            // atomic unit, independent of sibling calls.
            if outcome.cost_usd > Decimal::ZERO {
                if let Err(e) = self
                    .ctx
                    .gate
                    .charge(user_id, outcome.cost_usd, &call.name, None, None)
                    .await
                {
                    warn!(tool = %call.name, error = %e, "tool charge failed");
                }
            }

            // Immediate deliveries: file store → UserFile → frontend.
            let file_contents = std::mem::take(&mut outcome.file_contents);
            for blob in file_contents {
                match self.record_assistant_file(thread, &blob).await {
                    Ok(()) => {
                        if let Err(e) = self
                            .outbound
                            .send_file(
                                thread.chat_id,
                                &blob.filename,
                                &blob.mime,
                                blob.bytes.clone(),
                                blob.context.as_deref(),
                            )
                            .await
                        {
                            warn!(file = %blob.filename, error = %e, "frontend delivery failed");
                        }
                    }
                    Err(e) => {
                        warn!(file = %blob.filename, error = %e, "file store rejected blob");
                        outcome.content.push_str(&format!(
                            "\n({} could not be stored: {e})",
                            blob.filename
                        ));
                    }
                }
            }

            // Deferred deliveries: park as ExecArtifacts and tell the model
            // their temp ids so it can call deliver_file.
            let output_files = std::mem::take(&mut outcome.output_files);
            for blob in output_files {
                let artifact = ExecArtifact {
                    temp_id: Uuid::new_v4().to_string(),
                    thread_id: thread.id.clone(),
                    filename: blob.filename.clone(),
                    mime: blob.mime.clone(),
                    context: blob.context.clone(),
                    bytes: blob.bytes,
                    preview: None,
                    created_at: chrono::Utc::now(),
                };
                if self.ctx.cache.put_artifact(&artifact).await {
                    outcome.content.push_str(&format!(
                        "\n[pending file: {} temp_id={}]",
                        artifact.filename, artifact.temp_id
                    ));
                } else {
                    outcome.content.push_str(&format!(
                        "\n({} could not be parked for delivery)",
                        artifact.filename
                    ));
                }
            }

            results.push(serde_json::json!({
                "type": "tool_result",
                "tool_use_id": call.id,
                "content": outcome.content,
                "is_error": outcome.is_error,
            }));
        }
        (results, turn_break)
    }

    /// Upload an assistant-produced blob to the file store and record the
    /// UserFile (origin assistant) through cache + write-behind.
    async fn record_assistant_file(
        &self,
        thread: &Thread,
        blob: &crate::tools::OutFile,
    ) -> Result<()> {
        let uploaded = self
            .ctx
            .files
            .upload(&blob.filename, &blob.mime, blob.bytes.clone())
            .await?;
        let now = chrono::Utc::now();
        let file = UserFile {
            id: Uuid::now_v7().to_string(),
            thread_id: thread.id.clone(),
            source_ref: None,
            provider_file_id: uploaded.id,
            filename: blob.filename.clone(),
            kind: if blob.mime.starts_with("image/") {
                FileKind::Generated
            } else {
                FileKind::from_mime(&blob.mime)
            },
            mime: blob.mime.clone(),
            size: blob.bytes.len() as i64,
            uploaded_at: now,
            expires_at: now + chrono::Duration::hours(self.ctx.config.anthropic.files_ttl_hours),
            origin: FileOrigin::Assistant,
            upload_context: blob.context.clone(),
            metadata: None,
        };
        self.ctx.cache.add_file(&file).await;
        self.ctx
            .cache
            .push_write(QueueItem::new(WriteOp::File(file)))
            .await;
        Ok(())
    }

    /// Append the assistant tool-use turn and its paired results, keeping
    /// the cached list and write-behind queue in step.
    async fn append_pair(
        &self,
        history: &mut Vec<StoredMessage>,
        thread: &Thread,
        assistant: StoredMessage,
        results: StoredMessage,
    ) {
        history.push(assistant.clone());
        history.push(results.clone());
        self.ctx
            .cache
            .append_messages(&thread.id, &[assistant.clone(), results.clone()])
            .await;
        self.ctx
            .cache
            .push_write(QueueItem::new(WriteOp::Message(assistant)))
            .await;
        self.ctx
            .cache
            .push_write(QueueItem::new(WriteOp::Message(results)))
            .await;
    }

    async fn resolve_user(&self, user_id: i64) -> Result<User> {
        if let Some(user) = self.ctx.cache.get_user(user_id).await {
            return Ok(user);
        }
        let user = self
            .ctx
            .store
            .get_user(user_id)
            .map_err(|e| HeraldError::Database(e.to_string()))?
            .ok_or_else(|| HeraldError::Internal(format!("user {user_id} vanished")))?;
        self.ctx.cache.put_user(&user).await;
        Ok(user)
    }

    async fn resolve_thread(&self, key: &ThreadKey) -> Result<Thread> {
        if let Some(thread) = self.ctx.cache.get_thread(key).await {
            return Ok(thread);
        }
        let thread = self
            .ctx
            .store
            .get_or_create_thread(key)
            .map_err(|e| HeraldError::Database(e.to_string()))?;
        self.ctx.cache.put_thread(&thread).await;
        Ok(thread)
    }

    async fn load_history(&self, thread: &Thread) -> Vec<StoredMessage> {
        if let Some(messages) = self.ctx.cache.get_messages(&thread.id).await {
            return messages;
        }
        let messages = self.ctx.store.list_messages(&thread.id).unwrap_or_default();
        self.ctx.cache.put_messages(&thread.id, &messages).await;
        messages
    }

    async fn load_files(&self, thread: &Thread) -> Vec<UserFile> {
        if let Some(files) = self.ctx.cache.get_files(&thread.id).await {
            return files;
        }
        let files = self.ctx.store.list_thread_files(&thread.id).unwrap_or_default();
        self.ctx.cache.put_files(&thread.id, &files).await;
        files
    }
}

fn user_turn_to_message(thread: &Thread, pm: &ProcessedMessage) -> StoredMessage {
    let mut msg = StoredMessage::internal(thread, Role::User, pm.text.clone());
    msg.external_id = Some(pm.external_id);
    msg.caption = pm.caption.clone();
    msg.reply_to = pm.reply_to;
    msg.media_group_id = pm.media_group_id.clone();
    msg.attachments = pm.files.iter().map(|f| f.attachment()).collect();
    msg.created_at = pm.date;
    if pm.transcription_failed {
        msg.text.push_str("\n[voice message; transcription failed]");
    }
    msg
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::providers::Format;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use rust_decimal_macros::dec;

    use herald_cache::{CacheHandle, MemoryBackend};
    use herald_core::config::{CacheConfig, HeraldConfig};
    use herald_core::types::OpKind;
    use herald_store::billing::OpDetails;
    use herald_store::Store;

    use crate::provider::{ChatRequest, ChatResponse, LlmProvider};
    use crate::tools::{OutFile, Tool};

    // ------------------------------------------------------------------
    // Scripted provider: each send_stream pops the next script and plays
    // it; a hanging script waits until the receiver goes away (cancel).
    // ------------------------------------------------------------------

    struct Script {
        events: Vec<StreamEvent>,
        hang: bool,
    }

    struct FakeProvider {
        scripts: Mutex<VecDeque<Script>>,
    }

    impl FakeProvider {
        fn new(scripts: Vec<Script>) -> Arc<Self> {
            Arc::new(Self {
                scripts: Mutex::new(scripts.into_iter().collect()),
            })
        }
    }

    #[async_trait]
    impl LlmProvider for FakeProvider {
        fn name(&self) -> &str {
            "fake"
        }

        async fn send_stream(
            &self,
            _req: &ChatRequest,
            tx: mpsc::Sender<StreamEvent>,
        ) -> Result<()> {
            let script = self
                .scripts
                .lock()
                .unwrap()
                .pop_front()
                .expect("provider called more times than scripted");
            for event in script.events {
                if tx.send(event).await.is_err() {
                    return Ok(());
                }
            }
            if script.hang {
                tx.closed().await;
            }
            Ok(())
        }

        async fn send(&self, _req: &ChatRequest) -> Result<ChatResponse> {
            unimplemented!("orchestrator uses the streaming path")
        }
    }

    fn stop(reason: StopReason, input: u32, output: u32) -> StreamEvent {
        StreamEvent::MessageStop {
            stop_reason: reason,
            usage: TokenUsage {
                input,
                output,
                ..Default::default()
            },
        }
    }

    fn text(t: &str) -> StreamEvent {
        StreamEvent::TextDelta { text: t.into() }
    }

    fn tool_use(id: &str, name: &str) -> StreamEvent {
        StreamEvent::ToolUse {
            id: id.into(),
            name: name.into(),
            input: serde_json::json!({}),
        }
    }

    // ------------------------------------------------------------------
    // Recording outbound.
    // ------------------------------------------------------------------

    #[derive(Default)]
    struct RecordingOutbound {
        log: Mutex<Vec<String>>,
        next_id: Mutex<i64>,
    }

    impl RecordingOutbound {
        fn entries(&self) -> Vec<String> {
            self.log.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Outbound for RecordingOutbound {
        async fn send_text(&self, _chat: i64, text: &str, with_stop: bool) -> Result<i64> {
            let mut id = self.next_id.lock().unwrap();
            *id += 1;
            self.log
                .lock()
                .unwrap()
                .push(format!("send[{with_stop}]:{text}"));
            Ok(*id)
        }
        async fn edit_text(&self, _chat: i64, id: i64, text: &str, with_stop: bool) -> Result<()> {
            self.log
                .lock()
                .unwrap()
                .push(format!("edit#{id}[{with_stop}]:{text}"));
            Ok(())
        }
        async fn delete_message(&self, _chat: i64, _id: i64) -> Result<()> {
            Ok(())
        }
        async fn send_file(
            &self,
            _chat: i64,
            filename: &str,
            _mime: &str,
            _bytes: Vec<u8>,
            _caption: Option<&str>,
        ) -> Result<i64> {
            let mut id = self.next_id.lock().unwrap();
            *id += 1;
            self.log.lock().unwrap().push(format!("file:{filename}"));
            Ok(*id)
        }
        fn text_limit(&self) -> usize {
            4096
        }
    }

    // ------------------------------------------------------------------
    // Fake tools.
    // ------------------------------------------------------------------

    struct EchoTool {
        executions: Arc<Mutex<u32>>,
    }

    #[async_trait]
    impl Tool for EchoTool {
        fn name(&self) -> &str {
            "echo"
        }
        fn description(&self) -> &str {
            "test echo"
        }
        fn input_schema(&self) -> serde_json::Value {
            serde_json::json!({ "type": "object" })
        }
        async fn execute(&self, _input: serde_json::Value) -> ToolOutcome {
            *self.executions.lock().unwrap() += 1;
            ToolOutcome::success("echoed")
        }
    }

    struct FixedPricePaidTool {
        executions: Arc<Mutex<u32>>,
        price: Decimal,
    }

    #[async_trait]
    impl Tool for FixedPricePaidTool {
        fn name(&self) -> &str {
            "make_image"
        }
        fn description(&self) -> &str {
            "test paid tool"
        }
        fn input_schema(&self) -> serde_json::Value {
            serde_json::json!({ "type": "object" })
        }
        fn is_paid(&self) -> bool {
            true
        }
        fn estimated_cost(&self) -> Decimal {
            self.price
        }
        async fn execute(&self, _input: serde_json::Value) -> ToolOutcome {
            *self.executions.lock().unwrap() += 1;
            ToolOutcome::success("image made").with_cost(self.price)
        }
    }

    struct SequentialDeliverTool;

    #[async_trait]
    impl Tool for SequentialDeliverTool {
        fn name(&self) -> &str {
            "deliver"
        }
        fn description(&self) -> &str {
            "test sequential delivery"
        }
        fn input_schema(&self) -> serde_json::Value {
            serde_json::json!({ "type": "object" })
        }
        async fn execute(&self, _input: serde_json::Value) -> ToolOutcome {
            let mut outcome = ToolOutcome::success("delivered");
            outcome.force_turn_break = true;
            outcome.file_contents.push(OutFile {
                filename: "formula.png".into(),
                mime: "image/png".into(),
                bytes: vec![1],
                context: None,
            });
            outcome
        }
    }

    // ------------------------------------------------------------------
    // Harness.
    // ------------------------------------------------------------------

    fn test_config() -> HeraldConfig {
        figment::Figment::new()
            .merge(figment::providers::Toml::string(
                r#"
                [telegram]
                bot_token = "t"
                draft_edit_ms = 0

                [anthropic]
                api_key = "k"
                base_url = "http://127.0.0.1:1"

                [prompt]
                system = "be helpful"
                "#,
            ))
            .extract()
            .unwrap()
    }

    struct Harness {
        ctx: Arc<AgentContext>,
        outbound: Arc<RecordingOutbound>,
        key: ThreadKey,
    }

    fn harness(provider: Arc<FakeProvider>, balance: Decimal) -> Harness {
        let store = Arc::new(Store::open_in_memory().unwrap());
        store.upsert_user(2, "alice", false).unwrap();
        if balance != Decimal::ZERO {
            store
                .apply_balance_op(2, OpKind::Deposit, balance, "seed", OpDetails::default())
                .unwrap();
        }
        let cache = Arc::new(CacheHandle::new(
            Arc::new(MemoryBackend::new()),
            &CacheConfig::default(),
        ));
        let ctx = Arc::new(AgentContext::new(test_config(), store, cache, provider));
        Harness {
            ctx,
            outbound: Arc::new(RecordingOutbound::default()),
            key: ThreadKey::new(1, 2, None),
        }
    }

    fn user_message(key: ThreadKey, external_id: i64, text: &str) -> ProcessedMessage {
        ProcessedMessage {
            key,
            external_id,
            text: text.into(),
            caption: None,
            reply_to: None,
            media_group_id: None,
            files: Vec::new(),
            upload_context: None,
            transcription_failed: false,
            date: chrono::Utc::now(),
        }
    }

    fn thread_messages(h: &Harness) -> Vec<StoredMessage> {
        let thread = h.ctx.store.get_or_create_thread(&h.key).unwrap();
        h.ctx.store.list_messages(&thread.id).unwrap()
    }

    async fn flush_writes(h: &Harness) {
        let flusher = herald_store::Flusher::new(
            Arc::clone(&h.ctx.store),
            Arc::clone(&h.ctx.cache),
            &herald_core::config::StoreConfig::default(),
        );
        while flusher.flush_once().await > 0 {}
    }

    // ------------------------------------------------------------------
    // Scenarios.
    // ------------------------------------------------------------------

    #[tokio::test]
    async fn plain_turn_streams_finalizes_and_charges() {
        let provider = FakeProvider::new(vec![Script {
            events: vec![text("Hello"), text(" there"), stop(StopReason::EndTurn, 500, 200)],
            hang: false,
        }]);
        let h = harness(provider, dec!(1));
        let orch = Orchestrator::new(Arc::clone(&h.ctx), h.outbound.clone());

        orch.run_batch(vec![user_message(h.key, 100, "hi")])
            .await
            .unwrap();
        flush_writes(&h).await;

        // Draft streamed then finalized without the stop control.
        let log = h.outbound.entries();
        assert!(log[0].starts_with("send[true]:"));
        assert!(log.last().unwrap().contains("[false]:Hello there"));

        // Thread: user then assistant, with usage on the assistant row.
        let msgs = thread_messages(&h);
        assert_eq!(msgs.len(), 2);
        assert_eq!(msgs[0].role, Role::User);
        assert_eq!(msgs[1].role, Role::Assistant);
        assert_eq!(msgs[1].text, "Hello there");
        assert_eq!(msgs[1].usage.output, 200);

        // Charge: 500·3/1M + 200·15/1M at default sonnet pricing.
        assert_eq!(h.ctx.store.user_balance(2).unwrap(), dec!(0.9955));
        let ops = h.ctx.store.balance_history(2, 10).unwrap();
        assert_eq!(ops[0].kind, OpKind::Charge);
        assert_eq!(ops[0].amount, dec!(-0.0045));

        // Slot released.
        assert!(!h.ctx.tracker.is_active(&h.key));
    }

    #[tokio::test]
    async fn out_of_funds_rejects_pre_turn() {
        let provider = FakeProvider::new(vec![]);
        let h = harness(provider, Decimal::ZERO);
        let orch = Orchestrator::new(Arc::clone(&h.ctx), h.outbound.clone());

        orch.run_batch(vec![user_message(h.key, 100, "hi")])
            .await
            .unwrap();

        let log = h.outbound.entries();
        assert_eq!(log.len(), 1);
        assert!(log[0].contains("balance is empty"));
        // No LLM call was made (provider would have panicked).
    }

    #[tokio::test]
    async fn parallel_tools_pair_k_results_with_matching_ids() {
        let provider = FakeProvider::new(vec![
            Script {
                events: vec![
                    tool_use("tu_1", "echo"),
                    tool_use("tu_2", "echo"),
                    stop(StopReason::ToolUse, 100, 50),
                ],
                hang: false,
            },
            Script {
                events: vec![text("both done"), stop(StopReason::EndTurn, 150, 20)],
                hang: false,
            },
        ]);
        let h = harness(provider, dec!(1));
        let executions = Arc::new(Mutex::new(0));
        let exec_clone = Arc::clone(&executions);
        let orch = Orchestrator::with_tool_factory(
            Arc::clone(&h.ctx),
            h.outbound.clone(),
            move |_thread| {
                ToolSet::from_tools(vec![Arc::new(EchoTool {
                    executions: Arc::clone(&exec_clone),
                })])
            },
        );

        orch.run_batch(vec![user_message(h.key, 100, "do both")])
            .await
            .unwrap();
        flush_writes(&h).await;

        assert_eq!(*executions.lock().unwrap(), 2);

        let msgs = thread_messages(&h);
        // user, assistant(tool_use×2), user(tool_result×2), assistant final
        assert_eq!(msgs.len(), 4);
        let tool_blocks = msgs[1].content_blocks.as_ref().unwrap().as_array().unwrap();
        let use_ids: Vec<&str> = tool_blocks
            .iter()
            .filter(|b| b["type"] == "tool_use")
            .map(|b| b["id"].as_str().unwrap())
            .collect();
        assert_eq!(use_ids, vec!["tu_1", "tu_2"]);

        let result_blocks = msgs[2].content_blocks.as_ref().unwrap().as_array().unwrap();
        assert_eq!(result_blocks.len(), 2);
        let result_ids: Vec<&str> = result_blocks
            .iter()
            .map(|b| b["tool_use_id"].as_str().unwrap())
            .collect();
        assert_eq!(result_ids, use_ids);
        assert_eq!(msgs[3].text, "both done");
    }

    #[tokio::test]
    async fn unknown_tool_becomes_error_result_not_abort() {
        let provider = FakeProvider::new(vec![
            Script {
                events: vec![
                    tool_use("tu_1", "no_such_tool"),
                    stop(StopReason::ToolUse, 100, 10),
                ],
                hang: false,
            },
            Script {
                events: vec![text("recovered"), stop(StopReason::EndTurn, 120, 5)],
                hang: false,
            },
        ]);
        let h = harness(provider, dec!(1));
        let orch = Orchestrator::with_tool_factory(
            Arc::clone(&h.ctx),
            h.outbound.clone(),
            |_thread| ToolSet::from_tools(vec![]),
        );

        orch.run_batch(vec![user_message(h.key, 100, "go")])
            .await
            .unwrap();
        flush_writes(&h).await;

        let msgs = thread_messages(&h);
        let result_blocks = msgs[2].content_blocks.as_ref().unwrap().as_array().unwrap();
        assert_eq!(result_blocks[0]["is_error"], true);
        assert!(result_blocks[0]["content"]
            .as_str()
            .unwrap()
            .contains("unknown tool"));
        assert_eq!(msgs[3].text, "recovered");
    }

    #[tokio::test]
    async fn parallel_paid_calls_cannot_overdraw() {
        // Balance $0.05, three $0.134 calls staged in one turn: the first
        // is dispatched, the second and third are rejected pre-dispatch.
        let provider = FakeProvider::new(vec![
            Script {
                events: vec![
                    tool_use("tu_1", "make_image"),
                    tool_use("tu_2", "make_image"),
                    tool_use("tu_3", "make_image"),
                    stop(StopReason::ToolUse, 100, 30),
                ],
                hang: false,
            },
            Script {
                events: vec![
                    text("two generations were skipped"),
                    stop(StopReason::EndTurn, 0, 0),
                ],
                hang: false,
            },
        ]);
        let h = harness(provider, dec!(0.05));
        let executions = Arc::new(Mutex::new(0));
        let exec_clone = Arc::clone(&executions);
        let orch = Orchestrator::with_tool_factory(
            Arc::clone(&h.ctx),
            h.outbound.clone(),
            move |_thread| {
                ToolSet::from_tools(vec![Arc::new(FixedPricePaidTool {
                    executions: Arc::clone(&exec_clone),
                    price: dec!(0.134),
                })])
            },
        );

        orch.run_batch(vec![user_message(h.key, 100, "three cats")])
            .await
            .unwrap();
        flush_writes(&h).await;

        assert_eq!(*executions.lock().unwrap(), 1);

        let msgs = thread_messages(&h);
        let result_blocks = msgs[2].content_blocks.as_ref().unwrap().as_array().unwrap();
        assert_eq!(result_blocks.len(), 3);
        assert_eq!(result_blocks[0]["is_error"], false);
        assert_eq!(result_blocks[1]["is_error"], true);
        assert!(result_blocks[1]["content"]
            .as_str()
            .unwrap()
            .contains("insufficient balance"));
        assert_eq!(result_blocks[2]["is_error"], true);

        // Exactly one tool charge of −0.134; balance went negative only
        // through a recorded charge.
        let charges: Vec<_> = h
            .ctx
            .store
            .balance_history(2, 20)
            .unwrap()
            .into_iter()
            .filter(|op| op.kind == OpKind::Charge && op.amount == dec!(-0.134))
            .collect();
        assert_eq!(charges.len(), 1);
        assert_eq!(charges[0].balance_after, dec!(-0.084));
    }

    #[tokio::test]
    async fn force_turn_break_ends_loop_after_results() {
        let provider = FakeProvider::new(vec![Script {
            events: vec![
                text("here is the formula"),
                tool_use("tu_1", "deliver"),
                stop(StopReason::ToolUse, 100, 40),
            ],
            hang: false,
        }]);
        // Only one script: a second LLM call would panic the provider, so
        // this test also proves the loop stopped after the results.
        let h = harness(provider, dec!(1));
        let orch = Orchestrator::with_tool_factory(
            Arc::clone(&h.ctx),
            h.outbound.clone(),
            |_thread| ToolSet::from_tools(vec![Arc::new(SequentialDeliverTool)]),
        );

        orch.run_batch(vec![user_message(h.key, 100, "formula please")])
            .await
            .unwrap();
        flush_writes(&h).await;

        let msgs = thread_messages(&h);
        // user, assistant(tool_use), user(tool_result), assistant final
        assert_eq!(msgs.len(), 4);
        // The delivered file went out even though the upload to the file
        // store failed (no service configured): result flagged, not lost.
        let result_blocks = msgs[2].content_blocks.as_ref().unwrap().as_array().unwrap();
        assert!(result_blocks[0]["content"].as_str().unwrap().contains("delivered"));
    }

    #[tokio::test]
    async fn cancellation_finalizes_with_interrupted_and_charges_partial() {
        let provider = FakeProvider::new(vec![Script {
            events: vec![
                StreamEvent::MessageStart {
                    usage: TokenUsage {
                        input: 500,
                        ..Default::default()
                    },
                },
                text("essay paragraph one. "),
                text("essay paragraph two. "),
            ],
            hang: true,
        }]);
        let h = harness(provider, dec!(1));
        let orch = Arc::new(Orchestrator::new(Arc::clone(&h.ctx), h.outbound.clone()));

        let orch_task = Arc::clone(&orch);
        let key = h.key;
        let run = tokio::spawn(async move {
            orch_task
                .run_batch(vec![user_message(key, 100, "write an essay")])
                .await
        });

        // Let the stream make progress, then interrupt like a new message
        // arrival would.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(h.ctx.tracker.cancel(&h.key));
        run.await.unwrap().unwrap();
        flush_writes(&h).await;

        let msgs = thread_messages(&h);
        assert_eq!(msgs.len(), 2);
        assert!(msgs[1].text.contains("essay paragraph"));
        assert!(msgs[1].text.contains("[interrupted]"));

        // Final frontend content carries the interrupted marker.
        let log = h.outbound.entries();
        assert!(log.last().unwrap().contains("[interrupted]"));

        // Partial usage was still charged: input tokens from message_start
        // plus estimated output.
        let ops = h.ctx.store.balance_history(2, 10).unwrap();
        let charge = ops.iter().find(|op| op.kind == OpKind::Charge).unwrap();
        assert!(charge.amount < Decimal::ZERO);
        assert_eq!(charge.input_tokens, Some(500));

        assert!(!h.ctx.tracker.is_active(&h.key));
    }

    #[tokio::test]
    async fn max_tokens_surfaces_warning_without_looping() {
        let provider = FakeProvider::new(vec![Script {
            events: vec![text("partial answer"), stop(StopReason::MaxTokens, 100, 100)],
            hang: false,
        }]);
        let h = harness(provider, dec!(1));
        let orch = Orchestrator::new(Arc::clone(&h.ctx), h.outbound.clone());

        orch.run_batch(vec![user_message(h.key, 100, "long thing")])
            .await
            .unwrap();

        let log = h.outbound.entries();
        assert!(log.last().unwrap().contains("output limit"));
    }
}
