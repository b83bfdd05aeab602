//! Message and callback handlers registered in the teloxide Dispatcher.

use std::sync::Arc;

use teloxide::prelude::*;
use tracing::{debug, warn};

use herald_agent::runtime::AgentContext;
use herald_cache::{QueueItem, WriteOp};
use herald_core::types::ThreadKey;
use herald_core::HeraldError;

use crate::batcher::Batcher;
use crate::commands;
use crate::ingress;
use crate::send;

/// Runs for every incoming `Message`:
/// 1. Bot-message filter
/// 2. Command interception
/// 3. Ingress normalization (downloads, uploads, transcription)
/// 4. Batcher hand-off
pub async fn handle_message(
    bot: Bot,
    msg: Message,
    ctx: Arc<AgentContext>,
    batcher: Arc<Batcher>,
) -> ResponseResult<()> {
    let Some(from) = msg.from.as_ref() else {
        return Ok(());
    };
    if from.is_bot {
        return Ok(());
    }

    let key = ThreadKey::new(
        msg.chat.id.0,
        from.id.0 as i64,
        msg.thread_id.map(|t| i64::from(t.0 .0)),
    );

    if let Some(text) = msg.text() {
        // Commands answer inline and never reach the agent. The user row
        // must exist first so /balance works on first contact.
        if text.starts_with('/') {
            let _ = ctx
                .store
                .upsert_user(key.user_id, &from.full_name(), from.is_premium);
            if let Some(reply) = commands::handle(&ctx, key, key.user_id, text).await {
                let topic = msg.thread_id;
                let _ = send::send_message(&bot, msg.chat.id, topic, &reply, None).await;
                return Ok(());
            }
        }
    }

    match ingress::normalize(&bot, &ctx, &msg).await {
        Ok(Some(pm)) => {
            debug!(%key, "message normalized, enqueueing");
            batcher.enqueue(pm).await;
        }
        Ok(None) => {}
        Err(HeraldError::PayloadTooLarge { size, max }) => {
            let mb = max / (1024 * 1024);
            let reply = format!(
                "That file is too large ({size} bytes). The limit for your account is {mb} MiB."
            );
            let _ = send::send_message(&bot, msg.chat.id, msg.thread_id, &reply, None).await;
        }
        Err(e) => {
            warn!(%key, error = %e, "ingress failed");
            let _ = send::send_message(
                &bot,
                msg.chat.id,
                msg.thread_id,
                "Something went wrong handling that message. Please try again.",
                None,
            )
            .await;
        }
    }
    Ok(())
}

/// An edit to the latest user message updates the stored row in place and
/// stamps `edited_at`; edits to older messages are ignored by the agent.
pub async fn handle_edited_message(
    msg: Message,
    ctx: Arc<AgentContext>,
) -> ResponseResult<()> {
    let Some(text) = msg.text().or(msg.caption()) else {
        return Ok(());
    };
    ctx.cache
        .push_write(QueueItem::new(WriteOp::MessageEdit {
            chat_id: msg.chat.id.0,
            external_id: i64::from(msg.id.0),
            text: text.to_string(),
            edited_at: chrono::Utc::now(),
        }))
        .await;
    Ok(())
}

/// Stop-control activations: cancel the generation and toast back.
pub async fn handle_callback(
    bot: Bot,
    query: CallbackQuery,
    ctx: Arc<AgentContext>,
) -> ResponseResult<()> {
    if query.data.as_deref() != Some(send::STOP_CALLBACK) {
        return Ok(());
    }
    let toast = match query.message.as_ref().and_then(|m| m.regular_message()) {
        Some(message) => {
            let key = ThreadKey::new(
                message.chat.id.0,
                query.from.id.0 as i64,
                message.thread_id.map(|t| i64::from(t.0 .0)),
            );
            if ctx.tracker.cancel(&key) {
                "Stopping…"
            } else {
                "Nothing to stop."
            }
        }
        None => "Nothing to stop.",
    };
    bot.answer_callback_query(query.id.clone())
        .text(toast)
        .await?;
    Ok(())
}
