//! Ingress normalizer: raw Telegram events → `ProcessedMessage`.
//!
//! All racy I/O (media download, file-store upload, voice transcription)
//! completes here, before the message enters the batch queue — the turn
//! code downstream never waits on file availability.

use std::sync::Arc;

use chrono::Utc;
use teloxide::net::Download;
use teloxide::prelude::*;
use tracing::{debug, warn};
use uuid::Uuid;

use herald_agent::runtime::AgentContext;
use herald_cache::{QueueItem, WriteOp};
use herald_core::types::{
    Chat as HeraldChat, ChatKind, FileKind, FileOrigin, ProcessedMessage, ThreadKey, UserFile,
};
use herald_core::{HeraldError, Result};

/// One media item pulled off an incoming message.
struct IncomingMedia {
    source_ref: String,
    filename: String,
    mime: String,
    declared_size: u64,
    is_voice_note: bool,
}

/// Normalize one incoming message. Returns `None` for events with nothing
/// to forward (no text and no supported media).
pub async fn normalize(
    bot: &Bot,
    ctx: &Arc<AgentContext>,
    msg: &Message,
) -> Result<Option<ProcessedMessage>> {
    let Some(from) = msg.from.as_ref() else {
        return Ok(None);
    };
    let is_premium = from.is_premium;
    let display_name = from.full_name();
    let user_id = from.id.0 as i64;
    let chat_id = msg.chat.id.0;
    let topic_id = msg.thread_id.map(|t| i64::from(t.0 .0));
    let key = ThreadKey::new(chat_id, user_id, topic_id);

    // Resolve user / chat / thread, cache-first with store back-fill.
    let user = match ctx.cache.get_user(user_id).await {
        Some(user) => user,
        None => {
            let user = ctx
                .store
                .upsert_user(user_id, &display_name, is_premium)
                .map_err(|e| HeraldError::Database(e.to_string()))?;
            ctx.cache.put_user(&user).await;
            user
        }
    };

    ctx.cache
        .push_write(QueueItem::new(WriteOp::ChatUpsert(HeraldChat {
            id: chat_id,
            kind: chat_kind(msg),
            title: msg.chat.title().map(str::to_string),
            is_forum: msg.thread_id.is_some(),
        })))
        .await;

    let thread = match ctx.cache.get_thread(&key).await {
        Some(thread) => thread,
        None => {
            let thread = ctx
                .store
                .get_or_create_thread(&key)
                .map_err(|e| HeraldError::Database(e.to_string()))?;
            ctx.cache.put_thread(&thread).await;
            thread
        }
    };

    let text = msg.text().unwrap_or("").to_string();
    let caption = msg.caption().map(str::to_string);
    let media = extract_media(msg);

    if text.is_empty() && caption.is_none() && media.is_none() {
        return Ok(None);
    }

    let limit = if user.is_premium {
        ctx.config.telegram.premium_upload_limit_bytes
    } else {
        ctx.config.telegram.upload_limit_bytes
    };

    let mut files: Vec<UserFile> = Vec::new();
    let mut final_text = text.clone();
    let mut transcription_failed = false;
    let accompanying = if !text.is_empty() {
        Some(text.clone())
    } else {
        caption.clone()
    };

    if let Some(media) = media {
        if media.declared_size > limit {
            return Err(HeraldError::PayloadTooLarge {
                size: media.declared_size,
                max: limit,
            });
        }

        let bytes = download(bot, &media.source_ref).await?;
        if bytes.len() as u64 > limit {
            return Err(HeraldError::PayloadTooLarge {
                size: bytes.len() as u64,
                max: limit,
            });
        }

        if media.is_voice_note {
            // Voice and video notes are transcribed synchronously; the
            // transcript replaces the body and no UserFile is created.
            match ctx
                .transcriber
                .transcribe(&media.filename, &media.mime, bytes)
                .await
            {
                Ok(t) => {
                    if !final_text.is_empty() {
                        final_text.push_str("\n\n");
                    }
                    final_text.push_str(&t.text);
                    let minutes = rust_decimal::Decimal::from_f64_retain(
                        t.duration_seconds / 60.0,
                    )
                    .unwrap_or_default();
                    let cost = (minutes * ctx.config.pricing.transcription_per_minute).round_dp(6);
                    if cost > rust_decimal::Decimal::ZERO {
                        if let Err(e) = ctx
                            .gate
                            .charge(user_id, cost, "voice transcription", None, None)
                            .await
                        {
                            warn!(error = %e, "voice transcription charge failed");
                        }
                    }
                }
                Err(e) => {
                    warn!(error = %e, "voice transcription failed, forwarding anyway");
                    transcription_failed = true;
                }
            }
        } else {
            let uploaded = ctx
                .files
                .upload(&media.filename, &media.mime, bytes.clone())
                .await?;
            let now = Utc::now();
            let file = UserFile {
                id: Uuid::now_v7().to_string(),
                thread_id: thread.id.clone(),
                source_ref: Some(media.source_ref.clone()),
                provider_file_id: uploaded.id,
                filename: media.filename.clone(),
                kind: FileKind::from_mime(&media.mime),
                mime: media.mime.clone(),
                size: bytes.len() as i64,
                uploaded_at: now,
                expires_at: now + chrono::Duration::hours(ctx.config.anthropic.files_ttl_hours),
                origin: FileOrigin::User,
                upload_context: accompanying.clone(),
                metadata: None,
            };
            // Cache list first so the very next turn's manifest sees it.
            ctx.cache.add_file(&file).await;
            ctx.cache
                .push_write(QueueItem::new(WriteOp::File(file.clone())))
                .await;
            debug!(file = %file.filename, "ingress: media uploaded");
            files.push(file);
        }
    }

    Ok(Some(ProcessedMessage {
        key,
        external_id: i64::from(msg.id.0),
        text: final_text,
        caption,
        reply_to: msg.reply_to_message().map(|r| i64::from(r.id.0)),
        media_group_id: msg.media_group_id().map(str::to_string),
        files,
        upload_context: accompanying,
        transcription_failed,
        date: msg.date,
    }))
}

fn chat_kind(msg: &Message) -> ChatKind {
    if msg.chat.is_private() {
        ChatKind::Private
    } else if msg.chat.is_group() {
        ChatKind::Group
    } else if msg.chat.is_supergroup() {
        ChatKind::Supergroup
    } else {
        ChatKind::Channel
    }
}

/// Pick the (single) media body off a message. Photos use the largest
/// rendition; stickers and other exotic kinds are ignored.
fn extract_media(msg: &Message) -> Option<IncomingMedia> {
    if let Some(photos) = msg.photo() {
        let photo = photos.last()?;
        return Some(IncomingMedia {
            source_ref: photo.file.id.clone(),
            filename: "photo.jpg".to_string(),
            mime: "image/jpeg".to_string(),
            declared_size: u64::from(photo.file.size),
            is_voice_note: false,
        });
    }
    if let Some(doc) = msg.document() {
        return Some(IncomingMedia {
            source_ref: doc.file.id.clone(),
            filename: doc
                .file_name
                .clone()
                .unwrap_or_else(|| "document".to_string()),
            mime: doc
                .mime_type
                .as_ref()
                .map(|m| m.to_string())
                .unwrap_or_else(|| "application/octet-stream".to_string()),
            declared_size: u64::from(doc.file.size),
            is_voice_note: false,
        });
    }
    if let Some(voice) = msg.voice() {
        return Some(IncomingMedia {
            source_ref: voice.file.id.clone(),
            filename: "voice.ogg".to_string(),
            mime: "audio/ogg".to_string(),
            declared_size: u64::from(voice.file.size),
            is_voice_note: true,
        });
    }
    if let Some(note) = msg.video_note() {
        return Some(IncomingMedia {
            source_ref: note.file.id.clone(),
            filename: "video_note.mp4".to_string(),
            mime: "video/mp4".to_string(),
            declared_size: u64::from(note.file.size),
            is_voice_note: true,
        });
    }
    if let Some(audio) = msg.audio() {
        return Some(IncomingMedia {
            source_ref: audio.file.id.clone(),
            filename: audio
                .file_name
                .clone()
                .unwrap_or_else(|| "audio.mp3".to_string()),
            mime: audio
                .mime_type
                .as_ref()
                .map(|m| m.to_string())
                .unwrap_or_else(|| "audio/mpeg".to_string()),
            declared_size: u64::from(audio.file.size),
            is_voice_note: false,
        });
    }
    if let Some(video) = msg.video() {
        return Some(IncomingMedia {
            source_ref: video.file.id.clone(),
            filename: video
                .file_name
                .clone()
                .unwrap_or_else(|| "video.mp4".to_string()),
            mime: video
                .mime_type
                .as_ref()
                .map(|m| m.to_string())
                .unwrap_or_else(|| "video/mp4".to_string()),
            declared_size: u64::from(video.file.size),
            is_voice_note: false,
        });
    }
    None
}

async fn download(bot: &Bot, file_id: &str) -> Result<Vec<u8>> {
    let file = bot
        .get_file(file_id)
        .await
        .map_err(|e| HeraldError::Frontend(format!("get_file failed: {e}")))?;
    let mut buf: Vec<u8> = Vec::new();
    bot.download_file(&file.path, &mut buf)
        .await
        .map_err(|e| HeraldError::Frontend(format!("download failed: {e}")))?;
    Ok(buf)
}
