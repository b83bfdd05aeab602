//! Write-behind queue items.
//!
//! Non-financial writes (messages, file metadata, token counts, chat
//! upserts) ride this queue from the cache to the durable store. Balance
//! operations never do — they are written synchronously by `herald-store`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use herald_core::types::{Chat, StoredMessage, TokenUsage, UserFile};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WriteOp {
    Message(StoredMessage),
    MessageEdit {
        chat_id: i64,
        external_id: i64,
        text: String,
        edited_at: DateTime<Utc>,
    },
    TokenUpdate {
        message_id: String,
        usage: TokenUsage,
    },
    File(UserFile),
    FileDelete {
        file_id: String,
    },
    ChatUpsert(Chat),
}

impl WriteOp {
    /// Grouping key for batched flushes — one transaction per kind.
    pub fn kind(&self) -> &'static str {
        match self {
            WriteOp::Message(_) => "message",
            WriteOp::MessageEdit { .. } => "message_edit",
            WriteOp::TokenUpdate { .. } => "token_update",
            WriteOp::File(_) => "file",
            WriteOp::FileDelete { .. } => "file_delete",
            WriteOp::ChatUpsert(_) => "chat_upsert",
        }
    }
}

/// Envelope on the queue: the op plus bookkeeping for bounded retries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueItem {
    pub op: WriteOp,
    pub queued_at: DateTime<Utc>,
    #[serde(default)]
    pub attempts: u32,
}

impl QueueItem {
    pub fn new(op: WriteOp) -> Self {
        Self {
            op,
            queued_at: Utc::now(),
            attempts: 0,
        }
    }
}
