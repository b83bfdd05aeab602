//! Draft manager: one continuously-edited frontend message per turn.
//!
//! The first update flushes immediately (time-to-first-token matters);
//! later updates are rate-limited and coalesce — a skipped update is
//! carried by the next one, and finalize always sends the final state.
//! Finalize splits over-long content into a linked chunk sequence; only
//! the last chunk stays editable.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::warn;

use herald_core::Result;

use crate::outbound::Outbound;

pub struct Draft {
    outbound: Arc<dyn Outbound>,
    chat_id: i64,
    message_id: Option<i64>,
    min_interval: Duration,
    last_edit: Option<Instant>,
    last_sent: String,
    finalized: bool,
}

impl Draft {
    pub fn new(outbound: Arc<dyn Outbound>, chat_id: i64, min_interval: Duration) -> Self {
        Self {
            outbound,
            chat_id,
            message_id: None,
            min_interval,
            last_edit: None,
            last_sent: String::new(),
            finalized: false,
        }
    }

    /// Frontend id of the draft message, once the first flush happened.
    pub fn message_id(&self) -> Option<i64> {
        self.message_id
    }

    /// Throttled update. The first call sends the draft message with the
    /// stop control attached; subsequent calls edit it at most once per
    /// `min_interval`. Frontend errors are logged, never propagated — a
    /// missed edit only delays the display.
    pub async fn update(&mut self, content: &str) {
        if self.finalized || content.is_empty() || content == self.last_sent {
            return;
        }

        match self.message_id {
            None => {
                match self
                    .outbound
                    .send_text(self.chat_id, content, true)
                    .await
                {
                    Ok(id) => {
                        self.message_id = Some(id);
                        self.last_edit = Some(Instant::now());
                        self.last_sent = content.to_string();
                    }
                    Err(e) => warn!(error = %e, "draft: initial send failed"),
                }
            }
            Some(id) => {
                let due = self
                    .last_edit
                    .map(|at| at.elapsed() >= self.min_interval)
                    .unwrap_or(true);
                if !due {
                    return; // coalesce; the next update or finalize carries it
                }
                match self
                    .outbound
                    .edit_text(self.chat_id, id, content, true)
                    .await
                {
                    Ok(()) => {
                        self.last_edit = Some(Instant::now());
                        self.last_sent = content.to_string();
                    }
                    Err(e) => warn!(error = %e, "draft: edit failed"),
                }
            }
        }
    }

    /// Send the final content exactly once, stop control removed.
    /// Over-long content is split; chunks after the first are sent as new
    /// messages. Returns the id of the last (still editable) message.
    pub async fn finalize(&mut self, content: &str) -> Result<Option<i64>> {
        if self.finalized {
            return Ok(self.message_id);
        }
        self.finalized = true;

        let content = if content.is_empty() { "…" } else { content };
        let chunks = split_chunks(content, self.outbound.text_limit());

        let mut last_id = self.message_id;
        for (i, chunk) in chunks.iter().enumerate() {
            if i == 0 {
                match self.message_id {
                    Some(id) => {
                        self.outbound
                            .edit_text(self.chat_id, id, chunk, false)
                            .await?;
                        last_id = Some(id);
                    }
                    None => {
                        let id = self.outbound.send_text(self.chat_id, chunk, false).await?;
                        self.message_id = Some(id);
                        last_id = Some(id);
                    }
                }
            } else {
                let id = self.outbound.send_text(self.chat_id, chunk, false).await?;
                last_id = Some(id);
            }
        }
        Ok(last_id)
    }
}

/// Code-fence-aware splitter. When a split lands inside a fenced block the
/// fence is closed before the boundary and reopened in the next chunk.
pub fn split_chunks(text: &str, limit: usize) -> Vec<String> {
    if text.len() <= limit {
        return vec![text.to_string()];
    }

    let mut chunks: Vec<String> = Vec::new();
    let mut current = String::new();
    let mut fence_lang: Option<String> = None;

    for line in text.split('\n') {
        let cost = if current.is_empty() {
            line.len()
        } else {
            1 + line.len()
        };

        if !current.is_empty() && current.len() + cost > limit {
            if fence_lang.is_some() {
                current.push_str("\n```");
            }
            chunks.push(current);
            current = String::new();
            if let Some(lang) = &fence_lang {
                current.push_str("```");
                current.push_str(lang);
                current.push('\n');
            }
        }

        if !current.is_empty() {
            current.push('\n');
        }
        current.push_str(line);

        let trimmed = line.trim_start();
        if let Some(after) = trimmed.strip_prefix("```") {
            if fence_lang.is_some() {
                fence_lang = None;
            } else {
                fence_lang = Some(after.trim().to_string());
            }
        }
    }
    if !current.is_empty() {
        chunks.push(current);
    }

    // Force-split any chunk that still exceeds the limit (single huge line).
    let mut result = Vec::new();
    for chunk in chunks {
        if chunk.len() <= limit {
            result.push(chunk);
            continue;
        }
        let mut remaining = chunk.as_str();
        while remaining.len() > limit {
            let split_at = remaining[..limit]
                .rfind('\n')
                .or_else(|| remaining[..limit].rfind(' '))
                .unwrap_or(limit);
            result.push(remaining[..split_at].to_string());
            remaining = remaining[split_at..].trim_start();
        }
        if !remaining.is_empty() {
            result.push(remaining.to_string());
        }
    }
    result
}
