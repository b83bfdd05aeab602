//! `Outbound` implementation over teloxide. One instance is scoped to a
//! thread's forum topic so drafts land in the right place.

use async_trait::async_trait;
use teloxide::prelude::*;
use teloxide::types::{InputFile, MessageId, ThreadId};

use herald_agent::outbound::Outbound;
use herald_core::{HeraldError, Result};

use crate::send;

/// Telegram's hard limit is 4096 chars; a small margin covers escaping.
const TEXT_LIMIT: usize = 4090;

pub struct TelegramOutbound {
    bot: Bot,
    topic_id: Option<ThreadId>,
}

impl TelegramOutbound {
    pub fn new(bot: Bot, topic_id: Option<i64>) -> Self {
        Self {
            bot,
            topic_id: topic_id.map(|t| ThreadId(MessageId(t as i32))),
        }
    }
}

#[async_trait]
impl Outbound for TelegramOutbound {
    async fn send_text(&self, chat_id: i64, text: &str, with_stop: bool) -> Result<i64> {
        let markup = with_stop.then(send::stop_markup);
        let id = send::send_message(&self.bot, ChatId(chat_id), self.topic_id, text, markup)
            .await
            .map_err(|e| HeraldError::Frontend(e.to_string()))?;
        Ok(i64::from(id.0))
    }

    async fn edit_text(
        &self,
        chat_id: i64,
        message_id: i64,
        text: &str,
        with_stop: bool,
    ) -> Result<()> {
        let markup = with_stop.then(send::stop_markup);
        send::edit_message(
            &self.bot,
            ChatId(chat_id),
            MessageId(message_id as i32),
            text,
            markup,
        )
        .await
        .map_err(|e| HeraldError::Frontend(e.to_string()))
    }

    async fn delete_message(&self, chat_id: i64, message_id: i64) -> Result<()> {
        self.bot
            .delete_message(ChatId(chat_id), MessageId(message_id as i32))
            .await
            .map_err(|e| HeraldError::Frontend(e.to_string()))?;
        Ok(())
    }

    async fn send_file(
        &self,
        chat_id: i64,
        filename: &str,
        mime: &str,
        bytes: Vec<u8>,
        caption: Option<&str>,
    ) -> Result<i64> {
        let input = InputFile::memory(bytes).file_name(filename.to_string());
        let id = if mime.starts_with("image/") {
            let mut req = self.bot.send_photo(ChatId(chat_id), input);
            if let Some(topic) = self.topic_id {
                req = req.message_thread_id(topic);
            }
            if let Some(caption) = caption {
                req = req.caption(caption.to_string());
            }
            req.await
                .map_err(|e| HeraldError::Frontend(e.to_string()))?
                .id
        } else {
            let mut req = self.bot.send_document(ChatId(chat_id), input);
            if let Some(topic) = self.topic_id {
                req = req.message_thread_id(topic);
            }
            if let Some(caption) = caption {
                req = req.caption(caption.to_string());
            }
            req.await
                .map_err(|e| HeraldError::Frontend(e.to_string()))?
                .id
        };
        Ok(i64::from(id.0))
    }

    fn text_limit(&self) -> usize {
        TEXT_LIMIT
    }
}
