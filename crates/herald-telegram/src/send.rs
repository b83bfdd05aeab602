//! Sending helpers: MarkdownV2-with-plain-fallback.
//!
//! Telegram rejects messages whose MarkdownV2 fails to parse; model output
//! is markdown-ish but not reliably well-formed, so every send and edit
//! falls back to plain text on a parse rejection.

use teloxide::prelude::*;
use teloxide::types::{InlineKeyboardButton, InlineKeyboardMarkup, MessageId, ParseMode, ThreadId};
use tracing::warn;

/// Callback payload carried by the stop control.
pub const STOP_CALLBACK: &str = "herald:stop";

/// Escape special characters for Telegram MarkdownV2.
///
/// MarkdownV2 requires escaping: `_ * [ ] ( ) ~ ` # + - = | { } . !`
pub fn escape_markdown_v2(text: &str) -> String {
    let mut out = String::with_capacity(text.len() + 16);
    for ch in text.chars() {
        match ch {
            '_' | '*' | '[' | ']' | '(' | ')' | '~' | '`' | '#' | '+' | '-' | '=' | '|' | '{'
            | '}' | '.' | '!' => {
                out.push('\\');
                out.push(ch);
            }
            _ => out.push(ch),
        }
    }
    out
}

pub fn stop_markup() -> InlineKeyboardMarkup {
    InlineKeyboardMarkup::new([[InlineKeyboardButton::callback("⏹ stop", STOP_CALLBACK)]])
}

/// Send one message, MarkdownV2 first, plain fallback. Returns the sent
/// message id.
pub async fn send_message(
    bot: &Bot,
    chat_id: ChatId,
    topic_id: Option<ThreadId>,
    text: &str,
    markup: Option<InlineKeyboardMarkup>,
) -> Result<MessageId, teloxide::RequestError> {
    let mut req = bot
        .send_message(chat_id, text)
        .parse_mode(ParseMode::MarkdownV2);
    if let Some(topic) = topic_id {
        req = req.message_thread_id(topic);
    }
    if let Some(markup) = markup.clone() {
        req = req.reply_markup(markup);
    }
    match req.await {
        Ok(msg) => Ok(msg.id),
        Err(_) => {
            // Parse mode rejected — retry plain.
            let mut req = bot.send_message(chat_id, text);
            if let Some(topic) = topic_id {
                req = req.message_thread_id(topic);
            }
            if let Some(markup) = markup {
                req = req.reply_markup(markup);
            }
            Ok(req.await?.id)
        }
    }
}

/// Edit one message, MarkdownV2 first, plain fallback. A "message is not
/// modified" rejection is not an error.
pub async fn edit_message(
    bot: &Bot,
    chat_id: ChatId,
    message_id: MessageId,
    text: &str,
    markup: Option<InlineKeyboardMarkup>,
) -> Result<(), teloxide::RequestError> {
    let mut req = bot
        .edit_message_text(chat_id, message_id, text)
        .parse_mode(ParseMode::MarkdownV2);
    if let Some(markup) = markup.clone() {
        req = req.reply_markup(markup);
    }
    if req.await.is_ok() {
        return Ok(());
    }

    let mut req = bot.edit_message_text(chat_id, message_id, text);
    if let Some(markup) = markup {
        req = req.reply_markup(markup);
    }
    match req.await {
        Ok(_) => Ok(()),
        Err(e) if e.to_string().contains("message is not modified") => Ok(()),
        Err(e) => {
            warn!(error = %e, "telegram edit failed");
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escapes_all_reserved_characters() {
        assert_eq!(escape_markdown_v2("a.b!c"), "a\\.b\\!c");
        assert_eq!(escape_markdown_v2("x*y_z"), "x\\*y\\_z");
        assert_eq!(escape_markdown_v2("plain text"), "plain text");
    }

    #[test]
    fn stop_markup_has_single_button() {
        let markup = stop_markup();
        assert_eq!(markup.inline_keyboard.len(), 1);
        assert_eq!(markup.inline_keyboard[0].len(), 1);
    }
}
