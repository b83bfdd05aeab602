//! Synchronous token estimation for context budgeting.
//!
//! Heuristic: ~4 bytes per token for mixed prose/code, plus fixed
//! overheads per message and per content block. Intentionally rounds up —
//! the 10% safety buffer in the context budget assumes the estimate never
//! undershoots by much.

use herald_core::types::StoredMessage;

/// Fixed cost of message framing (role, block wrappers).
const PER_MESSAGE_OVERHEAD: u32 = 8;
/// A referenced file block costs roughly this much regardless of size.
const PER_ATTACHMENT_OVERHEAD: u32 = 1600;

pub fn estimate_text(text: &str) -> u32 {
    (text.len() as u32).div_ceil(4)
}

pub fn estimate_message(msg: &StoredMessage) -> u32 {
    let mut total = PER_MESSAGE_OVERHEAD + estimate_text(&msg.text);
    if let Some(caption) = &msg.caption {
        total += estimate_text(caption);
    }
    total += msg.attachments.len() as u32 * PER_ATTACHMENT_OVERHEAD;
    if let Some(blocks) = &msg.content_blocks {
        // Raw blocks (tool_use/tool_result/thinking) count by serialized size.
        total += estimate_text(&blocks.to_string());
    }
    total
}

#[cfg(test)]
mod tests {
    use super::*;
    use herald_core::types::{Role, Thread};

    fn thread() -> Thread {
        Thread {
            id: "t".into(),
            chat_id: 1,
            user_id: 2,
            topic_id: None,
            model_key: None,
            system_prompt: None,
            created_at: chrono::Utc::now(),
        }
    }

    #[test]
    fn four_bytes_per_token_rounded_up() {
        assert_eq!(estimate_text(""), 0);
        assert_eq!(estimate_text("abcd"), 1);
        assert_eq!(estimate_text("abcde"), 2);
    }

    #[test]
    fn message_estimate_includes_overheads() {
        let t = thread();
        let msg = StoredMessage::internal(&t, Role::User, "hello world!");
        let base = estimate_message(&msg);
        assert!(base >= PER_MESSAGE_OVERHEAD + 3);

        let mut with_attachment = msg.clone();
        with_attachment.attachments.push(herald_core::types::Attachment {
            file_id: "f".into(),
            provider_file_id: "pf".into(),
            kind: herald_core::types::FileKind::Image,
            filename: "a.png".into(),
            mime: "image/png".into(),
            size: 1,
        });
        assert_eq!(estimate_message(&with_attachment), base + PER_ATTACHMENT_OVERHEAD);
    }
}
