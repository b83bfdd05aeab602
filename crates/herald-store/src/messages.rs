//! Message repository. Rows are append-only; a frontend edit overwrites
//! text in place and stamps `edited_at`.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};

use herald_core::types::{Role, StoredMessage, TokenUsage};

use crate::db::Store;
use crate::error::{Result, StoreError};
use crate::users::parse_ts;

const MESSAGE_SELECT: &str = "SELECT id, chat_id, external_id, thread_id, role, text,
        caption, reply_to, media_group_id, attachments, content_blocks,
        input_tokens, output_tokens, cache_read_tokens, cache_write_tokens,
        thinking_tokens, created_at, edited_at FROM messages";

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<StoredMessage> {
    let role: String = row.get(4)?;
    let attachments: String = row.get(9)?;
    let blocks: Option<String> = row.get(10)?;
    let created: String = row.get(16)?;
    let edited: Option<String> = row.get(17)?;
    Ok(StoredMessage {
        id: row.get(0)?,
        chat_id: row.get(1)?,
        external_id: row.get(2)?,
        thread_id: row.get(3)?,
        role: role.parse().unwrap_or(Role::User),
        text: row.get(5)?,
        caption: row.get(6)?,
        reply_to: row.get(7)?,
        media_group_id: row.get(8)?,
        attachments: serde_json::from_str(&attachments).unwrap_or_default(),
        content_blocks: blocks.and_then(|b| serde_json::from_str(&b).ok()),
        usage: TokenUsage {
            input: row.get::<_, i64>(11)? as u32,
            output: row.get::<_, i64>(12)? as u32,
            cache_read: row.get::<_, i64>(13)? as u32,
            cache_write: row.get::<_, i64>(14)? as u32,
            thinking: row.get::<_, i64>(15)? as u32,
        },
        created_at: parse_ts(&created),
        edited_at: edited.map(|e| parse_ts(&e)),
    })
}

pub(crate) fn insert_message(conn: &Connection, msg: &StoredMessage) -> rusqlite::Result<usize> {
    conn.execute(
        "INSERT OR IGNORE INTO messages
         (id, chat_id, external_id, thread_id, role, text, caption, reply_to,
          media_group_id, attachments, content_blocks, input_tokens, output_tokens,
          cache_read_tokens, cache_write_tokens, thinking_tokens, created_at, edited_at)
         VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,?17,?18)",
        params![
            msg.id,
            msg.chat_id,
            msg.external_id,
            msg.thread_id,
            msg.role.as_str(),
            msg.text,
            msg.caption,
            msg.reply_to,
            msg.media_group_id,
            serde_json::to_string(&msg.attachments).unwrap_or_else(|_| "[]".into()),
            msg.content_blocks
                .as_ref()
                .map(|b| serde_json::to_string(b).unwrap_or_default()),
            msg.usage.input as i64,
            msg.usage.output as i64,
            msg.usage.cache_read as i64,
            msg.usage.cache_write as i64,
            msg.usage.thinking as i64,
            msg.created_at.to_rfc3339(),
            msg.edited_at.map(|e| e.to_rfc3339()),
        ],
    )
}

impl Store {
    /// Append a batch of messages in one transaction, preserving order.
    pub fn append_messages(&self, messages: &[StoredMessage]) -> Result<()> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        for msg in messages {
            insert_message(&tx, msg)?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Full history for a thread, oldest first. uuid v7 ids break
    /// created_at ties in insertion order.
    pub fn list_messages(&self, thread_id: &str) -> Result<Vec<StoredMessage>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt =
            conn.prepare(&format!("{MESSAGE_SELECT} WHERE thread_id = ?1 ORDER BY created_at, id"))?;
        let rows = stmt.query_map(params![thread_id], row_to_message)?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    /// Record the token usage the provider reported for an assistant turn.
    pub fn set_message_usage(&self, message_id: &str, usage: &TokenUsage) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE messages SET input_tokens = ?1, output_tokens = ?2,
                cache_read_tokens = ?3, cache_write_tokens = ?4, thinking_tokens = ?5
             WHERE id = ?6",
            params![
                usage.input as i64,
                usage.output as i64,
                usage.cache_read as i64,
                usage.cache_write as i64,
                usage.thinking as i64,
                message_id
            ],
        )?;
        Ok(())
    }

    /// Frontend edit: overwrite text in place, stamp edited_at.
    pub fn edit_message(
        &self,
        chat_id: i64,
        external_id: i64,
        text: &str,
        edited_at: DateTime<Utc>,
    ) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let n = conn.execute(
            "UPDATE messages SET text = ?1, edited_at = ?2
             WHERE chat_id = ?3 AND external_id = ?4",
            params![text, edited_at.to_rfc3339(), chat_id, external_id],
        )?;
        if n == 0 {
            return Err(StoreError::NotFound {
                what: "message",
                id: format!("{chat_id}/{external_id}"),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use herald_core::types::{Thread, ThreadKey};

    fn thread(store: &Store) -> Thread {
        store
            .get_or_create_thread(&ThreadKey::new(1, 2, None))
            .unwrap()
    }

    #[test]
    fn batch_append_preserves_order() {
        let store = Store::open_in_memory().unwrap();
        let t = thread(&store);
        let msgs: Vec<StoredMessage> = (0..3)
            .map(|i| StoredMessage::internal(&t, Role::User, format!("msg {i}")))
            .collect();
        store.append_messages(&msgs).unwrap();
        let listed = store.list_messages(&t.id).unwrap();
        assert_eq!(listed.len(), 3);
        for (i, m) in listed.iter().enumerate() {
            assert_eq!(m.text, format!("msg {i}"));
        }
    }

    #[test]
    fn duplicate_external_id_is_ignored() {
        let store = Store::open_in_memory().unwrap();
        let t = thread(&store);
        let mut a = StoredMessage::internal(&t, Role::User, "first");
        a.external_id = Some(100);
        let mut b = StoredMessage::internal(&t, Role::User, "dup delivery");
        b.external_id = Some(100);
        store.append_messages(&[a, b]).unwrap();
        assert_eq!(store.list_messages(&t.id).unwrap().len(), 1);
    }

    #[test]
    fn usage_update_sticks() {
        let store = Store::open_in_memory().unwrap();
        let t = thread(&store);
        let m = StoredMessage::internal(&t, Role::Assistant, "hi");
        store.append_messages(std::slice::from_ref(&m)).unwrap();
        store
            .set_message_usage(
                &m.id,
                &TokenUsage {
                    input: 10,
                    output: 20,
                    cache_read: 1,
                    cache_write: 2,
                    thinking: 3,
                },
            )
            .unwrap();
        let listed = store.list_messages(&t.id).unwrap();
        assert_eq!(listed[0].usage.output, 20);
        assert_eq!(listed[0].usage.thinking, 3);
    }

    #[test]
    fn edit_overwrites_in_place() {
        let store = Store::open_in_memory().unwrap();
        let t = thread(&store);
        let mut m = StoredMessage::internal(&t, Role::User, "old");
        m.external_id = Some(5);
        store.append_messages(std::slice::from_ref(&m)).unwrap();
        store.edit_message(t.chat_id, 5, "new", Utc::now()).unwrap();
        let listed = store.list_messages(&t.id).unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].text, "new");
        assert!(listed[0].edited_at.is_some());
    }
}
