//! Thread repository — one thread per (chat, user, topic) triple.

use chrono::Utc;
use rusqlite::params;
use uuid::Uuid;

use herald_core::types::{Thread, ThreadKey};

use crate::db::Store;
use crate::error::{Result, StoreError};
use crate::users::parse_ts;

const THREAD_SELECT: &str = "SELECT id, chat_id, user_id, topic_id, model_key,
        system_prompt, created_at FROM threads";

fn row_to_thread(row: &rusqlite::Row<'_>) -> rusqlite::Result<Thread> {
    let topic: i64 = row.get(3)?;
    let created: String = row.get(6)?;
    Ok(Thread {
        id: row.get(0)?,
        chat_id: row.get(1)?,
        user_id: row.get(2)?,
        topic_id: if topic == 0 { None } else { Some(topic) },
        model_key: row.get(4)?,
        system_prompt: row.get(5)?,
        created_at: parse_ts(&created),
    })
}

impl Store {
    /// Return the thread for a triple, creating it if absent. INSERT OR
    /// IGNORE + read-back handles two callers racing on first contact.
    pub fn get_or_create_thread(&self, key: &ThreadKey) -> Result<Thread> {
        let topic = key.topic_id.unwrap_or(0);
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR IGNORE INTO threads (id, chat_id, user_id, topic_id, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                Uuid::now_v7().to_string(),
                key.chat_id,
                key.user_id,
                topic,
                Utc::now().to_rfc3339()
            ],
        )?;
        conn.query_row(
            &format!("{THREAD_SELECT} WHERE chat_id = ?1 AND user_id = ?2 AND topic_id = ?3"),
            params![key.chat_id, key.user_id, topic],
            row_to_thread,
        )
        .map_err(StoreError::Database)
    }

    pub fn get_thread(&self, id: &str) -> Result<Option<Thread>> {
        let conn = self.conn.lock().unwrap();
        match conn.query_row(
            &format!("{THREAD_SELECT} WHERE id = ?1"),
            params![id],
            row_to_thread,
        ) {
            Ok(t) => Ok(Some(t)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(StoreError::Database(e)),
        }
    }

    pub fn set_thread_model(&self, id: &str, model_key: Option<&str>) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let n = conn.execute(
            "UPDATE threads SET model_key = ?1 WHERE id = ?2",
            params![model_key, id],
        )?;
        if n == 0 {
            return Err(StoreError::NotFound {
                what: "thread",
                id: id.to_string(),
            });
        }
        Ok(())
    }

    pub fn set_thread_system_prompt(&self, id: &str, prompt: Option<&str>) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let n = conn.execute(
            "UPDATE threads SET system_prompt = ?1 WHERE id = ?2",
            params![prompt, id],
        )?;
        if n == 0 {
            return Err(StoreError::NotFound {
                what: "thread",
                id: id.to_string(),
            });
        }
        Ok(())
    }
}
