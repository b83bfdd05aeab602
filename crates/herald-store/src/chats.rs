//! Chat repository — chats only scope threads, nothing else hangs off them.

use rusqlite::params;

use herald_core::types::{Chat, ChatKind};

use crate::db::Store;
use crate::error::{Result, StoreError};

impl Store {
    pub fn upsert_chat(&self, chat: &Chat) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO chats (id, kind, title, is_forum) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(id) DO UPDATE SET
                kind = excluded.kind,
                title = excluded.title,
                is_forum = excluded.is_forum",
            params![chat.id, chat.kind.as_str(), chat.title, chat.is_forum as i64],
        )?;
        Ok(())
    }

    pub fn get_chat(&self, id: i64) -> Result<Option<Chat>> {
        let conn = self.conn.lock().unwrap();
        match conn.query_row(
            "SELECT id, kind, title, is_forum FROM chats WHERE id = ?1",
            params![id],
            |row| {
                let kind: String = row.get(1)?;
                Ok(Chat {
                    id: row.get(0)?,
                    kind: kind.parse().unwrap_or(ChatKind::Private),
                    title: row.get(2)?,
                    is_forum: row.get::<_, i64>(3)? != 0,
                })
            },
        ) {
            Ok(c) => Ok(Some(c)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(StoreError::Database(e)),
        }
    }
}
