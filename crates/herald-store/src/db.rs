use std::path::Path;
use std::sync::Mutex;

use rusqlite::Connection;
use rust_decimal::Decimal;

use crate::error::{Result, StoreError};

/// Thread-safe durable store over a single SQLite connection.
///
/// A `Mutex<Connection>` is sufficient for the single-node target; the
/// orchestrator never shares its lock hold across an await point, and
/// concurrently-executing tools take the lock for their own short
/// transactions independently.
pub struct Store {
    pub(crate) conn: Mutex<Connection>,
}

impl Store {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        init_db(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        init_db(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

/// Parse a canonical decimal string column.
pub(crate) fn parse_decimal(s: &str) -> Result<Decimal> {
    s.parse()
        .map_err(|_| StoreError::InvalidData(format!("bad decimal: {s}")))
}

/// Initialise all tables and indexes. Safe to call on every startup —
/// `IF NOT EXISTS` throughout.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS users (
            id                  INTEGER PRIMARY KEY,
            display_name        TEXT NOT NULL,
            preferred_model     TEXT,
            custom_personality  TEXT,
            balance             TEXT NOT NULL DEFAULT '0',
            is_premium          INTEGER NOT NULL DEFAULT 0,
            created_at          TEXT NOT NULL,
            updated_at          TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS chats (
            id        INTEGER PRIMARY KEY,
            kind      TEXT NOT NULL,
            title     TEXT,
            is_forum  INTEGER NOT NULL DEFAULT 0
        );

        CREATE TABLE IF NOT EXISTS threads (
            id             TEXT PRIMARY KEY,
            chat_id        INTEGER NOT NULL,
            user_id        INTEGER NOT NULL,
            topic_id       INTEGER NOT NULL DEFAULT 0,
            model_key      TEXT,
            system_prompt  TEXT,
            created_at     TEXT NOT NULL
        );
        CREATE UNIQUE INDEX IF NOT EXISTS idx_threads_triple
            ON threads(chat_id, user_id, topic_id);

        CREATE TABLE IF NOT EXISTS messages (
            id                  TEXT PRIMARY KEY,
            chat_id             INTEGER NOT NULL,
            external_id         INTEGER,
            thread_id           TEXT NOT NULL,
            role                TEXT NOT NULL,
            text                TEXT NOT NULL,
            caption             TEXT,
            reply_to            INTEGER,
            media_group_id      TEXT,
            attachments         TEXT NOT NULL DEFAULT '[]',
            content_blocks      TEXT,
            input_tokens        INTEGER NOT NULL DEFAULT 0,
            output_tokens       INTEGER NOT NULL DEFAULT 0,
            cache_read_tokens   INTEGER NOT NULL DEFAULT 0,
            cache_write_tokens  INTEGER NOT NULL DEFAULT 0,
            thinking_tokens     INTEGER NOT NULL DEFAULT 0,
            created_at          TEXT NOT NULL,
            edited_at           TEXT
        );
        CREATE UNIQUE INDEX IF NOT EXISTS idx_messages_external
            ON messages(chat_id, external_id) WHERE external_id IS NOT NULL;
        CREATE INDEX IF NOT EXISTS idx_messages_thread
            ON messages(thread_id, created_at);

        CREATE TABLE IF NOT EXISTS user_files (
            id                TEXT PRIMARY KEY,
            thread_id         TEXT NOT NULL,
            source_ref        TEXT,
            provider_file_id  TEXT NOT NULL,
            filename          TEXT NOT NULL,
            kind              TEXT NOT NULL,
            mime              TEXT NOT NULL,
            size              INTEGER NOT NULL,
            uploaded_at       TEXT NOT NULL,
            expires_at        TEXT NOT NULL,
            origin            TEXT NOT NULL,
            upload_context    TEXT,
            metadata          TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_user_files_thread
            ON user_files(thread_id, uploaded_at);
        CREATE INDEX IF NOT EXISTS idx_user_files_expiry
            ON user_files(expires_at);

        CREATE TABLE IF NOT EXISTS settings (
            key    TEXT PRIMARY KEY,
            value  TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS balance_operations (
            id                  TEXT PRIMARY KEY,
            user_id             INTEGER NOT NULL,
            kind                TEXT NOT NULL,
            amount              TEXT NOT NULL,
            balance_before      TEXT NOT NULL,
            balance_after       TEXT NOT NULL,
            description         TEXT NOT NULL,
            provider_charge_id  TEXT,
            message_ref         TEXT,
            input_tokens        INTEGER,
            output_tokens       INTEGER,
            created_at          TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_balance_ops_user
            ON balance_operations(user_id, created_at);",
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        init_db(&conn).unwrap();
        init_db(&conn).unwrap();
    }

    #[test]
    fn parse_decimal_rejects_garbage() {
        assert!(parse_decimal("1.25").is_ok());
        assert!(parse_decimal("not-a-number").is_err());
    }
}
