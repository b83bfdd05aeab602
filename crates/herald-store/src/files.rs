//! UserFile repository, including the expiry queries the TTL cleaner uses.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};

use herald_core::types::{FileKind, FileOrigin, UserFile};

use crate::db::Store;
use crate::error::{Result, StoreError};
use crate::users::parse_ts;

const FILE_SELECT: &str = "SELECT id, thread_id, source_ref, provider_file_id, filename,
        kind, mime, size, uploaded_at, expires_at, origin, upload_context, metadata
        FROM user_files";

fn row_to_file(row: &rusqlite::Row<'_>) -> rusqlite::Result<UserFile> {
    let kind: String = row.get(5)?;
    let origin: String = row.get(10)?;
    let uploaded: String = row.get(8)?;
    let expires: String = row.get(9)?;
    let metadata: Option<String> = row.get(12)?;
    Ok(UserFile {
        id: row.get(0)?,
        thread_id: row.get(1)?,
        source_ref: row.get(2)?,
        provider_file_id: row.get(3)?,
        filename: row.get(4)?,
        kind: kind.parse().unwrap_or(FileKind::Document),
        mime: row.get(6)?,
        size: row.get(7)?,
        uploaded_at: parse_ts(&uploaded),
        expires_at: parse_ts(&expires),
        origin: origin.parse().unwrap_or(FileOrigin::User),
        upload_context: row.get(11)?,
        metadata: metadata.and_then(|m| serde_json::from_str(&m).ok()),
    })
}

pub(crate) fn insert_file(conn: &Connection, file: &UserFile) -> rusqlite::Result<usize> {
    conn.execute(
        "INSERT OR REPLACE INTO user_files
         (id, thread_id, source_ref, provider_file_id, filename, kind, mime, size,
          uploaded_at, expires_at, origin, upload_context, metadata)
         VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13)",
        params![
            file.id,
            file.thread_id,
            file.source_ref,
            file.provider_file_id,
            file.filename,
            file.kind.as_str(),
            file.mime,
            file.size,
            file.uploaded_at.to_rfc3339(),
            file.expires_at.to_rfc3339(),
            file.origin.as_str(),
            file.upload_context,
            file.metadata
                .as_ref()
                .map(|m| serde_json::to_string(m).unwrap_or_default()),
        ],
    )
}

impl Store {
    pub fn insert_user_file(&self, file: &UserFile) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        insert_file(&conn, file)?;
        Ok(())
    }

    pub fn list_thread_files(&self, thread_id: &str) -> Result<Vec<UserFile>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "{FILE_SELECT} WHERE thread_id = ?1 ORDER BY uploaded_at"
        ))?;
        let rows = stmt.query_map(params![thread_id], row_to_file)?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    pub fn get_user_file(&self, id: &str) -> Result<Option<UserFile>> {
        let conn = self.conn.lock().unwrap();
        match conn.query_row(&format!("{FILE_SELECT} WHERE id = ?1"), params![id], row_to_file) {
            Ok(f) => Ok(Some(f)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(StoreError::Database(e)),
        }
    }

    pub fn delete_user_file(&self, id: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute("DELETE FROM user_files WHERE id = ?1", params![id])?;
        Ok(())
    }

    /// Files past their provider-side retention, for the TTL cleaner.
    pub fn expired_files(&self, now: DateTime<Utc>) -> Result<Vec<UserFile>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!("{FILE_SELECT} WHERE expires_at <= ?1"))?;
        let rows = stmt.query_map(params![now.to_rfc3339()], row_to_file)?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }
}
