//! User repository. Balance is read here but only ever written by `billing`.

use chrono::{DateTime, Utc};
use rusqlite::params;

use herald_core::types::User;

use crate::db::{parse_decimal, Store};
use crate::error::{Result, StoreError};

const USER_SELECT: &str = "SELECT id, display_name, preferred_model, custom_personality,
        balance, is_premium, created_at, updated_at FROM users";

pub(crate) fn row_to_user(row: &rusqlite::Row<'_>) -> rusqlite::Result<User> {
    let balance_str: String = row.get(4)?;
    let created: String = row.get(6)?;
    let updated: String = row.get(7)?;
    Ok(User {
        id: row.get(0)?,
        display_name: row.get(1)?,
        preferred_model: row.get(2)?,
        custom_personality: row.get(3)?,
        balance: balance_str.parse().unwrap_or_default(),
        is_premium: row.get::<_, i64>(5)? != 0,
        created_at: parse_ts(&created),
        updated_at: parse_ts(&updated),
    })
}

pub(crate) fn parse_ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}

impl Store {
    pub fn get_user(&self, id: i64) -> Result<Option<User>> {
        let conn = self.conn.lock().unwrap();
        match conn.query_row(
            &format!("{USER_SELECT} WHERE id = ?1"),
            params![id],
            row_to_user,
        ) {
            Ok(u) => Ok(Some(u)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(StoreError::Database(e)),
        }
    }

    /// First-contact upsert: create the user if unknown, otherwise refresh
    /// the display name and premium flag the frontend reported.
    pub fn upsert_user(&self, id: i64, display_name: &str, is_premium: bool) -> Result<User> {
        let now = Utc::now().to_rfc3339();
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO users (id, display_name, is_premium, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?4)
             ON CONFLICT(id) DO UPDATE SET
                display_name = excluded.display_name,
                is_premium = excluded.is_premium,
                updated_at = excluded.updated_at",
            params![id, display_name, is_premium as i64, now],
        )?;
        conn.query_row(
            &format!("{USER_SELECT} WHERE id = ?1"),
            params![id],
            row_to_user,
        )
        .map_err(StoreError::Database)
    }

    pub fn set_preferred_model(&self, id: i64, model_key: Option<&str>) -> Result<()> {
        self.touch_user_field(id, "preferred_model", model_key)
    }

    pub fn set_personality(&self, id: i64, personality: Option<&str>) -> Result<()> {
        self.touch_user_field(id, "custom_personality", personality)
    }

    fn touch_user_field(&self, id: i64, field: &str, value: Option<&str>) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        let conn = self.conn.lock().unwrap();
        let n = conn.execute(
            &format!("UPDATE users SET {field} = ?1, updated_at = ?2 WHERE id = ?3"),
            params![value, now, id],
        )?;
        if n == 0 {
            return Err(StoreError::NotFound {
                what: "user",
                id: id.to_string(),
            });
        }
        Ok(())
    }

    /// Balance read for gate checks when the cache missed.
    pub fn user_balance(&self, id: i64) -> Result<rust_decimal::Decimal> {
        let conn = self.conn.lock().unwrap();
        let s: String = conn
            .query_row(
                "SELECT balance FROM users WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound {
                    what: "user",
                    id: id.to_string(),
                },
                other => StoreError::Database(other),
            })?;
        parse_decimal(&s)
    }
}
