//! Operator-tunable settings, key-value over the durable store.
//!
//! Currently the only consumer is the per-model price margin: a multiplier
//! applied to LLM turn costs when charging.

use rusqlite::params;
use rust_decimal::Decimal;

use crate::db::Store;
use crate::error::Result;

impl Store {
    pub fn set_setting(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO settings (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )?;
        Ok(())
    }

    pub fn get_setting(&self, key: &str) -> Result<Option<String>> {
        let conn = self.conn.lock().unwrap();
        match conn.query_row(
            "SELECT value FROM settings WHERE key = ?1",
            params![key],
            |row| row.get::<_, String>(0),
        ) {
            Ok(v) => Ok(Some(v)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(crate::error::StoreError::Database(e)),
        }
    }

    /// Price multiplier for a model's turn charges. Unset or unparseable
    /// margins read as 1.
    pub fn model_margin(&self, model_key: &str) -> Decimal {
        self.get_setting(&format!("margin:{model_key}"))
            .ok()
            .flatten()
            .and_then(|v| v.parse().ok())
            .unwrap_or(Decimal::ONE)
    }

    pub fn set_model_margin(&self, model_key: &str, margin: Decimal) -> Result<()> {
        self.set_setting(&format!("margin:{model_key}"), &margin.to_string())
    }
}
