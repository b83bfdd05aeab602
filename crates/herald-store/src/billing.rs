//! Balance charging — the only code path that writes `users.balance`.
//!
//! Every mutation is one SQLite transaction: read balance, write the
//! updated balance, insert the audit row with before/after snapshots.
//! Either both land or neither does; a crash cannot split them.

use chrono::Utc;
use rusqlite::params;
use rust_decimal::Decimal;
use uuid::Uuid;

use herald_core::types::{BalanceOperation, OpKind, TokenUsage};

use crate::db::{parse_decimal, Store};
use crate::error::{Result, StoreError};
use crate::users::parse_ts;

/// Everything optional that can ride on a balance operation.
#[derive(Debug, Default, Clone)]
pub struct OpDetails {
    pub provider_charge_id: Option<String>,
    pub message_ref: Option<String>,
    pub usage: Option<TokenUsage>,
}

const OP_SELECT: &str = "SELECT id, user_id, kind, amount, balance_before, balance_after,
        description, provider_charge_id, message_ref, input_tokens, output_tokens,
        created_at FROM balance_operations";

fn row_to_op(row: &rusqlite::Row<'_>) -> rusqlite::Result<BalanceOperation> {
    let kind: String = row.get(2)?;
    let amount: String = row.get(3)?;
    let before: String = row.get(4)?;
    let after: String = row.get(5)?;
    let created: String = row.get(11)?;
    Ok(BalanceOperation {
        id: row.get(0)?,
        user_id: row.get(1)?,
        kind: kind.parse().unwrap_or(OpKind::Charge),
        amount: amount.parse().unwrap_or_default(),
        balance_before: before.parse().unwrap_or_default(),
        balance_after: after.parse().unwrap_or_default(),
        description: row.get(6)?,
        provider_charge_id: row.get(7)?,
        message_ref: row.get(8)?,
        input_tokens: row.get(9)?,
        output_tokens: row.get(10)?,
        created_at: parse_ts(&created),
    })
}

impl Store {
    /// Apply a signed amount to a user's balance and record the audit row,
    /// atomically. Charges pass a negative amount; deposits positive.
    pub fn apply_balance_op(
        &self,
        user_id: i64,
        kind: OpKind,
        amount: Decimal,
        description: &str,
        details: OpDetails,
    ) -> Result<BalanceOperation> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;

        let before_str: String = tx
            .query_row(
                "SELECT balance FROM users WHERE id = ?1",
                params![user_id],
                |row| row.get(0),
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound {
                    what: "user",
                    id: user_id.to_string(),
                },
                other => StoreError::Database(other),
            })?;
        let before = parse_decimal(&before_str)?;
        let after = before + amount;
        let now = Utc::now();

        tx.execute(
            "UPDATE users SET balance = ?1, updated_at = ?2 WHERE id = ?3",
            params![after.to_string(), now.to_rfc3339(), user_id],
        )?;

        let op = BalanceOperation {
            id: Uuid::now_v7().to_string(),
            user_id,
            kind,
            amount,
            balance_before: before,
            balance_after: after,
            description: description.to_string(),
            provider_charge_id: details.provider_charge_id,
            message_ref: details.message_ref,
            input_tokens: details.usage.map(|u| u.input as i64),
            output_tokens: details.usage.map(|u| u.output as i64),
            created_at: now,
        };
        tx.execute(
            "INSERT INTO balance_operations
             (id, user_id, kind, amount, balance_before, balance_after, description,
              provider_charge_id, message_ref, input_tokens, output_tokens, created_at)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12)",
            params![
                op.id,
                op.user_id,
                op.kind.as_str(),
                op.amount.to_string(),
                op.balance_before.to_string(),
                op.balance_after.to_string(),
                op.description,
                op.provider_charge_id,
                op.message_ref,
                op.input_tokens,
                op.output_tokens,
                op.created_at.to_rfc3339(),
            ],
        )?;

        tx.commit()?;
        Ok(op)
    }

    pub fn get_balance_op(&self, id: &str) -> Result<Option<BalanceOperation>> {
        let conn = self.conn.lock().unwrap();
        match conn.query_row(&format!("{OP_SELECT} WHERE id = ?1"), params![id], row_to_op) {
            Ok(op) => Ok(Some(op)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(StoreError::Database(e)),
        }
    }

    /// Reverse a stored deposit. Creates the matching negative operation,
    /// linked back to the original via `message_ref`. Double refunds and
    /// refunds of non-deposits are rejected.
    pub fn refund_deposit(&self, op_id: &str) -> Result<BalanceOperation> {
        let original = self.get_balance_op(op_id)?.ok_or(StoreError::NotFound {
            what: "balance operation",
            id: op_id.to_string(),
        })?;
        if original.kind != OpKind::Deposit {
            return Err(StoreError::RefundRejected(format!(
                "operation {op_id} is {}, not a deposit",
                original.kind.as_str()
            )));
        }
        {
            let conn = self.conn.lock().unwrap();
            let already: i64 = conn.query_row(
                "SELECT COUNT(*) FROM balance_operations
                 WHERE kind = 'refund' AND message_ref = ?1",
                params![op_id],
                |row| row.get(0),
            )?;
            if already > 0 {
                return Err(StoreError::RefundRejected(format!(
                    "operation {op_id} was already refunded"
                )));
            }
        }
        self.apply_balance_op(
            original.user_id,
            OpKind::Refund,
            -original.amount,
            &format!("refund of deposit {op_id}"),
            OpDetails {
                provider_charge_id: original.provider_charge_id.clone(),
                message_ref: Some(op_id.to_string()),
                usage: None,
            },
        )
    }

    pub fn balance_history(&self, user_id: i64, limit: usize) -> Result<Vec<BalanceOperation>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "{OP_SELECT} WHERE user_id = ?1 ORDER BY created_at DESC, id DESC LIMIT ?2"
        ))?;
        let rows = stmt.query_map(params![user_id, limit as i64], row_to_op)?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    /// Users ranked by total charged amount (charges are negative; the
    /// returned figure is positive spend).
    pub fn top_spenders(&self, limit: usize) -> Result<Vec<(i64, Decimal)>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT user_id, amount FROM balance_operations WHERE kind = 'charge'",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
        })?;

        // Sum in Decimal space — SQLite SUM over text columns would go
        // through floats and lose the accounting precision.
        let mut totals: std::collections::HashMap<i64, Decimal> = std::collections::HashMap::new();
        for row in rows.filter_map(|r| r.ok()) {
            let amount = parse_decimal(&row.1)?;
            *totals.entry(row.0).or_default() -= amount;
        }
        let mut ranked: Vec<(i64, Decimal)> = totals.into_iter().collect();
        ranked.sort_by(|a, b| b.1.cmp(&a.1));
        ranked.truncate(limit);
        Ok(ranked)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn store_with_user(balance: Decimal) -> Store {
        let store = Store::open_in_memory().unwrap();
        store.upsert_user(1, "alice", false).unwrap();
        if balance != Decimal::ZERO {
            store
                .apply_balance_op(1, OpKind::Deposit, balance, "seed", OpDetails::default())
                .unwrap();
        }
        store
    }

    #[test]
    fn before_plus_amount_equals_after_on_every_row() {
        let store = store_with_user(dec!(10));
        store
            .apply_balance_op(1, OpKind::Charge, dec!(-0.134), "image", OpDetails::default())
            .unwrap();
        store
            .apply_balance_op(1, OpKind::Charge, dec!(-0.0045), "tokens", OpDetails::default())
            .unwrap();
        for op in store.balance_history(1, 100).unwrap() {
            assert_eq!(op.balance_before + op.amount, op.balance_after);
        }
    }

    #[test]
    fn balance_conservation_over_random_sequence() {
        let store = store_with_user(Decimal::ZERO);
        let amounts = [
            dec!(5), dec!(-0.25), dec!(-1.0001), dec!(2.5), dec!(-0.134), dec!(-3.99),
        ];
        for (i, amount) in amounts.iter().enumerate() {
            let kind = if amount.is_sign_positive() {
                OpKind::Deposit
            } else {
                OpKind::Charge
            };
            store
                .apply_balance_op(1, kind, *amount, &format!("op {i}"), OpDetails::default())
                .unwrap();
        }
        let expected: Decimal = amounts.iter().sum();
        assert_eq!(store.user_balance(1).unwrap(), expected);
    }

    #[test]
    fn charge_may_push_balance_negative() {
        let store = store_with_user(dec!(0.05));
        let op = store
            .apply_balance_op(1, OpKind::Charge, dec!(-0.134), "image", OpDetails::default())
            .unwrap();
        assert_eq!(op.balance_after, dec!(-0.084));
        assert_eq!(store.user_balance(1).unwrap(), dec!(-0.084));
    }

    #[test]
    fn refund_reverses_deposit_once() {
        let store = Store::open_in_memory().unwrap();
        store.upsert_user(1, "alice", false).unwrap();
        let deposit = store
            .apply_balance_op(
                1,
                OpKind::Deposit,
                dec!(5),
                "stars purchase",
                OpDetails {
                    provider_charge_id: Some("ch_123".into()),
                    ..Default::default()
                },
            )
            .unwrap();

        let refund = store.refund_deposit(&deposit.id).unwrap();
        assert_eq!(refund.amount, dec!(-5));
        assert_eq!(refund.provider_charge_id.as_deref(), Some("ch_123"));
        assert_eq!(store.user_balance(1).unwrap(), Decimal::ZERO);

        // Second attempt is rejected.
        assert!(matches!(
            store.refund_deposit(&deposit.id),
            Err(StoreError::RefundRejected(_))
        ));
    }

    #[test]
    fn refund_of_charge_is_rejected() {
        let store = store_with_user(dec!(1));
        let charge = store
            .apply_balance_op(1, OpKind::Charge, dec!(-0.5), "t", OpDetails::default())
            .unwrap();
        assert!(store.refund_deposit(&charge.id).is_err());
    }

    #[test]
    fn top_spenders_ranks_by_charges_only() {
        let store = Store::open_in_memory().unwrap();
        store.upsert_user(1, "alice", false).unwrap();
        store.upsert_user(2, "bob", false).unwrap();
        store
            .apply_balance_op(1, OpKind::Deposit, dec!(100), "d", OpDetails::default())
            .unwrap();
        store
            .apply_balance_op(1, OpKind::Charge, dec!(-1), "c", OpDetails::default())
            .unwrap();
        store
            .apply_balance_op(2, OpKind::Charge, dec!(-3), "c", OpDetails::default())
            .unwrap();
        let ranked = store.top_spenders(10).unwrap();
        assert_eq!(ranked[0], (2, dec!(3)));
        assert_eq!(ranked[1], (1, dec!(1)));
    }
}
