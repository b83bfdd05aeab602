//! Balance gate: pre-turn and pre-tool checks plus charging.
//!
//! Checks read the freshest balance available (cache snapshot, store on
//! miss). Charges go straight to the durable store in one transaction and
//! invalidate the cached user snapshot — the write-behind queue never
//! carries money.

use std::sync::Arc;

use rust_decimal::Decimal;
use tracing::info;

use herald_cache::CacheHandle;
use herald_core::types::{BalanceOperation, OpKind, TokenUsage};
use herald_core::{HeraldError, Result};
use herald_store::billing::OpDetails;
use herald_store::Store;

pub struct BalanceGate {
    store: Arc<Store>,
    cache: Arc<CacheHandle>,
}

impl BalanceGate {
    pub fn new(store: Arc<Store>, cache: Arc<CacheHandle>) -> Self {
        Self { store, cache }
    }

    pub async fn balance(&self, user_id: i64) -> Result<Decimal> {
        if let Some(user) = self.cache.get_user(user_id).await {
            return Ok(user.balance);
        }
        self.store
            .user_balance(user_id)
            .map_err(|e| HeraldError::Database(e.to_string()))
    }

    /// Pre-turn / pre-tool check: paid actions require a positive balance.
    pub async fn has_funds(&self, user_id: i64) -> Result<bool> {
        Ok(self.balance(user_id).await? > Decimal::ZERO)
    }

    /// Charge `cost` (a positive amount) against the user. Records the
    /// audit row synchronously and drops the cached snapshot.
    pub async fn charge(
        &self,
        user_id: i64,
        cost: Decimal,
        description: &str,
        message_ref: Option<String>,
        usage: Option<TokenUsage>,
    ) -> Result<BalanceOperation> {
        let op = self
            .store
            .apply_balance_op(
                user_id,
                OpKind::Charge,
                -cost,
                description,
                OpDetails {
                    provider_charge_id: None,
                    message_ref,
                    usage,
                },
            )
            .map_err(|e| HeraldError::Database(e.to_string()))?;
        self.cache.invalidate_user(user_id).await;
        info!(
            user_id,
            cost = %cost,
            balance_after = %op.balance_after,
            description,
            "charged user"
        );
        Ok(op)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use herald_cache::MemoryBackend;
    use herald_core::config::CacheConfig;
    use rust_decimal_macros::dec;

    async fn gate_with_balance(balance: Decimal) -> BalanceGate {
        let store = Arc::new(Store::open_in_memory().unwrap());
        store.upsert_user(1, "alice", false).unwrap();
        if balance != Decimal::ZERO {
            store
                .apply_balance_op(1, OpKind::Deposit, balance, "seed", OpDetails::default())
                .unwrap();
        }
        let cache = Arc::new(CacheHandle::new(
            Arc::new(MemoryBackend::new()),
            &CacheConfig::default(),
        ));
        BalanceGate::new(store, cache)
    }

    #[tokio::test]
    async fn zero_balance_fails_funds_check() {
        let gate = gate_with_balance(Decimal::ZERO).await;
        assert!(!gate.has_funds(1).await.unwrap());
    }

    #[tokio::test]
    async fn charge_updates_balance_and_audit() {
        let gate = gate_with_balance(dec!(1)).await;
        assert!(gate.has_funds(1).await.unwrap());
        let op = gate
            .charge(1, dec!(0.134), "image generation", None, None)
            .await
            .unwrap();
        assert_eq!(op.amount, dec!(-0.134));
        assert_eq!(op.balance_after, dec!(0.866));
        assert_eq!(gate.balance(1).await.unwrap(), dec!(0.866));
    }

    #[tokio::test]
    async fn charge_invalidates_cached_snapshot() {
        let gate = gate_with_balance(dec!(1)).await;
        // Prime the cache with a snapshot, then charge.
        let user = gate.store.get_user(1).unwrap().unwrap();
        gate.cache.put_user(&user).await;
        gate.charge(1, dec!(0.5), "t", None, None).await.unwrap();
        // Post-charge read must not see the stale cached balance.
        assert_eq!(gate.balance(1).await.unwrap(), dec!(0.5));
    }
}
