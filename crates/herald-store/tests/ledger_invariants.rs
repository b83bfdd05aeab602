//! Cross-module invariants over the durable store: balance conservation
//! under interleaved activity, and write-behind batches landing in the
//! order they were queued.

use std::sync::Arc;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use herald_cache::{CacheHandle, MemoryBackend, QueueItem, WriteOp};
use herald_core::config::{CacheConfig, StoreConfig};
use herald_core::types::{OpKind, Role, StoredMessage, ThreadKey};
use herald_store::billing::OpDetails;
use herald_store::{Flusher, Store};

#[test]
fn balance_is_conserved_across_users_and_kinds() {
    let store = Store::open_in_memory().unwrap();
    store.upsert_user(1, "alice", false).unwrap();
    store.upsert_user(2, "bob", true).unwrap();

    // Interleaved deposits, charges, an admin adjust, and a refund.
    store
        .apply_balance_op(1, OpKind::Deposit, dec!(10), "d1", OpDetails::default())
        .unwrap();
    let bob_deposit = store
        .apply_balance_op(2, OpKind::Deposit, dec!(3), "d2", OpDetails::default())
        .unwrap();
    store
        .apply_balance_op(1, OpKind::Charge, dec!(-0.0045), "turn", OpDetails::default())
        .unwrap();
    store
        .apply_balance_op(2, OpKind::Charge, dec!(-0.134), "image", OpDetails::default())
        .unwrap();
    store
        .apply_balance_op(1, OpKind::AdminAdjust, dec!(-2.5), "ops", OpDetails::default())
        .unwrap();
    store.refund_deposit(&bob_deposit.id).unwrap();

    for user_id in [1, 2] {
        let ops = store.balance_history(user_id, 100).unwrap();
        let sum: Decimal = ops.iter().map(|op| op.amount).sum();
        assert_eq!(
            store.user_balance(user_id).unwrap(),
            sum,
            "final balance equals the sum of all operations"
        );
        for op in ops {
            assert_eq!(op.balance_before + op.amount, op.balance_after);
        }
    }
}

#[test]
fn negative_balance_only_via_recorded_charge() {
    let store = Store::open_in_memory().unwrap();
    store.upsert_user(1, "alice", false).unwrap();
    store
        .apply_balance_op(1, OpKind::Deposit, dec!(0.05), "seed", OpDetails::default())
        .unwrap();
    store
        .apply_balance_op(1, OpKind::Charge, dec!(-0.134), "image", OpDetails::default())
        .unwrap();

    let balance = store.user_balance(1).unwrap();
    assert!(balance < Decimal::ZERO);
    let witness = store
        .balance_history(1, 10)
        .unwrap()
        .into_iter()
        .find(|op| op.kind == OpKind::Charge && op.balance_after < Decimal::ZERO);
    assert!(witness.is_some(), "audit log records the crossing charge");
}

#[tokio::test]
async fn flusher_preserves_within_thread_message_order() {
    let store = Arc::new(Store::open_in_memory().unwrap());
    let cache = Arc::new(CacheHandle::new(
        Arc::new(MemoryBackend::new()),
        &CacheConfig::default(),
    ));
    let thread = store
        .get_or_create_thread(&ThreadKey::new(1, 2, None))
        .unwrap();

    // Two "batches" queued back to back; batch A's messages must appear
    // before any of batch B's.
    for batch in 0..2 {
        for i in 0..3 {
            let msg = StoredMessage::internal(&thread, Role::User, format!("b{batch}m{i}"));
            cache
                .push_write(QueueItem::new(WriteOp::Message(msg)))
                .await;
        }
    }

    let flusher = Flusher::new(Arc::clone(&store), Arc::clone(&cache), &StoreConfig::default());
    while flusher.flush_once().await > 0 {}

    let texts: Vec<String> = store
        .list_messages(&thread.id)
        .unwrap()
        .into_iter()
        .map(|m| m.text)
        .collect();
    assert_eq!(texts, vec!["b0m0", "b0m1", "b0m2", "b1m0", "b1m1", "b1m2"]);
}
