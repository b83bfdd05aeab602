//! Write-behind flusher: drains the cache-resident write queue into the
//! durable store in batched transactions.
//!
//! Wakes every `flush_interval_secs`, pops up to `flush_batch` items,
//! groups them by kind, and writes one transaction per kind. Failed
//! batches are re-queued with a bounded attempt count, then dead-lettered.
//! On shutdown one final drain runs before the task exits.

use std::sync::Arc;
use std::time::Duration;

use rusqlite::params;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use herald_cache::{CacheHandle, QueueItem, WriteOp};
use herald_core::config::StoreConfig;

use crate::db::Store;
use crate::error::Result;

pub struct Flusher {
    store: Arc<Store>,
    cache: Arc<CacheHandle>,
    interval: Duration,
    batch: usize,
    max_retries: u32,
}

impl Flusher {
    pub fn new(store: Arc<Store>, cache: Arc<CacheHandle>, cfg: &StoreConfig) -> Self {
        Self {
            store,
            cache,
            interval: Duration::from_secs(cfg.flush_interval_secs),
            batch: cfg.flush_batch,
            max_retries: cfg.write_retries,
        }
    }

    pub fn spawn(self, shutdown: CancellationToken) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        self.flush_once().await;
                    }
                    _ = shutdown.cancelled() => {
                        info!("flusher: shutdown, final drain");
                        // Drain until the queue reports empty.
                        loop {
                            let n = self.flush_once().await;
                            if n == 0 {
                                break;
                            }
                        }
                        return;
                    }
                }
            }
        })
    }

    /// One drain cycle. Returns the number of items popped.
    pub async fn flush_once(&self) -> usize {
        let items = self.cache.pop_writes(self.batch).await;
        if items.is_empty() {
            return 0;
        }
        let popped = items.len();
        debug!(count = popped, "flusher: draining batch");

        // Group by kind, preserving intra-kind order.
        let mut groups: Vec<(&'static str, Vec<QueueItem>)> = Vec::new();
        for item in items {
            let kind = item.op.kind();
            match groups.iter_mut().find(|(k, _)| *k == kind) {
                Some((_, group)) => group.push(item),
                None => groups.push((kind, vec![item])),
            }
        }

        for (kind, group) in groups {
            let ops: Vec<&WriteOp> = group.iter().map(|i| &i.op).collect();
            match self.store.apply_write_batch(&ops) {
                Ok(()) => debug!(kind, count = group.len(), "flusher: batch written"),
                Err(e) => {
                    warn!(kind, error = %e, "flusher: batch failed");
                    let mut retry = Vec::new();
                    for item in group {
                        if item.attempts + 1 >= self.max_retries {
                            error!(
                                kind = item.op.kind(),
                                attempts = item.attempts + 1,
                                "flusher: item exhausted retries, dead-lettering"
                            );
                            self.cache.dead_letter(&item).await;
                        } else {
                            retry.push(item);
                        }
                    }
                    self.cache.requeue_writes(retry).await;
                }
            }
        }
        popped
    }
}

impl Store {
    /// Apply a batch of queued writes in one transaction.
    pub fn apply_write_batch(&self, ops: &[&WriteOp]) -> Result<()> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        for op in ops {
            match op {
                WriteOp::Message(msg) => {
                    crate::messages::insert_message(&tx, msg)?;
                }
                WriteOp::MessageEdit {
                    chat_id,
                    external_id,
                    text,
                    edited_at,
                } => {
                    tx.execute(
                        "UPDATE messages SET text = ?1, edited_at = ?2
                         WHERE chat_id = ?3 AND external_id = ?4",
                        params![text, edited_at.to_rfc3339(), chat_id, external_id],
                    )?;
                }
                WriteOp::TokenUpdate { message_id, usage } => {
                    tx.execute(
                        "UPDATE messages SET input_tokens = ?1, output_tokens = ?2,
                            cache_read_tokens = ?3, cache_write_tokens = ?4,
                            thinking_tokens = ?5
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
                }
                WriteOp::File(file) => {
                    crate::files::insert_file(&tx, file)?;
                }
                WriteOp::FileDelete { file_id } => {
                    tx.execute("DELETE FROM user_files WHERE id = ?1", params![file_id])?;
                }
                WriteOp::ChatUpsert(chat) => {
                    tx.execute(
                        "INSERT INTO chats (id, kind, title, is_forum) VALUES (?1, ?2, ?3, ?4)
                         ON CONFLICT(id) DO UPDATE SET
                            kind = excluded.kind,
                            title = excluded.title,
                            is_forum = excluded.is_forum",
                        params![
                            chat.id,
                            chat.kind.as_str(),
                            chat.title,
                            chat.is_forum as i64
                        ],
                    )?;
                }
            }
        }
        tx.commit()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use herald_cache::MemoryBackend;
    use herald_core::config::CacheConfig;
    use herald_core::types::{Role, StoredMessage, ThreadKey};

    fn setup() -> (Arc<Store>, Arc<CacheHandle>, Flusher) {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let cache = Arc::new(CacheHandle::new(
            Arc::new(MemoryBackend::new()),
            &CacheConfig::default(),
        ));
        let flusher = Flusher::new(
            Arc::clone(&store),
            Arc::clone(&cache),
            &StoreConfig::default(),
        );
        (store, cache, flusher)
    }

    #[tokio::test]
    async fn queued_messages_land_in_store() {
        let (store, cache, flusher) = setup();
        let thread = store
            .get_or_create_thread(&ThreadKey::new(1, 2, None))
            .unwrap();

        for i in 0..3 {
            let msg = StoredMessage::internal(&thread, Role::User, format!("m{i}"));
            cache.push_write(QueueItem::new(WriteOp::Message(msg))).await;
        }

        assert_eq!(flusher.flush_once().await, 3);
        assert_eq!(store.list_messages(&thread.id).unwrap().len(), 3);
        // Queue now empty.
        assert_eq!(flusher.flush_once().await, 0);
    }

    #[tokio::test]
    async fn mixed_kinds_flush_in_one_cycle() {
        let (store, cache, flusher) = setup();
        let thread = store
            .get_or_create_thread(&ThreadKey::new(1, 2, None))
            .unwrap();

        let msg = StoredMessage::internal(&thread, Role::Assistant, "a");
        let msg_id = msg.id.clone();
        cache.push_write(QueueItem::new(WriteOp::Message(msg))).await;
        cache
            .push_write(QueueItem::new(WriteOp::TokenUpdate {
                message_id: msg_id.clone(),
                usage: herald_core::types::TokenUsage {
                    input: 5,
                    output: 7,
                    ..Default::default()
                },
            }))
            .await;

        flusher.flush_once().await;
        let listed = store.list_messages(&thread.id).unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].usage.output, 7);
    }
}
