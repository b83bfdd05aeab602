//! Per-thread message batcher.
//!
//! One mailbox task per thread: messages arriving within the batch window
//! of the first unfinalized message form one logical user turn. The task
//! runs batches strictly serially, which is what gives each thread its
//! at-most-one-in-flight-turn guarantee. A message arriving while a turn
//! is executing cancels that generation; the message waits in the mailbox
//! and forms the next batch.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use teloxide::Bot;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use herald_agent::orchestrator::Orchestrator;
use herald_agent::runtime::AgentContext;
use herald_core::types::{ProcessedMessage, ThreadKey};

use crate::outbound::TelegramOutbound;

/// Mailbox depth per thread; a burst deeper than this applies backpressure
/// at the dispatcher.
const MAILBOX_DEPTH: usize = 64;

pub struct Batcher {
    ctx: Arc<AgentContext>,
    bot: Bot,
    mailboxes: DashMap<ThreadKey, mpsc::Sender<ProcessedMessage>>,
}

impl Batcher {
    pub fn new(ctx: Arc<AgentContext>, bot: Bot) -> Self {
        Self {
            ctx,
            bot,
            mailboxes: DashMap::new(),
        }
    }

    /// Hand a normalized message to its thread's mailbox, spawning the
    /// worker on first contact. Fires the generation cancel when a turn
    /// for this thread is already executing.
    pub async fn enqueue(self: &Arc<Self>, pm: ProcessedMessage) {
        let key = pm.key;

        if self.ctx.tracker.is_active(&key) {
            debug!(%key, "new message during active turn, cancelling generation");
            self.ctx.tracker.cancel(&key);
        }

        let sender = self
            .mailboxes
            .entry(key)
            .or_insert_with(|| self.spawn_worker(key))
            .clone();

        if let Err(rejected) = sender.send(pm).await {
            // Worker died (shouldn't happen); replace it and retry once.
            warn!(%key, "batcher mailbox closed, respawning worker");
            let sender = self.spawn_worker(key);
            self.mailboxes.insert(key, sender.clone());
            let _ = sender.send(rejected.0).await;
        }
    }

    fn spawn_worker(self: &Arc<Self>, key: ThreadKey) -> mpsc::Sender<ProcessedMessage> {
        let (tx, mut rx) = mpsc::channel::<ProcessedMessage>(MAILBOX_DEPTH);
        let ctx = Arc::clone(&self.ctx);
        let bot = self.bot.clone();
        let window = Duration::from_millis(ctx.config.telegram.batch_window_ms);

        tokio::spawn(async move {
            let outbound = Arc::new(TelegramOutbound::new(bot, key.topic_id));
            let orchestrator = Orchestrator::new(Arc::clone(&ctx), outbound);

            while let Some(first) = rx.recv().await {
                let mut batch = vec![first];

                // Collect everything that lands within the window of the
                // first unfinalized message.
                let deadline = tokio::time::sleep(window);
                tokio::pin!(deadline);
                loop {
                    tokio::select! {
                        _ = &mut deadline => break,
                        more = rx.recv() => match more {
                            Some(pm) => batch.push(pm),
                            None => break,
                        },
                    }
                }

                debug!(%key, size = batch.len(), "batch released");
                if let Err(e) = orchestrator.run_batch(batch).await {
                    warn!(%key, error = %e, "agent turn failed");
                }
            }
        });
        tx
    }
}

#[cfg(test)]
mod tests {
    // The window/coalescing behavior is covered end-to-end in the
    // orchestrator tests via scripted providers; what is testable in
    // isolation here is the pure batching arithmetic below.

    #[tokio::test(start_paused = true)]
    async fn window_collects_messages_into_one_batch() {
        use std::time::Duration;
        use tokio::sync::mpsc;

        let (tx, mut rx) = mpsc::channel::<u32>(8);
        tx.send(1).await.unwrap();
        tx.send(2).await.unwrap();

        let first = rx.recv().await.unwrap();
        let mut batch = vec![first];
        let deadline = tokio::time::sleep(Duration::from_millis(200));
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                _ = &mut deadline => break,
                more = rx.recv() => match more {
                    Some(m) => batch.push(m),
                    None => break,
                },
            }
        }
        assert_eq!(batch, vec![1, 2]);
    }
}
