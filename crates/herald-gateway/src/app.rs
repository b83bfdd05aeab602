//! Wiring: durable store, cache backend selection, the agent context, and
//! the background tasks (write-behind flusher, file TTL cleaner, memory
//! cache sweep).

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use herald_agent::anthropic::AnthropicClient;
use herald_agent::files_api;
use herald_agent::runtime::AgentContext;
use herald_cache::{CacheHandle, KvBackend, MemoryBackend};
use herald_cache::redis_backend::RedisBackend;
use herald_core::config::HeraldConfig;
use herald_store::{Flusher, Store};

const MEMORY_SWEEP_SECS: u64 = 60;

pub struct App {
    pub ctx: Arc<AgentContext>,
    shutdown_token: CancellationToken,
    flusher: tokio::task::JoinHandle<()>,
    cleaner: tokio::task::JoinHandle<()>,
    sweeper: Option<tokio::task::JoinHandle<()>>,
}

impl App {
    pub async fn build(config: HeraldConfig) -> anyhow::Result<Self> {
        let store = Arc::new(Store::open(&config.store.path)?);
        info!(path = %config.store.path, "durable store ready");

        // Redis when configured; otherwise the in-process backend with a
        // periodic sweep of expired entries.
        let mut memory: Option<Arc<MemoryBackend>> = None;
        let backend: Arc<dyn KvBackend> = match &config.cache.redis_url {
            Some(url) => match RedisBackend::connect(url).await {
                Ok(redis) => {
                    info!("cache: redis backend connected");
                    Arc::new(redis)
                }
                Err(e) => {
                    warn!(error = %e, "cache: redis unavailable, using in-memory backend");
                    let mem = Arc::new(MemoryBackend::new());
                    memory = Some(Arc::clone(&mem));
                    mem
                }
            },
            None => {
                info!("cache: no redis configured, using in-memory backend");
                let mem = Arc::new(MemoryBackend::new());
                memory = Some(Arc::clone(&mem));
                mem
            }
        };
        let cache = Arc::new(CacheHandle::new(backend, &config.cache));

        let provider = Arc::new(AnthropicClient::new(&config.anthropic));
        let ctx = Arc::new(AgentContext::new(
            config.clone(),
            Arc::clone(&store),
            Arc::clone(&cache),
            provider,
        ));

        let shutdown_token = CancellationToken::new();
        let flusher = Flusher::new(Arc::clone(&store), Arc::clone(&cache), &config.store)
            .spawn(shutdown_token.clone());
        let cleaner = files_api::spawn_ttl_cleaner(
            Arc::clone(&ctx.files),
            store,
            cache,
            shutdown_token.clone(),
        );
        let sweeper = memory.map(|mem| {
            let token = shutdown_token.clone();
            tokio::spawn(async move {
                let mut ticker =
                    tokio::time::interval(Duration::from_secs(MEMORY_SWEEP_SECS));
                loop {
                    tokio::select! {
                        _ = ticker.tick() => mem.sweep(),
                        _ = token.cancelled() => return,
                    }
                }
            })
        });

        Ok(Self {
            ctx,
            shutdown_token,
            flusher,
            cleaner,
            sweeper,
        })
    }

    /// Stop background tasks; the flusher performs its final drain before
    /// its task resolves.
    pub async fn shutdown(self) {
        self.shutdown_token.cancel();
        let _ = self.flusher.await;
        let _ = self.cleaner.await;
        if let Some(sweeper) = self.sweeper {
            let _ = sweeper.await;
        }
        info!("herald gateway stopped");
    }
}
