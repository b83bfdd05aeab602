//! Typed cache surface used by every upper component.
//!
//! All operations degrade instead of failing: a backend error is counted
//! by the circuit breaker and reported as a miss (reads) or silently
//! dropped (writes). Callers fall back to the durable store on miss.
//! Queue pushes are the exception — they land in an in-process overflow
//! buffer while the backend is down and drain once it recovers.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, warn};

use herald_core::config::CacheConfig;
use herald_core::types::{ExecArtifact, StoredMessage, Thread, ThreadKey, User, UserFile};

use crate::backend::KvBackend;
use crate::breaker::CircuitBreaker;
use crate::error::Result;
use crate::queue::QueueItem;

const KEY_PREFIX: &str = "herald";
const WRITE_QUEUE_KEY: &str = "herald:write:queue";
const DEAD_LETTER_KEY: &str = "herald:write:dead";

#[derive(Debug, Clone, Copy)]
pub struct CacheTtls {
    pub user: Duration,
    pub thread: Duration,
    pub messages: Duration,
    pub files: Duration,
    pub bytes: Duration,
    pub artifact: Duration,
}

impl From<&CacheConfig> for CacheTtls {
    fn from(cfg: &CacheConfig) -> Self {
        Self {
            user: Duration::from_secs(cfg.user_ttl_secs),
            thread: Duration::from_secs(cfg.thread_ttl_secs),
            messages: Duration::from_secs(cfg.messages_ttl_secs),
            files: Duration::from_secs(cfg.files_ttl_secs),
            bytes: Duration::from_secs(cfg.bytes_ttl_secs),
            artifact: Duration::from_secs(cfg.artifact_ttl_secs),
        }
    }
}

pub struct CacheHandle {
    backend: Arc<dyn KvBackend>,
    breaker: CircuitBreaker,
    ttls: CacheTtls,
    /// Queue items that could not reach the backend (breaker open).
    overflow: Mutex<VecDeque<QueueItem>>,
}

impl CacheHandle {
    pub fn new(backend: Arc<dyn KvBackend>, cfg: &CacheConfig) -> Self {
        Self {
            backend,
            breaker: CircuitBreaker::new(
                cfg.breaker_failures,
                Duration::from_secs(cfg.breaker_open_secs),
            ),
            ttls: CacheTtls::from(cfg),
            overflow: Mutex::new(VecDeque::new()),
        }
    }

    pub fn artifact_ttl(&self) -> Duration {
        self.ttls.artifact
    }

    /// Run one backend call under the breaker. Open breaker or error ⇒ None.
    async fn guarded<T, F>(&self, what: &str, fut: F) -> Option<T>
    where
        F: Future<Output = Result<T>>,
    {
        if self.breaker.is_open() {
            return None;
        }
        match fut.await {
            Ok(v) => {
                self.breaker.record_success();
                Some(v)
            }
            Err(e) => {
                self.breaker.record_failure();
                warn!(op = what, error = %e, "cache operation failed");
                None
            }
        }
    }

    async fn get_json<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let bytes = self.guarded("get", self.backend.get(key)).await??;
        match serde_json::from_slice(&bytes) {
            Ok(v) => Some(v),
            Err(e) => {
                // A corrupt entry behaves like a miss; drop it.
                warn!(key, error = %e, "cache entry failed to deserialize, evicting");
                let _ = self.guarded("del", self.backend.del(key)).await;
                None
            }
        }
    }

    async fn put_json<T: Serialize>(&self, key: &str, value: &T, ttl: Duration) {
        let bytes = match serde_json::to_vec(value) {
            Ok(b) => b,
            Err(e) => {
                warn!(key, error = %e, "cache entry failed to serialize");
                return;
            }
        };
        let _ = self
            .guarded("set", self.backend.set(key, &bytes, Some(ttl)))
            .await;
    }

    // ------------------------------------------------------------------
    // Users
    // ------------------------------------------------------------------

    pub async fn get_user(&self, user_id: i64) -> Option<User> {
        self.get_json(&format!("{KEY_PREFIX}:user:{user_id}")).await
    }

    pub async fn put_user(&self, user: &User) {
        self.put_json(&format!("{KEY_PREFIX}:user:{}", user.id), user, self.ttls.user)
            .await;
    }

    /// Called on balance change and on `/personality` / `/model` updates.
    pub async fn invalidate_user(&self, user_id: i64) {
        let _ = self
            .guarded(
                "del",
                self.backend.del(&format!("{KEY_PREFIX}:user:{user_id}")),
            )
            .await;
    }

    // ------------------------------------------------------------------
    // Threads
    // ------------------------------------------------------------------

    pub async fn get_thread(&self, key: &ThreadKey) -> Option<Thread> {
        self.get_json(&format!("{KEY_PREFIX}:thread:{key}")).await
    }

    pub async fn put_thread(&self, thread: &Thread) {
        self.put_json(
            &format!("{KEY_PREFIX}:thread:{}", thread.key()),
            thread,
            self.ttls.thread,
        )
        .await;
    }

    pub async fn invalidate_thread(&self, key: &ThreadKey) {
        let _ = self
            .guarded(
                "del",
                self.backend.del(&format!("{KEY_PREFIX}:thread:{key}")),
            )
            .await;
    }

    // ------------------------------------------------------------------
    // Message lists
    // ------------------------------------------------------------------

    pub async fn get_messages(&self, thread_id: &str) -> Option<Vec<StoredMessage>> {
        self.get_json(&format!("{KEY_PREFIX}:thread:{thread_id}:messages"))
            .await
    }

    pub async fn put_messages(&self, thread_id: &str, messages: &[StoredMessage]) {
        self.put_json(
            &format!("{KEY_PREFIX}:thread:{thread_id}:messages"),
            &messages,
            self.ttls.messages,
        )
        .await;
    }

    /// Append in place to avoid a full re-hydration on every assistant turn.
    /// On miss the caller's next read loads from the store and back-fills.
    pub async fn append_messages(&self, thread_id: &str, new: &[StoredMessage]) {
        let key = format!("{KEY_PREFIX}:thread:{thread_id}:messages");
        if let Some(mut list) = self.get_json::<Vec<StoredMessage>>(&key).await {
            list.extend(new.iter().cloned());
            self.put_json(&key, &list, self.ttls.messages).await;
        }
    }

    pub async fn invalidate_messages(&self, thread_id: &str) {
        let _ = self
            .guarded(
                "del",
                self.backend
                    .del(&format!("{KEY_PREFIX}:thread:{thread_id}:messages")),
            )
            .await;
    }

    // ------------------------------------------------------------------
    // Per-thread file lists (metadata only)
    // ------------------------------------------------------------------

    pub async fn get_files(&self, thread_id: &str) -> Option<Vec<UserFile>> {
        self.get_json(&format!("{KEY_PREFIX}:thread:{thread_id}:files"))
            .await
    }

    pub async fn put_files(&self, thread_id: &str, files: &[UserFile]) {
        self.put_json(
            &format!("{KEY_PREFIX}:thread:{thread_id}:files"),
            &files,
            self.ttls.files,
        )
        .await;
    }

    pub async fn add_file(&self, file: &UserFile) {
        let key = format!("{KEY_PREFIX}:thread:{}:files", file.thread_id);
        if let Some(mut list) = self.get_json::<Vec<UserFile>>(&key).await {
            list.push(file.clone());
            self.put_json(&key, &list, self.ttls.files).await;
        }
    }

    pub async fn remove_file(&self, thread_id: &str, file_id: &str) {
        let key = format!("{KEY_PREFIX}:thread:{thread_id}:files");
        if let Some(mut list) = self.get_json::<Vec<UserFile>>(&key).await {
            list.retain(|f| f.id != file_id);
            self.put_json(&key, &list, self.ttls.files).await;
        }
    }

    // ------------------------------------------------------------------
    // File bytes (hot files only)
    // ------------------------------------------------------------------

    pub async fn get_file_bytes(&self, provider_file_id: &str) -> Option<Vec<u8>> {
        self.guarded(
            "get",
            self.backend
                .get(&format!("{KEY_PREFIX}:file:{provider_file_id}:bytes")),
        )
        .await?
    }

    pub async fn put_file_bytes(&self, provider_file_id: &str, bytes: &[u8]) {
        let _ = self
            .guarded(
                "set",
                self.backend.set(
                    &format!("{KEY_PREFIX}:file:{provider_file_id}:bytes"),
                    bytes,
                    Some(self.ttls.bytes),
                ),
            )
            .await;
    }

    pub async fn del_file_bytes(&self, provider_file_id: &str) {
        let _ = self
            .guarded(
                "del",
                self.backend
                    .del(&format!("{KEY_PREFIX}:file:{provider_file_id}:bytes")),
            )
            .await;
    }

    // ------------------------------------------------------------------
    // Exec artifacts (cache-only lifetime)
    // ------------------------------------------------------------------

    /// Store an artifact and index it under its thread, atomically.
    pub async fn put_artifact(&self, artifact: &ExecArtifact) -> bool {
        let bytes = match serde_json::to_vec(artifact) {
            Ok(b) => b,
            Err(e) => {
                warn!(temp_id = %artifact.temp_id, error = %e, "artifact serialize failed");
                return false;
            }
        };
        self.guarded(
            "set_and_index",
            self.backend.set_and_index(
                &format!("{KEY_PREFIX}:exec:{}", artifact.temp_id),
                &bytes,
                Some(self.ttls.artifact),
                &format!("{KEY_PREFIX}:exec:thread:{}", artifact.thread_id),
                &artifact.temp_id,
            ),
        )
        .await
        .is_some()
    }

    pub async fn get_artifact(&self, temp_id: &str) -> Option<ExecArtifact> {
        self.get_json(&format!("{KEY_PREFIX}:exec:{temp_id}")).await
    }

    /// Consume an artifact: fetch it and atomically drop value + index entry.
    pub async fn take_artifact(&self, temp_id: &str) -> Option<ExecArtifact> {
        let artifact: ExecArtifact = self.get_json(&format!("{KEY_PREFIX}:exec:{temp_id}")).await?;
        let _ = self
            .guarded(
                "del_and_unindex",
                self.backend.del_and_unindex(
                    &format!("{KEY_PREFIX}:exec:{temp_id}"),
                    &format!("{KEY_PREFIX}:exec:thread:{}", artifact.thread_id),
                    temp_id,
                ),
            )
            .await;
        Some(artifact)
    }

    /// Pending artifacts for a thread. Index entries whose value already
    /// expired are pruned as they are discovered.
    pub async fn list_artifacts(&self, thread_id: &str) -> Vec<ExecArtifact> {
        let set_key = format!("{KEY_PREFIX}:exec:thread:{thread_id}");
        let ids = self
            .guarded("smembers", self.backend.smembers(&set_key))
            .await
            .unwrap_or_default();

        let mut artifacts = Vec::with_capacity(ids.len());
        for temp_id in ids {
            match self.get_artifact(&temp_id).await {
                Some(a) => artifacts.push(a),
                None => {
                    debug!(temp_id, "pruning expired artifact from thread index");
                    let _ = self
                        .guarded("srem", self.backend.srem(&set_key, &temp_id))
                        .await;
                }
            }
        }
        artifacts.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        artifacts
    }

    // ------------------------------------------------------------------
    // Write-behind queue
    // ------------------------------------------------------------------

    /// Enqueue a write. Falls back to the in-process overflow buffer when
    /// the backend is unavailable so no write is lost to a cache outage.
    pub async fn push_write(&self, item: QueueItem) {
        let bytes = match serde_json::to_vec(&item) {
            Ok(b) => b,
            Err(e) => {
                warn!(error = %e, "write-queue item serialize failed, dropping");
                return;
            }
        };
        if self
            .guarded("rpush", self.backend.rpush(WRITE_QUEUE_KEY, &bytes))
            .await
            .is_none()
        {
            self.overflow.lock().unwrap().push_back(item);
        }
    }

    /// Pop up to `n` queued writes, overflow buffer first (FIFO overall:
    /// overflow items are older — they were queued while the backend was down).
    pub async fn pop_writes(&self, n: usize) -> Vec<QueueItem> {
        let mut items: Vec<QueueItem> = Vec::new();
        {
            let mut overflow = self.overflow.lock().unwrap();
            while items.len() < n {
                match overflow.pop_front() {
                    Some(item) => items.push(item),
                    None => break,
                }
            }
        }

        if items.len() < n {
            let remaining = n - items.len();
            let raw = self
                .guarded("lpop", self.backend.lpop_n(WRITE_QUEUE_KEY, remaining))
                .await
                .unwrap_or_default();
            for bytes in raw {
                match serde_json::from_slice::<QueueItem>(&bytes) {
                    Ok(item) => items.push(item),
                    Err(e) => warn!(error = %e, "write-queue item deserialize failed, dropping"),
                }
            }
        }
        items
    }

    /// Put failed items back at the queue tail with their attempt count bumped.
    pub async fn requeue_writes(&self, items: Vec<QueueItem>) {
        for mut item in items {
            item.attempts += 1;
            self.push_write(item).await;
        }
    }

    /// Park an item that exhausted its retries.
    pub async fn dead_letter(&self, item: &QueueItem) {
        if let Ok(bytes) = serde_json::to_vec(item) {
            let _ = self
                .guarded("rpush", self.backend.rpush(DEAD_LETTER_KEY, &bytes))
                .await;
        }
    }

    pub async fn queue_len(&self) -> usize {
        let backend_len = self
            .guarded("llen", self.backend.llen(WRITE_QUEUE_KEY))
            .await
            .unwrap_or(0);
        backend_len + self.overflow.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::Utc;
    use herald_core::types::FileKind;

    use crate::error::CacheError;
    use crate::memory::MemoryBackend;
    use crate::queue::WriteOp;

    fn handle() -> CacheHandle {
        CacheHandle::new(Arc::new(MemoryBackend::new()), &CacheConfig::default())
    }

    fn test_user(id: i64) -> User {
        User {
            id,
            display_name: "alice".into(),
            preferred_model: None,
            custom_personality: None,
            balance: rust_decimal::Decimal::ONE,
            is_premium: false,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn test_artifact(temp_id: &str, thread_id: &str) -> ExecArtifact {
        ExecArtifact {
            temp_id: temp_id.into(),
            thread_id: thread_id.into(),
            filename: "out.png".into(),
            mime: "image/png".into(),
            context: None,
            bytes: vec![1, 2, 3],
            preview: None,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn user_roundtrip_and_invalidate() {
        let cache = handle();
        cache.put_user(&test_user(42)).await;
        assert_eq!(cache.get_user(42).await.unwrap().display_name, "alice");
        cache.invalidate_user(42).await;
        assert!(cache.get_user(42).await.is_none());
    }

    #[tokio::test]
    async fn artifact_take_removes_from_index() {
        let cache = handle();
        assert!(cache.put_artifact(&test_artifact("t1", "th")).await);
        assert!(cache.put_artifact(&test_artifact("t2", "th")).await);
        assert_eq!(cache.list_artifacts("th").await.len(), 2);

        let taken = cache.take_artifact("t1").await.unwrap();
        assert_eq!(taken.temp_id, "t1");
        let remaining = cache.list_artifacts("th").await;
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].temp_id, "t2");
        assert!(cache.take_artifact("t1").await.is_none());
    }

    #[tokio::test]
    async fn write_queue_is_fifo() {
        let cache = handle();
        for id in ["a", "b", "c"] {
            cache
                .push_write(QueueItem::new(WriteOp::FileDelete {
                    file_id: id.into(),
                }))
                .await;
        }
        let popped = cache.pop_writes(2).await;
        let ids: Vec<_> = popped
            .iter()
            .map(|i| match &i.op {
                WriteOp::FileDelete { file_id } => file_id.clone(),
                _ => unreachable!(),
            })
            .collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert_eq!(cache.queue_len().await, 1);
    }

    /// Backend that always fails — drives breaker + overflow behavior.
    struct FailingBackend;

    #[async_trait]
    impl KvBackend for FailingBackend {
        async fn get(&self, _: &str) -> Result<Option<Vec<u8>>> {
            Err(CacheError::Backend("down".into()))
        }
        async fn set(&self, _: &str, _: &[u8], _: Option<Duration>) -> Result<()> {
            Err(CacheError::Backend("down".into()))
        }
        async fn del(&self, _: &str) -> Result<()> {
            Err(CacheError::Backend("down".into()))
        }
        async fn rpush(&self, _: &str, _: &[u8]) -> Result<()> {
            Err(CacheError::Backend("down".into()))
        }
        async fn lpop_n(&self, _: &str, _: usize) -> Result<Vec<Vec<u8>>> {
            Err(CacheError::Backend("down".into()))
        }
        async fn llen(&self, _: &str) -> Result<usize> {
            Err(CacheError::Backend("down".into()))
        }
        async fn sadd(&self, _: &str, _: &str) -> Result<()> {
            Err(CacheError::Backend("down".into()))
        }
        async fn srem(&self, _: &str, _: &str) -> Result<()> {
            Err(CacheError::Backend("down".into()))
        }
        async fn smembers(&self, _: &str) -> Result<Vec<String>> {
            Err(CacheError::Backend("down".into()))
        }
        async fn set_and_index(
            &self,
            _: &str,
            _: &[u8],
            _: Option<Duration>,
            _: &str,
            _: &str,
        ) -> Result<()> {
            Err(CacheError::Backend("down".into()))
        }
        async fn del_and_unindex(&self, _: &str, _: &str, _: &str) -> Result<()> {
            Err(CacheError::Backend("down".into()))
        }
    }

    #[tokio::test]
    async fn failing_backend_degrades_to_misses() {
        let cache = CacheHandle::new(Arc::new(FailingBackend), &CacheConfig::default());
        assert!(cache.get_user(1).await.is_none());
        cache.put_user(&test_user(1)).await; // dropped, no panic
        assert!(cache.get_user(1).await.is_none());
    }

    #[tokio::test]
    async fn queue_pushes_overflow_when_backend_down() {
        let cache = CacheHandle::new(Arc::new(FailingBackend), &CacheConfig::default());
        for _ in 0..5 {
            cache
                .push_write(QueueItem::new(WriteOp::FileDelete {
                    file_id: "x".into(),
                }))
                .await;
        }
        // All five are buffered in-process and drainable despite the outage.
        assert_eq!(cache.pop_writes(10).await.len(), 5);
    }

    #[tokio::test]
    async fn file_list_append_in_place() {
        let cache = handle();
        let file = UserFile {
            id: "f1".into(),
            thread_id: "th".into(),
            source_ref: None,
            provider_file_id: "pf1".into(),
            filename: "a.png".into(),
            kind: FileKind::Image,
            mime: "image/png".into(),
            size: 10,
            uploaded_at: Utc::now(),
            expires_at: Utc::now(),
            origin: herald_core::types::FileOrigin::User,
            upload_context: None,
            metadata: None,
        };
        cache.put_files("th", &[file.clone()]).await;
        let mut second = file.clone();
        second.id = "f2".into();
        cache.add_file(&second).await;
        let files = cache.get_files("th").await.unwrap();
        assert_eq!(files.len(), 2);
        cache.remove_file("th", "f1").await;
        assert_eq!(cache.get_files("th").await.unwrap().len(), 1);
    }
}
