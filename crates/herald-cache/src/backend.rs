//! Backend abstraction: the handful of key-value operations the typed
//! cache surface needs. Implemented by `RedisBackend` (production) and
//! `MemoryBackend` (no redis configured, and tests).

use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;

#[async_trait]
pub trait KvBackend: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Set a value; `ttl = None` means no expiry.
    async fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> Result<()>;

    async fn del(&self, key: &str) -> Result<()>;

    /// Append to the tail of a list (queue push).
    async fn rpush(&self, key: &str, value: &[u8]) -> Result<()>;

    /// Pop up to `n` items from the head of a list, FIFO.
    async fn lpop_n(&self, key: &str, n: usize) -> Result<Vec<Vec<u8>>>;

    async fn llen(&self, key: &str) -> Result<usize>;

    async fn sadd(&self, key: &str, member: &str) -> Result<()>;

    async fn srem(&self, key: &str, member: &str) -> Result<()>;

    async fn smembers(&self, key: &str) -> Result<Vec<String>>;

    /// Set `key` and add `member` to `set_key` atomically (artifact create).
    async fn set_and_index(
        &self,
        key: &str,
        value: &[u8],
        ttl: Option<Duration>,
        set_key: &str,
        member: &str,
    ) -> Result<()>;

    /// Delete `key` and remove `member` from `set_key` atomically
    /// (artifact delivery / expiry).
    async fn del_and_unindex(&self, key: &str, set_key: &str, member: &str) -> Result<()>;
}
