//! In-process backend: dashmaps with per-entry expiry instants.
//!
//! Used when no redis URL is configured and throughout the test suite.
//! Expired entries are dropped lazily on read; `sweep()` exists for the
//! gateway's periodic cleanup task.

use std::collections::{HashSet, VecDeque};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;

use crate::backend::KvBackend;
use crate::error::Result;

struct Entry {
    value: Vec<u8>,
    expires_at: Option<Instant>,
}

impl Entry {
    fn expired(&self) -> bool {
        self.expires_at.is_some_and(|at| Instant::now() >= at)
    }
}

#[derive(Default)]
pub struct MemoryBackend {
    values: DashMap<String, Entry>,
    lists: DashMap<String, VecDeque<Vec<u8>>>,
    sets: DashMap<String, HashSet<String>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop every expired value entry. Lists and sets carry no TTL.
    pub fn sweep(&self) {
        self.values.retain(|_, entry| !entry.expired());
    }
}

#[async_trait]
impl KvBackend for MemoryBackend {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        if let Some(entry) = self.values.get(key) {
            if entry.expired() {
                drop(entry);
                self.values.remove(key);
                return Ok(None);
            }
            return Ok(Some(entry.value.clone()));
        }
        Ok(None)
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> Result<()> {
        self.values.insert(
            key.to_string(),
            Entry {
                value: value.to_vec(),
                expires_at: ttl.map(|d| Instant::now() + d),
            },
        );
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<()> {
        self.values.remove(key);
        Ok(())
    }

    async fn rpush(&self, key: &str, value: &[u8]) -> Result<()> {
        self.lists
            .entry(key.to_string())
            .or_default()
            .push_back(value.to_vec());
        Ok(())
    }

    async fn lpop_n(&self, key: &str, n: usize) -> Result<Vec<Vec<u8>>> {
        let mut out = Vec::new();
        if let Some(mut list) = self.lists.get_mut(key) {
            while out.len() < n {
                match list.pop_front() {
                    Some(item) => out.push(item),
                    None => break,
                }
            }
        }
        Ok(out)
    }

    async fn llen(&self, key: &str) -> Result<usize> {
        Ok(self.lists.get(key).map(|l| l.len()).unwrap_or(0))
    }

    async fn sadd(&self, key: &str, member: &str) -> Result<()> {
        self.sets
            .entry(key.to_string())
            .or_default()
            .insert(member.to_string());
        Ok(())
    }

    async fn srem(&self, key: &str, member: &str) -> Result<()> {
        if let Some(mut set) = self.sets.get_mut(key) {
            set.remove(member);
        }
        Ok(())
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>> {
        Ok(self
            .sets
            .get(key)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn set_and_index(
        &self,
        key: &str,
        value: &[u8],
        ttl: Option<Duration>,
        set_key: &str,
        member: &str,
    ) -> Result<()> {
        self.set(key, value, ttl).await?;
        self.sadd(set_key, member).await
    }

    async fn del_and_unindex(&self, key: &str, set_key: &str, member: &str) -> Result<()> {
        self.del(key).await?;
        self.srem(set_key, member).await
    }
}
