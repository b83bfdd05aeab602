//! Anthropic Files API client: upload, download, delete — plus the TTL
//! cleaner that retires expired `UserFile` rows and their provider files.
//!
//! Downloaded bytes are cached; uploads are not (the provider holds them).

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use herald_cache::CacheHandle;
use herald_core::config::AnthropicConfig;
use herald_core::{HeraldError, Result};
use herald_store::Store;

const API_VERSION: &str = "2023-06-01";
const FILES_BETA: &str = "files-api-2025-04-14";
/// Sweep cadence for expired provider files.
const CLEANER_INTERVAL_SECS: u64 = 600;

pub struct FilesClient {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
}

#[derive(Debug, Deserialize)]
pub struct UploadedFile {
    pub id: String,
    #[serde(default)]
    pub filename: String,
    #[serde(default)]
    pub size_bytes: i64,
}

impl FilesClient {
    pub fn new(cfg: &AnthropicConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key: cfg.api_key.clone(),
            base_url: cfg.base_url.clone(),
        }
    }

    fn headers(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        builder
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .header("anthropic-beta", FILES_BETA)
    }

    /// Upload bytes, returning the provider file id.
    pub async fn upload(&self, filename: &str, mime: &str, bytes: Vec<u8>) -> Result<UploadedFile> {
        let part = reqwest::multipart::Part::bytes(bytes)
            .file_name(filename.to_string())
            .mime_str(mime)
            .map_err(|e| HeraldError::FileService(e.to_string()))?;
        let form = reqwest::multipart::Form::new().part("file", part);

        let resp = self
            .headers(self.client.post(format!("{}/v1/files", self.base_url)))
            .multipart(form)
            .send()
            .await
            .map_err(|e| HeraldError::FileService(e.to_string()))?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(HeraldError::FileService(format!(
                "upload failed ({status}): {body}"
            )));
        }
        resp.json()
            .await
            .map_err(|e| HeraldError::FileService(e.to_string()))
    }

    /// Download file content, cache-first.
    pub async fn download(&self, cache: &CacheHandle, file_id: &str) -> Result<Vec<u8>> {
        if let Some(bytes) = cache.get_file_bytes(file_id).await {
            debug!(file_id, "file bytes cache hit");
            return Ok(bytes);
        }

        let resp = self
            .headers(
                self.client
                    .get(format!("{}/v1/files/{}/content", self.base_url, file_id)),
            )
            .send()
            .await
            .map_err(|e| HeraldError::FileService(e.to_string()))?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            return Err(HeraldError::FileService(format!(
                "download of {file_id} failed ({status})"
            )));
        }
        let bytes = resp
            .bytes()
            .await
            .map_err(|e| HeraldError::FileService(e.to_string()))?
            .to_vec();
        cache.put_file_bytes(file_id, &bytes).await;
        Ok(bytes)
    }

    pub async fn delete(&self, file_id: &str) -> Result<()> {
        let resp = self
            .headers(
                self.client
                    .delete(format!("{}/v1/files/{}", self.base_url, file_id)),
            )
            .send()
            .await
            .map_err(|e| HeraldError::FileService(e.to_string()))?;

        // 404 counts as deleted — the provider may have expired it first.
        if !resp.status().is_success() && resp.status().as_u16() != 404 {
            let status = resp.status().as_u16();
            return Err(HeraldError::FileService(format!(
                "delete of {file_id} failed ({status})"
            )));
        }
        Ok(())
    }
}

/// Background sweep: when `now >= expires_at`, delete the provider-side
/// file, the row, and every cache trace of it.
pub fn spawn_ttl_cleaner(
    files: Arc<FilesClient>,
    store: Arc<Store>,
    cache: Arc<CacheHandle>,
    shutdown: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(CLEANER_INTERVAL_SECS));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    sweep_expired(&files, &store, &cache).await;
                }
                _ = shutdown.cancelled() => return,
            }
        }
    })
}

async fn sweep_expired(files: &FilesClient, store: &Store, cache: &CacheHandle) {
    let expired = match store.expired_files(chrono::Utc::now()) {
        Ok(list) => list,
        Err(e) => {
            warn!(error = %e, "ttl cleaner: expiry query failed");
            return;
        }
    };
    if expired.is_empty() {
        return;
    }
    info!(count = expired.len(), "ttl cleaner: retiring expired files");

    for file in expired {
        if let Err(e) = files.delete(&file.provider_file_id).await {
            // Keep the row; the next sweep retries.
            warn!(file_id = %file.id, error = %e, "ttl cleaner: provider delete failed");
            continue;
        }
        if let Err(e) = store.delete_user_file(&file.id) {
            warn!(file_id = %file.id, error = %e, "ttl cleaner: row delete failed");
            continue;
        }
        cache.del_file_bytes(&file.provider_file_id).await;
        cache.remove_file(&file.thread_id, &file.id).await;
    }
}
