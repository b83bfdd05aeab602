//! Sandboxed code execution service client.
//!
//! Sandboxes are reused by opaque handle, cached per thread so successive
//! `execute_python` calls in one conversation share installed packages and
//! files. Billable by wall time.

use serde::Deserialize;
use tracing::debug;

use herald_cache::CacheHandle;
use herald_core::config::ServiceEndpoint;
use herald_core::{HeraldError, Result};

use super::ServiceHttp;

/// Output directory harvested for deferred-delivery files.
pub const OUTPUT_DIR: &str = "/output";

#[derive(Clone)]
pub struct SandboxClient {
    http: ServiceHttp,
}

#[derive(Debug, Deserialize)]
pub struct ExecResult {
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
    pub exit_code: i32,
    /// Wall-clock seconds, the billing basis.
    pub duration_seconds: f64,
}

#[derive(Debug, Deserialize)]
pub struct SandboxFile {
    pub id: String,
    pub path: String,
    pub size: i64,
}

#[derive(Deserialize)]
struct CreatedSandbox {
    id: String,
}

impl SandboxClient {
    pub fn new(endpoint: &ServiceEndpoint) -> Self {
        Self {
            http: ServiceHttp::new(endpoint),
        }
    }

    /// Get the thread's sandbox handle, creating a sandbox on first use.
    /// The handle lives in the cache; on expiry a fresh sandbox is made.
    pub async fn ensure_sandbox(&self, cache: &CacheHandle, thread_id: &str) -> Result<String> {
        if let Some(bytes) = cache.get_file_bytes(&format!("sandbox:{thread_id}")).await {
            if let Ok(handle) = String::from_utf8(bytes) {
                debug!(thread_id, handle, "reusing cached sandbox");
                return Ok(handle);
            }
        }

        let resp = self
            .http
            .post("/sandboxes")
            .json(&serde_json::json!({ "internet": true, "pip": true }))
            .send()
            .await
            .map_err(|e| sandbox_err(e.to_string()))?;
        let created: CreatedSandbox = ServiceHttp::check(resp, "execute_python")
            .await?
            .json()
            .await
            .map_err(|e| sandbox_err(e.to_string()))?;

        cache
            .put_file_bytes(&format!("sandbox:{thread_id}"), created.id.as_bytes())
            .await;
        Ok(created.id)
    }

    pub async fn upload_file(
        &self,
        handle: &str,
        path: &str,
        bytes: Vec<u8>,
    ) -> Result<()> {
        let part = reqwest::multipart::Part::bytes(bytes).file_name(path.to_string());
        let form = reqwest::multipart::Form::new()
            .text("path", path.to_string())
            .part("file", part);
        let resp = self
            .http
            .post(&format!("/sandboxes/{handle}/files"))
            .multipart(form)
            .send()
            .await
            .map_err(|e| sandbox_err(e.to_string()))?;
        ServiceHttp::check(resp, "execute_python").await?;
        Ok(())
    }

    pub async fn run(&self, handle: &str, code: &str, timeout_secs: u64) -> Result<ExecResult> {
        let resp = self
            .http
            .post(&format!("/sandboxes/{handle}/exec"))
            .json(&serde_json::json!({
                "code": code,
                "timeout_seconds": timeout_secs,
            }))
            .send()
            .await
            .map_err(|e| sandbox_err(e.to_string()))?;
        ServiceHttp::check(resp, "execute_python")
            .await?
            .json()
            .await
            .map_err(|e| sandbox_err(e.to_string()))
    }

    /// Files created under `path` since the marker timestamp (RFC 3339).
    pub async fn list_new_files(
        &self,
        handle: &str,
        path: &str,
        since: &str,
    ) -> Result<Vec<SandboxFile>> {
        let resp = self
            .http
            .get(&format!("/sandboxes/{handle}/files"))
            .query(&[("path", path), ("since", since)])
            .send()
            .await
            .map_err(|e| sandbox_err(e.to_string()))?;
        ServiceHttp::check(resp, "execute_python")
            .await?
            .json()
            .await
            .map_err(|e| sandbox_err(e.to_string()))
    }

    pub async fn download_file(&self, handle: &str, file_id: &str) -> Result<Vec<u8>> {
        let resp = self
            .http
            .get(&format!("/sandboxes/{handle}/files/{file_id}"))
            .send()
            .await
            .map_err(|e| sandbox_err(e.to_string()))?;
        Ok(ServiceHttp::check(resp, "execute_python")
            .await?
            .bytes()
            .await
            .map_err(|e| sandbox_err(e.to_string()))?
            .to_vec())
    }
}

fn sandbox_err(reason: String) -> HeraldError {
    HeraldError::Tool {
        tool: "execute_python".into(),
        reason,
    }
}
