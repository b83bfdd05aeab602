//! Thin reqwest clients for the external tool services.

pub mod imagegen;
pub mod latex;
pub mod sandbox;
pub mod transcribe;

use std::time::Duration;

use herald_core::config::ServiceEndpoint;
use herald_core::{HeraldError, Result};

/// Shared request plumbing for the service clients: base url, bearer key,
/// per-service timeout.
#[derive(Clone)]
pub(crate) struct ServiceHttp {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl ServiceHttp {
    pub(crate) fn new(endpoint: &ServiceEndpoint) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(endpoint.timeout_secs))
            .build()
            .unwrap_or_default();
        Self {
            client,
            base_url: endpoint.base_url.trim_end_matches('/').to_string(),
            api_key: endpoint.api_key.clone(),
        }
    }

    pub(crate) fn post(&self, path: &str) -> reqwest::RequestBuilder {
        let mut builder = self.client.post(format!("{}{}", self.base_url, path));
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }
        builder
    }

    pub(crate) fn get(&self, path: &str) -> reqwest::RequestBuilder {
        let mut builder = self.client.get(format!("{}{}", self.base_url, path));
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }
        builder
    }

    pub(crate) async fn check(resp: reqwest::Response, what: &str) -> Result<reqwest::Response> {
        if resp.status().is_success() {
            return Ok(resp);
        }
        let status = resp.status().as_u16();
        let body = resp.text().await.unwrap_or_default();
        Err(HeraldError::Tool {
            tool: what.to_string(),
            reason: format!("service error ({status}): {body}"),
        })
    }
}
