//! LaTeX rendering service client: source in, PNG out.

use herald_core::config::ServiceEndpoint;
use herald_core::{HeraldError, Result};

use super::ServiceHttp;

#[derive(Clone)]
pub struct LatexClient {
    http: ServiceHttp,
}

impl LatexClient {
    pub fn new(endpoint: &ServiceEndpoint) -> Self {
        Self {
            http: ServiceHttp::new(endpoint),
        }
    }

    pub async fn render(&self, source: &str, dpi: u32) -> Result<Vec<u8>> {
        let resp = self
            .http
            .post("/render")
            .json(&serde_json::json!({ "source": source, "dpi": dpi }))
            .send()
            .await
            .map_err(|e| latex_err(e.to_string()))?;
        Ok(ServiceHttp::check(resp, "render_latex")
            .await?
            .bytes()
            .await
            .map_err(|e| latex_err(e.to_string()))?
            .to_vec())
    }
}

fn latex_err(reason: String) -> HeraldError {
    HeraldError::Tool {
        tool: "render_latex".into(),
        reason,
    }
}
