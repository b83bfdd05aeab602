//! Image generation service client. Billed per image.

use base64::Engine;
use serde::Deserialize;

use herald_core::config::ServiceEndpoint;
use herald_core::{HeraldError, Result};

use super::ServiceHttp;

#[derive(Clone)]
pub struct ImageGenClient {
    http: ServiceHttp,
}

#[derive(Debug)]
pub struct GeneratedImage {
    pub bytes: Vec<u8>,
    pub revised_prompt: String,
    pub mime: String,
}

#[derive(Deserialize)]
struct ImageResponse {
    image_base64: String,
    #[serde(default)]
    revised_prompt: String,
    #[serde(default = "default_mime")]
    mime: String,
}

fn default_mime() -> String {
    "image/png".to_string()
}

impl ImageGenClient {
    pub fn new(endpoint: &ServiceEndpoint) -> Self {
        Self {
            http: ServiceHttp::new(endpoint),
        }
    }

    pub async fn generate(
        &self,
        prompt: &str,
        aspect_ratio: &str,
        resolution: &str,
    ) -> Result<GeneratedImage> {
        let resp = self
            .http
            .post("/images")
            .json(&serde_json::json!({
                "prompt": prompt,
                "aspect_ratio": aspect_ratio,
                "resolution": resolution,
            }))
            .send()
            .await
            .map_err(|e| imagegen_err(e.to_string()))?;
        let parsed: ImageResponse = ServiceHttp::check(resp, "generate_image")
            .await?
            .json()
            .await
            .map_err(|e| imagegen_err(e.to_string()))?;

        let bytes = base64::engine::general_purpose::STANDARD
            .decode(parsed.image_base64.as_bytes())
            .map_err(|e| imagegen_err(format!("bad image payload: {e}")))?;
        Ok(GeneratedImage {
            bytes,
            revised_prompt: parsed.revised_prompt,
            mime: parsed.mime,
        })
    }
}

fn imagegen_err(reason: String) -> HeraldError {
    HeraldError::Tool {
        tool: "generate_image".into(),
        reason,
    }
}
