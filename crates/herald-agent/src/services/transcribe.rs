//! Transcription service client. Billed per audio minute.

use serde::Deserialize;

use herald_core::config::ServiceEndpoint;
use herald_core::{HeraldError, Result};

use super::ServiceHttp;

#[derive(Clone)]
pub struct TranscribeClient {
    http: ServiceHttp,
}

#[derive(Debug, Deserialize)]
pub struct Transcription {
    pub text: String,
    #[serde(default)]
    pub language: String,
    /// Audio length in seconds, the billing basis.
    pub duration_seconds: f64,
    #[serde(default)]
    pub segments: Vec<Segment>,
}

#[derive(Debug, Deserialize)]
pub struct Segment {
    pub start: f64,
    pub end: f64,
    pub text: String,
}

impl TranscribeClient {
    pub fn new(endpoint: &ServiceEndpoint) -> Self {
        Self {
            http: ServiceHttp::new(endpoint),
        }
    }

    pub async fn transcribe(&self, filename: &str, mime: &str, bytes: Vec<u8>) -> Result<Transcription> {
        let part = reqwest::multipart::Part::bytes(bytes)
            .file_name(filename.to_string())
            .mime_str(mime)
            .map_err(|e| transcribe_err(e.to_string()))?;
        let form = reqwest::multipart::Form::new().part("audio", part);

        let resp = self
            .http
            .post("/transcriptions")
            .multipart(form)
            .send()
            .await
            .map_err(|e| transcribe_err(e.to_string()))?;
        ServiceHttp::check(resp, "transcribe_audio")
            .await?
            .json()
            .await
            .map_err(|e| transcribe_err(e.to_string()))
    }
}

fn transcribe_err(reason: String) -> HeraldError {
    HeraldError::Tool {
        tool: "transcribe_audio".into(),
        reason,
    }
}
