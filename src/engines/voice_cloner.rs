//! `VoiceCloner.clone(reference_wav, target_text) -> wav` (spec §4.2):
//! reproduces the timbre of `reference_wav` speaking `target_text`.
//!
//! No engine in the teacher's own stack touches voice synthesis; this
//! adapter reuses the same `reqwest` multipart-upload-plus-JSON-response
//! shape the teacher uses for `WhisperClient`, pointed at a configured
//! voice-cloning HTTP service instead of OpenAI's.

use crate::error::{DubError, Result};
use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use serde::Deserialize;
use std::path::Path;
use tokio::fs;
use tracing::debug;

#[async_trait]
pub trait VoiceClonerEngine: Send + Sync {
    /// Writes the cloned audio to `dest` and returns its duration in seconds.
    async fn clone(&self, reference_wav: &Path, target_text: &str, dest: &Path) -> Result<f64>;
}

pub struct HttpVoiceCloner {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpVoiceCloner {
    pub fn new(endpoint: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint,
        }
    }
}

#[async_trait]
impl VoiceClonerEngine for HttpVoiceCloner {
    async fn clone(&self, reference_wav: &Path, target_text: &str, dest: &Path) -> Result<f64> {
        let reference_bytes = fs::read(reference_wav).await?;
        let part = Part::bytes(reference_bytes)
            .file_name("reference.wav")
            .mime_str("audio/wav")?;

        let form = Form::new().part("reference_audio", part).text("text", target_text.to_string());

        let url = format!("{}/clone", self.endpoint.trim_end_matches('/'));
        let response = self.client.post(&url).multipart(form).send().await?;
        let status = response.status();

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(DubError::EngineFailure(format!("voice clone service error ({status}): {body}")));
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();

        if content_type.contains("audio") {
            let bytes = response.bytes().await?;
            if let Some(parent) = dest.parent() {
                fs::create_dir_all(parent).await?;
            }
            fs::write(dest, &bytes).await?;
            debug!("wrote cloned audio to {}", dest.display());
            return crate::engines::audio::probe_duration(dest);
        }

        let body: CloneResponse = response.json().await?;
        let bytes = base64_decode(&body.audio_base64)?;
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(dest, &bytes).await?;
        Ok(body.duration.unwrap_or_else(|| {
            crate::engines::audio::probe_duration(dest).unwrap_or(0.0)
        }))
    }
}

fn base64_decode(s: &str) -> Result<Vec<u8>> {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    STANDARD
        .decode(s)
        .map_err(|e| DubError::EngineFailure(format!("invalid base64 audio payload: {e}")))
}

#[derive(Debug, Deserialize)]
struct CloneResponse {
    audio_base64: String,
    #[serde(default)]
    duration: Option<f64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base64_decode_rejects_invalid_input() {
        assert!(base64_decode("not valid base64!!!").is_err());
    }

    #[test]
    fn test_base64_decode_accepts_valid_input() {
        let bytes = base64_decode("aGVsbG8=").unwrap();
        assert_eq!(bytes, b"hello");
    }
}
