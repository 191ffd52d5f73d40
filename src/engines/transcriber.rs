//! `Transcriber.transcribe(wav, lang_hint) -> {language, segments[]}`
//! (spec §4.2): each segment has `start`, `end`, `text`, and word-level
//! timestamps whose spans lie inside `[start, end]`. Post-processing
//! splits on silence gaps >= the configured threshold.

use super::{TranscribedSegment, TranscriptionResult};
use crate::error::{DubError, Result};
use crate::segment::WordTimestamp;
use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use tokio::fs;
use tracing::{debug, warn};

const WHISPER_API_URL: &str = "https://api.openai.com/v1/audio/transcriptions";
const MAX_RETRIES: u32 = 3;
const BASE_DELAY_MS: u64 = 1000;

#[async_trait]
pub trait TranscriberEngine: Send + Sync {
    async fn transcribe(&self, wav: &Path, lang_hint: Option<&str>) -> Result<TranscriptionResult>;
}

/// OpenAI Whisper API client (grounded in the teacher's
/// `transcribe::whisper::WhisperClient`).
pub struct WhisperTranscriber {
    client: reqwest::Client,
    api_key: String,
}

impl WhisperTranscriber {
    pub fn new(api_key: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key,
        }
    }

    async fn build_form(&self, wav: &Path, lang_hint: Option<&str>) -> Result<Form> {
        let bytes = fs::read(wav).await?;
        let file_name = wav
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("audio.wav")
            .to_string();

        let part = Part::bytes(bytes).file_name(file_name).mime_str("audio/wav")?;
        let mut form = Form::new()
            .part("file", part)
            .text("model", "whisper-1")
            .text("response_format", "verbose_json")
            .text("timestamp_granularities[]", "word")
            .text("timestamp_granularities[]", "segment");

        if let Some(lang) = lang_hint {
            if lang != "auto" {
                form = form.text("language", lang.to_string());
            }
        }
        Ok(form)
    }

    async fn call_api(&self, form: Form) -> Result<WhisperResponse> {
        let response = self
            .client
            .post(WHISPER_API_URL)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .multipart(form)
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        debug!("whisper response status: {status}");

        if status.is_success() {
            return Ok(serde_json::from_str(&body)?);
        }

        if status.is_client_error() {
            return Err(DubError::EngineFailure(format!("whisper API error ({status}): {body}")));
        }
        Err(DubError::EngineFailure(format!("whisper API error ({status}): {body}")))
    }

    async fn transcribe_with_retry(&self, wav: &Path, lang_hint: Option<&str>) -> Result<WhisperResponse> {
        let mut last_error = None;
        for attempt in 0..MAX_RETRIES {
            if attempt > 0 {
                let delay = BASE_DELAY_MS * 2u64.pow(attempt - 1);
                tokio::time::sleep(Duration::from_millis(delay)).await;
            }
            let form = self.build_form(wav, lang_hint).await?;
            match self.call_api(form).await {
                Ok(response) => return Ok(response),
                Err(DubError::EngineFailure(msg)) if msg.contains("error (4") => {
                    return Err(DubError::EngineFailure(msg));
                }
                Err(e) => {
                    warn!("whisper attempt {} failed: {e}", attempt + 1);
                    last_error = Some(e);
                }
            }
        }
        Err(last_error.unwrap_or_else(|| DubError::EngineFailure("unknown whisper failure".to_string())))
    }
}

#[async_trait]
impl TranscriberEngine for WhisperTranscriber {
    async fn transcribe(&self, wav: &Path, lang_hint: Option<&str>) -> Result<TranscriptionResult> {
        let response = self.transcribe_with_retry(wav, lang_hint).await?;
        let raw_segments = response.segments.unwrap_or_else(|| {
            vec![WhisperSegment {
                start: 0.0,
                end: response.duration,
                text: response.text.clone(),
            }]
        });

        let words: Vec<WordTimestamp> = response
            .words
            .unwrap_or_default()
            .into_iter()
            .map(|w| WordTimestamp {
                word: w.word,
                start: w.start,
                end: w.end,
            })
            .collect();

        let segments = raw_segments
            .into_iter()
            .map(|s| TranscribedSegment {
                start: s.start,
                end: s.end,
                text: s.text.trim().to_string(),
                words: words_within(&words, s.start, s.end),
            })
            .collect();

        Ok(TranscriptionResult {
            language: response.language,
            segments,
        })
    }
}

fn words_within(words: &[WordTimestamp], start: f64, end: f64) -> Option<Vec<WordTimestamp>> {
    let within: Vec<WordTimestamp> = words
        .iter()
        .filter(|w| w.start >= start - 0.05 && w.end <= end + 0.05)
        .cloned()
        .collect();
    if within.is_empty() {
        None
    } else {
        Some(within)
    }
}

/// Splits segments with an internal gap in their word timestamps >=
/// `gap_s` into multiple segments, used for post-processing per the
/// transcriber contract (spec §4.2).
pub fn split_on_silence(segments: Vec<TranscribedSegment>, gap_s: f64) -> Vec<TranscribedSegment> {
    let mut out = Vec::new();
    for seg in segments {
        let Some(words) = &seg.words else {
            out.push(seg);
            continue;
        };
        if words.len() < 2 {
            out.push(seg);
            continue;
        }

        let mut current_words = vec![words[0].clone()];
        let mut splits = Vec::new();
        for pair in words.windows(2) {
            if pair[1].start - pair[0].end >= gap_s {
                splits.push(current_words.clone());
                current_words = vec![pair[1].clone()];
            } else {
                current_words.push(pair[1].clone());
            }
        }
        splits.push(current_words);

        if splits.len() == 1 {
            out.push(seg);
            continue;
        }

        for group in splits {
            let text = group.iter().map(|w| w.word.as_str()).collect::<Vec<_>>().join(" ");
            out.push(TranscribedSegment {
                start: group.first().unwrap().start,
                end: group.last().unwrap().end,
                text,
                words: Some(group),
            });
        }
    }
    out
}

#[derive(Debug, Deserialize)]
struct WhisperResponse {
    text: String,
    #[serde(default)]
    segments: Option<Vec<WhisperSegment>>,
    #[serde(default)]
    words: Option<Vec<WhisperWord>>,
    language: String,
    duration: f64,
}

#[derive(Debug, Deserialize)]
struct WhisperSegment {
    start: f64,
    end: f64,
    text: String,
}

#[derive(Debug, Deserialize)]
struct WhisperWord {
    word: String,
    start: f64,
    end: f64,
}

/// Gemini-based transcription, offered as an alternative backend (spec
/// §6 configuration: `default_transcriber`).
pub struct GeminiTranscriber {
    client: reqwest::Client,
    api_key: String,
    model: String,
}

impl GeminiTranscriber {
    pub fn new(api_key: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key,
            model: "gemini-2.0-flash".to_string(),
        }
    }
}

#[async_trait]
impl TranscriberEngine for GeminiTranscriber {
    async fn transcribe(&self, wav: &Path, lang_hint: Option<&str>) -> Result<TranscriptionResult> {
        use base64::{engine::general_purpose::STANDARD, Engine as _};

        let bytes = fs::read(wav).await?;
        let audio_b64 = STANDARD.encode(bytes);
        let lang_instruction = lang_hint
            .filter(|l| *l != "auto")
            .map(|l| format!(" The spoken language is {l}."))
            .unwrap_or_default();

        let prompt = format!(
            "Transcribe this audio.{lang_instruction} Return a JSON array of objects \
             {{start, end, text}} in seconds, covering the whole clip with no gaps."
        );

        let request = serde_json::json!({
            "contents": [{
                "parts": [
                    {"text": prompt},
                    {"inline_data": {"mime_type": "audio/wav", "data": audio_b64}}
                ]
            }]
        });

        let url = format!(
            "https://generativelanguage.googleapis.com/v1beta/models/{}:generateContent?key={}",
            self.model, self.api_key
        );

        let response = self.client.post(&url).json(&request).send().await?;
        let status = response.status();
        let body = response.text().await?;

        if !status.is_success() {
            return Err(DubError::EngineFailure(format!("gemini API error ({status}): {body}")));
        }

        let parsed: GeminiGenerateResponse = serde_json::from_str(&body)?;
        let text = parsed
            .candidates
            .into_iter()
            .next()
            .and_then(|c| c.content)
            .and_then(|c| c.parts)
            .into_iter()
            .flatten()
            .next()
            .and_then(|p| p.text)
            .unwrap_or_default();

        let json_text = extract_json_array(&text);
        let raw_segments: Vec<GeminiRawSegment> = serde_json::from_str(json_text)
            .map_err(|e| DubError::EngineFailure(format!("failed to parse gemini transcript JSON: {e}")))?;

        let segments = raw_segments
            .into_iter()
            .map(|s| TranscribedSegment {
                start: s.start,
                end: s.end,
                text: s.text,
                words: None,
            })
            .collect();

        Ok(TranscriptionResult {
            language: lang_hint.unwrap_or("auto").to_string(),
            segments,
        })
    }
}

fn extract_json_array(text: &str) -> &str {
    let start = text.find('[').unwrap_or(0);
    let end = text.rfind(']').map(|p| p + 1).unwrap_or(text.len());
    &text[start..end]
}

#[derive(Debug, Deserialize)]
struct GeminiRawSegment {
    start: f64,
    end: f64,
    text: String,
}

#[derive(Debug, Deserialize)]
struct GeminiGenerateResponse {
    candidates: Vec<GeminiCandidate>,
}

#[derive(Debug, Deserialize)]
struct GeminiCandidate {
    content: Option<GeminiContent>,
}

#[derive(Debug, Deserialize)]
struct GeminiContent {
    parts: Option<Vec<GeminiPart>>,
}

#[derive(Debug, Deserialize)]
struct GeminiPart {
    text: Option<String>,
}
