//! `Translator.translate(batch, src_lang, tgt_lang) -> [translated_text]`
//! (spec §4.2): must return a result of equal length; failure of any
//! single batch fails the whole request (retried by the caller, §7).

use crate::error::{DubError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

#[async_trait]
pub trait TranslatorEngine: Send + Sync {
    async fn translate(&self, batch: &[String], src_lang: &str, tgt_lang: &str) -> Result<Vec<String>>;
}

/// Gemini-based batch translator (grounded in the teacher's
/// `translate::gemini::GeminiTranslator`, generalized from single-call to
/// the batch contract this pipeline requires).
pub struct GeminiTranslator {
    client: reqwest::Client,
    api_key: String,
    model: String,
}

impl GeminiTranslator {
    pub fn new(api_key: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key,
            model: "gemini-2.0-flash".to_string(),
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    fn build_prompt(&self, batch: &[String], src_lang: &str, tgt_lang: &str) -> String {
        let src_name = language_code_to_name(src_lang);
        let tgt_name = language_code_to_name(tgt_lang);
        let numbered = batch
            .iter()
            .enumerate()
            .map(|(i, t)| format!("[{}] {}", i + 1, t))
            .collect::<Vec<_>>()
            .join("\n");

        format!(
            "Translate each of the following numbered lines from {src_name} to {tgt_name}.\n\
             Return ONLY the translations in the same numbered format, one per line.\n\n\
             {numbered}"
        )
    }

    fn parse_batch_response(&self, response: &str, count: usize) -> Vec<String> {
        let mut results = Vec::with_capacity(count);
        for i in 1..=count {
            let pattern = format!("[{i}]");
            let next_pattern = format!("[{}]", i + 1);
            if let Some(start) = response.find(&pattern) {
                let text_start = start + pattern.len();
                let text_end = if i < count {
                    response[text_start..]
                        .find(&next_pattern)
                        .map(|p| text_start + p)
                        .unwrap_or(response.len())
                } else {
                    response.len()
                };
                results.push(response[text_start..text_end].trim().to_string());
            }
        }

        if results.len() != count {
            warn!("batch parse got {} of {count} expected translations", results.len());
            results = response
                .lines()
                .filter(|l| !l.trim().is_empty())
                .take(count)
                .map(|l| l.trim().to_string())
                .collect();
        }
        while results.len() < count {
            results.push(String::new());
        }
        results
    }
}

#[derive(Serialize)]
struct GeminiRequest {
    contents: Vec<GeminiContent>,
}

#[derive(Serialize)]
struct GeminiContent {
    parts: Vec<GeminiPart>,
}

#[derive(Serialize)]
struct GeminiPart {
    text: String,
}

#[derive(Deserialize, Debug)]
struct GeminiResponse {
    candidates: Option<Vec<GeminiCandidate>>,
    error: Option<GeminiError>,
}

#[derive(Deserialize, Debug)]
struct GeminiCandidate {
    content: Option<GeminiResponseContent>,
}

#[derive(Deserialize, Debug)]
struct GeminiResponseContent {
    parts: Option<Vec<GeminiResponsePart>>,
}

#[derive(Deserialize, Debug)]
struct GeminiResponsePart {
    text: Option<String>,
}

#[derive(Deserialize, Debug)]
struct GeminiError {
    message: String,
}

#[async_trait]
impl TranslatorEngine for GeminiTranslator {
    async fn translate(&self, batch: &[String], src_lang: &str, tgt_lang: &str) -> Result<Vec<String>> {
        if batch.is_empty() {
            return Ok(vec![]);
        }
        debug!("translating {} text(s) {src_lang} -> {tgt_lang}", batch.len());

        let prompt = self.build_prompt(batch, src_lang, tgt_lang);
        let request = GeminiRequest {
            contents: vec![GeminiContent {
                parts: vec![GeminiPart { text: prompt }],
            }],
        };

        let url = format!(
            "https://generativelanguage.googleapis.com/v1beta/models/{}:generateContent?key={}",
            self.model, self.api_key
        );

        let response = self.client.post(&url).json(&request).send().await?;
        let status = response.status();
        let body = response.text().await?;

        if !status.is_success() {
            return Err(DubError::EngineFailure(format!("translation API error ({status}): {body}")));
        }

        let parsed: GeminiResponse = serde_json::from_str(&body)?;
        if let Some(error) = parsed.error {
            return Err(DubError::EngineFailure(format!("gemini error: {}", error.message)));
        }

        let text = parsed
            .candidates
            .and_then(|c| c.into_iter().next())
            .and_then(|c| c.content)
            .and_then(|c| c.parts)
            .and_then(|p| p.into_iter().next())
            .and_then(|p| p.text)
            .unwrap_or_default();

        Ok(self.parse_batch_response(&text, batch.len()))
    }
}

fn language_code_to_name(code: &str) -> &'static str {
    match code.to_lowercase().as_str() {
        "en" => "English",
        "es" => "Spanish",
        "fr" => "French",
        "de" => "German",
        "it" => "Italian",
        "pt" => "Portuguese",
        "ru" => "Russian",
        "ja" => "Japanese",
        "ko" => "Korean",
        "zh" => "Chinese",
        "ar" => "Arabic",
        "hi" => "Hindi",
        _ => "the target language",
    }
}
