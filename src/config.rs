use crate::error::{DubError, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Transcription provider selection. Any backend satisfying the
/// `Transcriber` trait in `crate::transcribe` is acceptable; these are the
/// ones shipped with the crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TranscriberProvider {
    #[default]
    Whisper,
    Gemini,
}

impl std::fmt::Display for TranscriberProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TranscriberProvider::Whisper => write!(f, "whisper"),
            TranscriberProvider::Gemini => write!(f, "gemini"),
        }
    }
}

impl std::str::FromStr for TranscriberProvider {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "whisper" => Ok(TranscriberProvider::Whisper),
            "gemini" => Ok(TranscriberProvider::Gemini),
            _ => Err(format!("Unknown provider: {s}. Use 'whisper' or 'gemini'")),
        }
    }
}

/// Configuration for the Merger (stage 8).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergerConfig {
    pub max_stretch: f64,
    pub accompaniment_gain_db: f64,
}

impl Default for MergerConfig {
    fn default() -> Self {
        Self {
            max_stretch: 2.0,
            accompaniment_gain_db: -6.0,
        }
    }
}

/// Configuration for the Translator engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranslatorConfig {
    pub batch_size: usize,
    pub max_retries: u32,
}

impl Default for TranslatorConfig {
    fn default() -> Self {
        Self {
            batch_size: 20,
            max_retries: 3,
        }
    }
}

/// Configuration for the Transcriber engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriberConfig {
    pub silence_split_gap_s: f64,
}

impl Default for TranscriberConfig {
    fn default() -> Self {
        Self {
            silence_split_gap_s: 1.5,
        }
    }
}

/// Top-level configuration, loaded from `config.toml` and overridable by
/// environment variables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub openai_api_key: Option<String>,
    pub gemini_api_key: Option<String>,
    /// Base URL of the voice-cloning engine's HTTP service.
    pub voice_clone_endpoint: Option<String>,

    pub default_transcriber: TranscriberProvider,

    /// Global cap on concurrently-processing tasks (spec §4.7, default 1 —
    /// the model workloads are GPU-heavy and not safely parallelizable per
    /// process).
    pub max_concurrent_tasks: usize,
    /// Bounded pool size for per-segment work inside stages 6/7 (spec §5).
    pub per_segment_parallelism: usize,
    /// Per-subscriber queue bound before events are dropped (spec §4.8).
    pub event_queue_capacity: usize,

    pub merger: MergerConfig,
    pub translator: TranslatorConfig,
    pub transcriber: TranscriberConfig,

    /// Root directory under which one subdirectory per task is created.
    pub tasks_root: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            openai_api_key: None,
            gemini_api_key: None,
            voice_clone_endpoint: None,
            default_transcriber: TranscriberProvider::default(),
            max_concurrent_tasks: 1,
            per_segment_parallelism: 2,
            event_queue_capacity: 64,
            merger: MergerConfig::default(),
            translator: TranslatorConfig::default(),
            transcriber: TranscriberConfig::default(),
            tasks_root: default_tasks_root(),
        }
    }
}

fn default_tasks_root() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("dubwright")
        .join("tasks")
}

impl Config {
    pub fn load() -> Result<Self> {
        let mut config = Self::default();

        if let Some(config_path) = Self::config_file_path() {
            if config_path.exists() {
                let contents = std::fs::read_to_string(&config_path)?;
                if let Ok(file_config) = toml::from_str::<Config>(&contents) {
                    config = file_config;
                }
            }
        }

        if let Ok(key) = std::env::var("OPENAI_API_KEY") {
            config.openai_api_key = Some(key);
        }
        if let Ok(key) = std::env::var("GEMINI_API_KEY") {
            config.gemini_api_key = Some(key);
        }
        if let Ok(endpoint) = std::env::var("VOICE_CLONE_ENDPOINT") {
            config.voice_clone_endpoint = Some(endpoint);
        }
        if let Ok(n) = std::env::var("DUBWRIGHT_MAX_CONCURRENT_TASKS") {
            if let Ok(n) = n.parse() {
                config.max_concurrent_tasks = n;
            }
        }
        if let Ok(n) = std::env::var("DUBWRIGHT_PER_SEGMENT_PARALLELISM") {
            if let Ok(n) = n.parse() {
                config.per_segment_parallelism = n;
            }
        }
        if let Ok(root) = std::env::var("DUBWRIGHT_TASKS_ROOT") {
            config.tasks_root = PathBuf::from(root);
        }

        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent_tasks == 0 {
            return Err(DubError::Config(
                "max_concurrent_tasks must be greater than 0".to_string(),
            ));
        }
        if self.per_segment_parallelism == 0 {
            return Err(DubError::Config(
                "per_segment_parallelism must be greater than 0".to_string(),
            ));
        }
        if self.merger.max_stretch <= 1.0 {
            return Err(DubError::Config(
                "merger.max_stretch must be greater than 1.0".to_string(),
            ));
        }
        Ok(())
    }

    fn config_file_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("dubwright").join("config.toml"))
    }
}
