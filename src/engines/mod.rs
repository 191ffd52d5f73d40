//! Narrow, synchronous-blocking-call contracts for the heterogeneous
//! model workloads the pipeline drives (spec §4.2). The core depends
//! only on these traits; any backend satisfying them is acceptable.

pub mod audio;
pub mod muxer;
pub mod transcriber;
pub mod translator;
pub mod voice_cloner;

pub use audio::{AudioExtractorEngine, FfmpegAudioExtractor};
pub use muxer::{FfmpegMuxer, MuxerEngine};
pub use transcriber::{GeminiTranscriber, TranscriberEngine, WhisperTranscriber};
pub use translator::{GeminiTranslator, TranslatorEngine};
pub use voice_cloner::{HttpVoiceCloner, VoiceClonerEngine};

use crate::error::Result;
use crate::segment::WordTimestamp;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// One transcribed unit returned by a `TranscriberEngine`, prior to
/// insertion into a `SegmentTable` (spec §4.2).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscribedSegment {
    pub start: f64,
    pub end: f64,
    pub text: String,
    pub words: Option<Vec<WordTimestamp>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptionResult {
    pub language: String,
    pub segments: Vec<TranscribedSegment>,
}

/// `VocalSeparator.separate(wav) -> {vocals, accompaniment?}` (spec §4.2).
#[async_trait]
pub trait VocalSeparatorEngine: Send + Sync {
    async fn separate(&self, wav: &Path) -> Result<SeparationResult>;
}

#[derive(Debug, Clone)]
pub struct SeparationResult {
    pub vocals_path: PathBuf,
    pub accompaniment_path: Option<PathBuf>,
}

/// `SpeakerTracker.build(vocals) -> [SpeakerTrack]` (spec §4.2).
#[async_trait]
pub trait SpeakerTrackerEngine: Send + Sync {
    async fn build(&self, vocals: &Path) -> Result<Vec<BuiltSpeakerTrack>>;
}

#[derive(Debug, Clone)]
pub struct BuiltSpeakerTrack {
    pub speaker_id: String,
    pub compact_audio_path: PathBuf,
    pub mapping: Vec<SpeakerMappingEntry>,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct SpeakerMappingEntry {
    pub compact_start: f64,
    pub compact_end: f64,
    pub global_start: f64,
    pub global_end: f64,
}

/// A no-music-detected or silence-only separator used in tests and for
/// inputs where separation is skipped entirely. Grounded in the teacher's
/// pattern of a single synchronous ffmpeg/ffprobe pass per engine call.
pub struct PassthroughVocalSeparator;

#[async_trait]
impl VocalSeparatorEngine for PassthroughVocalSeparator {
    async fn separate(&self, wav: &Path) -> Result<SeparationResult> {
        Ok(SeparationResult {
            vocals_path: wav.to_path_buf(),
            accompaniment_path: None,
        })
    }
}

/// Synthesizes a single speaker track covering the whole vocals file,
/// used whenever `single_speaker` is asserted (the executor otherwise
/// skips the call to this engine entirely, per spec §4.2).
pub struct SingleSpeakerTracker;

#[async_trait]
impl SpeakerTrackerEngine for SingleSpeakerTracker {
    async fn build(&self, vocals: &Path) -> Result<Vec<BuiltSpeakerTrack>> {
        Ok(vec![BuiltSpeakerTrack {
            speaker_id: "spk0".to_string(),
            compact_audio_path: vocals.to_path_buf(),
            mapping: vec![],
        }])
    }
}
