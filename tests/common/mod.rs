#![allow(dead_code)]
//! Shared mock engines for the integration and mock-API test suites.
//!
//! Every mock here satisfies one of `dubwright::engines`' narrow traits
//! without shelling out to a real model or media tool, so the Executor's
//! control flow (stage sequencing, pause/resume, segment edits,
//! per-segment failure propagation) can be exercised deterministically.
//! The one exception the Executor itself carves out is stage 6's
//! reference extraction, which calls `ffmpeg` directly rather than
//! through an engine trait (spec §4.2 "External media tool" framing) —
//! tests that need that stage to actually produce a file gate on
//! `ffmpeg_available()`.

use async_trait::async_trait;
use dubwright::engines::{
    AudioExtractorEngine, MuxerEngine, TranscribedSegment, TranscriberEngine, TranscriptionResult,
    TranslatorEngine, VoiceClonerEngine,
};
use hound::{SampleFormat, WavSpec, WavWriter};
use std::path::Path;
use std::process::Command;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;

pub const SAMPLE_RATE: u32 = 16_000;

/// Writes a silent mono 16-bit PCM wav of `duration_s` seconds at
/// [`SAMPLE_RATE`] to `path`.
pub fn write_silence_wav(path: &Path, duration_s: f64) {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    let spec = WavSpec {
        channels: 1,
        sample_rate: SAMPLE_RATE,
        bits_per_sample: 16,
        sample_format: SampleFormat::Int,
    };
    let mut writer = WavWriter::create(path, spec).unwrap();
    let n_samples = (duration_s * SAMPLE_RATE as f64).round() as usize;
    for _ in 0..n_samples {
        writer.write_sample(0i16).unwrap();
    }
    writer.finalize().unwrap();
}

/// Writes a constant-amplitude mono 16-bit PCM wav, giving the signal a
/// non-zero RMS so level-matching and placement can be verified against
/// an otherwise-silent track.
pub fn write_tone_wav(path: &Path, duration_s: f64, amplitude: i16) {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    let spec = WavSpec {
        channels: 1,
        sample_rate: SAMPLE_RATE,
        bits_per_sample: 16,
        sample_format: SampleFormat::Int,
    };
    let mut writer = WavWriter::create(path, spec).unwrap();
    let n_samples = (duration_s * SAMPLE_RATE as f64).round() as usize;
    for i in 0..n_samples {
        let sample = if i % 2 == 0 { amplitude } else { -amplitude };
        writer.write_sample(sample).unwrap();
    }
    writer.finalize().unwrap();
}

/// `true` iff `ffmpeg` is callable on `PATH`, mirroring the skip-gate
/// convention already used by `src/engines/audio.rs`'s own tests.
pub fn ffmpeg_available() -> bool {
    Command::new("ffmpeg")
        .arg("-version")
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

/// Extracts audio without touching `ffmpeg`: ignores whatever `src`
/// actually is and writes a fixed-duration silent wav to `dest`.
pub struct MockAudioExtractor {
    pub duration_s: f64,
}

#[async_trait]
impl AudioExtractorEngine for MockAudioExtractor {
    async fn extract(&self, _src: &Path, dest: &Path) -> dubwright::Result<f64> {
        write_silence_wav(dest, self.duration_s);
        Ok(self.duration_s)
    }
}

/// Returns a fixed transcript regardless of what's on disk, so stage 4
/// doesn't need a real speech model.
pub struct MockTranscriber {
    pub language: String,
    pub segments: Vec<TranscribedSegment>,
}

#[async_trait]
impl TranscriberEngine for MockTranscriber {
    async fn transcribe(&self, _wav: &Path, _lang_hint: Option<&str>) -> dubwright::Result<TranscriptionResult> {
        Ok(TranscriptionResult {
            language: self.language.clone(),
            segments: self.segments.clone(),
        })
    }
}

/// Translator whose behavior is picked per-construction: either a
/// deterministic prefix translation, or an engine failure on every call
/// (used to drive scenario S6, the translator-failure path).
pub struct MockTranslator {
    fail: bool,
    calls: AtomicUsize,
}

impl MockTranslator {
    pub fn succeeding() -> Self {
        Self { fail: false, calls: AtomicUsize::new(0) }
    }

    pub fn always_failing() -> Self {
        Self { fail: true, calls: AtomicUsize::new(0) }
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TranslatorEngine for MockTranslator {
    async fn translate(&self, batch: &[String], _src_lang: &str, tgt_lang: &str) -> dubwright::Result<Vec<String>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(dubwright::DubError::EngineFailure(
                "mock translator configured to fail".to_string(),
            ));
        }
        Ok(batch.iter().map(|t| format!("[{tgt_lang}] {t}")).collect())
    }
}

/// Clones by writing a silent wav whose duration is `original_duration *
/// duration_multiplier`, so callers can keep the clone within the
/// merger's stretch budget (no stretch needed) or deliberately push it
/// over budget to exercise the stretch-and-truncate path.
pub struct MockVoiceCloner {
    pub duration_multiplier: f64,
}

#[async_trait]
impl VoiceClonerEngine for MockVoiceCloner {
    async fn clone(&self, reference_wav: &Path, _target_text: &str, dest: &Path) -> dubwright::Result<f64> {
        let ref_duration = match hound::WavReader::open(reference_wav) {
            Ok(reader) => {
                let spec = reader.spec();
                reader.duration() as f64 / spec.sample_rate as f64
            }
            Err(_) => 1.0,
        };
        let duration = (ref_duration * self.duration_multiplier).max(0.05);
        write_tone_wav(dest, duration, 8_000);
        Ok(duration)
    }
}

/// Muxes by copying the voice track to `dest`, standing in for the real
/// `ffmpeg` mux so the Executor can reach `Completed` without a media
/// tool installed.
pub struct MockMuxer {
    pub called: Arc<AtomicBool>,
}

impl MockMuxer {
    pub fn new() -> Self {
        Self { called: Arc::new(AtomicBool::new(false)) }
    }
}

#[async_trait]
impl MuxerEngine for MockMuxer {
    async fn mux(
        &self,
        _video: &Path,
        voice_wav: &Path,
        _accompaniment_wav: Option<&Path>,
        dest: &Path,
    ) -> dubwright::Result<()> {
        self.called.store(true, Ordering::SeqCst);
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::copy(voice_wav, dest).await?;
        Ok(())
    }
}

/// Blocks until a task settles into a terminal or paused status, or the
/// timeout elapses. Mirrors `main.rs`'s `watch_until_settled`, minus the
/// console printing.
pub async fn wait_for_settled(scheduler: &dubwright::Scheduler, task_id: &str) -> dubwright::Status {
    let (snapshot, mut rx) = scheduler.event_bus().subscribe(task_id).await;
    if let Some(dubwright::Event { payload: dubwright::EventPayload::Status { status }, .. }) = snapshot {
        if status.status.is_terminal() || status.status.is_paused() {
            return *status;
        }
    }

    // Generous enough to cover the translator's retry backoff (spec §4.2
    // exponential backoff across up to 4 attempts, ~7s worst case).
    let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(20);
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            panic!("task {task_id} did not settle within the test timeout");
        }
        match tokio::time::timeout(remaining, rx.recv()).await {
            Ok(Ok(dubwright::Event { payload: dubwright::EventPayload::Status { status }, .. })) => {
                if status.status.is_terminal() || status.status.is_paused() {
                    return *status;
                }
            }
            Ok(Ok(_)) => continue,
            Ok(Err(broadcast::error::RecvError::Lagged(_))) => continue,
            Ok(Err(broadcast::error::RecvError::Closed)) => {
                return scheduler.status(task_id).await.expect("task disappeared mid-run");
            }
            Err(_) => panic!("task {task_id} did not settle within the test timeout"),
        }
    }
}

pub fn word(text: &str, start: f64, end: f64) -> dubwright::WordTimestamp {
    dubwright::WordTimestamp { word: text.to_string(), start, end }
}
