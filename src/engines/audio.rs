//! `AudioExtractor.extract(src) -> wav_16k_mono_path` (spec §4.2),
//! implemented as an `ffmpeg`/`ffprobe` subprocess adapter.

use crate::error::{DubError, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Command;
use tokio::task;
use tracing::{debug, info};

#[async_trait]
pub trait AudioExtractorEngine: Send + Sync {
    /// Normalizes `src` to 16 kHz mono PCM WAV at `dest` and returns the
    /// source's duration in seconds.
    async fn extract(&self, src: &Path, dest: &Path) -> Result<f64>;
}

pub fn check_ffmpeg() -> Result<()> {
    let output = Command::new("ffmpeg").arg("-version").output().map_err(|e| {
        DubError::EngineFailure(format!("ffmpeg not found on PATH: {e}"))
    })?;
    if !output.status.success() {
        return Err(DubError::EngineFailure("ffmpeg -version failed".to_string()));
    }
    Ok(())
}

pub fn check_ffprobe() -> Result<()> {
    let output = Command::new("ffprobe").arg("-version").output().map_err(|e| {
        DubError::EngineFailure(format!("ffprobe not found on PATH: {e}"))
    })?;
    if !output.status.success() {
        return Err(DubError::EngineFailure("ffprobe -version failed".to_string()));
    }
    Ok(())
}

/// Returns the duration of `input` in seconds via `ffprobe`.
pub fn probe_duration(input: &Path) -> Result<f64> {
    let output = Command::new("ffprobe")
        .args([
            "-v",
            "error",
            "-show_entries",
            "format=duration",
            "-of",
            "default=noprint_wrappers=1:nokey=1",
        ])
        .arg(input)
        .output()
        .map_err(|e| DubError::EngineFailure(format!("failed to run ffprobe: {e}")))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(DubError::EngineFailure(format!("ffprobe failed: {stderr}")));
    }

    let raw = String::from_utf8_lossy(&output.stdout);
    raw.trim()
        .parse()
        .map_err(|e| DubError::EngineFailure(format!("failed to parse duration '{}': {e}", raw.trim())))
}

/// `ffmpeg`-backed audio extractor, the only `AudioExtractorEngine` this
/// crate ships (grounded in the teacher's `audio::extract::extract_audio`).
pub struct FfmpegAudioExtractor;

#[async_trait]
impl AudioExtractorEngine for FfmpegAudioExtractor {
    async fn extract(&self, src: &Path, dest: &Path) -> Result<f64> {
        check_ffmpeg()?;
        check_ffprobe()?;

        if !src.exists() {
            return Err(DubError::InvalidRequest(format!(
                "source media not found: {}",
                src.display()
            )));
        }

        info!("extracting audio from {}", src.display());
        let duration = probe_duration(src)?;

        let src = src.to_path_buf();
        let dest = dest.to_path_buf();
        let status = task::spawn_blocking(move || {
            Command::new("ffmpeg")
                .args(["-y", "-i"])
                .arg(&src)
                .args(["-vn", "-acodec", "pcm_s16le", "-ar", "16000", "-ac", "1"])
                .arg(&dest)
                .status()
        })
        .await
        .map_err(|e| DubError::EngineFailure(format!("ffmpeg task panicked: {e}")))?
        .map_err(|e| DubError::EngineFailure(format!("failed to run ffmpeg: {e}")))?;

        if !status.success() {
            return Err(DubError::EngineFailure("ffmpeg audio extraction failed".to_string()));
        }
        debug!("extracted audio to {}", dest.display());
        Ok(duration)
    }
}

/// Extracts a `[start, end]` segment of `src` into `dest` (used by stage 6
/// reference extraction). Not part of the `AudioExtractorEngine` contract
/// since it operates per-segment rather than per-task.
pub fn extract_segment(src: &Path, dest: &Path, start: f64, end: f64) -> Result<()> {
    if end <= start {
        return Err(DubError::InvalidRequest("segment end must be after start".to_string()));
    }
    let status = Command::new("ffmpeg")
        .args(["-y", "-ss"])
        .arg(format!("{start:.3}"))
        .args(["-t"])
        .arg(format!("{:.3}", end - start))
        .args(["-i"])
        .arg(src)
        .args(["-vn", "-acodec", "pcm_s16le", "-ar", "16000", "-ac", "1"])
        .arg(dest)
        .status()
        .map_err(|e| DubError::EngineFailure(format!("failed to run ffmpeg: {e}")))?;

    if !status.success() {
        return Err(DubError::EngineFailure("ffmpeg segment extraction failed".to_string()));
    }
    Ok(())
}

/// Returns the existing `wav_path` unmodified, for cases where the
/// source media is already normalized audio (used in mock-engine tests).
pub fn passthrough_path(wav_path: &Path) -> PathBuf {
    wav_path.to_path_buf()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ffmpeg_available() -> bool {
        Command::new("ffmpeg")
            .arg("-version")
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false)
    }

    #[tokio::test]
    async fn test_extract_rejects_missing_source() {
        if !ffmpeg_available() {
            eprintln!("skipping: ffmpeg not available");
            return;
        }
        let extractor = FfmpegAudioExtractor;
        let result = extractor
            .extract(Path::new("/nonexistent/input.mp4"), Path::new("/tmp/out.wav"))
            .await;
        assert!(matches!(result, Err(DubError::InvalidRequest(_))));
    }

    #[test]
    fn test_extract_segment_rejects_inverted_interval() {
        let result = extract_segment(Path::new("/tmp/in.wav"), Path::new("/tmp/out.wav"), 2.0, 1.0);
        assert!(result.is_err());
    }
}
