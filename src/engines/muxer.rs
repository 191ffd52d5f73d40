//! `Muxer.mux(video, voice_wav, accompaniment_wav?) -> video` (spec §4.2),
//! implemented by invoking `ffmpeg` as a subprocess: copy the video
//! stream, mix voice (and optional accompaniment) to a single audio
//! stream (spec §6 External media tool contract).

use crate::error::{DubError, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Command;
use tokio::task;
use tracing::info;

#[async_trait]
pub trait MuxerEngine: Send + Sync {
    async fn mux(
        &self,
        video: &Path,
        voice_wav: &Path,
        accompaniment_wav: Option<&Path>,
        dest: &Path,
    ) -> Result<()>;
}

pub struct FfmpegMuxer;

#[async_trait]
impl MuxerEngine for FfmpegMuxer {
    async fn mux(
        &self,
        video: &Path,
        voice_wav: &Path,
        accompaniment_wav: Option<&Path>,
        dest: &Path,
    ) -> Result<()> {
        info!("muxing {} with {}", video.display(), voice_wav.display());

        let video = video.to_path_buf();
        let voice_wav = voice_wav.to_path_buf();
        let accompaniment_wav = accompaniment_wav.map(PathBuf::from);
        let dest = dest.to_path_buf();

        let status = task::spawn_blocking(move || -> std::io::Result<std::process::ExitStatus> {
            let mut cmd = Command::new("ffmpeg");
            cmd.args(["-y", "-i"]).arg(&video).args(["-i"]).arg(&voice_wav);

            if let Some(accompaniment) = &accompaniment_wav {
                cmd.args(["-i"]).arg(accompaniment).args([
                    "-filter_complex",
                    "[1:a][2:a]amix=inputs=2:duration=first[aout]",
                    "-map",
                    "0:v:0",
                    "-map",
                    "[aout]",
                ]);
            } else {
                cmd.args(["-map", "0:v:0", "-map", "1:a:0"]);
            }

            cmd.args(["-c:v", "copy", "-c:a", "aac", "-shortest"]);
            cmd.arg(&dest);
            cmd.status()
        })
        .await
        .map_err(|e| DubError::EngineFailure(format!("ffmpeg task panicked: {e}")))?
        .map_err(|e| DubError::EngineFailure(format!("failed to run ffmpeg: {e}")))?;

        if !status.success() {
            return Err(DubError::EngineFailure("ffmpeg mux failed".to_string()));
        }
        Ok(())
    }
}

/// Invokes `ffmpeg`'s `atempo` filter chain to time-compress `src` by
/// `factor` (> 1.0 shortens). `atempo` is only valid in `[0.5, 2.0]` per
/// invocation, so factors outside that range are chained (spec §4.6).
pub fn time_stretch(src: &Path, dest: &Path, factor: f64) -> Result<()> {
    if factor <= 0.0 {
        return Err(DubError::InvalidRequest("time-stretch factor must be positive".to_string()));
    }
    let filters = atempo_chain(factor);
    let status = Command::new("ffmpeg")
        .args(["-y", "-i"])
        .arg(src)
        .args(["-filter:a", &filters])
        .arg(dest)
        .status()
        .map_err(|e| DubError::EngineFailure(format!("failed to run ffmpeg: {e}")))?;

    if !status.success() {
        return Err(DubError::EngineFailure("ffmpeg time-stretch failed".to_string()));
    }
    Ok(())
}

fn atempo_chain(mut factor: f64) -> String {
    let mut stages = Vec::new();
    while factor > 2.0 {
        stages.push(2.0);
        factor /= 2.0;
    }
    while factor < 0.5 {
        stages.push(0.5);
        factor /= 0.5;
    }
    stages.push(factor);
    stages
        .iter()
        .map(|f| format!("atempo={f:.6}"))
        .collect::<Vec<_>>()
        .join(",")
}
