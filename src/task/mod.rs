//! `Task` metadata, `status.json` schema, and the `TaskStore` that owns
//! every byte of per-task state (spec §3, §4.1, §6).

mod store;

pub use store::TaskStore;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One of the two human-in-the-loop checkpoints a task can be started with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PauseAfter {
    Step4,
    Step5,
}

/// Lifecycle state of a task (spec §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Processing,
    PausedStep4,
    PausedStep5,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn is_paused(&self) -> bool {
        matches!(self, TaskStatus::PausedStep4 | TaskStatus::PausedStep5)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }
}

/// The error payload recorded in `status.json` when a task fails
/// (spec §7).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskError {
    pub kind: String,
    pub message: String,
}

/// The canonical on-disk status manifest for a task (spec §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Status {
    pub id: String,
    pub status: TaskStatus,
    pub current_step: u8,
    pub progress: u8,
    pub message: String,
    pub step_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_segment: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_segments: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<TaskError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pause_after: Option<PauseAfter>,
    pub source_lang: String,
    pub target_lang: String,
    pub single_speaker: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Status {
    pub fn new(request: &StartRequest, id: String, created_at: DateTime<Utc>) -> Self {
        Self {
            id,
            status: TaskStatus::Pending,
            current_step: 0,
            progress: 0,
            message: "queued".to_string(),
            step_name: "pending".to_string(),
            current_segment: None,
            total_segments: None,
            error: None,
            pause_after: request.pause_after,
            source_lang: request.source_lang.clone(),
            target_lang: request.target_lang.clone(),
            single_speaker: request.single_speaker,
            created_at,
            updated_at: created_at,
        }
    }
}

/// A partial update applied to `status.json` under `TaskStore::patch_status`.
#[derive(Debug, Default, Clone)]
pub struct StatusPatch {
    pub status: Option<TaskStatus>,
    pub current_step: Option<u8>,
    pub progress: Option<u8>,
    pub message: Option<String>,
    pub step_name: Option<String>,
    pub current_segment: Option<Option<usize>>,
    pub total_segments: Option<Option<usize>>,
    pub error: Option<Option<TaskError>>,
}

impl StatusPatch {
    pub fn apply(self, status: &mut Status, now: DateTime<Utc>) {
        if let Some(v) = self.status {
            status.status = v;
        }
        if let Some(v) = self.current_step {
            status.current_step = v;
        }
        if let Some(v) = self.progress {
            status.progress = v;
        }
        if let Some(v) = self.message {
            status.message = v;
        }
        if let Some(v) = self.step_name {
            status.step_name = v;
        }
        if let Some(v) = self.current_segment {
            status.current_segment = v;
        }
        if let Some(v) = self.total_segments {
            status.total_segments = v;
        }
        if let Some(v) = self.error {
            status.error = v;
        }
        status.updated_at = now;
    }
}

/// Parameters accepted by `start` (spec §6 Operation surface).
#[derive(Debug, Clone)]
pub struct StartRequest {
    pub source_media_path: std::path::PathBuf,
    pub source_lang: String,
    pub target_lang: String,
    pub single_speaker: bool,
    pub pause_after: Option<PauseAfter>,
}

/// Standard relative artifact names for one task, parameterized by the
/// sanitized basename derived from the source file (spec §6).
#[derive(Debug, Clone)]
pub struct ArtifactNames {
    base: String,
}

impl ArtifactNames {
    pub fn new(base: impl Into<String>) -> Self {
        Self { base: base.into() }
    }

    pub fn audio(&self) -> String {
        format!("{}_01_audio.wav", self.base)
    }

    pub fn vocals(&self) -> String {
        format!("{}_02_vocals.wav", self.base)
    }

    pub fn accompaniment(&self) -> String {
        format!("{}_02_accompaniment.wav", self.base)
    }

    pub fn segments(&self) -> String {
        format!("{}_04_segments.json", self.base)
    }

    pub fn whisper_raw(&self) -> String {
        format!("{}_04_whisper_raw.json", self.base)
    }

    pub fn translation_txt(&self) -> String {
        format!("{}_05_translation.txt", self.base)
    }

    pub fn ref_segment(&self, id: usize) -> String {
        format!("ref_audio/{}_06_ref_segment_{:03}.wav", self.base, id)
    }

    pub fn cloned_segment(&self, id: usize) -> String {
        format!("cloned_audio/{}_07_segment_{:03}.wav", self.base, id)
    }

    pub fn final_voice(&self) -> String {
        format!("{}_08_final_voice.wav", self.base)
    }

    pub fn translated_video(&self) -> String {
        format!("{}_09_translated.mp4", self.base)
    }

    pub fn speaker_wav(&self, speaker_id: &str) -> String {
        format!("speakers/{speaker_id}/{speaker_id}.wav")
    }

    pub fn speaker_json(&self, speaker_id: &str) -> String {
        format!("speakers/{speaker_id}/{speaker_id}.json")
    }

    pub fn processing_log(&self) -> &'static str {
        "processing_log.txt"
    }
}

/// Sanitizes a source filename's stem for use in a task id and artifact
/// basenames: lowercase, ascii alphanumerics, `-`/`_` kept, everything
/// else collapsed to `_`.
pub fn sanitize_basename(path: &std::path::Path) -> String {
    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("task");

    let mut out = String::with_capacity(stem.len());
    for ch in stem.chars() {
        if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' {
            out.push(ch.to_ascii_lowercase());
        } else {
            out.push('_');
        }
    }
    if out.is_empty() {
        "task".to_string()
    } else {
        out
    }
}

/// Builds the task id used as its directory name: a timestamp prefix
/// followed by the sanitized basename (spec §3, §6).
pub fn make_task_id(now: DateTime<Utc>, source_media_path: &std::path::Path) -> String {
    format!(
        "{}_{}",
        now.format("%Y-%m-%d_%H-%M-%S"),
        sanitize_basename(source_media_path)
    )
}

/// Recovers the sanitized basename from a task id of the form
/// `<date>_<time>_<basename>` (inverse of `make_task_id`'s suffix). The
/// basename is not itself stored in `status.json`, so callers that only
/// have a task id (the CLI, the HTTP boundary) reconstruct it this way to
/// derive artifact filenames via `ArtifactNames`.
pub fn basename_from_task_id(task_id: &str) -> &str {
    let rest = task_id.splitn(2, '_').nth(1).unwrap_or(task_id);
    rest.splitn(2, '_').nth(1).unwrap_or(rest)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_basename_replaces_unsafe_chars() {
        let path = std::path::Path::new("My Clip (final)!.mp4");
        assert_eq!(sanitize_basename(path), "my_clip__final__");
    }

    #[test]
    fn test_artifact_names() {
        let names = ArtifactNames::new("clip");
        assert_eq!(names.audio(), "clip_01_audio.wav");
        assert_eq!(names.ref_segment(4), "ref_audio/clip_06_ref_segment_004.wav");
        assert_eq!(
            names.cloned_segment(12),
            "cloned_audio/clip_07_segment_012.wav"
        );
    }

    #[test]
    fn test_status_is_paused() {
        assert!(TaskStatus::PausedStep4.is_paused());
        assert!(!TaskStatus::Processing.is_paused());
        assert!(TaskStatus::Completed.is_terminal());
    }

    #[test]
    fn test_basename_from_task_id_roundtrips_through_make_task_id() {
        let now = Utc::now();
        let path = std::path::Path::new("My Clip (final)!.mp4");
        let id = make_task_id(now, path);
        assert_eq!(basename_from_task_id(&id), sanitize_basename(path));
    }
}
