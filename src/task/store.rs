use crate::error::{DubError, Result};
use crate::segment::SegmentTable;
use crate::task::{Status, StatusPatch};
use chrono::Utc;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::debug;

const STATUS_FILE: &str = "status.json";

/// Owns every byte of per-task state on disk and serializes read-modify-
/// write access per task (spec §4.1).
#[derive(Clone)]
pub struct TaskStore {
    root: PathBuf,
    locks: Arc<Mutex<HashMap<String, Arc<Mutex<()>>>>>,
}

impl TaskStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            locks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn task_dir(&self, task_id: &str) -> PathBuf {
        self.root.join(task_id)
    }

    async fn lock_for(&self, task_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks
            .entry(task_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Creates the task directory and writes the initial `status.json`.
    /// Fails with `Conflict` if the directory already exists.
    pub async fn create(&self, task_id: &str, status: &Status) -> Result<PathBuf> {
        let dir = self.task_dir(task_id);
        if dir.exists() {
            return Err(DubError::Conflict(format!(
                "task directory already exists: {}",
                dir.display()
            )));
        }
        fs::create_dir_all(dir.join("speakers")).await?;
        fs::create_dir_all(dir.join("ref_audio")).await?;
        fs::create_dir_all(dir.join("cloned_audio")).await?;

        self.write_json(&dir.join(STATUS_FILE), status).await?;
        debug!(task_id, dir = %dir.display(), "created task workspace");
        Ok(dir)
    }

    /// Writes `bytes` via temp-file + rename so readers never observe a
    /// partial file (spec §4.1).
    pub async fn put_artifact(&self, task_id: &str, relative_path: &str, bytes: &[u8]) -> Result<PathBuf> {
        let dir = self.task_dir(task_id);
        if !dir.exists() {
            return Err(DubError::NotFound(task_id.to_string()));
        }
        let dest = dir.join(relative_path);
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).await?;
        }
        self.write_atomic(&dest, bytes).await?;
        Ok(dest)
    }

    /// Copies an existing file on disk into the task workspace atomically,
    /// for engine adapters that produce output as a file rather than a
    /// byte buffer.
    pub async fn put_artifact_from_path(
        &self,
        task_id: &str,
        relative_path: &str,
        source: &Path,
    ) -> Result<PathBuf> {
        let bytes = fs::read(source).await?;
        self.put_artifact(task_id, relative_path, &bytes).await
    }

    pub async fn artifact_path(&self, task_id: &str, relative_path: &str) -> Result<PathBuf> {
        let path = self.task_dir(task_id).join(relative_path);
        if !path.exists() {
            return Err(DubError::NotFound(format!(
                "{relative_path} for task {task_id}"
            )));
        }
        Ok(path)
    }

    pub async fn read_status(&self, task_id: &str) -> Result<Status> {
        let path = self.task_dir(task_id).join(STATUS_FILE);
        self.read_json(&path).await
    }

    /// Writes an arbitrary JSON-serializable value into a task's
    /// workspace (used for bookkeeping not covered by the status/segment
    /// schemas, e.g. `task_meta.json`).
    pub async fn write_meta<T: serde::Serialize>(&self, task_id: &str, relative_path: &str, value: &T) -> Result<()> {
        let path = self.task_dir(task_id).join(relative_path);
        self.write_json(&path, value).await
    }

    pub async fn read_meta<T: serde::de::DeserializeOwned>(&self, task_id: &str, relative_path: &str) -> Result<T> {
        let path = self.task_dir(task_id).join(relative_path);
        self.read_json(&path).await
    }

    /// Read-modify-write of `status.json` under the per-task lock (spec §4.1).
    pub async fn patch_status(&self, task_id: &str, patch: StatusPatch) -> Result<Status> {
        let lock = self.lock_for(task_id).await;
        let _guard = lock.lock().await;

        let mut status = self.read_status(task_id).await?;
        patch.apply(&mut status, Utc::now());
        let path = self.task_dir(task_id).join(STATUS_FILE);
        self.write_json(&path, &status).await?;
        Ok(status)
    }

    /// Loads the canonical segment table, validating invariants.
    /// Fails with `Corrupt` if parsing or validation fails.
    pub async fn read_segment_table(&self, task_id: &str, segments_file: &str) -> Result<SegmentTable> {
        let path = self.task_dir(task_id).join(segments_file);
        let contents = fs::read_to_string(&path)
            .await
            .map_err(|e| DubError::Corrupt(format!("cannot read {}: {e}", path.display())))?;
        let table: SegmentTable = serde_json::from_str(&contents)
            .map_err(|e| DubError::Corrupt(format!("cannot parse {}: {e}", path.display())))?;
        table
            .validate()
            .map_err(|e| DubError::Corrupt(format!("invariant violated in {}: {e}", path.display())))?;
        Ok(table)
    }

    /// Validates invariants before writing; fails with `InvalidRequest`
    /// otherwise (spec §4.1).
    pub async fn write_segment_table(
        &self,
        task_id: &str,
        segments_file: &str,
        table: &SegmentTable,
    ) -> Result<()> {
        table.validate()?;
        let path = self.task_dir(task_id).join(segments_file);
        let bytes = serde_json::to_vec_pretty(table)?;
        self.write_atomic(&path, &bytes).await
    }

    async fn write_json<T: serde::Serialize>(&self, path: &Path, value: &T) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(value)?;
        self.write_atomic(path, &bytes).await
    }

    async fn read_json<T: serde::de::DeserializeOwned>(&self, path: &Path) -> Result<T> {
        let contents = fs::read_to_string(path)
            .await
            .map_err(|e| DubError::NotFound(format!("{}: {e}", path.display())))?;
        serde_json::from_str(&contents)
            .map_err(|e| DubError::Corrupt(format!("cannot parse {}: {e}", path.display())))
    }

    async fn write_atomic(&self, path: &Path, bytes: &[u8]) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let tmp_path = path.with_extension(format!(
            "{}.tmp",
            path.extension().and_then(|e| e.to_str()).unwrap_or("out")
        ));
        {
            let mut file = fs::File::create(&tmp_path).await?;
            file.write_all(bytes).await?;
            file.sync_all().await?;
        }
        fs::rename(&tmp_path, path).await?;
        Ok(())
    }

    pub async fn append_log(&self, task_id: &str, line: &str) -> Result<()> {
        let path = self.task_dir(task_id).join("processing_log.txt");
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        file.write_all(format!("{}\n", line).as_bytes()).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{PauseAfter, StartRequest, TaskStatus};
    use tempfile::TempDir;

    fn test_status(id: &str) -> Status {
        let req = StartRequest {
            source_media_path: PathBuf::from("/tmp/clip.mp4"),
            source_lang: "en".to_string(),
            target_lang: "es".to_string(),
            single_speaker: true,
            pause_after: Some(PauseAfter::Step4),
        };
        Status::new(&req, id.to_string(), Utc::now())
    }

    #[tokio::test]
    async fn test_create_and_read_status() {
        let dir = TempDir::new().unwrap();
        let store = TaskStore::new(dir.path());
        let status = test_status("t1");
        store.create("t1", &status).await.unwrap();

        let read_back = store.read_status("t1").await.unwrap();
        assert_eq!(read_back.id, "t1");
        assert_eq!(read_back.status, TaskStatus::Pending);
    }

    #[tokio::test]
    async fn test_create_rejects_duplicate() {
        let dir = TempDir::new().unwrap();
        let store = TaskStore::new(dir.path());
        let status = test_status("t1");
        store.create("t1", &status).await.unwrap();
        let result = store.create("t1", &status).await;
        assert!(matches!(result, Err(DubError::Conflict(_))));
    }

    #[tokio::test]
    async fn test_patch_status_updates_fields_and_timestamp() {
        let dir = TempDir::new().unwrap();
        let store = TaskStore::new(dir.path());
        let status = test_status("t1");
        store.create("t1", &status).await.unwrap();

        let patch = StatusPatch {
            status: Some(TaskStatus::Processing),
            progress: Some(50),
            ..Default::default()
        };
        let updated = store.patch_status("t1", patch).await.unwrap();
        assert_eq!(updated.status, TaskStatus::Processing);
        assert_eq!(updated.progress, 50);
        assert!(updated.updated_at >= updated.created_at);
    }

    #[tokio::test]
    async fn test_put_artifact_is_readable_after_write() {
        let dir = TempDir::new().unwrap();
        let store = TaskStore::new(dir.path());
        let status = test_status("t1");
        store.create("t1", &status).await.unwrap();

        let path = store
            .put_artifact("t1", "clip_01_audio.wav", b"RIFF....")
            .await
            .unwrap();
        assert!(path.exists());
        assert_eq!(tokio::fs::read(&path).await.unwrap(), b"RIFF....");
    }

    #[tokio::test]
    async fn test_read_segment_table_rejects_corrupt_json() {
        let dir = TempDir::new().unwrap();
        let store = TaskStore::new(dir.path());
        let status = test_status("t1");
        store.create("t1", &status).await.unwrap();
        tokio::fs::write(dir.path().join("t1").join("clip_04_segments.json"), b"{not json")
            .await
            .unwrap();

        let result = store.read_segment_table("t1", "clip_04_segments.json").await;
        assert!(matches!(result, Err(DubError::Corrupt(_))));
    }

    #[tokio::test]
    async fn test_write_segment_table_rejects_invalid_table() {
        use crate::segment::{Segment, SegmentTable};

        let dir = TempDir::new().unwrap();
        let store = TaskStore::new(dir.path());
        let status = test_status("t1");
        store.create("t1", &status).await.unwrap();

        let bad_table = SegmentTable::new(vec![Segment {
            id: 0,
            start: 1.0,
            end: 1.0,
            text: "x".into(),
            translated_text: None,
            speaker_id: None,
            words: None,
            cloned_audio_path: None,
            cloned_duration: None,
            error: None,
        }]);

        let result = store
            .write_segment_table("t1", "clip_04_segments.json", &bad_table)
            .await;
        assert!(result.is_err());
    }
}
