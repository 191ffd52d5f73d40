//! Admits tasks, bounds concurrency across the process, and routes
//! *operations* onto the per-task `Executor` (spec §4.7).

use crate::error::{DubError, Result};
use crate::events::EventBus;
use crate::executor::{Executor, ExecutorDeps};
use crate::segment::{SegmentPatch, SegmentTable};
use crate::task::{PauseAfter, StartRequest, Status, TaskStore};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, Semaphore};
use tracing::info;

struct TaskHandle {
    executor: Arc<Executor>,
    per_task_lock: Arc<Mutex<()>>,
}

struct TaskHandleRef {
    executor: Arc<Executor>,
    per_task_lock: Arc<Mutex<()>>,
}

/// Registry + global concurrency gate for all active tasks (spec §4.7).
pub struct Scheduler {
    store: TaskStore,
    events: EventBus,
    deps: ExecutorDeps,
    concurrency: Arc<Semaphore>,
    tasks: Arc<Mutex<HashMap<String, TaskHandle>>>,
}

impl Scheduler {
    pub fn new(store: TaskStore, events: EventBus, deps: ExecutorDeps, max_concurrent_tasks: usize) -> Self {
        Self {
            store,
            events,
            deps,
            concurrency: Arc::new(Semaphore::new(max_concurrent_tasks)),
            tasks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.events
    }

    pub fn task_store(&self) -> &TaskStore {
        &self.store
    }

    /// Looks up the in-process handle for `task_id`, rehydrating one from
    /// the on-disk task state if this process never registered it itself
    /// (e.g. a CLI invocation re-entering a task a prior process started;
    /// spec §4.5 "Re-entry from pause" promises this works across a
    /// restart, and the `Executor` already reads all its state back from
    /// the `TaskStore` rather than holding any of its own).
    async fn handle(&self, task_id: &str) -> Result<TaskHandleRef> {
        {
            let tasks = self.tasks.lock().await;
            if let Some(h) = tasks.get(task_id) {
                return Ok(TaskHandleRef { executor: h.executor.clone(), per_task_lock: h.per_task_lock.clone() });
            }
        }

        // Confirm the task actually exists on disk before registering a
        // handle for it; `NotFound` here propagates unchanged.
        self.store.read_status(task_id).await?;

        let mut tasks = self.tasks.lock().await;
        let handle = tasks.entry(task_id.to_string()).or_insert_with(|| TaskHandle {
            executor: Arc::new(Executor::new(
                task_id.to_string(),
                self.store.clone(),
                self.events.clone(),
                self.deps.clone(),
                self.concurrency.clone(),
            )),
            per_task_lock: Arc::new(Mutex::new(())),
        });
        Ok(TaskHandleRef { executor: handle.executor.clone(), per_task_lock: handle.per_task_lock.clone() })
    }

    async fn handle_for(&self, task_id: &str) -> Option<Arc<Executor>> {
        self.handle(task_id).await.ok().map(|h| h.executor)
    }

    async fn lock_for(&self, task_id: &str) -> Result<Arc<Mutex<()>>> {
        self.handle(task_id).await.map(|h| h.per_task_lock)
    }

    /// Creates the task workspace and spawns its Executor (spec §6
    /// `start(...)`). Rejects a repeated `start` for the same id with
    /// `Conflict`.
    pub async fn start(&self, request: StartRequest) -> Result<(String, Status)> {
        let now = Utc::now();
        let task_id = crate::task::make_task_id(now, &request.source_media_path);

        {
            let tasks = self.tasks.lock().await;
            if tasks.contains_key(&task_id) {
                return Err(DubError::Conflict(format!("task {task_id} already started")));
            }
        }

        let status = Status::new(&request, task_id.clone(), now);
        self.store.create(&task_id, &status).await?;

        let executor = Arc::new(Executor::new(
            task_id.clone(),
            self.store.clone(),
            self.events.clone(),
            self.deps.clone(),
            self.concurrency.clone(),
        ));

        {
            let mut tasks = self.tasks.lock().await;
            tasks.insert(
                task_id.clone(),
                TaskHandle {
                    executor: executor.clone(),
                    per_task_lock: Arc::new(Mutex::new(())),
                },
            );
        }

        self.events
            .publish(&task_id, crate::events::EventPayload::Status { status: Box::new(status.clone()) })
            .await;

        info!(task_id = %task_id, "task started");
        let executor_task_id = task_id.clone();
        let executor_clone = executor.clone();
        tokio::spawn(async move {
            executor_clone.run(request).await;
            let _ = executor_task_id;
        });

        Ok((task_id, status))
    }

    pub async fn status(&self, task_id: &str) -> Result<Status> {
        self.store.read_status(task_id).await
    }

    /// `continue(task_id)` — rejected unless `status ∈ {paused_step4,
    /// paused_step5}` (spec §4.5).
    pub async fn continue_task(&self, task_id: &str) -> Result<Status> {
        let lock = self.lock_for(task_id).await?;
        let _guard = lock.lock().await;

        let status = self.store.read_status(task_id).await?;
        if !status.status.is_paused() {
            return Err(DubError::Conflict(format!(
                "task {task_id} is not paused (status = {:?})",
                status.status
            )));
        }

        let executor = self
            .handle_for(task_id)
            .await
            .ok_or_else(|| DubError::NotFound(task_id.to_string()))?;

        let executor_clone = executor.clone();
        tokio::spawn(async move { executor_clone.continue_run().await });

        self.store.read_status(task_id).await
    }

    pub async fn cancel(&self, task_id: &str) -> Result<Status> {
        let executor = self
            .handle_for(task_id)
            .await
            .ok_or_else(|| DubError::NotFound(task_id.to_string()))?;
        executor.cancel();
        self.store.read_status(task_id).await
    }

    pub async fn list_segments(&self, task_id: &str, segments_file: &str) -> Result<SegmentTable> {
        self.store.read_segment_table(task_id, segments_file).await
    }

    pub async fn update_segments(
        &self,
        task_id: &str,
        segments_file: &str,
        table: SegmentTable,
    ) -> Result<SegmentTable> {
        self.store.write_segment_table(task_id, segments_file, &table).await?;
        Ok(table)
    }

    pub async fn split_segment(
        &self,
        task_id: &str,
        segments_file: &str,
        id: usize,
        text_offset: usize,
    ) -> Result<SegmentTable> {
        let table = self.store.read_segment_table(task_id, segments_file).await?;
        let new_table = table.split(id, text_offset)?;
        self.store.write_segment_table(task_id, segments_file, &new_table).await?;
        Ok(new_table)
    }

    pub async fn merge_segments(
        &self,
        task_id: &str,
        segments_file: &str,
        ids: &[usize],
    ) -> Result<SegmentTable> {
        let table = self.store.read_segment_table(task_id, segments_file).await?;
        let new_table = table.merge(ids)?;
        self.store.write_segment_table(task_id, segments_file, &new_table).await?;
        Ok(new_table)
    }

    pub async fn delete_segments(
        &self,
        task_id: &str,
        segments_file: &str,
        ids: &[usize],
    ) -> Result<SegmentTable> {
        let table = self.store.read_segment_table(task_id, segments_file).await?;
        let new_table = table.delete(ids)?;
        self.store.write_segment_table(task_id, segments_file, &new_table).await?;
        Ok(new_table)
    }

    pub async fn update_segment(
        &self,
        task_id: &str,
        segments_file: &str,
        id: usize,
        patch: SegmentPatch,
    ) -> Result<SegmentTable> {
        let table = self.store.read_segment_table(task_id, segments_file).await?;
        let new_table = table.update(id, patch)?;
        self.store.write_segment_table(task_id, segments_file, &new_table).await?;
        Ok(new_table)
    }

    /// `retranslate_segment(task_id, id, override_text?) -> Segment` (spec
    /// §6): re-runs the translator for one segment's text, or accepts a
    /// caller-supplied override, clearing any cloned audio for it since its
    /// translated text has changed.
    pub async fn retranslate_segment(
        &self,
        task_id: &str,
        segments_file: &str,
        id: usize,
        override_text: Option<String>,
        source_lang: &str,
        target_lang: &str,
    ) -> Result<crate::segment::Segment> {
        let table = self.store.read_segment_table(task_id, segments_file).await?;
        let seg = table
            .get(id)
            .ok_or_else(|| DubError::InvalidRequest(format!("no segment with id {id}")))?
            .clone();

        let translated_text = match override_text {
            Some(text) => text,
            None => {
                let result = self.deps.translator.translate(&[seg.text.clone()], source_lang, target_lang).await?;
                result.into_iter().next().unwrap_or_else(|| seg.text.clone())
            }
        };

        let patch = SegmentPatch {
            translated_text: Some(translated_text),
            ..Default::default()
        };
        let mut new_table = table.update(id, patch)?;
        if let Some(seg) = new_table.segments.iter_mut().find(|s| s.id == id) {
            seg.cloned_audio_path = None;
            seg.cloned_duration = None;
            seg.error = None;
        }
        self.store.write_segment_table(task_id, segments_file, &new_table).await?;
        new_table
            .get(id)
            .cloned()
            .ok_or_else(|| DubError::InvalidRequest(format!("no segment with id {id}")))
    }

    /// `resynthesize_segment(task_id, id) -> ack` (spec §4.5, §6); the
    /// actual work runs asynchronously and completes via the EventBus.
    pub async fn resynthesize_segment(&self, task_id: &str, segment_id: usize) -> Result<()> {
        let executor = self
            .handle_for(task_id)
            .await
            .ok_or_else(|| DubError::NotFound(task_id.to_string()))?;
        let executor_clone = executor.clone();
        tokio::spawn(async move { executor_clone.resynthesize_segment(segment_id).await });
        Ok(())
    }

    /// `regenerate_final(task_id) -> ack` (spec §4.5, §6).
    pub async fn regenerate_final(&self, task_id: &str) -> Result<()> {
        let executor = self
            .handle_for(task_id)
            .await
            .ok_or_else(|| DubError::NotFound(task_id.to_string()))?;
        let executor_clone = executor.clone();
        tokio::spawn(async move { executor_clone.regenerate_final().await });
        Ok(())
    }

    #[allow(dead_code)]
    fn validate_pause_after(pause_after: Option<PauseAfter>) -> Option<PauseAfter> {
        pause_after
    }
}
