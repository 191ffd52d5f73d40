//! Drives one task through the nine pipeline stages, pausing at the two
//! review checkpoints and supporting surgical re-entry (spec §4.4, §4.5).
//!
//! One `Executor` exists per active task (spawned by the `Scheduler`); it
//! owns no state beyond a cancellation flag; everything else is read back
//! from the `TaskStore` on every entry point so `continue_run`,
//! `resynthesize_segment`, and `regenerate_final` work the same whether
//! they run in the same process as `run` or after a restart.

use crate::config::{MergerConfig, TranscriberConfig, TranslatorConfig};
use crate::engines::{
    AudioExtractorEngine, MuxerEngine, SpeakerMappingEntry, SpeakerTrackerEngine,
    TranscribedSegment, TranscriberEngine, TranscriptionResult, TranslatorEngine,
    VocalSeparatorEngine, VoiceClonerEngine,
};
use crate::engines::{audio, transcriber as transcriber_ops};
use crate::error::{DubError, Result};
use crate::events::{EventBus, EventPayload};
use crate::merger::Merger;
use crate::segment::{Segment, SegmentTable, WordTimestamp};
use crate::task::{
    sanitize_basename, ArtifactNames, PauseAfter, StartRequest, Status, StatusPatch, TaskError,
    TaskStatus, TaskStore,
};
use futures::stream::{FuturesUnordered, StreamExt};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{error, warn};

const TASK_META_FILE: &str = "task_meta.json";

/// Bundle of pluggable backends the Executor drives (spec §4.2). Any
/// implementation satisfying the engine traits may be substituted.
#[derive(Clone)]
pub struct ExecutorDeps {
    pub audio_extractor: Arc<dyn AudioExtractorEngine>,
    pub vocal_separator: Arc<dyn VocalSeparatorEngine>,
    pub speaker_tracker: Arc<dyn SpeakerTrackerEngine>,
    pub transcriber: Arc<dyn TranscriberEngine>,
    pub translator: Arc<dyn TranslatorEngine>,
    pub voice_cloner: Arc<dyn VoiceClonerEngine>,
    pub muxer: Arc<dyn MuxerEngine>,
    pub merger_config: MergerConfig,
    pub transcriber_config: TranscriberConfig,
    pub translator_config: TranslatorConfig,
    pub per_segment_parallelism: usize,
}

/// Internal bookkeeping not covered by `status.json`'s schema (spec §6):
/// the source media path and the basename every artifact is named from,
/// plus the probed source duration used by the merger. Persisted once at
/// `start` and reloaded on every re-entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct TaskMeta {
    source_media_path: PathBuf,
    basename: String,
    single_speaker: bool,
    source_lang: String,
    target_lang: String,
    #[serde(default)]
    total_duration_s: Option<f64>,
}

pub struct Executor {
    task_id: String,
    store: TaskStore,
    events: EventBus,
    deps: ExecutorDeps,
    concurrency: Arc<Semaphore>,
    cancelled: Arc<AtomicBool>,
}

impl Executor {
    pub fn new(
        task_id: String,
        store: TaskStore,
        events: EventBus,
        deps: ExecutorDeps,
        concurrency: Arc<Semaphore>,
    ) -> Self {
        Self {
            task_id,
            store,
            events,
            deps,
            concurrency,
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Requests cooperative cancellation; takes effect at the next
    /// suspension point between stages (spec §4.5).
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    fn check_cancelled(&self) -> Result<()> {
        if self.cancelled.load(Ordering::SeqCst) {
            Err(DubError::Cancelled)
        } else {
            Ok(())
        }
    }

    async fn set_status(&self, patch: StatusPatch) -> Result<Status> {
        let status = self.store.patch_status(&self.task_id, patch).await?;
        self.events
            .publish(
                &self.task_id,
                EventPayload::Status { status: Box::new(status.clone()) },
            )
            .await;
        Ok(status)
    }

    async fn emit_progress(
        &self,
        step_name: &str,
        progress: u8,
        current_segment: Option<usize>,
        total_segments: Option<usize>,
    ) {
        self.events
            .publish(
                &self.task_id,
                EventPayload::Progress {
                    step_name: step_name.to_string(),
                    progress,
                    current_segment,
                    total_segments,
                },
            )
            .await;
    }

    async fn fail(&self, err: &DubError, step_name: &str) {
        error!(task_id = %self.task_id, step = step_name, "{err}");
        let patch = StatusPatch {
            status: Some(TaskStatus::Failed),
            message: Some(err.to_string()),
            step_name: Some(step_name.to_string()),
            error: Some(Some(TaskError {
                kind: err.kind().to_string(),
                message: err.to_string(),
            })),
            ..Default::default()
        };
        let _ = self.set_status(patch).await;
        self.events
            .publish(
                &self.task_id,
                EventPayload::Error { kind: err.kind().to_string(), message: err.to_string() },
            )
            .await;
    }

    /// `start(request)` (spec §4.5, §6): runs stage 1 through completion
    /// or the requested pause checkpoint.
    pub async fn run(&self, request: StartRequest) {
        let Ok(_permit) = self.concurrency.acquire().await else { return };

        let meta = TaskMeta {
            source_media_path: request.source_media_path.clone(),
            basename: sanitize_basename(&request.source_media_path),
            single_speaker: request.single_speaker,
            source_lang: request.source_lang.clone(),
            target_lang: request.target_lang.clone(),
            total_duration_s: None,
        };
        if let Err(e) = self.store.write_meta(&self.task_id, TASK_META_FILE, &meta).await {
            self.fail(&e, "start").await;
            return;
        }
        if let Err(e) = self
            .set_status(StatusPatch { status: Some(TaskStatus::Processing), ..Default::default() })
            .await
        {
            self.fail(&e, "start").await;
            return;
        }

        self.drive(meta, request.pause_after, 1).await;
    }

    /// `continue(task_id)` (spec §4.5): rejected by the `Scheduler` unless
    /// paused; resumes from the stage after the checkpoint.
    pub async fn continue_run(&self) {
        let Ok(_permit) = self.concurrency.acquire().await else { return };

        let status = match self.store.read_status(&self.task_id).await {
            Ok(s) => s,
            Err(e) => {
                self.fail(&e, "continue").await;
                return;
            }
        };
        let meta: TaskMeta = match self.store.read_meta(&self.task_id, TASK_META_FILE).await {
            Ok(m) => m,
            Err(e) => {
                self.fail(&e, "continue").await;
                return;
            }
        };

        let from_stage = match status.status {
            TaskStatus::PausedStep4 => 5,
            TaskStatus::PausedStep5 => 6,
            other => {
                warn!(task_id = %self.task_id, status = ?other, "continue called on a non-paused task");
                return;
            }
        };

        self.cancelled.store(false, Ordering::SeqCst);
        if let Err(e) = self
            .set_status(StatusPatch { status: Some(TaskStatus::Processing), ..Default::default() })
            .await
        {
            self.fail(&e, "continue").await;
            return;
        }

        self.drive(meta, status.pause_after, from_stage).await;
    }

    /// Drives stages `from_stage..=9`, honoring `pause_after` checkpoints
    /// and cooperative cancellation between stages (spec §4.4, §4.5).
    async fn drive(&self, mut meta: TaskMeta, pause_after: Option<PauseAfter>, from_stage: u8) {
        let names = ArtifactNames::new(meta.basename.clone());

        if from_stage <= 1 {
            if self.check_cancelled().is_err() {
                self.fail(&DubError::Cancelled, "extract_audio").await;
                return;
            }
            self.set_status(StatusPatch {
                current_step: Some(1),
                step_name: Some("extract_audio".to_string()),
                progress: Some(5),
                ..Default::default()
            })
            .await
            .ok();
            if let Err(e) = self.stage1_extract_audio(&mut meta, &names).await {
                self.fail(&e, "extract_audio").await;
                return;
            }
        }

        if from_stage <= 2 {
            if self.check_cancelled().is_err() {
                self.fail(&DubError::Cancelled, "separate_vocals").await;
                return;
            }
            self.set_status(StatusPatch {
                current_step: Some(2),
                step_name: Some("separate_vocals".to_string()),
                progress: Some(15),
                ..Default::default()
            })
            .await
            .ok();
            if let Err(e) = self.stage2_separate_vocals(&names).await {
                self.fail(&e, "separate_vocals").await;
                return;
            }
        }

        if from_stage <= 3 && !meta.single_speaker {
            if self.check_cancelled().is_err() {
                self.fail(&DubError::Cancelled, "speaker_tracks").await;
                return;
            }
            self.set_status(StatusPatch {
                current_step: Some(3),
                step_name: Some("speaker_tracks".to_string()),
                progress: Some(25),
                ..Default::default()
            })
            .await
            .ok();
            if let Err(e) = self.stage3_speaker_tracks(&names).await {
                self.fail(&e, "speaker_tracks").await;
                return;
            }
        }

        if from_stage <= 4 {
            if self.check_cancelled().is_err() {
                self.fail(&DubError::Cancelled, "transcribe").await;
                return;
            }
            self.set_status(StatusPatch {
                current_step: Some(4),
                step_name: Some("transcribe".to_string()),
                progress: Some(35),
                ..Default::default()
            })
            .await
            .ok();
            if let Err(e) = self.stage4_transcribe(&meta, &names).await {
                self.fail(&e, "transcribe").await;
                return;
            }

            if matches!(pause_after, Some(PauseAfter::Step4)) {
                self.set_status(StatusPatch {
                    status: Some(TaskStatus::PausedStep4),
                    message: Some("paused after transcription for review".to_string()),
                    ..Default::default()
                })
                .await
                .ok();
                return;
            }
        }

        if from_stage <= 5 {
            if self.check_cancelled().is_err() {
                self.fail(&DubError::Cancelled, "translate").await;
                return;
            }
            self.set_status(StatusPatch {
                current_step: Some(5),
                step_name: Some("translate".to_string()),
                progress: Some(45),
                ..Default::default()
            })
            .await
            .ok();
            if let Err(e) = self.stage5_translate(&meta, &names).await {
                self.fail(&e, "translate").await;
                return;
            }

            if matches!(pause_after, Some(PauseAfter::Step5)) {
                self.set_status(StatusPatch {
                    status: Some(TaskStatus::PausedStep5),
                    message: Some("paused after translation for review".to_string()),
                    ..Default::default()
                })
                .await
                .ok();
                return;
            }
        }

        if from_stage <= 6 {
            if self.check_cancelled().is_err() {
                self.fail(&DubError::Cancelled, "extract_references").await;
                return;
            }
            self.set_status(StatusPatch {
                current_step: Some(6),
                step_name: Some("extract_references".to_string()),
                progress: Some(55),
                ..Default::default()
            })
            .await
            .ok();
            if let Err(e) = self.stage6_extract_references(&names).await {
                self.fail(&e, "extract_references").await;
                return;
            }
        }

        if from_stage <= 7 {
            if self.check_cancelled().is_err() {
                self.fail(&DubError::Cancelled, "clone_voices").await;
                return;
            }
            self.set_status(StatusPatch {
                current_step: Some(7),
                step_name: Some("clone_voices".to_string()),
                progress: Some(70),
                ..Default::default()
            })
            .await
            .ok();
            if let Err(e) = self.stage7_clone_voices(&names).await {
                self.fail(&e, "clone_voices").await;
                return;
            }
        }

        if from_stage <= 8 {
            if self.check_cancelled().is_err() {
                self.fail(&DubError::Cancelled, "merge_voice").await;
                return;
            }
            self.set_status(StatusPatch {
                current_step: Some(8),
                step_name: Some("merge_voice".to_string()),
                progress: Some(85),
                ..Default::default()
            })
            .await
            .ok();
            if let Err(e) = self.stage8_merge_voice(&meta, &names).await {
                self.fail(&e, "merge_voice").await;
                return;
            }
        }

        if from_stage <= 9 {
            if self.check_cancelled().is_err() {
                self.fail(&DubError::Cancelled, "mux").await;
                return;
            }
            self.set_status(StatusPatch {
                current_step: Some(9),
                step_name: Some("mux".to_string()),
                progress: Some(95),
                ..Default::default()
            })
            .await
            .ok();
            if let Err(e) = self.stage9_mux(&meta, &names).await {
                self.fail(&e, "mux").await;
                return;
            }
        }

        self.set_status(StatusPatch {
            status: Some(TaskStatus::Completed),
            progress: Some(100),
            step_name: Some("completed".to_string()),
            message: Some("done".to_string()),
            ..Default::default()
        })
        .await
        .ok();
    }

    async fn stage1_extract_audio(&self, meta: &mut TaskMeta, names: &ArtifactNames) -> Result<()> {
        let dest = self.store.task_dir(&self.task_id).join(names.audio());
        let duration = self.deps.audio_extractor.extract(&meta.source_media_path, &dest).await?;
        meta.total_duration_s = Some(duration);
        self.store.write_meta(&self.task_id, TASK_META_FILE, meta).await
    }

    async fn stage2_separate_vocals(&self, names: &ArtifactNames) -> Result<()> {
        let audio_path = self.store.artifact_path(&self.task_id, &names.audio()).await?;
        let result = self.deps.vocal_separator.separate(&audio_path).await?;
        self.store.put_artifact_from_path(&self.task_id, &names.vocals(), &result.vocals_path).await?;
        if let Some(accompaniment) = &result.accompaniment_path {
            self.store
                .put_artifact_from_path(&self.task_id, &names.accompaniment(), accompaniment)
                .await?;
        }
        Ok(())
    }

    async fn stage3_speaker_tracks(&self, names: &ArtifactNames) -> Result<()> {
        let vocals_path = self.store.artifact_path(&self.task_id, &names.vocals()).await?;
        let tracks = self.deps.speaker_tracker.build(&vocals_path).await?;
        for track in tracks {
            self.store
                .put_artifact_from_path(&self.task_id, &names.speaker_wav(&track.speaker_id), &track.compact_audio_path)
                .await?;
            self.store
                .write_meta(&self.task_id, &names.speaker_json(&track.speaker_id), &track.mapping)
                .await?;
        }
        Ok(())
    }

    /// Stage 4: transcribes either the whole vocals file (`single_speaker`)
    /// or each speaker's compact track, remapping compact timestamps back
    /// onto the global timeline before the segments are merged and sorted
    /// (spec §4.2, §4.4).
    async fn stage4_transcribe(&self, meta: &TaskMeta, names: &ArtifactNames) -> Result<()> {
        let silence_gap = self.deps.transcriber_config.silence_split_gap_s;
        let lang_hint = if meta.source_lang == "auto" { None } else { Some(meta.source_lang.as_str()) };

        let mut transcribed: Vec<(TranscribedSegment, Option<String>)> = Vec::new();
        let mut raw_by_speaker: Vec<(String, TranscriptionResult)> = Vec::new();

        if meta.single_speaker {
            let vocals_path = self.store.artifact_path(&self.task_id, &names.vocals()).await?;
            let result = self.deps.transcriber.transcribe(&vocals_path, lang_hint).await?;
            let language = result.language.clone();
            let split = transcriber_ops::split_on_silence(result.segments, silence_gap);
            raw_by_speaker.push(("spk0".to_string(), TranscriptionResult { language, segments: split.clone() }));
            for seg in split {
                transcribed.push((seg, Some("spk0".to_string())));
            }
        } else {
            let speakers_dir = self.store.task_dir(&self.task_id).join("speakers");
            let mut entries = tokio::fs::read_dir(&speakers_dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                if !entry.file_type().await?.is_dir() {
                    continue;
                }
                let speaker_id = entry.file_name().to_string_lossy().to_string();
                let compact_path = self.store.artifact_path(&self.task_id, &names.speaker_wav(&speaker_id)).await?;
                let mapping: Vec<SpeakerMappingEntry> = self
                    .store
                    .read_meta(&self.task_id, &names.speaker_json(&speaker_id))
                    .await
                    .unwrap_or_default();

                let result = self.deps.transcriber.transcribe(&compact_path, lang_hint).await?;
                let language = result.language.clone();
                let split = transcriber_ops::split_on_silence(result.segments, silence_gap);
                raw_by_speaker.push((
                    speaker_id.clone(),
                    TranscriptionResult { language, segments: split.clone() },
                ));

                for seg in split {
                    transcribed.push((shift_to_global(&seg, &mapping), Some(speaker_id.clone())));
                }
            }
        }

        transcribed.sort_by(|a, b| a.0.start.partial_cmp(&b.0.start).unwrap());

        let segments: Vec<Segment> = transcribed
            .into_iter()
            .enumerate()
            .map(|(id, (t, speaker_id))| Segment {
                id,
                start: t.start,
                end: t.end,
                text: t.text,
                translated_text: None,
                speaker_id,
                words: t.words,
                cloned_audio_path: None,
                cloned_duration: None,
                error: None,
            })
            .collect();

        self.store
            .write_segment_table(&self.task_id, &names.segments(), &SegmentTable::new(segments))
            .await?;
        self.store.write_meta(&self.task_id, &names.whisper_raw(), &raw_by_speaker).await?;
        Ok(())
    }

    async fn stage5_translate(&self, meta: &TaskMeta, names: &ArtifactNames) -> Result<()> {
        let mut table = self.store.read_segment_table(&self.task_id, &names.segments()).await?;

        if meta.source_lang == meta.target_lang {
            for seg in table.segments.iter_mut() {
                seg.translated_text = Some(seg.text.clone());
            }
            self.store.write_segment_table(&self.task_id, &names.segments(), &table).await?;
            return Ok(());
        }

        let translator_config = &self.deps.translator_config;
        let mut log_lines = Vec::new();
        let original = table.segments.clone();

        for chunk in original.chunks(translator_config.batch_size.max(1)) {
            let texts: Vec<String> = chunk.iter().map(|s| s.text.clone()).collect();
            let translated = self
                .translate_with_retry(&texts, &meta.source_lang, &meta.target_lang, translator_config.max_retries)
                .await?;

            for (seg, translated_text) in chunk.iter().zip(translated.into_iter()) {
                if let Some(target) = table.segments.iter_mut().find(|s| s.id == seg.id) {
                    target.translated_text = Some(translated_text.clone());
                }
                log_lines.push(format!("[{}] {} -> {}", seg.id, seg.text, translated_text));
            }
        }

        self.store.write_segment_table(&self.task_id, &names.segments(), &table).await?;
        self.store
            .put_artifact(&self.task_id, &names.translation_txt(), log_lines.join("\n").as_bytes())
            .await?;
        Ok(())
    }

    async fn translate_with_retry(
        &self,
        texts: &[String],
        src_lang: &str,
        tgt_lang: &str,
        max_retries: u32,
    ) -> Result<Vec<String>> {
        let mut last_error = None;
        for attempt in 0..=max_retries {
            if attempt > 0 {
                tokio::time::sleep(std::time::Duration::from_secs(2u64.pow(attempt - 1))).await;
            }
            match self.deps.translator.translate(texts, src_lang, tgt_lang).await {
                Ok(result) if result.len() == texts.len() => return Ok(result),
                Ok(_) => {
                    last_error = Some(DubError::EngineFailure(
                        "translator returned a mismatched batch length".to_string(),
                    ))
                }
                Err(e) => {
                    warn!(task_id = %self.task_id, attempt, "translation batch failed: {e}");
                    last_error = Some(e);
                }
            }
        }
        Err(last_error.unwrap_or_else(|| DubError::EngineFailure("unknown translation failure".to_string())))
    }

    /// Stage 6: extracts each segment's reference clip from the vocals
    /// track, bounded by `per_segment_parallelism` (spec §4.2, §5).
    /// Extraction failures are recorded per-segment rather than failing
    /// the whole task, mirroring stage 7's propagation policy (spec §7).
    async fn stage6_extract_references(&self, names: &ArtifactNames) -> Result<()> {
        let vocals_path = self.store.artifact_path(&self.task_id, &names.vocals()).await?;
        let mut table = self.store.read_segment_table(&self.task_id, &names.segments()).await?;

        let semaphore = Arc::new(Semaphore::new(self.deps.per_segment_parallelism.max(1)));
        let mut futures = FuturesUnordered::new();
        for seg in table.segments.clone() {
            let sem = semaphore.clone();
            let vocals_path = vocals_path.clone();
            let ref_path = self.store.task_dir(&self.task_id).join(names.ref_segment(seg.id));
            futures.push(async move {
                let _permit = sem.acquire().await.expect("semaphore closed");
                let (s, e) = (seg.start, seg.end);
                let outcome = tokio::task::spawn_blocking(move || audio::extract_segment(&vocals_path, &ref_path, s, e)).await;
                let result = match outcome {
                    Ok(r) => r,
                    Err(err) => Err(DubError::EngineFailure(format!("reference extraction task panicked: {err}"))),
                };
                (seg.id, result)
            });
        }

        while let Some((id, result)) = futures.next().await {
            if let Err(e) = result {
                warn!(task_id = %self.task_id, segment_id = id, "{e}");
                if let Some(seg) = table.segments.iter_mut().find(|s| s.id == id) {
                    seg.error = Some(format!("reference extraction failed: {e}"));
                }
            }
        }

        self.store.write_segment_table(&self.task_id, &names.segments(), &table).await
    }

    /// Stage 7: clones each segment's reference into its translated text,
    /// bounded by `per_segment_parallelism`. A segment that already
    /// carries an error (from stage 6) is skipped (spec §7).
    async fn stage7_clone_voices(&self, names: &ArtifactNames) -> Result<()> {
        let mut table = self.store.read_segment_table(&self.task_id, &names.segments()).await?;
        let total = table.segments.len().max(1);

        let semaphore = Arc::new(Semaphore::new(self.deps.per_segment_parallelism.max(1)));
        let mut futures = FuturesUnordered::new();
        for seg in table.segments.clone() {
            if seg.error.is_some() {
                continue;
            }
            let sem = semaphore.clone();
            let cloner = Arc::clone(&self.deps.voice_cloner);
            let ref_path = self.store.task_dir(&self.task_id).join(names.ref_segment(seg.id));
            let cloned_rel = names.cloned_segment(seg.id);
            let cloned_path = self.store.task_dir(&self.task_id).join(&cloned_rel);
            let text = seg.translated_text.clone().unwrap_or_else(|| seg.text.clone());
            futures.push(async move {
                let _permit = sem.acquire().await.expect("semaphore closed");
                let result = VoiceClonerEngine::clone(cloner.as_ref(), &ref_path, &text, &cloned_path).await;
                (seg.id, cloned_rel, result)
            });
        }

        let mut completed = 0usize;
        while let Some((id, cloned_rel, result)) = futures.next().await {
            completed += 1;
            match result {
                Ok(duration) => {
                    if let Some(seg) = table.segments.iter_mut().find(|s| s.id == id) {
                        seg.cloned_audio_path = Some(PathBuf::from(cloned_rel));
                        seg.cloned_duration = Some(duration);
                        seg.error = None;
                    }
                }
                Err(e) => {
                    warn!(task_id = %self.task_id, segment_id = id, "{e}");
                    if let Some(seg) = table.segments.iter_mut().find(|s| s.id == id) {
                        seg.error = Some(format!("voice cloning failed: {e}"));
                    }
                }
            }
            self.emit_progress(
                "clone_voices",
                (70 + completed * 15 / total) as u8,
                Some(id),
                Some(total),
            )
            .await;
        }

        self.store.write_segment_table(&self.task_id, &names.segments(), &table).await
    }

    async fn stage8_merge_voice(&self, meta: &TaskMeta, names: &ArtifactNames) -> Result<()> {
        let table = self.store.read_segment_table(&self.task_id, &names.segments()).await?;
        let vocals_path = self.store.artifact_path(&self.task_id, &names.vocals()).await?;
        let accompaniment_path = self.store.artifact_path(&self.task_id, &names.accompaniment()).await.ok();
        let task_dir = self.store.task_dir(&self.task_id);
        let dest = task_dir.join(names.final_voice());
        let total_duration_s = meta
            .total_duration_s
            .unwrap_or_else(|| table.segments.iter().map(|s| s.end).fold(0.0, f64::max));

        let merger = Merger::new(&self.deps.merger_config);
        let warnings = merger.merge(
            &table.segments,
            &vocals_path,
            accompaniment_path.as_deref(),
            |id| table.get(id).and_then(|s| s.cloned_audio_path.clone()).map(|p| task_dir.join(p)),
            &dest,
            total_duration_s,
        )?;

        for warning in &warnings {
            self.store.append_log(&self.task_id, warning).await?;
        }
        Ok(())
    }

    async fn stage9_mux(&self, meta: &TaskMeta, names: &ArtifactNames) -> Result<()> {
        let final_voice_path = self.store.artifact_path(&self.task_id, &names.final_voice()).await?;
        let dest = self.store.task_dir(&self.task_id).join(names.translated_video());
        self.deps.muxer.mux(&meta.source_media_path, &final_voice_path, None, &dest).await
    }

    /// `resynthesize_segment(task_id, id)` (spec §4.5): reruns stages 6+7
    /// for exactly one segment, leaving every other segment's clone
    /// untouched, and publishes `ResynthesizeComplete` on success.
    pub async fn resynthesize_segment(&self, segment_id: usize) {
        let Ok(_permit) = self.concurrency.acquire().await else { return };

        let meta: TaskMeta = match self.store.read_meta(&self.task_id, TASK_META_FILE).await {
            Ok(m) => m,
            Err(e) => {
                self.fail(&e, "resynthesize_segment").await;
                return;
            }
        };
        let names = ArtifactNames::new(meta.basename.clone());

        let vocals_path = match self.store.artifact_path(&self.task_id, &names.vocals()).await {
            Ok(p) => p,
            Err(e) => {
                self.fail(&e, "resynthesize_segment").await;
                return;
            }
        };
        let mut table = match self.store.read_segment_table(&self.task_id, &names.segments()).await {
            Ok(t) => t,
            Err(e) => {
                self.fail(&e, "resynthesize_segment").await;
                return;
            }
        };
        let Some(seg) = table.get(segment_id).cloned() else {
            self.fail(
                &DubError::InvalidRequest(format!("no segment with id {segment_id}")),
                "resynthesize_segment",
            )
            .await;
            return;
        };

        let ref_path = self.store.task_dir(&self.task_id).join(names.ref_segment(seg.id));
        let extraction = {
            let rp = ref_path.clone();
            let (s, e) = (seg.start, seg.end);
            tokio::task::spawn_blocking(move || audio::extract_segment(&vocals_path, &rp, s, e)).await
        };

        let result: Result<(PathBuf, f64)> = match extraction {
            Ok(Ok(())) => {
                let text = seg.translated_text.clone().unwrap_or_else(|| seg.text.clone());
                let cloned_rel = names.cloned_segment(seg.id);
                let cloned_path = self.store.task_dir(&self.task_id).join(&cloned_rel);
                match VoiceClonerEngine::clone(self.deps.voice_cloner.as_ref(), &ref_path, &text, &cloned_path).await {
                    Ok(duration) => Ok((PathBuf::from(cloned_rel), duration)),
                    Err(e) => Err(e),
                }
            }
            Ok(Err(e)) => Err(e),
            Err(err) => Err(DubError::EngineFailure(format!("reference extraction task panicked: {err}"))),
        };

        if let Some(target) = table.segments.iter_mut().find(|s| s.id == segment_id) {
            match result {
                Ok((cloned_rel, duration)) => {
                    target.cloned_audio_path = Some(cloned_rel);
                    target.cloned_duration = Some(duration);
                    target.error = None;
                }
                Err(e) => target.error = Some(e.to_string()),
            }
        }

        if let Err(e) = self.store.write_segment_table(&self.task_id, &names.segments(), &table).await {
            self.fail(&e, "resynthesize_segment").await;
            return;
        }

        self.events
            .publish(&self.task_id, EventPayload::ResynthesizeComplete { segment_id })
            .await;
    }

    /// `regenerate_final(task_id)` (spec §4.5): reruns stages 8+9 from the
    /// current segment table without touching any existing clone.
    pub async fn regenerate_final(&self) {
        let Ok(_permit) = self.concurrency.acquire().await else { return };

        let meta: TaskMeta = match self.store.read_meta(&self.task_id, TASK_META_FILE).await {
            Ok(m) => m,
            Err(e) => {
                self.fail(&e, "regenerate_final").await;
                return;
            }
        };
        let names = ArtifactNames::new(meta.basename.clone());

        if let Err(e) = self.stage8_merge_voice(&meta, &names).await {
            self.fail(&e, "regenerate_final").await;
            return;
        }
        if let Err(e) = self.stage9_mux(&meta, &names).await {
            self.fail(&e, "regenerate_final").await;
            return;
        }

        self.events.publish(&self.task_id, EventPayload::RegenerateComplete).await;
    }
}

/// Remaps a speaker-compact-track transcript segment (and its words) back
/// onto the global timeline using the track's compact/global mapping
/// windows (spec §4.2 `SpeakerTrack.mapping`).
fn shift_to_global(seg: &TranscribedSegment, mapping: &[SpeakerMappingEntry]) -> TranscribedSegment {
    let delta_start = compact_to_global_delta(mapping, seg.start);
    let delta_end = compact_to_global_delta(mapping, seg.end);
    TranscribedSegment {
        start: seg.start + delta_start,
        end: seg.end + delta_end,
        text: seg.text.clone(),
        words: seg.words.as_ref().map(|words| {
            words
                .iter()
                .map(|w| {
                    let delta = compact_to_global_delta(mapping, w.start);
                    WordTimestamp { word: w.word.clone(), start: w.start + delta, end: w.end + delta }
                })
                .collect()
        }),
    }
}

fn compact_to_global_delta(mapping: &[SpeakerMappingEntry], compact_time: f64) -> f64 {
    mapping
        .iter()
        .find(|m| compact_time >= m.compact_start && compact_time <= m.compact_end)
        .map(|m| m.global_start - m.compact_start)
        .unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compact_to_global_delta_finds_enclosing_window() {
        let mapping = vec![
            SpeakerMappingEntry { compact_start: 0.0, compact_end: 2.0, global_start: 10.0, global_end: 12.0 },
            SpeakerMappingEntry { compact_start: 2.0, compact_end: 4.0, global_start: 20.0, global_end: 22.0 },
        ];
        assert_eq!(compact_to_global_delta(&mapping, 1.0), 10.0);
        assert_eq!(compact_to_global_delta(&mapping, 3.0), 18.0);
    }

    #[test]
    fn test_compact_to_global_delta_defaults_to_zero_outside_any_window() {
        let mapping = vec![SpeakerMappingEntry {
            compact_start: 0.0,
            compact_end: 1.0,
            global_start: 5.0,
            global_end: 6.0,
        }];
        assert_eq!(compact_to_global_delta(&mapping, 10.0), 0.0);
    }

    #[test]
    fn test_shift_to_global_shifts_segment_and_words() {
        let mapping = vec![SpeakerMappingEntry {
            compact_start: 0.0,
            compact_end: 10.0,
            global_start: 100.0,
            global_end: 110.0,
        }];
        let seg = TranscribedSegment {
            start: 1.0,
            end: 2.0,
            text: "hi".to_string(),
            words: Some(vec![WordTimestamp { word: "hi".to_string(), start: 1.0, end: 2.0 }]),
        };
        let shifted = shift_to_global(&seg, &mapping);
        assert_eq!(shifted.start, 101.0);
        assert_eq!(shifted.end, 102.0);
        assert_eq!(shifted.words.unwrap()[0].start, 101.0);
    }
}
