use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use dubwright::config::{Config, TranscriberProvider};
use dubwright::engines::{
    AudioExtractorEngine, FfmpegAudioExtractor, FfmpegMuxer, GeminiTranscriber, GeminiTranslator,
    HttpVoiceCloner, PassthroughVocalSeparator, SingleSpeakerTracker, WhisperTranscriber,
};
use dubwright::events::EventPayload;
use dubwright::segment::SegmentPatch;
use dubwright::task::PauseAfter;
use dubwright::{EventBus, ExecutorDeps, Scheduler, StartRequest, TaskStore};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "dubwright")]
#[command(version, about = "Voice-preserving dubbing pipeline")]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start a new dubbing task for a source media file.
    Start {
        /// Input video/audio file
        input: PathBuf,
        /// Source language code (or "auto")
        #[arg(long, default_value = "auto")]
        source_lang: String,
        /// Target language code
        #[arg(long, default_value = "en")]
        target_lang: String,
        /// Treat the whole clip as a single speaker, skipping diarization
        #[arg(long)]
        single_speaker: bool,
        /// Pause for review after transcription or translation
        #[arg(long, value_enum)]
        pause_after: Option<PauseAfterArg>,
    },
    /// Print a task's current status.
    Status { task_id: String },
    /// Resume a paused task.
    Continue { task_id: String },
    /// Cancel a running task.
    Cancel { task_id: String },
    /// List the segments of a task.
    Segments { task_id: String },
    /// Split a segment's text at a character offset.
    SplitSegment { task_id: String, id: usize, text_offset: usize },
    /// Merge a contiguous range of segment ids into one.
    MergeSegment {
        task_id: String,
        #[arg(required = true, num_args = 2..)]
        ids: Vec<usize>,
    },
    /// Delete the given segment ids.
    DeleteSegment {
        task_id: String,
        #[arg(required = true, num_args = 1..)]
        ids: Vec<usize>,
    },
    /// Edit a segment's text, retranslating and invalidating its clone.
    RetranslateSegment {
        task_id: String,
        id: usize,
        /// Supply the translation directly instead of calling the translator
        #[arg(long)]
        override_text: Option<String>,
    },
    /// Re-extract and re-clone a single segment's voice.
    Resynthesize { task_id: String, segment_id: usize },
    /// Re-run merge and mux from the current segment table.
    RegenerateFinal { task_id: String },
    /// Run the HTTP/WebSocket boundary.
    Serve {
        #[arg(long, default_value = "127.0.0.1:8080")]
        bind: String,
    },
}

#[derive(Clone, Copy, clap::ValueEnum)]
enum PauseAfterArg {
    Step4,
    Step5,
}

impl From<PauseAfterArg> for PauseAfter {
    fn from(value: PauseAfterArg) -> Self {
        match value {
            PauseAfterArg::Step4 => PauseAfter::Step4,
            PauseAfterArg::Step5 => PauseAfter::Step5,
        }
    }
}

fn init_logging(verbose: bool) {
    let level = if verbose { Level::DEBUG } else { Level::INFO };

    FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .init();
}

fn build_deps(config: &Config) -> ExecutorDeps {
    let transcriber: Arc<dyn dubwright::engines::TranscriberEngine> = match config.default_transcriber {
        TranscriberProvider::Whisper => Arc::new(WhisperTranscriber::new(
            config.openai_api_key.clone().unwrap_or_default(),
        )),
        TranscriberProvider::Gemini => Arc::new(GeminiTranscriber::new(
            config.gemini_api_key.clone().unwrap_or_default(),
        )),
    };

    ExecutorDeps {
        audio_extractor: Arc::new(FfmpegAudioExtractor),
        vocal_separator: Arc::new(PassthroughVocalSeparator),
        speaker_tracker: Arc::new(SingleSpeakerTracker),
        transcriber,
        translator: Arc::new(GeminiTranslator::new(config.gemini_api_key.clone().unwrap_or_default())),
        voice_cloner: Arc::new(HttpVoiceCloner::new(
            config.voice_clone_endpoint.clone().unwrap_or_default(),
        )),
        muxer: Arc::new(FfmpegMuxer),
        merger_config: config.merger.clone(),
        transcriber_config: config.transcriber.clone(),
        translator_config: config.translator.clone(),
        per_segment_parallelism: config.per_segment_parallelism,
    }
}

fn build_scheduler(config: &Config) -> Scheduler {
    let store = TaskStore::new(config.tasks_root.clone());
    let events = EventBus::new(config.event_queue_capacity);
    let deps = build_deps(config);
    Scheduler::new(store, events, deps, config.max_concurrent_tasks)
}

/// Prints every event for a task until it reaches a terminal or paused
/// status, mirroring the teacher's console progress view (independent of
/// any HTTP/WebSocket subscriber).
async fn watch_until_settled(scheduler: &Scheduler, task_id: &str) -> Result<()> {
    let (snapshot, mut rx) = scheduler.event_bus().subscribe(task_id).await;
    if let Some(event) = snapshot {
        print_event(&event.payload);
    }
    loop {
        match rx.recv().await {
            Ok(event) => {
                print_event(&event.payload);
                if let EventPayload::Status { status } = &event.payload {
                    if status.status.is_terminal() || status.status.is_paused() {
                        break;
                    }
                }
            }
            Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
            Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
        }
    }
    Ok(())
}

fn print_event(payload: &EventPayload) {
    match payload {
        EventPayload::Status { status } => {
            println!("[{}] {} ({}%) — {}", status.step_name, status.message, status.progress, format!("{:?}", status.status));
        }
        EventPayload::Progress { step_name, progress, current_segment, total_segments } => {
            match (current_segment, total_segments) {
                (Some(c), Some(t)) => println!("{step_name}: {progress}% (segment {c}/{t})"),
                _ => println!("{step_name}: {progress}%"),
            }
        }
        EventPayload::ResynthesizeComplete { segment_id } => println!("segment {segment_id} resynthesized"),
        EventPayload::RegenerateComplete => println!("final track regenerated"),
        EventPayload::Error { kind, message } => eprintln!("error [{kind}]: {message}"),
        EventPayload::Backpressure => eprintln!("warning: subscriber lagged, some events were dropped"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config = Config::load().context("failed to load configuration")?;
    config.validate().context("configuration validation failed")?;

    match cli.command {
        Command::Start { input, source_lang, target_lang, single_speaker, pause_after } => {
            if !input.exists() {
                anyhow::bail!("input file not found: {}", input.display());
            }
            dubwright::engines::audio::check_ffmpeg()
                .context("ffmpeg not found; it is required to extract and mux audio")?;

            let scheduler = build_scheduler(&config);
            let request = StartRequest {
                source_media_path: input,
                source_lang,
                target_lang,
                single_speaker,
                pause_after: pause_after.map(Into::into),
            };
            let (task_id, _status) = scheduler.start(request).await.context("failed to start task")?;
            info!("started task {task_id}");

            let cancelled = Arc::new(AtomicBool::new(false));
            let cancelled_clone = cancelled.clone();
            ctrlc::set_handler(move || {
                if cancelled_clone.swap(true, Ordering::SeqCst) {
                    std::process::exit(1);
                }
                eprintln!("\nreceived Ctrl+C, cancelling... (press again to force quit)");
            })
            .ok();

            watch_until_settled(&scheduler, &task_id).await?;
            println!("task id: {task_id}");
        }
        Command::Status { task_id } => {
            let scheduler = build_scheduler(&config);
            let status = scheduler.status(&task_id).await?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        Command::Continue { task_id } => {
            let scheduler = build_scheduler(&config);
            scheduler.continue_task(&task_id).await?;
            watch_until_settled(&scheduler, &task_id).await?;
        }
        Command::Cancel { task_id } => {
            let scheduler = build_scheduler(&config);
            let status = scheduler.cancel(&task_id).await?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        Command::Segments { task_id } => {
            let scheduler = build_scheduler(&config);
            let names = task_segments_file(&scheduler, &task_id).await?;
            let table = scheduler.list_segments(&task_id, &names).await?;
            println!("{}", serde_json::to_string_pretty(&table)?);
        }
        Command::SplitSegment { task_id, id, text_offset } => {
            let scheduler = build_scheduler(&config);
            let names = task_segments_file(&scheduler, &task_id).await?;
            let table = scheduler.split_segment(&task_id, &names, id, text_offset).await?;
            println!("{}", serde_json::to_string_pretty(&table)?);
        }
        Command::MergeSegment { task_id, ids } => {
            let scheduler = build_scheduler(&config);
            let names = task_segments_file(&scheduler, &task_id).await?;
            let table = scheduler.merge_segments(&task_id, &names, &ids).await?;
            println!("{}", serde_json::to_string_pretty(&table)?);
        }
        Command::DeleteSegment { task_id, ids } => {
            let scheduler = build_scheduler(&config);
            let names = task_segments_file(&scheduler, &task_id).await?;
            let table = scheduler.delete_segments(&task_id, &names, &ids).await?;
            println!("{}", serde_json::to_string_pretty(&table)?);
        }
        Command::RetranslateSegment { task_id, id, override_text } => {
            let scheduler = build_scheduler(&config);
            let names = task_segments_file(&scheduler, &task_id).await?;
            let status = scheduler.status(&task_id).await?;
            let segment = scheduler
                .retranslate_segment(&task_id, &names, id, override_text, &status.source_lang, &status.target_lang)
                .await?;
            println!("{}", serde_json::to_string_pretty(&segment)?);
        }
        Command::Resynthesize { task_id, segment_id } => {
            let scheduler = build_scheduler(&config);
            scheduler.resynthesize_segment(&task_id, segment_id).await?;
            watch_until_settled(&scheduler, &task_id).await?;
        }
        Command::RegenerateFinal { task_id } => {
            let scheduler = build_scheduler(&config);
            scheduler.regenerate_final(&task_id).await?;
            watch_until_settled(&scheduler, &task_id).await?;
        }
        Command::Serve { bind } => {
            let scheduler = Arc::new(build_scheduler(&config));
            info!("listening on {bind}");
            dubwright::boundary::serve(scheduler, &bind).await?;
        }
    }

    Ok(())
}

/// Derives a task's segments filename from its status (the basename is not
/// itself part of `status.json`, so it is reconstructed from the task id's
/// suffix, matching `ArtifactNames`'s convention).
async fn task_segments_file(scheduler: &Scheduler, task_id: &str) -> Result<String> {
    let _ = scheduler.status(task_id).await.context("task not found")?;
    let basename = dubwright::task::basename_from_task_id(task_id);
    Ok(dubwright::ArtifactNames::new(basename).segments())
}
