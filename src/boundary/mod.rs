//! HTTP request handlers and a WebSocket subscription endpoint that
//! translate external calls 1:1 onto `Scheduler` operations (spec §2
//! Boundary, §6 Operation surface). This is the thin transport the core
//! design treats as out of scope; it exists only to give the crate a
//! runnable `serve` entry point the way a real deployment would need.

mod ws;

use crate::error::DubError;
use crate::scheduler::Scheduler;
use crate::segment::{SegmentPatch, SegmentTable};
use crate::task::{ArtifactNames, PauseAfter, StartRequest};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

/// Shared state handed to every handler: just the `Scheduler`, matching
/// how `lukeanthony007-nayru`'s HTTP layer threads a single engine handle
/// through `axum::extract::State`.
type AppState = Arc<Scheduler>;

/// Builds the router and binds it, serving until the process exits.
/// Mirrors `main.rs::init_logging`'s one-shot setup style: construct,
/// then block on `axum::serve`.
pub async fn serve(scheduler: Arc<Scheduler>, bind: &str) -> anyhow::Result<()> {
    let app = router(scheduler);
    let listener = tokio::net::TcpListener::bind(bind).await?;
    info!(bind, "boundary listening");
    axum::serve(listener, app).await?;
    Ok(())
}

pub fn router(scheduler: Arc<Scheduler>) -> Router {
    Router::new()
        .route("/tasks", post(start_task))
        .route("/tasks/:id", get(get_status))
        .route("/tasks/:id/continue", post(continue_task))
        .route("/tasks/:id/cancel", post(cancel_task))
        .route("/tasks/:id/segments", get(list_segments).put(update_segments))
        .route("/tasks/:id/segments/:seg_id/split", post(split_segment))
        .route("/tasks/:id/segments/merge", post(merge_segments))
        .route("/tasks/:id/segments/delete", post(delete_segments))
        .route("/tasks/:id/segments/:seg_id", put(patch_segment))
        .route("/tasks/:id/segments/:seg_id/retranslate", post(retranslate_segment))
        .route("/tasks/:id/segments/:seg_id/resynthesize", post(resynthesize_segment))
        .route("/tasks/:id/regenerate-final", post(regenerate_final))
        .route("/tasks/:id/events", get(ws::subscribe))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(scheduler)
}

/// Wraps `DubError` so it can be returned directly from an axum handler;
/// the mapping follows spec §7's error kinds.
struct ApiError(DubError);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            DubError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            DubError::Conflict(_) => StatusCode::CONFLICT,
            DubError::NotFound(_) => StatusCode::NOT_FOUND,
            DubError::Corrupt(_) => StatusCode::UNPROCESSABLE_ENTITY,
            DubError::Cancelled => StatusCode::CONFLICT,
            DubError::EngineFailure(_) | DubError::Http(_) => StatusCode::BAD_GATEWAY,
            DubError::Config(_) | DubError::Io(_) | DubError::Json(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        let body = Json(ErrorBody {
            kind: self.0.kind().to_string(),
            message: self.0.to_string(),
        });
        (status, body).into_response()
    }
}

impl From<DubError> for ApiError {
    fn from(value: DubError) -> Self {
        ApiError(value)
    }
}

#[derive(Serialize)]
struct ErrorBody {
    kind: String,
    message: String,
}

type ApiResult<T> = Result<T, ApiError>;

/// Derives a task's segments artifact filename from its status. The
/// basename is not itself part of `status.json`, so it is reconstructed
/// from the task id's suffix, matching `ArtifactNames`'s convention (see
/// `crate::task::make_task_id`).
async fn segments_filename(scheduler: &Scheduler, task_id: &str) -> Result<String, ApiError> {
    let _ = scheduler.status(task_id).await?;
    Ok(ArtifactNames::new(crate::task::basename_from_task_id(task_id)).segments())
}

#[derive(Deserialize)]
struct StartTaskBody {
    source_media_path: PathBuf,
    #[serde(default = "default_lang")]
    source_lang: String,
    target_lang: String,
    #[serde(default)]
    single_speaker: bool,
    #[serde(default)]
    pause_after: Option<PauseAfter>,
}

fn default_lang() -> String {
    "auto".to_string()
}

#[derive(Serialize)]
struct StartTaskResponse {
    task_id: String,
    status: crate::task::TaskStatus,
}

async fn start_task(
    State(scheduler): State<AppState>,
    Json(body): Json<StartTaskBody>,
) -> ApiResult<Json<StartTaskResponse>> {
    let request = StartRequest {
        source_media_path: body.source_media_path,
        source_lang: body.source_lang,
        target_lang: body.target_lang,
        single_speaker: body.single_speaker,
        pause_after: body.pause_after,
    };
    let (task_id, status) = scheduler.start(request).await?;
    Ok(Json(StartTaskResponse { task_id, status: status.status }))
}

async fn get_status(
    State(scheduler): State<AppState>,
    Path(task_id): Path<String>,
) -> ApiResult<Json<crate::task::Status>> {
    Ok(Json(scheduler.status(&task_id).await?))
}

async fn continue_task(
    State(scheduler): State<AppState>,
    Path(task_id): Path<String>,
) -> ApiResult<Json<crate::task::Status>> {
    Ok(Json(scheduler.continue_task(&task_id).await?))
}

async fn cancel_task(
    State(scheduler): State<AppState>,
    Path(task_id): Path<String>,
) -> ApiResult<Json<crate::task::Status>> {
    Ok(Json(scheduler.cancel(&task_id).await?))
}

async fn list_segments(
    State(scheduler): State<AppState>,
    Path(task_id): Path<String>,
) -> ApiResult<Json<SegmentTable>> {
    let file = segments_filename(&scheduler, &task_id).await?;
    Ok(Json(scheduler.list_segments(&task_id, &file).await?))
}

async fn update_segments(
    State(scheduler): State<AppState>,
    Path(task_id): Path<String>,
    Json(table): Json<SegmentTable>,
) -> ApiResult<Json<SegmentTable>> {
    let file = segments_filename(&scheduler, &task_id).await?;
    Ok(Json(scheduler.update_segments(&task_id, &file, table).await?))
}

#[derive(Deserialize)]
struct SplitBody {
    text_offset: usize,
}

async fn split_segment(
    State(scheduler): State<AppState>,
    Path((task_id, seg_id)): Path<(String, usize)>,
    Json(body): Json<SplitBody>,
) -> ApiResult<Json<SegmentTable>> {
    let file = segments_filename(&scheduler, &task_id).await?;
    Ok(Json(
        scheduler.split_segment(&task_id, &file, seg_id, body.text_offset).await?,
    ))
}

#[derive(Deserialize)]
struct IdsBody {
    ids: Vec<usize>,
}

async fn merge_segments(
    State(scheduler): State<AppState>,
    Path(task_id): Path<String>,
    Json(body): Json<IdsBody>,
) -> ApiResult<Json<SegmentTable>> {
    let file = segments_filename(&scheduler, &task_id).await?;
    Ok(Json(scheduler.merge_segments(&task_id, &file, &body.ids).await?))
}

async fn delete_segments(
    State(scheduler): State<AppState>,
    Path(task_id): Path<String>,
    Json(body): Json<IdsBody>,
) -> ApiResult<Json<SegmentTable>> {
    let file = segments_filename(&scheduler, &task_id).await?;
    Ok(Json(scheduler.delete_segments(&task_id, &file, &body.ids).await?))
}

async fn patch_segment(
    State(scheduler): State<AppState>,
    Path((task_id, seg_id)): Path<(String, usize)>,
    Json(patch): Json<SegmentPatch>,
) -> ApiResult<Json<SegmentTable>> {
    let file = segments_filename(&scheduler, &task_id).await?;
    Ok(Json(scheduler.update_segment(&task_id, &file, seg_id, patch).await?))
}

#[derive(Deserialize, Default)]
struct RetranslateBody {
    #[serde(default)]
    override_text: Option<String>,
}

async fn retranslate_segment(
    State(scheduler): State<AppState>,
    Path((task_id, seg_id)): Path<(String, usize)>,
    Json(body): Json<RetranslateBody>,
) -> ApiResult<Json<crate::segment::Segment>> {
    let file = segments_filename(&scheduler, &task_id).await?;
    let status = scheduler.status(&task_id).await?;
    let override_text = body.override_text;
    Ok(Json(
        scheduler
            .retranslate_segment(
                &task_id,
                &file,
                seg_id,
                override_text,
                &status.source_lang,
                &status.target_lang,
            )
            .await?,
    ))
}

#[derive(Serialize)]
struct AckResponse {
    ack: bool,
}

async fn resynthesize_segment(
    State(scheduler): State<AppState>,
    Path((task_id, seg_id)): Path<(String, usize)>,
) -> ApiResult<Json<AckResponse>> {
    scheduler.resynthesize_segment(&task_id, seg_id).await?;
    Ok(Json(AckResponse { ack: true }))
}

async fn regenerate_final(
    State(scheduler): State<AppState>,
    Path(task_id): Path<String>,
) -> ApiResult<Json<AckResponse>> {
    scheduler.regenerate_final(&task_id).await?;
    Ok(Json(AckResponse { ack: true }))
}
