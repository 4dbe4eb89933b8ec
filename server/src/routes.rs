use std::convert::Infallible;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;

use avatar_core::{
    decode_wav, decode_wav_base64, AnimatorError, AudioClip, AvatarSource, FrameCursor,
    ModelStatus, StreamState, Viseme, VisemeTimeline,
};
use axum::{
    body::Body,
    extract::{Path, Query, State},
    http::{header, HeaderName},
    response::{IntoResponse, Response},
    Json,
};
use base64::Engine;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::ApiError;
use crate::metrics::{AppMetrics, CacheStats, MetricsResponse, StreamMetrics, SystemMetrics};
use crate::mjpeg;
use crate::sessions::RenderSession;
use crate::validation::{resolve_stream_params, validate_media_key, StreamParams};
use crate::AppState;

/// Parts buffered between the frame task and the HTTP body.
const FRAME_BUFFER: usize = 4;

pub async fn health_check() -> &'static str {
    "ok"
}

#[derive(Serialize)]
pub struct ReadyResponse {
    pub status: &'static str,
    pub model: ModelStatus,
    pub model_backed_available: bool,
    pub use_model_backend: bool,
    pub avatar_cache_entries: usize,
    pub pending_sessions: usize,
}

pub async fn ready(State(state): State<AppState>) -> Json<ReadyResponse> {
    let model = state.animator.model_status();
    Json(ReadyResponse {
        status: "ready",
        model_backed_available: matches!(model, ModelStatus::Ready { .. }),
        model,
        use_model_backend: state.config.use_model_backend,
        avatar_cache_entries: state.animator.cache().len(),
        pending_sessions: state.sessions.len(),
    })
}

#[derive(Debug, Deserialize)]
pub struct MjpegQuery {
    pub avatar_key: String,
    pub audio_key: String,
    pub w: Option<u32>,
    pub h: Option<u32>,
    pub fps: Option<u32>,
    pub use_model: Option<bool>,
}

#[derive(Debug, Deserialize)]
pub struct MjpegRequest {
    pub avatar_base64: String,
    /// WAV file bytes
    pub audio_base64: String,
    pub w: Option<u32>,
    pub h: Option<u32>,
    pub fps: Option<u32>,
    pub use_model: Option<bool>,
}

/// Stream an avatar and audio clip that live in the media store.
pub async fn mjpeg_from_media(
    State(state): State<AppState>,
    Query(q): Query<MjpegQuery>,
) -> Result<Response, ApiError> {
    let started = Instant::now();
    state.request_count.fetch_add(1, Ordering::Relaxed);
    let result: Result<Response, ApiError> = async {
        validate_media_key(&q.avatar_key)?;
        validate_media_key(&q.audio_key)?;
        let params = resolve_stream_params(q.w, q.h, q.fps, q.use_model, &state.config)?;
        let avatar = state.media.read(&q.avatar_key).await?;
        let audio = state.media.read(&q.audio_key).await?;
        start_stream(&state, Some(q.avatar_key.clone()), avatar, move || decode_wav(&audio), params)
            .await
    }
    .await;
    record_setup(&state, started, &result);
    result
}

/// Stream an avatar and WAV audio sent inline as base64.
pub async fn mjpeg_from_body(
    State(state): State<AppState>,
    Json(req): Json<MjpegRequest>,
) -> Result<Response, ApiError> {
    let started = Instant::now();
    state.request_count.fetch_add(1, Ordering::Relaxed);
    let result: Result<Response, ApiError> = async {
        let params = resolve_stream_params(req.w, req.h, req.fps, req.use_model, &state.config)?;
        let avatar = base64::engine::general_purpose::STANDARD
            .decode(req.avatar_base64.trim())
            .map_err(|e| ApiError::InvalidInput(format!("avatar_base64: {e}")))?;
        let audio = req.audio_base64;
        start_stream(&state, None, avatar, move || decode_wav_base64(&audio), params).await
    }
    .await;
    record_setup(&state, started, &result);
    result
}

#[derive(Debug, Deserialize)]
pub struct RenderStartRequest {
    /// Media key of the avatar; a blank canvas when absent.
    #[serde(default, alias = "avatarKey")]
    pub avatar_key: Option<String>,
    #[serde(default)]
    pub visemes: Vec<Viseme>,
    #[serde(alias = "width")]
    pub w: Option<u32>,
    #[serde(alias = "height")]
    pub h: Option<u32>,
    pub fps: Option<u32>,
}

#[derive(Debug, Serialize)]
pub struct RenderStartResponse {
    pub id: String,
    pub stream_url: String,
    pub frames: usize,
}

/// Prepare a viseme-driven session. The stream itself is opened by
/// `GET /stream/{id}`.
pub async fn render_start(
    State(state): State<AppState>,
    Json(req): Json<RenderStartRequest>,
) -> Result<Json<RenderStartResponse>, ApiError> {
    let started = Instant::now();
    state.request_count.fetch_add(1, Ordering::Relaxed);
    let result: Result<Json<RenderStartResponse>, ApiError> = async {
        let params = resolve_stream_params(req.w, req.h, req.fps, Some(false), &state.config)?;
        let avatar_bytes = match &req.avatar_key {
            Some(key) => {
                validate_media_key(key)?;
                Some(state.media.read(key).await?)
            }
            None => None,
        };
        let timeline = Arc::new(VisemeTimeline::new(req.visemes)?);

        let animator = state.animator.clone();
        let avatar_key = req.avatar_key;
        let (width, height) = (params.width, params.height);
        let avatar = tokio::task::spawn_blocking(move || {
            let source = match (&avatar_key, &avatar_bytes) {
                (Some(key), Some(bytes)) => AvatarSource::Named { key, bytes },
                _ => AvatarSource::Blank,
            };
            animator.prepare_avatar(source, width, height)
        })
        .await
        .map_err(|e| ApiError::InternalError(format!("avatar task failed: {e}")))??;

        let frames = timeline.frame_count(params.fps);
        let visemes = timeline.len();
        let id = state.sessions.insert(RenderSession { avatar, timeline, fps: params.fps })?;
        info!(%id, visemes, frames, "render session created");
        Ok(Json(RenderStartResponse {
            stream_url: format!("/stream/{id}"),
            id,
            frames,
        }))
    }
    .await;
    record_setup(&state, started, &result);
    result
}

/// MJPEG stream of a session created by [`render_start`]. Each session
/// streams once.
pub async fn stream_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let session = state
        .sessions
        .take(&id)
        .ok_or_else(|| ApiError::NotFound(format!("render session {id}")))?;
    let (width, height) = (session.avatar.width(), session.avatar.height());
    let cursor = state.animator.open_viseme_stream(
        session.avatar,
        session.timeline,
        session.fps,
        CancellationToken::new(),
    )?;
    let placeholder = tokio::task::spawn_blocking(move || mjpeg::placeholder(width, height))
        .await
        .map_err(|e| ApiError::InternalError(format!("placeholder task failed: {e}")))?
        .map_err(AnimatorError::from)?;
    info!(%id, width, height, fps = session.fps, frames = cursor.frame_count(), "viseme stream opened");
    Ok(stream_response(&state, cursor, placeholder))
}

fn record_setup<T>(state: &AppState, started: Instant, result: &Result<T, ApiError>) {
    let setup = &state.metrics.setup;
    match result {
        Ok(_) => setup.record_request(started.elapsed().as_millis() as u64),
        Err(_) => setup.record_error(),
    }
}

/// Decode everything up front so bad input is rejected before the first
/// byte, then hand the cursor to a frame task.
async fn start_stream<F>(
    state: &AppState,
    avatar_key: Option<String>,
    avatar: Vec<u8>,
    decode_audio: F,
    params: StreamParams,
) -> Result<Response, ApiError>
where
    F: FnOnce() -> Result<AudioClip, AnimatorError> + Send + 'static,
{
    let animator = state.animator.clone();
    let cancel = CancellationToken::new();
    let StreamParams { width, height, fps, use_model } = params;

    let (cursor, placeholder) = tokio::task::spawn_blocking(move || {
        let clip = decode_audio()?;
        let source = match &avatar_key {
            Some(key) => AvatarSource::Named { key, bytes: &avatar },
            None => AvatarSource::Inline(&avatar),
        };
        let resource = animator.prepare_avatar(source, width, height)?;
        let cursor = animator.open_stream(resource, &clip, fps, use_model, cancel)?;
        let placeholder = mjpeg::placeholder(width, height)?;
        Ok::<_, AnimatorError>((cursor, placeholder))
    })
    .await
    .map_err(|e| ApiError::InternalError(format!("stream setup task failed: {e}")))??;

    info!(
        width,
        height,
        fps,
        frames = cursor.frame_count(),
        strategy = cursor.strategy().as_str(),
        "mjpeg stream opened"
    );
    Ok(stream_response(state, cursor, placeholder))
}

fn stream_response(state: &AppState, cursor: FrameCursor, placeholder: Vec<u8>) -> Response {
    let (tx, rx) = mpsc::channel::<Bytes>(FRAME_BUFFER);
    tokio::spawn(produce_frames(cursor, tx, placeholder, state.metrics.clone()));

    let body = futures_util::stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|part| (Ok::<_, Infallible>(part), rx))
    });

    (
        [
            (header::CONTENT_TYPE, mjpeg::content_type()),
            (header::CACHE_CONTROL, "no-cache".to_string()),
            (HeaderName::from_static("x-accel-buffering"), "no".to_string()),
        ],
        Body::from_stream(body),
    )
        .into_response()
}

/// Drive the cursor, encoding each frame as a multipart part. The client
/// going away, seen either while waiting for the next frame or on a failed
/// send, cancels the cursor and it ends aborted.
async fn produce_frames(
    mut cursor: FrameCursor,
    tx: mpsc::Sender<Bytes>,
    placeholder: Vec<u8>,
    metrics: Arc<AppMetrics>,
) {
    let streams: &StreamMetrics = &metrics.streams;
    streams.stream_started();
    let cancel = cursor.cancel_token().clone();

    if tx.send(mjpeg::part(&placeholder)).await.is_err() {
        cancel.cancel();
    }

    loop {
        let next = tokio::select! {
            biased;
            _ = tx.closed() => {
                cancel.cancel();
                None
            }
            paced = cursor.next() => paced,
        };
        let Some(paced) = next else { break };

        let index = paced.index;
        let (source, lag) = (paced.source, paced.lag);
        let encoded =
            tokio::task::spawn_blocking(move || mjpeg::encode_jpeg(&paced.frame, mjpeg::JPEG_QUALITY))
                .await;
        let jpeg = match encoded {
            Ok(Ok(jpeg)) => jpeg,
            Ok(Err(e)) => {
                warn!(index, error = %e, "jpeg encoding failed, sending placeholder");
                placeholder.clone()
            }
            Err(e) => {
                warn!(index, error = %e, "jpeg encoding task failed, sending placeholder");
                placeholder.clone()
            }
        };

        if tx.send(mjpeg::part(&jpeg)).await.is_err() {
            cancel.cancel();
            continue;
        }
        streams.frame_emitted(source, lag);
    }

    // A cursor interrupted mid-frame settles into Aborted on its next poll
    if cancel.is_cancelled() && matches!(cursor.state(), StreamState::Init | StreamState::Streaming) {
        let _ = cursor.next().await;
    }

    let completed = cursor.state() == StreamState::Done;
    if completed {
        let _ = tx.send(mjpeg::closing()).await;
    }
    streams.stream_finished(completed, cursor.stats());
    info!(
        state = ?cursor.state(),
        frames = cursor.stats().frames,
        fallback_frames = cursor.stats().fallback_frames,
        "mjpeg stream closed"
    );
}

pub async fn metrics_endpoint(State(state): State<AppState>) -> Json<MetricsResponse> {
    let mut system = sysinfo::System::new();
    system.refresh_cpu();
    system.refresh_memory();

    let memory_used = system.used_memory();
    let memory_total = system.total_memory();
    let memory_usage_percent = if memory_total > 0 {
        (memory_used as f64 / memory_total as f64 * 100.0) as f32
    } else {
        0.0
    };

    // Unix-like systems only
    let system_load = {
        #[cfg(unix)]
        {
            std::fs::read_to_string("/proc/loadavg")
                .ok()
                .and_then(|l| l.split_whitespace().next().and_then(|s| s.parse::<f64>().ok()))
        }
        #[cfg(not(unix))]
        None
    };

    let cache = state.animator.cache();
    Json(MetricsResponse {
        timestamp: chrono::Utc::now(),
        system: SystemMetrics {
            cpu_usage_percent: system.global_cpu_info().cpu_usage(),
            memory_used_mb: memory_used / 1024 / 1024,
            memory_total_mb: memory_total / 1024 / 1024,
            memory_usage_percent,
            request_count: state.request_count.load(Ordering::Relaxed),
            uptime_seconds: state.started_at.elapsed().as_secs(),
            system_load,
        },
        setup: state.metrics.setup.snapshot(),
        streams: state.metrics.streams.snapshot(),
        avatar_cache: CacheStats {
            entries: cache.len(),
            hits: cache.hits(),
            misses: cache.misses(),
        },
    })
}
