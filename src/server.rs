use std::path::{Path, PathBuf};
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::cache::{content_type_for, extension_of, AudioCache, CANONICAL_EXTENSION};
use crate::downloads::{ensure_cached, AcquireFailure, InflightRegistry};
use crate::error::{ExtractionError, StrategyError};
use crate::mapping::MappingStore;
use crate::paths::PathConfig;
use crate::serve;
use crate::stream;
use crate::transcode::{TrackTags, Transcoder};
use crate::ytdlp::Extractor;

/// Shared service state; one instance behind an `Arc` for the whole server.
pub struct AppState {
    pub paths: PathConfig,
    pub cache: AudioCache,
    pub store: MappingStore,
    pub extractor: Extractor,
    pub transcoder: Transcoder,
    pub inflight: InflightRegistry,
    pub http: reqwest::Client,
}

impl AppState {
    pub fn new(paths: PathConfig, store: MappingStore) -> Self {
        let cache = AudioCache::new(paths.audio_dir.clone());
        let extractor = Extractor::new(paths.ytdlp_path.clone());
        let transcoder = Transcoder::new(paths.ffmpeg_path.clone());
        Self {
            paths,
            cache,
            store,
            extractor,
            transcoder,
            inflight: InflightRegistry::new(),
            http: reqwest::Client::new(),
        }
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/ping", get(ping))
        .route("/cache/check", get(check_cache))
        .route("/audio/resolve", get(resolve_audio))
        .route("/audio/stream", get(stream_audio))
        .route("/audio/prepare", post(prepare_audio))
        .route("/audio/download", get(download_audio))
        .route("/audio/export", post(export_audio))
        .with_state(state)
}

/// Structured error payloads; a failure never leaks a backtrace to a client.
#[derive(Debug)]
pub enum ApiError {
    MissingParam(&'static str),
    NotFound {
        error: &'static str,
        details: Option<String>,
    },
    Timeout(&'static str),
    Internal {
        error: &'static str,
        details: String,
    },
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = match self {
            ApiError::MissingParam(msg) => (StatusCode::BAD_REQUEST, json!({ "error": msg })),
            ApiError::NotFound { error, details } => {
                let mut body = json!({ "error": error });
                if let Some(details) = details {
                    body["details"] = Value::String(details);
                }
                (StatusCode::NOT_FOUND, body)
            }
            ApiError::Timeout(msg) => (StatusCode::REQUEST_TIMEOUT, json!({ "error": msg })),
            ApiError::Internal { error, details } => (
                StatusCode::INTERNAL_SERVER_ERROR,
                json!({ "error": error, "details": details }),
            ),
        };
        (status, Json(body)).into_response()
    }
}

impl From<AcquireFailure> for ApiError {
    fn from(failure: AcquireFailure) -> Self {
        match failure {
            AcquireFailure::TimedOut(_) => ApiError::Timeout("Download timeout"),
            AcquireFailure::Failed(details) => ApiError::NotFound {
                error: "No playable source found",
                details: Some(details),
            },
        }
    }
}

impl From<ExtractionError> for ApiError {
    fn from(e: ExtractionError) -> Self {
        if e.last.is_timeout() {
            ApiError::Timeout("Download timeout")
        } else {
            ApiError::NotFound {
                error: "No playable source found",
                details: Some(e.to_string()),
            }
        }
    }
}

fn io_error(e: std::io::Error) -> ApiError {
    ApiError::Internal {
        error: "Failed to serve file",
        details: e.to_string(),
    }
}

fn stream_url(source_id: &str) -> String {
    format!("/audio/stream?sourceId={}", urlencoding::encode(source_id))
}

#[derive(Deserialize)]
struct IdentityParams {
    title: Option<String>,
    artist: Option<String>,
}

impl IdentityParams {
    fn require(&self) -> Result<(&str, &str), ApiError> {
        match (
            self.title.as_deref().map(str::trim),
            self.artist.as_deref().map(str::trim),
        ) {
            (Some(title), Some(artist)) if !title.is_empty() && !artist.is_empty() => {
                Ok((title, artist))
            }
            _ => Err(ApiError::MissingParam("Title and artist are required")),
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SourceParams {
    source_id: Option<String>,
    filename: Option<String>,
}

impl SourceParams {
    fn require_id(&self) -> Result<&str, ApiError> {
        match self.source_id.as_deref().map(str::trim) {
            Some(id) if !id.is_empty() => Ok(id),
            _ => Err(ApiError::MissingParam("Source ID is required")),
        }
    }
}

async fn ping() -> Json<Value> {
    Json(json!({ "ok": true }))
}

/// Report whether a track is already resolvable without touching the
/// platform: mapping hit plus a usable cache file.
async fn check_cache(
    State(state): State<Arc<AppState>>,
    Query(params): Query<IdentityParams>,
) -> Result<Json<Value>, ApiError> {
    let (title, artist) = params.require()?;

    let Some(entry) = state.store.lookup(title, artist) else {
        return Ok(Json(json!({ "cached": false, "needSearch": true })));
    };

    if state.cache.probe(&entry.source_id).is_some() {
        Ok(Json(json!({
            "cached": true,
            "needSearch": false,
            "sourceId": entry.source_id,
            "audioUrl": stream_url(&entry.source_id),
            "title": entry.title,
        })))
    } else {
        // Known mapping but the file is gone; the caller can skip the search
        // and go straight to acquisition.
        Ok(Json(json!({
            "cached": false,
            "needSearch": false,
            "sourceId": entry.source_id,
        })))
    }
}

/// Resolve a track identity to a playable source, searching the platform
/// only when no mapping is remembered.
async fn resolve_audio(
    State(state): State<Arc<AppState>>,
    Query(params): Query<IdentityParams>,
) -> Result<Json<Value>, ApiError> {
    let (title, artist) = params.require()?;

    if let Some(entry) = state.store.lookup(title, artist) {
        return Ok(Json(json!({
            "audioUrl": stream_url(&entry.source_id),
            "sourceId": entry.source_id,
            "title": entry.title,
            "duration": 0,
        })));
    }

    let query = format!("{} {} official audio", title, artist);
    let hit = state.extractor.search(&query).await.map_err(|e| match e {
        StrategyError::Timeout(_) => ApiError::Timeout("Request timeout"),
        StrategyError::NoOutput => ApiError::NotFound {
            error: "No video found",
            details: None,
        },
        other => ApiError::Internal {
            error: "Failed to search for audio",
            details: other.to_string(),
        },
    })?;

    state.store.record(title, artist, &hit.source_id, &hit.title);

    Ok(Json(json!({
        "audioUrl": stream_url(&hit.source_id),
        "sourceId": hit.source_id,
        "title": if hit.title.is_empty() { title.to_string() } else { hit.title.clone() },
        "duration": hit.duration_secs,
    })))
}

/// Serve audio: range-capable from cache when finalized, otherwise a live
/// tee'd stream that caches while it plays.
async fn stream_audio(
    State(state): State<Arc<AppState>>,
    Query(params): Query<SourceParams>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let source_id = params.require_id()?;
    let range = headers.get(header::RANGE).and_then(|v| v.to_str().ok());

    if let Some(path) = state.cache.probe(source_id) {
        return serve::serve_file(&path, range).await.map_err(io_error);
    }

    let live = stream::stream_and_cache(&state.extractor, &state.cache, source_id).await?;
    tracing::info!(source_id, strategy = live.strategy, "serving live stream");

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, live.content_type)
        .header(header::CACHE_CONTROL, "no-cache")
        .header(header::CONTENT_DISPOSITION, "inline")
        .body(Body::from_stream(live.body))
        .map_err(|e| ApiError::Internal {
            error: "Failed to build stream response",
            details: e.to_string(),
        })
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PrepareRequest {
    source_id: Option<String>,
    #[serde(default = "default_action")]
    action: String,
}

fn default_action() -> String {
    "start".to_string()
}

/// Polling-friendly full-file acquisition. `check` never starts work;
/// `start` waits for the file (joining any in-flight acquisition) and
/// normalizes stray containers to the canonical one.
async fn prepare_audio(
    State(state): State<Arc<AppState>>,
    Json(req): Json<PrepareRequest>,
) -> Result<Response, ApiError> {
    let source_id = match req.source_id.as_deref().map(str::trim) {
        Some(id) if !id.is_empty() => id,
        _ => return Err(ApiError::MissingParam("Source ID is required")),
    };

    if req.action == "check" {
        let body = if state.cache.probe(source_id).is_some() {
            json!({
                "status": "completed",
                "audioUrl": stream_url(source_id),
                "cached": true,
            })
        } else if state.inflight.is_inflight(source_id) || state.cache.has_temp_artifacts(source_id)
        {
            json!({ "status": "downloading", "cached": false })
        } else {
            json!({ "status": "not_started", "cached": false })
        };
        return Ok(Json(body).into_response());
    }

    match ensure_cached(&state.inflight, &state.extractor, &state.cache, source_id).await {
        Ok(path) => {
            normalize_container(&state, source_id, &path).await;
            Ok(Json(json!({
                "status": "completed",
                "audioUrl": stream_url(source_id),
                "cached": true,
            }))
            .into_response())
        }
        Err(failure) => {
            let status = match &failure {
                AcquireFailure::TimedOut(_) => StatusCode::REQUEST_TIMEOUT,
                AcquireFailure::Failed(_) => StatusCode::INTERNAL_SERVER_ERROR,
            };
            Ok((
                status,
                Json(json!({
                    "status": "failed",
                    "error": failure.to_string(),
                    "cached": false,
                })),
            )
                .into_response())
        }
    }
}

/// Re-encode a non-canonical container to mp3 and swap it into the cache
/// slot. Transcode failure is not fatal: the original container keeps
/// serving.
async fn normalize_container(state: &AppState, source_id: &str, path: &Path) -> PathBuf {
    if extension_of(path) == CANONICAL_EXTENSION {
        return path.to_path_buf();
    }

    let temp = state.cache.temp_path(source_id, CANONICAL_EXTENSION);
    match state
        .transcoder
        .normalize(path, &temp, &TrackTags::default(), None)
        .await
    {
        Ok(_) => {
            let final_mp3 = state.cache.final_path(source_id, CANONICAL_EXTENSION);
            match tokio::fs::rename(&temp, &final_mp3).await {
                Ok(()) => {
                    let _ = tokio::fs::remove_file(path).await;
                    tracing::info!(source_id, "normalized cache file to canonical container");
                    final_mp3
                }
                Err(e) => {
                    tracing::warn!(source_id, error = %e, "failed to move normalized file into cache");
                    let _ = tokio::fs::remove_file(&temp).await;
                    path.to_path_buf()
                }
            }
        }
        Err(e) => {
            tracing::warn!(source_id, error = %e, "transcode failed, keeping original container");
            path.to_path_buf()
        }
    }
}

/// Acquire if necessary, then hand the file over as an attachment.
async fn download_audio(
    State(state): State<Arc<AppState>>,
    Query(params): Query<SourceParams>,
) -> Result<Response, ApiError> {
    let source_id = params.require_id()?;
    let filename = params
        .filename
        .as_deref()
        .map(str::trim)
        .filter(|f| !f.is_empty())
        .unwrap_or("audio");

    let path = ensure_cached(&state.inflight, &state.extractor, &state.cache, source_id).await?;
    serve::serve_attachment(&path, filename)
        .await
        .map_err(io_error)
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExportRequest {
    source_id: Option<String>,
    title: Option<String>,
    artist: Option<String>,
    album: Option<String>,
    cover_url: Option<String>,
}

/// Produce a tagged, cover-embedded mp3 of a cached track and return it as
/// an attachment. Every intermediate file is cleaned up before the response
/// leaves; a failed transcode falls back to the untouched cache file.
async fn export_audio(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ExportRequest>,
) -> Result<Response, ApiError> {
    let source_id = match req.source_id.as_deref().map(str::trim) {
        Some(id) if !id.is_empty() => id,
        _ => return Err(ApiError::MissingParam("Source ID is required")),
    };

    let cached = ensure_cached(&state.inflight, &state.extractor, &state.cache, source_id).await?;

    let cover_bytes = match req.cover_url.as_deref() {
        Some(url) => match state.http.get(url).send().await {
            Ok(resp) if resp.status().is_success() => resp.bytes().await.ok().map(|b| b.to_vec()),
            Ok(resp) => {
                tracing::warn!(status = %resp.status(), "cover art fetch refused, exporting without cover");
                None
            }
            Err(e) => {
                tracing::warn!(error = %e, "cover art fetch failed, exporting without cover");
                None
            }
        },
        None => None,
    };

    let tags = TrackTags {
        title: req.title.clone(),
        artist: req.artist.clone(),
        album: req.album.clone(),
    };

    let output = state.cache.temp_path(source_id, CANONICAL_EXTENSION);
    let (serve_path, ext) = match state
        .transcoder
        .normalize(&cached, &output, &tags, cover_bytes.as_deref())
        .await
    {
        Ok(path) => (path, CANONICAL_EXTENSION),
        Err(e) => {
            tracing::warn!(source_id, error = %e, "export transcode failed, sending original file");
            (cached.clone(), extension_of(&cached))
        }
    };

    // Read-then-delete so no export artifact survives the request.
    let bytes = tokio::fs::read(&serve_path).await.map_err(io_error)?;
    if serve_path != cached {
        let _ = tokio::fs::remove_file(&serve_path).await;
    }

    let filename = format!(
        "{} - {}.{}",
        safe_filename(req.artist.as_deref().unwrap_or("Unknown")),
        safe_filename(req.title.as_deref().unwrap_or("Unknown")),
        ext
    );

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, content_type_for(ext))
        .header(header::CONTENT_LENGTH, bytes.len().to_string())
        .header(
            header::CONTENT_DISPOSITION,
            format!("attachment; filename=\"{}\"", urlencoding::encode(&filename)),
        )
        .body(Body::from(bytes))
        .map_err(|e| ApiError::Internal {
            error: "Failed to build export response",
            details: e.to_string(),
        })
}

/// Strip characters that are unsafe in download filenames.
fn safe_filename(value: &str) -> String {
    value
        .chars()
        .map(|c| match c {
            '\\' | '/' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            other => other,
        })
        .collect()
}
