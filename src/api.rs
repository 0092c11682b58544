use std::{collections::HashSet, sync::Arc};

use axum::{
    Json, Router,
    body::Body,
    extract::{Path, Query, State},
    http::{
        HeaderMap, HeaderValue, Method,
        header::{CONTENT_DISPOSITION, CONTENT_LENGTH, CONTENT_TYPE, HOST},
    },
    response::{IntoResponse, Response},
    routing::get,
};
use serde::{Deserialize, Serialize};
use tokio::time::timeout;
use tokio_util::io::ReaderStream;
use tower_http::{
    cors::{AllowOrigin, Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{debug, error, info, warn};
use url::Url;

use crate::{
    compress::CompressionOutcome,
    config::Settings,
    error::{ApiError, PipelineError},
    pipeline::DownloadPipeline,
    plan::DownloadRequest,
};

const UNTITLED: &str = "Untitled video";

#[derive(Clone)]
pub struct AppState {
    pipeline: DownloadPipeline,
    settings: Arc<Settings>,
}

impl AppState {
    pub fn new(pipeline: DownloadPipeline, settings: Arc<Settings>) -> Self {
        Self { pipeline, settings }
    }
}

#[derive(Debug, Deserialize)]
struct GetVideoQuery {
    url: Option<String>,
    res: Option<String>,
}

#[derive(Debug, Serialize)]
struct GetVideoResponse {
    status: bool,
    creator: String,
    data: VideoData,
}

#[derive(Debug, Serialize)]
struct VideoData {
    id: Option<String>,
    title: String,
    duration: Option<f64>,
    author: Option<String>,
    media: MediaInfo,
}

#[derive(Debug, Serialize)]
struct MediaInfo {
    #[serde(rename = "type")]
    kind: &'static str,
    download: DownloadInfo,
}

#[derive(Debug, Serialize)]
struct DownloadInfo {
    url: String,
    format: &'static str,
    requested_resolution: String,
}

pub fn build_router(state: AppState) -> Result<Router, ApiError> {
    let cors = build_cors_layer(&state.settings.allowed_origins)?;

    Ok(Router::new()
        .route("/", get(root))
        .route("/api/health", get(health))
        .route("/api/getVideo", get(get_video))
        .route("/downloads/{filename}", get(serve_download))
        .with_state(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http()))
}

async fn root() -> &'static str {
    "vidrelay is running"
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({"status": "ok"}))
}

async fn get_video(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<GetVideoQuery>,
) -> Result<Json<GetVideoResponse>, ApiError> {
    let request = DownloadRequest::parse(
        query.url.as_deref(),
        query.res.as_deref(),
        state.settings.default_resolution,
    )
    .map_err(|error| {
        warn!("Rejected getVideo request: {error}");
        ApiError::from(error)
    })?;

    let deadline = state.settings.request_timeout;
    let outcome = match timeout(deadline, state.pipeline.run(&request)).await {
        Ok(result) => result,
        Err(_) => Err(PipelineError::Timeout(deadline.as_secs())),
    }
    .map_err(|error| {
        error!("Download of {} failed: {error}", request.source_url);
        ApiError::from(error)
    })?;

    let download_url = format!(
        "{}/downloads/{}",
        download_base_url(&state.settings, &headers),
        urlencoding::encode(&outcome.file_name)
    );
    info!(
        "Serving {} as {download_url} ({:?}, {} bytes)",
        request.source_url, outcome.plan.platform, outcome.file.size_bytes
    );
    match &outcome.compression {
        CompressionOutcome::Compressed {
            video_bitrate_bps,
            bytes_before,
            bytes_after,
        } => info!("Shrunk from {bytes_before} to {bytes_after} bytes at {video_bitrate_bps} bps"),
        CompressionOutcome::Failed(error) => warn!("Served over budget: {error}"),
        CompressionOutcome::NotNeeded => {}
    }

    let metadata = outcome.metadata;

    Ok(Json(GetVideoResponse {
        status: true,
        creator: state.settings.creator.clone(),
        data: VideoData {
            id: metadata.id,
            title: metadata
                .title
                .filter(|value| !value.trim().is_empty())
                .unwrap_or_else(|| UNTITLED.to_string()),
            duration: metadata.duration_seconds,
            author: metadata.author,
            media: MediaInfo {
                kind: "video",
                download: DownloadInfo {
                    url: download_url,
                    format: "mp4",
                    requested_resolution: request.resolution.to_string(),
                },
            },
        },
    }))
}

async fn serve_download(
    State(state): State<AppState>,
    Path(filename): Path<String>,
) -> Result<Response, ApiError> {
    let path = state
        .pipeline
        .output()
        .resolve_download(&filename)
        .await
        .ok_or_else(|| ApiError::not_found("File not found."))?;

    let file = tokio::fs::File::open(&path).await.map_err(|error| {
        warn!("Could not open download {:?}: {error}", path);
        ApiError::not_found("File not found.")
    })?;
    let metadata = file.metadata().await.map_err(|error| {
        ApiError::internal(format!("Could not read file metadata: {error}"))
    })?;

    let mut headers = HeaderMap::new();
    headers.insert(
        CONTENT_TYPE,
        HeaderValue::from_static(content_type_for_filename(&filename)),
    );
    headers.insert(
        CONTENT_LENGTH,
        HeaderValue::from_str(&metadata.len().to_string())
            .map_err(|_| ApiError::internal("Could not build the content length header."))?,
    );
    headers.insert(
        CONTENT_DISPOSITION,
        HeaderValue::from_str(&build_content_disposition(&filename))
            .map_err(|_| ApiError::internal("Could not build the download header."))?,
    );

    Ok((headers, Body::from_stream(ReaderStream::new(file))).into_response())
}

/// `PUBLIC_BASE_URL` when configured, otherwise rebuilt from the request.
fn download_base_url(settings: &Settings, headers: &HeaderMap) -> String {
    if let Some(base) = &settings.public_base_url {
        return base.clone();
    }

    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|value| !value.is_empty())
    };

    let scheme = if settings.trust_proxy_headers {
        header("x-forwarded-proto")
            .and_then(|value| value.split(',').next())
            .map(str::trim)
            .filter(|value| matches!(*value, "http" | "https"))
            .unwrap_or("http")
    } else {
        "http"
    };

    let host = if settings.trust_proxy_headers {
        header("x-forwarded-host").or_else(|| header(HOST.as_str()))
    } else {
        header(HOST.as_str())
    };

    match host {
        Some(host) => format!("{scheme}://{host}"),
        None => String::new(),
    }
}

fn build_cors_layer(configured: &[String]) -> Result<CorsLayer, ApiError> {
    let layer = CorsLayer::new()
        .allow_methods([Method::GET])
        .allow_headers(Any)
        .expose_headers([CONTENT_DISPOSITION]);

    if configured.is_empty() {
        warn!("ALLOWED_ORIGINS is not set. Any origin may call the API.");
        return Ok(layer.allow_origin(Any));
    }

    let normalized_origins = configured
        .iter()
        .map(|origin| {
            normalize_origin(origin).ok_or_else(|| {
                ApiError::internal(format!(
                    "Invalid origin in ALLOWED_ORIGINS: {origin}. Use values like https://example.com"
                ))
            })
        })
        .collect::<Result<HashSet<_>, _>>()?;
    info!(
        "CORS allow-list loaded with {} origin(s): {:?}",
        normalized_origins.len(),
        normalized_origins
    );

    let allowed_origins = Arc::new(normalized_origins);
    let allow_origin = AllowOrigin::predicate(move |origin: &HeaderValue, _| {
        let normalized = origin.to_str().ok().and_then(normalize_origin);
        let allowed = normalized
            .as_ref()
            .is_some_and(|value| allowed_origins.contains(value));
        debug!(
            "CORS origin check raw={:?} normalized={:?} allowed={}",
            origin, normalized, allowed
        );
        allowed
    });

    Ok(layer.allow_origin(allow_origin))
}

fn normalize_origin(value: &str) -> Option<String> {
    let parsed = Url::parse(value).ok()?;
    let host = parsed.host_str()?.to_ascii_lowercase();
    let scheme = parsed.scheme();
    let default_port = match scheme {
        "http" => 80,
        "https" => 443,
        _ => return None,
    };

    if parsed.path() != "/" || parsed.query().is_some() || parsed.fragment().is_some() {
        return None;
    }

    match parsed.port() {
        Some(port) if port != default_port => Some(format!("{scheme}://{host}:{port}")),
        _ => Some(format!("{scheme}://{host}")),
    }
}

fn content_type_for_filename(filename: &str) -> &'static str {
    let extension = std::path::Path::new(filename)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase())
        .unwrap_or_default();

    match extension.as_str() {
        "mp4" => "video/mp4",
        "webm" => "video/webm",
        "mkv" => "video/x-matroska",
        "mov" => "video/quicktime",
        "m4a" => "audio/mp4",
        _ => "application/octet-stream",
    }
}

fn build_content_disposition(filename: &str) -> String {
    let safe_ascii = sanitize_ascii_filename(filename);
    format!(
        "attachment; filename=\"{safe_ascii}\"; filename*=UTF-8''{}",
        urlencoding::encode(filename)
    )
}

fn sanitize_ascii_filename(value: &str) -> String {
    let sanitized: String = value
        .chars()
        .map(|character| {
            if character.is_ascii_alphanumeric()
                || matches!(character, '.' | '-' | '_' | ' ' | '(' | ')')
            {
                character
            } else {
                '_'
            }
        })
        .collect();

    let compact = sanitized.trim();
    if compact.is_empty() {
        "download.mp4".to_string()
    } else {
        compact.to_string()
    }
}
