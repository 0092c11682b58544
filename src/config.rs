//! Runtime settings, read from the environment with fallbacks to defaults.

use std::path::PathBuf;

use tokio::time::Duration;
use tracing::warn;

use crate::{compress::SizeBudget, pipeline::PipelineSettings, retry::RetryPolicy};

const DEFAULT_PORT: u16 = 3000;
const DEFAULT_RESOLUTION: u32 = 720;
const DEFAULT_RETENTION_AGE_SECONDS: u64 = 5 * 60;
const DEFAULT_SWEEP_INTERVAL_SECONDS: u64 = 5 * 60;
const DEFAULT_TOOL_TIMEOUT_SECONDS: u64 = 180;
const DEFAULT_REQUEST_TIMEOUT_SECONDS: u64 = 10 * 60;
const DEFAULT_FETCH_MAX_ATTEMPTS: u32 = 3;
const DEFAULT_RETRY_BACKOFF_MS: u64 = 2_000;
const MAX_RETRY_BACKOFF_SECONDS: u64 = 30;
const DEFAULT_CREATOR: &str = "vidrelay";

#[derive(Debug, Clone)]
pub struct Settings {
    pub bind_addr: String,
    pub output_dir: PathBuf,
    pub ytdlp_path: String,
    pub ffmpeg_path: String,
    pub ffprobe_path: String,
    pub cookies_path: Option<PathBuf>,
    pub default_resolution: u32,
    pub retention_age: Duration,
    pub sweep_interval: Duration,
    pub budget: SizeBudget,
    pub tool_timeout: Duration,
    pub request_timeout: Duration,
    pub fetch_max_attempts: u32,
    pub retry_backoff: Duration,
    pub trust_proxy_headers: bool,
    pub public_base_url: Option<String>,
    pub creator: String,
    pub allowed_origins: Vec<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            bind_addr: format!("127.0.0.1:{DEFAULT_PORT}"),
            output_dir: PathBuf::from("downloads"),
            ytdlp_path: "yt-dlp".to_string(),
            ffmpeg_path: "ffmpeg".to_string(),
            ffprobe_path: "ffprobe".to_string(),
            cookies_path: None,
            default_resolution: DEFAULT_RESOLUTION,
            retention_age: Duration::from_secs(DEFAULT_RETENTION_AGE_SECONDS),
            sweep_interval: Duration::from_secs(DEFAULT_SWEEP_INTERVAL_SECONDS),
            budget: SizeBudget::default(),
            tool_timeout: Duration::from_secs(DEFAULT_TOOL_TIMEOUT_SECONDS),
            request_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECONDS),
            fetch_max_attempts: DEFAULT_FETCH_MAX_ATTEMPTS,
            retry_backoff: Duration::from_millis(DEFAULT_RETRY_BACKOFF_MS),
            trust_proxy_headers: false,
            public_base_url: None,
            creator: DEFAULT_CREATOR.to_string(),
            allowed_origins: Vec::new(),
        }
    }
}

impl Settings {
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Builds settings from any variable source. Unparseable or out-of-range
    /// values fall back to the default.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let text = |name: &str| lookup(name).and_then(|value| non_empty(&value).map(ToString::to_string));
        let seconds = |name: &str, fallback: Duration| {
            read_parsed::<u64>(&lookup, name)
                .filter(|value| *value > 0)
                .map(Duration::from_secs)
                .unwrap_or(fallback)
        };
        let megabytes = |name: &str, fallback: f64| {
            read_parsed::<f64>(&lookup, name)
                .filter(|value| value.is_finite() && *value > 0.0)
                .unwrap_or(fallback)
        };

        let mut budget = SizeBudget {
            limit_mb: megabytes("SIZE_BUDGET_MB", defaults.budget.limit_mb),
            target_mb: megabytes("SIZE_TARGET_MB", defaults.budget.target_mb),
            audio_bitrate_bps: read_parsed::<u64>(&lookup, "AUDIO_BITRATE_BPS")
                .filter(|value| *value > 0)
                .unwrap_or(defaults.budget.audio_bitrate_bps),
            min_video_bitrate_bps: read_parsed::<u64>(&lookup, "MIN_VIDEO_BITRATE_BPS")
                .filter(|value| *value > 0)
                .unwrap_or(defaults.budget.min_video_bitrate_bps),
        };
        if budget.target_mb > budget.limit_mb {
            warn!(
                "SIZE_TARGET_MB ({}) exceeds SIZE_BUDGET_MB ({}); using the budget as target.",
                budget.target_mb, budget.limit_mb
            );
            budget.target_mb = budget.limit_mb;
        }

        Self {
            bind_addr: resolve_bind_addr(&lookup),
            output_dir: text("DOWNLOADS_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.output_dir),
            ytdlp_path: text("YTDLP_PATH").unwrap_or(defaults.ytdlp_path),
            ffmpeg_path: text("FFMPEG_PATH").unwrap_or(defaults.ffmpeg_path),
            ffprobe_path: text("FFPROBE_PATH").unwrap_or(defaults.ffprobe_path),
            cookies_path: text("YTDLP_COOKIES").map(PathBuf::from),
            default_resolution: read_parsed::<u32>(&lookup, "DEFAULT_RESOLUTION")
                .filter(|value| *value > 0)
                .unwrap_or(defaults.default_resolution),
            retention_age: seconds("RETENTION_AGE_SECONDS", defaults.retention_age),
            sweep_interval: seconds("SWEEP_INTERVAL_SECONDS", defaults.sweep_interval),
            budget,
            tool_timeout: seconds("TOOL_TIMEOUT_SECONDS", defaults.tool_timeout),
            request_timeout: seconds("REQUEST_TIMEOUT_SECONDS", defaults.request_timeout),
            fetch_max_attempts: read_parsed::<u32>(&lookup, "FETCH_MAX_ATTEMPTS")
                .filter(|value| *value > 0)
                .unwrap_or(defaults.fetch_max_attempts),
            retry_backoff: read_parsed::<u64>(&lookup, "RETRY_BACKOFF_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.retry_backoff),
            trust_proxy_headers: lookup("TRUST_PROXY_HEADERS")
                .as_deref()
                .and_then(parse_bool)
                .unwrap_or(defaults.trust_proxy_headers),
            public_base_url: text("PUBLIC_BASE_URL")
                .map(|value| value.trim_end_matches('/').to_string()),
            creator: text("API_CREATOR").unwrap_or(defaults.creator),
            allowed_origins: lookup("ALLOWED_ORIGINS")
                .map(|value| {
                    value
                        .split(',')
                        .map(str::trim)
                        .filter(|origin| !origin.is_empty())
                        .map(ToString::to_string)
                        .collect()
                })
                .unwrap_or_default(),
        }
    }

    pub fn fetch_retry(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.fetch_max_attempts,
            self.retry_backoff,
            Duration::from_secs(MAX_RETRY_BACKOFF_SECONDS),
        )
    }

    /// The cookie file is only passed along when it is actually there.
    pub fn pipeline_settings(&self) -> PipelineSettings {
        let cookies = self.cookies_path.clone().filter(|path| {
            let present = path.is_file();
            if !present {
                warn!("YTDLP_COOKIES points to {:?}, which is not a file; fetching without cookies.", path);
            }
            present
        });

        PipelineSettings {
            cookies,
            fetch_retry: self.fetch_retry(),
            merge_retry: RetryPolicy::new(
                2,
                self.retry_backoff,
                Duration::from_secs(MAX_RETRY_BACKOFF_SECONDS),
            ),
            budget: self.budget,
        }
    }
}

fn read_parsed<T: std::str::FromStr>(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Option<T> {
    lookup(name).and_then(|value| value.trim().parse::<T>().ok())
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn resolve_bind_addr(lookup: &impl Fn(&str) -> Option<String>) -> String {
    if let Some(configured) = lookup("APP_ADDR").and_then(|value| non_empty(&value).map(ToString::to_string)) {
        return configured;
    }

    if let Some(port) = read_parsed::<u16>(lookup, "PORT") {
        return format!("0.0.0.0:{port}");
    }

    format!("127.0.0.1:{DEFAULT_PORT}")
}

pub fn non_empty(value: &str) -> Option<&str> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}
