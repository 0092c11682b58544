//! Format strategy selection.
//!
//! The plan is derived from the URL string alone. No network call is made.

use serde::Serialize;
use url::Url;

use crate::error::PipelineError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadRequest {
    pub source_url: Url,
    pub resolution: u32,
}

impl DownloadRequest {
    /// Validates raw query values. Runs before any subprocess is spawned.
    pub fn parse(
        url: Option<&str>,
        resolution: Option<&str>,
        default_resolution: u32,
    ) -> Result<Self, PipelineError> {
        let url = url
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .ok_or_else(|| PipelineError::InvalidRequest("No video URL provided.".into()))?;
        let source_url = parse_source_url(url).ok_or_else(|| {
            PipelineError::InvalidRequest(
                "Invalid video URL. Please check the URL and try again.".into(),
            )
        })?;

        let resolution = match resolution.map(str::trim).filter(|value| !value.is_empty()) {
            None => default_resolution,
            Some(raw) => parse_resolution(raw)
                .ok_or_else(|| PipelineError::InvalidRequest("invalid resolution".into()))?,
        };

        Ok(Self {
            source_url,
            resolution,
        })
    }
}

fn parse_source_url(input: &str) -> Option<Url> {
    let parsed = Url::parse(input).ok()?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return None;
    }
    parsed.host_str().filter(|host| !host.is_empty())?;
    Some(parsed)
}

fn parse_resolution(raw: &str) -> Option<u32> {
    let value = raw.parse::<i64>().ok()?;
    if value <= 0 {
        return None;
    }
    u32::try_from(value).ok()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PlatformClass {
    YouTubeLike,
    SocialSingleFile,
    GenericPage,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum StreamMode {
    Combined,
    SplitVideoAudio,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormatPlan {
    pub platform: PlatformClass,
    pub stream_mode: StreamMode,
    pub video_selector: String,
    pub audio_selector: Option<String>,
}

/// `{res}` in a selector is replaced with the requested ceiling.
#[derive(Debug, Clone, Copy)]
struct PlanTemplate {
    platform: PlatformClass,
    stream_mode: StreamMode,
    video_selector: &'static str,
    audio_selector: Option<&'static str>,
}

impl PlanTemplate {
    fn render(&self, resolution: u32) -> FormatPlan {
        let ceiling = resolution.to_string();
        FormatPlan {
            platform: self.platform,
            stream_mode: self.stream_mode,
            video_selector: self.video_selector.replace("{res}", &ceiling),
            audio_selector: self
                .audio_selector
                .map(|selector| selector.replace("{res}", &ceiling)),
        }
    }
}

const SOCIAL_SINGLE_FILE: PlanTemplate = PlanTemplate {
    platform: PlatformClass::SocialSingleFile,
    stream_mode: StreamMode::Combined,
    video_selector: "best[height<={res}]/best",
    audio_selector: None,
};

const YOUTUBE_LIKE: PlanTemplate = PlanTemplate {
    platform: PlatformClass::YouTubeLike,
    stream_mode: StreamMode::SplitVideoAudio,
    video_selector: "bestvideo[height<={res}]",
    audio_selector: Some("bestaudio"),
};

const GENERIC_PAGE: PlanTemplate = PlanTemplate {
    platform: PlatformClass::GenericPage,
    ..YOUTUBE_LIKE
};

/// Host markers and the plan each one selects. Order does not matter since
/// markers never overlap.
const PLATFORM_RULES: &[(&str, PlanTemplate)] = &[
    ("tiktok.com", SOCIAL_SINGLE_FILE),
    ("instagram.com", SOCIAL_SINGLE_FILE),
    ("facebook.com", SOCIAL_SINGLE_FILE),
    ("fb.watch", SOCIAL_SINGLE_FILE),
    ("twitter.com", SOCIAL_SINGLE_FILE),
    ("x.com", SOCIAL_SINGLE_FILE),
    ("bsky.app", SOCIAL_SINGLE_FILE),
    ("youtube.com", YOUTUBE_LIKE),
    ("youtu.be", YOUTUBE_LIKE),
];

fn is_domain_match(host: &str, domain: &str) -> bool {
    host == domain || host.ends_with(&format!(".{domain}"))
}

pub fn plan_download(request: &DownloadRequest) -> FormatPlan {
    let host = request
        .source_url
        .host_str()
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();

    PLATFORM_RULES
        .iter()
        .find(|(marker, _)| is_domain_match(&host, marker))
        .map(|(_, template)| template)
        .unwrap_or(&GENERIC_PAGE)
        .render(request.resolution)
}
