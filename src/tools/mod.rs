//! The external executables this service drives: an extractor (yt-dlp) and
//! a media toolkit (ffmpeg/ffprobe).

mod ffmpeg;
pub mod runner;
mod ytdlp;

use std::path::Path;

use async_trait::async_trait;
use tokio::time::Duration;

use crate::error::ToolError;

use self::runner::run_tool;

/// One extractor invocation.
#[derive(Debug, Clone, Copy)]
pub struct FetchJob<'a> {
    pub source_url: &'a str,
    pub selector: &'a str,
    pub output: &'a Path,
    pub cookies: Option<&'a Path>,
}

/// What the extractor reports about the source. Every field is optional.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct VideoMetadata {
    pub id: Option<String>,
    pub title: Option<String>,
    pub duration_seconds: Option<f64>,
    pub author: Option<String>,
}

impl VideoMetadata {
    /// Keeps this value's fields and fills the gaps from `other`.
    pub fn or(self, other: Self) -> Self {
        Self {
            id: self.id.or(other.id),
            title: self.title.or(other.title),
            duration_seconds: self.duration_seconds.or(other.duration_seconds),
            author: self.author.or(other.author),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncodeTarget {
    pub video_bitrate_bps: u64,
    pub audio_bitrate_bps: u64,
}

#[async_trait]
pub trait MediaTools: Send + Sync {
    async fn fetch(&self, job: &FetchJob<'_>) -> Result<VideoMetadata, ToolError>;

    async fn remux(&self, video: &Path, audio: &Path, output: &Path) -> Result<(), ToolError>;

    async fn probe_duration(&self, input: &Path) -> Result<f64, ToolError>;

    async fn transcode(
        &self,
        input: &Path,
        output: &Path,
        target: EncodeTarget,
    ) -> Result<(), ToolError>;
}

/// [`MediaTools`] backed by real executables.
#[derive(Debug, Clone)]
pub struct ExternalTools {
    ytdlp: String,
    ffmpeg: String,
    ffprobe: String,
    timeout: Duration,
}

impl ExternalTools {
    pub fn new(
        ytdlp: impl Into<String>,
        ffmpeg: impl Into<String>,
        ffprobe: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            ytdlp: ytdlp.into(),
            ffmpeg: ffmpeg.into(),
            ffprobe: ffprobe.into(),
            timeout,
        }
    }
}

#[async_trait]
impl MediaTools for ExternalTools {
    async fn fetch(&self, job: &FetchJob<'_>) -> Result<VideoMetadata, ToolError> {
        let output = run_tool(&self.ytdlp, &ytdlp::build_fetch_args(job), self.timeout).await?;
        Ok(ytdlp::parse_printed_metadata(&output.stdout))
    }

    async fn remux(&self, video: &Path, audio: &Path, output: &Path) -> Result<(), ToolError> {
        let args = ffmpeg::build_remux_args(video, audio, output);
        run_tool(&self.ffmpeg, &args, self.timeout).await.map(drop)
    }

    async fn probe_duration(&self, input: &Path) -> Result<f64, ToolError> {
        let output = run_tool(&self.ffprobe, &ffmpeg::build_probe_args(input), self.timeout).await?;
        ffmpeg::parse_probe_duration(&output.stdout).map_err(|detail| ToolError::Output {
            program: self.ffprobe.clone(),
            detail,
        })
    }

    async fn transcode(
        &self,
        input: &Path,
        output: &Path,
        target: EncodeTarget,
    ) -> Result<(), ToolError> {
        let args = ffmpeg::build_transcode_args(input, output, target);
        run_tool(&self.ffmpeg, &args, self.timeout).await.map(drop)
    }
}
