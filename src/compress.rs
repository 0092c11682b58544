//! Best-effort re-encode of outputs that exceed the size budget.
//!
//! A failure here never fails the request: the uncompressed file is served.

use tracing::{info, warn};

use crate::{
    error::CompressError,
    storage::{OutputDirectory, ScratchFile, non_empty_len},
    tools::{EncodeTarget, MediaTools},
};

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SizeBudget {
    /// Outputs strictly larger than this are re-encoded.
    pub limit_mb: f64,
    /// Size the bitrate is computed for, below the limit to leave room for
    /// container overhead.
    pub target_mb: f64,
    pub audio_bitrate_bps: u64,
    pub min_video_bitrate_bps: u64,
}

impl Default for SizeBudget {
    fn default() -> Self {
        Self {
            limit_mb: 8.0,
            target_mb: 7.8,
            audio_bitrate_bps: 128_000,
            min_video_bitrate_bps: 150_000,
        }
    }
}

impl SizeBudget {
    pub fn limit_bytes(&self) -> u64 {
        (self.limit_mb * BYTES_PER_MB) as u64
    }

    pub fn is_exceeded_by(&self, size_bytes: u64) -> bool {
        size_bytes > self.limit_bytes()
    }

    /// `floor(target_bits / duration) - audio`, never below the floor.
    pub fn video_bitrate_for(&self, duration_seconds: f64) -> u64 {
        let target_bits = self.target_mb * BYTES_PER_MB * 8.0;
        let total_bitrate = (target_bits / duration_seconds).floor();
        let video_bitrate = total_bitrate - self.audio_bitrate_bps as f64;

        if video_bitrate.is_finite() && video_bitrate > self.min_video_bitrate_bps as f64 {
            video_bitrate as u64
        } else {
            self.min_video_bitrate_bps
        }
    }

    pub fn encode_target(&self, duration_seconds: f64) -> EncodeTarget {
        EncodeTarget {
            video_bitrate_bps: self.video_bitrate_for(duration_seconds),
            audio_bitrate_bps: self.audio_bitrate_bps,
        }
    }
}

#[derive(Debug)]
pub enum CompressionOutcome {
    NotNeeded,
    Compressed {
        video_bitrate_bps: u64,
        bytes_before: u64,
        bytes_after: u64,
    },
    Failed(CompressError),
}

/// Returns the file to serve: `input` when no compression happened, or the
/// compressed replacement (in which case `input` has been deleted).
pub async fn shrink_to_budget(
    tools: &dyn MediaTools,
    output: &OutputDirectory,
    input: ScratchFile,
    stem: &str,
    budget: &SizeBudget,
) -> (ScratchFile, CompressionOutcome) {
    let bytes_before = match non_empty_len(input.path()).await {
        Ok(Some(size)) => size,
        Ok(None) => return (input, CompressionOutcome::NotNeeded),
        Err(error) => return (input, CompressionOutcome::Failed(error.into())),
    };
    if !budget.is_exceeded_by(bytes_before) {
        return (input, CompressionOutcome::NotNeeded);
    }

    let compressed = output.reserve(&format!("{stem}_compressed.mp4"));
    match encode_within_budget(tools, &input, &compressed, budget).await {
        Ok((video_bitrate_bps, bytes_after)) => {
            info!(
                "Compressed {} from {bytes_before} to {bytes_after} bytes at {video_bitrate_bps} bps",
                input.path().display()
            );
            (
                compressed,
                CompressionOutcome::Compressed {
                    video_bitrate_bps,
                    bytes_before,
                    bytes_after,
                },
            )
        }
        Err(error) => {
            warn!(
                "Compression of {} failed, serving the original: {error}",
                input.path().display()
            );
            (input, CompressionOutcome::Failed(error))
        }
    }
}

async fn encode_within_budget(
    tools: &dyn MediaTools,
    input: &ScratchFile,
    compressed: &ScratchFile,
    budget: &SizeBudget,
) -> Result<(u64, u64), CompressError> {
    let duration = tools
        .probe_duration(input.path())
        .await
        .map_err(CompressError::Probe)?;
    if !duration.is_finite() || duration <= 0.0 {
        return Err(CompressError::UnknownDuration(duration));
    }

    let target = budget.encode_target(duration);
    tools
        .transcode(input.path(), compressed.path(), target)
        .await
        .map_err(CompressError::Encode)?;

    let bytes_after = non_empty_len(compressed.path())
        .await?
        .ok_or_else(|| CompressError::EmptyOutput(compressed.path().to_path_buf()))?;

    Ok((target.video_bitrate_bps, bytes_after))
}
