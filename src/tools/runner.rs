//! Spawning external executables with a deadline and classifying failures.

use std::{io::ErrorKind, process::Stdio};

use tokio::{
    process::Command,
    time::{Duration, timeout},
};
use tracing::debug;

use crate::error::{FailureKind, ToolError};

/// Checked first: when one of these shows up, retrying is pointless even if
/// a transient marker appears as well.
const PERMANENT_MARKERS: &[&str] = &[
    "unsupported url",
    "is not a valid url",
    "video unavailable",
    "private video",
    "requested format is not available",
    "http error 404",
    "drm protected",
    "no such file or directory",
    "invalid data found when processing input",
];

const TRANSIENT_MARKERS: &[&str] = &[
    "http error 429",
    "too many requests",
    "rate limit",
    "rate-limit",
    "not a bot",
    "bot detection",
    "timed out",
    "connection reset",
    "temporarily unavailable",
    "http error 500",
    "http error 502",
    "http error 503",
    "http error 504",
];

pub fn classify_failure(stderr: &str) -> FailureKind {
    let lower = stderr.to_ascii_lowercase();
    if PERMANENT_MARKERS.iter().any(|marker| lower.contains(marker)) {
        return FailureKind::Permanent;
    }
    if TRANSIENT_MARKERS.iter().any(|marker| lower.contains(marker)) {
        return FailureKind::Transient;
    }
    FailureKind::Permanent
}

/// Last non-empty stderr line, which is where yt-dlp and ffmpeg put the reason.
pub fn diagnostic_line(stderr: &[u8], program: &str) -> String {
    String::from_utf8_lossy(stderr)
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .next_back()
        .map(ToString::to_string)
        .unwrap_or_else(|| format!("{program} could not complete the operation"))
}

/// Runs `program` to completion. The child is killed if the deadline passes
/// or if the returned future is dropped.
pub async fn run_tool(
    program: &str,
    args: &[String],
    limit: Duration,
) -> Result<std::process::Output, ToolError> {
    debug!("Running {program} {:?}", args);

    let command_future = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .output();
    let output = timeout(limit, command_future)
        .await
        .map_err(|_| ToolError::TimedOut {
            program: program.to_string(),
            seconds: limit.as_secs(),
        })?
        .map_err(|error| {
            if error.kind() == ErrorKind::NotFound {
                ToolError::NotFound {
                    program: program.to_string(),
                }
            } else {
                ToolError::Spawn {
                    program: program.to_string(),
                    source: error,
                }
            }
        })?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(ToolError::Failed {
            program: program.to_string(),
            code: output.status.code(),
            diagnostic: diagnostic_line(&output.stderr, program),
            kind: classify_failure(&stderr),
        });
    }

    Ok(output)
}
