use serde::Deserialize;

use super::{FetchJob, VideoMetadata};

/// Printed once the file is in place: a JSON object with just these fields.
const METADATA_TEMPLATE: &str = "after_move:%(.{id,title,duration,uploader,channel})j";

#[derive(Debug, Default, Deserialize)]
struct PrintedInfo {
    id: Option<String>,
    title: Option<String>,
    duration: Option<f64>,
    uploader: Option<String>,
    channel: Option<String>,
}

pub fn build_fetch_args(job: &FetchJob<'_>) -> Vec<String> {
    let mut args = vec![
        job.source_url.to_string(),
        "-f".to_string(),
        job.selector.to_string(),
        "-o".to_string(),
        job.output.to_string_lossy().into_owned(),
        "--no-playlist".to_string(),
        "--no-warnings".to_string(),
        "--print".to_string(),
        METADATA_TEMPLATE.to_string(),
    ];

    if let Some(cookies) = job.cookies {
        args.push("--cookies".to_string());
        args.push(cookies.to_string_lossy().into_owned());
    }

    args
}

/// Reads the last non-empty stdout line. A line that is not the expected
/// JSON object is taken as a bare title.
pub fn parse_printed_metadata(stdout: &[u8]) -> VideoMetadata {
    let text = String::from_utf8_lossy(stdout);
    let Some(line) = text.lines().map(str::trim).filter(|line| !line.is_empty()).next_back() else {
        return VideoMetadata::default();
    };

    match serde_json::from_str::<PrintedInfo>(line) {
        Ok(info) => VideoMetadata {
            id: meaningful(info.id),
            title: meaningful(info.title),
            duration_seconds: info
                .duration
                .filter(|seconds| seconds.is_finite() && *seconds > 0.0),
            author: meaningful(info.uploader).or_else(|| meaningful(info.channel)),
        },
        Err(_) => VideoMetadata {
            title: meaningful(Some(line.to_string())),
            ..VideoMetadata::default()
        },
    }
}

// yt-dlp prints "NA" for fields the extractor did not provide.
fn meaningful(value: Option<String>) -> Option<String> {
    value
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty() && value != "NA")
}
