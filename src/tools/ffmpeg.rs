//! Argument builders for ffmpeg/ffprobe and parsing of probe output.

use std::path::Path;

use serde::Deserialize;

use super::EncodeTarget;

fn base_args() -> Vec<String> {
    vec![
        "-nostdin".to_string(),
        "-hide_banner".to_string(),
        "-loglevel".to_string(),
        "error".to_string(),
        "-n".to_string(),
    ]
}

/// Video is copied as-is; audio is normalized to AAC.
pub fn build_remux_args(video: &Path, audio: &Path, output: &Path) -> Vec<String> {
    let mut args = base_args();
    args.extend([
        "-i".to_string(),
        video.to_string_lossy().into_owned(),
        "-i".to_string(),
        audio.to_string_lossy().into_owned(),
        "-map".to_string(),
        "0:v:0".to_string(),
        "-map".to_string(),
        "1:a:0".to_string(),
        "-c:v".to_string(),
        "copy".to_string(),
        "-c:a".to_string(),
        "aac".to_string(),
        "-movflags".to_string(),
        "+faststart".to_string(),
        output.to_string_lossy().into_owned(),
    ]);
    args
}

/// Constant-bitrate H.264 re-encode: maxrate equals the bitrate and the
/// buffer holds two seconds' worth.
pub fn build_transcode_args(input: &Path, output: &Path, target: EncodeTarget) -> Vec<String> {
    let video_bitrate = target.video_bitrate_bps.to_string();
    let mut args = base_args();
    args.extend([
        "-i".to_string(),
        input.to_string_lossy().into_owned(),
        "-c:v".to_string(),
        "libx264".to_string(),
        "-preset".to_string(),
        "fast".to_string(),
        "-b:v".to_string(),
        video_bitrate.clone(),
        "-maxrate".to_string(),
        video_bitrate,
        "-bufsize".to_string(),
        (target.video_bitrate_bps * 2).to_string(),
        "-c:a".to_string(),
        "aac".to_string(),
        "-b:a".to_string(),
        target.audio_bitrate_bps.to_string(),
        "-movflags".to_string(),
        "+faststart".to_string(),
        output.to_string_lossy().into_owned(),
    ]);
    args
}

pub fn build_probe_args(input: &Path) -> Vec<String> {
    vec![
        "-v".to_string(),
        "error".to_string(),
        "-print_format".to_string(),
        "json".to_string(),
        "-show_format".to_string(),
        input.to_string_lossy().into_owned(),
    ]
}

#[derive(Debug, Deserialize)]
struct FfprobeFormat {
    duration: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FfprobeOutput {
    format: Option<FfprobeFormat>,
}

/// Duration in seconds; only finite, positive values are accepted.
pub fn parse_probe_duration(json: &[u8]) -> Result<f64, String> {
    let output: FfprobeOutput = serde_json::from_slice(json)
        .map_err(|error| format!("could not parse ffprobe JSON: {error}"))?;

    let raw = output
        .format
        .and_then(|format| format.duration)
        .ok_or_else(|| "ffprobe reported no duration".to_string())?;
    let duration = raw
        .trim()
        .parse::<f64>()
        .map_err(|_| format!("ffprobe duration {raw:?} is not a number"))?;

    if duration.is_finite() && duration > 0.0 {
        Ok(duration)
    } else {
        Err(format!("ffprobe duration {duration} is not usable"))
    }
}
