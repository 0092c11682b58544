//! Multiplexes separately fetched video and audio into one container.

use std::path::Path;

use tracing::{info, warn};

use crate::{
    error::MergeError,
    storage::{MediaFile, non_empty_len, remove_if_exists},
    tools::MediaTools,
};

/// On success `output` exists and both inputs are gone. On failure nothing is
/// left at `output` and both inputs are untouched.
pub async fn merge_streams(
    tools: &dyn MediaTools,
    video: &Path,
    audio: &Path,
    output: &Path,
) -> Result<MediaFile, MergeError> {
    for input in [video, audio] {
        if non_empty_len(input).await?.is_none() {
            return Err(MergeError::MissingInput(input.to_path_buf()));
        }
    }

    if let Err(error) = tools.remux(video, audio, output).await {
        discard_output(output).await;
        return Err(error.into());
    }

    let Some(size_bytes) = non_empty_len(output).await? else {
        discard_output(output).await;
        return Err(MergeError::EmptyOutput(output.to_path_buf()));
    };

    for input in [video, audio] {
        if let Err(error) = remove_if_exists(input).await {
            warn!("Could not remove merged input {:?}: {error}", input);
        }
    }

    info!("Merged streams into {} ({size_bytes} bytes)", output.display());

    Ok(MediaFile {
        path: output.to_path_buf(),
        size_bytes,
    })
}

async fn discard_output(output: &Path) {
    if let Err(error) = remove_if_exists(output).await {
        warn!("Could not remove partial merge output {:?}: {error}", output);
    }
}
