//! Fetch invoker: one extractor download into a fresh destination path.

use std::path::Path;

use tracing::{info, warn};

use crate::{
    error::FetchError,
    retry::RetryPolicy,
    storage::{MediaFile, non_empty_len, remove_if_exists, remove_partials},
    tools::{FetchJob, MediaTools, VideoMetadata},
};

#[derive(Debug, Clone, PartialEq)]
pub struct FetchedStream {
    pub file: MediaFile,
    pub metadata: VideoMetadata,
}

/// On success a non-empty file exists at `job.output`. A destination that
/// already exists is refused rather than overwritten.
pub async fn fetch_stream(
    tools: &dyn MediaTools,
    retry: &RetryPolicy,
    job: &FetchJob<'_>,
) -> Result<FetchedStream, FetchError> {
    if tokio::fs::try_exists(job.output).await? {
        return Err(FetchError::Collision(job.output.to_path_buf()));
    }

    let metadata = retry
        .run(
            "fetch",
            |attempt| async move {
                if attempt > 1 {
                    discard_partial_output(job.output).await;
                }
                tools.fetch(job).await.map_err(FetchError::from)
            },
            FetchError::is_transient,
        )
        .await;

    let metadata = match metadata {
        Ok(metadata) => metadata,
        Err(error) => {
            discard_partial_output(job.output).await;
            return Err(error);
        }
    };

    let Some(size_bytes) = non_empty_len(job.output).await? else {
        discard_partial_output(job.output).await;
        return Err(FetchError::EmptyOutput(job.output.to_path_buf()));
    };

    info!(
        "Fetched {} ({size_bytes} bytes) with selector {:?}",
        job.output.display(),
        job.selector
    );

    Ok(FetchedStream {
        file: MediaFile {
            path: job.output.to_path_buf(),
            size_bytes,
        },
        metadata,
    })
}

async fn discard_partial_output(path: &Path) {
    if let Err(error) = remove_if_exists(path).await {
        warn!("Could not remove partial download {:?}: {error}", path);
    }
    remove_partials(path);
}
