use std::{io, path::PathBuf};

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
        }
    }

    #[cfg(test)]
    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(ErrorBody {
            error: self.message,
        });

        (self.status, body).into_response()
    }
}

/// How a failed external invocation should be treated by a retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Rate limiting, bot checks, timeouts: worth another attempt.
    Transient,
    /// Invalid or unsupported input: retrying cannot help.
    Permanent,
}

#[derive(Debug, Error)]
pub enum ToolError {
    #[error("{program} is not installed or not on PATH")]
    NotFound { program: String },
    #[error("could not run {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("{program} timed out after {seconds}s")]
    TimedOut { program: String, seconds: u64 },
    #[error("{program} exited with status {code:?}: {diagnostic}")]
    Failed {
        program: String,
        code: Option<i32>,
        diagnostic: String,
        kind: FailureKind,
    },
    #[error("unexpected output from {program}: {detail}")]
    Output { program: String, detail: String },
}

impl ToolError {
    pub fn is_transient(&self) -> bool {
        match self {
            Self::TimedOut { .. } => true,
            Self::Failed { kind, .. } => *kind == FailureKind::Transient,
            Self::NotFound { .. } | Self::Spawn { .. } | Self::Output { .. } => false,
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("destination {0:?} already exists")]
    Collision(PathBuf),
    #[error("extractor reported success but {0:?} is missing or empty")]
    EmptyOutput(PathBuf),
    #[error(transparent)]
    Tool(#[from] ToolError),
    #[error("filesystem error while fetching: {0}")]
    Io(#[from] io::Error),
}

impl FetchError {
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Tool(error) => error.is_transient(),
            Self::Collision(_) | Self::EmptyOutput(_) | Self::Io(_) => false,
        }
    }
}

#[derive(Debug, Error)]
pub enum MergeError {
    #[error("merge input {0:?} does not exist")]
    MissingInput(PathBuf),
    #[error("remux reported success but {0:?} is missing or empty")]
    EmptyOutput(PathBuf),
    #[error(transparent)]
    Tool(#[from] ToolError),
    #[error("filesystem error while merging: {0}")]
    Io(#[from] io::Error),
}

impl MergeError {
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Tool(error) => error.is_transient(),
            Self::MissingInput(_) | Self::EmptyOutput(_) | Self::Io(_) => false,
        }
    }
}

/// Compression never fails a request; these only end up in the log.
#[derive(Debug, Error)]
pub enum CompressError {
    #[error("could not probe duration: {0}")]
    Probe(ToolError),
    #[error("probe returned unusable duration {0}")]
    UnknownDuration(f64),
    #[error("re-encode failed: {0}")]
    Encode(ToolError),
    #[error("re-encode produced no output at {0:?}")]
    EmptyOutput(PathBuf),
    #[error("filesystem error while compressing: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("fetching the {stream} stream failed: {source}")]
    Fetch {
        stream: &'static str,
        #[source]
        source: FetchError,
    },
    #[error("merging streams failed: {0}")]
    Merge(#[from] MergeError),
    #[error("pipeline exceeded {0}s and was cancelled")]
    Timeout(u64),
    #[error("filesystem error: {0}")]
    Io(#[from] io::Error),
}

impl From<PipelineError> for ApiError {
    fn from(error: PipelineError) -> Self {
        match error {
            PipelineError::InvalidRequest(message) => ApiError::bad_request(message),
            PipelineError::Fetch { .. } => {
                ApiError::internal("Could not retrieve the video from the source.")
            }
            PipelineError::Merge(_) => ApiError::internal("Failed to merge video and audio."),
            PipelineError::Timeout(_) => {
                ApiError::internal("Processing took too long. Try again later.")
            }
            PipelineError::Io(_) => ApiError::internal("Something went wrong preparing the file."),
        }
    }
}
