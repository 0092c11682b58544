mod api;
mod compress;
mod config;
mod error;
mod fetch;
mod merge;
mod pipeline;
mod plan;
mod retry;
mod storage;
mod sweeper;
mod tools;

use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::{
    api::{AppState, build_router},
    config::Settings,
    error::ApiError,
    pipeline::DownloadPipeline,
    storage::OutputDirectory,
    sweeper::spawn_retention_sweeper,
    tools::ExternalTools,
};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "vidrelay=info,tower_http=info".to_string()),
        )
        .init();

    if let Err(error) = run().await {
        eprintln!("Server error: {}", error.message());
        std::process::exit(1);
    }
}

async fn run() -> Result<(), ApiError> {
    let settings = Arc::new(Settings::from_env());

    let output = OutputDirectory::open(settings.output_dir.clone())
        .await
        .map_err(|error| {
            ApiError::internal(format!(
                "Could not create the downloads directory {:?}: {error}",
                settings.output_dir
            ))
        })?;

    if !settings.trust_proxy_headers {
        warn!("TRUST_PROXY_HEADERS=false: download links use the Host header and plain http.");
    }

    let tools = Arc::new(ExternalTools::new(
        settings.ytdlp_path.clone(),
        settings.ffmpeg_path.clone(),
        settings.ffprobe_path.clone(),
        settings.tool_timeout,
    ));
    let pipeline = DownloadPipeline::new(tools, output.clone(), settings.pipeline_settings());

    spawn_retention_sweeper(output, settings.sweep_interval, settings.retention_age);

    let app = build_router(AppState::new(pipeline, Arc::clone(&settings)))?;

    let addr = settings.bind_addr.clone();
    let listener = TcpListener::bind(&addr).await.map_err(|error| {
        ApiError::internal(format!("Could not bind {addr}: {error}"))
    })?;

    info!(
        "vidrelay listening on http://{addr}, serving files from {:?}",
        settings.output_dir
    );

    axum::serve(listener, app)
        .await
        .map_err(|error| ApiError::internal(format!("HTTP server error: {error}")))
}
