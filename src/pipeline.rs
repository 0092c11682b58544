//! Request orchestration: plan, fetch, merge, compress.
//!
//! Every intermediate lives in a [`ScratchFile`], so an error, a timeout or a
//! dropped request removes whatever the request created. Only the final file
//! is persisted and left for the retention sweeper.

use std::{path::PathBuf, sync::Arc};

use tracing::info;

use crate::{
    compress::{CompressionOutcome, SizeBudget, shrink_to_budget},
    error::{MergeError, PipelineError},
    fetch::{FetchedStream, fetch_stream},
    merge::merge_streams,
    plan::{DownloadRequest, FormatPlan, StreamMode, plan_download},
    retry::RetryPolicy,
    storage::{MediaFile, OutputDirectory, ScratchFile},
    tools::{FetchJob, MediaTools, VideoMetadata},
};

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub cookies: Option<PathBuf>,
    pub fetch_retry: RetryPolicy,
    pub merge_retry: RetryPolicy,
    pub budget: SizeBudget,
}

#[derive(Debug)]
pub struct DownloadOutcome {
    pub file: MediaFile,
    pub file_name: String,
    pub metadata: VideoMetadata,
    pub plan: FormatPlan,
    pub compression: CompressionOutcome,
}

#[derive(Clone)]
pub struct DownloadPipeline {
    tools: Arc<dyn MediaTools>,
    output: OutputDirectory,
    settings: PipelineSettings,
}

impl DownloadPipeline {
    pub fn new(tools: Arc<dyn MediaTools>, output: OutputDirectory, settings: PipelineSettings) -> Self {
        Self {
            tools,
            output,
            settings,
        }
    }

    pub fn output(&self) -> &OutputDirectory {
        &self.output
    }

    pub async fn run(&self, request: &DownloadRequest) -> Result<DownloadOutcome, PipelineError> {
        let plan = plan_download(request);
        let stem = self.output.unique_stem();
        info!(
            "Planned {} as {:?}/{:?} at {}p",
            request.source_url, plan.platform, plan.stream_mode, request.resolution
        );

        let (assembled, metadata) = match plan.stream_mode {
            StreamMode::Combined => self.fetch_combined(request, &plan, &stem).await?,
            StreamMode::SplitVideoAudio => self.fetch_and_merge(request, &plan, &stem).await?,
        };

        let (final_file, compression) = shrink_to_budget(
            self.tools.as_ref(),
            &self.output,
            assembled,
            &stem,
            &self.settings.budget,
        )
        .await;

        let file_name = final_file.file_name();
        let path = final_file.persist();
        let file = MediaFile::inspect(&path).await?;
        info!("Prepared {} ({} bytes)", file_name, file.size_bytes);

        Ok(DownloadOutcome {
            file,
            file_name,
            metadata,
            plan,
            compression,
        })
    }

    fn fetch_job<'a>(
        &'a self,
        source_url: &'a str,
        selector: &'a str,
        output: &'a ScratchFile,
    ) -> FetchJob<'a> {
        FetchJob {
            source_url,
            selector,
            output: output.path(),
            cookies: self.settings.cookies.as_deref(),
        }
    }

    async fn fetch_combined(
        &self,
        request: &DownloadRequest,
        plan: &FormatPlan,
        stem: &str,
    ) -> Result<(ScratchFile, VideoMetadata), PipelineError> {
        let target = self.output.reserve(&format!("{stem}.mp4"));
        let job = self.fetch_job(request.source_url.as_str(), &plan.video_selector, &target);
        let fetched = fetch_stream(self.tools.as_ref(), &self.settings.fetch_retry, &job)
            .await
            .map_err(|source| PipelineError::Fetch {
                stream: "combined",
                source,
            })?;

        info!("Fetched combined stream ({} bytes)", fetched.file.size_bytes);
        Ok((target, fetched.metadata))
    }

    async fn fetch_and_merge(
        &self,
        request: &DownloadRequest,
        plan: &FormatPlan,
        stem: &str,
    ) -> Result<(ScratchFile, VideoMetadata), PipelineError> {
        let audio_selector = plan.audio_selector.as_deref().unwrap_or("bestaudio");
        let video = self.output.reserve(&format!("{stem}_video.mp4"));
        let audio = self.output.reserve(&format!("{stem}_audio.m4a"));
        let merged = self.output.reserve(&format!("{stem}.mp4"));

        let video_job = self.fetch_job(request.source_url.as_str(), &plan.video_selector, &video);
        let audio_job = self.fetch_job(request.source_url.as_str(), audio_selector, &audio);
        let tools = self.tools.as_ref();
        let retry = &self.settings.fetch_retry;

        // Both or neither: the first failure cancels the other fetch, and the
        // scratch files take its destination and any `.part` files with them.
        let (fetched_video, fetched_audio): (FetchedStream, FetchedStream) = tokio::try_join!(
            async {
                fetch_stream(tools, retry, &video_job)
                    .await
                    .map_err(|source| PipelineError::Fetch {
                        stream: "video",
                        source,
                    })
            },
            async {
                fetch_stream(tools, retry, &audio_job)
                    .await
                    .map_err(|source| PipelineError::Fetch {
                        stream: "audio",
                        source,
                    })
            },
        )?;

        info!(
            "Fetched video ({} bytes) and audio ({} bytes)",
            fetched_video.file.size_bytes, fetched_audio.file.size_bytes
        );

        let (video_path, audio_path, merged_path) = (video.path(), audio.path(), merged.path());
        self.settings
            .merge_retry
            .run(
                "merge",
                |_| async move { merge_streams(tools, video_path, audio_path, merged_path).await },
                MergeError::is_transient,
            )
            .await?;

        Ok((merged, fetched_video.metadata.or(fetched_audio.metadata)))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::path::Path;

    use async_trait::async_trait;
    use parking_lot::Mutex;
    use tokio::time::Duration;
    use url::Url;

    use super::*;
    use crate::{
        error::{FailureKind, FetchError, ToolError},
        plan::PlatformClass,
        tools::EncodeTarget,
    };

    const MIB: u64 = 1024 * 1024;

    #[derive(Debug, Clone, PartialEq)]
    pub enum Call {
        Fetch { selector: String, output: PathBuf },
        Remux,
        Probe,
        Transcode(EncodeTarget),
    }

    /// Records every invocation and writes plausible files in their place.
    pub struct RecordingTools {
        pub calls: Mutex<Vec<Call>>,
        pub fetch_bytes: u64,
        pub merged_bytes: u64,
        pub duration: f64,
        pub failing_selector: Option<&'static str>,
        /// Leaves a `.part` file behind and never finishes.
        pub stalling_selector: Option<&'static str>,
        pub hang_on_remux: bool,
    }

    impl RecordingTools {
        pub fn new() -> Self {
            Self {
                calls: Mutex::new(Vec::new()),
                fetch_bytes: 1024,
                merged_bytes: 2048,
                duration: 60.0,
                failing_selector: None,
                stalling_selector: None,
                hang_on_remux: false,
            }
        }

        pub fn calls(&self) -> Vec<Call> {
            self.calls.lock().clone()
        }
    }

    fn write_sized(path: &Path, size: u64) {
        std::fs::File::create(path).unwrap().set_len(size).unwrap();
    }

    #[async_trait]
    impl MediaTools for RecordingTools {
        async fn fetch(&self, job: &FetchJob<'_>) -> Result<VideoMetadata, ToolError> {
            self.calls.lock().push(Call::Fetch {
                selector: job.selector.to_string(),
                output: job.output.to_path_buf(),
            });
            if self.failing_selector == Some(job.selector) {
                write_sized(job.output, 10);
                return Err(ToolError::Failed {
                    program: "yt-dlp".into(),
                    code: Some(1),
                    diagnostic: "ERROR: Unsupported URL".into(),
                    kind: FailureKind::Permanent,
                });
            }
            if self.stalling_selector == Some(job.selector) {
                let mut partial = job.output.as_os_str().to_owned();
                partial.push(".part");
                write_sized(Path::new(&partial), 10);
                std::future::pending::<()>().await;
            }
            write_sized(job.output, self.fetch_bytes);
            Ok(VideoMetadata {
                id: Some("abc123".into()),
                title: Some(format!("title for {}", job.selector)),
                duration_seconds: Some(self.duration),
                author: Some("Uploader".into()),
            })
        }

        async fn remux(&self, _: &Path, _: &Path, output: &Path) -> Result<(), ToolError> {
            self.calls.lock().push(Call::Remux);
            write_sized(output, self.merged_bytes);
            if self.hang_on_remux {
                std::future::pending::<()>().await;
            }
            Ok(())
        }

        async fn probe_duration(&self, _: &Path) -> Result<f64, ToolError> {
            self.calls.lock().push(Call::Probe);
            Ok(self.duration)
        }

        async fn transcode(
            &self,
            _: &Path,
            output: &Path,
            target: EncodeTarget,
        ) -> Result<(), ToolError> {
            self.calls.lock().push(Call::Transcode(target));
            write_sized(output, 7 * MIB);
            Ok(())
        }
    }

    pub fn test_settings() -> PipelineSettings {
        PipelineSettings {
            cookies: None,
            fetch_retry: RetryPolicy::new(2, Duration::from_millis(1), Duration::from_millis(1)),
            merge_retry: RetryPolicy::once(),
            budget: SizeBudget::default(),
        }
    }

    fn request(url: &str, resolution: u32) -> DownloadRequest {
        DownloadRequest {
            source_url: Url::parse(url).unwrap(),
            resolution,
        }
    }

    fn dir_entries(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(dir)
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    #[tokio::test]
    async fn social_url_runs_a_single_fetch_without_merge() {
        let dir = tempfile::tempdir().unwrap();
        let tools = Arc::new(RecordingTools::new());
        let output = OutputDirectory::new(dir.path());
        let pipeline = DownloadPipeline::new(tools.clone(), output.clone(), test_settings());

        let outcome = pipeline
            .run(&request("https://www.tiktok.com/@a/video/1", 480))
            .await
            .unwrap();

        let calls = tools.calls();
        assert_eq!(calls.len(), 1);
        assert!(matches!(&calls[0], Call::Fetch { selector, .. } if selector == "best[height<=480]/best"));
        assert_eq!(outcome.plan.platform, PlatformClass::SocialSingleFile);
        assert!(matches!(outcome.compression, CompressionOutcome::NotNeeded));
        assert_eq!(outcome.metadata.title.as_deref(), Some("title for best[height<=480]/best"));
        assert_eq!(outcome.metadata.id.as_deref(), Some("abc123"));
        assert_eq!(dir_entries(dir.path()), vec![outcome.file_name.clone()]);
        assert!(!output.is_leased(&outcome.file.path));
    }

    #[tokio::test]
    async fn split_streams_are_fetched_merged_and_compressed() {
        let dir = tempfile::tempdir().unwrap();
        let tools = Arc::new(RecordingTools {
            merged_bytes: 12 * MIB,
            duration: 60.0,
            ..RecordingTools::new()
        });
        let pipeline =
            DownloadPipeline::new(tools.clone(), OutputDirectory::new(dir.path()), test_settings());

        let outcome = pipeline
            .run(&request("https://www.youtube.com/watch?v=abc", 720))
            .await
            .unwrap();

        let calls = tools.calls();
        let selectors: Vec<&str> = calls
            .iter()
            .filter_map(|call| match call {
                Call::Fetch { selector, .. } => Some(selector.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(selectors.len(), 2);
        assert!(selectors.contains(&"bestvideo[height<=720]"));
        assert!(selectors.contains(&"bestaudio"));

        let expected_bitrate =
            ((7.8 * 1024.0 * 1024.0 * 8.0) / 60.0_f64).floor() as u64 - 128_000;
        assert_eq!(
            &calls[2..],
            &[
                Call::Remux,
                Call::Probe,
                Call::Transcode(EncodeTarget {
                    video_bitrate_bps: expected_bitrate,
                    audio_bitrate_bps: 128_000,
                }),
            ]
        );
        assert!(outcome.file_name.ends_with("_compressed.mp4"));
        assert_eq!(outcome.file.size_bytes, 7 * MIB);
        assert!(matches!(outcome.compression, CompressionOutcome::Compressed { .. }));
        assert_eq!(dir_entries(dir.path()), vec![outcome.file_name.clone()]);
    }

    #[tokio::test]
    async fn failed_audio_fetch_fails_request_and_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let tools = Arc::new(RecordingTools {
            failing_selector: Some("bestaudio"),
            ..RecordingTools::new()
        });
        let pipeline =
            DownloadPipeline::new(tools.clone(), OutputDirectory::new(dir.path()), test_settings());

        let error = pipeline
            .run(&request("https://vimeo.com/1", 720))
            .await
            .unwrap_err();

        assert!(matches!(
            error,
            PipelineError::Fetch {
                stream: "audio",
                source: FetchError::Tool(_)
            }
        ));
        assert!(!tools.calls().contains(&Call::Remux));
        assert!(dir_entries(dir.path()).is_empty());
    }

    #[tokio::test]
    async fn failed_audio_fetch_removes_the_stalled_video_partial() {
        let dir = tempfile::tempdir().unwrap();
        let tools = Arc::new(RecordingTools {
            stalling_selector: Some("bestvideo[height<=720]"),
            failing_selector: Some("bestaudio"),
            ..RecordingTools::new()
        });
        let pipeline =
            DownloadPipeline::new(tools.clone(), OutputDirectory::new(dir.path()), test_settings());

        let error = pipeline
            .run(&request("https://www.youtube.com/watch?v=abc", 720))
            .await
            .unwrap_err();

        assert!(matches!(error, PipelineError::Fetch { stream: "audio", .. }));
        assert!(dir_entries(dir.path()).is_empty());
    }

    #[tokio::test]
    async fn deadline_during_fetch_removes_partial_downloads() {
        let dir = tempfile::tempdir().unwrap();
        let tools = Arc::new(RecordingTools {
            stalling_selector: Some("best[height<=720]/best"),
            ..RecordingTools::new()
        });
        let pipeline =
            DownloadPipeline::new(tools.clone(), OutputDirectory::new(dir.path()), test_settings());
        let request = request("https://x.com/someone/status/1", 720);

        let result = tokio::time::timeout(Duration::from_millis(100), pipeline.run(&request)).await;

        assert!(result.is_err());
        assert_eq!(tools.calls().len(), 1);
        assert!(dir_entries(dir.path()).is_empty());
    }

    #[tokio::test]
    async fn cancelled_request_removes_its_intermediate_files() {
        let dir = tempfile::tempdir().unwrap();
        let tools = Arc::new(RecordingTools {
            hang_on_remux: true,
            ..RecordingTools::new()
        });
        let output = OutputDirectory::new(dir.path());
        let pipeline = DownloadPipeline::new(tools.clone(), output, test_settings());
        let request = request("https://www.youtube.com/watch?v=abc", 720);

        let result = tokio::time::timeout(Duration::from_millis(200), pipeline.run(&request)).await;

        assert!(result.is_err());
        assert!(tools.calls().contains(&Call::Remux));
        assert!(dir_entries(dir.path()).is_empty());
    }
}
