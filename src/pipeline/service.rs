//! # Transcript Pipeline
//!
//! Composes the building blocks into the two stages a job goes through:
//!
//! 1. **fetch**: one submission-queue slot covering the metadata lookup and the
//!    download, the download wrapped as `retry(timeout(fetch))`
//! 2. **transcribe**: one execution-pool slot running `retry(timeout(transcribe))`
//!
//! The job executor drives these stages one after the other so it can report
//! progress in between. Every stage gets a child of the service-wide shutdown
//! token, so stopping the service kills any external process still running.

use crate::cache::TranscriptCache;
use crate::config::AppConfig;
use crate::error::{PipelineError, PipelineResult, Stage};
use crate::locator::VideoId;
use crate::pipeline::backoff::{retry_with_backoff, RetryPolicy};
use crate::pipeline::collaborators::{Artifact, Fetcher, MetadataSource, Transcriber, VideoMetadata};
use crate::pipeline::pool::{ExecutionPool, PoolStats};
use crate::pipeline::queue::SubmissionQueue;
use crate::pipeline::timeout::with_timeout;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Stage budgets, taken from configuration once at startup.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub work_dir: PathBuf,
    pub fetch_retry: RetryPolicy,
    pub fetch_timeout: Duration,
    pub transcribe_retry: RetryPolicy,
    pub transcribe_timeout: Duration,
    pub metadata_timeout: Duration,
}

impl PipelineSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            work_dir: config.fetch.work_dir.clone(),
            fetch_retry: RetryPolicy::new(
                config.fetch.retries,
                Duration::from_millis(config.fetch.base_delay_ms),
                Duration::from_millis(config.fetch.max_delay_ms),
            ),
            fetch_timeout: config.fetch.timeout(),
            transcribe_retry: RetryPolicy::new(
                config.transcribe.retries,
                Duration::from_millis(config.transcribe.base_delay_ms),
                Duration::from_millis(config.transcribe.max_delay_ms),
            ),
            transcribe_timeout: config.transcribe.timeout(),
            metadata_timeout: config.metadata.timeout(),
        }
    }
}

/// Output of the fetch stage. The scratch directory lives as long as this
/// value and is removed when it is dropped.
pub struct FetchedMedia {
    workdir: TempDir,
    pub artifact: Artifact,
    pub metadata: VideoMetadata,
}

impl FetchedMedia {
    pub fn workdir(&self) -> &std::path::Path {
        self.workdir.path()
    }
}

/// The orchestration engine shared by the HTTP layer and the job executor.
pub struct TranscriptPipeline {
    cache: Arc<TranscriptCache>,
    queue: SubmissionQueue,
    pool: ExecutionPool,
    fetcher: Arc<dyn Fetcher>,
    transcriber: Arc<dyn Transcriber>,
    metadata: Option<Arc<dyn MetadataSource>>,
    settings: PipelineSettings,
    shutdown: CancellationToken,
}

impl TranscriptPipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        cache: Arc<TranscriptCache>,
        queue: SubmissionQueue,
        pool: ExecutionPool,
        fetcher: Arc<dyn Fetcher>,
        transcriber: Arc<dyn Transcriber>,
        metadata: Option<Arc<dyn MetadataSource>>,
        settings: PipelineSettings,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            cache,
            queue,
            pool,
            fetcher,
            transcriber,
            metadata,
            settings,
            shutdown,
        }
    }

    /// Build the production pipeline: external-process collaborators, a queue
    /// and a pool sized from configuration.
    pub fn from_config(config: &AppConfig, cache: Arc<TranscriptCache>, shutdown: CancellationToken) -> Self {
        let (fetcher, transcriber, metadata) = crate::pipeline::external::from_config(config);
        Self::new(
            cache,
            SubmissionQueue::new(config.queue.min_gap(), config.queue.jitter()),
            ExecutionPool::new(config.transcribe.concurrency),
            fetcher,
            transcriber,
            metadata,
            PipelineSettings::from_config(config),
            shutdown,
        )
    }

    pub fn cache(&self) -> &Arc<TranscriptCache> {
        &self.cache
    }

    pub fn queue_depth(&self) -> usize {
        self.queue.depth()
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.pool.stats()
    }

    /// Fetch stage: wait for a queue slot, look up metadata (best effort), then
    /// download with retries and a per-attempt timeout.
    pub async fn fetch(&self, id: &VideoId) -> PipelineResult<FetchedMedia> {
        let workdir = self.scratch_dir()?;
        let url = id.canonical_url();
        let dest = workdir.path().to_path_buf();
        let fetcher = self.fetcher.clone();
        let metadata_source = self.metadata.clone();
        let settings = self.settings.clone();
        let shutdown = self.shutdown.clone();
        let video_id = id.to_string();

        let (artifact, metadata) = self
            .queue
            .submit(async move {
                let metadata = match metadata_source {
                    Some(source) => {
                        lookup_metadata(source.as_ref(), &url, settings.metadata_timeout, &shutdown).await
                    }
                    None => VideoMetadata::default(),
                };

                let artifact = retry_with_backoff(
                    settings.fetch_retry,
                    Stage::Fetch,
                    &shutdown,
                    PipelineError::is_retriable,
                    |attempt| {
                        debug!(video_id = %video_id, attempt = attempt + 1, "Downloading media");
                        with_timeout(settings.fetch_timeout, Stage::Fetch, &shutdown, |token| {
                            fetcher.fetch_artifact(&url, &dest, token)
                        })
                    },
                )
                .await?;

                Ok((artifact, metadata))
            })
            .await?;

        info!(video_id = %id, artifact = %artifact.path.display(), "Media downloaded");
        Ok(FetchedMedia {
            workdir,
            artifact,
            metadata,
        })
    }

    /// Transcribe stage: the metadata header (if any) followed by the transcript.
    pub async fn transcribe(&self, media: &FetchedMedia) -> PipelineResult<String> {
        let text = self.run_transcriber(&media.artifact).await?;
        Ok(format!("{}{}", media.metadata.header(), text))
    }

    /// Transcribe an uploaded media file. Skips the fetch stage and the cache.
    pub async fn transcribe_upload(&self, data: &[u8], extension: Option<&str>) -> PipelineResult<String> {
        let workdir = self.scratch_dir()?;
        let file_name = match extension {
            Some(ext) if is_safe_extension(ext) => format!("upload.{}", ext),
            _ => "upload".to_string(),
        };
        let path = workdir.path().join(file_name);
        tokio::fs::write(&path, data).await?;
        debug!(bytes = data.len(), path = %path.display(), "Stored uploaded media");

        self.run_transcriber(&Artifact::new(path)).await
    }

    async fn run_transcriber(&self, artifact: &Artifact) -> PipelineResult<String> {
        let transcriber = self.transcriber.clone();
        let shutdown = &self.shutdown;
        let timeout = self.settings.transcribe_timeout;

        self.pool
            .run(retry_with_backoff(
                self.settings.transcribe_retry,
                Stage::Transcribe,
                shutdown,
                |e| matches!(e, PipelineError::TransformFailure(_)),
                |attempt| {
                    debug!(artifact = %artifact.path.display(), attempt = attempt + 1, "Transcribing");
                    with_timeout(timeout, Stage::Transcribe, shutdown, |token| {
                        transcriber.transcribe(artifact, token)
                    })
                },
            ))
            .await
    }

    fn scratch_dir(&self) -> PipelineResult<TempDir> {
        std::fs::create_dir_all(&self.settings.work_dir)?;
        let dir = tempfile::Builder::new()
            .prefix("yt-")
            .tempdir_in(&self.settings.work_dir)?;
        Ok(dir)
    }
}

async fn lookup_metadata(
    source: &dyn MetadataSource,
    url: &str,
    limit: Duration,
    shutdown: &CancellationToken,
) -> VideoMetadata {
    match with_timeout(limit, Stage::Metadata, shutdown, |token| source.fetch_metadata(url, token)).await {
        Ok(metadata) => metadata,
        Err(e) => {
            warn!(url, error = %e, "Metadata lookup failed, continuing without it");
            VideoMetadata::default()
        }
    }
}

/// Upload extensions end up in a file name; keep them short and alphanumeric.
fn is_safe_extension(ext: &str) -> bool {
    !ext.is_empty() && ext.len() <= 8 && ext.chars().all(|c| c.is_ascii_alphanumeric())
}
