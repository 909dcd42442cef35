//! # Transcript Pipeline Module
//!
//! Everything between "we have a video id" and "we have text":
//!
//! - `queue`: rate-limited FIFO for upstream submissions
//! - `backoff`: retry with exponential backoff and jitter
//! - `pool`: bounded concurrency for transcription
//! - `timeout`: per-stage deadlines with cancellation
//! - `collaborators`: traits for the external fetch/transcribe/metadata tools
//! - `external`: process-backed implementations of those traits
//! - `service`: `TranscriptPipeline`, which composes all of the above

pub mod backoff;
pub mod collaborators;
pub mod external;
pub mod pool;
pub mod queue;
pub mod service;
pub mod timeout;

pub use service::TranscriptPipeline;

/// Scripted collaborators shared by the pipeline, job and handler tests.
#[cfg(test)]
pub mod testing {
    use super::collaborators::{Artifact, Fetcher, MetadataSource, Transcriber, VideoMetadata};
    use super::service::{PipelineSettings, TranscriptPipeline};
    use crate::cache::TranscriptCache;
    use crate::error::{PipelineError, PipelineResult};
    use crate::pipeline::backoff::RetryPolicy;
    use crate::pipeline::pool::ExecutionPool;
    use crate::pipeline::queue::SubmissionQueue;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::sync::Semaphore;
    use tokio_util::sync::CancellationToken;

    /// Fetcher that fails with queued errors first, then writes `audio.m4a`.
    pub struct ScriptedFetcher {
        failures: Mutex<VecDeque<PipelineError>>,
        hang: bool,
        gate: Option<Arc<Semaphore>>,
        pub calls: AtomicUsize,
    }

    impl ScriptedFetcher {
        pub fn succeeding() -> Self {
            Self::with_failures(Vec::new())
        }

        pub fn with_failures(failures: Vec<PipelineError>) -> Self {
            Self {
                failures: Mutex::new(failures.into()),
                hang: false,
                gate: None,
                calls: AtomicUsize::new(0),
            }
        }

        pub fn hanging() -> Self {
            Self {
                hang: true,
                ..Self::succeeding()
            }
        }

        /// Each download waits for one permit on `gate` before finishing.
        pub fn gated(gate: Arc<Semaphore>) -> Self {
            Self {
                gate: Some(gate),
                ..Self::succeeding()
            }
        }
    }

    #[async_trait]
    impl Fetcher for ScriptedFetcher {
        async fn fetch_artifact(
            &self,
            _url: &str,
            dest_dir: &Path,
            cancel: CancellationToken,
        ) -> PipelineResult<Artifact> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.hang {
                cancel.cancelled().await;
                return Err(PipelineError::Cancelled(crate::error::Stage::Fetch));
            }
            if let Some(gate) = &self.gate {
                gate.acquire()
                    .await
                    .map_err(|_| PipelineError::Io("gate closed".into()))?
                    .forget();
            }
            if let Some(err) = self.failures.lock().unwrap().pop_front() {
                return Err(err);
            }
            let path = dest_dir.join("audio.m4a");
            std::fs::write(&path, b"fake audio")?;
            Ok(Artifact::new(path))
        }
    }

    /// Transcriber returning fixed text, or a fixed failure.
    pub struct StaticTranscriber {
        outcome: PipelineResult<String>,
        pub calls: AtomicUsize,
    }

    impl StaticTranscriber {
        pub fn new(text: &str) -> Self {
            Self {
                outcome: Ok(text.to_string()),
                calls: AtomicUsize::new(0),
            }
        }

        pub fn failing(message: &str) -> Self {
            Self {
                outcome: Err(PipelineError::TransformFailure(message.to_string())),
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl Transcriber for StaticTranscriber {
        async fn transcribe(&self, _artifact: &Artifact, _cancel: CancellationToken) -> PipelineResult<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.outcome.clone()
        }
    }

    /// Metadata titled after the video id in the URL.
    pub struct StaticMetadata;

    #[async_trait]
    impl MetadataSource for StaticMetadata {
        async fn fetch_metadata(&self, url: &str, _cancel: CancellationToken) -> PipelineResult<VideoMetadata> {
            let id = url.rsplit("v=").next().unwrap_or(url);
            Ok(VideoMetadata {
                title: Some(format!("Video {}", id)),
                author: Some("Test channel".to_string()),
                source_url: Some(url.to_string()),
                date: None,
            })
        }
    }

    pub struct FailingMetadata;

    #[async_trait]
    impl MetadataSource for FailingMetadata {
        async fn fetch_metadata(&self, _url: &str, _cancel: CancellationToken) -> PipelineResult<VideoMetadata> {
            Err(PipelineError::FatalTransport("metadata unavailable".into()))
        }
    }

    /// Keeps the cache and scratch directories alive for the test's duration.
    pub struct TestDirs {
        pub cache: TempDir,
        pub work: TempDir,
    }

    /// A pipeline with no queue spacing, fast retries and short timeouts.
    pub fn test_pipeline(
        fetcher: Arc<dyn Fetcher>,
        transcriber: Arc<dyn Transcriber>,
        metadata: Option<Arc<dyn MetadataSource>>,
    ) -> (TranscriptPipeline, TestDirs) {
        let dirs = TestDirs {
            cache: tempfile::tempdir().unwrap(),
            work: tempfile::tempdir().unwrap(),
        };
        let cache = Arc::new(TranscriptCache::new(
            dirs.cache.path(),
            Duration::from_secs(3600),
            10 * 1024 * 1024,
        ));
        let settings = PipelineSettings {
            work_dir: dirs.work.path().to_path_buf(),
            fetch_retry: RetryPolicy::new(3, Duration::from_millis(100), Duration::from_secs(1)),
            fetch_timeout: Duration::from_secs(5),
            transcribe_retry: RetryPolicy::none(),
            transcribe_timeout: Duration::from_secs(30),
            metadata_timeout: Duration::from_secs(1),
        };
        let pipeline = TranscriptPipeline::new(
            cache,
            SubmissionQueue::new(Duration::ZERO, Duration::ZERO),
            ExecutionPool::new(1),
            fetcher,
            transcriber,
            metadata,
            settings,
            CancellationToken::new(),
        );
        (pipeline, dirs)
    }
}
