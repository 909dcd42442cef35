//! # Job Executor
//!
//! Drains the registry's FIFO one job at a time. For each job:
//!
//! 1. re-check the cache (a duplicate queued behind an identical job finds
//!    the fresh transcript here and skips the pipeline)
//! 2. `downloading`: fetch stage
//! 3. `transcribing`: transcribe stage
//! 4. write the cache, then `ready` with the text attached
//!
//! Any failure ends the job in `error` with the failure's description. After
//! each job the executor pauses for the configured cool-down.

use crate::error::PipelineResult;
use crate::jobs::registry::{JobRegistry, JobStatus};
use crate::locator::VideoId;
use crate::pipeline::TranscriptPipeline;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

pub struct JobExecutor {
    registry: Arc<JobRegistry>,
    pipeline: Arc<TranscriptPipeline>,
    cooldown: Duration,
}

impl JobExecutor {
    pub fn new(registry: Arc<JobRegistry>, pipeline: Arc<TranscriptPipeline>, cooldown: Duration) -> Self {
        Self {
            registry,
            pipeline,
            cooldown,
        }
    }

    /// Start draining `queue` on a background task until `shutdown` fires or
    /// the registry is dropped.
    pub fn spawn(self, mut queue: mpsc::UnboundedReceiver<String>, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                let job_id = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    next = queue.recv() => match next {
                        Some(id) => id,
                        None => break,
                    },
                };

                tokio::select! {
                    _ = shutdown.cancelled() => {
                        self.registry.fail(&job_id, "service is shutting down").await;
                        break;
                    }
                    _ = self.run_job(&job_id) => {}
                }

                if !self.cooldown.is_zero() && !queue.is_empty() {
                    tokio::time::sleep(self.cooldown).await;
                }
            }
            info!("Job executor stopped");
        })
    }

    /// Drive one job to a terminal state.
    pub async fn run_job(&self, job_id: &str) {
        let Some((video_id, status)) = self.registry.target(job_id).await else {
            debug!(job_id, "Queued job no longer exists");
            return;
        };
        if status != JobStatus::Queued {
            debug!(job_id, status = %status, "Skipping job that is not queued");
            return;
        }

        let span = info_span!("job", job_id, video_id = %video_id);
        async {
            if let Some(text) = self.registry.cache().get(&video_id).await {
                info!("Transcript appeared in cache while queued");
                self.registry.complete(job_id, text).await;
                return;
            }

            match self.execute(job_id, &video_id).await {
                Ok(text) => {
                    self.pipeline.cache().put(&video_id, &text).await;
                    self.registry.complete(job_id, text).await;
                    info!("Job finished");
                }
                Err(e) => {
                    warn!(error = %e, "Job failed");
                    self.registry.fail(job_id, e.to_string()).await;
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn execute(&self, job_id: &str, video_id: &VideoId) -> PipelineResult<String> {
        self.registry.mark(job_id, JobStatus::Downloading).await;
        let media = self.pipeline.fetch(video_id).await?;
        debug!(workdir = %media.workdir().display(), "Fetched media ready for transcription");

        self.registry.mark(job_id, JobStatus::Transcribing).await;
        self.pipeline.transcribe(&media).await
    }
}
