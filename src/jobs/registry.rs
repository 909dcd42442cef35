//! # Job Registry
//!
//! Owns every asynchronous job for its whole life: creation, status
//! transitions, lookups and garbage collection.
//!
//! ## State Transitions:
//! ```text
//! queued → downloading → transcribing → ready
//!    │           │              │
//!    └───────────┴──────────────┴──────→ error
//! ```
//! `queued → ready` is also legal: either the cache already had the
//! transcript when the job was created, or it appeared while the job waited.
//! `ready` and `error` are terminal; nothing moves a job out of them.
//!
//! ## Concurrency:
//! The job map sits behind a `tokio::sync::RwLock`. Transitions and the GC
//! sweep both take the write lock, so a sweep never observes a job halfway
//! through a transition. Every transition is also published on a broadcast
//! channel so callers can wait for a job instead of polling it.

use crate::cache::TranscriptCache;
use crate::error::PipelineResult;
use crate::locator::{normalize, VideoId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

const EVENT_CAPACITY: usize = 256;

/// Where a job is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Downloading,
    Transcribing,
    Ready,
    Error,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Ready | JobStatus::Error)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Downloading => "downloading",
            JobStatus::Transcribing => "transcribing",
            JobStatus::Ready => "ready",
            JobStatus::Error => "error",
        }
    }

    /// Whether the state machine allows moving from `self` to `next`.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        use JobStatus::*;
        match (self, next) {
            (Ready, _) | (Error, _) => false,
            (_, Error) => true,
            (Queued, Downloading) | (Queued, Ready) => true,
            (Downloading, Transcribing) => true,
            (Transcribing, Ready) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One unit of asynchronous work.
#[derive(Debug, Clone)]
pub struct Job {
    pub id: String,
    pub locator: String,
    pub video_id: VideoId,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Present only once `status` is `Ready`
    pub result: Option<String>,
    /// Present only once `status` is `Error`
    pub error: Option<String>,
}

impl Job {
    fn progress(&self) -> JobProgress {
        JobProgress {
            id: self.id.clone(),
            locator: self.locator.clone(),
            video_id: self.video_id.clone(),
            status: self.status,
            error: self.error.clone(),
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

/// Public view of a job: everything except the result text.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobProgress {
    pub id: String,
    pub locator: String,
    pub video_id: VideoId,
    pub status: JobStatus,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Published on every status change.
#[derive(Debug, Clone, PartialEq)]
pub struct JobEvent {
    pub job_id: String,
    pub status: JobStatus,
}

/// Why `result` could not return text.
#[derive(Debug, Clone, PartialEq)]
pub enum JobLookupError {
    NotFound,
    /// The job exists but is not `Ready` (it may be still running or failed)
    NotReady(JobProgress),
}

/// Number of jobs per status, for the health endpoint.
#[derive(Debug, Default, Clone, PartialEq, Serialize)]
pub struct JobCounts {
    pub queued: usize,
    pub downloading: usize,
    pub transcribing: usize,
    pub ready: usize,
    pub error: usize,
    pub total: usize,
}

/// In-memory job table plus the FIFO feeding the executor.
pub struct JobRegistry {
    jobs: RwLock<HashMap<String, Job>>,
    cache: Arc<TranscriptCache>,
    queue_tx: mpsc::UnboundedSender<String>,
    events: broadcast::Sender<JobEvent>,
    ttl: Duration,
}

impl JobRegistry {
    /// Create a registry. The returned receiver yields job ids in creation
    /// order and belongs to the executor.
    pub fn new(cache: Arc<TranscriptCache>, ttl: Duration) -> (Arc<Self>, mpsc::UnboundedReceiver<String>) {
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let registry = Arc::new(Self {
            jobs: RwLock::new(HashMap::new()),
            cache,
            queue_tx,
            events,
            ttl,
        });
        (registry, queue_rx)
    }

    /// Register a new job for `locator`.
    ///
    /// Invalid locators are rejected before anything is stored. On a cache
    /// hit the job is born `Ready`; otherwise it is `Queued` and handed to
    /// the executor.
    pub async fn create(&self, locator: &str) -> PipelineResult<JobProgress> {
        let video_id = normalize(locator)?;
        let cached = self.cache.get(&video_id).await;

        let now = Utc::now();
        let status = if cached.is_some() { JobStatus::Ready } else { JobStatus::Queued };
        let job = Job {
            id: Uuid::new_v4().to_string(),
            locator: locator.to_string(),
            video_id,
            status,
            created_at: now,
            updated_at: now,
            result: cached,
            error: None,
        };
        let progress = job.progress();

        self.jobs.write().await.insert(job.id.clone(), job);
        info!(job_id = %progress.id, video_id = %progress.video_id, status = %status, "Job created");

        self.publish(&progress.id, status);

        if status == JobStatus::Queued && self.queue_tx.send(progress.id.clone()).is_err() {
            warn!(job_id = %progress.id, "Job executor is gone, failing job");
            self.fail(&progress.id, "job executor is not running").await;
            return self.status(&progress.id).await.ok_or_else(|| {
                crate::error::PipelineError::Io("job vanished right after creation".to_string())
            });
        }

        Ok(progress)
    }

    pub async fn status(&self, id: &str) -> Option<JobProgress> {
        self.jobs.read().await.get(id).map(Job::progress)
    }

    /// The finished transcript, or why there is none.
    pub async fn result(&self, id: &str) -> Result<String, JobLookupError> {
        let jobs = self.jobs.read().await;
        let job = jobs.get(id).ok_or(JobLookupError::NotFound)?;
        match (&job.status, &job.result) {
            (JobStatus::Ready, Some(text)) => Ok(text.clone()),
            _ => Err(JobLookupError::NotReady(job.progress())),
        }
    }

    /// Move a job to a non-terminal stage. Returns false if the transition is not allowed.
    pub async fn mark(&self, id: &str, status: JobStatus) -> bool {
        self.transition(id, status, None, None).await
    }

    pub async fn complete(&self, id: &str, text: String) -> bool {
        self.transition(id, JobStatus::Ready, Some(text), None).await
    }

    pub async fn fail(&self, id: &str, error: impl Into<String>) -> bool {
        self.transition(id, JobStatus::Error, None, Some(error.into())).await
    }

    async fn transition(&self, id: &str, next: JobStatus, result: Option<String>, error: Option<String>) -> bool {
        {
            let mut jobs = self.jobs.write().await;
            let Some(job) = jobs.get_mut(id) else {
                warn!(job_id = id, status = %next, "Transition for unknown job ignored");
                return false;
            };
            if !job.status.can_transition_to(next) {
                warn!(job_id = id, from = %job.status, to = %next, "Illegal job transition ignored");
                return false;
            }
            job.status = next;
            job.updated_at = Utc::now();
            if result.is_some() {
                job.result = result;
            }
            if let Some(message) = &error {
                warn!(job_id = id, video_id = %job.video_id, error = %message, "Job failed");
            } else {
                debug!(job_id = id, video_id = %job.video_id, status = %next, "Job status changed");
            }
            job.error = error;
        }
        self.publish(id, next);
        true
    }

    fn publish(&self, id: &str, status: JobStatus) {
        // No subscribers is the normal case.
        let _ = self.events.send(JobEvent {
            job_id: id.to_string(),
            status,
        });
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.events.subscribe()
    }

    /// Wait until job `id` reaches `ready` or `error`. `None` for unknown ids.
    pub async fn wait_for_terminal(&self, id: &str) -> Option<JobProgress> {
        // Subscribe before looking, so a transition in between is not missed.
        let mut events = self.subscribe();
        loop {
            let progress = self.status(id).await?;
            if progress.status.is_terminal() {
                return Some(progress);
            }
            loop {
                match events.recv().await {
                    Ok(event) if event.job_id == id && event.status.is_terminal() => break,
                    Ok(_) => continue,
                    // Missed some events; re-read the job to be sure.
                    Err(broadcast::error::RecvError::Lagged(_)) => break,
                    Err(broadcast::error::RecvError::Closed) => return self.status(id).await,
                }
            }
        }
    }

    /// Internal lookup used by the executor.
    pub(crate) async fn target(&self, id: &str) -> Option<(VideoId, JobStatus)> {
        self.jobs
            .read()
            .await
            .get(id)
            .map(|job| (job.video_id.clone(), job.status))
    }

    pub(crate) fn cache(&self) -> &Arc<TranscriptCache> {
        &self.cache
    }

    /// Forget finished jobs last updated more than the TTL before `now`.
    /// Jobs that are still moving are never removed.
    pub async fn sweep(&self, now: DateTime<Utc>) -> usize {
        let ttl = chrono::Duration::from_std(self.ttl).unwrap_or_else(|_| chrono::Duration::days(365 * 100));
        let mut jobs = self.jobs.write().await;
        let before = jobs.len();
        jobs.retain(|_, job| !job.status.is_terminal() || now - job.updated_at <= ttl);
        let removed = before - jobs.len();
        if removed > 0 {
            info!(removed, remaining = jobs.len(), "Expired jobs collected");
        }
        removed
    }

    pub async fn counts(&self) -> JobCounts {
        let jobs = self.jobs.read().await;
        let mut counts = JobCounts {
            total: jobs.len(),
            ..JobCounts::default()
        };
        for job in jobs.values() {
            match job.status {
                JobStatus::Queued => counts.queued += 1,
                JobStatus::Downloading => counts.downloading += 1,
                JobStatus::Transcribing => counts.transcribing += 1,
                JobStatus::Ready => counts.ready += 1,
                JobStatus::Error => counts.error += 1,
            }
        }
        counts
    }
}

/// Run the job GC every `interval` until `shutdown` fires.
pub fn spawn_gc(registry: Arc<JobRegistry>, interval: Duration, shutdown: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    registry.sweep(Utc::now()).await;
                }
            }
        }
        debug!("Job GC stopped");
    })
}
