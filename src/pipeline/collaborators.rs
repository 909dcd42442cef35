//! # Pipeline Collaborators
//!
//! The orchestration core talks to the outside world through three traits.
//! Production implementations shell out to external tools (see
//! [`super::external`]); tests plug in scripted fakes.
//!
//! Every call receives a [`CancellationToken`]. Implementations that start a
//! process must stop it when the token fires, not just stop waiting for it.

use crate::error::PipelineResult;
use async_trait::async_trait;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;

/// A downloaded media file on local disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    pub path: PathBuf,
}

impl Artifact {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Directory the transcriber may write its output into.
    pub fn dir(&self) -> &Path {
        self.path.parent().unwrap_or_else(|| Path::new("."))
    }
}

/// Descriptive information about a video. Every field is optional.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoMetadata {
    pub title: Option<String>,
    pub author: Option<String>,
    pub source_url: Option<String>,
    pub date: Option<NaiveDate>,
}

impl VideoMetadata {
    pub fn is_empty(&self) -> bool {
        self.title.is_none() && self.author.is_none() && self.source_url.is_none() && self.date.is_none()
    }

    /// Header lines prepended to a transcript, or an empty string when nothing is known.
    ///
    /// ```text
    /// Title: Some talk
    /// Author: Some channel
    /// Source: https://www.youtube.com/watch?v=abc123
    /// Date: 2024-05-01
    ///
    /// ```
    pub fn header(&self) -> String {
        if self.is_empty() {
            return String::new();
        }
        let mut header = String::new();
        if let Some(title) = &self.title {
            header.push_str(&format!("Title: {}\n", title));
        }
        if let Some(author) = &self.author {
            header.push_str(&format!("Author: {}\n", author));
        }
        if let Some(source) = &self.source_url {
            header.push_str(&format!("Source: {}\n", source));
        }
        if let Some(date) = &self.date {
            header.push_str(&format!("Date: {}\n", date.format("%Y-%m-%d")));
        }
        header.push('\n');
        header
    }
}

/// Downloads the media for a canonical video URL into `dest_dir`.
///
/// Errors must be classified: `RetriableTransport` for throttling, resets and
/// connection timeouts, `FatalTransport` for everything else.
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch_artifact(
        &self,
        url: &str,
        dest_dir: &Path,
        cancel: CancellationToken,
    ) -> PipelineResult<Artifact>;
}

/// Turns a media file into plain text. Fails with `TransformFailure`.
#[async_trait]
pub trait Transcriber: Send + Sync {
    async fn transcribe(&self, artifact: &Artifact, cancel: CancellationToken) -> PipelineResult<String>;
}

/// Best-effort metadata lookup. Callers swallow its errors.
#[async_trait]
pub trait MetadataSource: Send + Sync {
    async fn fetch_metadata(&self, url: &str, cancel: CancellationToken) -> PipelineResult<VideoMetadata>;
}
