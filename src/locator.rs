//! # Video Locator Normalization
//!
//! Turns whatever link a user pasted into the canonical video id used as the
//! cache key and job identity. Pure parsing, no network access.
//!
//! ## Recognised forms:
//! - `https://youtu.be/<id>` (share links, often with `?si=` tracking)
//! - `https://{www.,m.,music.}youtube.com/watch?v=<id>`
//! - `https://www.youtube.com/{shorts,embed,live,v}/<id>`
//!
//! Anything else (other hosts, look-alike domains such as `youtube.be`,
//! missing `v=` parameter, non-http schemes) is rejected with
//! [`PipelineError::InvalidLocator`]. Query parameters other than `v` never
//! influence the result, so `?si=...`, `&t=42s`, `&list=...` are dropped.

use crate::error::{PipelineError, PipelineResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use url::Url;

const MAX_ID_LEN: usize = 64;

const WATCH_HOSTS: &[&str] = &["youtube.com", "www.youtube.com", "m.youtube.com", "music.youtube.com"];
const SHORT_HOST: &str = "youtu.be";
const PATH_FORMS: &[&str] = &["shorts", "embed", "live", "v"];

/// Canonical identifier of a video.
///
/// Only `[A-Za-z0-9_-]` characters are allowed, which also makes the id safe
/// to use as a file name inside the cache directory.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VideoId(String);

impl VideoId {
    /// Validate a raw id string.
    pub fn parse(raw: &str) -> PipelineResult<Self> {
        if raw.is_empty() || raw.len() > MAX_ID_LEN {
            return Err(PipelineError::InvalidLocator(format!(
                "video id must be 1-{} characters",
                MAX_ID_LEN
            )));
        }
        if !raw.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_') {
            return Err(PipelineError::InvalidLocator(format!(
                "video id '{}' contains unsupported characters",
                raw
            )));
        }
        Ok(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The single URL form handed to the fetch and metadata collaborators.
    pub fn canonical_url(&self) -> String {
        format!("https://www.youtube.com/watch?v={}", self.0)
    }
}

impl fmt::Display for VideoId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Parse a free-form locator into its canonical [`VideoId`].
///
/// ## Examples:
/// - `https://youtu.be/ZOYaz3SIjHw?si=0grwE-vtOlULzYHN` → `ZOYaz3SIjHw`
/// - `https://m.youtube.com/watch?v=ZOYaz3SIjHw&t=42s` → `ZOYaz3SIjHw`
pub fn normalize(locator: &str) -> PipelineResult<VideoId> {
    let trimmed = locator.trim();
    if trimmed.is_empty() {
        return Err(PipelineError::InvalidLocator("locator is empty".to_string()));
    }

    let url = Url::parse(trimmed)
        .map_err(|e| PipelineError::InvalidLocator(format!("malformed URL '{}': {}", trimmed, e)))?;

    if url.scheme() != "https" && url.scheme() != "http" {
        return Err(PipelineError::InvalidLocator(format!(
            "unsupported scheme '{}'",
            url.scheme()
        )));
    }

    let host = url
        .host_str()
        .map(|h| h.to_ascii_lowercase())
        .ok_or_else(|| PipelineError::InvalidLocator("URL has no host".to_string()))?;

    let segments = url
        .path_segments()
        .map(|s| s.filter(|seg| !seg.is_empty()).collect::<Vec<_>>())
        .unwrap_or_default();

    if host == SHORT_HOST {
        return match segments.as_slice() {
            [id] => VideoId::parse(id),
            _ => Err(PipelineError::InvalidLocator(format!(
                "share link '{}' does not name a single video",
                trimmed
            ))),
        };
    }

    if !WATCH_HOSTS.contains(&host.as_str()) {
        return Err(PipelineError::InvalidLocator(format!("unsupported host '{}'", host)));
    }

    match segments.as_slice() {
        ["watch"] => {
            let id = url
                .query_pairs()
                .find(|(key, _)| key == "v")
                .map(|(_, value)| value.into_owned())
                .ok_or_else(|| {
                    PipelineError::InvalidLocator("watch URL is missing the 'v' parameter".to_string())
                })?;
            VideoId::parse(&id)
        }
        [form, id] if PATH_FORMS.contains(form) => VideoId::parse(id),
        _ => Err(PipelineError::InvalidLocator(format!(
            "'{}' is not a video link",
            trimmed
        ))),
    }
}
