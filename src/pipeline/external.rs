//! # External Tool Collaborators
//!
//! Production implementations of the collaborator traits, each one a thin
//! wrapper around a command-line tool:
//!
//! - [`CommandFetcher`]: yt-dlp compatible downloader (audio only)
//! - [`CommandMetadata`]: the same downloader in `--dump-single-json` mode
//! - [`WhisperTranscriber`]: openai-whisper compatible CLI writing a `.txt` file
//!
//! ## Process lifetime:
//! Children are spawned with `kill_on_drop(true)`. Cancelling the token (or a
//! stage timeout dropping the future) therefore kills the process instead of
//! leaving it running in the background.

use crate::config::{AppConfig, FetchConfig, TranscribeConfig};
use crate::error::{PipelineError, PipelineResult, Stage};
use crate::pipeline::collaborators::{Artifact, Fetcher, MetadataSource, Transcriber, VideoMetadata};
use async_trait::async_trait;
use chrono::NaiveDate;
use serde::Deserialize;
use std::path::Path;
use std::process::{Output, Stdio};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Keep error messages readable: only the end of stderr is reported.
const STDERR_TAIL_CHARS: usize = 600;

/// Why a command did not produce a successful exit.
#[derive(Debug)]
enum CommandFailure {
    /// The program could not be started at all
    Spawn(std::io::Error),
    /// The program ran and exited unsuccessfully
    Exit { code: Option<i32>, stderr: String },
    Cancelled,
}

/// Spawn `program args...`, wait for it, and kill it if `cancel` fires first.
async fn run_command(program: &str, args: &[String], cancel: &CancellationToken) -> Result<Output, CommandFailure> {
    debug!(program, ?args, "Spawning external process");
    let child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(CommandFailure::Spawn)?;

    // `wait_with_output` owns the child; dropping it on cancellation kills the process.
    let output = tokio::select! {
        output = child.wait_with_output() => output.map_err(CommandFailure::Spawn)?,
        _ = cancel.cancelled() => return Err(CommandFailure::Cancelled),
    };

    if output.status.success() {
        Ok(output)
    } else {
        Err(CommandFailure::Exit {
            code: output.status.code(),
            stderr: stderr_tail(&output.stderr),
        })
    }
}

fn stderr_tail(stderr: &[u8]) -> String {
    let text = String::from_utf8_lossy(stderr);
    let text = text.trim();
    let count = text.chars().count();
    if count <= STDERR_TAIL_CHARS {
        text.to_string()
    } else {
        text.chars().skip(count - STDERR_TAIL_CHARS).collect()
    }
}

/// Decide whether downloader stderr describes a transient upstream condition.
pub fn classify_fetch_failure(message: &str, retriable_patterns: &[String]) -> PipelineError {
    let lowered = message.to_lowercase();
    let transient = retriable_patterns
        .iter()
        .any(|pattern| !pattern.is_empty() && lowered.contains(&pattern.to_lowercase()));
    if transient {
        PipelineError::RetriableTransport(message.to_string())
    } else {
        PipelineError::FatalTransport(message.to_string())
    }
}

fn describe_exit(program: &str, code: Option<i32>, stderr: &str) -> String {
    let status = code.map(|c| c.to_string()).unwrap_or_else(|| "signal".to_string());
    if stderr.is_empty() {
        format!("{} exited with status {}", program, status)
    } else {
        format!("{} exited with status {}: {}", program, status, stderr)
    }
}

/// Audio downloader backed by a yt-dlp compatible executable.
pub struct CommandFetcher {
    program: String,
    retriable_patterns: Vec<String>,
}

impl CommandFetcher {
    pub fn new(config: &FetchConfig) -> Self {
        Self {
            program: config.program.clone(),
            retriable_patterns: config.retriable_patterns.clone(),
        }
    }

    fn args(&self, url: &str, dest_dir: &Path) -> Vec<String> {
        vec![
            "--no-playlist".to_string(),
            "--no-progress".to_string(),
            "-f".to_string(),
            "bestaudio/best".to_string(),
            "-o".to_string(),
            dest_dir.join("audio.%(ext)s").to_string_lossy().into_owned(),
            url.to_string(),
        ]
    }
}

#[async_trait]
impl Fetcher for CommandFetcher {
    async fn fetch_artifact(&self, url: &str, dest_dir: &Path, cancel: CancellationToken) -> PipelineResult<Artifact> {
        match run_command(&self.program, &self.args(url, dest_dir), &cancel).await {
            Ok(_) => {}
            Err(CommandFailure::Spawn(e)) => {
                return Err(PipelineError::FatalTransport(format!("could not run {}: {}", self.program, e)))
            }
            Err(CommandFailure::Exit { code, stderr }) => {
                return Err(classify_fetch_failure(
                    &describe_exit(&self.program, code, &stderr),
                    &self.retriable_patterns,
                ))
            }
            Err(CommandFailure::Cancelled) => return Err(PipelineError::Cancelled(Stage::Fetch)),
        }

        find_downloaded_audio(dest_dir).await
    }
}

/// The downloader picks the extension; find whatever `audio.*` it produced.
async fn find_downloaded_audio(dir: &Path) -> PipelineResult<Artifact> {
    let mut entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        let is_audio = path.file_stem().map(|stem| stem == "audio").unwrap_or(false)
            && path.extension().map(|ext| ext != "part" && ext != "txt").unwrap_or(false);
        if is_audio {
            return Ok(Artifact::new(path));
        }
    }
    Err(PipelineError::FatalTransport(
        "downloader finished without producing an audio file".to_string(),
    ))
}

/// The subset of the downloader's JSON dump we care about.
#[derive(Debug, Deserialize)]
struct DumpedInfo {
    title: Option<String>,
    uploader: Option<String>,
    channel: Option<String>,
    webpage_url: Option<String>,
    upload_date: Option<String>,
}

impl From<DumpedInfo> for VideoMetadata {
    fn from(info: DumpedInfo) -> Self {
        VideoMetadata {
            title: info.title,
            author: info.uploader.or(info.channel),
            source_url: info.webpage_url,
            date: info
                .upload_date
                .and_then(|raw| NaiveDate::parse_from_str(&raw, "%Y%m%d").ok()),
        }
    }
}

/// Parse the downloader's `--dump-single-json` output.
pub fn parse_metadata_dump(json: &[u8]) -> PipelineResult<VideoMetadata> {
    serde_json::from_slice::<DumpedInfo>(json)
        .map(VideoMetadata::from)
        .map_err(|e| PipelineError::FatalTransport(format!("unreadable metadata: {}", e)))
}

/// Metadata lookup through the downloader's JSON dump mode.
pub struct CommandMetadata {
    program: String,
    retriable_patterns: Vec<String>,
}

impl CommandMetadata {
    pub fn new(config: &FetchConfig) -> Self {
        Self {
            program: config.program.clone(),
            retriable_patterns: config.retriable_patterns.clone(),
        }
    }
}

#[async_trait]
impl MetadataSource for CommandMetadata {
    async fn fetch_metadata(&self, url: &str, cancel: CancellationToken) -> PipelineResult<VideoMetadata> {
        let args = vec![
            "--dump-single-json".to_string(),
            "--skip-download".to_string(),
            "--no-playlist".to_string(),
            url.to_string(),
        ];
        match run_command(&self.program, &args, &cancel).await {
            Ok(output) => parse_metadata_dump(&output.stdout),
            Err(CommandFailure::Spawn(e)) => {
                Err(PipelineError::FatalTransport(format!("could not run {}: {}", self.program, e)))
            }
            Err(CommandFailure::Exit { code, stderr }) => Err(classify_fetch_failure(
                &describe_exit(&self.program, code, &stderr),
                &self.retriable_patterns,
            )),
            Err(CommandFailure::Cancelled) => Err(PipelineError::Cancelled(Stage::Metadata)),
        }
    }
}

/// Speech-to-text through an openai-whisper compatible CLI.
///
/// The tool writes `<stem>.txt` next to the input; that file is the result.
pub struct WhisperTranscriber {
    program: String,
    model: String,
    language: Option<String>,
}

impl WhisperTranscriber {
    pub fn new(config: &TranscribeConfig) -> Self {
        Self {
            program: config.program.clone(),
            model: config.model.clone(),
            language: config.language.clone(),
        }
    }

    fn args(&self, artifact: &Artifact) -> Vec<String> {
        let mut args = vec![
            artifact.path.to_string_lossy().into_owned(),
            "--model".to_string(),
            self.model.clone(),
            "--output_format".to_string(),
            "txt".to_string(),
            "--output_dir".to_string(),
            artifact.dir().to_string_lossy().into_owned(),
        ];
        if let Some(language) = &self.language {
            args.push("--language".to_string());
            args.push(language.clone());
        }
        args
    }
}

#[async_trait]
impl Transcriber for WhisperTranscriber {
    async fn transcribe(&self, artifact: &Artifact, cancel: CancellationToken) -> PipelineResult<String> {
        match run_command(&self.program, &self.args(artifact), &cancel).await {
            Ok(_) => {}
            Err(CommandFailure::Spawn(e)) => {
                return Err(PipelineError::TransformFailure(format!("could not run {}: {}", self.program, e)))
            }
            Err(CommandFailure::Exit { code, stderr }) => {
                return Err(PipelineError::TransformFailure(describe_exit(&self.program, code, &stderr)))
            }
            Err(CommandFailure::Cancelled) => return Err(PipelineError::Cancelled(Stage::Transcribe)),
        }

        let stem = artifact
            .path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "audio".to_string());
        let output_path = artifact.dir().join(format!("{}.txt", stem));
        let text = tokio::fs::read_to_string(&output_path).await.map_err(|e| {
            PipelineError::TransformFailure(format!("missing transcript {}: {}", output_path.display(), e))
        })?;
        Ok(text.trim().to_string())
    }
}

/// Build the production collaborators from configuration.
pub fn from_config(
    config: &AppConfig,
) -> (
    std::sync::Arc<dyn Fetcher>,
    std::sync::Arc<dyn Transcriber>,
    Option<std::sync::Arc<dyn MetadataSource>>,
) {
    let metadata: Option<std::sync::Arc<dyn MetadataSource>> = if config.metadata.enabled {
        Some(std::sync::Arc::new(CommandMetadata::new(&config.fetch)))
    } else {
        None
    };
    (
        std::sync::Arc::new(CommandFetcher::new(&config.fetch)),
        std::sync::Arc::new(WhisperTranscriber::new(&config.transcribe)),
        metadata,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn patterns() -> Vec<String> {
        crate::config::AppConfig::default().fetch.retriable_patterns
    }

    #[test]
    fn test_classifies_rate_limits_and_resets_as_transient() {
        for message in [
            "ERROR: unable to download video data: HTTP Error 429: Too Many Requests",
            "ERROR: [Errno 104] Connection reset by peer",
            "ERROR: Read timed out.",
        ] {
            assert!(classify_fetch_failure(message, &patterns()).is_retriable(), "{}", message);
        }
    }

    #[test]
    fn test_classifies_other_failures_as_fatal() {
        let err = classify_fetch_failure("ERROR: [youtube] abc123: Video unavailable", &patterns());
        assert!(matches!(err, PipelineError::FatalTransport(_)));
    }

    /// Stderr echoes the video id, so an id that happens to contain a status
    /// code must not make a removed video look rate limited.
    #[test]
    fn test_status_code_inside_video_id_stays_fatal() {
        let message = describe_exit(
            "yt-dlp",
            Some(1),
            "ERROR: [youtube] x4291AbCdEf: Video unavailable. This video has been removed",
        );
        let err = classify_fetch_failure(&message, &patterns());
        assert!(matches!(err, PipelineError::FatalTransport(_)), "{:?}", err);
    }

    #[test]
    fn test_parses_metadata_dump() {
        let json = br#"{
            "id": "abc123",
            "title": "Ask not",
            "uploader": "JFK Library",
            "webpage_url": "https://www.youtube.com/watch?v=abc123",
            "upload_date": "19610120",
            "duration": 900
        }"#;
        let metadata = parse_metadata_dump(json).unwrap();
        assert_eq!(metadata.title.as_deref(), Some("Ask not"));
        assert_eq!(metadata.author.as_deref(), Some("JFK Library"));
        assert_eq!(metadata.date, NaiveDate::from_ymd_opt(1961, 1, 20));
    }

    #[test]
    fn test_metadata_dump_falls_back_to_channel() {
        let metadata = parse_metadata_dump(br#"{"channel": "Some channel", "upload_date": "bad"}"#).unwrap();
        assert_eq!(metadata.author.as_deref(), Some("Some channel"));
        assert_eq!(metadata.date, None);
    }

    #[test]
    fn test_stderr_tail_keeps_the_end() {
        let long = format!("{}END", "x".repeat(STDERR_TAIL_CHARS * 2));
        let tail = stderr_tail(long.as_bytes());
        assert_eq!(tail.chars().count(), STDERR_TAIL_CHARS);
        assert!(tail.ends_with("END"));
    }

    #[tokio::test]
    async fn test_missing_program_is_fatal_not_retriable() {
        let mut config = crate::config::AppConfig::default().fetch;
        config.program = "definitely-not-a-real-downloader-binary".to_string();
        let fetcher = CommandFetcher::new(&config);
        let dir = tempfile::tempdir().unwrap();

        let err = fetcher
            .fetch_artifact("https://www.youtube.com/watch?v=abc123", dir.path(), CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::FatalTransport(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_cancellation_stops_a_running_process() {
        let token = CancellationToken::new();
        let trigger = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let started = std::time::Instant::now();
        let result = run_command("sleep", &["30".to_string()], &token).await;
        assert!(matches!(result, Err(CommandFailure::Cancelled)));
        assert!(started.elapsed() < std::time::Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_finds_downloaded_audio_by_stem() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("audio.webm.part"), b"partial").unwrap();
        std::fs::write(dir.path().join("audio.m4a"), b"data").unwrap();

        let artifact = find_downloaded_audio(dir.path()).await.unwrap();
        assert_eq!(artifact.path, dir.path().join("audio.m4a"));
    }
}
