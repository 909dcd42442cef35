//! # Configuration Management
//!
//! This module handles loading and managing application configuration from multiple sources:
//! - TOML configuration files (config.toml)
//! - Environment variables (with APP_ prefix, `__` between nested keys)
//! - Default values (built into the code)
//!
//! ## Configuration Priority (highest to lowest):
//! 1. Deployment shortcuts (HOST, PORT, CACHE_DIR, JOB_SKIP)
//! 2. Environment variables (APP_SERVER__PORT, APP_CACHE__TTL_SECS, etc.)
//! 3. Configuration file (config.toml)
//! 4. Default values (defined in the Default impl)
//!
//! ## Why `__` as the separator:
//! Most keys contain underscores themselves (`min_gap_ms`, `ttl_secs`), so a single
//! underscore cannot tell `APP_CACHE_TTL_SECS` apart from a nested `cache.ttl.secs`.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Main application configuration that contains all settings.
///
/// ## Sections:
/// - `server`: where the HTTP listener binds
/// - `queue`: spacing between upstream submissions
/// - `cache`: on-disk transcript cache
/// - `fetch`: media download stage
/// - `transcribe`: speech-to-text stage
/// - `metadata`: optional title/author lookup
/// - `jobs`: asynchronous job registry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub queue: QueueConfig,
    pub cache: CacheConfig,
    pub fetch: FetchConfig,
    pub transcribe: TranscribeConfig,
    pub metadata: MetadataConfig,
    pub jobs: JobsConfig,
}

/// Server-specific configuration settings.
///
/// ## Common values:
/// - `host = "127.0.0.1"`: Only accept connections from localhost (development)
/// - `host = "0.0.0.0"`: Accept connections from any IP address (production)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Rate-limited submission queue settings.
///
/// After each upstream submission the queue waits `min_gap_ms ± jitter_ms`
/// before starting the next one (only when more work is waiting).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    pub min_gap_ms: u64,
    pub jitter_ms: u64,
}

/// Transcript cache settings.
///
/// ## Fields:
/// - `dir`: directory holding one `<video id>.txt` file per transcript
/// - `ttl_secs`: entries older than this are treated as missing
/// - `max_bytes`: total size budget enforced by the periodic sweep
/// - `sweep_interval_secs`: how often the sweep runs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    pub dir: PathBuf,
    pub ttl_secs: u64,
    pub max_bytes: u64,
    pub sweep_interval_secs: u64,
}

/// Media download stage settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchConfig {
    /// Downloader executable (yt-dlp compatible command line)
    pub program: String,
    /// Parent directory for per-job scratch directories
    pub work_dir: PathBuf,
    /// Retries after the first attempt for transient failures
    pub retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Per-attempt download budget
    pub timeout_secs: u64,
    /// Case-insensitive stderr fragments that mark a failure as transient
    pub retriable_patterns: Vec<String>,
}

/// Speech-to-text stage settings.
///
/// ## Model size trade-offs:
/// - Smaller models ("tiny", "base"): faster, less accurate
/// - Larger models ("medium", "large"): slower, more accurate
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscribeConfig {
    /// Transcriber executable (openai-whisper compatible command line)
    pub program: String,
    pub model: String,
    /// Optional language hint passed to the transcriber
    pub language: Option<String>,
    /// Retries after the first attempt, only for transcriber failures
    pub retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub timeout_secs: u64,
    /// Maximum transcriber processes running at once
    pub concurrency: usize,
}

/// Metadata lookup settings. Failures here never fail a request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetadataConfig {
    pub enabled: bool,
    pub timeout_secs: u64,
}

/// Job registry settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobsConfig {
    /// Finished jobs are forgotten this long after their last update
    pub ttl_secs: u64,
    pub gc_interval_secs: u64,
    /// Pause between two jobs in the executor
    pub cooldown_ms: u64,
    /// When false, jobs are accepted but never picked up (used by tests)
    pub executor_enabled: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 3001,
            },
            queue: QueueConfig {
                min_gap_ms: 5_000,
                jitter_ms: 2_000,
            },
            cache: CacheConfig {
                dir: PathBuf::from("cache"),
                ttl_secs: 7 * 24 * 60 * 60,
                max_bytes: 100 * 1024 * 1024,
                sweep_interval_secs: 60 * 60,
            },
            fetch: FetchConfig {
                program: "yt-dlp".to_string(),
                work_dir: env::temp_dir(),
                retries: 3,
                base_delay_ms: 1_000,
                max_delay_ms: 30_000,
                timeout_secs: 5 * 60,
                retriable_patterns: vec![
                    "HTTP Error 429".to_string(),
                    "too many requests".to_string(),
                    "connection reset".to_string(),
                    "timed out".to_string(),
                ],
            },
            transcribe: TranscribeConfig {
                program: "whisper".to_string(),
                model: "tiny".to_string(),
                language: None,
                retries: 0,
                base_delay_ms: 5_000,
                max_delay_ms: 60_000,
                timeout_secs: 30 * 60,
                concurrency: 1,
            },
            metadata: MetadataConfig {
                enabled: true,
                timeout_secs: 30,
            },
            jobs: JobsConfig {
                ttl_secs: 60 * 60,
                gc_interval_secs: 5 * 60,
                cooldown_ms: 1_000,
                executor_enabled: true,
            },
        }
    }
}

impl AppConfig {
    /// Load configuration from multiple sources in priority order.
    ///
    /// ## Environment Variable Examples:
    /// - `APP_SERVER__PORT=3000`: Override server port
    /// - `APP_TRANSCRIBE__MODEL=base`: Use a bigger whisper model
    /// - `APP_QUEUE__MIN_GAP_MS=8000`: Space upstream requests further apart
    /// - `APP_FETCH__RETRIABLE_PATTERNS="HTTP Error 429,quota exceeded"`: Comma-separated list
    /// - `PORT=3000`, `HOST=0.0.0.0`: Deployment platform conventions
    /// - `CACHE_DIR=/var/cache/transcripts`: Move the transcript cache
    /// - `JOB_SKIP=1`: Accept jobs without running them
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            .add_source(environment());

        if let Ok(host) = env::var("HOST") {
            settings = settings.set_override("server.host", host)?;
        }

        if let Ok(port) = env::var("PORT") {
            settings = settings.set_override("server.port", port)?;
        }

        if let Ok(dir) = env::var("CACHE_DIR") {
            settings = settings.set_override("cache.dir", dir)?;
        }

        if env::var("JOB_SKIP").map(|v| !v.is_empty() && v != "0").unwrap_or(false) {
            settings = settings.set_override("jobs.executor_enabled", false)?;
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Validate that the configuration values make sense.
    ///
    /// ## What this checks:
    /// - Server port is not 0
    /// - Jitter cannot push the inter-submission gap below zero
    /// - Every timeout, TTL and interval is non-zero
    /// - At least one transcription may run at a time
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }

        if self.queue.jitter_ms > self.queue.min_gap_ms {
            return Err(anyhow::anyhow!(
                "Queue jitter ({}ms) cannot exceed the minimum gap ({}ms)",
                self.queue.jitter_ms,
                self.queue.min_gap_ms
            ));
        }

        if self.cache.ttl_secs == 0 || self.cache.sweep_interval_secs == 0 {
            return Err(anyhow::anyhow!("Cache TTL and sweep interval must be greater than 0"));
        }

        if self.fetch.timeout_secs == 0 || self.transcribe.timeout_secs == 0 {
            return Err(anyhow::anyhow!("Stage timeouts must be greater than 0"));
        }

        if self.fetch.base_delay_ms > self.fetch.max_delay_ms {
            return Err(anyhow::anyhow!("Fetch base delay cannot exceed the maximum delay"));
        }

        if self.transcribe.base_delay_ms > self.transcribe.max_delay_ms {
            return Err(anyhow::anyhow!("Transcribe base delay cannot exceed the maximum delay"));
        }

        if self.transcribe.concurrency == 0 {
            return Err(anyhow::anyhow!("Transcription concurrency must be greater than 0"));
        }

        if self.metadata.enabled && self.metadata.timeout_secs == 0 {
            return Err(anyhow::anyhow!("Metadata timeout must be greater than 0"));
        }

        if self.jobs.ttl_secs == 0 || self.jobs.gc_interval_secs == 0 {
            return Err(anyhow::anyhow!("Job TTL and GC interval must be greater than 0"));
        }

        Ok(())
    }
}

/// `APP_`-prefixed environment source. List-valued keys are split on commas.
fn environment() -> config::Environment {
    config::Environment::with_prefix("APP")
        .prefix_separator("_")
        .separator("__")
        .try_parsing(true)
        .list_separator(",")
        .with_list_parse_key("fetch.retriable_patterns")
}

impl QueueConfig {
    pub fn min_gap(&self) -> Duration {
        Duration::from_millis(self.min_gap_ms)
    }

    pub fn jitter(&self) -> Duration {
        Duration::from_millis(self.jitter_ms)
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

impl FetchConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl TranscribeConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl MetadataConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl JobsConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn gc_interval(&self) -> Duration {
        Duration::from_secs(self.gc_interval_secs)
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }
}
