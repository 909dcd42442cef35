//! # Error Handling
//!
//! Two layers of errors live here:
//!
//! - [`PipelineError`]: what can go wrong while turning a video reference into a
//!   transcript (bad locator, upstream throttling, stage timeouts, whisper crashes).
//!   The retry wrapper inspects these variants to decide whether another attempt
//!   is worthwhile.
//! - [`AppError`]: what an HTTP client sees. Every handler returns
//!   `Result<HttpResponse, AppError>` and actix turns the error into a JSON body.
//!
//! ## Key Rust Concepts:
//! - **Enums with data**: each variant carries the context needed to describe the failure
//! - **From trait**: lets `?` convert a pipeline failure into an HTTP error automatically
//! - **ResponseError trait**: actix calls `error_response` for any handler error

use actix_web::{HttpResponse, ResponseError};
use serde_json::json;
use std::fmt;
use std::time::Duration;

/// The pipeline stage an error or timeout belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// Downloading the media artifact from upstream
    Fetch,
    /// Running the external speech-to-text process
    Transcribe,
    /// Best-effort title/author lookup
    Metadata,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Fetch => "download",
            Stage::Transcribe => "transcription",
            Stage::Metadata => "metadata",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failures produced while normalizing, fetching or transcribing.
///
/// ## Retry classification:
/// Only `RetriableTransport` is treated as transient by the fetch stage.
/// Everything else propagates on the first occurrence.
#[derive(Debug, Clone, PartialEq)]
pub enum PipelineError {
    /// The locator is not a recognised video reference (client error, never retried)
    InvalidLocator(String),

    /// Rate limited, connection reset or connection timeout upstream
    RetriableTransport(String),

    /// Any other failure reported by the fetch collaborator
    FatalTransport(String),

    /// A stage exceeded its duration budget and was cancelled
    OperationTimedOut { stage: Stage, after: Duration },

    /// The external transcription process exited abnormally
    TransformFailure(String),

    /// The retry budget was consumed; `last` is the final attempt's error
    RetriesExhausted { attempts: u32, last: Box<PipelineError> },

    /// The stage was aborted by a cancellation signal (shutdown)
    Cancelled(Stage),

    /// Local filesystem trouble (work directories, reading tool output)
    Io(String),
}

impl PipelineError {
    /// Whether the fetch stage may retry after this error.
    pub fn is_retriable(&self) -> bool {
        matches!(self, PipelineError::RetriableTransport(_))
    }

    /// Client input errors map to 400, everything else is a server-side failure.
    pub fn is_client_error(&self) -> bool {
        matches!(self, PipelineError::InvalidLocator(_))
    }
}

impl fmt::Display for PipelineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineError::InvalidLocator(msg) => write!(f, "Invalid locator: {}", msg),
            PipelineError::RetriableTransport(msg) => write!(f, "Transient transport error: {}", msg),
            PipelineError::FatalTransport(msg) => write!(f, "Transport error: {}", msg),
            PipelineError::OperationTimedOut { stage, after } => {
                write!(f, "{} timed out after {:.1}s", stage, after.as_secs_f64())
            }
            PipelineError::TransformFailure(msg) => write!(f, "Transcription failed: {}", msg),
            PipelineError::RetriesExhausted { attempts, last } => {
                write!(f, "Gave up after {} attempts: {}", attempts, last)
            }
            PipelineError::Cancelled(stage) => write!(f, "{} cancelled", stage),
            PipelineError::Io(msg) => write!(f, "I/O error: {}", msg),
        }
    }
}

impl std::error::Error for PipelineError {}

impl From<std::io::Error> for PipelineError {
    fn from(err: std::io::Error) -> Self {
        PipelineError::Io(err.to_string())
    }
}

/// Errors returned from HTTP handlers.
///
/// ## Error Categories:
/// - **Internal**: pipeline or server failures (500)
/// - **BadRequest**: missing or malformed input (400)
/// - **NotFound**: unknown job id (404)
/// - **ValidationError**: input failed validation rules (400)
#[derive(Debug)]
pub enum AppError {
    Internal(String),
    BadRequest(String),
    NotFound(String),
    ValidationError(String),
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::Internal(msg) => write!(f, "Internal error: {}", msg),
            AppError::BadRequest(msg) => write!(f, "Bad request: {}", msg),
            AppError::NotFound(msg) => write!(f, "Not found: {}", msg),
            AppError::ValidationError(msg) => write!(f, "Validation error: {}", msg),
        }
    }
}

/// Converts errors into JSON HTTP responses.
///
/// ## JSON Response Format:
/// ```json
/// {
///   "error": {
///     "type": "bad_request",
///     "message": "Invalid locator: unsupported host example.com",
///     "timestamp": "2025-01-01T12:00:00Z"
///   }
/// }
/// ```
impl ResponseError for AppError {
    fn status_code(&self) -> actix_web::http::StatusCode {
        use actix_web::http::StatusCode;
        match self {
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::BadRequest(_) | AppError::ValidationError(_) => StatusCode::BAD_REQUEST,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
        }
    }

    fn error_response(&self) -> HttpResponse {
        let (error_type, message) = match self {
            AppError::Internal(msg) => ("internal_error", msg),
            AppError::BadRequest(msg) => ("bad_request", msg),
            AppError::NotFound(msg) => ("not_found", msg),
            AppError::ValidationError(msg) => ("validation_error", msg),
        };

        HttpResponse::build(self.status_code()).json(json!({
            "error": {
                "type": error_type,
                "message": message,
                "timestamp": chrono::Utc::now().to_rfc3339()
            }
        }))
    }
}

/// Pipeline failures keep their human-readable description; only a bad
/// locator is the client's fault.
impl From<PipelineError> for AppError {
    fn from(err: PipelineError) -> Self {
        if err.is_client_error() {
            AppError::BadRequest(err.to_string())
        } else {
            AppError::Internal(err.to_string())
        }
    }
}

/// Shorthand for `Result<T, AppError>`.
pub type AppResult<T> = Result<T, AppError>;

/// Shorthand for `Result<T, PipelineError>`.
pub type PipelineResult<T> = Result<T, PipelineError>;
