//! # Transcript Handlers
//!
//! Synchronous entry points: the caller keeps the connection open until the
//! transcript is ready.
//!
//! ## Available Endpoints:
//! - `POST /transcript` - transcript for a video link (JSON body `{"url": "..."}`)
//! - `PUT /transcript` - transcript for an uploaded media file (multipart field `file`)
//!
//! A link request goes through the job registry like an asynchronous job; the
//! handler just waits for the job to finish. That way both paths share the
//! cache check, the single executor and the same rate limiting.

use crate::error::{AppError, AppResult};
use crate::jobs::JobStatus;
use crate::state::AppState;
use actix_multipart::{Field, Multipart};
use actix_web::{web, HttpResponse};
use futures_util::stream::StreamExt;
use serde::Deserialize;
use std::path::Path;
use tracing::info;

/// Uploads larger than this are rejected before any work starts.
const MAX_UPLOAD_BYTES: usize = 200 * 1024 * 1024;

const UPLOAD_FIELD: &str = "file";

/// Request body shared by `POST /transcript` and `POST /jobs`.
#[derive(Debug, Deserialize)]
pub struct UrlRequest {
    pub url: Option<String>,
}

impl UrlRequest {
    /// The `url` field, or a 400 when it is missing or blank.
    pub fn required_url(&self) -> AppResult<&str> {
        match self.url.as_deref().map(str::trim) {
            Some(url) if !url.is_empty() => Ok(url),
            _ => Err(AppError::BadRequest("url required".to_string())),
        }
    }
}

/// Keeps the waiting-requests gauge right even if the client disconnects.
struct WaitingGuard<'a>(&'a AppState);

impl<'a> WaitingGuard<'a> {
    fn enter(state: &'a AppState) -> Self {
        state.increment_waiting_requests();
        Self(state)
    }
}

impl Drop for WaitingGuard<'_> {
    fn drop(&mut self) {
        self.0.decrement_waiting_requests();
    }
}

/// Transcribe a video link and return the text.
///
/// ## Endpoint: `POST /transcript`
///
/// ## Responses:
/// - `200 text/plain`: the transcript (cached or freshly produced)
/// - `400`: `url` missing or not a recognised video link
/// - `500`: the pipeline failed; the body carries the description
pub async fn create_transcript(
    state: web::Data<AppState>,
    body: web::Json<UrlRequest>,
) -> AppResult<HttpResponse> {
    let url = body.required_url()?;
    info!(url, "Transcript request");

    let job = state.jobs.create(url).await?;
    if job.status != JobStatus::Ready && !state.config.jobs.executor_enabled {
        return Err(AppError::Internal("job execution is disabled".to_string()));
    }

    let finished = {
        let _waiting = WaitingGuard::enter(&state);
        state.jobs.wait_for_terminal(&job.id).await
    };

    match finished {
        Some(progress) if progress.status == JobStatus::Ready => {
            let text = state
                .jobs
                .result(&job.id)
                .await
                .map_err(|_| AppError::Internal("transcript disappeared before it was read".to_string()))?;
            Ok(HttpResponse::Ok().content_type("text/plain; charset=utf-8").body(text))
        }
        Some(progress) => Err(AppError::Internal(
            progress.error.unwrap_or_else(|| "transcription failed".to_string()),
        )),
        None => Err(AppError::Internal("job disappeared before it finished".to_string())),
    }
}

/// Transcribe an uploaded media file.
///
/// ## Endpoint: `PUT /transcript`
///
/// Multipart form data with the media in a field named `file`. Uploads skip
/// the download stage and the cache but still share the transcription pool.
pub async fn upload_transcript(state: web::Data<AppState>, mut payload: Multipart) -> AppResult<HttpResponse> {
    let mut upload: Option<(Vec<u8>, Option<String>)> = None;

    while let Some(item) = payload.next().await {
        let mut field: Field = item.map_err(|e| AppError::BadRequest(format!("Multipart error: {}", e)))?;

        let is_file_field = field
            .content_disposition()
            .and_then(|cd| cd.get_name())
            .map(|name| name == UPLOAD_FIELD)
            .unwrap_or(false);
        if !is_file_field {
            continue;
        }

        let filename = field
            .content_disposition()
            .and_then(|cd| cd.get_filename())
            .map(|s| s.to_string());

        let mut bytes = Vec::new();
        while let Some(chunk) = field.next().await {
            let chunk = chunk.map_err(|e| AppError::BadRequest(format!("Chunk error: {}", e)))?;
            if bytes.len() + chunk.len() > MAX_UPLOAD_BYTES {
                return Err(AppError::ValidationError(format!(
                    "File too large (max: {} bytes)",
                    MAX_UPLOAD_BYTES
                )));
            }
            bytes.extend_from_slice(&chunk);
        }
        upload = Some((bytes, filename));
    }

    let (bytes, filename) = upload.ok_or_else(|| AppError::BadRequest("file required".to_string()))?;
    if bytes.is_empty() {
        return Err(AppError::BadRequest("uploaded file is empty".to_string()));
    }

    let extension = filename
        .as_deref()
        .and_then(|name| Path::new(name).extension())
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase());
    info!(bytes = bytes.len(), filename = ?filename, "Upload transcript request");

    let text = state.pipeline.transcribe_upload(&bytes, extension.as_deref()).await?;
    Ok(HttpResponse::Ok().content_type("text/plain; charset=utf-8").body(text))
}

#[cfg(test)]
mod tests {
    use crate::handlers::routes;
    use crate::jobs::JobExecutor;
    use crate::locator::VideoId;
    use crate::pipeline::testing::{ScriptedFetcher, StaticTranscriber};
    use crate::state::testing::{test_state, test_state_with};
    use actix_web::{http::StatusCode, test, web, App};
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    #[actix_web::test]
    async fn test_requires_url() {
        let (state, _rx, _dirs) = test_state();
        let app = test::init_service(App::new().app_data(web::Data::new(state)).configure(routes)).await;

        let req = test::TestRequest::post().uri("/transcript").set_json(json!({})).to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[actix_web::test]
    async fn test_rejects_invalid_and_lookalike_urls() {
        let (state, _rx, _dirs) = test_state();
        let app = test::init_service(App::new().app_data(web::Data::new(state)).configure(routes)).await;

        for url in ["https://example.com/video", "https://youtube.be/abc123"] {
            let req = test::TestRequest::post()
                .uri("/transcript")
                .set_json(json!({ "url": url }))
                .to_request();
            let resp = test::call_service(&app, req).await;
            assert_eq!(resp.status(), StatusCode::BAD_REQUEST, "{}", url);
        }
    }

    #[actix_web::test]
    async fn test_cached_transcript_is_returned_without_pipeline() {
        let fetcher = Arc::new(ScriptedFetcher::succeeding());
        let (state, _rx, _dirs) = test_state_with(fetcher.clone(), Arc::new(StaticTranscriber::new("unused")));
        state
            .pipeline
            .cache()
            .put(&VideoId::parse("DUMMYID12345").unwrap(), "cached transcript")
            .await;
        let app = test::init_service(App::new().app_data(web::Data::new(state)).configure(routes)).await;

        let req = test::TestRequest::post()
            .uri("/transcript")
            .set_json(json!({ "url": "https://youtu.be/DUMMYID12345?si=tracking" }))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(test::read_body(resp).await, "cached transcript");
        assert_eq!(fetcher.calls.load(std::sync::atomic::Ordering::SeqCst), 0);
    }

    #[actix_web::test]
    async fn test_uncached_transcript_runs_through_executor() {
        let (state, rx, _dirs) = test_state();
        let shutdown = CancellationToken::new();
        JobExecutor::new(state.jobs.clone(), state.pipeline.clone(), Duration::ZERO).spawn(rx, shutdown.clone());
        let app = test::init_service(App::new().app_data(web::Data::new(state.clone())).configure(routes)).await;

        let req = test::TestRequest::post()
            .uri("/transcript")
            .set_json(json!({ "url": "https://www.youtube.com/watch?v=ZOYaz3SIjHw" }))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(test::read_body(resp).await, "transcript text");
        assert_eq!(state.get_metrics_snapshot().waiting_requests, 0);
        shutdown.cancel();
    }

    #[actix_web::test]
    async fn test_pipeline_failure_is_a_server_error() {
        let (state, rx, _dirs) = test_state_with(
            Arc::new(ScriptedFetcher::succeeding()),
            Arc::new(StaticTranscriber::failing("whisper exit 1")),
        );
        let shutdown = CancellationToken::new();
        JobExecutor::new(state.jobs.clone(), state.pipeline.clone(), Duration::ZERO).spawn(rx, shutdown.clone());
        let app = test::init_service(App::new().app_data(web::Data::new(state)).configure(routes)).await;

        let req = test::TestRequest::post()
            .uri("/transcript")
            .set_json(json!({ "url": "https://youtu.be/abc123" }))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body: serde_json::Value = test::read_body_json(resp).await;
        assert!(body["error"]["message"].as_str().unwrap().contains("whisper exit 1"));
        shutdown.cancel();
    }

    #[actix_web::test]
    async fn test_put_requires_file() {
        let (state, _rx, _dirs) = test_state();
        let app = test::init_service(App::new().app_data(web::Data::new(state)).configure(routes)).await;

        let req = test::TestRequest::put().uri("/transcript").to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[actix_web::test]
    async fn test_put_transcribes_uploaded_file() {
        let (state, _rx, _dirs) = test_state_with(
            Arc::new(ScriptedFetcher::succeeding()),
            Arc::new(StaticTranscriber::new("ask not what your country can do for you")),
        );
        let app = test::init_service(App::new().app_data(web::Data::new(state)).configure(routes)).await;

        let body = "--XBOUNDARY\r\n\
            Content-Disposition: form-data; name=\"file\"; filename=\"jfk.flac\"\r\n\
            Content-Type: audio/flac\r\n\r\n\
            fLaCfakedata\r\n\
            --XBOUNDARY--\r\n";
        let req = test::TestRequest::put()
            .uri("/transcript")
            .insert_header(("content-type", "multipart/form-data; boundary=XBOUNDARY"))
            .set_payload(body)
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(
            test::read_body(resp).await,
            "ask not what your country can do for you"
        );
    }
}
