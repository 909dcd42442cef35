//! # Job Handlers
//!
//! Asynchronous counterpart of `POST /transcript`: create a job, then poll it.
//!
//! ## Available Endpoints:
//! - `POST /jobs` - create a job for `{"url": "..."}`
//! - `GET /jobs/{id}/status` - current status and error, if any
//! - `GET /jobs/{id}/result` - the transcript once the job is ready

use crate::error::{AppError, AppResult};
use crate::handlers::transcript::UrlRequest;
use crate::jobs::{JobLookupError, JobStatus};
use crate::state::AppState;
use actix_web::{web, HttpResponse};

/// Create a job.
///
/// ## Endpoint: `POST /jobs`
///
/// ## Responses:
/// - `202`: job accepted, `{"id": "...", "status": "queued", ...}`
/// - `200`: transcript already cached, the job is born `ready`
/// - `400`: `url` missing or not a recognised video link
pub async fn create_job(state: web::Data<AppState>, body: web::Json<UrlRequest>) -> AppResult<HttpResponse> {
    let url = body.required_url()?;
    let job = state.jobs.create(url).await?;

    let response = if job.status == JobStatus::Ready {
        HttpResponse::Ok().json(&job)
    } else {
        HttpResponse::Accepted().json(&job)
    };
    Ok(response)
}

/// ## Endpoint: `GET /jobs/{id}/status`
pub async fn job_status(state: web::Data<AppState>, path: web::Path<String>) -> AppResult<HttpResponse> {
    let id = path.into_inner();
    let progress = state
        .jobs
        .status(&id)
        .await
        .ok_or_else(|| AppError::NotFound(format!("job {} not found", id)))?;
    Ok(HttpResponse::Ok().json(progress))
}

/// ## Endpoint: `GET /jobs/{id}/result`
///
/// ## Responses:
/// - `200 text/plain`: the transcript
/// - `202`: still running; the body is the job status
/// - `500`: the job failed; the body carries its error
/// - `404`: unknown (or already collected) job
pub async fn job_result(state: web::Data<AppState>, path: web::Path<String>) -> AppResult<HttpResponse> {
    let id = path.into_inner();
    match state.jobs.result(&id).await {
        Ok(text) => Ok(HttpResponse::Ok().content_type("text/plain; charset=utf-8").body(text)),
        Err(JobLookupError::NotFound) => Err(AppError::NotFound(format!("job {} not found", id))),
        Err(JobLookupError::NotReady(progress)) if progress.status == JobStatus::Error => Err(AppError::Internal(
            progress.error.unwrap_or_else(|| "job failed".to_string()),
        )),
        Err(JobLookupError::NotReady(progress)) => Ok(HttpResponse::Accepted().json(progress)),
    }
}
