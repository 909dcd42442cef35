//! # HTTP Handlers
//!
//! - `transcript`: synchronous transcript requests (link or upload)
//! - `jobs`: asynchronous job creation and polling
//! - `config`: read-only view of the effective configuration
//!
//! [`routes`] wires them (and the health endpoints) into an actix `App`; both
//! `main` and the handler tests use it, so tests exercise the real route table.

pub mod config;
pub mod jobs;
pub mod transcript;

use crate::health;
use actix_web::web;

pub use config::get_config;
pub use jobs::{create_job, job_result, job_status};
pub use transcript::{create_transcript, upload_transcript};

pub fn routes(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::resource("/transcript")
            .route(web::post().to(create_transcript))
            .route(web::put().to(upload_transcript)),
    )
    .route("/jobs", web::post().to(create_job))
    .route("/jobs/{id}/status", web::get().to(job_status))
    .route("/jobs/{id}/result", web::get().to(job_result))
    .service(
        web::scope("/api/v1")
            .route("/health", web::get().to(health::health_check))
            .route("/metrics", web::get().to(health::detailed_metrics))
            .route("/config", web::get().to(get_config)),
    )
    // Also provide health check at root level for convenience
    .route("/health", web::get().to(health::health_check));
}
