//! # Health and Metrics Endpoints
//!
//! - `GET /health`, `GET /api/v1/health`: liveness plus a short summary of the
//!   cache, the job table and the two concurrency budgets
//! - `GET /api/v1/metrics`: per-route request statistics and the same
//!   component stats in more detail

use crate::config::AppConfig;
use crate::jobs::JobCounts;
use crate::pipeline::pool::PoolStats;
use crate::state::AppState;
use actix_web::{web, HttpResponse};
use serde_json::json;

pub async fn health_check(state: web::Data<AppState>) -> HttpResponse {
    let metrics = state.get_metrics_snapshot();
    let config = &state.config;
    let jobs = state.jobs.counts().await;
    let pool = state.pipeline.pool_stats();
    let queue_depth = state.pipeline.queue_depth();

    HttpResponse::Ok().json(json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": state.get_uptime_seconds(),
        "service": {
            "name": "transcript-backend",
            "version": env!("CARGO_PKG_VERSION"),
            "host": config.server.host,
            "port": config.server.port
        },
        "metrics": {
            "total_requests": metrics.request_count,
            "total_errors": metrics.error_count,
            "error_rate": if metrics.request_count > 0 {
                metrics.error_count as f64 / metrics.request_count as f64
            } else {
                0.0
            },
            "waiting_requests": metrics.waiting_requests
        },
        "jobs": jobs,
        "executor_enabled": config.jobs.executor_enabled,
        "system": get_system_status(config, &pool, queue_depth, &jobs)
    }))
}

pub async fn detailed_metrics(state: web::Data<AppState>) -> HttpResponse {
    let metrics = state.get_metrics_snapshot();
    let uptime_seconds = state.get_uptime_seconds();
    let cache = state.pipeline.cache().stats().await;

    let mut endpoint_stats: Vec<_> = metrics
        .endpoint_metrics
        .iter()
        .map(|(endpoint, metric)| {
            json!({
                "endpoint": endpoint,
                "request_count": metric.request_count,
                "error_count": metric.error_count,
                "error_rate": metric.error_rate(),
                "average_duration_ms": metric.average_duration_ms(),
                "total_duration_ms": metric.total_duration_ms
            })
        })
        .collect();
    endpoint_stats.sort_by(|a, b| a["endpoint"].as_str().cmp(&b["endpoint"].as_str()));

    HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": uptime_seconds,
        "overall": {
            "total_requests": metrics.request_count,
            "total_errors": metrics.error_count,
            "waiting_requests": metrics.waiting_requests,
            "requests_per_second": if uptime_seconds > 0 {
                metrics.request_count as f64 / uptime_seconds as f64
            } else {
                0.0
            }
        },
        "endpoints": endpoint_stats,
        "cache": cache,
        "jobs": state.jobs.counts().await,
        "transcription_pool": state.pipeline.pool_stats(),
        "submission_queue": {
            "depth": state.pipeline.queue_depth(),
            "min_gap_ms": state.config.queue.min_gap_ms,
            "jitter_ms": state.config.queue.jitter_ms
        }
    }))
}

/// Load summary based on how saturated the transcription pool is.
fn get_system_status(config: &AppConfig, pool: &PoolStats, queue_depth: usize, jobs: &JobCounts) -> serde_json::Value {
    let pool_usage = if pool.limit > 0 {
        pool.running as f64 / pool.limit as f64
    } else {
        0.0
    };

    let status = if pool.waiting > 0 {
        "high_load"
    } else if pool_usage >= 1.0 {
        "moderate_load"
    } else {
        "normal"
    };

    let mut warnings = Vec::new();
    if pool.waiting > 0 {
        warnings.push("Transcriptions are waiting for a free slot - consider raising transcribe.concurrency");
    }
    if jobs.queued > 0 && !config.jobs.executor_enabled {
        warnings.push("Jobs are queued but the job executor is disabled");
    }

    json!({
        "status": status,
        "pool_usage_percent": (pool_usage * 100.0).round(),
        "transcription_slots": pool.limit,
        "running_transcriptions": pool.running,
        "waiting_transcriptions": pool.waiting,
        "submission_queue_depth": queue_depth,
        "load_warnings": warnings
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::routes;
    use crate::state::testing::test_state;
    use actix_web::{test, App};
    use serde_json::Value;

    #[actix_web::test]
    async fn test_health_reports_components() {
        let (state, _rx, _dirs) = test_state();
        state.jobs.create("https://youtu.be/abc123").await.unwrap();
        let app = test::init_service(App::new().app_data(web::Data::new(state)).configure(routes)).await;

        for uri in ["/health", "/api/v1/health"] {
            let resp = test::call_service(&app, test::TestRequest::get().uri(uri).to_request()).await;
            assert!(resp.status().is_success());
            let body: Value = test::read_body_json(resp).await;
            assert_eq!(body["status"], "healthy");
            assert_eq!(body["jobs"]["queued"], 1);
            assert_eq!(body["system"]["status"], "normal");
        }
    }

    #[actix_web::test]
    async fn test_metrics_include_cache_and_pool() {
        let (state, _rx, _dirs) = test_state();
        let app = test::init_service(App::new().app_data(web::Data::new(state)).configure(routes)).await;

        let resp = test::call_service(&app, test::TestRequest::get().uri("/api/v1/metrics").to_request()).await;
        let body: Value = test::read_body_json(resp).await;
        assert_eq!(body["cache"]["entries"], 0);
        assert_eq!(body["transcription_pool"]["limit"], 1);
        assert_eq!(body["submission_queue"]["depth"], 0);
    }

    #[actix_web::test]
    async fn test_waiting_transcriptions_mean_high_load() {
        let config = AppConfig::default();
        let busy = PoolStats {
            limit: 1,
            running: 1,
            waiting: 2,
        };
        let status = get_system_status(&config, &busy, 0, &JobCounts::default());
        assert_eq!(status["status"], "high_load");
        assert_eq!(status["load_warnings"].as_array().unwrap().len(), 1);

        let idle = PoolStats {
            limit: 2,
            running: 0,
            waiting: 0,
        };
        assert_eq!(get_system_status(&config, &idle, 0, &JobCounts::default())["status"], "normal");
    }
}
