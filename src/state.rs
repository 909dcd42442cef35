//! # Application State Management
//!
//! Everything HTTP handlers share lives in [`AppState`]. It is built once in
//! `main`, cloned into every actix worker, and handed to handlers through
//! `web::Data<AppState>`.
//!
//! ## Key Rust Concepts:
//!
//! ### Arc (Atomically Reference Counted)
//! - Every long-lived component (job registry, pipeline, configuration) is
//!   owned by an `Arc`, so cloning `AppState` only bumps reference counts
//! - The components are constructed explicitly at startup and injected here;
//!   none of them are global statics, so tests can build as many as they like
//!
//! ### RwLock for metrics
//! - Request metrics are updated by middleware on every request and read by
//!   the metrics endpoint, so they sit behind a `std::sync::RwLock`
//! - The lock is never held across an `.await`, so the std lock is fine here
//! - A poisoned lock (a panic while it was held) is recovered rather than
//!   propagated; the counters are still meaningful afterwards

use crate::config::AppConfig;
use crate::jobs::JobRegistry;
use crate::pipeline::TranscriptPipeline;
use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Instant;

/// The main application state shared across all HTTP request handlers.
#[derive(Clone)]
pub struct AppState {
    /// Effective configuration (read-only after startup)
    pub config: Arc<AppConfig>,

    /// Request metrics, updated by the metrics middleware
    pub metrics: Arc<RwLock<AppMetrics>>,

    /// Asynchronous job table and executor queue
    pub jobs: Arc<JobRegistry>,

    /// The orchestration engine (cache, queue, pool, collaborators)
    pub pipeline: Arc<TranscriptPipeline>,

    /// When the server started
    pub start_time: Instant,
}

/// Request metrics collected across all HTTP requests.
///
/// ## Fields:
/// - **request_count**: total requests processed
/// - **error_count**: responses with a 4xx or 5xx status
/// - **waiting_requests**: synchronous transcript requests currently blocked on their job
/// - **endpoint_metrics**: per-route statistics keyed by `"METHOD /route/pattern"`
#[derive(Debug, Default, Clone)]
pub struct AppMetrics {
    pub request_count: u64,
    pub error_count: u64,
    pub waiting_requests: u32,
    pub endpoint_metrics: HashMap<String, EndpointMetric>,
}

/// Performance metrics for a single route.
#[derive(Debug, Default, Clone)]
pub struct EndpointMetric {
    pub request_count: u64,
    pub total_duration_ms: u64,
    pub error_count: u64,
}

impl AppState {
    pub fn new(config: AppConfig, jobs: Arc<JobRegistry>, pipeline: Arc<TranscriptPipeline>) -> Self {
        Self {
            config: Arc::new(config),
            metrics: Arc::new(RwLock::new(AppMetrics::default())),
            jobs,
            pipeline,
            start_time: Instant::now(),
        }
    }

    fn metrics_read(&self) -> RwLockReadGuard<'_, AppMetrics> {
        self.metrics.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn metrics_write(&self) -> RwLockWriteGuard<'_, AppMetrics> {
        self.metrics.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Called by the middleware once per request.
    pub fn increment_request_count(&self) {
        self.metrics_write().request_count += 1;
    }

    /// Called by the middleware for every 4xx/5xx response.
    pub fn increment_error_count(&self) {
        self.metrics_write().error_count += 1;
    }

    /// Record one request against its route.
    ///
    /// ## Parameters:
    /// - **endpoint**: `"METHOD /pattern"`, e.g. `"GET /jobs/{id}/status"`
    /// - **duration_ms**: time spent producing the response
    /// - **is_error**: whether the response status was 4xx or 5xx
    pub fn record_endpoint_request(&self, endpoint: &str, duration_ms: u64, is_error: bool) {
        let mut metrics = self.metrics_write();
        let endpoint_metric = metrics.endpoint_metrics.entry(endpoint.to_string()).or_default();
        endpoint_metric.request_count += 1;
        endpoint_metric.total_duration_ms += duration_ms;
        if is_error {
            endpoint_metric.error_count += 1;
        }
    }

    /// A synchronous request started waiting on its job.
    pub fn increment_waiting_requests(&self) {
        self.metrics_write().waiting_requests += 1;
    }

    /// A synchronous request stopped waiting. Never goes below zero.
    pub fn decrement_waiting_requests(&self) {
        let mut metrics = self.metrics_write();
        metrics.waiting_requests = metrics.waiting_requests.saturating_sub(1);
    }

    /// Copy of the metrics, so the lock is released before serialization.
    pub fn get_metrics_snapshot(&self) -> AppMetrics {
        self.metrics_read().clone()
    }

    pub fn get_uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

impl EndpointMetric {
    /// Total duration ÷ request count, 0.0 before the first request.
    pub fn average_duration_ms(&self) -> f64 {
        if self.request_count > 0 {
            self.total_duration_ms as f64 / self.request_count as f64
        } else {
            0.0
        }
    }

    /// Fraction of requests that failed, from 0.0 to 1.0.
    pub fn error_rate(&self) -> f64 {
        if self.request_count > 0 {
            self.error_count as f64 / self.request_count as f64
        } else {
            0.0
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_endpoint_metrics_accumulate() {
        let (state, _rx, _dirs) = testing::test_state();
        state.record_endpoint_request("GET /health", 10, false);
        state.record_endpoint_request("GET /health", 30, true);

        let snapshot = state.get_metrics_snapshot();
        let health = &snapshot.endpoint_metrics["GET /health"];
        assert_eq!(health.request_count, 2);
        assert_eq!(health.average_duration_ms(), 20.0);
        assert_eq!(health.error_rate(), 0.5);
    }

    #[tokio::test]
    async fn test_waiting_requests_never_underflow() {
        let (state, _rx, _dirs) = testing::test_state();
        state.decrement_waiting_requests();
        state.increment_waiting_requests();
        assert_eq!(state.get_metrics_snapshot().waiting_requests, 1);
        state.decrement_waiting_requests();
        state.decrement_waiting_requests();
        assert_eq!(state.get_metrics_snapshot().waiting_requests, 0);
    }
}
