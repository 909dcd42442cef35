//! # Transcript Backend - Main Application Entry Point
//!
//! HTTP service that turns video links (or uploaded media) into plain-text
//! transcripts by driving two external tools: a downloader and a
//! speech-to-text CLI.
//!
//! ## Application Architecture:
//! - **config**: layered configuration (defaults, config.toml, environment)
//! - **locator**: video link normalization
//! - **cache**: disk-backed transcript cache with TTL and byte budget
//! - **pipeline**: rate-limited queue, backoff, bounded pool, timeouts, collaborators
//! - **jobs**: asynchronous job registry and its single executor
//! - **handlers**, **health**, **middleware**: the HTTP surface
//! - **state**: components shared with request handlers
//! - **error**: pipeline error taxonomy and HTTP error responses
//!
//! ## Lifecycle:
//! Every background task (cache sweeper, job GC, job executor, in-flight
//! external processes) hangs off one root `CancellationToken`. SIGINT or
//! SIGTERM cancels it, then the HTTP server drains and the process exits.

mod cache;
mod config;
mod error;
mod handlers;
mod health;
mod jobs;
mod locator;
mod middleware;
mod pipeline;
mod state;

use actix_cors::Cors;
use actix_web::{web, App, HttpServer};
use anyhow::Result;
use crate::cache::TranscriptCache;
use crate::config::AppConfig;
use crate::jobs::{JobExecutor, JobRegistry};
use crate::pipeline::TranscriptPipeline;
use crate::state::AppState;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_actix_web::TracingLogger;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[actix_web::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    init_tracing()?;

    let config = AppConfig::load()?;
    config.validate()?;

    info!("Starting transcript-backend v{}", env!("CARGO_PKG_VERSION"));
    info!("Configuration loaded: {}:{}", config.server.host, config.server.port);

    let shutdown = CancellationToken::new();

    tokio::fs::create_dir_all(&config.cache.dir).await?;
    let cache = Arc::new(TranscriptCache::from_config(&config.cache));
    info!(dir = %cache.dir().display(), "Transcript cache ready");
    let sweeper = cache::spawn_sweeper(cache.clone(), config.cache.sweep_interval(), shutdown.clone());

    let pipeline = Arc::new(TranscriptPipeline::from_config(&config, cache.clone(), shutdown.clone()));
    let (registry, job_queue) = JobRegistry::new(cache, config.jobs.ttl());
    let gc = jobs::spawn_gc(registry.clone(), config.jobs.gc_interval(), shutdown.clone());

    // With the executor disabled the receiver is parked here so jobs can still be queued.
    let (executor, _parked_queue) = if config.jobs.executor_enabled {
        let executor = JobExecutor::new(registry.clone(), pipeline.clone(), config.jobs.cooldown());
        (Some(executor.spawn(job_queue, shutdown.clone())), None)
    } else {
        warn!("Job executor disabled; jobs will stay queued");
        (None, Some(job_queue))
    };

    let app_state = AppState::new(config.clone(), registry, pipeline);
    let bind_addr = format!("{}:{}", config.server.host, config.server.port);

    setup_signal_handlers(shutdown.clone())?;

    info!("Starting HTTP server on {}", bind_addr);

    let server = HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .app_data(web::Data::new(app_state.clone()))
            .wrap(cors)
            .wrap(middleware::MetricsMiddleware)
            .wrap(TracingLogger::default())
            .configure(handlers::routes)
    })
    .disable_signals()
    .bind(&bind_addr)?
    .run();

    let server_handle = server.handle();
    let server_task = tokio::spawn(server);

    tokio::select! {
        result = server_task => {
            match result {
                Ok(Err(e)) => error!("Server error: {}", e),
                Err(e) => error!("Server task error: {}", e),
                Ok(Ok(())) => {}
            }
            shutdown.cancel();
        }
        _ = shutdown.cancelled() => {
            info!("Shutdown signal received, stopping server...");
            server_handle.stop(true).await;
        }
    }

    for (name, handle) in [("cache sweeper", Some(sweeper)), ("job GC", Some(gc)), ("job executor", executor)] {
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!("{} ended abnormally: {}", name, e);
            }
        }
    }

    info!("Server stopped gracefully");
    Ok(())
}

/// Initialize structured logging.
///
/// ## Environment Variables:
/// - `RUST_LOG`: Controls what gets logged (e.g., "debug", "transcript_backend=trace")
/// - If not set, defaults to "transcript_backend=debug,actix_web=info"
fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "transcript_backend=debug,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init()?;

    Ok(())
}

/// Cancel `shutdown` on SIGTERM or SIGINT (Ctrl+C).
///
/// The handlers are installed before this returns, so a failure to install
/// them is reported at startup instead of inside a background task.
#[cfg(unix)]
fn setup_signal_handlers(shutdown: CancellationToken) -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => info!("Received SIGTERM"),
            _ = sigint.recv() => info!("Received SIGINT"),
        }
        shutdown.cancel();
    });
    Ok(())
}

#[cfg(not(unix))]
fn setup_signal_handlers(shutdown: CancellationToken) -> Result<()> {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received Ctrl+C");
            shutdown.cancel();
        }
    });
    Ok(())
}
