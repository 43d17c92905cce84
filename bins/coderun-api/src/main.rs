mod handlers;
mod metrics;
mod routes;
mod ws;

use anyhow::{Context, Result};
use axum::Router;
use coderun_common::config::EngineConfig;
use coderun_engine::{Coordinator, SessionRegistry};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{error, info, warn};

pub struct AppState {
    pub coordinator: Coordinator,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing subscriber
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"))
        )
        .with_target(false)
        .with_thread_ids(true)
        .with_line_number(true)
        .init();

    info!("coderun API booting...");

    let config = match std::env::var("CODERUN_CONFIG") {
        Ok(path) => EngineConfig::load(Path::new(&path)),
        Err(_) => EngineConfig::load_default(),
    }
    .map_err(|e| {
        error!("Failed to load engine configuration: {:#}", e);
        e
    })?;

    info!(
        interpreter = %config.interpreter.command,
        default_timeout_secs = config.default_timeout_secs,
        max_timeout_secs = config.max_timeout_secs,
        max_source_chars = config.max_source_chars,
        "Engine configured"
    );

    // Worst case per job: SIGTERM grace, SIGKILL wait, relay drain.
    let drain_limit = config.kill_grace() * 3 + Duration::from_secs(1);

    metrics::register().context("Failed to register metrics")?;

    let registry = Arc::new(SessionRegistry::new());
    let state = Arc::new(AppState {
        coordinator: Coordinator::new(config, registry),
    });

    // Build router
    let app = Router::new()
        .merge(routes::routes())
        .with_state(state.clone());

    let addr = std::env::var("CODERUN_BIND").unwrap_or_else(|_| "0.0.0.0:5000".to_string());
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    info!("HTTP server listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    shutdown_jobs(&state.coordinator, drain_limit).await;
    info!("coderun API shut down");
    Ok(())
}

/// Cancel whatever is still running so no process tree outlives the server.
async fn shutdown_jobs(coordinator: &Coordinator, limit: Duration) {
    let cancelled = coordinator.cancel_all();
    if cancelled.is_empty() {
        return;
    }
    info!(jobs = cancelled.len(), "Cancelling running jobs");

    if !coordinator.drain(limit).await {
        warn!(
            running_jobs = coordinator.registry().running_jobs(),
            "Jobs still running at shutdown"
        );
    }
}

async fn shutdown_signal() {
    if let Err(e) = signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
        return;
    }
    info!("Received shutdown signal");
}
