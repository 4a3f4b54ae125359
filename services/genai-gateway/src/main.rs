//! Generative-AI gateway
//!
//! Single-binary service that:
//! 1. Loads a pool of API keys for a Gemini-compatible backend
//! 2. Serves generate / stream / batch calls, rotating keys and retrying
//!    throttled or failed attempts on other keys
//! 3. Exposes health, Prometheus metrics, and a separate admin listener
//! 4. Clears daily quota exhaustion on a schedule

mod admin;
mod api;
mod config;
mod error;
mod metrics;
mod service;
#[cfg(test)]
mod testing;

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::Router;
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use credential_pool::{CredentialPool, PoolHealth, RateGate, spawn_daily_reset_task};
use dispatch::{BatchPolicy, CallDispatcher, GenerationClient};
use metrics_exporter_prometheus::PrometheusHandle;
use provider::GeminiBackend;
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::admin::{AdminState, build_admin_router};
use crate::config::Config;
use crate::service::{DRAIN_TIMEOUT, ServiceMetrics};

/// Shared application state accessible from all handlers
#[derive(Clone)]
struct AppState {
    client: GenerationClient,
    batch: BatchPolicy,
    max_batch_items: usize,
    metrics: ServiceMetrics,
    prometheus: PrometheusHandle,
}

impl AppState {
    fn pool(&self) -> &Arc<CredentialPool> {
        self.client.dispatcher().pool()
    }
}

/// Build the public router. `max_connections` caps concurrent requests.
fn build_router(state: AppState, max_connections: usize) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .route("/v1/generate", post(api::generate_handler))
        .route("/v1/generate/stream", post(api::stream_handler))
        .route("/v1/generate/batch", post(api::batch_handler))
        .layer(tower::limit::ConcurrencyLimitLayer::new(max_connections))
        .with_state(state)
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and LOG_LEVEL / RUST_LOG support
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_env("LOG_LEVEL")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("starting genai-gateway");

    // Install before any metrics are emitted
    let prometheus_handle = metrics::install_recorder()?;

    let args: Vec<String> = std::env::args().collect();
    let cli_config_path = args
        .iter()
        .position(|a| a == "--config")
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str());

    let config_path = Config::resolve_path(cli_config_path);
    info!(path = %config_path.display(), "loading configuration");

    let mut config = Config::load(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;

    info!(
        listen_addr = %config.server.listen_addr,
        admin_addr = %config.server.admin_addr,
        base_url = %config.backend.base_url,
        model = %config.backend.model,
        credentials = config.pool.api_keys.len(),
        "configuration loaded"
    );

    let keys = std::mem::take(&mut config.pool.api_keys);
    let pool = Arc::new(
        CredentialPool::new(keys, config.cooldown_policy())
            .context("failed to build credential pool")?,
    );
    let gate = Arc::new(RateGate::new(pool.clone(), config.gate_policy()?));
    info!(
        credentials = pool.size(),
        min_interval_ms = gate.min_interval().as_millis() as u64,
        "credential pool ready"
    );

    let http = reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(10))
        .build()
        .context("failed to build HTTP client")?;
    let backend = Arc::new(GeminiBackend::new(
        http,
        config.backend.base_url.clone(),
        config.backend.model.clone(),
    ));
    let dispatcher = Arc::new(CallDispatcher::new(backend, gate, config.dispatch_policy()));
    let client = GenerationClient::new(dispatcher, config.generation_defaults());

    let reset_task = spawn_daily_reset_task(pool.clone(), config.reset_interval());

    let metrics = ServiceMetrics::new();
    let app_state = AppState {
        client,
        batch: config.batch_policy(),
        max_batch_items: config.batch.max_items,
        metrics: metrics.clone(),
        prometheus: prometheus_handle,
    };
    let app = build_router(app_state, config.server.max_connections);
    let admin_app = build_admin_router(AdminState::new(pool.clone()));

    let listener = TcpListener::bind(config.server.listen_addr)
        .await
        .with_context(|| format!("failed to bind to {}", config.server.listen_addr))?;
    let admin_listener = TcpListener::bind(config.server.admin_addr)
        .await
        .with_context(|| format!("failed to bind admin API to {}", config.server.admin_addr))?;

    info!(
        addr = %config.server.listen_addr,
        admin_addr = %config.server.admin_addr,
        "accepting requests"
    );

    // The drain timeout starts at signal receipt, not at server start.
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let mut admin_shutdown_rx = shutdown_rx.clone();
    let mut api_shutdown_rx = shutdown_rx;

    let server_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = api_shutdown_rx.changed().await;
            })
            .await
    });
    let admin_handle = tokio::spawn(async move {
        axum::serve(admin_listener, admin_app)
            .with_graceful_shutdown(async move {
                let _ = admin_shutdown_rx.changed().await;
            })
            .await
    });

    shutdown_signal().await;
    let _ = shutdown_tx.send(true);
    reset_task.abort();

    match tokio::time::timeout(DRAIN_TIMEOUT, server_handle).await {
        Ok(Ok(Ok(()))) => {
            info!("all in-flight requests drained");
        }
        Ok(Ok(Err(e))) => {
            error!(error = %e, "server error during shutdown");
        }
        Ok(Err(e)) => {
            error!(error = %e, "server task panicked");
        }
        Err(_) => {
            let remaining = metrics.in_flight.load(Ordering::Relaxed);
            warn!(
                remaining,
                drain_timeout_secs = DRAIN_TIMEOUT.as_secs(),
                "drain timeout exceeded, forcing shutdown"
            );
        }
    }
    if let Ok(Ok(Err(e))) = tokio::time::timeout(Duration::from_secs(1), admin_handle).await {
        error!(error = %e, "admin server error during shutdown");
    }

    info!("shutdown complete");
    Ok(())
}

/// Health endpoint: pool condition, uptime, and request counters.
///
/// 200 while at least one credential can serve, 503 once none can.
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let stats = state.pool().stats();
    let uptime = state.metrics.started_at.elapsed().as_secs();
    let requests = state.metrics.requests_total.load(Ordering::Relaxed);
    let errors = state.metrics.errors_total.load(Ordering::Relaxed);

    let status_code = match stats.status {
        PoolHealth::Unhealthy => axum::http::StatusCode::SERVICE_UNAVAILABLE,
        PoolHealth::Healthy | PoolHealth::Degraded => axum::http::StatusCode::OK,
    };
    let body = serde_json::json!({
        "status": stats.status,
        "all_exhausted": stats.all_exhausted,
        "credentials": {
            "total": stats.total,
            "available": stats.available,
            "cooling_down": stats.cooling_down,
            "exhausted": stats.exhausted,
            "dead": stats.dead,
        },
        "uptime_seconds": uptime,
        "requests_served": requests,
        "errors_total": errors,
    });

    (
        status_code,
        [(axum::http::header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
}

/// Prometheus metrics endpoint; pool gauges are refreshed per scrape.
async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    metrics::record_pool(&state.pool().stats());
    (
        axum::http::StatusCode::OK,
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        state.prometheus.render(),
    )
}

/// Wait for SIGTERM or SIGINT for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT"),
        _ = terminate => info!("received SIGTERM"),
    }
}
