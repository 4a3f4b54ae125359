//! Admin API for the credential pool
//!
//! Runs on its own listener (default 127.0.0.1:9090) so it can stay off the
//! public interface.
//!
//! Endpoints:
//! - GET  /admin/pool              pool statistics
//! - POST /admin/pool/reset-daily  clear daily quota exhaustion now
//! - POST /admin/pool/reset-stats  zero call/success/failure counters

use std::sync::Arc;

use axum::Json;
use axum::Router;
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use credential_pool::CredentialPool;
use tracing::info;

/// Shared state for admin API handlers.
#[derive(Clone)]
pub struct AdminState {
    pool: Arc<CredentialPool>,
}

impl AdminState {
    pub fn new(pool: Arc<CredentialPool>) -> Self {
        Self { pool }
    }
}

pub fn build_admin_router(state: AdminState) -> Router {
    Router::new()
        .route("/admin/pool", get(pool_status))
        .route("/admin/pool/reset-daily", post(reset_daily))
        .route("/admin/pool/reset-stats", post(reset_stats))
        .with_state(state)
}

/// GET /admin/pool. Keys appear only as short prefixes.
async fn pool_status(State(state): State<AdminState>) -> impl IntoResponse {
    Json(state.pool.stats())
}

/// POST /admin/pool/reset-daily. Dead keys stay dead.
async fn reset_daily(State(state): State<AdminState>) -> impl IntoResponse {
    state.pool.reset_daily_exhaustion();
    let stats = state.pool.stats();
    info!(available = stats.available, dead = stats.dead, "daily reset via admin API");
    Json(serde_json::json!({ "reset": "daily", "pool": stats }))
}

/// POST /admin/pool/reset-stats
async fn reset_stats(State(state): State<AdminState>) -> impl IntoResponse {
    state.pool.reset_statistics();
    info!("usage statistics reset via admin API");
    Json(serde_json::json!({ "reset": "stats", "pool": state.pool.stats() }))
}
