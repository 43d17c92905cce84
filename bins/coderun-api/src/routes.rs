use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;

use crate::handlers;
use crate::ws;
use crate::AppState;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/health", get(handlers::health_check))
        .route("/api/execute", post(handlers::execute_code))
        .route("/api/stop", post(handlers::stop_code))
        .route("/api/status/:session_id", get(handlers::session_status))
        .route("/ws", get(ws::ws_handler))
        .route("/metrics", get(handlers::metrics_handler))
}
