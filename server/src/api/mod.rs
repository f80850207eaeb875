//! API Router and Application State
//!
//! Central routing configuration and shared state.

use std::sync::Arc;

use axum::{
    extract::{DefaultBodyLimit, State},
    http::StatusCode,
    routing::get,
    Json, Router,
};
use serde::Serialize;
use tower_http::trace::TraceLayer;
use tracing::warn;

use crate::config::Config;
use crate::ingest::{self, IngestPipeline};
use crate::store::SharedStore;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    /// Webhook ingestion pipeline
    pub pipeline: IngestPipeline,
    /// Shared store, pinged by the readiness check
    pub store: Arc<dyn SharedStore>,
    /// Server configuration
    pub config: Arc<Config>,
}

impl AppState {
    /// Create new application state.
    #[must_use]
    pub fn new(pipeline: IngestPipeline, store: Arc<dyn SharedStore>, config: Config) -> Self {
        Self {
            pipeline,
            store,
            config: Arc::new(config),
        }
    }
}

/// Create the main application router.
pub fn create_router(state: AppState) -> Router {
    let max_body_bytes = state.config.max_body_bytes;

    Router::new()
        // Liveness
        .route("/health", get(health_check))
        .route("/health/live", get(health_check))
        // Readiness (shared store reachable)
        .route("/ready", get(readiness_check))
        .route("/health/ready", get(readiness_check))
        // Platform webhooks
        .nest("/webhooks", ingest::handlers::router())
        // Middleware
        .layer(TraceLayer::new_for_http())
        .layer(DefaultBodyLimit::max(max_body_bytes))
        // State
        .with_state(state)
}

/// Health check response.
#[derive(Serialize)]
struct HealthResponse {
    /// Service status
    status: &'static str,
    /// Whether rate limiting is enabled
    rate_limiting: bool,
}

/// Health check endpoint.
async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        rate_limiting: state.config.rate_limit.enabled,
    })
}

#[derive(Serialize)]
struct ReadinessResponse {
    status: &'static str,
    store: &'static str,
}

/// Readiness: 503 while the shared store is unreachable.
async fn readiness_check(State(state): State<AppState>) -> (StatusCode, Json<ReadinessResponse>) {
    match state.store.ping().await {
        Ok(()) => (
            StatusCode::OK,
            Json(ReadinessResponse {
                status: "ready",
                store: "ok",
            }),
        ),
        Err(e) => {
            warn!(error = %e, "Readiness check failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(ReadinessResponse {
                    status: "not_ready",
                    store: "unavailable",
                }),
            )
        }
    }
}
