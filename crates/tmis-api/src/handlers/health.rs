//! Health check handlers
//!
//! Author: hephaex@gmail.com

use crate::state::AppState;
use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::warn;
use utoipa::ToSchema;

/// Readiness response
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct HealthResponse {
    /// "Healthy" or "Unhealthy"
    pub status: String,
    /// "Connected" or "Disconnected"
    pub database: String,
    pub timestamp: DateTime<Utc>,
}

/// Liveness response
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct LivenessResponse {
    pub status: String,
    pub version: String,
    pub uptime_seconds: u64,
}

/// Readiness probe - pings the database
#[utoipa::path(
    get,
    path = "/api/health",
    tag = "health",
    responses(
        (status = 200, description = "Service is healthy", body = HealthResponse),
        (status = 503, description = "Database unreachable", body = HealthResponse)
    )
)]
pub async fn health_check(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let connected = match state.repos.health.ping().await {
        Ok(()) => true,
        Err(e) => {
            warn!(error = %e, "Health check failed");
            false
        }
    };

    let healthy = connected && state.is_ready();
    let response = HealthResponse {
        status: if healthy { "Healthy" } else { "Unhealthy" }.to_string(),
        database: if connected { "Connected" } else { "Disconnected" }.to_string(),
        timestamp: Utc::now(),
    };

    if healthy {
        (StatusCode::OK, Json(response))
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, Json(response))
    }
}

/// Liveness probe - basic health check
#[utoipa::path(
    get,
    path = "/api/health/live",
    tag = "health",
    responses(
        (status = 200, description = "Service is alive", body = LivenessResponse)
    )
)]
pub async fn liveness_check(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(LivenessResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: state.uptime_secs(),
    })
}
