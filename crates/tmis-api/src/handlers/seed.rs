//! Development seeding endpoint
//!
//! Author: hephaex@gmail.com

use crate::error::AppError;
use crate::seed::{seed_demo_data, SeedOutcome};
use crate::state::AppState;
use axum::{extract::State, response::IntoResponse, Json};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use utoipa::ToSchema;
use uuid::Uuid;

/// Seeding result
#[derive(Debug, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct SeedResponse {
    pub message: String,
    pub company_id: Uuid,
}

/// Create the demo company, roles and administrator
///
/// Only available in development; elsewhere the route answers 404.
#[utoipa::path(
    post,
    path = "/api/seed/data",
    tag = "seed",
    responses(
        (status = 200, description = "Demo data present", body = SeedResponse),
        (status = 404, description = "Not available outside development", body = crate::error::ApiError),
    )
)]
pub async fn seed_data(State(state): State<Arc<AppState>>) -> Result<impl IntoResponse, AppError> {
    if !state.config.environment.is_development() {
        return Err(AppError::NotFound("Endpoint".to_string()));
    }

    let outcome = seed_demo_data(&state.repos, state.auth.hasher().as_ref()).await?;
    let message = match outcome {
        SeedOutcome::Seeded { .. } => "Demo data created",
        SeedOutcome::AlreadySeeded { .. } => "Demo data already exists",
    };

    Ok(Json(SeedResponse {
        message: message.to_string(),
        company_id: outcome.tenant_id(),
    }))
}
