//! API error handling
//!
//! Author: hephaex@gmail.com

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use tmis_core::{FieldError, TmisError};
use tracing::{error, warn};
use utoipa::ToSchema;
use validator::ValidationErrors;

/// A single invalid input field
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct FieldErrorBody {
    pub field: String,
    pub message: String,
}

impl From<FieldError> for FieldErrorBody {
    fn from(err: FieldError) -> Self {
        Self {
            field: err.field,
            message: err.message,
        }
    }
}

/// API error response
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ApiError {
    /// Error code
    pub code: String,
    /// Human-readable message
    pub message: String,
    /// Per-field validation messages
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Vec<FieldErrorBody>>,
}

impl ApiError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            details: None,
        }
    }

    pub fn not_found(resource: &str) -> Self {
        Self::new("NOT_FOUND", format!("{resource} not found"))
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new("BAD_REQUEST", message)
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new("UNAUTHORIZED", message)
    }

    pub fn internal_error() -> Self {
        Self::new("INTERNAL_ERROR", "Internal server error")
    }
}

/// Application error type
#[derive(Debug)]
pub enum AppError {
    NotFound(String),
    BadRequest(String),
    Validation(Vec<FieldError>),
    /// Carries the public message only
    Unauthorized(&'static str),
    Forbidden(String),
    Internal(String),
    Database(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error) = match self {
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, ApiError::not_found(&msg)),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, ApiError::bad_request(msg)),
            AppError::Validation(fields) => (
                StatusCode::BAD_REQUEST,
                ApiError {
                    details: Some(fields.into_iter().map(Into::into).collect()),
                    ..ApiError::new("VALIDATION_ERROR", "One or more fields are invalid")
                },
            ),
            AppError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, ApiError::unauthorized(msg)),
            AppError::Forbidden(msg) => (StatusCode::FORBIDDEN, ApiError::new("FORBIDDEN", msg)),
            AppError::Internal(msg) => {
                error!(error = %msg, "Internal error");
                (StatusCode::INTERNAL_SERVER_ERROR, ApiError::internal_error())
            }
            AppError::Database(msg) => {
                error!(error = %msg, "Database error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    ApiError::new("DATABASE_ERROR", "Database operation failed"),
                )
            }
        };

        (status, Json(error)).into_response()
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err.to_string())
    }
}

impl From<TmisError> for AppError {
    fn from(err: TmisError) -> Self {
        match err {
            TmisError::AuthenticationFailed(reason) => AppError::Unauthorized(reason.public_message()),
            // A lost rotation race looks like any other invalid refresh to the client
            TmisError::Conflict(detail) => {
                warn!(detail = %detail, "Conflict reported as authentication failure");
                AppError::Unauthorized(
                    tmis_core::AuthFailure::InvalidRefreshToken.public_message(),
                )
            }
            TmisError::Validation(fields) => AppError::Validation(fields),
            TmisError::NotFound(msg) => AppError::NotFound(msg),
            TmisError::Forbidden(msg) => AppError::Forbidden(msg),
            TmisError::Database(msg) => AppError::Database(msg),
            TmisError::Configuration(msg) => AppError::Internal(format!("Configuration error: {msg}")),
            TmisError::Other(err) => AppError::Internal(err.to_string()),
        }
    }
}

impl From<ValidationErrors> for AppError {
    fn from(errors: ValidationErrors) -> Self {
        AppError::Validation(field_errors(&errors))
    }
}

/// Flatten validator output into camelCase field messages
pub fn field_errors(errors: &ValidationErrors) -> Vec<FieldError> {
    let mut fields: Vec<FieldError> = errors
        .field_errors()
        .into_iter()
        .flat_map(|(field, errs)| {
            let field = camel_case(field);
            errs.iter().map(move |e| {
                let message = e
                    .message
                    .as_ref()
                    .map(|m| m.to_string())
                    .unwrap_or_else(|| format!("{field} is invalid"));
                FieldError::new(field.clone(), message)
            })
        })
        .collect();
    fields.sort_by(|a, b| a.field.cmp(&b.field));
    fields
}

fn camel_case(field: &str) -> String {
    let mut out = String::with_capacity(field.len());
    let mut upper = false;
    for c in field.chars() {
        if c == '_' {
            upper = true;
        } else if upper {
            out.extend(c.to_uppercase());
            upper = false;
        } else {
            out.push(c);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use tmis_core::AuthFailure;

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_conflict_is_indistinguishable_from_invalid_refresh() {
        let conflict = AppError::from(TmisError::Conflict("token 1".to_string())).into_response();
        let invalid =
            AppError::from(TmisError::auth(AuthFailure::InvalidRefreshToken)).into_response();

        assert_eq!(conflict.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(invalid.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(body_json(conflict).await, body_json(invalid).await);
    }

    #[tokio::test]
    async fn test_database_error_hides_detail() {
        let response =
            AppError::from(TmisError::Database("relation users does not exist".to_string()))
                .into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let body = body_json(response).await;
        assert_eq!(body["code"], "DATABASE_ERROR");
        assert!(!body.to_string().contains("relation users"));
    }

    #[tokio::test]
    async fn test_validation_lists_fields() {
        let response = AppError::from(TmisError::validation("email", "bad")).into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let body = body_json(response).await;
        assert_eq!(body["details"][0]["field"], "email");
    }

    #[test]
    fn test_camel_case() {
        assert_eq!(camel_case("first_name"), "firstName");
        assert_eq!(camel_case("invitation_token"), "invitationToken");
        assert_eq!(camel_case("email"), "email");
    }
}
