//! Authentication API handlers
//!
//! The refresh token is only ever exchanged through the HttpOnly cookie; the
//! JSON bodies carry the access token, its expiry and the principal summary.
//!
//! Author: hephaex@gmail.com

use crate::auth::middleware::optional_principal;
use crate::auth::{
    AuthResult, AuthenticatedPrincipal, ClientInfo, LoginRequest, RegisterRequest, UserSummary,
};
use crate::error::AppError;
use crate::extract::AppJson;
use crate::state::AppState;
use axum::{
    extract::State,
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Extension, Json,
};
use axum_extra::extract::CookieJar;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tmis_core::TenantContext;
use utoipa::ToSchema;
use validator::Validate;

/// Access token response
#[derive(Debug, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct AuthResponse {
    /// Bearer access token
    pub token: String,
    pub expires_at: DateTime<Utc>,
    pub user: UserSummary,
}

/// Current principal response
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct MeResponse {
    pub user: UserSummary,
}

impl From<&AuthResult> for AuthResponse {
    fn from(result: &AuthResult) -> Self {
        Self {
            token: result.access_token.token.clone(),
            expires_at: result.expires_at(),
            user: result.user.clone(),
        }
    }
}

fn with_cookie(mut response: Response, cookie: Option<HeaderValue>) -> Result<Response, AppError> {
    let cookie = cookie.ok_or_else(|| {
        AppError::Internal("refresh token cookie could not be encoded".to_string())
    })?;
    response.headers_mut().append(header::SET_COOKIE, cookie);
    Ok(response)
}

fn session_response(state: &AppState, result: &AuthResult) -> Result<Response, AppError> {
    with_cookie(
        Json(AuthResponse::from(result)).into_response(),
        state.cookie.issue(&result.refresh_token.plaintext),
    )
}

/// Login with email and password
///
/// On success the refresh token is set as an HttpOnly cookie scoped to `/api/auth`.
/// Every credential failure returns the same message.
#[utoipa::path(
    post,
    path = "/api/auth/login",
    tag = "auth",
    request_body = LoginRequest,
    responses(
        (status = 200, description = "Login successful", body = AuthResponse),
        (status = 400, description = "Invalid input", body = crate::error::ApiError),
        (status = 401, description = "Invalid credentials", body = crate::error::ApiError),
    )
)]
pub async fn login_handler(
    State(state): State<Arc<AppState>>,
    Extension(tenant): Extension<TenantContext>,
    headers: HeaderMap,
    AppJson(request): AppJson<LoginRequest>,
) -> Result<Response, AppError> {
    request.validate()?;

    let client = ClientInfo::from_headers(&headers);
    let result = state.auth.login(&request, &tenant, &client).await?;

    session_response(&state, &result)
}

/// Register through an invitation
///
/// The invitation decides the company; the new principal gets the company's
/// default role and is signed in immediately.
#[utoipa::path(
    post,
    path = "/api/auth/register",
    tag = "auth",
    request_body = RegisterRequest,
    responses(
        (status = 200, description = "Registration successful", body = AuthResponse),
        (status = 400, description = "Invalid input", body = crate::error::ApiError),
        (status = 401, description = "Registration failed", body = crate::error::ApiError),
    )
)]
pub async fn register_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    AppJson(request): AppJson<RegisterRequest>,
) -> Result<Response, AppError> {
    request.validate()?;

    let client = ClientInfo::from_headers(&headers);
    let result = state.auth.register(&request, &client).await?;

    session_response(&state, &result)
}

/// Rotate the refresh token cookie and issue a new access token
#[utoipa::path(
    post,
    path = "/api/auth/refresh",
    tag = "auth",
    responses(
        (status = 200, description = "Token refreshed", body = AuthResponse),
        (status = 401, description = "Missing, invalid or expired refresh token", body = crate::error::ApiError),
    )
)]
pub async fn refresh_handler(
    State(state): State<Arc<AppState>>,
    jar: CookieJar,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    let client = ClientInfo::from_headers(&headers);
    let presented = state.cookie.read(&jar);
    let result = state.auth.refresh(presented.as_deref(), &client).await?;

    session_response(&state, &result)
}

/// Revoke the refresh token cookie and clear it
///
/// Always succeeds; an unknown or missing token is not an error.
#[utoipa::path(
    post,
    path = "/api/auth/logout",
    tag = "auth",
    responses(
        (status = 204, description = "Logged out"),
    )
)]
pub async fn logout_handler(
    State(state): State<Arc<AppState>>,
    jar: CookieJar,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    let client = ClientInfo::from_headers(&headers);
    let user_id = optional_principal(&state, &headers).map(|p| p.user_id);
    let presented = state.cookie.read(&jar);

    state
        .auth
        .logout(presented.as_deref(), user_id, &client)
        .await;

    with_cookie(StatusCode::NO_CONTENT.into_response(), state.cookie.clear())
}

/// Get the current principal
#[utoipa::path(
    get,
    path = "/api/auth/me",
    tag = "auth",
    responses(
        (status = 200, description = "Current principal", body = MeResponse),
        (status = 401, description = "Unauthorized", body = crate::error::ApiError),
    ),
    security(
        ("bearer_auth" = [])
    )
)]
pub async fn me_handler(
    State(state): State<Arc<AppState>>,
    Extension(principal): Extension<AuthenticatedPrincipal>,
) -> Result<impl IntoResponse, AppError> {
    let user = state.auth.current_user(principal.user_id).await?;
    Ok(Json(MeResponse { user }))
}
