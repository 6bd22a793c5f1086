/// Authentication middleware for protecting routes
///
/// Extracts and validates bearer access tokens. On success the authenticated
/// principal is added to request extensions for handlers and later layers.
use super::jwt::{AccessClaims, JwtError};
use crate::audit::{audit_log, extract_ip_address, extract_user_agent, AuditEvent};
use crate::error::ApiError;
use crate::state::AppState;
use axum::{
    body::Body,
    extract::{Request, State},
    http::{header, HeaderMap, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tmis_core::{Membership, RoleAssignment, ADMIN_ROLE};
use uuid::Uuid;

/// Principal behind a validated access token
///
/// Extract in handlers with `Extension<AuthenticatedPrincipal>`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthenticatedPrincipal {
    pub user_id: Uuid,
    pub email: String,
    pub name: String,
    pub membership: Membership,
    pub is_active: bool,
    /// Token id, for correlating audit records
    pub jti: Uuid,
}

impl AuthenticatedPrincipal {
    pub fn tenant_id(&self) -> Option<Uuid> {
        self.membership.tenant_id()
    }

    /// Administrator outside any tenant
    pub fn is_system_admin(&self) -> bool {
        self.membership.is_system() && self.membership.has_role(ADMIN_ROLE)
    }

    pub fn has_role(&self, role: &str) -> bool {
        self.membership.has_role(role)
    }
}

impl From<AccessClaims> for AuthenticatedPrincipal {
    fn from(claims: AccessClaims) -> Self {
        Self {
            user_id: claims.sub,
            email: claims.email,
            name: claims.name,
            membership: Membership::from_parts(
                claims.company_id,
                RoleAssignment {
                    role_id: claims.role_id,
                    role_name: claims.role_name,
                },
            ),
            is_active: claims.is_active,
            jti: claims.jti,
        }
    }
}

/// Authentication middleware errors
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("Missing Authorization header")]
    MissingAuthHeader,

    #[error("Invalid Authorization header format")]
    InvalidAuthHeader,

    #[error("Invalid token: {0}")]
    InvalidToken(#[from] JwtError),

    #[error("Insufficient permissions")]
    InsufficientPermissions,
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let (status, code, message) = match self {
            AuthError::MissingAuthHeader | AuthError::InvalidAuthHeader => (
                StatusCode::UNAUTHORIZED,
                "UNAUTHORIZED",
                "Authentication required",
            ),
            AuthError::InvalidToken(_) => (
                StatusCode::UNAUTHORIZED,
                "INVALID_TOKEN",
                "Invalid or expired token",
            ),
            AuthError::InsufficientPermissions => (
                StatusCode::FORBIDDEN,
                "FORBIDDEN",
                "Insufficient permissions",
            ),
        };

        (status, axum::Json(ApiError::new(code, message))).into_response()
    }
}

/// Bearer token from the Authorization header, if present and well formed
pub fn bearer_token(headers: &HeaderMap) -> Result<Option<&str>, AuthError> {
    let Some(value) = headers.get(header::AUTHORIZATION) else {
        return Ok(None);
    };
    let value = value.to_str().map_err(|_| AuthError::InvalidAuthHeader)?;
    let token = value
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .ok_or(AuthError::InvalidAuthHeader)?;
    Ok(Some(token))
}

/// Validate the bearer token, if any, without failing the request
pub fn optional_principal(state: &AppState, headers: &HeaderMap) -> Option<AuthenticatedPrincipal> {
    let token = bearer_token(headers).ok().flatten()?;
    state
        .auth
        .tokens()
        .validate(token)
        .ok()
        .map(AuthenticatedPrincipal::from)
}

/// Authentication middleware that requires a valid access token
///
/// # Usage
///
/// ```ignore
/// use axum::{Router, routing::get, middleware};
/// use tmis_api::auth::middleware::auth_middleware;
///
/// let app = Router::new()
///     .route("/protected", get(protected_handler))
///     .route_layer(middleware::from_fn_with_state(state.clone(), auth_middleware));
/// ```
pub async fn auth_middleware(
    State(state): State<Arc<AppState>>,
    mut request: Request<Body>,
    next: Next,
) -> Result<Response, AuthError> {
    let token = bearer_token(request.headers())?
        .ok_or(AuthError::MissingAuthHeader)?
        .to_string();

    let claims = match state.auth.tokens().validate(&token) {
        Ok(claims) => claims,
        Err(e) => {
            audit_log(&AuditEvent::InvalidToken {
                ip_address: extract_ip_address(request.headers()),
                user_agent: extract_user_agent(request.headers()),
                reason: e.to_string(),
            });
            return Err(AuthError::InvalidToken(e));
        }
    };

    request
        .extensions_mut()
        .insert(AuthenticatedPrincipal::from(claims));

    Ok(next.run(request).await)
}

/// Type alias for role middleware future
type RoleMiddlewareFuture =
    std::pin::Pin<Box<dyn std::future::Future<Output = Result<Response, AuthError>> + Send>>;

/// Middleware factory for role-based access control
///
/// Must run after [`auth_middleware`].
///
/// ```ignore
/// let admin = Router::new()
///     .route("/admin/users", get(list_users))
///     .route_layer(middleware::from_fn(require_role("Admin")))
///     .route_layer(middleware::from_fn_with_state(state.clone(), auth_middleware));
/// ```
pub fn require_role(
    required_role: &'static str,
) -> impl Fn(Request<Body>, Next) -> RoleMiddlewareFuture + Clone {
    move |request: Request<Body>, next: Next| {
        Box::pin(async move {
            let principal = request
                .extensions()
                .get::<AuthenticatedPrincipal>()
                .ok_or(AuthError::MissingAuthHeader)?
                .clone();

            if !principal.has_role(required_role) {
                audit_log(&AuditEvent::AccessDenied {
                    user_id: Some(principal.user_id),
                    email: Some(principal.email.clone()),
                    resource: request.uri().path().to_string(),
                    required_role: Some(required_role.to_string()),
                    ip_address: extract_ip_address(request.headers()),
                });

                return Err(AuthError::InsufficientPermissions);
            }

            Ok(next.run(request).await)
        })
    }
}
