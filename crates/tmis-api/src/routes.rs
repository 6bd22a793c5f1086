//! API route definitions
//!
//! Author: hephaex@gmail.com

use crate::auth::middleware::{auth_middleware, require_role};
use crate::handlers::{auth, health, invitations, seed, users};
use crate::middleware::{no_store_middleware, security_headers_middleware};
use crate::state::AppState;
use crate::tenant::tenant_resolver_middleware;
use axum::{
    http::{header, HeaderName, HeaderValue, Method},
    middleware,
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use std::time::Duration;
use tmis_core::ADMIN_ROLE;
use tower_http::{
    cors::{AllowOrigin, CorsLayer},
    timeout::TimeoutLayer,
    trace::TraceLayer,
};
use tracing::warn;
use utoipa::{
    openapi::security::{HttpAuthScheme, HttpBuilder, SecurityScheme},
    Modify, OpenApi,
};
use utoipa_swagger_ui::SwaggerUi;

/// OpenAPI document
#[derive(OpenApi)]
#[openapi(
    info(
        title = "TMIS API",
        description = "Multi-tenant authentication and tenant isolation service"
    ),
    paths(
        auth::login_handler,
        auth::register_handler,
        auth::refresh_handler,
        auth::logout_handler,
        auth::me_handler,
        invitations::create_invitation,
        invitations::list_invitations,
        invitations::admin_validate_invitation,
        invitations::validate_invitation,
        users::list_users,
        users::get_user,
        users::user_stats,
        health::health_check,
        health::liveness_check,
        seed::seed_data,
    ),
    components(schemas(
        crate::auth::LoginRequest,
        crate::auth::RegisterRequest,
        crate::auth::UserSummary,
        auth::AuthResponse,
        auth::MeResponse,
        invitations::CreateInvitationRequest,
        invitations::ValidateInvitationRequest,
        invitations::InvitationResponse,
        invitations::InvitationValidationResponse,
        invitations::InvitationSummary,
        users::UserStats,
        users::CompanyUserCount,
        health::HealthResponse,
        health::LivenessResponse,
        seed::SeedResponse,
        crate::error::ApiError,
        crate::error::FieldErrorBody,
    )),
    modifiers(&SecurityAddon),
    tags(
        (name = "auth", description = "Login, registration and session management"),
        (name = "invitations", description = "Company invitations"),
        (name = "users", description = "Tenant-scoped user administration"),
        (name = "health", description = "Health probes"),
        (name = "seed", description = "Development seeding"),
    )
)]
pub struct ApiDoc;

struct SecurityAddon;

impl Modify for SecurityAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        if let Some(components) = openapi.components.as_mut() {
            components.add_security_scheme(
                "bearer_auth",
                SecurityScheme::Http(
                    HttpBuilder::new()
                        .scheme(HttpAuthScheme::Bearer)
                        .bearer_format("JWT")
                        .build(),
                ),
            );
        }
    }
}

/// Create API routes
pub fn api_routes(state: Arc<AppState>) -> Router<Arc<AppState>> {
    // Auth routes; every response here is kept out of caches
    let auth_routes = Router::new()
        .route("/api/auth/me", get(auth::me_handler))
        .route_layer(middleware::from_fn_with_state(state.clone(), auth_middleware))
        .route("/api/auth/login", post(auth::login_handler))
        .route("/api/auth/register", post(auth::register_handler))
        .route("/api/auth/refresh", post(auth::refresh_handler))
        .route("/api/auth/logout", post(auth::logout_handler))
        .layer(middleware::from_fn(no_store_middleware));

    // Administration (Admin role required)
    let admin_routes = Router::new()
        .route(
            "/api/admin/invitations",
            get(invitations::list_invitations).post(invitations::create_invitation),
        )
        .route(
            "/api/admin/invitations/validate",
            post(invitations::admin_validate_invitation),
        )
        .route("/api/admin/users", get(users::list_users))
        .route("/api/admin/users/stats", get(users::user_stats))
        .route("/api/admin/users/:id", get(users::get_user))
        .route_layer(middleware::from_fn(require_role(ADMIN_ROLE)))
        .route_layer(middleware::from_fn_with_state(state, auth_middleware));

    // Anonymous routes
    let public_routes = Router::new()
        .route(
            "/api/user/invitations/validate",
            post(invitations::validate_invitation),
        )
        .route("/api/health", get(health::health_check))
        .route("/api/health/live", get(health::liveness_check))
        .route("/api/seed/data", post(seed::seed_data));

    Router::new()
        .merge(auth_routes)
        .merge(admin_routes)
        .merge(public_routes)
}

fn cors_layer(state: &AppState) -> CorsLayer {
    let origins: Vec<HeaderValue> = state
        .config
        .server
        .cors_origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(_) => {
                warn!(origin = %origin, "Ignoring invalid CORS origin");
                None
            }
        })
        .collect();

    let mut allowed_headers = vec![header::AUTHORIZATION, header::CONTENT_TYPE];
    if let Ok(tenant_header) = HeaderName::from_bytes(state.tenant_settings().header_name.as_bytes())
    {
        allowed_headers.push(tenant_header);
    }

    CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE, Method::OPTIONS])
        .allow_headers(allowed_headers)
        .allow_credentials(true)
}

/// Create the application router with all middleware
pub fn create_router(state: Arc<AppState>) -> Router {
    let timeout = Duration::from_secs(state.config.server.request_timeout_secs.max(1));

    Router::new()
        .merge(api_routes(state.clone()))
        .merge(SwaggerUi::new("/swagger-ui").url("/openapi.json", ApiDoc::openapi()))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            tenant_resolver_middleware,
        ))
        .layer(middleware::from_fn(security_headers_middleware))
        .layer(TimeoutLayer::new(timeout))
        .layer(cors_layer(&state))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
