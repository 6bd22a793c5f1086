//! API Integration Tests
//!
//! Every test runs against a freshly seeded in-memory store.
//!
//! Author: hephaex@gmail.com

use axum::{
    body::Body,
    http::{header, HeaderMap, Request, StatusCode},
};
use serde_json::{json, Value};
use tmis_api::auth::PasswordHasher;
use tmis_api::{create_router_for_testing, create_test_app, TestApp};
use tmis_core::{
    normalize_name, Membership, NewPrincipal, Principal, PrincipalRepository, Role,
    RoleRepository, Tenant, TenantRepository, ADMIN_ROLE, DEFAULT_ROLE,
};
use tower::ServiceExt;
use uuid::Uuid;

const ADMIN_EMAIL: &str = "admin@testcompany.com";
const ADMIN_PASSWORD: &str = "Admin123!";

struct TestResponse {
    status: StatusCode,
    headers: HeaderMap,
    body: Value,
}

impl TestResponse {
    /// Value of the refresh cookie set by this response
    fn refresh_cookie(&self) -> Option<String> {
        self.headers
            .get_all(header::SET_COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .find(|v| v.starts_with("refreshToken="))
            .map(|v| {
                v.split(';')
                    .next()
                    .unwrap_or_default()
                    .trim_start_matches("refreshToken=")
                    .to_string()
            })
    }

    fn set_cookie_header(&self) -> String {
        self.headers
            .get(header::SET_COOKIE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string()
    }
}

/// Helper to create a test request
fn create_json_request(method: &str, uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header("Content-Type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn send(app: &TestApp, request: Request<Body>) -> TestResponse {
    let response = app.router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let headers = response.headers().clone();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };

    TestResponse {
        status,
        headers,
        body,
    }
}

async fn post_json(app: &TestApp, uri: &str, body: Value) -> TestResponse {
    send(app, create_json_request("POST", uri, body)).await
}

async fn login(app: &TestApp, email: &str, password: &str) -> TestResponse {
    post_json(
        app,
        "/api/auth/login",
        json!({ "email": email, "password": password }),
    )
    .await
}

async fn refresh_with(app: &TestApp, cookie: &str) -> TestResponse {
    let request = Request::builder()
        .method("POST")
        .uri("/api/auth/refresh")
        .header(header::COOKIE, format!("refreshToken={cookie}"))
        .body(Body::empty())
        .unwrap();
    send(app, request).await
}

async fn get_authorized(app: &TestApp, uri: &str, token: &str, extra: &[(&str, String)]) -> TestResponse {
    let mut builder = Request::builder()
        .uri(uri)
        .header(header::AUTHORIZATION, format!("Bearer {token}"));
    for (name, value) in extra {
        builder = builder.header(*name, value.as_str());
    }
    send(app, builder.body(Body::empty()).unwrap()).await
}

async fn admin_token(app: &TestApp) -> String {
    let response = login(app, ADMIN_EMAIL, ADMIN_PASSWORD).await;
    assert_eq!(response.status, StatusCode::OK);
    response.body["token"].as_str().unwrap().to_string()
}

/// Create a principal directly in the store
async fn add_principal(
    app: &TestApp,
    email: &str,
    password: &str,
    membership: Membership,
) -> Principal {
    let hash = app.state.auth.hasher().hash(password).unwrap();
    app.state
        .repos
        .principals
        .create_principal(NewPrincipal {
            email: email.to_string(),
            password_hash: hash,
            first_name: "Test".to_string(),
            last_name: "User".to_string(),
            membership,
            email_confirmed: true,
            is_active: true,
        })
        .await
        .unwrap()
}

/// A second company with one regular user
async fn add_company(app: &TestApp, name: &str, domain: &str) -> (Tenant, Principal) {
    let tenant = Tenant::new(name, domain);
    app.state.repos.tenants.create_tenant(&tenant).await.unwrap();

    let role = Role::new(Some(tenant.id), DEFAULT_ROLE, vec![]);
    app.state.repos.roles.create_role(&role).await.unwrap();

    let user = add_principal(
        app,
        &format!("user@{domain}"),
        "Password1!",
        Membership::Tenant {
            tenant_id: tenant.id,
            role: role.assignment(),
        },
    )
    .await;
    (tenant, user)
}

async fn system_admin_token(app: &TestApp) -> String {
    let role = app
        .state
        .repos
        .roles
        .find_role(None, &normalize_name(ADMIN_ROLE))
        .await
        .unwrap()
        .expect("seeded system admin role");
    add_principal(
        app,
        "root@system.test",
        "RootPassword1!",
        Membership::System {
            role: role.assignment(),
        },
    )
    .await;

    let response = login(app, "root@system.test", "RootPassword1!").await;
    assert_eq!(response.status, StatusCode::OK);
    response.body["token"].as_str().unwrap().to_string()
}

// =============================================================================
// Health Check Tests
// =============================================================================

#[tokio::test]
async fn test_health_check() {
    let app = create_router_for_testing().await;

    let response = app
        .oneshot(
            Request::builder()
                .uri("/api/health")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers().get(header::X_FRAME_OPTIONS).unwrap(),
        "DENY"
    );

    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let json: Value = serde_json::from_slice(&body).unwrap();

    assert_eq!(json["status"], "Healthy");
    assert_eq!(json["database"], "Connected");
}

#[tokio::test]
async fn test_health_unavailable_when_not_ready() {
    let app = create_test_app().await;
    app.state.set_ready(false);

    let response = send(
        &app,
        Request::builder()
            .uri("/api/health")
            .body(Body::empty())
            .unwrap(),
    )
    .await;

    assert_eq!(response.status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(response.body["status"], "Unhealthy");
    assert_eq!(response.body["database"], "Connected");
}

#[tokio::test]
async fn test_liveness_check() {
    let app = create_test_app().await;
    let response = send(
        &app,
        Request::builder()
            .uri("/api/health/live")
            .body(Body::empty())
            .unwrap(),
    )
    .await;

    assert_eq!(response.status, StatusCode::OK);
    assert!(response.body["version"].is_string());
}

#[tokio::test]
async fn test_openapi_served() {
    let app = create_test_app().await;
    let response = send(
        &app,
        Request::builder()
            .uri("/openapi.json")
            .body(Body::empty())
            .unwrap(),
    )
    .await;

    assert_eq!(response.status, StatusCode::OK);
    assert!(response.body["paths"]["/api/auth/login"].is_object());
}

// =============================================================================
// Login
// =============================================================================

#[tokio::test]
async fn test_login_sets_refresh_cookie_and_tenant_claim() {
    let app = create_test_app().await;
    let response = login(&app, ADMIN_EMAIL, ADMIN_PASSWORD).await;

    assert_eq!(response.status, StatusCode::OK);
    assert!(response.body["token"].is_string());
    assert!(response.body["expiresAt"].is_string());
    assert_eq!(response.body["user"]["email"], ADMIN_EMAIL);
    assert!(response.body.get("refreshToken").is_none());

    let cookie = response.set_cookie_header();
    assert!(cookie.contains("HttpOnly"));
    assert!(cookie.contains("Path=/api/auth"));
    assert!(cookie.contains("SameSite=Lax"));
    assert!(cookie.contains("Secure"));

    assert_eq!(
        response.headers.get(header::CACHE_CONTROL).unwrap(),
        "no-store, no-cache, must-revalidate"
    );
    assert_eq!(response.headers.get(header::PRAGMA).unwrap(), "no-cache");

    let claims = app
        .state
        .auth
        .tokens()
        .validate(response.body["token"].as_str().unwrap())
        .unwrap();
    assert_eq!(claims.company_id, Some(app.tenant_id));
    assert_eq!(claims.role_name, ADMIN_ROLE);
}

#[tokio::test]
async fn test_login_failures_share_one_message() {
    let app = create_test_app().await;

    let wrong_password = login(&app, ADMIN_EMAIL, "nope").await;
    let unknown_email = login(&app, "ghost@testcompany.com", ADMIN_PASSWORD).await;

    assert_eq!(wrong_password.status, StatusCode::UNAUTHORIZED);
    assert_eq!(unknown_email.status, StatusCode::UNAUTHORIZED);
    assert_eq!(wrong_password.body, unknown_email.body);
    assert!(wrong_password.refresh_cookie().is_none());
}

#[tokio::test]
async fn test_login_validation_error() {
    let app = create_test_app().await;
    let response = login(&app, "not-an-email", "").await;

    assert_eq!(response.status, StatusCode::BAD_REQUEST);
    let fields: Vec<&str> = response.body["details"]
        .as_array()
        .unwrap()
        .iter()
        .filter_map(|d| d["field"].as_str())
        .collect();
    assert!(fields.contains(&"email"));
    assert!(fields.contains(&"password"));
}

#[tokio::test]
async fn test_login_missing_field_is_validation_error() {
    let app = create_test_app().await;
    let response = post_json(
        &app,
        "/api/auth/login",
        json!({ "email": ADMIN_EMAIL }),
    )
    .await;

    assert_eq!(response.status, StatusCode::BAD_REQUEST);
    assert_eq!(response.body["code"], "VALIDATION_ERROR");
    assert_eq!(response.body["details"][0]["field"], "password");
}

#[tokio::test]
async fn test_malformed_json_is_bad_request() {
    let app = create_test_app().await;
    let request = Request::builder()
        .method("POST")
        .uri("/api/auth/register")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from("{\"email\": "))
        .unwrap();
    let response = send(&app, request).await;

    assert_eq!(response.status, StatusCode::BAD_REQUEST);
    assert_eq!(response.body["code"], "BAD_REQUEST");
}

// =============================================================================
// Refresh and logout
// =============================================================================

#[tokio::test]
async fn test_refresh_without_cookie() {
    let app = create_test_app().await;
    let response = send(
        &app,
        Request::builder()
            .method("POST")
            .uri("/api/auth/refresh")
            .body(Body::empty())
            .unwrap(),
    )
    .await;

    assert_eq!(response.status, StatusCode::UNAUTHORIZED);
    assert_eq!(response.body["message"], "No refresh token found");
}

#[tokio::test]
async fn test_refresh_rotates_and_rejects_replay() {
    let app = create_test_app().await;
    let first = login(&app, ADMIN_EMAIL, ADMIN_PASSWORD).await;
    let original = first.refresh_cookie().unwrap();

    let rotated = refresh_with(&app, &original).await;
    assert_eq!(rotated.status, StatusCode::OK);
    assert!(rotated.body["token"].is_string());
    let next = rotated.refresh_cookie().unwrap();
    assert_ne!(next, original);
    assert_eq!(
        rotated.headers.get(header::CACHE_CONTROL).unwrap(),
        "no-store, no-cache, must-revalidate"
    );

    let replay = refresh_with(&app, &original).await;
    assert_eq!(replay.status, StatusCode::UNAUTHORIZED);
    assert_eq!(replay.body["message"], "Invalid or expired refresh token");

    // The rotated token still works
    let again = refresh_with(&app, &next).await;
    assert_eq!(again.status, StatusCode::OK);
}

#[tokio::test]
async fn test_logout_clears_cookie_and_revokes() {
    let app = create_test_app().await;
    let session = login(&app, ADMIN_EMAIL, ADMIN_PASSWORD).await;
    let cookie = session.refresh_cookie().unwrap();

    let response = send(
        &app,
        Request::builder()
            .method("POST")
            .uri("/api/auth/logout")
            .header(header::COOKIE, format!("refreshToken={cookie}"))
            .body(Body::empty())
            .unwrap(),
    )
    .await;

    assert_eq!(response.status, StatusCode::NO_CONTENT);
    let cleared = response.set_cookie_header();
    assert!(cleared.starts_with("refreshToken=;"));
    assert!(cleared.contains("Path=/api/auth"));
    assert!(cleared.contains("Max-Age=0"));

    let after = refresh_with(&app, &cookie).await;
    assert_eq!(after.status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_logout_without_cookie_still_succeeds() {
    let app = create_test_app().await;
    let response = send(
        &app,
        Request::builder()
            .method("POST")
            .uri("/api/auth/logout")
            .body(Body::empty())
            .unwrap(),
    )
    .await;

    assert_eq!(response.status, StatusCode::NO_CONTENT);
}

#[tokio::test]
async fn test_me_requires_token() {
    let app = create_test_app().await;

    let anonymous = send(
        &app,
        Request::builder()
            .uri("/api/auth/me")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(anonymous.status, StatusCode::UNAUTHORIZED);

    let forged = get_authorized(&app, "/api/auth/me", "not.a.jwt", &[]).await;
    assert_eq!(forged.status, StatusCode::UNAUTHORIZED);

    let token = admin_token(&app).await;
    let me = get_authorized(&app, "/api/auth/me", &token, &[]).await;
    assert_eq!(me.status, StatusCode::OK);
    assert_eq!(me.body["user"]["email"], ADMIN_EMAIL);
    assert_eq!(me.body["user"]["companyName"], "Test Company");
}

// =============================================================================
// Invitations and registration
// =============================================================================

async fn create_invitation(app: &TestApp, token: &str, company_id: Uuid) -> TestResponse {
    let mut request = create_json_request(
        "POST",
        "/api/admin/invitations",
        json!({ "companyId": company_id, "expirationHours": 48 }),
    );
    request.headers_mut().insert(
        header::AUTHORIZATION,
        format!("Bearer {token}").parse().unwrap(),
    );
    send(app, request).await
}

#[tokio::test]
async fn test_invitation_registration_flow() {
    let app = create_test_app().await;
    let token = admin_token(&app).await;

    let invitation = create_invitation(&app, &token, app.tenant_id).await;
    assert_eq!(invitation.status, StatusCode::OK);
    let invite_token = invitation.body["token"].as_str().unwrap().to_string();
    assert_eq!(invitation.body["companyName"], "Test Company");

    let check = post_json(
        &app,
        "/api/user/invitations/validate",
        json!({ "token": invite_token }),
    )
    .await;
    assert_eq!(check.status, StatusCode::OK);
    assert_eq!(check.body["isValid"], true);

    let registered = post_json(
        &app,
        "/api/auth/register",
        json!({
            "email": "new.hire@testcompany.com",
            "password": "secret1",
            "firstName": "New",
            "lastName": "Hire",
            "invitationToken": invite_token,
        }),
    )
    .await;
    assert_eq!(registered.status, StatusCode::OK);
    assert_eq!(registered.body["user"]["roleName"], DEFAULT_ROLE);
    assert_eq!(
        registered.body["user"]["companyId"],
        app.tenant_id.to_string()
    );
    assert!(registered.refresh_cookie().is_some());

    // Single use
    let reuse = post_json(
        &app,
        "/api/user/invitations/validate",
        json!({ "token": invite_token }),
    )
    .await;
    assert_eq!(reuse.status, StatusCode::BAD_REQUEST);
    assert_eq!(reuse.body["message"], "Invalid or expired invitation token");

    let second = post_json(
        &app,
        "/api/auth/register",
        json!({
            "email": "other@testcompany.com",
            "password": "secret1",
            "firstName": "Other",
            "lastName": "Hire",
            "invitationToken": invite_token,
        }),
    )
    .await;
    assert_eq!(second.status, StatusCode::UNAUTHORIZED);
    assert_eq!(second.body["message"], "Registration failed");
}

#[tokio::test]
async fn test_tenant_admin_cannot_invite_into_other_company() {
    let app = create_test_app().await;
    let (globex, _) = add_company(&app, "Globex", "globex.test").await;
    let token = admin_token(&app).await;

    let response = create_invitation(&app, &token, globex.id).await;
    assert_eq!(response.status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_invitation_for_unknown_company() {
    let app = create_test_app().await;
    let token = system_admin_token(&app).await;

    let response = create_invitation(&app, &token, Uuid::new_v4()).await;
    assert_eq!(response.status, StatusCode::BAD_REQUEST);
    assert_eq!(
        response.body["message"],
        "Company not found or invitation creation failed"
    );
}

#[tokio::test]
async fn test_regular_user_cannot_reach_admin_routes() {
    let app = create_test_app().await;
    let (_, user) = add_company(&app, "Globex", "globex.test").await;

    let session = login(&app, &user.email, "Password1!").await;
    let token = session.body["token"].as_str().unwrap().to_string();

    let response = get_authorized(&app, "/api/admin/users", &token, &[]).await;
    assert_eq!(response.status, StatusCode::FORBIDDEN);
}

// =============================================================================
// Tenant isolation
// =============================================================================

#[tokio::test]
async fn test_tenant_admin_sees_only_own_users() {
    let app = create_test_app().await;
    let (globex, globex_user) = add_company(&app, "Globex", "globex.test").await;
    let token = admin_token(&app).await;

    // The token's tenant claim outranks the header
    let listed = get_authorized(
        &app,
        "/api/admin/users",
        &token,
        &[("X-Tenant-ID", globex.id.to_string())],
    )
    .await;
    assert_eq!(listed.status, StatusCode::OK);
    let companies: Vec<&str> = listed
        .body
        .as_array()
        .unwrap()
        .iter()
        .filter_map(|u| u["companyId"].as_str())
        .collect();
    assert!(!companies.is_empty());
    assert!(companies.iter().all(|c| *c == app.tenant_id.to_string()));

    let foreign = get_authorized(
        &app,
        &format!("/api/admin/users/{}", globex_user.id),
        &token,
        &[],
    )
    .await;
    assert_eq!(foreign.status, StatusCode::NOT_FOUND);

    let stats = get_authorized(&app, "/api/admin/users/stats", &token, &[]).await;
    assert_eq!(stats.status, StatusCode::OK);
    assert_eq!(stats.body["totalUsers"], 1);
}

#[tokio::test]
async fn test_system_admin_scoped_by_header() {
    let app = create_test_app().await;
    let (globex, globex_user) = add_company(&app, "Globex", "globex.test").await;
    let token = system_admin_token(&app).await;

    let scoped = get_authorized(
        &app,
        "/api/admin/users",
        &token,
        &[("X-Tenant-ID", globex.id.to_string())],
    )
    .await;
    assert_eq!(scoped.status, StatusCode::OK);
    let ids: Vec<&str> = scoped
        .body
        .as_array()
        .unwrap()
        .iter()
        .filter_map(|u| u["id"].as_str())
        .collect();
    assert_eq!(ids, vec![globex_user.id.to_string().as_str()]);

    let unscoped = get_authorized(&app, "/api/admin/users", &token, &[]).await;
    assert_eq!(unscoped.status, StatusCode::OK);
    assert!(unscoped.body.as_array().unwrap().len() >= 3);
}

#[tokio::test]
async fn test_soft_deleted_tenant_header_is_not_resolved() {
    let app = create_test_app().await;
    let (_, globex_user) = add_company(&app, "Globex", "globex.test").await;
    let token = system_admin_token(&app).await;

    let mut gone = Tenant::new("Gone", "gone.test");
    gone.is_deleted = true;
    app.state.repos.tenants.create_tenant(&gone).await.unwrap();

    let response = get_authorized(
        &app,
        "/api/admin/users",
        &token,
        &[("X-Tenant-ID", gone.id.to_string())],
    )
    .await;
    assert_eq!(response.status, StatusCode::OK);

    // Falls through to the unscoped view instead of the deleted tenant
    let ids: Vec<String> = response
        .body
        .as_array()
        .unwrap()
        .iter()
        .filter_map(|u| u["id"].as_str().map(str::to_string))
        .collect();
    assert!(ids.contains(&globex_user.id.to_string()));
    assert!(response
        .body
        .as_array()
        .unwrap()
        .iter()
        .all(|u| u["companyId"] != gone.id.to_string()));
}

// =============================================================================
// Seeding
// =============================================================================

#[tokio::test]
async fn test_seed_endpoint_is_idempotent() {
    let app = create_test_app().await;
    let response = post_json(&app, "/api/seed/data", json!({})).await;

    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(response.body["message"], "Demo data already exists");
    assert_eq!(response.body["companyId"], app.tenant_id.to_string());
}

#[tokio::test]
async fn test_concurrent_refresh_has_one_winner() {
    let app = create_test_app().await;
    let session = login(&app, ADMIN_EMAIL, ADMIN_PASSWORD).await;
    let cookie = session.refresh_cookie().unwrap();

    let attempts = (0..6).map(|_| refresh_with(&app, &cookie));
    let responses = futures::future::join_all(attempts).await;

    let winners = responses
        .iter()
        .filter(|r| r.status == StatusCode::OK)
        .count();
    assert_eq!(winners, 1);
    assert!(responses
        .iter()
        .filter(|r| r.status != StatusCode::OK)
        .all(|r| r.status == StatusCode::UNAUTHORIZED));
}
