//! Tenant resolution middleware
//!
//! Builds the [`TenantContext`] for one request from, in trust order:
//! the tenant claim of a valid bearer token, the `Host` header, the tenant id
//! header and the tenant id query parameter. The context is inserted into the
//! request extensions and dropped with the request.
//!
//! Author: hephaex@gmail.com

use axum::{
    body::Body,
    extract::{Query, Request, State},
    http::{header, HeaderMap, Uri},
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::collections::HashMap;
use std::sync::Arc;
use tmis_core::config::TenantSettings;
use tmis_core::{ResolvedTenant, Result, TenantContext, TenantRepository, TenantSource};
use tracing::debug;
use uuid::Uuid;

use crate::audit::{audit_log, AuditEvent};
use crate::auth::jwt::TokenIssuer;
use crate::auth::middleware::bearer_token;
use crate::error::AppError;
use crate::state::AppState;

/// Middleware inserting the request's [`TenantContext`] into extensions
///
/// ```ignore
/// let app = Router::new()
///     .merge(api_routes())
///     .layer(middleware::from_fn_with_state(state.clone(), tenant_resolver_middleware));
/// ```
pub async fn tenant_resolver_middleware(
    State(state): State<Arc<AppState>>,
    mut request: Request<Body>,
    next: Next,
) -> Response {
    let settings = state.tenant_settings();
    let path = request.uri().path().to_string();

    let context = if is_skipped(settings, &path) {
        TenantContext::none()
    } else {
        match resolve(
            state.repos.tenants.as_ref(),
            state.auth.tokens(),
            settings,
            request.headers(),
            request.uri(),
        )
        .await
        {
            Ok(context) => context,
            Err(e) => return AppError::from(e).into_response(),
        }
    };

    if let (Some(tenant_id), Some(source)) = (context.tenant_id(), context.source()) {
        audit_log(&AuditEvent::TenantResolved {
            tenant_id,
            source,
            path,
        });
    }

    request.extensions_mut().insert(context);
    next.run(request).await
}

fn is_skipped(settings: &TenantSettings, path: &str) -> bool {
    settings
        .skip_path_prefixes
        .iter()
        .any(|prefix| path.starts_with(prefix.as_str()))
}

/// Run the resolution chain. Unresolvable signals fall through to the next one.
///
/// A valid token that names a tenant is final: if that tenant is gone the
/// request has no tenant, and weaker signals are not consulted.
pub async fn resolve(
    tenants: &dyn TenantRepository,
    tokens: &TokenIssuer,
    settings: &TenantSettings,
    headers: &HeaderMap,
    uri: &Uri,
) -> Result<TenantContext> {
    if let Some(tenant_id) = claimed_tenant(tokens, headers) {
        return Ok(match tenants.find_live_by_id(tenant_id).await? {
            Some(tenant) => TenantContext::resolved(ResolvedTenant::from(&tenant), TenantSource::Claim),
            None => {
                debug!(%tenant_id, "Token names a tenant that is no longer live");
                TenantContext::none()
            }
        });
    }

    if let Some(host) = tenant_host(settings, headers) {
        if let Some(tenant) = tenants.find_live_by_domain(&host).await? {
            return Ok(TenantContext::resolved(
                ResolvedTenant::from(&tenant),
                TenantSource::Subdomain,
            ));
        }
    }

    if let Some(tenant_id) = header_tenant_id(settings, headers) {
        if let Some(tenant) = tenants.find_live_by_id(tenant_id).await? {
            return Ok(TenantContext::resolved(
                ResolvedTenant::from(&tenant),
                TenantSource::Header,
            ));
        }
    }

    if let Some(tenant_id) = query_tenant_id(settings, uri) {
        if let Some(tenant) = tenants.find_live_by_id(tenant_id).await? {
            return Ok(TenantContext::resolved(
                ResolvedTenant::from(&tenant),
                TenantSource::Query,
            ));
        }
    }

    Ok(TenantContext::none())
}

/// Tenant claim of a valid bearer token. Invalid tokens are ignored here;
/// protected routes reject them in the auth middleware.
fn claimed_tenant(tokens: &TokenIssuer, headers: &HeaderMap) -> Option<Uuid> {
    let token = bearer_token(headers).ok().flatten()?;
    tokens.validate(token).ok()?.company_id
}

/// Host without port, when its first label can name a tenant
fn tenant_host(settings: &TenantSettings, headers: &HeaderMap) -> Option<String> {
    let host = headers.get(header::HOST)?.to_str().ok()?;
    let host = host.split(':').next()?.trim().to_ascii_lowercase();
    if !host.contains('.') {
        return None;
    }

    let label = host.split('.').next()?;
    if label.is_empty()
        || settings
            .ignored_subdomains
            .iter()
            .any(|ignored| ignored.eq_ignore_ascii_case(label))
    {
        return None;
    }

    Some(host)
}

fn header_tenant_id(settings: &TenantSettings, headers: &HeaderMap) -> Option<Uuid> {
    let value = headers.get(settings.header_name.as_str())?.to_str().ok()?;
    Uuid::parse_str(value.trim()).ok()
}

fn query_tenant_id(settings: &TenantSettings, uri: &Uri) -> Option<Uuid> {
    let Query(params) = Query::<HashMap<String, String>>::try_from_uri(uri).ok()?;
    params
        .get(&settings.query_param)
        .and_then(|value| Uuid::parse_str(value.trim()).ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;
    use tmis_core::{
        InMemoryStore, JwtSettings, Membership, NewPrincipal, RoleAssignment, Tenant,
    };

    struct Fixture {
        store: InMemoryStore,
        tokens: TokenIssuer,
        settings: TenantSettings,
        acme: Tenant,
        globex: Tenant,
        deleted: Tenant,
    }

    async fn fixture() -> Fixture {
        let store = InMemoryStore::new();
        let acme = Tenant::new("Acme", "acme.example.com");
        let globex = Tenant::new("Globex", "globex.example.com");
        let mut deleted = Tenant::new("Gone", "gone.example.com");
        deleted.is_deleted = true;
        for tenant in [&acme, &globex, &deleted] {
            store.create_tenant(tenant).await.unwrap();
        }

        Fixture {
            store,
            tokens: TokenIssuer::new(&JwtSettings {
                secret: "resolver-test-secret".to_string(),
                ..JwtSettings::default()
            })
            .unwrap(),
            settings: TenantSettings::default(),
            acme,
            globex,
            deleted,
        }
    }

    fn bearer_for(f: &Fixture, tenant_id: Option<Uuid>) -> HeaderValue {
        let principal = NewPrincipal {
            email: "jane@acme.test".to_string(),
            password_hash: String::new(),
            first_name: "Jane".to_string(),
            last_name: "Doe".to_string(),
            membership: Membership::from_parts(
                tenant_id,
                RoleAssignment {
                    role_id: Uuid::new_v4(),
                    role_name: "User".to_string(),
                },
            ),
            email_confirmed: true,
            is_active: true,
        }
        .into_principal(Uuid::new_v4(), chrono::Utc::now());
        let token = f.tokens.issue(&principal).unwrap().token;
        HeaderValue::from_str(&format!("Bearer {token}")).unwrap()
    }

    async fn run(f: &Fixture, headers: HeaderMap, uri: &str) -> TenantContext {
        let uri: Uri = uri.parse().unwrap();
        resolve(&f.store, &f.tokens, &f.settings, &headers, &uri)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_no_signal_is_no_tenant() {
        let f = fixture().await;
        let ctx = run(&f, HeaderMap::new(), "/api/admin/users").await;
        assert!(!ctx.is_multi_tenant());
        assert_eq!(ctx.tenant_id(), None);
    }

    #[tokio::test]
    async fn test_claim_outranks_weaker_signals() {
        let f = fixture().await;
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, bearer_for(&f, Some(f.acme.id)));
        headers.insert(header::HOST, HeaderValue::from_static("globex.example.com"));
        headers.insert(
            "X-Tenant-ID",
            HeaderValue::from_str(&f.globex.id.to_string()).unwrap(),
        );

        let ctx = run(&f, headers, "/api/auth/me").await;
        assert_eq!(ctx.tenant_id(), Some(f.acme.id));
        assert_eq!(ctx.source(), Some(TenantSource::Claim));
        assert_eq!(ctx.tenant_domain(), Some("acme.example.com"));
    }

    #[tokio::test]
    async fn test_claim_for_deleted_tenant_does_not_fall_through() {
        let f = fixture().await;
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, bearer_for(&f, Some(f.deleted.id)));
        headers.insert(
            "X-Tenant-ID",
            HeaderValue::from_str(&f.globex.id.to_string()).unwrap(),
        );

        let ctx = run(&f, headers, "/api/auth/me").await;
        assert!(!ctx.is_multi_tenant());
    }

    #[tokio::test]
    async fn test_system_token_falls_through_to_header() {
        let f = fixture().await;
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, bearer_for(&f, None));
        headers.insert(
            "X-Tenant-ID",
            HeaderValue::from_str(&f.globex.id.to_string()).unwrap(),
        );

        let ctx = run(&f, headers, "/api/admin/users").await;
        assert_eq!(ctx.tenant_id(), Some(f.globex.id));
        assert_eq!(ctx.source(), Some(TenantSource::Header));
    }

    #[tokio::test]
    async fn test_subdomain() {
        let f = fixture().await;
        let mut headers = HeaderMap::new();
        headers.insert(header::HOST, HeaderValue::from_static("ACME.example.com:8080"));

        let ctx = run(&f, headers, "/api/auth/login").await;
        assert_eq!(ctx.tenant_id(), Some(f.acme.id));
        assert_eq!(ctx.source(), Some(TenantSource::Subdomain));
    }

    #[tokio::test]
    async fn test_ignored_hosts() {
        let f = fixture().await;
        for host in ["www.acme.example.com", "localhost:3000", "localhost"] {
            let mut headers = HeaderMap::new();
            headers.insert(header::HOST, HeaderValue::from_str(host).unwrap());
            let ctx = run(&f, headers, "/").await;
            assert!(!ctx.is_multi_tenant(), "host {host} resolved a tenant");
        }
    }

    #[tokio::test]
    async fn test_deleted_tenant_header_falls_through_to_query() {
        let f = fixture().await;
        let mut headers = HeaderMap::new();
        headers.insert(
            "X-Tenant-ID",
            HeaderValue::from_str(&f.deleted.id.to_string()).unwrap(),
        );

        let ctx = run(&f, headers.clone(), "/api/admin/users").await;
        assert!(!ctx.is_multi_tenant());

        let uri = format!("/api/admin/users?page=1&tenantId={}", f.acme.id);
        let ctx = run(&f, headers, &uri).await;
        assert_eq!(ctx.tenant_id(), Some(f.acme.id));
        assert_eq!(ctx.source(), Some(TenantSource::Query));
    }

    #[tokio::test]
    async fn test_query_value_is_percent_decoded() {
        let f = fixture().await;
        let encoded = f.globex.id.to_string().replace('-', "%2D");

        let uri = format!("/api/admin/users?tenant%49d={encoded}");
        let ctx = run(&f, HeaderMap::new(), &uri).await;
        assert_eq!(ctx.tenant_id(), Some(f.globex.id));
        assert_eq!(ctx.source(), Some(TenantSource::Query));
    }

    #[tokio::test]
    async fn test_malformed_ids_are_ignored() {
        let f = fixture().await;
        let mut headers = HeaderMap::new();
        headers.insert("X-Tenant-ID", HeaderValue::from_static("not-a-uuid"));

        let ctx = run(&f, headers, "/api/admin/users?tenantId=42").await;
        assert!(!ctx.is_multi_tenant());
    }

    #[test]
    fn test_skip_prefixes() {
        let settings = TenantSettings::default();
        assert!(is_skipped(&settings, "/api/health"));
        assert!(is_skipped(&settings, "/api/health/live"));
        assert!(is_skipped(&settings, "/swagger-ui/index.html"));
        assert!(!is_skipped(&settings, "/api/auth/login"));
    }
}
