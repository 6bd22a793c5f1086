//! Tenant-scoped user administration
//!
//! Every read goes through the request's [`TenantContext`]: a resolved tenant
//! sees its own principals only, and the unscoped view is reserved for
//! system administrators.
//!
//! Author: hephaex@gmail.com

use crate::auth::service::summarize;
use crate::auth::{AuthenticatedPrincipal, UserSummary};
use crate::error::AppError;
use crate::handlers::invitations::ensure_scope;
use crate::state::AppState;
use axum::{
    extract::{Path, State},
    http::HeaderMap,
    response::IntoResponse,
    Extension, Json,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tmis_core::{Principal, TenantContext};
use utoipa::ToSchema;
use uuid::Uuid;

/// Principal counts for one company
#[derive(Debug, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CompanyUserCount {
    /// `None` for system principals
    pub company_id: Option<Uuid>,
    pub count: usize,
}

/// User statistics within the current scope
#[derive(Debug, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct UserStats {
    pub total_users: usize,
    pub active_users: usize,
    pub inactive_users: usize,
    pub users_by_company: Vec<CompanyUserCount>,
}

impl UserStats {
    fn from_principals(principals: &[Principal]) -> Self {
        let active = principals.iter().filter(|p| p.is_active).count();

        let mut by_company: BTreeMap<Option<Uuid>, usize> = BTreeMap::new();
        for principal in principals {
            *by_company.entry(principal.tenant_id()).or_default() += 1;
        }

        Self {
            total_users: principals.len(),
            active_users: active,
            inactive_users: principals.len() - active,
            users_by_company: by_company
                .into_iter()
                .map(|(company_id, count)| CompanyUserCount { company_id, count })
                .collect(),
        }
    }
}

async fn summaries(state: &AppState, principals: Vec<Principal>) -> tmis_core::Result<Vec<UserSummary>> {
    let mut names: HashMap<Uuid, Option<String>> = HashMap::new();
    let mut out = Vec::with_capacity(principals.len());

    for principal in principals {
        let company_name = match principal.tenant_id() {
            Some(id) => {
                if !names.contains_key(&id) {
                    let name = state.repos.tenants.find_live_by_id(id).await?.map(|t| t.name);
                    names.insert(id, name);
                }
                names.get(&id).cloned().flatten()
            }
            None => None,
        };
        out.push(summarize(&principal, company_name));
    }

    Ok(out)
}

/// List users in scope
#[utoipa::path(
    get,
    path = "/api/admin/users",
    tag = "users",
    responses(
        (status = 200, description = "Users in scope", body = [UserSummary]),
        (status = 403, description = "No company in scope", body = crate::error::ApiError),
    ),
    security(
        ("bearer_auth" = [])
    )
)]
pub async fn list_users(
    State(state): State<Arc<AppState>>,
    Extension(principal): Extension<AuthenticatedPrincipal>,
    Extension(tenant): Extension<TenantContext>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, AppError> {
    ensure_scope(&principal, &tenant, &headers, "users")?;

    let principals = state.repos.principals.list_principals(&tenant).await?;
    Ok(Json(summaries(&state, principals).await?))
}

/// Get one user in scope
#[utoipa::path(
    get,
    path = "/api/admin/users/{id}",
    tag = "users",
    params(
        ("id" = Uuid, Path, description = "User ID")
    ),
    responses(
        (status = 200, description = "User", body = UserSummary),
        (status = 404, description = "User not found in scope", body = crate::error::ApiError),
    ),
    security(
        ("bearer_auth" = [])
    )
)]
pub async fn get_user(
    State(state): State<Arc<AppState>>,
    Extension(principal): Extension<AuthenticatedPrincipal>,
    Extension(tenant): Extension<TenantContext>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, AppError> {
    ensure_scope(&principal, &tenant, &headers, "users")?;

    let principals = state.repos.principals.list_principals(&tenant).await?;
    if !tenant.has_access(&principals, id) {
        return Err(AppError::NotFound("User".to_string()));
    }

    let found: Vec<Principal> = tenant
        .scope(principals)
        .filter(|p| p.id == id)
        .collect();
    let summary = summaries(&state, found)
        .await?
        .pop()
        .ok_or_else(|| AppError::NotFound("User".to_string()))?;

    Ok(Json(summary))
}

/// User statistics in scope
#[utoipa::path(
    get,
    path = "/api/admin/users/stats",
    tag = "users",
    responses(
        (status = 200, description = "User statistics", body = UserStats),
        (status = 403, description = "No company in scope", body = crate::error::ApiError),
    ),
    security(
        ("bearer_auth" = [])
    )
)]
pub async fn user_stats(
    State(state): State<Arc<AppState>>,
    Extension(principal): Extension<AuthenticatedPrincipal>,
    Extension(tenant): Extension<TenantContext>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, AppError> {
    ensure_scope(&principal, &tenant, &headers, "users")?;

    let principals = state.repos.principals.list_principals(&tenant).await?;
    let principals: Vec<Principal> = tenant.scope(principals).collect();

    Ok(Json(UserStats::from_principals(&principals)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use tmis_core::{Membership, NewPrincipal, RoleAssignment};

    fn principal(tenant: Option<Uuid>, active: bool) -> Principal {
        NewPrincipal {
            email: format!("{}@example.test", Uuid::new_v4()),
            password_hash: String::new(),
            first_name: "A".to_string(),
            last_name: "B".to_string(),
            membership: Membership::from_parts(
                tenant,
                RoleAssignment {
                    role_id: Uuid::new_v4(),
                    role_name: "User".to_string(),
                },
            ),
            email_confirmed: true,
            is_active: active,
        }
        .into_principal(Uuid::new_v4(), Utc::now())
    }

    #[test]
    fn test_stats_grouping() {
        let acme = Uuid::new_v4();
        let principals = vec![
            principal(Some(acme), true),
            principal(Some(acme), false),
            principal(None, true),
        ];

        let stats = UserStats::from_principals(&principals);
        assert_eq!(stats.total_users, 3);
        assert_eq!(stats.active_users, 2);
        assert_eq!(stats.inactive_users, 1);
        assert_eq!(stats.users_by_company.len(), 2);

        let acme_count = stats
            .users_by_company
            .iter()
            .find(|c| c.company_id == Some(acme))
            .map(|c| c.count);
        assert_eq!(acme_count, Some(2));
    }
}
