//! Invitation handlers
//!
//! Author: hephaex@gmail.com

use crate::audit::{audit_log, extract_ip_address, AuditEvent};
use crate::auth::AuthenticatedPrincipal;
use crate::error::AppError;
use crate::extract::AppJson;
use crate::state::AppState;
use axum::{extract::State, http::HeaderMap, response::IntoResponse, Extension, Json};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tmis_core::{Invitation, TenantContext, TmisError};
use utoipa::ToSchema;
use uuid::Uuid;
use validator::Validate;

/// Create invitation request
#[derive(Debug, Clone, Deserialize, Validate, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CreateInvitationRequest {
    pub company_id: Uuid,
    /// Hours until expiry, defaults to the configured value
    #[validate(range(min = 1, max = 720, message = "Expiration must be between 1 and 720 hours"))]
    pub expiration_hours: Option<i64>,
}

/// Validate invitation request
#[derive(Clone, Deserialize, Validate, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ValidateInvitationRequest {
    #[validate(length(min = 1, message = "Invitation token is required"))]
    pub token: String,
}

/// Issued invitation
#[derive(Debug, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct InvitationResponse {
    pub id: Uuid,
    pub token: String,
    pub company_id: Uuid,
    pub company_name: String,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl From<Invitation> for InvitationResponse {
    fn from(invitation: Invitation) -> Self {
        Self {
            id: invitation.id,
            token: invitation.token,
            company_id: invitation.tenant_id,
            company_name: invitation.tenant_name,
            expires_at: invitation.expires_at,
            created_at: invitation.created_at,
        }
    }
}

/// Result of validating an invitation token
#[derive(Debug, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct InvitationValidationResponse {
    pub is_valid: bool,
    pub company_id: Uuid,
    pub company_name: String,
    pub expires_at: DateTime<Utc>,
}

/// Invitation as listed to administrators; the token is not repeated
#[derive(Debug, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct InvitationSummary {
    pub id: Uuid,
    pub company_id: Uuid,
    pub company_name: String,
    pub expires_at: DateTime<Utc>,
    pub is_used: bool,
    pub used_at: Option<DateTime<Utc>>,
    pub used_by_email: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl From<Invitation> for InvitationSummary {
    fn from(invitation: Invitation) -> Self {
        Self {
            id: invitation.id,
            company_id: invitation.tenant_id,
            company_name: invitation.tenant_name,
            expires_at: invitation.expires_at,
            is_used: invitation.is_used,
            used_at: invitation.used_at,
            used_by_email: invitation.used_by_email,
            created_at: invitation.created_at,
        }
    }
}

/// Tenant admins act on their own tenant only; system admins on any
pub(crate) fn ensure_manages_tenant(
    principal: &AuthenticatedPrincipal,
    tenant_id: Uuid,
    headers: &HeaderMap,
) -> Result<(), AppError> {
    if principal.is_system_admin() || principal.tenant_id() == Some(tenant_id) {
        return Ok(());
    }

    audit_log(&AuditEvent::AccessDenied {
        user_id: Some(principal.user_id),
        email: Some(principal.email.clone()),
        resource: format!("company:{tenant_id}"),
        required_role: None,
        ip_address: extract_ip_address(headers),
    });
    Err(AppError::Forbidden("Cannot manage another company".to_string()))
}

/// Cross-tenant views need a system administrator
pub(crate) fn ensure_scope(
    principal: &AuthenticatedPrincipal,
    tenant: &TenantContext,
    headers: &HeaderMap,
    resource: &str,
) -> Result<(), AppError> {
    if tenant.is_multi_tenant() || principal.is_system_admin() {
        return Ok(());
    }

    audit_log(&AuditEvent::AccessDenied {
        user_id: Some(principal.user_id),
        email: Some(principal.email.clone()),
        resource: resource.to_string(),
        required_role: None,
        ip_address: extract_ip_address(headers),
    });
    Err(AppError::Forbidden("No company in scope".to_string()))
}

/// Create an invitation for a company
#[utoipa::path(
    post,
    path = "/api/admin/invitations",
    tag = "invitations",
    request_body = CreateInvitationRequest,
    responses(
        (status = 200, description = "Invitation created", body = InvitationResponse),
        (status = 400, description = "Invalid input or unknown company", body = crate::error::ApiError),
        (status = 403, description = "Not allowed for this company", body = crate::error::ApiError),
    ),
    security(
        ("bearer_auth" = [])
    )
)]
pub async fn create_invitation(
    State(state): State<Arc<AppState>>,
    Extension(principal): Extension<AuthenticatedPrincipal>,
    headers: HeaderMap,
    AppJson(request): AppJson<CreateInvitationRequest>,
) -> Result<impl IntoResponse, AppError> {
    request.validate()?;
    ensure_manages_tenant(&principal, request.company_id, &headers)?;

    let invitation = state
        .invitations
        .create(
            request.company_id,
            request.expiration_hours,
            Some(principal.user_id),
        )
        .await
        .map_err(|e| match e {
            TmisError::NotFound(_) => AppError::BadRequest(
                "Company not found or invitation creation failed".to_string(),
            ),
            other => other.into(),
        })?;

    Ok(Json(InvitationResponse::from(invitation)))
}

async fn validate_token(
    state: &AppState,
    request: &ValidateInvitationRequest,
) -> Result<InvitationValidationResponse, AppError> {
    request.validate()?;

    let invitation = state
        .invitations
        .validate(&request.token)
        .await
        .map_err(|e| match e {
            TmisError::AuthenticationFailed(_) => {
                AppError::BadRequest("Invalid or expired invitation token".to_string())
            }
            other => other.into(),
        })?;

    Ok(InvitationValidationResponse {
        is_valid: true,
        company_id: invitation.tenant_id,
        company_name: invitation.tenant_name,
        expires_at: invitation.expires_at,
    })
}

/// Validate an invitation token (administrators)
#[utoipa::path(
    post,
    path = "/api/admin/invitations/validate",
    tag = "invitations",
    request_body = ValidateInvitationRequest,
    responses(
        (status = 200, description = "Invitation is valid", body = InvitationValidationResponse),
        (status = 400, description = "Invalid or expired invitation", body = crate::error::ApiError),
    ),
    security(
        ("bearer_auth" = [])
    )
)]
pub async fn admin_validate_invitation(
    State(state): State<Arc<AppState>>,
    AppJson(request): AppJson<ValidateInvitationRequest>,
) -> Result<impl IntoResponse, AppError> {
    Ok(Json(validate_token(&state, &request).await?))
}

/// Validate an invitation token before registering
#[utoipa::path(
    post,
    path = "/api/user/invitations/validate",
    tag = "invitations",
    request_body = ValidateInvitationRequest,
    responses(
        (status = 200, description = "Invitation is valid", body = InvitationValidationResponse),
        (status = 400, description = "Invalid or expired invitation", body = crate::error::ApiError),
    )
)]
pub async fn validate_invitation(
    State(state): State<Arc<AppState>>,
    AppJson(request): AppJson<ValidateInvitationRequest>,
) -> Result<impl IntoResponse, AppError> {
    Ok(Json(validate_token(&state, &request).await?))
}

/// List invitations of the company in scope
#[utoipa::path(
    get,
    path = "/api/admin/invitations",
    tag = "invitations",
    responses(
        (status = 200, description = "Invitations", body = [InvitationSummary]),
        (status = 403, description = "No company in scope", body = crate::error::ApiError),
    ),
    security(
        ("bearer_auth" = [])
    )
)]
pub async fn list_invitations(
    State(state): State<Arc<AppState>>,
    Extension(principal): Extension<AuthenticatedPrincipal>,
    Extension(tenant): Extension<TenantContext>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, AppError> {
    ensure_scope(&principal, &tenant, &headers, "invitations")?;

    let invitations: Vec<InvitationSummary> = state
        .invitations
        .list(&tenant)
        .await?
        .into_iter()
        .map(InvitationSummary::from)
        .collect();

    Ok(Json(invitations))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tmis_core::{Membership, RoleAssignment};

    fn admin(tenant: Option<Uuid>) -> AuthenticatedPrincipal {
        AuthenticatedPrincipal {
            user_id: Uuid::new_v4(),
            email: "admin@acme.test".to_string(),
            name: "Admin".to_string(),
            membership: Membership::from_parts(
                tenant,
                RoleAssignment {
                    role_id: Uuid::new_v4(),
                    role_name: "Admin".to_string(),
                },
            ),
            is_active: true,
            jti: Uuid::new_v4(),
        }
    }

    #[test]
    fn test_tenant_admin_limited_to_own_company() {
        let own = Uuid::new_v4();
        let headers = HeaderMap::new();
        assert!(ensure_manages_tenant(&admin(Some(own)), own, &headers).is_ok());
        assert!(matches!(
            ensure_manages_tenant(&admin(Some(own)), Uuid::new_v4(), &headers),
            Err(AppError::Forbidden(_))
        ));
        assert!(ensure_manages_tenant(&admin(None), Uuid::new_v4(), &headers).is_ok());
    }

    #[test]
    fn test_unscoped_listing_requires_system_admin() {
        let headers = HeaderMap::new();
        let none = TenantContext::none();
        assert!(ensure_scope(&admin(None), &none, &headers, "users").is_ok());
        assert!(ensure_scope(&admin(Some(Uuid::new_v4())), &none, &headers, "users").is_err());
    }

    #[test]
    fn test_expiration_hours_range() {
        let request = CreateInvitationRequest {
            company_id: Uuid::new_v4(),
            expiration_hours: Some(0),
        };
        assert!(request.validate().is_err());

        let request = CreateInvitationRequest {
            company_id: Uuid::new_v4(),
            expiration_hours: None,
        };
        assert!(request.validate().is_ok());
    }
}
