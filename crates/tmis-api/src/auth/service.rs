//! Authentication service
//!
//! Orchestrates login, registration, refresh and logout on top of the token
//! issuer, the refresh token rotation engine, the invitation service and the
//! password hasher. A session moves Anonymous -> Authenticated -> (rotate)
//! Authenticated -> Logged out and has no other states.
//!
//! Every credential failure of one operation is reported with the same
//! outward message; the precise reason only reaches the audit log.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tmis_core::{
    normalize_email, normalize_name, AuthFailure, Membership, NewPrincipal, Principal,
    Repositories, Result, Role, TenantContext, TmisError, DEFAULT_ROLE, REVOKED_BY_LOGOUT,
    REVOKED_INACTIVE,
};
use tracing::{debug, warn};
use utoipa::ToSchema;
use uuid::Uuid;
use validator::Validate;

use super::jwt::{IssuedAccessToken, TokenIssuer};
use super::password::{PasswordHasher, Verification};
use super::refresh::{IssuedRefreshToken, RefreshTokenService};
use crate::audit::{audit_log, AuditEvent};
use crate::invitation::InvitationService;
use crate::seed::USER_PERMISSIONS;

/// Login request
#[derive(Debug, Clone, Deserialize, Validate, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct LoginRequest {
    #[validate(email(message = "A valid email address is required"))]
    pub email: String,
    #[validate(length(min = 1, message = "Password is required"))]
    #[schema(format = Password)]
    pub password: String,
}

/// Registration request
#[derive(Clone, Deserialize, Validate, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct RegisterRequest {
    #[validate(email(message = "A valid email address is required"))]
    pub email: String,
    #[validate(length(min = 6, message = "Password must be at least 6 characters"))]
    #[schema(format = Password)]
    pub password: String,
    #[validate(length(min = 1, max = 100, message = "First name is required (max 100 characters)"))]
    pub first_name: String,
    #[validate(length(min = 1, max = 100, message = "Last name is required (max 100 characters)"))]
    pub last_name: String,
    #[validate(length(min = 1, message = "Invitation token is required"))]
    pub invitation_token: String,
}

impl std::fmt::Debug for RegisterRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegisterRequest")
            .field("email", &self.email)
            .field("first_name", &self.first_name)
            .field("last_name", &self.last_name)
            .finish_non_exhaustive()
    }
}

/// Principal summary returned to clients
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct UserSummary {
    pub id: Uuid,
    pub email: String,
    pub first_name: String,
    pub last_name: String,
    pub company_id: Option<Uuid>,
    pub company_name: Option<String>,
    pub role_id: Uuid,
    pub role_name: String,
    pub is_active: bool,
}

/// Access token, refresh token plaintext and the principal they belong to
#[derive(Debug, Clone)]
pub struct AuthResult {
    pub access_token: IssuedAccessToken,
    pub refresh_token: IssuedRefreshToken,
    pub user: UserSummary,
}

impl AuthResult {
    pub fn expires_at(&self) -> DateTime<Utc> {
        self.access_token.expires_at
    }
}

/// Network origin of the calling client
#[derive(Debug, Clone, Default)]
pub struct ClientInfo {
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
}

impl ClientInfo {
    pub fn from_headers(headers: &axum::http::HeaderMap) -> Self {
        Self {
            ip_address: crate::audit::extract_ip_address(headers),
            user_agent: crate::audit::extract_user_agent(headers),
        }
    }
}

#[derive(Clone)]
pub struct AuthService {
    repos: Repositories,
    tokens: TokenIssuer,
    refresh_tokens: RefreshTokenService,
    invitations: InvitationService,
    hasher: Arc<dyn PasswordHasher>,
}

impl AuthService {
    pub fn new(
        repos: Repositories,
        tokens: TokenIssuer,
        refresh_tokens: RefreshTokenService,
        invitations: InvitationService,
        hasher: Arc<dyn PasswordHasher>,
    ) -> Self {
        Self {
            repos,
            tokens,
            refresh_tokens,
            invitations,
            hasher,
        }
    }

    pub fn tokens(&self) -> &TokenIssuer {
        &self.tokens
    }

    pub fn hasher(&self) -> &Arc<dyn PasswordHasher> {
        &self.hasher
    }

    /// Authenticate with email and password.
    ///
    /// When several tenants hold the same email, the tenant resolved for the
    /// request picks the principal; without one the login is ambiguous and fails.
    pub async fn login(
        &self,
        request: &LoginRequest,
        tenant: &TenantContext,
        client: &ClientInfo,
    ) -> Result<AuthResult> {
        let fail = |reason: &str| {
            audit_log(&AuditEvent::LoginFailure {
                email: request.email.clone(),
                reason: reason.to_string(),
                ip_address: client.ip_address.clone(),
                user_agent: client.user_agent.clone(),
            });
            TmisError::auth(AuthFailure::InvalidCredentials)
        };

        let candidates = self
            .repos
            .principals
            .find_by_normalized_email(&normalize_email(&request.email))
            .await?;
        let candidates = self.live_candidates(candidates).await?;

        let principal = match select_login_candidate(candidates, tenant) {
            Ok(principal) => principal,
            Err(reason) => return Err(fail(reason)),
        };

        if !principal.is_active {
            return Err(fail("inactive"));
        }
        let Some(stored_hash) = principal.password_hash.as_deref() else {
            return Err(fail("no password set"));
        };

        match self.hasher.verify(stored_hash, &request.password) {
            Ok(Verification::Match) => {}
            Ok(Verification::MatchRehashNeeded) => self.rehash(&principal, &request.password).await,
            Ok(Verification::Mismatch) => return Err(fail("wrong password")),
            Err(e) => {
                warn!(user_id = %principal.id, error = %e, "Stored password hash is unusable");
                return Err(fail("unusable password hash"));
            }
        }

        let company_name = match self.live_company_name(&principal).await? {
            Ok(name) => name,
            Err(()) => return Err(fail("company deleted")),
        };

        let now = Utc::now();
        self.repos.principals.record_login(principal.id, now).await?;

        let result = self
            .issue_session(&principal, company_name, client.ip_address.clone())
            .await?;

        audit_log(&AuditEvent::LoginSuccess {
            user_id: principal.id,
            email: principal.email.clone(),
            tenant_id: principal.tenant_id(),
            ip_address: client.ip_address.clone(),
            user_agent: client.user_agent.clone(),
        });

        Ok(result)
    }

    /// Drop principals whose company has been soft-deleted
    async fn live_candidates(&self, candidates: Vec<Principal>) -> Result<Vec<Principal>> {
        let mut live = Vec::with_capacity(candidates.len());
        for principal in candidates {
            let keep = match principal.tenant_id() {
                Some(id) => self.repos.tenants.find_live_by_id(id).await?.is_some(),
                None => true,
            };
            if keep {
                live.push(principal);
            }
        }
        Ok(live)
    }

    async fn rehash(&self, principal: &Principal, password: &str) {
        let outcome = match self.hasher.hash(password) {
            Ok(hash) => self
                .repos
                .principals
                .update_password_hash(principal.id, &hash)
                .await
                .map_err(|e| e.to_string()),
            Err(e) => Err(e.to_string()),
        };

        match outcome {
            Ok(()) => debug!(user_id = %principal.id, "Password re-hashed with current parameters"),
            Err(e) => warn!(user_id = %principal.id, error = %e, "Password re-hash failed"),
        }
    }

    /// Register through an invitation.
    ///
    /// The invitation is marked used only after the principal is stored; a
    /// failure to mark it is logged and does not undo the registration.
    pub async fn register(
        &self,
        request: &RegisterRequest,
        client: &ClientInfo,
    ) -> Result<AuthResult> {
        let fail = |reason: &str, failure: AuthFailure| {
            audit_log(&AuditEvent::RegistrationFailure {
                email: request.email.clone(),
                reason: reason.to_string(),
                ip_address: client.ip_address.clone(),
            });
            TmisError::auth(failure)
        };

        let invitation = match self.invitations.validate(&request.invitation_token).await {
            Ok(invitation) => invitation,
            Err(TmisError::AuthenticationFailed(failure)) => {
                return Err(fail("invalid invitation", failure))
            }
            Err(e) => return Err(e),
        };
        let tenant_id = invitation.tenant_id;

        let email = normalize_email(&request.email);
        if self
            .repos
            .principals
            .email_exists(Some(tenant_id), &email)
            .await?
        {
            return Err(fail("email already registered", AuthFailure::RegistrationRejected));
        }

        let role = self.default_role(tenant_id).await?;
        let password_hash = self
            .hasher
            .hash(&request.password)
            .map_err(|e| TmisError::Other(anyhow::anyhow!(e)))?;

        let principal = match self
            .repos
            .principals
            .create_principal(NewPrincipal {
                email: request.email.trim().to_string(),
                password_hash,
                first_name: request.first_name.trim().to_string(),
                last_name: request.last_name.trim().to_string(),
                membership: Membership::Tenant {
                    tenant_id,
                    role: role.assignment(),
                },
                email_confirmed: true,
                is_active: true,
            })
            .await
        {
            Ok(principal) => principal,
            Err(TmisError::Conflict(_)) => {
                return Err(fail("email already registered", AuthFailure::RegistrationRejected))
            }
            Err(e) => return Err(e),
        };

        match self
            .invitations
            .mark_used(&invitation.token, principal.id, &principal.email)
            .await
        {
            Ok(true) => {}
            Ok(false) => warn!(
                user_id = %principal.id,
                invitation_id = %invitation.id,
                "Invitation was already consumed when registration completed"
            ),
            Err(e) => warn!(
                user_id = %principal.id,
                invitation_id = %invitation.id,
                error = %e,
                "Failed to mark invitation used"
            ),
        }

        let result = self
            .issue_session(
                &principal,
                Some(invitation.tenant_name.clone()),
                client.ip_address.clone(),
            )
            .await?;

        audit_log(&AuditEvent::RegistrationSuccess {
            user_id: principal.id,
            email: principal.email.clone(),
            tenant_id,
            ip_address: client.ip_address.clone(),
        });

        Ok(result)
    }

    /// The tenant's default role, created on first use
    async fn default_role(&self, tenant_id: Uuid) -> Result<Role> {
        let name = normalize_name(DEFAULT_ROLE);
        if let Some(role) = self.repos.roles.find_role(Some(tenant_id), &name).await? {
            return Ok(role);
        }

        let mut role = Role::new(
            Some(tenant_id),
            DEFAULT_ROLE,
            USER_PERMISSIONS.iter().map(|p| p.to_string()).collect(),
        );
        role.description = Some("Regular User".to_string());

        match self.repos.roles.create_role(&role).await {
            Ok(()) => Ok(role),
            // Another registration created it first
            Err(TmisError::Conflict(_)) => self
                .repos
                .roles
                .find_role(Some(tenant_id), &name)
                .await?
                .ok_or_else(|| TmisError::Database("default role vanished".to_string())),
            Err(e) => Err(e),
        }
    }

    /// Exchange a refresh token for a new access token and a rotated refresh token
    pub async fn refresh(&self, plaintext: Option<&str>, client: &ClientInfo) -> Result<AuthResult> {
        let plaintext = plaintext
            .filter(|p| !p.is_empty())
            .ok_or_else(|| TmisError::auth(AuthFailure::MissingRefreshToken))?;
        let invalid = || TmisError::auth(AuthFailure::InvalidRefreshToken);

        let current = self
            .refresh_tokens
            .redeem(plaintext, client.ip_address.as_deref())
            .await?;

        let principal = self
            .repos
            .principals
            .find_principal(current.principal_id)
            .await?
            .ok_or_else(invalid)?;

        // A deactivated principal's outstanding tokens stop working here
        if !principal.is_active {
            debug!(user_id = %principal.id, "Refresh refused for inactive principal");
            if let Err(e) = self
                .refresh_tokens
                .revoke_all(principal.id, REVOKED_INACTIVE, client.ip_address.clone())
                .await
            {
                warn!(user_id = %principal.id, error = %e, "Failed to revoke tokens of inactive principal");
            }
            return Err(invalid());
        }
        let company_name = self.live_company_name(&principal).await?.map_err(|()| invalid())?;

        let rotation = self
            .refresh_tokens
            .replace(current, client.ip_address.clone())
            .await?;
        let access_token = self
            .tokens
            .issue(&principal)
            .map_err(|e| TmisError::Other(anyhow::anyhow!(e)))?;

        audit_log(&AuditEvent::TokenRefresh {
            user_id: principal.id,
            ip_address: client.ip_address.clone(),
        });

        Ok(AuthResult {
            access_token,
            refresh_token: rotation.issued,
            user: summarize(&principal, company_name),
        })
    }

    /// Revoke the presented refresh token. Never fails from the caller's view.
    pub async fn logout(
        &self,
        plaintext: Option<&str>,
        user_id: Option<Uuid>,
        client: &ClientInfo,
    ) -> bool {
        let revoked = match plaintext.filter(|p| !p.is_empty()) {
            Some(plaintext) => match self
                .refresh_tokens
                .revoke(plaintext, REVOKED_BY_LOGOUT, client.ip_address.clone())
                .await
            {
                Ok(revoked) => revoked,
                Err(e) => {
                    warn!(error = %e, "Refresh token revocation failed during logout");
                    false
                }
            },
            None => false,
        };

        audit_log(&AuditEvent::Logout {
            user_id,
            token_revoked: revoked,
            ip_address: client.ip_address.clone(),
        });

        revoked
    }

    /// Summary of the principal behind a validated access token
    pub async fn current_user(&self, user_id: Uuid) -> Result<UserSummary> {
        let principal = self
            .repos
            .principals
            .find_principal(user_id)
            .await?
            .ok_or_else(|| TmisError::auth(AuthFailure::InvalidAccessToken))?;
        let company_name = self
            .live_company_name(&principal)
            .await?
            .map_err(|()| TmisError::auth(AuthFailure::InvalidAccessToken))?;
        Ok(summarize(&principal, company_name))
    }

    async fn issue_session(
        &self,
        principal: &Principal,
        company_name: Option<String>,
        ip: Option<String>,
    ) -> Result<AuthResult> {
        let access_token = self
            .tokens
            .issue(principal)
            .map_err(|e| TmisError::Other(anyhow::anyhow!(e)))?;
        let refresh_token = self.refresh_tokens.issue_for(principal.id, ip).await?;

        Ok(AuthResult {
            access_token,
            refresh_token,
            user: summarize(principal, company_name),
        })
    }

    /// Tenant name for tenant principals; `Err(())` when the tenant is gone
    async fn live_company_name(
        &self,
        principal: &Principal,
    ) -> Result<std::result::Result<Option<String>, ()>> {
        match principal.tenant_id() {
            None => Ok(Ok(None)),
            Some(id) => Ok(self
                .repos
                .tenants
                .find_live_by_id(id)
                .await?
                .map(|t| Some(t.name))
                .ok_or(())),
        }
    }
}

fn select_login_candidate(
    mut candidates: Vec<Principal>,
    tenant: &TenantContext,
) -> std::result::Result<Principal, &'static str> {
    if let Some(tenant_id) = tenant.tenant_id() {
        if let Some(pos) = candidates
            .iter()
            .position(|p| p.tenant_id() == Some(tenant_id))
        {
            return Ok(candidates.swap_remove(pos));
        }
    }

    match candidates.len() {
        0 => Err("unknown email"),
        1 => Ok(candidates.remove(0)),
        _ => Err("email ambiguous across companies"),
    }
}

pub fn summarize(principal: &Principal, company_name: Option<String>) -> UserSummary {
    let role = principal.membership.role();
    UserSummary {
        id: principal.id,
        email: principal.email.clone(),
        first_name: principal.first_name.clone(),
        last_name: principal.last_name.clone(),
        company_id: principal.tenant_id(),
        company_name,
        role_id: role.role_id,
        role_name: role.role_name.clone(),
        is_active: principal.is_active,
    }
}
