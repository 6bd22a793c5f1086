//! Invitation service
//!
//! Invitations are single-use, time-boxed join tokens for one tenant. Unlike
//! refresh tokens they are stored as issued: they are short-lived, low
//! privilege and meant to be pasted into a shareable link.

use chrono::{Duration, Utc};
use std::sync::Arc;
use tmis_core::{
    AuthFailure, Invitation, InvitationRepository, Result, TenantContext, TenantRepository,
    TmisError,
};
use uuid::Uuid;

use crate::audit::{audit_log, AuditEvent};
use crate::auth::refresh::generate_opaque_token;

#[derive(Clone)]
pub struct InvitationService {
    invitations: Arc<dyn InvitationRepository>,
    tenants: Arc<dyn TenantRepository>,
    default_expiration_hours: i64,
}

impl InvitationService {
    pub fn new(
        invitations: Arc<dyn InvitationRepository>,
        tenants: Arc<dyn TenantRepository>,
        default_expiration_hours: i64,
    ) -> Self {
        Self {
            invitations,
            tenants,
            default_expiration_hours,
        }
    }

    /// Issue an invitation for a live tenant.
    ///
    /// `expiration_hours` of `None` or a non-positive value uses the configured default.
    pub async fn create(
        &self,
        tenant_id: Uuid,
        expiration_hours: Option<i64>,
        created_by: Option<Uuid>,
    ) -> Result<Invitation> {
        let tenant = self
            .tenants
            .find_live_by_id(tenant_id)
            .await?
            .ok_or_else(|| TmisError::NotFound(format!("Company {tenant_id}")))?;

        let hours = expiration_hours
            .filter(|h| *h > 0)
            .unwrap_or(self.default_expiration_hours);
        let now = Utc::now();

        let invitation = Invitation {
            id: Uuid::new_v4(),
            token: generate_opaque_token(),
            tenant_id: tenant.id,
            tenant_name: tenant.name,
            expires_at: now + Duration::hours(hours),
            is_used: false,
            used_at: None,
            used_by_principal_id: None,
            used_by_email: None,
            created_at: now,
        };
        self.invitations.insert_invitation(&invitation).await?;

        audit_log(&AuditEvent::InvitationCreated {
            invitation_id: invitation.id,
            tenant_id: invitation.tenant_id,
            created_by,
            expires_at: invitation.expires_at,
        });

        Ok(invitation)
    }

    /// Return the invitation if it is unused, unexpired and its tenant is live.
    ///
    /// Every failure is the same [`AuthFailure::InvalidInvitation`].
    pub async fn validate(&self, token: &str) -> Result<Invitation> {
        let invalid = || TmisError::auth(AuthFailure::InvalidInvitation);

        if token.trim().is_empty() {
            return Err(invalid());
        }

        let invitation = self
            .invitations
            .find_by_token(token)
            .await?
            .filter(|inv| inv.is_valid_at(Utc::now()))
            .ok_or_else(invalid)?;

        if self
            .tenants
            .find_live_by_id(invitation.tenant_id)
            .await?
            .is_none()
        {
            return Err(invalid());
        }

        Ok(invitation)
    }

    /// Record consumption. A second call for the same token returns false.
    pub async fn mark_used(&self, token: &str, principal_id: Uuid, email: &str) -> Result<bool> {
        let marked = self
            .invitations
            .mark_used(token, principal_id, email, Utc::now())
            .await?;

        if marked {
            if let Some(invitation) = self.invitations.find_by_token(token).await? {
                audit_log(&AuditEvent::InvitationConsumed {
                    invitation_id: invitation.id,
                    tenant_id: invitation.tenant_id,
                    user_id: principal_id,
                    email: email.to_string(),
                });
            }
        }

        Ok(marked)
    }

    /// Invitations visible through the tenant context
    pub async fn list(&self, scope: &TenantContext) -> Result<Vec<Invitation>> {
        self.invitations.list_invitations(scope).await
    }
}
