//! Persistence seams
//!
//! Each aggregate is reached through one repository trait. Services hold
//! `Arc<dyn ...>` handles so the same code runs on PostgreSQL ([`crate::PgStore`])
//! and on the in-process store used by tests ([`crate::InMemoryStore`]).

use crate::{
    Invitation, NewPrincipal, Principal, RefreshTokenRecord, Result, Revocation, Role, Tenant,
    TenantContext,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use uuid::Uuid;

/// Tenant lookups. Soft-deleted tenants are invisible to every method.
#[async_trait]
pub trait TenantRepository: Send + Sync {
    async fn find_live_by_id(&self, id: Uuid) -> Result<Option<Tenant>>;

    /// Case-insensitive match on the tenant domain
    async fn find_live_by_domain(&self, domain: &str) -> Result<Option<Tenant>>;

    async fn create_tenant(&self, tenant: &Tenant) -> Result<()>;

    async fn count_live(&self) -> Result<i64>;
}

#[async_trait]
pub trait RoleRepository: Send + Sync {
    async fn find_role(&self, tenant_id: Option<Uuid>, normalized_name: &str)
        -> Result<Option<Role>>;

    /// Fails with [`crate::TmisError::Conflict`] when `(tenant_id, normalized_name)` exists
    async fn create_role(&self, role: &Role) -> Result<()>;
}

#[async_trait]
pub trait PrincipalRepository: Send + Sync {
    async fn find_principal(&self, id: Uuid) -> Result<Option<Principal>>;

    /// All principals with this normalized email, across tenants
    async fn find_by_normalized_email(&self, normalized_email: &str) -> Result<Vec<Principal>>;

    async fn email_exists(&self, tenant_id: Option<Uuid>, normalized_email: &str) -> Result<bool>;

    /// Fails with [`crate::TmisError::Conflict`] when the email is taken within the tenant
    async fn create_principal(&self, principal: NewPrincipal) -> Result<Principal>;

    async fn update_password_hash(&self, id: Uuid, password_hash: &str) -> Result<()>;

    async fn record_login(&self, id: Uuid, at: DateTime<Utc>) -> Result<()>;

    async fn set_active(&self, id: Uuid, active: bool) -> Result<()>;

    /// Principals visible through the tenant context
    async fn list_principals(&self, scope: &TenantContext) -> Result<Vec<Principal>>;
}

/// Result of a compare-and-swap rotation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RotationOutcome {
    /// Old record revoked and replacement stored in one transaction
    Rotated,
    /// The old record changed since it was read; nothing was written
    Conflict,
}

#[async_trait]
pub trait RefreshTokenRepository: Send + Sync {
    async fn insert_token(&self, record: &RefreshTokenRecord) -> Result<()>;

    async fn find_by_hash(&self, token_hash: &str) -> Result<Option<RefreshTokenRecord>>;

    /// Atomically revoke `current` (only if its version is unchanged and it is
    /// still unrevoked), point it at `replacement`, and insert `replacement`.
    async fn rotate(
        &self,
        current: &RefreshTokenRecord,
        revocation: &Revocation,
        replacement: &RefreshTokenRecord,
    ) -> Result<RotationOutcome>;

    /// Revoke by hash. Returns false when no unrevoked record matched.
    async fn revoke_by_hash(&self, token_hash: &str, revocation: &Revocation) -> Result<bool>;

    /// Revoke every live token of a principal; returns how many were revoked
    async fn revoke_all_for_principal(
        &self,
        principal_id: Uuid,
        revocation: &Revocation,
    ) -> Result<u64>;
}

#[async_trait]
pub trait InvitationRepository: Send + Sync {
    async fn insert_invitation(&self, invitation: &Invitation) -> Result<()>;

    async fn find_by_token(&self, token: &str) -> Result<Option<Invitation>>;

    /// One-way `is_used` transition. Returns false when missing or already used.
    async fn mark_used(
        &self,
        token: &str,
        principal_id: Uuid,
        email: &str,
        at: DateTime<Utc>,
    ) -> Result<bool>;

    async fn list_invitations(&self, scope: &TenantContext) -> Result<Vec<Invitation>>;
}

/// Connectivity probe for health checks
#[async_trait]
pub trait StoreHealth: Send + Sync {
    async fn ping(&self) -> Result<()>;
}

/// Bundle of repository handles shared by the services
#[derive(Clone)]
pub struct Repositories {
    pub tenants: Arc<dyn TenantRepository>,
    pub roles: Arc<dyn RoleRepository>,
    pub principals: Arc<dyn PrincipalRepository>,
    pub refresh_tokens: Arc<dyn RefreshTokenRepository>,
    pub invitations: Arc<dyn InvitationRepository>,
    pub health: Arc<dyn StoreHealth>,
}

impl Repositories {
    /// Use one store for every aggregate
    pub fn from_store<S>(store: Arc<S>) -> Self
    where
        S: TenantRepository
            + RoleRepository
            + PrincipalRepository
            + RefreshTokenRepository
            + InvitationRepository
            + StoreHealth
            + 'static,
    {
        Self {
            tenants: store.clone(),
            roles: store.clone(),
            principals: store.clone(),
            refresh_tokens: store.clone(),
            invitations: store.clone(),
            health: store,
        }
    }
}
