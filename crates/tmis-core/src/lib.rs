//! TMIS Core - Domain models, tenant isolation and persistence seams
//!
//! This crate defines the abstractions the authentication service is built on:
//! - Tenants, roles, principals, refresh token records and invitations
//! - Request-scoped tenant context and the tenant-aware collection filter
//! - Repository traits with PostgreSQL and in-memory implementations
//! - Common error types
//! - Configuration management
//!
//! Author: hephaex@gmail.com

pub mod config;
pub mod memory;
pub mod postgres;
pub mod store;
pub mod tenant;

pub use config::{AppConfig, ConfigError, Environment, JwtSettings, SameSitePolicy};
pub use memory::InMemoryStore;
pub use postgres::PgStore;
pub use store::{
    InvitationRepository, PrincipalRepository, RefreshTokenRepository, Repositories,
    RoleRepository, RotationOutcome, StoreHealth, TenantRepository,
};
pub use tenant::{ResolvedTenant, TenantContext, TenantOwned, TenantSource};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

// ============================================================================
// Error Types
// ============================================================================

/// Which authentication precondition failed.
///
/// Only used for diagnostics. Every variant of one operation maps to the same
/// outward message so callers cannot enumerate accounts, tenants or tokens.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthFailure {
    InvalidCredentials,
    InvalidRefreshToken,
    MissingRefreshToken,
    InvalidInvitation,
    RegistrationRejected,
    InvalidAccessToken,
}

impl AuthFailure {
    /// Message returned to the client
    pub fn public_message(self) -> &'static str {
        match self {
            Self::InvalidCredentials => "Invalid email or password",
            Self::InvalidRefreshToken => "Invalid or expired refresh token",
            Self::MissingRefreshToken => "No refresh token found",
            Self::InvalidInvitation | Self::RegistrationRejected => "Registration failed",
            Self::InvalidAccessToken => "Authentication required",
        }
    }
}

/// A single field-level validation message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldError {
    pub field: String,
    pub message: String,
}

impl FieldError {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

/// Core error types for TMIS operations
#[derive(Error, Debug)]
pub enum TmisError {
    #[error("Authentication failed: {0:?}")]
    AuthenticationFailed(AuthFailure),

    #[error("Concurrent modification: {0}")]
    Conflict(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Validation failed: {0:?}")]
    Validation(Vec<FieldError>),

    #[error("Entity not found: {0}")]
    NotFound(String),

    #[error("Access denied: {0}")]
    Forbidden(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl TmisError {
    pub fn auth(reason: AuthFailure) -> Self {
        Self::AuthenticationFailed(reason)
    }

    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation(vec![FieldError::new(field, message)])
    }
}

impl From<ConfigError> for TmisError {
    fn from(err: ConfigError) -> Self {
        Self::Configuration(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, TmisError>;

/// Case-normalize an email address for lookups
pub fn normalize_email(email: &str) -> String {
    email.trim().to_uppercase()
}

/// Case-normalize a role name or tenant domain
pub fn normalize_name(name: &str) -> String {
    name.trim().to_uppercase()
}

// ============================================================================
// Tenants
// ============================================================================

/// Isolation boundary (a company)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tenant {
    pub id: Uuid,
    pub name: String,
    /// Unique case-insensitively among live tenants
    pub domain: String,
    /// Opaque settings blob
    pub settings: serde_json::Value,
    pub subscription_plan: String,
    pub is_active: bool,
    pub is_deleted: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Tenant {
    pub fn new(name: impl Into<String>, domain: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            domain: domain.into(),
            settings: serde_json::json!({}),
            subscription_plan: "basic".to_string(),
            is_active: true,
            is_deleted: false,
            created_at: now,
            updated_at: now,
        }
    }
}

// ============================================================================
// Roles
// ============================================================================

/// Name of the administrative role
pub const ADMIN_ROLE: &str = "Admin";

/// Name of the default role handed to self-registered principals
pub const DEFAULT_ROLE: &str = "User";

/// Named permission bundle, optionally scoped to a tenant
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Role {
    pub id: Uuid,
    /// `None` for system-wide roles
    pub tenant_id: Option<Uuid>,
    pub name: String,
    /// Unique together with `tenant_id`
    pub normalized_name: String,
    pub description: Option<String>,
    pub permissions: Vec<String>,
    pub is_system: bool,
}

impl Role {
    pub fn new(tenant_id: Option<Uuid>, name: &str, permissions: Vec<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            tenant_id,
            name: name.to_string(),
            normalized_name: normalize_name(name),
            description: None,
            permissions,
            is_system: false,
        }
    }

    pub fn assignment(&self) -> RoleAssignment {
        RoleAssignment {
            role_id: self.id,
            role_name: self.name.clone(),
        }
    }
}

// ============================================================================
// Principals
// ============================================================================

/// The role a principal holds
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleAssignment {
    pub role_id: Uuid,
    pub role_name: String,
}

/// Whether a principal belongs to a tenant or administers the system
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Membership {
    Tenant {
        tenant_id: Uuid,
        role: RoleAssignment,
    },
    System {
        role: RoleAssignment,
    },
}

impl Membership {
    /// Build from the nullable column pair used in storage and tokens
    pub fn from_parts(tenant_id: Option<Uuid>, role: RoleAssignment) -> Self {
        match tenant_id {
            Some(tenant_id) => Self::Tenant { tenant_id, role },
            None => Self::System { role },
        }
    }

    pub fn tenant_id(&self) -> Option<Uuid> {
        match self {
            Self::Tenant { tenant_id, .. } => Some(*tenant_id),
            Self::System { .. } => None,
        }
    }

    pub fn role(&self) -> &RoleAssignment {
        match self {
            Self::Tenant { role, .. } | Self::System { role } => role,
        }
    }

    pub fn is_system(&self) -> bool {
        matches!(self, Self::System { .. })
    }

    /// Case-insensitive role name check
    pub fn has_role(&self, name: &str) -> bool {
        self.role().role_name.eq_ignore_ascii_case(name)
    }
}

/// An identity subject to authentication
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct Principal {
    pub id: Uuid,
    pub email: String,
    pub normalized_email: String,
    #[serde(skip_serializing)]
    pub password_hash: Option<String>,
    pub first_name: String,
    pub last_name: String,
    pub membership: Membership,
    pub is_active: bool,
    pub email_confirmed: bool,
    pub last_login_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Principal {
    pub fn display_name(&self) -> String {
        format!("{} {}", self.first_name, self.last_name)
            .trim()
            .to_string()
    }

    pub fn tenant_id(&self) -> Option<Uuid> {
        self.membership.tenant_id()
    }
}

impl std::fmt::Debug for Principal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Principal")
            .field("id", &self.id)
            .field("email", &self.email)
            .field("membership", &self.membership)
            .field("is_active", &self.is_active)
            .field("has_password", &self.password_hash.is_some())
            .finish_non_exhaustive()
    }
}

/// Input for creating a principal
#[derive(Clone)]
pub struct NewPrincipal {
    pub email: String,
    pub password_hash: String,
    pub first_name: String,
    pub last_name: String,
    pub membership: Membership,
    pub email_confirmed: bool,
    pub is_active: bool,
}

impl NewPrincipal {
    pub fn into_principal(self, id: Uuid, now: DateTime<Utc>) -> Principal {
        Principal {
            id,
            normalized_email: normalize_email(&self.email),
            email: self.email.trim().to_string(),
            password_hash: Some(self.password_hash),
            first_name: self.first_name,
            last_name: self.last_name,
            membership: self.membership,
            is_active: self.is_active,
            email_confirmed: self.email_confirmed,
            last_login_at: None,
            created_at: now,
        }
    }
}

// ============================================================================
// Refresh tokens
// ============================================================================

/// Reason recorded when a refresh token is superseded by rotation
pub const REVOKED_BY_ROTATION: &str = "Replaced by new token";

/// Reason recorded on logout
pub const REVOKED_BY_LOGOUT: &str = "User logout";

/// Revocation reason when a deactivated principal presents a refresh token
pub const REVOKED_INACTIVE: &str = "Principal deactivated";

/// Persisted refresh token state. Only the keyed hash of the token is stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefreshTokenRecord {
    pub id: Uuid,
    pub principal_id: Uuid,
    /// Lowercase hex HMAC-SHA256 of the plaintext
    pub token_hash: String,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub created_by_ip: Option<String>,
    pub is_revoked: bool,
    pub revoked_at: Option<DateTime<Utc>>,
    pub revoked_reason: Option<String>,
    pub revoked_by_ip: Option<String>,
    /// Hash of the token that superseded this one during rotation
    pub replaced_by_token_hash: Option<String>,
    /// Optimistic concurrency token, bumped on every write
    pub version: i32,
}

impl RefreshTokenRecord {
    pub fn new(
        principal_id: Uuid,
        token_hash: String,
        expires_at: DateTime<Utc>,
        created_by_ip: Option<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            principal_id,
            token_hash,
            expires_at,
            created_at: Utc::now(),
            created_by_ip,
            is_revoked: false,
            revoked_at: None,
            revoked_reason: None,
            revoked_by_ip: None,
            replaced_by_token_hash: None,
            version: 0,
        }
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at < now
    }

    /// Usable for a refresh at `now`
    pub fn is_redeemable_at(&self, now: DateTime<Utc>) -> bool {
        !self.is_revoked && !self.is_expired_at(now)
    }
}

/// Details written when a refresh token is revoked
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Revocation {
    pub reason: String,
    pub at: DateTime<Utc>,
    pub by_ip: Option<String>,
}

impl Revocation {
    pub fn new(reason: impl Into<String>, by_ip: Option<String>) -> Self {
        Self {
            reason: reason.into(),
            at: Utc::now(),
            by_ip,
        }
    }
}

// ============================================================================
// Invitations
// ============================================================================

/// Single-use, time-boxed permission to register under a tenant
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Invitation {
    pub id: Uuid,
    /// Bearer value, stored as issued
    pub token: String,
    pub tenant_id: Uuid,
    pub tenant_name: String,
    pub expires_at: DateTime<Utc>,
    pub is_used: bool,
    pub used_at: Option<DateTime<Utc>>,
    pub used_by_principal_id: Option<Uuid>,
    pub used_by_email: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Invitation {
    /// Unused and not past its expiry at `now`
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        !self.is_used && self.expires_at >= now
    }
}
