//! PostgreSQL store
//!
//! Implements every repository trait on one `PgPool` using SQLx runtime queries.
//! Refresh token rotation runs in a transaction guarded by a compare-and-swap
//! on `refresh_tokens.version`; dropping the future before commit rolls it back.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::types::Json;
use sqlx::FromRow;
use uuid::Uuid;

use crate::store::{
    InvitationRepository, PrincipalRepository, RefreshTokenRepository, RoleRepository,
    RotationOutcome, StoreHealth, TenantRepository,
};
use crate::{
    normalize_email, Invitation, Membership, NewPrincipal, Principal, RefreshTokenRecord, Result,
    Revocation, Role, RoleAssignment, Tenant, TenantContext, TmisError,
};

/// PostgreSQL-backed store
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Create a new connection pool
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .map_err(|e| TmisError::Database(format!("PostgreSQL connection failed: {e}")))?;
        tracing::info!(max_connections, "Connected to PostgreSQL");

        Ok(Self { pool })
    }

    /// Create from an existing pool
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Get the connection pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.is_unique_violation())
}

// ============================================================================
// Row types
// ============================================================================

#[derive(Debug, FromRow)]
struct TenantRow {
    id: Uuid,
    name: String,
    domain: String,
    settings: serde_json::Value,
    subscription_plan: String,
    is_active: bool,
    is_deleted: bool,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<TenantRow> for Tenant {
    fn from(row: TenantRow) -> Self {
        Self {
            id: row.id,
            name: row.name,
            domain: row.domain,
            settings: row.settings,
            subscription_plan: row.subscription_plan,
            is_active: row.is_active,
            is_deleted: row.is_deleted,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

#[derive(Debug, FromRow)]
struct RoleRow {
    id: Uuid,
    company_id: Option<Uuid>,
    name: String,
    normalized_name: String,
    description: Option<String>,
    permissions: Json<Vec<String>>,
    is_system: bool,
}

impl From<RoleRow> for Role {
    fn from(row: RoleRow) -> Self {
        Self {
            id: row.id,
            tenant_id: row.company_id,
            name: row.name,
            normalized_name: row.normalized_name,
            description: row.description,
            permissions: row.permissions.0,
            is_system: row.is_system,
        }
    }
}

#[derive(FromRow)]
struct PrincipalRow {
    id: Uuid,
    company_id: Option<Uuid>,
    role_id: Uuid,
    role_name: String,
    email: String,
    normalized_email: String,
    password_hash: Option<String>,
    first_name: String,
    last_name: String,
    is_active: bool,
    email_confirmed: bool,
    last_login: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
}

impl From<PrincipalRow> for Principal {
    fn from(row: PrincipalRow) -> Self {
        Self {
            id: row.id,
            email: row.email,
            normalized_email: row.normalized_email,
            password_hash: row.password_hash,
            first_name: row.first_name,
            last_name: row.last_name,
            membership: Membership::from_parts(
                row.company_id,
                RoleAssignment {
                    role_id: row.role_id,
                    role_name: row.role_name,
                },
            ),
            is_active: row.is_active,
            email_confirmed: row.email_confirmed,
            last_login_at: row.last_login,
            created_at: row.created_at,
        }
    }
}

const PRINCIPAL_COLUMNS: &str = "u.id, u.company_id, u.role_id, r.name AS role_name, u.email, \
     u.normalized_email, u.password_hash, u.first_name, u.last_name, u.is_active, \
     u.email_confirmed, u.last_login, u.created_at";

#[derive(Debug, FromRow)]
struct RefreshTokenRow {
    id: Uuid,
    user_id: Uuid,
    token_hash: String,
    expires_at: DateTime<Utc>,
    created_at: DateTime<Utc>,
    created_by_ip: Option<String>,
    is_revoked: bool,
    revoked_at: Option<DateTime<Utc>>,
    revoked_reason: Option<String>,
    revoked_by_ip: Option<String>,
    replaced_by_token_hash: Option<String>,
    version: i32,
}

impl From<RefreshTokenRow> for RefreshTokenRecord {
    fn from(row: RefreshTokenRow) -> Self {
        Self {
            id: row.id,
            principal_id: row.user_id,
            token_hash: row.token_hash,
            expires_at: row.expires_at,
            created_at: row.created_at,
            created_by_ip: row.created_by_ip,
            is_revoked: row.is_revoked,
            revoked_at: row.revoked_at,
            revoked_reason: row.revoked_reason,
            revoked_by_ip: row.revoked_by_ip,
            replaced_by_token_hash: row.replaced_by_token_hash,
            version: row.version,
        }
    }
}

#[derive(Debug, FromRow)]
struct InvitationRow {
    id: Uuid,
    token: String,
    company_id: Uuid,
    company_name: String,
    expires_at: DateTime<Utc>,
    is_used: bool,
    used_at: Option<DateTime<Utc>>,
    used_by_user_id: Option<Uuid>,
    used_by_email: Option<String>,
    created_at: DateTime<Utc>,
}

impl From<InvitationRow> for Invitation {
    fn from(row: InvitationRow) -> Self {
        Self {
            id: row.id,
            token: row.token,
            tenant_id: row.company_id,
            tenant_name: row.company_name,
            expires_at: row.expires_at,
            is_used: row.is_used,
            used_at: row.used_at,
            used_by_principal_id: row.used_by_user_id,
            used_by_email: row.used_by_email,
            created_at: row.created_at,
        }
    }
}

// ============================================================================
// Tenants
// ============================================================================

#[async_trait]
impl TenantRepository for PgStore {
    async fn find_live_by_id(&self, id: Uuid) -> Result<Option<Tenant>> {
        let row: Option<TenantRow> = sqlx::query_as(
            r#"
            SELECT id, name, domain, settings, subscription_plan, is_active, is_deleted,
                   created_at, updated_at
            FROM companies
            WHERE id = $1 AND NOT is_deleted
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| TmisError::Database(format!("Failed to get company: {e}")))?;

        Ok(row.map(Into::into))
    }

    async fn find_live_by_domain(&self, domain: &str) -> Result<Option<Tenant>> {
        let row: Option<TenantRow> = sqlx::query_as(
            r#"
            SELECT id, name, domain, settings, subscription_plan, is_active, is_deleted,
                   created_at, updated_at
            FROM companies
            WHERE UPPER(domain) = UPPER($1) AND NOT is_deleted
            "#,
        )
        .bind(domain)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| TmisError::Database(format!("Failed to get company by domain: {e}")))?;

        Ok(row.map(Into::into))
    }

    async fn create_tenant(&self, tenant: &Tenant) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO companies (id, name, domain, settings, subscription_plan, is_active,
                                   is_deleted, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(tenant.id)
        .bind(&tenant.name)
        .bind(&tenant.domain)
        .bind(&tenant.settings)
        .bind(&tenant.subscription_plan)
        .bind(tenant.is_active)
        .bind(tenant.is_deleted)
        .bind(tenant.created_at)
        .bind(tenant.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                TmisError::Conflict(format!("Company domain {} already exists", tenant.domain))
            } else {
                TmisError::Database(format!("Failed to create company: {e}"))
            }
        })?;

        Ok(())
    }

    async fn count_live(&self) -> Result<i64> {
        sqlx::query_scalar("SELECT COUNT(*) FROM companies WHERE NOT is_deleted")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| TmisError::Database(format!("Failed to count companies: {e}")))
    }
}

// ============================================================================
// Roles
// ============================================================================

#[async_trait]
impl RoleRepository for PgStore {
    async fn find_role(
        &self,
        tenant_id: Option<Uuid>,
        normalized_name: &str,
    ) -> Result<Option<Role>> {
        let row: Option<RoleRow> = sqlx::query_as(
            r#"
            SELECT id, company_id, name, normalized_name, description, permissions, is_system
            FROM roles
            WHERE company_id IS NOT DISTINCT FROM $1 AND normalized_name = $2
            "#,
        )
        .bind(tenant_id)
        .bind(normalized_name)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| TmisError::Database(format!("Failed to get role: {e}")))?;

        Ok(row.map(Into::into))
    }

    async fn create_role(&self, role: &Role) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO roles (id, company_id, name, normalized_name, description, permissions, is_system)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(role.id)
        .bind(role.tenant_id)
        .bind(&role.name)
        .bind(&role.normalized_name)
        .bind(&role.description)
        .bind(Json(&role.permissions))
        .bind(role.is_system)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                TmisError::Conflict(format!("Role {} already exists", role.normalized_name))
            } else {
                TmisError::Database(format!("Failed to create role: {e}"))
            }
        })?;

        Ok(())
    }
}

// ============================================================================
// Principals
// ============================================================================

#[async_trait]
impl PrincipalRepository for PgStore {
    async fn find_principal(&self, id: Uuid) -> Result<Option<Principal>> {
        let sql = format!(
            "SELECT {PRINCIPAL_COLUMNS} FROM users u JOIN roles r ON r.id = u.role_id WHERE u.id = $1"
        );
        let row: Option<PrincipalRow> = sqlx::query_as(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| TmisError::Database(format!("Failed to get user: {e}")))?;

        Ok(row.map(Into::into))
    }

    async fn find_by_normalized_email(&self, normalized_email: &str) -> Result<Vec<Principal>> {
        let sql = format!(
            "SELECT {PRINCIPAL_COLUMNS} FROM users u JOIN roles r ON r.id = u.role_id \
             WHERE u.normalized_email = $1 ORDER BY u.created_at"
        );
        let rows: Vec<PrincipalRow> = sqlx::query_as(&sql)
            .bind(normalized_email)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| TmisError::Database(format!("Failed to get user by email: {e}")))?;

        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn email_exists(&self, tenant_id: Option<Uuid>, normalized_email: &str) -> Result<bool> {
        sqlx::query_scalar(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM users
                WHERE company_id IS NOT DISTINCT FROM $1 AND normalized_email = $2
            )
            "#,
        )
        .bind(tenant_id)
        .bind(normalized_email)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| TmisError::Database(format!("Failed to check existing user: {e}")))
    }

    async fn create_principal(&self, principal: NewPrincipal) -> Result<Principal> {
        let id = Uuid::new_v4();
        let tenant_id = principal.membership.tenant_id();
        let role_id = principal.membership.role().role_id;

        // The role must be a system role or belong to the principal's tenant
        let inserted = sqlx::query(
            r#"
            INSERT INTO users (id, company_id, role_id, email, normalized_email, password_hash,
                               first_name, last_name, is_active, email_confirmed)
            SELECT $1, $2, r.id, $4, $5, $6, $7, $8, $9, $10
            FROM roles r
            WHERE r.id = $3 AND (r.company_id IS NULL OR r.company_id IS NOT DISTINCT FROM $2)
            "#,
        )
        .bind(id)
        .bind(tenant_id)
        .bind(role_id)
        .bind(principal.email.trim())
        .bind(normalize_email(&principal.email))
        .bind(&principal.password_hash)
        .bind(&principal.first_name)
        .bind(&principal.last_name)
        .bind(principal.is_active)
        .bind(principal.email_confirmed)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                TmisError::Conflict("User with this email already exists".to_string())
            } else {
                TmisError::Database(format!("Failed to create user: {e}"))
            }
        })?;

        if inserted.rows_affected() == 0 {
            return Err(TmisError::validation(
                "roleId",
                "Role does not belong to the user's company",
            ));
        }

        self.find_principal(id)
            .await?
            .ok_or_else(|| TmisError::Database("Created user could not be read back".to_string()))
    }

    async fn update_password_hash(&self, id: Uuid, password_hash: &str) -> Result<()> {
        sqlx::query("UPDATE users SET password_hash = $2, updated_at = NOW() WHERE id = $1")
            .bind(id)
            .bind(password_hash)
            .execute(&self.pool)
            .await
            .map_err(|e| TmisError::Database(format!("Failed to update password hash: {e}")))?;

        Ok(())
    }

    async fn record_login(&self, id: Uuid, at: DateTime<Utc>) -> Result<()> {
        sqlx::query("UPDATE users SET last_login = $2, updated_at = NOW() WHERE id = $1")
            .bind(id)
            .bind(at)
            .execute(&self.pool)
            .await
            .map_err(|e| TmisError::Database(format!("Failed to record login: {e}")))?;

        Ok(())
    }

    async fn set_active(&self, id: Uuid, active: bool) -> Result<()> {
        sqlx::query("UPDATE users SET is_active = $2, updated_at = NOW() WHERE id = $1")
            .bind(id)
            .bind(active)
            .execute(&self.pool)
            .await
            .map_err(|e| TmisError::Database(format!("Failed to update user: {e}")))?;

        Ok(())
    }

    async fn list_principals(&self, scope: &TenantContext) -> Result<Vec<Principal>> {
        let sql = format!(
            "SELECT {PRINCIPAL_COLUMNS} FROM users u JOIN roles r ON r.id = u.role_id \
             WHERE ($1::uuid IS NULL OR u.company_id = $1) ORDER BY u.created_at"
        );
        let rows: Vec<PrincipalRow> = sqlx::query_as(&sql)
            .bind(scope.filter_tenant_id())
            .fetch_all(&self.pool)
            .await
            .map_err(|e| TmisError::Database(format!("Failed to list users: {e}")))?;

        Ok(rows.into_iter().map(Into::into).collect())
    }
}

// ============================================================================
// Refresh tokens
// ============================================================================

#[async_trait]
impl RefreshTokenRepository for PgStore {
    async fn insert_token(&self, record: &RefreshTokenRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO refresh_tokens (id, user_id, token_hash, expires_at, created_at,
                                        created_by_ip, is_revoked, version)
            VALUES ($1, $2, $3, $4, $5, $6, FALSE, 0)
            "#,
        )
        .bind(record.id)
        .bind(record.principal_id)
        .bind(&record.token_hash)
        .bind(record.expires_at)
        .bind(record.created_at)
        .bind(&record.created_by_ip)
        .execute(&self.pool)
        .await
        .map_err(|e| TmisError::Database(format!("Failed to store refresh token: {e}")))?;

        Ok(())
    }

    async fn find_by_hash(&self, token_hash: &str) -> Result<Option<RefreshTokenRecord>> {
        let row: Option<RefreshTokenRow> = sqlx::query_as(
            r#"
            SELECT id, user_id, token_hash, expires_at, created_at, created_by_ip, is_revoked,
                   revoked_at, revoked_reason, revoked_by_ip, replaced_by_token_hash, version
            FROM refresh_tokens
            WHERE token_hash = $1
            "#,
        )
        .bind(token_hash)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| TmisError::Database(format!("Failed to fetch refresh token: {e}")))?;

        Ok(row.map(Into::into))
    }

    async fn rotate(
        &self,
        current: &RefreshTokenRecord,
        revocation: &Revocation,
        replacement: &RefreshTokenRecord,
    ) -> Result<RotationOutcome> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| TmisError::Database(format!("Failed to begin rotation: {e}")))?;

        let revoked = sqlx::query(
            r#"
            UPDATE refresh_tokens
            SET is_revoked = TRUE, revoked_at = $3, revoked_reason = $4, revoked_by_ip = $5,
                replaced_by_token_hash = $6, version = version + 1
            WHERE id = $1 AND version = $2 AND NOT is_revoked
            "#,
        )
        .bind(current.id)
        .bind(current.version)
        .bind(revocation.at)
        .bind(&revocation.reason)
        .bind(&revocation.by_ip)
        .bind(&replacement.token_hash)
        .execute(&mut *tx)
        .await
        .map_err(|e| TmisError::Database(format!("Failed to revoke refresh token: {e}")))?;

        if revoked.rows_affected() != 1 {
            tx.rollback()
                .await
                .map_err(|e| TmisError::Database(format!("Failed to roll back rotation: {e}")))?;
            return Ok(RotationOutcome::Conflict);
        }

        sqlx::query(
            r#"
            INSERT INTO refresh_tokens (id, user_id, token_hash, expires_at, created_at,
                                        created_by_ip, is_revoked, version)
            VALUES ($1, $2, $3, $4, $5, $6, FALSE, 0)
            "#,
        )
        .bind(replacement.id)
        .bind(replacement.principal_id)
        .bind(&replacement.token_hash)
        .bind(replacement.expires_at)
        .bind(replacement.created_at)
        .bind(&replacement.created_by_ip)
        .execute(&mut *tx)
        .await
        .map_err(|e| TmisError::Database(format!("Failed to store refresh token: {e}")))?;

        tx.commit()
            .await
            .map_err(|e| TmisError::Database(format!("Failed to commit rotation: {e}")))?;

        Ok(RotationOutcome::Rotated)
    }

    async fn revoke_by_hash(&self, token_hash: &str, revocation: &Revocation) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE refresh_tokens
            SET is_revoked = TRUE, revoked_at = $2, revoked_reason = $3, revoked_by_ip = $4,
                version = version + 1
            WHERE token_hash = $1 AND NOT is_revoked
            "#,
        )
        .bind(token_hash)
        .bind(revocation.at)
        .bind(&revocation.reason)
        .bind(&revocation.by_ip)
        .execute(&self.pool)
        .await
        .map_err(|e| TmisError::Database(format!("Failed to revoke refresh token: {e}")))?;

        Ok(result.rows_affected() > 0)
    }

    async fn revoke_all_for_principal(
        &self,
        principal_id: Uuid,
        revocation: &Revocation,
    ) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE refresh_tokens
            SET is_revoked = TRUE, revoked_at = $2, revoked_reason = $3, revoked_by_ip = $4,
                version = version + 1
            WHERE user_id = $1 AND NOT is_revoked
            "#,
        )
        .bind(principal_id)
        .bind(revocation.at)
        .bind(&revocation.reason)
        .bind(&revocation.by_ip)
        .execute(&self.pool)
        .await
        .map_err(|e| TmisError::Database(format!("Failed to revoke refresh tokens: {e}")))?;

        Ok(result.rows_affected())
    }
}

// ============================================================================
// Invitations
// ============================================================================

#[async_trait]
impl InvitationRepository for PgStore {
    async fn insert_invitation(&self, invitation: &Invitation) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO invitations (id, token, company_id, expires_at, is_used, created_at)
            VALUES ($1, $2, $3, $4, FALSE, $5)
            "#,
        )
        .bind(invitation.id)
        .bind(&invitation.token)
        .bind(invitation.tenant_id)
        .bind(invitation.expires_at)
        .bind(invitation.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| TmisError::Database(format!("Failed to create invitation: {e}")))?;

        Ok(())
    }

    async fn find_by_token(&self, token: &str) -> Result<Option<Invitation>> {
        let row: Option<InvitationRow> = sqlx::query_as(
            r#"
            SELECT i.id, i.token, i.company_id, c.name AS company_name, i.expires_at, i.is_used,
                   i.used_at, i.used_by_user_id, i.used_by_email, i.created_at
            FROM invitations i
            JOIN companies c ON c.id = i.company_id
            WHERE i.token = $1
            "#,
        )
        .bind(token)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| TmisError::Database(format!("Failed to get invitation: {e}")))?;

        Ok(row.map(Into::into))
    }

    async fn mark_used(
        &self,
        token: &str,
        principal_id: Uuid,
        email: &str,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE invitations
            SET is_used = TRUE, used_at = $2, used_by_user_id = $3, used_by_email = $4
            WHERE token = $1 AND NOT is_used
            "#,
        )
        .bind(token)
        .bind(at)
        .bind(principal_id)
        .bind(email)
        .execute(&self.pool)
        .await
        .map_err(|e| TmisError::Database(format!("Failed to mark invitation used: {e}")))?;

        Ok(result.rows_affected() == 1)
    }

    async fn list_invitations(&self, scope: &TenantContext) -> Result<Vec<Invitation>> {
        let rows: Vec<InvitationRow> = sqlx::query_as(
            r#"
            SELECT i.id, i.token, i.company_id, c.name AS company_name, i.expires_at, i.is_used,
                   i.used_at, i.used_by_user_id, i.used_by_email, i.created_at
            FROM invitations i
            JOIN companies c ON c.id = i.company_id
            WHERE ($1::uuid IS NULL OR i.company_id = $1) AND NOT c.is_deleted
            ORDER BY i.created_at DESC
            "#,
        )
        .bind(scope.filter_tenant_id())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| TmisError::Database(format!("Failed to list invitations: {e}")))?;

        Ok(rows.into_iter().map(Into::into).collect())
    }
}

#[async_trait]
impl StoreHealth for PgStore {
    async fn ping(&self) -> Result<()> {
        sqlx::query_scalar::<_, i32>("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| TmisError::Database(format!("Database ping failed: {e}")))?;
        Ok(())
    }
}
