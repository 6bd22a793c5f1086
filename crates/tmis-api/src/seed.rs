//! Demo data seeding
//!
//! Creates one demo company with its Admin and User roles, a system-wide
//! Admin role, and an administrator account. Running it twice is a no-op.

use serde_json::json;
use tmis_core::{
    normalize_name, Membership, NewPrincipal, Repositories, Result, Role, Tenant, TmisError,
    ADMIN_ROLE, DEFAULT_ROLE,
};
use tracing::info;
use uuid::Uuid;

use crate::auth::password::PasswordHasher;

/// Permissions of the default tenant role
pub const USER_PERMISSIONS: &[&str] = &[
    "manage_customers",
    "manage_orders",
    "manage_quotes",
    "view_reports",
];

/// Permissions of the administrator roles
pub const ADMIN_PERMISSIONS: &[&str] = &[
    "manage_companies",
    "manage_users",
    "manage_customers",
    "manage_orders",
    "manage_quotes",
    "manage_invoices",
    "view_reports",
    "manage_settings",
];

pub const DEMO_COMPANY_NAME: &str = "Test Company";
pub const DEMO_COMPANY_DOMAIN: &str = "testcompany.com";
pub const DEMO_ADMIN_EMAIL: &str = "admin@testcompany.com";
pub const DEMO_ADMIN_PASSWORD: &str = "Admin123!";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeedOutcome {
    Seeded { tenant_id: Uuid },
    AlreadySeeded { tenant_id: Uuid },
}

impl SeedOutcome {
    pub fn tenant_id(self) -> Uuid {
        match self {
            Self::Seeded { tenant_id } | Self::AlreadySeeded { tenant_id } => tenant_id,
        }
    }
}

fn permissions(names: &[&str]) -> Vec<String> {
    names.iter().map(|p| p.to_string()).collect()
}

/// Seed the demo company, its roles and the demo administrator
pub async fn seed_demo_data(
    repos: &Repositories,
    hasher: &dyn PasswordHasher,
) -> Result<SeedOutcome> {
    if let Some(existing) = repos.tenants.find_live_by_domain(DEMO_COMPANY_DOMAIN).await? {
        info!(tenant_id = %existing.id, "Demo data already present");
        return Ok(SeedOutcome::AlreadySeeded {
            tenant_id: existing.id,
        });
    }

    let mut tenant = Tenant::new(DEMO_COMPANY_NAME, DEMO_COMPANY_DOMAIN);
    tenant.settings = json!({ "timezone": "UTC", "currency": "USD" });
    repos.tenants.create_tenant(&tenant).await?;

    let admin = ensure_role(
        repos,
        Some(tenant.id),
        ADMIN_ROLE,
        "System Administrator",
        ADMIN_PERMISSIONS,
        true,
    )
    .await?;
    ensure_role(
        repos,
        Some(tenant.id),
        DEFAULT_ROLE,
        "Regular User",
        USER_PERMISSIONS,
        false,
    )
    .await?;
    ensure_role(
        repos,
        None,
        ADMIN_ROLE,
        "System Administrator",
        ADMIN_PERMISSIONS,
        true,
    )
    .await?;

    let password_hash = hasher
        .hash(DEMO_ADMIN_PASSWORD)
        .map_err(|e| TmisError::Other(anyhow::anyhow!(e)))?;
    let principal = repos
        .principals
        .create_principal(NewPrincipal {
            email: DEMO_ADMIN_EMAIL.to_string(),
            password_hash,
            first_name: "Admin".to_string(),
            last_name: "User".to_string(),
            membership: Membership::Tenant {
                tenant_id: tenant.id,
                role: admin.assignment(),
            },
            email_confirmed: true,
            is_active: true,
        })
        .await?;

    info!(
        tenant_id = %tenant.id,
        user_id = %principal.id,
        "Demo data seeded"
    );

    Ok(SeedOutcome::Seeded {
        tenant_id: tenant.id,
    })
}

async fn ensure_role(
    repos: &Repositories,
    tenant_id: Option<Uuid>,
    name: &str,
    description: &str,
    perms: &[&str],
    is_system: bool,
) -> Result<Role> {
    if let Some(role) = repos
        .roles
        .find_role(tenant_id, &normalize_name(name))
        .await?
    {
        return Ok(role);
    }

    let mut role = Role::new(tenant_id, name, permissions(perms));
    role.description = Some(description.to_string());
    role.is_system = is_system;
    repos.roles.create_role(&role).await?;
    Ok(role)
}
