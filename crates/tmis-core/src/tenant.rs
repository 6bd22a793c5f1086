//! Request-scoped tenant context and tenant-aware filtering
//!
//! A [`TenantContext`] is built once per request by the tenant resolver and
//! travels with that request only. It is never cached or stored globally.
//! Every tenant-scoped read, update or delete goes through [`TenantContext::scope`]
//! or [`TenantContext::has_access`] (or [`TenantContext::filter_tenant_id`] when
//! the filter is pushed down into SQL).

use crate::{Invitation, Principal, Tenant};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Which request signal produced the tenant, in trust order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TenantSource {
    /// Tenant claim of a validated access token
    Claim,
    /// First label of the `Host` header matched against tenant domains
    Subdomain,
    /// Tenant id header
    Header,
    /// Tenant id query parameter
    Query,
}

/// The tenant a request was resolved to
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResolvedTenant {
    pub id: Uuid,
    pub name: String,
    pub domain: String,
}

impl From<&Tenant> for ResolvedTenant {
    fn from(tenant: &Tenant) -> Self {
        Self {
            id: tenant.id,
            name: tenant.name.clone(),
            domain: tenant.domain.clone(),
        }
    }
}

/// Tenant of the current request, if any
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TenantContext {
    current: Option<(ResolvedTenant, TenantSource)>,
}

impl TenantContext {
    /// No tenant resolved
    pub fn none() -> Self {
        Self::default()
    }

    pub fn resolved(tenant: ResolvedTenant, source: TenantSource) -> Self {
        Self {
            current: Some((tenant, source)),
        }
    }

    pub fn current_tenant(&self) -> Option<&ResolvedTenant> {
        self.current.as_ref().map(|(tenant, _)| tenant)
    }

    pub fn tenant_id(&self) -> Option<Uuid> {
        self.current_tenant().map(|t| t.id)
    }

    pub fn tenant_domain(&self) -> Option<&str> {
        self.current_tenant().map(|t| t.domain.as_str())
    }

    pub fn source(&self) -> Option<TenantSource> {
        self.current.as_ref().map(|(_, source)| *source)
    }

    /// True iff a tenant was resolved
    pub fn is_multi_tenant(&self) -> bool {
        self.current.is_some()
    }

    /// Tenant id to push into a `WHERE tenant_id = $n` predicate.
    ///
    /// `None` means unfiltered; callers must gate that path to system administrators.
    pub fn filter_tenant_id(&self) -> Option<Uuid> {
        self.tenant_id()
    }

    /// Narrow a collection to rows owned by the current tenant.
    ///
    /// Without a resolved tenant the collection is returned unfiltered.
    pub fn scope<I, T>(&self, items: I) -> impl Iterator<Item = T>
    where
        I: IntoIterator<Item = T>,
        T: TenantOwned,
    {
        let tenant = self.tenant_id();
        items
            .into_iter()
            .filter(move |item| tenant.map_or(true, |id| item.owning_tenant() == Some(id)))
    }

    /// True iff an entity with `entity_id` exists within the current scope
    pub fn has_access<'a, I, T>(&self, items: I, entity_id: Uuid) -> bool
    where
        I: IntoIterator<Item = &'a T>,
        T: TenantOwned + 'a,
    {
        self.scope(items).any(|item| item.entity_id() == entity_id)
    }
}

/// Rows that belong to a tenant
pub trait TenantOwned {
    fn entity_id(&self) -> Uuid;

    /// `None` for rows outside any tenant (e.g. system administrators)
    fn owning_tenant(&self) -> Option<Uuid>;
}

impl<T: TenantOwned + ?Sized> TenantOwned for &T {
    fn entity_id(&self) -> Uuid {
        (**self).entity_id()
    }

    fn owning_tenant(&self) -> Option<Uuid> {
        (**self).owning_tenant()
    }
}

impl TenantOwned for Principal {
    fn entity_id(&self) -> Uuid {
        self.id
    }

    fn owning_tenant(&self) -> Option<Uuid> {
        self.tenant_id()
    }
}

impl TenantOwned for Invitation {
    fn entity_id(&self) -> Uuid {
        self.id
    }

    fn owning_tenant(&self) -> Option<Uuid> {
        Some(self.tenant_id)
    }
}
