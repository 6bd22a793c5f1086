//! Tenant resolution
//!
//! The context type and the tenant-aware filter live in `tmis_core::tenant`;
//! this module populates the context per request.

pub mod resolver;

pub use resolver::{resolve, tenant_resolver_middleware};
pub use tmis_core::{TenantContext, TenantSource};
