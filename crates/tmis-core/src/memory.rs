//! In-process store
//!
//! Same semantics as [`crate::PgStore`] on a single `RwLock`-guarded state.
//! Used by the API test router and the `--in-memory` server mode.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::store::{
    InvitationRepository, PrincipalRepository, RefreshTokenRepository, RoleRepository,
    RotationOutcome, StoreHealth, TenantRepository,
};
use crate::{
    normalize_email, normalize_name, Invitation, NewPrincipal, Principal, RefreshTokenRecord,
    Result, Revocation, Role, Tenant, TenantContext, TmisError,
};

#[derive(Default)]
struct State {
    tenants: HashMap<Uuid, Tenant>,
    roles: HashMap<Uuid, Role>,
    principals: Vec<Principal>,
    refresh_tokens: HashMap<String, RefreshTokenRecord>,
    invitations: HashMap<String, Invitation>,
}

impl State {
    fn tenant_name(&self, id: Uuid) -> Option<String> {
        self.tenants
            .get(&id)
            .filter(|t| !t.is_deleted)
            .map(|t| t.name.clone())
    }

    fn revoke(record: &mut RefreshTokenRecord, revocation: &Revocation) {
        record.is_revoked = true;
        record.revoked_at = Some(revocation.at);
        record.revoked_reason = Some(revocation.reason.clone());
        record.revoked_by_ip = revocation.by_ip.clone();
        record.version += 1;
    }
}

/// Store that keeps everything in memory
#[derive(Default)]
pub struct InMemoryStore {
    state: RwLock<State>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TenantRepository for InMemoryStore {
    async fn find_live_by_id(&self, id: Uuid) -> Result<Option<Tenant>> {
        let state = self.state.read().await;
        Ok(state.tenants.get(&id).filter(|t| !t.is_deleted).cloned())
    }

    async fn find_live_by_domain(&self, domain: &str) -> Result<Option<Tenant>> {
        let wanted = normalize_name(domain);
        let state = self.state.read().await;
        Ok(state
            .tenants
            .values()
            .find(|t| !t.is_deleted && normalize_name(&t.domain) == wanted)
            .cloned())
    }

    async fn create_tenant(&self, tenant: &Tenant) -> Result<()> {
        let mut state = self.state.write().await;
        let domain = normalize_name(&tenant.domain);
        let taken = state
            .tenants
            .values()
            .any(|t| !t.is_deleted && normalize_name(&t.domain) == domain);
        if taken && !tenant.is_deleted {
            return Err(TmisError::Conflict(format!(
                "Company domain {} already exists",
                tenant.domain
            )));
        }
        state.tenants.insert(tenant.id, tenant.clone());
        Ok(())
    }

    async fn count_live(&self) -> Result<i64> {
        let state = self.state.read().await;
        Ok(state.tenants.values().filter(|t| !t.is_deleted).count() as i64)
    }
}

#[async_trait]
impl RoleRepository for InMemoryStore {
    async fn find_role(
        &self,
        tenant_id: Option<Uuid>,
        normalized_name: &str,
    ) -> Result<Option<Role>> {
        let state = self.state.read().await;
        Ok(state
            .roles
            .values()
            .find(|r| r.tenant_id == tenant_id && r.normalized_name == normalized_name)
            .cloned())
    }

    async fn create_role(&self, role: &Role) -> Result<()> {
        let mut state = self.state.write().await;
        if state
            .roles
            .values()
            .any(|r| r.tenant_id == role.tenant_id && r.normalized_name == role.normalized_name)
        {
            return Err(TmisError::Conflict(format!(
                "Role {} already exists",
                role.normalized_name
            )));
        }
        state.roles.insert(role.id, role.clone());
        Ok(())
    }
}

#[async_trait]
impl PrincipalRepository for InMemoryStore {
    async fn find_principal(&self, id: Uuid) -> Result<Option<Principal>> {
        let state = self.state.read().await;
        Ok(state.principals.iter().find(|p| p.id == id).cloned())
    }

    async fn find_by_normalized_email(&self, normalized_email: &str) -> Result<Vec<Principal>> {
        let state = self.state.read().await;
        Ok(state
            .principals
            .iter()
            .filter(|p| p.normalized_email == normalized_email)
            .cloned()
            .collect())
    }

    async fn email_exists(&self, tenant_id: Option<Uuid>, normalized_email: &str) -> Result<bool> {
        let state = self.state.read().await;
        Ok(state
            .principals
            .iter()
            .any(|p| p.tenant_id() == tenant_id && p.normalized_email == normalized_email))
    }

    async fn create_principal(&self, principal: NewPrincipal) -> Result<Principal> {
        let mut state = self.state.write().await;
        let tenant_id = principal.membership.tenant_id();
        let role_id = principal.membership.role().role_id;

        let role_fits = state
            .roles
            .get(&role_id)
            .is_some_and(|r| r.tenant_id.is_none() || r.tenant_id == tenant_id);
        if !role_fits {
            return Err(TmisError::validation(
                "roleId",
                "Role does not belong to the user's company",
            ));
        }

        let email = normalize_email(&principal.email);
        if state
            .principals
            .iter()
            .any(|p| p.tenant_id() == tenant_id && p.normalized_email == email)
        {
            return Err(TmisError::Conflict(
                "User with this email already exists".to_string(),
            ));
        }

        let created = principal.into_principal(Uuid::new_v4(), Utc::now());
        state.principals.push(created.clone());
        Ok(created)
    }

    async fn update_password_hash(&self, id: Uuid, password_hash: &str) -> Result<()> {
        let mut state = self.state.write().await;
        if let Some(p) = state.principals.iter_mut().find(|p| p.id == id) {
            p.password_hash = Some(password_hash.to_string());
        }
        Ok(())
    }

    async fn record_login(&self, id: Uuid, at: DateTime<Utc>) -> Result<()> {
        let mut state = self.state.write().await;
        if let Some(p) = state.principals.iter_mut().find(|p| p.id == id) {
            p.last_login_at = Some(at);
        }
        Ok(())
    }

    async fn set_active(&self, id: Uuid, active: bool) -> Result<()> {
        let mut state = self.state.write().await;
        if let Some(p) = state.principals.iter_mut().find(|p| p.id == id) {
            p.is_active = active;
        }
        Ok(())
    }

    async fn list_principals(&self, scope: &TenantContext) -> Result<Vec<Principal>> {
        let state = self.state.read().await;
        Ok(scope.scope(state.principals.iter()).cloned().collect())
    }
}

#[async_trait]
impl RefreshTokenRepository for InMemoryStore {
    async fn insert_token(&self, record: &RefreshTokenRecord) -> Result<()> {
        let mut state = self.state.write().await;
        if state.refresh_tokens.contains_key(&record.token_hash) {
            return Err(TmisError::Database(
                "Failed to store refresh token: duplicate hash".to_string(),
            ));
        }
        state
            .refresh_tokens
            .insert(record.token_hash.clone(), record.clone());
        Ok(())
    }

    async fn find_by_hash(&self, token_hash: &str) -> Result<Option<RefreshTokenRecord>> {
        let state = self.state.read().await;
        Ok(state.refresh_tokens.get(token_hash).cloned())
    }

    async fn rotate(
        &self,
        current: &RefreshTokenRecord,
        revocation: &Revocation,
        replacement: &RefreshTokenRecord,
    ) -> Result<RotationOutcome> {
        let mut state = self.state.write().await;

        if state.refresh_tokens.contains_key(&replacement.token_hash) {
            return Err(TmisError::Database(
                "Failed to store refresh token: duplicate hash".to_string(),
            ));
        }

        let Some(stored) = state.refresh_tokens.get_mut(&current.token_hash) else {
            return Ok(RotationOutcome::Conflict);
        };
        if stored.id != current.id || stored.version != current.version || stored.is_revoked {
            return Ok(RotationOutcome::Conflict);
        }

        State::revoke(stored, revocation);
        stored.replaced_by_token_hash = Some(replacement.token_hash.clone());

        state
            .refresh_tokens
            .insert(replacement.token_hash.clone(), replacement.clone());
        Ok(RotationOutcome::Rotated)
    }

    async fn revoke_by_hash(&self, token_hash: &str, revocation: &Revocation) -> Result<bool> {
        let mut state = self.state.write().await;
        match state.refresh_tokens.get_mut(token_hash) {
            Some(record) if !record.is_revoked => {
                State::revoke(record, revocation);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn revoke_all_for_principal(
        &self,
        principal_id: Uuid,
        revocation: &Revocation,
    ) -> Result<u64> {
        let mut state = self.state.write().await;
        let mut revoked = 0;
        for record in state
            .refresh_tokens
            .values_mut()
            .filter(|r| r.principal_id == principal_id && !r.is_revoked)
        {
            State::revoke(record, revocation);
            revoked += 1;
        }
        Ok(revoked)
    }
}

#[async_trait]
impl InvitationRepository for InMemoryStore {
    async fn insert_invitation(&self, invitation: &Invitation) -> Result<()> {
        let mut state = self.state.write().await;
        if !state.tenants.contains_key(&invitation.tenant_id) {
            return Err(TmisError::NotFound(format!(
                "Company {}",
                invitation.tenant_id
            )));
        }
        if state.invitations.contains_key(&invitation.token) {
            return Err(TmisError::Database(
                "Failed to create invitation: duplicate token".to_string(),
            ));
        }
        state
            .invitations
            .insert(invitation.token.clone(), invitation.clone());
        Ok(())
    }

    async fn find_by_token(&self, token: &str) -> Result<Option<Invitation>> {
        let state = self.state.read().await;
        Ok(state.invitations.get(token).map(|inv| {
            let mut inv = inv.clone();
            if let Some(name) = state.tenants.get(&inv.tenant_id).map(|t| t.name.clone()) {
                inv.tenant_name = name;
            }
            inv
        }))
    }

    async fn mark_used(
        &self,
        token: &str,
        principal_id: Uuid,
        email: &str,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        let mut state = self.state.write().await;
        match state.invitations.get_mut(token) {
            Some(inv) if !inv.is_used => {
                inv.is_used = true;
                inv.used_at = Some(at);
                inv.used_by_principal_id = Some(principal_id);
                inv.used_by_email = Some(email.to_string());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn list_invitations(&self, scope: &TenantContext) -> Result<Vec<Invitation>> {
        let state = self.state.read().await;
        let mut invitations: Vec<Invitation> = scope
            .scope(state.invitations.values())
            .filter(|inv| state.tenant_name(inv.tenant_id).is_some())
            .cloned()
            .collect();
        invitations.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(invitations)
    }
}

#[async_trait]
impl StoreHealth for InMemoryStore {
    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Membership, REVOKED_BY_ROTATION};
    use chrono::Duration;
    use std::sync::Arc;

    async fn seeded() -> (InMemoryStore, Tenant, Role) {
        let store = InMemoryStore::new();
        let tenant = Tenant::new("Acme", "acme.example.com");
        store.create_tenant(&tenant).await.unwrap();
        let role = Role::new(Some(tenant.id), "User", vec![]);
        store.create_role(&role).await.unwrap();
        (store, tenant, role)
    }

    fn new_principal(email: &str, tenant: Option<Uuid>, role: &Role) -> NewPrincipal {
        NewPrincipal {
            email: email.to_string(),
            password_hash: "hash".to_string(),
            first_name: "Test".to_string(),
            last_name: "User".to_string(),
            membership: Membership::from_parts(tenant, role.assignment()),
            email_confirmed: false,
            is_active: true,
        }
    }

    #[tokio::test]
    async fn test_domain_lookup_is_case_insensitive_and_skips_deleted() {
        let (store, tenant, _) = seeded().await;
        let found = store.find_live_by_domain("ACME.example.COM").await.unwrap();
        assert_eq!(found.map(|t| t.id), Some(tenant.id));

        let mut gone = Tenant::new("Gone", "gone.example.com");
        gone.is_deleted = true;
        store.create_tenant(&gone).await.unwrap();
        assert!(store.find_live_by_id(gone.id).await.unwrap().is_none());
        assert!(store
            .find_live_by_domain("gone.example.com")
            .await
            .unwrap()
            .is_none());
        assert_eq!(store.count_live().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_domain_is_conflict() {
        let (store, _, _) = seeded().await;
        let dup = Tenant::new("Acme 2", "ACME.EXAMPLE.COM");
        assert!(matches!(
            store.create_tenant(&dup).await,
            Err(TmisError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn test_same_email_in_two_tenants() {
        let (store, tenant, role) = seeded().await;
        let other = Tenant::new("Other", "other.example.com");
        store.create_tenant(&other).await.unwrap();
        let other_role = Role::new(Some(other.id), "User", vec![]);
        store.create_role(&other_role).await.unwrap();

        store
            .create_principal(new_principal("a@x.com", Some(tenant.id), &role))
            .await
            .unwrap();
        store
            .create_principal(new_principal("A@X.com", Some(other.id), &other_role))
            .await
            .unwrap();

        assert!(matches!(
            store
                .create_principal(new_principal("a@X.COM", Some(tenant.id), &role))
                .await,
            Err(TmisError::Conflict(_))
        ));
        assert_eq!(store.find_by_normalized_email("A@X.COM").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_role_from_other_tenant_rejected() {
        let (store, _, role) = seeded().await;
        let other = Tenant::new("Other", "other.example.com");
        store.create_tenant(&other).await.unwrap();

        let result = store
            .create_principal(new_principal("b@x.com", Some(other.id), &role))
            .await;
        assert!(matches!(result, Err(TmisError::Validation(_))));
    }

    #[tokio::test]
    async fn test_rotate_rejects_stale_version() {
        let (store, tenant, role) = seeded().await;
        let principal = store
            .create_principal(new_principal("c@x.com", Some(tenant.id), &role))
            .await
            .unwrap();
        let expires = Utc::now() + Duration::days(7);
        let current = RefreshTokenRecord::new(principal.id, "h1".to_string(), expires, None);
        store.insert_token(&current).await.unwrap();

        let revocation = Revocation::new(REVOKED_BY_ROTATION, Some("10.0.0.1".to_string()));
        let next = RefreshTokenRecord::new(principal.id, "h2".to_string(), expires, None);
        assert_eq!(
            store.rotate(&current, &revocation, &next).await.unwrap(),
            RotationOutcome::Rotated
        );

        let other = RefreshTokenRecord::new(principal.id, "h3".to_string(), expires, None);
        assert_eq!(
            store.rotate(&current, &revocation, &other).await.unwrap(),
            RotationOutcome::Conflict
        );
        assert!(store.find_by_hash("h3").await.unwrap().is_none());

        let old = store.find_by_hash("h1").await.unwrap().unwrap();
        assert!(old.is_revoked);
        assert_eq!(old.replaced_by_token_hash.as_deref(), Some("h2"));
        assert_eq!(old.revoked_reason.as_deref(), Some(REVOKED_BY_ROTATION));
        assert_eq!(old.version, 1);
    }

    #[tokio::test]
    async fn test_concurrent_rotation_has_one_winner() {
        let (store, tenant, role) = seeded().await;
        let store = Arc::new(store);
        let principal = store
            .create_principal(new_principal("d@x.com", Some(tenant.id), &role))
            .await
            .unwrap();
        let expires = Utc::now() + Duration::days(7);
        let current = RefreshTokenRecord::new(principal.id, "base".to_string(), expires, None);
        store.insert_token(&current).await.unwrap();

        let mut handles = Vec::new();
        for i in 0..8 {
            let store = store.clone();
            let current = current.clone();
            handles.push(tokio::spawn(async move {
                let next =
                    RefreshTokenRecord::new(current.principal_id, format!("next-{i}"), expires, None);
                store
                    .rotate(&current, &Revocation::new(REVOKED_BY_ROTATION, None), &next)
                    .await
                    .unwrap()
            }));
        }

        let mut rotated = 0;
        for handle in handles {
            if handle.await.unwrap() == RotationOutcome::Rotated {
                rotated += 1;
            }
        }
        assert_eq!(rotated, 1);
    }

    #[tokio::test]
    async fn test_mark_used_is_one_way() {
        let (store, tenant, _) = seeded().await;
        let now = Utc::now();
        let invitation = Invitation {
            id: Uuid::new_v4(),
            token: "invite".to_string(),
            tenant_id: tenant.id,
            tenant_name: String::new(),
            expires_at: now + Duration::hours(24),
            is_used: false,
            used_at: None,
            used_by_principal_id: None,
            used_by_email: None,
            created_at: now,
        };
        store.insert_invitation(&invitation).await.unwrap();

        let found = store.find_by_token("invite").await.unwrap().unwrap();
        assert_eq!(found.tenant_name, "Acme");

        let user = Uuid::new_v4();
        assert!(store.mark_used("invite", user, "e@x.com", now).await.unwrap());
        assert!(!store.mark_used("invite", user, "e@x.com", now).await.unwrap());
        assert!(!store.mark_used("missing", user, "e@x.com", now).await.unwrap());
    }
}
