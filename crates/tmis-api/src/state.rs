//! Application state management
//!
//! Author: hephaex@gmail.com

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tmis_core::config::TenantSettings;
use tmis_core::{AppConfig, Repositories, Result};

use crate::auth::jwt::TokenIssuer;
use crate::auth::password::{Argon2Hasher, PasswordHasher};
use crate::auth::refresh::{RefreshTokenHasher, RefreshTokenService};
use crate::auth::service::AuthService;
use crate::cookie::RefreshCookiePolicy;
use crate::invitation::InvitationService;

/// Application state shared across handlers
pub struct AppState {
    /// Application configuration
    pub config: AppConfig,
    /// Repository handles
    pub repos: Repositories,
    pub auth: AuthService,
    pub invitations: InvitationService,
    /// Refresh token cookie attributes
    pub cookie: RefreshCookiePolicy,
    /// Server start time
    pub start_time: Instant,
    /// Ready status
    pub is_ready: AtomicBool,
}

impl AppState {
    /// Wire services from configuration, using Argon2id with default parameters
    pub fn new(config: AppConfig, repos: Repositories) -> Result<Self> {
        Self::with_hasher(config, repos, Arc::new(Argon2Hasher::default()))
    }

    pub fn with_hasher(
        config: AppConfig,
        repos: Repositories,
        hasher: Arc<dyn PasswordHasher>,
    ) -> Result<Self> {
        let tokens = TokenIssuer::new(&config.jwt)?;
        let refresh_tokens = RefreshTokenService::new(
            RefreshTokenHasher::new(&config.jwt.refresh_token_secret)?,
            repos.refresh_tokens.clone(),
            config.jwt.effective_refresh_days(),
        );
        let invitations = InvitationService::new(
            repos.invitations.clone(),
            repos.tenants.clone(),
            config.invitation.default_expiration_hours,
        );
        let auth = AuthService::new(
            repos.clone(),
            tokens,
            refresh_tokens,
            invitations.clone(),
            hasher,
        );

        Ok(Self {
            cookie: RefreshCookiePolicy::from_config(&config),
            config,
            repos,
            auth,
            invitations,
            start_time: Instant::now(),
            is_ready: AtomicBool::new(false),
        })
    }

    pub fn tenant_settings(&self) -> &TenantSettings {
        &self.config.tenant
    }

    /// Get uptime in seconds
    pub fn uptime_secs(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    /// Check if service is ready
    pub fn is_ready(&self) -> bool {
        self.is_ready.load(Ordering::SeqCst)
    }

    /// Set ready status; false until startup completes and again once shutdown begins
    pub fn set_ready(&self, ready: bool) {
        self.is_ready.store(ready, Ordering::SeqCst);
    }
}
