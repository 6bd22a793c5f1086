//! Refresh token rotation engine
//!
//! Refresh tokens are 256 random bits handed to the client once. The server
//! keeps only an HMAC-SHA256 of the value keyed with a server secret, and
//! every lookup goes through that hash. Rotation revokes the presented token,
//! links it to its successor and stores the successor in one transaction; the
//! store's version check makes exactly one of several concurrent rotations win.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::{DateTime, Duration, Utc};
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;
use std::sync::Arc;
use tmis_core::{
    AuthFailure, RefreshTokenRecord, RefreshTokenRepository, Result, Revocation, RotationOutcome,
    TmisError, REVOKED_BY_ROTATION,
};
use uuid::Uuid;

use crate::audit::{audit_log, AuditEvent};

type HmacSha256 = Hmac<Sha256>;

/// Generate 256 bits of randomness, URL-safe base64 without padding
pub fn generate_opaque_token() -> String {
    let mut bytes = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Keyed hash of refresh token plaintext
#[derive(Clone)]
pub struct RefreshTokenHasher {
    mac: HmacSha256,
}

impl RefreshTokenHasher {
    pub fn new(secret: &str) -> Result<Self> {
        if secret.trim().is_empty() {
            return Err(TmisError::Configuration(
                "Refresh token secret is not configured".to_string(),
            ));
        }
        let mac = <HmacSha256 as Mac>::new_from_slice(secret.as_bytes())
            .map_err(|e| TmisError::Configuration(format!("Invalid refresh token secret: {e}")))?;
        Ok(Self { mac })
    }

    /// Lowercase hex, 64 characters
    pub fn hash(&self, plaintext: &str) -> String {
        let mut mac = self.mac.clone();
        mac.update(plaintext.as_bytes());
        mac.finalize()
            .into_bytes()
            .iter()
            .map(|b| format!("{b:02x}"))
            .collect()
    }
}

impl std::fmt::Debug for RefreshTokenHasher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("RefreshTokenHasher([REDACTED])")
    }
}

/// Plaintext returned to the client together with its persisted record
#[derive(Clone)]
pub struct IssuedRefreshToken {
    pub plaintext: String,
    pub record: RefreshTokenRecord,
}

impl IssuedRefreshToken {
    pub fn expires_at(&self) -> DateTime<Utc> {
        self.record.expires_at
    }
}

impl std::fmt::Debug for IssuedRefreshToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IssuedRefreshToken")
            .field("plaintext", &"[REDACTED]")
            .field("record", &self.record)
            .finish()
    }
}

/// Successful rotation
#[derive(Debug, Clone)]
pub struct Rotation {
    /// The superseded record as it was read
    pub previous: RefreshTokenRecord,
    pub issued: IssuedRefreshToken,
}

/// Issues, redeems, rotates and revokes refresh tokens
#[derive(Clone)]
pub struct RefreshTokenService {
    hasher: RefreshTokenHasher,
    store: Arc<dyn RefreshTokenRepository>,
    lifetime: Duration,
}

impl RefreshTokenService {
    pub fn new(
        hasher: RefreshTokenHasher,
        store: Arc<dyn RefreshTokenRepository>,
        lifetime_days: i64,
    ) -> Self {
        Self {
            hasher,
            store,
            lifetime: Duration::days(lifetime_days),
        }
    }

    pub fn hasher(&self) -> &RefreshTokenHasher {
        &self.hasher
    }

    fn mint(&self, principal_id: Uuid, ip: Option<String>) -> IssuedRefreshToken {
        let plaintext = generate_opaque_token();
        let record = RefreshTokenRecord::new(
            principal_id,
            self.hasher.hash(&plaintext),
            Utc::now() + self.lifetime,
            ip,
        );
        IssuedRefreshToken { plaintext, record }
    }

    /// Create and persist a new refresh token for `principal_id`
    pub async fn issue_for(
        &self,
        principal_id: Uuid,
        ip: Option<String>,
    ) -> Result<IssuedRefreshToken> {
        let issued = self.mint(principal_id, ip);
        self.store.insert_token(&issued.record).await?;
        Ok(issued)
    }

    /// Look up a redeemable record by the hash of `plaintext`
    pub async fn redeem(&self, plaintext: &str, ip: Option<&str>) -> Result<RefreshTokenRecord> {
        let invalid = || TmisError::auth(AuthFailure::InvalidRefreshToken);

        let record = self
            .store
            .find_by_hash(&self.hasher.hash(plaintext))
            .await?
            .ok_or_else(invalid)?;

        if record.is_revoked {
            audit_log(&AuditEvent::RefreshReplayDetected {
                user_id: record.principal_id,
                token_id: record.id,
                replaced_by_present: record.replaced_by_token_hash.is_some(),
                ip_address: ip.map(str::to_string),
            });
            return Err(invalid());
        }
        if record.is_expired_at(Utc::now()) {
            return Err(invalid());
        }

        Ok(record)
    }

    /// Replace an already redeemed record with a new token.
    ///
    /// Fails with [`TmisError::Conflict`] when another caller rotated or revoked
    /// `current` first. Store errors leave `current` untouched.
    pub async fn replace(
        &self,
        current: RefreshTokenRecord,
        ip: Option<String>,
    ) -> Result<Rotation> {
        let issued = self.mint(current.principal_id, ip.clone());
        let revocation = Revocation::new(REVOKED_BY_ROTATION, ip.clone());

        match self.store.rotate(&current, &revocation, &issued.record).await? {
            RotationOutcome::Rotated => Ok(Rotation {
                previous: current,
                issued,
            }),
            RotationOutcome::Conflict => {
                audit_log(&AuditEvent::RefreshRotationConflict {
                    user_id: current.principal_id,
                    token_id: current.id,
                    ip_address: ip,
                });
                Err(TmisError::Conflict(format!(
                    "refresh token {} was rotated concurrently",
                    current.id
                )))
            }
        }
    }

    /// Redeem `plaintext` and rotate it in one call
    pub async fn rotate(&self, plaintext: &str, ip: Option<String>) -> Result<Rotation> {
        let current = self.redeem(plaintext, ip.as_deref()).await?;
        self.replace(current, ip).await
    }

    /// Revoke by plaintext; returns false when unknown or already revoked
    pub async fn revoke(&self, plaintext: &str, reason: &str, ip: Option<String>) -> Result<bool> {
        let revocation = Revocation::new(reason, ip);
        self.store
            .revoke_by_hash(&self.hasher.hash(plaintext), &revocation)
            .await
    }

    /// Revoke every outstanding token of a principal; returns how many were revoked
    pub async fn revoke_all(
        &self,
        principal_id: Uuid,
        reason: &str,
        ip: Option<String>,
    ) -> Result<u64> {
        let revocation = Revocation::new(reason, ip);
        self.store
            .revoke_all_for_principal(principal_id, &revocation)
            .await
    }

    /// Look up the record behind `plaintext` without checking its state
    pub async fn find(&self, plaintext: &str) -> Result<Option<RefreshTokenRecord>> {
        self.store.find_by_hash(&self.hasher.hash(plaintext)).await
    }
}
