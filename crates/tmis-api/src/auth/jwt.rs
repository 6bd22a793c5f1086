//! Access token issuance and validation
//!
//! Access tokens are HMAC-SHA256 signed JWTs carrying the principal's identity,
//! tenant and role. The algorithm is pinned: a token whose header names any
//! other algorithm is rejected before its signature is looked at.

use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tmis_core::{JwtSettings, Principal, TmisError};
use uuid::Uuid;

/// Claims embedded in every access token
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessClaims {
    /// Subject - principal id
    pub sub: Uuid,
    pub email: String,
    /// Display name
    pub name: String,
    /// Absent for system administrators
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub company_id: Option<Uuid>,
    pub role_id: Uuid,
    pub role_name: String,
    pub is_active: bool,
    pub iss: String,
    pub aud: String,
    pub iat: i64,
    pub nbf: i64,
    pub exp: i64,
    /// Unique token id
    pub jti: Uuid,
}

/// Access token validation errors
#[derive(Debug, Error)]
pub enum JwtError {
    #[error("Failed to encode JWT: {0}")]
    EncodingError(#[from] jsonwebtoken::errors::Error),

    #[error("Invalid token format")]
    InvalidToken,

    #[error("Token has expired")]
    ExpiredToken,

    #[error("Token is not yet valid")]
    ImmatureToken,

    #[error("Invalid token signature")]
    InvalidSignature,

    #[error("Unexpected signing algorithm")]
    InvalidAlgorithm,
}

/// A freshly signed access token
#[derive(Debug, Clone)]
pub struct IssuedAccessToken {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

/// Builds and verifies access tokens
///
/// Constructed once at startup; a missing secret, issuer or audience is a
/// configuration error, never a per-request failure.
#[derive(Clone)]
pub struct TokenIssuer {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    issuer: String,
    audience: String,
    lifetime: Duration,
    not_before_skew: Duration,
}

impl std::fmt::Debug for TokenIssuer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenIssuer")
            .field("issuer", &self.issuer)
            .field("audience", &self.audience)
            .field("lifetime", &self.lifetime)
            .finish_non_exhaustive()
    }
}

impl TokenIssuer {
    pub fn new(settings: &JwtSettings) -> Result<Self, TmisError> {
        if settings.secret.trim().is_empty() {
            return Err(TmisError::Configuration(
                "JWT signing secret is not configured".to_string(),
            ));
        }
        if settings.issuer.trim().is_empty() || settings.audience.trim().is_empty() {
            return Err(TmisError::Configuration(
                "JWT issuer and audience must be configured".to_string(),
            ));
        }

        Ok(Self {
            encoding_key: EncodingKey::from_secret(settings.secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(settings.secret.as_bytes()),
            issuer: settings.issuer.clone(),
            audience: settings.audience.clone(),
            lifetime: Duration::minutes(settings.effective_expiry_minutes()),
            not_before_skew: Duration::seconds(settings.not_before_skew_secs.max(0)),
        })
    }

    /// Sign an access token for `principal`
    pub fn issue(&self, principal: &Principal) -> Result<IssuedAccessToken, JwtError> {
        self.issue_at(principal, Utc::now())
    }

    fn issue_at(
        &self,
        principal: &Principal,
        now: DateTime<Utc>,
    ) -> Result<IssuedAccessToken, JwtError> {
        let expires_at = now + self.lifetime;
        let role = principal.membership.role();

        let claims = AccessClaims {
            sub: principal.id,
            email: principal.email.clone(),
            name: principal.display_name(),
            company_id: principal.tenant_id(),
            role_id: role.role_id,
            role_name: role.role_name.clone(),
            is_active: principal.is_active,
            iss: self.issuer.clone(),
            aud: self.audience.clone(),
            iat: now.timestamp(),
            nbf: (now - self.not_before_skew).timestamp(),
            exp: expires_at.timestamp(),
            jti: Uuid::new_v4(),
        };

        let token = encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)?;

        Ok(IssuedAccessToken { token, expires_at })
    }

    /// Verify signature, algorithm, issuer, audience, `nbf` and `exp` (no leeway)
    pub fn validate(&self, token: &str) -> Result<AccessClaims, JwtError> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_issuer(&[&self.issuer]);
        validation.set_audience(&[&self.audience]);
        validation.set_required_spec_claims(&["exp", "nbf", "iss", "aud", "sub"]);
        validation.validate_nbf = true;
        validation.leeway = 0;

        let data = decode::<AccessClaims>(token, &self.decoding_key, &validation).map_err(|e| {
            use jsonwebtoken::errors::ErrorKind;
            match e.kind() {
                ErrorKind::ExpiredSignature => JwtError::ExpiredToken,
                ErrorKind::ImmatureSignature => JwtError::ImmatureToken,
                ErrorKind::InvalidSignature => JwtError::InvalidSignature,
                ErrorKind::InvalidAlgorithm | ErrorKind::InvalidAlgorithmName => {
                    JwtError::InvalidAlgorithm
                }
                _ => JwtError::InvalidToken,
            }
        })?;

        Ok(data.claims)
    }
}
