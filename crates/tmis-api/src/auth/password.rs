//! Password hashing behind an opaque capability
//!
//! The authentication service only sees [`PasswordHasher`]; the Argon2id
//! implementation reports when a stored hash was produced with weaker
//! parameters than the current target so login can re-hash it.

use argon2::{
    password_hash::{
        rand_core::OsRng, PasswordHash, PasswordHasher as _, PasswordVerifier, SaltString,
    },
    Argon2, Params,
};
use thiserror::Error;

/// Password hashing errors
#[derive(Debug, Error)]
pub enum PasswordError {
    #[error("Failed to hash password: {0}")]
    HashingFailed(String),

    #[error("Failed to verify password: {0}")]
    VerificationFailed(String),

    #[error("Invalid password hash format")]
    InvalidHashFormat,
}

/// Outcome of checking a password against a stored hash
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verification {
    Match,
    /// Correct password, but the hash should be replaced
    MatchRehashNeeded,
    Mismatch,
}

impl Verification {
    pub fn is_match(self) -> bool {
        !matches!(self, Self::Mismatch)
    }
}

/// Opaque password hashing capability
pub trait PasswordHasher: Send + Sync {
    fn hash(&self, password: &str) -> Result<String, PasswordError>;

    fn verify(&self, hash: &str, password: &str) -> Result<Verification, PasswordError>;
}

/// Argon2id parameters
///
/// Defaults follow OWASP guidance: 19 MiB memory, 2 iterations, 1 lane.
#[derive(Debug, Clone)]
pub struct PasswordConfig {
    /// Memory cost in KiB
    pub memory_cost: u32,
    /// Iterations
    pub time_cost: u32,
    pub parallelism: u32,
    pub output_len: Option<usize>,
}

impl Default for PasswordConfig {
    fn default() -> Self {
        Self {
            memory_cost: 19456,
            time_cost: 2,
            parallelism: 1,
            output_len: Some(32),
        }
    }
}

impl PasswordConfig {
    fn to_params(&self) -> Result<Params, PasswordError> {
        Params::new(
            self.memory_cost,
            self.time_cost,
            self.parallelism,
            self.output_len,
        )
        .map_err(|e| PasswordError::HashingFailed(e.to_string()))
    }
}

/// Argon2id implementation of [`PasswordHasher`]
#[derive(Debug, Clone)]
pub struct Argon2Hasher {
    params: Params,
}

impl Argon2Hasher {
    pub fn new(config: &PasswordConfig) -> Result<Self, PasswordError> {
        Ok(Self {
            params: config.to_params()?,
        })
    }

    fn argon2(&self) -> Argon2<'static> {
        Argon2::new(
            argon2::Algorithm::Argon2id,
            argon2::Version::V0x13,
            self.params.clone(),
        )
    }

    /// True when the stored hash is weaker than (or different from) the target
    fn needs_rehash(&self, parsed: &PasswordHash<'_>) -> bool {
        if parsed.algorithm != argon2::Algorithm::Argon2id.ident() {
            return true;
        }
        match Params::try_from(parsed) {
            Ok(stored) => {
                stored.m_cost() < self.params.m_cost()
                    || stored.t_cost() < self.params.t_cost()
                    || stored.p_cost() < self.params.p_cost()
            }
            Err(_) => true,
        }
    }
}

impl Default for Argon2Hasher {
    fn default() -> Self {
        Self {
            params: Params::new(19456, 2, 1, Some(32)).unwrap_or_default(),
        }
    }
}

impl PasswordHasher for Argon2Hasher {
    fn hash(&self, password: &str) -> Result<String, PasswordError> {
        let salt = SaltString::generate(&mut OsRng);
        let hash = self
            .argon2()
            .hash_password(password.as_bytes(), &salt)
            .map_err(|e| PasswordError::HashingFailed(e.to_string()))?;
        Ok(hash.to_string())
    }

    fn verify(&self, hash: &str, password: &str) -> Result<Verification, PasswordError> {
        let parsed = PasswordHash::new(hash).map_err(|_| PasswordError::InvalidHashFormat)?;

        // Verification uses the parameters embedded in the stored hash
        match Argon2::default().verify_password(password.as_bytes(), &parsed) {
            Ok(()) if self.needs_rehash(&parsed) => Ok(Verification::MatchRehashNeeded),
            Ok(()) => Ok(Verification::Match),
            Err(argon2::password_hash::Error::Password) => Ok(Verification::Mismatch),
            Err(e) => Err(PasswordError::VerificationFailed(e.to_string())),
        }
    }
}
