//! Authentication and authorization module
//!
//! This module provides the credential side of the service:
//! - Access token issuance and validation (HS256)
//! - Password hashing with Argon2id
//! - Refresh token issuance and rotation with keyed hashing
//! - Middleware for request authentication and role checks
//! - Authentication service orchestrating login, registration, refresh and logout

pub mod jwt;
pub mod middleware;
pub mod password;
pub mod refresh;
pub mod service;

pub use jwt::{AccessClaims, IssuedAccessToken, JwtError, TokenIssuer};
pub use middleware::{auth_middleware, require_role, AuthError, AuthenticatedPrincipal};
pub use password::{Argon2Hasher, PasswordConfig, PasswordError, PasswordHasher, Verification};
pub use refresh::{IssuedRefreshToken, RefreshTokenHasher, RefreshTokenService, Rotation};
pub use service::{
    AuthResult, AuthService, ClientInfo, LoginRequest, RegisterRequest, UserSummary,
};
