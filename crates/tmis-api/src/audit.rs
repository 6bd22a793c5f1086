//! Security audit logging for authentication and tenant events
//!
//! Every event is emitted on the "audit" tracing target so it can be routed to
//! security monitoring separately from application logs. Events never carry
//! refresh token plaintext, invitation tokens, passwords or password hashes.
//!
//! # Example
//!
//! ```ignore
//! use tmis_api::audit::{audit_log, AuditEvent};
//!
//! audit_log(&AuditEvent::LoginSuccess {
//!     user_id: principal.id,
//!     email: principal.email.clone(),
//!     tenant_id: principal.tenant_id(),
//!     ip_address: Some("192.168.1.1".to_string()),
//!     user_agent: None,
//! });
//! ```
//!
//! Author: hephaex@gmail.com

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tmis_core::TenantSource;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Security audit events
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum AuditEvent {
    LoginSuccess {
        user_id: Uuid,
        email: String,
        tenant_id: Option<Uuid>,
        ip_address: Option<String>,
        user_agent: Option<String>,
    },

    /// `reason` is for operators only; the client always sees the generic message
    LoginFailure {
        email: String,
        reason: String,
        ip_address: Option<String>,
        user_agent: Option<String>,
    },

    RegistrationSuccess {
        user_id: Uuid,
        email: String,
        tenant_id: Uuid,
        ip_address: Option<String>,
    },

    RegistrationFailure {
        email: String,
        reason: String,
        ip_address: Option<String>,
    },

    TokenRefresh {
        user_id: Uuid,
        ip_address: Option<String>,
    },

    /// A revoked refresh token was presented again
    RefreshReplayDetected {
        user_id: Uuid,
        token_id: Uuid,
        replaced_by_present: bool,
        ip_address: Option<String>,
    },

    /// Lost a concurrent rotation of the same refresh token
    RefreshRotationConflict {
        user_id: Uuid,
        token_id: Uuid,
        ip_address: Option<String>,
    },

    Logout {
        user_id: Option<Uuid>,
        token_revoked: bool,
        ip_address: Option<String>,
    },

    InvitationCreated {
        invitation_id: Uuid,
        tenant_id: Uuid,
        created_by: Option<Uuid>,
        expires_at: DateTime<Utc>,
    },

    InvitationConsumed {
        invitation_id: Uuid,
        tenant_id: Uuid,
        user_id: Uuid,
        email: String,
    },

    AccessDenied {
        user_id: Option<Uuid>,
        email: Option<String>,
        resource: String,
        required_role: Option<String>,
        ip_address: Option<String>,
    },

    InvalidToken {
        ip_address: Option<String>,
        user_agent: Option<String>,
        reason: String,
    },

    TenantResolved {
        tenant_id: Uuid,
        source: TenantSource,
        path: String,
    },
}

/// Log a security audit event
pub fn audit_log(event: &AuditEvent) {
    let timestamp = Utc::now();

    let event_json = serde_json::to_string(event)
        .unwrap_or_else(|e| format!("{{\"error\":\"Failed to serialize audit event: {e}\"}}"));

    match event {
        AuditEvent::LoginSuccess {
            user_id,
            email,
            tenant_id,
            ip_address,
            ..
        } => {
            info!(
                target: "audit",
                timestamp = %timestamp,
                event = %event_json,
                user_id = %user_id,
                email = %email,
                tenant_id = ?tenant_id,
                ip_address = ?ip_address,
                "Login successful"
            );
        }
        AuditEvent::LoginFailure {
            email,
            reason,
            ip_address,
            ..
        } => {
            info!(
                target: "audit",
                timestamp = %timestamp,
                event = %event_json,
                email = %email,
                reason = %reason,
                ip_address = ?ip_address,
                "Login failed"
            );
        }
        AuditEvent::RegistrationSuccess {
            user_id,
            email,
            tenant_id,
            ip_address,
        } => {
            info!(
                target: "audit",
                timestamp = %timestamp,
                event = %event_json,
                user_id = %user_id,
                email = %email,
                tenant_id = %tenant_id,
                ip_address = ?ip_address,
                "Registration successful"
            );
        }
        AuditEvent::RegistrationFailure {
            email,
            reason,
            ip_address,
        } => {
            info!(
                target: "audit",
                timestamp = %timestamp,
                event = %event_json,
                email = %email,
                reason = %reason,
                ip_address = ?ip_address,
                "Registration failed"
            );
        }
        AuditEvent::TokenRefresh {
            user_id,
            ip_address,
        } => {
            info!(
                target: "audit",
                timestamp = %timestamp,
                event = %event_json,
                user_id = %user_id,
                ip_address = ?ip_address,
                "Token refresh"
            );
        }
        AuditEvent::RefreshReplayDetected {
            user_id,
            token_id,
            ip_address,
            ..
        } => {
            warn!(
                target: "audit",
                timestamp = %timestamp,
                event = %event_json,
                user_id = %user_id,
                token_id = %token_id,
                ip_address = ?ip_address,
                "Revoked refresh token presented"
            );
        }
        AuditEvent::RefreshRotationConflict {
            user_id,
            token_id,
            ip_address,
        } => {
            warn!(
                target: "audit",
                timestamp = %timestamp,
                event = %event_json,
                user_id = %user_id,
                token_id = %token_id,
                ip_address = ?ip_address,
                "Concurrent refresh token rotation rejected"
            );
        }
        AuditEvent::Logout {
            user_id,
            token_revoked,
            ip_address,
        } => {
            info!(
                target: "audit",
                timestamp = %timestamp,
                event = %event_json,
                user_id = ?user_id,
                token_revoked = %token_revoked,
                ip_address = ?ip_address,
                "User logout"
            );
        }
        AuditEvent::InvitationCreated {
            invitation_id,
            tenant_id,
            created_by,
            ..
        } => {
            info!(
                target: "audit",
                timestamp = %timestamp,
                event = %event_json,
                invitation_id = %invitation_id,
                tenant_id = %tenant_id,
                created_by = ?created_by,
                "Invitation created"
            );
        }
        AuditEvent::InvitationConsumed {
            invitation_id,
            tenant_id,
            user_id,
            ..
        } => {
            info!(
                target: "audit",
                timestamp = %timestamp,
                event = %event_json,
                invitation_id = %invitation_id,
                tenant_id = %tenant_id,
                user_id = %user_id,
                "Invitation consumed"
            );
        }
        AuditEvent::AccessDenied {
            user_id,
            email,
            resource,
            required_role,
            ip_address,
        } => {
            info!(
                target: "audit",
                timestamp = %timestamp,
                event = %event_json,
                user_id = ?user_id,
                email = ?email,
                resource = %resource,
                required_role = ?required_role,
                ip_address = ?ip_address,
                "Access denied"
            );
        }
        AuditEvent::InvalidToken {
            ip_address, reason, ..
        } => {
            info!(
                target: "audit",
                timestamp = %timestamp,
                event = %event_json,
                ip_address = ?ip_address,
                reason = %reason,
                "Invalid token"
            );
        }
        AuditEvent::TenantResolved {
            tenant_id,
            source,
            path,
        } => {
            debug!(
                target: "audit",
                timestamp = %timestamp,
                tenant_id = %tenant_id,
                source = ?source,
                path = %path,
                "Tenant resolved"
            );
        }
    }
}

/// Client IP from `X-Forwarded-For` (first hop) or `X-Real-IP`
pub fn extract_ip_address(headers: &axum::http::HeaderMap) -> Option<String> {
    if let Some(first_ip) = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|ip| !ip.is_empty())
    {
        return Some(first_ip.to_string());
    }

    headers
        .get("x-real-ip")
        .and_then(|v| v.to_str().ok())
        .map(|ip| ip.trim().to_string())
}

pub fn extract_user_agent(headers: &axum::http::HeaderMap) -> Option<String> {
    headers
        .get(axum::http::header::USER_AGENT)
        .and_then(|ua| ua.to_str().ok())
        .map(|s| s.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_audit_event_serialization() {
        let event = AuditEvent::RefreshRotationConflict {
            user_id: Uuid::new_v4(),
            token_id: Uuid::new_v4(),
            ip_address: Some("192.168.1.1".to_string()),
        };

        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"event_type\":\"refresh_rotation_conflict\""));
    }

    #[test]
    fn test_tenant_source_serialized_snake_case() {
        let event = AuditEvent::TenantResolved {
            tenant_id: Uuid::new_v4(),
            source: TenantSource::Subdomain,
            path: "/api/customers".to_string(),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"source\":\"subdomain\""));
        audit_log(&event);
    }

    #[test]
    fn test_audit_log_does_not_panic() {
        audit_log(&AuditEvent::LoginFailure {
            email: "test@example.com".to_string(),
            reason: "inactive".to_string(),
            ip_address: None,
            user_agent: None,
        });
        audit_log(&AuditEvent::Logout {
            user_id: None,
            token_revoked: false,
            ip_address: None,
        });
    }

    #[test]
    fn test_extract_ip_from_x_forwarded_for() {
        let mut headers = axum::http::HeaderMap::new();
        headers.insert(
            "x-forwarded-for",
            "203.0.113.1, 198.51.100.1".parse().unwrap(),
        );
        headers.insert("x-real-ip", "10.0.0.9".parse().unwrap());

        assert_eq!(extract_ip_address(&headers), Some("203.0.113.1".to_string()));
    }

    #[test]
    fn test_extract_ip_from_x_real_ip() {
        let mut headers = axum::http::HeaderMap::new();
        headers.insert("x-real-ip", "203.0.113.1".parse().unwrap());

        assert_eq!(extract_ip_address(&headers), Some("203.0.113.1".to_string()));
    }

    #[test]
    fn test_extract_missing_headers() {
        let headers = axum::http::HeaderMap::new();

        assert_eq!(extract_ip_address(&headers), None);
        assert_eq!(extract_user_agent(&headers), None);
    }
}
