//! Cross-service validation bridge.
//!
//! Sibling services delegate token validation and user lookups here instead
//! of sharing the signing secret. The bridge contract is total: every
//! operation returns a fully populated response struct and never surfaces
//! an error to the caller — failures become `valid: false` / `found: false`
//! with a human-readable message. `retryable` tells the caller whether the
//! failure was a verdict on the token (no point retrying) or a transient
//! inability to verify it (key fetch failed; retry may succeed).

pub mod handler;

use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::identity::IdentityStore;
use crate::token::ExternalTokenValidator;
use crate::Error;

pub use handler::bridge_routes;

/// Outcome of a token validation request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidateTokenResponse {
    /// Whether the token is valid.
    pub valid: bool,
    /// Local user id, when the subject maps to a stored identity.
    pub user_id: Option<i64>,
    /// Email from the token or identity record.
    pub email: Option<String>,
    /// Display name, when known.
    pub username: Option<String>,
    /// Effective role names (database roles when stored, token roles
    /// otherwise).
    pub roles: Vec<String>,
    /// Token expiry (Unix epoch seconds); zero when invalid.
    pub expires_at: i64,
    /// Failure description; empty on success.
    pub error_message: String,
    /// True when the failure was transient (key resolution) rather than a
    /// verdict on the token itself.
    pub retryable: bool,
}

impl ValidateTokenResponse {
    fn invalid(message: String, retryable: bool) -> Self {
        Self {
            valid: false,
            user_id: None,
            email: None,
            username: None,
            roles: Vec::new(),
            expires_at: 0,
            error_message: message,
            retryable,
        }
    }
}

/// User lookup response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserResponse {
    /// Whether a matching identity exists.
    pub found: bool,
    /// Local user id; zero when not found.
    pub user_id: i64,
    /// Email address; empty when not found.
    pub email: String,
    /// Full display name; empty when not found.
    pub full_name: String,
    /// Role names.
    pub roles: Vec<String>,
    /// Whether the identity is active.
    pub active: bool,
    /// Failure or miss description; empty on success.
    pub error_message: String,
}

impl UserResponse {
    fn not_found(message: String) -> Self {
        Self {
            found: false,
            user_id: 0,
            email: String::new(),
            full_name: String::new(),
            roles: Vec::new(),
            active: false,
            error_message: message,
        }
    }
}

/// Role membership response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HasRoleResponse {
    /// Whether the user exists and holds the role. False for unknown users
    /// and unknown role names alike.
    pub has_role: bool,
    /// Explanation when `has_role` is false for a reason other than plain
    /// non-membership.
    pub error_message: String,
}

/// Role listing response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserRolesResponse {
    /// Whether the user exists.
    pub found: bool,
    /// Role names; empty when not found.
    pub roles: Vec<String>,
    /// Miss description; empty on success.
    pub error_message: String,
}

/// Liveness response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheckResponse {
    /// Always true while the service can answer at all.
    pub healthy: bool,
    /// Human-readable status.
    pub message: String,
    /// Response time (Unix epoch seconds).
    pub timestamp: i64,
}

/// The bridge service.
pub struct ValidationBridge {
    external: Arc<ExternalTokenValidator>,
    store: Arc<dyn IdentityStore>,
}

impl ValidationBridge {
    /// Build a bridge over the external validator and the identity store.
    pub fn new(external: Arc<ExternalTokenValidator>, store: Arc<dyn IdentityStore>) -> Self {
        Self { external, store }
    }

    /// Validate a provider token on behalf of another service.
    pub async fn validate_token(&self, token: &str, caller: &str) -> ValidateTokenResponse {
        info!(caller = %caller, "Bridge token validation");

        let decoded = match self.external.validate(token).await {
            Ok(decoded) => decoded,
            Err(err) => {
                let retryable = matches!(err, Error::KeyResolutionFailed(_));
                warn!(caller = %caller, error = %err, retryable, "Bridge validation failed");
                return ValidateTokenResponse::invalid(err.to_string(), retryable);
            }
        };

        let identity = self.store.find_by_external_id(&decoded.subject).await;
        let roles = match &identity {
            Some(row) if !row.roles.is_empty() => row.role_names(),
            _ => decoded.roles.clone(),
        };

        ValidateTokenResponse {
            valid: true,
            user_id: identity.as_ref().map(|i| i.id),
            email: decoded
                .email
                .clone()
                .or_else(|| identity.as_ref().map(|i| i.email.clone())),
            username: decoded
                .display_name()
                .map(str::to_string)
                .or_else(|| identity.as_ref().map(|i| i.full_name())),
            roles,
            expires_at: decoded.expires_at,
            error_message: String::new(),
            retryable: false,
        }
    }

    /// Look up a user by its stringly-typed id.
    pub async fn get_user_by_id(&self, raw_id: &str) -> UserResponse {
        let Ok(id) = raw_id.trim().parse::<i64>() else {
            return UserResponse::not_found(format!("invalid user id: {raw_id}"));
        };

        match self.store.find_by_id(id).await {
            Some(identity) => UserResponse {
                found: true,
                user_id: identity.id,
                email: identity.email.clone(),
                full_name: identity.full_name(),
                roles: identity.role_names(),
                active: identity.active,
                error_message: String::new(),
            },
            None => UserResponse::not_found(format!("no user with id {id}")),
        }
    }

    /// Check whether a user holds a role.
    pub async fn has_role(&self, raw_id: &str, role_name: &str) -> HasRoleResponse {
        let Ok(id) = raw_id.trim().parse::<i64>() else {
            return HasRoleResponse {
                has_role: false,
                error_message: format!("invalid user id: {raw_id}"),
            };
        };
        let Ok(role) = role_name.parse::<crate::roles::Role>() else {
            return HasRoleResponse {
                has_role: false,
                error_message: format!("unknown role: {role_name}"),
            };
        };

        match self.store.find_by_id(id).await {
            Some(identity) => HasRoleResponse {
                has_role: identity.has_role(role),
                error_message: String::new(),
            },
            None => HasRoleResponse {
                has_role: false,
                error_message: format!("no user with id {id}"),
            },
        }
    }

    /// List a user's roles.
    pub async fn get_user_roles(&self, raw_id: &str) -> UserRolesResponse {
        let Ok(id) = raw_id.trim().parse::<i64>() else {
            return UserRolesResponse {
                found: false,
                roles: Vec::new(),
                error_message: format!("invalid user id: {raw_id}"),
            };
        };

        match self.store.find_by_id(id).await {
            Some(identity) => UserRolesResponse {
                found: true,
                roles: identity.role_names(),
                error_message: String::new(),
            },
            None => UserRolesResponse {
                found: false,
                roles: Vec::new(),
                error_message: format!("no user with id {id}"),
            },
        }
    }

    /// Liveness check for bridge callers.
    pub async fn health_check(&self, caller: &str) -> HealthCheckResponse {
        info!(caller = %caller, "Bridge health check");
        HealthCheckResponse {
            healthy: true,
            message: "auth-gateway bridge is up".to_string(),
            timestamp: Utc::now().timestamp(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use super::*;
    use crate::identity::{InMemoryIdentityStore, NewIdentity};
    use crate::roles::Role;
    use crate::token::{testkeys, KeySetCache};

    const ISSUER: &str = "https://tenant.example.com/";
    const AUDIENCE: &str = "https://api.example.com";

    fn bridge_with_store(store: Arc<InMemoryIdentityStore>) -> ValidationBridge {
        let key = jsonwebtoken::DecodingKey::from_rsa_components(testkeys::RSA_N, testkeys::RSA_E)
            .unwrap();
        let keyset = Arc::new(KeySetCache::with_fixed_keys(vec![(
            testkeys::KID.to_string(),
            key,
        )]));
        let external = Arc::new(ExternalTokenValidator::new(
            keyset,
            ISSUER,
            AUDIENCE,
            "https://auth-gateway.dev/roles",
        ));
        ValidationBridge::new(external, store)
    }

    fn sign(claims: &serde_json::Value) -> String {
        let key =
            jsonwebtoken::EncodingKey::from_rsa_pem(testkeys::RSA_PRIVATE_PEM.as_bytes()).unwrap();
        let mut header = jsonwebtoken::Header::new(jsonwebtoken::Algorithm::RS256);
        header.kid = Some(testkeys::KID.to_string());
        jsonwebtoken::encode(&header, claims, &key).unwrap()
    }

    async fn seeded() -> (ValidationBridge, i64) {
        let store = Arc::new(InMemoryIdentityStore::new());
        let row = store
            .insert(NewIdentity {
                external_id: Some("ext|1".to_string()),
                email: "a@b.com".to_string(),
                first_name: "Alice".to_string(),
                last_name: "A".to_string(),
                roles: [Role::Teacher].into_iter().collect::<BTreeSet<_>>(),
            })
            .await
            .unwrap();
        (bridge_with_store(store), row.id)
    }

    #[tokio::test]
    async fn valid_token_reports_db_roles() {
        // GIVEN: a stored Teacher and a token claiming Student
        let (bridge, user_id) = seeded().await;
        let now = chrono::Utc::now().timestamp();
        let token = sign(&serde_json::json!({
            "iss": ISSUER, "aud": AUDIENCE, "sub": "ext|1",
            "iat": now - 10, "exp": now + 600,
            "email": "a@b.com", "roles": ["Student"],
        }));

        // WHEN: validated through the bridge
        let response = bridge.validate_token(&token, "grade-service").await;

        // THEN: valid, database roles win, all fields populated
        assert!(response.valid);
        assert_eq!(response.user_id, Some(user_id));
        assert_eq!(response.roles, vec!["TEACHER"]);
        assert_eq!(response.expires_at, now + 600);
        assert!(response.error_message.is_empty());
        assert!(!response.retryable);
    }

    #[tokio::test]
    async fn malformed_token_is_invalid_and_not_retryable() {
        let (bridge, _) = seeded().await;
        let response = bridge.validate_token("garbage", "grade-service").await;

        assert!(!response.valid);
        assert!(!response.retryable);
        assert!(!response.error_message.is_empty());
        assert_eq!(response.expires_at, 0);
    }

    #[tokio::test]
    async fn key_resolution_failure_is_retryable() {
        // GIVEN: an empty key set, so the kid cannot be resolved
        let store = Arc::new(InMemoryIdentityStore::new());
        let keyset = Arc::new(KeySetCache::with_fixed_keys(Vec::new()));
        let external = Arc::new(ExternalTokenValidator::new(
            keyset,
            ISSUER,
            AUDIENCE,
            "https://auth-gateway.dev/roles",
        ));
        let bridge = ValidationBridge::new(external, store);

        let now = chrono::Utc::now().timestamp();
        let token = sign(&serde_json::json!({
            "iss": ISSUER, "aud": AUDIENCE, "sub": "ext|1",
            "iat": now, "exp": now + 600,
        }));

        // THEN: invalid but flagged retryable
        let response = bridge.validate_token(&token, "grade-service").await;
        assert!(!response.valid);
        assert!(response.retryable);
    }

    #[tokio::test]
    async fn get_user_by_id_rejects_non_numeric_id() {
        let (bridge, _) = seeded().await;
        let response = bridge.get_user_by_id("not-a-number").await;

        assert!(!response.found);
        assert!(!response.error_message.is_empty());
        assert_eq!(response.user_id, 0);
    }

    #[tokio::test]
    async fn get_user_by_id_returns_profile() {
        let (bridge, user_id) = seeded().await;
        let response = bridge.get_user_by_id(&user_id.to_string()).await;

        assert!(response.found);
        assert_eq!(response.email, "a@b.com");
        assert_eq!(response.full_name, "Alice A");
        assert!(response.active);
    }

    #[tokio::test]
    async fn has_role_covers_membership_unknown_role_and_unknown_user() {
        let (bridge, user_id) = seeded().await;
        let id = user_id.to_string();

        assert!(bridge.has_role(&id, "TEACHER").await.has_role);
        assert!(bridge.has_role(&id, "teacher").await.has_role);
        assert!(!bridge.has_role(&id, "ADMIN").await.has_role);

        let unknown_role = bridge.has_role(&id, "WIZARD").await;
        assert!(!unknown_role.has_role);
        assert!(!unknown_role.error_message.is_empty());

        let unknown_user = bridge.has_role("999", "TEACHER").await;
        assert!(!unknown_user.has_role);
        assert!(!unknown_user.error_message.is_empty());
    }

    #[tokio::test]
    async fn get_user_roles_lists_stored_roles() {
        let (bridge, user_id) = seeded().await;

        let response = bridge.get_user_roles(&user_id.to_string()).await;
        assert!(response.found);
        assert_eq!(response.roles, vec!["TEACHER"]);

        let miss = bridge.get_user_roles("999").await;
        assert!(!miss.found);
        assert!(miss.roles.is_empty());
    }

    #[tokio::test]
    async fn health_check_is_healthy_with_timestamp() {
        let (bridge, _) = seeded().await;
        let before = Utc::now().timestamp();

        let response = bridge.health_check("grade-service").await;
        assert!(response.healthy);
        assert!(response.timestamp >= before);
    }
}
