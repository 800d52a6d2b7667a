//! Enriched tokens — internally signed, carrying live roles/permissions.
//!
//! The provider's tokens prove *who* the caller is; they cannot carry this
//! platform's database-backed authorization state. After a successful
//! external validation the issuer here mints a second token, HS256-signed
//! with the service secret — a deliberate trust-boundary transition from
//! the provider's asymmetric signature — embedding the identity's current
//! role set and the derived permissions. Validating an enriched token then
//! needs no database lookup at all: it is the fast path.

use chrono::Utc;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, TokenData, Validation};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{DecodedToken, RawClaims, TokenSource};
use crate::identity::Identity;
use crate::permissions;
use crate::{Error, Result};

/// Claim set written into enriched tokens.
#[derive(Debug, Serialize, Deserialize)]
struct EnrichedClaims {
    iss: String,
    aud: String,
    sub: String,
    iat: i64,
    exp: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    email: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    nickname: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    picture: Option<String>,
    scope: String,
    roles: Vec<String>,
    permissions: Vec<String>,
}

/// Mints enriched tokens from a validated external token plus the local
/// identity record.
pub struct EnrichedTokenIssuer {
    key: EncodingKey,
    default_issuer: String,
    default_audience: String,
    default_ttl_secs: i64,
}

impl EnrichedTokenIssuer {
    /// Create an issuer signing with `secret` (HS256).
    #[must_use]
    pub fn new(
        secret: &str,
        default_issuer: impl Into<String>,
        default_audience: impl Into<String>,
        default_ttl_hours: u64,
    ) -> Self {
        Self {
            key: EncodingKey::from_secret(secret.as_bytes()),
            default_issuer: default_issuer.into(),
            default_audience: default_audience.into(),
            default_ttl_secs: i64::try_from(default_ttl_hours * 3600).unwrap_or(86_400),
        }
    }

    /// Issue an enriched token.
    ///
    /// Issuer, audience, subject, and timestamps are copied from the
    /// external token (configured defaults fill any gaps); the passthrough
    /// claim allow-list is email, name, nickname, picture and scope. Roles
    /// come from the identity's **current** role set and permissions from
    /// the static resolver — never from the external token.
    pub fn issue(&self, external: &DecodedToken, identity: &Identity) -> Result<String> {
        let now = Utc::now().timestamp();
        let exp = if external.expires_at > 0 {
            external.expires_at
        } else {
            now + self.default_ttl_secs
        };

        let roles: Vec<String> = identity.roles.iter().map(ToString::to_string).collect();
        let perms: Vec<String> = permissions::resolve(&identity.roles).into_iter().collect();

        let claims = EnrichedClaims {
            iss: if external.issuer.is_empty() {
                self.default_issuer.clone()
            } else {
                external.issuer.clone()
            },
            aud: if external.audience.is_empty() {
                self.default_audience.clone()
            } else {
                external.audience.clone()
            },
            sub: external.subject.clone(),
            iat: external.issued_at.unwrap_or(now),
            exp,
            email: external.email.clone(),
            name: external.name.clone(),
            nickname: external.nickname.clone(),
            picture: external.picture.clone(),
            scope: external
                .scope
                .clone()
                .unwrap_or_else(|| "openid profile email".to_string()),
            roles,
            permissions: perms,
        };

        debug!(subject = %claims.sub, roles = ?claims.roles, "Issuing enriched token");

        jsonwebtoken::encode(&Header::new(Algorithm::HS256), &claims, &self.key)
            .map_err(|e| Error::Internal(format!("failed to sign enriched token: {e}")))
    }
}

/// Validates enriched tokens against the shared secret.
///
/// Issuer and audience are checked against the same configured values as
/// the external validator — both trust domains share one namespace so a
/// client can swap token families transparently.
pub struct EnrichedTokenValidator {
    key: DecodingKey,
    issuer: String,
    audience: String,
}

impl EnrichedTokenValidator {
    /// Create a validator for tokens signed with `secret`.
    #[must_use]
    pub fn new(secret: &str, issuer: impl Into<String>, audience: impl Into<String>) -> Self {
        Self {
            key: DecodingKey::from_secret(secret.as_bytes()),
            issuer: issuer.into(),
            audience: audience.into(),
        }
    }

    /// Validate an enriched token string.
    ///
    /// # Errors
    ///
    /// Mirrors the external validator minus key resolution:
    /// `TokenMalformed`, `SignatureInvalid`, `TokenExpired`,
    /// `IssuerOrAudienceMismatch`.
    pub fn validate(&self, token: &str) -> Result<DecodedToken> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;
        validation.set_issuer(&[&self.issuer]);
        validation.set_audience(&[&self.audience]);

        let data: TokenData<RawClaims> = jsonwebtoken::decode(token, &self.key, &validation)?;
        let claims = data.claims;

        let subject = claims
            .sub
            .clone()
            .ok_or_else(|| Error::TokenMalformed("missing sub claim".to_string()))?;

        debug!(subject = %subject, "Enriched token validated");

        Ok(DecodedToken {
            source: TokenSource::Enriched,
            issuer: claims.iss.clone().unwrap_or_else(|| self.issuer.clone()),
            audience: claims.audience().unwrap_or_else(|| self.audience.clone()),
            subject,
            issued_at: claims.iat,
            expires_at: claims.exp.unwrap_or_default(),
            email: claims.email,
            name: claims.name,
            nickname: claims.nickname,
            picture: claims.picture,
            scope: claims.scope,
            roles: claims.roles.unwrap_or_default(),
            permissions: claims.permissions.unwrap_or_default(),
        })
    }
}
