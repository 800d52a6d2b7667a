//! External token validator — provider-signed (RS256) tokens.
//!
//! Verification flow:
//!
//! 1. Decode the JWT header (no verification) to extract the `kid`.
//! 2. Resolve the public key through the [`KeySetCache`].
//! 3. Verify signature, issuer, audience, and expiry in one pass.
//! 4. Extract roles via the ordered fallback chain: namespaced custom
//!    claim, then `roles`, then `app_metadata.roles` — first non-empty
//!    match wins, otherwise the role list is empty.

use std::sync::Arc;

use jsonwebtoken::{Algorithm, TokenData, Validation};
use tracing::debug;

use super::{DecodedToken, KeySetCache, RawClaims, TokenSource, string_list};
use crate::{Error, Result};

/// Validates tokens issued by the external identity provider.
pub struct ExternalTokenValidator {
    keyset: Arc<KeySetCache>,
    issuer: String,
    audience: String,
    roles_namespace: String,
}

impl ExternalTokenValidator {
    /// Create a validator bound to a key set cache and the configured
    /// issuer/audience pair.
    #[must_use]
    pub fn new(
        keyset: Arc<KeySetCache>,
        issuer: impl Into<String>,
        audience: impl Into<String>,
        roles_namespace: impl Into<String>,
    ) -> Self {
        Self {
            keyset,
            issuer: issuer.into(),
            audience: audience.into(),
            roles_namespace: roles_namespace.into(),
        }
    }

    /// Validate an opaque token string.
    ///
    /// # Errors
    ///
    /// `TokenMalformed`, `SignatureInvalid`, `TokenExpired`,
    /// `IssuerOrAudienceMismatch`, or `KeyResolutionFailed` — never a
    /// silently coerced success.
    pub async fn validate(&self, token: &str) -> Result<DecodedToken> {
        let header = jsonwebtoken::decode_header(token)?;
        let kid = header
            .kid
            .ok_or_else(|| Error::TokenMalformed("missing key id in header".to_string()))?;

        let key = self.keyset.resolve(&kid).await?;

        let mut validation = Validation::new(Algorithm::RS256);
        validation.leeway = 0;
        validation.set_issuer(&[&self.issuer]);
        validation.set_audience(&[&self.audience]);

        let data: TokenData<RawClaims> = jsonwebtoken::decode(token, &key, &validation)?;
        let claims = data.claims;

        let subject = claims
            .sub
            .clone()
            .ok_or_else(|| Error::TokenMalformed("missing sub claim".to_string()))?;
        let roles = self.extract_roles(&claims);

        debug!(subject = %subject, roles = ?roles, "External token validated");

        Ok(DecodedToken {
            source: TokenSource::External,
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
            roles,
            permissions: Vec::new(),
        })
    }

    /// Ordered role-extraction fallback.
    ///
    /// The provider can place roles in a tenant-namespaced custom claim
    /// (its recommended setup), a plain `roles` claim, or inside
    /// `app_metadata`; the first non-empty location wins.
    fn extract_roles(&self, claims: &RawClaims) -> Vec<String> {
        if let Some(value) = claims.extra.get(&self.roles_namespace) {
            if let Some(roles) = string_list(value) {
                return roles;
            }
        }

        if let Some(roles) = &claims.roles {
            if !roles.is_empty() {
                return roles.clone();
            }
        }

        if let Some(meta) = &claims.app_metadata {
            if let Some(roles) = meta.get("roles").and_then(string_list) {
                return roles;
            }
        }

        Vec::new()
    }
}

#[cfg(test)]
mod tests {
    use jsonwebtoken::{DecodingKey, EncodingKey, Header};

    use super::*;
    use crate::token::testkeys;

    const ISSUER: &str = "https://tenant.example.com/";
    const AUDIENCE: &str = "https://api.example.com";
    const NAMESPACE: &str = "https://auth-gateway.dev/roles";

    fn validator() -> ExternalTokenValidator {
        let key = DecodingKey::from_rsa_components(testkeys::RSA_N, testkeys::RSA_E).unwrap();
        let keyset = Arc::new(KeySetCache::with_fixed_keys(vec![(
            testkeys::KID.to_string(),
            key,
        )]));
        ExternalTokenValidator::new(keyset, ISSUER, AUDIENCE, NAMESPACE)
    }

    fn sign(claims: &serde_json::Value) -> String {
        let key = EncodingKey::from_rsa_pem(testkeys::RSA_PRIVATE_PEM.as_bytes()).unwrap();
        let mut header = Header::new(Algorithm::RS256);
        header.kid = Some(testkeys::KID.to_string());
        jsonwebtoken::encode(&header, claims, &key).unwrap()
    }

    fn now() -> i64 {
        chrono::Utc::now().timestamp()
    }

    fn base_claims() -> serde_json::Value {
        serde_json::json!({
            "iss": ISSUER,
            "aud": AUDIENCE,
            "sub": "ext|123",
            "iat": now() - 10,
            "exp": now() + 3600,
            "email": "a@b.com",
        })
    }

    #[tokio::test]
    async fn valid_token_returns_subject_and_source() {
        // GIVEN: a well-formed provider token with a cached key
        let token = sign(&base_claims());

        // WHEN: validated
        let decoded = validator().validate(&token).await.unwrap();

        // THEN: subject matches and the source tag is External
        assert_eq!(decoded.subject, "ext|123");
        assert_eq!(decoded.source, TokenSource::External);
        assert_eq!(decoded.email.as_deref(), Some("a@b.com"));
    }

    #[tokio::test]
    async fn expired_token_fails_with_token_expired() {
        // GIVEN: a correctly signed token whose expiry is in the past
        let mut claims = base_claims();
        claims["exp"] = serde_json::json!(now() - 120);
        let token = sign(&claims);

        // THEN: TokenExpired, independent of the valid signature
        let err = validator().validate(&token).await.unwrap_err();
        assert!(matches!(err, Error::TokenExpired));
    }

    #[tokio::test]
    async fn wrong_issuer_fails_with_mismatch() {
        let mut claims = base_claims();
        claims["iss"] = serde_json::json!("https://evil.example.com/");
        let token = sign(&claims);

        let err = validator().validate(&token).await.unwrap_err();
        assert!(matches!(err, Error::IssuerOrAudienceMismatch));
    }

    #[tokio::test]
    async fn wrong_audience_fails_with_mismatch() {
        let mut claims = base_claims();
        claims["aud"] = serde_json::json!("https://other-api.example.com");
        let token = sign(&claims);

        let err = validator().validate(&token).await.unwrap_err();
        assert!(matches!(err, Error::IssuerOrAudienceMismatch));
    }

    #[tokio::test]
    async fn garbage_token_fails_with_malformed() {
        let err = validator().validate("not-a-jwt").await.unwrap_err();
        assert!(matches!(err, Error::TokenMalformed(_)));
    }

    #[tokio::test]
    async fn token_without_kid_fails_with_malformed() {
        // Header with no kid: the key cannot even be looked up
        let key = EncodingKey::from_rsa_pem(testkeys::RSA_PRIVATE_PEM.as_bytes()).unwrap();
        let token =
            jsonwebtoken::encode(&Header::new(Algorithm::RS256), &base_claims(), &key).unwrap();

        let err = validator().validate(&token).await.unwrap_err();
        assert!(matches!(err, Error::TokenMalformed(_)));
    }

    #[tokio::test]
    async fn unknown_kid_fails_with_key_resolution() {
        let key = EncodingKey::from_rsa_pem(testkeys::RSA_PRIVATE_PEM.as_bytes()).unwrap();
        let mut header = Header::new(Algorithm::RS256);
        header.kid = Some("rotated-away".to_string());
        let token = jsonwebtoken::encode(&header, &base_claims(), &key).unwrap();

        let err = validator().validate(&token).await.unwrap_err();
        assert!(matches!(err, Error::KeyResolutionFailed(_)));
    }

    #[tokio::test]
    async fn roles_prefer_namespaced_claim() {
        let mut claims = base_claims();
        claims[NAMESPACE] = serde_json::json!(["Admin"]);
        claims["roles"] = serde_json::json!(["Student"]);
        let token = sign(&claims);

        let decoded = validator().validate(&token).await.unwrap();
        assert_eq!(decoded.roles, vec!["Admin"]);
    }

    #[tokio::test]
    async fn roles_fall_back_to_plain_claim_then_app_metadata() {
        // Plain `roles` claim
        let mut claims = base_claims();
        claims["roles"] = serde_json::json!(["Teacher"]);
        let decoded = validator().validate(&sign(&claims)).await.unwrap();
        assert_eq!(decoded.roles, vec!["Teacher"]);

        // Only app_metadata
        let mut claims = base_claims();
        claims["app_metadata"] = serde_json::json!({ "roles": ["Parent"] });
        let decoded = validator().validate(&sign(&claims)).await.unwrap();
        assert_eq!(decoded.roles, vec!["Parent"]);

        // Nothing anywhere
        let decoded = validator().validate(&sign(&base_claims())).await.unwrap();
        assert!(decoded.roles.is_empty());
    }

    #[tokio::test]
    async fn empty_namespaced_claim_falls_through() {
        // An empty namespaced list must not shadow a populated `roles` claim
        let mut claims = base_claims();
        claims[NAMESPACE] = serde_json::json!([]);
        claims["roles"] = serde_json::json!(["Student"]);
        let token = sign(&claims);

        let decoded = validator().validate(&token).await.unwrap();
        assert_eq!(decoded.roles, vec!["Student"]);
    }
}
