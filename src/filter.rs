//! Request authentication filter.
//!
//! Runs on every request, tries the enriched validator first (a local HMAC
//! check, no I/O) and falls back to the external validator. The filter is
//! fail-open: it never rejects a request itself. A failed or absent token
//! leaves the request anonymous and authorization decisions to the route
//! handlers behind it.

use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::header;
use axum::middleware::Next;
use axum::response::Response;
use tracing::{debug, warn};

use crate::identity::IdentityStore;
use crate::permissions;
use crate::roles::Role;
use crate::token::{
    DecodedToken, EnrichedTokenValidator, ExternalTokenValidator, TokenSource,
};

/// Authenticated caller attached to a request.
#[derive(Debug, Clone)]
pub struct Principal {
    /// Local identity id, when the subject resolves to a stored identity.
    pub user_id: Option<i64>,
    /// Email from the token or the identity record.
    pub email: Option<String>,
    /// External provider subject.
    pub external_id: String,
    /// Granted authorities: `ROLE_`-prefixed role names plus permission
    /// strings, deduplicated.
    pub authorities: Vec<String>,
}

impl Principal {
    /// Whether the principal holds the given authority.
    #[must_use]
    pub fn has_authority(&self, authority: &str) -> bool {
        self.authorities.iter().any(|a| a == authority)
    }
}

/// Per-request authentication state, inserted as a request extension.
#[derive(Debug, Clone)]
pub enum AuthContext {
    /// No token, or a token that failed validation.
    Anonymous,
    /// A token validated against one of the two trust domains.
    Authenticated(Principal),
}

impl AuthContext {
    /// The principal, when authenticated.
    #[must_use]
    pub fn principal(&self) -> Option<&Principal> {
        match self {
            Self::Anonymous => None,
            Self::Authenticated(p) => Some(p),
        }
    }
}

/// The filter itself; shared as router state.
pub struct AuthFilter {
    enriched: EnrichedTokenValidator,
    external: Arc<ExternalTokenValidator>,
    store: Arc<dyn IdentityStore>,
}

impl AuthFilter {
    /// Build a filter over both validators and the identity store.
    pub fn new(
        enriched: EnrichedTokenValidator,
        external: Arc<ExternalTokenValidator>,
        store: Arc<dyn IdentityStore>,
    ) -> Self {
        Self {
            enriched,
            external,
            store,
        }
    }

    /// Resolve a bearer token to an authentication context.
    ///
    /// Attempts are sequential: enriched first (cheap, carries cached
    /// authorization state), external second. Either failure is logged and
    /// swallowed; the outcome is `Anonymous`, never an error.
    pub async fn resolve(&self, token: &str) -> AuthContext {
        match self.enriched.validate(token) {
            Ok(decoded) => return self.principal_from_enriched(decoded).await,
            Err(err) => {
                debug!(error = %err, "Enriched validation failed, trying external");
            }
        }

        match self.external.validate(token).await {
            Ok(decoded) => self.principal_from_external(decoded).await,
            Err(err) => {
                warn!(error = %err, "Token failed both validators");
                AuthContext::Anonymous
            }
        }
    }

    /// Enriched path: roles and permissions come straight from the token.
    /// The store lookup only attaches the local user id and is best-effort.
    async fn principal_from_enriched(&self, decoded: DecodedToken) -> AuthContext {
        debug_assert_eq!(decoded.source, TokenSource::Enriched);

        let identity = self.store.find_by_external_id(&decoded.subject).await;
        let mut authorities: Vec<String> = decoded
            .roles
            .iter()
            .map(|r| format!("ROLE_{}", r.to_uppercase()))
            .collect();
        authorities.extend(decoded.permissions.iter().cloned());
        authorities.dedup();

        AuthContext::Authenticated(Principal {
            user_id: identity.as_ref().map(|i| i.id),
            email: decoded.email.or_else(|| identity.map(|i| i.email)),
            external_id: decoded.subject,
            authorities,
        })
    }

    /// External path: the database wins. When the stored identity has a
    /// non-empty role set it overrides whatever the token embedded; an
    /// empty stored set falls back to the token roles. Permissions are
    /// derived from the effective roles.
    async fn principal_from_external(&self, decoded: DecodedToken) -> AuthContext {
        let identity = self.store.find_by_external_id(&decoded.subject).await;

        let effective_roles: Vec<String> = match &identity {
            Some(row) if !row.roles.is_empty() => row.role_names(),
            _ => decoded.roles.clone(),
        };

        let parsed: std::collections::BTreeSet<Role> = Role::parse_set(&effective_roles);
        let mut authorities: Vec<String> = effective_roles
            .iter()
            .map(|r| format!("ROLE_{}", r.to_uppercase()))
            .collect();
        authorities.extend(permissions::resolve(&parsed));
        authorities.dedup();

        AuthContext::Authenticated(Principal {
            user_id: identity.as_ref().map(|i| i.id),
            email: decoded.email.or_else(|| identity.map(|i| i.email)),
            external_id: decoded.subject,
            authorities,
        })
    }
}

/// Axum middleware: authenticate and continue.
///
/// Always calls the inner service. Handlers read the [`AuthContext`]
/// extension to make their own authorization decisions.
pub async fn authenticate(
    State(filter): State<Arc<AuthFilter>>,
    mut request: Request,
    next: Next,
) -> Response {
    let context = match bearer_token(&request) {
        Some(token) => filter.resolve(&token).await,
        None => AuthContext::Anonymous,
    };
    request.extensions_mut().insert(context);
    next.run(request).await
}

fn bearer_token(request: &Request) -> Option<String> {
    let value = request.headers().get(header::AUTHORIZATION)?.to_str().ok()?;
    let token = value.strip_prefix("Bearer ").or_else(|| value.strip_prefix("bearer "))?;
    let token = token.trim();
    if token.is_empty() {
        None
    } else {
        Some(token.to_string())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use axum::body::Body;
    use axum::http::Request as HttpRequest;

    use super::*;
    use crate::identity::{InMemoryIdentityStore, NewIdentity};
    use crate::token::{EnrichedTokenIssuer, KeySetCache};
    use crate::token::testkeys;

    const SECRET: &str = "filter-test-secret-0123456789abcdef0123456789";
    const ISSUER: &str = "https://tenant.example.com/";
    const AUDIENCE: &str = "https://api.example.com";
    const NAMESPACE: &str = "https://auth-gateway.dev/roles";

    fn filter_with_store(store: Arc<InMemoryIdentityStore>) -> AuthFilter {
        let key = jsonwebtoken::DecodingKey::from_rsa_components(testkeys::RSA_N, testkeys::RSA_E)
            .unwrap();
        let keyset = Arc::new(KeySetCache::with_fixed_keys(vec![(
            testkeys::KID.to_string(),
            key,
        )]));
        let external = Arc::new(ExternalTokenValidator::new(
            keyset, ISSUER, AUDIENCE, NAMESPACE,
        ));
        let enriched = EnrichedTokenValidator::new(SECRET, ISSUER, AUDIENCE);
        AuthFilter::new(enriched, external, store)
    }

    fn sign_external(claims: &serde_json::Value) -> String {
        let key =
            jsonwebtoken::EncodingKey::from_rsa_pem(testkeys::RSA_PRIVATE_PEM.as_bytes()).unwrap();
        let mut header = jsonwebtoken::Header::new(jsonwebtoken::Algorithm::RS256);
        header.kid = Some(testkeys::KID.to_string());
        jsonwebtoken::encode(&header, claims, &key).unwrap()
    }

    fn external_claims(sub: &str, roles: &[&str]) -> serde_json::Value {
        let now = chrono::Utc::now().timestamp();
        serde_json::json!({
            "iss": ISSUER,
            "aud": AUDIENCE,
            "sub": sub,
            "iat": now - 10,
            "exp": now + 3600,
            "email": "a@b.com",
            "roles": roles,
        })
    }

    async fn seeded_store(external_id: &str, roles: &[Role]) -> Arc<InMemoryIdentityStore> {
        let store = Arc::new(InMemoryIdentityStore::new());
        store
            .insert(NewIdentity {
                external_id: Some(external_id.to_string()),
                email: "a@b.com".to_string(),
                first_name: "Alice".to_string(),
                last_name: "A".to_string(),
                roles: roles.iter().copied().collect::<BTreeSet<_>>(),
            })
            .await
            .unwrap();
        store
    }

    #[tokio::test]
    async fn invalid_token_resolves_to_anonymous() {
        // GIVEN: a filter and a token neither validator accepts
        let filter = filter_with_store(Arc::new(InMemoryIdentityStore::new()));

        // WHEN / THEN: the outcome is Anonymous, not an error
        let context = filter.resolve("complete-garbage").await;
        assert!(context.principal().is_none());
    }

    #[tokio::test]
    async fn db_roles_override_token_roles_on_external_path() {
        // GIVEN: a token claiming Student, a stored identity holding Teacher
        let store = seeded_store("ext|1", &[Role::Teacher]).await;
        let filter = filter_with_store(store);
        let token = sign_external(&external_claims("ext|1", &["Student"]));

        // WHEN: resolved
        let context = filter.resolve(&token).await;

        // THEN: the database wins
        let principal = context.principal().unwrap();
        assert!(principal.has_authority("ROLE_TEACHER"));
        assert!(!principal.has_authority("ROLE_STUDENT"));
        assert!(principal.has_authority("write:grades"));
    }

    #[tokio::test]
    async fn empty_db_role_set_falls_back_to_token_roles() {
        let store = seeded_store("ext|1", &[]).await;
        let filter = filter_with_store(store);
        let token = sign_external(&external_claims("ext|1", &["Student"]));

        let context = filter.resolve(&token).await;
        let principal = context.principal().unwrap();
        assert!(principal.has_authority("ROLE_STUDENT"));
        assert!(principal.has_authority("read:grades"));
    }

    #[tokio::test]
    async fn unknown_subject_still_authenticates_from_token() {
        // No stored identity at all: token roles carry the principal
        let filter = filter_with_store(Arc::new(InMemoryIdentityStore::new()));
        let token = sign_external(&external_claims("ext|ghost", &["Parent"]));

        let context = filter.resolve(&token).await;
        let principal = context.principal().unwrap();
        assert_eq!(principal.user_id, None);
        assert!(principal.has_authority("ROLE_PARENT"));
    }

    #[tokio::test]
    async fn enriched_token_uses_embedded_authorities() {
        // GIVEN: an enriched token minted when the user held Teacher
        let store = seeded_store("ext|1", &[Role::Teacher]).await;
        let identity = store.find_by_external_id("ext|1").await.unwrap();
        let issuer = EnrichedTokenIssuer::new(SECRET, ISSUER, AUDIENCE, 24);
        let now = chrono::Utc::now().timestamp();
        let external = DecodedToken {
            source: TokenSource::External,
            issuer: ISSUER.to_string(),
            audience: AUDIENCE.to_string(),
            subject: "ext|1".to_string(),
            issued_at: Some(now),
            expires_at: now + 3600,
            email: Some("a@b.com".to_string()),
            name: None,
            nickname: None,
            picture: None,
            scope: None,
            roles: Vec::new(),
            permissions: Vec::new(),
        };
        let token = issuer.issue(&external, &identity).unwrap();

        // WHEN: resolved through the filter
        let context = filter_with_store(store).resolve(&token).await;

        // THEN: authorities come from the embedded claims, user id attached
        let principal = context.principal().unwrap();
        assert_eq!(principal.user_id, Some(identity.id));
        assert!(principal.has_authority("ROLE_TEACHER"));
        assert!(principal.has_authority("write:grades"));
    }

    #[test]
    fn bearer_extraction_handles_casing_and_absence() {
        let with = |value: &str| {
            HttpRequest::builder()
                .header(header::AUTHORIZATION, value)
                .body(Body::empty())
                .unwrap()
        };

        assert_eq!(bearer_token(&with("Bearer abc")).as_deref(), Some("abc"));
        assert_eq!(bearer_token(&with("bearer abc")).as_deref(), Some("abc"));
        assert_eq!(bearer_token(&with("Basic abc")), None);
        assert_eq!(bearer_token(&with("Bearer ")), None);
        assert_eq!(
            bearer_token(&HttpRequest::builder().body(Body::empty()).unwrap()),
            None
        );
    }
}
