//! Management client for the external identity provider.
//!
//! Covers the small slice of the provider's management API the gateway
//! needs: password logins, user creation, lookup by email, password-reset
//! triggers, and email-verification flags. Management calls authenticate
//! with a client-credentials token that is cached until shortly before its
//! expiry.

use std::time::{Duration, Instant};

use parking_lot::RwLock;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::ProviderConfig;
use crate::{Error, Result};

/// Token bundle returned by the provider's token endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct TokenResponse {
    /// The access token (a provider-signed JWT).
    pub access_token: String,
    /// Refresh token, when the grant allows one.
    #[serde(default)]
    pub refresh_token: Option<String>,
    /// ID token, when `openid` scope was requested.
    #[serde(default)]
    pub id_token: Option<String>,
    /// Lifetime in seconds.
    pub expires_in: u64,
    /// Token type, normally `Bearer`.
    #[serde(default)]
    pub token_type: String,
}

/// Provider-side user record, as returned by the management API.
#[derive(Debug, Clone, Deserialize)]
pub struct ProviderUser {
    /// Provider user id (the `sub` of its tokens).
    pub user_id: String,
    /// Registered email.
    pub email: String,
    /// Whether the email is verified.
    #[serde(default)]
    pub email_verified: bool,
}

#[derive(Debug, Serialize)]
struct PasswordGrant<'a> {
    grant_type: &'a str,
    username: &'a str,
    password: &'a str,
    audience: &'a str,
    client_id: &'a str,
    client_secret: &'a str,
    realm: &'a str,
    scope: &'a str,
}

#[derive(Debug, Serialize)]
struct ClientCredentialsGrant<'a> {
    grant_type: &'a str,
    client_id: &'a str,
    client_secret: &'a str,
    audience: &'a str,
}

#[derive(Debug, Serialize)]
struct CreateUserRequest<'a> {
    email: &'a str,
    password: &'a str,
    connection: &'a str,
    given_name: &'a str,
    family_name: &'a str,
    name: String,
}

struct CachedToken {
    token: String,
    expires_at: Instant,
}

/// Client for the provider's authentication and management endpoints.
pub struct ProviderClient {
    http: reqwest::Client,
    config: ProviderConfig,
    management_token: RwLock<Option<CachedToken>>,
}

impl ProviderClient {
    /// Slack subtracted from the token lifetime so a token is never used
    /// within a minute of expiry.
    const EXPIRY_SLACK: Duration = Duration::from_secs(60);

    /// Build a client from the provider configuration.
    ///
    /// # Errors
    ///
    /// `Config` when the HTTP client cannot be constructed.
    pub fn new(config: ProviderConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| Error::Config(format!("failed to build provider http client: {e}")))?;
        Ok(Self {
            http,
            config,
            management_token: RwLock::new(None),
        })
    }

    fn base_url(&self) -> String {
        self.config.base_url()
    }

    /// Exchange credentials for provider tokens (password-realm grant).
    ///
    /// # Errors
    ///
    /// `UpstreamProvider` on transport failure or a non-success status —
    /// including 401/403 for wrong credentials.
    pub async fn login(&self, username: &str, password: &str) -> Result<TokenResponse> {
        let grant = PasswordGrant {
            grant_type: "http://auth0.com/oauth/grant-type/password-realm",
            username,
            password,
            audience: &self.config.audience,
            client_id: &self.config.client_id,
            client_secret: &self.config.client_secret,
            realm: &self.config.connection,
            scope: "openid profile email offline_access",
        };

        let response = self
            .http
            .post(format!("{}/oauth/token", self.base_url()))
            .json(&grant)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            warn!(%status, "Provider login rejected");
            return Err(Error::UpstreamProvider(format!(
                "login failed with status {status}: {body}"
            )));
        }

        Ok(response.json().await?)
    }

    /// Create a user in the provider's user store.
    ///
    /// The provider answers 409 when the email already exists; that case
    /// resolves to the existing record instead of an error, so repeated
    /// registration attempts converge on the same provider user.
    ///
    /// # Errors
    ///
    /// `UpstreamProvider` on transport failure or any other non-success
    /// status.
    pub async fn create_user(
        &self,
        email: &str,
        password: &str,
        first_name: &str,
        last_name: &str,
    ) -> Result<ProviderUser> {
        let token = self.management_token().await?;
        let request = CreateUserRequest {
            email,
            password,
            connection: &self.config.connection,
            given_name: first_name,
            family_name: last_name,
            name: format!("{first_name} {last_name}"),
        };

        let response = self
            .http
            .post(format!("{}/api/v2/users", self.base_url()))
            .bearer_auth(&token)
            .json(&request)
            .send()
            .await?;

        match response.status() {
            status if status.is_success() => {
                let user: ProviderUser = response.json().await?;
                info!(provider_user = %user.user_id, "Provider user created");
                Ok(user)
            }
            StatusCode::CONFLICT => {
                debug!(email = %email, "Provider user exists, resolving by email");
                self.find_user_by_email(email).await?.ok_or_else(|| {
                    Error::UpstreamProvider(format!(
                        "provider reported a conflict for {email} but the user is not findable"
                    ))
                })
            }
            status => {
                let body = response.text().await.unwrap_or_default();
                Err(Error::UpstreamProvider(format!(
                    "user creation failed with status {status}: {body}"
                )))
            }
        }
    }

    /// Look up a provider user by email.
    ///
    /// # Errors
    ///
    /// `UpstreamProvider` on transport failure or a non-success status.
    pub async fn find_user_by_email(&self, email: &str) -> Result<Option<ProviderUser>> {
        let token = self.management_token().await?;
        let response = self
            .http
            .get(format!("{}/api/v2/users-by-email", self.base_url()))
            .bearer_auth(&token)
            .query(&[("email", email)])
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            return Err(Error::UpstreamProvider(format!(
                "user lookup failed with status {status}"
            )));
        }

        let users: Vec<ProviderUser> = response.json().await?;
        Ok(users.into_iter().next())
    }

    /// Trigger the provider's password-reset email.
    ///
    /// # Errors
    ///
    /// `UpstreamProvider` on transport failure or a non-success status.
    /// A success says nothing about whether the email exists — the provider
    /// answers uniformly to avoid account enumeration.
    pub async fn trigger_password_reset(&self, email: &str) -> Result<()> {
        let response = self
            .http
            .post(format!("{}/dbconnections/change_password", self.base_url()))
            .json(&serde_json::json!({
                "client_id": self.config.client_id,
                "email": email,
                "connection": self.config.connection,
            }))
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            return Err(Error::UpstreamProvider(format!(
                "password reset failed with status {status}"
            )));
        }
        Ok(())
    }

    /// Set a new password on a provider user.
    ///
    /// # Errors
    ///
    /// `UpstreamProvider` on transport failure or a non-success status
    /// (including the provider's password-policy rejections).
    pub async fn update_password(&self, provider_user_id: &str, new_password: &str) -> Result<()> {
        let token = self.management_token().await?;
        let response = self
            .http
            .patch(format!(
                "{}/api/v2/users/{provider_user_id}",
                self.base_url()
            ))
            .bearer_auth(&token)
            .json(&serde_json::json!({
                "password": new_password,
                "connection": self.config.connection,
            }))
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::UpstreamProvider(format!(
                "password update failed with status {status}: {body}"
            )));
        }
        Ok(())
    }

    /// Mark a provider user's email as verified.
    ///
    /// # Errors
    ///
    /// `UpstreamProvider` on transport failure or a non-success status.
    pub async fn mark_email_verified(&self, provider_user_id: &str) -> Result<()> {
        let token = self.management_token().await?;
        let response = self
            .http
            .patch(format!(
                "{}/api/v2/users/{provider_user_id}",
                self.base_url()
            ))
            .bearer_auth(&token)
            .json(&serde_json::json!({ "email_verified": true }))
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            return Err(Error::UpstreamProvider(format!(
                "email verification update failed with status {status}"
            )));
        }
        Ok(())
    }

    /// Current management token, refreshed when missing or near expiry.
    ///
    /// The lock is never held across an await: read and release, then fetch,
    /// then write.
    async fn management_token(&self) -> Result<String> {
        {
            let cached = self.management_token.read();
            if let Some(entry) = cached.as_ref() {
                if entry.expires_at > Instant::now() {
                    return Ok(entry.token.clone());
                }
            }
        }

        let management_audience = format!("{}/api/v2/", self.base_url());
        let grant = ClientCredentialsGrant {
            grant_type: "client_credentials",
            client_id: &self.config.client_id,
            client_secret: &self.config.client_secret,
            audience: &management_audience,
        };
        let response = self
            .http
            .post(format!("{}/oauth/token", self.base_url()))
            .json(&grant)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            return Err(Error::UpstreamProvider(format!(
                "management token request failed with status {status}"
            )));
        }

        let bundle: TokenResponse = response.json().await?;
        let lifetime = Duration::from_secs(bundle.expires_in)
            .saturating_sub(Self::EXPIRY_SLACK);
        debug!(expires_in = bundle.expires_in, "Management token refreshed");

        *self.management_token.write() = Some(CachedToken {
            token: bundle.access_token.clone(),
            expires_at: Instant::now() + lifetime,
        });
        Ok(bundle.access_token)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use axum::http::StatusCode as AxumStatus;
    use axum::routing::{get, post};
    use axum::{Json, Router};

    use super::*;

    // Tests run against a local stand-in for the provider, addressed over
    // plain http through the scheme-aware base_url.
    fn test_client(base: String) -> ProviderClient {
        let config = ProviderConfig {
            domain: base,
            audience: "https://api.example.com".to_string(),
            client_id: "client-id".to_string(),
            client_secret: "client-secret".to_string(),
            connection: "Username-Password-Authentication".to_string(),
        };
        ProviderClient::new(config).unwrap()
    }

    async fn spawn(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn token_stub(hits: Arc<AtomicUsize>) -> Router {
        Router::new().route(
            "/oauth/token",
            post(move || {
                hits.fetch_add(1, Ordering::SeqCst);
                async {
                    Json(serde_json::json!({
                        "access_token": "mgmt-token",
                        "expires_in": 3600,
                        "token_type": "Bearer",
                    }))
                }
            }),
        )
    }

    #[test]
    fn base_url_keeps_explicit_scheme_and_defaults_to_https() {
        let plain = test_client("tenant.example.com".to_string());
        assert_eq!(plain.base_url(), "https://tenant.example.com");

        let local = test_client("http://127.0.0.1:9999/".to_string());
        assert_eq!(local.base_url(), "http://127.0.0.1:9999");
    }

    #[tokio::test]
    async fn management_token_is_cached_between_calls() {
        // GIVEN: a provider stub counting token requests
        let hits = Arc::new(AtomicUsize::new(0));
        let base = spawn(token_stub(hits.clone())).await;
        let client = test_client(base);

        // WHEN: the token is requested twice
        let token_a = client.management_token().await.unwrap();
        let token_b = client.management_token().await.unwrap();

        // THEN: one upstream fetch served both
        assert_eq!(token_a, "mgmt-token");
        assert_eq!(token_b, "mgmt-token");
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn create_user_conflict_resolves_to_existing_user() {
        // GIVEN: a stub whose user creation always answers 409
        let hits = Arc::new(AtomicUsize::new(0));
        let router = token_stub(hits)
            .route(
                "/api/v2/users",
                post(|| async { (AxumStatus::CONFLICT, "user exists") }),
            )
            .route(
                "/api/v2/users-by-email",
                get(|| async {
                    Json(serde_json::json!([{
                        "user_id": "ext|existing",
                        "email": "a@b.com",
                        "email_verified": true,
                    }]))
                }),
            );
        let base = spawn(router).await;
        let client = test_client(base);

        // WHEN: creation collides
        let user = client
            .create_user("a@b.com", "secret-pass", "Alice", "A")
            .await
            .unwrap();

        // THEN: the existing record is returned instead of an error
        assert_eq!(user.user_id, "ext|existing");
        assert!(user.email_verified);
    }

    #[tokio::test]
    async fn login_rejection_maps_to_upstream_error() {
        let router = Router::new().route(
            "/oauth/token",
            post(|| async { (AxumStatus::FORBIDDEN, "wrong credentials") }),
        );
        let base = spawn(router).await;
        let client = test_client(base);

        let err = client.login("a@b.com", "bad-pass").await.unwrap_err();
        assert!(matches!(err, Error::UpstreamProvider(_)));
    }

    #[tokio::test]
    async fn update_password_surfaces_policy_rejections() {
        // GIVEN: a stub rejecting the new password
        let hits = Arc::new(AtomicUsize::new(0));
        let router = token_stub(hits).route(
            "/api/v2/users/{id}",
            axum::routing::patch(|| async {
                (AxumStatus::BAD_REQUEST, "PasswordStrengthError")
            }),
        );
        let base = spawn(router).await;
        let client = test_client(base);

        let err = client
            .update_password("ext|1", "weak")
            .await
            .unwrap_err();
        match err {
            Error::UpstreamProvider(msg) => assert!(msg.contains("PasswordStrengthError")),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn find_user_by_email_returns_none_on_empty_result() {
        let hits = Arc::new(AtomicUsize::new(0));
        let router = token_stub(hits).route(
            "/api/v2/users-by-email",
            get(|| async { Json(serde_json::json!([])) }),
        );
        let base = spawn(router).await;
        let client = test_client(base);

        assert!(client.find_user_by_email("ghost@b.com").await.unwrap().is_none());
    }
}
