//! Configuration management.
//!
//! Loaded from an optional YAML file merged with `AUTH_GATEWAY_`-prefixed
//! environment variables (`__` as section separator), e.g.
//! `AUTH_GATEWAY_PROVIDER__DOMAIN=tenant.eu.auth0.com`.

use std::path::Path;
use std::time::Duration;

use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use serde::{Deserialize, Serialize};

use crate::roles::Role;
use crate::{Error, Result};

/// Main configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// HTTP server configuration.
    pub server: ServerConfig,
    /// External identity provider configuration.
    pub provider: ProviderConfig,
    /// Enriched (internally-signed) token configuration.
    pub jwt: JwtConfig,
    /// Signing key set cache tuning.
    pub keyset: KeySetConfig,
    /// Internal service-to-service surface configuration.
    pub internal: InternalConfig,
    /// Identity sync configuration.
    pub sync: SyncConfig,
}

/// HTTP server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Bind host.
    pub host: String,
    /// Bind port.
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8081,
        }
    }
}

/// External identity provider (OAuth2/OIDC) configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ProviderConfig {
    /// Provider tenant domain, e.g. `tenant.eu.auth0.com`.
    pub domain: String,
    /// Expected `aud` claim for both token families.
    pub audience: String,
    /// Client id for the client-credentials grant (Management API).
    pub client_id: String,
    /// Client secret for the client-credentials grant.
    pub client_secret: String,
    /// User-database connection name used when creating users.
    pub connection: String,
}

impl ProviderConfig {
    /// Tenant base URL. A bare domain gets the https scheme; an explicit
    /// scheme is kept so local emulators can be addressed over plain http.
    #[must_use]
    pub fn base_url(&self) -> String {
        if self.domain.starts_with("http://") || self.domain.starts_with("https://") {
            self.domain.trim_end_matches('/').to_string()
        } else {
            format!("https://{}", self.domain)
        }
    }

    /// Expected token issuer: the tenant base URL with a trailing slash.
    #[must_use]
    pub fn issuer(&self) -> String {
        format!("{}/", self.base_url())
    }

    /// JWKS discovery URI for the tenant.
    #[must_use]
    pub fn jwks_uri(&self) -> String {
        format!("{}/.well-known/jwks.json", self.base_url())
    }
}

/// Enriched token configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JwtConfig {
    /// HS256 shared secret. Must be replaced in any real deployment.
    pub secret: String,
    /// Default enriched-token lifetime in hours, used when the source
    /// external token carries no expiry.
    pub expiration_hours: u64,
    /// Namespaced custom claim checked first when extracting roles from
    /// external tokens.
    pub roles_namespace: String,
}

impl Default for JwtConfig {
    fn default() -> Self {
        Self {
            secret: "default-secret-key-change-in-production-minimum-256-bits".to_string(),
            expiration_hours: 24,
            roles_namespace: "https://auth-gateway.dev/roles".to_string(),
        }
    }
}

/// Key set cache tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KeySetConfig {
    /// How long fetched key material stays fresh, in seconds.
    pub ttl_secs: u64,
    /// Maximum outbound JWKS fetches per minute.
    pub max_fetches_per_minute: u32,
    /// Bounded timeout for a single JWKS fetch, in seconds.
    pub fetch_timeout_secs: u64,
}

impl Default for KeySetConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 36_000, // 10 hours
            max_fetches_per_minute: 10,
            fetch_timeout_secs: 5,
        }
    }
}

impl KeySetConfig {
    /// Key material TTL as a [`Duration`].
    #[must_use]
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    /// Fetch timeout as a [`Duration`].
    #[must_use]
    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }
}

/// Internal service-to-service surface configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct InternalConfig {
    /// Static shared secret expected in the `X-Internal-Token` header.
    /// When unset, the internal surfaces answer 503.
    pub shared_token: Option<String>,
}

/// Identity sync configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Role granted to identities created on first external authentication.
    pub default_role: Role,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            default_role: Role::Student,
        }
    }
}

impl Config {
    /// Load configuration from file and environment.
    ///
    /// # Errors
    ///
    /// Returns an error if the config file does not exist, cannot be parsed,
    /// or fails validation.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        // Pick up a local .env before the environment is read.
        dotenvy::dotenv().ok();

        let mut figment = Figment::new();

        if let Some(p) = path {
            if !p.exists() {
                return Err(Error::Config(format!(
                    "Config file not found: {}",
                    p.display()
                )));
            }
            figment = figment.merge(Yaml::file(p));
        }

        figment = figment.merge(Env::prefixed("AUTH_GATEWAY_").split("__"));

        let config: Self = figment
            .extract()
            .map_err(|e| Error::Config(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Validate required fields and warn on weak settings.
    fn validate(&self) -> Result<()> {
        if self.provider.domain.is_empty() {
            return Err(Error::Config("provider.domain is required".to_string()));
        }
        if self.provider.audience.is_empty() {
            return Err(Error::Config("provider.audience is required".to_string()));
        }
        if self.jwt.secret.len() < 32 {
            tracing::warn!("jwt.secret is shorter than 32 bytes; use a stronger secret");
        }
        if self.jwt.secret == JwtConfig::default().secret {
            tracing::warn!("jwt.secret is the built-in default; replace it in production");
        }
        Ok(())
    }
}
