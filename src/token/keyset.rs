//! Key set cache — the provider's rotating public signing keys.
//!
//! Key material is cached for hours, but outbound JWKS fetches are bounded
//! by a per-minute rate limit so a key-rotation storm (or an attacker
//! spraying unknown `kid`s) cannot hammer the provider. Concurrent requests
//! for an unresolved key id coalesce into a single outbound fetch, and a
//! fetch that exceeds the bounded timeout degrades to
//! [`Error::KeyResolutionFailed`] instead of stalling the request.
//!
//! The cache is an explicitly constructed dependency of the external
//! validator, never a hidden global; [`KeySetCache::with_fixed_keys`] gives
//! tests a deterministic key set with no network involved.

use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use governor::{
    Quota, RateLimiter,
    clock::DefaultClock,
    state::{InMemoryState, NotKeyed},
};
use jsonwebtoken::{
    DecodingKey,
    jwk::{AlgorithmParameters, JwkSet},
};
use tracing::{debug, warn};

use crate::config::KeySetConfig;
use crate::{Error, Result};

type FetchLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Tuning knobs for the key set cache.
#[derive(Debug, Clone)]
pub struct KeySetOptions {
    /// How long fetched key material stays fresh.
    pub ttl: Duration,
    /// Maximum outbound JWKS fetches per minute.
    pub max_fetches_per_minute: u32,
    /// Bounded timeout for a single JWKS fetch.
    pub fetch_timeout: Duration,
}

impl Default for KeySetOptions {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(36_000),
            max_fetches_per_minute: 10,
            fetch_timeout: Duration::from_secs(5),
        }
    }
}

impl From<&KeySetConfig> for KeySetOptions {
    fn from(config: &KeySetConfig) -> Self {
        Self {
            ttl: config.ttl(),
            max_fetches_per_minute: config.max_fetches_per_minute,
            fetch_timeout: config.fetch_timeout(),
        }
    }
}

/// One cached public key.
struct CachedKey {
    key: Arc<DecodingKey>,
    fetched_at: Instant,
}

/// Cache of the provider's public signing keys, keyed by key id.
pub struct KeySetCache {
    /// JWKS endpoint. `None` for fixed-key instances (tests).
    jwks_uri: Option<String>,
    http: reqwest::Client,
    keys: DashMap<String, CachedKey>,
    /// Serializes outbound fetches so concurrent misses coalesce.
    fetch_lock: tokio::sync::Mutex<()>,
    limiter: FetchLimiter,
    opts: KeySetOptions,
}

impl KeySetCache {
    /// Create a cache backed by the given JWKS endpoint.
    #[must_use]
    pub fn new(jwks_uri: impl Into<String>, opts: KeySetOptions) -> Self {
        let per_minute = NonZeroU32::new(opts.max_fetches_per_minute.max(1))
            .unwrap_or(NonZeroU32::MIN);
        Self {
            jwks_uri: Some(jwks_uri.into()),
            http: reqwest::Client::builder()
                .timeout(opts.fetch_timeout)
                .build()
                .unwrap_or_default(),
            keys: DashMap::new(),
            fetch_lock: tokio::sync::Mutex::new(()),
            limiter: RateLimiter::direct(Quota::per_minute(per_minute)),
            opts,
        }
    }

    /// Create a cache pre-loaded with a fixed key set and no outbound fetch
    /// capability. Unknown key ids fail with `KeyResolutionFailed`.
    #[must_use]
    pub fn with_fixed_keys(keys: Vec<(String, DecodingKey)>) -> Self {
        let cache = Self {
            jwks_uri: None,
            http: reqwest::Client::new(),
            keys: DashMap::new(),
            fetch_lock: tokio::sync::Mutex::new(()),
            limiter: RateLimiter::direct(Quota::per_minute(NonZeroU32::MIN)),
            opts: KeySetOptions::default(),
        };
        let now = Instant::now();
        for (kid, key) in keys {
            cache.keys.insert(
                kid,
                CachedKey {
                    key: Arc::new(key),
                    fetched_at: now,
                },
            );
        }
        cache
    }

    /// Resolve a public key by key id.
    ///
    /// Lock-free cache hit on the fast path. On a miss, fetches the JWKS
    /// under the fetch lock (coalescing concurrent misses), honoring the
    /// rate limit and the bounded timeout. A stale cached key is served
    /// rather than failing when the provider cannot be reached.
    ///
    /// # Errors
    ///
    /// `KeyResolutionFailed` when the key id cannot be resolved for any
    /// reason — unknown id, rate-limited with no cached key, fetch timeout,
    /// or transport failure.
    pub async fn resolve(&self, kid: &str) -> Result<Arc<DecodingKey>> {
        if let Some(key) = self.cached(kid, false) {
            return Ok(key);
        }

        let Some(uri) = self.jwks_uri.clone() else {
            return Err(Error::KeyResolutionFailed(format!(
                "key id '{kid}' not in fixed key set"
            )));
        };

        let _guard = self.fetch_lock.lock().await;

        // Another task may have refreshed the key set while we waited.
        if let Some(key) = self.cached(kid, false) {
            return Ok(key);
        }

        if self.limiter.check().is_err() {
            return self.cached(kid, true).ok_or_else(|| {
                Error::KeyResolutionFailed(
                    "JWKS fetch rate limit exceeded and no cached key".to_string(),
                )
            });
        }

        match self.fetch(&uri).await {
            Ok(jwks) => self.store(&jwks),
            Err(e) => {
                warn!(kid = %kid, error = %e, "JWKS refresh failed");
                // Degrade to the stale key if one exists.
                return self.cached(kid, true).ok_or(e);
            }
        }

        self.cached(kid, false).ok_or_else(|| {
            Error::KeyResolutionFailed(format!("key id '{kid}' not present in provider key set"))
        })
    }

    /// Cached key lookup. `allow_stale` ignores the TTL.
    fn cached(&self, kid: &str, allow_stale: bool) -> Option<Arc<DecodingKey>> {
        let entry = self.keys.get(kid)?;
        if allow_stale || entry.fetched_at.elapsed() < self.opts.ttl {
            Some(Arc::clone(&entry.key))
        } else {
            None
        }
    }

    /// Fetch the JWKS within the bounded timeout.
    async fn fetch(&self, uri: &str) -> Result<JwkSet> {
        debug!(uri = %uri, "Fetching provider key set");
        let request = async {
            self.http
                .get(uri)
                .send()
                .await?
                .error_for_status()?
                .json::<JwkSet>()
                .await
        };

        match tokio::time::timeout(self.opts.fetch_timeout, request).await {
            Err(_) => Err(Error::KeyResolutionFailed(
                "JWKS fetch timed out".to_string(),
            )),
            Ok(Err(e)) => Err(Error::KeyResolutionFailed(format!("JWKS fetch failed: {e}"))),
            Ok(Ok(jwks)) => Ok(jwks),
        }
    }

    /// Re-populate the cache from a fetched key set. Only RSA keys are
    /// kept; the provider signs with RS256.
    fn store(&self, jwks: &JwkSet) {
        let now = Instant::now();
        for jwk in &jwks.keys {
            let Some(kid) = jwk.common.key_id.as_deref() else {
                continue;
            };
            let AlgorithmParameters::RSA(rsa) = &jwk.algorithm else {
                continue;
            };
            match DecodingKey::from_rsa_components(&rsa.n, &rsa.e) {
                Ok(key) => {
                    self.keys.insert(
                        kid.to_string(),
                        CachedKey {
                            key: Arc::new(key),
                            fetched_at: now,
                        },
                    );
                }
                Err(e) => warn!(kid = %kid, error = %e, "Skipping unparseable JWK"),
            }
        }
        debug!(keys = self.keys.len(), "Key set cache refreshed");
    }
}
