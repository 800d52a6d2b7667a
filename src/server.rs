//! HTTP server assembly.
//!
//! Wires the validators, filter, sync engine, provider client and bridge
//! into one router. Public authentication endpoints live under `/auth`;
//! the cross-service bridge under `/rpc` sits behind the internal guard
//! and is only reachable with the shared `X-Internal-Token` header.

use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::{HeaderMap, StatusCode, header::HeaderName};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::config::Config;
use crate::events::{EventPublisher, TracingPublisher};
use crate::filter::{AuthContext, AuthFilter};
use crate::identity::{Identity, IdentityStore, InMemoryIdentityStore, SyncEngine};
use crate::provider::ProviderClient;
use crate::rpc::{ValidationBridge, bridge_routes};
use crate::token::{
    DecodedToken, EnrichedTokenIssuer, EnrichedTokenValidator, ExternalTokenValidator,
    KeySetCache, KeySetOptions,
};
use crate::{Error, Result};

/// Header carrying the internal shared secret.
pub const INTERNAL_TOKEN_HEADER: HeaderName = HeaderName::from_static("x-internal-token");

/// Shared state for the `/auth` handlers.
pub struct AuthApi {
    provider: ProviderClient,
    external: Arc<ExternalTokenValidator>,
    issuer: EnrichedTokenIssuer,
    sync: SyncEngine,
    store: Arc<dyn IdentityStore>,
}

/// Login request body.
#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    /// Account email.
    pub email: String,
    /// Account password.
    pub password: String,
}

/// Registration request body.
#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    /// Account email.
    pub email: String,
    /// Initial password.
    pub password: String,
    /// Given name.
    pub first_name: String,
    /// Family name.
    pub last_name: String,
    /// Requested role; the configured default applies when absent.
    #[serde(default)]
    pub role: Option<crate::roles::Role>,
}

/// Password-reset request body.
#[derive(Debug, Deserialize)]
pub struct PasswordResetRequest {
    /// Account email. The response is uniform whether or not it exists.
    pub email: String,
}

/// Profile slice returned to clients.
#[derive(Debug, Serialize)]
pub struct UserProfile {
    /// Local user id.
    pub user_id: i64,
    /// Email.
    pub email: String,
    /// Full display name.
    pub full_name: String,
    /// Role names.
    pub roles: Vec<String>,
    /// Whether the account is active.
    pub active: bool,
}

impl From<&Identity> for UserProfile {
    fn from(identity: &Identity) -> Self {
        Self {
            user_id: identity.id,
            email: identity.email.clone(),
            full_name: identity.full_name(),
            roles: identity.role_names(),
            active: identity.active,
        }
    }
}

/// Successful login response.
#[derive(Debug, Serialize)]
pub struct LoginResponse {
    /// Enriched token for platform services.
    pub access_token: String,
    /// The provider's original access token, for clients that talk to the
    /// provider directly.
    pub external_token: String,
    /// Refresh token, when the grant produced one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    /// Enriched token expiry (Unix epoch seconds).
    pub expires_at: i64,
    /// The authenticated user.
    pub user: UserProfile,
}

/// Build the full application router.
pub fn build_router(
    config: &Config,
    store: Arc<dyn IdentityStore>,
    events: Arc<dyn EventPublisher>,
) -> Result<Router> {
    let issuer_url = config.provider.issuer();
    let audience = config.provider.audience.clone();

    let keyset = Arc::new(KeySetCache::new(
        config.provider.jwks_uri(),
        KeySetOptions::from(&config.keyset),
    ));
    let external = Arc::new(ExternalTokenValidator::new(
        keyset,
        issuer_url.clone(),
        audience.clone(),
        config.jwt.roles_namespace.clone(),
    ));
    let enriched_validator =
        EnrichedTokenValidator::new(&config.jwt.secret, issuer_url.clone(), audience.clone());
    let enriched_issuer = EnrichedTokenIssuer::new(
        &config.jwt.secret,
        issuer_url,
        audience,
        config.jwt.expiration_hours,
    );

    let sync = SyncEngine::new(store.clone(), events, config.sync.default_role);
    let provider = ProviderClient::new(config.provider.clone())?;

    let api = Arc::new(AuthApi {
        provider,
        external: external.clone(),
        issuer: enriched_issuer,
        sync,
        store: store.clone(),
    });

    let bridge = Arc::new(ValidationBridge::new(external.clone(), store.clone()));
    let internal = bridge_routes(bridge).layer(middleware::from_fn_with_state(
        Arc::new(config.internal.shared_token.clone()),
        internal_guard,
    ));

    let filter = Arc::new(AuthFilter::new(enriched_validator, external, store));

    let router = Router::new()
        .route("/health", get(health))
        .route("/auth/login", post(login))
        .route("/auth/register", post(register))
        .route("/auth/password-reset", post(password_reset))
        .route("/auth/me", get(me))
        .with_state(api)
        .merge(internal)
        .layer(middleware::from_fn_with_state(
            filter,
            crate::filter::authenticate,
        ))
        .layer(TraceLayer::new_for_http());

    Ok(router)
}

/// Run the server until shutdown.
///
/// # Errors
///
/// Configuration, bind, or serve failures.
pub async fn serve(config: Config) -> Result<()> {
    let store: Arc<dyn IdentityStore> = Arc::new(InMemoryIdentityStore::new());
    let events: Arc<dyn EventPublisher> = Arc::new(TracingPublisher);
    let router = build_router(&config, store, events)?;

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|e| Error::Config(format!("failed to bind {addr}: {e}")))?;
    info!(%addr, "auth-gateway listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| Error::Internal(format!("server error: {e}")))?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "Failed to listen for shutdown signal");
        return;
    }
    info!("Shutdown signal received");
}

/// Guard for the internal `/rpc` surface.
///
/// 503 when no shared token is configured, 401 when the header is missing
/// or does not match. Comparison is constant-time.
async fn internal_guard(
    State(expected): State<Arc<Option<String>>>,
    headers: HeaderMap,
    request: Request,
    next: Next,
) -> Response {
    let Some(expected) = expected.as_ref() else {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({ "error": "internal surface not configured" })),
        )
            .into_response();
    };

    let provided = headers
        .get(&INTERNAL_TOKEN_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();

    let matches: bool = provided.as_bytes().ct_eq(expected.as_bytes()).into();
    if !matches {
        warn!("Internal request rejected: bad or missing token");
        return (
            StatusCode::UNAUTHORIZED,
            Json(serde_json::json!({ "error": "invalid internal token" })),
        )
            .into_response();
    }

    next.run(request).await
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "service": "auth-gateway",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn login(
    State(api): State<Arc<AuthApi>>,
    Json(request): Json<LoginRequest>,
) -> Result<Json<LoginResponse>> {
    let tokens = api.provider.login(&request.email, &request.password).await?;
    let decoded = api.external.validate(&tokens.access_token).await?;

    let (first_name, last_name) = split_name(&decoded, &request.email);
    let email = decoded.email.clone().unwrap_or_else(|| request.email.clone());
    let (identity, _) = api
        .sync
        .sync_external_identity(&decoded.subject, &email, &first_name, &last_name)
        .await?;
    let identity = api.sync.record_login(identity.id).await?;

    let access_token = api.issuer.issue(&decoded, &identity)?;
    info!(user_id = identity.id, "Login succeeded");

    Ok(Json(LoginResponse {
        access_token,
        external_token: tokens.access_token,
        refresh_token: tokens.refresh_token,
        expires_at: decoded.expires_at,
        user: UserProfile::from(&identity),
    }))
}

async fn register(
    State(api): State<Arc<AuthApi>>,
    Json(request): Json<RegisterRequest>,
) -> Result<(StatusCode, Json<UserProfile>)> {
    let provider_user = api
        .provider
        .create_user(
            &request.email,
            &request.password,
            &request.first_name,
            &request.last_name,
        )
        .await?;

    // Registrations through the gateway are operator-initiated; the email
    // is taken as verified.
    if let Err(err) = api.provider.mark_email_verified(&provider_user.user_id).await {
        warn!(error = %err, "Could not flag provider email as verified");
    }

    let (mut identity, outcome) = api
        .sync
        .sync_external_identity(
            &provider_user.user_id,
            &provider_user.email,
            &request.first_name,
            &request.last_name,
        )
        .await?;

    // A requested role replaces the default only on a fresh identity.
    if let Some(role) = request.role {
        if outcome == crate::identity::SyncOutcome::Created && !identity.has_role(role) {
            identity.roles = [role].into_iter().collect();
            identity = api.store.update(identity).await?;
        }
    }

    info!(user_id = identity.id, "Registration completed");
    Ok((StatusCode::CREATED, Json(UserProfile::from(&identity))))
}

async fn password_reset(
    State(api): State<Arc<AuthApi>>,
    Json(request): Json<PasswordResetRequest>,
) -> Result<Json<serde_json::Value>> {
    api.provider.trigger_password_reset(&request.email).await?;
    // Uniform body regardless of whether the account exists
    Ok(Json(serde_json::json!({
        "message": "If the account exists, a password reset email has been sent",
    })))
}

/// Example of downstream authorization: requires an authenticated context.
async fn me(
    State(api): State<Arc<AuthApi>>,
    Extension(context): Extension<AuthContext>,
) -> Response {
    let Some(principal) = context.principal() else {
        return (
            StatusCode::UNAUTHORIZED,
            Json(serde_json::json!({ "error": "authentication required" })),
        )
            .into_response();
    };

    let identity = match principal.user_id {
        Some(id) => api.store.find_by_id(id).await,
        None => api.store.find_by_external_id(&principal.external_id).await,
    };

    match identity {
        Some(row) => Json(serde_json::json!({
            "user": UserProfile::from(&row),
            "authorities": principal.authorities,
        }))
        .into_response(),
        None => Json(serde_json::json!({
            "user": serde_json::Value::Null,
            "external_id": principal.external_id,
            "authorities": principal.authorities,
        }))
        .into_response(),
    }
}

/// Derive first/last name from the token's display name, falling back to
/// the email local part.
fn split_name(decoded: &DecodedToken, email: &str) -> (String, String) {
    if let Some(name) = decoded.display_name() {
        let mut parts = name.splitn(2, ' ');
        let first = parts.next().unwrap_or_default().to_string();
        let last = parts.next().unwrap_or_default().to_string();
        if !first.is_empty() {
            return (first, last);
        }
    }
    let local = email.split('@').next().unwrap_or_default().to_string();
    (local, String::new())
}
