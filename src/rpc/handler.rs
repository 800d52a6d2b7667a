//! HTTP surface of the validation bridge.
//!
//! Thin handlers: deserialize, delegate to [`ValidationBridge`], serialize.
//! Every endpoint answers 200 with a complete body — the bridge contract
//! puts failure information inside the response, not on the status line.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;

use super::{
    HasRoleResponse, HealthCheckResponse, UserResponse, UserRolesResponse, ValidateTokenResponse,
    ValidationBridge,
};

/// Body of a validation request.
#[derive(Debug, Deserialize)]
pub struct ValidateTokenRequest {
    /// The raw provider token.
    pub token: String,
    /// Calling service name, for audit logs.
    #[serde(default)]
    pub caller: String,
}

/// Body of a health check. The caller name is optional; the body itself
/// may be omitted entirely.
#[derive(Debug, Default, Deserialize)]
pub struct HealthCheckRequest {
    /// Calling service name, for audit logs.
    #[serde(default)]
    pub caller: String,
}

fn caller_or_unknown(caller: &str) -> &str {
    if caller.is_empty() { "unknown" } else { caller }
}

/// Routes for the bridge, to be mounted behind the internal guard.
pub fn bridge_routes(bridge: Arc<ValidationBridge>) -> Router {
    Router::new()
        .route("/rpc/validate-token", post(validate_token))
        .route("/rpc/users/{id}", get(get_user_by_id))
        .route("/rpc/users/{id}/has-role/{role}", get(has_role))
        .route("/rpc/users/{id}/roles", get(get_user_roles))
        .route("/rpc/health", post(health_check))
        .with_state(bridge)
}

async fn validate_token(
    State(bridge): State<Arc<ValidationBridge>>,
    Json(request): Json<ValidateTokenRequest>,
) -> Json<ValidateTokenResponse> {
    let caller = caller_or_unknown(&request.caller);
    Json(bridge.validate_token(&request.token, caller).await)
}

async fn get_user_by_id(
    State(bridge): State<Arc<ValidationBridge>>,
    Path(id): Path<String>,
) -> Json<UserResponse> {
    Json(bridge.get_user_by_id(&id).await)
}

async fn has_role(
    State(bridge): State<Arc<ValidationBridge>>,
    Path((id, role)): Path<(String, String)>,
) -> Json<HasRoleResponse> {
    Json(bridge.has_role(&id, &role).await)
}

async fn get_user_roles(
    State(bridge): State<Arc<ValidationBridge>>,
    Path(id): Path<String>,
) -> Json<UserRolesResponse> {
    Json(bridge.get_user_roles(&id).await)
}

async fn health_check(
    State(bridge): State<Arc<ValidationBridge>>,
    body: Option<Json<HealthCheckRequest>>,
) -> Json<HealthCheckResponse> {
    let request = body.map(|Json(r)| r).unwrap_or_default();
    Json(bridge.health_check(caller_or_unknown(&request.caller)).await)
}
