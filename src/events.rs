//! Lifecycle events emitted by the identity sync engine.
//!
//! Publication is fire-and-forget: a failed or slow publisher must never
//! delay or fail the request that triggered the event. The default
//! [`TracingPublisher`] writes structured log records; a broker-backed
//! publisher plugs in behind the same trait.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::info;
use uuid::Uuid;

/// A single identity lifecycle event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthEvent {
    /// Unique event id.
    pub event_id: Uuid,
    /// Event kind, e.g. `user.created`.
    pub event_type: String,
    /// Originating service name.
    pub source: String,
    /// Emission time.
    pub timestamp: DateTime<Utc>,
    /// Event-specific payload.
    pub data: serde_json::Value,
}

impl AuthEvent {
    fn new(event_type: &str, data: serde_json::Value) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            event_type: event_type.to_string(),
            source: "auth-gateway".to_string(),
            timestamp: Utc::now(),
            data,
        }
    }

    /// A new identity was created during sync.
    #[must_use]
    pub fn user_created(user_id: i64, email: &str, roles: &[String]) -> Self {
        Self::new(
            "user.created",
            json!({ "user_id": user_id, "email": email, "roles": roles }),
        )
    }

    /// An existing identity drifted and was rewritten.
    #[must_use]
    pub fn user_updated(user_id: i64, email: &str) -> Self {
        Self::new("user.updated", json!({ "user_id": user_id, "email": email }))
    }

    /// An identity was deactivated.
    #[must_use]
    pub fn user_deactivated(user_id: i64) -> Self {
        Self::new("user.deactivated", json!({ "user_id": user_id }))
    }

    /// A successful login was recorded.
    #[must_use]
    pub fn user_login(user_id: i64, email: &str) -> Self {
        Self::new("user.login", json!({ "user_id": user_id, "email": email }))
    }
}

/// Sink for lifecycle events.
#[async_trait::async_trait]
pub trait EventPublisher: Send + Sync + 'static {
    /// Deliver one event. Errors are the implementation's to report; the
    /// caller has already moved on.
    async fn publish(&self, event: AuthEvent);
}

/// Publisher that records events as structured log lines.
#[derive(Debug, Default)]
pub struct TracingPublisher;

#[async_trait::async_trait]
impl EventPublisher for TracingPublisher {
    async fn publish(&self, event: AuthEvent) {
        info!(
            event_id = %event.event_id,
            event_type = %event.event_type,
            data = %event.data,
            "Auth event"
        );
    }
}

/// Publish without awaiting delivery.
pub fn emit(publisher: &Arc<dyn EventPublisher>, event: AuthEvent) {
    let publisher = Arc::clone(publisher);
    tokio::spawn(async move {
        publisher.publish(event).await;
    });
}
