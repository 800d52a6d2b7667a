//! # auth-gateway
//!
//! Identity-verification core for a service platform: validates tokens from
//! an external OIDC provider, enriches them with database-backed roles and
//! permissions, keeps local identities in sync with the provider, and
//! exposes a validation bridge for sibling services.
//!
//! Two token families flow through the gateway:
//!
//! - **External** tokens, RS256-signed by the provider and verified against
//!   its rotating key set.
//! - **Enriched** tokens, HS256-signed by this service, embedding the
//!   identity's current roles and the permissions they resolve to.
//!
//! The [`filter`] authenticates requests against both families without ever
//! rejecting a request itself; the [`rpc`] bridge lets other services
//! delegate validation without sharing signing secrets.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod cli;
pub mod config;
pub mod error;
pub mod events;
pub mod filter;
pub mod identity;
pub mod permissions;
pub mod provider;
pub mod roles;
pub mod rpc;
pub mod server;
pub mod token;

pub use error::{Error, Result};

/// Initialize the tracing subscriber.
///
/// `RUST_LOG` overrides the level given here. The JSON format is for log
/// aggregation; the default compact format is for humans.
pub fn setup_tracing(level: &str, json: bool) {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("auth_gateway={level},tower_http=warn")));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true);

    if json {
        builder.json().init();
    } else {
        builder.compact().init();
    }
}
