//! Reconciliation between provider-asserted identity claims and the local
//! store.
//!
//! Sync runs on every successful external validation, so the common case —
//! nothing changed — must stay write-free. The engine compares the asserted
//! fields against the stored row and persists only on drift; role
//! assignments are deliberately left alone, the provider does not own them.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info};

use super::{Identity, IdentityStore, NewIdentity};
use crate::events::{self, AuthEvent, EventPublisher};
use crate::roles::Role;
use crate::{Error, Result};

/// What a sync pass did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    /// No local identity existed; one was created with the default role.
    Created,
    /// The stored profile drifted from the asserted claims and was rewritten.
    Updated,
    /// Claims matched the stored row; nothing was written.
    Unchanged,
}

/// Keeps local identities consistent with the external provider.
pub struct SyncEngine {
    store: Arc<dyn IdentityStore>,
    events: Arc<dyn EventPublisher>,
    default_role: Role,
}

impl SyncEngine {
    /// Create an engine over the given store and event sink.
    pub fn new(
        store: Arc<dyn IdentityStore>,
        events: Arc<dyn EventPublisher>,
        default_role: Role,
    ) -> Self {
        Self {
            store,
            events,
            default_role,
        }
    }

    /// Reconcile one external identity with the local store.
    ///
    /// Resolution order is external id first, then email — a user who
    /// registered locally before their first provider login gets linked
    /// rather than duplicated. The email fallback only links identities
    /// with no external id; an identity already linked to a different
    /// subject is never re-linked. Idempotent: a second call with the same
    /// claims is `Unchanged`.
    ///
    /// # Errors
    ///
    /// `IdentityConflict` when the email belongs to an identity linked to
    /// another external id. Propagates store failures; a sync never invents
    /// identity state on error.
    pub async fn sync_external_identity(
        &self,
        external_id: &str,
        email: &str,
        first_name: &str,
        last_name: &str,
    ) -> Result<(Identity, SyncOutcome)> {
        let existing = match self.store.find_by_external_id(external_id).await {
            Some(row) => Some(row),
            None => match self.store.find_by_email(email).await {
                Some(row) => {
                    if let Some(current) = row.external_id.as_deref() {
                        return Err(Error::IdentityConflict(format!(
                            "email {email} belongs to user {} linked to {current}",
                            row.id
                        )));
                    }
                    Some(row)
                }
                None => None,
            },
        };

        let Some(mut identity) = existing else {
            let roles: BTreeSet<Role> = [self.default_role].into_iter().collect();
            let created = self
                .store
                .insert(NewIdentity {
                    external_id: Some(external_id.to_string()),
                    email: email.to_string(),
                    first_name: first_name.to_string(),
                    last_name: last_name.to_string(),
                    roles,
                })
                .await?;
            info!(user_id = created.id, email = %created.email, "Identity created from provider claims");
            events::emit(
                &self.events,
                AuthEvent::user_created(created.id, &created.email, &created.role_names()),
            );
            return Ok((created, SyncOutcome::Created));
        };

        let drifted = identity.external_id.as_deref() != Some(external_id)
            || !identity.email.eq_ignore_ascii_case(email)
            || identity.first_name != first_name
            || identity.last_name != last_name;

        if !drifted {
            debug!(user_id = identity.id, "Identity already in sync");
            return Ok((identity, SyncOutcome::Unchanged));
        }

        identity.external_id = Some(external_id.to_string());
        identity.email = email.to_string();
        identity.first_name = first_name.to_string();
        identity.last_name = last_name.to_string();
        let updated = self.store.update(identity).await?;
        info!(user_id = updated.id, "Identity updated from provider claims");
        events::emit(
            &self.events,
            AuthEvent::user_updated(updated.id, &updated.email),
        );
        Ok((updated, SyncOutcome::Updated))
    }

    /// Link an existing local identity to an external id.
    ///
    /// # Errors
    ///
    /// `IdentityNotFound` for an unknown local id; `IdentityConflict` when
    /// the identity is already linked to a different external id.
    pub async fn link_account(&self, user_id: i64, external_id: &str) -> Result<Identity> {
        let mut identity = self
            .store
            .find_by_id(user_id)
            .await
            .ok_or_else(|| Error::IdentityNotFound(format!("id {user_id}")))?;

        match identity.external_id.as_deref() {
            Some(current) if current == external_id => Ok(identity),
            Some(current) => Err(Error::IdentityConflict(format!(
                "user {user_id} already linked to {current}"
            ))),
            None => {
                identity.external_id = Some(external_id.to_string());
                self.store.update(identity).await
            }
        }
    }

    /// Record a successful login.
    ///
    /// # Errors
    ///
    /// `IdentityNotFound` for an unknown id.
    pub async fn record_login(&self, user_id: i64) -> Result<Identity> {
        let mut identity = self
            .store
            .find_by_id(user_id)
            .await
            .ok_or_else(|| Error::IdentityNotFound(format!("id {user_id}")))?;
        identity.last_login = Some(Utc::now());
        let updated = self.store.update(identity).await?;
        events::emit(
            &self.events,
            AuthEvent::user_login(updated.id, &updated.email),
        );
        Ok(updated)
    }

    /// Soft-delete an identity.
    ///
    /// # Errors
    ///
    /// `IdentityNotFound` for an unknown id.
    pub async fn deactivate(&self, user_id: i64) -> Result<Identity> {
        let mut identity = self
            .store
            .find_by_id(user_id)
            .await
            .ok_or_else(|| Error::IdentityNotFound(format!("id {user_id}")))?;
        identity.active = false;
        let updated = self.store.update(identity).await?;
        events::emit(&self.events, AuthEvent::user_deactivated(updated.id));
        Ok(updated)
    }
}
