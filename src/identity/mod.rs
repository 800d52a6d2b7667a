//! Identity model and store.
//!
//! The [`IdentityStore`] trait is the seam to persistence: the relational
//! store lives in another service layer and implements this trait over its
//! connection pool, while [`InMemoryIdentityStore`] backs tests and
//! single-node deployments. Uniqueness invariants (one identity per email,
//! one per external id) are enforced at this boundary so no caller can
//! bypass them.

pub mod sync;

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicI64, Ordering};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::roles::Role;
use crate::{Error, Result};

pub use sync::{SyncEngine, SyncOutcome};

/// Local persisted record of a platform user.
///
/// Never hard-deleted: deactivation flips `active` instead.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Identity {
    /// Local primary key.
    pub id: i64,
    /// External provider user id (`sub` claim). Unique when present.
    pub external_id: Option<String>,
    /// Email, unique case-insensitively.
    pub email: String,
    /// Given name.
    pub first_name: String,
    /// Family name.
    pub last_name: String,
    /// Soft-delete flag.
    pub active: bool,
    /// Persisted role set.
    pub roles: BTreeSet<Role>,
    /// Last successful login.
    pub last_login: Option<DateTime<Utc>>,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last mutation timestamp.
    pub updated_at: Option<DateTime<Utc>>,
}

impl Identity {
    /// Full display name.
    #[must_use]
    pub fn full_name(&self) -> String {
        format!("{} {}", self.first_name, self.last_name)
    }

    /// Whether this identity holds the given role.
    #[must_use]
    pub fn has_role(&self, role: Role) -> bool {
        self.roles.contains(&role)
    }

    /// Role names as strings, for wire payloads.
    #[must_use]
    pub fn role_names(&self) -> Vec<String> {
        self.roles.iter().map(ToString::to_string).collect()
    }
}

/// Fields for a not-yet-persisted identity.
#[derive(Debug, Clone)]
pub struct NewIdentity {
    /// External provider user id, when known.
    pub external_id: Option<String>,
    /// Email address.
    pub email: String,
    /// Given name.
    pub first_name: String,
    /// Family name.
    pub last_name: String,
    /// Initial role set.
    pub roles: BTreeSet<Role>,
}

/// Persistence seam for identities.
///
/// Implementations must be `Send + Sync`; the store is shared across
/// request tasks. The store provides atomic reads and last-writer-wins
/// updates; the core layers no locking of its own on top.
#[async_trait::async_trait]
pub trait IdentityStore: Send + Sync + 'static {
    /// Look up by local id.
    async fn find_by_id(&self, id: i64) -> Option<Identity>;

    /// Look up by external provider id.
    async fn find_by_external_id(&self, external_id: &str) -> Option<Identity>;

    /// Look up by email (case-insensitive).
    async fn find_by_email(&self, email: &str) -> Option<Identity>;

    /// Persist a new identity, assigning its id.
    ///
    /// # Errors
    ///
    /// `IdentityConflict` if the email or external id is already taken.
    async fn insert(&self, identity: NewIdentity) -> Result<Identity>;

    /// Persist changes to an existing identity.
    ///
    /// # Errors
    ///
    /// `IdentityNotFound` if the id is unknown; `IdentityConflict` if the
    /// update would break an uniqueness invariant.
    async fn update(&self, identity: Identity) -> Result<Identity>;

    /// All active identities.
    async fn list_active(&self) -> Vec<Identity>;
}

/// In-memory identity store backed by a `DashMap`.
#[derive(Default)]
pub struct InMemoryIdentityStore {
    rows: DashMap<i64, Identity>,
    next_id: AtomicI64,
}

impl InMemoryIdentityStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self {
            rows: DashMap::new(),
            next_id: AtomicI64::new(1),
        }
    }

    fn email_taken(&self, email: &str, excluding: Option<i64>) -> bool {
        self.rows.iter().any(|e| {
            e.value().email.eq_ignore_ascii_case(email) && Some(*e.key()) != excluding
        })
    }

    fn external_id_taken(&self, external_id: &str, excluding: Option<i64>) -> bool {
        self.rows.iter().any(|e| {
            e.value().external_id.as_deref() == Some(external_id) && Some(*e.key()) != excluding
        })
    }
}

#[async_trait::async_trait]
impl IdentityStore for InMemoryIdentityStore {
    async fn find_by_id(&self, id: i64) -> Option<Identity> {
        self.rows.get(&id).map(|e| e.value().clone())
    }

    async fn find_by_external_id(&self, external_id: &str) -> Option<Identity> {
        self.rows
            .iter()
            .find(|e| e.value().external_id.as_deref() == Some(external_id))
            .map(|e| e.value().clone())
    }

    async fn find_by_email(&self, email: &str) -> Option<Identity> {
        self.rows
            .iter()
            .find(|e| e.value().email.eq_ignore_ascii_case(email))
            .map(|e| e.value().clone())
    }

    async fn insert(&self, identity: NewIdentity) -> Result<Identity> {
        if self.email_taken(&identity.email, None) {
            return Err(Error::IdentityConflict(format!(
                "email already registered: {}",
                identity.email
            )));
        }
        if let Some(ext) = &identity.external_id {
            if self.external_id_taken(ext, None) {
                return Err(Error::IdentityConflict(format!(
                    "external id already linked: {ext}"
                )));
            }
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let row = Identity {
            id,
            external_id: identity.external_id,
            email: identity.email.trim().to_lowercase(),
            first_name: identity.first_name,
            last_name: identity.last_name,
            active: true,
            roles: identity.roles,
            last_login: None,
            created_at: Utc::now(),
            updated_at: None,
        };
        self.rows.insert(id, row.clone());
        Ok(row)
    }

    async fn update(&self, mut identity: Identity) -> Result<Identity> {
        if !self.rows.contains_key(&identity.id) {
            return Err(Error::IdentityNotFound(format!("id {}", identity.id)));
        }
        if self.email_taken(&identity.email, Some(identity.id)) {
            return Err(Error::IdentityConflict(format!(
                "email already registered: {}",
                identity.email
            )));
        }
        if let Some(ext) = &identity.external_id {
            if self.external_id_taken(ext, Some(identity.id)) {
                return Err(Error::IdentityConflict(format!(
                    "external id already linked: {ext}"
                )));
            }
        }

        identity.updated_at = Some(Utc::now());
        self.rows.insert(identity.id, identity.clone());
        Ok(identity)
    }

    async fn list_active(&self) -> Vec<Identity> {
        self.rows
            .iter()
            .filter(|e| e.value().active)
            .map(|e| e.value().clone())
            .collect()
    }
}
