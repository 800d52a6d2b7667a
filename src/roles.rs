//! Role model — the fixed set of platform roles.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// The fixed role set persisted on identities and embedded in tokens.
///
/// Wire form is the upper-case name (`"ADMIN"`, `"TEACHER"`, ...). Parsing
/// is case-insensitive because the external provider's custom claims carry
/// roles in whatever casing the tenant was configured with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Role {
    /// Full administrative access; permission superset of all other roles.
    Admin,
    /// Teaching staff.
    Teacher,
    /// Enrolled student.
    Student,
    /// Parent or guardian of a student.
    Parent,
}

impl Role {
    /// All roles, in authority order.
    pub const ALL: [Role; 4] = [Role::Admin, Role::Teacher, Role::Student, Role::Parent];

    /// The `ROLE_`-prefixed authority string used in principals.
    #[must_use]
    pub fn authority(self) -> String {
        format!("ROLE_{self}")
    }

    /// Parse a list of raw role strings into a role set.
    ///
    /// Unknown names are skipped rather than rejected: tokens from the
    /// provider may carry tenant-specific roles this service does not model.
    #[must_use]
    pub fn parse_set<S: AsRef<str>>(raw: &[S]) -> BTreeSet<Role> {
        raw.iter()
            .filter_map(|s| s.as_ref().parse().ok())
            .collect()
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Role::Admin => "ADMIN",
            Role::Teacher => "TEACHER",
            Role::Student => "STUDENT",
            Role::Parent => "PARENT",
        };
        f.write_str(name)
    }
}

impl FromStr for Role {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "ADMIN" => Ok(Role::Admin),
            "TEACHER" => Ok(Role::Teacher),
            "STUDENT" => Ok(Role::Student),
            "PARENT" => Ok(Role::Parent),
            other => Err(crate::Error::Internal(format!("unknown role: {other}"))),
        }
    }
}
