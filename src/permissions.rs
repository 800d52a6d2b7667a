//! Permission resolver — the static role → permission mapping.
//!
//! Permissions are a derived view over roles, never persisted. Keeping the
//! mapping in code means there is exactly one source of truth for what a
//! role may do; a second authorization store cannot drift from it.

use std::collections::BTreeSet;

use crate::roles::Role;

/// Permission strings granted to each role.
///
/// The admin list is a strict superset of every other role's list; the
/// `admin_is_superset` test enforces this whenever an entry is added.
fn permissions_for(role: Role) -> &'static [&'static str] {
    match role {
        Role::Admin => &[
            "read:teachers",
            "write:teachers",
            "delete:teachers",
            "read:students",
            "write:students",
            "delete:students",
            "read:classes",
            "write:classes",
            "delete:classes",
            "read:grades",
            "write:grades",
            "delete:grades",
            "read:attendance",
            "write:attendance",
            "read:reports",
            "write:reports",
            "read:users",
            "write:users",
            "delete:users",
        ],
        Role::Teacher => &[
            "read:teachers",
            "write:teachers",
            "read:students",
            "read:classes",
            "write:classes",
            "read:grades",
            "write:grades",
            "read:attendance",
            "write:attendance",
        ],
        Role::Student | Role::Parent => &[
            "read:students",
            "read:classes",
            "read:grades",
            "read:attendance",
        ],
    }
}

/// Resolve a role set into the union of its permission sets.
///
/// Pure and deterministic: no I/O, no ordering dependency, and
/// `resolve(∅) = ∅`.
#[must_use]
pub fn resolve(roles: &BTreeSet<Role>) -> BTreeSet<String> {
    roles
        .iter()
        .flat_map(|r| permissions_for(*r).iter().map(|p| (*p).to_string()))
        .collect()
}
