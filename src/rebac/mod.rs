//! Relationship-based access control, Zanzibar style.
//!
//! Permissions are computed from a graph of (subject, relation, object)
//! tuples plus per-object-type namespace expressions, answered through a
//! two-tier cache keyed on zone-revision buckets.

mod cache;
mod compute;
mod conditions;
mod grants;
mod l2;
mod manager;
mod namespace;
mod store;

#[cfg(test)]
mod tests;

pub use cache::{CheckKey, L1Cache};
pub use compute::{PermissionComputer, TraceStep, TupleSnapshot, TupleSource};
pub use grants::GrantIndex;
pub use l2::L2Cache;
pub use manager::{ColumnConfig, Explanation, RebacManager};
pub use namespace::{NamespaceConfig, NamespaceRegistry, RelationExpr};
pub use store::{RebacStore, TupleFilter, TupleRequest};

use std::fmt;

use crate::metadata::Timestamp;

/// Relations allowed to cross zone boundaries.
pub const CROSS_ZONE_RELATIONS: &[&str] = &["shared-viewer", "shared-editor", "shared-owner"];

/// Relations that grant access on files directly or via inheritance;
/// changes to them invalidate whole object subtrees.
pub const FILE_ACCESS_RELATIONS: &[&str] = &[
    "direct_owner",
    "direct_editor",
    "direct_viewer",
    "owner",
    "editor",
    "viewer",
    "read",
    "write",
    "shared-owner",
    "shared-editor",
    "shared-viewer",
];

/// Relations that express group membership; changes to them invalidate
/// everything cached for the subject.
pub const MEMBERSHIP_RELATIONS: &[&str] = &["member", "member-of"];

/// A typed participant in the permission graph.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Entity {
    pub entity_type: String,
    pub entity_id: String,
}

impl Entity {
    pub fn new(entity_type: impl Into<String>, entity_id: impl Into<String>) -> Self {
        Self { entity_type: entity_type.into(), entity_id: entity_id.into() }
    }

    pub fn file(path: impl Into<String>) -> Self {
        Self::new("file", path)
    }

    pub fn user(id: impl Into<String>) -> Self {
        Self::new("user", id)
    }

    pub fn group(id: impl Into<String>) -> Self {
        Self::new("group", id)
    }
}

impl fmt::Display for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.entity_type, self.entity_id)
    }
}

/// One stored relationship tuple.
#[derive(Debug, Clone, PartialEq)]
pub struct RebacTuple {
    pub tuple_id: i64,
    pub subject: Entity,
    /// Set for userset-as-subject tuples: "everyone with this relation on
    /// the subject object".
    pub subject_relation: Option<String>,
    pub relation: String,
    pub object: Entity,
    pub zone_id: String,
    pub subject_zone_id: String,
    pub object_zone_id: String,
    pub expires_at: Option<Timestamp>,
    pub conditions: Option<serde_json::Value>,
    pub created_at: Timestamp,
}

impl RebacTuple {
    pub fn is_expired(&self, now: Timestamp) -> bool {
        matches!(self.expires_at, Some(expiry) if expiry.0 <= now.0)
    }

    /// Simple tuples qualify for eager cache recomputation.
    pub fn is_simple(&self) -> bool {
        self.expires_at.is_none()
            && self.subject_relation.is_none()
            && self.relation != "parent"
            && !MEMBERSHIP_RELATIONS.contains(&self.relation.as_str())
    }
}
