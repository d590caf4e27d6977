//! Operation context handed to every kernel entry point.
//!
//! The kernel never mutates an incoming context; when the router needs to
//! enrich it with backend details it works on a copy.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};

/// Shared read-set used for dependency tracking when `track_reads` is set.
pub type ReadSet = Arc<Mutex<BTreeSet<String>>>;

/// Identity, tenancy and routing information for one operation.
#[derive(Debug, Clone, Default)]
pub struct OperationContext {
    pub user: String,
    pub groups: Vec<String>,
    pub zone_id: Option<String>,
    pub agent_id: Option<String>,
    pub is_admin: bool,
    pub subject_id: Option<String>,
    pub subject_type: Option<String>,
    pub tenant_id: Option<String>,
    pub track_reads: bool,
    pub read_set: Option<ReadSet>,
    /// Populated by the router before the context reaches a backend.
    pub backend_path: Option<String>,
    pub virtual_path: Option<String>,
}

impl OperationContext {
    pub fn for_user(user: impl Into<String>) -> Self {
        Self { user: user.into(), ..Self::default() }
    }

    pub fn admin(user: impl Into<String>) -> Self {
        Self { user: user.into(), is_admin: true, ..Self::default() }
    }

    pub fn with_zone(mut self, zone_id: impl Into<String>) -> Self {
        self.zone_id = Some(zone_id.into());
        self
    }

    pub fn with_agent(mut self, agent_id: impl Into<String>) -> Self {
        self.agent_id = Some(agent_id.into());
        self
    }

    pub fn with_tenant(mut self, tenant_id: impl Into<String>) -> Self {
        self.tenant_id = Some(tenant_id.into());
        self
    }

    pub fn with_groups(mut self, groups: Vec<String>) -> Self {
        self.groups = groups;
        self
    }

    pub fn with_subject(
        mut self,
        subject_type: impl Into<String>,
        subject_id: impl Into<String>,
    ) -> Self {
        self.subject_type = Some(subject_type.into());
        self.subject_id = Some(subject_id.into());
        self
    }

    /// Enables read tracking with a fresh shared read-set.
    pub fn tracking_reads(mut self) -> Self {
        self.track_reads = true;
        self.read_set = Some(Arc::new(Mutex::new(BTreeSet::new())));
        self
    }

    /// Zone this operation acts in, `"default"` when unset.
    pub fn zone(&self) -> &str {
        self.zone_id.as_deref().unwrap_or("default")
    }

    /// ReBAC subject derived from the context.
    ///
    /// Falls back to `("user", user)` when no explicit subject is carried.
    pub fn subject(&self) -> (String, String) {
        let subject_type = self.subject_type.clone().unwrap_or_else(|| "user".to_owned());
        let subject_id = self.subject_id.clone().unwrap_or_else(|| self.user.clone());
        (subject_type, subject_id)
    }

    /// Records a path into the read-set when tracking is enabled.
    pub fn record_read(&self, path: &str) {
        if !self.track_reads {
            return;
        }
        if let Some(set) = &self.read_set {
            if let Ok(mut guard) = set.lock() {
                guard.insert(path.to_owned());
            }
        }
    }

    /// Copy of this context enriched with routing details.
    pub fn routed(&self, backend_path: impl Into<String>, virtual_path: impl Into<String>) -> Self {
        let mut copy = self.clone();
        copy.backend_path = Some(backend_path.into());
        copy.virtual_path = Some(virtual_path.into());
        copy
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subject_defaults_to_user() {
        let ctx = OperationContext::for_user("alice");
        assert_eq!(ctx.subject(), ("user".to_owned(), "alice".to_owned()));

        let ctx = OperationContext::for_user("alice").with_subject("agent", "agent-1");
        assert_eq!(ctx.subject(), ("agent".to_owned(), "agent-1".to_owned()));
    }

    #[test]
    fn test_zone_defaults() {
        assert_eq!(OperationContext::for_user("u").zone(), "default");
        assert_eq!(OperationContext::for_user("u").with_zone("z1").zone(), "z1");
    }

    #[test]
    fn test_routed_copy_leaves_original_untouched() {
        let ctx = OperationContext::for_user("alice");
        let routed = ctx.routed("abc123", "/w/a.txt");
        assert!(ctx.backend_path.is_none());
        assert_eq!(routed.backend_path.as_deref(), Some("abc123"));
        assert_eq!(routed.virtual_path.as_deref(), Some("/w/a.txt"));
    }

    #[test]
    fn test_read_tracking() {
        let ctx = OperationContext::for_user("alice").tracking_reads();
        ctx.record_read("/w/a.txt");
        ctx.record_read("/w/a.txt");
        let set = ctx.read_set.as_ref().unwrap().lock().unwrap();
        assert_eq!(set.len(), 1);

        let untracked = OperationContext::for_user("bob");
        untracked.record_read("/w/a.txt");
        assert!(untracked.read_set.is_none());
    }
}
