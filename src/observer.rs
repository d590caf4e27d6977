//! Audit observer contract.
//!
//! The kernel notifies the observer on every mutation. Under the strict
//! policy an observer failure aborts the operation with `AuditLogError`;
//! under the lenient policy it is logged and the data-plane operation
//! proceeds, accepting an audit gap.

use async_trait::async_trait;

use crate::error::NexusResult;
use crate::metadata::FileEntry;

/// Mutation notifications. Snapshot arguments carry pre-operation state
/// for undo support.
#[async_trait]
pub trait Observer: Send + Sync {
    async fn on_write(
        &self,
        entry: &FileEntry,
        is_new: bool,
        path: &str,
        zone_id: &str,
        agent_id: Option<&str>,
        snapshot_hash: Option<&str>,
        snapshot: Option<&FileEntry>,
    ) -> NexusResult<()>;

    async fn on_write_batch(
        &self,
        entries: &[FileEntry],
        zone_id: &str,
        agent_id: Option<&str>,
    ) -> NexusResult<()>;

    async fn on_delete(
        &self,
        path: &str,
        zone_id: &str,
        agent_id: Option<&str>,
        snapshot_hash: Option<&str>,
        snapshot: Option<&FileEntry>,
    ) -> NexusResult<()>;

    async fn on_rename(
        &self,
        old_path: &str,
        new_path: &str,
        zone_id: &str,
        agent_id: Option<&str>,
        snapshot_hash: Option<&str>,
        snapshot: Option<&FileEntry>,
    ) -> NexusResult<()>;
}
