//! Version surface: historical reads, lineage, rollback and diff.

use crate::context::OperationContext;
use crate::error::{NexusError, NexusResult};
use crate::events::FileEventType;
use crate::metadata::{FileEntry, VersionRecord, Zookie};

use super::NexusFs;

impl NexusFs {
    /// Metadata view of `path` at a historical version.
    pub async fn get_version(
        &self,
        raw_path: &str,
        version: u64,
        ctx: &OperationContext,
    ) -> NexusResult<FileEntry> {
        let virtual_path = self.validate(raw_path, ctx)?;
        self.check_permission(ctx, &virtual_path, "read", None)?;
        self.metadata
            .get_version(&virtual_path, version)?
            .ok_or_else(|| NexusError::not_found(format!("{virtual_path}@{version}")))
    }

    /// Bytes of `path` at a historical version.
    pub async fn read_version(
        &self,
        raw_path: &str,
        version: u64,
        ctx: &OperationContext,
    ) -> NexusResult<Vec<u8>> {
        let entry = self.get_version(raw_path, version, ctx).await?;
        let route = self.route(&entry.path, ctx, false)?;
        let routed_ctx = ctx.routed(route.backend_path.clone(), entry.path.clone());
        match entry.content_hash.as_deref() {
            Some(hash) => route.backend.read_content(hash, &routed_ctx).await,
            None => Ok(Vec::new()),
        }
    }

    /// Version lineage, newest first.
    pub async fn list_versions(
        &self,
        raw_path: &str,
        ctx: &OperationContext,
    ) -> NexusResult<Vec<VersionRecord>> {
        let virtual_path = self.validate(raw_path, ctx)?;
        self.check_permission(ctx, &virtual_path, "read", None)?;
        self.metadata.list_versions(&virtual_path)
    }

    /// Makes version `version` current again by reference, as a new
    /// version.
    pub async fn rollback(
        &self,
        raw_path: &str,
        version: u64,
        ctx: &OperationContext,
    ) -> NexusResult<(FileEntry, Zookie)> {
        let virtual_path = self.validate(raw_path, ctx)?;
        let existing = self.metadata.get(&virtual_path)?;
        self.check_permission(ctx, &virtual_path, "write", existing.as_ref())?;

        let (entry, revision) =
            self.metadata
                .rollback(&virtual_path, version, Some(ctx.user.as_str()), ctx.zone())?;

        let event = Self::build_event(
            FileEventType::FileWrite,
            &virtual_path,
            ctx,
            Some(&entry),
            Some(revision),
        );
        self.fan_out("FILE_WRITE", event);
        self.notify_revision(ctx.zone());
        Ok((entry, self.zookie(ctx, revision)))
    }

    /// Shallow diff between two versions.
    pub async fn get_version_diff(
        &self,
        raw_path: &str,
        v1: u64,
        v2: u64,
        ctx: &OperationContext,
    ) -> NexusResult<crate::metadata::VersionDiff> {
        let virtual_path = self.validate(raw_path, ctx)?;
        self.check_permission(ctx, &virtual_path, "read", None)?;
        self.metadata.get_version_diff(&virtual_path, v1, v2)
    }
}
