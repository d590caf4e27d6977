//! Delete and rename.

use tracing::debug;

use crate::context::OperationContext;
use crate::error::{NexusError, NexusResult};
use crate::events::FileEventType;
use crate::metadata::Zookie;

use super::{NexusFs, MEMORY_PREFIX};

/// What a delete reports back.
#[derive(Debug, Clone, PartialEq)]
pub struct DeleteResult {
    pub deleted: bool,
    /// The file only existed in the overlay's base layer; a whiteout now
    /// hides it.
    pub overlay_whiteout: bool,
    pub zookie: Option<Zookie>,
}

impl NexusFs {
    /// Soft-deletes a path. Version history survives for forensics; the
    /// blob's CAS reference is dropped.
    pub async fn delete(
        &self,
        raw_path: &str,
        ctx: &OperationContext,
    ) -> NexusResult<DeleteResult> {
        let virtual_path = self.validate(raw_path, ctx)?;

        if virtual_path.starts_with(MEMORY_PREFIX) {
            if let Some(memory) = &self.memory {
                memory.delete(&virtual_path, ctx).await?;
                return Ok(DeleteResult { deleted: true, overlay_whiteout: false, zookie: None });
            }
        }

        let route = self.route(&virtual_path, ctx, true)?;
        let routed_ctx = ctx.routed(route.backend_path.clone(), virtual_path.clone());

        let existing = self.metadata.get(&virtual_path)?;
        let Some(entry) = existing else {
            // Base-layer-only file under an overlay: record a whiteout
            // instead of touching metadata.
            if let (Some(resolver), Some(overlay)) = (&self.overlay, &route.overlay) {
                if let Some(base) = resolver.resolve_read(&virtual_path, overlay).await? {
                    if !resolver.is_whiteout(&base) {
                        self.check_permission(ctx, &virtual_path, "write", None)?;
                        resolver.create_whiteout(&virtual_path, overlay).await?;
                        debug!(path = %virtual_path, "created overlay whiteout");
                        return Ok(DeleteResult {
                            deleted: true,
                            overlay_whiteout: true,
                            zookie: None,
                        });
                    }
                }
            }
            return Err(NexusError::not_found(&virtual_path));
        };

        self.check_permission(ctx, &virtual_path, "write", Some(&entry))?;

        // Observer first: strict mode must be able to abort before any
        // state changes.
        if let Some(observer) = &self.observer {
            let outcome = observer
                .on_delete(
                    &virtual_path,
                    ctx.zone(),
                    ctx.agent_id.as_deref(),
                    entry.content_hash.as_deref(),
                    Some(&entry),
                )
                .await;
            self.observer_outcome("delete", outcome)?;
        }

        if let Some(hash) = entry.content_hash.as_deref() {
            route.backend.delete_content(hash, &routed_ctx).await?;
        }

        let deleted = self.metadata.delete(&virtual_path, ctx.zone())?;
        let revision = deleted.map(|(_, revision)| revision);
        self.rebac.grants().on_file_deleted(&virtual_path);

        let event = Self::build_event(
            FileEventType::FileDelete,
            &virtual_path,
            ctx,
            Some(&entry),
            revision,
        );
        self.fan_out("FILE_DELETE", event);
        self.notify_revision(ctx.zone());

        Ok(DeleteResult {
            deleted: true,
            overlay_whiteout: false,
            zookie: revision.map(|revision| self.zookie(ctx, revision)),
        })
    }

    /// Renames a file or directory subtree, carrying permissions along.
    pub async fn rename(
        &self,
        raw_old: &str,
        raw_new: &str,
        ctx: &OperationContext,
    ) -> NexusResult<Zookie> {
        let old_path = self.validate(raw_old, ctx)?;
        let new_path = self.validate(raw_new, ctx)?;
        if old_path == new_path {
            return Err(NexusError::validation("rename source equals destination"));
        }
        if crate::path::is_self_or_descendant(&new_path, &old_path) {
            return Err(NexusError::validation("cannot rename a path into itself"));
        }

        let old_route = self.route(&old_path, ctx, true)?;
        let new_route = self.route(&new_path, ctx, true)?;
        // Moving bytes between backends is not a rename; reject before
        // any state changes.
        if old_route.backend.name() != new_route.backend.name()
            && !old_route.backend.capabilities().supports_rename
        {
            return Err(NexusError::validation(format!(
                "cannot rename across backends {} -> {}",
                old_route.backend.name(),
                new_route.backend.name()
            )));
        }

        let source_entry = self.metadata.get(&old_path)?;
        let is_directory = match &source_entry {
            Some(_) => false,
            None => {
                if self.metadata.is_implicit_directory(&old_path)? {
                    true
                } else {
                    return Err(NexusError::not_found(&old_path));
                }
            }
        };

        if let Some(destination) = self.metadata.get(&new_path)? {
            // Path connectors can leave stale rows behind after an
            // external move; clean those up instead of failing.
            let stale = old_route.backend.capabilities().supports_rename
                && destination.content_hash.is_none();
            if stale {
                self.metadata.delete(&new_path, ctx.zone())?;
            } else {
                return Err(NexusError::FileExists { path: new_path });
            }
        }

        self.check_permission(ctx, &old_path, "write", source_entry.as_ref())?;

        if old_route.backend.capabilities().supports_rename {
            // Physical move first; a failure aborts before metadata
            // changes.
            old_route
                .backend
                .rename_file(&old_route.backend_path, &new_route.backend_path)
                .await?;
        }

        let revision = self.metadata.rename_path(&old_path, &new_path, ctx.zone())?;
        self.rebac.update_object_path(&old_path, &new_path, "file", is_directory)?;

        if let Some(observer) = &self.observer {
            let outcome = observer
                .on_rename(
                    &old_path,
                    &new_path,
                    ctx.zone(),
                    ctx.agent_id.as_deref(),
                    source_entry.as_ref().and_then(|e| e.content_hash.as_deref()),
                    source_entry.as_ref(),
                )
                .await;
            self.observer_outcome("rename", outcome)?;
        }

        let mut event = Self::build_event(
            FileEventType::FileRename,
            &new_path,
            ctx,
            source_entry.as_ref(),
            Some(revision),
        );
        event.old_path = Some(old_path.clone());
        self.fan_out("FILE_RENAME", event);
        self.notify_revision(ctx.zone());

        Ok(self.zookie(ctx, revision))
    }
}
