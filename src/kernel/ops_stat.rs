//! Metadata queries: stat, exists, listings and bulk reads.

use std::collections::HashMap;

use tracing::warn;

use crate::context::OperationContext;
use crate::error::{NexusError, NexusResult};
use crate::metadata::{FileEntry, ListPage, Timestamp};
use crate::rebac::Entity;
use crate::router::Route;

use super::NexusFs;

/// One readable path inside a bulk read.
struct BulkItem {
    index: usize,
    hash: String,
    virtual_path: String,
    backend_path: String,
}

/// All bulk-read items served by one backend.
struct BulkGroup {
    route: Route,
    items: Vec<BulkItem>,
}

/// Synthesized view returned by `stat`.
#[derive(Debug, Clone, PartialEq)]
pub struct StatResult {
    pub path: String,
    pub size: u64,
    pub etag: Option<String>,
    pub version: u64,
    pub modified_at: Timestamp,
    pub is_directory: bool,
}

impl StatResult {
    fn for_file(entry: &FileEntry) -> Self {
        Self {
            path: entry.path.clone(),
            size: entry.size,
            etag: entry.content_hash.clone(),
            version: entry.current_version,
            modified_at: entry.modified_at,
            is_directory: false,
        }
    }

    fn for_directory(path: &str) -> Self {
        Self {
            path: path.to_owned(),
            size: 0,
            etag: None,
            version: 0,
            modified_at: Timestamp(0),
            is_directory: true,
        }
    }
}

impl NexusFs {
    pub async fn stat(&self, raw_path: &str, ctx: &OperationContext) -> NexusResult<StatResult> {
        let virtual_path = self.validate(raw_path, ctx)?;
        if let Some(entry) = self.metadata.get(&virtual_path)? {
            self.check_permission(ctx, &virtual_path, "read", Some(&entry))?;
            return Ok(StatResult::for_file(&entry));
        }
        if self.metadata.is_implicit_directory(&virtual_path)? {
            self.check_traverse(ctx, &virtual_path)?;
            return Ok(StatResult::for_directory(&virtual_path));
        }
        Err(NexusError::not_found(&virtual_path))
    }

    /// Batch stat: validates everything, permission-filters, then one
    /// catalog round trip. Paths the subject may not see are omitted.
    pub async fn stat_bulk(
        &self,
        raw_paths: &[String],
        ctx: &OperationContext,
    ) -> NexusResult<Vec<StatResult>> {
        let mut validated = Vec::with_capacity(raw_paths.len());
        for raw in raw_paths {
            validated.push(self.validate(raw, ctx)?);
        }
        let entries = self.metadata.get_batch(&validated)?;
        let keep = self.filter_readable(ctx, &validated, &entries)?;
        let mut out = Vec::new();
        for (virtual_path, allowed) in validated.iter().zip(keep) {
            if !allowed {
                continue;
            }
            match entries.get(virtual_path).and_then(|e| e.as_ref()) {
                Some(entry) => out.push(StatResult::for_file(entry)),
                None => {
                    if self.metadata.is_implicit_directory(virtual_path)? {
                        out.push(StatResult::for_directory(virtual_path));
                    }
                }
            }
        }
        Ok(out)
    }

    /// TRAVERSE on an implicit directory, with the descendant-access
    /// concession behind its config flag.
    fn check_traverse(&self, ctx: &OperationContext, dir_path: &str) -> NexusResult<()> {
        match self.check_permission(ctx, dir_path, "traverse", None) {
            Ok(()) => Ok(()),
            Err(denied) => {
                if self.config.kernel.exists_via_descendants
                    && self.has_readable_descendant(ctx, dir_path)?
                {
                    return Ok(());
                }
                Err(denied)
            }
        }
    }

    fn has_readable_descendant(
        &self,
        ctx: &OperationContext,
        dir_path: &str,
    ) -> NexusResult<bool> {
        // Bounded probe: a directory with thousands of children still
        // answers from the first page.
        let page = self.metadata.list_paginated(dir_path, true, 100, None, ctx.tenant_id.as_deref())?;
        let paths: Vec<String> = page.entries.iter().map(|e| e.path.clone()).collect();
        let entries: HashMap<String, Option<FileEntry>> =
            page.entries.into_iter().map(|e| (e.path.clone(), Some(e))).collect();
        let keep = self.filter_readable(ctx, &paths, &entries)?;
        Ok(keep.into_iter().any(|allowed| allowed))
    }

    /// Existence check. A denied permission answers `false` rather than
    /// erroring: existence must not leak through error kinds.
    pub async fn exists(&self, raw_path: &str, ctx: &OperationContext) -> NexusResult<bool> {
        let virtual_path = self.validate(raw_path, ctx)?;
        if let Some(entry) = self.metadata.get(&virtual_path)? {
            return Ok(self.check_permission(ctx, &virtual_path, "read", Some(&entry)).is_ok());
        }
        if self.metadata.is_implicit_directory(&virtual_path)? {
            return Ok(self.check_traverse(ctx, &virtual_path).is_ok());
        }
        Ok(false)
    }

    pub async fn exists_batch(
        &self,
        raw_paths: &[String],
        ctx: &OperationContext,
    ) -> NexusResult<HashMap<String, bool>> {
        let mut out = HashMap::with_capacity(raw_paths.len());
        for raw in raw_paths {
            out.insert(raw.clone(), self.exists(raw, ctx).await?);
        }
        Ok(out)
    }

    /// Listing filtered to entries the subject may read.
    pub async fn list(
        &self,
        raw_prefix: &str,
        recursive: bool,
        ctx: &OperationContext,
    ) -> NexusResult<Vec<FileEntry>> {
        let prefix = self.validate(raw_prefix, ctx)?;
        let entries = self.metadata.list(&prefix, recursive, ctx.tenant_id.as_deref())?;
        self.filter_entries(ctx, entries)
    }

    pub async fn list_paginated(
        &self,
        raw_prefix: &str,
        recursive: bool,
        limit: usize,
        cursor: Option<&str>,
        ctx: &OperationContext,
    ) -> NexusResult<ListPage> {
        let prefix = self.validate(raw_prefix, ctx)?;
        let page = self.metadata.list_paginated(
            &prefix,
            recursive,
            limit,
            cursor,
            ctx.tenant_id.as_deref(),
        )?;
        let next_cursor = page.next_cursor.clone();
        let entries = self.filter_entries(ctx, page.entries)?;
        Ok(ListPage { entries, next_cursor })
    }

    fn filter_entries(
        &self,
        ctx: &OperationContext,
        entries: Vec<FileEntry>,
    ) -> NexusResult<Vec<FileEntry>> {
        if !self.config.kernel.enforce_permissions || ctx.is_admin {
            return Ok(entries);
        }
        let paths: Vec<String> = entries.iter().map(|e| e.path.clone()).collect();
        let map: HashMap<String, Option<FileEntry>> =
            entries.iter().map(|e| (e.path.clone(), Some(e.clone()))).collect();
        let keep = self.filter_readable(ctx, &paths, &map)?;
        Ok(entries
            .into_iter()
            .zip(keep)
            .filter_map(|(entry, allowed)| allowed.then_some(entry))
            .collect())
    }

    /// Bulk read: permission filter, one metadata batch, then one fetch
    /// pass per backend group. With `skip_errors`, failures come back as
    /// `None`.
    pub async fn read_bulk(
        &self,
        raw_paths: &[String],
        ctx: &OperationContext,
        skip_errors: bool,
    ) -> NexusResult<Vec<Option<Vec<u8>>>> {
        let mut validated = Vec::with_capacity(raw_paths.len());
        for raw in raw_paths {
            validated.push(self.validate(raw, ctx)?);
        }
        let entries = self.metadata.get_batch(&validated)?;
        let keep = self.filter_readable(ctx, &validated, &entries)?;

        let mut out: Vec<Option<Vec<u8>>> = vec![None; validated.len()];
        let mut groups: Vec<BulkGroup> = Vec::new();
        for (index, (virtual_path, allowed)) in validated.iter().zip(&keep).enumerate() {
            if !allowed {
                if !skip_errors {
                    return Err(NexusError::permission_denied(virtual_path, "read"));
                }
                continue;
            }
            let entry = match entries.get(virtual_path).and_then(|e| e.as_ref()) {
                Some(entry) => entry,
                None => {
                    if skip_errors {
                        continue;
                    }
                    return Err(NexusError::not_found(virtual_path));
                }
            };
            let Some(hash) = entry.content_hash.clone() else {
                out[index] = Some(Vec::new());
                continue;
            };
            let route = match self.route(virtual_path, ctx, false) {
                Ok(route) => route,
                Err(err) if skip_errors => {
                    warn!(path = %virtual_path, error = %err, "read_bulk routing failed; skipping");
                    continue;
                }
                Err(err) => return Err(err),
            };
            let item = BulkItem {
                index,
                hash,
                virtual_path: virtual_path.clone(),
                backend_path: route.backend_path.clone(),
            };
            let position =
                groups.iter().position(|g| g.route.backend.name() == route.backend.name());
            match position {
                Some(slot) => groups[slot].items.push(item),
                None => groups.push(BulkGroup { route, items: vec![item] }),
            }
        }

        for group in &groups {
            self.read_backend_group(group, ctx, skip_errors, &mut out).await?;
        }
        ctx.record_read("<bulk>");
        Ok(out)
    }

    /// One fetch pass over a backend's share of a bulk read, in tiers:
    /// the backend's bulk cache first, then grouped off-thread disk
    /// reads, then per-path content reads.
    async fn read_backend_group(
        &self,
        group: &BulkGroup,
        ctx: &OperationContext,
        skip_errors: bool,
        out: &mut [Option<Vec<u8>>],
    ) -> NexusResult<()> {
        let backend = &group.route.backend;

        // Tier 1: one bulk cache call for the whole group. A failed hint
        // only demotes the group to the next tier.
        let hashes: Vec<String> = group.items.iter().map(|item| item.hash.clone()).collect();
        let mut cached = match backend.read_bulk_from_cache(&hashes, true).await {
            Ok(map) => map,
            Err(err) => {
                warn!(backend = backend.name(), error = %err, "bulk cache read failed");
                std::collections::HashMap::new()
            }
        };
        let mut remaining: Vec<&BulkItem> = Vec::new();
        for item in &group.items {
            match cached.remove(&item.hash) {
                Some(bytes) => out[item.index] = Some(bytes),
                None => remaining.push(item),
            }
        }
        if remaining.is_empty() {
            return Ok(());
        }

        // Tier 2: the whole remainder read off-thread in parallel when
        // the backend exposes blob disk locations.
        if backend.capabilities().supports_parallel_mmap_read {
            let disk: Vec<(usize, std::path::PathBuf)> = remaining
                .iter()
                .filter_map(|item| backend.hash_to_path(&item.hash).map(|p| (item.index, p)))
                .collect();
            if disk.len() == remaining.len() {
                let handles: Vec<(usize, tokio::task::JoinHandle<std::io::Result<Vec<u8>>>)> =
                    disk.into_iter()
                        .map(|(index, disk_path)| {
                            (index, tokio::task::spawn_blocking(move || std::fs::read(disk_path)))
                        })
                        .collect();
                for (index, handle) in handles {
                    let read = handle
                        .await
                        .map_err(|err| NexusError::backend(format!("bulk read task failed: {err}")))
                        .and_then(|inner| inner.map_err(NexusError::from));
                    match read {
                        Ok(bytes) => out[index] = Some(bytes),
                        Err(err) if skip_errors => {
                            warn!(error = %err, "read_bulk disk read failed; skipping");
                        }
                        Err(err) => return Err(err),
                    }
                }
                return Ok(());
            }
        }

        // Tier 3: per-path reads.
        for item in remaining {
            let routed_ctx = ctx.routed(item.backend_path.clone(), item.virtual_path.clone());
            match backend.read_content(&item.hash, &routed_ctx).await {
                Ok(bytes) => out[item.index] = Some(bytes),
                Err(err) if skip_errors => {
                    warn!(path = %item.virtual_path, error = %err, "read_bulk entry failed; skipping");
                }
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    /// Subjects currently holding `relation` on a path; thin pass-through
    /// used by admin surfaces.
    pub fn expand_permissions(&self, relation: &str, raw_path: &str) -> NexusResult<Vec<Entity>> {
        self.rebac.expand(relation, &Entity::file(raw_path), "default")
    }
}
