//! The catalog store: path rows, version history, KV attributes,
//! searchable text and zone revisions, fronted by the bounded caches.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use tracing::{debug, warn};

use crate::config::{CacheConfig, RetryConfig};
use crate::error::{NexusError, NexusResult};
use crate::path;

use super::cache::{ListingKey, MetadataCaches};
use super::cursor::{CursorFilters, PageCursor};
use super::db::{escape_like, Db};
use super::{dir_index, DirectoryEntry, EntryType, FileEntry, SourceType, Timestamp};

const ENTRY_COLUMNS: &str = "path_id, virtual_path, backend_id, physical_path, content_hash, \
     size_bytes, mime_type, created_at, updated_at, current_version, tenant_id, owner_id, \
     created_by, deleted_at";

/// One page of a keyset-paginated listing.
#[derive(Debug, Clone)]
pub struct ListPage {
    pub entries: Vec<FileEntry>,
    pub next_cursor: Option<String>,
}

pub struct MetadataStore {
    db: Arc<Db>,
    caches: MetadataCaches,
    retry: RetryConfig,
}

impl MetadataStore {
    pub fn new(db: Arc<Db>, cache_config: &CacheConfig, retry: RetryConfig) -> Self {
        Self { db, caches: MetadataCaches::new(cache_config), retry }
    }

    /// Shared database handle, also used by the ReBAC tuple store.
    pub fn db(&self) -> Arc<Db> {
        Arc::clone(&self.db)
    }

    pub(crate) fn db_ref(&self) -> &Db {
        &self.db
    }

    pub fn caches(&self) -> &MetadataCaches {
        &self.caches
    }

    pub fn clear_cache(&self) {
        self.caches.clear();
    }

    fn map_entry(row: &Row<'_>) -> rusqlite::Result<FileEntry> {
        Ok(FileEntry {
            path_id: row.get(0)?,
            path: row.get(1)?,
            backend_name: row.get(2)?,
            physical_path: row.get(3)?,
            content_hash: row.get(4)?,
            size: row.get::<_, i64>(5)? as u64,
            mime_type: row.get(6)?,
            created_at: Timestamp(row.get(7)?),
            modified_at: Timestamp(row.get(8)?),
            current_version: row.get::<_, i64>(9)? as u64,
            tenant_id: row.get(10)?,
            owner_id: row.get(11)?,
            created_by: row.get(12)?,
            deleted_at: row.get::<_, Option<i64>>(13)?.map(Timestamp),
        })
    }

    fn get_live_on(conn: &Connection, path: &str) -> NexusResult<Option<FileEntry>> {
        let query = format!(
            "SELECT {ENTRY_COLUMNS} FROM file_paths
             WHERE virtual_path = ?1 AND deleted_at IS NULL"
        );
        Ok(conn.query_row(&query, [path], Self::map_entry).optional()?)
    }

    /// Catalog row for a live path, through the entry cache.
    pub fn get(&self, path: &str) -> NexusResult<Option<FileEntry>> {
        if let Some(cached) = self.caches.get_entry(path) {
            return Ok(cached);
        }
        let entry = {
            let conn = self.db.lock()?;
            Self::get_live_on(&conn, path)?
        };
        self.caches.put_entry(path, entry.clone());
        Ok(entry)
    }

    pub fn get_path_id(&self, path: &str) -> NexusResult<Option<i64>> {
        Ok(self.get(path)?.map(|entry| entry.path_id))
    }

    /// Stores or updates an entry, bumping the version and the zone
    /// revision atomically. Returns the authoritative stored entry and
    /// the new zone revision.
    pub fn put(&self, entry: &FileEntry, zone_id: &str) -> NexusResult<(FileEntry, u64)> {
        entry.validate()?;
        let mut attempt = 0u32;
        loop {
            match self.try_put(entry, zone_id) {
                Ok(result) => {
                    self.caches.invalidate_path(&entry.path);
                    return Ok(result);
                }
                Err(err) if attempt + 1 < self.retry.max_attempts && is_retryable(&err) => {
                    attempt += 1;
                    let delay = backoff_delay(&self.retry, attempt);
                    debug!(path = %entry.path, attempt, ?delay, "metadata put conflict, retrying");
                    std::thread::sleep(delay);
                }
                Err(err) => {
                    if attempt > 0 {
                        warn!(path = %entry.path, attempts = attempt + 1, "metadata put gave up");
                    }
                    return Err(err);
                }
            }
        }
    }

    fn try_put(&self, entry: &FileEntry, zone_id: &str) -> NexusResult<(FileEntry, u64)> {
        let mut conn = self.db.lock()?;
        let tx = conn.transaction()?;
        let now = Timestamp::now();

        let existing = Self::get_live_on(&tx, &entry.path)?;
        let stored = match existing {
            Some(old) => {
                let new_version: i64 = tx.query_row(
                    "UPDATE file_paths
                     SET backend_id = ?1, physical_path = ?2, content_hash = ?3,
                         size_bytes = ?4, mime_type = ?5, updated_at = ?6,
                         tenant_id = COALESCE(?7, tenant_id),
                         current_version = current_version + 1
                     WHERE path_id = ?8
                     RETURNING current_version",
                    params![
                        entry.backend_name,
                        entry.physical_path,
                        entry.content_hash,
                        entry.size as i64,
                        entry.mime_type,
                        now.0,
                        entry.tenant_id,
                        old.path_id,
                    ],
                    |row| row.get(0),
                )?;

                if entry.content_hash.is_some() {
                    let parent_version_id: Option<i64> = tx
                        .query_row(
                            "SELECT version_id FROM version_history
                             WHERE resource_type = 'file' AND resource_id = ?1
                               AND version_number = ?2",
                            params![old.path_id, old.current_version as i64],
                            |row| row.get(0),
                        )
                        .optional()?;
                    tx.execute(
                        "INSERT INTO version_history
                         (resource_type, resource_id, version_number, content_hash, size_bytes,
                          mime_type, parent_version_id, source_type, created_at, created_by)
                         VALUES ('file', ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                        params![
                            old.path_id,
                            new_version,
                            entry.content_hash,
                            entry.size as i64,
                            entry.mime_type,
                            parent_version_id,
                            SourceType::Original.as_str(),
                            now.0,
                            entry.created_by,
                        ],
                    )?;
                }

                // Content changed: any parsed text on record is stale.
                tx.execute(
                    "UPDATE content_cache SET stale = 1 WHERE entry_id = ?1",
                    [old.path_id],
                )?;

                FileEntry {
                    path_id: old.path_id,
                    current_version: new_version as u64,
                    created_at: old.created_at,
                    created_by: old.created_by.clone(),
                    owner_id: old.owner_id.clone(),
                    modified_at: now,
                    deleted_at: None,
                    tenant_id: entry.tenant_id.clone().or(old.tenant_id),
                    ..entry.clone()
                }
            }
            None => {
                // A soft-deleted row at this path would collide with both
                // the live-path unique index and old version numbers;
                // purge it first. Its version rows stay behind, orphaned,
                // for forensic recovery.
                tx.execute(
                    "DELETE FROM file_paths
                     WHERE virtual_path = ?1 AND deleted_at IS NOT NULL",
                    [&entry.path],
                )?;

                tx.execute(
                    "INSERT INTO file_paths
                     (virtual_path, backend_id, physical_path, content_hash, size_bytes,
                      mime_type, created_at, updated_at, current_version, tenant_id,
                      owner_id, created_by)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 1, ?9, ?10, ?11)",
                    params![
                        entry.path,
                        entry.backend_name,
                        entry.physical_path,
                        entry.content_hash,
                        entry.size as i64,
                        entry.mime_type,
                        now.0,
                        now.0,
                        entry.tenant_id,
                        entry.owner_id,
                        entry.created_by,
                    ],
                )?;
                let path_id = tx.last_insert_rowid();

                if entry.content_hash.is_some() {
                    tx.execute(
                        "INSERT INTO version_history
                         (resource_type, resource_id, version_number, content_hash, size_bytes,
                          mime_type, parent_version_id, source_type, created_at, created_by)
                         VALUES ('file', ?1, 1, ?2, ?3, ?4, NULL, ?5, ?6, ?7)",
                        params![
                            path_id,
                            entry.content_hash,
                            entry.size as i64,
                            entry.mime_type,
                            SourceType::Original.as_str(),
                            now.0,
                            entry.created_by,
                        ],
                    )?;
                }

                FileEntry {
                    path_id,
                    current_version: 1,
                    created_at: now,
                    modified_at: now,
                    deleted_at: None,
                    ..entry.clone()
                }
            }
        };

        let tenant = stored.tenant_id.as_deref().unwrap_or("default");
        dir_index::upsert_for_path(&tx, tenant, &stored.path, EntryType::File)?;
        let revision = Db::bump_revision_on(&tx, zone_id)?;
        tx.commit()?;
        Ok((stored, revision))
    }

    /// Soft-deletes a path. Returns the pre-delete snapshot and the new
    /// zone revision, or `None` when the path has no live entry.
    pub fn delete(&self, path: &str, zone_id: &str) -> NexusResult<Option<(FileEntry, u64)>> {
        let result = {
            let mut conn = self.db.lock()?;
            let tx = conn.transaction()?;
            let Some(entry) = Self::get_live_on(&tx, path)? else {
                return Ok(None);
            };
            tx.execute(
                "UPDATE file_paths SET deleted_at = ?1 WHERE path_id = ?2",
                params![Timestamp::now().0, entry.path_id],
            )?;
            dir_index::remove_leaf(&tx, path)?;
            let revision = Db::bump_revision_on(&tx, zone_id)?;
            tx.commit()?;
            (entry, revision)
        };
        self.caches.invalidate_path(path);
        Ok(Some(result))
    }

    /// Renames a path and every live descendant in one transaction.
    pub fn rename_path(&self, old: &str, new: &str, zone_id: &str) -> NexusResult<u64> {
        let revision = {
            let mut conn = self.db.lock()?;
            let tx = conn.transaction()?;
            let like = format!("{}/%", escape_like(old));
            let changed = tx.execute(
                "UPDATE file_paths
                 SET virtual_path = CASE WHEN virtual_path = ?1
                         THEN ?2
                         ELSE ?2 || substr(virtual_path, length(?1) + 1) END,
                     updated_at = ?3
                 WHERE deleted_at IS NULL
                   AND (virtual_path = ?1 OR virtual_path LIKE ?4 ESCAPE '\\')",
                params![old, new, Timestamp::now().0, like],
            )?;
            if changed == 0 {
                return Err(NexusError::not_found(old));
            }
            dir_index::rename(&tx, old, new)?;
            let revision = Db::bump_revision_on(&tx, zone_id)?;
            tx.commit()?;
            revision
        };
        self.caches.invalidate_subtree(old);
        self.caches.invalidate_subtree(new);
        Ok(revision)
    }

    pub fn exists(&self, path: &str) -> NexusResult<bool> {
        if let Some(cached) = self.caches.get_exists(path) {
            return Ok(cached);
        }
        let found = {
            let conn = self.db.lock()?;
            conn.query_row(
                "SELECT 1 FROM file_paths WHERE virtual_path = ?1 AND deleted_at IS NULL",
                [path],
                |_| Ok(()),
            )
            .optional()?
            .is_some()
        };
        self.caches.put_exists(path, found);
        Ok(found)
    }

    /// Whether `path` has no row of its own but prefixes live entries.
    pub fn is_implicit_directory(&self, path: &str) -> NexusResult<bool> {
        let conn = self.db.lock()?;
        let like = format!("{}/%", escape_like(path.trim_end_matches('/')));
        let has_children = conn
            .query_row(
                "SELECT 1 FROM file_paths
                 WHERE virtual_path LIKE ?1 ESCAPE '\\' AND deleted_at IS NULL LIMIT 1",
                [like],
                |_| Ok(()),
            )
            .optional()?
            .is_some();
        Ok(has_children)
    }

    fn listing_clauses(
        prefix: &str,
        recursive: bool,
        tenant_id: Option<&str>,
    ) -> (String, Vec<SqlValue>) {
        let base = prefix.trim_end_matches('/');
        let child_like = if base.is_empty() {
            "/%".to_owned()
        } else {
            format!("{}/%", escape_like(base))
        };
        let mut clause = String::from(
            "deleted_at IS NULL AND virtual_path LIKE ? ESCAPE '\\' \
             AND virtual_path NOT LIKE '/\\_\\_sys\\_\\_/%' ESCAPE '\\'",
        );
        let mut params: Vec<SqlValue> = vec![SqlValue::from(child_like.clone())];
        if !recursive {
            clause.push_str(" AND virtual_path NOT LIKE ? ESCAPE '\\'");
            params.push(SqlValue::from(format!("{child_like}/%")));
        }
        if let Some(tenant) = tenant_id {
            clause.push_str(" AND (tenant_id = ? OR tenant_id = 'default' OR tenant_id IS NULL)");
            params.push(SqlValue::from(tenant.to_owned()));
        }
        (clause, params)
    }

    /// Live entries under `prefix`.
    pub fn list(
        &self,
        prefix: &str,
        recursive: bool,
        tenant_id: Option<&str>,
    ) -> NexusResult<Vec<FileEntry>> {
        let key: ListingKey =
            (prefix.trim_end_matches('/').to_owned(), recursive, tenant_id.map(str::to_owned));
        if let Some(cached) = self.caches.get_listing(&key) {
            return Ok(cached.as_ref().clone());
        }
        // A cached recursive listing of an ancestor already contains
        // every row this narrower listing can produce.
        if let Some((_, covering)) = self.caches.covering_listing(&key) {
            let filtered: Vec<FileEntry> = covering
                .iter()
                .filter(|entry| path::is_self_or_descendant(&entry.path, &key.0) && entry.path != key.0)
                .cloned()
                .collect();
            self.caches.put_listing(key, Arc::new(filtered.clone()));
            return Ok(filtered);
        }

        // Sparse-index fast path for flat listings within a tenant.
        if !recursive {
            if let Some(tenant) = tenant_id {
                if let Some(children) = self.list_directory_entries(&key.0, tenant)? {
                    let paths: Vec<String> = children
                        .iter()
                        .filter(|child| child.entry_type == EntryType::File)
                        .map(|child| path::join(&key.0, &child.entry_name))
                        .collect();
                    let batch = self.get_batch(&paths)?;
                    let entries: Vec<FileEntry> =
                        paths.iter().filter_map(|p| batch.get(p).cloned().flatten()).collect();
                    self.caches.put_listing(key, Arc::new(entries.clone()));
                    return Ok(entries);
                }
            }
        }

        let (clause, params) = Self::listing_clauses(prefix, recursive, tenant_id);
        let query = format!(
            "SELECT {ENTRY_COLUMNS} FROM file_paths WHERE {clause} ORDER BY virtual_path"
        );
        let entries = {
            let conn = self.db.lock()?;
            let mut stmt = conn.prepare(&query)?;
            let rows = stmt.query_map(params_from_iter(params), Self::map_entry)?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            out
        };
        self.caches.put_listing(key, Arc::new(entries.clone()));
        Ok(entries)
    }

    /// Keyset-paginated listing; `cursor` must come from a previous page
    /// with identical filters.
    pub fn list_paginated(
        &self,
        prefix: &str,
        recursive: bool,
        limit: usize,
        cursor: Option<&str>,
        tenant_id: Option<&str>,
    ) -> NexusResult<ListPage> {
        let filters = CursorFilters { prefix, recursive, tenant_id };
        let decoded = match cursor {
            Some(token) => Some(PageCursor::decode(token, &filters)?),
            None => None,
        };

        let (mut clause, mut params) = Self::listing_clauses(prefix, recursive, tenant_id);
        if let Some(cursor) = &decoded {
            clause.push_str(" AND (virtual_path > ? OR (virtual_path = ? AND path_id > ?))");
            params.push(SqlValue::from(cursor.last_path.clone()));
            params.push(SqlValue::from(cursor.last_path.clone()));
            params.push(SqlValue::from(cursor.last_id));
        }
        let query = format!(
            "SELECT {ENTRY_COLUMNS} FROM file_paths WHERE {clause}
             ORDER BY virtual_path, path_id LIMIT {}",
            limit + 1
        );

        let mut entries = {
            let conn = self.db.lock()?;
            let mut stmt = conn.prepare(&query)?;
            let rows = stmt.query_map(params_from_iter(params), Self::map_entry)?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            out
        };

        let next_cursor = if entries.len() > limit {
            entries.truncate(limit);
            entries
                .last()
                .map(|last| PageCursor::new(last.path.clone(), last.path_id, &filters).encode())
        } else {
            None
        };
        Ok(ListPage { entries, next_cursor })
    }

    /// Listing by a caller-supplied SQL LIKE pattern.
    pub fn list_with_pattern(&self, pattern: &str) -> NexusResult<Vec<FileEntry>> {
        let query = format!(
            "SELECT {ENTRY_COLUMNS} FROM file_paths
             WHERE deleted_at IS NULL AND virtual_path LIKE ?1
               AND virtual_path NOT LIKE '/\\_\\_sys\\_\\_/%' ESCAPE '\\'
             ORDER BY virtual_path"
        );
        let conn = self.db.lock()?;
        let mut stmt = conn.prepare(&query)?;
        let rows = stmt.query_map([pattern], Self::map_entry)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    pub fn get_batch(&self, paths: &[String]) -> NexusResult<HashMap<String, Option<FileEntry>>> {
        let mut out: HashMap<String, Option<FileEntry>> =
            paths.iter().map(|p| (p.clone(), None)).collect();
        let mut misses: Vec<String> = Vec::new();
        for p in paths {
            match self.caches.get_entry(p) {
                Some(cached) => {
                    out.insert(p.clone(), cached);
                }
                None => misses.push(p.clone()),
            }
        }
        if misses.is_empty() {
            return Ok(out);
        }

        let placeholders = vec!["?"; misses.len()].join(", ");
        let query = format!(
            "SELECT {ENTRY_COLUMNS} FROM file_paths
             WHERE deleted_at IS NULL AND virtual_path IN ({placeholders})"
        );
        {
            let conn = self.db.lock()?;
            let mut stmt = conn.prepare(&query)?;
            let rows = stmt.query_map(params_from_iter(misses.iter()), Self::map_entry)?;
            for row in rows {
                let entry = row?;
                self.caches.put_entry(&entry.path, Some(entry.clone()));
                out.insert(entry.path.clone(), Some(entry));
            }
        }
        for miss in &misses {
            if out.get(miss).map(Option::is_none).unwrap_or(false) {
                self.caches.put_entry(miss, None);
            }
        }
        Ok(out)
    }

    /// Batch write in one transaction with a single revision bump.
    pub fn put_batch(
        &self,
        entries: &[FileEntry],
        zone_id: &str,
    ) -> NexusResult<(Vec<FileEntry>, u64)> {
        for entry in entries {
            entry.validate()?;
        }
        let result = {
            let mut conn = self.db.lock()?;
            let tx = conn.transaction()?;
            let mut stored = Vec::with_capacity(entries.len());
            for entry in entries {
                stored.push(Self::put_one_on(&tx, entry)?);
            }
            let revision = Db::bump_revision_on(&tx, zone_id)?;
            tx.commit()?;
            (stored, revision)
        };
        for entry in entries {
            self.caches.invalidate_path(&entry.path);
        }
        Ok(result)
    }

    /// Single-row put against an already-open transaction; shared by
    /// `put_batch` so a batch is all-or-nothing.
    fn put_one_on(conn: &Connection, entry: &FileEntry) -> NexusResult<FileEntry> {
        let now = Timestamp::now();
        let existing = Self::get_live_on(conn, &entry.path)?;
        let stored = match existing {
            Some(old) => {
                let new_version: i64 = conn.query_row(
                    "UPDATE file_paths
                     SET backend_id = ?1, physical_path = ?2, content_hash = ?3,
                         size_bytes = ?4, mime_type = ?5, updated_at = ?6,
                         tenant_id = COALESCE(?7, tenant_id),
                         current_version = current_version + 1
                     WHERE path_id = ?8
                     RETURNING current_version",
                    params![
                        entry.backend_name,
                        entry.physical_path,
                        entry.content_hash,
                        entry.size as i64,
                        entry.mime_type,
                        now.0,
                        entry.tenant_id,
                        old.path_id,
                    ],
                    |row| row.get(0),
                )?;
                if entry.content_hash.is_some() {
                    conn.execute(
                        "INSERT INTO version_history
                         (resource_type, resource_id, version_number, content_hash, size_bytes,
                          mime_type, parent_version_id, source_type, created_at, created_by)
                         VALUES ('file', ?1, ?2, ?3, ?4, ?5,
                                 (SELECT version_id FROM version_history
                                  WHERE resource_type = 'file' AND resource_id = ?1
                                    AND version_number = ?6),
                                 ?7, ?8, ?9)",
                        params![
                            old.path_id,
                            new_version,
                            entry.content_hash,
                            entry.size as i64,
                            entry.mime_type,
                            old.current_version as i64,
                            SourceType::Original.as_str(),
                            now.0,
                            entry.created_by,
                        ],
                    )?;
                }
                FileEntry {
                    path_id: old.path_id,
                    current_version: new_version as u64,
                    created_at: old.created_at,
                    created_by: old.created_by.clone(),
                    owner_id: old.owner_id.clone(),
                    modified_at: now,
                    deleted_at: None,
                    tenant_id: entry.tenant_id.clone().or(old.tenant_id),
                    ..entry.clone()
                }
            }
            None => {
                conn.execute(
                    "DELETE FROM file_paths
                     WHERE virtual_path = ?1 AND deleted_at IS NOT NULL",
                    [&entry.path],
                )?;
                conn.execute(
                    "INSERT INTO file_paths
                     (virtual_path, backend_id, physical_path, content_hash, size_bytes,
                      mime_type, created_at, updated_at, current_version, tenant_id,
                      owner_id, created_by)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 1, ?9, ?10, ?11)",
                    params![
                        entry.path,
                        entry.backend_name,
                        entry.physical_path,
                        entry.content_hash,
                        entry.size as i64,
                        entry.mime_type,
                        now.0,
                        now.0,
                        entry.tenant_id,
                        entry.owner_id,
                        entry.created_by,
                    ],
                )?;
                let path_id = conn.last_insert_rowid();
                if entry.content_hash.is_some() {
                    conn.execute(
                        "INSERT INTO version_history
                         (resource_type, resource_id, version_number, content_hash, size_bytes,
                          mime_type, parent_version_id, source_type, created_at, created_by)
                         VALUES ('file', ?1, 1, ?2, ?3, ?4, NULL, ?5, ?6, ?7)",
                        params![
                            path_id,
                            entry.content_hash,
                            entry.size as i64,
                            entry.mime_type,
                            SourceType::Original.as_str(),
                            now.0,
                            entry.created_by,
                        ],
                    )?;
                }
                FileEntry {
                    path_id,
                    current_version: 1,
                    created_at: now,
                    modified_at: now,
                    deleted_at: None,
                    ..entry.clone()
                }
            }
        };
        let tenant = stored.tenant_id.as_deref().unwrap_or("default");
        dir_index::upsert_for_path(conn, tenant, &stored.path, EntryType::File)?;
        Ok(stored)
    }

    pub fn delete_batch(&self, paths: &[String], zone_id: &str) -> NexusResult<u64> {
        let revision = {
            let mut conn = self.db.lock()?;
            let tx = conn.transaction()?;
            let now = Timestamp::now().0;
            for p in paths {
                tx.execute(
                    "UPDATE file_paths SET deleted_at = ?1
                     WHERE virtual_path = ?2 AND deleted_at IS NULL",
                    params![now, p],
                )?;
                dir_index::remove_leaf(&tx, p)?;
            }
            let revision = Db::bump_revision_on(&tx, zone_id)?;
            tx.commit()?;
            revision
        };
        for p in paths {
            self.caches.invalidate_path(p);
        }
        Ok(revision)
    }

    /// Content hashes for many paths in one query.
    pub fn batch_get_content_ids(
        &self,
        paths: &[String],
    ) -> NexusResult<HashMap<String, Option<String>>> {
        let mut out: HashMap<String, Option<String>> =
            paths.iter().map(|p| (p.clone(), None)).collect();
        if paths.is_empty() {
            return Ok(out);
        }
        let placeholders = vec!["?"; paths.len()].join(", ");
        let query = format!(
            "SELECT virtual_path, content_hash FROM file_paths
             WHERE deleted_at IS NULL AND virtual_path IN ({placeholders})"
        );
        let conn = self.db.lock()?;
        let mut stmt = conn.prepare(&query)?;
        let rows = stmt.query_map(params_from_iter(paths.iter()), |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, Option<String>>(1)?))
        })?;
        for row in rows {
            let (path, hash) = row?;
            out.insert(path, hash);
        }
        Ok(out)
    }

    /// One JSON attribute of a path, through the KV cache.
    pub fn get_file_metadata(
        &self,
        path: &str,
        key: &str,
    ) -> NexusResult<Option<serde_json::Value>> {
        if let Some(cached) = self.caches.get_kv(path, key) {
            return Ok(cached.map(|v| v.as_ref().clone()));
        }
        let value: Option<serde_json::Value> = {
            let conn = self.db.lock()?;
            let text: Option<String> = conn
                .query_row(
                    "SELECT a.attr_value FROM file_attributes a
                     JOIN file_paths f ON f.path_id = a.entry_id
                     WHERE f.virtual_path = ?1 AND f.deleted_at IS NULL AND a.attr_key = ?2",
                    params![path, key],
                    |row| row.get(0),
                )
                .optional()?;
            match text {
                Some(text) => Some(serde_json::from_str(&text).map_err(|err| {
                    NexusError::metadata(format!("corrupt attribute {key} on {path}: {err}"))
                })?),
                None => None,
            }
        };
        self.caches.put_kv(path, key, value.clone().map(Arc::new));
        Ok(value)
    }

    pub fn set_file_metadata(
        &self,
        path: &str,
        key: &str,
        value: &serde_json::Value,
    ) -> NexusResult<()> {
        let entry_id = self
            .get_path_id(path)?
            .ok_or_else(|| NexusError::not_found(path))?;
        let text = serde_json::to_string(value)
            .map_err(|err| NexusError::validation(format!("unserializable attribute: {err}")))?;
        {
            let conn = self.db.lock()?;
            conn.execute(
                "INSERT INTO file_attributes (entry_id, attr_key, attr_value)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT(entry_id, attr_key) DO UPDATE SET attr_value = excluded.attr_value",
                params![entry_id, key, text],
            )?;
        }
        self.caches.put_kv(path, key, Some(Arc::new(value.clone())));
        Ok(())
    }

    /// Removes a set of attributes; missing keys are ignored.
    pub fn delete_file_metadata(&self, path: &str, keys: &[&str]) -> NexusResult<()> {
        let Some(entry_id) = self.get_path_id(path)? else {
            return Ok(());
        };
        {
            let conn = self.db.lock()?;
            let mut stmt = conn
                .prepare_cached("DELETE FROM file_attributes WHERE entry_id = ?1 AND attr_key = ?2")?;
            for key in keys {
                stmt.execute(params![entry_id, key])?;
            }
        }
        for key in keys {
            self.caches.put_kv(path, key, None);
        }
        Ok(())
    }

    /// One attribute key across many paths in a single query.
    pub fn get_file_metadata_bulk(
        &self,
        paths: &[String],
        key: &str,
    ) -> NexusResult<HashMap<String, serde_json::Value>> {
        let mut out = HashMap::new();
        if paths.is_empty() {
            return Ok(out);
        }
        let placeholders = vec!["?"; paths.len()].join(", ");
        let query = format!(
            "SELECT f.virtual_path, a.attr_value FROM file_attributes a
             JOIN file_paths f ON f.path_id = a.entry_id
             WHERE f.deleted_at IS NULL AND a.attr_key = ?
               AND f.virtual_path IN ({placeholders})"
        );
        let conn = self.db.lock()?;
        let mut stmt = conn.prepare(&query)?;
        let mut params: Vec<SqlValue> = vec![SqlValue::from(key.to_owned())];
        params.extend(paths.iter().map(|p| SqlValue::from(p.clone())));
        let rows = stmt.query_map(params_from_iter(params), |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;
        for row in rows {
            let (path, text) = row?;
            if let Ok(value) = serde_json::from_str(&text) {
                out.insert(path, value);
            }
        }
        Ok(out)
    }

    /// Fresh parsed text for external-connector search, if any.
    pub fn get_searchable_text(&self, path: &str) -> NexusResult<Option<String>> {
        let conn = self.db.lock()?;
        Ok(conn
            .query_row(
                "SELECT c.content_text FROM content_cache c
                 JOIN file_paths f ON f.path_id = c.entry_id
                 WHERE f.virtual_path = ?1 AND f.deleted_at IS NULL AND c.stale = 0",
                [path],
                |row| row.get(0),
            )
            .optional()?)
    }

    pub fn set_searchable_text(&self, path: &str, text: &str) -> NexusResult<()> {
        let entry_id = self
            .get_path_id(path)?
            .ok_or_else(|| NexusError::not_found(path))?;
        let conn = self.db.lock()?;
        conn.execute(
            "INSERT INTO content_cache (entry_id, content_text, stale) VALUES (?1, ?2, 0)
             ON CONFLICT(entry_id) DO UPDATE SET content_text = excluded.content_text, stale = 0",
            params![entry_id, text],
        )?;
        Ok(())
    }

    pub fn get_searchable_text_bulk(
        &self,
        paths: &[String],
    ) -> NexusResult<HashMap<String, String>> {
        let mut out = HashMap::new();
        if paths.is_empty() {
            return Ok(out);
        }
        let placeholders = vec!["?"; paths.len()].join(", ");
        let query = format!(
            "SELECT f.virtual_path, c.content_text FROM content_cache c
             JOIN file_paths f ON f.path_id = c.entry_id
             WHERE f.deleted_at IS NULL AND c.stale = 0
               AND f.virtual_path IN ({placeholders})"
        );
        let conn = self.db.lock()?;
        let mut stmt = conn.prepare(&query)?;
        let rows = stmt.query_map(params_from_iter(paths.iter()), |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, Option<String>>(1)?))
        })?;
        for row in rows {
            let (path, text) = row?;
            if let Some(text) = text {
                out.insert(path, text);
            }
        }
        Ok(out)
    }

    pub fn increment_revision(&self, zone_id: &str) -> NexusResult<u64> {
        self.db.increment_revision(zone_id)
    }

    pub fn get_revision(&self, zone_id: &str) -> NexusResult<u64> {
        self.db.get_revision(zone_id)
    }

    /// Index rows under `parent`, or `None` when the index has nothing.
    pub fn list_directory_entries(
        &self,
        parent: &str,
        tenant_id: &str,
    ) -> NexusResult<Option<Vec<DirectoryEntry>>> {
        let conn = self.db.lock()?;
        dir_index::list_entries(&conn, parent, tenant_id)
    }

    /// Drops index rows at or under `parent` (directory delete).
    pub fn delete_directory_entries_recursive(
        &self,
        parent: &str,
        tenant_id: Option<&str>,
    ) -> NexusResult<usize> {
        let conn = self.db.lock()?;
        dir_index::remove_recursive(&conn, parent, tenant_id)
    }

    /// Rebuilds index rows from the file table; returns rows written.
    pub fn backfill_directory_index(
        &self,
        prefix: &str,
        tenant_id: Option<&str>,
    ) -> NexusResult<usize> {
        let entries = self.list(prefix, true, tenant_id)?;
        let conn = self.db.lock()?;
        let mut count = 0usize;
        for entry in &entries {
            let tenant = entry.tenant_id.as_deref().unwrap_or("default");
            dir_index::upsert_for_path(&conn, tenant, &entry.path, EntryType::File)?;
            count += 1;
        }
        Ok(count)
    }
}

fn is_retryable(err: &NexusError) -> bool {
    match err {
        NexusError::MetadataError { message } => {
            message.contains("locked")
                || message.contains("busy")
                || message.contains("UNIQUE constraint")
        }
        _ => false,
    }
}

fn backoff_delay(retry: &RetryConfig, attempt: u32) -> Duration {
    let exp = retry.initial_delay_ms.saturating_mul(1u64 << attempt.min(20));
    let capped = exp.min(retry.max_delay_ms).max(1);
    let jitter = rand::thread_rng().gen_range(0..=capped / 2);
    Duration::from_millis(capped / 2 + jitter)
}
