//! Version-history queries and rollback on the catalog store.

use rusqlite::{params, OptionalExtension};

use crate::error::{NexusError, NexusResult};

use super::db::Db;
use super::store::MetadataStore;
use super::{FileEntry, SourceType, Timestamp, VersionRecord};

/// Shallow comparison of two versions of one path.
#[derive(Debug, Clone, PartialEq)]
pub struct VersionDiff {
    pub size_v1: u64,
    pub size_v2: u64,
    pub hash_v1: Option<String>,
    pub hash_v2: Option<String>,
    pub content_changed: bool,
    pub mime_type_changed: bool,
    pub created_at_v1: Timestamp,
    pub created_at_v2: Timestamp,
}

impl MetadataStore {
    /// The version-history row at `(path, version)`.
    pub fn get_version_record(
        &self,
        path: &str,
        version: u64,
    ) -> NexusResult<Option<VersionRecord>> {
        let Some(entry) = self.get(path)? else {
            return Ok(None);
        };
        let conn = self.db_ref().lock()?;
        let record = conn
            .query_row(
                "SELECT version_id, resource_id, version_number, content_hash, size_bytes,
                        mime_type, parent_version_id, source_type, created_at, created_by
                 FROM version_history
                 WHERE resource_type = 'file' AND resource_id = ?1 AND version_number = ?2",
                params![entry.path_id, version as i64],
                |row| {
                    Ok(VersionRecord {
                        version_id: row.get(0)?,
                        resource_id: row.get(1)?,
                        version_number: row.get::<_, i64>(2)? as u64,
                        content_hash: row.get(3)?,
                        size: row.get::<_, i64>(4)? as u64,
                        mime_type: row.get(5)?,
                        parent_version_id: row.get(6)?,
                        source_type: SourceType::parse(&row.get::<_, String>(7)?),
                        created_at: Timestamp(row.get(8)?),
                        created_by: row.get(9)?,
                    })
                },
            )
            .optional()?;
        Ok(record)
    }

    /// Synthesized metadata view of `path` at a historical version; the
    /// etag is the historical content hash.
    pub fn get_version(&self, path: &str, version: u64) -> NexusResult<Option<FileEntry>> {
        let Some(entry) = self.get(path)? else {
            return Ok(None);
        };
        let Some(record) = self.get_version_record(path, version)? else {
            return Ok(None);
        };
        Ok(Some(FileEntry {
            content_hash: record.content_hash.clone(),
            physical_path: record.content_hash.clone().unwrap_or_default(),
            size: record.size,
            mime_type: record.mime_type.clone(),
            modified_at: record.created_at,
            current_version: record.version_number,
            ..entry
        }))
    }

    /// All versions of a path, newest first.
    pub fn list_versions(&self, path: &str) -> NexusResult<Vec<VersionRecord>> {
        let Some(entry) = self.get(path)? else {
            return Ok(Vec::new());
        };
        let conn = self.db_ref().lock()?;
        let mut stmt = conn.prepare_cached(
            "SELECT version_id, resource_id, version_number, content_hash, size_bytes,
                    mime_type, parent_version_id, source_type, created_at, created_by
             FROM version_history
             WHERE resource_type = 'file' AND resource_id = ?1
             ORDER BY version_number DESC",
        )?;
        let rows = stmt.query_map([entry.path_id], |row| {
            Ok(VersionRecord {
                version_id: row.get(0)?,
                resource_id: row.get(1)?,
                version_number: row.get::<_, i64>(2)? as u64,
                content_hash: row.get(3)?,
                size: row.get::<_, i64>(4)? as u64,
                mime_type: row.get(5)?,
                parent_version_id: row.get(6)?,
                source_type: SourceType::parse(&row.get::<_, String>(7)?),
                created_at: Timestamp(row.get(8)?),
                created_by: row.get(9)?,
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Rolls `path` back to `version` by writing a new version that
    /// references the historical hash. Content is never copied, so CAS
    /// reference counts stay correct.
    pub fn rollback(
        &self,
        path: &str,
        version: u64,
        created_by: Option<&str>,
        zone_id: &str,
    ) -> NexusResult<(FileEntry, u64)> {
        let entry = self.get(path)?.ok_or_else(|| NexusError::not_found(path))?;
        let record = self
            .get_version_record(path, version)?
            .ok_or_else(|| NexusError::not_found(format!("{path}@{version}")))?;

        let result = {
            let mut conn = self.db_ref().lock()?;
            let tx = conn.transaction()?;
            let now = Timestamp::now();
            let new_version: i64 = tx.query_row(
                "UPDATE file_paths
                 SET content_hash = ?1, physical_path = ?2, size_bytes = ?3, mime_type = ?4,
                     updated_at = ?5, current_version = current_version + 1
                 WHERE path_id = ?6
                 RETURNING current_version",
                params![
                    record.content_hash,
                    record.content_hash.clone().unwrap_or_default(),
                    record.size as i64,
                    record.mime_type,
                    now.0,
                    entry.path_id,
                ],
                |row| row.get(0),
            )?;
            tx.execute(
                "INSERT INTO version_history
                 (resource_type, resource_id, version_number, content_hash, size_bytes,
                  mime_type, parent_version_id, source_type, created_at, created_by)
                 VALUES ('file', ?1, ?2, ?3, ?4, ?5,
                         (SELECT version_id FROM version_history
                          WHERE resource_type = 'file' AND resource_id = ?1
                            AND version_number = ?6),
                         ?7, ?8, ?9)",
                params![
                    entry.path_id,
                    new_version,
                    record.content_hash,
                    record.size as i64,
                    record.mime_type,
                    entry.current_version as i64,
                    SourceType::Rollback.as_str(),
                    now.0,
                    created_by,
                ],
            )?;
            let revision = Db::bump_revision_on(&tx, zone_id)?;
            tx.commit()?;
            (
                FileEntry {
                    content_hash: record.content_hash.clone(),
                    physical_path: record.content_hash.clone().unwrap_or_default(),
                    size: record.size,
                    mime_type: record.mime_type.clone(),
                    modified_at: now,
                    current_version: new_version as u64,
                    ..entry
                },
                revision,
            )
        };
        self.caches().invalidate_path(path);
        Ok(result)
    }

    /// Shallow diff of two versions; content-level diffing is the
    /// caller's business (fetch both hashes and compare bytes).
    pub fn get_version_diff(&self, path: &str, v1: u64, v2: u64) -> NexusResult<VersionDiff> {
        let r1 = self
            .get_version_record(path, v1)?
            .ok_or_else(|| NexusError::not_found(format!("{path}@{v1}")))?;
        let r2 = self
            .get_version_record(path, v2)?
            .ok_or_else(|| NexusError::not_found(format!("{path}@{v2}")))?;
        Ok(VersionDiff {
            size_v1: r1.size,
            size_v2: r2.size,
            content_changed: r1.content_hash != r2.content_hash,
            mime_type_changed: r1.mime_type != r2.mime_type,
            hash_v1: r1.content_hash,
            hash_v2: r2.content_hash,
            created_at_v1: r1.created_at,
            created_at_v2: r2.created_at,
        })
    }
}
