//! The metadata catalog: authoritative records of virtual paths, version
//! history, directory topology, per-path attributes and zone revisions.
//!
//! The catalog is an embedded SQLite database fronted by four bounded
//! TTL'd caches. All operations are synchronous and transactional; the
//! kernel calls them directly from async context without yielding.

mod cache;
mod cursor;
mod db;
mod dir_index;
mod store;
mod versions;

#[cfg(test)]
mod tests;

pub use cache::MetadataCaches;
pub use cursor::PageCursor;
pub use db::Db;
pub(crate) use db::escape_like;
pub use store::{ListPage, MetadataStore};
pub use versions::VersionDiff;

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Milliseconds since the Unix epoch.
#[derive(
    Debug, Default, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Timestamp(pub i64);

impl Timestamp {
    pub fn now() -> Self {
        let duration = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default();
        Timestamp(duration.as_millis() as i64)
    }
}

/// One live (or soft-deleted) virtual path.
#[derive(Debug, Clone, PartialEq)]
pub struct FileEntry {
    /// Catalog row id; 0 until the entry has been stored.
    pub path_id: i64,
    pub path: String,
    pub backend_name: String,
    /// For CAS backends this equals the content hash.
    pub physical_path: String,
    /// SHA-256 of the content, `None` for directories and dynamic
    /// connector entries. Doubles as the etag.
    pub content_hash: Option<String>,
    pub size: u64,
    pub mime_type: Option<String>,
    pub created_at: Timestamp,
    pub modified_at: Timestamp,
    /// Monotonic, starts at 1.
    pub current_version: u64,
    pub tenant_id: Option<String>,
    pub owner_id: Option<String>,
    pub created_by: Option<String>,
    pub deleted_at: Option<Timestamp>,
}

impl FileEntry {
    /// Fresh entry for a first write; the store assigns id and version.
    pub fn new(path: impl Into<String>, backend_name: impl Into<String>) -> Self {
        let now = Timestamp::now();
        Self {
            path_id: 0,
            path: path.into(),
            backend_name: backend_name.into(),
            physical_path: String::new(),
            content_hash: None,
            size: 0,
            mime_type: None,
            created_at: now,
            modified_at: now,
            current_version: 1,
            tenant_id: None,
            owner_id: None,
            created_by: None,
            deleted_at: None,
        }
    }

    pub fn etag(&self) -> Option<&str> {
        self.content_hash.as_deref()
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    /// Rejects entries that would corrupt the catalog.
    pub fn validate(&self) -> crate::error::NexusResult<()> {
        crate::path::normalize(&self.path)?;
        if self.backend_name.is_empty() {
            return Err(crate::error::NexusError::validation("backend_name is empty"));
        }
        Ok(())
    }
}

/// Provenance of a version-history row.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SourceType {
    Original,
    Rollback,
}

impl SourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceType::Original => "original",
            SourceType::Rollback => "rollback",
        }
    }

    pub fn parse(text: &str) -> Self {
        match text {
            "rollback" => SourceType::Rollback,
            _ => SourceType::Original,
        }
    }
}

/// Immutable record of one version of one resource.
#[derive(Debug, Clone, PartialEq)]
pub struct VersionRecord {
    pub version_id: i64,
    pub resource_id: i64,
    pub version_number: u64,
    pub content_hash: Option<String>,
    pub size: u64,
    pub mime_type: Option<String>,
    pub parent_version_id: Option<i64>,
    pub source_type: SourceType,
    pub created_at: Timestamp,
    pub created_by: Option<String>,
}

/// Kind of a sparse directory-index row.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum EntryType {
    File,
    Directory,
}

impl EntryType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryType::File => "file",
            EntryType::Directory => "directory",
        }
    }

    pub fn parse(text: &str) -> Self {
        match text {
            "directory" => EntryType::Directory,
            _ => EntryType::File,
        }
    }
}

/// One row of the sparse directory index.
#[derive(Debug, Clone, PartialEq)]
pub struct DirectoryEntry {
    pub tenant_id: String,
    pub parent_path: String,
    pub entry_name: String,
    pub entry_type: EntryType,
}

/// Opaque consistency token returned by mutations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Zookie {
    pub zone_id: String,
    pub revision: u64,
}
