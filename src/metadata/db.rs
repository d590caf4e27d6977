//! Shared embedded-database handle.
//!
//! One connection behind a mutex; the metadata store and the ReBAC tuple
//! store share it so a tuple mutation and its zone-revision bump commit in
//! the same transaction.

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use rusqlite::Connection;

use crate::error::{NexusError, NexusResult};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS file_paths (
    path_id         INTEGER PRIMARY KEY AUTOINCREMENT,
    virtual_path    TEXT NOT NULL,
    backend_id      TEXT NOT NULL,
    physical_path   TEXT NOT NULL DEFAULT '',
    content_hash    TEXT,
    size_bytes      INTEGER NOT NULL DEFAULT 0,
    mime_type       TEXT,
    created_at      INTEGER NOT NULL,
    updated_at      INTEGER NOT NULL,
    current_version INTEGER NOT NULL DEFAULT 1,
    tenant_id       TEXT,
    owner_id        TEXT,
    created_by      TEXT,
    deleted_at      INTEGER
);
CREATE UNIQUE INDEX IF NOT EXISTS idx_file_paths_live
    ON file_paths(virtual_path) WHERE deleted_at IS NULL;
CREATE INDEX IF NOT EXISTS idx_file_paths_tenant ON file_paths(tenant_id);

CREATE TABLE IF NOT EXISTS version_history (
    version_id        INTEGER PRIMARY KEY AUTOINCREMENT,
    resource_type     TEXT NOT NULL DEFAULT 'file',
    resource_id       INTEGER NOT NULL,
    version_number    INTEGER NOT NULL,
    content_hash      TEXT,
    size_bytes        INTEGER NOT NULL DEFAULT 0,
    mime_type         TEXT,
    parent_version_id INTEGER,
    source_type       TEXT NOT NULL DEFAULT 'original',
    created_at        INTEGER NOT NULL,
    created_by        TEXT,
    UNIQUE(resource_type, resource_id, version_number)
);

CREATE TABLE IF NOT EXISTS directory_entries (
    tenant_id   TEXT NOT NULL DEFAULT 'default',
    parent_path TEXT NOT NULL,
    entry_name  TEXT NOT NULL,
    entry_type  TEXT NOT NULL,
    PRIMARY KEY (tenant_id, parent_path, entry_name)
);

CREATE TABLE IF NOT EXISTS file_attributes (
    entry_id   INTEGER NOT NULL,
    attr_key   TEXT NOT NULL,
    attr_value TEXT NOT NULL,
    PRIMARY KEY (entry_id, attr_key)
);

CREATE TABLE IF NOT EXISTS content_cache (
    entry_id     INTEGER PRIMARY KEY,
    content_text TEXT,
    stale        INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS zone_revisions (
    zone_id  TEXT PRIMARY KEY,
    revision INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS rebac_tuples (
    tuple_id         INTEGER PRIMARY KEY AUTOINCREMENT,
    subject_type     TEXT NOT NULL,
    subject_id       TEXT NOT NULL,
    subject_relation TEXT,
    relation         TEXT NOT NULL,
    object_type      TEXT NOT NULL,
    object_id        TEXT NOT NULL,
    zone_id          TEXT NOT NULL,
    subject_zone_id  TEXT NOT NULL,
    object_zone_id   TEXT NOT NULL,
    expires_at       INTEGER,
    conditions       TEXT,
    created_at       INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_rebac_object
    ON rebac_tuples(object_type, object_id, relation);
CREATE INDEX IF NOT EXISTS idx_rebac_subject
    ON rebac_tuples(subject_type, subject_id);

CREATE TABLE IF NOT EXISTS rebac_changelog (
    change_id   INTEGER PRIMARY KEY AUTOINCREMENT,
    tuple_id    INTEGER NOT NULL,
    change_type TEXT NOT NULL,
    zone_id     TEXT NOT NULL,
    details     TEXT,
    created_at  INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS rebac_check_cache (
    zone_id      TEXT NOT NULL,
    subject_type TEXT NOT NULL,
    subject_id   TEXT NOT NULL,
    relation     TEXT NOT NULL,
    object_type  TEXT NOT NULL,
    object_id    TEXT NOT NULL,
    result       INTEGER NOT NULL,
    expires_at   INTEGER NOT NULL,
    PRIMARY KEY (zone_id, subject_type, subject_id, relation, object_type, object_id)
);
";

/// Mutex-guarded embedded database shared by the catalog and tuple store.
pub struct Db {
    conn: Mutex<Connection>,
}

impl Db {
    /// In-memory database, used by tests and ephemeral instances.
    pub fn open_in_memory() -> NexusResult<Arc<Self>> {
        let conn = Connection::open_in_memory()?;
        Self::init(conn)
    }

    /// File-backed database; WAL mode for concurrent readers.
    pub fn open(path: impl AsRef<Path>) -> NexusResult<Arc<Self>> {
        let conn = Connection::open(path)?;
        // journal_mode returns the resulting mode as a row.
        let _mode: String = conn.query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> NexusResult<Arc<Self>> {
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        conn.execute_batch(SCHEMA)?;
        Ok(Arc::new(Self { conn: Mutex::new(conn) }))
    }

    /// Exclusive access to the connection.
    pub fn lock(&self) -> NexusResult<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| NexusError::metadata("database mutex poisoned"))
    }

    /// Atomically bumps and returns a zone's revision counter.
    ///
    /// Callers already holding the connection run the same statement via
    /// [`Db::bump_revision_on`] so the bump joins their transaction.
    pub fn increment_revision(&self, zone_id: &str) -> NexusResult<u64> {
        let conn = self.lock()?;
        Self::bump_revision_on(&conn, zone_id)
    }

    pub fn bump_revision_on(conn: &Connection, zone_id: &str) -> NexusResult<u64> {
        let revision: i64 = conn.query_row(
            "INSERT INTO zone_revisions (zone_id, revision) VALUES (?1, 1)
             ON CONFLICT(zone_id) DO UPDATE SET revision = revision + 1
             RETURNING revision",
            [zone_id],
            |row| row.get(0),
        )?;
        Ok(revision as u64)
    }

    /// Current revision of a zone; zones never written are at 0.
    pub fn get_revision(&self, zone_id: &str) -> NexusResult<u64> {
        let conn = self.lock()?;
        let revision: Option<i64> = conn
            .query_row(
                "SELECT revision FROM zone_revisions WHERE zone_id = ?1",
                [zone_id],
                |row| row.get(0),
            )
            .map(Some)
            .or_else(|err| match err {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })?;
        Ok(revision.unwrap_or(0) as u64)
    }
}

/// Escapes `%` and `_` for use inside a LIKE pattern with `ESCAPE '\'`.
pub fn escape_like(text: &str) -> String {
    text.replace('\\', "\\\\").replace('%', "\\%").replace('_', "\\_")
}
