//! Sparse directory index maintenance.
//!
//! Every mutation keeps `directory_entries` rows for each segment of the
//! touched path so `list(dir)` is O(children) without scanning the file
//! table. The index is sparse: a missing parent simply means no index
//! rows were ever written for it and listings fall back to prefix
//! queries.

use rusqlite::{params, Connection};

use crate::error::NexusResult;
use crate::path;

use super::db::escape_like;
use super::{DirectoryEntry, EntryType};

const UPSERT: &str = "INSERT INTO directory_entries (tenant_id, parent_path, entry_name, entry_type)
     VALUES (?1, ?2, ?3, ?4)
     ON CONFLICT(tenant_id, parent_path, entry_name)
     DO UPDATE SET entry_type = excluded.entry_type";

/// Upserts the leaf row for `file_path` plus a directory row per ancestor
/// segment.
pub(crate) fn upsert_for_path(
    conn: &Connection,
    tenant_id: &str,
    file_path: &str,
    entry_type: EntryType,
) -> NexusResult<()> {
    let mut stmt = conn.prepare_cached(UPSERT)?;
    let mut current = file_path.to_owned();
    let mut current_type = entry_type;
    while let (Some(parent), Some(name)) = (path::parent(&current), path::entry_name(&current)) {
        stmt.execute(params![tenant_id, parent, name, current_type.as_str()])?;
        current = parent.to_owned();
        current_type = EntryType::Directory;
    }
    Ok(())
}

/// Removes the leaf row of `file_path` for every tenant.
///
/// Intermediate directory rows are left behind; the index is sparse and
/// stale directory rows only cost a fallback query.
pub(crate) fn remove_leaf(conn: &Connection, file_path: &str) -> NexusResult<()> {
    if let (Some(parent), Some(name)) = (path::parent(file_path), path::entry_name(file_path)) {
        conn.execute(
            "DELETE FROM directory_entries WHERE parent_path = ?1 AND entry_name = ?2",
            params![parent, name],
        )?;
    }
    Ok(())
}

/// Removes every index row at or under `parent` (directory delete).
pub(crate) fn remove_recursive(conn: &Connection, parent: &str, tenant_id: Option<&str>) -> NexusResult<usize> {
    let like = format!("{}/%", escape_like(parent));
    let count = match tenant_id {
        Some(tenant) => conn.execute(
            "DELETE FROM directory_entries
             WHERE tenant_id = ?1 AND (parent_path = ?2 OR parent_path LIKE ?3 ESCAPE '\\')",
            params![tenant, parent, like],
        )?,
        None => conn.execute(
            "DELETE FROM directory_entries
             WHERE parent_path = ?1 OR parent_path LIKE ?2 ESCAPE '\\'",
            params![parent, like],
        )?,
    };
    Ok(count)
}

/// Rewrites index rows when `old` is renamed to `new`.
pub(crate) fn rename(conn: &Connection, old: &str, new: &str) -> NexusResult<()> {
    // Collect the tenants that carried the old leaf so the new leaf and
    // its ancestors appear for the same tenants.
    let mut tenants: Vec<(String, String)> = Vec::new();
    if let (Some(old_parent), Some(old_name)) = (path::parent(old), path::entry_name(old)) {
        let mut stmt = conn.prepare(
            "SELECT tenant_id, entry_type FROM directory_entries
             WHERE parent_path = ?1 AND entry_name = ?2",
        )?;
        let rows = stmt.query_map(params![old_parent, old_name], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;
        for row in rows {
            tenants.push(row?);
        }
        conn.execute(
            "DELETE FROM directory_entries WHERE parent_path = ?1 AND entry_name = ?2",
            params![old_parent, old_name],
        )?;
    }

    // Move rows inside the renamed subtree.
    let like = format!("{}/%", escape_like(old));
    conn.execute(
        "UPDATE directory_entries
         SET parent_path = ?1 || substr(parent_path, length(?2) + 1)
         WHERE parent_path = ?2 OR parent_path LIKE ?3 ESCAPE '\\'",
        params![new, old, like],
    )?;

    for (tenant, entry_type) in tenants {
        upsert_for_path(conn, &tenant, new, EntryType::parse(&entry_type))?;
    }
    Ok(())
}

/// Index rows directly under `parent`, or `None` when the index holds
/// nothing for it.
pub(crate) fn list_entries(
    conn: &Connection,
    parent: &str,
    tenant_id: &str,
) -> NexusResult<Option<Vec<DirectoryEntry>>> {
    let mut stmt = conn.prepare_cached(
        "SELECT tenant_id, parent_path, entry_name, entry_type
         FROM directory_entries
         WHERE parent_path = ?1 AND (tenant_id = ?2 OR tenant_id = 'default')
         ORDER BY entry_name",
    )?;
    let rows = stmt.query_map(params![parent, tenant_id], |row| {
        Ok(DirectoryEntry {
            tenant_id: row.get(0)?,
            parent_path: row.get(1)?,
            entry_name: row.get(2)?,
            entry_type: EntryType::parse(&row.get::<_, String>(3)?),
        })
    })?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    if out.is_empty() {
        Ok(None)
    } else {
        Ok(Some(out))
    }
}
