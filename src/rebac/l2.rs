//! Database-backed check cache (L2).
//!
//! One row per check result with an absolute expiry. Read on L1 miss;
//! L1 is repopulated from a hit. Invalidation is predicate deletes, with
//! bulk invalidation chunked to keep statements bounded.

use std::sync::Arc;
use std::time::Duration;

use rusqlite::{params, OptionalExtension};
use tracing::debug;

use crate::error::NexusResult;
use crate::metadata::{escape_like, Db, Timestamp};

use super::Entity;

const INVALIDATION_CHUNK: usize = 100;

pub struct L2Cache {
    db: Arc<Db>,
    ttl_ms: i64,
}

impl L2Cache {
    pub fn new(db: Arc<Db>, ttl: Duration) -> Self {
        Self { db, ttl_ms: ttl.as_millis() as i64 }
    }

    pub fn get(
        &self,
        subject: &Entity,
        relation: &str,
        object: &Entity,
        zone_id: &str,
    ) -> NexusResult<Option<bool>> {
        let conn = self.db.lock()?;
        let row: Option<i64> = conn
            .query_row(
                "SELECT result FROM rebac_check_cache
                 WHERE zone_id = ?1 AND subject_type = ?2 AND subject_id = ?3
                   AND relation = ?4 AND object_type = ?5 AND object_id = ?6
                   AND expires_at > ?7",
                params![
                    zone_id,
                    subject.entity_type,
                    subject.entity_id,
                    relation,
                    object.entity_type,
                    object.entity_id,
                    Timestamp::now().0,
                ],
                |row| row.get(0),
            )
            .optional()?;
        Ok(row.map(|value| value != 0))
    }

    pub fn put(
        &self,
        subject: &Entity,
        relation: &str,
        object: &Entity,
        zone_id: &str,
        result: bool,
    ) -> NexusResult<()> {
        let expires_at = Timestamp::now().0 + self.ttl_ms;
        let conn = self.db.lock()?;
        conn.execute(
            "INSERT INTO rebac_check_cache
             (zone_id, subject_type, subject_id, relation, object_type, object_id, result, expires_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(zone_id, subject_type, subject_id, relation, object_type, object_id)
             DO UPDATE SET result = excluded.result, expires_at = excluded.expires_at",
            params![
                zone_id,
                subject.entity_type,
                subject.entity_id,
                relation,
                object.entity_type,
                object.entity_id,
                result as i64,
                expires_at,
            ],
        )?;
        Ok(())
    }

    pub fn invalidate_pair(
        &self,
        subject: &Entity,
        object: &Entity,
        zone_id: &str,
    ) -> NexusResult<()> {
        let conn = self.db.lock()?;
        conn.execute(
            "DELETE FROM rebac_check_cache
             WHERE zone_id = ?1 AND subject_type = ?2 AND subject_id = ?3
               AND object_type = ?4 AND object_id = ?5",
            params![
                zone_id,
                subject.entity_type,
                subject.entity_id,
                object.entity_type,
                object.entity_id,
            ],
        )?;
        Ok(())
    }

    pub fn invalidate_subject(&self, subject: &Entity) -> NexusResult<()> {
        let conn = self.db.lock()?;
        conn.execute(
            "DELETE FROM rebac_check_cache WHERE subject_type = ?1 AND subject_id = ?2",
            params![subject.entity_type, subject.entity_id],
        )?;
        Ok(())
    }

    pub fn invalidate_object(&self, object: &Entity) -> NexusResult<()> {
        let conn = self.db.lock()?;
        conn.execute(
            "DELETE FROM rebac_check_cache WHERE object_type = ?1 AND object_id = ?2",
            params![object.entity_type, object.entity_id],
        )?;
        Ok(())
    }

    /// Deletes rows for `object` and every object-id below it.
    pub fn invalidate_object_prefix(&self, object: &Entity) -> NexusResult<()> {
        let like = format!("{}/%", escape_like(&object.entity_id));
        let conn = self.db.lock()?;
        conn.execute(
            "DELETE FROM rebac_check_cache
             WHERE object_type = ?1 AND (object_id = ?2 OR object_id LIKE ?3 ESCAPE '\\')",
            params![object.entity_type, object.entity_id, like],
        )?;
        Ok(())
    }

    /// Bulk invalidation, chunked into bounded OR-groups.
    pub fn invalidate_objects(&self, object_type: &str, object_ids: &[String]) -> NexusResult<()> {
        let conn = self.db.lock()?;
        for chunk in object_ids.chunks(INVALIDATION_CHUNK) {
            let placeholders = vec!["?"; chunk.len()].join(", ");
            let query = format!(
                "DELETE FROM rebac_check_cache
                 WHERE object_type = ? AND object_id IN ({placeholders})"
            );
            let mut stmt = conn.prepare(&query)?;
            let mut params: Vec<&dyn rusqlite::ToSql> = vec![&object_type];
            for id in chunk {
                params.push(id);
            }
            stmt.execute(params.as_slice())?;
        }
        Ok(())
    }

    pub fn clear_zone(&self, zone_id: &str) -> NexusResult<()> {
        let conn = self.db.lock()?;
        conn.execute("DELETE FROM rebac_check_cache WHERE zone_id = ?1", [zone_id])?;
        Ok(())
    }

    pub fn clear(&self) -> NexusResult<()> {
        let conn = self.db.lock()?;
        conn.execute("DELETE FROM rebac_check_cache", [])?;
        Ok(())
    }

    /// Drops expired rows; safe to call opportunistically.
    pub fn purge_expired(&self) -> NexusResult<usize> {
        let conn = self.db.lock()?;
        let purged = conn.execute(
            "DELETE FROM rebac_check_cache WHERE expires_at <= ?1",
            [Timestamp::now().0],
        )?;
        if purged > 0 {
            debug!(purged, "purged expired check-cache rows");
        }
        Ok(purged)
    }
}
