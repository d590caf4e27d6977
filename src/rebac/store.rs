//! Persistent tuple repository.
//!
//! Thin transactional layer over the shared database: idempotent writes,
//! cross-zone validation, cycle prevention on parent edges, batch writes
//! and rename propagation. Every mutation bumps the affected zone's
//! revision counter in the same transaction and records a changelog row.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use tracing::debug;

use crate::error::{NexusError, NexusResult};
use crate::metadata::{Db, Timestamp};

use super::{Entity, RebacTuple, CROSS_ZONE_RELATIONS};

const TUPLE_COLUMNS: &str = "tuple_id, subject_type, subject_id, subject_relation, relation, \
     object_type, object_id, zone_id, subject_zone_id, object_zone_id, expires_at, conditions, \
     created_at";

/// Identity of a tuple for idempotent writes: subject, subject relation,
/// relation, object and zone.
type NaturalKey = (String, String, Option<String>, String, String, String, String);

/// Request to create one tuple. Zone fields default to `zone_id`.
#[derive(Debug, Clone)]
pub struct TupleRequest {
    pub subject: Entity,
    pub subject_relation: Option<String>,
    pub relation: String,
    pub object: Entity,
    pub zone_id: String,
    pub subject_zone_id: Option<String>,
    pub object_zone_id: Option<String>,
    pub expires_at: Option<Timestamp>,
    pub conditions: Option<serde_json::Value>,
}

impl TupleRequest {
    pub fn new(subject: Entity, relation: impl Into<String>, object: Entity) -> Self {
        Self {
            subject,
            subject_relation: None,
            relation: relation.into(),
            object,
            zone_id: "default".to_owned(),
            subject_zone_id: None,
            object_zone_id: None,
            expires_at: None,
            conditions: None,
        }
    }

    pub fn in_zone(mut self, zone_id: impl Into<String>) -> Self {
        self.zone_id = zone_id.into();
        self
    }

    pub fn subject_zone(mut self, zone_id: impl Into<String>) -> Self {
        self.subject_zone_id = Some(zone_id.into());
        self
    }

    pub fn object_zone(mut self, zone_id: impl Into<String>) -> Self {
        self.object_zone_id = Some(zone_id.into());
        self
    }

    pub fn as_userset(mut self, subject_relation: impl Into<String>) -> Self {
        self.subject_relation = Some(subject_relation.into());
        self
    }

    pub fn expiring_at(mut self, at: Timestamp) -> Self {
        self.expires_at = Some(at);
        self
    }

    pub fn with_conditions(mut self, conditions: serde_json::Value) -> Self {
        self.conditions = Some(conditions);
        self
    }

    fn subject_zone_or_default(&self) -> &str {
        self.subject_zone_id.as_deref().unwrap_or(&self.zone_id)
    }

    fn object_zone_or_default(&self) -> &str {
        self.object_zone_id.as_deref().unwrap_or(&self.zone_id)
    }
}

/// Filter for [`RebacStore::list_tuples`].
#[derive(Debug, Clone, Default)]
pub struct TupleFilter {
    pub subject: Option<Entity>,
    pub relation: Option<String>,
    pub object: Option<Entity>,
    pub zone_id: Option<String>,
}

pub struct RebacStore {
    db: Arc<Db>,
    max_traversal_depth: u32,
    sweep_interval_ms: i64,
    last_sweep_ms: AtomicI64,
}

impl RebacStore {
    pub fn new(db: Arc<Db>, max_traversal_depth: u32, sweep_interval_secs: u64) -> Self {
        Self {
            db,
            max_traversal_depth,
            sweep_interval_ms: (sweep_interval_secs.max(1) * 1000) as i64,
            last_sweep_ms: AtomicI64::new(0),
        }
    }

    fn map_tuple(row: &Row<'_>) -> rusqlite::Result<RebacTuple> {
        let conditions: Option<String> = row.get(11)?;
        Ok(RebacTuple {
            tuple_id: row.get(0)?,
            subject: Entity::new(row.get::<_, String>(1)?, row.get::<_, String>(2)?),
            subject_relation: row.get(3)?,
            relation: row.get(4)?,
            object: Entity::new(row.get::<_, String>(5)?, row.get::<_, String>(6)?),
            zone_id: row.get(7)?,
            subject_zone_id: row.get(8)?,
            object_zone_id: row.get(9)?,
            expires_at: row.get::<_, Option<i64>>(10)?.map(Timestamp),
            conditions: conditions.and_then(|text| serde_json::from_str(&text).ok()),
            created_at: Timestamp(row.get(12)?),
        })
    }

    fn validate_cross_zone(request: &TupleRequest) -> NexusResult<()> {
        let crosses = request.subject_zone_or_default() != request.zone_id
            || request.object_zone_or_default() != request.zone_id;
        if crosses && !CROSS_ZONE_RELATIONS.contains(&request.relation.as_str()) {
            return Err(NexusError::validation(format!(
                "relation '{}' may not cross zones",
                request.relation
            )));
        }
        Ok(())
    }

    /// DFS over parent edges starting at `from`; errors when `target` is
    /// reachable (the new edge would close a cycle).
    fn ensure_acyclic(
        conn: &Connection,
        from: &Entity,
        target: &Entity,
        zone_id: &str,
        max_depth: u32,
    ) -> NexusResult<()> {
        let mut stack = vec![(from.clone(), 0u32)];
        let mut seen: Vec<Entity> = Vec::new();
        while let Some((node, depth)) = stack.pop() {
            if node == *target {
                return Err(NexusError::validation(format!(
                    "parent edge {target} -> {from} would create a cycle"
                )));
            }
            if depth >= max_depth || seen.contains(&node) {
                continue;
            }
            seen.push(node.clone());
            let mut stmt = conn.prepare_cached(
                "SELECT object_type, object_id FROM rebac_tuples
                 WHERE subject_type = ?1 AND subject_id = ?2 AND relation = 'parent'
                   AND zone_id = ?3",
            )?;
            let rows = stmt.query_map(params![node.entity_type, node.entity_id, zone_id], |row| {
                Ok(Entity::new(row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?;
            for row in rows {
                stack.push((row?, depth + 1));
            }
        }
        Ok(())
    }

    fn find_existing(conn: &Connection, request: &TupleRequest) -> NexusResult<Option<i64>> {
        Ok(conn
            .query_row(
                "SELECT tuple_id FROM rebac_tuples
                 WHERE subject_type = ?1 AND subject_id = ?2 AND subject_relation IS ?3
                   AND relation = ?4 AND object_type = ?5 AND object_id = ?6 AND zone_id = ?7",
                params![
                    request.subject.entity_type,
                    request.subject.entity_id,
                    request.subject_relation,
                    request.relation,
                    request.object.entity_type,
                    request.object.entity_id,
                    request.zone_id,
                ],
                |row| row.get(0),
            )
            .optional()?)
    }

    fn insert_on(conn: &Connection, request: &TupleRequest, now: Timestamp) -> NexusResult<i64> {
        let conditions = request
            .conditions
            .as_ref()
            .map(|value| serde_json::to_string(value))
            .transpose()
            .map_err(|err| NexusError::validation(format!("unserializable conditions: {err}")))?;
        conn.execute(
            "INSERT INTO rebac_tuples
             (subject_type, subject_id, subject_relation, relation, object_type, object_id,
              zone_id, subject_zone_id, object_zone_id, expires_at, conditions, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                request.subject.entity_type,
                request.subject.entity_id,
                request.subject_relation,
                request.relation,
                request.object.entity_type,
                request.object.entity_id,
                request.zone_id,
                request.subject_zone_or_default(),
                request.object_zone_or_default(),
                request.expires_at.map(|t| t.0),
                conditions,
                now.0,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    fn log_change(
        conn: &Connection,
        tuple_id: i64,
        change_type: &str,
        zone_id: &str,
        details: Option<String>,
        now: Timestamp,
    ) -> NexusResult<()> {
        conn.execute(
            "INSERT INTO rebac_changelog (tuple_id, change_type, zone_id, details, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![tuple_id, change_type, zone_id, details, now.0],
        )?;
        Ok(())
    }

    /// Creates a tuple, or returns the existing id when the natural key
    /// is already present.
    pub fn create(&self, request: &TupleRequest) -> NexusResult<i64> {
        Self::validate_cross_zone(request)?;
        let mut conn = self.db.lock()?;
        let tx = conn.transaction()?;
        if let Some(existing) = Self::find_existing(&tx, request)? {
            return Ok(existing);
        }
        if request.relation == "parent" {
            Self::ensure_acyclic(
                &tx,
                &request.object,
                &request.subject,
                &request.zone_id,
                self.max_traversal_depth,
            )?;
        }
        let now = Timestamp::now();
        let tuple_id = Self::insert_on(&tx, request, now)?;
        Self::log_change(&tx, tuple_id, "create", &request.zone_id, None, now)?;
        Db::bump_revision_on(&tx, &request.zone_id)?;
        if request.subject_zone_or_default() != request.zone_id {
            Db::bump_revision_on(&tx, request.subject_zone_or_default())?;
        }
        tx.commit()?;
        Ok(tuple_id)
    }

    /// Natural key of a tuple; the uniqueness domain for idempotence.
    fn natural_key(request: &TupleRequest) -> NaturalKey {
        (
            request.subject.entity_type.clone(),
            request.subject.entity_id.clone(),
            request.subject_relation.clone(),
            request.relation.clone(),
            request.object.entity_type.clone(),
            request.object.entity_id.clone(),
            request.zone_id.clone(),
        )
    }

    /// One IN-list probe over every requested natural key. The nullable
    /// `subject_relation` cannot participate in a row-value IN, so rows
    /// matching the six concrete columns come back with it and the exact
    /// match happens on the key.
    fn probe_existing(
        conn: &Connection,
        requests: &[TupleRequest],
    ) -> NexusResult<HashMap<NaturalKey, i64>> {
        let mut rows_sql = Vec::with_capacity(requests.len());
        let mut values: Vec<SqlValue> = Vec::with_capacity(requests.len() * 6);
        for request in requests {
            rows_sql.push("(?, ?, ?, ?, ?, ?)");
            values.push(SqlValue::from(request.subject.entity_type.clone()));
            values.push(SqlValue::from(request.subject.entity_id.clone()));
            values.push(SqlValue::from(request.relation.clone()));
            values.push(SqlValue::from(request.object.entity_type.clone()));
            values.push(SqlValue::from(request.object.entity_id.clone()));
            values.push(SqlValue::from(request.zone_id.clone()));
        }
        let query = format!(
            "SELECT tuple_id, subject_type, subject_id, subject_relation, relation,
                    object_type, object_id, zone_id
             FROM rebac_tuples
             WHERE (subject_type, subject_id, relation, object_type, object_id, zone_id)
                   IN (VALUES {})",
            rows_sql.join(", ")
        );
        let mut stmt = conn.prepare(&query)?;
        let rows = stmt.query_map(params_from_iter(values), |row| {
            Ok((
                (
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, Option<String>>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, String>(6)?,
                    row.get::<_, String>(7)?,
                ),
                row.get::<_, i64>(0)?,
            ))
        })?;
        let mut out = HashMap::new();
        for row in rows {
            let (key, id) = row?;
            out.insert(key, id);
        }
        Ok(out)
    }

    /// Batch write: one IN-list existence probe, bulk inserts and
    /// changelog appends through prepared statements, one revision bump
    /// per affected zone (the subject's zone included for cross-zone
    /// tuples, as in [`RebacStore::create`]).
    pub fn write_batch(&self, requests: &[TupleRequest]) -> NexusResult<Vec<i64>> {
        if requests.is_empty() {
            return Ok(Vec::new());
        }
        for request in requests {
            Self::validate_cross_zone(request)?;
        }
        let mut conn = self.db.lock()?;
        let tx = conn.transaction()?;
        let now = Timestamp::now();

        let mut existing = Self::probe_existing(&tx, requests)?;

        let mut ids = Vec::with_capacity(requests.len());
        let mut zones: Vec<String> = Vec::new();
        {
            let mut insert = tx.prepare_cached(
                "INSERT INTO rebac_tuples
                 (subject_type, subject_id, subject_relation, relation, object_type, object_id,
                  zone_id, subject_zone_id, object_zone_id, expires_at, conditions, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            )?;
            let mut log = tx.prepare_cached(
                "INSERT INTO rebac_changelog (tuple_id, change_type, zone_id, details, created_at)
                 VALUES (?1, 'create', ?2, NULL, ?3)",
            )?;
            for request in requests {
                let key = Self::natural_key(request);
                if let Some(id) = existing.get(&key) {
                    ids.push(*id);
                    continue;
                }
                if request.relation == "parent" {
                    Self::ensure_acyclic(
                        &tx,
                        &request.object,
                        &request.subject,
                        &request.zone_id,
                        self.max_traversal_depth,
                    )?;
                }
                let conditions = request
                    .conditions
                    .as_ref()
                    .map(|value| serde_json::to_string(value))
                    .transpose()
                    .map_err(|err| {
                        NexusError::validation(format!("unserializable conditions: {err}"))
                    })?;
                insert.execute(params![
                    request.subject.entity_type,
                    request.subject.entity_id,
                    request.subject_relation,
                    request.relation,
                    request.object.entity_type,
                    request.object.entity_id,
                    request.zone_id,
                    request.subject_zone_or_default(),
                    request.object_zone_or_default(),
                    request.expires_at.map(|t| t.0),
                    conditions,
                    now.0,
                ])?;
                let id = tx.last_insert_rowid();
                log.execute(params![id, request.zone_id, now.0])?;
                ids.push(id);
                // A later duplicate of the same key reuses this row.
                existing.insert(key, id);
                if !zones.contains(&request.zone_id) {
                    zones.push(request.zone_id.clone());
                }
                let subject_zone = request.subject_zone_or_default();
                if subject_zone != request.zone_id && !zones.iter().any(|z| z == subject_zone) {
                    zones.push(subject_zone.to_owned());
                }
            }
        }
        for zone in &zones {
            Db::bump_revision_on(&tx, zone)?;
        }
        tx.commit()?;
        Ok(ids)
    }

    pub fn get(&self, tuple_id: i64) -> NexusResult<Option<RebacTuple>> {
        let conn = self.db.lock()?;
        let query = format!("SELECT {TUPLE_COLUMNS} FROM rebac_tuples WHERE tuple_id = ?1");
        Ok(conn.query_row(&query, [tuple_id], Self::map_tuple).optional()?)
    }

    /// Deletes a tuple, returning the removed row for cache invalidation.
    pub fn delete(&self, tuple_id: i64) -> NexusResult<Option<RebacTuple>> {
        let mut conn = self.db.lock()?;
        let tx = conn.transaction()?;
        let query = format!("SELECT {TUPLE_COLUMNS} FROM rebac_tuples WHERE tuple_id = ?1");
        let Some(tuple) = tx.query_row(&query, [tuple_id], Self::map_tuple).optional()? else {
            return Ok(None);
        };
        tx.execute("DELETE FROM rebac_tuples WHERE tuple_id = ?1", [tuple_id])?;
        let now = Timestamp::now();
        Self::log_change(&tx, tuple_id, "delete", &tuple.zone_id, None, now)?;
        Db::bump_revision_on(&tx, &tuple.zone_id)?;
        if tuple.subject_zone_id != tuple.zone_id {
            Db::bump_revision_on(&tx, &tuple.subject_zone_id)?;
        }
        tx.commit()?;
        Ok(Some(tuple))
    }

    /// Id of the tuple matching the natural key, if present.
    pub fn find_tuple_id(
        &self,
        subject: &Entity,
        relation: &str,
        object: &Entity,
        zone_id: &str,
    ) -> NexusResult<Option<i64>> {
        let conn = self.db.lock()?;
        Ok(conn
            .query_row(
                "SELECT tuple_id FROM rebac_tuples
                 WHERE subject_type = ?1 AND subject_id = ?2 AND subject_relation IS NULL
                   AND relation = ?3 AND object_type = ?4 AND object_id = ?5 AND zone_id = ?6",
                params![
                    subject.entity_type,
                    subject.entity_id,
                    relation,
                    object.entity_type,
                    object.entity_id,
                    zone_id,
                ],
                |row| row.get(0),
            )
            .optional()?)
    }

    pub fn list_tuples(&self, filter: &TupleFilter) -> NexusResult<Vec<RebacTuple>> {
        let mut clause = String::from("(expires_at IS NULL OR expires_at > ?)");
        let mut params: Vec<SqlValue> = vec![SqlValue::from(Timestamp::now().0)];
        if let Some(subject) = &filter.subject {
            clause.push_str(" AND subject_type = ? AND subject_id = ?");
            params.push(SqlValue::from(subject.entity_type.clone()));
            params.push(SqlValue::from(subject.entity_id.clone()));
        }
        if let Some(relation) = &filter.relation {
            clause.push_str(" AND relation = ?");
            params.push(SqlValue::from(relation.clone()));
        }
        if let Some(object) = &filter.object {
            clause.push_str(" AND object_type = ? AND object_id = ?");
            params.push(SqlValue::from(object.entity_type.clone()));
            params.push(SqlValue::from(object.entity_id.clone()));
        }
        if let Some(zone) = &filter.zone_id {
            clause.push_str(" AND zone_id = ?");
            params.push(SqlValue::from(zone.clone()));
        }
        let query = format!(
            "SELECT {TUPLE_COLUMNS} FROM rebac_tuples WHERE {clause} ORDER BY tuple_id"
        );
        let conn = self.db.lock()?;
        let mut stmt = conn.prepare(&query)?;
        let rows = stmt.query_map(params_from_iter(params), Self::map_tuple)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Non-expired tuples carrying `relation` on `object` in `zone`,
    /// including cross-zone shares targeting that object.
    pub fn tuples_on_object(
        &self,
        relation: &str,
        object: &Entity,
        zone_id: &str,
    ) -> NexusResult<Vec<RebacTuple>> {
        let conn = self.db.lock()?;
        let query = format!(
            "SELECT {TUPLE_COLUMNS} FROM rebac_tuples
             WHERE relation = ?1 AND object_type = ?2 AND object_id = ?3
               AND (zone_id = ?4 OR object_zone_id = ?4)
               AND (expires_at IS NULL OR expires_at > ?5)"
        );
        let mut stmt = conn.prepare_cached(&query)?;
        let rows = stmt.query_map(
            params![relation, object.entity_type, object.entity_id, zone_id, Timestamp::now().0],
            Self::map_tuple,
        )?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Non-expired tuples whose subject is `subject` carrying `relation`.
    pub fn tuples_with_subject(
        &self,
        subject: &Entity,
        relation: &str,
        zone_id: &str,
    ) -> NexusResult<Vec<RebacTuple>> {
        let conn = self.db.lock()?;
        let query = format!(
            "SELECT {TUPLE_COLUMNS} FROM rebac_tuples
             WHERE subject_type = ?1 AND subject_id = ?2 AND subject_relation IS NULL
               AND relation = ?3 AND zone_id = ?4
               AND (expires_at IS NULL OR expires_at > ?5)"
        );
        let mut stmt = conn.prepare_cached(&query)?;
        let rows = stmt.query_map(
            params![subject.entity_type, subject.entity_id, relation, zone_id, Timestamp::now().0],
            Self::map_tuple,
        )?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Full non-expired tuple snapshot of a zone, for bulk checks.
    pub fn load_snapshot(&self, zone_id: &str) -> NexusResult<Vec<RebacTuple>> {
        let conn = self.db.lock()?;
        let query = format!(
            "SELECT {TUPLE_COLUMNS} FROM rebac_tuples
             WHERE (zone_id = ?1 OR subject_zone_id = ?1 OR object_zone_id = ?1)
               AND (expires_at IS NULL OR expires_at > ?2)"
        );
        let mut stmt = conn.prepare(&query)?;
        let rows = stmt.query_map(params![zone_id, Timestamp::now().0], Self::map_tuple)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Rewrites object and subject ids after a rename, one changelog row
    /// per changed tuple. Descendants move too when `is_directory`.
    pub fn update_object_path(
        &self,
        old: &str,
        new: &str,
        object_type: &str,
        is_directory: bool,
    ) -> NexusResult<usize> {
        let mut conn = self.db.lock()?;
        let tx = conn.transaction()?;
        let now = Timestamp::now();
        let like = format!("{}/%", crate::metadata::escape_like(old));

        let collect_ids = |conn: &Connection, column: &str| -> NexusResult<Vec<(i64, String)>> {
            let query = format!(
                "SELECT tuple_id, zone_id FROM rebac_tuples
                 WHERE {column}_type = ?1 AND ({column}_id = ?2 OR (?3 AND {column}_id LIKE ?4 ESCAPE '\\'))"
            );
            let mut stmt = conn.prepare(&query)?;
            let rows = stmt.query_map(params![object_type, old, is_directory, like], |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
            })?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            Ok(out)
        };

        let object_hits = collect_ids(&tx, "object")?;
        let subject_hits = collect_ids(&tx, "subject")?;

        for column in ["object", "subject"] {
            let query = format!(
                "UPDATE rebac_tuples
                 SET {column}_id = CASE WHEN {column}_id = ?1
                         THEN ?2
                         ELSE ?2 || substr({column}_id, length(?1) + 1) END
                 WHERE {column}_type = ?3
                   AND ({column}_id = ?1 OR (?4 AND {column}_id LIKE ?5 ESCAPE '\\'))"
            );
            tx.execute(&query, params![old, new, object_type, is_directory, like])?;
        }

        let mut zones: Vec<String> = Vec::new();
        let details = Some(format!("{old} -> {new}"));
        for (tuple_id, zone) in object_hits.iter().chain(subject_hits.iter()) {
            Self::log_change(&tx, *tuple_id, "rename", zone, details.clone(), now)?;
            if !zones.contains(zone) {
                zones.push(zone.clone());
            }
        }
        for zone in &zones {
            Db::bump_revision_on(&tx, zone)?;
        }
        tx.commit()?;
        Ok(object_hits.len() + subject_hits.len())
    }

    /// Deletes expired tuples, throttled to one sweep per interval.
    /// Returns the removed tuples so caches can be invalidated.
    pub fn sweep_expired(&self) -> NexusResult<Vec<RebacTuple>> {
        let now = Timestamp::now();
        let last = self.last_sweep_ms.load(Ordering::Relaxed);
        if now.0 - last < self.sweep_interval_ms {
            return Ok(Vec::new());
        }
        if self
            .last_sweep_ms
            .compare_exchange(last, now.0, Ordering::Relaxed, Ordering::Relaxed)
            .is_err()
        {
            return Ok(Vec::new());
        }

        let mut conn = self.db.lock()?;
        let tx = conn.transaction()?;
        let query = format!(
            "SELECT {TUPLE_COLUMNS} FROM rebac_tuples
             WHERE expires_at IS NOT NULL AND expires_at <= ?1"
        );
        let expired: Vec<RebacTuple> = {
            let mut stmt = tx.prepare(&query)?;
            let rows = stmt.query_map([now.0], Self::map_tuple)?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            out
        };
        if expired.is_empty() {
            return Ok(expired);
        }
        tx.execute(
            "DELETE FROM rebac_tuples WHERE expires_at IS NOT NULL AND expires_at <= ?1",
            [now.0],
        )?;
        let mut zones: Vec<String> = Vec::new();
        for tuple in &expired {
            Self::log_change(&tx, tuple.tuple_id, "expire", &tuple.zone_id, None, now)?;
            if !zones.contains(&tuple.zone_id) {
                zones.push(tuple.zone_id.clone());
            }
        }
        for zone in &zones {
            Db::bump_revision_on(&tx, zone)?;
        }
        tx.commit()?;
        debug!(count = expired.len(), "swept expired tuples");
        Ok(expired)
    }

    /// Ancestors of `node` along parent edges, nearest first; feeds
    /// explain traces.
    pub fn parent_ancestors(&self, node: &Entity, zone_id: &str) -> NexusResult<Vec<Entity>> {
        let mut out = Vec::new();
        let mut current = node.clone();
        for _ in 0..self.max_traversal_depth {
            let parents = self.tuples_with_subject(&current, "parent", zone_id)?;
            let Some(parent) = parents.into_iter().next() else {
                break;
            };
            if out.contains(&parent.object) {
                break;
            }
            out.push(parent.object.clone());
            current = parent.object;
        }
        Ok(out)
    }

    pub fn changelog_len(&self) -> NexusResult<u64> {
        let conn = self.db.lock()?;
        let count: i64 =
            conn.query_row("SELECT COUNT(*) FROM rebac_changelog", [], |row| row.get(0))?;
        Ok(count as u64)
    }
}
