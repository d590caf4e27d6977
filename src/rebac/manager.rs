//! ReBAC orchestration: repository + computer + L1 + L2.
//!
//! `check` is the hot path: revision-bucketed L1 first, then L2, then a
//! graph walk under single-flight. Tuple mutations apply the
//! invalidation policy before returning, so a caller that just changed a
//! tuple observes the change on its next check with no explicit flush.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde_json::Value;
use tracing::{debug, warn};

use crate::config::RebacConfig;
use crate::error::NexusResult;
use crate::metadata::Db;

use super::cache::{CachedHit, CheckKey, ComputeSlot, L1Cache};
use super::compute::{PermissionComputer, TraceStep, TupleSnapshot};
use super::grants::GrantIndex;
use super::l2::L2Cache;
use super::namespace::NamespaceRegistry;
use super::store::{RebacStore, TupleFilter, TupleRequest};
use super::{Entity, RebacTuple, FILE_ACCESS_RELATIONS, MEMBERSHIP_RELATIONS};

/// Column-level read policy for one (subject, path) pair.
#[derive(Debug, Clone, Default)]
pub struct ColumnConfig {
    /// When set, only these columns survive projection.
    pub visible_columns: Option<Vec<String>>,
    /// Columns whose values are replaced by `mask`.
    pub masked_columns: Vec<String>,
    pub mask: String,
}

/// Result of `rebac_explain`.
#[derive(Debug, Clone)]
pub struct Explanation {
    pub result: bool,
    pub cached: bool,
    pub reason: String,
    pub paths: Vec<TraceStep>,
    pub successful_path: Option<TraceStep>,
}

pub struct RebacManager {
    store: Arc<RebacStore>,
    computer: Arc<PermissionComputer>,
    l1: Arc<L1Cache>,
    l2: Arc<L2Cache>,
    namespaces: Arc<NamespaceRegistry>,
    db: Arc<Db>,
    grants: GrantIndex,
    dynamic_viewers: DashMap<(String, String, String), ColumnConfig>,
    revision_window: u64,
    eager_recompute_limit: usize,
    follower_timeout: Duration,
}

impl RebacManager {
    pub fn new(db: Arc<Db>, config: &RebacConfig) -> Self {
        let namespaces = Arc::new(NamespaceRegistry::with_defaults());
        let store = Arc::new(RebacStore::new(
            Arc::clone(&db),
            config.max_depth,
            config.sweep_interval_secs,
        ));
        let computer = Arc::new(PermissionComputer::new(
            Arc::clone(&namespaces),
            config.max_depth,
            config.max_fanout,
        ));
        let ttl = Duration::from_secs(config.cache_ttl_secs.max(1));
        Self {
            store,
            computer,
            l1: Arc::new(L1Cache::new(
                config.l1_capacity,
                ttl,
                config.refresh_ahead_beta,
                config.xfetch_enabled,
            )),
            l2: Arc::new(L2Cache::new(Arc::clone(&db), ttl)),
            namespaces,
            db,
            grants: GrantIndex::new(),
            dynamic_viewers: DashMap::new(),
            revision_window: config.revision_window.max(1),
            eager_recompute_limit: config.eager_recompute_limit,
            follower_timeout: Duration::from_secs(5),
        }
    }

    pub fn namespaces(&self) -> &NamespaceRegistry {
        &self.namespaces
    }

    pub fn grants(&self) -> &GrantIndex {
        &self.grants
    }

    pub fn store(&self) -> &RebacStore {
        &self.store
    }

    fn check_key(
        &self,
        subject: &Entity,
        permission: &str,
        object: &Entity,
        zone_id: &str,
    ) -> NexusResult<CheckKey> {
        let revision = self.db.get_revision(zone_id)?;
        let bucket = revision / self.revision_window;
        Ok(CheckKey::new(bucket, zone_id, subject, permission, object))
    }

    /// Does `subject` hold `permission` on `object` in `zone_id`?
    pub fn check(
        &self,
        subject: &Entity,
        permission: &str,
        object: &Entity,
        zone_id: &str,
        context: Option<&Value>,
    ) -> NexusResult<bool> {
        self.sweep_expired()?;
        let key = self.check_key(subject, permission, object, zone_id)?;

        if let Some(CachedHit { result, should_refresh }) = self.l1.get(&key) {
            if should_refresh {
                self.spawn_refresh(key, context.cloned());
            }
            return Ok(result);
        }

        match self.l1.try_acquire_compute(&key) {
            ComputeSlot::Leader => {
                let outcome = self.compute_and_fill(&key, subject, permission, object, zone_id, context);
                match outcome {
                    Ok(result) => {
                        self.l1.publish_compute(&key, result);
                        Ok(result)
                    }
                    Err(err) => {
                        self.l1.cancel_compute(&key);
                        Err(err)
                    }
                }
            }
            ComputeSlot::Follower(state) => {
                if let Some(result) = self.l1.wait_for_compute(&state, self.follower_timeout) {
                    return Ok(result);
                }
                // Leader failed or timed out; compute locally.
                self.computer.check(
                    self.store.as_ref(),
                    subject,
                    permission,
                    object,
                    zone_id,
                    context,
                )
            }
        }
    }

    fn compute_and_fill(
        &self,
        key: &CheckKey,
        subject: &Entity,
        permission: &str,
        object: &Entity,
        zone_id: &str,
        context: Option<&Value>,
    ) -> NexusResult<bool> {
        if let Some(cached) = self.l2.get(subject, permission, object, zone_id)? {
            self.l1.insert(key.clone(), cached, Duration::ZERO);
            return Ok(cached);
        }
        let started = Instant::now();
        let result = self.computer.check(
            self.store.as_ref(),
            subject,
            permission,
            object,
            zone_id,
            context,
        )?;
        let delta = started.elapsed();
        self.l1.insert(key.clone(), result, delta);
        self.l2.put(subject, permission, object, zone_id, result)?;
        Ok(result)
    }

    /// Serves the stale value while a thread recomputes and overwrites.
    fn spawn_refresh(&self, key: CheckKey, context: Option<Value>) {
        let store = Arc::clone(&self.store);
        let computer = Arc::clone(&self.computer);
        let l1 = Arc::clone(&self.l1);
        let key_for_failure = key.clone();
        let spawned = std::thread::Builder::new()
            .name("rebac-refresh".to_owned())
            .spawn(move || {
                let subject = Entity::new(key.subject_type.clone(), key.subject_id.clone());
                let object = Entity::new(key.object_type.clone(), key.object_id.clone());
                let started = Instant::now();
                match computer.check(
                    store.as_ref(),
                    &subject,
                    &key.relation,
                    &object,
                    &key.zone_id,
                    context.as_ref(),
                ) {
                    Ok(result) => l1.complete_refresh(key, result, started.elapsed()),
                    Err(err) => {
                        warn!(error = %err, "refresh-ahead recompute failed");
                        l1.abandon_refresh(&key);
                    }
                }
            });
        if let Err(err) = spawned {
            warn!(error = %err, "could not spawn refresh-ahead thread");
            self.l1.abandon_refresh(&key_for_failure);
        }
    }

    /// Bulk check over one tuple snapshot: one store scan, N walks.
    pub fn check_bulk(
        &self,
        checks: &[(Entity, String, Entity)],
        zone_id: &str,
        context: Option<&Value>,
    ) -> NexusResult<Vec<bool>> {
        self.sweep_expired()?;
        let mut results: Vec<Option<bool>> = Vec::with_capacity(checks.len());
        let mut keys = Vec::with_capacity(checks.len());
        for (subject, permission, object) in checks {
            let key = self.check_key(subject, permission, object, zone_id)?;
            results.push(self.l1.get(&key).map(|hit| hit.result));
            keys.push(key);
        }
        if results.iter().all(Option::is_some) {
            return Ok(results.into_iter().flatten().collect());
        }

        let snapshot = TupleSnapshot::new(self.store.load_snapshot(zone_id)?);
        let mut out = Vec::with_capacity(checks.len());
        for (index, (subject, permission, object)) in checks.iter().enumerate() {
            match results[index] {
                Some(result) => out.push(result),
                None => {
                    let started = Instant::now();
                    let result = self
                        .computer
                        .check(&snapshot, subject, permission, object, zone_id, context)?;
                    self.l1.insert(keys[index].clone(), result, started.elapsed());
                    out.push(result);
                }
            }
        }
        Ok(out)
    }

    /// Subjects holding `relation` on `object`.
    pub fn expand(
        &self,
        relation: &str,
        object: &Entity,
        zone_id: &str,
    ) -> NexusResult<Vec<Entity>> {
        self.computer.expand(self.store.as_ref(), relation, object, zone_id)
    }

    /// Traces every path considered for a check.
    pub fn explain(
        &self,
        subject: &Entity,
        permission: &str,
        object: &Entity,
        zone_id: &str,
        context: Option<&Value>,
    ) -> NexusResult<Explanation> {
        self.sweep_expired()?;
        let key = self.check_key(subject, permission, object, zone_id)?;
        let cached = self.l1.get(&key).map(|hit| hit.result);

        let mut paths = Vec::new();
        let result = self.computer.check_with_trace(
            self.store.as_ref(),
            subject,
            permission,
            object,
            zone_id,
            context,
            &mut paths,
        )?;
        let successful_path = paths.iter().find(|step| step.granted).cloned();
        let reason = match (&successful_path, result) {
            (Some(step), true) => format!(
                "{subject} has '{permission}' on {object} via {} at {}",
                step.rule, step.object
            ),
            (None, true) => format!("{subject} has '{permission}' on {object}"),
            (_, false) => {
                format!("{subject} does NOT have '{permission}' on {object} - no valid path found")
            }
        };
        Ok(Explanation {
            result,
            cached: cached == Some(result),
            reason,
            paths,
            successful_path,
        })
    }

    // ---- tuple mutations ----------------------------------------------

    pub fn create_tuple(&self, request: &TupleRequest) -> NexusResult<i64> {
        let tuple_id = self.store.create(request)?;
        if let Some(tuple) = self.store.get(tuple_id)? {
            self.invalidate_for_tuple(&tuple)?;
            self.eager_recompute(&tuple)?;
        }
        Ok(tuple_id)
    }

    pub fn delete_tuple(&self, tuple_id: i64) -> NexusResult<bool> {
        match self.store.delete(tuple_id)? {
            Some(tuple) => {
                self.invalidate_for_tuple(&tuple)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Deletes by natural key; returns the removed tuple id.
    pub fn delete_tuple_matching(
        &self,
        subject: &Entity,
        relation: &str,
        object: &Entity,
        zone_id: &str,
    ) -> NexusResult<Option<i64>> {
        match self.store.find_tuple_id(subject, relation, object, zone_id)? {
            Some(tuple_id) => {
                self.delete_tuple(tuple_id)?;
                Ok(Some(tuple_id))
            }
            None => Ok(None),
        }
    }

    pub fn write_batch(&self, requests: &[TupleRequest]) -> NexusResult<Vec<i64>> {
        let ids = self.store.write_batch(requests)?;
        for id in &ids {
            if let Some(tuple) = self.store.get(*id)? {
                self.invalidate_for_tuple(&tuple)?;
            }
        }
        Ok(ids)
    }

    pub fn list_tuples(&self, filter: &TupleFilter) -> NexusResult<Vec<RebacTuple>> {
        self.store.list_tuples(filter)
    }

    /// Rename propagation: rewrites tuples and drops cached checks under
    /// both the old and new paths.
    pub fn update_object_path(
        &self,
        old: &str,
        new: &str,
        object_type: &str,
        is_directory: bool,
    ) -> NexusResult<usize> {
        let changed = self.store.update_object_path(old, new, object_type, is_directory)?;
        let old_entity = Entity::new(object_type, old);
        let new_entity = Entity::new(object_type, new);
        self.l1.invalidate_object_prefix(&old_entity);
        self.l1.invalidate_object_prefix(&new_entity);
        self.l2.invalidate_object_prefix(&old_entity)?;
        self.l2.invalidate_object_prefix(&new_entity)?;
        if object_type == "file" {
            self.grants.on_file_renamed(old, new);
        }
        debug!(old, new, changed, "propagated rename through tuples");
        Ok(changed)
    }

    /// Applies the tuple-change invalidation policy.
    fn invalidate_for_tuple(&self, tuple: &RebacTuple) -> NexusResult<()> {
        let subject = &tuple.subject;
        let object = &tuple.object;

        // 1. Always drop the direct pair in the tuple's zone.
        self.l1.invalidate_subject_object_pair(subject, object, &tuple.zone_id);
        self.l2.invalidate_pair(subject, object, &tuple.zone_id)?;

        // 2. Cross-zone: repeat in the subject's zone.
        if tuple.subject_zone_id != tuple.zone_id {
            self.l1.invalidate_subject_object_pair(subject, object, &tuple.subject_zone_id);
            self.l2.invalidate_pair(subject, object, &tuple.subject_zone_id)?;
        }

        // 3. Grants on files inherit down the path: drop whole subtrees.
        if tuple.relation == "parent" && tuple.subject.entity_type == "file" {
            self.l1.invalidate_object_prefix(subject);
            self.l2.invalidate_object_prefix(subject)?;
        } else if tuple.object.entity_type == "file"
            && FILE_ACCESS_RELATIONS.contains(&tuple.relation.as_str())
        {
            self.l1.invalidate_object_prefix(object);
            self.l2.invalidate_object_prefix(object)?;
        }

        // 4. Membership changes affect everything the subject can reach.
        if MEMBERSHIP_RELATIONS.contains(&tuple.relation.as_str())
            || (tuple.relation == "parent" && tuple.object.entity_type != "file")
        {
            self.l1.invalidate_subject(subject);
            self.l2.invalidate_subject(subject)?;
        }

        // 5. Userset subjects: group membership is unknown here, clear
        // the zone.
        if tuple.subject_relation.is_some() {
            self.l1.clear_zone(&tuple.zone_id);
            self.l2.clear_zone(&tuple.zone_id)?;
        }

        self.l1.note_hot_object(object);
        Ok(())
    }

    /// For simple tuples, precompute the most likely next checks so the
    /// invalidation turns into warm hits instead of misses.
    fn eager_recompute(&self, tuple: &RebacTuple) -> NexusResult<()> {
        if !tuple.is_simple() || self.eager_recompute_limit == 0 {
            return Ok(());
        }
        let affected = self.namespaces.permissions_affected_by(
            &tuple.object.entity_type,
            &tuple.relation,
            self.eager_recompute_limit,
        );
        for permission in affected {
            let key =
                self.check_key(&tuple.subject, &permission, &tuple.object, &tuple.zone_id)?;
            let started = Instant::now();
            let result = self.computer.check(
                self.store.as_ref(),
                &tuple.subject,
                &permission,
                &tuple.object,
                &tuple.zone_id,
                None,
            )?;
            self.l1.insert(key, result, started.elapsed());
            self.l2.put(&tuple.subject, &permission, &tuple.object, &tuple.zone_id, result)?;
        }
        Ok(())
    }

    /// Throttled expired-tuple sweep with cache invalidation.
    pub fn sweep_expired(&self) -> NexusResult<()> {
        for tuple in self.store.sweep_expired()? {
            self.invalidate_for_tuple(&tuple)?;
        }
        Ok(())
    }

    // ---- dynamic viewer configs ---------------------------------------

    pub fn set_dynamic_viewer_config(&self, subject: &Entity, path: &str, config: ColumnConfig) {
        self.dynamic_viewers.insert(
            (subject.entity_type.clone(), subject.entity_id.clone(), path.to_owned()),
            config,
        );
    }

    pub fn get_dynamic_viewer_config(&self, subject: &Entity, path: &str) -> Option<ColumnConfig> {
        self.dynamic_viewers
            .get(&(subject.entity_type.clone(), subject.entity_id.clone(), path.to_owned()))
            .map(|entry| entry.value().clone())
    }

    #[cfg(test)]
    pub(crate) fn l1(&self) -> &L1Cache {
        &self.l1
    }
}
