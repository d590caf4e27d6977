//! In-memory check cache (L1).
//!
//! Keys carry a zone-revision bucket (`revision / window`), so a write
//! to the zone shifts subsequent reads into a fresh bucket without any
//! explicit flush. Entries are LRU-bounded and TTL'd, refreshed ahead of
//! expiry, and misses are computed under single-flight so a stampede of
//! identical checks does one computation.

use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use rand::Rng;

use super::Entity;

/// Fully-qualified cache key for one check.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CheckKey {
    pub bucket: u64,
    pub zone_id: String,
    pub subject_type: String,
    pub subject_id: String,
    pub relation: String,
    pub object_type: String,
    pub object_id: String,
}

impl CheckKey {
    pub fn new(bucket: u64, zone_id: &str, subject: &Entity, relation: &str, object: &Entity) -> Self {
        Self {
            bucket,
            zone_id: zone_id.to_owned(),
            subject_type: subject.entity_type.clone(),
            subject_id: subject.entity_id.clone(),
            relation: relation.to_owned(),
            object_type: object.entity_type.clone(),
            object_id: object.entity_id.clone(),
        }
    }
}

/// A cache hit; `should_refresh` tells the caller to recompute in the
/// background while the stale-ish value is served.
#[derive(Debug, Copy, Clone)]
pub struct CachedHit {
    pub result: bool,
    pub should_refresh: bool,
}

struct Slot {
    result: bool,
    inserted_at: Instant,
    ttl: Duration,
    /// Measured recomputation cost, feeds the XFetch formula.
    compute_delta: Duration,
    refreshing: bool,
    last_access: u64,
}

struct Inner {
    map: HashMap<CheckKey, Slot>,
    seq: u64,
}

/// Published outcome of an in-flight computation.
enum FlightOutcome {
    Pending,
    Ready(bool),
    Cancelled,
}

pub struct FlightState {
    outcome: Mutex<FlightOutcome>,
    cond: Condvar,
}

/// What `try_acquire_compute` hands back: the leader computes, followers
/// wait on the leader's flight state.
pub enum ComputeSlot {
    Leader,
    Follower(Arc<FlightState>),
}

pub struct L1Cache {
    inner: Mutex<Inner>,
    inflight: Mutex<HashMap<CheckKey, Arc<FlightState>>>,
    hot_objects: Mutex<HashMap<(String, String), Instant>>,
    capacity: usize,
    ttl: Duration,
    beta: f64,
    xfetch: bool,
}

impl L1Cache {
    pub fn new(capacity: usize, ttl: Duration, beta: f64, xfetch: bool) -> Self {
        Self {
            inner: Mutex::new(Inner { map: HashMap::new(), seq: 0 }),
            inflight: Mutex::new(HashMap::new()),
            hot_objects: Mutex::new(HashMap::new()),
            capacity: capacity.max(1),
            ttl,
            beta: beta.clamp(0.0, 1.0),
            xfetch,
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, key: &CheckKey) -> Option<CachedHit> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.seq += 1;
        let seq = inner.seq;
        let expired = {
            let slot = inner.map.get(key)?;
            slot.inserted_at.elapsed() >= slot.ttl
        };
        if expired {
            inner.map.remove(key);
            return None;
        }
        let slot = inner.map.get_mut(key)?;
        let age = slot.inserted_at.elapsed();
        slot.last_access = seq;

        let mut should_refresh = false;
        if !slot.refreshing {
            if age >= slot.ttl.mul_f64(self.beta) {
                slot.refreshing = true;
                should_refresh = true;
            } else if self.xfetch && slot.compute_delta > Duration::ZERO {
                // XFetch: refresh early with probability rising as expiry
                // nears, scaled by how long recomputation takes.
                let r: f64 = rand::thread_rng().gen_range(f64::EPSILON..1.0);
                let early = slot.compute_delta.mul_f64(self.beta * -r.ln());
                if age + early >= slot.ttl {
                    slot.refreshing = true;
                    should_refresh = true;
                }
            }
        }
        Some(CachedHit { result: slot.result, should_refresh })
    }

    pub fn insert(&self, key: CheckKey, result: bool, compute_delta: Duration) {
        let ttl = self.effective_ttl(&key);
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.seq += 1;
        let seq = inner.seq;
        if inner.map.len() >= self.capacity && !inner.map.contains_key(&key) {
            // Evict the least recently touched slot.
            if let Some(victim) = inner
                .map
                .iter()
                .min_by_key(|(_, slot)| slot.last_access)
                .map(|(k, _)| k.clone())
            {
                inner.map.remove(&victim);
            }
        }
        inner.map.insert(
            key,
            Slot {
                result,
                inserted_at: Instant::now(),
                ttl,
                compute_delta,
                refreshing: false,
                last_access: seq,
            },
        );
    }

    /// Overwrites an entry after a background refresh completed.
    pub fn complete_refresh(&self, key: CheckKey, result: bool, compute_delta: Duration) {
        self.insert(key, result, compute_delta);
    }

    /// Marks the refresh as abandoned so a later hit may retry it.
    pub fn abandon_refresh(&self, key: &CheckKey) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(slot) = inner.map.get_mut(key) {
            slot.refreshing = false;
        }
    }

    /// Objects written hot get a quartered TTL until the hot mark ages
    /// out.
    pub fn note_hot_object(&self, object: &Entity) {
        let mut hot = self.hot_objects.lock().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();
        hot.retain(|_, marked| now.duration_since(*marked) < self.ttl);
        hot.insert((object.entity_type.clone(), object.entity_id.clone()), now);
    }

    fn effective_ttl(&self, key: &CheckKey) -> Duration {
        let hot = self.hot_objects.lock().unwrap_or_else(|e| e.into_inner());
        let hot_key = (key.object_type.clone(), key.object_id.clone());
        match hot.get(&hot_key) {
            Some(marked) if marked.elapsed() < self.ttl => self.ttl / 4,
            _ => self.ttl,
        }
    }

    // ---- single-flight -------------------------------------------------

    /// One caller per key becomes the leader and computes; the rest wait.
    pub fn try_acquire_compute(&self, key: &CheckKey) -> ComputeSlot {
        let mut inflight = self.inflight.lock().unwrap_or_else(|e| e.into_inner());
        match inflight.get(key) {
            Some(state) => ComputeSlot::Follower(Arc::clone(state)),
            None => {
                inflight.insert(
                    key.clone(),
                    Arc::new(FlightState {
                        outcome: Mutex::new(FlightOutcome::Pending),
                        cond: Condvar::new(),
                    }),
                );
                ComputeSlot::Leader
            }
        }
    }

    /// Blocks until the leader publishes, or `timeout` passes. `None`
    /// means compute locally.
    pub fn wait_for_compute(&self, state: &FlightState, timeout: Duration) -> Option<bool> {
        let deadline = Instant::now() + timeout;
        let mut outcome = state.outcome.lock().unwrap_or_else(|e| e.into_inner());
        loop {
            match *outcome {
                FlightOutcome::Ready(result) => return Some(result),
                FlightOutcome::Cancelled => return None,
                FlightOutcome::Pending => {}
            }
            let remaining = deadline.checked_duration_since(Instant::now())?;
            let (guard, wait) = state
                .cond
                .wait_timeout(outcome, remaining)
                .unwrap_or_else(|e| e.into_inner());
            outcome = guard;
            if wait.timed_out() {
                match *outcome {
                    FlightOutcome::Ready(result) => return Some(result),
                    _ => return None,
                }
            }
        }
    }

    /// Leader publishes its result and wakes the followers.
    pub fn publish_compute(&self, key: &CheckKey, result: bool) {
        let state = {
            let mut inflight = self.inflight.lock().unwrap_or_else(|e| e.into_inner());
            inflight.remove(key)
        };
        if let Some(state) = state {
            let mut outcome = state.outcome.lock().unwrap_or_else(|e| e.into_inner());
            *outcome = FlightOutcome::Ready(result);
            state.cond.notify_all();
        }
    }

    /// Leader failed; followers fall through to local computation.
    pub fn cancel_compute(&self, key: &CheckKey) {
        let state = {
            let mut inflight = self.inflight.lock().unwrap_or_else(|e| e.into_inner());
            inflight.remove(key)
        };
        if let Some(state) = state {
            let mut outcome = state.outcome.lock().unwrap_or_else(|e| e.into_inner());
            *outcome = FlightOutcome::Cancelled;
            state.cond.notify_all();
        }
    }

    // ---- invalidation --------------------------------------------------

    fn retain(&self, keep: impl Fn(&CheckKey) -> bool) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.map.retain(|key, _| keep(key));
    }

    /// Drops every relation cached for `(subject, object)` in `zone`.
    pub fn invalidate_subject_object_pair(&self, subject: &Entity, object: &Entity, zone_id: &str) {
        self.retain(|key| {
            !(key.zone_id == zone_id
                && key.subject_type == subject.entity_type
                && key.subject_id == subject.entity_id
                && key.object_type == object.entity_type
                && key.object_id == object.entity_id)
        });
    }

    pub fn invalidate_subject(&self, subject: &Entity) {
        self.retain(|key| {
            !(key.subject_type == subject.entity_type && key.subject_id == subject.entity_id)
        });
    }

    pub fn invalidate_object(&self, object: &Entity) {
        self.retain(|key| {
            !(key.object_type == object.entity_type && key.object_id == object.entity_id)
        });
    }

    /// Drops entries whose object is `object` or a path below it.
    pub fn invalidate_object_prefix(&self, object: &Entity) {
        let prefix = format!("{}/", object.entity_id);
        self.retain(|key| {
            !(key.object_type == object.entity_type
                && (key.object_id == object.entity_id || key.object_id.starts_with(&prefix)))
        });
    }

    pub fn clear_zone(&self, zone_id: &str) {
        self.retain(|key| key.zone_id != zone_id);
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.map.clear();
    }
}
