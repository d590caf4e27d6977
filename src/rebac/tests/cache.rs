#![cfg(test)]

use std::sync::Arc;
use std::time::Duration;

use crate::rebac::cache::{ComputeSlot, L1Cache};
use crate::rebac::{CheckKey, Entity};

fn key(bucket: u64, subject: &str, relation: &str, object: &str) -> CheckKey {
    CheckKey::new(bucket, "default", &Entity::user(subject), relation, &Entity::file(object))
}

fn cache() -> L1Cache {
    L1Cache::new(8, Duration::from_secs(60), 0.7, false)
}

#[test]
fn test_insert_get_round_trip() {
    let cache = cache();
    cache.insert(key(0, "alice", "read", "/w/a"), true, Duration::from_millis(3));
    let hit = cache.get(&key(0, "alice", "read", "/w/a")).unwrap();
    assert!(hit.result);
    assert!(!hit.should_refresh);
    assert!(cache.get(&key(0, "alice", "read", "/w/b")).is_none());
}

#[test]
fn test_bucket_shift_misses() {
    let cache = cache();
    cache.insert(key(0, "alice", "read", "/w/a"), true, Duration::ZERO);
    // A zone write moved the revision into the next bucket: stale entry
    // is simply never addressed again.
    assert!(cache.get(&key(1, "alice", "read", "/w/a")).is_none());
}

#[test]
fn test_ttl_expiry() {
    let cache = L1Cache::new(8, Duration::from_millis(10), 0.7, false);
    cache.insert(key(0, "alice", "read", "/w/a"), true, Duration::ZERO);
    std::thread::sleep(Duration::from_millis(25));
    assert!(cache.get(&key(0, "alice", "read", "/w/a")).is_none());
}

#[test]
fn test_refresh_ahead_fires_once_past_beta() {
    let cache = L1Cache::new(8, Duration::from_millis(100), 0.5, false);
    cache.insert(key(0, "alice", "read", "/w/a"), true, Duration::ZERO);
    std::thread::sleep(Duration::from_millis(60));

    let first = cache.get(&key(0, "alice", "read", "/w/a")).unwrap();
    assert!(first.should_refresh);
    // The refresh-in-progress flag suppresses duplicates.
    let second = cache.get(&key(0, "alice", "read", "/w/a")).unwrap();
    assert!(!second.should_refresh);

    cache.complete_refresh(key(0, "alice", "read", "/w/a"), false, Duration::from_millis(1));
    let refreshed = cache.get(&key(0, "alice", "read", "/w/a")).unwrap();
    assert!(!refreshed.result);
    assert!(!refreshed.should_refresh);
}

#[test]
fn test_lru_eviction_respects_capacity() {
    let cache = L1Cache::new(2, Duration::from_secs(60), 0.9, false);
    cache.insert(key(0, "alice", "read", "/a"), true, Duration::ZERO);
    cache.insert(key(0, "alice", "read", "/b"), true, Duration::ZERO);
    // Touch /a so /b is the eviction victim.
    cache.get(&key(0, "alice", "read", "/a"));
    cache.insert(key(0, "alice", "read", "/c"), true, Duration::ZERO);

    assert_eq!(cache.len(), 2);
    assert!(cache.get(&key(0, "alice", "read", "/a")).is_some());
    assert!(cache.get(&key(0, "alice", "read", "/b")).is_none());
    assert!(cache.get(&key(0, "alice", "read", "/c")).is_some());
}

#[test]
fn test_single_flight_leader_and_followers() {
    let cache = Arc::new(cache());
    let target = key(0, "alice", "read", "/w/a");

    let slot = cache.try_acquire_compute(&target);
    assert!(matches!(slot, ComputeSlot::Leader));

    // Followers block until the leader publishes.
    let mut handles = Vec::new();
    for _ in 0..3 {
        let cache = Arc::clone(&cache);
        let target = target.clone();
        handles.push(std::thread::spawn(move || {
            match cache.try_acquire_compute(&target) {
                ComputeSlot::Leader => panic!("second leader for the same key"),
                ComputeSlot::Follower(state) => {
                    cache.wait_for_compute(&state, Duration::from_secs(5))
                }
            }
        }));
    }

    std::thread::sleep(Duration::from_millis(20));
    cache.insert(target.clone(), true, Duration::from_millis(2));
    cache.publish_compute(&target, true);

    for handle in handles {
        assert_eq!(handle.join().unwrap(), Some(true));
    }
}

#[test]
fn test_cancelled_compute_releases_followers() {
    let cache = Arc::new(cache());
    let target = key(0, "alice", "read", "/w/a");
    assert!(matches!(cache.try_acquire_compute(&target), ComputeSlot::Leader));

    let follower = {
        let cache = Arc::clone(&cache);
        let target = target.clone();
        std::thread::spawn(move || match cache.try_acquire_compute(&target) {
            ComputeSlot::Leader => panic!("second leader"),
            ComputeSlot::Follower(state) => cache.wait_for_compute(&state, Duration::from_secs(5)),
        })
    };

    std::thread::sleep(Duration::from_millis(20));
    cache.cancel_compute(&target);
    assert_eq!(follower.join().unwrap(), None);

    // The key is free again; the next caller leads.
    assert!(matches!(cache.try_acquire_compute(&target), ComputeSlot::Leader));
}

#[test]
fn test_follower_timeout_returns_none() {
    let cache = cache();
    let target = key(0, "alice", "read", "/w/a");
    assert!(matches!(cache.try_acquire_compute(&target), ComputeSlot::Leader));
    match cache.try_acquire_compute(&target) {
        ComputeSlot::Follower(state) => {
            assert_eq!(cache.wait_for_compute(&state, Duration::from_millis(10)), None);
        }
        ComputeSlot::Leader => panic!("expected follower"),
    }
    cache.cancel_compute(&target);
}

#[test]
fn test_invalidation_predicates() {
    let cache = cache();
    let alice = Entity::user("alice");
    let bob = Entity::user("bob");
    cache.insert(key(0, "alice", "read", "/dir"), true, Duration::ZERO);
    cache.insert(key(0, "alice", "read", "/dir/a.txt"), true, Duration::ZERO);
    cache.insert(key(0, "alice", "read", "/dirx"), true, Duration::ZERO);
    cache.insert(key(0, "bob", "read", "/dir"), true, Duration::ZERO);

    cache.invalidate_object_prefix(&Entity::file("/dir"));
    assert!(cache.get(&key(0, "alice", "read", "/dir")).is_none());
    assert!(cache.get(&key(0, "alice", "read", "/dir/a.txt")).is_none());
    assert!(cache.get(&key(0, "alice", "read", "/dirx")).is_some());
    assert!(cache.get(&key(0, "bob", "read", "/dir")).is_none());

    cache.insert(key(0, "alice", "read", "/x"), true, Duration::ZERO);
    cache.insert(key(0, "bob", "read", "/x"), true, Duration::ZERO);
    cache.invalidate_subject(&alice);
    assert!(cache.get(&key(0, "alice", "read", "/x")).is_none());
    assert!(cache.get(&key(0, "bob", "read", "/x")).is_some());

    cache.invalidate_subject_object_pair(&bob, &Entity::file("/x"), "default");
    assert!(cache.get(&key(0, "bob", "read", "/x")).is_none());

    cache.insert(key(0, "alice", "read", "/y"), true, Duration::ZERO);
    cache.clear();
    assert!(cache.is_empty());
}
