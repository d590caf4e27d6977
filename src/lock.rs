//! Distributed lock manager contract and a single-process implementation.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::time::{sleep, Instant};

use crate::error::NexusResult;

/// Pluggable lock collaborator. `acquire` returns a lock id on success,
/// `None` on timeout.
#[async_trait]
pub trait LockManager: Send + Sync {
    async fn acquire(
        &self,
        zone_id: &str,
        path: &str,
        timeout: Duration,
    ) -> NexusResult<Option<String>>;

    async fn extend(&self, lock_id: &str, path: &str, ttl: Duration) -> NexusResult<bool>;

    async fn release(&self, lock_id: &str, zone_id: &str, path: &str) -> NexusResult<()>;
}

/// Per-path locks inside one process; the default when no distributed
/// manager is wired in.
pub struct LocalLockManager {
    locks: DashMap<String, String>,
    next_id: AtomicU64,
}

impl LocalLockManager {
    pub fn new() -> Self {
        Self { locks: DashMap::new(), next_id: AtomicU64::new(1) }
    }

    fn key(zone_id: &str, path: &str) -> String {
        format!("{zone_id}:{path}")
    }
}

impl Default for LocalLockManager {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LockManager for LocalLockManager {
    async fn acquire(
        &self,
        zone_id: &str,
        path: &str,
        timeout: Duration,
    ) -> NexusResult<Option<String>> {
        let key = Self::key(zone_id, path);
        let lock_id = format!("lock-{}", self.next_id.fetch_add(1, Ordering::Relaxed));
        let deadline = Instant::now() + timeout;
        loop {
            let inserted = match self.locks.entry(key.clone()) {
                dashmap::mapref::entry::Entry::Occupied(_) => false,
                dashmap::mapref::entry::Entry::Vacant(slot) => {
                    slot.insert(lock_id.clone());
                    true
                }
            };
            if inserted {
                return Ok(Some(lock_id));
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            sleep(Duration::from_millis(5)).await;
        }
    }

    async fn extend(&self, lock_id: &str, path: &str, _ttl: Duration) -> NexusResult<bool> {
        Ok(self.locks.iter().any(|entry| {
            entry.key().ends_with(&format!(":{path}")) && entry.value().as_str() == lock_id
        }))
    }

    async fn release(&self, lock_id: &str, zone_id: &str, path: &str) -> NexusResult<()> {
        let key = Self::key(zone_id, path);
        self.locks.remove_if(&key, |_, held| held.as_str() == lock_id);
        Ok(())
    }
}
