//! The four bounded caches fronting the catalog.
//!
//! Each map caches `Option<..>` values so a cached negative lookup is
//! distinguishable from a miss. Mutations invalidate the touched path,
//! its existence and KV entries, and every listing whose prefix covers
//! the path.

use std::sync::Arc;
use std::time::Duration;

use moka::sync::Cache;

use crate::config::CacheConfig;
use crate::path;

use super::FileEntry;

/// Key of a cached listing: `(prefix, recursive, tenant)`.
pub type ListingKey = (String, bool, Option<String>);

pub struct MetadataCaches {
    entries: Cache<String, Option<FileEntry>>,
    listings: Cache<ListingKey, Arc<Vec<FileEntry>>>,
    kv: Cache<(String, String), Option<Arc<serde_json::Value>>>,
    exists: Cache<String, bool>,
}

impl MetadataCaches {
    pub fn new(config: &CacheConfig) -> Self {
        let ttl = Duration::from_secs(config.ttl_secs.max(1));
        Self {
            entries: Cache::builder()
                .max_capacity(config.entry_capacity)
                .time_to_live(ttl)
                .support_invalidation_closures()
                .build(),
            listings: Cache::builder()
                .max_capacity(config.listing_capacity)
                .time_to_live(ttl)
                .support_invalidation_closures()
                .build(),
            kv: Cache::builder()
                .max_capacity(config.kv_capacity)
                .time_to_live(ttl)
                .support_invalidation_closures()
                .build(),
            exists: Cache::builder()
                .max_capacity(config.exists_capacity)
                .time_to_live(ttl)
                .support_invalidation_closures()
                .build(),
        }
    }

    pub fn get_entry(&self, path: &str) -> Option<Option<FileEntry>> {
        self.entries.get(path)
    }

    pub fn put_entry(&self, path: &str, entry: Option<FileEntry>) {
        self.entries.insert(path.to_owned(), entry);
    }

    pub fn get_listing(&self, key: &ListingKey) -> Option<Arc<Vec<FileEntry>>> {
        self.listings.get(key)
    }

    /// Recursive listing of an ancestor prefix that can satisfy `key` by
    /// filtering, when one is cached.
    pub fn covering_listing(&self, key: &ListingKey) -> Option<(String, Arc<Vec<FileEntry>>)> {
        if !key.1 {
            return None;
        }
        for ancestor in path::ancestors(&key.0) {
            let candidate: ListingKey = (ancestor.clone(), true, key.2.clone());
            if let Some(listing) = self.listings.get(&candidate) {
                return Some((ancestor, listing));
            }
        }
        None
    }

    pub fn put_listing(&self, key: ListingKey, entries: Arc<Vec<FileEntry>>) {
        self.listings.insert(key, entries);
    }

    pub fn get_kv(&self, path: &str, key: &str) -> Option<Option<Arc<serde_json::Value>>> {
        self.kv.get(&(path.to_owned(), key.to_owned()))
    }

    pub fn put_kv(&self, path: &str, key: &str, value: Option<Arc<serde_json::Value>>) {
        self.kv.insert((path.to_owned(), key.to_owned()), value);
    }

    pub fn get_exists(&self, path: &str) -> Option<bool> {
        self.exists.get(path)
    }

    pub fn put_exists(&self, path: &str, value: bool) {
        self.exists.insert(path.to_owned(), value);
    }

    /// Drops everything cached about `path` and any listing that could
    /// contain it.
    pub fn invalidate_path(&self, path: &str) {
        self.entries.invalidate(path);
        self.exists.invalidate(path);
        let owned = path.to_owned();
        let _ = self
            .kv
            .invalidate_entries_if(move |(cached_path, _), _| cached_path == &owned);
        let owned = path.to_owned();
        let _ = self.listings.invalidate_entries_if(move |(prefix, _, _), _| {
            path::is_self_or_descendant(&owned, prefix)
        });
        self.sync();
    }

    /// Drops `path`, every cached descendant, and covering listings; used
    /// by rename and directory deletes.
    pub fn invalidate_subtree(&self, path: &str) {
        let owned = path.to_owned();
        let _ = self
            .entries
            .invalidate_entries_if(move |cached, _| path::is_self_or_descendant(cached, &owned));
        let owned = path.to_owned();
        let _ = self
            .exists
            .invalidate_entries_if(move |cached, _| path::is_self_or_descendant(cached, &owned));
        let owned = path.to_owned();
        let _ = self.kv.invalidate_entries_if(move |(cached, _), _| {
            path::is_self_or_descendant(cached, &owned)
        });
        let owned = path.to_owned();
        let _ = self.listings.invalidate_entries_if(move |(prefix, _, _), _| {
            path::is_self_or_descendant(&owned, prefix) || path::is_self_or_descendant(prefix, &owned)
        });
        self.sync();
    }

    pub fn clear(&self) {
        self.entries.invalidate_all();
        self.listings.invalidate_all();
        self.kv.invalidate_all();
        self.exists.invalidate_all();
    }

    /// Moka applies invalidation predicates lazily; tests call this to
    /// force pending maintenance so stale reads cannot race assertions.
    pub fn sync(&self) {
        self.entries.run_pending_tasks();
        self.listings.run_pending_tasks();
        self.kv.run_pending_tasks();
        self.exists.run_pending_tasks();
    }
}
