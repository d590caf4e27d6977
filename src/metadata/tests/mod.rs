#![cfg(test)]

mod store;

use std::sync::Arc;

use crate::config::{CacheConfig, RetryConfig};

use super::{Db, FileEntry, MetadataStore};

pub(super) fn test_store() -> Arc<MetadataStore> {
    let db = Db::open_in_memory().expect("open in-memory db");
    Arc::new(MetadataStore::new(db, &CacheConfig::default(), RetryConfig::default()))
}

pub(super) fn entry(path: &str, hash: &str, size: u64) -> FileEntry {
    let mut entry = FileEntry::new(path, "memory");
    entry.physical_path = hash.to_owned();
    entry.content_hash = Some(hash.to_owned());
    entry.size = size;
    entry.mime_type = Some("text/plain".to_owned());
    entry.created_by = Some("tester".to_owned());
    entry
}
