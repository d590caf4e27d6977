#![cfg(test)]

mod cache;
mod compute;
mod manager;

use std::sync::Arc;

use crate::config::RebacConfig;
use crate::metadata::Db;

use super::{Entity, RebacManager, RebacStore, TupleRequest};

pub(super) fn test_manager() -> RebacManager {
    let db = Db::open_in_memory().expect("open in-memory db");
    RebacManager::new(db, &RebacConfig::default())
}

pub(super) fn test_store() -> RebacStore {
    let db = Db::open_in_memory().expect("open in-memory db");
    RebacStore::new(db, 50, 1)
}

pub(super) fn test_store_on(db: Arc<Db>) -> RebacStore {
    RebacStore::new(db, 50, 1)
}

pub(super) fn grant(subject: &str, relation: &str, object_path: &str) -> TupleRequest {
    TupleRequest::new(Entity::user(subject), relation, Entity::file(object_path))
}

pub(super) fn parent_edge(child: &str, parent: &str) -> TupleRequest {
    TupleRequest::new(Entity::file(child), "parent", Entity::file(parent))
}
