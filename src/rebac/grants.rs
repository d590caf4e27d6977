//! Ancestor-grant index: per-subject bitmaps of files reachable through
//! directory grants.
//!
//! When a directory grant has `include_future_files`, files created
//! under it later are added to the grant's file set so membership checks
//! stay O(1). Rename moves files between grants of the old and new
//! ancestor chains.

use std::collections::HashSet;

use dashmap::DashMap;

use crate::path;

use super::Entity;

#[derive(Debug, Clone)]
struct GrantEntry {
    include_future_files: bool,
    files: HashSet<String>,
}

type GrantKey = (String, String, String); // subject_type, subject_id, dir

pub struct GrantIndex {
    grants: DashMap<GrantKey, GrantEntry>,
}

impl GrantIndex {
    pub fn new() -> Self {
        Self { grants: DashMap::new() }
    }

    fn key(subject: &Entity, dir: &str) -> GrantKey {
        (subject.entity_type.clone(), subject.entity_id.clone(), dir.to_owned())
    }

    /// Registers a directory grant, seeding it with `existing_files`.
    pub fn add_grant(
        &self,
        subject: &Entity,
        dir: &str,
        include_future_files: bool,
        existing_files: impl IntoIterator<Item = String>,
    ) {
        self.grants.insert(
            Self::key(subject, dir),
            GrantEntry { include_future_files, files: existing_files.into_iter().collect() },
        );
    }

    pub fn remove_grant(&self, subject: &Entity, dir: &str) {
        self.grants.remove(&Self::key(subject, dir));
    }

    /// O(1) membership: is `file` covered by any grant of `subject`?
    pub fn covers(&self, subject: &Entity, file: &str) -> bool {
        self.grants.iter().any(|entry| {
            entry.key().0 == subject.entity_type
                && entry.key().1 == subject.entity_id
                && entry.value().files.contains(file)
        })
    }

    /// A new file joins every ancestor grant that tracks future files.
    pub fn on_file_created(&self, file: &str) {
        let ancestors = path::ancestors(file);
        for mut entry in self.grants.iter_mut() {
            if entry.value().include_future_files && ancestors.iter().any(|a| a == &entry.key().2) {
                entry.value_mut().files.insert(file.to_owned());
            }
        }
    }

    pub fn on_file_deleted(&self, file: &str) {
        for mut entry in self.grants.iter_mut() {
            entry.value_mut().files.remove(file);
        }
    }

    /// Rename: drop the file from grants that only cover the old chain,
    /// add it to future-tracking grants of the new chain. Grants covering
    /// both chains keep their membership untouched.
    pub fn on_file_renamed(&self, old: &str, new: &str) {
        let old_ancestors = path::ancestors(old);
        let new_ancestors = path::ancestors(new);
        for mut entry in self.grants.iter_mut() {
            let dir = entry.key().2.clone();
            let in_old = old_ancestors.iter().any(|a| a == &dir);
            let in_new = new_ancestors.iter().any(|a| a == &dir);
            match (in_old, in_new) {
                (true, true) => {
                    if !entry.value().include_future_files {
                        entry.value_mut().files.remove(old);
                    } else if entry.value_mut().files.remove(old) {
                        entry.value_mut().files.insert(new.to_owned());
                    }
                }
                (true, false) => {
                    entry.value_mut().files.remove(old);
                }
                (false, true) => {
                    if entry.value().include_future_files {
                        entry.value_mut().files.insert(new.to_owned());
                    }
                }
                (false, false) => {}
            }
        }
    }
}

impl Default for GrantIndex {
    fn default() -> Self {
        Self::new()
    }
}
