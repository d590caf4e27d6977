#![cfg(test)]

use crate::error::NexusError;
use crate::metadata::{EntryType, SourceType};

use super::{entry, test_store};

#[test]
fn test_put_assigns_version_one_and_history_row() {
    let store = test_store();
    let (stored, revision) = store.put(&entry("/w/a.txt", "h1", 5), "default").unwrap();

    assert_eq!(stored.current_version, 1);
    assert!(stored.path_id > 0);
    assert_eq!(revision, 1);

    let record = store.get_version_record("/w/a.txt", 1).unwrap().unwrap();
    assert_eq!(record.content_hash.as_deref(), Some("h1"));
    assert_eq!(record.source_type, SourceType::Original);
    assert!(record.parent_version_id.is_none());
}

#[test]
fn test_put_increments_version_and_links_lineage() {
    let store = test_store();
    store.put(&entry("/w/a.txt", "h1", 5), "default").unwrap();
    let (updated, _) = store.put(&entry("/w/a.txt", "h2", 6), "default").unwrap();

    assert_eq!(updated.current_version, 2);
    let v2 = store.get_version_record("/w/a.txt", 2).unwrap().unwrap();
    let v1 = store.get_version_record("/w/a.txt", 1).unwrap().unwrap();
    assert_eq!(v2.parent_version_id, Some(v1.version_id));
    assert_eq!(v2.content_hash.as_deref(), Some("h2"));
}

#[test]
fn test_put_preserves_owner_and_created_by_on_update() {
    let store = test_store();
    let mut first = entry("/w/a.txt", "h1", 5);
    first.owner_id = Some("alice".to_owned());
    store.put(&first, "default").unwrap();

    let mut second = entry("/w/a.txt", "h2", 6);
    second.owner_id = Some("mallory".to_owned());
    second.created_by = Some("mallory".to_owned());
    let (updated, _) = store.put(&second, "default").unwrap();

    assert_eq!(updated.owner_id.as_deref(), Some("alice"));
    assert_eq!(updated.created_by.as_deref(), Some("tester"));
}

#[test]
fn test_zone_revision_increases_on_every_mutation() {
    let store = test_store();
    let before = store.get_revision("z1").unwrap();
    let (_, r1) = store.put(&entry("/w/a.txt", "h1", 5), "z1").unwrap();
    let (_, r2) = store.put(&entry("/w/b.txt", "h2", 5), "z1").unwrap();
    assert!(r1 > before);
    assert!(r2 > r1);
    assert_eq!(store.get_revision("z1").unwrap(), r2);
    // Other zones are untouched.
    assert_eq!(store.get_revision("z2").unwrap(), 0);
}

#[test]
fn test_soft_delete_keeps_history_and_put_recreates() {
    let store = test_store();
    store.put(&entry("/w/a.txt", "h1", 5), "default").unwrap();
    store.put(&entry("/w/a.txt", "h2", 6), "default").unwrap();

    let (snapshot, _) = store.delete("/w/a.txt", "default").unwrap().unwrap();
    assert_eq!(snapshot.current_version, 2);
    assert!(store.get("/w/a.txt").unwrap().is_none());
    assert!(!store.exists("/w/a.txt").unwrap());

    // Re-create at the same path: fresh lineage starting at version 1.
    let (recreated, _) = store.put(&entry("/w/a.txt", "h3", 7), "default").unwrap();
    assert_eq!(recreated.current_version, 1);
    assert_ne!(recreated.path_id, snapshot.path_id);
    let versions = store.list_versions("/w/a.txt").unwrap();
    assert_eq!(versions.len(), 1);
}

#[test]
fn test_delete_missing_returns_none() {
    let store = test_store();
    assert!(store.delete("/w/nope", "default").unwrap().is_none());
}

#[test]
fn test_exists_and_negative_caching() {
    let store = test_store();
    assert!(!store.exists("/w/a.txt").unwrap());
    store.put(&entry("/w/a.txt", "h1", 5), "default").unwrap();
    assert!(store.exists("/w/a.txt").unwrap());
}

#[test]
fn test_is_implicit_directory() {
    let store = test_store();
    store.put(&entry("/w/sub/a.txt", "h1", 5), "default").unwrap();
    assert!(store.is_implicit_directory("/w").unwrap());
    assert!(store.is_implicit_directory("/w/sub").unwrap());
    assert!(!store.is_implicit_directory("/w/sub/a.txt").unwrap());
    assert!(!store.is_implicit_directory("/elsewhere").unwrap());
}

#[test]
fn test_rename_path_moves_descendants() {
    let store = test_store();
    store.put(&entry("/a/x.txt", "h1", 1), "default").unwrap();
    store.put(&entry("/a/sub/y.txt", "h2", 2), "default").unwrap();

    store.rename_path("/a", "/b", "default").unwrap();

    assert!(store.get("/a/x.txt").unwrap().is_none());
    let moved = store.get("/b/x.txt").unwrap().unwrap();
    assert_eq!(moved.content_hash.as_deref(), Some("h1"));
    assert!(store.get("/b/sub/y.txt").unwrap().is_some());
}

#[test]
fn test_rename_missing_source_is_not_found() {
    let store = test_store();
    assert!(matches!(
        store.rename_path("/missing", "/dst", "default"),
        Err(NexusError::NotFound { .. })
    ));
}

#[test]
fn test_directory_index_tracks_children() {
    let store = test_store();
    store.put(&entry("/w/a.txt", "h1", 1), "default").unwrap();
    store.put(&entry("/w/sub/b.txt", "h2", 2), "default").unwrap();

    let children = store.list_directory_entries("/w", "default").unwrap().unwrap();
    let names: Vec<&str> = children.iter().map(|c| c.entry_name.as_str()).collect();
    assert_eq!(names, vec!["a.txt", "sub"]);
    assert_eq!(children[0].entry_type, EntryType::File);
    assert_eq!(children[1].entry_type, EntryType::Directory);

    store.delete("/w/a.txt", "default").unwrap();
    let children = store.list_directory_entries("/w", "default").unwrap().unwrap();
    assert_eq!(children.len(), 1);
}

#[test]
fn test_kv_attributes_round_trip() {
    let store = test_store();
    store.put(&entry("/w/a.txt", "h1", 1), "default").unwrap();

    assert!(store.get_file_metadata("/w/a.txt", "parser_name").unwrap().is_none());
    store
        .set_file_metadata("/w/a.txt", "parser_name", &serde_json::json!("markdown"))
        .unwrap();
    assert_eq!(
        store.get_file_metadata("/w/a.txt", "parser_name").unwrap(),
        Some(serde_json::json!("markdown"))
    );

    store.delete_file_metadata("/w/a.txt", &["parser_name", "parsed_at"]).unwrap();
    assert!(store.get_file_metadata("/w/a.txt", "parser_name").unwrap().is_none());
}

#[test]
fn test_kv_set_on_missing_path_is_not_found() {
    let store = test_store();
    assert!(matches!(
        store.set_file_metadata("/w/nope", "k", &serde_json::json!(1)),
        Err(NexusError::NotFound { .. })
    ));
}

#[test]
fn test_searchable_text_goes_stale_on_content_change() {
    let store = test_store();
    store.put(&entry("/w/a.txt", "h1", 1), "default").unwrap();
    store.set_searchable_text("/w/a.txt", "hello world").unwrap();
    assert_eq!(store.get_searchable_text("/w/a.txt").unwrap().as_deref(), Some("hello world"));

    store.put(&entry("/w/a.txt", "h2", 2), "default").unwrap();
    assert!(store.get_searchable_text("/w/a.txt").unwrap().is_none());
}

#[test]
fn test_get_batch_and_content_ids() {
    let store = test_store();
    store.put(&entry("/w/a.txt", "h1", 1), "default").unwrap();
    store.put(&entry("/w/b.txt", "h2", 2), "default").unwrap();

    let paths = vec!["/w/a.txt".to_owned(), "/w/b.txt".to_owned(), "/w/c.txt".to_owned()];
    let batch = store.get_batch(&paths).unwrap();
    assert!(batch["/w/a.txt"].is_some());
    assert!(batch["/w/c.txt"].is_none());

    let hashes = store.batch_get_content_ids(&paths).unwrap();
    assert_eq!(hashes["/w/b.txt"].as_deref(), Some("h2"));
    assert!(hashes["/w/c.txt"].is_none());
}

#[test]
fn test_put_batch_is_observationally_a_sequence_of_puts() {
    let store = test_store();
    store.put(&entry("/w/a.txt", "h0", 1), "default").unwrap();

    let (stored, revision) = store
        .put_batch(
            &[entry("/w/a.txt", "h1", 1), entry("/w/new.txt", "h2", 2)],
            "default",
        )
        .unwrap();
    assert_eq!(stored[0].current_version, 2);
    assert_eq!(stored[1].current_version, 1);
    assert!(revision > 0);

    let versions = store.list_versions("/w/a.txt").unwrap();
    assert_eq!(versions.len(), 2);
}

#[test]
fn test_delete_batch() {
    let store = test_store();
    store.put(&entry("/w/a.txt", "h1", 1), "default").unwrap();
    store.put(&entry("/w/b.txt", "h2", 2), "default").unwrap();
    store.delete_batch(&["/w/a.txt".to_owned(), "/w/b.txt".to_owned()], "default").unwrap();
    assert!(store.get("/w/a.txt").unwrap().is_none());
    assert!(store.get("/w/b.txt").unwrap().is_none());
}
