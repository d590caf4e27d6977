#![cfg(test)]

use crate::rebac::{ColumnConfig, Entity, TupleRequest};

use super::{grant, parent_edge, test_manager};

#[test]
fn test_check_after_create_needs_no_flush() {
    let manager = test_manager();
    let alice = Entity::user("alice");
    let file = Entity::file("/w/a.txt");

    assert!(!manager.check(&alice, "read", &file, "default", None).unwrap());

    let id = manager.create_tuple(&grant("alice", "direct_viewer", "/w/a.txt")).unwrap();
    assert!(manager.check(&alice, "read", &file, "default", None).unwrap());

    manager.delete_tuple(id).unwrap();
    assert!(!manager.check(&alice, "read", &file, "default", None).unwrap());
}

#[test]
fn test_inherited_grant_invalidates_children() {
    let manager = test_manager();
    let alice = Entity::user("alice");
    let child = Entity::file("/dir/child.txt");

    manager.create_tuple(&parent_edge("/dir/child.txt", "/dir")).unwrap();
    assert!(!manager.check(&alice, "viewer", &child, "default", None).unwrap());

    let id = manager.create_tuple(&grant("alice", "direct_viewer", "/dir")).unwrap();
    assert!(manager.check(&alice, "viewer", &child, "default", None).unwrap());

    // Dropping the directory grant flips the child check back.
    manager.delete_tuple(id).unwrap();
    assert!(!manager.check(&alice, "viewer", &child, "default", None).unwrap());
}

#[test]
fn test_cross_zone_share() {
    let manager = test_manager();
    let bob = Entity::user("bob");
    let file = Entity::file("/zone-a/doc.txt");

    manager
        .create_tuple(
            &grant("bob", "shared-viewer", "/zone-a/doc.txt")
                .in_zone("zone-a")
                .subject_zone("zone-b"),
        )
        .unwrap();
    assert!(manager.check(&bob, "viewer", &file, "zone-a", None).unwrap());

    // Non-allow-listed relations must not cross zones.
    let err = manager.create_tuple(
        &grant("bob", "direct_viewer", "/zone-a/doc.txt")
            .in_zone("zone-a")
            .subject_zone("zone-b"),
    );
    assert!(err.is_err());
}

#[test]
fn test_check_bulk_matches_single_checks() {
    let manager = test_manager();
    manager.create_tuple(&grant("alice", "direct_viewer", "/w/a.txt")).unwrap();
    manager.create_tuple(&grant("alice", "direct_owner", "/w/b.txt")).unwrap();

    let checks = vec![
        (Entity::user("alice"), "read".to_owned(), Entity::file("/w/a.txt")),
        (Entity::user("alice"), "write".to_owned(), Entity::file("/w/a.txt")),
        (Entity::user("alice"), "write".to_owned(), Entity::file("/w/b.txt")),
        (Entity::user("bob"), "read".to_owned(), Entity::file("/w/a.txt")),
    ];
    let bulk = manager.check_bulk(&checks, "default", None).unwrap();
    assert_eq!(bulk, vec![true, false, true, false]);

    for ((subject, permission, object), expected) in checks.iter().zip(&bulk) {
        let single = manager.check(subject, permission, object, "default", None).unwrap();
        assert_eq!(single, *expected);
    }
}

#[test]
fn test_rename_propagates_permissions() {
    let manager = test_manager();
    let alice = Entity::user("alice");

    manager.create_tuple(&grant("alice", "direct_viewer", "/a/x.txt")).unwrap();
    assert!(manager.check(&alice, "viewer", &Entity::file("/a/x.txt"), "default", None).unwrap());

    manager.update_object_path("/a", "/b", "file", true).unwrap();

    assert!(manager.check(&alice, "viewer", &Entity::file("/b/x.txt"), "default", None).unwrap());
    assert!(!manager.check(&alice, "viewer", &Entity::file("/a/x.txt"), "default", None).unwrap());
}

#[test]
fn test_explain_reports_granting_path() {
    let manager = test_manager();
    manager.create_tuple(&grant("alice", "direct_viewer", "/dir")).unwrap();
    manager.create_tuple(&parent_edge("/dir/child.txt", "/dir")).unwrap();

    let explanation = manager
        .explain(
            &Entity::user("alice"),
            "read",
            &Entity::file("/dir/child.txt"),
            "default",
            None,
        )
        .unwrap();
    assert!(explanation.result);
    assert!(explanation.successful_path.is_some());
    assert!(explanation.reason.contains("alice"));

    let denied = manager
        .explain(&Entity::user("mallory"), "read", &Entity::file("/dir/child.txt"), "default", None)
        .unwrap();
    assert!(!denied.result);
    assert!(denied.successful_path.is_none());
    assert!(denied.reason.contains("NOT"));
}

#[test]
fn test_expand_surface() {
    let manager = test_manager();
    manager.create_tuple(&grant("alice", "direct_viewer", "/w/a.txt")).unwrap();
    manager.create_tuple(&grant("bob", "direct_editor", "/w/a.txt")).unwrap();

    let viewers = manager.expand("viewer", &Entity::file("/w/a.txt"), "default").unwrap();
    assert!(viewers.contains(&Entity::user("alice")));
    assert!(viewers.contains(&Entity::user("bob")));
}

#[test]
fn test_userset_write_clears_zone_cache() {
    let manager = test_manager();
    let alice = Entity::user("alice");
    let file = Entity::file("/w/a.txt");

    // Warm the cache with a denial.
    assert!(!manager.check(&alice, "read", &file, "default", None).unwrap());
    assert!(manager.l1().len() > 0);

    manager
        .create_tuple(
            &TupleRequest::new(Entity::group("eng"), "direct_viewer", file.clone())
                .as_userset("member"),
        )
        .unwrap();
    manager
        .create_tuple(&TupleRequest::new(alice.clone(), "member", Entity::group("eng")))
        .unwrap();

    assert!(manager.check(&alice, "read", &file, "default", None).unwrap());
}

#[test]
fn test_dynamic_viewer_config_round_trip() {
    let manager = test_manager();
    let alice = Entity::user("alice");
    assert!(manager.get_dynamic_viewer_config(&alice, "/w/data.csv").is_none());

    manager.set_dynamic_viewer_config(
        &alice,
        "/w/data.csv",
        ColumnConfig {
            visible_columns: Some(vec!["name".to_owned(), "city".to_owned()]),
            masked_columns: vec!["salary".to_owned()],
            mask: "***".to_owned(),
        },
    );
    let config = manager.get_dynamic_viewer_config(&alice, "/w/data.csv").unwrap();
    assert_eq!(config.visible_columns.as_deref(), Some(&["name".to_owned(), "city".to_owned()][..]));
}
