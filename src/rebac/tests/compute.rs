#![cfg(test)]

use std::sync::Arc;

use serde_json::json;

use crate::metadata::{Db, Timestamp};
use crate::rebac::{
    Entity, NamespaceConfig, NamespaceRegistry, PermissionComputer, RelationExpr, TupleRequest,
    TupleSnapshot, TupleSource,
};

use super::{grant, parent_edge, test_store_on};

fn computer() -> PermissionComputer {
    PermissionComputer::new(Arc::new(NamespaceRegistry::with_defaults()), 50, 1000)
}

fn fixture() -> (crate::rebac::RebacStore, PermissionComputer) {
    let db = Db::open_in_memory().expect("open in-memory db");
    (test_store_on(db), computer())
}

#[test]
fn test_direct_tuple_grants() {
    let (store, computer) = fixture();
    store.create(&grant("alice", "direct_viewer", "/w/a.txt")).unwrap();

    let alice = Entity::user("alice");
    let file = Entity::file("/w/a.txt");
    assert!(computer.check(&store, &alice, "direct_viewer", &file, "default", None).unwrap());
    assert!(computer.check(&store, &alice, "viewer", &file, "default", None).unwrap());
    assert!(computer.check(&store, &alice, "read", &file, "default", None).unwrap());
    assert!(!computer.check(&store, &alice, "write", &file, "default", None).unwrap());

    let bob = Entity::user("bob");
    assert!(!computer.check(&store, &bob, "read", &file, "default", None).unwrap());
}

#[test]
fn test_ownership_implies_editing_and_viewing() {
    let (store, computer) = fixture();
    store.create(&grant("alice", "direct_owner", "/w/a.txt")).unwrap();

    let alice = Entity::user("alice");
    let file = Entity::file("/w/a.txt");
    for permission in ["owner", "editor", "viewer", "read", "write"] {
        assert!(
            computer.check(&store, &alice, permission, &file, "default", None).unwrap(),
            "owner should hold {permission}"
        );
    }
}

#[test]
fn test_parent_inheritance_via_tuple_to_userset() {
    let (store, computer) = fixture();
    store.create(&grant("alice", "direct_viewer", "/dir")).unwrap();
    store.create(&parent_edge("/dir/child.txt", "/dir")).unwrap();

    let alice = Entity::user("alice");
    let child = Entity::file("/dir/child.txt");
    assert!(computer.check(&store, &alice, "viewer", &child, "default", None).unwrap());
    assert!(computer.check(&store, &alice, "read", &child, "default", None).unwrap());
    assert!(!computer.check(&store, &alice, "write", &child, "default", None).unwrap());
}

#[test]
fn test_deep_parent_chain() {
    let (store, computer) = fixture();
    store.create(&grant("alice", "direct_editor", "/a")).unwrap();
    store.create(&parent_edge("/a/b", "/a")).unwrap();
    store.create(&parent_edge("/a/b/c", "/a/b")).unwrap();
    store.create(&parent_edge("/a/b/c/d.txt", "/a/b/c")).unwrap();

    let alice = Entity::user("alice");
    let deep = Entity::file("/a/b/c/d.txt");
    assert!(computer.check(&store, &alice, "write", &deep, "default", None).unwrap());
}

#[test]
fn test_userset_as_subject_expands_membership() {
    let (store, computer) = fixture();
    // Everyone with `member` on group:eng is a viewer of the file.
    store
        .create(
            &TupleRequest::new(Entity::group("eng"), "direct_viewer", Entity::file("/w/a.txt"))
                .as_userset("member"),
        )
        .unwrap();
    store
        .create(&TupleRequest::new(Entity::user("alice"), "member", Entity::group("eng")))
        .unwrap();

    let file = Entity::file("/w/a.txt");
    assert!(computer.check(&store, &Entity::user("alice"), "read", &file, "default", None).unwrap());
    assert!(!computer.check(&store, &Entity::user("bob"), "read", &file, "default", None).unwrap());
}

#[test]
fn test_concrete_group_subject_admits_members() {
    let (store, computer) = fixture();
    store
        .create(&TupleRequest::new(Entity::group("eng"), "direct_viewer", Entity::file("/w/a.txt")))
        .unwrap();
    store
        .create(&TupleRequest::new(Entity::user("alice"), "member", Entity::group("eng")))
        .unwrap();

    let file = Entity::file("/w/a.txt");
    assert!(computer.check(&store, &Entity::user("alice"), "read", &file, "default", None).unwrap());
}

#[test]
fn test_expired_tuple_does_not_grant() {
    let (store, computer) = fixture();
    store
        .create(
            &grant("alice", "direct_viewer", "/w/a.txt")
                .expiring_at(Timestamp(Timestamp::now().0 - 1)),
        )
        .unwrap();
    let file = Entity::file("/w/a.txt");
    assert!(!computer.check(&store, &Entity::user("alice"), "read", &file, "default", None).unwrap());
}

#[test]
fn test_conditions_gate_on_context() {
    let (store, computer) = fixture();
    store
        .create(
            &grant("alice", "direct_viewer", "/w/a.txt")
                .with_conditions(json!({ "device_tag": "trusted" })),
        )
        .unwrap();

    let alice = Entity::user("alice");
    let file = Entity::file("/w/a.txt");
    let trusted = json!({ "device_tag": "trusted" });
    assert!(computer.check(&store, &alice, "read", &file, "default", Some(&trusted)).unwrap());
    assert!(!computer.check(&store, &alice, "read", &file, "default", None).unwrap());
}

#[test]
fn test_intersection_and_exclusion() {
    let registry = NamespaceRegistry::with_defaults();
    registry.register(
        NamespaceConfig::new("doc")
            .relation("cleared", RelationExpr::This)
            .relation("staff", RelationExpr::This)
            .relation("banned", RelationExpr::This)
            .relation(
                "read",
                RelationExpr::Intersection(vec![
                    RelationExpr::computed("cleared"),
                    RelationExpr::computed("staff"),
                ]),
            )
            .relation(
                "comment",
                RelationExpr::Exclusion {
                    include: Box::new(RelationExpr::computed("staff")),
                    exclude: Box::new(RelationExpr::computed("banned")),
                },
            ),
    );
    let db = Db::open_in_memory().expect("open in-memory db");
    let store = test_store_on(db);
    let computer = PermissionComputer::new(Arc::new(registry), 50, 1000);

    let doc = Entity::new("doc", "handbook");
    let make = |user: &str, relation: &str| {
        TupleRequest::new(Entity::user(user), relation, doc.clone())
    };
    store.create(&make("alice", "cleared")).unwrap();
    store.create(&make("alice", "staff")).unwrap();
    store.create(&make("bob", "staff")).unwrap();
    store.create(&make("bob", "banned")).unwrap();

    assert!(computer.check(&store, &Entity::user("alice"), "read", &doc, "default", None).unwrap());
    assert!(!computer.check(&store, &Entity::user("bob"), "read", &doc, "default", None).unwrap());

    assert!(computer.check(&store, &Entity::user("alice"), "comment", &doc, "default", None).unwrap());
    assert!(!computer.check(&store, &Entity::user("bob"), "comment", &doc, "default", None).unwrap());
}

#[test]
fn test_snapshot_source_matches_store() {
    let (store, computer) = fixture();
    store.create(&grant("alice", "direct_viewer", "/dir")).unwrap();
    store.create(&parent_edge("/dir/child.txt", "/dir")).unwrap();

    let snapshot = TupleSnapshot::new(store.load_snapshot("default").unwrap());
    assert_eq!(snapshot.len(), 2);

    let alice = Entity::user("alice");
    let child = Entity::file("/dir/child.txt");
    let via_store = computer.check(&store, &alice, "read", &child, "default", None).unwrap();
    let via_snapshot = computer.check(&snapshot, &alice, "read", &child, "default", None).unwrap();
    assert_eq!(via_store, via_snapshot);
    assert!(via_snapshot);
}

#[test]
fn test_explain_trace_flags_granting_path() {
    let (store, computer) = fixture();
    store.create(&grant("alice", "direct_viewer", "/dir")).unwrap();
    store.create(&parent_edge("/dir/child.txt", "/dir")).unwrap();

    let mut trace = Vec::new();
    let granted = computer
        .check_with_trace(
            &store,
            &Entity::user("alice"),
            "read",
            &Entity::file("/dir/child.txt"),
            "default",
            None,
            &mut trace,
        )
        .unwrap();
    assert!(granted);
    assert!(!trace.is_empty());
    assert!(trace.iter().any(|step| step.granted));
    assert!(trace.iter().any(|step| step.rule.starts_with("tuple_to_userset")));
}

#[test]
fn test_cycle_in_tuples_terminates() {
    let (store, computer) = fixture();
    // Build a membership cycle directly through usersets.
    store
        .create(
            &TupleRequest::new(Entity::group("a"), "member", Entity::group("b"))
                .as_userset("member"),
        )
        .unwrap();
    store
        .create(
            &TupleRequest::new(Entity::group("b"), "member", Entity::group("a"))
                .as_userset("member"),
        )
        .unwrap();

    let result = computer
        .check(&store, &Entity::user("alice"), "member", &Entity::group("a"), "default", None)
        .unwrap();
    assert!(!result);
}

#[test]
fn test_expand_lists_direct_and_userset_subjects() {
    let (store, computer) = fixture();
    store.create(&grant("alice", "direct_viewer", "/w/a.txt")).unwrap();
    store
        .create(
            &TupleRequest::new(Entity::group("eng"), "direct_viewer", Entity::file("/w/a.txt"))
                .as_userset("member"),
        )
        .unwrap();
    store
        .create(&TupleRequest::new(Entity::user("bob"), "member", Entity::group("eng")))
        .unwrap();

    let subjects = computer
        .expand(&store, "viewer", &Entity::file("/w/a.txt"), "default")
        .unwrap();
    assert!(subjects.contains(&Entity::user("alice")));
    assert!(subjects.contains(&Entity::user("bob")));
}
