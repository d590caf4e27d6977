//! ReBAC end-to-end scenarios: inheritance, cross-zone shares, rename
//! propagation, all observed with no explicit cache flushes.

mod common;

use common::Fixture;
use nexus_fs::kernel::WriteOptions;
use nexus_fs::rebac::{Entity, TupleRequest};
use nexus_fs::NexusError;

#[tokio::test]
async fn directory_grant_inherits_to_children() {
    let fixture = Fixture::enforcing();
    let rebac = fixture.fs.rebac();
    let alice = fixture.ctx("alice");
    let bob = fixture.ctx("bob");

    rebac
        .create_tuple(&TupleRequest::new(
            Entity::user("alice"),
            "direct_owner",
            Entity::file("/dir"),
        ))
        .unwrap();
    fixture.fs.write("/dir/child.txt", b"x", &alice, WriteOptions::default()).await.unwrap();

    let grant = rebac
        .create_tuple(&TupleRequest::new(
            Entity::user("bob"),
            "direct_viewer",
            Entity::file("/dir"),
        ))
        .unwrap();
    assert!(rebac
        .check(&Entity::user("bob"), "viewer", &Entity::file("/dir/child.txt"), "default", None)
        .unwrap());
    assert_eq!(fixture.fs.read("/dir/child.txt", &bob).await.unwrap(), b"x");

    // Deleting the grant flips an immediate re-check, no flush involved.
    rebac.delete_tuple(grant).unwrap();
    assert!(!rebac
        .check(&Entity::user("bob"), "viewer", &Entity::file("/dir/child.txt"), "default", None)
        .unwrap());
    assert!(matches!(
        fixture.fs.read("/dir/child.txt", &bob).await,
        Err(NexusError::PermissionDenied { .. })
    ));
}

#[tokio::test]
async fn cross_zone_share_allows_only_shared_relations() {
    let fixture = Fixture::enforcing();
    let rebac = fixture.fs.rebac();

    rebac
        .create_tuple(
            &TupleRequest::new(
                Entity::user("bob"),
                "shared-viewer",
                Entity::file("/zone-a/doc.txt"),
            )
            .in_zone("zone-a")
            .subject_zone("zone-b"),
        )
        .unwrap();
    assert!(rebac
        .check(&Entity::user("bob"), "viewer", &Entity::file("/zone-a/doc.txt"), "zone-a", None)
        .unwrap());

    let denied = rebac.create_tuple(
        &TupleRequest::new(
            Entity::user("bob"),
            "direct_viewer",
            Entity::file("/zone-a/doc.txt"),
        )
        .in_zone("zone-a")
        .subject_zone("zone-b"),
    );
    assert!(matches!(denied, Err(NexusError::ValidationError { .. })));
}

#[tokio::test]
async fn rename_preserves_permissions() {
    let fixture = Fixture::enforcing();
    let rebac = fixture.fs.rebac();
    let alice = fixture.ctx("alice");

    rebac
        .create_tuple(&TupleRequest::new(
            Entity::user("alice"),
            "direct_owner",
            Entity::file("/a"),
        ))
        .unwrap();
    fixture.fs.write("/a/x", b"payload", &alice, WriteOptions::default()).await.unwrap();
    rebac
        .create_tuple(&TupleRequest::new(
            Entity::user("carol"),
            "direct_viewer",
            Entity::file("/a/x"),
        ))
        .unwrap();
    assert!(rebac
        .check(&Entity::user("carol"), "viewer", &Entity::file("/a/x"), "default", None)
        .unwrap());

    fixture.fs.rename("/a", "/b", &alice).await.unwrap();

    assert!(rebac
        .check(&Entity::user("carol"), "viewer", &Entity::file("/b/x"), "default", None)
        .unwrap());
    assert!(!rebac
        .check(&Entity::user("carol"), "viewer", &Entity::file("/a/x"), "default", None)
        .unwrap());

    let carol = fixture.ctx("carol");
    assert_eq!(fixture.fs.read("/b/x", &carol).await.unwrap(), b"payload");
}

#[tokio::test]
async fn parent_cycle_is_impossible() {
    let fixture = Fixture::enforcing();
    let rebac = fixture.fs.rebac();

    rebac
        .create_tuple(&TupleRequest::new(
            Entity::file("/a/b"),
            "parent",
            Entity::file("/a"),
        ))
        .unwrap();
    let cycle = rebac.create_tuple(&TupleRequest::new(
        Entity::file("/a"),
        "parent",
        Entity::file("/a/b"),
    ));
    assert!(matches!(cycle, Err(NexusError::ValidationError { .. })));
}

#[tokio::test]
async fn group_membership_grants_through_userset() {
    let fixture = Fixture::enforcing();
    let rebac = fixture.fs.rebac();
    let alice = fixture.ctx("alice");

    rebac
        .create_tuple(&TupleRequest::new(
            Entity::user("alice"),
            "direct_owner",
            Entity::file("/proj"),
        ))
        .unwrap();
    fixture.fs.write("/proj/spec.txt", b"body", &alice, WriteOptions::default()).await.unwrap();

    rebac
        .create_tuple(
            &TupleRequest::new(Entity::group("eng"), "direct_viewer", Entity::file("/proj"))
                .as_userset("member"),
        )
        .unwrap();
    rebac
        .create_tuple(&TupleRequest::new(Entity::user("dave"), "member", Entity::group("eng")))
        .unwrap();

    let dave = fixture.ctx("dave");
    assert_eq!(fixture.fs.read("/proj/spec.txt", &dave).await.unwrap(), b"body");

    let erin = fixture.ctx("erin");
    assert!(matches!(
        fixture.fs.read("/proj/spec.txt", &erin).await,
        Err(NexusError::PermissionDenied { .. })
    ));
}

#[tokio::test]
async fn explain_traces_the_inheritance_path() {
    let fixture = Fixture::enforcing();
    let rebac = fixture.fs.rebac();

    rebac
        .create_tuple(&TupleRequest::new(
            Entity::user("alice"),
            "direct_viewer",
            Entity::file("/dir"),
        ))
        .unwrap();
    rebac
        .create_tuple(&TupleRequest::new(
            Entity::file("/dir/child.txt"),
            "parent",
            Entity::file("/dir"),
        ))
        .unwrap();

    let explanation = rebac
        .explain(
            &Entity::user("alice"),
            "read",
            &Entity::file("/dir/child.txt"),
            "default",
            None,
        )
        .unwrap();
    assert!(explanation.result);
    let successful = explanation.successful_path.unwrap();
    assert!(successful.granted);
    assert!(!explanation.paths.is_empty());
}
