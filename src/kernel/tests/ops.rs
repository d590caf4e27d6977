#![cfg(test)]

use crate::content::hash_bytes;
use crate::edit::EditRequest;
use crate::error::NexusError;
use crate::kernel::{EditOptions, WriteOptions};

use super::{ctx, kernel};

#[tokio::test]
async fn write_read_round_trip() {
    let fs = kernel();
    let ctx = ctx("alice");

    let result = fs.write("/w/a.txt", b"v1", &ctx, WriteOptions::default()).await.unwrap();
    assert_eq!(result.version, 1);
    assert_eq!(result.etag, hash_bytes(b"v1"));
    assert_eq!(result.size, 2);
    assert!(result.zookie.revision > 0);

    assert_eq!(fs.read("/w/a.txt", &ctx).await.unwrap(), b"v1");

    let output = fs.read_with_metadata("/w/a.txt", &ctx).await.unwrap();
    assert_eq!(output.entry.current_version, 1);
    assert_eq!(output.entry.etag(), Some(result.etag.as_str()));
}

#[tokio::test]
async fn versions_increment_and_history_is_kept() {
    let fs = kernel();
    let ctx = ctx("alice");
    let v1 = fs.write("/w/a.txt", b"one", &ctx, WriteOptions::default()).await.unwrap();
    let v2 = fs.write("/w/a.txt", b"two", &ctx, WriteOptions::default()).await.unwrap();
    assert_eq!(v2.version, v1.version + 1);
    assert!(v2.zookie.revision > v1.zookie.revision);

    let versions = fs.list_versions("/w/a.txt", &ctx).await.unwrap();
    assert_eq!(versions.len(), 2);
    assert_eq!(fs.read_version("/w/a.txt", 1, &ctx).await.unwrap(), b"one");
}

#[tokio::test]
async fn duplicate_content_shares_one_blob() {
    let fs = kernel();
    let ctx = ctx("alice");
    let first = fs.write("/w/a.txt", b"same", &ctx, WriteOptions::default()).await.unwrap();
    let second = fs.write("/w/a.txt", b"same", &ctx, WriteOptions::default()).await.unwrap();
    assert_eq!(first.etag, second.etag);
    assert_eq!(second.version, 2);
}

#[tokio::test]
async fn if_none_match_rejects_existing() {
    let fs = kernel();
    let ctx = ctx("alice");
    fs.write("/w/a.txt", b"v1", &ctx, WriteOptions::default()).await.unwrap();
    let err = fs.write("/w/a.txt", b"v2", &ctx, WriteOptions::create_only()).await.unwrap_err();
    assert!(matches!(err, NexusError::FileExists { .. }));
}

#[tokio::test]
async fn if_match_conflict_has_no_side_effects() {
    let fs = kernel();
    let ctx = ctx("alice");
    let v1 = fs.write("/w/a.txt", b"v1", &ctx, WriteOptions::default()).await.unwrap();
    fs.write("/w/a.txt", b"v2", &ctx, WriteOptions::if_match(v1.etag.clone())).await.unwrap();

    let err = fs
        .write("/w/a.txt", b"v3", &ctx, WriteOptions::if_match(v1.etag.clone()))
        .await
        .unwrap_err();
    match err {
        NexusError::Conflict { expected, current } => {
            assert_eq!(expected.as_deref(), Some(v1.etag.as_str()));
            assert_eq!(current.as_deref(), Some(hash_bytes(b"v2").as_str()));
        }
        other => panic!("expected Conflict, got {other:?}"),
    }

    // No version bump, no content change.
    assert_eq!(fs.read("/w/a.txt", &ctx).await.unwrap(), b"v2");
    let output = fs.read_with_metadata("/w/a.txt", &ctx).await.unwrap();
    assert_eq!(output.entry.current_version, 2);
}

#[tokio::test]
async fn lock_option_is_rejected_in_async_context() {
    let fs = kernel();
    let ctx = ctx("alice");
    let options = WriteOptions { lock: true, ..WriteOptions::default() };
    let err = fs.write("/w/a.txt", b"v1", &ctx, options).await.unwrap_err();
    assert!(matches!(err, NexusError::ValidationError { .. }));
    assert!(err.to_string().contains("atomic_update"));
}

#[tokio::test]
async fn delete_then_read_is_not_found() {
    let fs = kernel();
    let ctx = ctx("alice");
    fs.write("/w/a.txt", b"v1", &ctx, WriteOptions::default()).await.unwrap();
    let deleted = fs.delete("/w/a.txt", &ctx).await.unwrap();
    assert!(deleted.deleted);
    assert!(!deleted.overlay_whiteout);
    assert!(matches!(
        fs.read("/w/a.txt", &ctx).await,
        Err(NexusError::NotFound { .. })
    ));
    assert!(matches!(
        fs.delete("/w/a.txt", &ctx).await,
        Err(NexusError::NotFound { .. })
    ));
}

#[tokio::test]
async fn rename_round_trip_restores_state() {
    let fs = kernel();
    let ctx = ctx("alice");
    fs.write("/w/a.txt", b"payload", &ctx, WriteOptions::default()).await.unwrap();

    fs.rename("/w/a.txt", "/w/b.txt", &ctx).await.unwrap();
    assert_eq!(fs.read("/w/b.txt", &ctx).await.unwrap(), b"payload");
    assert!(!fs.exists("/w/a.txt", &ctx).await.unwrap());

    fs.rename("/w/b.txt", "/w/a.txt", &ctx).await.unwrap();
    assert_eq!(fs.read("/w/a.txt", &ctx).await.unwrap(), b"payload");
}

#[tokio::test]
async fn rename_rejects_missing_source_and_existing_destination() {
    let fs = kernel();
    let ctx = ctx("alice");
    assert!(matches!(
        fs.rename("/w/missing", "/w/x", &ctx).await,
        Err(NexusError::NotFound { .. })
    ));

    fs.write("/w/a.txt", b"a", &ctx, WriteOptions::default()).await.unwrap();
    fs.write("/w/b.txt", b"b", &ctx, WriteOptions::default()).await.unwrap();
    assert!(matches!(
        fs.rename("/w/a.txt", "/w/b.txt", &ctx).await,
        Err(NexusError::FileExists { .. })
    ));
}

#[tokio::test]
async fn rename_directory_moves_subtree() {
    let fs = kernel();
    let ctx = ctx("alice");
    fs.write("/a/x.txt", b"x", &ctx, WriteOptions::default()).await.unwrap();
    fs.write("/a/sub/y.txt", b"y", &ctx, WriteOptions::default()).await.unwrap();

    fs.rename("/a", "/b", &ctx).await.unwrap();
    assert_eq!(fs.read("/b/x.txt", &ctx).await.unwrap(), b"x");
    assert_eq!(fs.read("/b/sub/y.txt", &ctx).await.unwrap(), b"y");
    assert!(!fs.exists("/a/x.txt", &ctx).await.unwrap());
}

#[tokio::test]
async fn append_creates_then_extends() {
    let fs = kernel();
    let ctx = ctx("alice");
    fs.append("/w/log.txt", b"one\n", &ctx, WriteOptions::default()).await.unwrap();
    let result = fs.append("/w/log.txt", b"two\n", &ctx, WriteOptions::default()).await.unwrap();
    assert_eq!(result.version, 2);
    assert_eq!(fs.read("/w/log.txt", &ctx).await.unwrap(), b"one\ntwo\n");
}

#[tokio::test]
async fn edit_applies_and_preview_does_not_write() {
    let fs = kernel();
    let ctx = ctx("alice");
    fs.write("/w/code.txt", b"fn main() {}\n", &ctx, WriteOptions::default()).await.unwrap();

    let preview = fs
        .edit(
            "/w/code.txt",
            &[EditRequest::new("main", "start")],
            &ctx,
            EditOptions::preview(),
        )
        .await
        .unwrap();
    assert!(preview.preview);
    assert_eq!(fs.read("/w/code.txt", &ctx).await.unwrap(), b"fn main() {}\n");

    let applied = fs
        .edit("/w/code.txt", &[EditRequest::new("main", "start")], &ctx, EditOptions::new())
        .await
        .unwrap();
    assert!(!applied.preview);
    assert_eq!(applied.version, 2);
    assert_eq!(fs.read("/w/code.txt", &ctx).await.unwrap(), b"fn start() {}\n");
}

#[tokio::test]
async fn edit_refuses_non_utf8() {
    let fs = kernel();
    let ctx = ctx("alice");
    fs.write("/w/bin", &[0xff, 0xfe, 0x00], &ctx, WriteOptions::default()).await.unwrap();
    let err = fs
        .edit("/w/bin", &[EditRequest::new("a", "b")], &ctx, EditOptions::new())
        .await
        .unwrap_err();
    assert!(matches!(err, NexusError::ValidationError { .. }));
    // Nothing was written.
    let output = fs.read_with_metadata("/w/bin", &ctx).await.unwrap();
    assert_eq!(output.entry.current_version, 1);
}

#[tokio::test]
async fn stat_and_exists_cover_implicit_directories() {
    let fs = kernel();
    let ctx = ctx("alice");
    fs.write("/w/sub/a.txt", b"x", &ctx, WriteOptions::default()).await.unwrap();

    let file_stat = fs.stat("/w/sub/a.txt", &ctx).await.unwrap();
    assert!(!file_stat.is_directory);
    assert_eq!(file_stat.size, 1);

    let dir_stat = fs.stat("/w/sub", &ctx).await.unwrap();
    assert!(dir_stat.is_directory);

    assert!(fs.exists("/w/sub", &ctx).await.unwrap());
    assert!(fs.exists("/w/sub/a.txt", &ctx).await.unwrap());
    assert!(!fs.exists("/w/ghost", &ctx).await.unwrap());
}

#[tokio::test]
async fn read_range_and_stream() {
    use futures::StreamExt;
    let fs = kernel();
    let ctx = ctx("alice");
    fs.write("/w/data.bin", b"0123456789", &ctx, WriteOptions::default()).await.unwrap();

    assert_eq!(fs.read_range("/w/data.bin", 2, 6, &ctx).await.unwrap(), b"2345");
    assert!(matches!(
        fs.read_range("/w/data.bin", 6, 2, &ctx).await,
        Err(NexusError::ValidationError { .. })
    ));

    let mut stream = fs.stream("/w/data.bin", 3, &ctx).await.unwrap();
    let mut collected = Vec::new();
    while let Some(chunk) = stream.next().await {
        collected.extend_from_slice(&chunk.unwrap());
    }
    assert_eq!(collected, b"0123456789");
}

#[tokio::test]
async fn write_batch_matches_sequential_writes() {
    let fs = kernel();
    let ctx = ctx("alice");
    let results = fs
        .write_batch(
            &[("/w/a.txt".to_owned(), b"a".to_vec()), ("/w/b.txt".to_owned(), b"b".to_vec())],
            &ctx,
        )
        .await
        .unwrap();
    assert_eq!(results.len(), 2);
    assert_eq!(results[0].version, 1);
    assert_eq!(fs.read("/w/a.txt", &ctx).await.unwrap(), b"a");
    assert_eq!(fs.read("/w/b.txt", &ctx).await.unwrap(), b"b");
}

#[tokio::test]
async fn read_bulk_with_skip_errors() {
    let fs = kernel();
    let ctx = ctx("alice");
    fs.write("/w/a.txt", b"a", &ctx, WriteOptions::default()).await.unwrap();
    fs.write("/w/b.txt", b"b", &ctx, WriteOptions::default()).await.unwrap();

    let paths =
        vec!["/w/a.txt".to_owned(), "/w/missing.txt".to_owned(), "/w/b.txt".to_owned()];
    let results = fs.read_bulk(&paths, &ctx, true).await.unwrap();
    assert_eq!(results[0].as_deref(), Some(&b"a"[..]));
    assert!(results[1].is_none());
    assert_eq!(results[2].as_deref(), Some(&b"b"[..]));

    assert!(matches!(
        fs.read_bulk(&paths, &ctx, false).await,
        Err(NexusError::NotFound { .. })
    ));
}

#[tokio::test]
async fn rollback_restores_bytes_by_reference() {
    let fs = kernel();
    let ctx = ctx("alice");
    fs.write("/w/doc.txt", b"A", &ctx, WriteOptions::default()).await.unwrap();
    fs.write("/w/doc.txt", b"B", &ctx, WriteOptions::default()).await.unwrap();
    fs.write("/w/doc.txt", b"C", &ctx, WriteOptions::default()).await.unwrap();

    let (entry, _zookie) = fs.rollback("/w/doc.txt", 2, &ctx).await.unwrap();
    assert_eq!(entry.current_version, 4);
    assert_eq!(fs.read("/w/doc.txt", &ctx).await.unwrap(), b"B");
    assert_eq!(
        fs.read("/w/doc.txt", &ctx).await.unwrap(),
        fs.read_version("/w/doc.txt", 2, &ctx).await.unwrap()
    );
}

#[tokio::test]
async fn atomic_update_read_modify_write() {
    let fs = kernel();
    let ctx = ctx("alice");
    fs.write("/w/counter", b"1", &ctx, WriteOptions::default()).await.unwrap();
    let result = fs
        .atomic_update("/w/counter", &ctx, |bytes| {
            let current: u64 = String::from_utf8_lossy(&bytes).parse().unwrap_or(0);
            (current + 1).to_string().into_bytes()
        })
        .await
        .unwrap();
    assert_eq!(result.version, 2);
    assert_eq!(fs.read("/w/counter", &ctx).await.unwrap(), b"2");
}

#[tokio::test]
async fn wait_for_revision_observes_writes() {
    use std::time::Duration;
    let fs = kernel();
    let ctx = ctx("alice");
    let result = fs.write("/w/a.txt", b"v1", &ctx, WriteOptions::default()).await.unwrap();
    let observed = fs
        .wait_for_revision("default", result.zookie.revision, Duration::from_secs(1))
        .await
        .unwrap();
    assert!(observed >= result.zookie.revision);

    let err = fs
        .wait_for_revision("default", result.zookie.revision + 100, Duration::from_millis(50))
        .await
        .unwrap_err();
    assert!(matches!(err, NexusError::LockTimeout { .. }));
}

#[tokio::test]
async fn system_prefix_is_reserved() {
    let fs = kernel();
    let user = ctx("alice");
    assert!(matches!(
        fs.write("/__sys__/zones/z", b"x", &user, WriteOptions::default()).await,
        Err(NexusError::InvalidPath { .. })
    ));

    // Admin contexts may touch kernel-private paths.
    let admin = crate::context::OperationContext::admin("root");
    assert!(fs.write("/__sys__/zones/z", b"x", &admin, WriteOptions::default()).await.is_ok());

    // And user listings never show them.
    fs.write("/w/a.txt", b"x", &user, WriteOptions::default()).await.unwrap();
    let listed = fs.list("/", true, &user).await.unwrap();
    assert!(listed.iter().all(|entry| !entry.path.starts_with("/__sys__/")));
}

#[tokio::test]
async fn close_drains_cleanly() {
    let fs = kernel();
    let ctx = ctx("alice");
    fs.write("/w/a.txt", b"v1", &ctx, WriteOptions::default()).await.unwrap();
    fs.close().await.unwrap();
}
