#![cfg(test)]

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::backend::{Backend, MemoryBackend};
use crate::error::{NexusError, NexusResult};
use crate::kernel::{NexusFs, WriteOptions};
use crate::metadata::FileEntry;
use crate::overlay::{OverlayResolver, WHITEOUT_MIME};
use crate::router::{Mount, OverlayConfig};

use super::ctx;

/// Base layer held in memory: path -> bytes hash-less entries, plus the
/// set of whiteouts the kernel asked for.
struct StubResolver {
    base: Mutex<Vec<(String, Vec<u8>)>>,
    whiteouts: Mutex<HashSet<String>>,
}

impl StubResolver {
    fn new(base: Vec<(&str, &[u8])>) -> Arc<Self> {
        Arc::new(Self {
            base: Mutex::new(
                base.into_iter().map(|(p, b)| (p.to_owned(), b.to_vec())).collect(),
            ),
            whiteouts: Mutex::new(HashSet::new()),
        })
    }
}

#[async_trait]
impl OverlayResolver for StubResolver {
    async fn resolve_read(
        &self,
        path: &str,
        _config: &OverlayConfig,
    ) -> NexusResult<Option<FileEntry>> {
        if self.whiteouts.lock().unwrap().contains(path) {
            let mut entry = FileEntry::new(path, "overlay-base");
            entry.mime_type = Some(WHITEOUT_MIME.to_owned());
            return Ok(Some(entry));
        }
        let base = self.base.lock().unwrap();
        Ok(base.iter().find(|(p, _)| p == path).map(|(p, bytes)| {
            let mut entry = FileEntry::new(p, "overlay-base");
            entry.content_hash = Some(crate::content::hash_bytes(bytes));
            entry.physical_path = entry.content_hash.clone().unwrap_or_default();
            entry.size = bytes.len() as u64;
            entry
        }))
    }

    async fn create_whiteout(&self, path: &str, _config: &OverlayConfig) -> NexusResult<()> {
        self.whiteouts.lock().unwrap().insert(path.to_owned());
        Ok(())
    }
}

fn overlay_kernel(resolver: Arc<StubResolver>) -> (NexusFs, Arc<MemoryBackend>) {
    let backend = Arc::new(MemoryBackend::default());
    let mount_backend: Arc<dyn crate::backend::Backend> = backend.clone();
    let fs = NexusFs::builder()
        .with_mount(
            Mount::new("/ws", mount_backend)
                .with_overlay(OverlayConfig { base_prefix: "/base".to_owned() }),
        )
        .with_overlay_resolver(resolver)
        .build()
        .unwrap();
    (fs, backend)
}

#[tokio::test]
async fn read_falls_through_to_base_layer() {
    let resolver = StubResolver::new(vec![("/ws/base-only.txt", b"from base")]);
    let (fs, backend) = overlay_kernel(Arc::clone(&resolver));
    let ctx = ctx("alice");

    // Seed the CAS so the base entry's hash resolves.
    backend.write_content(b"from base", &ctx).await.unwrap();

    let bytes = fs.read("/ws/base-only.txt", &ctx).await.unwrap();
    assert_eq!(bytes, b"from base");
}

#[tokio::test]
async fn upper_layer_shadows_base() {
    let resolver = StubResolver::new(vec![("/ws/doc.txt", b"base version")]);
    let (fs, _backend) = overlay_kernel(resolver);
    let ctx = ctx("alice");

    fs.write("/ws/doc.txt", b"upper version", &ctx, WriteOptions::default()).await.unwrap();
    assert_eq!(fs.read("/ws/doc.txt", &ctx).await.unwrap(), b"upper version");
}

#[tokio::test]
async fn delete_of_base_only_file_creates_whiteout() {
    let resolver = StubResolver::new(vec![("/ws/base-only.txt", b"from base")]);
    let (fs, backend) = overlay_kernel(Arc::clone(&resolver));
    let ctx = ctx("alice");
    backend.write_content(b"from base", &ctx).await.unwrap();

    let result = fs.delete("/ws/base-only.txt", &ctx).await.unwrap();
    assert!(result.deleted);
    assert!(result.overlay_whiteout);
    assert!(resolver.whiteouts.lock().unwrap().contains("/ws/base-only.txt"));

    // No metadata entry was created, and the whiteout hides the base.
    assert!(fs.metadata().get("/ws/base-only.txt").unwrap().is_none());
    assert!(matches!(
        fs.read("/ws/base-only.txt", &ctx).await,
        Err(NexusError::NotFound { .. })
    ));
}

#[tokio::test]
async fn delete_of_missing_path_without_base_is_not_found() {
    let resolver = StubResolver::new(vec![]);
    let (fs, _backend) = overlay_kernel(resolver);
    let ctx = ctx("alice");
    assert!(matches!(
        fs.delete("/ws/ghost.txt", &ctx).await,
        Err(NexusError::NotFound { .. })
    ));
}
