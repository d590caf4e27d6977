//! Content-addressed storage backends.
//!
//! A backend stores byte blobs keyed by their SHA-256 and keeps a
//! reference count per blob; identical content shares one physical slot.
//! The kernel drives backends purely through this trait.

mod local;
mod memory;

#[cfg(test)]
mod tests;

pub use local::LocalFsBackend;
pub use memory::MemoryBackend;

use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;

use crate::context::OperationContext;
use crate::error::{NexusError, NexusResult};

/// Lazy sequence of byte chunks produced by streaming reads.
pub type ByteStream = BoxStream<'static, NexusResult<Vec<u8>>>;

/// Capability flags the kernel consults when driving a backend.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct Capabilities {
    /// Path-oriented connector that can move files atomically.
    pub supports_rename: bool,
    /// Credentialed per-user connector; combined with `has_token_manager`
    /// the kernel bypasses the metadata catalog entirely.
    pub user_scoped: bool,
    pub has_token_manager: bool,
    /// Backend provides its own directory listing.
    pub has_virtual_filesystem: bool,
    /// Blobs live on local disk and may be read in bulk off-thread.
    pub supports_parallel_mmap_read: bool,
}

impl Capabilities {
    /// Dynamic connectors are served without consulting the catalog.
    pub fn is_dynamic(&self) -> bool {
        (self.user_scoped && self.has_token_manager) || self.has_virtual_filesystem
    }
}

/// Abstract content-addressed store.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Stable backend name recorded in file entries.
    fn name(&self) -> &str;

    fn capabilities(&self) -> Capabilities {
        Capabilities::default()
    }

    /// Stores `bytes`, returns the content hash. Idempotent; a repeated
    /// write of the same content increments the reference count.
    async fn write_content(&self, bytes: &[u8], ctx: &OperationContext) -> NexusResult<String>;

    async fn read_content(&self, hash: &str, ctx: &OperationContext) -> NexusResult<Vec<u8>>;

    /// Lazy chunked read of a whole blob.
    async fn stream_content(
        &self,
        hash: &str,
        chunk_size: usize,
        ctx: &OperationContext,
    ) -> NexusResult<ByteStream>;

    /// Lazy chunked read of the half-open byte range `[start, end)`.
    async fn stream_range(
        &self,
        hash: &str,
        start: u64,
        end: u64,
        chunk_size: usize,
        ctx: &OperationContext,
    ) -> NexusResult<ByteStream>;

    async fn get_content_size(&self, hash: &str, ctx: &OperationContext) -> NexusResult<u64>;

    /// Decrements the reference count; the blob is physically removed at
    /// zero. Unknown hashes are a no-op.
    async fn delete_content(&self, hash: &str, ctx: &OperationContext) -> NexusResult<()>;

    /// Streaming write. The default collects the stream and delegates to
    /// [`Backend::write_content`].
    async fn write_stream(
        &self,
        mut chunks: ByteStream,
        ctx: &OperationContext,
    ) -> NexusResult<String> {
        let mut bytes = Vec::new();
        while let Some(chunk) = chunks.next().await {
            bytes.extend_from_slice(&chunk?);
        }
        self.write_content(&bytes, ctx).await
    }

    /// Atomic move for path-oriented connectors; only meaningful when
    /// `supports_rename` is set.
    async fn rename_file(&self, _old_backend_path: &str, _new_backend_path: &str) -> NexusResult<()> {
        Err(NexusError::backend(format!("{} does not support rename", self.name())))
    }

    /// Bulk cache hint; backends without one return an empty map.
    async fn read_bulk_from_cache(
        &self,
        _paths: &[String],
        _original: bool,
    ) -> NexusResult<HashMap<String, Vec<u8>>> {
        Ok(HashMap::new())
    }

    /// Disk location of a blob; only meaningful when
    /// `supports_parallel_mmap_read` is set.
    fn hash_to_path(&self, _hash: &str) -> Option<PathBuf> {
        None
    }
}

/// Splits `bytes` into `chunk_size` pieces as a ready-made [`ByteStream`].
pub(crate) fn chunked_stream(bytes: Vec<u8>, chunk_size: usize) -> ByteStream {
    let chunk_size = chunk_size.max(1);
    let chunks: Vec<NexusResult<Vec<u8>>> =
        bytes.chunks(chunk_size).map(|chunk| Ok(chunk.to_vec())).collect();
    futures::stream::iter(chunks).boxed()
}

/// Slices the half-open range `[start, end)` out of a blob, clamped to its
/// length. A reversed range is a validation error.
pub(crate) fn slice_range(bytes: &[u8], start: u64, end: u64) -> NexusResult<Vec<u8>> {
    if start > end {
        return Err(NexusError::validation(format!("invalid range {start}..{end}")));
    }
    let len = bytes.len() as u64;
    let start = start.min(len) as usize;
    let end = end.min(len) as usize;
    Ok(bytes[start..end].to_vec())
}
