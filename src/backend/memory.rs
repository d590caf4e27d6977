//! In-memory CAS backend, the default for tests and single-process use.

use std::collections::HashMap;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::StreamExt;

use crate::content::hash_bytes;
use crate::context::OperationContext;
use crate::error::{NexusError, NexusResult};

use super::{chunked_stream, slice_range, Backend, ByteStream};

struct BlobSlot {
    data: Vec<u8>,
    refcount: u64,
}

/// CAS over a sharded in-memory map of hash to blob.
pub struct MemoryBackend {
    name: String,
    blobs: DashMap<String, BlobSlot>,
}

impl MemoryBackend {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), blobs: DashMap::new() }
    }

    /// Current reference count of a blob, 0 when absent.
    pub fn refcount(&self, hash: &str) -> u64 {
        self.blobs.get(hash).map(|slot| slot.refcount).unwrap_or(0)
    }

    /// Number of distinct blobs held.
    pub fn blob_count(&self) -> usize {
        self.blobs.len()
    }

    fn fetch(&self, hash: &str) -> NexusResult<Vec<u8>> {
        self.blobs
            .get(hash)
            .map(|slot| slot.data.clone())
            .ok_or_else(|| NexusError::backend(format!("unknown content hash {hash}")))
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new("memory")
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn write_content(&self, bytes: &[u8], _ctx: &OperationContext) -> NexusResult<String> {
        let hash = hash_bytes(bytes);
        self.blobs
            .entry(hash.clone())
            .and_modify(|slot| slot.refcount += 1)
            .or_insert_with(|| BlobSlot { data: bytes.to_vec(), refcount: 1 });
        Ok(hash)
    }

    async fn read_content(&self, hash: &str, _ctx: &OperationContext) -> NexusResult<Vec<u8>> {
        self.fetch(hash)
    }

    async fn stream_content(
        &self,
        hash: &str,
        chunk_size: usize,
        _ctx: &OperationContext,
    ) -> NexusResult<ByteStream> {
        Ok(chunked_stream(self.fetch(hash)?, chunk_size))
    }

    async fn stream_range(
        &self,
        hash: &str,
        start: u64,
        end: u64,
        chunk_size: usize,
        _ctx: &OperationContext,
    ) -> NexusResult<ByteStream> {
        let bytes = slice_range(&self.fetch(hash)?, start, end)?;
        Ok(chunked_stream(bytes, chunk_size))
    }

    async fn get_content_size(&self, hash: &str, _ctx: &OperationContext) -> NexusResult<u64> {
        self.blobs
            .get(hash)
            .map(|slot| slot.data.len() as u64)
            .ok_or_else(|| NexusError::backend(format!("unknown content hash {hash}")))
    }

    async fn delete_content(&self, hash: &str, _ctx: &OperationContext) -> NexusResult<()> {
        let remove = match self.blobs.get_mut(hash) {
            Some(mut slot) if slot.refcount > 1 => {
                slot.refcount -= 1;
                false
            }
            Some(_) => true,
            None => false,
        };
        if remove {
            self.blobs.remove(hash);
        }
        Ok(())
    }

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

    async fn read_bulk_from_cache(
        &self,
        paths: &[String],
        _original: bool,
    ) -> NexusResult<HashMap<String, Vec<u8>>> {
        let mut out = HashMap::new();
        for hash in paths {
            if let Some(slot) = self.blobs.get(hash) {
                out.insert(hash.clone(), slot.data.clone());
            }
        }
        Ok(out)
    }
}
