//! Disk-backed CAS: blobs under `<root>/objects/<aa>/<hash>`.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use dashmap::DashMap;
use futures::stream;
use futures::StreamExt;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, SeekFrom};

use crate::content::hash_bytes;
use crate::context::OperationContext;
use crate::error::{NexusError, NexusResult};

use super::{Backend, ByteStream, Capabilities};

/// CAS over a local directory tree.
///
/// Reference counts live in memory; after a restart a blob seen for the
/// first time counts as one reference.
pub struct LocalFsBackend {
    name: String,
    root: PathBuf,
    refcounts: DashMap<String, u64>,
}

impl LocalFsBackend {
    pub fn new(name: impl Into<String>, root: impl Into<PathBuf>) -> Self {
        Self { name: name.into(), root: root.into(), refcounts: DashMap::new() }
    }

    fn blob_path(&self, hash: &str) -> PathBuf {
        let shard = if hash.len() >= 2 { &hash[..2] } else { "00" };
        self.root.join("objects").join(shard).join(hash)
    }

    async fn ensure_parent(&self, path: &Path) -> NexusResult<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl Backend for LocalFsBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities { supports_parallel_mmap_read: true, ..Capabilities::default() }
    }

    async fn write_content(&self, bytes: &[u8], _ctx: &OperationContext) -> NexusResult<String> {
        let hash = hash_bytes(bytes);
        let path = self.blob_path(&hash);
        if fs::try_exists(&path).await? {
            *self.refcounts.entry(hash.clone()).or_insert(1) += 1;
            return Ok(hash);
        }
        self.ensure_parent(&path).await?;
        // Write-then-rename so a crashed write never leaves a partial blob
        // under its final name.
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, bytes).await?;
        fs::rename(&tmp, &path).await?;
        self.refcounts.insert(hash.clone(), 1);
        Ok(hash)
    }

    async fn read_content(&self, hash: &str, _ctx: &OperationContext) -> NexusResult<Vec<u8>> {
        let path = self.blob_path(hash);
        fs::read(&path)
            .await
            .map_err(|_| NexusError::backend(format!("unknown content hash {hash}")))
    }

    async fn stream_content(
        &self,
        hash: &str,
        chunk_size: usize,
        _ctx: &OperationContext,
    ) -> NexusResult<ByteStream> {
        let file = fs::File::open(self.blob_path(hash))
            .await
            .map_err(|_| NexusError::backend(format!("unknown content hash {hash}")))?;
        Ok(file_stream(file, u64::MAX, chunk_size))
    }

    async fn stream_range(
        &self,
        hash: &str,
        start: u64,
        end: u64,
        chunk_size: usize,
        _ctx: &OperationContext,
    ) -> NexusResult<ByteStream> {
        if start > end {
            return Err(NexusError::validation(format!("invalid range {start}..{end}")));
        }
        let mut file = fs::File::open(self.blob_path(hash))
            .await
            .map_err(|_| NexusError::backend(format!("unknown content hash {hash}")))?;
        file.seek(SeekFrom::Start(start)).await?;
        Ok(file_stream(file, end - start, chunk_size))
    }

    async fn get_content_size(&self, hash: &str, _ctx: &OperationContext) -> NexusResult<u64> {
        let meta = fs::metadata(self.blob_path(hash))
            .await
            .map_err(|_| NexusError::backend(format!("unknown content hash {hash}")))?;
        Ok(meta.len())
    }

    async fn delete_content(&self, hash: &str, _ctx: &OperationContext) -> NexusResult<()> {
        let path = self.blob_path(hash);
        if !fs::try_exists(&path).await? {
            self.refcounts.remove(hash);
            return Ok(());
        }
        let remaining = {
            let mut entry = self.refcounts.entry(hash.to_owned()).or_insert(1);
            *entry = entry.saturating_sub(1);
            *entry
        };
        if remaining == 0 {
            self.refcounts.remove(hash);
            fs::remove_file(&path).await?;
        }
        Ok(())
    }

    fn hash_to_path(&self, hash: &str) -> Option<PathBuf> {
        Some(self.blob_path(hash))
    }
}

/// Streams up to `limit` bytes from an open file in `chunk_size` pieces.
fn file_stream(file: fs::File, limit: u64, chunk_size: usize) -> ByteStream {
    let chunk_size = chunk_size.max(1);
    stream::unfold((file, limit), move |(mut file, remaining)| async move {
        if remaining == 0 {
            return None;
        }
        let want = chunk_size.min(remaining.min(usize::MAX as u64) as usize);
        let mut buf = vec![0u8; want];
        match file.read(&mut buf).await {
            Ok(0) => None,
            Ok(n) => {
                buf.truncate(n);
                Some((Ok(buf), (file, remaining - n as u64)))
            }
            Err(err) => Some((Err(NexusError::from(err)), (file, 0))),
        }
    })
    .boxed()
}
