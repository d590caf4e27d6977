//! Read-side operations: read, parsed views, ranges and streams.

use tracing::{debug, warn};

use crate::backend::ByteStream;
use crate::context::OperationContext;
use crate::error::{NexusError, NexusResult};
use crate::filter;
use crate::metadata::{FileEntry, Timestamp};
use crate::parser::{PARSED_TEXT_KEY, PARSER_NAME_KEY};

use super::{NexusFs, MEMORY_PREFIX};

/// Bytes plus the metadata view they were served under.
#[derive(Debug, Clone)]
pub struct ReadOutput {
    pub content: Vec<u8>,
    pub entry: FileEntry,
}

impl NexusFs {
    /// Plain read: the bytes of the current version.
    pub async fn read(&self, raw_path: &str, ctx: &OperationContext) -> NexusResult<Vec<u8>> {
        Ok(self.read_inner(raw_path, ctx, false).await?.content)
    }

    /// Read returning the metadata view alongside the bytes.
    pub async fn read_with_metadata(
        &self,
        raw_path: &str,
        ctx: &OperationContext,
    ) -> NexusResult<ReadOutput> {
        self.read_inner(raw_path, ctx, false).await
    }

    /// Read through the parser registry; returns parsed text bytes.
    pub async fn read_parsed(&self, raw_path: &str, ctx: &OperationContext) -> NexusResult<Vec<u8>> {
        Ok(self.read_inner(raw_path, ctx, true).await?.content)
    }

    pub(crate) async fn read_inner(
        &self,
        raw_path: &str,
        ctx: &OperationContext,
        parsed: bool,
    ) -> NexusResult<ReadOutput> {
        let virtual_path = self.validate(raw_path, ctx)?;

        if virtual_path.starts_with(MEMORY_PREFIX) {
            if let Some(memory) = &self.memory {
                let content = memory.read(&virtual_path, ctx).await?;
                let mut entry = FileEntry::new(&virtual_path, "memory-delegate");
                entry.size = content.len() as u64;
                ctx.record_read(&virtual_path);
                return Ok(ReadOutput { content, entry });
            }
        }

        self.check_permission(ctx, &virtual_path, "read", None)?;

        // Virtual parsed view: `<original>.md` over an existing original.
        if let Some(base_path) = virtual_path.strip_suffix(".md") {
            if !self.metadata.exists(&virtual_path)? {
                if let Some(base_entry) = self.metadata.get(base_path)? {
                    if let Some(output) = self.read_virtual_view(ctx, base_entry).await? {
                        ctx.record_read(&virtual_path);
                        return Ok(output);
                    }
                }
            }
        }

        let route = self.route(&virtual_path, ctx, false)?;
        let routed_ctx = ctx.routed(route.backend_path.clone(), virtual_path.clone());

        // Dynamic connectors bypass the catalog entirely.
        if route.backend.capabilities().is_dynamic() {
            let content = route.backend.read_content("", &routed_ctx).await?;
            let mut entry = FileEntry::new(&virtual_path, route.backend.name());
            entry.size = content.len() as u64;
            ctx.record_read(&virtual_path);
            return Ok(ReadOutput { content, entry });
        }

        let entry = match self.metadata.get(&virtual_path)? {
            Some(entry) => entry,
            None => self.resolve_overlay_entry(&virtual_path, &route).await?,
        };

        let mut content = match entry.content_hash.as_deref() {
            Some(hash) => route.backend.read_content(hash, &routed_ctx).await?,
            None => Vec::new(),
        };

        // Subject-specific column policy on CSV content; filter errors
        // fail open because the read itself was already authorized.
        if filter::is_csv_path(&virtual_path, entry.mime_type.as_deref()) {
            let subject = Self::subject(ctx);
            if let Some(config) = self.rebac.get_dynamic_viewer_config(&subject, &virtual_path) {
                match filter::apply_column_filter(&content, &config) {
                    Ok(filtered) => content = filtered,
                    Err(err) => {
                        warn!(path = %virtual_path, error = %err, "column filter failed; returning unfiltered content");
                    }
                }
            }
        }

        if parsed {
            content = self.parse_content(&virtual_path, &entry, content).await?;
        }

        ctx.record_read(&virtual_path);
        Ok(ReadOutput { content, entry })
    }

    /// Serves `<base>.md` by parsing the base file; the synthetic etag is
    /// the base hash with a `.md` suffix.
    async fn read_virtual_view(
        &self,
        ctx: &OperationContext,
        base_entry: FileEntry,
    ) -> NexusResult<Option<ReadOutput>> {
        let Some(parser) = self.parsers.find(&base_entry.path, base_entry.mime_type.as_deref())
        else {
            return Ok(None);
        };
        self.check_permission(ctx, &base_entry.path, "read", Some(&base_entry))?;
        let route = self.route(&base_entry.path, ctx, false)?;
        let routed_ctx = ctx.routed(route.backend_path.clone(), base_entry.path.clone());
        let bytes = match base_entry.content_hash.as_deref() {
            Some(hash) => route.backend.read_content(hash, &routed_ctx).await?,
            None => Vec::new(),
        };
        let text = parser.parse(&base_entry.path, &bytes)?;
        let mut entry = base_entry.clone();
        entry.path = format!("{}.md", base_entry.path);
        entry.content_hash = base_entry.content_hash.map(|hash| format!("{hash}.md"));
        entry.mime_type = Some("text/markdown".to_owned());
        entry.size = text.len() as u64;
        Ok(Some(ReadOutput { content: text.into_bytes(), entry }))
    }

    /// Upper-layer miss: consult the overlay resolver, surfacing a
    /// whiteout as not-found.
    async fn resolve_overlay_entry(
        &self,
        virtual_path: &str,
        route: &crate::router::Route,
    ) -> NexusResult<FileEntry> {
        if let (Some(resolver), Some(overlay)) = (&self.overlay, &route.overlay) {
            if let Some(entry) = resolver.resolve_read(virtual_path, overlay).await? {
                if resolver.is_whiteout(&entry) {
                    debug!(path = %virtual_path, "overlay whiteout hides base-layer file");
                    return Err(NexusError::not_found(virtual_path));
                }
                return Ok(entry);
            }
        }
        Err(NexusError::not_found(virtual_path))
    }

    /// Parsed text, cached under the KV attribute surface.
    async fn parse_content(
        &self,
        virtual_path: &str,
        entry: &FileEntry,
        content: Vec<u8>,
    ) -> NexusResult<Vec<u8>> {
        if let Some(cached) = self.metadata.get_file_metadata(virtual_path, PARSED_TEXT_KEY)? {
            if let Some(text) = cached.as_str() {
                return Ok(text.as_bytes().to_vec());
            }
        }
        let Some(parser) = self.parsers.find(virtual_path, entry.mime_type.as_deref()) else {
            return Err(NexusError::validation(format!("no parser registered for {virtual_path}")));
        };
        let text = parser.parse(virtual_path, &content)?;
        let stores = [
            (PARSED_TEXT_KEY, serde_json::Value::from(text.clone())),
            (PARSER_NAME_KEY, serde_json::Value::from(parser.name().to_owned())),
            (
                crate::parser::PARSED_AT_KEY,
                serde_json::Value::from(Timestamp::now().0),
            ),
        ];
        for (key, value) in &stores {
            if let Err(err) = self.metadata.set_file_metadata(virtual_path, key, value) {
                warn!(path = %virtual_path, key, error = %err, "failed to cache parse result");
            }
        }
        Ok(text.into_bytes())
    }

    /// Bytes of the half-open range `[start, end)`.
    pub async fn read_range(
        &self,
        raw_path: &str,
        start: u64,
        end: u64,
        ctx: &OperationContext,
    ) -> NexusResult<Vec<u8>> {
        if start > end {
            return Err(NexusError::validation(format!("invalid range {start}..{end}")));
        }
        let virtual_path = self.validate(raw_path, ctx)?;
        self.check_permission(ctx, &virtual_path, "read", None)?;
        let route = self.route(&virtual_path, ctx, false)?;
        let routed_ctx = ctx.routed(route.backend_path.clone(), virtual_path.clone());
        let entry = self
            .metadata
            .get(&virtual_path)?
            .ok_or_else(|| NexusError::not_found(&virtual_path))?;
        let Some(hash) = entry.content_hash.as_deref() else {
            return Ok(Vec::new());
        };
        let mut stream = route.backend.stream_range(hash, start, end, 64 * 1024, &routed_ctx).await?;
        let mut out = Vec::new();
        use futures::StreamExt;
        while let Some(chunk) = stream.next().await {
            out.extend_from_slice(&chunk?);
        }
        ctx.record_read(&virtual_path);
        Ok(out)
    }

    /// Lazy chunked read of the whole file.
    pub async fn stream(
        &self,
        raw_path: &str,
        chunk_size: usize,
        ctx: &OperationContext,
    ) -> NexusResult<ByteStream> {
        let virtual_path = self.validate(raw_path, ctx)?;
        self.check_permission(ctx, &virtual_path, "read", None)?;
        let route = self.route(&virtual_path, ctx, false)?;
        let routed_ctx = ctx.routed(route.backend_path.clone(), virtual_path.clone());
        let entry = self
            .metadata
            .get(&virtual_path)?
            .ok_or_else(|| NexusError::not_found(&virtual_path))?;
        let hash = entry
            .content_hash
            .ok_or_else(|| NexusError::not_found(&virtual_path))?;
        ctx.record_read(&virtual_path);
        route.backend.stream_content(&hash, chunk_size, &routed_ctx).await
    }

    /// Lazy chunked read of a byte range.
    pub async fn stream_range(
        &self,
        raw_path: &str,
        start: u64,
        end: u64,
        chunk_size: usize,
        ctx: &OperationContext,
    ) -> NexusResult<ByteStream> {
        let virtual_path = self.validate(raw_path, ctx)?;
        self.check_permission(ctx, &virtual_path, "read", None)?;
        let route = self.route(&virtual_path, ctx, false)?;
        let routed_ctx = ctx.routed(route.backend_path.clone(), virtual_path.clone());
        let entry = self
            .metadata
            .get(&virtual_path)?
            .ok_or_else(|| NexusError::not_found(&virtual_path))?;
        let hash = entry
            .content_hash
            .ok_or_else(|| NexusError::not_found(&virtual_path))?;
        ctx.record_read(&virtual_path);
        route.backend.stream_range(&hash, start, end, chunk_size, &routed_ctx).await
    }
}
