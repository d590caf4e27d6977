//! Write-side operations: write, batch write, streaming write, append
//! and locked updates.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::backend::ByteStream;
use crate::context::OperationContext;
use crate::error::{NexusError, NexusResult};
use crate::events::FileEventType;
use crate::metadata::{FileEntry, Timestamp, Zookie};
use crate::parser::{
    log_parse_failure, PARSED_AT_KEY, PARSED_TEXT_KEY, PARSER_NAME_KEY,
};

use super::NexusFs;

/// Optimistic-concurrency and locking options for one write.
#[derive(Debug, Clone, Default)]
pub struct WriteOptions {
    /// Fail with `Conflict` unless the current etag equals this.
    pub if_match: Option<String>,
    /// Fail with `FileExists` when the path already exists.
    pub if_none_match: bool,
    /// Skip the optimistic-concurrency checks.
    pub force: bool,
    /// Acquire a distributed lock for the write. Rejected under the
    /// cooperative runtime: use [`NexusFs::atomic_update`] or
    /// [`NexusFs::locked`] instead.
    pub lock: bool,
    pub lock_timeout: Option<Duration>,
}

impl WriteOptions {
    pub fn if_match(etag: impl Into<String>) -> Self {
        Self { if_match: Some(etag.into()), ..Self::default() }
    }

    pub fn create_only() -> Self {
        Self { if_none_match: true, ..Self::default() }
    }

    pub fn forced() -> Self {
        Self { force: true, ..Self::default() }
    }
}

/// What a successful write reports back.
#[derive(Debug, Clone, PartialEq)]
pub struct WriteResult {
    pub etag: String,
    pub version: u64,
    pub modified_at: Timestamp,
    pub size: u64,
    pub zookie: Zookie,
}

impl NexusFs {
    /// Writes `content` to `raw_path`, creating the path on first write.
    pub async fn write(
        &self,
        raw_path: &str,
        content: &[u8],
        ctx: &OperationContext,
        options: WriteOptions,
    ) -> NexusResult<WriteResult> {
        if options.lock {
            // One scheduling model per build: blocking on a distributed
            // lock inside the cooperative runtime would stall the
            // executor.
            return Err(NexusError::validation(
                "write(lock=true) is not available from async context; use atomic_update or locked()",
            ));
        }
        self.write_unlocked(raw_path, content, ctx, options).await
    }

    /// UTF-8 string convenience wrapper.
    pub async fn write_str(
        &self,
        raw_path: &str,
        content: &str,
        ctx: &OperationContext,
        options: WriteOptions,
    ) -> NexusResult<WriteResult> {
        self.write(raw_path, content.as_bytes(), ctx, options).await
    }

    pub(crate) async fn write_unlocked(
        &self,
        raw_path: &str,
        content: &[u8],
        ctx: &OperationContext,
        options: WriteOptions,
    ) -> NexusResult<WriteResult> {
        let virtual_path = self.validate(raw_path, ctx)?;
        let route = self.route(&virtual_path, ctx, true)?;
        let routed_ctx = ctx.routed(route.backend_path.clone(), virtual_path.clone());

        // One snapshot of the current entry serves the permission check,
        // the concurrency check and the observer undo record.
        let existing = self.metadata.get(&virtual_path)?;

        match &existing {
            Some(entry) => {
                self.check_permission(ctx, &virtual_path, "write", Some(entry))?;
            }
            None => {
                if let Some(parent) = crate::path::parent(&virtual_path) {
                    self.check_permission(ctx, parent, "write", None)?;
                }
            }
        }

        if !options.force {
            if options.if_none_match && existing.is_some() {
                return Err(NexusError::FileExists { path: virtual_path });
            }
            if let Some(expected) = &options.if_match {
                let current = existing.as_ref().and_then(|e| e.content_hash.clone());
                if current.as_deref() != Some(expected.as_str()) {
                    return Err(NexusError::Conflict {
                        expected: Some(expected.clone()),
                        current,
                    });
                }
            }
        }

        let new_hash = route.backend.write_content(content, &routed_ctx).await?;
        // The previous blob stays: version history references it and the
        // CAS ref-count reclaims it when the last reference goes.

        let is_new = existing.is_none();
        let mut entry = FileEntry::new(&virtual_path, route.backend.name());
        entry.physical_path = new_hash.clone();
        entry.content_hash = Some(new_hash.clone());
        entry.size = content.len() as u64;
        entry.mime_type = guess_mime(&virtual_path);
        entry.tenant_id = ctx.tenant_id.clone();
        entry.created_by = Some(ctx.user.clone());
        if is_new {
            entry.owner_id = Some(ctx.subject().1);
        }

        let (stored, revision) = self.metadata.put(&entry, ctx.zone())?;

        if is_new {
            self.rebac.grants().on_file_created(&virtual_path);
            self.materialize_creation_grants(ctx, &virtual_path)?;
        } else {
            // New content invalidates any cached parse.
            self.metadata.delete_file_metadata(
                &virtual_path,
                &[PARSED_TEXT_KEY, PARSED_AT_KEY, PARSER_NAME_KEY],
            )?;
        }

        if let Some(observer) = &self.observer {
            let outcome = observer
                .on_write(
                    &stored,
                    is_new,
                    &virtual_path,
                    ctx.zone(),
                    ctx.agent_id.as_deref(),
                    existing.as_ref().and_then(|e| e.content_hash.as_deref()),
                    existing.as_ref(),
                )
                .await;
            self.observer_outcome("write", outcome)?;
        }

        if self.config.kernel.auto_parse {
            self.spawn_background_parse(&virtual_path, &stored, content.to_vec());
        }

        let event = Self::build_event(
            FileEventType::FileWrite,
            &virtual_path,
            ctx,
            Some(&stored),
            Some(revision),
        );
        self.fan_out("FILE_WRITE", event);
        self.notify_revision(ctx.zone());

        Ok(WriteResult {
            etag: new_hash,
            version: stored.current_version,
            modified_at: stored.modified_at,
            size: stored.size,
            zookie: self.zookie(ctx, revision),
        })
    }

    /// Validates, routes and permission-checks every file up front, then
    /// lands all rows in one catalog transaction.
    pub async fn write_batch(
        &self,
        files: &[(String, Vec<u8>)],
        ctx: &OperationContext,
    ) -> NexusResult<Vec<WriteResult>> {
        let started = std::time::Instant::now();
        let mut validated = Vec::with_capacity(files.len());
        for (raw_path, _) in files {
            validated.push(self.validate(raw_path, ctx)?);
        }
        let mut routes = Vec::with_capacity(files.len());
        for virtual_path in &validated {
            routes.push(self.route(virtual_path, ctx, true)?);
        }
        let existing = self.metadata.get_batch(&validated)?;
        for virtual_path in &validated {
            match existing.get(virtual_path).and_then(|e| e.as_ref()) {
                Some(entry) => {
                    self.check_permission(ctx, virtual_path, "write", Some(entry))?
                }
                None => {
                    if let Some(parent) = crate::path::parent(virtual_path) {
                        self.check_permission(ctx, parent, "write", None)?;
                    }
                }
            }
        }

        let mut entries = Vec::with_capacity(files.len());
        for ((virtual_path, route), (_, content)) in
            validated.iter().zip(&routes).zip(files)
        {
            let routed_ctx = ctx.routed(route.backend_path.clone(), virtual_path.clone());
            let hash = route.backend.write_content(content, &routed_ctx).await?;
            let mut entry = FileEntry::new(virtual_path, route.backend.name());
            entry.physical_path = hash.clone();
            entry.content_hash = Some(hash);
            entry.size = content.len() as u64;
            entry.mime_type = guess_mime(virtual_path);
            entry.tenant_id = ctx.tenant_id.clone();
            entry.created_by = Some(ctx.user.clone());
            if existing.get(virtual_path).map(|e| e.is_none()).unwrap_or(true) {
                entry.owner_id = Some(ctx.subject().1);
            }
            entries.push(entry);
        }

        let (stored, revision) = self.metadata.put_batch(&entries, ctx.zone())?;

        for virtual_path in &validated {
            let is_new = existing.get(virtual_path).map(|e| e.is_none()).unwrap_or(true);
            if is_new {
                self.rebac.grants().on_file_created(virtual_path);
                self.materialize_creation_grants(ctx, virtual_path)?;
            }
        }

        if let Some(observer) = &self.observer {
            let outcome =
                observer.on_write_batch(&stored, ctx.zone(), ctx.agent_id.as_deref()).await;
            self.observer_outcome("write_batch", outcome)?;
        }

        let mut results = Vec::with_capacity(stored.len());
        for entry in &stored {
            let event = Self::build_event(
                FileEventType::FileWrite,
                &entry.path,
                ctx,
                Some(entry),
                Some(revision),
            );
            self.fan_out("FILE_WRITE", event);
            results.push(WriteResult {
                etag: entry.content_hash.clone().unwrap_or_default(),
                version: entry.current_version,
                modified_at: entry.modified_at,
                size: entry.size,
                zookie: self.zookie(ctx, revision),
            });
        }
        self.notify_revision(ctx.zone());

        let elapsed = started.elapsed();
        if !files.is_empty() {
            let per_file = elapsed / files.len() as u32;
            if per_file > Duration::from_millis(50) {
                warn!(files = files.len(), ?per_file, "write_batch exceeded per-file budget");
            } else {
                debug!(files = files.len(), ?per_file, "write_batch completed");
            }
        }
        Ok(results)
    }

    /// Streams chunks into the backend, then records the entry.
    pub async fn write_stream(
        &self,
        raw_path: &str,
        chunks: ByteStream,
        ctx: &OperationContext,
    ) -> NexusResult<WriteResult> {
        let virtual_path = self.validate(raw_path, ctx)?;
        let route = self.route(&virtual_path, ctx, true)?;
        let routed_ctx = ctx.routed(route.backend_path.clone(), virtual_path.clone());

        let existing = self.metadata.get(&virtual_path)?;
        match &existing {
            Some(entry) => self.check_permission(ctx, &virtual_path, "write", Some(entry))?,
            None => {
                if let Some(parent) = crate::path::parent(&virtual_path) {
                    self.check_permission(ctx, parent, "write", None)?;
                }
            }
        }

        let hash = route.backend.write_stream(chunks, &routed_ctx).await?;
        let size = route.backend.get_content_size(&hash, &routed_ctx).await.unwrap_or(0);

        let is_new = existing.is_none();
        let mut entry = FileEntry::new(&virtual_path, route.backend.name());
        entry.physical_path = hash.clone();
        entry.content_hash = Some(hash.clone());
        entry.size = size;
        entry.mime_type = guess_mime(&virtual_path);
        entry.tenant_id = ctx.tenant_id.clone();
        entry.created_by = Some(ctx.user.clone());
        if is_new {
            entry.owner_id = Some(ctx.subject().1);
        }
        let (stored, revision) = self.metadata.put(&entry, ctx.zone())?;
        if is_new {
            self.rebac.grants().on_file_created(&virtual_path);
            self.materialize_creation_grants(ctx, &virtual_path)?;
        }

        if let Some(observer) = &self.observer {
            let outcome = observer
                .on_write(
                    &stored,
                    is_new,
                    &virtual_path,
                    ctx.zone(),
                    ctx.agent_id.as_deref(),
                    existing.as_ref().and_then(|e| e.content_hash.as_deref()),
                    existing.as_ref(),
                )
                .await;
            self.observer_outcome("write_stream", outcome)?;
        }

        let event = Self::build_event(
            FileEventType::FileWrite,
            &virtual_path,
            ctx,
            Some(&stored),
            Some(revision),
        );
        self.fan_out("FILE_WRITE", event);
        self.notify_revision(ctx.zone());

        Ok(WriteResult {
            etag: hash,
            version: stored.current_version,
            modified_at: stored.modified_at,
            size: stored.size,
            zookie: self.zookie(ctx, revision),
        })
    }

    /// Read-concatenate-write. A missing or unreadable current file
    /// appends onto empty, so the first append creates the file (subject
    /// to parent permissions inside `write`).
    pub async fn append(
        &self,
        raw_path: &str,
        content: &[u8],
        ctx: &OperationContext,
        options: WriteOptions,
    ) -> NexusResult<WriteResult> {
        let current = match self.read(raw_path, ctx).await {
            Ok(bytes) => bytes,
            Err(NexusError::NotFound { .. })
            | Err(NexusError::PermissionDenied { .. })
            | Err(NexusError::AccessDenied { .. }) => Vec::new(),
            Err(err) => return Err(err),
        };
        let mut combined = current;
        combined.extend_from_slice(content);
        self.write(raw_path, &combined, ctx, options).await
    }

    /// Read-modify-write under the path lock.
    pub async fn atomic_update<F>(
        &self,
        raw_path: &str,
        ctx: &OperationContext,
        apply: F,
    ) -> NexusResult<WriteResult>
    where
        F: FnOnce(Vec<u8>) -> Vec<u8>,
    {
        let virtual_path = self.validate(raw_path, ctx)?;
        let timeout = Duration::from_secs(self.config.kernel.lock_timeout_secs);
        let lock_id = self
            .lock_manager
            .acquire(ctx.zone(), &virtual_path, timeout)
            .await?
            .ok_or_else(|| NexusError::LockTimeout {
                path: virtual_path.clone(),
                timeout_secs: timeout.as_secs(),
            })?;

        let result = async {
            let current = match self.read(&virtual_path, ctx).await {
                Ok(bytes) => bytes,
                Err(NexusError::NotFound { .. }) => Vec::new(),
                Err(err) => return Err(err),
            };
            let updated = apply(current);
            self.write_unlocked(&virtual_path, &updated, ctx, WriteOptions::forced()).await
        }
        .await;

        self.lock_manager.release(&lock_id, ctx.zone(), &virtual_path).await?;
        result
    }

    /// Acquires the path lock and returns a guard; callers release it
    /// explicitly once done.
    pub async fn locked(
        &self,
        raw_path: &str,
        ctx: &OperationContext,
    ) -> NexusResult<PathLockGuard<'_>> {
        let virtual_path = self.validate(raw_path, ctx)?;
        let timeout = Duration::from_secs(self.config.kernel.lock_timeout_secs);
        let lock_id = self
            .lock_manager
            .acquire(ctx.zone(), &virtual_path, timeout)
            .await?
            .ok_or_else(|| NexusError::LockTimeout {
                path: virtual_path.clone(),
                timeout_secs: timeout.as_secs(),
            })?;
        Ok(PathLockGuard {
            fs: self,
            lock_id,
            zone_id: ctx.zone().to_owned(),
            path: virtual_path,
        })
    }

    /// Runs the registered parser off-thread, storing results through
    /// the KV surface. Failures are categorized and logged; the write
    /// has already returned.
    fn spawn_background_parse(&self, virtual_path: &str, entry: &FileEntry, content: Vec<u8>) {
        let Some(parser) = self.parsers.find(virtual_path, entry.mime_type.as_deref()) else {
            return;
        };
        let metadata = Arc::clone(&self.metadata);
        let path_owned = virtual_path.to_owned();
        let thread_name = format!("parser-{virtual_path}");
        let spawned = std::thread::Builder::new().name(thread_name.clone()).spawn(move || {
            match parser.parse(&path_owned, &content) {
                Ok(text) => {
                    let stores = [
                        (PARSED_TEXT_KEY, serde_json::Value::from(text)),
                        (PARSER_NAME_KEY, serde_json::Value::from(parser.name().to_owned())),
                        (PARSED_AT_KEY, serde_json::Value::from(Timestamp::now().0)),
                    ];
                    for (key, value) in &stores {
                        if let Err(err) = metadata.set_file_metadata(&path_owned, key, value) {
                            log_parse_failure(&path_owned, &err);
                            return;
                        }
                    }
                }
                Err(err) => log_parse_failure(&path_owned, &err),
            }
        });
        match spawned {
            Ok(handle) => self.parser_threads.track(thread_name, handle),
            Err(err) => warn!(path = %virtual_path, error = %err, "failed to spawn parser thread"),
        }
    }
}

/// Held path lock; release explicitly (an async drop does not exist).
pub struct PathLockGuard<'a> {
    fs: &'a NexusFs,
    lock_id: String,
    zone_id: String,
    path: String,
}

impl PathLockGuard<'_> {
    pub fn path(&self) -> &str {
        &self.path
    }

    pub async fn release(self) -> NexusResult<()> {
        self.fs.lock_manager.release(&self.lock_id, &self.zone_id, &self.path).await
    }
}

/// Coarse mime guess from the extension; callers needing more register
/// a parser or set attributes explicitly.
fn guess_mime(virtual_path: &str) -> Option<String> {
    let extension = virtual_path.rsplit('.').next()?;
    let mime = match extension {
        "txt" => "text/plain",
        "md" => "text/markdown",
        "csv" => "text/csv",
        "json" => "application/json",
        "html" => "text/html",
        "pdf" => "application/pdf",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        _ => return None,
    };
    Some(mime.to_owned())
}
