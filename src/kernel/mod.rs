//! The file operation kernel.
//!
//! `NexusFs` composes the router, catalog, backends, ReBAC manager and
//! the pluggable collaborators (observer, event bus, workflow engine,
//! subscription broadcaster, lock manager, overlay resolver, parser
//! registry) behind one read/write/delete/rename surface. Construction
//! goes through [`NexusFsBuilder`]; all per-instance state lives on the
//! struct and is torn down in [`NexusFs::close`].

mod ops_delete;
mod ops_edit;
mod ops_read;
mod ops_stat;
mod ops_write;
mod versions;

#[cfg(test)]
mod tests;

pub use ops_delete::DeleteResult;
pub use ops_edit::{EditOptions, EditResult};
pub use ops_read::ReadOutput;
pub use ops_stat::StatResult;
pub use ops_write::{PathLockGuard, WriteOptions, WriteResult};

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use crossbeam_queue::SegQueue;
use dashmap::DashMap;
use tokio::sync::Notify;
use tracing::{error, info, warn};

use crate::backend::Backend;
use crate::config::NexusConfig;
use crate::context::OperationContext;
use crate::error::{NexusError, NexusResult};
use crate::events::{
    EventBus, EventTasks, FileEvent, FileEventType, SubscriptionBroadcaster, WorkflowEngine,
};
use crate::lock::{LocalLockManager, LockManager};
use crate::metadata::{Db, FileEntry, MetadataStore, Zookie};
use crate::observer::Observer;
use crate::overlay::OverlayResolver;
use crate::parser::{ParserRegistry, ParserThreads};
use crate::path;
use crate::rebac::{Entity, RebacManager, TupleRequest};
use crate::router::{Mount, PathRouter, Route};

/// Prefix delegated to the external memory subsystem when configured.
pub const MEMORY_PREFIX: &str = "/memory/";

/// Collaborator serving memory-view virtual paths.
#[async_trait]
pub trait MemoryDelegate: Send + Sync {
    async fn read(&self, path: &str, ctx: &OperationContext) -> NexusResult<Vec<u8>>;
    async fn delete(&self, path: &str, ctx: &OperationContext) -> NexusResult<()>;
}

pub struct NexusFs {
    pub(crate) config: NexusConfig,
    pub(crate) router: PathRouter,
    pub(crate) metadata: Arc<MetadataStore>,
    pub(crate) rebac: Arc<RebacManager>,
    pub(crate) overlay: Option<Arc<dyn OverlayResolver>>,
    pub(crate) observer: Option<Arc<dyn Observer>>,
    pub(crate) event_bus: Option<Arc<dyn EventBus>>,
    pub(crate) workflow: Option<Arc<dyn WorkflowEngine>>,
    pub(crate) subscriptions: Option<Arc<dyn SubscriptionBroadcaster>>,
    pub(crate) memory: Option<Arc<dyn MemoryDelegate>>,
    pub(crate) lock_manager: Arc<dyn LockManager>,
    pub(crate) parsers: Arc<ParserRegistry>,
    pub(crate) parser_threads: Arc<ParserThreads>,
    pub(crate) tasks: EventTasks,
    pub(crate) deferred_grants: SegQueue<TupleRequest>,
    revision_waiters: DashMap<String, Arc<Notify>>,
}

impl NexusFs {
    pub fn builder() -> NexusFsBuilder {
        NexusFsBuilder::new()
    }

    /// Fully in-memory instance with one memory backend mounted at `/`;
    /// the fixture most tests start from.
    pub fn in_memory() -> NexusResult<Self> {
        NexusFsBuilder::new()
            .with_mount(Mount::new("/", Arc::new(crate::backend::MemoryBackend::default())))
            .build()
    }

    pub fn metadata(&self) -> &Arc<MetadataStore> {
        &self.metadata
    }

    pub fn rebac(&self) -> &Arc<RebacManager> {
        &self.rebac
    }

    pub fn parsers(&self) -> &Arc<ParserRegistry> {
        &self.parsers
    }

    pub fn config(&self) -> &NexusConfig {
        &self.config
    }

    // ---- shared plumbing ----------------------------------------------

    /// Normalizes and validates `path`, rejecting the kernel-private
    /// namespace for non-admin callers.
    pub(crate) fn validate(&self, raw: &str, ctx: &OperationContext) -> NexusResult<String> {
        let normalized = path::normalize(raw)?;
        if path::is_system_path(&normalized) && !ctx.is_admin {
            return Err(NexusError::invalid_path(format!("{normalized} is reserved")));
        }
        Ok(normalized)
    }

    pub(crate) fn route(
        &self,
        virtual_path: &str,
        ctx: &OperationContext,
        check_write: bool,
    ) -> NexusResult<Route> {
        let route = self.router.route(virtual_path, ctx, check_write)?;
        if check_write && route.readonly {
            return Err(NexusError::access_denied(format!(
                "{virtual_path} is on a read-only mount"
            )));
        }
        Ok(route)
    }

    pub(crate) fn subject(ctx: &OperationContext) -> Entity {
        let (subject_type, subject_id) = ctx.subject();
        Entity::new(subject_type, subject_id)
    }

    /// Permission gate for one path. Order: enforcement flag, admin
    /// bypass, owner fast-path, ancestor-grant bitmap, ReBAC walk.
    pub(crate) fn check_permission(
        &self,
        ctx: &OperationContext,
        virtual_path: &str,
        permission: &str,
        entry: Option<&FileEntry>,
    ) -> NexusResult<()> {
        if !self.config.kernel.enforce_permissions || ctx.is_admin {
            return Ok(());
        }
        let subject = Self::subject(ctx);
        if let Some(entry) = entry {
            if entry.owner_id.as_deref() == Some(subject.entity_id.as_str()) {
                return Ok(());
            }
        }
        if permission == "read" && self.rebac.grants().covers(&subject, virtual_path) {
            return Ok(());
        }
        // Deferred parent/owner tuples must be visible to the graph walk.
        self.flush_deferred_grants()?;
        let object = Entity::file(virtual_path);
        if self.rebac.check(&subject, permission, &object, ctx.zone(), None)? {
            return Ok(());
        }
        Err(NexusError::permission_denied(virtual_path, permission))
    }

    /// Bulk read-permission filter; returns a keep/drop flag per path.
    pub(crate) fn filter_readable(
        &self,
        ctx: &OperationContext,
        paths: &[String],
        entries: &std::collections::HashMap<String, Option<FileEntry>>,
    ) -> NexusResult<Vec<bool>> {
        if !self.config.kernel.enforce_permissions || ctx.is_admin {
            return Ok(vec![true; paths.len()]);
        }
        let subject = Self::subject(ctx);
        let mut verdicts = vec![false; paths.len()];
        let mut checks = Vec::new();
        let mut check_indices = Vec::new();
        for (index, p) in paths.iter().enumerate() {
            let owned = entries
                .get(p)
                .and_then(|e| e.as_ref())
                .map(|e| e.owner_id.as_deref() == Some(subject.entity_id.as_str()))
                .unwrap_or(false);
            if owned || self.rebac.grants().covers(&subject, p) {
                verdicts[index] = true;
            } else {
                checks.push((subject.clone(), "read".to_owned(), Entity::file(p.clone())));
                check_indices.push(index);
            }
        }
        if !checks.is_empty() {
            self.flush_deferred_grants()?;
            let results = self.rebac.check_bulk(&checks, ctx.zone(), None)?;
            for (slot, allowed) in check_indices.into_iter().zip(results) {
                verdicts[slot] = allowed;
            }
        }
        Ok(verdicts)
    }

    /// Queues or writes the parent edges and creator-owner grant for a
    /// freshly created path.
    pub(crate) fn materialize_creation_grants(
        &self,
        ctx: &OperationContext,
        virtual_path: &str,
    ) -> NexusResult<()> {
        let subject = Self::subject(ctx);
        let zone = ctx.zone().to_owned();
        let mut requests = Vec::new();
        requests.push(
            TupleRequest::new(subject, "direct_owner", Entity::file(virtual_path))
                .in_zone(zone.clone()),
        );
        let mut current = virtual_path.to_owned();
        loop {
            let Some(parent) = path::parent(&current).map(str::to_owned) else {
                break;
            };
            requests.push(
                TupleRequest::new(
                    Entity::file(current.clone()),
                    "parent",
                    Entity::file(parent.clone()),
                )
                .in_zone(zone.clone()),
            );
            if parent == "/" {
                break;
            }
            current = parent;
        }

        if self.config.kernel.deferred_permissions {
            for request in requests {
                self.deferred_grants.push(request);
            }
        } else {
            self.rebac.write_batch(&requests)?;
        }
        Ok(())
    }

    /// Drains the deferred buffer into the tuple store. Correctness in
    /// the meantime rests on the owner fast-path.
    pub fn flush_deferred_grants(&self) -> NexusResult<()> {
        let mut pending = Vec::new();
        while let Some(request) = self.deferred_grants.pop() {
            pending.push(request);
        }
        if !pending.is_empty() {
            self.rebac.write_batch(&pending)?;
        }
        Ok(())
    }

    // ---- observer / events --------------------------------------------

    /// Applies the audit policy to an observer outcome: strict aborts
    /// with `AuditLogError`, lenient logs and continues.
    pub(crate) fn observer_outcome(&self, op: &str, outcome: NexusResult<()>) -> NexusResult<()> {
        match outcome {
            Ok(()) => Ok(()),
            Err(err) if self.config.kernel.audit_strict_mode => {
                Err(NexusError::AuditLogError { message: format!("{op} observer failed: {err}") })
            }
            Err(err) => {
                error!(op, error = %err, "audit observer failed; continuing (lenient mode)");
                Ok(())
            }
        }
    }

    /// Publishes the event and fires workflow/subscription fan-out, all
    /// fire-and-forget. The write path never awaits these tasks.
    pub(crate) fn fan_out(&self, trigger: &'static str, event: FileEvent) {
        if let Some(workflow) = self.workflow.clone() {
            let for_workflow = event.clone();
            self.tasks.spawn("workflow", async move {
                workflow.fire_event(trigger, &for_workflow).await
            });
        }
        if let Some(subscriptions) = self.subscriptions.clone() {
            let for_subs = event.clone();
            self.tasks.spawn("subscriptions", async move {
                let zone = for_subs.zone_id.clone();
                subscriptions.broadcast(&for_subs, &zone).await
            });
        }
        if let Some(bus) = self.event_bus.clone() {
            self.tasks.spawn("event-bus", async move { bus.publish(event).await });
        }
    }

    pub(crate) fn build_event(
        event_type: FileEventType,
        virtual_path: &str,
        ctx: &OperationContext,
        entry: Option<&FileEntry>,
        revision: Option<u64>,
    ) -> FileEvent {
        let mut event = FileEvent::new(event_type, virtual_path, ctx.zone());
        event.agent_id = ctx.agent_id.clone();
        event.revision = revision;
        if let Some(entry) = entry {
            event.size = Some(entry.size);
            event.etag = entry.content_hash.clone();
        }
        event
    }

    // ---- zookies -------------------------------------------------------

    pub(crate) fn zookie(&self, ctx: &OperationContext, revision: u64) -> Zookie {
        Zookie { zone_id: ctx.zone().to_owned(), revision }
    }

    pub(crate) fn notify_revision(&self, zone_id: &str) {
        if let Some(notify) = self.revision_waiters.get(zone_id) {
            notify.notify_waiters();
        }
    }

    /// Blocks until the zone's revision reaches `revision` or `timeout`
    /// passes; returns the revision observed.
    pub async fn wait_for_revision(
        &self,
        zone_id: &str,
        revision: u64,
        timeout: Duration,
    ) -> NexusResult<u64> {
        let notify = self
            .revision_waiters
            .entry(zone_id.to_owned())
            .or_insert_with(|| Arc::new(Notify::new()))
            .clone();
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let current = self.metadata.get_revision(zone_id)?;
            if current >= revision {
                return Ok(current);
            }
            let notified = notify.notified();
            let remaining = deadline
                .checked_duration_since(tokio::time::Instant::now())
                .ok_or_else(|| NexusError::LockTimeout {
                    path: format!("zone {zone_id} revision {revision}"),
                    timeout_secs: timeout.as_secs(),
                })?;
            // Wake on the next revision bump or poll every 50ms, whichever
            // comes first; the counter may be bumped by another process.
            let _ = tokio::time::timeout(remaining.min(Duration::from_millis(50)), notified).await;
        }
    }

    // ---- lifecycle -----------------------------------------------------

    /// Drains background work and joins parser threads. Threads still
    /// running after the timeout are reported; they signal possible loss
    /// of parse results, never of file data.
    pub async fn close(&self) -> NexusResult<()> {
        if let Err(err) = self.flush_deferred_grants() {
            warn!(error = %err, "failed to flush deferred permission grants on close");
        }
        self.tasks.drain().await;
        let stragglers = self.parser_threads.shutdown(Duration::from_secs(5));
        if !stragglers.is_empty() {
            warn!(?stragglers, "parser threads outlived shutdown");
        }
        info!("kernel closed");
        Ok(())
    }
}

/// Step-wise construction of a [`NexusFs`].
pub struct NexusFsBuilder {
    config: NexusConfig,
    db_path: Option<PathBuf>,
    mounts: Vec<Mount>,
    overlay: Option<Arc<dyn OverlayResolver>>,
    observer: Option<Arc<dyn Observer>>,
    event_bus: Option<Arc<dyn EventBus>>,
    workflow: Option<Arc<dyn WorkflowEngine>>,
    subscriptions: Option<Arc<dyn SubscriptionBroadcaster>>,
    memory: Option<Arc<dyn MemoryDelegate>>,
    lock_manager: Option<Arc<dyn LockManager>>,
}

impl NexusFsBuilder {
    pub fn new() -> Self {
        Self {
            config: NexusConfig::default(),
            db_path: None,
            mounts: Vec::new(),
            overlay: None,
            observer: None,
            event_bus: None,
            workflow: None,
            subscriptions: None,
            memory: None,
            lock_manager: None,
        }
    }

    pub fn with_config(mut self, config: NexusConfig) -> Self {
        self.config = config;
        self
    }

    /// File-backed catalog; in-memory when unset.
    pub fn with_db_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.db_path = Some(path.into());
        self
    }

    pub fn with_mount(mut self, mount: Mount) -> Self {
        self.mounts.push(mount);
        self
    }

    pub fn with_backend(self, prefix: &str, backend: Arc<dyn Backend>) -> Self {
        self.with_mount(Mount::new(prefix, backend))
    }

    pub fn with_overlay_resolver(mut self, resolver: Arc<dyn OverlayResolver>) -> Self {
        self.overlay = Some(resolver);
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn Observer>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn with_event_bus(mut self, bus: Arc<dyn EventBus>) -> Self {
        self.event_bus = Some(bus);
        self
    }

    pub fn with_workflow_engine(mut self, workflow: Arc<dyn WorkflowEngine>) -> Self {
        self.workflow = Some(workflow);
        self
    }

    pub fn with_subscription_broadcaster(
        mut self,
        subscriptions: Arc<dyn SubscriptionBroadcaster>,
    ) -> Self {
        self.subscriptions = Some(subscriptions);
        self
    }

    pub fn with_memory_delegate(mut self, memory: Arc<dyn MemoryDelegate>) -> Self {
        self.memory = Some(memory);
        self
    }

    pub fn with_lock_manager(mut self, lock_manager: Arc<dyn LockManager>) -> Self {
        self.lock_manager = Some(lock_manager);
        self
    }

    pub fn build(self) -> NexusResult<NexusFs> {
        if self.mounts.is_empty() {
            return Err(NexusError::validation("at least one mount is required"));
        }
        let db = match &self.db_path {
            Some(path) => Db::open(path)?,
            None => Db::open_in_memory()?,
        };
        let metadata = Arc::new(MetadataStore::new(
            Arc::clone(&db),
            &self.config.cache,
            self.config.retry.clone(),
        ));
        let rebac = Arc::new(RebacManager::new(Arc::clone(&db), &self.config.rebac));

        let mut router = PathRouter::new();
        for mount in self.mounts {
            router.add_mount(mount);
        }

        let task_timeout = Duration::from_secs(self.config.kernel.task_timeout_secs.max(1));
        Ok(NexusFs {
            config: self.config,
            router,
            metadata,
            rebac,
            overlay: self.overlay,
            observer: self.observer,
            event_bus: self.event_bus,
            workflow: self.workflow,
            subscriptions: self.subscriptions,
            memory: self.memory,
            lock_manager: self
                .lock_manager
                .unwrap_or_else(|| Arc::new(LocalLockManager::new())),
            parsers: Arc::new(ParserRegistry::new()),
            parser_threads: Arc::new(ParserThreads::new()),
            tasks: EventTasks::new(task_timeout),
            deferred_grants: SegQueue::new(),
            revision_waiters: DashMap::new(),
        })
    }
}

impl Default for NexusFsBuilder {
    fn default() -> Self {
        Self::new()
    }
}
