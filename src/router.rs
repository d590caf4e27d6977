//! Path-to-backend routing.
//!
//! A mount table maps virtual path prefixes onto backends. Routing picks
//! the longest matching prefix, enforces zone and agent isolation
//! (admins bypass both) and surfaces the mount's read-only flag; the
//! kernel raises on the actual mutation, not here.

use std::sync::Arc;

use crate::backend::Backend;
use crate::context::OperationContext;
use crate::error::{NexusError, NexusResult};
use crate::path;

/// Overlay configuration attached to a mount.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OverlayConfig {
    /// Prefix of the lower (base) layer backing this mount.
    pub base_prefix: String,
}

/// One mount table row.
#[derive(Clone)]
pub struct Mount {
    pub prefix: String,
    pub backend: Arc<dyn Backend>,
    pub readonly: bool,
    /// Restricts the mount to one zone; other zones are denied.
    pub zone_id: Option<String>,
    /// Restricts the mount to one agent.
    pub agent_id: Option<String>,
    pub overlay: Option<OverlayConfig>,
}

impl Mount {
    pub fn new(prefix: impl Into<String>, backend: Arc<dyn Backend>) -> Self {
        Self {
            prefix: prefix.into(),
            backend,
            readonly: false,
            zone_id: None,
            agent_id: None,
            overlay: None,
        }
    }

    pub fn readonly(mut self) -> Self {
        self.readonly = true;
        self
    }

    pub fn for_zone(mut self, zone_id: impl Into<String>) -> Self {
        self.zone_id = Some(zone_id.into());
        self
    }

    pub fn for_agent(mut self, agent_id: impl Into<String>) -> Self {
        self.agent_id = Some(agent_id.into());
        self
    }

    pub fn with_overlay(mut self, overlay: OverlayConfig) -> Self {
        self.overlay = Some(overlay);
        self
    }
}

/// Route decision handed back to the kernel.
#[derive(Clone)]
pub struct Route {
    pub backend: Arc<dyn Backend>,
    /// Path relative to the mount, `/`-rooted.
    pub backend_path: String,
    pub readonly: bool,
    pub overlay: Option<OverlayConfig>,
    pub mount_prefix: String,
}

pub struct PathRouter {
    /// Sorted by prefix length descending so the first match wins.
    mounts: Vec<Mount>,
}

impl PathRouter {
    pub fn new() -> Self {
        Self { mounts: Vec::new() }
    }

    pub fn add_mount(&mut self, mount: Mount) {
        self.mounts.push(mount);
        self.mounts.sort_by(|a, b| b.prefix.len().cmp(&a.prefix.len()));
    }

    /// Resolves the longest-prefix mount for `path`.
    ///
    /// `check_write` marks intent; a read-only mount still routes and the
    /// kernel rejects the mutation using [`Route::readonly`].
    pub fn route(
        &self,
        virtual_path: &str,
        ctx: &OperationContext,
        check_write: bool,
    ) -> NexusResult<Route> {
        let mount = self
            .mounts
            .iter()
            .find(|mount| path::is_self_or_descendant(virtual_path, &mount.prefix))
            .ok_or_else(|| NexusError::access_denied(format!("no mount serves {virtual_path}")))?;

        if !ctx.is_admin {
            if let Some(zone) = &mount.zone_id {
                if ctx.zone() != zone {
                    return Err(NexusError::access_denied(format!(
                        "mount {} is isolated to another zone",
                        mount.prefix
                    )));
                }
            }
            if let Some(agent) = &mount.agent_id {
                if ctx.agent_id.as_deref() != Some(agent.as_str()) {
                    return Err(NexusError::access_denied(format!(
                        "mount {} is isolated to another agent",
                        mount.prefix
                    )));
                }
            }
        }

        if check_write && mount.readonly {
            tracing::debug!(path = %virtual_path, mount = %mount.prefix, "write routed to read-only mount");
        }

        let relative = if mount.prefix == "/" {
            virtual_path.to_owned()
        } else if virtual_path == mount.prefix {
            "/".to_owned()
        } else {
            virtual_path[mount.prefix.len()..].to_owned()
        };

        Ok(Route {
            backend: Arc::clone(&mount.backend),
            backend_path: relative,
            readonly: mount.readonly,
            overlay: mount.overlay.clone(),
            mount_prefix: mount.prefix.clone(),
        })
    }
}

impl Default for PathRouter {
    fn default() -> Self {
        Self::new()
    }
}
