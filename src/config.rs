//! Kernel configuration, loadable from TOML.

use serde::Deserialize;

use crate::error::{NexusError, NexusResult};

/// Top-level configuration for a [`crate::kernel::NexusFs`] instance.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct NexusConfig {
    pub cache: CacheConfig,
    pub rebac: RebacConfig,
    pub kernel: KernelConfig,
    pub retry: RetryConfig,
}

impl NexusConfig {
    /// Parses a TOML document; missing sections and fields use defaults.
    pub fn from_toml(text: &str) -> NexusResult<Self> {
        toml::from_str(text).map_err(|err| NexusError::validation(format!("bad config: {err}")))
    }
}

/// Bounds and TTL for the four metadata caches.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub entry_capacity: u64,
    pub listing_capacity: u64,
    pub kv_capacity: u64,
    pub exists_capacity: u64,
    pub ttl_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            entry_capacity: 10_000,
            listing_capacity: 1_000,
            kv_capacity: 10_000,
            exists_capacity: 10_000,
            ttl_secs: 60,
        }
    }
}

/// Traversal limits and cache tuning for the ReBAC engine.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RebacConfig {
    /// Maximum permission-graph depth before a check denies.
    pub max_depth: u32,
    /// Fan-out cap at each tuple-to-userset expansion.
    pub max_fanout: usize,
    /// TTL applied to both cache tiers, seconds.
    pub cache_ttl_secs: u64,
    pub l1_capacity: usize,
    /// Revisions per cache-key bucket; a zone write shifts future reads
    /// into a new bucket.
    pub revision_window: u64,
    /// Fraction of the TTL after which a hit triggers refresh-ahead.
    pub refresh_ahead_beta: f64,
    pub xfetch_enabled: bool,
    /// Permissions recomputed eagerly after a simple tuple change.
    pub eager_recompute_limit: usize,
    /// Minimum seconds between expired-tuple sweeps.
    pub sweep_interval_secs: u64,
}

impl Default for RebacConfig {
    fn default() -> Self {
        Self {
            max_depth: 50,
            max_fanout: 1000,
            cache_ttl_secs: 300,
            l1_capacity: 50_000,
            revision_window: 10,
            refresh_ahead_beta: 0.7,
            xfetch_enabled: false,
            eager_recompute_limit: 5,
            sweep_interval_secs: 1,
        }
    }
}

/// Behavioural flags for the file operation kernel.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct KernelConfig {
    /// Run every operation through the ReBAC engine. Off by default so a
    /// fresh instance is usable before any grants exist.
    pub enforce_permissions: bool,
    /// Strict: observer failure aborts the operation. Lenient: log and go on.
    pub audit_strict_mode: bool,
    /// Whether `exists()` on an implicit directory may succeed purely via
    /// descendant access.
    pub exists_via_descendants: bool,
    /// Queue parent-edge and creator-owner tuples for background
    /// materialization instead of writing them inline.
    pub deferred_permissions: bool,
    /// Run the registered parser in a background thread after each write.
    pub auto_parse: bool,
    pub lock_timeout_secs: u64,
    /// Timeout applied to each fire-and-forget event task.
    pub task_timeout_secs: u64,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            enforce_permissions: false,
            audit_strict_mode: false,
            exists_via_descendants: true,
            deferred_permissions: false,
            auto_parse: false,
            lock_timeout_secs: 30,
            task_timeout_secs: 30,
        }
    }
}

/// Backoff policy for metadata write conflicts.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self { max_attempts: 10, initial_delay_ms: 1, max_delay_ms: 1000 }
    }
}
