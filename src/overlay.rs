//! Overlay resolution: a two-layer read-through stack.
//!
//! The upper layer is the ordinary catalog; the lower layer is provided
//! by a resolver implementation. A whiteout in the upper layer hides a
//! lower-layer file, which the kernel surfaces as not-found.

use async_trait::async_trait;

use crate::error::NexusResult;
use crate::metadata::FileEntry;
use crate::router::OverlayConfig;

/// Mime type marking a whiteout entry.
pub const WHITEOUT_MIME: &str = "application/x-whiteout";

/// Collaborator resolving reads against the lower layer and recording
/// whiteouts. Invoked only when the upper-layer lookup misses.
#[async_trait]
pub trait OverlayResolver: Send + Sync {
    /// Lower-layer entry for `path`, or a whiteout marker, or nothing.
    async fn resolve_read(
        &self,
        path: &str,
        config: &OverlayConfig,
    ) -> NexusResult<Option<FileEntry>>;

    fn is_whiteout(&self, entry: &FileEntry) -> bool {
        entry.mime_type.as_deref() == Some(WHITEOUT_MIME)
    }

    /// Records in the upper layer that `path` is deleted even though the
    /// lower layer still holds it.
    async fn create_whiteout(&self, path: &str, config: &OverlayConfig) -> NexusResult<()>;
}
