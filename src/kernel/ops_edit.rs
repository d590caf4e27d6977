//! Targeted edits on top of read + optimistic write.

use crate::context::OperationContext;
use crate::edit::{apply_edits, EditMatch, EditRequest};
use crate::error::{NexusError, NexusResult};
use crate::metadata::Timestamp;

use super::ops_write::WriteOptions;
use super::NexusFs;

#[derive(Debug, Clone, Default)]
pub struct EditOptions {
    /// Fail with `Conflict` unless the file's etag equals this.
    pub if_match: Option<String>,
    /// Minimum similarity for the fuzzy tier; 1.0 disables it.
    pub fuzzy_threshold: f64,
    /// Compute matches and diff without writing.
    pub preview: bool,
}

impl EditOptions {
    pub fn new() -> Self {
        Self { if_match: None, fuzzy_threshold: 0.8, preview: false }
    }

    pub fn preview() -> Self {
        Self { preview: true, ..Self::new() }
    }
}

#[derive(Debug, Clone)]
pub struct EditResult {
    pub success: bool,
    pub preview: bool,
    pub diff: String,
    pub matches: Vec<EditMatch>,
    pub applied_count: usize,
    /// Etag after the edit; in preview mode, the etag that was read.
    pub etag: String,
    pub version: u64,
    pub size: u64,
    pub modified_at: Timestamp,
}

impl NexusFs {
    /// Applies a batch of string edits to a UTF-8 file.
    pub async fn edit(
        &self,
        raw_path: &str,
        edits: &[EditRequest],
        ctx: &OperationContext,
        options: EditOptions,
    ) -> NexusResult<EditResult> {
        let output = self.read_with_metadata(raw_path, ctx).await?;
        let current_etag = output.entry.content_hash.clone().unwrap_or_default();

        if let Some(expected) = &options.if_match {
            if expected != &current_etag {
                return Err(NexusError::Conflict {
                    expected: Some(expected.clone()),
                    current: Some(current_etag),
                });
            }
        }

        let text = String::from_utf8(output.content).map_err(|_| {
            NexusError::validation(format!("{raw_path} is not valid UTF-8; edit refused"))
        })?;

        let threshold = if options.fuzzy_threshold <= 0.0 { 0.8 } else { options.fuzzy_threshold };
        let outcome = apply_edits(&text, edits, threshold)?;

        if options.preview {
            return Ok(EditResult {
                success: true,
                preview: true,
                diff: outcome.diff,
                matches: outcome.matches,
                applied_count: outcome.applied_count,
                etag: current_etag,
                version: output.entry.current_version,
                size: output.entry.size,
                modified_at: output.entry.modified_at,
            });
        }

        // Guard the write with the etag this edit was computed against;
        // a concurrent writer surfaces as Conflict, never a lost update.
        let write = self
            .write(
                raw_path,
                outcome.content.as_bytes(),
                ctx,
                WriteOptions::if_match(current_etag),
            )
            .await?;

        Ok(EditResult {
            success: true,
            preview: false,
            diff: outcome.diff,
            matches: outcome.matches,
            applied_count: outcome.applied_count,
            etag: write.etag,
            version: write.version,
            size: write.size,
            modified_at: write.modified_at,
        })
    }
}
