//! Keyset pagination cursors for `list_paginated`.
//!
//! A cursor encodes the last `(virtual_path, path_id)` pair seen plus a
//! hash of the listing filters; decoding under different filters fails so
//! stale cursors cannot silently skip or repeat rows.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{NexusError, NexusResult};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageCursor {
    pub last_path: String,
    pub last_id: i64,
    filter_hash: String,
}

impl PageCursor {
    pub fn new(last_path: String, last_id: i64, filters: &CursorFilters<'_>) -> Self {
        Self { last_path, last_id, filter_hash: filters.hash() }
    }

    /// Opaque token handed to callers.
    pub fn encode(&self) -> String {
        let json = serde_json::to_vec(self).unwrap_or_default();
        hex::encode(json)
    }

    /// Decodes a token, verifying it was issued for the same filters.
    pub fn decode(token: &str, filters: &CursorFilters<'_>) -> NexusResult<Self> {
        let bytes = hex::decode(token)
            .map_err(|_| NexusError::validation("malformed pagination cursor"))?;
        let cursor: PageCursor = serde_json::from_slice(&bytes)
            .map_err(|_| NexusError::validation("malformed pagination cursor"))?;
        if cursor.filter_hash != filters.hash() {
            return Err(NexusError::validation("pagination cursor does not match filters"));
        }
        Ok(cursor)
    }
}

/// Listing filters a cursor is pinned to.
pub struct CursorFilters<'a> {
    pub prefix: &'a str,
    pub recursive: bool,
    pub tenant_id: Option<&'a str>,
}

impl CursorFilters<'_> {
    fn hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.prefix.as_bytes());
        hasher.update([self.recursive as u8]);
        hasher.update(self.tenant_id.unwrap_or("").as_bytes());
        hex::encode(&hasher.finalize()[..8])
    }
}
