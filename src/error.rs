//! Error taxonomy surfaced at the kernel edge.
//!
//! Every failed operation maps to exactly one of these kinds. Transports
//! reuse the numeric codes unchanged, so variants and codes are stable.

use num_derive::{FromPrimitive, ToPrimitive};
use thiserror::Error;

/// Convenient result alias used by all kernel operations.
pub type NexusResult<T> = Result<T, NexusError>;

/// Stable machine-readable error codes shared with the wire protocol.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, FromPrimitive, ToPrimitive)]
#[repr(u32)]
pub enum ErrorCode {
    NotFound = 1001,
    AccessDenied = 1002,
    PermissionDenied = 1003,
    InvalidPath = 1004,
    Conflict = 1005,
    FileExists = 1006,
    LockTimeout = 1007,
    ValidationError = 1008,
    BackendError = 1009,
    AuditLogError = 1010,
    MetadataError = 1011,
}

/// Kernel error kinds.
///
/// `PermissionDenied` is deliberately issued both when a subject lacks a
/// grant and when the resource is not visible under any grant, so callers
/// cannot probe for existence.
#[derive(Debug, Error)]
pub enum NexusError {
    #[error("not found: {path}")]
    NotFound { path: String },

    #[error("access denied: {reason}")]
    AccessDenied { reason: String },

    #[error("permission denied: {permission} on {path}")]
    PermissionDenied { path: String, permission: String },

    #[error("invalid path: {message}")]
    InvalidPath { message: String },

    #[error("conflict: expected etag {expected:?}, current {current:?}")]
    Conflict {
        expected: Option<String>,
        current: Option<String>,
    },

    #[error("file exists: {path}")]
    FileExists { path: String },

    #[error("lock timeout after {timeout_secs}s on {path}")]
    LockTimeout { path: String, timeout_secs: u64 },

    #[error("validation error: {message}")]
    ValidationError { message: String },

    #[error("backend error: {message}")]
    BackendError {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("audit log error: {message}")]
    AuditLogError { message: String },

    #[error("metadata error: {message}")]
    MetadataError { message: String },
}

impl NexusError {
    /// Wire code for this error kind.
    pub fn code(&self) -> ErrorCode {
        match self {
            NexusError::NotFound { .. } => ErrorCode::NotFound,
            NexusError::AccessDenied { .. } => ErrorCode::AccessDenied,
            NexusError::PermissionDenied { .. } => ErrorCode::PermissionDenied,
            NexusError::InvalidPath { .. } => ErrorCode::InvalidPath,
            NexusError::Conflict { .. } => ErrorCode::Conflict,
            NexusError::FileExists { .. } => ErrorCode::FileExists,
            NexusError::LockTimeout { .. } => ErrorCode::LockTimeout,
            NexusError::ValidationError { .. } => ErrorCode::ValidationError,
            NexusError::BackendError { .. } => ErrorCode::BackendError,
            NexusError::AuditLogError { .. } => ErrorCode::AuditLogError,
            NexusError::MetadataError { .. } => ErrorCode::MetadataError,
        }
    }

    pub fn not_found(path: impl Into<String>) -> Self {
        NexusError::NotFound { path: path.into() }
    }

    pub fn access_denied(reason: impl Into<String>) -> Self {
        NexusError::AccessDenied { reason: reason.into() }
    }

    pub fn permission_denied(path: impl Into<String>, permission: impl Into<String>) -> Self {
        NexusError::PermissionDenied { path: path.into(), permission: permission.into() }
    }

    pub fn invalid_path(message: impl Into<String>) -> Self {
        NexusError::InvalidPath { message: message.into() }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        NexusError::ValidationError { message: message.into() }
    }

    pub fn backend(message: impl Into<String>) -> Self {
        NexusError::BackendError { message: message.into(), source: None }
    }

    pub fn metadata(message: impl Into<String>) -> Self {
        NexusError::MetadataError { message: message.into() }
    }
}

impl From<rusqlite::Error> for NexusError {
    fn from(err: rusqlite::Error) -> Self {
        NexusError::MetadataError { message: err.to_string() }
    }
}

impl From<std::io::Error> for NexusError {
    fn from(err: std::io::Error) -> Self {
        NexusError::BackendError { message: err.to_string(), source: Some(Box::new(err)) }
    }
}
