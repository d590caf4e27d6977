//! Virtual path validation and manipulation.
//!
//! Paths are POSIX-like absolute strings. The `/__sys__/` prefix is
//! kernel-private and filtered from every user-visible operation.

use crate::error::{NexusError, NexusResult};

/// Maximum number of bytes allowed in a virtual path.
pub const MAX_PATH_LEN: usize = 1024;

/// Maximum number of bytes allowed in a single path segment.
pub const MAX_NAME_LEN: usize = 255;

/// Kernel-private prefix holding zone revision counters and other state.
pub const SYSTEM_PREFIX: &str = "/__sys__/";

/// Validates an absolute virtual path and returns its normalized form.
///
/// A trailing slash is stripped (root stays `/`). Relative segments,
/// empty segments and NUL bytes are rejected.
pub fn normalize(path: &str) -> NexusResult<String> {
    if path.is_empty() {
        return Err(NexusError::invalid_path("path is empty"));
    }
    if !path.starts_with('/') {
        return Err(NexusError::invalid_path(format!("path must be absolute: {path}")));
    }
    if path.len() > MAX_PATH_LEN {
        return Err(NexusError::invalid_path(format!("path exceeds {MAX_PATH_LEN} bytes")));
    }
    if path.contains('\0') {
        return Err(NexusError::invalid_path("path contains NUL byte"));
    }

    let trimmed = if path.len() > 1 { path.trim_end_matches('/') } else { path };
    if trimmed.is_empty() {
        return Ok("/".to_owned());
    }

    for segment in trimmed[1..].split('/') {
        if segment.is_empty() {
            return Err(NexusError::invalid_path(format!("empty segment in {path}")));
        }
        if segment == "." || segment == ".." {
            return Err(NexusError::invalid_path(format!("relative segment in {path}")));
        }
        if segment.len() > MAX_NAME_LEN {
            return Err(NexusError::invalid_path(format!("segment exceeds {MAX_NAME_LEN} bytes")));
        }
    }

    Ok(trimmed.to_owned())
}

/// Whether a path lies inside the kernel-private namespace.
pub fn is_system_path(path: &str) -> bool {
    path.starts_with(SYSTEM_PREFIX) || path == SYSTEM_PREFIX.trim_end_matches('/')
}

/// Parent of a normalized path. `/a/b` -> `/a`, `/a` -> `/`, `/` has none.
pub fn parent(path: &str) -> Option<&str> {
    if path == "/" {
        return None;
    }
    match path.rfind('/') {
        Some(0) => Some("/"),
        Some(idx) => Some(&path[..idx]),
        None => None,
    }
}

/// Final segment of a normalized path. Root has none.
pub fn entry_name(path: &str) -> Option<&str> {
    if path == "/" {
        return None;
    }
    path.rfind('/').map(|idx| &path[idx + 1..])
}

/// Proper ancestors of a path, nearest first, ending at `/`.
pub fn ancestors(path: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut current = path;
    while let Some(up) = parent(current) {
        out.push(up.to_owned());
        current = up;
    }
    out
}

/// Joins a directory path and an entry name.
pub fn join(dir: &str, name: &str) -> String {
    if dir == "/" {
        format!("/{name}")
    } else {
        format!("{}/{name}", dir.trim_end_matches('/'))
    }
}

/// Whether `path` is `prefix` itself or lies below it.
pub fn is_self_or_descendant(path: &str, prefix: &str) -> bool {
    if prefix == "/" {
        return true;
    }
    path == prefix || path.starts_with(&format!("{prefix}/"))
}

/// Rewrites the leading `old` prefix of `path` to `new`.
///
/// Callers must have established that `path` is `old` or a descendant.
pub fn rewrite_prefix(path: &str, old: &str, new: &str) -> String {
    if path == old {
        new.to_owned()
    } else {
        format!("{new}{}", &path[old.len()..])
    }
}
