//! Content parser registry and background parse threads.
//!
//! Parsing itself is external: callers register [`ContentParser`]
//! implementations and the kernel invokes them, caching output through
//! the KV attribute surface (`parsed_text`, `parsed_at`, `parser_name`).

use std::sync::{Arc, Mutex, RwLock};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tracing::{error, warn};

use crate::error::{NexusError, NexusResult};

/// KV attribute keys holding parser output.
pub const PARSED_TEXT_KEY: &str = "parsed_text";
pub const PARSED_AT_KEY: &str = "parsed_at";
pub const PARSER_NAME_KEY: &str = "parser_name";

/// One registered parser.
pub trait ContentParser: Send + Sync {
    fn name(&self) -> &str;
    fn can_parse(&self, path: &str, mime_type: Option<&str>) -> bool;
    fn parse(&self, path: &str, bytes: &[u8]) -> NexusResult<String>;
}

/// Ordered parser registry; the first parser claiming a path wins.
pub struct ParserRegistry {
    parsers: RwLock<Vec<Arc<dyn ContentParser>>>,
}

impl ParserRegistry {
    pub fn new() -> Self {
        Self { parsers: RwLock::new(Vec::new()) }
    }

    pub fn register(&self, parser: Arc<dyn ContentParser>) {
        let mut guard = self.parsers.write().unwrap_or_else(|e| e.into_inner());
        guard.push(parser);
    }

    pub fn find(&self, path: &str, mime_type: Option<&str>) -> Option<Arc<dyn ContentParser>> {
        let guard = self.parsers.read().unwrap_or_else(|e| e.into_inner());
        guard.iter().find(|parser| parser.can_parse(path, mime_type)).cloned()
    }

    pub fn is_empty(&self) -> bool {
        self.parsers.read().unwrap_or_else(|e| e.into_inner()).is_empty()
    }
}

impl Default for ParserRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Coarse failure category for parser errors; drives log severity only,
/// never the write result.
pub fn categorize_parse_error(err: &NexusError) -> &'static str {
    match err {
        NexusError::BackendError { .. } => "disk",
        NexusError::MetadataError { .. } => "db",
        NexusError::PermissionDenied { .. } | NexusError::AccessDenied { .. } => "permission",
        NexusError::ValidationError { .. } => "unsupported-format",
        _ => "unknown",
    }
}

pub fn log_parse_failure(path: &str, err: &NexusError) {
    match categorize_parse_error(err) {
        category @ ("disk" | "db") => {
            error!(path, category, error = %err, "background parse failed")
        }
        category => warn!(path, category, error = %err, "background parse failed"),
    }
}

/// Registry of live background parse threads, joined at shutdown.
///
/// Threads are deliberately non-daemon (the std default); a shutdown
/// that cannot join one reports its name as a data-loss signal.
pub struct ParserThreads {
    threads: Mutex<Vec<(String, JoinHandle<()>)>>,
}

impl ParserThreads {
    pub fn new() -> Self {
        Self { threads: Mutex::new(Vec::new()) }
    }

    pub fn track(&self, name: String, handle: JoinHandle<()>) {
        let mut guard = self.threads.lock().unwrap_or_else(|e| e.into_inner());
        guard.retain(|(_, handle)| !handle.is_finished());
        guard.push((name, handle));
    }

    pub fn len(&self) -> usize {
        self.threads.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Joins every tracked thread within `timeout`; returns the names of
    /// threads still running when the deadline passed.
    pub fn shutdown(&self, timeout: Duration) -> Vec<String> {
        let threads = {
            let mut guard = self.threads.lock().unwrap_or_else(|e| e.into_inner());
            std::mem::take(&mut *guard)
        };
        let deadline = Instant::now() + timeout;
        let mut pending = threads;
        let mut stragglers = Vec::new();
        while !pending.is_empty() {
            let mut still_running = Vec::new();
            for (name, handle) in pending {
                if handle.is_finished() {
                    let _ = handle.join();
                } else {
                    still_running.push((name, handle));
                }
            }
            if still_running.is_empty() {
                break;
            }
            if Instant::now() >= deadline {
                for (name, _) in still_running {
                    warn!(thread = %name, "parser thread did not finish before shutdown");
                    stragglers.push(name);
                }
                return stragglers;
            }
            std::thread::sleep(Duration::from_millis(10));
            pending = still_running;
        }
        stragglers
    }
}

impl Default for ParserThreads {
    fn default() -> Self {
        Self::new()
    }
}
