#![cfg(test)]

mod ops;
mod overlay;

use std::sync::Arc;

use crate::backend::MemoryBackend;
use crate::config::NexusConfig;
use crate::context::OperationContext;
use crate::router::Mount;

use super::NexusFs;

pub(super) fn kernel() -> NexusFs {
    NexusFs::in_memory().expect("build in-memory kernel")
}

pub(super) fn enforcing_kernel() -> NexusFs {
    let mut config = NexusConfig::default();
    config.kernel.enforce_permissions = true;
    NexusFs::builder()
        .with_config(config)
        .with_mount(Mount::new("/", Arc::new(MemoryBackend::default())))
        .build()
        .expect("build enforcing kernel")
}

pub(super) fn ctx(user: &str) -> OperationContext {
    OperationContext::for_user(user)
}
