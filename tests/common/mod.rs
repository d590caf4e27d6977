use std::sync::Arc;

use nexus_fs::backend::MemoryBackend;
use nexus_fs::config::NexusConfig;
use nexus_fs::router::Mount;
use nexus_fs::{NexusFs, OperationContext};

pub struct Fixture {
    pub fs: NexusFs,
}

impl Fixture {
    /// Open kernel: permission enforcement off, one memory backend at `/`.
    pub fn new() -> Self {
        Self { fs: NexusFs::in_memory().expect("build kernel") }
    }

    /// Kernel with ReBAC enforcement on.
    pub fn enforcing() -> Self {
        let mut config = NexusConfig::default();
        config.kernel.enforce_permissions = true;
        let fs = NexusFs::builder()
            .with_config(config)
            .with_mount(Mount::new("/", Arc::new(MemoryBackend::default())))
            .build()
            .expect("build enforcing kernel");
        Self { fs }
    }

    pub fn ctx(&self, user: &str) -> OperationContext {
        OperationContext::for_user(user)
    }
}
