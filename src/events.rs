//! File events, the event-bus contract and fire-and-forget task plumbing.

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinSet;
use tracing::warn;

use crate::error::NexusResult;

/// What happened.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum FileEventType {
    FileWrite,
    FileDelete,
    FileRename,
    DirCreate,
    DirDelete,
}

/// One event published at the end of a mutation.
#[derive(Debug, Clone, PartialEq)]
pub struct FileEvent {
    pub event_type: FileEventType,
    pub path: String,
    pub zone_id: String,
    pub size: Option<u64>,
    pub etag: Option<String>,
    pub agent_id: Option<String>,
    pub old_path: Option<String>,
    pub revision: Option<u64>,
}

impl FileEvent {
    pub fn new(event_type: FileEventType, path: impl Into<String>, zone_id: impl Into<String>) -> Self {
        Self {
            event_type,
            path: path.into(),
            zone_id: zone_id.into(),
            size: None,
            etag: None,
            agent_id: None,
            old_path: None,
            revision: None,
        }
    }
}

/// Pluggable event transport.
#[async_trait]
pub trait EventBus: Send + Sync {
    async fn start(&self) -> NexusResult<()>;
    async fn publish(&self, event: FileEvent) -> NexusResult<()>;
}

/// Background workflow trigger; fire-and-forget from the kernel's side.
#[async_trait]
pub trait WorkflowEngine: Send + Sync {
    async fn fire_event(&self, trigger: &str, event: &FileEvent) -> NexusResult<()>;
}

/// Subscription fan-out; fire-and-forget from the kernel's side.
#[async_trait]
pub trait SubscriptionBroadcaster: Send + Sync {
    async fn broadcast(&self, event: &FileEvent, zone_id: &str) -> NexusResult<()>;
}

/// In-process bus over a broadcast-ish channel; receivers are cloned
/// off the shared receiver and drain independently.
pub struct InProcessEventBus {
    sender: async_channel::Sender<FileEvent>,
    receiver: async_channel::Receiver<FileEvent>,
}

impl InProcessEventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, receiver) = async_channel::bounded(capacity.max(1));
        Self { sender, receiver }
    }

    /// A receiver handle; events are consumed by exactly one receiver.
    pub fn subscribe(&self) -> async_channel::Receiver<FileEvent> {
        self.receiver.clone()
    }
}

impl Default for InProcessEventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[async_trait]
impl EventBus for InProcessEventBus {
    async fn start(&self) -> NexusResult<()> {
        Ok(())
    }

    async fn publish(&self, event: FileEvent) -> NexusResult<()> {
        if let Err(err) = self.sender.try_send(event) {
            // Full or closed channel: the bus is best-effort.
            warn!(error = %err, "event bus publish dropped");
        }
        Ok(())
    }
}

/// Bounded set of fire-and-forget tasks, each wrapped in a timeout.
/// Finished tasks are reaped on every spawn so the set stays small.
pub struct EventTasks {
    tasks: Mutex<JoinSet<()>>,
    timeout: Duration,
}

impl EventTasks {
    pub fn new(timeout: Duration) -> Self {
        Self { tasks: Mutex::new(JoinSet::new()), timeout }
    }

    /// Runs `future` in the background; failures and timeouts are logged
    /// and never propagate.
    pub fn spawn<F>(&self, label: &'static str, future: F)
    where
        F: std::future::Future<Output = NexusResult<()>> + Send + 'static,
    {
        let timeout = self.timeout;
        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        while tasks.try_join_next().is_some() {}
        tasks.spawn(async move {
            match tokio::time::timeout(timeout, future).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => warn!(task = label, error = %err, "background task failed"),
                Err(_) => warn!(task = label, ?timeout, "background task timed out"),
            }
        });
    }

    /// Waits for every tracked task; used by `close()`.
    pub async fn drain(&self) {
        // Move the set out so the mutex is not held across awaits.
        let mut tasks = {
            let mut guard = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
            std::mem::take(&mut *guard)
        };
        while tasks.join_next().await.is_some() {}
    }

    pub fn len(&self) -> usize {
        self.tasks.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_in_process_bus_delivers() {
        let bus = InProcessEventBus::default();
        let receiver = bus.subscribe();
        bus.publish(FileEvent::new(FileEventType::FileWrite, "/w/a.txt", "default"))
            .await
            .unwrap();
        let event = receiver.recv().await.unwrap();
        assert_eq!(event.event_type, FileEventType::FileWrite);
        assert_eq!(event.path, "/w/a.txt");
    }

    #[tokio::test]
    async fn test_event_tasks_run_and_drain() {
        let tasks = EventTasks::new(Duration::from_secs(5));
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..4 {
            let counter = Arc::clone(&counter);
            tasks.spawn("test", async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });
        }
        tasks.drain().await;
        assert_eq!(counter.load(Ordering::SeqCst), 4);
        assert!(tasks.is_empty());
    }

    #[tokio::test]
    async fn test_task_errors_are_swallowed() {
        let tasks = EventTasks::new(Duration::from_millis(50));
        tasks.spawn("fails", async { Err(crate::error::NexusError::backend("boom")) });
        tasks.spawn("hangs", async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        });
        tasks.drain().await;
    }
}
