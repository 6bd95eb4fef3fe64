use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::bail;
use async_trait::async_trait;
use parking_lot::Mutex;
use runq::{EventPublisher, RunEvent, TaskId};

/// Publisher that keeps every event it is given.
#[derive(Clone, Default)]
pub struct RecordingPublisher {
    events: Arc<Mutex<Vec<RunEvent>>>,
    failing: Arc<AtomicBool>,
}

impl RecordingPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `publish()` fail; events are still recorded.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn events(&self) -> Vec<RunEvent> {
        self.events.lock().clone()
    }

    pub fn event_types(&self) -> Vec<&'static str> {
        self.events.lock().iter().map(RunEvent::event_type).collect()
    }

    /// Event types published for one task, in order.
    pub fn event_types_for(&self, task_id: TaskId) -> Vec<&'static str> {
        self.events
            .lock()
            .iter()
            .filter(|event| event.task_id() == Some(task_id))
            .map(RunEvent::event_type)
            .collect()
    }

    /// Poll until an event of `event_type` for `task_id` shows up.
    pub async fn wait_for(&self, task_id: TaskId, event_type: &str, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.event_types_for(task_id).iter().any(|seen| *seen == event_type) {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

#[async_trait]
impl EventPublisher<RunEvent> for RecordingPublisher {
    async fn publish(&self, event: RunEvent) -> anyhow::Result<()> {
        self.events.lock().push(event);
        if self.failing.load(Ordering::SeqCst) {
            bail!("event sink unavailable");
        }
        Ok(())
    }
}
