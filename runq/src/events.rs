use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::task::TaskId;

/// Metadata envelope attached to every run event.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EventMeta {
    pub version: u16,
    /// Shared by every event of one task; fresh for registry events.
    pub correlation_id: Uuid,
    pub idempotency_key: String,
    pub timestamp: DateTime<Utc>,
}

impl EventMeta {
    pub fn new(correlation_id: Option<Uuid>, idempotency_key: impl Into<String>) -> Self {
        Self {
            version: 1,
            correlation_id: correlation_id.unwrap_or_else(Uuid::now_v7),
            idempotency_key: idempotency_key.into(),
            timestamp: Utc::now(),
        }
    }
}

/// Lifecycle notification emitted by the run queue.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RunEvent {
    pub meta: EventMeta,
    pub payload: RunEventPayload,
}

impl RunEvent {
    /// Wrap `payload`, correlating task events by task id.
    pub fn new(payload: RunEventPayload) -> Self {
        let correlation_id = payload.task_id().map(|task_id| task_id.0);
        let idempotency_key = match payload.task_id() {
            Some(task_id) => format!("{}-{}", payload.event_type(), task_id),
            None => format!("{}-{}", payload.event_type(), Uuid::now_v7()),
        };
        Self {
            meta: EventMeta::new(correlation_id, idempotency_key),
            payload,
        }
    }

    pub fn event_type(&self) -> &'static str {
        self.payload.event_type()
    }

    pub fn task_id(&self) -> Option<TaskId> {
        self.payload.task_id()
    }
}

/// Event payloads for task and runner server transitions.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
#[non_exhaustive]
pub enum RunEventPayload {
    /// Task admitted and waiting for a runner.
    Queued {
        task_id: TaskId,
        workspace: String,
        project: String,
        environment: String,
        memory_mb: u64,
    },
    /// A runner accepted the task.
    Started {
        task_id: TaskId,
        runner: String,
        location: String,
        process_id: u64,
    },
    /// The process finished normally.
    Completed { task_id: TaskId },
    /// Submission or the process itself failed.
    Failed {
        task_id: TaskId,
        error_kind: String,
        reason: String,
    },
    /// No runner became available within the queue wait.
    TimedOut {
        task_id: TaskId,
        waited_ms: u64,
        last_reason: Option<String>,
    },
    /// Cancelled by the caller or by shutdown.
    Cancelled { task_id: TaskId },
    RunnerServerRegistered { location: String, runners: usize },
    RunnerServerUnregistered { location: String },
    /// Removed by the liveness sweep.
    RunnerServerLost { location: String, failed_checks: u32 },
}

impl RunEventPayload {
    pub fn event_type(&self) -> &'static str {
        match self {
            RunEventPayload::Queued { .. } => "queued",
            RunEventPayload::Started { .. } => "started",
            RunEventPayload::Completed { .. } => "completed",
            RunEventPayload::Failed { .. } => "failed",
            RunEventPayload::TimedOut { .. } => "timed_out",
            RunEventPayload::Cancelled { .. } => "cancelled",
            RunEventPayload::RunnerServerRegistered { .. } => "runner_server_registered",
            RunEventPayload::RunnerServerUnregistered { .. } => "runner_server_unregistered",
            RunEventPayload::RunnerServerLost { .. } => "runner_server_lost",
        }
    }

    pub fn task_id(&self) -> Option<TaskId> {
        match self {
            RunEventPayload::Queued { task_id, .. }
            | RunEventPayload::Started { task_id, .. }
            | RunEventPayload::Completed { task_id }
            | RunEventPayload::Failed { task_id, .. }
            | RunEventPayload::TimedOut { task_id, .. }
            | RunEventPayload::Cancelled { task_id } => Some(*task_id),
            RunEventPayload::RunnerServerRegistered { .. }
            | RunEventPayload::RunnerServerUnregistered { .. }
            | RunEventPayload::RunnerServerLost { .. } => None,
        }
    }
}

/// Generic event publisher trait for publishing events of type `E`.
#[async_trait]
pub trait EventPublisher<E>: Send + Sync
where
    E: Clone + Send + Sync + 'static,
{
    /// Publish an event to all subscribers.
    ///
    /// Returns an error if the event cannot be published. The run queue logs
    /// and drops such errors; publishing never fails a task.
    async fn publish(&self, event: E) -> anyhow::Result<()>;
}

/// Generic event subscriber trait for receiving events of type `E`.
pub trait EventSubscriber<E>: Send + Sync
where
    E: Clone + Send + Sync + 'static,
{
    /// Subscribe to events, returning a broadcast receiver.
    ///
    /// Multiple subscribers can receive the same events (fan-out).
    fn subscribe(&self) -> broadcast::Receiver<E>;
}

/// In-process event bus using tokio broadcast channels.
///
/// Publishing never waits for subscribers: a subscriber that falls behind
/// the channel capacity receives `RecvError::Lagged` and the publisher keeps
/// going. Events published while nobody is subscribed are dropped. To forward
/// events to an external bus, implement [`EventPublisher`] as a bridge.
pub struct InProcEventBus {
    sender: broadcast::Sender<RunEvent>,
    capacity: usize,
}

impl std::fmt::Debug for InProcEventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InProcEventBus")
            .field("capacity", &self.capacity)
            .field("subscribers", &self.sender.receiver_count())
            .finish()
    }
}

impl InProcEventBus {
    /// Create a new event bus buffering up to `capacity` events.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender, capacity }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Publish without waiting; dropped if nobody is subscribed.
    pub fn publish_event(&self, event: RunEvent) {
        let _ = self.sender.send(event);
    }
}

#[async_trait]
impl EventPublisher<RunEvent> for InProcEventBus {
    async fn publish(&self, event: RunEvent) -> anyhow::Result<()> {
        self.publish_event(event);
        Ok(())
    }
}

impl EventSubscriber<RunEvent> for InProcEventBus {
    fn subscribe(&self) -> broadcast::Receiver<RunEvent> {
        self.sender.subscribe()
    }
}
