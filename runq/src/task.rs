use std::collections::HashMap;
use std::fmt::{self, Display};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, watch};
use tokio::time::Instant;
use tracing::{info, warn};
use uuid::Uuid;

use crate::admission::{MemoryReservation, ResourceAdmissionChecker};
use crate::error::RunQueueError;
use crate::events::{EventPublisher, EventSubscriber, InProcEventBus, RunEvent, RunEventPayload};
use crate::runner::{ProcessHandle, RunRequest, RunnerHandle};
use crate::runtime::ShutdownToken;
use crate::telemetry;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct TaskId(pub Uuid);

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Waiting,
    Running,
    Done,
    Cancelled,
    Error,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Done | TaskStatus::Cancelled | TaskStatus::Error
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Waiting => "waiting",
            TaskStatus::Running => "running",
            TaskStatus::Done => "done",
            TaskStatus::Cancelled => "cancelled",
            TaskStatus::Error => "error",
        }
    }
}

impl Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Collaborators a task needs to finish itself.
///
/// Every event goes to the in-process bus; an external publisher, when
/// configured, receives the same events first.
pub(crate) struct TaskContext {
    pub(crate) admission: Arc<ResourceAdmissionChecker>,
    bus: InProcEventBus,
    sink: Option<Arc<dyn EventPublisher<RunEvent>>>,
}

impl TaskContext {
    pub(crate) fn new(
        admission: Arc<ResourceAdmissionChecker>,
        bus_capacity: usize,
        sink: Option<Arc<dyn EventPublisher<RunEvent>>>,
    ) -> Self {
        Self {
            admission,
            bus: InProcEventBus::new(bus_capacity),
            sink,
        }
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<RunEvent> {
        self.bus.subscribe()
    }

    /// Publish an event; failures are logged and dropped.
    pub(crate) async fn emit(&self, payload: RunEventPayload) {
        let event = RunEvent::new(payload);
        if let Some(sink) = &self.sink {
            if let Err(err) = sink.publish(event.clone()).await {
                warn!(event_type = event.event_type(), "publishing run event failed: {err}");
            }
        }
        self.bus.publish_event(event);
    }
}

struct TaskInner {
    status: TaskStatus,
    runner: Option<Arc<dyn RunnerHandle>>,
    process: Option<ProcessHandle>,
    failure: Option<RunQueueError>,
    last_reason: Option<String>,
    finished_at: Option<DateTime<Utc>>,
    finished_instant: Option<Instant>,
}

/// One run request moving through `WAITING → RUNNING → DONE | CANCELLED | ERROR`.
///
/// A task reaches exactly one terminal status, exactly once. The memory
/// reservation it was admitted with is released at that transition.
pub struct RunQueueTask {
    id: TaskId,
    request: RunRequest,
    created_at: DateTime<Utc>,
    created_instant: Instant,
    reservation: Arc<MemoryReservation>,
    cancel_token: ShutdownToken,
    observed: AtomicBool,
    inner: Mutex<TaskInner>,
    status_tx: watch::Sender<TaskStatus>,
    context: Arc<TaskContext>,
}

impl fmt::Debug for RunQueueTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut debug = f.debug_struct("RunQueueTask");
        debug.field("id", &self.id);
        debug.field("workspace", &self.request.workspace);
        debug.field("project", &self.request.project);
        debug.field("environment", &self.request.environment);
        match self.inner.try_lock() {
            Some(inner) => {
                debug.field("status", &inner.status);
            }
            None => {
                debug.field("status", &"<locked>");
            }
        }
        debug.finish_non_exhaustive()
    }
}

impl RunQueueTask {
    pub(crate) fn new(
        request: RunRequest,
        reservation: Arc<MemoryReservation>,
        context: Arc<TaskContext>,
    ) -> Self {
        let (status_tx, _) = watch::channel(TaskStatus::Waiting);
        Self {
            id: TaskId::new(),
            request,
            created_at: Utc::now(),
            created_instant: Instant::now(),
            reservation,
            cancel_token: ShutdownToken::new(),
            observed: AtomicBool::new(false),
            inner: Mutex::new(TaskInner {
                status: TaskStatus::Waiting,
                runner: None,
                process: None,
                failure: None,
                last_reason: None,
                finished_at: None,
                finished_instant: None,
            }),
            status_tx,
            context,
        }
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    /// The request as resolved at admission; `runner` is filled in on the
    /// copy stored with the process once submitted.
    pub fn request(&self) -> &RunRequest {
        &self.request
    }

    pub fn workspace(&self) -> &str {
        &self.request.workspace
    }

    pub fn project(&self) -> &str {
        &self.request.project
    }

    pub fn memory_mb(&self) -> u64 {
        self.reservation.memory_mb
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn finished_at(&self) -> Option<DateTime<Utc>> {
        self.inner.lock().finished_at
    }

    /// Time since the task was created.
    pub fn age(&self) -> Duration {
        self.created_instant.elapsed()
    }

    /// Current status. Reading a terminal status marks the task as observed,
    /// making it eligible for eviction by the cleaner.
    pub fn status(&self) -> TaskStatus {
        let status = self.current_status();
        if status.is_terminal() {
            self.observed.store(true, Ordering::SeqCst);
        }
        status
    }

    pub(crate) fn current_status(&self) -> TaskStatus {
        self.inner.lock().status
    }

    pub fn is_terminal(&self) -> bool {
        self.current_status().is_terminal()
    }

    /// Error that ended the task, for `ERROR` and timed-out `CANCELLED` tasks.
    pub fn failure(&self) -> Option<RunQueueError> {
        self.inner.lock().failure.clone()
    }

    /// Most recent reason a runner could not be used while waiting.
    pub fn last_reason(&self) -> Option<String> {
        self.inner.lock().last_reason.clone()
    }

    pub fn process(&self) -> Option<ProcessHandle> {
        self.inner.lock().process.clone()
    }

    pub fn is_reservation_released(&self) -> bool {
        self.reservation.is_released()
    }

    /// Watch status transitions.
    pub fn subscribe_status(&self) -> watch::Receiver<TaskStatus> {
        self.status_tx.subscribe()
    }

    /// Wait until the status satisfies `predicate`, returning that status.
    pub async fn wait_for<F>(&self, predicate: F) -> TaskStatus
    where
        F: Fn(TaskStatus) -> bool,
    {
        let mut rx = self.status_tx.subscribe();
        match rx.wait_for(|status| predicate(*status)).await {
            Ok(status) => *status,
            // The sender lives as long as `self`, so this is unreachable in
            // practice; fall back to the current value.
            Err(_) => self.current_status(),
        }
    }

    /// Wait until the task reaches a terminal status.
    pub async fn wait_until_terminal(&self) -> TaskStatus {
        self.wait_for(|status| status.is_terminal()).await
    }

    pub(crate) fn cancel_token(&self) -> &ShutdownToken {
        &self.cancel_token
    }

    pub(crate) fn set_last_reason(&self, reason: impl Into<String>) {
        self.inner.lock().last_reason = Some(reason.into());
    }

    /// `WAITING → RUNNING`. Returns `false` if the task already left
    /// `WAITING`, in which case the caller owns stopping `process`.
    pub(crate) fn mark_running(
        &self,
        runner: Arc<dyn RunnerHandle>,
        process: ProcessHandle,
    ) -> bool {
        let mut inner = self.inner.lock();
        if inner.status != TaskStatus::Waiting {
            return false;
        }
        inner.status = TaskStatus::Running;
        inner.runner = Some(runner);
        inner.process = Some(process);
        inner.last_reason = None;
        drop(inner);
        self.status_tx.send_replace(TaskStatus::Running);
        true
    }

    /// Move to a terminal status, release the reservation and publish the
    /// matching event. Returns `false` if the task was already terminal.
    pub(crate) async fn finish(&self, status: TaskStatus, failure: Option<RunQueueError>) -> bool {
        debug_assert!(status.is_terminal());
        {
            let mut inner = self.inner.lock();
            if inner.status.is_terminal() {
                return false;
            }
            inner.status = status;
            inner.failure = failure.clone();
            inner.finished_at = Some(Utc::now());
            inner.finished_instant = Some(Instant::now());
        }
        self.cancel_token.cancel();
        self.context.admission.release(&self.reservation);
        self.status_tx.send_replace(status);
        telemetry::record_task_finished(&self.request.workspace, status.as_str());

        let payload = match (status, failure) {
            (TaskStatus::Done, _) => RunEventPayload::Completed { task_id: self.id },
            (
                TaskStatus::Cancelled,
                Some(RunQueueError::QueueTimeout {
                    waited_ms,
                    last_reason,
                }),
            ) => RunEventPayload::TimedOut {
                task_id: self.id,
                waited_ms,
                last_reason,
            },
            (TaskStatus::Cancelled, _) => RunEventPayload::Cancelled { task_id: self.id },
            (_, failure) => RunEventPayload::Failed {
                task_id: self.id,
                error_kind: failure
                    .as_ref()
                    .map(|err| err.kind().to_string())
                    .unwrap_or_else(|| "unknown".to_string()),
                reason: failure
                    .map(|err| err.to_string())
                    .unwrap_or_else(|| "task failed".to_string()),
            },
        };
        info!(task_id = %self.id, status = %status, "task finished");
        self.context.emit(payload).await;
        true
    }

    /// Cancel the task.
    ///
    /// From `WAITING` the memory reservation is released; from `RUNNING` the
    /// runner is additionally asked to stop the process. Returns `false` and
    /// does nothing once the task is terminal.
    pub async fn cancel(&self) -> bool {
        let running = {
            let mut inner = self.inner.lock();
            if inner.status.is_terminal() {
                return false;
            }
            let running = inner.runner.clone().zip(inner.process.clone());
            inner.status = TaskStatus::Cancelled;
            inner.finished_at = Some(Utc::now());
            inner.finished_instant = Some(Instant::now());
            running
        };
        self.cancel_token.cancel();
        self.context.admission.release(&self.reservation);
        self.status_tx.send_replace(TaskStatus::Cancelled);
        telemetry::record_task_finished(&self.request.workspace, TaskStatus::Cancelled.as_str());

        if let Some((runner, process)) = running {
            if let Err(err) = runner.stop(process.process_id).await {
                warn!(
                    task_id = %self.id,
                    process_id = process.process_id,
                    "stopping process failed: {err}"
                );
            }
        }

        info!(task_id = %self.id, "task cancelled");
        self.context
            .emit(RunEventPayload::Cancelled { task_id: self.id })
            .await;
        true
    }

    fn evictable(&self, retention: Duration) -> bool {
        let inner = self.inner.lock();
        if !inner.status.is_terminal() {
            return false;
        }
        if self.observed.load(Ordering::SeqCst) {
            return true;
        }
        inner
            .finished_instant
            .is_some_and(|finished| finished.elapsed() >= retention)
    }
}

/// Outcome of one cleaner pass.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct SweepReport {
    pub timed_out: usize,
    pub evicted: usize,
}

/// Live tasks by id.
#[derive(Default)]
pub struct TaskRegistry {
    tasks: RwLock<HashMap<TaskId, Arc<RunQueueTask>>>,
}

impl fmt::Debug for TaskRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskRegistry")
            .field("tasks", &self.tasks.read().len())
            .finish()
    }
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, task: Arc<RunQueueTask>) {
        self.tasks.write().insert(task.id(), task);
    }

    pub fn get(&self, id: TaskId) -> Option<Arc<RunQueueTask>> {
        self.tasks.read().get(&id).cloned()
    }

    pub fn remove(&self, id: TaskId) -> Option<Arc<RunQueueTask>> {
        self.tasks.write().remove(&id)
    }

    /// All tasks, oldest first.
    pub fn list(&self) -> Vec<Arc<RunQueueTask>> {
        let mut tasks: Vec<Arc<RunQueueTask>> = self.tasks.read().values().cloned().collect();
        tasks.sort_by_key(|task| task.id());
        tasks
    }

    pub fn len(&self) -> usize {
        self.tasks.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.read().is_empty()
    }

    /// Cancel `WAITING` tasks older than `max_queue_wait` and evict terminal
    /// tasks that were observed or finished longer than `retention` ago.
    pub async fn sweep(&self, max_queue_wait: Duration, retention: Duration) -> SweepReport {
        let mut report = SweepReport::default();

        let stale: Vec<Arc<RunQueueTask>> = self
            .tasks
            .read()
            .values()
            .filter(|task| {
                task.current_status() == TaskStatus::Waiting && task.age() > max_queue_wait
            })
            .cloned()
            .collect();

        for task in stale {
            let failure = RunQueueError::QueueTimeout {
                waited_ms: task.age().as_millis() as u64,
                last_reason: task.last_reason(),
            };
            if task.finish(TaskStatus::Cancelled, Some(failure)).await {
                warn!(task_id = %task.id(), "cleaner cancelled task stuck in queue");
                report.timed_out += 1;
            }
        }

        let mut tasks = self.tasks.write();
        let before = tasks.len();
        tasks.retain(|_, task| !task.evictable(retention));
        report.evicted = before - tasks.len();
        report
    }
}
