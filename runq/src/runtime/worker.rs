use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tracing::{Instrument, debug, info, warn};

use crate::admission::ResourceAdmissionChecker;
use crate::error::RunQueueError;
use crate::events::RunEventPayload;
use crate::registry::{RunnerCandidate, RunnerServerRegistry};
use crate::runner::{ProcessHandle, ProcessStatus, RunnerHandle};
use crate::strategy::RunnerSelectionStrategy;
use crate::task::{RunQueueTask, TaskContext, TaskStatus};
use crate::telemetry;

use super::supervisor::ShutdownToken;

/// Result of one poll tick.
enum Tick {
    /// A runner accepted the request.
    Submitted {
        candidate: RunnerCandidate,
        process: ProcessHandle,
    },
    /// The chosen runner refused the request; the task ends in `ERROR`.
    Rejected(RunQueueError),
    /// Nothing usable this tick; the reason is kept for diagnostics.
    Waiting(String),
    /// The task left `WAITING` while the tick was in flight.
    Abandoned,
}

/// Everything one task's wait loop needs, cloned out of the queue.
pub(crate) struct DispatchWorker {
    pub(crate) task: Arc<RunQueueTask>,
    pub(crate) infra: String,
    pub(crate) registry: Arc<RunnerServerRegistry>,
    pub(crate) strategy: Arc<dyn RunnerSelectionStrategy>,
    pub(crate) admission: Arc<ResourceAdmissionChecker>,
    pub(crate) context: Arc<TaskContext>,
    pub(crate) permits: Arc<Semaphore>,
    pub(crate) poll_interval: Duration,
    pub(crate) max_queue_wait: Duration,
    pub(crate) shutdown: ShutdownToken,
}

impl DispatchWorker {
    /// Wait for a runner, submit, then supervise the process to completion.
    pub(crate) async fn run(self) {
        let span = telemetry::dispatch_span(
            self.task.id().to_string(),
            self.task.workspace(),
            self.task.request().environment.to_string(),
        );
        async move {
            if let Some((runner, process)) = self.wait_for_runner().await {
                self.supervise(runner, process).await;
            }
        }
        .instrument(span)
        .await
    }

    async fn wait_for_runner(&self) -> Option<(Arc<dyn RunnerHandle>, ProcessHandle)> {
        loop {
            if self.task.is_terminal() {
                return None;
            }
            if self.shutdown.is_cancelled() {
                self.task
                    .finish(TaskStatus::Cancelled, Some(RunQueueError::Shutdown))
                    .await;
                return None;
            }

            match self.tick().await {
                Tick::Submitted { candidate, process } => {
                    return self.on_submitted(candidate, process).await;
                }
                Tick::Rejected(err) => {
                    warn!(task_id = %self.task.id(), "run submission failed: {err}");
                    self.task.finish(TaskStatus::Error, Some(err)).await;
                    return None;
                }
                Tick::Waiting(reason) => {
                    debug!(task_id = %self.task.id(), reason = %reason, "no runner available yet");
                    self.task.set_last_reason(reason);
                }
                Tick::Abandoned => return None,
            }

            let waited = self.task.age();
            if waited >= self.max_queue_wait {
                let failure = RunQueueError::QueueTimeout {
                    waited_ms: waited.as_millis() as u64,
                    last_reason: self.task.last_reason(),
                };
                if self.task.finish(TaskStatus::Cancelled, Some(failure)).await {
                    warn!(task_id = %self.task.id(), waited_ms = waited.as_millis() as u64, "task timed out waiting for a runner");
                }
                return None;
            }

            let sleep_for = self.poll_interval.min(self.max_queue_wait - waited);
            tokio::select! {
                _ = self.task.cancel_token().cancelled() => return None,
                _ = self.shutdown.cancelled() => {}
                _ = tokio::time::sleep(sleep_for) => {}
            }
        }
    }

    async fn tick(&self) -> Tick {
        let Ok(_permit) = self.permits.acquire().await else {
            return Tick::Waiting("worker pool closed".into());
        };
        let task = &self.task;
        let request = task.request();

        let candidates = self
            .registry
            .candidates(&self.infra, &request.workspace, &request.project);
        if candidates.is_empty() {
            return Tick::Waiting(format!(
                "no runner servers registered for infra {}",
                self.infra
            ));
        }

        let Some(candidate) = self.strategy.choose(&request.environment, &candidates) else {
            return Tick::Waiting(format!(
                "no runner supports environment {}",
                request.environment
            ));
        };

        let state = match candidate.runner.state().await {
            Ok(state) => state,
            Err(err) => {
                return Tick::Waiting(format!(
                    "runner {} at {} unreachable: {err}",
                    candidate.name(),
                    candidate.location
                ));
            }
        };
        if task.is_terminal() {
            return Tick::Abandoned;
        }

        if state.free_memory_mb < request.memory_mb {
            let err = RunQueueError::InsufficientResources {
                available: state.free_memory_mb,
                required: request.memory_mb,
            };
            return Tick::Waiting(format!("runner {}: {err}", candidate.name()));
        }
        if let Err(err) = self.admission.check_disk_space(&state) {
            return Tick::Waiting(format!("runner {}: {err}", candidate.name()));
        }

        let mut submitted = request.clone();
        submitted.runner = candidate.name().to_string();
        match candidate.runner.run(&submitted).await {
            Ok(process) => Tick::Submitted { candidate, process },
            Err(err) => Tick::Rejected(RunQueueError::RunnerSubmission {
                runner: candidate.name().to_string(),
                reason: err.to_string(),
            }),
        }
    }

    async fn on_submitted(
        &self,
        candidate: RunnerCandidate,
        process: ProcessHandle,
    ) -> Option<(Arc<dyn RunnerHandle>, ProcessHandle)> {
        let runner = Arc::clone(&candidate.runner);
        self.registry.mark_used(&candidate.location, candidate.name());

        if !self.task.mark_running(Arc::clone(&runner), process.clone()) {
            // Cancelled between the state check and submission.
            if let Err(err) = runner.stop(process.process_id).await {
                warn!(task_id = %self.task.id(), process_id = process.process_id, "stopping orphaned process failed: {err}");
            }
            return None;
        }

        info!(
            task_id = %self.task.id(),
            runner = %candidate.name(),
            location = %candidate.location,
            process_id = process.process_id,
            "task running"
        );
        telemetry::record_task_started(
            self.task.workspace(),
            candidate.name(),
            self.task.age().as_secs_f64(),
        );
        self.context
            .emit(RunEventPayload::Started {
                task_id: self.task.id(),
                runner: candidate.name().to_string(),
                location: candidate.location.clone(),
                process_id: process.process_id,
            })
            .await;
        Some((runner, process))
    }

    async fn supervise(&self, runner: Arc<dyn RunnerHandle>, process: ProcessHandle) {
        let span = telemetry::supervise_span(
            self.task.id().to_string(),
            &process.runner,
            process.process_id,
        );
        async {
            loop {
                tokio::select! {
                    _ = self.task.cancel_token().cancelled() => return,
                    _ = self.shutdown.cancelled() => {
                        debug!("shutdown; leaving process running");
                        return;
                    }
                    _ = tokio::time::sleep(self.poll_interval) => {}
                }

                let status = runner.process_status(process.process_id).await;
                if self.task.is_terminal() {
                    return;
                }
                match status {
                    Ok(ProcessStatus::Running) => {}
                    Ok(ProcessStatus::Stopped) => {
                        self.task.finish(TaskStatus::Done, None).await;
                        return;
                    }
                    Ok(ProcessStatus::Failed { reason }) => {
                        let failure = RunQueueError::ProcessFailed {
                            runner: process.runner.clone(),
                            process_id: process.process_id,
                            reason,
                        };
                        self.task.finish(TaskStatus::Error, Some(failure)).await;
                        return;
                    }
                    Err(err) => {
                        debug!("process status check failed: {err}");
                    }
                }
            }
        }
        .instrument(span)
        .await
    }
}
