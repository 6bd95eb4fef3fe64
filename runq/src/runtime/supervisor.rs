use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::{Mutex, Notify, Semaphore, broadcast};
use tokio::task::{JoinHandle, JoinSet};
use tracing::Instrument;

use crate::admission::{ReservationGuard, ResourceAdmissionChecker};
use crate::build::{BuildCoordinator, BuilderService, resolve_build};
use crate::config::RunQueueConfig;
use crate::error::{Result, RunQueueError};
use crate::events::{RunEvent, RunEventPayload};
use crate::options::RunOptions;
use crate::provider::ConfigProvider;
use crate::registry::{AccessCriteria, LostRunnerServer, RunnerServerRegistration, RunnerServerRegistry};
use crate::runner::{RunRequest, RunnerDescriptor};
use crate::strategy::RunnerSelectionStrategy;
use crate::task::{RunQueueTask, SweepReport, TaskContext, TaskId, TaskRegistry};
use crate::telemetry;

use super::worker::DispatchWorker;

/// Token for signaling cancellation to background loops.
#[derive(Clone, Debug)]
pub struct ShutdownToken {
    inner: Arc<ShutdownTokenInner>,
}

#[derive(Debug)]
struct ShutdownTokenInner {
    cancelled: AtomicBool,
    notify: Notify,
}

impl ShutdownToken {
    /// Create a new shutdown token.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ShutdownTokenInner {
                cancelled: AtomicBool::new(false),
                notify: Notify::new(),
            }),
        }
    }

    /// Signal cancellation.
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    /// Check if cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Wait until cancelled.
    pub async fn cancelled(&self) {
        let notified = self.inner.notify.notified();
        tokio::pin!(notified);
        // Register before checking the flag so a concurrent cancel is not missed.
        notified.as_mut().enable();
        if self.is_cancelled() {
            return;
        }
        notified.await;
    }
}

impl Default for ShutdownToken {
    fn default() -> Self {
        Self::new()
    }
}

/// The run dispatch queue.
///
/// [`RunQueue::run`] admits a request against the workspace quota, optionally
/// builds the project, and returns a [`RunQueueTask`] in `WAITING`. A spawned
/// wait loop then polls the registry for a runner, submits the request and
/// supervises the process. [`RunQueue::start`] launches the cleaner and the
/// runner server liveness sweep.
pub struct RunQueue {
    config: RunQueueConfig,
    provider: Arc<dyn ConfigProvider>,
    registry: Arc<RunnerServerRegistry>,
    strategy: Arc<dyn RunnerSelectionStrategy>,
    admission: Arc<ResourceAdmissionChecker>,
    builds: BuildCoordinator,
    builder_service: Option<Arc<dyn BuilderService>>,
    tasks: Arc<TaskRegistry>,
    context: Arc<TaskContext>,
    permits: Arc<Semaphore>,
    shutdown_token: ShutdownToken,
    dispatchers: parking_lot::Mutex<JoinSet<()>>,
    background: Mutex<Vec<JoinHandle<()>>>,
}

impl fmt::Debug for RunQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunQueue")
            .field("config", &self.config)
            .field("registry", &self.registry)
            .field("tasks", &self.tasks.len())
            .field("builder_service", &self.builder_service.is_some())
            .field("shutdown_cancelled", &self.shutdown_token.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl RunQueue {
    pub(crate) fn new(
        config: RunQueueConfig,
        provider: Arc<dyn ConfigProvider>,
        registry: Arc<RunnerServerRegistry>,
        strategy: Arc<dyn RunnerSelectionStrategy>,
        admission: Arc<ResourceAdmissionChecker>,
        builder_service: Option<Arc<dyn BuilderService>>,
        context: Arc<TaskContext>,
    ) -> Self {
        Self {
            builds: BuildCoordinator::new(config.build_poll_interval()),
            permits: Arc::new(Semaphore::new(config.worker_parallelism.max(1))),
            config,
            provider,
            registry,
            strategy,
            admission,
            builder_service,
            tasks: Arc::new(TaskRegistry::new()),
            context,
            shutdown_token: ShutdownToken::new(),
            dispatchers: parking_lot::Mutex::new(JoinSet::new()),
            background: Mutex::new(Vec::new()),
        }
    }

    pub fn config(&self) -> &RunQueueConfig {
        &self.config
    }

    pub fn registry(&self) -> Arc<RunnerServerRegistry> {
        Arc::clone(&self.registry)
    }

    pub fn admission(&self) -> Arc<ResourceAdmissionChecker> {
        Arc::clone(&self.admission)
    }

    pub fn shutdown_token(&self) -> ShutdownToken {
        self.shutdown_token.clone()
    }

    /// Receive every run and runner server event published from now on.
    pub fn subscribe_events(&self) -> broadcast::Receiver<RunEvent> {
        self.context.subscribe()
    }

    /// Register a runner server and publish `RunnerServerRegistered`.
    pub async fn register_runner_server(
        &self,
        location: &str,
        criteria: AccessCriteria,
    ) -> Result<RunnerServerRegistration> {
        let registration = self.registry.register(location, criteria).await?;
        telemetry::set_runner_servers(self.registry.registrations().len());
        self.context
            .emit(RunEventPayload::RunnerServerRegistered {
                location: registration.location.clone(),
                runners: registration.runners.len(),
            })
            .await;
        Ok(registration)
    }

    /// Unregister a runner server. Returns `false` if none was registered at
    /// `location`. Tasks already running there keep their process handles.
    pub async fn unregister_runner_server(&self, location: &str) -> bool {
        if !self.registry.unregister(location) {
            return false;
        }
        telemetry::set_runner_servers(self.registry.registrations().len());
        self.context
            .emit(RunEventPayload::RunnerServerUnregistered {
                location: location.to_string(),
            })
            .await;
        true
    }

    /// Runners a run in `(infra, workspace, project)` could be placed on.
    pub fn get_runner_list(&self, infra: &str, workspace: &str, project: &str) -> Vec<RunnerDescriptor> {
        self.registry.runner_list(infra, workspace, project)
    }

    pub fn get_task(&self, id: TaskId) -> Option<Arc<RunQueueTask>> {
        self.tasks.get(id)
    }

    /// Every task still held by the queue, oldest first.
    pub fn tasks(&self) -> Vec<Arc<RunQueueTask>> {
        self.tasks.list()
    }

    /// Queue a run of `project` in `workspace`.
    ///
    /// Configuration, admission and build failures are returned here and
    /// leave no task and no reservation behind. Once a task is returned, its
    /// outcome is reported through its status and the published events.
    pub async fn run(
        &self,
        workspace: &str,
        project: &str,
        options: RunOptions,
    ) -> Result<Arc<RunQueueTask>> {
        if self.shutdown_token.is_cancelled() {
            return Err(RunQueueError::Shutdown);
        }

        let project_config = self
            .provider
            .project_config(workspace, project)
            .await
            .map_err(|err| RunQueueError::Provider(err.to_string()))?;
        let workspace_config = self
            .provider
            .workspace_config(workspace)
            .await
            .map_err(|err| RunQueueError::Provider(err.to_string()))?;

        let environment = options.resolve_environment(&project_config)?;
        let memory_mb = options.resolve_memory(&project_config, self.config.default_memory_mb);
        let infra = workspace_config
            .infra()
            .unwrap_or(&self.config.default_infra)
            .to_string();

        let build = resolve_build(options.skip_build, options.build.as_ref(), &project_config);
        let builder_service = match (&build, &self.builder_service) {
            (Some(build), None) => {
                return Err(RunQueueError::Configuration(format!(
                    "builder {} requested but no builder service is configured",
                    build.builder
                )));
            }
            (_, service) => service.clone(),
        };

        let reservation = self
            .admission
            .check_memory(workspace, memory_mb)
            .instrument(telemetry::admission_span(workspace, project, memory_mb))
            .await?;
        // Released on any exit before the task exists, including this future
        // being dropped mid-build.
        let reservation = ReservationGuard::new(&self.admission, reservation);

        let mut artifact = None;
        if let (Some(build), Some(service)) = (&build, builder_service) {
            artifact = self
                .builds
                .build_then_wait(
                    service,
                    workspace,
                    project,
                    build,
                    self.config.max_build_wait(),
                    &self.shutdown_token,
                )
                .await?;
        }

        let request = RunRequest {
            workspace: workspace.to_string(),
            project: project.to_string(),
            runner: String::new(),
            environment,
            memory_mb,
            options: options.merged_options(&project_config),
            env_vars: options.merged_env_vars(&project_config),
            recipes: project_config.recipes.clone(),
            artifact,
            user_token: options.user_token,
        };

        let task = Arc::new(RunQueueTask::new(
            request,
            reservation.hand_over(),
            Arc::clone(&self.context),
        ));
        self.tasks.insert(Arc::clone(&task));
        telemetry::record_task_queued(workspace, task.request().environment.to_string());
        self.context
            .emit(RunEventPayload::Queued {
                task_id: task.id(),
                workspace: workspace.to_string(),
                project: project.to_string(),
                environment: task.request().environment.to_string(),
                memory_mb,
            })
            .await;

        let worker = DispatchWorker {
            task: Arc::clone(&task),
            infra,
            registry: Arc::clone(&self.registry),
            strategy: Arc::clone(&self.strategy),
            admission: Arc::clone(&self.admission),
            context: Arc::clone(&self.context),
            permits: Arc::clone(&self.permits),
            poll_interval: self.config.poll_interval(),
            max_queue_wait: self.config.max_queue_wait(),
            shutdown: self.shutdown_token.clone(),
        };
        {
            let mut dispatchers = self.dispatchers.lock();
            while dispatchers.try_join_next().is_some() {}
            dispatchers.spawn(worker.run());
        }

        Ok(task)
    }

    /// One cleaner pass: time out stale `WAITING` tasks and evict finished ones.
    pub async fn sweep_tasks(&self) -> SweepReport {
        self.tasks
            .sweep(self.config.max_queue_wait(), self.config.task_retention())
            .await
    }

    /// One liveness pass over the registered runner servers.
    pub async fn check_liveness(&self) -> Vec<LostRunnerServer> {
        check_liveness(&self.registry, &self.context).await
    }

    /// Start the cleaner and the liveness sweep.
    pub async fn start(&self) -> anyhow::Result<()> {
        if self.shutdown_token.is_cancelled() {
            anyhow::bail!("run queue already shut down");
        }
        let cleaner = self.spawn_cleaner();
        let liveness = self.spawn_liveness_sweep();
        self.background.lock().await.extend([cleaner, liveness]);
        Ok(())
    }

    /// Stop background loops and wait for wait loops to wind down.
    ///
    /// `WAITING` tasks end `CANCELLED`; running processes are left alone and
    /// their tasks stay `RUNNING`.
    pub async fn shutdown(&self) -> anyhow::Result<()> {
        tracing::info!("Initiating graceful shutdown of run queue");

        self.shutdown_token.cancel();

        let handles = {
            let mut guard = self.background.lock().await;
            std::mem::take(&mut *guard)
        };
        for handle in handles {
            match tokio::time::timeout(Duration::from_secs(30), handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::warn!("Background task failed: {:?}", e),
                Err(_) => tracing::warn!("Background task timed out during shutdown"),
            }
        }

        let mut dispatchers = std::mem::take(&mut *self.dispatchers.lock());
        let drained = tokio::time::timeout(Duration::from_secs(30), async {
            while let Some(result) = dispatchers.join_next().await {
                if let Err(e) = result {
                    tracing::warn!("Dispatch loop failed: {:?}", e);
                }
            }
        })
        .await;
        if drained.is_err() {
            tracing::warn!("Dispatch loops timed out during shutdown");
            dispatchers.abort_all();
        }

        tracing::info!("Run queue shutdown complete");
        Ok(())
    }

    fn spawn_cleaner(&self) -> JoinHandle<()> {
        let tasks = Arc::clone(&self.tasks);
        let interval = self.config.cleaner_interval();
        let max_queue_wait = self.config.max_queue_wait();
        let retention = self.config.task_retention();
        let shutdown = self.shutdown_token.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        tracing::info!("Cleaner shutting down");
                        break;
                    }
                    _ = tokio::time::sleep(interval) => {
                        let report = tasks.sweep(max_queue_wait, retention).await;
                        if report != SweepReport::default() {
                            tracing::debug!(
                                timed_out = report.timed_out,
                                evicted = report.evicted,
                                "cleaner pass"
                            );
                        }
                    }
                }
            }
        })
    }

    fn spawn_liveness_sweep(&self) -> JoinHandle<()> {
        let registry = Arc::clone(&self.registry);
        let context = Arc::clone(&self.context);
        let interval = self.config.liveness_interval();
        let shutdown = self.shutdown_token.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        tracing::info!("Liveness sweep shutting down");
                        break;
                    }
                    _ = tokio::time::sleep(interval) => {
                        check_liveness(&registry, &context).await;
                    }
                }
            }
        })
    }
}

async fn check_liveness(
    registry: &RunnerServerRegistry,
    context: &TaskContext,
) -> Vec<LostRunnerServer> {
    let lost = registry.sweep_liveness().await;
    if lost.is_empty() {
        return lost;
    }
    telemetry::set_runner_servers(registry.registrations().len());
    for server in &lost {
        telemetry::record_runner_server_lost(&server.location, server.failed_checks);
        context
            .emit(RunEventPayload::RunnerServerLost {
                location: server.location.clone(),
                failed_checks: server.failed_checks,
            })
            .await;
    }
    lost
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::timeout;

    #[tokio::test]
    async fn test_shutdown_token_shared_state() {
        let token = ShutdownToken::new();
        let clone1 = token.clone();
        let clone2 = token.clone();

        token.cancel();

        assert!(clone1.is_cancelled());
        assert!(clone2.is_cancelled());

        timeout(Duration::from_secs(1), clone1.cancelled())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_token_cancelled_wakes_clones() {
        let token = ShutdownToken::new();
        let clone1 = token.clone();
        let clone2 = token.clone();
        let clone3 = token.clone();

        let h1 = tokio::spawn(async move { clone1.cancelled().await });
        let h2 = tokio::spawn(async move { clone2.cancelled().await });
        let h3 = tokio::spawn(async move { clone3.cancelled().await });

        tokio::time::sleep(Duration::from_millis(50)).await;
        token.cancel();

        let results = timeout(
            Duration::from_secs(5),
            futures::future::join_all(vec![h1, h2, h3]),
        )
        .await
        .expect("waiters did not observe cancellation within 5 seconds");

        for r in results {
            r.expect("waiter task panicked");
        }
    }

    #[tokio::test]
    async fn test_shutdown_token_default_not_cancelled() {
        let token = ShutdownToken::default();
        assert!(!token.is_cancelled());
    }
}
