use std::collections::HashMap;
use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{Instrument, debug, warn};

use crate::error::{Result, RunQueueError};
use crate::provider::ProjectConfig;
use crate::runtime::ShutdownToken;
use crate::telemetry;

/// Status of a remote build.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BuildStatus {
    Queued,
    InProgress,
    Successful,
    Failed,
    Cancelled,
}

impl BuildStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            BuildStatus::Successful | BuildStatus::Failed | BuildStatus::Cancelled
        )
    }
}

impl Display for BuildStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let status = match self {
            BuildStatus::Queued => "queued",
            BuildStatus::InProgress => "in_progress",
            BuildStatus::Successful => "successful",
            BuildStatus::Failed => "failed",
            BuildStatus::Cancelled => "cancelled",
        };
        write!(f, "{status}")
    }
}

/// Remote build as last reported by the builder service.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct BuildHandle {
    pub id: String,
    pub status: BuildStatus,
    #[serde(default)]
    pub artifact: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

/// What to build and with which builder.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct BuildOptions {
    pub builder: String,
    #[serde(default)]
    pub targets: Vec<String>,
    #[serde(default)]
    pub options: HashMap<String, String>,
}

impl BuildOptions {
    pub fn new(builder: impl Into<String>) -> Self {
        Self {
            builder: builder.into(),
            ..Default::default()
        }
    }
}

/// Remote build service; only its polling contract is used.
#[async_trait]
pub trait BuilderService: Send + Sync {
    async fn start_build(
        &self,
        workspace: &str,
        project: &str,
        options: &BuildOptions,
    ) -> anyhow::Result<BuildHandle>;

    async fn status(&self, build_id: &str) -> anyhow::Result<BuildHandle>;

    async fn cancel_build(&self, build_id: &str) -> anyhow::Result<()>;
}

/// Decide whether a run needs a build, and with which builder.
///
/// An explicit `skip_build` wins; otherwise the run's builder overrides the
/// project default, and with neither the build is skipped.
pub fn resolve_build(
    skip_build: bool,
    requested: Option<&BuildOptions>,
    project: &ProjectConfig,
) -> Option<BuildOptions> {
    if skip_build {
        return None;
    }
    match requested {
        Some(options) if !options.builder.is_empty() => Some(options.clone()),
        Some(options) => project.default_builder.as_ref().map(|builder| BuildOptions {
            builder: builder.clone(),
            ..options.clone()
        }),
        None => project.default_builder.as_ref().map(BuildOptions::new),
    }
}

/// Cancels a started build if the wait for it is abandoned.
///
/// Dropping an armed guard spawns a best-effort `cancel_build` on the current
/// runtime.
struct AbandonedBuildGuard {
    service: Arc<dyn BuilderService>,
    build_id: String,
    armed: bool,
}

impl AbandonedBuildGuard {
    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for AbandonedBuildGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(build_id = %self.build_id, "build wait abandoned outside a runtime; build left running");
            return;
        };
        warn!(build_id = %self.build_id, "build wait abandoned; cancelling build");
        let service = Arc::clone(&self.service);
        let build_id = std::mem::take(&mut self.build_id);
        runtime.spawn(async move {
            if let Err(err) = service.cancel_build(&build_id).await {
                warn!(build_id = %build_id, "cancelling build failed: {err}");
            }
        });
    }
}

/// Starts builds and waits for them to reach a terminal status.
#[derive(Clone, Debug)]
pub struct BuildCoordinator {
    poll_interval: Duration,
}

impl BuildCoordinator {
    pub fn new(poll_interval: Duration) -> Self {
        Self { poll_interval }
    }

    /// Start a build and poll it until it finishes or `max_wait` elapses.
    ///
    /// Returns the artifact reference of a successful build. On timeout,
    /// shutdown, or when the returned future is dropped, the remote build is
    /// cancelled on a best-effort basis. Errors while polling are treated as
    /// transient and retried on the next tick.
    pub async fn build_then_wait(
        &self,
        service: Arc<dyn BuilderService>,
        workspace: &str,
        project: &str,
        options: &BuildOptions,
        max_wait: Duration,
        shutdown: &ShutdownToken,
    ) -> Result<Option<String>> {
        let span = telemetry::build_span(workspace, project, &options.builder);
        self.build_inner(service, workspace, project, options, max_wait, shutdown)
            .instrument(span)
            .await
    }

    async fn build_inner(
        &self,
        service: Arc<dyn BuilderService>,
        workspace: &str,
        project: &str,
        options: &BuildOptions,
        max_wait: Duration,
        shutdown: &ShutdownToken,
    ) -> Result<Option<String>> {
        let started = Instant::now();
        let mut handle = service
            .start_build(workspace, project, options)
            .await
            .map_err(|err| RunQueueError::BuildFailed {
                reason: format!("could not start build: {err}"),
            })?;
        debug!(build_id = %handle.id, status = %handle.status, "build started");
        let mut guard = AbandonedBuildGuard {
            service: Arc::clone(&service),
            build_id: handle.id.clone(),
            armed: true,
        };

        loop {
            match handle.status {
                BuildStatus::Successful => {
                    guard.disarm();
                    telemetry::record_build_finished(&options.builder, "successful");
                    return Ok(handle.artifact);
                }
                BuildStatus::Failed => {
                    guard.disarm();
                    telemetry::record_build_finished(&options.builder, "failed");
                    return Err(RunQueueError::BuildFailed {
                        reason: handle
                            .error
                            .unwrap_or_else(|| format!("build {} failed", handle.id)),
                    });
                }
                BuildStatus::Cancelled => {
                    guard.disarm();
                    telemetry::record_build_finished(&options.builder, "cancelled");
                    return Err(RunQueueError::BuildFailed {
                        reason: format!("build {} was cancelled", handle.id),
                    });
                }
                BuildStatus::Queued | BuildStatus::InProgress => {}
            }

            let elapsed = started.elapsed();
            if elapsed >= max_wait {
                guard.disarm();
                self.cancel_quietly(service.as_ref(), &handle.id).await;
                telemetry::record_build_finished(&options.builder, "timed_out");
                return Err(RunQueueError::QueueTimeout {
                    waited_ms: elapsed.as_millis() as u64,
                    last_reason: Some(format!(
                        "build {} still {} after {} ms",
                        handle.id,
                        handle.status,
                        max_wait.as_millis()
                    )),
                });
            }

            let sleep_for = self.poll_interval.min(max_wait - elapsed);
            tokio::select! {
                _ = shutdown.cancelled() => {
                    guard.disarm();
                    self.cancel_quietly(service.as_ref(), &handle.id).await;
                    return Err(RunQueueError::Shutdown);
                }
                _ = tokio::time::sleep(sleep_for) => {}
            }

            match service.status(&handle.id).await {
                Ok(updated) => {
                    if updated.status != handle.status {
                        debug!(build_id = %updated.id, status = %updated.status, "build status changed");
                    }
                    handle = updated;
                }
                Err(err) => {
                    warn!(build_id = %handle.id, "build status check failed: {err}");
                }
            }
        }
    }

    async fn cancel_quietly(&self, service: &dyn BuilderService, build_id: &str) {
        if let Err(err) = service.cancel_build(build_id).await {
            warn!(build_id = %build_id, "cancelling build failed: {err}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::bail;
    use parking_lot::Mutex;
    use std::collections::VecDeque;

    /// Reports each scripted status once, then repeats the last one.
    struct ScriptedBuilder {
        statuses: Mutex<VecDeque<anyhow::Result<BuildStatus>>>,
        last: Mutex<BuildStatus>,
        cancelled: Mutex<Vec<String>>,
        polls: Mutex<usize>,
    }

    impl ScriptedBuilder {
        fn new(first: BuildStatus, then: Vec<anyhow::Result<BuildStatus>>) -> Arc<Self> {
            Arc::new(Self {
                statuses: Mutex::new(then.into()),
                last: Mutex::new(first),
                cancelled: Mutex::new(Vec::new()),
                polls: Mutex::new(0),
            })
        }

        fn handle(status: BuildStatus) -> BuildHandle {
            BuildHandle {
                id: "b-1".into(),
                status,
                artifact: (status == BuildStatus::Successful).then(|| "app.war".to_string()),
                error: (status == BuildStatus::Failed).then(|| "compilation error".to_string()),
            }
        }
    }

    #[async_trait]
    impl BuilderService for ScriptedBuilder {
        async fn start_build(
            &self,
            _workspace: &str,
            _project: &str,
            _options: &BuildOptions,
        ) -> anyhow::Result<BuildHandle> {
            Ok(Self::handle(*self.last.lock()))
        }

        async fn status(&self, _build_id: &str) -> anyhow::Result<BuildHandle> {
            *self.polls.lock() += 1;
            let next = self.statuses.lock().pop_front();
            match next {
                Some(Ok(status)) => {
                    *self.last.lock() = status;
                    Ok(Self::handle(status))
                }
                Some(Err(err)) => Err(err),
                None => Ok(Self::handle(*self.last.lock())),
            }
        }

        async fn cancel_build(&self, build_id: &str) -> anyhow::Result<()> {
            self.cancelled.lock().push(build_id.to_string());
            Ok(())
        }
    }

    fn coordinator() -> BuildCoordinator {
        BuildCoordinator::new(Duration::from_millis(10))
    }

    #[tokio::test]
    async fn test_successful_build_returns_artifact() {
        let builder = ScriptedBuilder::new(
            BuildStatus::Queued,
            vec![
                Ok(BuildStatus::InProgress),
                Ok(BuildStatus::InProgress),
                Ok(BuildStatus::Successful),
            ],
        );

        let artifact = coordinator()
            .build_then_wait(
                builder.clone(),
                "ws1",
                "/app",
                &BuildOptions::new("maven"),
                Duration::from_secs(5),
                &ShutdownToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(artifact.as_deref(), Some("app.war"));
        assert_eq!(*builder.polls.lock(), 3);
    }

    #[tokio::test]
    async fn test_failed_build_reports_reason() {
        let builder = ScriptedBuilder::new(
            BuildStatus::InProgress,
            vec![Ok(BuildStatus::Failed)],
        );

        let err = coordinator()
            .build_then_wait(
                builder.clone(),
                "ws1",
                "/app",
                &BuildOptions::new("maven"),
                Duration::from_secs(5),
                &ShutdownToken::new(),
            )
            .await
            .unwrap_err();

        assert_eq!(
            err,
            RunQueueError::BuildFailed {
                reason: "compilation error".into()
            }
        );
    }

    #[tokio::test]
    async fn test_transient_status_errors_are_retried() {
        let builder = ScriptedBuilder::new(
            BuildStatus::Queued,
            vec![
                Err(anyhow::anyhow!("builder restarting")),
                Ok(BuildStatus::Successful),
            ],
        );

        let artifact = coordinator()
            .build_then_wait(
                builder.clone(),
                "ws1",
                "/app",
                &BuildOptions::new("maven"),
                Duration::from_secs(5),
                &ShutdownToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(artifact.as_deref(), Some("app.war"));
    }

    #[tokio::test]
    async fn test_timeout_cancels_remote_build() {
        let builder = ScriptedBuilder::new(BuildStatus::InProgress, vec![]);

        let err = coordinator()
            .build_then_wait(
                builder.clone(),
                "ws1",
                "/app",
                &BuildOptions::new("maven"),
                Duration::from_millis(50),
                &ShutdownToken::new(),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, RunQueueError::QueueTimeout { .. }));
        assert_eq!(*builder.cancelled.lock(), vec!["b-1".to_string()]);
    }

    #[tokio::test]
    async fn test_shutdown_cancels_remote_build() {
        let builder = ScriptedBuilder::new(BuildStatus::InProgress, vec![]);
        let shutdown = ShutdownToken::new();
        shutdown.cancel();

        let err = coordinator()
            .build_then_wait(
                builder.clone(),
                "ws1",
                "/app",
                &BuildOptions::new("maven"),
                Duration::from_secs(5),
                &shutdown,
            )
            .await
            .unwrap_err();

        assert_eq!(err, RunQueueError::Shutdown);
        assert_eq!(builder.cancelled.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_abandoned_wait_cancels_remote_build() {
        let builder = ScriptedBuilder::new(BuildStatus::InProgress, vec![]);
        let coordinator = coordinator();
        let options = BuildOptions::new("maven");
        let shutdown = ShutdownToken::new();

        let wait = coordinator.build_then_wait(
            builder.clone(),
            "ws1",
            "/app",
            &options,
            Duration::from_secs(5),
            &shutdown,
        );
        assert!(tokio::time::timeout(Duration::from_millis(50), wait).await.is_err());

        // The cancel call runs on a spawned task.
        for _ in 0..100 {
            if !builder.cancelled.lock().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(*builder.cancelled.lock(), vec!["b-1".to_string()]);
    }

    #[tokio::test]
    async fn test_finished_build_is_not_cancelled() {
        let builder = ScriptedBuilder::new(BuildStatus::Queued, vec![Ok(BuildStatus::Successful)]);

        coordinator()
            .build_then_wait(
                builder.clone(),
                "ws1",
                "/app",
                &BuildOptions::new("maven"),
                Duration::from_secs(5),
                &ShutdownToken::new(),
            )
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(builder.cancelled.lock().is_empty());
    }

    #[tokio::test]
    async fn test_start_failure_is_a_build_failure() {
        struct Unavailable;

        #[async_trait]
        impl BuilderService for Unavailable {
            async fn start_build(
                &self,
                _workspace: &str,
                _project: &str,
                _options: &BuildOptions,
            ) -> anyhow::Result<BuildHandle> {
                bail!("no builder slots")
            }

            async fn status(&self, _build_id: &str) -> anyhow::Result<BuildHandle> {
                bail!("not started")
            }

            async fn cancel_build(&self, _build_id: &str) -> anyhow::Result<()> {
                Ok(())
            }
        }

        let err = coordinator()
            .build_then_wait(
                Arc::new(Unavailable),
                "ws1",
                "/app",
                &BuildOptions::new("maven"),
                Duration::from_secs(1),
                &ShutdownToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, RunQueueError::BuildFailed { .. }));
    }

    #[test]
    fn test_resolve_build_precedence() {
        let project = ProjectConfig {
            default_builder: Some("maven".into()),
            ..Default::default()
        };

        assert_eq!(
            resolve_build(false, None, &project),
            Some(BuildOptions::new("maven"))
        );
        assert_eq!(
            resolve_build(false, Some(&BuildOptions::new("gradle")), &project),
            Some(BuildOptions::new("gradle"))
        );
        assert_eq!(resolve_build(true, None, &project), None);
        assert_eq!(
            resolve_build(true, Some(&BuildOptions::new("gradle")), &project),
            None
        );
        assert_eq!(resolve_build(false, None, &ProjectConfig::default()), None);

        // Options without a builder name inherit the project default.
        let targets = BuildOptions {
            targets: vec!["package".into()],
            ..Default::default()
        };
        let resolved = resolve_build(false, Some(&targets), &project).unwrap();
        assert_eq!(resolved.builder, "maven");
        assert_eq!(resolved.targets, vec!["package".to_string()]);
    }
}
