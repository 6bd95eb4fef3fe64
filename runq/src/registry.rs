use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{Result, RunQueueError};
use crate::runner::{RunnerDescriptor, RunnerHandle, RunnerServerClient};

/// Scope restricting which runs may use a registered runner server.
///
/// Scopes nest: a workspace scope lives inside an infra tier and a project
/// scope inside a workspace, so a narrower scope always names every enclosing
/// one.
#[derive(Clone, Debug, Default, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(tag = "scope", rename_all = "snake_case")]
pub enum AccessCriteria {
    /// Usable by every run.
    #[default]
    Any,
    Infra {
        infra: String,
    },
    Workspace {
        infra: String,
        workspace: String,
    },
    Project {
        infra: String,
        workspace: String,
        project: String,
    },
}

impl AccessCriteria {
    pub fn infra(infra: impl Into<String>) -> Self {
        AccessCriteria::Infra {
            infra: infra.into(),
        }
    }

    pub fn workspace(infra: impl Into<String>, workspace: impl Into<String>) -> Self {
        AccessCriteria::Workspace {
            infra: infra.into(),
            workspace: workspace.into(),
        }
    }

    pub fn project(
        infra: impl Into<String>,
        workspace: impl Into<String>,
        project: impl Into<String>,
    ) -> Self {
        AccessCriteria::Project {
            infra: infra.into(),
            workspace: workspace.into(),
            project: project.into(),
        }
    }

    /// Whether a run in `(infra, workspace, project)` may use this scope.
    pub fn matches(&self, infra: &str, workspace: &str, project: &str) -> bool {
        match self {
            AccessCriteria::Any => true,
            AccessCriteria::Infra { infra: i } => i == infra,
            AccessCriteria::Workspace {
                infra: i,
                workspace: w,
            } => i == infra && w == workspace,
            AccessCriteria::Project {
                infra: i,
                workspace: w,
                project: p,
            } => i == infra && w == workspace && p == project,
        }
    }
}

/// Immutable view of one runner, handed to the selection strategy.
#[derive(Clone)]
pub struct RunnerCandidate {
    pub location: String,
    pub runner: Arc<dyn RunnerHandle>,
    /// `(server registration sequence, runner index on that server)`.
    pub registration_order: (u64, usize),
    /// Last time a run was submitted to this runner through the queue.
    pub last_used_at: Option<DateTime<Utc>>,
}

impl RunnerCandidate {
    pub fn descriptor(&self) -> &RunnerDescriptor {
        self.runner.descriptor()
    }

    pub fn name(&self) -> &str {
        &self.runner.descriptor().name
    }
}

impl fmt::Debug for RunnerCandidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunnerCandidate")
            .field("location", &self.location)
            .field("name", &self.name())
            .field("registration_order", &self.registration_order)
            .field("last_used_at", &self.last_used_at)
            .finish()
    }
}

/// Snapshot of a registered runner server.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RunnerServerRegistration {
    pub location: String,
    pub criteria: AccessCriteria,
    pub runners: Vec<RunnerDescriptor>,
}

struct RegisteredRunner {
    handle: Arc<dyn RunnerHandle>,
    last_used_at: Option<DateTime<Utc>>,
}

struct RegisteredServer {
    criteria: AccessCriteria,
    order: u64,
    runners: Vec<RegisteredRunner>,
    failed_checks: u32,
}

impl RegisteredServer {
    fn snapshot(&self, location: &str) -> RunnerServerRegistration {
        RunnerServerRegistration {
            location: location.to_string(),
            criteria: self.criteria.clone(),
            runners: self
                .runners
                .iter()
                .map(|runner| runner.handle.descriptor().clone())
                .collect(),
        }
    }
}

/// Server removed by the liveness sweep.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LostRunnerServer {
    pub location: String,
    pub failed_checks: u32,
}

/// Tracks registered runner servers and the runners they expose.
///
/// Structural changes take the map's write lock; remote calls (connect, ping)
/// are always made outside of it.
pub struct RunnerServerRegistry {
    client: Arc<dyn RunnerServerClient>,
    connect_timeout: Duration,
    failure_threshold: u32,
    servers: RwLock<HashMap<String, RegisteredServer>>,
    next_order: AtomicU64,
}

impl fmt::Debug for RunnerServerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut debug = f.debug_struct("RunnerServerRegistry");
        debug.field("connect_timeout", &self.connect_timeout);
        debug.field("failure_threshold", &self.failure_threshold);
        match self.servers.try_read() {
            Some(servers) => {
                debug.field("servers", &servers.len());
            }
            None => {
                debug.field("servers", &"<locked>");
            }
        }
        debug.finish_non_exhaustive()
    }
}

impl RunnerServerRegistry {
    pub fn new(
        client: Arc<dyn RunnerServerClient>,
        connect_timeout: Duration,
        failure_threshold: u32,
    ) -> Self {
        Self {
            client,
            connect_timeout,
            failure_threshold: failure_threshold.max(1),
            servers: RwLock::new(HashMap::new()),
            next_order: AtomicU64::new(0),
        }
    }

    /// Register the runner server at `location`.
    ///
    /// The server is contacted to fetch its runners; registration fails if it
    /// does not answer within the connect timeout.
    pub async fn register(
        &self,
        location: &str,
        criteria: AccessCriteria,
    ) -> Result<RunnerServerRegistration> {
        if self.servers.read().contains_key(location) {
            return Err(RunQueueError::AlreadyRegistered {
                location: location.to_string(),
            });
        }

        let handles = match tokio::time::timeout(self.connect_timeout, self.client.connect(location))
            .await
        {
            Ok(Ok(handles)) => handles,
            Ok(Err(err)) => {
                return Err(RunQueueError::UnreachableHost {
                    location: location.to_string(),
                    reason: err.to_string(),
                });
            }
            Err(_) => {
                return Err(RunQueueError::UnreachableHost {
                    location: location.to_string(),
                    reason: format!(
                        "no answer within {} ms",
                        self.connect_timeout.as_millis()
                    ),
                });
            }
        };

        let mut servers = self.servers.write();
        // Another registration for the same location may have won the race
        // while we were connecting.
        if servers.contains_key(location) {
            return Err(RunQueueError::AlreadyRegistered {
                location: location.to_string(),
            });
        }

        let server = RegisteredServer {
            criteria,
            order: self.next_order.fetch_add(1, Ordering::SeqCst),
            runners: handles
                .into_iter()
                .map(|handle| RegisteredRunner {
                    handle,
                    last_used_at: None,
                })
                .collect(),
            failed_checks: 0,
        };
        let registration = server.snapshot(location);
        servers.insert(location.to_string(), server);

        info!(
            location = %location,
            runners = registration.runners.len(),
            "runner server registered"
        );
        Ok(registration)
    }

    /// Remove the server at `location` and all its runners.
    ///
    /// Returns `false` when nothing was registered there.
    pub fn unregister(&self, location: &str) -> bool {
        let removed = self.servers.write().remove(location).is_some();
        if removed {
            info!(location = %location, "runner server unregistered");
        }
        removed
    }

    /// Runners visible to a run in `(infra, workspace, project)`, in
    /// registration order.
    pub fn candidates(&self, infra: &str, workspace: &str, project: &str) -> Vec<RunnerCandidate> {
        let servers = self.servers.read();
        let mut candidates: Vec<RunnerCandidate> = servers
            .iter()
            .filter(|(_, server)| server.criteria.matches(infra, workspace, project))
            .flat_map(|(location, server)| {
                server
                    .runners
                    .iter()
                    .enumerate()
                    .map(move |(index, runner)| RunnerCandidate {
                        location: location.clone(),
                        runner: Arc::clone(&runner.handle),
                        registration_order: (server.order, index),
                        last_used_at: runner.last_used_at,
                    })
            })
            .collect();
        candidates.sort_by_key(|candidate| candidate.registration_order);
        candidates
    }

    /// Distinct runner descriptors visible to `(infra, workspace, project)`.
    pub fn runner_list(&self, infra: &str, workspace: &str, project: &str) -> Vec<RunnerDescriptor> {
        let mut descriptors: Vec<RunnerDescriptor> = Vec::new();
        for candidate in self.candidates(infra, workspace, project) {
            if !descriptors.iter().any(|known| known.name == candidate.name()) {
                descriptors.push(candidate.descriptor().clone());
            }
        }
        descriptors
    }

    /// Snapshots of every registered server, in registration order.
    pub fn registrations(&self) -> Vec<RunnerServerRegistration> {
        let servers = self.servers.read();
        let mut ordered: Vec<(&String, &RegisteredServer)> = servers.iter().collect();
        ordered.sort_by_key(|(_, server)| server.order);
        ordered
            .into_iter()
            .map(|(location, server)| server.snapshot(location))
            .collect()
    }

    pub fn is_registered(&self, location: &str) -> bool {
        self.servers.read().contains_key(location)
    }

    /// Record that a run was just submitted to runner `name` at `location`.
    pub fn mark_used(&self, location: &str, name: &str) {
        let mut servers = self.servers.write();
        if let Some(server) = servers.get_mut(location) {
            for runner in server
                .runners
                .iter_mut()
                .filter(|runner| runner.handle.descriptor().name == name)
            {
                runner.last_used_at = Some(Utc::now());
            }
        }
    }

    /// Ping every registered server once.
    ///
    /// Servers failing `failure_threshold` consecutive checks are removed and
    /// returned.
    pub async fn sweep_liveness(&self) -> Vec<LostRunnerServer> {
        let locations: Vec<String> = self.servers.read().keys().cloned().collect();

        let mut results = Vec::with_capacity(locations.len());
        for location in locations {
            let alive = match tokio::time::timeout(self.connect_timeout, self.client.ping(&location))
                .await
            {
                Ok(Ok(())) => true,
                Ok(Err(err)) => {
                    debug!(location = %location, "liveness check failed: {err}");
                    false
                }
                Err(_) => {
                    debug!(location = %location, "liveness check timed out");
                    false
                }
            };
            results.push((location, alive));
        }

        let mut lost = Vec::new();
        let mut servers = self.servers.write();
        for (location, alive) in results {
            let Some(server) = servers.get_mut(&location) else {
                continue;
            };
            if alive {
                server.failed_checks = 0;
                continue;
            }
            server.failed_checks += 1;
            if server.failed_checks >= self.failure_threshold {
                let failed_checks = server.failed_checks;
                servers.remove(&location);
                warn!(
                    location = %location,
                    failed_checks,
                    "runner server unreachable; unregistering"
                );
                lost.push(LostRunnerServer {
                    location,
                    failed_checks,
                });
            }
        }
        lost
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::{ProcessHandle, ProcessStatus, RunRequest, RunnerState};
    use anyhow::bail;
    use async_trait::async_trait;
    use std::collections::HashSet;

    struct StubRunner {
        descriptor: RunnerDescriptor,
    }

    #[async_trait]
    impl RunnerHandle for StubRunner {
        fn descriptor(&self) -> &RunnerDescriptor {
            &self.descriptor
        }

        async fn state(&self) -> anyhow::Result<RunnerState> {
            Ok(RunnerState::default())
        }

        async fn run(&self, _request: &RunRequest) -> anyhow::Result<ProcessHandle> {
            bail!("stub runner does not run")
        }

        async fn process_status(&self, _process_id: u64) -> anyhow::Result<ProcessStatus> {
            Ok(ProcessStatus::Stopped)
        }

        async fn stop(&self, _process_id: u64) -> anyhow::Result<()> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct StubClient {
        dead: parking_lot::Mutex<HashSet<String>>,
        slow: HashSet<String>,
    }

    #[async_trait]
    impl RunnerServerClient for StubClient {
        async fn connect(&self, location: &str) -> anyhow::Result<Vec<Arc<dyn RunnerHandle>>> {
            if self.slow.contains(location) {
                tokio::time::sleep(Duration::from_secs(5)).await;
            }
            if self.dead.lock().contains(location) {
                bail!("connection refused");
            }
            let runner: Arc<dyn RunnerHandle> = Arc::new(StubRunner {
                descriptor: RunnerDescriptor::new(format!("{location}/java"))
                    .with_environment("tomcat7"),
            });
            Ok(vec![runner])
        }

        async fn ping(&self, location: &str) -> anyhow::Result<()> {
            if self.dead.lock().contains(location) {
                bail!("connection refused");
            }
            Ok(())
        }
    }

    fn registry(client: StubClient) -> RunnerServerRegistry {
        RunnerServerRegistry::new(Arc::new(client), Duration::from_millis(100), 2)
    }

    #[test]
    fn test_access_criteria_hierarchy() {
        let any = AccessCriteria::Any;
        let infra = AccessCriteria::infra("paid");
        let workspace = AccessCriteria::workspace("paid", "ws1");
        let project = AccessCriteria::project("paid", "ws1", "/app");

        assert!(any.matches("community", "ws9", "/x"));

        assert!(infra.matches("paid", "ws9", "/x"));
        assert!(!infra.matches("community", "ws1", "/app"));

        assert!(workspace.matches("paid", "ws1", "/anything"));
        assert!(!workspace.matches("paid", "ws2", "/app"));
        assert!(!workspace.matches("community", "ws1", "/app"));

        assert!(project.matches("paid", "ws1", "/app"));
        assert!(!project.matches("paid", "ws1", "/other"));
        assert!(!project.matches("paid", "ws2", "/app"));
    }

    #[tokio::test]
    async fn test_register_and_duplicate_registration() {
        let registry = registry(StubClient::default());

        let registration = registry
            .register("http://r1", AccessCriteria::Any)
            .await
            .unwrap();
        assert_eq!(registration.runners.len(), 1);
        assert!(registry.is_registered("http://r1"));

        let err = registry
            .register("http://r1", AccessCriteria::Any)
            .await
            .unwrap_err();
        assert_eq!(
            err,
            RunQueueError::AlreadyRegistered {
                location: "http://r1".into()
            }
        );
    }

    #[tokio::test]
    async fn test_register_unreachable_host() {
        let client = StubClient::default();
        client.dead.lock().insert("http://dead".into());
        let registry = registry(client);

        let err = registry
            .register("http://dead", AccessCriteria::Any)
            .await
            .unwrap_err();
        assert!(matches!(err, RunQueueError::UnreachableHost { .. }));
        assert!(!registry.is_registered("http://dead"));
    }

    #[tokio::test]
    async fn test_register_connect_timeout() {
        let client = StubClient {
            slow: HashSet::from(["http://slow".to_string()]),
            ..Default::default()
        };
        let registry = registry(client);

        let err = registry
            .register("http://slow", AccessCriteria::Any)
            .await
            .unwrap_err();
        match err {
            RunQueueError::UnreachableHost { reason, .. } => {
                assert!(reason.contains("100 ms"), "unexpected reason: {reason}")
            }
            other => panic!("expected UnreachableHost, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_unregister_absent_is_noop() {
        let registry = registry(StubClient::default());
        assert!(!registry.unregister("http://nowhere"));

        registry
            .register("http://r1", AccessCriteria::Any)
            .await
            .unwrap();
        assert!(registry.unregister("http://r1"));
        assert!(registry.candidates("community", "ws1", "/app").is_empty());
    }

    #[tokio::test]
    async fn test_workspace_scoped_candidates() {
        let registry = registry(StubClient::default());
        registry
            .register("http://ws1", AccessCriteria::workspace("community", "ws1"))
            .await
            .unwrap();

        assert_eq!(registry.candidates("community", "ws1", "/a").len(), 1);
        assert_eq!(registry.candidates("community", "ws1", "/b").len(), 1);
        assert!(registry.candidates("community", "ws2", "/a").is_empty());
        assert!(registry.candidates("paid", "ws1", "/a").is_empty());
    }

    #[tokio::test]
    async fn test_candidates_follow_registration_order() {
        let registry = registry(StubClient::default());
        for location in ["http://c", "http://a", "http://b"] {
            registry
                .register(location, AccessCriteria::Any)
                .await
                .unwrap();
        }

        let locations: Vec<String> = registry
            .candidates("community", "ws1", "/app")
            .into_iter()
            .map(|candidate| candidate.location)
            .collect();
        assert_eq!(locations, vec!["http://c", "http://a", "http://b"]);

        let listed: Vec<String> = registry
            .registrations()
            .into_iter()
            .map(|registration| registration.location)
            .collect();
        assert_eq!(listed, locations);
    }

    #[tokio::test]
    async fn test_mark_used_is_visible_in_next_snapshot() {
        let registry = registry(StubClient::default());
        registry
            .register("http://r1", AccessCriteria::Any)
            .await
            .unwrap();

        let before = registry.candidates("community", "ws1", "/app");
        assert!(before[0].last_used_at.is_none());

        registry.mark_used("http://r1", "http://r1/java");

        let after = registry.candidates("community", "ws1", "/app");
        assert!(after[0].last_used_at.is_some());
        // The earlier snapshot is unaffected.
        assert!(before[0].last_used_at.is_none());
    }

    #[tokio::test]
    async fn test_liveness_sweep_unregisters_after_threshold() {
        let client = Arc::new(StubClient::default());
        let registry = RunnerServerRegistry::new(
            Arc::clone(&client) as Arc<dyn RunnerServerClient>,
            Duration::from_millis(100),
            2,
        );
        registry
            .register("http://r1", AccessCriteria::Any)
            .await
            .unwrap();
        registry
            .register("http://r2", AccessCriteria::Any)
            .await
            .unwrap();

        client.dead.lock().insert("http://r1".into());

        assert!(registry.sweep_liveness().await.is_empty());
        assert!(registry.is_registered("http://r1"));

        let lost = registry.sweep_liveness().await;
        assert_eq!(
            lost,
            vec![LostRunnerServer {
                location: "http://r1".into(),
                failed_checks: 2,
            }]
        );
        assert!(!registry.is_registered("http://r1"));
        assert!(registry.is_registered("http://r2"));
    }

    #[tokio::test]
    async fn test_liveness_success_resets_failures() {
        let client = Arc::new(StubClient::default());
        let registry = RunnerServerRegistry::new(
            Arc::clone(&client) as Arc<dyn RunnerServerClient>,
            Duration::from_millis(100),
            2,
        );
        registry
            .register("http://r1", AccessCriteria::Any)
            .await
            .unwrap();

        client.dead.lock().insert("http://r1".into());
        assert!(registry.sweep_liveness().await.is_empty());

        client.dead.lock().clear();
        assert!(registry.sweep_liveness().await.is_empty());

        client.dead.lock().insert("http://r1".into());
        assert!(registry.sweep_liveness().await.is_empty());
        assert!(registry.is_registered("http://r1"));
    }
}
