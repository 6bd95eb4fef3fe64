use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Result, RunQueueError};
use crate::provider::ConfigProvider;
use crate::runner::RunnerState;
use crate::telemetry;

/// Memory bookkeeping for one workspace.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct WorkspaceResourceBudget {
    pub quota_mb: u64,
    pub committed_mb: u64,
    pub locked: bool,
}

impl WorkspaceResourceBudget {
    pub fn available_mb(&self) -> u64 {
        self.quota_mb.saturating_sub(self.committed_mb)
    }
}

/// Memory admitted against a workspace quota.
///
/// Returned by [`ResourceAdmissionChecker::check_memory`] and held for the
/// lifetime of a task. Releasing it more than once has no effect.
#[derive(Debug)]
pub struct MemoryReservation {
    pub id: Uuid,
    pub workspace: String,
    pub memory_mb: u64,
    pub acquired_at: DateTime<Utc>,
    released: AtomicBool,
}

impl MemoryReservation {
    fn new(workspace: &str, memory_mb: u64) -> Self {
        Self {
            id: Uuid::now_v7(),
            workspace: workspace.to_string(),
            memory_mb,
            acquired_at: Utc::now(),
            released: AtomicBool::new(false),
        }
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }
}

/// Holds a reservation until a task takes ownership of it.
///
/// Dropping the guard releases the memory, so a `run` call abandoned before
/// its task exists leaves nothing committed.
pub(crate) struct ReservationGuard<'a> {
    admission: &'a ResourceAdmissionChecker,
    reservation: Arc<MemoryReservation>,
    armed: bool,
}

impl<'a> ReservationGuard<'a> {
    pub(crate) fn new(admission: &'a ResourceAdmissionChecker, reservation: MemoryReservation) -> Self {
        Self {
            admission,
            reservation: Arc::new(reservation),
            armed: true,
        }
    }

    /// Hand the reservation over; the guard no longer releases it.
    pub(crate) fn hand_over(mut self) -> Arc<MemoryReservation> {
        self.armed = false;
        Arc::clone(&self.reservation)
    }
}

impl Drop for ReservationGuard<'_> {
    fn drop(&mut self) {
        if self.armed && self.admission.release(&self.reservation) {
            tracing::debug!(
                workspace = %self.reservation.workspace,
                memory_mb = self.reservation.memory_mb,
                "reservation released before a task took it"
            );
        }
    }
}

/// Validates run requests against workspace memory quotas and runner disk
/// usage.
///
/// Each workspace budget sits behind its own lock so admissions in different
/// workspaces never wait on each other; the outer map lock is only held to
/// find, create or drop an entry. A budget with nothing committed is dropped
/// on its last release, so the map holds only workspaces with live
/// reservations plus those rejected since.
pub struct ResourceAdmissionChecker {
    provider: Arc<dyn ConfigProvider>,
    disk_usage_threshold: f64,
    budgets: RwLock<HashMap<String, Arc<Mutex<WorkspaceResourceBudget>>>>,
}

impl fmt::Debug for ResourceAdmissionChecker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut debug = f.debug_struct("ResourceAdmissionChecker");
        debug.field("disk_usage_threshold", &self.disk_usage_threshold);
        match self.budgets.try_read() {
            Some(budgets) => {
                debug.field("workspaces", &budgets.len());
            }
            None => {
                debug.field("workspaces", &"<locked>");
            }
        }
        debug.finish_non_exhaustive()
    }
}

impl ResourceAdmissionChecker {
    pub fn new(provider: Arc<dyn ConfigProvider>, disk_usage_threshold: f64) -> Self {
        Self {
            provider,
            disk_usage_threshold,
            budgets: RwLock::new(HashMap::new()),
        }
    }

    fn entry(&self, workspace: &str) -> Arc<Mutex<WorkspaceResourceBudget>> {
        if let Some(entry) = self.budgets.read().get(workspace) {
            return Arc::clone(entry);
        }
        let mut budgets = self.budgets.write();
        Arc::clone(budgets.entry(workspace.to_string()).or_default())
    }

    /// Reserve `requested_mb` of the workspace quota.
    ///
    /// Quota and lock state are refreshed from the workspace configuration on
    /// every call. Fails without side effects if the workspace is locked or the
    /// request does not fit in `quota - committed`.
    pub async fn check_memory(
        &self,
        workspace: &str,
        requested_mb: u64,
    ) -> Result<MemoryReservation> {
        let config = self
            .provider
            .workspace_config(workspace)
            .await
            .map_err(|err| RunQueueError::Provider(err.to_string()))?;

        let entry = self.entry(workspace);
        let mut budget = entry.lock();
        budget.quota_mb = config.memory_quota_mb;
        budget.locked = config.locked;

        if budget.locked {
            return Err(RunQueueError::WorkspaceLocked {
                workspace: workspace.to_string(),
            });
        }

        let available = budget.available_mb();
        if requested_mb > available {
            return Err(RunQueueError::InsufficientResources {
                available,
                required: requested_mb,
            });
        }

        budget.committed_mb += requested_mb;
        telemetry::set_workspace_memory(workspace, budget.committed_mb, budget.quota_mb);
        tracing::debug!(
            workspace = %workspace,
            requested_mb,
            committed_mb = budget.committed_mb,
            quota_mb = budget.quota_mb,
            "memory admitted"
        );

        Ok(MemoryReservation::new(workspace, requested_mb))
    }

    /// Return a reservation's memory to its workspace.
    ///
    /// Returns `true` only for the call that actually released it.
    pub fn release(&self, reservation: &MemoryReservation) -> bool {
        if reservation
            .released
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return false;
        }

        let idle = {
            let entry = self.entry(&reservation.workspace);
            let mut budget = entry.lock();
            budget.committed_mb = budget.committed_mb.saturating_sub(reservation.memory_mb);
            telemetry::set_workspace_memory(
                &reservation.workspace,
                budget.committed_mb,
                budget.quota_mb,
            );
            tracing::debug!(
                workspace = %reservation.workspace,
                released_mb = reservation.memory_mb,
                committed_mb = budget.committed_mb,
                "memory released"
            );
            budget.committed_mb == 0
        };
        if idle {
            self.prune(&reservation.workspace);
        }
        true
    }

    /// Drop an idle budget. Entries another caller still holds are kept;
    /// holding the map write lock stops new holders from appearing.
    fn prune(&self, workspace: &str) {
        let mut budgets = self.budgets.write();
        let removable = budgets.get(workspace).is_some_and(|entry| {
            Arc::strong_count(entry) == 1 && entry.lock().committed_mb == 0
        });
        if removable {
            budgets.remove(workspace);
            telemetry::clear_workspace_memory(workspace);
        }
    }

    /// Number of workspaces with a tracked budget.
    pub fn tracked_workspaces(&self) -> usize {
        self.budgets.read().len()
    }

    /// Refuse runners whose disk usage is above the configured threshold.
    pub fn check_disk_space(&self, state: &RunnerState) -> Result<()> {
        if state.disk_usage() > self.disk_usage_threshold {
            return Err(RunQueueError::DiskSpaceExceeded {
                used: state.disk_used,
                total: state.disk_total,
                threshold: self.disk_usage_threshold,
            });
        }
        Ok(())
    }

    /// Current budget of a workspace; untouched workspaces report zeros.
    pub fn budget(&self, workspace: &str) -> WorkspaceResourceBudget {
        self.budgets
            .read()
            .get(workspace)
            .map(|entry| *entry.lock())
            .unwrap_or_default()
    }

    pub fn committed(&self, workspace: &str) -> u64 {
        self.budget(workspace).committed_mb
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{ProjectConfig, WorkspaceConfig};
    use async_trait::async_trait;

    #[derive(Default)]
    struct StubProvider {
        workspaces: Mutex<HashMap<String, WorkspaceConfig>>,
    }

    impl StubProvider {
        fn with_workspace(self, workspace: &str, config: WorkspaceConfig) -> Self {
            self.workspaces.lock().insert(workspace.to_string(), config);
            self
        }
    }

    #[async_trait]
    impl ConfigProvider for StubProvider {
        async fn project_config(
            &self,
            _workspace: &str,
            _project: &str,
        ) -> anyhow::Result<ProjectConfig> {
            Ok(ProjectConfig::default())
        }

        async fn workspace_config(&self, workspace: &str) -> anyhow::Result<WorkspaceConfig> {
            self.workspaces
                .lock()
                .get(workspace)
                .cloned()
                .ok_or_else(|| anyhow::anyhow!("unknown workspace {workspace}"))
        }
    }

    fn checker(provider: StubProvider) -> ResourceAdmissionChecker {
        ResourceAdmissionChecker::new(Arc::new(provider), 0.95)
    }

    #[tokio::test]
    async fn test_over_quota_request_is_rejected_without_side_effects() {
        let checker = checker(StubProvider::default().with_workspace("ws1", WorkspaceConfig::new(256)));

        let err = checker.check_memory("ws1", 300).await.unwrap_err();
        assert_eq!(
            err,
            RunQueueError::InsufficientResources {
                available: 256,
                required: 300
            }
        );
        assert_eq!(checker.committed("ws1"), 0);
    }

    #[tokio::test]
    async fn test_admission_accumulates_until_quota() {
        let checker = checker(StubProvider::default().with_workspace("ws1", WorkspaceConfig::new(512)));

        let first = checker.check_memory("ws1", 256).await.unwrap();
        let second = checker.check_memory("ws1", 256).await.unwrap();
        assert_eq!(checker.committed("ws1"), 512);

        let err = checker.check_memory("ws1", 1).await.unwrap_err();
        assert_eq!(
            err,
            RunQueueError::InsufficientResources {
                available: 0,
                required: 1
            }
        );

        assert!(checker.release(&first));
        assert_eq!(checker.committed("ws1"), 256);
        assert!(checker.release(&second));
        assert_eq!(checker.committed("ws1"), 0);
    }

    #[tokio::test]
    async fn test_release_is_idempotent() {
        let checker = checker(StubProvider::default().with_workspace("ws1", WorkspaceConfig::new(512)));

        let keep = checker.check_memory("ws1", 128).await.unwrap();
        let reservation = checker.check_memory("ws1", 256).await.unwrap();
        assert!(checker.release(&reservation));
        assert!(!checker.release(&reservation));
        assert!(!checker.release(&reservation));
        assert!(reservation.is_released());
        assert_eq!(checker.committed("ws1"), keep.memory_mb);
    }

    #[tokio::test]
    async fn test_locked_workspace_is_rejected() {
        let checker = checker(
            StubProvider::default().with_workspace("ws1", WorkspaceConfig::new(1024).locked()),
        );

        let err = checker.check_memory("ws1", 64).await.unwrap_err();
        assert_eq!(
            err,
            RunQueueError::WorkspaceLocked {
                workspace: "ws1".into()
            }
        );
        assert_eq!(checker.committed("ws1"), 0);
        assert!(checker.budget("ws1").locked);
    }

    #[tokio::test]
    async fn test_locking_does_not_revoke_existing_reservations() {
        let provider = Arc::new(
            StubProvider::default().with_workspace("ws1", WorkspaceConfig::new(512)),
        );
        let checker = ResourceAdmissionChecker::new(
            Arc::clone(&provider) as Arc<dyn ConfigProvider>,
            0.95,
        );

        let reservation = checker.check_memory("ws1", 256).await.unwrap();
        provider
            .workspaces
            .lock()
            .insert("ws1".into(), WorkspaceConfig::new(512).locked());

        assert!(checker.check_memory("ws1", 1).await.is_err());
        assert_eq!(checker.committed("ws1"), 256);
        assert!(checker.release(&reservation));
        assert_eq!(checker.committed("ws1"), 0);
    }

    #[tokio::test]
    async fn test_idle_budgets_are_dropped() {
        let checker = checker(
            StubProvider::default()
                .with_workspace("ws1", WorkspaceConfig::new(512))
                .with_workspace("ws2", WorkspaceConfig::new(512)),
        );

        let first = checker.check_memory("ws1", 128).await.unwrap();
        let second = checker.check_memory("ws1", 128).await.unwrap();
        let other = checker.check_memory("ws2", 64).await.unwrap();
        assert_eq!(checker.tracked_workspaces(), 2);

        checker.release(&first);
        assert_eq!(checker.tracked_workspaces(), 2);
        checker.release(&second);
        assert_eq!(checker.tracked_workspaces(), 1);
        assert_eq!(checker.budget("ws1"), WorkspaceResourceBudget::default());

        checker.release(&other);
        assert_eq!(checker.tracked_workspaces(), 0);

        // A dropped budget is rebuilt from the workspace config.
        let again = checker.check_memory("ws1", 512).await.unwrap();
        assert_eq!(checker.committed("ws1"), 512);
        assert_eq!(checker.budget("ws1").quota_mb, 512);
        checker.release(&again);
    }

    #[tokio::test]
    async fn test_dropped_guard_releases_reservation() {
        let checker = checker(StubProvider::default().with_workspace("ws1", WorkspaceConfig::new(512)));

        let reservation = checker.check_memory("ws1", 256).await.unwrap();
        drop(ReservationGuard::new(&checker, reservation));
        assert_eq!(checker.committed("ws1"), 0);

        let reservation = checker.check_memory("ws1", 256).await.unwrap();
        let kept = ReservationGuard::new(&checker, reservation).hand_over();
        assert_eq!(checker.committed("ws1"), 256);
        assert!(!kept.is_released());
        assert!(checker.release(&kept));
    }

    #[tokio::test]
    async fn test_provider_failure_is_reported() {
        let checker = checker(StubProvider::default());
        let err = checker.check_memory("missing", 64).await.unwrap_err();
        assert!(matches!(err, RunQueueError::Provider(_)));
    }

    #[tokio::test]
    async fn test_concurrent_admissions_never_exceed_quota() {
        let checker = Arc::new(checker(
            StubProvider::default().with_workspace("ws1", WorkspaceConfig::new(1000)),
        ));

        let attempts = (0..50).map(|_| {
            let checker = Arc::clone(&checker);
            tokio::spawn(async move { checker.check_memory("ws1", 64).await })
        });
        let results = futures::future::join_all(attempts).await;

        let admitted = results
            .into_iter()
            .filter(|result| matches!(result, Ok(Ok(_))))
            .count() as u64;
        assert_eq!(admitted, 1000 / 64);
        assert!(checker.committed("ws1") <= 1000);
    }

    #[test]
    fn test_disk_space_threshold() {
        let checker = checker(StubProvider::default());

        let healthy = RunnerState {
            free_memory_mb: 1024,
            disk_total: 100,
            disk_used: 95,
        };
        assert!(checker.check_disk_space(&healthy).is_ok());

        let full = RunnerState {
            free_memory_mb: 1024,
            disk_total: 100,
            disk_used: 96,
        };
        assert!(matches!(
            checker.check_disk_space(&full),
            Err(RunQueueError::DiskSpaceExceeded {
                used: 96,
                total: 100,
                ..
            })
        ));
    }
}
