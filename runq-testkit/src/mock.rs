use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::bail;
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use runq::*;

/// In-memory runner with scriptable state and outcomes.
#[derive(Clone)]
pub struct FakeRunner {
    inner: Arc<FakeRunnerInner>,
}

struct FakeRunnerInner {
    location: String,
    descriptor: RunnerDescriptor,
    state: Mutex<RunnerState>,
    state_error: Mutex<Option<String>>,
    run_error: Mutex<Option<String>>,
    process_status: Mutex<ProcessStatus>,
    submissions: Mutex<Vec<RunRequest>>,
    stopped: Mutex<Vec<u64>>,
    next_process_id: AtomicU64,
}

impl FakeRunner {
    /// A runner at `location` with 1 GB free and an empty disk.
    pub fn new(location: impl Into<String>, descriptor: RunnerDescriptor) -> Self {
        Self {
            inner: Arc::new(FakeRunnerInner {
                location: location.into(),
                descriptor,
                state: Mutex::new(RunnerState {
                    free_memory_mb: 1024,
                    disk_total: 100,
                    disk_used: 0,
                }),
                state_error: Mutex::new(None),
                run_error: Mutex::new(None),
                process_status: Mutex::new(ProcessStatus::Running),
                submissions: Mutex::new(Vec::new()),
                stopped: Mutex::new(Vec::new()),
                next_process_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn with_free_memory(self, free_memory_mb: u64) -> Self {
        self.inner.state.lock().free_memory_mb = free_memory_mb;
        self
    }

    pub fn with_disk(self, disk_total: u64, disk_used: u64) -> Self {
        {
            let mut state = self.inner.state.lock();
            state.disk_total = disk_total;
            state.disk_used = disk_used;
        }
        self
    }

    pub fn name(&self) -> &str {
        &self.inner.descriptor.name
    }

    pub fn location(&self) -> &str {
        &self.inner.location
    }

    pub fn set_state(&self, state: RunnerState) {
        *self.inner.state.lock() = state;
    }

    /// Make `state()` fail until cleared with `None`.
    pub fn set_state_error(&self, reason: Option<&str>) {
        *self.inner.state_error.lock() = reason.map(str::to_string);
    }

    /// Make `run()` fail until cleared with `None`.
    pub fn set_run_error(&self, reason: Option<&str>) {
        *self.inner.run_error.lock() = reason.map(str::to_string);
    }

    /// Status reported for every process started on this runner.
    pub fn set_process_status(&self, status: ProcessStatus) {
        *self.inner.process_status.lock() = status;
    }

    /// Requests passed to `run()`, accepted or not.
    pub fn submissions(&self) -> Vec<RunRequest> {
        self.inner.submissions.lock().clone()
    }

    pub fn stopped(&self) -> Vec<u64> {
        self.inner.stopped.lock().clone()
    }

    pub fn assert_submission_count_eq(&self, expected: usize) {
        let actual = self.inner.submissions.lock().len();
        assert_eq!(
            actual, expected,
            "Expected {} submissions to {}, got {}",
            expected, self.inner.descriptor.name, actual
        );
    }

    pub fn handle(&self) -> Arc<dyn RunnerHandle> {
        Arc::new(self.clone())
    }
}

#[async_trait]
impl RunnerHandle for FakeRunner {
    fn descriptor(&self) -> &RunnerDescriptor {
        &self.inner.descriptor
    }

    async fn state(&self) -> anyhow::Result<RunnerState> {
        if let Some(reason) = self.inner.state_error.lock().clone() {
            bail!(reason);
        }
        Ok(*self.inner.state.lock())
    }

    async fn run(&self, request: &RunRequest) -> anyhow::Result<ProcessHandle> {
        self.inner.submissions.lock().push(request.clone());
        if let Some(reason) = self.inner.run_error.lock().clone() {
            bail!(reason);
        }
        Ok(ProcessHandle {
            process_id: self.inner.next_process_id.fetch_add(1, Ordering::SeqCst),
            runner: self.inner.descriptor.name.clone(),
            location: self.inner.location.clone(),
            started_at: Utc::now(),
        })
    }

    async fn process_status(&self, _process_id: u64) -> anyhow::Result<ProcessStatus> {
        Ok(self.inner.process_status.lock().clone())
    }

    async fn stop(&self, process_id: u64) -> anyhow::Result<()> {
        self.inner.stopped.lock().push(process_id);
        Ok(())
    }
}

/// Runner server client over a set of in-memory servers.
#[derive(Clone, Default)]
pub struct FakeRunnerServerClient {
    servers: Arc<Mutex<HashMap<String, Vec<FakeRunner>>>>,
    unreachable: Arc<Mutex<HashSet<String>>>,
    connect_delay: Arc<Mutex<Option<Duration>>>,
    pings: Arc<Mutex<Vec<String>>>,
}

impl FakeRunnerServerClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Expose `runners` at `location`.
    pub fn add_server(&self, location: impl Into<String>, runners: Vec<FakeRunner>) {
        self.servers.lock().insert(location.into(), runners);
    }

    pub fn set_reachable(&self, location: &str, reachable: bool) {
        let mut unreachable = self.unreachable.lock();
        if reachable {
            unreachable.remove(location);
        } else {
            unreachable.insert(location.to_string());
        }
    }

    /// Delay every `connect()` call, to exercise connect timeouts.
    pub fn set_connect_delay(&self, delay: Option<Duration>) {
        *self.connect_delay.lock() = delay;
    }

    pub fn ping_count(&self, location: &str) -> usize {
        self.pings
            .lock()
            .iter()
            .filter(|pinged| pinged.as_str() == location)
            .count()
    }

    fn check_reachable(&self, location: &str) -> anyhow::Result<()> {
        if self.unreachable.lock().contains(location) {
            bail!("connection refused");
        }
        if !self.servers.lock().contains_key(location) {
            bail!("no runner server at {location}");
        }
        Ok(())
    }
}

#[async_trait]
impl RunnerServerClient for FakeRunnerServerClient {
    async fn connect(&self, location: &str) -> anyhow::Result<Vec<Arc<dyn RunnerHandle>>> {
        let delay = *self.connect_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.check_reachable(location)?;
        let runners = self
            .servers
            .lock()
            .get(location)
            .cloned()
            .unwrap_or_default();
        Ok(runners.iter().map(FakeRunner::handle).collect())
    }

    async fn ping(&self, location: &str) -> anyhow::Result<()> {
        self.pings.lock().push(location.to_string());
        self.check_reachable(location)
    }
}

#[derive(Clone, Debug)]
pub struct BuildRecord {
    pub build_id: String,
    pub workspace: String,
    pub project: String,
    pub options: BuildOptions,
}

/// Builder service replaying a scripted status sequence.
///
/// Every build starts `QUEUED`. Each `status()` call reports the next scripted
/// status; once the script is exhausted the last status repeats. With an empty
/// script builds succeed on the first poll.
#[derive(Clone, Default)]
pub struct FakeBuilderService {
    script: Arc<Mutex<VecDeque<BuildStatus>>>,
    last: Arc<Mutex<Option<BuildStatus>>>,
    start_error: Arc<Mutex<Option<String>>>,
    starts: Arc<Mutex<Vec<BuildRecord>>>,
    observed: Arc<Mutex<Vec<BuildStatus>>>,
    cancelled: Arc<Mutex<Vec<String>>>,
    next_id: Arc<AtomicU64>,
}

impl FakeBuilderService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_statuses(statuses: Vec<BuildStatus>) -> Self {
        let service = Self::default();
        *service.script.lock() = statuses.into();
        service
    }

    pub fn set_start_error(&self, reason: Option<&str>) {
        *self.start_error.lock() = reason.map(str::to_string);
    }

    pub fn starts(&self) -> Vec<BuildRecord> {
        self.starts.lock().clone()
    }

    /// Statuses handed out so far, the initial `QUEUED` included.
    pub fn observed_statuses(&self) -> Vec<BuildStatus> {
        self.observed.lock().clone()
    }

    pub fn cancelled(&self) -> Vec<String> {
        self.cancelled.lock().clone()
    }

    pub fn assert_start_count_eq(&self, expected: usize) {
        let actual = self.starts.lock().len();
        assert_eq!(
            actual, expected,
            "Expected {} builds started, got {}",
            expected, actual
        );
    }

    fn handle(build_id: &str, status: BuildStatus) -> BuildHandle {
        BuildHandle {
            id: build_id.to_string(),
            status,
            artifact: (status == BuildStatus::Successful).then(|| format!("{build_id}.zip")),
            error: (status == BuildStatus::Failed).then(|| format!("{build_id} failed")),
        }
    }
}

#[async_trait]
impl BuilderService for FakeBuilderService {
    async fn start_build(
        &self,
        workspace: &str,
        project: &str,
        options: &BuildOptions,
    ) -> anyhow::Result<BuildHandle> {
        if let Some(reason) = self.start_error.lock().clone() {
            bail!(reason);
        }
        let build_id = format!("build-{}", self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
        self.starts.lock().push(BuildRecord {
            build_id: build_id.clone(),
            workspace: workspace.to_string(),
            project: project.to_string(),
            options: options.clone(),
        });
        self.observed.lock().push(BuildStatus::Queued);
        Ok(Self::handle(&build_id, BuildStatus::Queued))
    }

    async fn status(&self, build_id: &str) -> anyhow::Result<BuildHandle> {
        let status = match self.script.lock().pop_front() {
            Some(status) => status,
            None => self.last.lock().unwrap_or(BuildStatus::Successful),
        };
        *self.last.lock() = Some(status);
        self.observed.lock().push(status);
        Ok(Self::handle(build_id, status))
    }

    async fn cancel_build(&self, build_id: &str) -> anyhow::Result<()> {
        self.cancelled.lock().push(build_id.to_string());
        Ok(())
    }
}
