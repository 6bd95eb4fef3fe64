use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Configuration for the run queue, its background sweeps and admission
/// thresholds.
///
/// Durations are expressed in milliseconds so the struct round-trips through
/// any serde format without custom adapters.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RunQueueConfig {
    /// Interval between attempts to find a runner for a waiting task, and
    /// between process status checks for a running one.
    pub poll_interval_ms: u64,
    /// Maximum time a task may spend waiting for a runner.
    pub max_queue_wait_ms: u64,
    /// Interval between build status checks.
    pub build_poll_interval_ms: u64,
    /// Maximum time to wait for a build to reach a terminal status.
    pub max_build_wait_ms: u64,
    /// Memory requested when neither run options nor project set a size.
    pub default_memory_mb: u64,
    /// Infra tier used when the workspace does not declare one.
    pub default_infra: String,
    /// Fraction of used disk space above which a runner is refused.
    pub disk_usage_threshold: f64,
    /// Period of the task cleaner.
    pub cleaner_interval_ms: u64,
    /// How long terminal tasks stay visible before eviction.
    pub task_retention_ms: u64,
    /// Period of the runner server liveness sweep.
    pub liveness_interval_ms: u64,
    /// Consecutive failed liveness checks before a server is unregistered.
    pub liveness_failure_threshold: u32,
    /// Timeout for contacting a runner server during registration.
    pub connect_timeout_ms: u64,
    /// Number of poll ticks allowed to run remote calls concurrently.
    pub worker_parallelism: usize,
    /// Capacity of the in-process event bus.
    pub event_capacity: usize,
}

impl Default for RunQueueConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1_000,
            max_queue_wait_ms: 600_000,
            build_poll_interval_ms: 1_000,
            max_build_wait_ms: 600_000,
            default_memory_mb: 256,
            default_infra: "community".to_string(),
            disk_usage_threshold: 0.95,
            cleaner_interval_ms: 10_000,
            task_retention_ms: 300_000,
            liveness_interval_ms: 30_000,
            liveness_failure_threshold: 3,
            connect_timeout_ms: 5_000,
            worker_parallelism: 16,
            event_capacity: 1_024,
        }
    }
}

impl RunQueueConfig {
    /// Set the runner poll interval.
    pub fn with_poll_interval(mut self, ms: u64) -> Self {
        self.poll_interval_ms = ms;
        self
    }

    /// Set the maximum queue wait.
    pub fn with_max_queue_wait(mut self, ms: u64) -> Self {
        self.max_queue_wait_ms = ms;
        self
    }

    /// Set the build poll interval.
    pub fn with_build_poll_interval(mut self, ms: u64) -> Self {
        self.build_poll_interval_ms = ms;
        self
    }

    /// Set the maximum build wait.
    pub fn with_max_build_wait(mut self, ms: u64) -> Self {
        self.max_build_wait_ms = ms;
        self
    }

    /// Set the default memory size for runs.
    pub fn with_default_memory(mut self, mb: u64) -> Self {
        self.default_memory_mb = mb;
        self
    }

    /// Set the default infra tier.
    pub fn with_default_infra(mut self, infra: impl Into<String>) -> Self {
        self.default_infra = infra.into();
        self
    }

    /// Set the disk usage threshold (0.0..=1.0).
    pub fn with_disk_usage_threshold(mut self, threshold: f64) -> Self {
        self.disk_usage_threshold = threshold;
        self
    }

    /// Set the cleaner period.
    pub fn with_cleaner_interval(mut self, ms: u64) -> Self {
        self.cleaner_interval_ms = ms;
        self
    }

    /// Set the terminal task retention window.
    pub fn with_task_retention(mut self, ms: u64) -> Self {
        self.task_retention_ms = ms;
        self
    }

    /// Set the liveness sweep period and failure threshold.
    pub fn with_liveness(mut self, interval_ms: u64, failure_threshold: u32) -> Self {
        self.liveness_interval_ms = interval_ms;
        self.liveness_failure_threshold = failure_threshold.max(1);
        self
    }

    /// Set the registration connect timeout.
    pub fn with_connect_timeout(mut self, ms: u64) -> Self {
        self.connect_timeout_ms = ms;
        self
    }

    /// Set the worker pool size.
    pub fn with_worker_parallelism(mut self, parallelism: usize) -> Self {
        self.worker_parallelism = parallelism.max(1);
        self
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn max_queue_wait(&self) -> Duration {
        Duration::from_millis(self.max_queue_wait_ms)
    }

    pub fn build_poll_interval(&self) -> Duration {
        Duration::from_millis(self.build_poll_interval_ms)
    }

    pub fn max_build_wait(&self) -> Duration {
        Duration::from_millis(self.max_build_wait_ms)
    }

    pub fn cleaner_interval(&self) -> Duration {
        Duration::from_millis(self.cleaner_interval_ms)
    }

    pub fn task_retention(&self) -> Duration {
        Duration::from_millis(self.task_retention_ms)
    }

    pub fn liveness_interval(&self) -> Duration {
        Duration::from_millis(self.liveness_interval_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_config_fills_defaults() {
        let config: RunQueueConfig =
            serde_json::from_str(r#"{"max_queue_wait_ms": 5000, "default_infra": "paid"}"#)
                .unwrap();

        assert_eq!(config.max_queue_wait(), Duration::from_secs(5));
        assert_eq!(config.default_infra, "paid");
        assert_eq!(config.poll_interval_ms, 1_000);
        assert_eq!(config.disk_usage_threshold, 0.95);
    }

    #[test]
    fn test_builder_methods_clamp_degenerate_values() {
        let config = RunQueueConfig::default()
            .with_worker_parallelism(0)
            .with_liveness(100, 0);

        assert_eq!(config.worker_parallelism, 1);
        assert_eq!(config.liveness_failure_threshold, 1);
        assert_eq!(config.liveness_interval(), Duration::from_millis(100));
    }
}
