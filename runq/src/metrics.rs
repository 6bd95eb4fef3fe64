//! Prometheus metrics for the run queue.
//!
//! Compiled only with the `metrics` feature. Call [`init_metrics`] once to
//! register the collectors with [`REGISTRY`].
//!
//! # Metrics
//!
//! ## Counters
//! - `runq_tasks_queued_total` - Tasks admitted to the queue
//! - `runq_tasks_finished_total` - Tasks reaching a terminal status
//! - `runq_builds_finished_total` - Builds by outcome
//! - `runq_runner_servers_lost_total` - Runner servers removed by liveness checks
//!
//! ## Gauges
//! - `runq_workspace_memory_committed_mb` - Memory committed per workspace
//! - `runq_workspace_memory_quota_mb` - Memory quota per workspace
//! - `runq_runner_servers` - Registered runner servers
//!
//! ## Histograms
//! - `runq_queue_wait_seconds` - Time from admission to placement on a runner
#![cfg(feature = "metrics")]

use prometheus::{Counter, CounterVec, Gauge, GaugeVec, HistogramVec, Opts, Registry, exponential_buckets};
use std::sync::LazyLock;

/// Global Prometheus registry for run queue metrics.
pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

/// Labels: `workspace`.
pub static TASKS_QUEUED_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new("runq_tasks_queued_total", "Tasks admitted to the queue");
    CounterVec::new(opts, &["workspace"]).expect("runq_tasks_queued_total metric creation failed")
});

/// Labels: `workspace`, `status` (done, cancelled, error).
pub static TASKS_FINISHED_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new(
        "runq_tasks_finished_total",
        "Tasks reaching a terminal status",
    );
    CounterVec::new(opts, &["workspace", "status"])
        .expect("runq_tasks_finished_total metric creation failed")
});

/// Labels: `builder`, `status`.
pub static BUILDS_FINISHED_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new("runq_builds_finished_total", "Builds by outcome");
    CounterVec::new(opts, &["builder", "status"])
        .expect("runq_builds_finished_total metric creation failed")
});

/// Unlabelled; the lost location is in the `RunnerServerLost` event and log.
pub static RUNNER_SERVERS_LOST_TOTAL: LazyLock<Counter> = LazyLock::new(|| {
    Counter::new(
        "runq_runner_servers_lost_total",
        "Runner servers removed after failing liveness checks",
    )
    .expect("runq_runner_servers_lost_total metric creation failed")
});

pub static WORKSPACE_MEMORY_COMMITTED: LazyLock<GaugeVec> = LazyLock::new(|| {
    let opts = Opts::new(
        "runq_workspace_memory_committed_mb",
        "Memory committed per workspace in MB",
    );
    GaugeVec::new(opts, &["workspace"])
        .expect("runq_workspace_memory_committed_mb metric creation failed")
});

pub static WORKSPACE_MEMORY_QUOTA: LazyLock<GaugeVec> = LazyLock::new(|| {
    let opts = Opts::new(
        "runq_workspace_memory_quota_mb",
        "Memory quota per workspace in MB",
    );
    GaugeVec::new(opts, &["workspace"])
        .expect("runq_workspace_memory_quota_mb metric creation failed")
});

pub static RUNNER_SERVERS: LazyLock<Gauge> = LazyLock::new(|| {
    Gauge::new("runq_runner_servers", "Registered runner servers")
        .expect("runq_runner_servers metric creation failed")
});

/// Labels: `runner`.
pub static QUEUE_WAIT_SECONDS: LazyLock<HistogramVec> = LazyLock::new(|| {
    let buckets = exponential_buckets(0.01, 2.0, 16).expect("bucket creation failed");
    let opts = prometheus::HistogramOpts::new(
        "runq_queue_wait_seconds",
        "Time from admission to placement on a runner",
    )
    .buckets(buckets);
    HistogramVec::new(opts, &["runner"]).expect("runq_queue_wait_seconds metric creation failed")
});

/// Register all collectors with [`REGISTRY`]. Safe to call more than once.
pub fn init_metrics() -> anyhow::Result<()> {
    let registry = &*REGISTRY;

    for metric in [
        Box::new(TASKS_QUEUED_TOTAL.clone()) as Box<dyn prometheus::core::Collector>,
        Box::new(TASKS_FINISHED_TOTAL.clone()),
        Box::new(BUILDS_FINISHED_TOTAL.clone()),
        Box::new(RUNNER_SERVERS_LOST_TOTAL.clone()),
        Box::new(WORKSPACE_MEMORY_COMMITTED.clone()),
        Box::new(WORKSPACE_MEMORY_QUOTA.clone()),
        Box::new(RUNNER_SERVERS.clone()),
        Box::new(QUEUE_WAIT_SECONDS.clone()),
    ] {
        if let Err(e) = registry.register(metric) {
            let msg = e.to_string();
            if !msg.contains("Duplicate metrics collector registration attempted") {
                return Err(e.into());
            }
        }
    }

    Ok(())
}

pub fn record_task_queued(workspace: &str) {
    TASKS_QUEUED_TOTAL.with_label_values(&[workspace]).inc();
}

pub fn record_task_started(runner: &str, waited_secs: f64) {
    QUEUE_WAIT_SECONDS
        .with_label_values(&[runner])
        .observe(waited_secs);
}

pub fn record_task_finished(workspace: &str, status: &str) {
    TASKS_FINISHED_TOTAL
        .with_label_values(&[workspace, status])
        .inc();
}

pub fn record_build_finished(builder: &str, status: &str) {
    BUILDS_FINISHED_TOTAL
        .with_label_values(&[builder, status])
        .inc();
}

pub fn record_runner_server_lost() {
    RUNNER_SERVERS_LOST_TOTAL.inc();
}

pub fn set_workspace_memory(workspace: &str, committed_mb: f64, quota_mb: f64) {
    WORKSPACE_MEMORY_COMMITTED
        .with_label_values(&[workspace])
        .set(committed_mb);
    WORKSPACE_MEMORY_QUOTA
        .with_label_values(&[workspace])
        .set(quota_mb);
}

/// Drop the per-workspace memory series of a workspace with nothing committed.
pub fn clear_workspace_memory(workspace: &str) {
    let _ = WORKSPACE_MEMORY_COMMITTED.remove_label_values(&[workspace]);
    let _ = WORKSPACE_MEMORY_QUOTA.remove_label_values(&[workspace]);
}

pub fn set_runner_servers(count: f64) {
    RUNNER_SERVERS.set(count);
}

/// Gather all registered metrics in Prometheus text format.
pub fn gather_metrics() -> anyhow::Result<String> {
    let encoder = prometheus::TextEncoder::new();
    let metric_families = REGISTRY.gather();
    encoder
        .encode_to_string(&metric_families)
        .map_err(Into::into)
}
