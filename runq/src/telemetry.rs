//! Tracing spans and record helpers for the run queue.
//!
//! Every helper logs through `tracing`. With the `metrics` feature enabled the
//! same calls also update the Prometheus collectors in [`crate::metrics`].
//!
//! # Spans
//!
//! - `runq.admission` around workspace memory admission
//! - `runq.build` around the optional build step
//! - `runq.dispatch` around the wait loop of one task
//! - `runq.supervise` around process supervision of one task

use tracing::{Span, info_span};

/// Span wrapping memory admission of a run request.
#[must_use]
pub fn admission_span(workspace: impl AsRef<str>, project: impl AsRef<str>, memory_mb: u64) -> Span {
    info_span!(
        "runq.admission",
        workspace = %workspace.as_ref(),
        project = %project.as_ref(),
        memory_mb = memory_mb,
    )
}

/// Span wrapping a build started for a run.
#[must_use]
pub fn build_span(
    workspace: impl AsRef<str>,
    project: impl AsRef<str>,
    builder: impl AsRef<str>,
) -> Span {
    info_span!(
        "runq.build",
        workspace = %workspace.as_ref(),
        project = %project.as_ref(),
        builder = %builder.as_ref(),
    )
}

/// Span wrapping the wait loop of one task until it is placed on a runner.
#[must_use]
pub fn dispatch_span(
    task_id: impl AsRef<str>,
    workspace: impl AsRef<str>,
    environment: impl AsRef<str>,
) -> Span {
    info_span!(
        "runq.dispatch",
        task_id = %task_id.as_ref(),
        workspace = %workspace.as_ref(),
        environment = %environment.as_ref(),
    )
}

/// Span wrapping supervision of a started process.
#[must_use]
pub fn supervise_span(task_id: impl AsRef<str>, runner: impl AsRef<str>, process_id: u64) -> Span {
    info_span!(
        "runq.supervise",
        task_id = %task_id.as_ref(),
        runner = %runner.as_ref(),
        process_id = process_id,
    )
}

/// Record a task admitted to the queue.
pub fn record_task_queued(workspace: impl AsRef<str>, environment: impl AsRef<str>) {
    tracing::info!(
        workspace = %workspace.as_ref(),
        environment = %environment.as_ref(),
        "task queued"
    );

    #[cfg(feature = "metrics")]
    crate::metrics::record_task_queued(workspace.as_ref());
}

/// Record a task placed on a runner after waiting `waited_secs`.
pub fn record_task_started(workspace: impl AsRef<str>, runner: impl AsRef<str>, waited_secs: f64) {
    tracing::info!(
        workspace = %workspace.as_ref(),
        runner = %runner.as_ref(),
        waited_secs = waited_secs,
        "task started"
    );

    #[cfg(feature = "metrics")]
    crate::metrics::record_task_started(runner.as_ref(), waited_secs);
}

/// Record a task reaching a terminal status.
pub fn record_task_finished(workspace: impl AsRef<str>, status: impl AsRef<str>) {
    tracing::debug!(
        workspace = %workspace.as_ref(),
        status = %status.as_ref(),
        "task terminal"
    );

    #[cfg(feature = "metrics")]
    crate::metrics::record_task_finished(workspace.as_ref(), status.as_ref());
}

/// Record the outcome of a build.
pub fn record_build_finished(builder: impl AsRef<str>, status: impl AsRef<str>) {
    tracing::info!(
        builder = %builder.as_ref(),
        status = %status.as_ref(),
        "build finished"
    );

    #[cfg(feature = "metrics")]
    crate::metrics::record_build_finished(builder.as_ref(), status.as_ref());
}

/// Record a runner server removed after failing liveness checks.
pub fn record_runner_server_lost(location: impl AsRef<str>, failed_checks: u32) {
    tracing::warn!(
        location = %location.as_ref(),
        failed_checks = failed_checks,
        "runner server lost"
    );

    #[cfg(feature = "metrics")]
    crate::metrics::record_runner_server_lost();
}

/// Update the committed memory of a workspace.
pub fn set_workspace_memory(workspace: impl AsRef<str>, committed_mb: u64, quota_mb: u64) {
    tracing::trace!(
        workspace = %workspace.as_ref(),
        committed_mb = committed_mb,
        quota_mb = quota_mb,
        "workspace memory updated"
    );

    #[cfg(feature = "metrics")]
    crate::metrics::set_workspace_memory(workspace.as_ref(), committed_mb as f64, quota_mb as f64);
}

/// Forget a workspace whose budget was dropped.
pub fn clear_workspace_memory(workspace: impl AsRef<str>) {
    tracing::trace!(workspace = %workspace.as_ref(), "workspace memory cleared");

    #[cfg(feature = "metrics")]
    crate::metrics::clear_workspace_memory(workspace.as_ref());
}

/// Update the number of registered runner servers.
pub fn set_runner_servers(count: usize) {
    tracing::debug!(count = count, "runner servers updated");

    #[cfg(feature = "metrics")]
    crate::metrics::set_runner_servers(count as f64);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn span_name(span: Span) -> Option<&'static str> {
        span.metadata().map(|metadata| metadata.name())
    }

    #[test]
    fn test_span_names() {
        tracing::subscriber::with_default(tracing_subscriber::registry(), || {
            assert_eq!(
                span_name(admission_span("ws1", "/app", 256)),
                Some("runq.admission")
            );
            assert_eq!(
                span_name(build_span("ws1", "/app", "maven")),
                Some("runq.build")
            );
            assert_eq!(
                span_name(dispatch_span("task-1", "ws1", "tomcat7")),
                Some("runq.dispatch")
            );
            assert_eq!(
                span_name(supervise_span("task-1", "java/web", 7)),
                Some("runq.supervise")
            );
        });
    }

    #[test]
    fn test_record_helpers_do_not_panic() {
        record_task_queued("ws1", "tomcat7");
        record_task_started("ws1", "java/web", 0.25);
        record_task_finished("ws1", "done");
        record_build_finished("maven", "successful");
        record_runner_server_lost("http://r1", 3);
        set_workspace_memory("ws1", 256, 1024);
        clear_workspace_memory("ws1");
        set_runner_servers(2);
    }
}
