use thiserror::Error;

/// Errors surfaced by the run dispatch queue.
///
/// Registration and admission errors are returned synchronously from the
/// call that caused them. Errors that happen after a task exists are recorded
/// on the task (see [`RunQueueTask::failure`](crate::task::RunQueueTask::failure))
/// and published as an event instead.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RunQueueError {
    #[error("runner server {location} is unreachable: {reason}")]
    UnreachableHost { location: String, reason: String },

    #[error("runner server {location} is already registered")]
    AlreadyRegistered { location: String },

    #[error("not enough memory: available {available} MB, required {required} MB")]
    InsufficientResources { available: u64, required: u64 },

    #[error("workspace {workspace} is locked")]
    WorkspaceLocked { workspace: String },

    #[error("runner disk usage {used}/{total} exceeds threshold {threshold}")]
    DiskSpaceExceeded { used: u64, total: u64, threshold: f64 },

    #[error("build failed: {reason}")]
    BuildFailed { reason: String },

    #[error("no runner became available within {waited_ms} ms{}", last_reason_suffix(.last_reason))]
    QueueTimeout {
        waited_ms: u64,
        last_reason: Option<String>,
    },

    #[error("runner {runner} rejected the run request: {reason}")]
    RunnerSubmission { runner: String, reason: String },

    #[error("process {process_id} on runner {runner} failed: {reason}")]
    ProcessFailed {
        runner: String,
        process_id: u64,
        reason: String,
    },

    #[error("invalid run configuration: {0}")]
    Configuration(String),

    #[error("configuration provider failed: {0}")]
    Provider(String),

    #[error("run queue is shutting down")]
    Shutdown,
}

fn last_reason_suffix(reason: &Option<String>) -> String {
    match reason {
        Some(reason) => format!(" (last reason: {reason})"),
        None => String::new(),
    }
}

impl RunQueueError {
    /// Short, stable classification used for event payloads and metric labels.
    pub fn kind(&self) -> &'static str {
        match self {
            RunQueueError::UnreachableHost { .. } => "unreachable_host",
            RunQueueError::AlreadyRegistered { .. } => "already_registered",
            RunQueueError::InsufficientResources { .. } => "insufficient_resources",
            RunQueueError::WorkspaceLocked { .. } => "workspace_locked",
            RunQueueError::DiskSpaceExceeded { .. } => "disk_space_exceeded",
            RunQueueError::BuildFailed { .. } => "build_failed",
            RunQueueError::QueueTimeout { .. } => "queue_timeout",
            RunQueueError::RunnerSubmission { .. } => "runner_submission",
            RunQueueError::ProcessFailed { .. } => "process_failed",
            RunQueueError::Configuration(_) => "configuration",
            RunQueueError::Provider(_) => "provider",
            RunQueueError::Shutdown => "shutdown",
        }
    }
}

pub type Result<T, E = RunQueueError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_timeout_message_includes_last_reason() {
        let err = RunQueueError::QueueTimeout {
            waited_ms: 5000,
            last_reason: Some("no runners".into()),
        };
        assert_eq!(
            err.to_string(),
            "no runner became available within 5000 ms (last reason: no runners)"
        );

        let err = RunQueueError::QueueTimeout {
            waited_ms: 5000,
            last_reason: None,
        };
        assert_eq!(err.to_string(), "no runner became available within 5000 ms");
    }

    #[test]
    fn test_insufficient_resources_message() {
        let err = RunQueueError::InsufficientResources {
            available: 256,
            required: 300,
        };
        assert_eq!(
            err.to_string(),
            "not enough memory: available 256 MB, required 300 MB"
        );
        assert_eq!(err.kind(), "insufficient_resources");
    }
}
