use std::collections::HashMap;
use std::fmt::Display;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Prefix selecting an environment embedded in the project itself.
pub const PROJECT_ENVIRONMENT_PREFIX: &str = "project://";

/// Environment a run executes in.
///
/// System environments are images offered by runners directly; project
/// environments are built from recipes shipped with the project and can only
/// run on recipe-based runners.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum EnvironmentId {
    System(String),
    Project(String),
}

impl EnvironmentId {
    /// Parse an environment id, recognising the `project://name` form.
    pub fn parse(raw: &str) -> Self {
        match raw.strip_prefix(PROJECT_ENVIRONMENT_PREFIX) {
            Some(name) => EnvironmentId::Project(name.to_string()),
            None => EnvironmentId::System(raw.to_string()),
        }
    }

    pub fn is_project(&self) -> bool {
        matches!(self, EnvironmentId::Project(_))
    }
}

impl Display for EnvironmentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EnvironmentId::System(id) => write!(f, "{id}"),
            EnvironmentId::Project(name) => write!(f, "{PROJECT_ENVIRONMENT_PREFIX}{name}"),
        }
    }
}

/// Static description of a runner, fetched once when its server registers.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct RunnerDescriptor {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// System environment ids this runner can start.
    #[serde(default)]
    pub environments: Vec<String>,
    /// Whether the runner can assemble an environment from project recipes.
    #[serde(default)]
    pub recipe_based: bool,
}

impl RunnerDescriptor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            environments: Vec::new(),
            recipe_based: false,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_environment(mut self, environment: impl Into<String>) -> Self {
        self.environments.push(environment.into());
        self
    }

    pub fn recipe_based(mut self) -> Self {
        self.recipe_based = true;
        self
    }

    /// Whether a run in `environment` can be placed on this runner.
    pub fn supports(&self, environment: &EnvironmentId) -> bool {
        match environment {
            EnvironmentId::System(id) => self.environments.iter().any(|env| env == id),
            EnvironmentId::Project(_) => self.recipe_based,
        }
    }
}

/// Resources a runner reports as currently available.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct RunnerState {
    pub free_memory_mb: u64,
    pub disk_total: u64,
    pub disk_used: u64,
}

impl RunnerState {
    /// Fraction of disk in use; an unknown total counts as empty.
    pub fn disk_usage(&self) -> f64 {
        if self.disk_total == 0 {
            return 0.0;
        }
        self.disk_used as f64 / self.disk_total as f64
    }
}

/// Fully resolved request submitted to a runner.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RunRequest {
    pub workspace: String,
    pub project: String,
    /// Name of the runner the request is placed on; filled at submission.
    pub runner: String,
    pub environment: EnvironmentId,
    pub memory_mb: u64,
    pub options: HashMap<String, String>,
    pub env_vars: HashMap<String, String>,
    pub recipes: Vec<String>,
    /// Artifact produced by the build step, if one ran.
    pub artifact: Option<String>,
    pub user_token: Option<String>,
}

/// Process spawned on a runner for one task.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct ProcessHandle {
    pub process_id: u64,
    pub runner: String,
    pub location: String,
    pub started_at: DateTime<Utc>,
}

/// Lifecycle of a process as reported by its runner.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProcessStatus {
    Running,
    Stopped,
    Failed { reason: String },
}

/// Proxy to one named runner on a remote runner server.
#[async_trait]
pub trait RunnerHandle: Send + Sync {
    /// Descriptor fetched at registration time.
    fn descriptor(&self) -> &RunnerDescriptor;

    /// Current free memory and disk usage of the host.
    async fn state(&self) -> anyhow::Result<RunnerState>;

    /// Start a process for `request`.
    async fn run(&self, request: &RunRequest) -> anyhow::Result<ProcessHandle>;

    /// Current status of a previously started process.
    async fn process_status(&self, process_id: u64) -> anyhow::Result<ProcessStatus>;

    /// Ask the runner to stop a process.
    async fn stop(&self, process_id: u64) -> anyhow::Result<()>;
}

/// Connects to runner servers by location.
///
/// The registry uses this seam to discover the runners a server exposes and to
/// check that it is still alive.
#[async_trait]
pub trait RunnerServerClient: Send + Sync {
    /// Contact the server at `location` and return a handle per runner it
    /// exposes.
    async fn connect(&self, location: &str) -> anyhow::Result<Vec<Arc<dyn RunnerHandle>>>;

    /// Check that the server at `location` still answers.
    async fn ping(&self, location: &str) -> anyhow::Result<()>;
}
