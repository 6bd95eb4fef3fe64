use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Workspace attribute naming the infra tier its runs are placed on.
pub const INFRA_ATTRIBUTE: &str = "runner.infra";

/// Run-related settings of a project.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProjectConfig {
    pub default_environment: Option<String>,
    pub default_builder: Option<String>,
    pub default_memory_mb: Option<u64>,
    pub recipes: Vec<String>,
    pub runner_options: HashMap<String, String>,
    pub env_vars: HashMap<String, String>,
}

/// Resource settings of a workspace.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkspaceConfig {
    pub memory_quota_mb: u64,
    pub locked: bool,
    pub attributes: HashMap<String, String>,
}

impl WorkspaceConfig {
    pub fn new(memory_quota_mb: u64) -> Self {
        Self {
            memory_quota_mb,
            ..Default::default()
        }
    }

    pub fn locked(mut self) -> Self {
        self.locked = true;
        self
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    /// Infra tier declared through [`INFRA_ATTRIBUTE`], if any.
    pub fn infra(&self) -> Option<&str> {
        self.attributes.get(INFRA_ATTRIBUTE).map(String::as_str)
    }
}

/// Source of project and workspace configuration.
#[async_trait]
pub trait ConfigProvider: Send + Sync {
    async fn project_config(&self, workspace: &str, project: &str) -> anyhow::Result<ProjectConfig>;

    async fn workspace_config(&self, workspace: &str) -> anyhow::Result<WorkspaceConfig>;
}
