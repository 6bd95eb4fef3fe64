use std::collections::HashMap;
use std::sync::Arc;

use anyhow::anyhow;
use async_trait::async_trait;
use parking_lot::RwLock;
use runq::{ConfigProvider, ProjectConfig, WorkspaceConfig};

/// Config provider backed by in-memory maps.
///
/// Unknown workspaces are an error; unknown projects of a known workspace get
/// a default [`ProjectConfig`].
#[derive(Clone, Default)]
pub struct StaticConfigProvider {
    workspaces: Arc<RwLock<HashMap<String, WorkspaceConfig>>>,
    projects: Arc<RwLock<HashMap<(String, String), ProjectConfig>>>,
}

impl StaticConfigProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_workspace(self, workspace: &str, config: WorkspaceConfig) -> Self {
        self.set_workspace(workspace, config);
        self
    }

    pub fn with_project(self, workspace: &str, project: &str, config: ProjectConfig) -> Self {
        self.set_project(workspace, project, config);
        self
    }

    pub fn set_workspace(&self, workspace: &str, config: WorkspaceConfig) {
        self.workspaces.write().insert(workspace.to_string(), config);
    }

    pub fn set_project(&self, workspace: &str, project: &str, config: ProjectConfig) {
        self.projects
            .write()
            .insert((workspace.to_string(), project.to_string()), config);
    }
}

#[async_trait]
impl ConfigProvider for StaticConfigProvider {
    async fn project_config(&self, workspace: &str, project: &str) -> anyhow::Result<ProjectConfig> {
        if !self.workspaces.read().contains_key(workspace) {
            return Err(anyhow!("unknown workspace {workspace}"));
        }
        Ok(self
            .projects
            .read()
            .get(&(workspace.to_string(), project.to_string()))
            .cloned()
            .unwrap_or_default())
    }

    async fn workspace_config(&self, workspace: &str) -> anyhow::Result<WorkspaceConfig> {
        self.workspaces
            .read()
            .get(workspace)
            .cloned()
            .ok_or_else(|| anyhow!("unknown workspace {workspace}"))
    }
}
