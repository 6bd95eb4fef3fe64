use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::build::BuildOptions;
use crate::error::{Result, RunQueueError};
use crate::provider::ProjectConfig;
use crate::runner::EnvironmentId;

/// Caller intent for one run, layered over the project configuration.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunOptions {
    /// Overrides the project's default environment.
    pub environment: Option<String>,
    /// Overrides the project's default memory size.
    pub memory_mb: Option<u64>,
    /// Never build, even when the project declares a builder.
    pub skip_build: bool,
    /// Builder and targets; an empty builder name inherits the project's.
    pub build: Option<BuildOptions>,
    pub options: HashMap<String, String>,
    pub env_vars: HashMap<String, String>,
    pub user_token: Option<String>,
}

impl RunOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_environment(mut self, environment: impl Into<String>) -> Self {
        self.environment = Some(environment.into());
        self
    }

    pub fn with_memory(mut self, memory_mb: u64) -> Self {
        self.memory_mb = Some(memory_mb);
        self
    }

    pub fn skip_build(mut self) -> Self {
        self.skip_build = true;
        self
    }

    pub fn with_build(mut self, build: BuildOptions) -> Self {
        self.build = Some(build);
        self
    }

    pub fn with_option(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.options.insert(key.into(), value.into());
        self
    }

    pub fn with_env_var(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env_vars.insert(key.into(), value.into());
        self
    }

    pub fn with_user_token(mut self, token: impl Into<String>) -> Self {
        self.user_token = Some(token.into());
        self
    }

    /// Effective environment: run options first, then the project default.
    ///
    /// A `project://` environment needs recipes declared on the project.
    pub fn resolve_environment(&self, project: &ProjectConfig) -> Result<EnvironmentId> {
        let raw = self
            .environment
            .as_deref()
            .or(project.default_environment.as_deref())
            .filter(|raw| !raw.is_empty())
            .ok_or_else(|| {
                RunQueueError::Configuration("no environment requested or configured".into())
            })?;

        let environment = EnvironmentId::parse(raw);
        if let EnvironmentId::Project(name) = &environment {
            if name.is_empty() {
                return Err(RunQueueError::Configuration(format!(
                    "environment {raw} names no project environment"
                )));
            }
            if project.recipes.is_empty() {
                return Err(RunQueueError::Configuration(format!(
                    "environment {raw} requires recipes but the project declares none"
                )));
            }
        }
        Ok(environment)
    }

    /// Effective memory: run options, then the project default, then `fallback_mb`.
    pub fn resolve_memory(&self, project: &ProjectConfig, fallback_mb: u64) -> u64 {
        self.memory_mb
            .or(project.default_memory_mb)
            .unwrap_or(fallback_mb)
    }

    /// Project runner options overlaid with the run's own.
    pub fn merged_options(&self, project: &ProjectConfig) -> HashMap<String, String> {
        merge(&project.runner_options, &self.options)
    }

    /// Project environment variables overlaid with the run's own.
    pub fn merged_env_vars(&self, project: &ProjectConfig) -> HashMap<String, String> {
        merge(&project.env_vars, &self.env_vars)
    }
}

fn merge(base: &HashMap<String, String>, overrides: &HashMap<String, String>) -> HashMap<String, String> {
    let mut merged = base.clone();
    merged.extend(overrides.iter().map(|(k, v)| (k.clone(), v.clone())));
    merged
}
