//! Global configuration types for Pipewright.
//!
//! `GlobalConfig` represents the top-level `config.toml` that controls the
//! workflow engine's concurrency and timeouts and where run state is stored.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Top-level configuration for the Pipewright platform.
///
/// Loaded from `~/.pipewright/config.toml`. All fields have sensible defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GlobalConfig {
    /// Workflow engine tuning.
    #[serde(default)]
    pub engine: EngineConfig,

    /// Override for the run-state database URL.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database_url: Option<String>,
}

/// Workflow engine settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Maximum number of steps executing at once within a single run.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,

    /// Deadline for steps that do not declare their own timeout.
    #[serde(default = "default_step_timeout_secs")]
    pub default_step_timeout_secs: u64,
}

fn default_max_concurrent() -> usize {
    4
}

fn default_step_timeout_secs() -> u64 {
    300
}

impl EngineConfig {
    pub fn default_step_timeout(&self) -> Duration {
        Duration::from_secs(self.default_step_timeout_secs)
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
            default_step_timeout_secs: default_step_timeout_secs(),
        }
    }
}
