//! Global configuration loader for Pipewright.
//!
//! Reads `config.toml` from the data directory (`~/.pipewright/` in production)
//! and deserializes it into [`GlobalConfig`]. Falls back to sensible defaults
//! when the file is missing or malformed.

use std::path::Path;

use pipewright_types::config::{EngineConfig, GlobalConfig};

use crate::sqlite::pool::default_database_url;

/// Load global configuration from `{data_dir}/config.toml`.
///
/// - If the file does not exist, returns [`GlobalConfig::default()`].
/// - If the file exists but fails to parse, logs a warning and returns the default.
/// - If the file exists and parses successfully, returns the parsed config.
pub async fn load_global_config(data_dir: &Path) -> GlobalConfig {
    let config_path = data_dir.join("config.toml");

    let content = match tokio::fs::read_to_string(&config_path).await {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!("No config.toml found at {}, using defaults", config_path.display());
            return GlobalConfig::default();
        }
        Err(err) => {
            tracing::warn!("Failed to read {}: {err}, using defaults", config_path.display());
            return GlobalConfig::default();
        }
    };

    match toml::from_str::<GlobalConfig>(&content) {
        Ok(mut config) => {
            sanitize_engine_config(&mut config.engine);
            config
        }
        Err(err) => {
            tracing::warn!(
                "Failed to parse {}: {err}, using defaults",
                config_path.display()
            );
            GlobalConfig::default()
        }
    }
}

/// Replace zero engine limits with their defaults.
///
/// A zero default timeout would fail every step without its own timeout
/// immediately; a zero concurrency limit would admit no steps.
fn sanitize_engine_config(engine: &mut EngineConfig) {
    let defaults = EngineConfig::default();
    if engine.default_step_timeout_secs == 0 {
        tracing::warn!(
            fallback = defaults.default_step_timeout_secs,
            "engine.default_step_timeout_secs must be > 0, using default"
        );
        engine.default_step_timeout_secs = defaults.default_step_timeout_secs;
    }
    if engine.max_concurrent == 0 {
        tracing::warn!(
            fallback = defaults.max_concurrent,
            "engine.max_concurrent must be > 0, using default"
        );
        engine.max_concurrent = defaults.max_concurrent;
    }
}

/// Resolve the run-state database URL.
///
/// Priority:
/// 1. `database_url` from `config.toml`
/// 2. `PIPEWRIGHT_DATA_DIR`, else `~/.pipewright/pipewright.db`
pub fn resolve_database_url(global_config: &GlobalConfig) -> String {
    match global_config.database_url.as_deref() {
        Some(url) if !url.trim().is_empty() => url.to_string(),
        _ => default_database_url(),
    }
}
