//! Engine settings on disk (pretty-printed JSON)

use crate::error::FetchError;
use hfetch_types::EngineConfig;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Default location of the settings file, next to the default store
pub fn default_config_path() -> PathBuf {
    EngineConfig::default()
        .data_dir
        .unwrap_or_else(|| PathBuf::from(".hfetch"))
        .join("config.json")
}

/// Load settings from `path`; a missing file yields the defaults
pub fn load_config(path: &Path) -> Result<EngineConfig, FetchError> {
    if !path.exists() {
        debug!("No config at {}, using defaults", path.display());
        return Ok(EngineConfig::default());
    }

    let content = fs::read_to_string(path)?;
    serde_json::from_str(&content).map_err(|e| FetchError::Serialization(e.to_string()))
}

/// Save settings to `path`, creating parent directories
pub fn save_config(path: &Path, config: &EngineConfig) -> Result<(), FetchError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let content = serde_json::to_string_pretty(config)
        .map_err(|e| FetchError::Serialization(e.to_string()))?;
    fs::write(path, content)?;

    Ok(())
}
