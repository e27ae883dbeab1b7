use std::{
    fs,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::{logging_config::LoggingConfig, scripting_config::ScriptingConfig};

#[derive(Debug)]
pub enum ConfigLoadError {
    NotFound(PathBuf),
    ParseError(String),
    IoError(String),
}

impl std::fmt::Display for ConfigLoadError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigLoadError::NotFound(path) => {
                write!(f, "Config file not found: {}", path.display())
            }
            ConfigLoadError::ParseError(msg) => write!(f, "Failed to parse config: {}", msg),
            ConfigLoadError::IoError(msg) => write!(f, "IO error reading config: {}", msg),
        }
    }
}

impl std::error::Error for ConfigLoadError {}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CybermonConfig {
    /// Script loading and marshalling limits
    pub scripting: ScriptingConfig,

    /// Console and file logging
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl CybermonConfig {
    /// Load a config file. A relative `scripting.script` or `logging.dir`
    /// is resolved against the directory containing the config file.
    pub fn load(path: &Path) -> Result<Self, ConfigLoadError> {
        if !path.exists() {
            return Err(ConfigLoadError::NotFound(path.to_path_buf()));
        }

        let content =
            fs::read_to_string(path).map_err(|e| ConfigLoadError::IoError(e.to_string()))?;
        let mut config = Self::from_toml_str(&content)?;

        if let Some(base) = path.parent() {
            config.resolve_relative_to(base);
        }

        info!("Loaded config from {}", path.display());
        Ok(config)
    }

    /// Parse config text without touching the filesystem
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigLoadError> {
        toml::from_str(content).map_err(|e| ConfigLoadError::ParseError(e.to_string()))
    }

    pub fn save(&self, path: &Path) -> Result<(), Box<dyn std::error::Error>> {
        // Create parent directories if they don't exist
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(&self)?;
        fs::write(path, content)?;
        info!("Saved config to {}", path.display());
        Ok(())
    }

    fn resolve_relative_to(&mut self, base: &Path) {
        if self.scripting.script.is_relative() {
            self.scripting.script = base.join(&self.scripting.script);
        }
        if self.logging.dir.is_relative() {
            self.logging.dir = base.join(&self.logging.dir);
        }
    }
}
