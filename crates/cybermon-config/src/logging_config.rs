use serde::{Deserialize, Serialize};
use std::path::PathBuf;

const MAX_LOG_SIZE: u64 = 1024 * 1024; // 1MB

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive, overridden by RUST_LOG
    #[serde(default = "default_level")]
    pub level: String,

    /// Also write logs to `<dir>/<component>.log`
    #[serde(default)]
    pub file: bool,

    /// Directory for log files
    #[serde(default = "default_dir")]
    pub dir: PathBuf,

    /// Log files larger than this are truncated at startup
    #[serde(default = "default_max_file_bytes")]
    pub max_file_bytes: u64,
}

fn default_level() -> String {
    "info".to_string()
}

fn default_dir() -> PathBuf {
    PathBuf::from("logs")
}

fn default_max_file_bytes() -> u64 {
    MAX_LOG_SIZE
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
            file: false,
            dir: default_dir(),
            max_file_bytes: MAX_LOG_SIZE,
        }
    }
}
