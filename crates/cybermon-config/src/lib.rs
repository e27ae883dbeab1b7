pub mod cybermon_config;
pub mod logging_config;
pub mod scripting_config;

pub use cybermon_config::{ConfigLoadError, CybermonConfig};
pub use logging_config::LoggingConfig;
pub use scripting_config::{ErrorPolicy, ScriptingConfig};
