use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Largest payload copied into the interpreter for a single event (16 MiB)
pub const DEFAULT_MAX_PAYLOAD_BYTES: usize = 16 * 1024 * 1024;

/// Largest header table built for a single HTTP event
pub const DEFAULT_MAX_TABLE_ENTRIES: usize = 1024;

/// Namespace the native functions are registered under
pub const DEFAULT_NAMESPACE: &str = "cybermon";

/// What to do when a script handler fails during a dispatch
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorPolicy {
    /// Log the error and carry on with the next event
    #[default]
    Log,
    /// Return the error to the engine
    Propagate,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScriptingConfig {
    /// Lua configuration module loaded at startup
    pub script: PathBuf,

    /// Global table the native functions are bound to (default: "cybermon")
    #[serde(default = "default_namespace")]
    pub namespace: String,

    /// Payloads longer than this are rejected instead of marshalled
    #[serde(default = "default_max_payload_bytes")]
    pub max_payload_bytes: usize,

    /// Header maps with more entries than this are rejected
    #[serde(default = "default_max_table_entries")]
    pub max_table_entries: usize,

    /// Handling of script errors raised during a dispatch
    #[serde(default)]
    pub error_policy: ErrorPolicy,

    /// Whether the script is reloaded on SIGUSR2 (default: true)
    #[serde(default = "default_hot_reload")]
    pub hot_reload: bool,
}

fn default_namespace() -> String {
    DEFAULT_NAMESPACE.to_string()
}

fn default_max_payload_bytes() -> usize {
    DEFAULT_MAX_PAYLOAD_BYTES
}

fn default_max_table_entries() -> usize {
    DEFAULT_MAX_TABLE_ENTRIES
}

fn default_hot_reload() -> bool {
    true
}

impl ScriptingConfig {
    /// Config for `script` with every other setting at its default
    pub fn new(script: impl Into<PathBuf>) -> Self {
        Self {
            script: script.into(),
            namespace: default_namespace(),
            max_payload_bytes: DEFAULT_MAX_PAYLOAD_BYTES,
            max_table_entries: DEFAULT_MAX_TABLE_ENTRIES,
            error_policy: ErrorPolicy::default(),
            hot_reload: true,
        }
    }
}
