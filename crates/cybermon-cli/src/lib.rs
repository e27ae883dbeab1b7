//! Replay tool for cybermon configuration scripts
//!
//! Feeds a JSON-lines trace of engine events through the Lua bridge, using
//! the in-memory engine for connection state.

pub mod logging;
pub mod reload;
pub mod trace;

pub use logging::init_logging;
pub use reload::{reload_script, setup_reload_signal, watch_reloads, ReloadSignal};
pub use trace::{Replay, ReplayError, ReplayStats, TraceEvent};
