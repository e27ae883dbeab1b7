//! Engine-side interfaces used by the Lua bridge
//!
//! The analysis engine owns connection state. The bridge only ever sees it
//! through the `Engine` and `Context` traits defined here. `MemoryEngine` is
//! a small in-process implementation used by the replay tool and by tests.

pub mod context;
pub mod engine;
pub mod error;
pub mod memory;

pub use context::{ancestry, Context, ContextId, ContextRef};
pub use engine::{Engine, NetworkInfo, Protocol, RootInfo};
pub use error::EngineError;
pub use memory::{FlowContext, Layer, MemoryEngine, Transport};
