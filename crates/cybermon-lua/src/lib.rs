//! Lua event bridge for the cybermon analysis engine
//!
//! The engine reports connection and trigger events through
//! `CallbackDispatcher`, which calls the like-named function in the user's
//! Lua configuration script. Connection events hand the script an opaque
//! context handle; the script can pass it back to the native functions
//! registered under the `cybermon` namespace to ask about the connection.
//!
//! ```text
//! engine event
//!  └── CallbackDispatcher
//!       ├── EventContext (live for one call, behind a ContextHandle)
//!       ├── CallMarshaller (handle + event data onto the stack)
//!       └── ScriptRuntime (mlua)
//!            └── cybermon.* native functions -> Engine
//! ```

pub mod context;
pub mod dispatcher;
pub mod error;
pub mod marshal;
pub mod natives;
pub mod runtime;
pub mod shared;

pub use context::{ContextHandle, ContextScope, ContextTable, EventContext};
pub use dispatcher::{CallbackDispatcher, Dispatch, CONFIG_GLOBAL};
pub use error::{
    misuse_of, BridgeError, ContextMisuseError, MarshallingError, ScriptCallError,
    ScriptLoadError,
};
pub use marshal::{CallMarshaller, MarshalLimits, ResultCount};
pub use natives::{NativeFn, NativeFunction, TriggerInfo, NATIVE_FUNCTIONS};
pub use runtime::ScriptRuntime;
pub use shared::SharedDispatcher;
