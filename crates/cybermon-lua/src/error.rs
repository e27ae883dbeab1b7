use thiserror::Error;

/// The configuration module failed to compile or run. Fatal at startup.
#[derive(Debug, Error)]
#[error("Error running script: {message}")]
pub struct ScriptLoadError {
    /// Interpreter diagnostic
    pub message: String,
}

/// A script function raised an error while being called
#[derive(Debug, Error)]
#[error("script error in {origin}: {source}")]
pub struct ScriptCallError {
    /// What was being called, e.g. "handler 'data'"
    pub origin: String,
    #[source]
    pub source: mlua::Error,
}

/// A native function was given something other than a live context handle
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ContextMisuseError {
    #[error("expected a context handle, got {0}")]
    NotAHandle(&'static str),

    #[error("context handle was not issued by this runtime")]
    Foreign,

    #[error("stale context handle: the dispatch that issued it has returned")]
    Stale,
}

#[derive(Debug, Error)]
pub enum MarshallingError {
    #[error("payload of {len} bytes exceeds the {max} byte limit")]
    PayloadTooLarge { len: usize, max: usize },

    #[error("table of {len} entries exceeds the {max} entry limit")]
    TableTooLarge { len: usize, max: usize },

    #[error("stack underflow: needed {needed} values, stack holds {depth}")]
    StackUnderflow { needed: usize, depth: usize },

    #[error("invalid stack index {0}")]
    BadIndex(i32),

    #[error("value at stack index {index} is a {found}, not a table")]
    NotATable { index: i32, found: &'static str },

    #[error("interpreter error while marshalling: {0}")]
    Interpreter(#[from] mlua::Error),
}

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error(transparent)]
    Load(#[from] ScriptLoadError),

    #[error(transparent)]
    Call(#[from] ScriptCallError),

    #[error(transparent)]
    ContextMisuse(#[from] ContextMisuseError),

    #[error(transparent)]
    Marshalling(#[from] MarshallingError),

    #[error("native function '{0}' registered twice")]
    DuplicateNative(String),

    #[error("interpreter error: {0}")]
    Lua(#[from] mlua::Error),
}

impl BridgeError {
    /// Record which handler a call error came from
    pub(crate) fn in_handler(self, handler: &str) -> Self {
        match self {
            BridgeError::Call(mut e) => {
                e.origin = format!("handler '{}'", handler);
                BridgeError::Call(e)
            }
            other => other,
        }
    }
}

/// Find the `ContextMisuseError` behind a Lua error raised by a native function
pub fn misuse_of(err: &mlua::Error) -> Option<&ContextMisuseError> {
    match err {
        mlua::Error::CallbackError { cause, .. } => misuse_of(cause),
        mlua::Error::WithContext { cause, .. } => misuse_of(cause),
        mlua::Error::ExternalError(e) => e.downcast_ref::<ContextMisuseError>(),
        _ => None,
    }
}
