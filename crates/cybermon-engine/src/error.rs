use crate::context::ContextId;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("context {0} has no transport layer")]
    NoTransport(ContextId),

    #[error("context {0} was not created by this engine")]
    ForeignContext(ContextId),
}
