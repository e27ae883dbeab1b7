use std::any::Any;
use std::fmt::Debug;
use std::sync::Arc;

/// Identifier the engine assigns to a context when it is created
pub type ContextId = u64;

/// Shared pointer to an engine-owned context
pub type ContextRef = Arc<dyn Context>;

/// A node in the engine's context tree (a flow, or a protocol layered on one)
pub trait Context: Send + Sync + Debug {
    /// Engine-assigned identifier, unique for the lifetime of the engine
    fn id(&self) -> ContextId;

    /// Short name of the layer this context represents, e.g. "tcp" or "http"
    fn kind(&self) -> &str;

    /// The context this one is layered on, if any
    fn parent(&self) -> Option<ContextRef>;

    /// Allow engines to downcast to their concrete context type
    fn as_any(&self) -> &dyn Any;
}

/// Iterate from `ctx` up through its parents
pub fn ancestry(ctx: &dyn Context) -> impl Iterator<Item = ContextRef> {
    std::iter::successors(ctx.parent(), |c| c.parent())
}
