use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use cybermon_engine::{ContextRef, Engine};
use mlua::{Lua, UserData, Value};
use tracing::warn;

use crate::error::ContextMisuseError;

static NEXT_TABLE_ID: AtomicU64 = AtomicU64::new(1);

/// Engine state for a single dispatch
///
/// Built right before a script handler is called and released as soon as
/// it returns. Scripts only ever see it through a `ContextHandle`.
pub struct EventContext {
    engine: Arc<dyn Engine>,
    context: ContextRef,
    liid: String,
    trigger: Option<IpAddr>,
}

impl EventContext {
    /// Capture `context` together with its root info from `engine`
    pub fn new(engine: Arc<dyn Engine>, context: ContextRef) -> Self {
        let root = engine.root_info(context.as_ref());
        Self {
            engine,
            context,
            liid: root.liid,
            trigger: root.trigger,
        }
    }

    pub fn engine(&self) -> &dyn Engine {
        self.engine.as_ref()
    }

    pub fn context(&self) -> &ContextRef {
        &self.context
    }

    pub fn liid(&self) -> &str {
        &self.liid
    }

    pub fn trigger(&self) -> Option<IpAddr> {
        self.trigger
    }
}

/// Opaque reference to a live `EventContext`
///
/// Only valid while the dispatch that issued it is running. The generation
/// changes every time a slot is reused, so an old handle can never resolve
/// to a newer context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContextHandle {
    table: u64,
    slot: u32,
    generation: u64,
}

// No fields, no methods: scripts can hold the value and pass it back, nothing more
impl UserData for ContextHandle {}

impl ContextHandle {
    /// Read a handle out of a script value
    pub fn from_value(value: &Value) -> Result<Self, ContextMisuseError> {
        match value {
            Value::UserData(ud) => ud
                .borrow::<ContextHandle>()
                .map(|handle| *handle)
                .map_err(|_| ContextMisuseError::NotAHandle("userdata")),
            other => Err(ContextMisuseError::NotAHandle(other.type_name())),
        }
    }
}

struct Slot {
    generation: u64,
    context: Option<EventContext>,
}

/// Contexts that are live in the current dispatch, indexed by handle
///
/// Stored as app data on the runtime's `Lua` so native functions can reach
/// it from inside a call.
pub struct ContextTable {
    id: u64,
    slots: Vec<Slot>,
    next_generation: u64,
}

impl ContextTable {
    pub fn new() -> Self {
        Self {
            id: NEXT_TABLE_ID.fetch_add(1, Ordering::Relaxed),
            slots: Vec::new(),
            next_generation: 1,
        }
    }

    /// Make `context` live and return the handle that refers to it
    pub fn insert(&mut self, context: EventContext) -> ContextHandle {
        let generation = self.next_generation;
        self.next_generation += 1;

        let slot = match self.slots.iter().position(|s| s.context.is_none()) {
            Some(free) => free,
            None => {
                self.slots.push(Slot {
                    generation: 0,
                    context: None,
                });
                self.slots.len() - 1
            }
        };

        self.slots[slot] = Slot {
            generation,
            context: Some(context),
        };

        ContextHandle {
            table: self.id,
            slot: slot as u32,
            generation,
        }
    }

    pub fn resolve(&self, handle: &ContextHandle) -> Result<&EventContext, ContextMisuseError> {
        if handle.table != self.id {
            return Err(ContextMisuseError::Foreign);
        }
        let slot = self
            .slots
            .get(handle.slot as usize)
            .ok_or(ContextMisuseError::Foreign)?;
        match &slot.context {
            Some(context) if slot.generation == handle.generation => Ok(context),
            _ => Err(ContextMisuseError::Stale),
        }
    }

    /// End the lifetime of the context behind `handle`
    pub fn release(&mut self, handle: &ContextHandle) -> Option<EventContext> {
        if handle.table != self.id {
            return None;
        }
        let slot = self.slots.get_mut(handle.slot as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        slot.context.take()
    }

    /// Number of contexts currently live
    pub fn live(&self) -> usize {
        self.slots.iter().filter(|s| s.context.is_some()).count()
    }
}

impl Default for ContextTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Releases its context when dropped, including on early return or error
pub struct ContextScope {
    lua: Lua,
    handle: ContextHandle,
}

impl ContextScope {
    pub(crate) fn new(lua: Lua, handle: ContextHandle) -> Self {
        Self { lua, handle }
    }

    pub fn handle(&self) -> ContextHandle {
        self.handle
    }
}

impl Drop for ContextScope {
    fn drop(&mut self) {
        match self.lua.app_data_mut::<ContextTable>() {
            Some(mut table) => {
                table.release(&self.handle);
            }
            None => warn!(target: "bridge", "Context table missing while releasing {:?}", self.handle),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cybermon_engine::{MemoryEngine, Protocol};

    fn event_context(engine: &Arc<MemoryEngine>) -> EventContext {
        let flow = engine.open_flow(
            Protocol::Tcp,
            "10.0.0.1:443".parse().unwrap(),
            "10.0.0.2:5000".parse().unwrap(),
        );
        EventContext::new(engine.clone(), flow)
    }

    #[test]
    fn test_handle_resolves_while_live() {
        let engine = Arc::new(MemoryEngine::new());
        engine.add_target("10.0.0.1".parse().unwrap(), "LIID-1");

        let mut table = ContextTable::new();
        let handle = table.insert(event_context(&engine));

        let ctx = table.resolve(&handle).unwrap();
        assert_eq!(ctx.liid(), "LIID-1");
        assert_eq!(ctx.trigger(), Some("10.0.0.1".parse().unwrap()));
        assert_eq!(table.live(), 1);
    }

    #[test]
    fn test_released_handle_is_stale() {
        let engine = Arc::new(MemoryEngine::new());
        let mut table = ContextTable::new();
        let handle = table.insert(event_context(&engine));

        assert!(table.release(&handle).is_some());
        assert_eq!(table.resolve(&handle).err(), Some(ContextMisuseError::Stale));
        assert_eq!(table.live(), 0);
    }

    #[test]
    fn test_reused_slot_does_not_revive_old_handle() {
        let engine = Arc::new(MemoryEngine::new());
        let mut table = ContextTable::new();

        let old = table.insert(event_context(&engine));
        table.release(&old);
        let new = table.insert(event_context(&engine));

        assert_eq!(old.slot, new.slot);
        assert_ne!(old.generation, new.generation);
        assert_eq!(table.resolve(&old).err(), Some(ContextMisuseError::Stale));
        assert!(table.resolve(&new).is_ok());

        // Releasing through the old handle must not end the new context
        assert!(table.release(&old).is_none());
        assert_eq!(table.live(), 1);
    }

    #[test]
    fn test_handle_from_other_table_is_foreign() {
        let engine = Arc::new(MemoryEngine::new());
        let mut first = ContextTable::new();
        let mut second = ContextTable::new();

        let handle = first.insert(event_context(&engine));
        second.insert(event_context(&engine));

        assert_eq!(second.resolve(&handle).err(), Some(ContextMisuseError::Foreign));
    }

    #[test]
    fn test_scope_releases_on_drop() {
        let engine = Arc::new(MemoryEngine::new());
        let lua = Lua::new();
        lua.set_app_data(ContextTable::new());

        let handle = lua
            .app_data_mut::<ContextTable>()
            .unwrap()
            .insert(event_context(&engine));
        {
            let _scope = ContextScope::new(lua.clone(), handle);
            assert_eq!(lua.app_data_ref::<ContextTable>().unwrap().live(), 1);
        }
        assert_eq!(lua.app_data_ref::<ContextTable>().unwrap().live(), 0);
    }

    #[test]
    fn test_non_userdata_is_not_a_handle() {
        assert_eq!(
            ContextHandle::from_value(&Value::Integer(3)),
            Err(ContextMisuseError::NotAHandle("integer"))
        );
        assert_eq!(
            ContextHandle::from_value(&Value::Nil),
            Err(ContextMisuseError::NotAHandle("nil"))
        );
    }
}
