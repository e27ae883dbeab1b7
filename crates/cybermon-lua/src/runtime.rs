use std::collections::HashSet;
use std::fs;
use std::path::Path;

use mlua::{Function, Lua, LuaOptions, MultiValue, StdLib, Table, Value};
use tracing::{debug, info};

use crate::context::{ContextScope, ContextTable, EventContext};
use crate::error::{BridgeError, ScriptLoadError};
use crate::marshal::{CallMarshaller, MarshalLimits};
use crate::natives::NativeFunction;

/// One embedded Lua interpreter and its evaluation stack
///
/// Created when the configuration is loaded and dropped at shutdown;
/// dropping it discards all script state and native bindings. Not safe for
/// concurrent use; see `SharedDispatcher` for the locking wrapper.
pub struct ScriptRuntime {
    lua: Lua,
    marshaller: CallMarshaller,
}

impl ScriptRuntime {
    pub fn new(limits: MarshalLimits) -> Self {
        // SAFETY: configuration scripts are trusted. The full standard
        // library, `debug` included, is available to them.
        let lua = unsafe { Lua::unsafe_new_with(StdLib::ALL, LuaOptions::default()) };
        lua.set_app_data(ContextTable::new());
        let marshaller = CallMarshaller::new(lua.clone(), limits);
        Self { lua, marshaller }
    }

    /// The underlying interpreter
    pub fn lua(&self) -> &Lua {
        &self.lua
    }

    pub fn marshaller(&mut self) -> &mut CallMarshaller {
        &mut self.marshaller
    }

    /// Compile and run the module at `path`.
    ///
    /// Whatever the module returns is left on the stack; the return value is
    /// how many values that was.
    pub fn load_module(&mut self, path: &Path) -> Result<usize, ScriptLoadError> {
        debug!(target: "bridge", "Loading module {}", path.display());

        // Lua source is bytes; string literals need not be UTF-8
        let source = fs::read(path).map_err(|e| ScriptLoadError {
            message: format!("cannot open {}: {}", path.display(), e),
        })?;
        let count = self.run_chunk(&format!("@{}", path.display()), &source)?;

        info!(target: "bridge", "Loaded module {}", path.display());
        Ok(count)
    }

    /// Compile and run a chunk of Lua source. Same stack behaviour as
    /// `load_module`.
    pub fn load_source(&mut self, name: &str, source: &str) -> Result<usize, ScriptLoadError> {
        self.run_chunk(name, source.as_bytes())
    }

    fn run_chunk(&mut self, name: &str, source: &[u8]) -> Result<usize, ScriptLoadError> {
        let returned = self
            .lua
            .load(source)
            .set_name(name)
            .eval::<MultiValue>()
            .map_err(|e| ScriptLoadError {
                message: e.to_string(),
            })?;

        let count = returned.len();
        for value in returned {
            self.marshaller.push_value(value);
        }
        Ok(count)
    }

    /// Bind `table` as a Lua table of functions under the global `namespace`.
    ///
    /// Names must be unique so that scripts see exactly the entries given.
    /// The bound table is a read-only view: assigning to it raises an error,
    /// `pairs` walks the registered entries.
    pub fn register_native_functions(
        &mut self,
        namespace: &str,
        table: &[NativeFunction],
    ) -> Result<(), BridgeError> {
        let mut seen = HashSet::with_capacity(table.len());
        for entry in table {
            if !seen.insert(entry.name) {
                return Err(BridgeError::DuplicateNative(entry.name.to_string()));
            }
        }

        let entries = self.lua.create_table()?;
        for entry in table {
            let func = entry.func;
            let function = self
                .lua
                .create_function(move |lua: &Lua, args: MultiValue| func(lua, args))?;
            entries.raw_set(entry.name, function)?;
        }
        let view = self.read_only_view(namespace, entries)?;
        self.lua.globals().set(namespace, view)?;

        debug!(
            target: "bridge",
            "Registered {} native function(s) under '{}'",
            table.len(),
            namespace
        );
        Ok(())
    }

    /// An empty table that reads through to `entries` and refuses writes
    fn read_only_view(&self, namespace: &str, entries: Table) -> mlua::Result<Table> {
        let next: Function = self.lua.globals().get("next")?;
        let walked = entries.clone();
        let pairs = self
            .lua
            .create_function(move |_, _: Value| Ok((next.clone(), walked.clone(), Value::Nil)))?;

        let name = namespace.to_string();
        let refuse_write = self.lua.create_function(move |_, _: MultiValue| -> mlua::Result<()> {
            Err(mlua::Error::RuntimeError(format!(
                "native function table '{}' is read-only",
                name
            )))
        })?;

        let metatable = self.lua.create_table()?;
        metatable.set("__index", entries)?;
        metatable.set("__newindex", refuse_write)?;
        metatable.set("__pairs", pairs)?;
        metatable.set("__metatable", false)?;

        let view = self.lua.create_table()?;
        view.set_metatable(Some(metatable));
        Ok(view)
    }

    /// Make `context` live for the duration of the returned scope
    pub(crate) fn enter_context(&self, context: EventContext) -> Result<ContextScope, BridgeError> {
        let handle = self
            .lua
            .app_data_mut::<ContextTable>()
            .ok_or_else(|| mlua::Error::RuntimeError("context table not installed".to_string()))?
            .insert(context);
        Ok(ContextScope::new(self.lua.clone(), handle))
    }

    /// Number of contexts currently reachable through a handle
    pub fn live_contexts(&self) -> usize {
        self.lua
            .app_data_ref::<ContextTable>()
            .map(|table| table.live())
            .unwrap_or(0)
    }
}

impl Default for ScriptRuntime {
    fn default() -> Self {
        Self::new(MarshalLimits::default())
    }
}
