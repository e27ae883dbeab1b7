use std::net::IpAddr;

use cybermon_engine::NetworkInfo;
use mlua::{IntoLuaMulti, Lua, MultiValue, Value};

use crate::context::{ContextHandle, ContextTable, EventContext};
use crate::error::ContextMisuseError;

/// Signature of a function callable from scripts
pub type NativeFn = fn(&Lua, MultiValue) -> mlua::Result<MultiValue>;

/// A named entry in a native function table
#[derive(Clone, Copy)]
pub struct NativeFunction {
    pub name: &'static str,
    pub func: NativeFn,
}

impl NativeFunction {
    pub const fn new(name: &'static str, func: NativeFn) -> Self {
        Self { name, func }
    }
}

impl std::fmt::Debug for NativeFunction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NativeFunction")
            .field("name", &self.name)
            .finish()
    }
}

/// Functions scripts use to ask the engine about the context they were given
pub const NATIVE_FUNCTIONS: &[NativeFunction] = &[
    NativeFunction::new("describe_src", describe_src),
    NativeFunction::new("describe_dest", describe_dest),
    NativeFunction::new("get_liid", get_liid),
    NativeFunction::new("get_context_id", get_context_id),
    NativeFunction::new("get_network_info", get_network_info),
    NativeFunction::new("get_trigger_info", get_trigger_info),
];

/// Address that caused the engine to start processing a context
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TriggerInfo {
    pub address: Option<IpAddr>,
}

impl TriggerInfo {
    fn of(ctx: &EventContext) -> Self {
        Self {
            address: ctx.trigger(),
        }
    }

    /// `address, family`, both nil when nothing triggered the context
    fn into_lua_values(self, lua: &Lua) -> mlua::Result<MultiValue> {
        let family = self.address.map(|ip| match ip {
            IpAddr::V4(_) => "ipv4",
            IpAddr::V6(_) => "ipv6",
        });
        (self.address.map(|ip| ip.to_string()), family).into_lua_multi(lua)
    }
}

/// `src, dest, protocol`
fn network_values(info: NetworkInfo, lua: &Lua) -> mlua::Result<MultiValue> {
    (
        info.src.ip().to_string(),
        info.dest.ip().to_string(),
        info.protocol.to_string(),
    )
        .into_lua_multi(lua)
}

/// Resolve the handle in the first argument and run `f` against its context
fn with_context<F>(lua: &Lua, args: MultiValue, f: F) -> mlua::Result<MultiValue>
where
    F: FnOnce(&EventContext) -> mlua::Result<MultiValue>,
{
    let first = args.into_iter().next().unwrap_or(Value::Nil);
    let handle = ContextHandle::from_value(&first).map_err(mlua::Error::external)?;

    let table = lua
        .app_data_ref::<ContextTable>()
        .ok_or_else(|| mlua::Error::external(ContextMisuseError::Foreign))?;
    let ctx = table.resolve(&handle).map_err(mlua::Error::external)?;
    f(ctx)
}

fn describe_src(lua: &Lua, args: MultiValue) -> mlua::Result<MultiValue> {
    with_context(lua, args, |ctx| {
        ctx.engine()
            .describe_src(ctx.context().as_ref())
            .into_lua_multi(lua)
    })
}

fn describe_dest(lua: &Lua, args: MultiValue) -> mlua::Result<MultiValue> {
    with_context(lua, args, |ctx| {
        ctx.engine()
            .describe_dest(ctx.context().as_ref())
            .into_lua_multi(lua)
    })
}

fn get_liid(lua: &Lua, args: MultiValue) -> mlua::Result<MultiValue> {
    with_context(lua, args, |ctx| ctx.liid().into_lua_multi(lua))
}

fn get_context_id(lua: &Lua, args: MultiValue) -> mlua::Result<MultiValue> {
    with_context(lua, args, |ctx| {
        ctx.context().id().to_string().into_lua_multi(lua)
    })
}

fn get_network_info(lua: &Lua, args: MultiValue) -> mlua::Result<MultiValue> {
    with_context(lua, args, |ctx| {
        let info = ctx
            .engine()
            .network_info(ctx.context().as_ref())
            .map_err(mlua::Error::external)?;
        network_values(info, lua)
    })
}

fn get_trigger_info(lua: &Lua, args: MultiValue) -> mlua::Result<MultiValue> {
    with_context(lua, args, |ctx| TriggerInfo::of(ctx).into_lua_values(lua))
}
