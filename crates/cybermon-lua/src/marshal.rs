use std::collections::BTreeMap;

use cybermon_config::scripting_config::{
    ScriptingConfig, DEFAULT_MAX_PAYLOAD_BYTES, DEFAULT_MAX_TABLE_ENTRIES,
};
use mlua::{Lua, MultiValue, ObjectLike, Value};

use crate::context::ContextHandle;
use crate::error::{BridgeError, MarshallingError, ScriptCallError};

/// Upper bounds on what a single push may copy into the interpreter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MarshalLimits {
    pub max_payload_bytes: usize,
    pub max_table_entries: usize,
}

impl Default for MarshalLimits {
    fn default() -> Self {
        Self {
            max_payload_bytes: DEFAULT_MAX_PAYLOAD_BYTES,
            max_table_entries: DEFAULT_MAX_TABLE_ENTRIES,
        }
    }
}

impl From<&ScriptingConfig> for MarshalLimits {
    fn from(config: &ScriptingConfig) -> Self {
        Self {
            max_payload_bytes: config.max_payload_bytes,
            max_table_entries: config.max_table_entries,
        }
    }
}

/// How many results `call` leaves on the stack
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultCount {
    /// Exactly this many, padded with nil or truncated
    Fixed(usize),
    /// Everything the function returned
    All,
}

/// Evaluation stack shared between the host and the interpreter
///
/// Every operation works on an explicit stack of Lua values, the same way
/// the C API does. Indices follow Lua conventions: `1` is the bottom of the
/// stack and `-1` the top. Keeping the stack balanced is the caller's job;
/// `depth` and `truncate` let a caller restore it after an error.
pub struct CallMarshaller {
    lua: Lua,
    stack: Vec<Value>,
    limits: MarshalLimits,
}

impl CallMarshaller {
    pub(crate) fn new(lua: Lua, limits: MarshalLimits) -> Self {
        Self {
            lua,
            stack: Vec::new(),
            limits,
        }
    }

    pub fn limits(&self) -> MarshalLimits {
        self.limits
    }

    /// Number of values on the stack
    pub fn depth(&self) -> usize {
        self.stack.len()
    }

    /// Drop everything above `depth`
    pub fn truncate(&mut self, depth: usize) {
        self.stack.truncate(depth);
    }

    pub fn push_value(&mut self, value: Value) {
        self.stack.push(value);
    }

    pub fn push_nil(&mut self) {
        self.stack.push(Value::Nil);
    }

    pub fn push_integer(&mut self, n: i64) {
        self.stack.push(Value::Integer(n));
    }

    pub fn push_str(&mut self, s: &str) -> Result<(), MarshallingError> {
        let s = self.lua.create_string(s)?;
        self.stack.push(Value::String(s));
        Ok(())
    }

    /// Push a byte range as a Lua string. The bytes are copied into the
    /// interpreter's heap; ranges over the payload limit are refused.
    pub fn push_bytes(&mut self, bytes: &[u8]) -> Result<(), MarshallingError> {
        if bytes.len() > self.limits.max_payload_bytes {
            return Err(MarshallingError::PayloadTooLarge {
                len: bytes.len(),
                max: self.limits.max_payload_bytes,
            });
        }
        let s = self.lua.create_string(bytes)?;
        self.stack.push(Value::String(s));
        Ok(())
    }

    /// Push a key -> value table built from `headers`
    pub fn push_headers(&mut self, headers: &BTreeMap<String, String>) -> Result<(), MarshallingError> {
        if headers.len() > self.limits.max_table_entries {
            return Err(MarshallingError::TableTooLarge {
                len: headers.len(),
                max: self.limits.max_table_entries,
            });
        }
        let table = self.lua.create_table()?;
        for (key, value) in headers {
            table.raw_set(key.as_str(), value.as_str())?;
        }
        self.stack.push(Value::Table(table));
        Ok(())
    }

    /// Push a context handle. Scripts see an opaque userdata with no fields
    /// or methods; it is only good for passing back to native functions.
    pub fn push_opaque_handle(&mut self, handle: ContextHandle) -> Result<(), MarshallingError> {
        let ud = self.lua.create_userdata(handle)?;
        self.stack.push(Value::UserData(ud));
        Ok(())
    }

    /// Discard the top `n` values
    pub fn pop(&mut self, n: usize) -> Result<(), MarshallingError> {
        let depth = self.stack.len();
        if n > depth {
            return Err(MarshallingError::StackUnderflow { needed: n, depth });
        }
        self.stack.truncate(depth - n);
        Ok(())
    }

    pub fn peek(&self, index: i32) -> Result<&Value, MarshallingError> {
        let pos = self.absolute(index)?;
        Ok(&self.stack[pos])
    }

    pub fn is_nil(&self, index: i32) -> Result<bool, MarshallingError> {
        Ok(self.peek(index)?.is_nil())
    }

    /// Remove the value at `index`, shifting the ones above it down
    pub fn remove(&mut self, index: i32) -> Result<Value, MarshallingError> {
        let pos = self.absolute(index)?;
        Ok(self.stack.remove(pos))
    }

    /// Push the value of global `name`
    pub fn get_global(&mut self, name: &str) -> Result<(), MarshallingError> {
        let value: Value = self.lua.globals().get(name)?;
        self.stack.push(value);
        Ok(())
    }

    /// Pop the top value and store it as global `name`
    pub fn set_global(&mut self, name: &str) -> Result<(), MarshallingError> {
        let value = self.stack.pop().ok_or(MarshallingError::StackUnderflow {
            needed: 1,
            depth: 0,
        })?;
        self.lua.globals().set(name, value)?;
        Ok(())
    }

    /// Push `t[name]` where `t` is the table at `index`
    pub fn get_field(&mut self, index: i32, name: &str) -> Result<(), MarshallingError> {
        let value = match self.peek(index)? {
            Value::Table(table) => table.get::<Value>(name)?,
            other => {
                return Err(MarshallingError::NotATable {
                    index,
                    found: other.type_name(),
                })
            }
        };
        self.stack.push(value);
        Ok(())
    }

    /// Call the value beneath the top `argc` values with those values as
    /// arguments. The function and its arguments are popped and replaced
    /// by the results.
    pub fn call(&mut self, argc: usize, results: ResultCount) -> Result<(), BridgeError> {
        let depth = self.stack.len();
        if depth < argc + 1 {
            return Err(MarshallingError::StackUnderflow {
                needed: argc + 1,
                depth,
            }
            .into());
        }

        let args: MultiValue = self.stack.split_off(depth - argc).into_iter().collect();
        let callee = self.stack.pop().unwrap_or(Value::Nil);

        let returned = match callee {
            Value::Function(f) => f.call::<MultiValue>(args),
            // Tables with a __call metamethod
            Value::Table(t) => t.call::<MultiValue>(args),
            other => Err(mlua::Error::RuntimeError(format!(
                "attempt to call a {} value",
                other.type_name()
            ))),
        }
        .map_err(|source| ScriptCallError {
            origin: "call".to_string(),
            source,
        })?;

        let mut returned: Vec<Value> = returned.into_iter().collect();
        if let ResultCount::Fixed(n) = results {
            returned.resize(n, Value::Nil);
        }
        self.stack.extend(returned);
        Ok(())
    }

    /// Take the top value off the stack
    pub fn pop_value(&mut self) -> Result<Value, MarshallingError> {
        self.stack
            .pop()
            .ok_or(MarshallingError::StackUnderflow { needed: 1, depth: 0 })
    }

    fn absolute(&self, index: i32) -> Result<usize, MarshallingError> {
        let depth = self.stack.len();
        let pos = match index {
            0 => return Err(MarshallingError::BadIndex(index)),
            i if i > 0 => (i as usize) - 1,
            i => {
                let back = i.unsigned_abs() as usize;
                if back > depth {
                    return Err(MarshallingError::BadIndex(index));
                }
                depth - back
            }
        };
        if pos >= depth {
            return Err(MarshallingError::BadIndex(index));
        }
        Ok(pos)
    }
}
