use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::Arc;

use cybermon_config::{ErrorPolicy, ScriptingConfig};
use cybermon_engine::{ContextRef, Engine};
use mlua::Value;
use tracing::{debug, error};

use crate::context::EventContext;
use crate::error::BridgeError;
use crate::marshal::{CallMarshaller, MarshalLimits, ResultCount};
use crate::natives::NATIVE_FUNCTIONS;
use crate::runtime::ScriptRuntime;

/// Global the configuration module's returned table is bound to
pub const CONFIG_GLOBAL: &str = "config";

/// Outcome of a single dispatch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// The handler ran to completion
    Handled,
    /// The script does not define this handler
    NoHandler,
    /// The handler (or marshalling its arguments) failed and the error was logged
    Failed,
}

/// Calls script handlers for engine events
///
/// Each connection-level event gets a fresh `EventContext` which is only
/// reachable through its handle while the handler runs. Trigger events are
/// called with plain arguments.
pub struct CallbackDispatcher {
    runtime: ScriptRuntime,
    policy: ErrorPolicy,
}

impl CallbackDispatcher {
    pub fn new(runtime: ScriptRuntime, policy: ErrorPolicy) -> Self {
        Self { runtime, policy }
    }

    /// Create a runtime, register the native functions and load the
    /// configured script
    pub fn from_config(config: &ScriptingConfig) -> Result<Self, BridgeError> {
        Self::bootstrap(config, |runtime| runtime.load_module(&config.script))
    }

    /// Same as `from_config` but with the script given as source text
    pub fn from_source(
        config: &ScriptingConfig,
        name: &str,
        source: &str,
    ) -> Result<Self, BridgeError> {
        Self::bootstrap(config, |runtime| runtime.load_source(name, source))
    }

    fn bootstrap<F>(config: &ScriptingConfig, load: F) -> Result<Self, BridgeError>
    where
        F: FnOnce(&mut ScriptRuntime) -> Result<usize, crate::error::ScriptLoadError>,
    {
        let mut runtime = ScriptRuntime::new(MarshalLimits::from(config));
        runtime.register_native_functions(&config.namespace, NATIVE_FUNCTIONS)?;

        let returned = load(&mut runtime)?;
        bind_module_result(runtime.marshaller(), returned)?;

        Ok(Self::new(runtime, config.error_policy))
    }

    pub fn runtime(&self) -> &ScriptRuntime {
        &self.runtime
    }

    pub fn runtime_mut(&mut self) -> &mut ScriptRuntime {
        &mut self.runtime
    }

    pub fn policy(&self) -> ErrorPolicy {
        self.policy
    }

    /// Calls `trigger_up(liid, address)`
    pub fn trigger_up(&mut self, liid: &str, address: IpAddr) -> Result<Dispatch, BridgeError> {
        self.dispatch("trigger_up", None, |m| {
            m.push_str(liid)?;
            m.push_str(&address.to_string())?;
            Ok(2)
        })
    }

    /// Calls `trigger_down(liid)`
    pub fn trigger_down(&mut self, liid: &str) -> Result<Dispatch, BridgeError> {
        self.dispatch("trigger_down", None, |m| {
            m.push_str(liid)?;
            Ok(1)
        })
    }

    /// Calls `connection_up(ctx)`
    pub fn connection_up<E: Engine + 'static>(
        &mut self,
        engine: &Arc<E>,
        conn: &ContextRef,
    ) -> Result<Dispatch, BridgeError> {
        self.dispatch("connection_up", Some((erase(engine), conn)), |_| Ok(0))
    }

    /// Calls `connection_down(ctx)`
    pub fn connection_down<E: Engine + 'static>(
        &mut self,
        engine: &Arc<E>,
        conn: &ContextRef,
    ) -> Result<Dispatch, BridgeError> {
        self.dispatch("connection_down", Some((erase(engine), conn)), |_| Ok(0))
    }

    /// Calls `data(ctx, payload)` for stream data
    pub fn connection_data<E: Engine + 'static>(
        &mut self,
        engine: &Arc<E>,
        conn: &ContextRef,
        payload: &[u8],
    ) -> Result<Dispatch, BridgeError> {
        self.dispatch("data", Some((erase(engine), conn)), |m| {
            m.push_bytes(payload)?;
            Ok(1)
        })
    }

    /// Calls `datagram(ctx, payload)`
    pub fn datagram<E: Engine + 'static>(
        &mut self,
        engine: &Arc<E>,
        conn: &ContextRef,
        payload: &[u8],
    ) -> Result<Dispatch, BridgeError> {
        self.dispatch("datagram", Some((erase(engine), conn)), |m| {
            m.push_bytes(payload)?;
            Ok(1)
        })
    }

    /// Calls `http_request(ctx, method, url, headers, body)`
    pub fn http_request<E: Engine + 'static>(
        &mut self,
        engine: &Arc<E>,
        conn: &ContextRef,
        method: &str,
        url: &str,
        headers: &BTreeMap<String, String>,
        body: &[u8],
    ) -> Result<Dispatch, BridgeError> {
        self.dispatch("http_request", Some((erase(engine), conn)), |m| {
            m.push_str(method)?;
            m.push_str(url)?;
            m.push_headers(headers)?;
            m.push_bytes(body)?;
            Ok(4)
        })
    }

    /// Calls `http_response(ctx, code, status, headers, body)`
    pub fn http_response<E: Engine + 'static>(
        &mut self,
        engine: &Arc<E>,
        conn: &ContextRef,
        code: u32,
        status: &str,
        headers: &BTreeMap<String, String>,
        body: &[u8],
    ) -> Result<Dispatch, BridgeError> {
        self.dispatch("http_response", Some((erase(engine), conn)), |m| {
            m.push_integer(i64::from(code));
            m.push_str(status)?;
            m.push_headers(headers)?;
            m.push_bytes(body)?;
            Ok(4)
        })
    }

    /// Run one handler, leaving the stack and context table as they were
    fn dispatch<F>(
        &mut self,
        handler: &str,
        context: Option<(Arc<dyn Engine>, &ContextRef)>,
        push_args: F,
    ) -> Result<Dispatch, BridgeError>
    where
        F: FnOnce(&mut CallMarshaller) -> Result<usize, BridgeError>,
    {
        let base = self.runtime.marshaller().depth();
        let result = self.invoke(handler, context, push_args);
        self.runtime.marshaller().truncate(base);
        self.settle(handler, result)
    }

    fn invoke<F>(
        &mut self,
        handler: &str,
        context: Option<(Arc<dyn Engine>, &ContextRef)>,
        push_args: F,
    ) -> Result<Dispatch, BridgeError>
    where
        F: FnOnce(&mut CallMarshaller) -> Result<usize, BridgeError>,
    {
        if !self.push_handler(handler)? {
            debug!(target: "bridge", "No handler for {}, skipping", handler);
            return Ok(Dispatch::NoHandler);
        }

        // The scope must outlive the call; dropping it invalidates the handle
        let scope = match context {
            Some((engine, conn)) => Some(
                self.runtime
                    .enter_context(EventContext::new(engine, Arc::clone(conn)))?,
            ),
            None => None,
        };

        let m = self.runtime.marshaller();
        let mut argc = 0;
        if let Some(scope) = &scope {
            m.push_opaque_handle(scope.handle())?;
            argc += 1;
        }
        argc += push_args(&mut *m)?;

        debug!(target: "bridge", "Calling {} with {} argument(s)", handler, argc);
        m.call(argc, ResultCount::Fixed(0))
            .map_err(|e| e.in_handler(handler))?;

        drop(scope);
        Ok(Dispatch::Handled)
    }

    /// Push the handler named `name`, preferring `config.<name>` over a
    /// global function. Returns false (with nothing pushed) if neither exists.
    fn push_handler(&mut self, name: &str) -> Result<bool, BridgeError> {
        let m = self.runtime.marshaller();

        m.get_global(CONFIG_GLOBAL)?;
        if matches!(m.peek(-1)?, Value::Table(_)) {
            m.get_field(-1, name)?;
            m.remove(-2)?;
            if !m.is_nil(-1)? {
                return Ok(true);
            }
        }
        m.pop(1)?;

        m.get_global(name)?;
        if m.is_nil(-1)? {
            m.pop(1)?;
            return Ok(false);
        }
        Ok(true)
    }

    fn settle(
        &self,
        handler: &str,
        result: Result<Dispatch, BridgeError>,
    ) -> Result<Dispatch, BridgeError> {
        match result {
            Err(e @ (BridgeError::Call(_) | BridgeError::Marshalling(_)))
                if self.policy == ErrorPolicy::Log =>
            {
                error!(target: "bridge", "Dispatch of {} failed: {}", handler, e);
                Ok(Dispatch::Failed)
            }
            other => other,
        }
    }
}

fn erase<E: Engine + 'static>(engine: &Arc<E>) -> Arc<dyn Engine> {
    engine.clone()
}

/// Keep the module's first return value as `config` if it is a table and
/// discard the rest
fn bind_module_result(m: &mut CallMarshaller, returned: usize) -> Result<(), BridgeError> {
    if returned == 0 {
        return Ok(());
    }
    m.pop(returned - 1)?;
    if matches!(m.peek(-1)?, Value::Table(_)) {
        m.set_global(CONFIG_GLOBAL)?;
        debug!(target: "bridge", "Module returned a table, bound as '{}'", CONFIG_GLOBAL);
    } else {
        m.pop(1)?;
    }
    Ok(())
}
