use std::any::Any;
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use tracing::debug;

use crate::context::{ancestry, Context, ContextId, ContextRef};
use crate::engine::{Engine, NetworkInfo, Protocol, RootInfo};
use crate::error::EngineError;

/// Transport-level addressing, held by the root of a flow
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transport {
    pub protocol: Protocol,
    pub src: SocketAddr,
    pub dest: SocketAddr,
    pub root: RootInfo,
}

/// What a `FlowContext` represents
#[derive(Debug, Clone)]
pub enum Layer {
    /// A TCP or UDP flow
    Transport(Transport),
    /// An application protocol carried on its parent, e.g. "http"
    Application(String),
}

/// Context node created by `MemoryEngine`
#[derive(Debug)]
pub struct FlowContext {
    id: ContextId,
    layer: Layer,
    parent: Option<ContextRef>,
}

impl FlowContext {
    pub fn layer(&self) -> &Layer {
        &self.layer
    }

    fn transport(&self) -> Option<&Transport> {
        match &self.layer {
            Layer::Transport(t) => Some(t),
            Layer::Application(_) => None,
        }
    }
}

impl Context for FlowContext {
    fn id(&self) -> ContextId {
        self.id
    }

    fn kind(&self) -> &str {
        match &self.layer {
            Layer::Transport(t) => match t.protocol {
                Protocol::Tcp => "tcp",
                Protocol::Udp => "udp",
            },
            Layer::Application(name) => name,
        }
    }

    fn parent(&self) -> Option<ContextRef> {
        self.parent.clone()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

fn as_flow(ctx: &dyn Context) -> Option<&FlowContext> {
    ctx.as_any().downcast_ref::<FlowContext>()
}

/// Find the transport layer for `ctx`, looking at the context itself first
fn transport_of(ctx: &dyn Context) -> Option<Transport> {
    if let Some(t) = as_flow(ctx).and_then(FlowContext::transport) {
        return Some(t.clone());
    }
    ancestry(ctx).find_map(|c| as_flow(c.as_ref()).and_then(FlowContext::transport).cloned())
}

fn family(ip: &IpAddr) -> &'static str {
    match ip {
        IpAddr::V4(_) => "ipv4",
        IpAddr::V6(_) => "ipv6",
    }
}

/// In-process engine that tracks targets and hands out flow contexts
///
/// Targets map an address to the LIID it is monitored under. Flows opened
/// with `open_flow` pick up their LIID and trigger address from whichever
/// endpoint is a registered target.
pub struct MemoryEngine {
    next_id: AtomicU64,
    targets: RwLock<HashMap<IpAddr, String>>,
}

impl MemoryEngine {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            targets: RwLock::new(HashMap::new()),
        }
    }

    /// Start monitoring `address` under `liid`
    pub fn add_target(&self, address: IpAddr, liid: impl Into<String>) {
        let liid = liid.into();
        debug!(target: "engine", "Adding target {} ({})", address, liid);
        self.targets
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(address, liid);
    }

    /// Stop monitoring `address`, returning the LIID it was registered with
    pub fn remove_target(&self, address: IpAddr) -> Option<String> {
        self.targets
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&address)
    }

    /// LIID registered for `address`, if any
    pub fn liid_for(&self, address: IpAddr) -> Option<String> {
        self.targets
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&address)
            .cloned()
    }

    /// Open a transport flow, resolving its root info from the target table
    pub fn open_flow(&self, protocol: Protocol, src: SocketAddr, dest: SocketAddr) -> ContextRef {
        let root = [src.ip(), dest.ip()]
            .into_iter()
            .find_map(|ip| {
                self.liid_for(ip).map(|liid| RootInfo {
                    liid,
                    trigger: Some(ip),
                })
            })
            .unwrap_or_default();
        self.open_flow_with_root(protocol, src, dest, root)
    }

    /// Open a transport flow with explicit root info
    pub fn open_flow_with_root(
        &self,
        protocol: Protocol,
        src: SocketAddr,
        dest: SocketAddr,
        root: RootInfo,
    ) -> ContextRef {
        let ctx = FlowContext {
            id: self.allocate_id(),
            layer: Layer::Transport(Transport {
                protocol,
                src,
                dest,
                root,
            }),
            parent: None,
        };
        debug!(target: "engine", "Opened flow {} {} {} -> {}", ctx.id, protocol, src, dest);
        Arc::new(ctx)
    }

    /// Open an application-layer context on top of `parent`
    pub fn open_layer(&self, parent: &ContextRef, name: impl Into<String>) -> ContextRef {
        Arc::new(FlowContext {
            id: self.allocate_id(),
            layer: Layer::Application(name.into()),
            parent: Some(Arc::clone(parent)),
        })
    }

    fn allocate_id(&self) -> ContextId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn describe(&self, ctx: &dyn Context, pick: fn(&Transport) -> SocketAddr) -> String {
        // Collect layers from the innermost context outwards, then print
        // them root first: "ipv4:10.0.0.1 tcp:443 http"
        let mut parts = Vec::new();
        let mut push_layer = |flow: &FlowContext| match &flow.layer {
            Layer::Application(name) => parts.push(name.clone()),
            Layer::Transport(t) => {
                let addr = pick(t);
                parts.push(format!("{}:{}", t.protocol, addr.port()));
                parts.push(format!("{}:{}", family(&addr.ip()), addr.ip()));
            }
        };

        if let Some(flow) = as_flow(ctx) {
            push_layer(flow);
        }
        for ancestor in ancestry(ctx) {
            if let Some(flow) = as_flow(ancestor.as_ref()) {
                push_layer(flow);
            }
        }

        if parts.is_empty() {
            return "unknown".to_string();
        }
        parts.reverse();
        parts.join(" ")
    }
}

impl Default for MemoryEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl Engine for MemoryEngine {
    fn describe_src(&self, ctx: &dyn Context) -> String {
        self.describe(ctx, |t| t.src)
    }

    fn describe_dest(&self, ctx: &dyn Context) -> String {
        self.describe(ctx, |t| t.dest)
    }

    fn network_info(&self, ctx: &dyn Context) -> Result<NetworkInfo, EngineError> {
        if as_flow(ctx).is_none() {
            return Err(EngineError::ForeignContext(ctx.id()));
        }
        let t = transport_of(ctx).ok_or(EngineError::NoTransport(ctx.id()))?;
        Ok(NetworkInfo {
            protocol: t.protocol,
            src: t.src,
            dest: t.dest,
        })
    }

    fn root_info(&self, ctx: &dyn Context) -> RootInfo {
        transport_of(ctx).map(|t| t.root).unwrap_or_default()
    }
}
