use std::fmt;
use std::net::{IpAddr, SocketAddr};

use serde::{Deserialize, Serialize};

use crate::context::Context;
use crate::error::EngineError;

/// Transport protocol of a flow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Tcp => write!(f, "tcp"),
            Protocol::Udp => write!(f, "udp"),
        }
    }
}

/// Addressing of the flow a context belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetworkInfo {
    pub protocol: Protocol,
    pub src: SocketAddr,
    pub dest: SocketAddr,
}

/// Information held at the root of a context tree
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RootInfo {
    /// LIID of the target that caused this traffic to be captured
    pub liid: String,
    /// Address whose activity triggered processing
    pub trigger: Option<IpAddr>,
}

/// Queries the bridge makes against the analysis engine
pub trait Engine: Send + Sync {
    /// Human-readable description of the source endpoint
    fn describe_src(&self, ctx: &dyn Context) -> String;

    /// Human-readable description of the destination endpoint
    fn describe_dest(&self, ctx: &dyn Context) -> String;

    /// Source/destination addressing of the flow `ctx` is part of
    fn network_info(&self, ctx: &dyn Context) -> Result<NetworkInfo, EngineError>;

    /// LIID and trigger address for the tree `ctx` belongs to
    fn root_info(&self, ctx: &dyn Context) -> RootInfo;
}
