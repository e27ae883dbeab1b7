use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::io::BufRead;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use anyhow::Context as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use cybermon_engine::{ContextRef, MemoryEngine, Protocol, RootInfo};
use cybermon_lua::{BridgeError, Dispatch, SharedDispatcher};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

/// One line of a replay trace
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TraceEvent {
    /// Start monitoring `address`; flows touching it get `liid`
    Target { liid: String, address: IpAddr },
    TriggerUp { liid: String, address: IpAddr },
    TriggerDown { liid: String },
    ConnectionUp {
        conn: String,
        src: SocketAddr,
        dest: SocketAddr,
        #[serde(default = "default_protocol")]
        protocol: Protocol,
        /// Overrides the LIID found through `target` events
        #[serde(default)]
        liid: Option<String>,
        #[serde(default)]
        trigger: Option<IpAddr>,
        /// Application layer opened on top of the flow, e.g. "http"
        #[serde(default)]
        layer: Option<String>,
    },
    Data {
        conn: String,
        #[serde(default)]
        payload: Option<String>,
        #[serde(default)]
        payload_base64: Option<String>,
    },
    Datagram {
        conn: String,
        #[serde(default)]
        payload: Option<String>,
        #[serde(default)]
        payload_base64: Option<String>,
    },
    HttpRequest {
        conn: String,
        method: String,
        url: String,
        #[serde(default)]
        headers: BTreeMap<String, String>,
        #[serde(default)]
        body: Option<String>,
        #[serde(default)]
        body_base64: Option<String>,
    },
    HttpResponse {
        conn: String,
        code: u32,
        status: String,
        #[serde(default)]
        headers: BTreeMap<String, String>,
        #[serde(default)]
        body: Option<String>,
        #[serde(default)]
        body_base64: Option<String>,
    },
    ConnectionDown { conn: String },
}

fn default_protocol() -> Protocol {
    Protocol::Tcp
}

impl TraceEvent {
    pub fn parse(line: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(line)
    }

    pub fn name(&self) -> &'static str {
        match self {
            TraceEvent::Target { .. } => "target",
            TraceEvent::TriggerUp { .. } => "trigger_up",
            TraceEvent::TriggerDown { .. } => "trigger_down",
            TraceEvent::ConnectionUp { .. } => "connection_up",
            TraceEvent::Data { .. } => "data",
            TraceEvent::Datagram { .. } => "datagram",
            TraceEvent::HttpRequest { .. } => "http_request",
            TraceEvent::HttpResponse { .. } => "http_response",
            TraceEvent::ConnectionDown { .. } => "connection_down",
        }
    }
}

#[derive(Debug, Error)]
pub enum ReplayError {
    #[error("unknown connection '{0}'")]
    UnknownConnection(String),

    #[error("connection '{0}' is already up")]
    DuplicateConnection(String),

    #[error("invalid base64 payload: {0}")]
    BadPayload(#[from] base64::DecodeError),

    #[error(transparent)]
    Bridge(#[from] BridgeError),
}

/// Counters reported at the end of a replay
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReplayStats {
    pub lines: usize,
    pub handled: usize,
    pub no_handler: usize,
    pub failed: usize,
    pub skipped: usize,
}

impl ReplayStats {
    fn record(&mut self, dispatch: Dispatch) {
        match dispatch {
            Dispatch::Handled => self.handled += 1,
            Dispatch::NoHandler => self.no_handler += 1,
            Dispatch::Failed => self.failed += 1,
        }
    }
}

impl fmt::Display for ReplayStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} line(s): {} handled, {} without handler, {} failed, {} skipped",
            self.lines, self.handled, self.no_handler, self.failed, self.skipped
        )
    }
}

/// Drives a dispatcher from trace events against an in-memory engine
pub struct Replay {
    engine: Arc<MemoryEngine>,
    dispatcher: SharedDispatcher,
    connections: HashMap<String, ContextRef>,
    stats: ReplayStats,
}

impl Replay {
    pub fn new(dispatcher: SharedDispatcher) -> Self {
        Self {
            engine: Arc::new(MemoryEngine::new()),
            dispatcher,
            connections: HashMap::new(),
            stats: ReplayStats::default(),
        }
    }

    pub fn engine(&self) -> &Arc<MemoryEngine> {
        &self.engine
    }

    pub fn stats(&self) -> ReplayStats {
        self.stats
    }

    /// Number of connections that are up
    pub fn open_connections(&self) -> usize {
        self.connections.len()
    }

    /// Replay every line of `reader`.
    ///
    /// Blank lines are ignored; lines that fail to parse or name an unknown
    /// connection are logged and skipped. Bridge errors (only returned with
    /// the `propagate` error policy) abort the replay.
    pub fn run<R: BufRead>(&mut self, reader: R) -> anyhow::Result<ReplayStats> {
        for (index, line) in reader.lines().enumerate() {
            let number = index + 1;
            let line = line.with_context(|| format!("Failed to read trace line {}", number))?;
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            self.stats.lines += 1;

            let event = match TraceEvent::parse(line) {
                Ok(event) => event,
                Err(e) => {
                    warn!(target: "replay", "Skipping malformed line {}: {}", number, e);
                    self.stats.skipped += 1;
                    continue;
                }
            };

            let name = event.name();
            match self.apply(event) {
                Ok(Some(dispatch)) => self.stats.record(dispatch),
                Ok(None) => {}
                Err(ReplayError::Bridge(e)) => {
                    return Err(e).with_context(|| format!("{} on line {}", name, number));
                }
                Err(e) => {
                    warn!(target: "replay", "Skipping {} on line {}: {}", name, number, e);
                    self.stats.skipped += 1;
                }
            }
        }

        info!(target: "replay", "Replay finished: {}", self.stats);
        Ok(self.stats)
    }

    /// Apply one event. Returns `None` for events that only change engine
    /// state and do not reach the script.
    pub fn apply(&mut self, event: TraceEvent) -> Result<Option<Dispatch>, ReplayError> {
        let engine = Arc::clone(&self.engine);
        let dispatch = match event {
            TraceEvent::Target { liid, address } => {
                engine.add_target(address, liid);
                return Ok(None);
            }
            TraceEvent::TriggerUp { liid, address } => {
                self.dispatcher.trigger_up(&liid, address)?
            }
            TraceEvent::TriggerDown { liid } => self.dispatcher.trigger_down(&liid)?,
            TraceEvent::ConnectionUp {
                conn,
                src,
                dest,
                protocol,
                liid,
                trigger,
                layer,
            } => {
                if self.connections.contains_key(&conn) {
                    return Err(ReplayError::DuplicateConnection(conn));
                }
                let flow = match liid {
                    Some(liid) => {
                        engine.open_flow_with_root(protocol, src, dest, RootInfo { liid, trigger })
                    }
                    None => engine.open_flow(protocol, src, dest),
                };
                let ctx = match layer {
                    Some(layer) => engine.open_layer(&flow, layer),
                    None => flow,
                };
                debug!(target: "replay", "Connection {} is context {}", conn, ctx.id());

                let dispatch = self.dispatcher.connection_up(&engine, &ctx)?;
                self.connections.insert(conn, ctx);
                dispatch
            }
            TraceEvent::Data {
                conn,
                payload,
                payload_base64,
            } => {
                let ctx = self.connection(&conn)?;
                let payload = decode(payload, payload_base64)?;
                self.dispatcher.connection_data(&engine, &ctx, &payload)?
            }
            TraceEvent::Datagram {
                conn,
                payload,
                payload_base64,
            } => {
                let ctx = self.connection(&conn)?;
                let payload = decode(payload, payload_base64)?;
                self.dispatcher.datagram(&engine, &ctx, &payload)?
            }
            TraceEvent::HttpRequest {
                conn,
                method,
                url,
                headers,
                body,
                body_base64,
            } => {
                let ctx = self.connection(&conn)?;
                let body = decode(body, body_base64)?;
                self.dispatcher
                    .http_request(&engine, &ctx, &method, &url, &headers, &body)?
            }
            TraceEvent::HttpResponse {
                conn,
                code,
                status,
                headers,
                body,
                body_base64,
            } => {
                let ctx = self.connection(&conn)?;
                let body = decode(body, body_base64)?;
                self.dispatcher
                    .http_response(&engine, &ctx, code, &status, &headers, &body)?
            }
            TraceEvent::ConnectionDown { conn } => {
                let ctx = self
                    .connections
                    .remove(&conn)
                    .ok_or(ReplayError::UnknownConnection(conn))?;
                self.dispatcher.connection_down(&engine, &ctx)?
            }
        };
        Ok(Some(dispatch))
    }

    fn connection(&self, conn: &str) -> Result<ContextRef, ReplayError> {
        self.connections
            .get(conn)
            .cloned()
            .ok_or_else(|| ReplayError::UnknownConnection(conn.to_string()))
    }
}

/// Payload bytes from either the text or the base64 field; text wins
fn decode(text: Option<String>, base64: Option<String>) -> Result<Vec<u8>, ReplayError> {
    match (text, base64) {
        (Some(text), _) => Ok(text.into_bytes()),
        (None, Some(encoded)) => Ok(BASE64.decode(encoded)?),
        (None, None) => Ok(Vec::new()),
    }
}
