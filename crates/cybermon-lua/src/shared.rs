use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use cybermon_engine::{ContextRef, Engine};

use crate::dispatcher::{CallbackDispatcher, Dispatch};
use crate::error::BridgeError;

/// A dispatcher that can be called from several engine threads
///
/// Every dispatch holds a single lock for its whole duration, including any
/// native functions the script calls back into, so the interpreter only
/// ever runs one call at a time.
#[derive(Clone)]
pub struct SharedDispatcher {
    inner: Arc<Mutex<CallbackDispatcher>>,
}

impl SharedDispatcher {
    pub fn new(dispatcher: CallbackDispatcher) -> Self {
        Self {
            inner: Arc::new(Mutex::new(dispatcher)),
        }
    }

    /// Take the lock. A panic in an earlier dispatch does not leave the
    /// interpreter mid-call, so a poisoned lock is recovered.
    pub fn lock(&self) -> MutexGuard<'_, CallbackDispatcher> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Swap in a new dispatcher (e.g. after a script reload) and return the old one
    pub fn replace(&self, dispatcher: CallbackDispatcher) -> CallbackDispatcher {
        std::mem::replace(&mut *self.lock(), dispatcher)
    }

    pub fn trigger_up(&self, liid: &str, address: IpAddr) -> Result<Dispatch, BridgeError> {
        self.lock().trigger_up(liid, address)
    }

    pub fn trigger_down(&self, liid: &str) -> Result<Dispatch, BridgeError> {
        self.lock().trigger_down(liid)
    }

    pub fn connection_up<E: Engine + 'static>(
        &self,
        engine: &Arc<E>,
        conn: &ContextRef,
    ) -> Result<Dispatch, BridgeError> {
        self.lock().connection_up(engine, conn)
    }

    pub fn connection_down<E: Engine + 'static>(
        &self,
        engine: &Arc<E>,
        conn: &ContextRef,
    ) -> Result<Dispatch, BridgeError> {
        self.lock().connection_down(engine, conn)
    }

    pub fn connection_data<E: Engine + 'static>(
        &self,
        engine: &Arc<E>,
        conn: &ContextRef,
        payload: &[u8],
    ) -> Result<Dispatch, BridgeError> {
        self.lock().connection_data(engine, conn, payload)
    }

    pub fn datagram<E: Engine + 'static>(
        &self,
        engine: &Arc<E>,
        conn: &ContextRef,
        payload: &[u8],
    ) -> Result<Dispatch, BridgeError> {
        self.lock().datagram(engine, conn, payload)
    }

    pub fn http_request<E: Engine + 'static>(
        &self,
        engine: &Arc<E>,
        conn: &ContextRef,
        method: &str,
        url: &str,
        headers: &BTreeMap<String, String>,
        body: &[u8],
    ) -> Result<Dispatch, BridgeError> {
        self.lock()
            .http_request(engine, conn, method, url, headers, body)
    }

    pub fn http_response<E: Engine + 'static>(
        &self,
        engine: &Arc<E>,
        conn: &ContextRef,
        code: u32,
        status: &str,
        headers: &BTreeMap<String, String>,
        body: &[u8],
    ) -> Result<Dispatch, BridgeError> {
        self.lock()
            .http_response(engine, conn, code, status, headers, body)
    }
}
