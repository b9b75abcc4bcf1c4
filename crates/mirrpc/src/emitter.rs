//! # Data Emitter
//!
//! Turns the raw duplex port into a typed publish/subscribe surface keyed by
//! string event names. A pump task reads the current port and dispatches
//! frames to registered handlers; `connect` may swap in a new port at any
//! time (realm reload), and the handler table survives the swap, so the
//! layers above never notice a reconnection.
//!
//! ## Invariants
//! - At most one pump delivers frames at a time: each `connect` bumps the
//!   epoch and stale pumps exit on their next frame.
//! - `destroy` is idempotent; after it, `emit` fails fast and no frame is
//!   ever sent again.
//! - The reserved `"connected"` event is local-only and never accepted from
//!   the wire.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::OnceLock;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use dashmap::DashMap;

use mirpack::Value;

use crate::channel::EventFrame;
use crate::channel::Port;

/// Local event dispatched whenever a port is connected or reconnected.
pub const CONNECTED_EVENT: &str = "connected";
/// Reserved event name for disconnection, on the wire and locally.
pub const DISCONNECTED_EVENT: &str = "disconnected";

#[derive(Debug, Clone)]
pub enum Error {
    /// The emitter was destroyed; no further traffic is possible.
    Destroyed(Option<String>),
    /// The payload still contained live references or non-wire values.
    BadValue(mirpack::Error),
    /// No port is connected, or its peer is gone.
    PortClosed,
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Destroyed(Some(reason)) => write!(f, "emitter destroyed: {}", reason),
            Self::Destroyed(None) => write!(f, "emitter destroyed"),
            Self::BadValue(e) => write!(f, "payload not wire-safe: {}", e),
            Self::PortClosed => write!(f, "no connected port"),
        }
    }
}

impl std::error::Error for Error {}

impl From<mirpack::Error> for Error {
    fn from(e: mirpack::Error) -> Self {
        Self::BadValue(e)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

type Handler = Arc<dyn Fn(Value) + Send + Sync>;

struct HandlerEntry {
    id: u64,
    once: bool,
    handler: Handler,
}

/// Handle for removing a registered handler.
#[derive(Debug, Clone)]
pub struct Subscription {
    event: String,
    id: u64,
}

struct EmitterInner {
    handlers: DashMap<String, Vec<HandlerEntry>>,
    port: Mutex<Option<Arc<Port>>>,
    next_handler: AtomicU64,
    epoch: AtomicU64,
    connects: AtomicU64,
    destroyed: OnceLock<Option<String>>,
}

/// Typed publish/subscribe surface over the currently connected port.
#[derive(Clone)]
pub struct DataEmitter {
    inner: Arc<EmitterInner>,
}

impl std::fmt::Debug for DataEmitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataEmitter").finish_non_exhaustive()
    }
}

impl DataEmitter {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(EmitterInner {
                handlers: DashMap::new(),
                port: Mutex::new(None),
                next_handler: AtomicU64::new(1),
                epoch: AtomicU64::new(0),
                connects: AtomicU64::new(0),
                destroyed: OnceLock::new(),
            }),
        }
    }

    /// Registers a persistent handler for `event`.
    pub fn on<F>(&self, event: &str, handler: F) -> Subscription
    where
        F: Fn(Value) + Send + Sync + 'static,
    {
        self.register(event, Arc::new(handler), false)
    }

    /// Registers a one-shot handler: removed before its single invocation.
    pub fn once<F>(&self, event: &str, handler: F) -> Subscription
    where
        F: Fn(Value) + Send + Sync + 'static,
    {
        self.register(event, Arc::new(handler), true)
    }

    fn register(&self, event: &str, handler: Handler, once: bool) -> Subscription {
        let id = self.inner.next_handler.fetch_add(1, Ordering::Relaxed);
        self.inner
            .handlers
            .entry(event.to_string())
            .or_default()
            .push(HandlerEntry { id, once, handler });
        Subscription { event: event.to_string(), id }
    }

    /// Removes a handler. Unknown subscriptions are a no-op.
    pub fn off(&self, sub: &Subscription) {
        if let Some(mut entries) = self.inner.handlers.get_mut(&sub.event) {
            entries.retain(|entry| entry.id != sub.id);
        }
    }

    /// Number of handlers currently registered for `event`.
    pub(crate) fn handler_count(&self, event: &str) -> usize {
        self.inner
            .handlers
            .get(event)
            .map(|entries| entries.len())
            .unwrap_or(0)
    }

    /// Sends one event frame to the peer. The payload must be wire-safe: a
    /// stray function leaf aborts here, synchronously, before anything is
    /// transmitted.
    pub fn emit(&self, event: &str, payload: &Value) -> Result<()> {
        self.emit_json(event, payload.to_json()?)
    }

    /// Sends one event frame whose payload is already JSON.
    pub fn emit_json(&self, event: &str, payload: serde_json::Value) -> Result<()> {
        if let Some(reason) = self.inner.destroyed.get() {
            return Err(Error::Destroyed(reason.clone()));
        }
        let frame = EventFrame { kind: event.to_string(), payload };
        let frame = serde_json::to_value(&frame)
            .map_err(|e| Error::BadValue(mirpack::Error::BadValue(e.to_string())))?;
        let port = {
            let guard = lock(&self.inner.port);
            guard.clone()
        };
        let port = port.ok_or(Error::PortClosed)?;
        port.send(frame).map_err(|_| Error::PortClosed)
    }

    /// Swaps in a new port, retiring any previous one, and dispatches the
    /// local `"connected"` event. Used for the first connection and for
    /// reconnection after a realm reload.
    pub fn connect(&self, port: Port) {
        if self.is_destroyed() {
            tracing::warn!("connect on a destroyed emitter ignored");
            return;
        }
        let port = Arc::new(port);
        let epoch = self.inner.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        {
            let mut guard = lock(&self.inner.port);
            *guard = Some(port.clone());
        }
        self.inner.connects.fetch_add(1, Ordering::SeqCst);

        let inner = self.inner.clone();
        tokio::spawn(pump(inner, port, epoch));

        self.dispatch(CONNECTED_EVENT, Value::Null);
    }

    /// How many times a port has been connected. Values above one mean the
    /// remote realm reloaded.
    pub fn connect_count(&self) -> u64 {
        self.inner.connects.load(Ordering::SeqCst)
    }

    pub fn is_destroyed(&self) -> bool {
        self.inner.destroyed.get().is_some()
    }

    /// The reason this emitter was destroyed, if it was. `Some(None)` is a
    /// clean shutdown; `Some(Some(_))` an abort.
    pub fn destroy_reason(&self) -> Option<Option<String>> {
        self.inner.destroyed.get().cloned()
    }

    /// Tears down the port and dispatches the local `"disconnected"` event.
    /// `None` is a clean shutdown, `Some` an abort. Idempotent.
    pub fn destroy(&self, reason: Option<String>) {
        if self.inner.destroyed.set(reason.clone()).is_err() {
            return;
        }
        {
            let mut guard = lock(&self.inner.port);
            *guard = None;
        }
        let payload = Value::object([(
            "reason",
            reason.map(Value::String).unwrap_or(Value::Null),
        )]);
        self.dispatch(DISCONNECTED_EVENT, payload);
    }

    fn dispatch(&self, event: &str, payload: Value) {
        self.inner.dispatch(event, payload);
    }
}

impl Default for DataEmitter {
    fn default() -> Self {
        Self::new()
    }
}

impl EmitterInner {
    fn dispatch(&self, event: &str, payload: Value) {
        // Collect outside the shard guard: handlers may register or remove
        // subscriptions on the same event.
        let to_run: Vec<Handler> = {
            let Some(mut entries) = self.handlers.get_mut(event) else {
                return;
            };
            let run = entries.iter().map(|entry| entry.handler.clone()).collect();
            entries.retain(|entry| !entry.once);
            run
        };
        for handler in to_run {
            handler(payload.clone());
        }
    }
}

async fn pump(inner: Arc<EmitterInner>, port: Arc<Port>, epoch: u64) {
    let Some(mut rx) = port.take_receiver() else {
        tracing::warn!(epoch, "port receiver already taken");
        return;
    };

    while let Some(frame) = rx.recv().await {
        if inner.epoch.load(Ordering::SeqCst) != epoch {
            tracing::debug!(epoch, "stale pump retired after reconnection");
            return;
        }
        if inner.destroyed.get().is_some() {
            return;
        }
        match serde_json::from_value::<EventFrame>(frame) {
            Ok(event) => {
                if event.kind == CONNECTED_EVENT {
                    tracing::warn!("dropping wire frame claiming a local-only event");
                    continue;
                }
                inner.dispatch(&event.kind, Value::from_json(&event.payload));
            }
            Err(e) => {
                tracing::warn!(error = %e, "dropping malformed frame");
            }
        }
    }
    tracing::debug!(epoch, "port pump finished");
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
