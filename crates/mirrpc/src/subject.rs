//! # Remote Subject
//!
//! The protocol layer: translates ticket operations into named wire events
//! over the transport adapter. Payload positions that may contain functions
//! (call arguments, resolved values) pass through the injected mapper, so the
//! subject itself never knows whether it is carrying plain data, tickets, or
//! stubs.
//!
//! Event naming: `"<fnId>_c"` for calls, `"<fnId><callId>_r"` for responses,
//! `"<fnId>_g"` for cleanup, and the reserved `"disconnected"` name.

use std::fmt;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::OnceLock;
use std::sync::Weak;

use mirpack::FuncError;
use mirpack::Value;

use crate::emitter::DISCONNECTED_EVENT;
use crate::emitter::DataEmitter;
use crate::emitter::Subscription;
use crate::emitter;
use crate::ticket;
use crate::ticket::CallArgsTicket;
use crate::ticket::CallTicket;
use crate::ticket::CleanupTicket;
use crate::ticket::DefTicket;
use crate::ticket::DisconnectionTicket;
use crate::ticket::Outcome;
use crate::ticket::RespondTicket;

#[derive(Debug, Clone)]
pub enum Error {
    Emit(emitter::Error),
    Ticket(String),
    BadValue(mirpack::Error),
    /// The simulator that owns this subject is gone.
    MapperGone,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Emit(e) => write!(f, "emit failed: {}", e),
            Self::Ticket(detail) => write!(f, "ticket error: {}", detail),
            Self::BadValue(e) => write!(f, "{}", e),
            Self::MapperGone => write!(f, "mapper dropped before use"),
        }
    }
}

impl std::error::Error for Error {}

impl From<emitter::Error> for Error {
    fn from(e: emitter::Error) -> Self {
        Self::Emit(e)
    }
}

impl From<ticket::Error> for Error {
    fn from(e: ticket::Error) -> Self {
        Self::Ticket(e.to_string())
    }
}

impl From<mirpack::Error> for Error {
    fn from(e: mirpack::Error) -> Self {
        Self::BadValue(e)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// The marshal/unmarshal pair the subject applies at function-bearing payload
/// positions. Implemented by the object simulator.
pub trait Mapper: Send + Sync {
    /// Outbound direction: function leaves become tickets.
    fn marshal(&self, value: &Value) -> mirpack::Result<Value>;
    /// Inbound direction: tickets become live stubs.
    fn unmarshal(&self, value: &Value) -> mirpack::Result<Value>;
}

/// Ticket operations over named wire events.
pub struct RemoteSubject {
    emitter: Arc<DataEmitter>,
    mapper: OnceLock<Weak<dyn Mapper>>,
}

impl RemoteSubject {
    pub fn new(emitter: Arc<DataEmitter>) -> Self {
        Self { emitter, mapper: OnceLock::new() }
    }

    /// Injects the mapper. Called once by the simulator that owns this
    /// subject; the weak reference breaks the construction cycle between the
    /// two.
    pub fn bind_mapper(&self, mapper: Weak<dyn Mapper>) {
        let _ = self.mapper.set(mapper);
    }

    pub fn emitter(&self) -> &Arc<DataEmitter> {
        &self.emitter
    }

    fn mapper(&self) -> Result<Arc<dyn Mapper>> {
        self.mapper.get().and_then(Weak::upgrade).ok_or(Error::MapperGone)
    }

    fn call_event(fn_id: &str) -> String {
        format!("{}_c", fn_id)
    }

    fn respond_event(fn_id: &str, call_id: u64) -> String {
        format!("{}{}_r", fn_id, call_id)
    }

    fn cleanup_event(fn_id: &str) -> String {
        format!("{}_g", fn_id)
    }

    /// Sends one invocation: marshals the arguments and emits the call
    /// ticket on `"<fnId>_c"`.
    pub fn send(&self, call: &CallTicket, args: &[Value]) -> Result<()> {
        let mapper = self.mapper()?;
        let mut wire_args = Vec::with_capacity(args.len());
        for arg in args {
            wire_args.push(mapper.marshal(arg)?.to_json()?);
        }
        let full = CallArgsTicket {
            fn_id: call.fn_id.clone(),
            call_id: call.call_id,
            args: wire_args,
        };
        self.emitter.emit_json(&Self::call_event(&call.fn_id), ticket::seal(&full)?)?;
        Ok(())
    }

    /// Subscribes persistently to calls for `ticket`. Arguments are
    /// unmarshaled before the handler sees them, so callbacks inside them
    /// arrive as live stubs.
    pub fn on_call<F>(&self, ticket: &DefTicket, handler: F) -> Subscription
    where
        F: Fn(CallTicket, Vec<Value>) + Send + Sync + 'static,
    {
        let mapper = self.mapper.get().cloned();
        self.emitter.on(&Self::call_event(&ticket.fn_id), move |payload| {
            let Some(mapper) = mapper.as_ref().and_then(Weak::upgrade) else {
                tracing::warn!("dropping call: mapper gone");
                return;
            };
            let Some(full) = decode::<CallArgsTicket>(&payload) else {
                return;
            };
            let mut args = Vec::with_capacity(full.args.len());
            for arg in &full.args {
                match mapper.unmarshal(&Value::from_json(arg)) {
                    Ok(value) => args.push(value),
                    Err(e) => {
                        tracing::warn!(fn_id = %full.fn_id, error = %e, "dropping call with bad argument");
                        return;
                    }
                }
            }
            handler(full.call(), args);
        })
    }

    /// Answers one call. Resolved values are marshaled, so functions inside
    /// a result become tickets.
    pub fn respond(
        &self,
        call: &CallTicket,
        outcome: std::result::Result<Value, FuncError>,
    ) -> Result<()> {
        let outcome = match outcome {
            Ok(value) => {
                let mapper = self.mapper()?;
                Outcome::Resolve { value: mapper.marshal(&value)?.to_json()? }
            }
            Err(error) => Outcome::Reject { error },
        };
        let respond = RespondTicket {
            fn_id: call.fn_id.clone(),
            call_id: call.call_id,
            outcome,
        };
        let event = Self::respond_event(&call.fn_id, call.call_id);
        self.emitter.emit_json(&event, ticket::seal(&respond)?)?;
        Ok(())
    }

    /// Subscribes for the answer to one call. One-shot: a call is answered
    /// exactly once.
    pub fn on_respond<F>(&self, call: &CallTicket, handler: F) -> Subscription
    where
        F: FnOnce(std::result::Result<Value, FuncError>) + Send + 'static,
    {
        let mapper = self.mapper.get().cloned();
        let slot = Mutex::new(Some(handler));
        let event = Self::respond_event(&call.fn_id, call.call_id);
        self.emitter.once(&event, move |payload| {
            let Some(handler) = take(&slot) else { return };
            let Some(respond) = decode::<RespondTicket>(&payload) else {
                return;
            };
            let settled = match respond.outcome {
                Outcome::Resolve { value } => {
                    match mapper.as_ref().and_then(Weak::upgrade) {
                        Some(mapper) => mapper
                            .unmarshal(&Value::from_json(&value))
                            .map_err(FuncError::from),
                        None => Err(FuncError::disconnection(Some("mapper gone".to_string()))),
                    }
                }
                Outcome::Reject { error } => Err(error),
            };
            handler(settled);
        })
    }

    /// Tells the defining side that every stub for `fnId` is unreachable.
    pub fn notify_cleanup(&self, fn_id: &str) -> Result<()> {
        self.emitter
            .emit_json(&Self::cleanup_event(fn_id), ticket::seal(&CleanupTicket {})?)?;
        Ok(())
    }

    /// Subscribes for the peer's cleanup ticket for `ticket`.
    pub fn on_out_of_scope<F>(&self, ticket: &DefTicket, handler: F) -> Subscription
    where
        F: FnOnce() + Send + 'static,
    {
        let slot = Mutex::new(Some(handler));
        self.emitter.once(&Self::cleanup_event(&ticket.fn_id), move |_payload| {
            if let Some(handler) = take(&slot) {
                handler();
            }
        })
    }

    /// Announces disconnection to the peer, then destroys the local emitter.
    pub fn disconnect(&self, reason: Option<String>) {
        let frame = ticket::seal(&DisconnectionTicket { reason: reason.clone() });
        match frame {
            Ok(frame) => {
                if let Err(e) = self.emitter.emit_json(DISCONNECTED_EVENT, frame) {
                    tracing::debug!(error = %e, "disconnect announcement not delivered");
                }
            }
            Err(e) => tracing::debug!(error = %e, "disconnect ticket did not encode"),
        }
        self.emitter.destroy(reason);
    }

    /// Subscribes once for disconnection, remote or local.
    pub fn on_disconnected<F>(&self, handler: F) -> Subscription
    where
        F: FnOnce(Option<String>) + Send + 'static,
    {
        let slot = Mutex::new(Some(handler));
        self.emitter.once(DISCONNECTED_EVENT, move |payload| {
            if let Some(handler) = take(&slot) {
                handler(disconnect_reason(&payload));
            }
        })
    }
}

/// Extracts the reason from a disconnection payload: a sealed
/// [`DisconnectionTicket`] from the wire, or the bare object the emitter
/// dispatches on local destruction.
pub(crate) fn disconnect_reason(payload: &Value) -> Option<String> {
    if let Ok(json) = payload.to_json() {
        if let Ok(ticket) = ticket::open::<DisconnectionTicket>(&json) {
            return ticket.reason;
        }
    }
    payload
        .get("reason")
        .and_then(Value::as_str)
        .map(str::to_string)
}

fn decode<T: serde::de::DeserializeOwned>(payload: &Value) -> Option<T> {
    let json = match payload.to_json() {
        Ok(json) => json,
        Err(e) => {
            tracing::warn!(error = %e, "dropping non-wire payload");
            return None;
        }
    };
    match ticket::open::<T>(&json) {
        Ok(ticket) => Some(ticket),
        Err(e) => {
            tracing::warn!(error = %e, "dropping malformed ticket");
            None
        }
    }
}

fn take<T>(slot: &Mutex<Option<T>>) -> Option<T> {
    match slot.lock() {
        Ok(mut guard) => guard.take(),
        Err(poisoned) => poisoned.into_inner().take(),
    }
}
