//! # Ticket Vocabulary
//!
//! The wire records of the protocol. A ticket names a function, one
//! invocation of it, the response to that invocation, or a protocol event
//! (cleanup, disconnection, handshake). Every wire message is exactly one
//! ticket wrapped once in the envelope root key.
//!
//! ## Invariants
//! - An `fnId` is valid only on the side that defined it, for the lifetime of
//!   the function it names.
//! - A `(fnId, callId)` pair identifies at most one outstanding call.

use std::fmt;

use serde::Deserialize;
use serde::Serialize;
use serde::de::DeserializeOwned;

use mirpack::FuncError;
use mirpack::envelope;

#[derive(Debug, Clone)]
pub enum Error {
    /// The message lacked the single protocol root key.
    NotProtocol,
    /// The ticket body did not decode as the expected shape.
    MalformedTicket(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotProtocol => write!(f, "message is not protocol traffic"),
            Self::MalformedTicket(detail) => write!(f, "malformed ticket: {}", detail),
        }
    }
}

impl std::error::Error for Error {}

pub type Result<T> = std::result::Result<T, Error>;

/// Names one function, unique per defining side.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Hash)]
pub struct DefTicket {
    #[serde(rename = "fnId")]
    pub fn_id: String,
}

impl DefTicket {
    pub fn new(fn_id: impl Into<String>) -> Self {
        Self { fn_id: fn_id.into() }
    }
}

/// One in-flight invocation. `callId` is a per-sender, per-`fnId` counter,
/// not globally unique.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Hash)]
pub struct CallTicket {
    #[serde(rename = "fnId")]
    pub fn_id: String,
    #[serde(rename = "callId", deserialize_with = "call_id_from_number")]
    pub call_id: u64,
}

/// An invocation carrying its already-marshaled arguments.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct CallArgsTicket {
    #[serde(rename = "fnId")]
    pub fn_id: String,
    #[serde(rename = "callId", deserialize_with = "call_id_from_number")]
    pub call_id: u64,
    pub args: Vec<serde_json::Value>,
}

impl CallArgsTicket {
    pub fn call(&self) -> CallTicket {
        CallTicket { fn_id: self.fn_id.clone(), call_id: self.call_id }
    }
}

/// The settled side of one call.
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum Outcome {
    Resolve { value: serde_json::Value },
    Reject { error: FuncError },
}

/// The answer to one call ticket. A call is answered exactly once.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct RespondTicket {
    #[serde(rename = "fnId")]
    pub fn_id: String,
    #[serde(rename = "callId", deserialize_with = "call_id_from_number")]
    pub call_id: u64,
    #[serde(flatten)]
    pub outcome: Outcome,
}

/// Inbound payloads pass through the value model, which stores every number
/// as a double, so an integral `callId` may arrive as `1.0`.
fn call_id_from_number<'de, D>(de: D) -> std::result::Result<u64, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let n = f64::deserialize(de)?;
    if n.fract() != 0.0 || !(0.0..=u64::MAX as f64).contains(&n) {
        return Err(serde::de::Error::custom(format!(
            "callId {} is not an unsigned integer",
            n
        )));
    }
    Ok(n as u64)
}

/// "This remote handle is gone, stop listening." Keyed by `fnId` through the
/// event name it travels on.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct CleanupTicket {}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct DisconnectionTicket {
    pub reason: Option<String>,
}

/// Initiator half of the handshake: proposes a tunnel key.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct HandshakeOffered {
    pub offers: String,
    pub version: String,
}

/// Listener half of the handshake: accepts a proposed key. The dedicated
/// channel end travels alongside, not inside, this ticket.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct HandshakeAccepted {
    pub accepts: String,
    pub version: String,
}

/// Serializes a ticket and wraps it once in the envelope root key.
pub fn seal<T: Serialize>(ticket: &T) -> Result<serde_json::Value> {
    let body = serde_json::to_value(ticket).map_err(|e| Error::MalformedTicket(e.to_string()))?;
    Ok(envelope::wrap(body))
}

/// Unwraps the envelope and decodes the ticket inside it.
pub fn open<T: DeserializeOwned>(message: &serde_json::Value) -> Result<T> {
    let body = envelope::unwrap(message).ok_or(Error::NotProtocol)?;
    serde_json::from_value(body.clone()).map_err(|e| Error::MalformedTicket(e.to_string()))
}
