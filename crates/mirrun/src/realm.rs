//! # Realm Messaging
//!
//! The low-level surface two isolated realms share: structured messages with
//! a declared origin and, during the handshake, one transferred port. Nothing
//! above this layer ever sees the counterpart realm directly.

use std::fmt;

use async_trait::async_trait;

use mirrpc::Port;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The counterpart realm is gone; nothing can be posted to it.
    Detached,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Detached => write!(f, "counterpart realm detached"),
        }
    }
}

impl std::error::Error for Error {}

pub type Result<T> = std::result::Result<T, Error>;

/// One message between realms: structured data, the sender's declared origin,
/// and at most one transferred port.
#[derive(Debug)]
pub struct RealmMsg {
    pub data: serde_json::Value,
    /// Stamped by the posting realm; a sender cannot claim a foreign origin.
    pub origin: String,
    pub port: Option<Port>,
}

impl RealmMsg {
    pub fn new(data: serde_json::Value) -> Self {
        Self { data, origin: String::new(), port: None }
    }

    pub fn with_port(data: serde_json::Value, port: Port) -> Self {
        Self { data, origin: String::new(), port: Some(port) }
    }
}

/// This side of a realm boundary.
#[async_trait]
pub trait Realm: Send + Sync {
    /// Posts a message to the counterpart realm. The implementation stamps
    /// the message with this realm's own origin.
    fn post(&self, msg: RealmMsg) -> Result<()>;

    /// Receives the next message from the counterpart. `None` means the
    /// counterpart is gone for good.
    async fn recv(&self) -> Option<RealmMsg>;

    /// This side's declared origin.
    fn origin(&self) -> &str;

    /// Whether the counterpart's container still exists. Polled by the
    /// listener role for liveness.
    fn is_attached(&self) -> bool;
}

/// Which counterpart origins a handshake will accept.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Origin {
    Exact(String),
    Any,
}

impl Origin {
    pub fn accepts(&self, origin: &str) -> bool {
        match self {
            Self::Exact(expected) => expected == origin,
            Self::Any => true,
        }
    }
}
