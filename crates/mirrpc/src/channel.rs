//! # Duplex Port
//!
//! One end of the dedicated channel a tunnel hands to the transport adapter.
//! A port moves JSON frames only: live references cannot cross it, which is
//! the memory-safety boundary the rest of the protocol is built on.

use std::fmt;
use std::sync::Mutex;

use serde::Deserialize;
use serde::Serialize;
use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The counterpart end of the port is gone.
    Closed,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "port closed"),
        }
    }
}

impl std::error::Error for Error {}

pub type Result<T> = std::result::Result<T, Error>;

/// The transport event envelope: every frame on a connected port is a named
/// event with a JSON payload.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct EventFrame {
    #[serde(rename = "type")]
    pub kind: String,
    pub payload: serde_json::Value,
}

/// One end of an in-process duplex JSON channel.
pub struct Port {
    tx: mpsc::UnboundedSender<serde_json::Value>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<serde_json::Value>>>,
}

impl Port {
    /// Creates a pair of connected ports: frames sent on one are received on
    /// the other.
    pub fn pair() -> (Port, Port) {
        let (tx_a, rx_a) = mpsc::unbounded_channel();
        let (tx_b, rx_b) = mpsc::unbounded_channel();

        let a = Port { tx: tx_a, rx: Mutex::new(Some(rx_b)) };
        let b = Port { tx: tx_b, rx: Mutex::new(Some(rx_a)) };
        (a, b)
    }

    pub fn send(&self, frame: serde_json::Value) -> Result<()> {
        self.tx.send(frame).map_err(|_| Error::Closed)
    }

    /// Takes the receiving half. Yields `Some` exactly once; the pump that
    /// takes it owns inbound delivery for this port.
    pub(crate) fn take_receiver(&self) -> Option<mpsc::UnboundedReceiver<serde_json::Value>> {
        match self.rx.lock() {
            Ok(mut slot) => slot.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        }
    }
}

impl fmt::Debug for Port {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Port")
    }
}
