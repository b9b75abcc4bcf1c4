//! # In-Process Realm Pair
//!
//! Two connected realms over in-process channels, for tests and demos. Each
//! side can be detached, which is how the listener's liveness poll is
//! exercised without a real container.

use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::sync::mpsc;

use crate::realm::Error;
use crate::realm::Realm;
use crate::realm::RealmMsg;
use crate::realm::Result;

/// One side of an in-process realm pair.
pub struct LocalRealm {
    origin: String,
    tx: mpsc::UnboundedSender<RealmMsg>,
    rx: Mutex<mpsc::UnboundedReceiver<RealmMsg>>,
    attached: Arc<AtomicBool>,
    peer_attached: Arc<AtomicBool>,
}

impl LocalRealm {
    /// Creates two connected realms with the given declared origins.
    pub fn pair(origin_a: impl Into<String>, origin_b: impl Into<String>) -> (LocalRealm, LocalRealm) {
        let (tx_a, rx_a) = mpsc::unbounded_channel();
        let (tx_b, rx_b) = mpsc::unbounded_channel();
        let attached_a = Arc::new(AtomicBool::new(true));
        let attached_b = Arc::new(AtomicBool::new(true));

        let a = LocalRealm {
            origin: origin_a.into(),
            tx: tx_a,
            rx: Mutex::new(rx_b),
            attached: attached_a.clone(),
            peer_attached: attached_b.clone(),
        };
        let b = LocalRealm {
            origin: origin_b.into(),
            tx: tx_b,
            rx: Mutex::new(rx_a),
            attached: attached_b,
            peer_attached: attached_a,
        };
        (a, b)
    }

    /// Marks this side's container as gone; the counterpart's `is_attached`
    /// turns false.
    pub fn detach(&self) {
        self.attached.store(false, Ordering::SeqCst);
    }
}

#[async_trait]
impl Realm for LocalRealm {
    fn post(&self, mut msg: RealmMsg) -> Result<()> {
        if !self.peer_attached.load(Ordering::SeqCst) {
            return Err(Error::Detached);
        }
        msg.origin = self.origin.clone();
        self.tx.send(msg).map_err(|_| Error::Detached)
    }

    async fn recv(&self) -> Option<RealmMsg> {
        self.rx.lock().await.recv().await
    }

    fn origin(&self) -> &str {
        &self.origin
    }

    fn is_attached(&self) -> bool {
        self.peer_attached.load(Ordering::SeqCst)
    }
}
