//! # Tunnel
//!
//! The handshake state machine that turns two realms into one connected
//! emitter. The initiator offers a random key at a fixed interval until an
//! accept carrying a dedicated port arrives or the timeout elapses; the
//! listener answers valid offers with a fresh port pair and keeps serving
//! later offers so a reloaded counterpart reconnects transparently.
//!
//! ## Invariants
//! - Malformed or wrong-origin handshake traffic is logged and ignored; it
//!   never advances the state machine and never resets the timeout clock.
//! - Version mismatches warn once per distinct remote version string and
//!   never block the connection.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use rand::Rng;

use mirrpc::DataEmitter;
use mirrpc::Port;
use mirrpc::task;
use mirrpc::ticket;
use mirrpc::ticket::HandshakeAccepted;
use mirrpc::ticket::HandshakeOffered;

use crate::realm;
use crate::realm::Origin;
use crate::realm::Realm;
use crate::realm::RealmMsg;

pub const PROTOCOL_VERSION: &str = "1.0.0";

/// Length of the random base-36 key identifying one handshake attempt.
pub const HANDSHAKE_KEY_LEN: usize = 6;

#[derive(Debug, Clone)]
pub enum Error {
    /// No counterpart answered within the configured budget.
    Timeout { ms: u64 },
    /// The counterpart realm is gone.
    Detached,
    /// The tunnel was destroyed before it could connect.
    Destroyed,
    /// A handshake message could not be posted.
    Post(realm::Error),
    /// A handshake ticket did not encode.
    Handshake(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout { ms } => write!(f, "handshake timed out after {}ms", ms),
            Self::Detached => write!(f, "counterpart realm detached"),
            Self::Destroyed => write!(f, "tunnel destroyed"),
            Self::Post(e) => write!(f, "handshake post failed: {}", e),
            Self::Handshake(detail) => write!(f, "handshake encoding failed: {}", detail),
        }
    }
}

impl std::error::Error for Error {}

impl From<realm::Error> for Error {
    fn from(e: realm::Error) -> Self {
        Self::Post(e)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone)]
pub struct TunnelConfig {
    pub target_origin: Origin,
    pub timeout_ms: u64,
    pub retry_interval_ms: u64,
    pub liveness_interval_ms: u64,
    pub version: String,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            target_origin: Origin::Any,
            timeout_ms: 10_000,
            retry_interval_ms: 500,
            liveness_interval_ms: 500,
            version: PROTOCOL_VERSION.to_string(),
        }
    }
}

/// One pairing attempt between two realms. Owns the emitter the connection
/// layer builds on; connecting and reconnecting both go through it.
pub struct Tunnel {
    config: TunnelConfig,
    emitter: Arc<DataEmitter>,
    /// Remote version strings already warned about.
    warned_versions: DashMap<String, ()>,
}

impl Tunnel {
    pub fn new(config: TunnelConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            emitter: Arc::new(DataEmitter::new()),
            warned_versions: DashMap::new(),
        })
    }

    pub fn emitter(&self) -> Arc<DataEmitter> {
        self.emitter.clone()
    }

    pub fn config(&self) -> &TunnelConfig {
        &self.config
    }

    pub fn destroy(&self, reason: Option<String>) {
        self.emitter.destroy(reason);
    }

    /// Initiator role: offers a fresh key until the counterpart accepts with
    /// a dedicated port, or the timeout elapses. On timeout the attempt is
    /// torn down before the error is observable.
    pub async fn offer(self: &Arc<Self>, realm: Arc<dyn Realm>) -> Result<Arc<DataEmitter>> {
        let key = handshake_key();
        let emitter = self.emitter.clone();
        let attempt = self.run_offer(realm, &key);
        match task::timeout_future("tunnel offer", attempt, self.config.timeout_ms, move || {
            emitter.destroy(None);
        })
        .await
        {
            Ok(connected) => connected,
            Err(_) => Err(Error::Timeout { ms: self.config.timeout_ms }),
        }
    }

    async fn run_offer(&self, realm: Arc<dyn Realm>, key: &str) -> Result<Arc<DataEmitter>> {
        let offer = ticket::seal(&HandshakeOffered {
            offers: key.to_string(),
            version: self.config.version.clone(),
        })
        .map_err(|e| Error::Handshake(e.to_string()))?;

        let mut ticker =
            tokio::time::interval(Duration::from_millis(self.config.retry_interval_ms));
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    realm.post(RealmMsg::new(offer.clone()))?;
                    tracing::debug!(key, "handshake offer posted");
                }
                msg = realm.recv() => {
                    let Some(mut msg) = msg else { return Err(Error::Detached) };
                    if let Some(port) = self.match_accept(&mut msg, key) {
                        self.emitter.connect(port);
                        tracing::debug!(origin = %msg.origin, "tunnel connected");
                        return Ok(self.emitter.clone());
                    }
                }
            }
        }
    }

    fn match_accept(&self, msg: &mut RealmMsg, key: &str) -> Option<Port> {
        if !self.config.target_origin.accepts(&msg.origin) {
            tracing::warn!(origin = %msg.origin, "handshake message from unexpected origin ignored");
            return None;
        }
        let accept = match ticket::open::<HandshakeAccepted>(&msg.data) {
            Ok(accept) => accept,
            Err(e) => {
                tracing::debug!(error = %e, "non-accept message during offer ignored");
                return None;
            }
        };
        self.note_remote_version(&accept.version);
        if accept.accepts != key {
            tracing::warn!(accepts = %accept.accepts, "accept for a stale key ignored");
            return None;
        }
        match msg.port.take() {
            Some(port) => Some(port),
            None => {
                tracing::warn!("accept without a transferred port ignored");
                None
            }
        }
    }

    /// Listener role: answers valid offers with a fresh port pair. Resolves
    /// on the first connection; the loop keeps serving later offers so a
    /// reloaded counterpart reconnects the same emitter. Polls counterpart
    /// liveness; a vanished counterpart aborts (if connected) or cleanly
    /// destroys (if not).
    pub async fn listen(self: &Arc<Self>, realm: Arc<dyn Realm>) -> Result<Arc<DataEmitter>> {
        let (resolver, first) = task::defer::<Result<()>>();
        let server = tokio::spawn(listen_loop(self.clone(), realm, resolver));
        let emitter = self.emitter.clone();

        let settled = task::timeout_future("tunnel listen", first, self.config.timeout_ms, move || {
            server.abort();
            emitter.destroy(None);
        })
        .await;

        match settled {
            Ok(Ok(Ok(()))) => Ok(self.emitter.clone()),
            Ok(Ok(Err(e))) => Err(e),
            Ok(Err(_)) => Err(Error::Destroyed),
            Err(_) => Err(Error::Timeout { ms: self.config.timeout_ms }),
        }
    }

    fn match_offer(&self, msg: &RealmMsg) -> Option<HandshakeOffered> {
        if !self.config.target_origin.accepts(&msg.origin) {
            tracing::warn!(origin = %msg.origin, "handshake message from unexpected origin ignored");
            return None;
        }
        let offer = match ticket::open::<HandshakeOffered>(&msg.data) {
            Ok(offer) => offer,
            Err(e) => {
                tracing::debug!(error = %e, "non-offer message while listening ignored");
                return None;
            }
        };
        self.note_remote_version(&offer.version);
        Some(offer)
    }

    /// Compares the remote protocol version against the local one. Patch
    /// differences are silently compatible; anything else (including
    /// unparseable strings) warns once per distinct remote version. Returns
    /// whether a new warning was recorded.
    pub(crate) fn note_remote_version(&self, remote: &str) -> bool {
        let compatible = match (
            semver::Version::parse(&self.config.version),
            semver::Version::parse(remote),
        ) {
            (Ok(local), Ok(remote)) => local.major == remote.major && local.minor == remote.minor,
            _ => false,
        };
        if compatible {
            return false;
        }
        if self.warned_versions.insert(remote.to_string(), ()).is_some() {
            return false;
        }
        tracing::warn!(
            local = %self.config.version,
            remote = %remote,
            "protocol version mismatch",
        );
        true
    }

    pub fn reset_version_warnings(&self) {
        self.warned_versions.clear();
    }
}

async fn listen_loop(
    tunnel: Arc<Tunnel>,
    realm: Arc<dyn Realm>,
    resolver: task::DeferResolver<Result<()>>,
) {
    let mut resolver = Some(resolver);
    let mut liveness =
        tokio::time::interval(Duration::from_millis(tunnel.config.liveness_interval_ms));

    loop {
        tokio::select! {
            _ = liveness.tick() => {
                if !realm.is_attached() {
                    if tunnel.emitter.connect_count() > 0 {
                        tunnel.emitter.destroy(Some("counterpart realm detached".to_string()));
                    } else {
                        tunnel.emitter.destroy(None);
                    }
                    if let Some(r) = resolver.take() {
                        r.resolve(Err(Error::Detached));
                    }
                    return;
                }
            }
            msg = realm.recv() => {
                let Some(msg) = msg else {
                    tunnel.emitter.destroy(None);
                    if let Some(r) = resolver.take() {
                        r.resolve(Err(Error::Detached));
                    }
                    return;
                };
                if tunnel.emitter.is_destroyed() {
                    return;
                }
                let Some(offer) = tunnel.match_offer(&msg) else { continue };

                let (kept, transferred) = Port::pair();
                let accept = match ticket::seal(&HandshakeAccepted {
                    accepts: offer.offers.clone(),
                    version: tunnel.config.version.clone(),
                }) {
                    Ok(accept) => accept,
                    Err(e) => {
                        tracing::warn!(error = %e, "accept did not encode");
                        continue;
                    }
                };
                if let Err(e) = realm.post(RealmMsg::with_port(accept, transferred)) {
                    tunnel.emitter.destroy(Some(e.to_string()));
                    if let Some(r) = resolver.take() {
                        r.resolve(Err(Error::Post(e)));
                    }
                    return;
                }
                tunnel.emitter.connect(kept);
                tracing::debug!(origin = %msg.origin, "tunnel connected");
                if let Some(r) = resolver.take() {
                    r.resolve(Ok(()));
                }
            }
        }
    }
}

pub(crate) fn handshake_key() -> String {
    const ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    let mut rng = rand::thread_rng();
    (0..HANDSHAKE_KEY_LEN)
        .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
        .collect()
}
