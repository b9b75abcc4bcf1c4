//! # Connection Orchestration
//!
//! Runs a tunnel role, builds the simulator over the connected emitter, and
//! exchanges API trees: each side announces its simulated local API on every
//! (re)connection and materializes the peer's. On reconnection the fresh peer
//! tree replaces the root in place, so path-based callers never notice the
//! reload.

use std::fmt;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::Weak;

use dashmap::DashMap;

use mirpack::Value;
use mirrpc::CONNECTED_EVENT;
use mirrpc::DataEmitter;
use mirrpc::ObjectSimulator;
use mirrpc::task;

use crate::path::RemotePath;
use crate::realm::Realm;
use crate::tunnel;
use crate::tunnel::Tunnel;
use crate::tunnel::TunnelConfig;

/// Event carrying each side's simulated API tree.
pub const API_EVENT: &str = "api";

#[derive(Debug, Clone)]
pub enum Error {
    Tunnel(tunnel::Error),
    /// The peer's API never arrived.
    ExchangeTimeout { ms: u64 },
    /// The connection fell apart during the API exchange.
    Exchange(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tunnel(e) => write!(f, "{}", e),
            Self::ExchangeTimeout { ms } => write!(f, "api exchange timed out after {}ms", ms),
            Self::Exchange(detail) => write!(f, "api exchange failed: {}", detail),
        }
    }
}

impl std::error::Error for Error {}

impl From<tunnel::Error> for Error {
    fn from(e: tunnel::Error) -> Self {
        Self::Tunnel(e)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Per-connection key/value store handed to the layers above. Local only; it
/// is never synchronized over the wire.
#[derive(Clone, Default)]
pub struct SharedContext {
    inner: Arc<DashMap<String, Value>>,
}

impl SharedContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, key: impl Into<String>, value: Value) {
        self.inner.insert(key.into(), value);
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.inner.get(key).map(|entry| entry.value().clone())
    }

    pub fn remove(&self, key: &str) -> Option<Value> {
        self.inner.remove(key).map(|(_, value)| value)
    }
}

/// One established cross-realm connection.
pub struct Connection {
    simulator: Arc<ObjectSimulator>,
    emitter: Arc<DataEmitter>,
    remote_root: Arc<Mutex<Value>>,
    context: SharedContext,
}

impl Connection {
    /// The live dispatch root over the peer's API.
    pub fn remote(&self) -> RemotePath {
        RemotePath::root(self.remote_root.clone())
    }

    pub fn context(&self) -> SharedContext {
        self.context.clone()
    }

    pub fn emitter(&self) -> &Arc<DataEmitter> {
        &self.emitter
    }

    pub fn pending_calls(&self) -> usize {
        self.simulator.pending_calls()
    }

    pub fn is_destroyed(&self) -> bool {
        self.emitter.is_destroyed()
    }

    /// Announces disconnection to the peer and tears the connection down.
    pub fn destroy(&self, reason: Option<String>) {
        self.simulator.disconnect(reason);
    }
}

/// Connects to an embedded child realm: listener role.
pub async fn connect_to_child(
    realm: Arc<dyn Realm>,
    local_api: Value,
    config: TunnelConfig,
) -> Result<Connection> {
    connect(realm, local_api, config, Role::Listener).await
}

/// Connects to the embedding parent realm: initiator role.
pub async fn connect_to_parent(
    realm: Arc<dyn Realm>,
    local_api: Value,
    config: TunnelConfig,
) -> Result<Connection> {
    connect(realm, local_api, config, Role::Initiator).await
}

enum Role {
    Initiator,
    Listener,
}

async fn connect(
    realm: Arc<dyn Realm>,
    local_api: Value,
    config: TunnelConfig,
    role: Role,
) -> Result<Connection> {
    let timeout_ms = config.timeout_ms;
    let tunnel = Tunnel::new(config);
    let emitter = tunnel.emitter();
    let simulator = ObjectSimulator::new(emitter.clone());
    let remote_root = Arc::new(Mutex::new(Value::Null));

    // Both exchange handlers are registered before the tunnel can connect,
    // so the peer's announcement cannot slip past us.
    let (api_resolver, first_api) = task::defer::<()>();
    receive_remote_api(&emitter, &simulator, &remote_root, api_resolver);
    announce_local_api(&emitter, &simulator, local_api);

    match role {
        Role::Initiator => tunnel.offer(realm).await?,
        Role::Listener => tunnel.listen(realm).await?,
    };

    let exchange_emitter = emitter.clone();
    let settled = task::timeout_future("api exchange", first_api, timeout_ms, move || {
        exchange_emitter.destroy(Some("api exchange timed out".to_string()));
    })
    .await;
    match settled {
        Ok(Ok(())) => {}
        Ok(Err(e)) => return Err(Error::Exchange(e.to_string())),
        Err(_) => return Err(Error::ExchangeTimeout { ms: timeout_ms }),
    }

    Ok(Connection {
        simulator,
        emitter,
        remote_root,
        context: SharedContext::new(),
    })
}

/// Materializes every peer announcement into the shared root. The first one
/// settles the exchange; later ones (reloads) replace the root in place.
fn receive_remote_api(
    emitter: &Arc<DataEmitter>,
    simulator: &Arc<ObjectSimulator>,
    remote_root: &Arc<Mutex<Value>>,
    resolver: task::DeferResolver<()>,
) {
    let simulator = Arc::downgrade(simulator);
    let remote_root = remote_root.clone();
    let resolver = Mutex::new(Some(resolver));
    emitter.on(API_EVENT, move |payload| {
        let Some(simulator) = simulator.upgrade() else { return };
        match simulator.materialize(&payload) {
            Ok(tree) => {
                *lock(&remote_root) = tree;
                if let Some(r) = take(&resolver) {
                    r.resolve(());
                }
            }
            Err(e) => tracing::warn!(error = %e, "dropping bad remote api announcement"),
        }
    });
}

/// Announces the simulated local API on every connection. The simulator's
/// own reconnection handler runs first (registration order) and clears its
/// caches, so a reload re-simulates from scratch.
fn announce_local_api(
    emitter: &Arc<DataEmitter>,
    simulator: &Arc<ObjectSimulator>,
    local_api: Value,
) {
    let simulator = Arc::downgrade(simulator);
    let announce: Weak<DataEmitter> = Arc::downgrade(emitter);
    emitter.on(CONNECTED_EVENT, move |_| {
        let (Some(simulator), Some(emitter)) = (simulator.upgrade(), announce.upgrade()) else {
            return;
        };
        let tree = match simulator.simulate(&local_api) {
            Ok(tree) => tree,
            Err(e) => {
                tracing::warn!(error = %e, "local api did not simulate");
                return;
            }
        };
        let json = match tree.to_json() {
            Ok(json) => json,
            Err(e) => {
                tracing::warn!(error = %e, "simulated api did not encode");
                return;
            }
        };
        if let Err(e) = emitter.emit_json(API_EVENT, json) {
            tracing::warn!(error = %e, "api announcement not delivered");
        }
    });
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn take<T>(slot: &Mutex<Option<T>>) -> Option<T> {
    match slot.lock() {
        Ok(mut guard) => guard.take(),
        Err(poisoned) => poisoned.into_inner().take(),
    }
}
