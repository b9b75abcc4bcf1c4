//! # Object Simulator
//!
//! Orchestrates the object walker with per-function ticket caches to marshal
//! and unmarshal whole API objects. `simulate` replaces every function leaf
//! with a definition ticket (issuing unique `fnId`s, identity-cached);
//! `materialize` replaces every ticket with a callable stub (cached weakly by
//! `fnId` and wired to the cleanup notifier).
//!
//! All state is per-instance: fnId counters, caches, and the rejection pool
//! belong to this simulator, never to the process.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::OnceLock;
use std::sync::Weak;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use dashmap::DashMap;
use tokio::sync::mpsc;

use mirpack::FuncError;
use mirpack::FuncKey;
use mirpack::FuncRef;
use mirpack::Value;
use mirpack::WeakFuncRef;
use mirpack::envelope;
use mirpack::walk;

use crate::cleanup::CleanupGuard;
use crate::emitter::CONNECTED_EVENT;
use crate::emitter::DISCONNECTED_EVENT;
use crate::emitter::DataEmitter;
use crate::emitter::Subscription;
use crate::receiver::receive_calls;
use crate::receiver::receive_retired;
use crate::sender::RejectionPool;
use crate::sender::make_call_sender;
use crate::subject::Mapper;
use crate::subject::RemoteSubject;
use crate::subject;
use crate::ticket;
use crate::ticket::DefTicket;

struct ReceiverSlot {
    call_sub: Subscription,
    scope_sub: Subscription,
}

/// Marshals local API objects into ticketed trees and remote ticketed trees
/// into live call stubs, over one connection.
pub struct ObjectSimulator {
    subject: Arc<RemoteSubject>,
    pool: Mutex<Arc<RejectionPool>>,
    next_fn: AtomicU64,
    /// Local function identity -> its definition ticket.
    tickets: DashMap<FuncKey, DefTicket>,
    /// Reverse of `tickets`, for cache eviction when a ticket retires.
    owners: DashMap<String, FuncKey>,
    /// Live call-receiver registrations per local `fnId`.
    receivers: DashMap<String, ReceiverSlot>,
    /// Rejecting subscriptions left behind for retired `fnId`s.
    tombstones: DashMap<String, Subscription>,
    /// Remote `fnId` -> stub, held weakly so the cache never keeps a stub
    /// (and therefore its cleanup guard) alive.
    stubs: DashMap<String, WeakFuncRef>,
    /// Remote `fnId` -> its callId sequence, shared across stub generations
    /// so re-materializing a dropped stub never reuses a pending callId.
    call_seqs: DashMap<String, Arc<AtomicU64>>,
    retired_tx: mpsc::UnboundedSender<String>,
    self_ref: OnceLock<Weak<ObjectSimulator>>,
}

impl ObjectSimulator {
    /// Builds a simulator over a connected emitter and wires up the protocol
    /// plumbing: the mapper injection, the cleanup pump, and the
    /// connection-lifecycle handlers.
    pub fn new(emitter: Arc<DataEmitter>) -> Arc<Self> {
        let subject = Arc::new(RemoteSubject::new(emitter.clone()));
        let (retired_tx, retired_rx) = mpsc::unbounded_channel();

        let simulator = Arc::new(Self {
            subject,
            pool: Mutex::new(Arc::new(RejectionPool::new())),
            next_fn: AtomicU64::new(1),
            tickets: DashMap::new(),
            owners: DashMap::new(),
            receivers: DashMap::new(),
            tombstones: DashMap::new(),
            stubs: DashMap::new(),
            call_seqs: DashMap::new(),
            retired_tx,
            self_ref: OnceLock::new(),
        });

        let weak = Arc::downgrade(&simulator);
        let _ = simulator.self_ref.set(weak.clone());
        simulator.subject.bind_mapper(weak.clone() as Weak<dyn Mapper>);

        tokio::spawn(cleanup_pump(weak.clone(), retired_rx));

        let on_disconnect = weak.clone();
        emitter.on(DISCONNECTED_EVENT, move |payload| {
            if let Some(simulator) = on_disconnect.upgrade() {
                simulator.handle_disconnected(subject::disconnect_reason(&payload));
            }
        });

        let on_connect = weak;
        emitter.on(CONNECTED_EVENT, move |_| {
            if let Some(simulator) = on_connect.upgrade() {
                simulator.handle_connected();
            }
        });

        simulator
    }

    pub fn subject(&self) -> &Arc<RemoteSubject> {
        &self.subject
    }

    /// Announces disconnection to the peer and tears the connection down.
    pub fn disconnect(&self, reason: Option<String>) {
        self.subject.disconnect(reason);
    }

    /// Walks a local API object, replacing every function leaf with its
    /// envelope-wrapped definition ticket. Unticketable values abort the
    /// whole call; nothing is partially registered in that case that a later
    /// retire would not clean up.
    pub fn simulate(&self, value: &Value) -> mirpack::Result<Value> {
        walk(value, &mut |node| match node {
            Value::Function(function) => {
                let def = self.issue_ticket(function)?;
                Ok(Some(ticket_value(&def)?))
            }
            _ => Ok(None),
        })
    }

    /// Walks a ticketed object, replacing every envelope-wrapped definition
    /// ticket with a callable stub. Stubs are identity-cached per `fnId`:
    /// repeated references to one ticket yield one stub.
    pub fn materialize(&self, value: &Value) -> mirpack::Result<Value> {
        walk(value, &mut |node| {
            let Some(body) = envelope::unwrap_value(node) else {
                return Ok(None);
            };
            let fn_id = body
                .get("fnId")
                .and_then(Value::as_str)
                .ok_or_else(|| mirpack::Error::BadValue("envelope without a ticket".to_string()))?;
            Ok(Some(Value::Function(self.stub_for(fn_id))))
        })
    }

    fn issue_ticket(&self, function: &FuncRef) -> mirpack::Result<DefTicket> {
        if let Some(existing) = self.tickets.get(&function.key()) {
            return Ok(existing.clone());
        }

        let counter = self.next_fn.fetch_add(1, Ordering::Relaxed);
        let fn_id = format!("{}_{}", function.name().unwrap_or("anonymous"), counter);
        let def = DefTicket::new(fn_id.clone());

        let call_sub = receive_calls(function.clone(), &def, &self.subject);
        let on_retire = self.weak_self();
        let retired_id = fn_id.clone();
        let scope_sub = self.subject.on_out_of_scope(&def, move || {
            if let Some(simulator) = on_retire.upgrade() {
                simulator.retire(&retired_id);
            }
        });

        self.tickets.insert(function.key(), def.clone());
        self.owners.insert(fn_id.clone(), function.key());
        self.receivers.insert(fn_id, ReceiverSlot { call_sub, scope_sub });
        Ok(def)
    }

    fn stub_for(&self, fn_id: &str) -> FuncRef {
        if let Some(cached) = self.stubs.get(fn_id) {
            if let Some(stub) = cached.upgrade() {
                return stub;
            }
        }

        let calls = self
            .call_seqs
            .entry(fn_id.to_string())
            .or_insert_with(|| Arc::new(AtomicU64::new(1)))
            .clone();
        let guard = CleanupGuard::new(fn_id.to_string(), self.retired_tx.clone());
        let stub = make_call_sender(
            DefTicket::new(fn_id),
            self.subject.clone(),
            self.current_pool(),
            calls,
            guard,
        );
        self.stubs.insert(fn_id.to_string(), stub.downgrade());
        stub
    }

    /// The defining side's reaction to a cleanup ticket: stop serving calls
    /// for `fn_id`, leave a rejecting tombstone so late calls fail loudly,
    /// and evict the identity cache so re-simulating the same function issues
    /// a fresh ticket.
    fn retire(&self, fn_id: &str) {
        if let Some((_, slot)) = self.receivers.remove(fn_id) {
            let emitter = self.subject.emitter();
            emitter.off(&slot.call_sub);
            emitter.off(&slot.scope_sub);
            let tombstone = receive_retired(&DefTicket::new(fn_id), &self.subject);
            self.tombstones.insert(fn_id.to_string(), tombstone);
            tracing::debug!(fn_id, "function ticket retired");
        }
        if let Some((_, key)) = self.owners.remove(fn_id) {
            self.tickets.remove(&key);
        }
    }

    fn handle_disconnected(&self, reason: Option<String>) {
        self.current_pool().abort(FuncError::disconnection(reason));
        self.clear_registrations();
    }

    /// A connect after the first means the remote realm reloaded: every
    /// ticket either side issued is invalid. Old stubs must fail, never
    /// silently no-op, so the old pool latches with a reload error and a
    /// fresh pool takes its place for stubs minted after the reload.
    fn handle_connected(&self) {
        if self.subject.emitter().connect_count() <= 1 {
            return;
        }
        let fresh = Arc::new(RejectionPool::new());
        let stale = {
            let mut guard = lock(&self.pool);
            std::mem::replace(&mut *guard, fresh)
        };
        stale.abort(FuncError::disconnection(Some("remote realm reloaded".to_string())));
        self.clear_registrations();
    }

    fn clear_registrations(&self) {
        let emitter = self.subject.emitter();
        let fn_ids: Vec<String> = self.receivers.iter().map(|entry| entry.key().clone()).collect();
        for fn_id in fn_ids {
            if let Some((_, slot)) = self.receivers.remove(&fn_id) {
                emitter.off(&slot.call_sub);
                emitter.off(&slot.scope_sub);
            }
        }
        let tomb_ids: Vec<String> = self.tombstones.iter().map(|entry| entry.key().clone()).collect();
        for fn_id in tomb_ids {
            if let Some((_, sub)) = self.tombstones.remove(&fn_id) {
                emitter.off(&sub);
            }
        }
        self.tickets.clear();
        self.owners.clear();
        self.stubs.clear();
        self.call_seqs.clear();
    }

    fn current_pool(&self) -> Arc<RejectionPool> {
        lock(&self.pool).clone()
    }

    /// Pending in-flight calls, for diagnostics.
    pub fn pending_calls(&self) -> usize {
        self.current_pool().pending_count()
    }

    fn weak_self(&self) -> Weak<ObjectSimulator> {
        self.self_ref.get().cloned().unwrap_or_default()
    }
}

impl Mapper for ObjectSimulator {
    fn marshal(&self, value: &Value) -> mirpack::Result<Value> {
        self.simulate(value)
    }

    fn unmarshal(&self, value: &Value) -> mirpack::Result<Value> {
        self.materialize(value)
    }
}

fn ticket_value(def: &DefTicket) -> mirpack::Result<Value> {
    let sealed = ticket::seal(def).map_err(|e| mirpack::Error::BadValue(e.to_string()))?;
    Ok(Value::from_json(&sealed))
}

/// Receives `fnId`s whose stubs became unreachable and forwards the cleanup
/// ticket to the defining side.
async fn cleanup_pump(
    simulator: Weak<ObjectSimulator>,
    mut retired_rx: mpsc::UnboundedReceiver<String>,
) {
    while let Some(fn_id) = retired_rx.recv().await {
        let Some(simulator) = simulator.upgrade() else {
            return;
        };
        simulator.stubs.remove(&fn_id);
        if let Err(e) = simulator.subject.notify_cleanup(&fn_id) {
            // Normal during teardown: the emitter is already destroyed.
            tracing::debug!(fn_id = %fn_id, error = %e, "cleanup ticket not delivered");
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
