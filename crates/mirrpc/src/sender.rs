//! # Call Sender
//!
//! Promise-correlated invocation: each stub invocation allocates the next
//! `callId`, parks a responder in the rejection pool, sends the call ticket,
//! and awaits the one-shot response. When the tunnel is destroyed every
//! pending entry is rejected and the pool latches, so later invocations fail
//! synchronously without touching the wire.

use std::sync::Arc;
use std::sync::OnceLock;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use dashmap::DashMap;
use tokio::sync::oneshot;

use mirpack::FuncError;
use mirpack::FuncRef;
use mirpack::Value;

use crate::cleanup::CleanupGuard;
use crate::subject::RemoteSubject;
use crate::ticket::CallTicket;
use crate::ticket::DefTicket;

type CallKey = (String, u64);
type Responder = oneshot::Sender<Result<Value, FuncError>>;
type Unsubscriber = Box<dyn FnOnce() + Send + Sync>;

struct PendingCall {
    responder: Responder,
    /// Removes the one-shot respond handler when this entry is settled by a
    /// drain instead of a response.
    unsubscribe: Option<Unsubscriber>,
}

/// Pending responders for in-flight calls, plus the disconnection latch.
///
/// Keyed by the `(fnId, callId)` composite, so responses pair correctly with
/// their own call regardless of delivery order.
pub struct RejectionPool {
    pending: DashMap<CallKey, PendingCall>,
    latched: OnceLock<FuncError>,
}

impl RejectionPool {
    pub fn new() -> Self {
        Self { pending: DashMap::new(), latched: OnceLock::new() }
    }

    /// The disconnection error this pool latched on, if any. Once latched,
    /// every send short-circuits.
    pub fn disconnected(&self) -> Option<&FuncError> {
        self.latched.get()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Parks a responder. The latch is checked again after the insert: an
    /// `abort` draining concurrently either saw the entry and rejected it, or
    /// set the latch first and this rejects it here. Either way the caller is
    /// never stranded in a drained pool.
    pub(crate) fn register(
        &self,
        key: CallKey,
        responder: Responder,
    ) -> Result<(), FuncError> {
        self.pending.insert(key.clone(), PendingCall { responder, unsubscribe: None });
        if let Some(error) = self.latched.get() {
            self.pending.remove(&key);
            return Err(error.clone());
        }
        Ok(())
    }

    /// Hands the entry the remover for its respond handler. `false` means the
    /// entry was already drained out from under the caller.
    fn attach_unsubscriber(&self, key: &CallKey, unsubscribe: Unsubscriber) -> bool {
        match self.pending.get_mut(key) {
            Some(mut entry) => {
                entry.unsubscribe = Some(unsubscribe);
                true
            }
            None => false,
        }
    }

    /// Settles an entry from its response. The one-shot respond handler has
    /// already removed itself by the time this runs.
    fn settle(&self, key: &CallKey) -> Option<Responder> {
        self.pending.remove(key).map(|(_, entry)| entry.responder)
    }

    /// Drops an entry whose call never reached the wire, removing its respond
    /// handler.
    fn discard(&self, key: &CallKey) {
        if let Some((_, entry)) = self.pending.remove(key) {
            if let Some(unsubscribe) = entry.unsubscribe {
                unsubscribe();
            }
        }
    }

    /// Rejects every pending call with `error` and latches the pool. Later
    /// calls on any stub sharing this pool fail immediately with the same
    /// error, without wire traffic. Each drained entry's respond handler is
    /// unsubscribed, so no dead one-shots linger on a surviving emitter.
    pub fn abort(&self, error: FuncError) {
        let _ = self.latched.set(error.clone());
        let keys: Vec<CallKey> = self.pending.iter().map(|entry| entry.key().clone()).collect();
        for key in keys {
            if let Some((_, entry)) = self.pending.remove(&key) {
                if let Some(unsubscribe) = entry.unsubscribe {
                    unsubscribe();
                }
                let _ = entry.responder.send(Err(error.clone()));
            }
        }
    }
}

impl Default for RejectionPool {
    fn default() -> Self {
        Self::new()
    }
}

/// Builds the callable stub for one remote function ticket.
///
/// The stub owns its cleanup guard: when the last clone of the returned
/// `FuncRef` drops, the guard fires and the defining side is told to release
/// its listener.
pub fn make_call_sender(
    ticket: DefTicket,
    subject: Arc<RemoteSubject>,
    pool: Arc<RejectionPool>,
    calls: Arc<AtomicU64>,
    guard: CleanupGuard,
) -> FuncRef {
    FuncRef::named(ticket.fn_id.clone(), move |args: Vec<Value>| {
        // Captured by the closure so the guard lives exactly as long as the
        // stub itself.
        let _stub_scope = &guard;

        let fn_id = ticket.fn_id.clone();
        // The counter is shared by every stub generation for this fnId, so a
        // re-materialized stub never reuses a still-pending (fnId, callId).
        let call_id = calls.fetch_add(1, Ordering::Relaxed);
        let subject = subject.clone();
        let pool = pool.clone();

        async move {
            if let Some(error) = pool.disconnected() {
                return Err(error.clone());
            }

            let call = CallTicket { fn_id: fn_id.clone(), call_id };
            let key: CallKey = (fn_id, call_id);
            let (tx, rx) = oneshot::channel();
            pool.register(key.clone(), tx)?;

            // Subscribe for the answer before the call can possibly arrive.
            let respond_pool = pool.clone();
            let respond_key = key.clone();
            let answer_sub = subject.on_respond(&call, move |settled| {
                if let Some(responder) = respond_pool.settle(&respond_key) {
                    let _ = responder.send(settled);
                }
            });

            let off_subject = subject.clone();
            let off_sub = answer_sub.clone();
            let attached = pool.attach_unsubscriber(
                &key,
                Box::new(move || off_subject.emitter().off(&off_sub)),
            );
            if !attached {
                // Drained between register and subscribe; the responder
                // already carries the abort error.
                subject.emitter().off(&answer_sub);
            } else if let Err(e) = subject.send(&call, &args) {
                pool.discard(&key);
                return Err(send_failure(&pool, e));
            }

            match rx.await {
                Ok(settled) => settled,
                // Responder dropped without settling: the pool was drained
                // out from under us during an abort race.
                Err(_) => Err(pool
                    .disconnected()
                    .cloned()
                    .unwrap_or_else(|| FuncError::disconnection(None))),
            }
        }
    })
}

fn send_failure(pool: &RejectionPool, error: crate::subject::Error) -> FuncError {
    if let Some(latched) = pool.disconnected() {
        return latched.clone();
    }
    match error {
        crate::subject::Error::Emit(crate::emitter::Error::Destroyed(reason)) => {
            FuncError::disconnection(reason)
        }
        crate::subject::Error::Emit(crate::emitter::Error::PortClosed) => {
            FuncError::disconnection(Some("port closed".to_string()))
        }
        other => FuncError::bad_value(other.to_string()),
    }
}
