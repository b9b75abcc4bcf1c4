//! # Call Receiver
//!
//! The defining side of a function ticket: serves incoming call tickets by
//! invoking the local function and answering with a resolve or reject ticket.
//! Errors thrown by the local function are recovered here only to be
//! re-signaled remotely, never swallowed.

use std::sync::Arc;

use mirpack::FuncError;
use mirpack::FuncRef;

use crate::emitter::Subscription;
use crate::subject::RemoteSubject;
use crate::ticket::DefTicket;

/// Subscribes persistently to call tickets for `ticket`, serving each one
/// with `function`. The returned subscription is the cleanup path's handle.
pub fn receive_calls(
    function: FuncRef,
    ticket: &DefTicket,
    subject: &Arc<RemoteSubject>,
) -> Subscription {
    let respond_subject = subject.clone();
    subject.on_call(ticket, move |call, args| {
        let function = function.clone();
        let subject = respond_subject.clone();
        tokio::spawn(async move {
            let outcome = function.call(args).await;
            if let Err(e) = subject.respond(&call, outcome) {
                tracing::warn!(
                    fn_id = %call.fn_id,
                    call_id = call.call_id,
                    error = %e,
                    "response not delivered",
                );
            }
        });
    })
}

/// Tombstone for a retired ticket: rejects late calls instead of letting
/// them hang or silently reach a released function.
pub fn receive_retired(ticket: &DefTicket, subject: &Arc<RemoteSubject>) -> Subscription {
    let respond_subject = subject.clone();
    let fn_id = ticket.fn_id.clone();
    subject.on_call(ticket, move |call, _args| {
        if let Err(e) = respond_subject.respond(&call, Err(FuncError::retired(&fn_id))) {
            tracing::debug!(fn_id = %call.fn_id, error = %e, "late-call rejection not delivered");
        }
    })
}
