//! # Future Utilities
//!
//! Timed, cancellable asynchronous waits used by every other component:
//! plain sleeps, externally-settled futures, and timeout races that run a
//! cleanup before the caller can observe the rejection.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::task::Context;
use std::task::Poll;
use std::time::Duration;

use tokio::sync::oneshot;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The resolver was dropped without settling the deferred value.
    Abandoned,
    /// The operation did not settle within its budget.
    TimeoutExpired { label: String, ms: u64 },
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Abandoned => write!(f, "deferred value abandoned before resolution"),
            Self::TimeoutExpired { label, ms } => {
                write!(f, "'{}' timed out after {}ms", label, ms)
            }
        }
    }
}

impl std::error::Error for Error {}

pub type Result<T> = std::result::Result<T, Error>;

/// Sleeps for `ms` milliseconds.
pub async fn wait(ms: u64) {
    tokio::time::sleep(Duration::from_millis(ms)).await;
}

/// The settle side of a [`defer`] pair. Consuming; the first settle wins.
pub struct DeferResolver<T> {
    tx: oneshot::Sender<T>,
}

impl<T> DeferResolver<T> {
    pub fn resolve(self, value: T) {
        let _ = self.tx.send(value);
    }
}

/// The await side of a [`defer`] pair.
pub struct Deferred<T> {
    rx: oneshot::Receiver<T>,
}

impl<T> Future for Deferred<T> {
    type Output = Result<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx).poll(cx).map(|settled| settled.map_err(|_| Error::Abandoned))
    }
}

/// Creates an externally-settled future.
pub fn defer<T>() -> (DeferResolver<T>, Deferred<T>) {
    let (tx, rx) = oneshot::channel();
    (DeferResolver { tx }, Deferred { rx })
}

/// Races `fut` against a timer. On timeout, `on_timeout` runs *before* the
/// returned error can be observed, so teardown (e.g. aborting a tunnel
/// attempt) is complete by the time the caller sees the rejection.
pub async fn timeout_future<T, F, C>(label: &str, fut: F, ms: u64, on_timeout: C) -> Result<T>
where
    F: Future<Output = T>,
    C: FnOnce(),
{
    match tokio::time::timeout(Duration::from_millis(ms), fut).await {
        Ok(value) => Ok(value),
        Err(_) => {
            on_timeout();
            Err(Error::TimeoutExpired { label: label.to_string(), ms })
        }
    }
}
