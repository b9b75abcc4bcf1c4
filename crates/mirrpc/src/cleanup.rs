//! # Cleanup Notifier
//!
//! Bridges stub reachability to the protocol. Every call-sender stub owns a
//! guard holding its `fnId`; when the last clone of the stub drops, the
//! guard's `Drop` delivers the `fnId` to the simulator's cleanup pump, which
//! sends the cleanup ticket so the defining side can release its listener.
//!
//! Dropping is deterministic, which is what makes this path testable; the
//! wire contract (a cleanup ticket keyed by `fnId`) does not depend on the
//! mechanism.

use std::mem;

use tokio::sync::mpsc;

/// Fires once, on drop, with the `fnId` it was created for.
pub struct CleanupGuard {
    fn_id: String,
    retired: mpsc::UnboundedSender<String>,
}

impl CleanupGuard {
    pub fn new(fn_id: String, retired: mpsc::UnboundedSender<String>) -> Self {
        Self { fn_id, retired }
    }

    pub fn fn_id(&self) -> &str {
        &self.fn_id
    }
}

impl Drop for CleanupGuard {
    fn drop(&mut self) {
        // The pump may already be gone during teardown; that is fine.
        let _ = self.retired.send(mem::take(&mut self.fn_id));
    }
}
