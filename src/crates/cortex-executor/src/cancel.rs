//! Execution-wide cancellation handle
//!
//! One handle exists per execution. Cancellation is edge-triggered and
//! idempotent; workers observe it at suspension points via [`CancelHandle::cancelled`]
//! in a `select!`, or poll [`CancelHandle::is_cancelled`] before starting
//! work. Delivery to fire-and-forget actions is best-effort.

use std::sync::Arc;
use tokio::sync::watch;

/// Cloneable cancellation signal shared by the controller, the scheduler,
/// and every worker of one execution
#[derive(Clone)]
pub struct CancelHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl CancelHandle {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Signal cancellation. Safe to call any number of times from any
    /// clone.
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves once cancellation has been signalled. Resolves immediately
    /// when it already was.
    pub async fn cancelled(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives at least as long as `self`, so the channel
        // cannot close while we wait.
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }
}

impl Default for CancelHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CancelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelHandle")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}
