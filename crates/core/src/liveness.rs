//! Shared active/stopped flag used to fence off work scheduled before a teardown.
//!
//! Capture callbacks, permission requests and recomputation loops check the flag
//! before committing a result or rescheduling themselves.

use std::sync::Arc;
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    Active,
    Stopped,
}

/// Cloneable handle over a single [`Liveness`] value. Once stopped it stays stopped.
#[derive(Debug, Clone)]
pub struct LivenessFlag {
    tx: Arc<watch::Sender<Liveness>>,
}

impl LivenessFlag {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(Liveness::Active);
        Self { tx: Arc::new(tx) }
    }

    pub fn get(&self) -> Liveness {
        *self.tx.borrow()
    }

    pub fn is_active(&self) -> bool {
        self.get() == Liveness::Active
    }

    /// Marks the flag stopped and wakes every waiter. Idempotent.
    pub fn stop(&self) {
        self.tx.send_replace(Liveness::Stopped);
    }

    /// Resolves once the flag has been stopped.
    pub async fn stopped(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives as long as `self`, so this cannot observe a closed channel.
        let _ = rx.wait_for(|l| *l == Liveness::Stopped).await;
    }
}

impl Default for LivenessFlag {
    fn default() -> Self {
        Self::new()
    }
}
