//! Server-wide shutdown signalling for live connections.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Notify};

/// Tracks live connections and tells them when the server is going away.
#[derive(Clone)]
pub struct ShutdownCoordinator {
    tx: Arc<watch::Sender<bool>>,
    active: Arc<AtomicUsize>,
    drained: Arc<Notify>,
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

/// RAII guard counting one live connection.
pub struct ConnectionGuard {
    active: Arc<AtomicUsize>,
    drained: Arc<Notify>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        if self.active.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.drained.notify_waiters();
        }
    }
}

/// Receiving side of the shutdown signal.
pub struct ShutdownSignal {
    rx: watch::Receiver<bool>,
}

impl ShutdownSignal {
    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve once shutdown has been requested. Pending forever if the
    /// coordinator is dropped without triggering.
    pub async fn triggered(&mut self) {
        if self.rx.wait_for(|v| *v).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self {
            tx: Arc::new(tx),
            active: Arc::new(AtomicUsize::new(0)),
            drained: Arc::new(Notify::new()),
        }
    }

    /// Register a live connection.
    pub fn register(&self) -> (ConnectionGuard, ShutdownSignal) {
        self.active.fetch_add(1, Ordering::AcqRel);
        (
            ConnectionGuard {
                active: self.active.clone(),
                drained: self.drained.clone(),
            },
            ShutdownSignal {
                rx: self.tx.subscribe(),
            },
        )
    }

    pub fn active_count(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    /// Signal every registered connection to close.
    pub fn shutdown(&self) {
        self.tx.send_replace(true);
    }

    /// Wait until every registered connection has dropped its guard, or the
    /// timeout elapses. Returns whether the drain completed.
    pub async fn wait_for_drain(&self, timeout: Duration) -> bool {
        let drain = async {
            loop {
                let notified = self.drained.notified();
                if self.active_count() == 0 {
                    return;
                }
                notified.await;
            }
        };
        tokio::time::timeout(timeout, drain).await.is_ok()
    }
}
