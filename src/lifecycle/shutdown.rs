//! Shutdown coordination for the server.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::broadcast;

/// Coordinator for graceful shutdown.
///
/// Provides a broadcast channel that the accept loop and every connection task
/// subscribe to.
#[derive(Clone)]
pub struct Shutdown {
    /// Broadcast channel sender.
    tx: broadcast::Sender<()>,
    /// Set before the broadcast so late subscribers still observe it.
    fired: Arc<AtomicBool>,
}

impl Shutdown {
    /// Create a new shutdown coordinator.
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(1);
        Self {
            tx,
            fired: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Subscribe to the shutdown signal.
    pub fn subscribe(&self) -> ShutdownSignal {
        ShutdownSignal {
            rx: self.tx.subscribe(),
            fired: Arc::clone(&self.fired),
        }
    }

    /// Trigger the shutdown signal.
    pub fn trigger(&self) {
        self.fired.store(true, Ordering::SeqCst);
        let _ = self.tx.send(());
    }

    /// Whether shutdown has been triggered.
    pub fn is_triggered(&self) -> bool {
        self.fired.load(Ordering::SeqCst)
    }

    /// Get the number of active subscribers (tasks still running).
    pub fn receiver_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Shutdown {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Shutdown")
            .field("triggered", &self.is_triggered())
            .field("subscribers", &self.receiver_count())
            .finish()
    }
}

/// One task's view of the shutdown signal.
#[derive(Debug)]
pub struct ShutdownSignal {
    rx: broadcast::Receiver<()>,
    fired: Arc<AtomicBool>,
}

impl ShutdownSignal {
    /// Whether shutdown has been triggered.
    pub fn is_triggered(&self) -> bool {
        self.fired.load(Ordering::SeqCst)
    }

    /// Wait until shutdown is triggered. Returns immediately once it has fired.
    ///
    /// Cancel-safe: it can sit in a `select!` branch that loses every time.
    /// If the coordinator is dropped without triggering, this never returns.
    pub async fn wait(&mut self) {
        loop {
            if self.is_triggered() {
                return;
            }
            match self.rx.recv().await {
                Ok(()) => return,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => {
                    if self.is_triggered() {
                        return;
                    }
                    std::future::pending::<()>().await;
                }
            }
        }
    }
}

impl Clone for ShutdownSignal {
    fn clone(&self) -> Self {
        Self {
            rx: self.rx.resubscribe(),
            fired: Arc::clone(&self.fired),
        }
    }
}
