//! Shutdown coordination.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::broadcast;

use crate::net::connection::ConnectionTracker;

/// Broadcasts the stop signal to every accept loop, then drains.
pub struct Shutdown {
    tx: broadcast::Sender<()>,
    triggered: AtomicBool,
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(1);
        Self {
            tx,
            triggered: AtomicBool::new(false),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.tx.subscribe()
    }

    /// Stop accepting. Idempotent.
    pub fn trigger(&self) {
        if !self.triggered.swap(true, Ordering::SeqCst) {
            let _ = self.tx.send(());
        }
    }

    pub fn is_triggered(&self) -> bool {
        self.triggered.load(Ordering::SeqCst)
    }

    /// Number of accept loops still listening.
    pub fn receiver_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Trigger, then wait up to `deadline` for tracked connections to finish.
    /// Returns `false` when connections were still open at the deadline.
    pub async fn drain(&self, tracker: &ConnectionTracker, deadline: Duration) -> bool {
        self.trigger();
        tracing::info!(
            active = tracker.active_count(),
            deadline_secs = deadline.as_secs(),
            "Draining connections"
        );
        let drained = tracker.drain(deadline).await;
        if !drained {
            tracing::warn!(remaining = tracker.active_count(), "Drain deadline reached");
        }
        drained
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}
