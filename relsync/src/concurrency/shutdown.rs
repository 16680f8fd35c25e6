//! Cooperative shutdown signaling.
//!
//! A single broadcast channel notifies every worker that the run should stop.
//! Workers poll [`ShutdownRx::is_triggered`] at page and item boundaries,
//! the only points where stopping is safe, so an operator-initiated abort
//! takes effect promptly instead of blocking on in-flight network calls.

use tokio::sync::watch;

/// Transmitter side of the shutdown channel.
#[derive(Debug, Clone)]
pub struct ShutdownTx(watch::Sender<bool>);

impl ShutdownTx {
    /// Requests the run to shut down.
    ///
    /// Idempotent; repeated calls are harmless.
    pub fn shutdown(&self) {
        // send_replace works even when no receiver is currently subscribed.
        self.0.send_replace(true);
    }

    /// Creates a new receiver subscription.
    pub fn subscribe(&self) -> ShutdownRx {
        ShutdownRx(self.0.subscribe())
    }
}

/// Receiver side of the shutdown channel.
#[derive(Debug, Clone)]
pub struct ShutdownRx(watch::Receiver<bool>);

impl ShutdownRx {
    /// Returns `true` once shutdown has been requested.
    pub fn is_triggered(&self) -> bool {
        *self.0.borrow()
    }

    /// Waits until shutdown is requested.
    pub async fn triggered(&mut self) {
        // An error means the sender is gone, which we treat as shutdown.
        while !*self.0.borrow_and_update() {
            if self.0.changed().await.is_err() {
                return;
            }
        }
    }
}

/// Creates a new shutdown channel.
pub fn create_shutdown_channel() -> (ShutdownTx, ShutdownRx) {
    let (tx, rx) = watch::channel(false);
    (ShutdownTx(tx), ShutdownRx(rx))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn trigger_is_observed_by_all_subscribers() {
        let (tx, rx) = create_shutdown_channel();
        let mut late = tx.subscribe();

        assert!(!rx.is_triggered());

        tx.shutdown();

        assert!(rx.is_triggered());
        late.triggered().await;
    }
}
