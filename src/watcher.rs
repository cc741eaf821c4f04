//! # Stage Lifecycle Watcher
//!
//! Coordinates shutdown between a long-lived stage loop and whoever owns it.
//! The owner raises the close signal; the loop observes it in its `select!`,
//! exits, and acknowledges with [`Watcher::mark_closed`]. The owner's
//! [`Watcher::shutdown`] returns once the acknowledgement arrives or the
//! timeout elapses.

use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[derive(Debug)]
pub struct Watcher {
    name: String,
    close: CancellationToken,
    closed_tx: watch::Sender<bool>,
}

impl Watcher {
    pub fn new(name: impl Into<String>) -> Self {
        let (closed_tx, _) = watch::channel(false);
        Self {
            name: name.into(),
            close: CancellationToken::new(),
            closed_tx,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Signal observed by the stage loop.
    pub fn close_signal(&self) -> CancellationToken {
        self.close.clone()
    }

    pub fn is_closing(&self) -> bool {
        self.close.is_cancelled()
    }

    pub fn is_closed(&self) -> bool {
        *self.closed_tx.borrow()
    }

    /// Called by the stage loop on every exit path.
    pub fn mark_closed(&self) {
        self.closed_tx.send_replace(true);
    }

    /// Raise the close signal and wait for the loop to acknowledge.
    ///
    /// Returns `false` if the loop did not acknowledge within `timeout`.
    pub async fn shutdown(&self, timeout: Duration) -> bool {
        self.close.cancel();

        let mut closed_rx = self.closed_tx.subscribe();
        let acked = match tokio::time::timeout(timeout, closed_rx.wait_for(|closed| *closed)).await {
            Ok(Ok(_)) => {
                debug!(stage = %self.name, "Stage closed");
                true
            }
            Ok(Err(_)) => false,
            Err(_) => {
                warn!(
                    stage = %self.name,
                    timeout_ms = timeout.as_millis() as u64,
                    "Stage did not acknowledge close before timeout"
                );
                false
            }
        };
        acked
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_shutdown_waits_for_ack() {
        let watcher = Arc::new(Watcher::new("test"));
        let close = watcher.close_signal();
        let loop_watcher = watcher.clone();

        tokio::spawn(async move {
            close.cancelled().await;
            tokio::time::sleep(Duration::from_millis(20)).await;
            loop_watcher.mark_closed();
        });

        assert!(watcher.shutdown(Duration::from_secs(1)).await);
        assert!(watcher.is_closing());
        assert!(watcher.is_closed());
    }

    #[tokio::test]
    async fn test_shutdown_times_out_without_loop() {
        let watcher = Watcher::new("orphan");
        assert!(!watcher.shutdown(Duration::from_millis(20)).await);
        assert!(!watcher.is_closed());
    }

    #[tokio::test]
    async fn test_shutdown_after_loop_already_exited() {
        let watcher = Watcher::new("early-exit");
        watcher.mark_closed();
        assert!(watcher.shutdown(Duration::from_millis(20)).await);
    }
}
