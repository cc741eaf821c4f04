//! # Feed Primitives
//!
//! Cancellation-aware sends used on every pipeline edge.
//!
//! - [`async_feed`] spawns a task racing the send against cancellation and
//!   returns immediately. A stalled consumer never blocks the producer; if the
//!   token fires first the item is dropped (at-most-once on that hop).
//! - [`cancelable_feed`] is the same race awaited inline. Scanners use it so a
//!   full exec channel cannot pin a scan pass during shutdown.
//! - [`retry::RetryScheduler`] re-submits after a fixed cooldown.
//!
//! Every spawned task resolves to a [`FeedOutcome`], so callers and tests can
//! audit what happened to an item.

pub mod retry;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub use retry::{retry, RetryScheduler};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedOutcome {
    /// The receiver accepted the item.
    Delivered,
    /// Cancellation won the race; the item was dropped.
    Abandoned,
    /// The receiving stage has shut down.
    Closed,
}

impl FeedOutcome {
    pub fn is_delivered(&self) -> bool {
        matches!(self, Self::Delivered)
    }
}

/// Fire-and-forget send. The returned handle may be ignored.
pub fn async_feed<T>(
    token: &CancellationToken,
    item: T,
    tx: &mpsc::Sender<T>,
) -> JoinHandle<FeedOutcome>
where
    T: Send + 'static,
{
    let token = token.clone();
    let tx = tx.clone();
    tokio::spawn(async move { cancelable_feed(&token, item, &tx).await })
}

/// Send `item`, giving up as soon as `token` is cancelled.
pub async fn cancelable_feed<T>(
    token: &CancellationToken,
    item: T,
    tx: &mpsc::Sender<T>,
) -> FeedOutcome {
    tokio::select! {
        biased;
        _ = token.cancelled() => {
            debug!("Feed abandoned on cancellation");
            FeedOutcome::Abandoned
        }
        sent = tx.send(item) => match sent {
            Ok(()) => FeedOutcome::Delivered,
            Err(_) => {
                debug!("Feed target closed");
                FeedOutcome::Closed
            }
        },
    }
}
