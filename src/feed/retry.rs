//! Fixed-cooldown re-submission.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{cancelable_feed, FeedOutcome};

/// Schedules delayed re-submissions and keeps count of the ones still waiting.
///
/// Each scheduled retry is a task that sleeps for the cooldown or until the
/// token is cancelled, whichever comes first, then feeds the item back with the
/// same cancellation race as [`cancelable_feed`].
#[derive(Debug, Clone)]
pub struct RetryScheduler {
    cooldown: Duration,
    token: CancellationToken,
    pending: Arc<AtomicUsize>,
    scheduled: Arc<AtomicU64>,
}

impl RetryScheduler {
    pub fn new(cooldown: Duration, token: CancellationToken) -> Self {
        Self {
            cooldown,
            token,
            pending: Arc::new(AtomicUsize::new(0)),
            scheduled: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn cooldown(&self) -> Duration {
        self.cooldown
    }

    /// Retries waiting on their cooldown or on a send.
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    /// Total retries ever scheduled.
    pub fn scheduled(&self) -> u64 {
        self.scheduled.load(Ordering::Relaxed)
    }

    pub fn schedule<T>(&self, item: T, tx: &mpsc::Sender<T>) -> JoinHandle<FeedOutcome>
    where
        T: Send + 'static,
    {
        self.pending.fetch_add(1, Ordering::AcqRel);
        self.scheduled.fetch_add(1, Ordering::Relaxed);

        let guard = PendingGuard(self.pending.clone());
        let token = self.token.clone();
        let tx = tx.clone();
        let cooldown = self.cooldown;

        tokio::spawn(async move {
            let _guard = guard;
            tokio::select! {
                biased;
                _ = token.cancelled() => {
                    debug!("Retry cancelled during cooldown");
                    return FeedOutcome::Abandoned;
                }
                _ = tokio::time::sleep(cooldown) => {}
            }
            cancelable_feed(&token, item, &tx).await
        })
    }
}

struct PendingGuard(Arc<AtomicUsize>);

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

/// One-shot retry without a scheduler.
pub fn retry<T>(
    token: &CancellationToken,
    item: T,
    tx: &mpsc::Sender<T>,
    cooldown: Duration,
) -> JoinHandle<FeedOutcome>
where
    T: Send + 'static,
{
    RetryScheduler::new(cooldown, token.clone()).schedule(item, tx)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_retry_waits_for_cooldown() {
        let token = CancellationToken::new();
        let scheduler = RetryScheduler::new(Duration::from_secs(60), token);
        let (tx, mut rx) = mpsc::channel(1);

        let handle = scheduler.schedule("entity-1", &tx);
        assert_eq!(scheduler.pending(), 1);

        tokio::time::sleep(Duration::from_secs(59)).await;
        assert!(rx.try_recv().is_err());

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(rx.recv().await, Some("entity-1"));
        assert_eq!(handle.await.unwrap(), FeedOutcome::Delivered);
        assert_eq!(scheduler.pending(), 0);
        assert_eq!(scheduler.scheduled(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_cancelled_during_cooldown() {
        let token = CancellationToken::new();
        let scheduler = RetryScheduler::new(Duration::from_secs(60), token.clone());
        let (tx, mut rx) = mpsc::channel(1);

        let handle = scheduler.schedule(5u8, &tx);
        tokio::time::sleep(Duration::from_secs(1)).await;
        token.cancel();

        assert_eq!(handle.await.unwrap(), FeedOutcome::Abandoned);
        assert_eq!(scheduler.pending(), 0);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_cancelled_while_sending() {
        let token = CancellationToken::new();
        let (tx, mut rx) = mpsc::channel(1);
        tx.send(0u8).await.unwrap();

        let handle = retry(&token, 1u8, &tx, Duration::from_millis(10));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!handle.is_finished());

        token.cancel();
        assert_eq!(handle.await.unwrap(), FeedOutcome::Abandoned);
        assert_eq!(rx.recv().await, Some(0));
        assert!(rx.try_recv().is_err());
    }
}
