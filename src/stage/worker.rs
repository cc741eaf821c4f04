//! # Stage Worker
//!
//! A long-lived loop draining one feeder channel into a [`StageHandler`].
//! Each iteration selects among the feeder, the subsystem token and the
//! watcher's close signal. A handler error or panic is logged and counted and
//! the loop moves on to the next item; only a shutdown signal stops it.

use async_trait::async_trait;
use futures::FutureExt;
use parking_lot::Mutex;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::error::{PipelineError, Result};
use crate::feed::{cancelable_feed, FeedOutcome};
use crate::watcher::Watcher;

#[async_trait]
pub trait StageHandler<T>: Send + Sync + 'static {
    async fn handle(&self, token: &CancellationToken, item: T) -> Result<()>;
}

#[derive(Debug, Default)]
pub struct StageStats {
    processed: AtomicU64,
    failed: AtomicU64,
    panicked: AtomicU64,
}

impl StageStats {
    pub fn processed(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    pub fn panicked(&self) -> u64 {
        self.panicked.load(Ordering::Relaxed)
    }
}

pub struct StageWorker<T> {
    name: String,
    token: CancellationToken,
    feeder: Mutex<Option<mpsc::Sender<T>>>,
    watcher: Arc<Watcher>,
    stats: Arc<StageStats>,
}

impl<T: Send + 'static> StageWorker<T> {
    pub fn spawn<H>(name: impl Into<String>, capacity: usize, token: CancellationToken, handler: H) -> Self
    where
        H: StageHandler<T>,
    {
        let name = name.into();
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let watcher = Arc::new(Watcher::new(name.clone()));
        let stats = Arc::new(StageStats::default());

        tokio::spawn(run_loop(
            name.clone(),
            token.clone(),
            rx,
            handler,
            watcher.clone(),
            stats.clone(),
        ));

        Self {
            name,
            token,
            feeder: Mutex::new(Some(tx)),
            watcher,
            stats,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn stats(&self) -> &StageStats {
        &self.stats
    }

    pub fn is_running(&self) -> bool {
        !self.watcher.is_closed()
    }

    /// Blocking feed: waits for capacity unless the token is cancelled.
    pub async fn feed(&self, item: T) -> Result<FeedOutcome> {
        let tx = self
            .feeder
            .lock()
            .clone()
            .ok_or_else(|| PipelineError::StageClosed {
                stage: self.name.clone(),
            })?;
        Ok(cancelable_feed(&self.token, item, &tx).await)
    }

    /// Signal close, wait for the loop to acknowledge, then drop the feeder.
    pub async fn finalize(&self, timeout: Duration) -> bool {
        let closed = self.watcher.shutdown(timeout).await;
        self.feeder.lock().take();
        closed
    }
}

async fn run_loop<T, H>(
    name: String,
    token: CancellationToken,
    mut rx: mpsc::Receiver<T>,
    handler: H,
    watcher: Arc<Watcher>,
    stats: Arc<StageStats>,
) where
    T: Send + 'static,
    H: StageHandler<T>,
{
    info!(stage = %name, "▶ Stage started");
    let close = watcher.close_signal();

    loop {
        let item = tokio::select! {
            biased;
            _ = close.cancelled() => {
                debug!(stage = %name, "Close signal received");
                break;
            }
            _ = token.cancelled() => {
                debug!(stage = %name, "Token cancelled");
                break;
            }
            item = rx.recv() => match item {
                Some(item) => item,
                None => break,
            },
        };

        match AssertUnwindSafe(handler.handle(&token, item))
            .catch_unwind()
            .await
        {
            Ok(Ok(())) => {
                stats.processed.fetch_add(1, Ordering::Relaxed);
            }
            Ok(Err(e)) => {
                stats.failed.fetch_add(1, Ordering::Relaxed);
                error!(stage = %name, error = %e, "Stage handler failed");
            }
            Err(panic) => {
                stats.panicked.fetch_add(1, Ordering::Relaxed);
                error!(
                    stage = %name,
                    panic = %panic_message(panic.as_ref()),
                    "Stage handler panicked, continuing with next item"
                );
            }
        }
    }

    watcher.mark_closed();
    info!(
        stage = %name,
        processed = stats.processed(),
        failed = stats.failed(),
        panicked = stats.panicked(),
        "⏹ Stage stopped"
    );
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}
