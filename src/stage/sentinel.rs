//! # Sentinel
//!
//! Drives a [`Scanner`]: one `init_scan` at start, then `scan` every interval,
//! plus `trigger_scan` for each operator trigger. A failed pass is logged and
//! the next tick starts over.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{Entity, ExecSender, Scanner, TriggerCond};
use crate::error::{PipelineError, Result};
use crate::feed::{cancelable_feed, FeedOutcome};
use crate::watcher::Watcher;

pub struct Sentinel {
    name: String,
    token: CancellationToken,
    trigger_tx: Mutex<Option<mpsc::Sender<TriggerCond>>>,
    watcher: Arc<Watcher>,
}

impl Sentinel {
    pub fn spawn<E: Entity, P: Entity>(
        subsystem: &str,
        scanner: Arc<dyn Scanner<E, P>>,
        interval: Duration,
        exec: ExecSender<E, P>,
        token: CancellationToken,
    ) -> Self {
        let name = format!("{subsystem}:sentinel");
        let (trigger_tx, trigger_rx) = mpsc::channel(8);
        let watcher = Arc::new(Watcher::new(name.clone()));

        tokio::spawn(run_loop(
            name.clone(),
            scanner,
            interval,
            exec,
            token.clone(),
            trigger_rx,
            watcher.clone(),
        ));

        Self {
            name,
            token,
            trigger_tx: Mutex::new(Some(trigger_tx)),
            watcher,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_running(&self) -> bool {
        !self.watcher.is_closed()
    }

    /// Queue a narrowed rescan. Waits for room unless the token is cancelled.
    pub async fn trigger(&self, cond: TriggerCond) -> Result<FeedOutcome> {
        let tx = self
            .trigger_tx
            .lock()
            .clone()
            .ok_or_else(|| PipelineError::StageClosed {
                stage: self.name.clone(),
            })?;
        Ok(cancelable_feed(&self.token, cond, &tx).await)
    }

    pub async fn finalize(&self, timeout: Duration) -> bool {
        let closed = self.watcher.shutdown(timeout).await;
        self.trigger_tx.lock().take();
        closed
    }
}

async fn run_loop<E: Entity, P: Entity>(
    name: String,
    scanner: Arc<dyn Scanner<E, P>>,
    interval: Duration,
    exec: ExecSender<E, P>,
    token: CancellationToken,
    mut trigger_rx: mpsc::Receiver<TriggerCond>,
    watcher: Arc<Watcher>,
) {
    info!(stage = %name, interval_ms = interval.as_millis() as u64, "▶ Sentinel started");
    let close = watcher.close_signal();

    tokio::select! {
        biased;
        _ = close.cancelled() => {}
        _ = token.cancelled() => {}
        result = scanner.init_scan(&token, &exec) => report(&name, "init", result),
    }

    let mut ticker = interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    while !close.is_cancelled() && !token.is_cancelled() {
        tokio::select! {
            biased;
            _ = close.cancelled() => break,
            _ = token.cancelled() => break,
            cond = trigger_rx.recv() => {
                let Some(cond) = cond else { break };
                debug!(stage = %name, ?cond, "Trigger scan");
                tokio::select! {
                    biased;
                    _ = close.cancelled() => break,
                    result = scanner.trigger_scan(&token, &cond, &exec) => report(&name, "trigger", result),
                }
            }
            _ = ticker.tick() => {
                tokio::select! {
                    biased;
                    _ = close.cancelled() => break,
                    result = scanner.scan(&token, &exec) => report(&name, "scan", result),
                }
            }
        }
    }

    watcher.mark_closed();
    info!(stage = %name, "⏹ Sentinel stopped");
}

fn report(name: &str, pass: &'static str, result: Result<()>) {
    if let Err(e) = result {
        warn!(stage = %name, pass, error = %e, "Scan pass failed, retrying next tick");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stage::test_support::*;
    use crate::stage::Payload;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Feeds one item per scan; the first scan fails.
    #[derive(Default)]
    struct Counting {
        scans: AtomicU32,
    }

    #[async_trait]
    impl Scanner<Item, Envelope> for Counting {
        async fn scan(&self, token: &CancellationToken, exec: &ExecSender<Item, Envelope>) -> Result<()> {
            let n = self.scans.fetch_add(1, Ordering::SeqCst);
            if n == 0 {
                return Err(PipelineError::remote("store", "unavailable"));
            }
            cancelable_feed(token, Payload::Entity(item(&format!("s{n}"), 0)), exec).await;
            Ok(())
        }

        async fn init_scan(&self, token: &CancellationToken, exec: &ExecSender<Item, Envelope>) -> Result<()> {
            cancelable_feed(token, Payload::Entity(item("init", 0)), exec).await;
            Ok(())
        }

        async fn trigger_scan(
            &self,
            token: &CancellationToken,
            cond: &TriggerCond,
            exec: &ExecSender<Item, Envelope>,
        ) -> Result<()> {
            for id in &cond.object_ids {
                cancelable_feed(token, Payload::triggered(item(id, 0), cond.checkpoint), exec).await;
            }
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_init_then_periodic_scans_survive_errors() {
        let token = CancellationToken::new();
        let (tx, mut rx) = mpsc::channel(8);
        let sentinel = Sentinel::spawn("test", Arc::new(Counting::default()), Duration::from_secs(10), tx, token.clone());

        assert_eq!(rx.recv().await.unwrap().object_id(), "init");
        // First periodic scan fails, the second one feeds
        assert_eq!(rx.recv().await.unwrap().object_id(), "s1");

        assert!(sentinel.finalize(Duration::from_secs(1)).await);
        assert!(!sentinel.is_running());
    }

    #[tokio::test]
    async fn test_trigger_feeds_checkpointed_payload() {
        let token = CancellationToken::new();
        let (tx, mut rx) = mpsc::channel(8);
        let sentinel = Sentinel::spawn("test", Arc::new(Counting::default()), Duration::from_secs(3600), tx, token.clone());
        assert_eq!(rx.recv().await.unwrap().object_id(), "init");

        let outcome = sentinel
            .trigger(TriggerCond {
                object_ids: vec!["g7".into()],
                checkpoint: Some(86_400),
            })
            .await
            .unwrap();
        assert!(outcome.is_delivered());
        assert_eq!(rx.recv().await.unwrap(), Payload::triggered(item("g7", 0), Some(86_400)));

        sentinel.finalize(Duration::from_secs(1)).await;
        assert!(matches!(
            sentinel.trigger(TriggerCond::default()).await,
            Err(PipelineError::StageClosed { .. })
        ));
    }
}
