//! # Pipeline Handler
//!
//! Wires one subsystem: a [`Sentinel`] feeding the exec channel, a routing
//! loop, `executor_number` executors, one persistent stage and one
//! notification stage.
//!
//! The routing loop only runs while this process holds the subsystem lease.
//! It admits scanned entities through the [`RunningMap`], feeds executors
//! round-robin, relays persistent and notification traffic to their stages,
//! and releases entities reported on `done`.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::executor::spawn_executor;
use super::notif::spawn_notif;
use super::persistent::spawn_persistent;
use super::routing::Routes;
use super::running::{Admission, RunningMap};
use super::sentinel::Sentinel;
use super::worker::StageWorker;
use super::{Entity, Exec, Notify, Payload, Persistenter, Reportable, Scanner, TriggerCond};
use crate::config::PipelineConfig;
use crate::error::{PipelineError, Result};
use crate::feed::{FeedOutcome, RetryScheduler};
use crate::locks::{lease_key, LeaseProvider, LocalLeaseProvider};
use crate::watcher::Watcher;

pub struct PipelineBuilder<E: Entity, P: Entity> {
    subsystem: Option<String>,
    scanner: Option<Arc<dyn Scanner<E, P>>>,
    exec: Option<Arc<dyn Exec<E, P>>>,
    persistenter: Option<Arc<dyn Persistenter<E, P>>>,
    notify: Option<Arc<dyn Notify<P>>>,
    executor_number: Option<usize>,
    scan_interval: Option<Duration>,
    running: Option<Arc<RunningMap>>,
    running_concurrent: Option<usize>,
    lease: Option<Arc<dyn LeaseProvider>>,
    config: PipelineConfig,
}

impl<E: Entity, P: Entity + Reportable> Default for PipelineBuilder<E, P> {
    fn default() -> Self {
        Self {
            subsystem: None,
            scanner: None,
            exec: None,
            persistenter: None,
            notify: None,
            executor_number: None,
            scan_interval: None,
            running: None,
            running_concurrent: None,
            lease: None,
            config: PipelineConfig::default(),
        }
    }
}

impl<E: Entity, P: Entity + Reportable> PipelineBuilder<E, P> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subsystem(mut self, subsystem: impl Into<String>) -> Self {
        self.subsystem = Some(subsystem.into());
        self
    }

    pub fn scanner(mut self, scanner: Arc<dyn Scanner<E, P>>) -> Self {
        self.scanner = Some(scanner);
        self
    }

    pub fn exec(mut self, exec: Arc<dyn Exec<E, P>>) -> Self {
        self.exec = Some(exec);
        self
    }

    pub fn persistenter(mut self, persistenter: Arc<dyn Persistenter<E, P>>) -> Self {
        self.persistenter = Some(persistenter);
        self
    }

    pub fn notify(mut self, notify: Arc<dyn Notify<P>>) -> Self {
        self.notify = Some(notify);
        self
    }

    pub fn executor_number(mut self, n: usize) -> Self {
        self.executor_number = Some(n);
        self
    }

    pub fn scan_interval(mut self, interval: Duration) -> Self {
        self.scan_interval = Some(interval);
        self
    }

    /// Share an in-flight registry with other subsystems of the same entity type.
    pub fn running(mut self, running: Arc<RunningMap>) -> Self {
        self.running = Some(running);
        self
    }

    pub fn running_concurrent(mut self, n: usize) -> Self {
        self.running_concurrent = Some(n);
        self
    }

    pub fn lease(mut self, lease: Arc<dyn LeaseProvider>) -> Self {
        self.lease = Some(lease);
        self
    }

    /// Sizing, cooldowns and subsystem gating. Explicit setters win.
    pub fn config(mut self, config: &PipelineConfig) -> Self {
        self.config = config.clone();
        self
    }

    /// Spawn every stage under a child of `parent`.
    ///
    /// Returns `Ok(None)` when the subsystem is disabled by configuration.
    pub fn build(self, parent: &CancellationToken) -> Result<Option<PipelineHandler<E, P>>> {
        let subsystem = self
            .subsystem
            .ok_or_else(|| PipelineError::Configuration("subsystem is required".into()))?;
        let scanner = self
            .scanner
            .ok_or_else(|| PipelineError::Configuration(format!("{subsystem}: scanner is required")))?;
        let exec = self
            .exec
            .ok_or_else(|| PipelineError::Configuration(format!("{subsystem}: executor is required")))?;
        let persistenter = self.persistenter.ok_or_else(|| {
            PipelineError::Configuration(format!("{subsystem}: persistenter is required"))
        })?;

        let config = self.config;
        if !config.subsystems.supports(&subsystem) {
            info!(subsystem = %subsystem, "Subsystem disabled, not starting");
            return Ok(None);
        }

        let capacity = config.pipeline.channel_capacity.max(1);
        let executor_number = self
            .executor_number
            .unwrap_or(config.pipeline.executor_number)
            .max(1);
        let scan_interval = self
            .scan_interval
            .unwrap_or_else(|| config.subsystems.scan_interval(&subsystem, config.scan.interval()));
        let running = self.running.unwrap_or_else(|| {
            Arc::new(RunningMap::with_stale_threshold(
                self.running_concurrent
                    .unwrap_or(config.pipeline.running_concurrent),
                config.pipeline.stale_running(),
            ))
        });
        let lease = self
            .lease
            .unwrap_or_else(|| Arc::new(LocalLeaseProvider::new()) as Arc<dyn LeaseProvider>);
        let notify = self.notify.unwrap_or_else(|| Arc::new(LogNotify) as Arc<dyn Notify<P>>);

        let token = parent.child_token();
        let retrier = RetryScheduler::new(config.retry.cooldown(), token.clone());

        let (exec_tx, exec_rx) = mpsc::channel(capacity);
        let (persistent_tx, persistent_rx) = mpsc::channel(capacity);
        let (notif_tx, notif_rx) = mpsc::channel(capacity);
        let (done_tx, done_rx) = mpsc::channel(capacity);

        let routes = Routes::new(
            subsystem.clone(),
            token.clone(),
            persistent_tx,
            notif_tx,
            done_tx,
            exec_tx.clone(),
            retrier.clone(),
        );

        let persistent = Arc::new(spawn_persistent(
            &subsystem,
            capacity,
            token.clone(),
            persistenter,
            routes.clone(),
        ));
        let notif = Arc::new(spawn_notif(&subsystem, capacity, token.clone(), notify));
        let executors: Arc<Vec<StageWorker<Payload<E, P>>>> = Arc::new(
            (0..executor_number)
                .map(|index| {
                    spawn_executor(
                        &subsystem,
                        index,
                        capacity,
                        token.clone(),
                        exec.clone(),
                        routes.clone(),
                    )
                })
                .collect(),
        );

        let owner = Uuid::new_v4().to_string();
        let leased = Arc::new(AtomicBool::new(false));
        let watcher = Arc::new(Watcher::new(format!("{subsystem}:handler")));

        tokio::spawn(
            RouteLoop {
                subsystem: subsystem.clone(),
                owner: owner.clone(),
                token: token.clone(),
                lease: lease.clone(),
                lease_retry_interval: config.pipeline.lease_retry_interval(),
                leased: leased.clone(),
                running: running.clone(),
                retrier: retrier.clone(),
                exec_tx: exec_tx.clone(),
                executors: executors.clone(),
                persistent: persistent.clone(),
                notif: notif.clone(),
                watcher: watcher.clone(),
            }
            .run(exec_rx, persistent_rx, notif_rx, done_rx),
        );

        let sentinel = Sentinel::spawn(&subsystem, scanner, scan_interval, exec_tx, token.clone());

        info!(
            subsystem = %subsystem,
            owner = %owner,
            executors = executor_number,
            scan_interval_ms = scan_interval.as_millis() as u64,
            running_concurrent = running.concurrent(),
            "Pipeline handler started"
        );

        Ok(Some(PipelineHandler {
            subsystem,
            owner,
            token,
            lease,
            leased,
            running,
            retrier,
            sentinel,
            watcher,
            executors,
            persistent,
            notif,
            finalize_timeout: config.pipeline.finalize_timeout(),
        }))
    }
}

pub struct PipelineHandler<E: Entity, P: Entity> {
    subsystem: String,
    owner: String,
    token: CancellationToken,
    lease: Arc<dyn LeaseProvider>,
    leased: Arc<AtomicBool>,
    running: Arc<RunningMap>,
    retrier: RetryScheduler,
    sentinel: Sentinel,
    watcher: Arc<Watcher>,
    executors: Arc<Vec<StageWorker<Payload<E, P>>>>,
    persistent: Arc<StageWorker<P>>,
    notif: Arc<StageWorker<P>>,
    finalize_timeout: Duration,
}

impl<E: Entity, P: Entity + Reportable> PipelineHandler<E, P> {
    pub fn builder() -> PipelineBuilder<E, P> {
        PipelineBuilder::new()
    }
}

impl<E: Entity, P: Entity> PipelineHandler<E, P> {
    pub fn subsystem(&self) -> &str {
        &self.subsystem
    }

    /// Lease owner ID of this handler.
    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn has_lease(&self) -> bool {
        self.leased.load(Ordering::Acquire)
    }

    pub fn running(&self) -> &Arc<RunningMap> {
        &self.running
    }

    pub fn retrier(&self) -> &RetryScheduler {
        &self.retrier
    }

    pub fn persistent(&self) -> &StageWorker<P> {
        &self.persistent
    }

    pub fn executors(&self) -> &[StageWorker<Payload<E, P>>] {
        &self.executors
    }

    pub fn is_running(&self) -> bool {
        !self.watcher.is_closed()
    }

    /// Request a narrowed rescan from the sentinel.
    pub async fn trigger(&self, cond: TriggerCond) -> Result<FeedOutcome> {
        self.sentinel.trigger(cond).await
    }

    /// Stop every stage and release the lease.
    ///
    /// Pending feeds and retries are abandoned once the stages are down.
    pub async fn finalize(&self) {
        let timeout = self.finalize_timeout;
        info!(subsystem = %self.subsystem, "Finalizing pipeline handler");

        if self.leased.swap(false, Ordering::AcqRel) {
            let key = lease_key(&self.subsystem);
            if let Err(e) = self.lease.unlock(&key, &self.owner).await {
                warn!(subsystem = %self.subsystem, error = %e, "Failed to release lease");
            }
        }

        self.sentinel.finalize(timeout).await;
        self.watcher.shutdown(timeout).await;
        for executor in self.executors.iter() {
            executor.finalize(timeout).await;
        }
        self.persistent.finalize(timeout).await;
        self.notif.finalize(timeout).await;
        self.token.cancel();

        info!(
            subsystem = %self.subsystem,
            in_flight = self.running.len(),
            pending_retries = self.retrier.pending(),
            "Pipeline handler finalized"
        );
    }
}

struct RouteLoop<E: Entity, P: Entity> {
    subsystem: String,
    owner: String,
    token: CancellationToken,
    lease: Arc<dyn LeaseProvider>,
    lease_retry_interval: Duration,
    leased: Arc<AtomicBool>,
    running: Arc<RunningMap>,
    retrier: RetryScheduler,
    exec_tx: mpsc::Sender<Payload<E, P>>,
    executors: Arc<Vec<StageWorker<Payload<E, P>>>>,
    persistent: Arc<StageWorker<P>>,
    notif: Arc<StageWorker<P>>,
    watcher: Arc<Watcher>,
}

impl<E: Entity, P: Entity> RouteLoop<E, P> {
    async fn run(
        self,
        mut exec_rx: mpsc::Receiver<Payload<E, P>>,
        mut persistent_rx: mpsc::Receiver<P>,
        mut notif_rx: mpsc::Receiver<P>,
        mut done_rx: mpsc::Receiver<Payload<E, P>>,
    ) {
        let close = self.watcher.close_signal();

        if self.acquire_lease(&close).await {
            info!(subsystem = %self.subsystem, owner = %self.owner, "▶ Routing loop started");
            let mut next = 0usize;

            loop {
                tokio::select! {
                    biased;
                    _ = close.cancelled() => break,
                    _ = self.token.cancelled() => break,
                    Some(payload) = done_rx.recv() => {
                        self.running.release(&payload.object_id());
                    }
                    Some(envelope) = persistent_rx.recv() => {
                        self.forward(&self.persistent, envelope).await;
                    }
                    Some(envelope) = notif_rx.recv() => {
                        self.forward(&self.notif, envelope).await;
                    }
                    Some(payload) = exec_rx.recv() => {
                        self.admit(payload, &mut next).await;
                    }
                }
            }
        }

        self.watcher.mark_closed();
        info!(subsystem = %self.subsystem, in_flight = self.running.len(), "⏹ Routing loop stopped");
    }

    /// Returns `false` if shutdown arrived before the lease did.
    async fn acquire_lease(&self, close: &CancellationToken) -> bool {
        let key = lease_key(&self.subsystem);
        loop {
            match self.lease.try_lock(&key, &self.owner).await {
                Ok(true) => {
                    self.leased.store(true, Ordering::Release);
                    info!(subsystem = %self.subsystem, key = %key, "Subsystem lease acquired");
                    return true;
                }
                Ok(false) => debug!(subsystem = %self.subsystem, key = %key, "Lease held elsewhere"),
                Err(e) => warn!(subsystem = %self.subsystem, error = %e, "Lease check failed"),
            }

            tokio::select! {
                biased;
                _ = close.cancelled() => return false,
                _ = self.token.cancelled() => return false,
                _ = tokio::time::sleep(self.lease_retry_interval) => {}
            }
        }
    }

    async fn admit(&self, payload: Payload<E, P>, next: &mut usize) {
        let object_id = payload.object_id();
        match self.running.try_admit(&object_id, &self.subsystem) {
            Admission::Admitted => {
                let index = *next % self.executors.len();
                *next = next.wrapping_add(1);
                debug!(
                    subsystem = %self.subsystem,
                    object_id = %object_id,
                    kind = payload.kind(),
                    executor = index,
                    "Admitted"
                );
                self.forward(&self.executors[index], payload).await;
            }
            Admission::AlreadyRunning => {
                debug!(subsystem = %self.subsystem, object_id = %object_id, "Already in flight, dropped");
            }
            Admission::Overflow => {
                debug!(
                    subsystem = %self.subsystem,
                    object_id = %object_id,
                    in_flight = self.running.len(),
                    "Running registry full, retrying later"
                );
                self.retrier.schedule(payload, &self.exec_tx);
            }
        }
    }

    async fn forward<T: Send + 'static>(&self, stage: &StageWorker<T>, item: T) {
        match stage.feed(item).await {
            Ok(FeedOutcome::Delivered) => {}
            Ok(outcome) => debug!(stage = %stage.name(), ?outcome, "Item not delivered"),
            Err(e) => warn!(stage = %stage.name(), error = %e, "Stage unavailable"),
        }
    }
}

/// Fallback when no notifier is configured.
struct LogNotify;

#[async_trait]
impl<P: Entity> Notify<P> for LogNotify {
    async fn notify(&self, _token: &CancellationToken, envelope: &P) -> Result<()> {
        warn!(object_id = %envelope.object_id(), ?envelope, "Notification without notifier");
        Ok(())
    }
}
