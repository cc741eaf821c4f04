//! Good benefit: the `wait → bookkeeping → done → wait` reward cycle.
//!
//! A period that cannot be completed parks the good in `fail`, which also
//! returns to `wait` for the next period.

pub mod bookkeeping;
pub mod reset;
pub mod wait;

use chrono::Utc;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::domains::DomainContext;
use crate::error::Result;
use crate::services::{Good, Order};
use crate::stage::{ObjectId, PipelineHandler, RunningMap};
use crate::state_machine::GoodBenefitState;

use bookkeeping::BookkeepingEnvelope;
use reset::ResetEnvelope;
use wait::WaitEnvelope;

impl ObjectId for Good {
    fn object_id(&self) -> String {
        self.id.clone()
    }
}

pub type Clock = Arc<dyn Fn() -> u32 + Send + Sync>;

pub fn system_clock() -> Clock {
    Arc::new(|| Utc::now().timestamp().max(0) as u32)
}

/// Fixed-length benefit periods aligned to multiples of the interval.
#[derive(Clone)]
pub struct BenefitPeriod {
    interval: u32,
    clock: Clock,
}

impl BenefitPeriod {
    pub fn new(interval_secs: u32) -> Self {
        Self::with_clock(interval_secs, system_clock())
    }

    pub fn with_clock(interval_secs: u32, clock: Clock) -> Self {
        Self {
            interval: interval_secs.max(1),
            clock,
        }
    }

    pub fn interval(&self) -> u32 {
        self.interval
    }

    pub fn now(&self) -> u32 {
        (self.clock)()
    }

    /// Start of the period containing `timestamp`.
    pub fn timestamp_at(&self, timestamp: u32) -> u32 {
        timestamp / self.interval * self.interval
    }

    pub fn current_timestamp(&self) -> u32 {
        self.timestamp_at(self.now())
    }

    /// First period boundary strictly after `timestamp`.
    pub fn next_boundary(&self, timestamp: u32) -> u32 {
        self.timestamp_at(timestamp).saturating_add(self.interval)
    }

    /// An order earns from its first full period on.
    pub fn order_benefitable(&self, order: &Order, now: u32) -> bool {
        order.start_at <= now && now >= order.start_at.saturating_add(self.interval)
    }
}

impl std::fmt::Debug for BenefitPeriod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BenefitPeriod")
            .field("interval", &self.interval)
            .finish()
    }
}

/// The benefit subsystems, sharing one in-flight registry for goods.
pub struct BenefitHandlers {
    pub wait: Option<PipelineHandler<Good, WaitEnvelope>>,
    pub bookkeeping: Option<PipelineHandler<Good, BookkeepingEnvelope>>,
    pub done: Option<PipelineHandler<Good, ResetEnvelope>>,
    pub fail: Option<PipelineHandler<Good, ResetEnvelope>>,
    running: Arc<RunningMap>,
}

impl BenefitHandlers {
    pub fn running(&self) -> &Arc<RunningMap> {
        &self.running
    }

    pub async fn finalize(&self) {
        if let Some(wait) = &self.wait {
            wait.finalize().await;
        }
        if let Some(bookkeeping) = &self.bookkeeping {
            bookkeeping.finalize().await;
        }
        for reset in [&self.done, &self.fail].into_iter().flatten() {
            reset.finalize().await;
        }
    }
}

pub fn build(ctx: &DomainContext, period: BenefitPeriod, token: &CancellationToken) -> Result<BenefitHandlers> {
    let pipeline = &ctx.config.pipeline;
    let running = Arc::new(RunningMap::with_stale_threshold(
        pipeline.running_concurrent,
        pipeline.stale_running(),
    ));
    Ok(BenefitHandlers {
        wait: wait::build(ctx, period, running.clone(), token)?,
        bookkeeping: bookkeeping::build(ctx, running.clone(), token)?,
        done: reset::build(ctx, GoodBenefitState::Done, running.clone(), token)?,
        fail: reset::build(ctx, GoodBenefitState::Fail, running.clone(), token)?,
        running,
    })
}
