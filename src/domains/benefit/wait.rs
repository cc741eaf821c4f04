//! Benefit wait.
//!
//! Once per benefit period every good in `wait` gets its reward for the
//! period computed from its benefit account balance. The commit stamps the
//! rewarded orders and moves the good to `bookkeeping`.

use async_trait::async_trait;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::BenefitPeriod;
use crate::constants::{rpc, services, subsystems};
use crate::domains::DomainContext;
use crate::error::{PipelineError, Result};
use crate::feed::cancelable_feed;
use crate::money::parse_non_negative;
use crate::services::requests::{OrdersBenefitRequest, UpdateGoodRequest};
use crate::services::{Good, GoodConds, GoodService, NotifResult, OrderConds, Platform, RewardAtCond};
use crate::stage::notif::{Notifiable, NotificationPersister};
use crate::stage::{
    Exec, ExecSender, ObjectId, Payload, Persistenter, PipelineHandler, Reportable, Route, Routes,
    RunningMap, Scanner, TriggerCond,
};
use crate::state_machine::{GoodBenefitState, StateGraph};

#[derive(Debug, Clone, PartialEq)]
pub struct WaitEnvelope {
    pub good: Good,
    pub benefit_timestamp: u32,
    pub today_reward: Decimal,
    /// Benefit account balance the next period starts from.
    pub next_start_amount: Decimal,
    /// Rewarded order ID to its previous `last_benefit_at`.
    pub orders: BTreeMap<String, u32>,
    /// Why the good was skipped this period, reported to operators.
    pub skipped: Option<String>,
    pub failure: Option<String>,
}

impl WaitEnvelope {
    fn new(good: Good, benefit_timestamp: u32) -> Self {
        Self {
            good,
            benefit_timestamp,
            today_reward: Decimal::ZERO,
            next_start_amount: Decimal::ZERO,
            orders: BTreeMap::new(),
            skipped: None,
            failure: None,
        }
    }
}

impl ObjectId for WaitEnvelope {
    fn object_id(&self) -> String {
        self.good.id.clone()
    }
}

impl Reportable for WaitEnvelope {
    fn record_failure(&mut self, message: String) {
        self.failure = Some(message);
    }
}

impl Notifiable for WaitEnvelope {
    fn notification(&self) -> (NotifResult, String) {
        match &self.failure {
            Some(message) => (
                NotifResult::Fail,
                format!("benefit of good {} failed: {message}", self.good.id),
            ),
            None => match &self.skipped {
                Some(reason) => (NotifResult::Success, format!("good {} {reason}", self.good.id)),
                None => (
                    NotifResult::Success,
                    format!("good {} rewarded {}", self.good.id, self.today_reward),
                ),
            },
        }
    }
}

/// Time-gated scanner: a pass runs at most once per benefit period.
pub struct WaitScanner {
    goods: Arc<dyn GoodService>,
    period: BenefitPeriod,
    row_limit: u32,
    next_benefit_at: Mutex<u32>,
}

impl WaitScanner {
    pub fn new(goods: Arc<dyn GoodService>, period: BenefitPeriod, row_limit: u32) -> Self {
        let next_benefit_at = period.next_boundary(period.now());
        Self {
            goods,
            period,
            row_limit: row_limit.max(1),
            next_benefit_at: Mutex::new(next_benefit_at),
        }
    }

    pub fn next_benefit_at(&self) -> u32 {
        *self.next_benefit_at.lock()
    }

    async fn scan_goods(
        &self,
        token: &CancellationToken,
        conds: GoodConds,
        checkpoint: Option<u32>,
        exec: &ExecSender<Good, WaitEnvelope>,
    ) -> Result<()> {
        let mut offset = 0;
        loop {
            let goods = self.goods.get_goods(&conds, offset, self.row_limit).await?;
            if goods.is_empty() {
                return Ok(());
            }
            for good in goods {
                let payload = match checkpoint {
                    Some(ts) => Payload::triggered(good, Some(ts)),
                    None => Payload::Entity(good),
                };
                if !cancelable_feed(token, payload, exec).await.is_delivered() {
                    return Ok(());
                }
            }
            offset += self.row_limit;
        }
    }
}

#[async_trait]
impl Scanner<Good, WaitEnvelope> for WaitScanner {
    async fn scan(&self, token: &CancellationToken, exec: &ExecSender<Good, WaitEnvelope>) -> Result<()> {
        let now = self.period.now();
        if now < self.next_benefit_at() {
            return Ok(());
        }

        let benefit_timestamp = self.period.timestamp_at(now);
        info!(benefit_timestamp, "Benefit period started, scanning goods");
        let conds = GoodConds {
            benefit_state: Some(GoodBenefitState::Wait),
            reward_at: Some(RewardAtCond::Ne(benefit_timestamp)),
            ..Default::default()
        };
        // A failed pass is repeated on the next tick of the same period
        self.scan_goods(token, conds, None, exec).await?;
        *self.next_benefit_at.lock() = self.period.next_boundary(now);
        Ok(())
    }

    async fn init_scan(&self, token: &CancellationToken, exec: &ExecSender<Good, WaitEnvelope>) -> Result<()> {
        let conds = GoodConds {
            benefit_state: Some(GoodBenefitState::Wait),
            reward_at: Some(RewardAtCond::Eq(self.period.current_timestamp())),
            ..Default::default()
        };
        self.scan_goods(token, conds, None, exec).await
    }

    async fn trigger_scan(
        &self,
        token: &CancellationToken,
        cond: &TriggerCond,
        exec: &ExecSender<Good, WaitEnvelope>,
    ) -> Result<()> {
        let benefit_timestamp = self
            .period
            .timestamp_at(cond.checkpoint.unwrap_or_else(|| self.period.now()));
        let conds = GoodConds {
            benefit_state: Some(GoodBenefitState::Wait),
            ids: (!cond.object_ids.is_empty()).then(|| cond.object_ids.clone()),
            reward_at: Some(RewardAtCond::Ne(benefit_timestamp)),
        };
        self.scan_goods(token, conds, Some(benefit_timestamp), exec).await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WaitOutcome {
    Reward,
    NoReward,
    NotStarted,
}

pub struct WaitExecutor {
    platform: Platform,
    period: BenefitPeriod,
    row_limit: u32,
}

impl WaitExecutor {
    pub fn new(platform: Platform, period: BenefitPeriod, row_limit: u32) -> Self {
        Self {
            platform,
            period,
            row_limit: row_limit.max(1),
        }
    }

    async fn compute(&self, envelope: &mut WaitEnvelope, now: u32) -> Result<WaitOutcome> {
        let good = &envelope.good;
        if good.start_at >= now {
            info!(good_id = %good.id, start_at = good.start_at, now, "Mining not started");
            envelope.skipped = Some(format!(
                "mining not started (start at {}, now {now})",
                good.start_at
            ));
            return Ok(WaitOutcome::NotStarted);
        }

        let coin = self
            .platform
            .coins
            .get_coin(&good.coin_type_id)
            .await?
            .ok_or_else(|| PipelineError::not_found("coin", &good.coin_type_id))?;
        let reserved = parse_non_negative("reserved_amount", &coin.reserved_amount)?;
        let account = self
            .platform
            .accounts
            .get_account(&good.benefit_account_id)
            .await?
            .ok_or_else(|| PipelineError::not_found("benefit account", &good.benefit_account_id))?;
        let balance = self.platform.accounts.balance(&account).await?;

        let start = parse_non_negative("next_reward_start_amount", &good.next_reward_start_amount)?;
        let mut today = balance - start;
        if start.is_zero() {
            today -= reserved;
        }
        if today <= Decimal::ZERO {
            debug!(good_id = %good.id, %balance, %start, "No reward this period");
            return Ok(WaitOutcome::NoReward);
        }

        let conds = OrderConds {
            good_id: Some(good.id.clone()),
            last_benefit_at: None,
        };
        let mut orders = BTreeMap::new();
        let mut offset = 0;
        loop {
            let page = self.platform.orders.get_orders(&conds, offset, self.row_limit).await?;
            if page.is_empty() {
                break;
            }
            for order in page {
                if order.last_benefit_at == envelope.benefit_timestamp
                    || !self.period.order_benefitable(&order, now)
                {
                    continue;
                }
                orders.insert(order.id, order.last_benefit_at);
            }
            offset += self.row_limit;
        }

        envelope.today_reward = today;
        envelope.next_start_amount = balance;
        envelope.orders = orders;
        Ok(WaitOutcome::Reward)
    }
}

#[async_trait]
impl Exec<Good, WaitEnvelope> for WaitExecutor {
    async fn exec(
        &self,
        _token: &CancellationToken,
        payload: Payload<Good, WaitEnvelope>,
        routes: &Routes<Good, WaitEnvelope>,
    ) -> Result<()> {
        let (good, checkpoint) = match &payload {
            Payload::Entity(good) => (good.clone(), None),
            Payload::Triggered(triggered) => (triggered.entity.clone(), triggered.checkpoint),
            Payload::Envelope(_) => return Ok(()),
        };
        let now = self.period.now();
        let benefit_timestamp = self.period.timestamp_at(checkpoint.unwrap_or(now));
        let mut envelope = WaitEnvelope::new(good, benefit_timestamp);

        let route = match self.compute(&mut envelope, now).await {
            Ok(WaitOutcome::Reward) => Route::Persistent(envelope),
            Ok(WaitOutcome::NoReward) => Route::Done(payload),
            Ok(WaitOutcome::NotStarted) => Route::Notify {
                envelope,
                done: payload,
            },
            Err(err) => {
                warn!(good_id = %envelope.good.id, error = %err, "Benefit computation failed");
                Route::failed(&err, envelope, payload)
            }
        };
        routes.dispatch(route);
        Ok(())
    }
}

pub struct WaitPersistent {
    ctx: DomainContext,
}

impl WaitPersistent {
    pub fn new(ctx: DomainContext) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl Persistenter<Good, WaitEnvelope> for WaitPersistent {
    async fn update(
        &self,
        _token: &CancellationToken,
        envelope: &WaitEnvelope,
        _routes: &Routes<Good, WaitEnvelope>,
    ) -> Result<()> {
        let good_id = &envelope.good.id;
        let current = self
            .ctx
            .platform
            .goods
            .get_good(good_id)
            .await?
            .ok_or_else(|| PipelineError::not_found("good", good_id))?;
        // Also true after the good went through done and back to wait
        if current.reward_at == envelope.benefit_timestamp {
            return Err(PipelineError::Duplicate {
                key: format!("{good_id}:{}", envelope.benefit_timestamp),
            });
        }
        current
            .benefit_state
            .ensure_transition(GoodBenefitState::BookKeeping)?;

        let mut dispose = self.ctx.saga();
        if !envelope.orders.is_empty() {
            dispose.add(
                services::ORDER,
                rpc::UPDATE_ORDERS_BENEFIT,
                rpc::RESTORE_ORDERS_BENEFIT,
                &OrdersBenefitRequest {
                    last_benefit_at: envelope.benefit_timestamp,
                    previous: envelope.orders.clone(),
                },
            )?;
        }
        dispose.add(
            services::GOOD,
            rpc::UPDATE_GOOD,
            "",
            &UpdateGoodRequest {
                id: good_id.clone(),
                benefit_state: Some(GoodBenefitState::BookKeeping),
                reward_at: Some(envelope.benefit_timestamp),
                last_reward_amount: Some(envelope.today_reward.to_string()),
                next_reward_start_amount: Some(envelope.next_start_amount.to_string()),
            },
        )?;

        self.ctx.dispatcher.execute(dispose).await
    }
}

pub fn build(
    ctx: &DomainContext,
    period: BenefitPeriod,
    running: Arc<RunningMap>,
    token: &CancellationToken,
) -> Result<Option<PipelineHandler<Good, WaitEnvelope>>> {
    let row_limit = ctx.row_limit();
    PipelineHandler::<Good, WaitEnvelope>::builder()
        .subsystem(subsystems::BENEFIT_WAIT)
        .scanner(Arc::new(WaitScanner::new(
            ctx.platform.goods.clone(),
            period.clone(),
            row_limit,
        )))
        .exec(Arc::new(WaitExecutor::new(ctx.platform.clone(), period, row_limit)))
        .persistenter(Arc::new(WaitPersistent::new(ctx.clone())))
        .notify(Arc::new(NotificationPersister::new(
            subsystems::BENEFIT_WAIT,
            ctx.platform.notifications.clone(),
        )))
        .running(running)
        .lease(ctx.lease.clone())
        .config(&ctx.config)
        .build(token)
}
