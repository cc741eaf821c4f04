//! Benefit bookkeeping.
//!
//! Splits a good's period reward across the orders stamped for that period,
//! proportionally to their units out of the good's total units. What is not
//! sold stays with the platform as the unsold amount. The commit writes the
//! good statement and the users' ledger statements, then moves the good to
//! `done`.

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde_json::json;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::constants::{rpc, services, subsystems, AMOUNT_SCALE};
use crate::domains::DomainContext;
use crate::error::{PipelineError, Result};
use crate::feed::cancelable_feed;
use crate::money::{apportion, parse_non_negative};
use crate::services::requests::{GoodStatementRequest, StatementsRequest, UpdateGoodRequest};
use crate::services::{
    Good, GoodConds, GoodService, GoodStatement, LedgerStatement, NotifResult, Order, OrderConds,
    Platform,
};
use crate::stage::notif::{Notifiable, NotificationPersister};
use crate::stage::{
    Exec, ExecSender, ObjectId, Payload, Persistenter, PipelineHandler, Reportable, Route, Routes,
    RunningMap, Scanner, TriggerCond,
};
use crate::state_machine::{GoodBenefitState, StateGraph};

const IO_SUB_TYPE_MINING_BENEFIT: &str = "mining_benefit";

#[derive(Debug, Clone, PartialEq)]
pub struct BookkeepingEnvelope {
    pub good: Good,
    pub benefit_date: u32,
    /// `None` when the statement for this date already exists.
    pub statement: Option<GoodStatement>,
    pub statements: Vec<LedgerStatement>,
    pub failure: Option<String>,
}

impl ObjectId for BookkeepingEnvelope {
    fn object_id(&self) -> String {
        self.good.id.clone()
    }
}

impl Reportable for BookkeepingEnvelope {
    fn record_failure(&mut self, message: String) {
        self.failure = Some(message);
    }
}

impl Notifiable for BookkeepingEnvelope {
    fn notification(&self) -> (NotifResult, String) {
        match &self.failure {
            Some(message) => (
                NotifResult::Fail,
                format!("bookkeeping of good {} failed: {message}", self.good.id),
            ),
            None => (
                NotifResult::Success,
                format!(
                    "good {} booked {} statements",
                    self.good.id,
                    self.statements.len()
                ),
            ),
        }
    }
}

/// Reward split for one good and one benefit date.
#[derive(Debug, Clone, PartialEq)]
pub struct RewardSplit {
    pub total: Decimal,
    pub to_user: Decimal,
    pub unsold: Decimal,
    /// Per-order share, in the order given.
    pub shares: Vec<Decimal>,
}

/// `to_user = total * sum(units) / good_total`, `unsold = total - to_user`.
pub fn split_reward(total: Decimal, good_total: Decimal, orders: &[Order]) -> Result<RewardSplit> {
    let units = orders
        .iter()
        .map(|order| parse_non_negative("units", &order.units))
        .collect::<Result<Vec<_>>>()?;
    let apportionment = apportion(total, &units, good_total, AMOUNT_SCALE)?;
    Ok(RewardSplit {
        total,
        to_user: apportionment.distributed(),
        unsold: apportionment.remainder,
        shares: apportionment.shares,
    })
}

pub struct BookkeepingScanner {
    goods: Arc<dyn GoodService>,
    row_limit: u32,
}

impl BookkeepingScanner {
    pub fn new(goods: Arc<dyn GoodService>, row_limit: u32) -> Self {
        Self {
            goods,
            row_limit: row_limit.max(1),
        }
    }

    async fn scan_goods(
        &self,
        token: &CancellationToken,
        conds: GoodConds,
        exec: &ExecSender<Good, BookkeepingEnvelope>,
    ) -> Result<()> {
        let mut offset = 0;
        loop {
            let goods = self.goods.get_goods(&conds, offset, self.row_limit).await?;
            if goods.is_empty() {
                return Ok(());
            }
            for good in goods {
                if !cancelable_feed(token, Payload::Entity(good), exec).await.is_delivered() {
                    return Ok(());
                }
            }
            offset += self.row_limit;
        }
    }
}

#[async_trait]
impl Scanner<Good, BookkeepingEnvelope> for BookkeepingScanner {
    async fn scan(&self, token: &CancellationToken, exec: &ExecSender<Good, BookkeepingEnvelope>) -> Result<()> {
        let conds = GoodConds {
            benefit_state: Some(GoodBenefitState::BookKeeping),
            ..Default::default()
        };
        self.scan_goods(token, conds, exec).await
    }

    async fn trigger_scan(
        &self,
        token: &CancellationToken,
        cond: &TriggerCond,
        exec: &ExecSender<Good, BookkeepingEnvelope>,
    ) -> Result<()> {
        let conds = GoodConds {
            benefit_state: Some(GoodBenefitState::BookKeeping),
            ids: (!cond.object_ids.is_empty()).then(|| cond.object_ids.clone()),
            reward_at: None,
        };
        self.scan_goods(token, conds, exec).await
    }
}

pub struct BookkeepingExecutor {
    platform: Platform,
    row_limit: u32,
}

impl BookkeepingExecutor {
    pub fn new(platform: Platform, row_limit: u32) -> Self {
        Self {
            platform,
            row_limit: row_limit.max(1),
        }
    }

    async fn benefit_orders(&self, good: &Good) -> Result<Vec<Order>> {
        let conds = OrderConds {
            good_id: Some(good.id.clone()),
            last_benefit_at: Some(good.reward_at),
        };
        let mut orders = Vec::new();
        let mut offset = 0;
        loop {
            let page = self.platform.orders.get_orders(&conds, offset, self.row_limit).await?;
            if page.is_empty() {
                return Ok(orders);
            }
            orders.extend(page);
            offset += self.row_limit;
        }
    }

    async fn compute(&self, envelope: &mut BookkeepingEnvelope) -> Result<()> {
        let good = &envelope.good;
        if self
            .platform
            .statements
            .exist_good_statement(&good.id, good.reward_at)
            .await?
        {
            debug!(good_id = %good.id, benefit_date = good.reward_at, "Good statement exists");
            return Ok(());
        }

        let total = parse_non_negative("last_reward_amount", &good.last_reward_amount)?;
        let good_total = parse_non_negative("total_units", &good.total_units)?;
        let orders = self.benefit_orders(good).await?;
        let split = split_reward(total, good_total, &orders)?;

        envelope.statements = orders
            .iter()
            .zip(&split.shares)
            .filter(|(_, share)| **share > Decimal::ZERO)
            .map(|(order, share)| LedgerStatement {
                id: format!("{}:{}", order.id, good.reward_at),
                app_id: order.app_id.clone(),
                user_id: order.user_id.clone(),
                coin_type_id: good.coin_type_id.clone(),
                good_id: good.id.clone(),
                order_id: order.id.clone(),
                io_sub_type: IO_SUB_TYPE_MINING_BENEFIT.to_string(),
                amount: *share,
                benefit_date: good.reward_at,
                io_extra: json!({
                    "order_id": order.id,
                    "benefit_date": good.reward_at,
                    "units": order.units,
                })
                .to_string(),
            })
            .collect();
        envelope.statement = Some(GoodStatement {
            id: format!("{}:{}", good.id, good.reward_at),
            good_id: good.id.clone(),
            coin_type_id: good.coin_type_id.clone(),
            benefit_date: good.reward_at,
            total_amount: split.total,
            to_user_amount: split.to_user,
            unsold_amount: split.unsold,
        });
        Ok(())
    }
}

#[async_trait]
impl Exec<Good, BookkeepingEnvelope> for BookkeepingExecutor {
    async fn exec(
        &self,
        _token: &CancellationToken,
        payload: Payload<Good, BookkeepingEnvelope>,
        routes: &Routes<Good, BookkeepingEnvelope>,
    ) -> Result<()> {
        let good = match &payload {
            Payload::Entity(good) => good.clone(),
            Payload::Triggered(triggered) => triggered.entity.clone(),
            Payload::Envelope(_) => return Ok(()),
        };
        let mut envelope = BookkeepingEnvelope {
            benefit_date: good.reward_at,
            good,
            statement: None,
            statements: Vec::new(),
            failure: None,
        };

        let route = match self.compute(&mut envelope).await {
            Ok(()) => Route::Persistent(envelope),
            Err(err) => {
                warn!(good_id = %envelope.good.id, error = %err, "Bookkeeping computation failed");
                Route::failed(&err, envelope, payload)
            }
        };
        routes.dispatch(route);
        Ok(())
    }
}

pub struct BookkeepingPersistent {
    ctx: DomainContext,
}

impl BookkeepingPersistent {
    pub fn new(ctx: DomainContext) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl Persistenter<Good, BookkeepingEnvelope> for BookkeepingPersistent {
    async fn update(
        &self,
        _token: &CancellationToken,
        envelope: &BookkeepingEnvelope,
        _routes: &Routes<Good, BookkeepingEnvelope>,
    ) -> Result<()> {
        let good_id = &envelope.good.id;
        let current = self
            .ctx
            .platform
            .goods
            .get_good(good_id)
            .await?
            .ok_or_else(|| PipelineError::not_found("good", good_id))?;
        if current.benefit_state != GoodBenefitState::BookKeeping
            || current.reward_at != envelope.benefit_date
        {
            return Err(PipelineError::Duplicate {
                key: format!("{good_id}:{}", envelope.benefit_date),
            });
        }
        current.benefit_state.ensure_transition(GoodBenefitState::Done)?;

        let exists = self
            .ctx
            .platform
            .statements
            .exist_good_statement(good_id, envelope.benefit_date)
            .await?;

        let mut dispose = self.ctx.saga();
        if let (Some(statement), false) = (&envelope.statement, exists) {
            dispose.add(
                services::LEDGER,
                rpc::CREATE_GOOD_STATEMENT,
                rpc::DELETE_GOOD_STATEMENT,
                &GoodStatementRequest {
                    statement: statement.clone(),
                },
            )?;
            if !envelope.statements.is_empty() {
                dispose.add(
                    services::LEDGER,
                    rpc::CREATE_STATEMENTS,
                    rpc::DELETE_STATEMENTS,
                    &StatementsRequest {
                        statements: envelope.statements.clone(),
                    },
                )?;
            }
        }
        dispose.add(
            services::GOOD,
            rpc::UPDATE_GOOD,
            "",
            &UpdateGoodRequest {
                id: good_id.clone(),
                benefit_state: Some(GoodBenefitState::Done),
                ..Default::default()
            },
        )?;

        self.ctx.dispatcher.execute(dispose).await
    }
}

pub fn build(
    ctx: &DomainContext,
    running: Arc<RunningMap>,
    token: &CancellationToken,
) -> Result<Option<PipelineHandler<Good, BookkeepingEnvelope>>> {
    let row_limit = ctx.row_limit();
    PipelineHandler::<Good, BookkeepingEnvelope>::builder()
        .subsystem(subsystems::BENEFIT_BOOKKEEPING)
        .scanner(Arc::new(BookkeepingScanner::new(ctx.platform.goods.clone(), row_limit)))
        .exec(Arc::new(BookkeepingExecutor::new(ctx.platform.clone(), row_limit)))
        .persistenter(Arc::new(BookkeepingPersistent::new(ctx.clone())))
        .notify(Arc::new(NotificationPersister::new(
            subsystems::BENEFIT_BOOKKEEPING,
            ctx.platform.notifications.clone(),
        )))
        .running(running)
        .lease(ctx.lease.clone())
        .config(&ctx.config)
        .build(token)
}
