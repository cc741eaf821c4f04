//! In-memory platform.
//!
//! Implements every service port plus [`RpcInvoker`], so sagas submitted
//! through an [`crate::saga::InProcessSagaEngine`] mutate the same records the
//! scanners read. Used by tests and local runs.

use anyhow::{anyhow, bail};
use async_trait::async_trait;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::RwLock;
use tracing::debug;

use super::requests::{
    GoodStatementRequest, OrdersBenefitRequest, ReviewRequest, StatementsRequest,
    UpdateGoodRequest, UpdateWithdrawRequest,
};
use super::*;
use crate::constants::{rpc, services};
use crate::error::PipelineError;
use crate::saga::RpcInvoker;

#[derive(Debug, Default)]
struct Tables {
    goods: BTreeMap<String, Good>,
    orders: BTreeMap<String, Order>,
    coins: HashMap<String, Coin>,
    accounts: HashMap<String, PlatformAccount>,
    hot_wallets: HashMap<String, String>,
    balances: HashMap<String, Decimal>,
    withdraws: BTreeMap<String, Withdraw>,
    reviews: HashMap<String, Review>,
    good_statements: BTreeMap<String, GoodStatement>,
    ledger_statements: BTreeMap<String, LedgerStatement>,
    notifications: Vec<Notification>,
}

/// Thread-safe in-memory stand-in for the remote services.
#[derive(Debug, Default)]
pub struct InMemoryPlatform {
    tables: RwLock<Tables>,
    calls: Mutex<Vec<String>>,
    rpc_failures: Mutex<HashMap<String, u32>>,
    unavailable: AtomicBool,
}

impl InMemoryPlatform {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_good(&self, good: Good) {
        self.tables.write().await.goods.insert(good.id.clone(), good);
    }

    pub async fn insert_order(&self, order: Order) {
        self.tables.write().await.orders.insert(order.id.clone(), order);
    }

    pub async fn insert_coin(&self, coin: Coin) {
        self.tables.write().await.coins.insert(coin.id.clone(), coin);
    }

    pub async fn insert_account(&self, account: PlatformAccount, balance: Decimal) {
        let mut tables = self.tables.write().await;
        tables.balances.insert(account.id.clone(), balance);
        tables.accounts.insert(account.id.clone(), account);
    }

    pub async fn set_hot_wallet(&self, coin_type_id: &str, account_id: &str) {
        self.tables
            .write()
            .await
            .hot_wallets
            .insert(coin_type_id.to_string(), account_id.to_string());
    }

    pub async fn set_balance(&self, account_id: &str, balance: Decimal) {
        self.tables
            .write()
            .await
            .balances
            .insert(account_id.to_string(), balance);
    }

    pub async fn insert_withdraw(&self, withdraw: Withdraw) {
        self.tables
            .write()
            .await
            .withdraws
            .insert(withdraw.id.clone(), withdraw);
    }

    pub async fn insert_review(&self, review: Review) {
        self.tables.write().await.reviews.insert(review.id.clone(), review);
    }

    pub async fn good(&self, id: &str) -> Option<Good> {
        self.tables.read().await.goods.get(id).cloned()
    }

    pub async fn order(&self, id: &str) -> Option<Order> {
        self.tables.read().await.orders.get(id).cloned()
    }

    pub async fn withdraw(&self, id: &str) -> Option<Withdraw> {
        self.tables.read().await.withdraws.get(id).cloned()
    }

    pub async fn reviews_for(&self, object_id: &str) -> Vec<Review> {
        self.tables
            .read()
            .await
            .reviews
            .values()
            .filter(|r| r.object_id == object_id)
            .cloned()
            .collect()
    }

    pub async fn all_good_statements(&self) -> Vec<GoodStatement> {
        self.tables.read().await.good_statements.values().cloned().collect()
    }

    pub async fn all_ledger_statements(&self) -> Vec<LedgerStatement> {
        self.tables.read().await.ledger_statements.values().cloned().collect()
    }

    pub async fn notifications(&self) -> Vec<Notification> {
        self.tables.read().await.notifications.clone()
    }

    /// Every RPC invoked so far, as `service/method`.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    /// Make `method` fail the next `times` invocations.
    pub fn fail_rpc(&self, method: &str, times: u32) {
        self.rpc_failures.lock().insert(method.to_string(), times);
    }

    /// Make list queries fail with a remote error.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::Release);
    }

    fn check_available(&self, service: &str) -> Result<()> {
        if self.unavailable.load(Ordering::Acquire) {
            return Err(PipelineError::remote(service, "service unavailable"));
        }
        Ok(())
    }

    fn take_failure(&self, method: &str) -> bool {
        let mut failures = self.rpc_failures.lock();
        match failures.get_mut(method) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                true
            }
            _ => false,
        }
    }

    async fn apply(&self, service: &str, method: &str, payload: &serde_json::Value) -> anyhow::Result<()> {
        let mut tables = self.tables.write().await;
        match (service, method) {
            (services::GOOD, rpc::UPDATE_GOOD) => {
                let req: UpdateGoodRequest = decode(payload)?;
                let good = tables
                    .goods
                    .get_mut(&req.id)
                    .ok_or_else(|| anyhow!("good {} not found", req.id))?;
                if let Some(state) = req.benefit_state {
                    good.benefit_state = state;
                }
                if let Some(reward_at) = req.reward_at {
                    good.reward_at = reward_at;
                }
                if let Some(amount) = req.last_reward_amount {
                    good.last_reward_amount = amount;
                }
                if let Some(amount) = req.next_reward_start_amount {
                    good.next_reward_start_amount = amount;
                }
            }
            (services::LEDGER, rpc::CREATE_GOOD_STATEMENT) => {
                let req: GoodStatementRequest = decode(payload)?;
                let statement = req.statement;
                let conflict = tables.good_statements.values().any(|s| {
                    s.good_id == statement.good_id
                        && s.benefit_date == statement.benefit_date
                        && s.id != statement.id
                });
                if conflict {
                    bail!(
                        "good statement for {} at {} already exists",
                        statement.good_id,
                        statement.benefit_date
                    );
                }
                tables
                    .good_statements
                    .entry(statement.id.clone())
                    .or_insert(statement);
            }
            (services::LEDGER, rpc::DELETE_GOOD_STATEMENT) => {
                let req: GoodStatementRequest = decode(payload)?;
                tables.good_statements.remove(&req.statement.id);
            }
            (services::LEDGER, rpc::CREATE_STATEMENTS) => {
                let req: StatementsRequest = decode(payload)?;
                for statement in req.statements {
                    tables
                        .ledger_statements
                        .entry(statement.id.clone())
                        .or_insert(statement);
                }
            }
            (services::LEDGER, rpc::DELETE_STATEMENTS) => {
                let req: StatementsRequest = decode(payload)?;
                for statement in req.statements {
                    tables.ledger_statements.remove(&statement.id);
                }
            }
            (services::ORDER, rpc::UPDATE_ORDERS_BENEFIT) => {
                let req: OrdersBenefitRequest = decode(payload)?;
                for order_id in req.previous.keys() {
                    if let Some(order) = tables.orders.get_mut(order_id) {
                        order.last_benefit_at = req.last_benefit_at;
                    }
                }
            }
            (services::ORDER, rpc::RESTORE_ORDERS_BENEFIT) => {
                let req: OrdersBenefitRequest = decode(payload)?;
                for (order_id, previous) in &req.previous {
                    if let Some(order) = tables.orders.get_mut(order_id) {
                        order.last_benefit_at = *previous;
                    }
                }
            }
            (services::REVIEW, rpc::CREATE_REVIEW) => {
                let req: ReviewRequest = decode(payload)?;
                tables.reviews.insert(req.review.id.clone(), req.review);
            }
            (services::REVIEW, rpc::DELETE_REVIEW) => {
                let req: ReviewRequest = decode(payload)?;
                match req.previous {
                    Some(previous) => {
                        tables.reviews.insert(previous.id.clone(), previous);
                    }
                    None => {
                        tables.reviews.remove(&req.review.id);
                    }
                }
            }
            (services::WITHDRAW, rpc::UPDATE_WITHDRAW) => {
                let req: UpdateWithdrawRequest = decode(payload)?;
                let withdraw = tables
                    .withdraws
                    .get_mut(&req.id)
                    .ok_or_else(|| anyhow!("withdraw {} not found", req.id))?;
                withdraw.state = req.state;
                if req.review_id.is_some() {
                    withdraw.review_id = req.review_id;
                }
            }
            _ => bail!("unknown rpc {service}/{method}"),
        }
        Ok(())
    }
}

fn decode<T: DeserializeOwned>(payload: &serde_json::Value) -> anyhow::Result<T> {
    Ok(serde_json::from_value(payload.clone())?)
}

fn page<T: Clone>(items: impl Iterator<Item = T>, offset: u32, limit: u32) -> Vec<T> {
    items.skip(offset as usize).take(limit as usize).collect()
}

#[async_trait]
impl RpcInvoker for InMemoryPlatform {
    async fn invoke(
        &self,
        service: &str,
        method: &str,
        gid: &str,
        payload: &serde_json::Value,
    ) -> anyhow::Result<()> {
        self.calls.lock().push(format!("{service}/{method}"));
        if self.take_failure(method) {
            bail!("{service}/{method} unavailable");
        }
        debug!(gid = %gid, service = %service, method = %method, "Applying rpc");
        self.apply(service, method, payload).await
    }
}

#[async_trait]
impl GoodService for InMemoryPlatform {
    async fn get_goods(&self, conds: &GoodConds, offset: u32, limit: u32) -> Result<Vec<Good>> {
        self.check_available(services::GOOD)?;
        let tables = self.tables.read().await;
        let matching = tables.goods.values().filter(|good| {
            conds.benefit_state.map_or(true, |s| good.benefit_state == s)
                && conds
                    .ids
                    .as_ref()
                    .map_or(true, |ids| ids.iter().any(|id| *id == good.id))
                && conds.reward_at.map_or(true, |c| c.matches(good.reward_at))
        });
        Ok(page(matching.cloned(), offset, limit))
    }

    async fn get_good(&self, id: &str) -> Result<Option<Good>> {
        self.check_available(services::GOOD)?;
        Ok(self.tables.read().await.goods.get(id).cloned())
    }
}

#[async_trait]
impl OrderService for InMemoryPlatform {
    async fn get_orders(&self, conds: &OrderConds, offset: u32, limit: u32) -> Result<Vec<Order>> {
        self.check_available(services::ORDER)?;
        let tables = self.tables.read().await;
        let matching = tables.orders.values().filter(|order| {
            conds.good_id.as_ref().map_or(true, |id| *id == order.good_id)
                && conds
                    .last_benefit_at
                    .map_or(true, |ts| order.last_benefit_at == ts)
        });
        Ok(page(matching.cloned(), offset, limit))
    }
}

#[async_trait]
impl StatementService for InMemoryPlatform {
    async fn exist_good_statement(&self, good_id: &str, benefit_date: u32) -> Result<bool> {
        self.check_available(services::LEDGER)?;
        Ok(self
            .tables
            .read()
            .await
            .good_statements
            .values()
            .any(|s| s.good_id == good_id && s.benefit_date == benefit_date))
    }

    async fn get_good_statements(&self, good_id: &str) -> Result<Vec<GoodStatement>> {
        Ok(self
            .tables
            .read()
            .await
            .good_statements
            .values()
            .filter(|s| s.good_id == good_id)
            .cloned()
            .collect())
    }

    async fn get_ledger_statements(&self, good_id: &str, benefit_date: u32) -> Result<Vec<LedgerStatement>> {
        Ok(self
            .tables
            .read()
            .await
            .ledger_statements
            .values()
            .filter(|s| s.good_id == good_id && s.benefit_date == benefit_date)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl WithdrawService for InMemoryPlatform {
    async fn get_withdraws(&self, state: WithdrawState, offset: u32, limit: u32) -> Result<Vec<Withdraw>> {
        self.check_available(services::WITHDRAW)?;
        let tables = self.tables.read().await;
        let matching = tables.withdraws.values().filter(|w| w.state == state);
        Ok(page(matching.cloned(), offset, limit))
    }

    async fn get_withdraw(&self, id: &str) -> Result<Option<Withdraw>> {
        Ok(self.tables.read().await.withdraws.get(id).cloned())
    }
}

#[async_trait]
impl CoinService for InMemoryPlatform {
    async fn get_coin(&self, coin_type_id: &str) -> Result<Option<Coin>> {
        Ok(self.tables.read().await.coins.get(coin_type_id).cloned())
    }
}

#[async_trait]
impl AccountService for InMemoryPlatform {
    async fn get_account(&self, id: &str) -> Result<Option<PlatformAccount>> {
        Ok(self.tables.read().await.accounts.get(id).cloned())
    }

    async fn hot_wallet(&self, coin_type_id: &str) -> Result<Option<PlatformAccount>> {
        let tables = self.tables.read().await;
        Ok(tables
            .hot_wallets
            .get(coin_type_id)
            .and_then(|id| tables.accounts.get(id))
            .cloned())
    }

    async fn balance(&self, account: &PlatformAccount) -> Result<Decimal> {
        self.check_available("chain")?;
        self.tables
            .read()
            .await
            .balances
            .get(&account.id)
            .copied()
            .ok_or_else(|| PipelineError::remote("chain", format!("no balance for {}", account.address)))
    }
}

#[async_trait]
impl ReviewService for InMemoryPlatform {
    async fn get_review(&self, id: &str) -> Result<Option<Review>> {
        Ok(self.tables.read().await.reviews.get(id).cloned())
    }
}

#[async_trait]
impl NotificationService for InMemoryPlatform {
    async fn create_notification(&self, notification: Notification) -> Result<()> {
        self.tables.write().await.notifications.push(notification);
        Ok(())
    }
}
