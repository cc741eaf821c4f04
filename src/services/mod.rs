//! # Remote Service Ports
//!
//! The records a pipeline drives are owned by remote services. Scanners and
//! executors read them through these traits; every mutation goes through a
//! saga (see [`requests`] for the saga request bodies).

pub mod in_memory;
pub mod requests;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::error::Result;
use crate::state_machine::{GoodBenefitState, ReviewState, WithdrawState};

pub use in_memory::InMemoryPlatform;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Good {
    pub id: String,
    pub coin_type_id: String,
    /// Units on sale, the reward denominator.
    pub total_units: String,
    pub benefit_state: GoodBenefitState,
    pub benefit_account_id: String,
    /// Mining start, unix seconds.
    pub start_at: u32,
    /// Benefit timestamp of the last reward period.
    pub reward_at: u32,
    pub last_reward_amount: String,
    /// Benefit account balance after the last period.
    pub next_reward_start_amount: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub id: String,
    pub app_id: String,
    pub user_id: String,
    pub good_id: String,
    pub units: String,
    pub start_at: u32,
    pub last_benefit_at: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Coin {
    pub id: String,
    pub name: String,
    /// Kept on every platform account, never paid out.
    pub reserved_amount: String,
    pub withdraw_auto_review_amount: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlatformAccount {
    pub id: String,
    pub coin_type_id: String,
    pub address: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Withdraw {
    pub id: String,
    pub app_id: String,
    pub user_id: String,
    pub coin_type_id: String,
    pub amount: String,
    pub state: WithdrawState,
    pub review_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Review {
    pub id: String,
    pub object_id: String,
    pub state: ReviewState,
    pub auto_reviewed: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GoodStatement {
    pub id: String,
    pub good_id: String,
    pub coin_type_id: String,
    pub benefit_date: u32,
    pub total_amount: Decimal,
    pub to_user_amount: Decimal,
    pub unsold_amount: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerStatement {
    pub id: String,
    pub app_id: String,
    pub user_id: String,
    pub coin_type_id: String,
    pub good_id: String,
    pub order_id: String,
    pub io_sub_type: String,
    pub amount: Decimal,
    pub benefit_date: u32,
    /// JSON detail shown in the user's ledger.
    pub io_extra: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotifResult {
    Success,
    Fail,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub id: String,
    pub subsystem: String,
    pub object_id: String,
    pub result: NotifResult,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RewardAtCond {
    Eq(u32),
    Ne(u32),
}

impl RewardAtCond {
    pub fn matches(&self, reward_at: u32) -> bool {
        match self {
            Self::Eq(ts) => reward_at == *ts,
            Self::Ne(ts) => reward_at != *ts,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct GoodConds {
    pub benefit_state: Option<GoodBenefitState>,
    pub ids: Option<Vec<String>>,
    pub reward_at: Option<RewardAtCond>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct OrderConds {
    pub good_id: Option<String>,
    pub last_benefit_at: Option<u32>,
}

#[async_trait]
pub trait GoodService: Send + Sync {
    async fn get_goods(&self, conds: &GoodConds, offset: u32, limit: u32) -> Result<Vec<Good>>;
    async fn get_good(&self, id: &str) -> Result<Option<Good>>;
}

#[async_trait]
pub trait OrderService: Send + Sync {
    async fn get_orders(&self, conds: &OrderConds, offset: u32, limit: u32) -> Result<Vec<Order>>;
}

#[async_trait]
pub trait StatementService: Send + Sync {
    async fn exist_good_statement(&self, good_id: &str, benefit_date: u32) -> Result<bool>;
    async fn get_good_statements(&self, good_id: &str) -> Result<Vec<GoodStatement>>;
    async fn get_ledger_statements(&self, good_id: &str, benefit_date: u32) -> Result<Vec<LedgerStatement>>;
}

#[async_trait]
pub trait WithdrawService: Send + Sync {
    async fn get_withdraws(&self, state: WithdrawState, offset: u32, limit: u32) -> Result<Vec<Withdraw>>;
    async fn get_withdraw(&self, id: &str) -> Result<Option<Withdraw>>;
}

#[async_trait]
pub trait CoinService: Send + Sync {
    async fn get_coin(&self, coin_type_id: &str) -> Result<Option<Coin>>;
}

#[async_trait]
pub trait AccountService: Send + Sync {
    async fn get_account(&self, id: &str) -> Result<Option<PlatformAccount>>;
    async fn hot_wallet(&self, coin_type_id: &str) -> Result<Option<PlatformAccount>>;
    /// On-chain balance; failures are transient.
    async fn balance(&self, account: &PlatformAccount) -> Result<Decimal>;
}

#[async_trait]
pub trait ReviewService: Send + Sync {
    async fn get_review(&self, id: &str) -> Result<Option<Review>>;
}

#[async_trait]
pub trait NotificationService: Send + Sync {
    async fn create_notification(&self, notification: Notification) -> Result<()>;
}

/// Handles to every remote service a domain module reads from.
#[derive(Clone)]
pub struct Platform {
    pub goods: Arc<dyn GoodService>,
    pub orders: Arc<dyn OrderService>,
    pub statements: Arc<dyn StatementService>,
    pub withdraws: Arc<dyn WithdrawService>,
    pub coins: Arc<dyn CoinService>,
    pub accounts: Arc<dyn AccountService>,
    pub reviews: Arc<dyn ReviewService>,
    pub notifications: Arc<dyn NotificationService>,
}

impl Platform {
    pub fn in_memory(platform: Arc<InMemoryPlatform>) -> Self {
        Self {
            goods: platform.clone(),
            orders: platform.clone(),
            statements: platform.clone(),
            withdraws: platform.clone(),
            coins: platform.clone(),
            accounts: platform.clone(),
            reviews: platform.clone(),
            notifications: platform,
        }
    }
}
