//! # System Constants
//!
//! Operational defaults and the routing keys shared by the reference domain
//! modules and the saga dispatcher.

use std::time::Duration;

/// Page size for offset/limit scans.
pub const DEFAULT_ROW_LIMIT: u32 = 100;

/// Fixed cooldown before a failed entity is re-submitted.
pub const DEFAULT_RETRY_COOLDOWN: Duration = Duration::from_secs(60);

/// Maximum entities in flight per running registry.
pub const DEFAULT_RUNNING_CONCURRENT: usize = 3;

/// An in-flight entry older than this is reported and refreshed.
pub const STALE_RUNNING_THRESHOLD: Duration = Duration::from_secs(60);

/// Completions slower than this are logged as warnings.
pub const SLOW_COMPLETION_THRESHOLD: Duration = Duration::from_secs(10);

/// How often a handler without its subsystem lease tries again.
pub const DEFAULT_LEASE_RETRY_INTERVAL: Duration = Duration::from_secs(60);

pub const DEFAULT_CHANNEL_CAPACITY: usize = 64;

pub const DEFAULT_SCAN_INTERVAL: Duration = Duration::from_secs(10);

/// Benefit period, one day.
pub const DEFAULT_BENEFIT_INTERVAL_SECS: u32 = 86_400;

/// Decimal places kept when splitting rewards.
pub const AMOUNT_SCALE: u32 = 18;

/// Subsystem names, also used as lease keys (`scheduler:<name>`).
pub mod subsystems {
    pub const BENEFIT_WAIT: &str = "benefit_wait";
    pub const BENEFIT_BOOKKEEPING: &str = "benefit_bookkeeping";
    pub const BENEFIT_DONE: &str = "benefit_done";
    pub const BENEFIT_FAIL: &str = "benefit_fail";
    pub const WITHDRAW_REVIEW: &str = "withdraw_review";
}

/// Service domains resolved by the saga engine's registry.
pub mod services {
    pub const GOOD: &str = "good.v1";
    pub const ORDER: &str = "order.v1";
    pub const LEDGER: &str = "ledger.v1";
    pub const WITHDRAW: &str = "withdraw.v1";
    pub const REVIEW: &str = "review.v1";
}

/// RPC names registered as saga actions and compensators.
pub mod rpc {
    pub const UPDATE_GOOD: &str = "UpdateGood";
    pub const CREATE_GOOD_STATEMENT: &str = "CreateGoodStatement";
    pub const DELETE_GOOD_STATEMENT: &str = "DeleteGoodStatement";
    pub const CREATE_STATEMENTS: &str = "CreateStatements";
    pub const DELETE_STATEMENTS: &str = "DeleteStatements";
    pub const UPDATE_ORDERS_BENEFIT: &str = "UpdateOrdersBenefit";
    pub const RESTORE_ORDERS_BENEFIT: &str = "RestoreOrdersBenefit";
    pub const CREATE_REVIEW: &str = "CreateReview";
    pub const DELETE_REVIEW: &str = "DeleteReview";
    pub const UPDATE_WITHDRAW: &str = "UpdateWithdraw";
}
