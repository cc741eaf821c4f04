//! Shared helpers for the integration tests.
#![allow(dead_code)]

use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rust_decimal::Decimal;

use pipeline_core::config::PipelineConfig;
use pipeline_core::domains::benefit::Clock;
use pipeline_core::domains::DomainContext;
use pipeline_core::saga::{InProcessSagaEngine, SagaDispatcher};
use pipeline_core::services::{
    Coin, Good, InMemoryPlatform, Order, Platform, PlatformAccount, Withdraw,
};
use pipeline_core::state_machine::{GoodBenefitState, WithdrawState};

pub const DAY: u32 = 86_400;

/// Config with short intervals so the stage loops turn over quickly.
pub fn fast_config() -> PipelineConfig {
    let mut config = PipelineConfig::default();
    config.scan.interval_ms = 20;
    config.retry.cooldown_ms = 100;
    config.pipeline.finalize_timeout_ms = 1_000;
    config.pipeline.lease_retry_interval_ms = 20;
    config.saga.retry_interval_ms = 10;
    config
}

pub fn context(platform: &Arc<InMemoryPlatform>, config: PipelineConfig) -> DomainContext {
    DomainContext::new(
        Platform::in_memory(platform.clone()),
        SagaDispatcher::new(Arc::new(InProcessSagaEngine::new(platform.clone()))),
        config,
    )
}

pub fn manual_clock(start: u32) -> (Clock, Arc<AtomicU32>) {
    let now = Arc::new(AtomicU32::new(start));
    let reader = now.clone();
    (Arc::new(move || reader.load(Ordering::SeqCst)), now)
}

pub fn coin(reserved: &str, auto_review: &str) -> Coin {
    Coin {
        id: "btc".into(),
        name: "bitcoin".into(),
        reserved_amount: reserved.into(),
        withdraw_auto_review_amount: auto_review.into(),
    }
}

pub fn good(id: &str, total_units: &str) -> Good {
    Good {
        id: id.to_string(),
        coin_type_id: "btc".into(),
        total_units: total_units.into(),
        benefit_state: GoodBenefitState::Wait,
        benefit_account_id: format!("benefit-{id}"),
        start_at: 0,
        reward_at: 0,
        last_reward_amount: "0".into(),
        next_reward_start_amount: "0".into(),
    }
}

pub fn order(id: &str, good_id: &str, units: &str) -> Order {
    Order {
        id: id.to_string(),
        app_id: "app".into(),
        user_id: format!("user-{id}"),
        good_id: good_id.to_string(),
        units: units.to_string(),
        start_at: 0,
        last_benefit_at: 0,
    }
}

pub fn withdraw(id: &str, amount: &str) -> Withdraw {
    Withdraw {
        id: id.to_string(),
        app_id: "app".into(),
        user_id: "user".into(),
        coin_type_id: "btc".into(),
        amount: amount.to_string(),
        state: WithdrawState::Reviewing,
        review_id: None,
    }
}

/// Platform holding one good with two orders (100 and 150 units) and a
/// benefit account with `balance`.
pub async fn benefit_platform(balance: Decimal) -> Arc<InMemoryPlatform> {
    let platform = Arc::new(InMemoryPlatform::new());
    platform.insert_coin(coin("0", "50")).await;
    platform
        .insert_account(
            PlatformAccount {
                id: "benefit-g1".into(),
                coin_type_id: "btc".into(),
                address: "bc1-benefit".into(),
            },
            balance,
        )
        .await;
    platform.insert_good(good("g1", "500")).await;
    platform.insert_order(order("o1", "g1", "100")).await;
    platform.insert_order(order("o2", "g1", "150")).await;
    platform
}

/// Platform with an auto-review threshold of 50 and a hot wallet holding
/// `hot_balance`.
pub async fn withdraw_platform(hot_balance: Decimal) -> Arc<InMemoryPlatform> {
    let platform = Arc::new(InMemoryPlatform::new());
    platform.insert_coin(coin("1", "50")).await;
    platform
        .insert_account(
            PlatformAccount {
                id: "hot-btc".into(),
                coin_type_id: "btc".into(),
                address: "bc1-hot".into(),
            },
            hot_balance,
        )
        .await;
    platform.set_hot_wallet("btc", "hot-btc").await;
    platform
}

/// Poll `check` until it holds or `timeout` elapses.
pub async fn eventually<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
