//! Withdraw review.
//!
//! A withdrawal in `reviewing` follows its manual review once an operator
//! decided it. While the review is still pending, withdrawals above the coin's
//! auto-review threshold are approved automatically and moved to
//! `transferring`, provided the hot wallet can cover them. Smaller amounts
//! wait for the operator.
//!
//! The hot wallet must cover the amount on top of the coin's reserve and of
//! every withdrawal already approved against it. The check runs once in the
//! executor and again in the commit, under the wallet's account lock, which
//! is held until the new state is written.

use async_trait::async_trait;
use rust_decimal::Decimal;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::constants::{rpc, services, subsystems};
use crate::domains::DomainContext;
use crate::error::{PipelineError, Result};
use crate::feed::cancelable_feed;
use crate::locks::{KeyedGuard, KeyedLocks};
use crate::money::parse_non_negative;
use crate::services::requests::{ReviewRequest, UpdateWithdrawRequest};
use crate::services::{NotifResult, Platform, Review, Withdraw, WithdrawService};
use crate::stage::notif::{Notifiable, NotificationPersister};
use crate::stage::{
    Exec, ExecSender, ObjectId, Payload, Persistenter, PipelineHandler, Reportable, Route, Routes,
    Scanner, TriggerCond,
};
use crate::state_machine::{ReviewState, StateGraph, WithdrawState};

#[derive(Debug, Clone, PartialEq)]
pub struct ReviewEnvelope {
    pub withdraw: Withdraw,
    pub new_state: WithdrawState,
    /// Review to write; set only by an auto-review.
    pub review: Option<Review>,
    pub previous_review: Option<Review>,
    pub failure: Option<String>,
}

impl ReviewEnvelope {
    fn new(withdraw: Withdraw) -> Self {
        Self {
            new_state: withdraw.state,
            withdraw,
            review: None,
            previous_review: None,
            failure: None,
        }
    }

    pub fn auto_reviewed(&self) -> bool {
        self.review.as_ref().is_some_and(|r| r.auto_reviewed)
    }
}

impl ObjectId for ReviewEnvelope {
    fn object_id(&self) -> String {
        self.withdraw.id.clone()
    }
}

impl Reportable for ReviewEnvelope {
    fn record_failure(&mut self, message: String) {
        self.failure = Some(message);
    }
}

impl Notifiable for ReviewEnvelope {
    fn notification(&self) -> (NotifResult, String) {
        match &self.failure {
            Some(message) => (
                NotifResult::Fail,
                format!("review of withdraw {} failed: {message}", self.withdraw.id),
            ),
            None if self.auto_reviewed() => (
                NotifResult::Success,
                format!(
                    "withdraw {} of {} auto-approved",
                    self.withdraw.id, self.withdraw.amount
                ),
            ),
            None => (
                NotifResult::Success,
                format!("withdraw {} moved to {}", self.withdraw.id, self.new_state),
            ),
        }
    }
}

pub struct ReviewScanner {
    withdraws: Arc<dyn WithdrawService>,
    row_limit: u32,
}

impl ReviewScanner {
    pub fn new(withdraws: Arc<dyn WithdrawService>, row_limit: u32) -> Self {
        Self {
            withdraws,
            row_limit: row_limit.max(1),
        }
    }

    async fn scan_reviewing(
        &self,
        token: &CancellationToken,
        cond: Option<&TriggerCond>,
        exec: &ExecSender<Withdraw, ReviewEnvelope>,
    ) -> Result<()> {
        let mut offset = 0;
        loop {
            let withdraws = self
                .withdraws
                .get_withdraws(WithdrawState::Reviewing, offset, self.row_limit)
                .await?;
            if withdraws.is_empty() {
                return Ok(());
            }
            for withdraw in withdraws {
                let payload = match cond {
                    Some(cond) if !cond.contains(&withdraw.id) => continue,
                    Some(cond) => Payload::triggered(withdraw, cond.checkpoint),
                    None => Payload::Entity(withdraw),
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
impl Scanner<Withdraw, ReviewEnvelope> for ReviewScanner {
    async fn scan(&self, token: &CancellationToken, exec: &ExecSender<Withdraw, ReviewEnvelope>) -> Result<()> {
        self.scan_reviewing(token, None, exec).await
    }

    async fn trigger_scan(
        &self,
        token: &CancellationToken,
        cond: &TriggerCond,
        exec: &ExecSender<Withdraw, ReviewEnvelope>,
    ) -> Result<()> {
        self.scan_reviewing(token, Some(cond), exec).await
    }
}

/// Withdrawals in these states will leave the hot wallet but have not yet.
const PENDING_SPEND_STATES: [WithdrawState; 2] = [WithdrawState::Approved, WithdrawState::Transferring];

/// Total amount of `coin_type_id` withdrawals approved but not yet sent,
/// leaving out `exclude_id`.
pub async fn pending_spend(
    withdraws: &dyn WithdrawService,
    coin_type_id: &str,
    exclude_id: &str,
    row_limit: u32,
) -> Result<Decimal> {
    let row_limit = row_limit.max(1);
    let mut total = Decimal::ZERO;
    for state in PENDING_SPEND_STATES {
        let mut offset = 0;
        loop {
            let page = withdraws.get_withdraws(state, offset, row_limit).await?;
            if page.is_empty() {
                break;
            }
            for withdraw in page
                .iter()
                .filter(|w| w.coin_type_id == coin_type_id && w.id != exclude_id)
            {
                total += parse_non_negative("amount", &withdraw.amount)?;
            }
            offset += row_limit;
        }
    }
    Ok(total)
}

/// Locks the coin's hot wallet and checks that it covers `amount`.
///
/// Hold the returned guard until the approval is committed, otherwise a
/// concurrent review can spend the same balance.
async fn cover_from_hot_wallet(
    platform: &Platform,
    locks: &KeyedLocks,
    withdraw: &Withdraw,
    amount: Decimal,
    reserved: Decimal,
    row_limit: u32,
) -> Result<KeyedGuard> {
    let hot = platform
        .accounts
        .hot_wallet(&withdraw.coin_type_id)
        .await?
        .ok_or_else(|| PipelineError::not_found("hot wallet", &withdraw.coin_type_id))?;
    let guard = locks.lock(&hot.id).await;
    let balance = platform.accounts.balance(&hot).await?;
    let pending = pending_spend(
        &*platform.withdraws,
        &withdraw.coin_type_id,
        &withdraw.id,
        row_limit,
    )
    .await?;
    if balance <= amount + reserved + pending {
        debug!(
            withdraw_id = %withdraw.id,
            %balance,
            %amount,
            %reserved,
            %pending,
            "Hot wallet cannot cover withdraw"
        );
        return Err(PipelineError::BusinessRule("insufficient funds".into()));
    }
    Ok(guard)
}

pub struct ReviewExecutor {
    platform: Platform,
    locks: KeyedLocks,
    row_limit: u32,
}

impl ReviewExecutor {
    pub fn new(platform: Platform, locks: KeyedLocks, row_limit: u32) -> Self {
        Self {
            platform,
            locks,
            row_limit: row_limit.max(1),
        }
    }

    /// Returns `false` while the withdrawal waits for an operator.
    async fn compute(&self, envelope: &mut ReviewEnvelope) -> Result<bool> {
        let withdraw = &envelope.withdraw;
        let existing = match &withdraw.review_id {
            Some(id) => Some(
                self.platform
                    .reviews
                    .get_review(id)
                    .await?
                    .ok_or_else(|| PipelineError::not_found("review", id))?,
            ),
            None => None,
        };
        match existing.as_ref().map(|r| r.state) {
            Some(ReviewState::Approved) => {
                envelope.new_state = WithdrawState::Approved;
                return Ok(true);
            }
            Some(ReviewState::Rejected) => {
                envelope.new_state = WithdrawState::PreRejected;
                return Ok(true);
            }
            Some(ReviewState::Wait) | None => {}
        }

        let amount = parse_non_negative("amount", &withdraw.amount)?;
        let coin = self
            .platform
            .coins
            .get_coin(&withdraw.coin_type_id)
            .await?
            .ok_or_else(|| PipelineError::not_found("coin", &withdraw.coin_type_id))?;
        let threshold = parse_non_negative("withdraw_auto_review_amount", &coin.withdraw_auto_review_amount)?;
        if amount <= threshold {
            debug!(withdraw_id = %withdraw.id, %amount, %threshold, "Awaiting manual review");
            return Ok(false);
        }
        let reserved = parse_non_negative("reserved_amount", &coin.reserved_amount)?;
        // Early check only; the commit checks again under the same lock
        cover_from_hot_wallet(&self.platform, &self.locks, withdraw, amount, reserved, self.row_limit).await?;

        let review = Review {
            id: existing
                .as_ref()
                .map(|r| r.id.clone())
                .unwrap_or_else(|| Uuid::new_v4().to_string()),
            object_id: withdraw.id.clone(),
            state: ReviewState::Approved,
            auto_reviewed: true,
        };
        envelope.new_state = WithdrawState::Transferring;
        envelope.review = Some(review);
        envelope.previous_review = existing;
        Ok(true)
    }
}

#[async_trait]
impl Exec<Withdraw, ReviewEnvelope> for ReviewExecutor {
    async fn exec(
        &self,
        _token: &CancellationToken,
        payload: Payload<Withdraw, ReviewEnvelope>,
        routes: &Routes<Withdraw, ReviewEnvelope>,
    ) -> Result<()> {
        let withdraw = match &payload {
            Payload::Entity(withdraw) => withdraw.clone(),
            Payload::Triggered(triggered) => triggered.entity.clone(),
            Payload::Envelope(_) => return Ok(()),
        };
        let mut envelope = ReviewEnvelope::new(withdraw);

        let route = match self.compute(&mut envelope).await {
            Ok(true) => Route::Persistent(envelope),
            Ok(false) => Route::Done(payload),
            Err(err) => {
                warn!(withdraw_id = %envelope.withdraw.id, error = %err, "Withdraw review failed");
                Route::failed(&err, envelope, payload)
            }
        };
        routes.dispatch(route);
        Ok(())
    }
}

pub struct ReviewPersistent {
    ctx: DomainContext,
}

impl ReviewPersistent {
    pub fn new(ctx: DomainContext) -> Self {
        Self { ctx }
    }

    async fn cover(&self, withdraw: &Withdraw) -> Result<KeyedGuard> {
        let coin = self
            .ctx
            .platform
            .coins
            .get_coin(&withdraw.coin_type_id)
            .await?
            .ok_or_else(|| PipelineError::not_found("coin", &withdraw.coin_type_id))?;
        let amount = parse_non_negative("amount", &withdraw.amount)?;
        let reserved = parse_non_negative("reserved_amount", &coin.reserved_amount)?;
        cover_from_hot_wallet(
            &self.ctx.platform,
            &self.ctx.account_locks,
            withdraw,
            amount,
            reserved,
            self.ctx.row_limit(),
        )
        .await
    }
}

#[async_trait]
impl Persistenter<Withdraw, ReviewEnvelope> for ReviewPersistent {
    async fn update(
        &self,
        _token: &CancellationToken,
        envelope: &ReviewEnvelope,
        routes: &Routes<Withdraw, ReviewEnvelope>,
    ) -> Result<()> {
        let withdraw_id = &envelope.withdraw.id;
        let current = self
            .ctx
            .platform
            .withdraws
            .get_withdraw(withdraw_id)
            .await?
            .ok_or_else(|| PipelineError::not_found("withdraw", withdraw_id))?;
        if current.state != WithdrawState::Reviewing {
            return Err(PipelineError::Duplicate {
                key: format!("{withdraw_id}:{}", current.state),
            });
        }
        current.state.ensure_transition(envelope.new_state)?;
        let _hot_wallet = if envelope.auto_reviewed() {
            Some(self.cover(&current).await?)
        } else {
            None
        };

        let mut dispose = self.ctx.saga();
        if let Some(review) = &envelope.review {
            dispose.add(
                services::REVIEW,
                rpc::CREATE_REVIEW,
                rpc::DELETE_REVIEW,
                &ReviewRequest {
                    review: review.clone(),
                    previous: envelope.previous_review.clone(),
                },
            )?;
        }
        dispose.add(
            services::WITHDRAW,
            rpc::UPDATE_WITHDRAW,
            "",
            &UpdateWithdrawRequest {
                id: withdraw_id.clone(),
                state: envelope.new_state,
                review_id: envelope.review.as_ref().map(|r| r.id.clone()),
            },
        )?;
        self.ctx.dispatcher.execute(dispose).await?;

        if envelope.auto_reviewed() {
            info!(withdraw_id = %withdraw_id, amount = %envelope.withdraw.amount, "Withdraw auto-approved");
            routes.to_notif(envelope.clone());
        }
        Ok(())
    }
}

pub fn build(ctx: &DomainContext, token: &CancellationToken) -> Result<Option<PipelineHandler<Withdraw, ReviewEnvelope>>> {
    let row_limit = ctx.row_limit();
    PipelineHandler::<Withdraw, ReviewEnvelope>::builder()
        .subsystem(subsystems::WITHDRAW_REVIEW)
        .scanner(Arc::new(ReviewScanner::new(ctx.platform.withdraws.clone(), row_limit)))
        .exec(Arc::new(ReviewExecutor::new(
            ctx.platform.clone(),
            ctx.account_locks.clone(),
            row_limit,
        )))
        .persistenter(Arc::new(ReviewPersistent::new(ctx.clone())))
        .notify(Arc::new(NotificationPersister::new(
            subsystems::WITHDRAW_REVIEW,
            ctx.platform.notifications.clone(),
        )))
        .lease(ctx.lease.clone())
        .config(&ctx.config)
        .build(token)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PipelineConfig;
    use crate::saga::{InProcessSagaEngine, SagaDispatcher};
    use crate::services::{Coin, InMemoryPlatform, PlatformAccount};
    use crate::stage::routing::test_routes::routes;
    use rust_decimal_macros::dec;
    use std::time::Duration;

    fn withdraw(id: &str, amount: &str) -> Withdraw {
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

    async fn seeded(hot_balance: rust_decimal::Decimal) -> Arc<InMemoryPlatform> {
        let platform = Arc::new(InMemoryPlatform::new());
        platform
            .insert_coin(Coin {
                id: "btc".into(),
                name: "bitcoin".into(),
                reserved_amount: "1".into(),
                withdraw_auto_review_amount: "50".into(),
            })
            .await;
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

    fn executor(platform: &Arc<InMemoryPlatform>) -> ReviewExecutor {
        ReviewExecutor::new(Platform::in_memory(platform.clone()), KeyedLocks::new(), 10)
    }

    #[tokio::test]
    async fn test_amount_above_threshold_is_auto_approved() {
        let platform = seeded(dec!(1000)).await;
        let token = CancellationToken::new();
        let (routes, mut ch) = routes::<Withdraw, ReviewEnvelope>(&token, Duration::from_secs(60));

        executor(&platform)
            .exec(&token, Payload::Entity(withdraw("w1", "100")), &routes)
            .await
            .unwrap();

        let envelope = ch.persistent.recv().await.unwrap();
        assert_eq!(envelope.new_state, WithdrawState::Transferring);
        assert!(envelope.auto_reviewed());
        assert_eq!(envelope.review.unwrap().state, ReviewState::Approved);
    }

    #[tokio::test]
    async fn test_amount_at_threshold_waits_for_operator() {
        let platform = seeded(dec!(1000)).await;
        let token = CancellationToken::new();
        let (routes, mut ch) = routes::<Withdraw, ReviewEnvelope>(&token, Duration::from_secs(60));

        executor(&platform)
            .exec(&token, Payload::Entity(withdraw("w1", "50")), &routes)
            .await
            .unwrap();

        assert_eq!(ch.done.recv().await.unwrap().object_id(), "w1");
        assert!(ch.persistent.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_manual_rejection_is_followed() {
        let platform = seeded(dec!(1000)).await;
        platform
            .insert_review(Review {
                id: "r1".into(),
                object_id: "w1".into(),
                state: ReviewState::Rejected,
                auto_reviewed: false,
            })
            .await;
        let token = CancellationToken::new();
        let (routes, mut ch) = routes::<Withdraw, ReviewEnvelope>(&token, Duration::from_secs(60));

        let mut w = withdraw("w1", "100");
        w.review_id = Some("r1".into());
        executor(&platform).exec(&token, Payload::Entity(w), &routes).await.unwrap();

        let envelope = ch.persistent.recv().await.unwrap();
        assert_eq!(envelope.new_state, WithdrawState::PreRejected);
        assert!(envelope.review.is_none());
    }

    #[tokio::test]
    async fn test_insufficient_hot_wallet_notifies() {
        let platform = seeded(dec!(100.5)).await;
        let token = CancellationToken::new();
        let (routes, mut ch) = routes::<Withdraw, ReviewEnvelope>(&token, Duration::from_secs(60));

        executor(&platform)
            .exec(&token, Payload::Entity(withdraw("w1", "100")), &routes)
            .await
            .unwrap();

        let envelope = ch.notif.recv().await.unwrap();
        assert_eq!(envelope.failure.as_deref(), Some("insufficient funds"));
        assert_eq!(ch.done.recv().await.unwrap().object_id(), "w1");
    }

    #[tokio::test]
    async fn test_commit_writes_review_then_withdraw() {
        let platform = seeded(dec!(1000)).await;
        platform.insert_withdraw(withdraw("w1", "100")).await;
        let ctx = DomainContext::new(
            Platform::in_memory(platform.clone()),
            SagaDispatcher::new(Arc::new(InProcessSagaEngine::new(platform.clone()))),
            PipelineConfig::default(),
        );
        let token = CancellationToken::new();
        let (routes, mut ch) = routes::<Withdraw, ReviewEnvelope>(&token, Duration::from_secs(60));

        executor(&platform)
            .exec(&token, Payload::Entity(withdraw("w1", "100")), &routes)
            .await
            .unwrap();
        let envelope = ch.persistent.recv().await.unwrap();
        ReviewPersistent::new(ctx.clone())
            .update(&token, &envelope, &routes)
            .await
            .unwrap();

        let stored = platform.withdraw("w1").await.unwrap();
        assert_eq!(stored.state, WithdrawState::Transferring);
        assert_eq!(platform.reviews_for("w1").await.len(), 1);
        assert!(ch.notif.recv().await.unwrap().auto_reviewed());

        let err = ReviewPersistent::new(ctx)
            .update(&token, &envelope, &routes)
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Duplicate { .. }));
    }

    #[tokio::test]
    async fn test_concurrent_approvals_cannot_overdraw_hot_wallet() {
        // Covers one withdrawal of 100 plus the reserve, not two
        let platform = seeded(dec!(120)).await;
        platform.insert_withdraw(withdraw("w1", "100")).await;
        platform.insert_withdraw(withdraw("w2", "100")).await;
        let ctx = DomainContext::new(
            Platform::in_memory(platform.clone()),
            SagaDispatcher::new(Arc::new(InProcessSagaEngine::new(platform.clone()))),
            PipelineConfig::default(),
        );
        let exec = ReviewExecutor::new(ctx.platform.clone(), ctx.account_locks.clone(), 10);
        let persistent = ReviewPersistent::new(ctx);
        let token = CancellationToken::new();
        let (routes, mut ch) = routes::<Withdraw, ReviewEnvelope>(&token, Duration::from_secs(60));

        let (first, second) = tokio::join!(
            exec.exec(&token, Payload::Entity(withdraw("w1", "100")), &routes),
            exec.exec(&token, Payload::Entity(withdraw("w2", "100")), &routes),
        );
        first.unwrap();
        second.unwrap();
        // Both pass the early check, nothing is committed yet
        let a = ch.persistent.recv().await.unwrap();
        let b = ch.persistent.recv().await.unwrap();

        let (a_result, b_result) = tokio::join!(
            persistent.update(&token, &a, &routes),
            persistent.update(&token, &b, &routes),
        );
        let results = [a_result, b_result];
        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        let err = results.into_iter().find_map(|r| r.err()).unwrap();
        assert_eq!(err.user_message(), "insufficient funds");

        let mut states = vec![
            platform.withdraw("w1").await.unwrap().state,
            platform.withdraw("w2").await.unwrap().state,
        ];
        states.sort_by_key(|s| s.to_string());
        assert_eq!(states, vec![WithdrawState::Reviewing, WithdrawState::Transferring]);
    }

    #[tokio::test]
    async fn test_pending_spend_counts_only_approved_withdraws_of_the_coin() {
        let platform = seeded(dec!(1000)).await;
        let mut approved = withdraw("w1", "10");
        approved.state = WithdrawState::Approved;
        let mut transferring = withdraw("w2", "20.5");
        transferring.state = WithdrawState::Transferring;
        let mut other_coin = withdraw("w3", "40");
        other_coin.state = WithdrawState::Transferring;
        other_coin.coin_type_id = "eth".into();
        platform.insert_withdraw(approved).await;
        platform.insert_withdraw(transferring).await;
        platform.insert_withdraw(other_coin).await;
        platform.insert_withdraw(withdraw("w4", "80")).await;

        let pending = pending_spend(&*platform, "btc", "w9", 1).await.unwrap();
        assert_eq!(pending, dec!(30.5));
        let pending = pending_spend(&*platform, "btc", "w2", 1).await.unwrap();
        assert_eq!(pending, dec!(10));
    }
}
