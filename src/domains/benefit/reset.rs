//! Benefit reset.
//!
//! Goods whose period ended in `done` or `fail` go back to `wait` so the next
//! period can reward them. One subsystem runs per source state; both share
//! this module and the benefit in-flight registry.

use async_trait::async_trait;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::constants::{rpc, services, subsystems};
use crate::domains::DomainContext;
use crate::error::{PipelineError, Result};
use crate::feed::cancelable_feed;
use crate::money::parse_non_negative;
use crate::services::requests::UpdateGoodRequest;
use crate::services::{Good, GoodConds, GoodService, NotifResult};
use crate::stage::notif::{Notifiable, NotificationPersister};
use crate::stage::{
    Exec, ExecSender, ObjectId, Payload, Persistenter, PipelineHandler, Reportable, Route, Routes,
    RunningMap, Scanner, TriggerCond,
};
use crate::state_machine::{GoodBenefitState, StateGraph};

/// Subsystem resetting goods in `from`, if any.
pub fn subsystem_for(from: GoodBenefitState) -> Option<&'static str> {
    match from {
        GoodBenefitState::Done => Some(subsystems::BENEFIT_DONE),
        GoodBenefitState::Fail => Some(subsystems::BENEFIT_FAIL),
        GoodBenefitState::Wait | GoodBenefitState::BookKeeping => None,
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResetEnvelope {
    pub good: Good,
    pub from: GoodBenefitState,
    pub failure: Option<String>,
}

impl ObjectId for ResetEnvelope {
    fn object_id(&self) -> String {
        self.good.id.clone()
    }
}

impl Reportable for ResetEnvelope {
    fn record_failure(&mut self, message: String) {
        self.failure = Some(message);
    }
}

impl Notifiable for ResetEnvelope {
    fn notification(&self) -> (NotifResult, String) {
        match &self.failure {
            Some(message) => (
                NotifResult::Fail,
                format!("reset of good {} failed: {message}", self.good.id),
            ),
            None => (
                NotifResult::Success,
                format!(
                    "good {} closed period {} as {}, waiting for the next one",
                    self.good.id, self.good.reward_at, self.from
                ),
            ),
        }
    }
}

pub struct ResetScanner {
    goods: Arc<dyn GoodService>,
    from: GoodBenefitState,
    row_limit: u32,
}

impl ResetScanner {
    pub fn new(goods: Arc<dyn GoodService>, from: GoodBenefitState, row_limit: u32) -> Self {
        Self {
            goods,
            from,
            row_limit: row_limit.max(1),
        }
    }

    async fn scan_goods(
        &self,
        token: &CancellationToken,
        conds: GoodConds,
        exec: &ExecSender<Good, ResetEnvelope>,
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
impl Scanner<Good, ResetEnvelope> for ResetScanner {
    async fn scan(&self, token: &CancellationToken, exec: &ExecSender<Good, ResetEnvelope>) -> Result<()> {
        let conds = GoodConds {
            benefit_state: Some(self.from),
            ..Default::default()
        };
        self.scan_goods(token, conds, exec).await
    }

    async fn trigger_scan(
        &self,
        token: &CancellationToken,
        cond: &TriggerCond,
        exec: &ExecSender<Good, ResetEnvelope>,
    ) -> Result<()> {
        let conds = GoodConds {
            benefit_state: Some(self.from),
            ids: (!cond.object_ids.is_empty()).then(|| cond.object_ids.clone()),
            reward_at: None,
        };
        self.scan_goods(token, conds, exec).await
    }
}

/// Checks that the amounts the next period starts from are readable.
pub struct ResetExecutor {
    from: GoodBenefitState,
}

impl ResetExecutor {
    pub fn new(from: GoodBenefitState) -> Self {
        Self { from }
    }
}

#[async_trait]
impl Exec<Good, ResetEnvelope> for ResetExecutor {
    async fn exec(
        &self,
        _token: &CancellationToken,
        payload: Payload<Good, ResetEnvelope>,
        routes: &Routes<Good, ResetEnvelope>,
    ) -> Result<()> {
        let good = match &payload {
            Payload::Entity(good) => good.clone(),
            Payload::Triggered(triggered) => triggered.entity.clone(),
            Payload::Envelope(_) => return Ok(()),
        };
        let envelope = ResetEnvelope {
            good,
            from: self.from,
            failure: None,
        };

        let checked = parse_non_negative(
            "next_reward_start_amount",
            &envelope.good.next_reward_start_amount,
        )
        .and_then(|_| parse_non_negative("last_reward_amount", &envelope.good.last_reward_amount));
        let route = match checked {
            Ok(_) => Route::Persistent(envelope),
            Err(err) => {
                warn!(good_id = %envelope.good.id, from = %self.from, error = %err, "Benefit reset rejected");
                Route::failed(&err, envelope, payload)
            }
        };
        routes.dispatch(route);
        Ok(())
    }
}

pub struct ResetPersistent {
    ctx: DomainContext,
}

impl ResetPersistent {
    pub fn new(ctx: DomainContext) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl Persistenter<Good, ResetEnvelope> for ResetPersistent {
    async fn update(
        &self,
        _token: &CancellationToken,
        envelope: &ResetEnvelope,
        routes: &Routes<Good, ResetEnvelope>,
    ) -> Result<()> {
        let good_id = &envelope.good.id;
        let current = self
            .ctx
            .platform
            .goods
            .get_good(good_id)
            .await?
            .ok_or_else(|| PipelineError::not_found("good", good_id))?;
        if current.benefit_state != envelope.from || current.reward_at != envelope.good.reward_at {
            return Err(PipelineError::Duplicate {
                key: format!("{good_id}:{}:{}", envelope.from, envelope.good.reward_at),
            });
        }
        current.benefit_state.ensure_transition(GoodBenefitState::Wait)?;

        let mut dispose = self.ctx.saga();
        dispose.add(
            services::GOOD,
            rpc::UPDATE_GOOD,
            "",
            &UpdateGoodRequest {
                id: good_id.clone(),
                benefit_state: Some(GoodBenefitState::Wait),
                ..Default::default()
            },
        )?;
        self.ctx.dispatcher.execute(dispose).await?;

        info!(good_id = %good_id, from = %envelope.from, reward_at = current.reward_at, "Good back to wait");
        if envelope.from == GoodBenefitState::Done {
            routes.to_notif(envelope.clone());
        }
        Ok(())
    }
}

pub fn build(
    ctx: &DomainContext,
    from: GoodBenefitState,
    running: Arc<RunningMap>,
    token: &CancellationToken,
) -> Result<Option<PipelineHandler<Good, ResetEnvelope>>> {
    let subsystem = subsystem_for(from)
        .ok_or_else(|| PipelineError::Configuration(format!("no reset subsystem for {from} goods")))?;
    let row_limit = ctx.row_limit();
    PipelineHandler::<Good, ResetEnvelope>::builder()
        .subsystem(subsystem)
        .scanner(Arc::new(ResetScanner::new(ctx.platform.goods.clone(), from, row_limit)))
        .exec(Arc::new(ResetExecutor::new(from)))
        .persistenter(Arc::new(ResetPersistent::new(ctx.clone())))
        .notify(Arc::new(NotificationPersister::new(
            subsystem,
            ctx.platform.notifications.clone(),
        )))
        .running(running)
        .lease(ctx.lease.clone())
        .config(&ctx.config)
        .build(token)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PipelineConfig;
    use crate::domains::benefit::fixtures::*;
    use crate::saga::{InProcessSagaEngine, SagaDispatcher};
    use crate::services::{InMemoryPlatform, Platform};
    use crate::stage::routing::test_routes::routes;
    use std::time::Duration;

    async fn seeded(state: GoodBenefitState) -> Arc<InMemoryPlatform> {
        let platform = Arc::new(InMemoryPlatform::new());
        let mut g = good("g1", state);
        g.reward_at = 11 * DAY;
        g.last_reward_amount = "1000".into();
        g.next_reward_start_amount = "1000".into();
        platform.insert_good(g).await;
        platform.insert_good(good("g2", GoodBenefitState::BookKeeping)).await;
        platform
    }

    fn ctx(platform: &Arc<InMemoryPlatform>) -> DomainContext {
        DomainContext::new(
            Platform::in_memory(platform.clone()),
            SagaDispatcher::new(Arc::new(InProcessSagaEngine::new(platform.clone()))),
            PipelineConfig::default(),
        )
    }

    #[test]
    fn test_only_closing_states_have_a_subsystem() {
        assert_eq!(subsystem_for(GoodBenefitState::Done), Some(subsystems::BENEFIT_DONE));
        assert_eq!(subsystem_for(GoodBenefitState::Fail), Some(subsystems::BENEFIT_FAIL));
        assert_eq!(subsystem_for(GoodBenefitState::Wait), None);
    }

    #[tokio::test]
    async fn test_scanner_selects_source_state_only() {
        let platform = seeded(GoodBenefitState::Done).await;
        let scanner = ResetScanner::new(platform.clone(), GoodBenefitState::Done, 1);
        let (tx, mut rx) = tokio::sync::mpsc::channel(8);
        let token = CancellationToken::new();

        scanner.scan(&token, &tx).await.unwrap();
        assert_eq!(rx.recv().await.unwrap().object_id(), "g1");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_done_good_returns_to_wait_and_notifies() {
        let platform = seeded(GoodBenefitState::Done).await;
        let persistent = ResetPersistent::new(ctx(&platform));
        let token = CancellationToken::new();
        let (routes, mut ch) = routes::<Good, ResetEnvelope>(&token, Duration::from_secs(60));

        ResetExecutor::new(GoodBenefitState::Done)
            .exec(&token, Payload::Entity(platform.good("g1").await.unwrap()), &routes)
            .await
            .unwrap();
        let envelope = ch.persistent.recv().await.unwrap();
        persistent.update(&token, &envelope, &routes).await.unwrap();

        let good = platform.good("g1").await.unwrap();
        assert_eq!(good.benefit_state, GoodBenefitState::Wait);
        assert_eq!(good.reward_at, 11 * DAY);
        assert_eq!(good.next_reward_start_amount, "1000");
        assert_eq!(ch.notif.recv().await.unwrap().notification().0, NotifResult::Success);

        let err = persistent.update(&token, &envelope, &routes).await.unwrap_err();
        assert!(matches!(err, PipelineError::Duplicate { .. }));
    }

    #[tokio::test]
    async fn test_failed_good_returns_to_wait_quietly() {
        let platform = seeded(GoodBenefitState::Fail).await;
        let persistent = ResetPersistent::new(ctx(&platform));
        let token = CancellationToken::new();
        let (routes, mut ch) = routes::<Good, ResetEnvelope>(&token, Duration::from_secs(60));

        let envelope = ResetEnvelope {
            good: platform.good("g1").await.unwrap(),
            from: GoodBenefitState::Fail,
            failure: None,
        };
        persistent.update(&token, &envelope, &routes).await.unwrap();

        assert_eq!(
            platform.good("g1").await.unwrap().benefit_state,
            GoodBenefitState::Wait
        );
        tokio::task::yield_now().await;
        assert!(ch.notif.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_unreadable_start_amount_is_reported() {
        let platform = seeded(GoodBenefitState::Done).await;
        let token = CancellationToken::new();
        let (routes, mut ch) = routes::<Good, ResetEnvelope>(&token, Duration::from_secs(60));

        let mut good = platform.good("g1").await.unwrap();
        good.next_reward_start_amount = "1,000".into();
        ResetExecutor::new(GoodBenefitState::Done)
            .exec(&token, Payload::Entity(good), &routes)
            .await
            .unwrap();

        let envelope = ch.notif.recv().await.unwrap();
        assert_eq!(
            envelope.failure.as_deref(),
            Some("invalid amount in next_reward_start_amount")
        );
        assert_eq!(ch.done.recv().await.unwrap().object_id(), "g1");
        assert!(ch.persistent.try_recv().is_err());
    }
}
