//! Saga rollback through the in-process engine and the in-memory platform.

mod common;

use std::sync::Arc;

use rust_decimal_macros::dec;
use tokio_test::{assert_err, assert_ok};

use common::*;
use pipeline_core::config::SagaConfig;
use pipeline_core::constants::{rpc, services};
use pipeline_core::saga::{InProcessSagaEngine, SagaDispatcher, SagaDispose, TransOptions};
use pipeline_core::services::requests::{GoodStatementRequest, UpdateGoodRequest};
use pipeline_core::services::{GoodStatement, InMemoryPlatform};
use pipeline_core::state_machine::GoodBenefitState;
use pipeline_core::{PipelineError, SagaError};

fn statement(good_id: &str, benefit_date: u32) -> GoodStatement {
    GoodStatement {
        id: format!("{good_id}:{benefit_date}"),
        good_id: good_id.to_string(),
        coin_type_id: "btc".into(),
        benefit_date,
        total_amount: dec!(1000),
        to_user_amount: dec!(500),
        unsold_amount: dec!(500),
    }
}

fn two_step_saga(options: TransOptions) -> SagaDispose {
    let mut dispose = SagaDispose::new(options);
    dispose
        .add(
            services::LEDGER,
            rpc::CREATE_GOOD_STATEMENT,
            rpc::DELETE_GOOD_STATEMENT,
            &GoodStatementRequest {
                statement: statement("g1", DAY),
            },
        )
        .unwrap()
        .add(
            services::GOOD,
            rpc::UPDATE_GOOD,
            "",
            &UpdateGoodRequest {
                id: "g1".into(),
                benefit_state: Some(GoodBenefitState::Done),
                ..Default::default()
            },
        )
        .unwrap();
    dispose
}

fn dispatcher(platform: &Arc<InMemoryPlatform>) -> SagaDispatcher {
    SagaDispatcher::new(Arc::new(InProcessSagaEngine::new(platform.clone())))
}

async fn platform_with_good() -> Arc<InMemoryPlatform> {
    let platform = Arc::new(InMemoryPlatform::new());
    let mut g1 = good("g1", "500");
    g1.benefit_state = GoodBenefitState::BookKeeping;
    platform.insert_good(g1).await;
    platform
}

#[tokio::test]
async fn second_step_failure_compensates_first_step_once() {
    let platform = platform_with_good().await;
    platform.fail_rpc(rpc::UPDATE_GOOD, 1);

    let result = dispatcher(&platform)
        .execute(two_step_saga(TransOptions::default()))
        .await;

    let err = assert_err!(result);
    match err {
        PipelineError::Saga(SagaError::ActionFailed {
            step,
            service,
            action,
            message,
        }) => {
            assert_eq!(step, 2);
            assert_eq!(service, services::GOOD);
            assert_eq!(action, rpc::UPDATE_GOOD);
            assert!(message.contains("unavailable"));
        }
        other => panic!("expected the forward failure, got {other:?}"),
    }

    assert_eq!(
        platform.calls(),
        vec![
            "ledger.v1/CreateGoodStatement",
            "good.v1/UpdateGood",
            "ledger.v1/DeleteGoodStatement",
        ]
    );
    assert!(platform.all_good_statements().await.is_empty());
    assert_eq!(
        platform.good("g1").await.unwrap().benefit_state,
        GoodBenefitState::BookKeeping
    );
}

#[tokio::test]
async fn first_step_failure_needs_no_compensation() {
    let platform = platform_with_good().await;
    platform.fail_rpc(rpc::CREATE_GOOD_STATEMENT, 1);

    let err = assert_err!(
        dispatcher(&platform)
            .execute(two_step_saga(TransOptions::default()))
            .await
    );
    assert!(err.is_transient());
    assert_eq!(platform.calls(), vec!["ledger.v1/CreateGoodStatement"]);
}

#[tokio::test]
async fn exhausted_compensation_keeps_the_forward_error() {
    let platform = platform_with_good().await;
    platform.fail_rpc(rpc::UPDATE_GOOD, 1);
    platform.fail_rpc(rpc::DELETE_GOOD_STATEMENT, 10);

    let options = TransOptions::from(&SagaConfig {
        compensation_attempts: 2,
        retry_interval_ms: 1,
        ..SagaConfig::default()
    });
    let err = assert_err!(dispatcher(&platform).execute(two_step_saga(options)).await);

    let PipelineError::Saga(saga_err) = err else {
        panic!("expected a saga error");
    };
    assert!(matches!(saga_err, SagaError::CompensationFailed { attempts: 2, .. }));
    assert!(matches!(
        saga_err.original(),
        SagaError::ActionFailed { step: 2, .. }
    ));

    let deletes = platform
        .calls()
        .iter()
        .filter(|c| c.ends_with(rpc::DELETE_GOOD_STATEMENT))
        .count();
    assert_eq!(deletes, 2);
}

#[tokio::test]
async fn successful_saga_applies_every_step() {
    let platform = platform_with_good().await;

    assert_ok!(
        dispatcher(&platform)
            .execute(two_step_saga(TransOptions::default()))
            .await
    );

    assert_eq!(platform.all_good_statements().await.len(), 1);
    assert_eq!(
        platform.good("g1").await.unwrap().benefit_state,
        GoodBenefitState::Done
    );
}

#[tokio::test]
async fn reversible_action_after_terminal_is_rejected() {
    let platform = platform_with_good().await;
    let mut dispose = SagaDispose::new(TransOptions::default());
    dispose
        .add(
            services::GOOD,
            rpc::UPDATE_GOOD,
            "",
            &UpdateGoodRequest {
                id: "g1".into(),
                ..Default::default()
            },
        )
        .unwrap()
        .add(
            services::LEDGER,
            rpc::CREATE_GOOD_STATEMENT,
            rpc::DELETE_GOOD_STATEMENT,
            &GoodStatementRequest {
                statement: statement("g1", DAY),
            },
        )
        .unwrap();

    let err = assert_err!(dispatcher(&platform).execute(dispose).await);
    assert!(matches!(
        err,
        PipelineError::Saga(SagaError::ReversibleAfterTerminal { .. })
    ));
    assert!(!err.is_transient());
    assert!(platform.calls().is_empty());
}
