//! Shutdown behavior of feeds, retries and running handlers.

mod common;

use std::time::Duration;

use rust_decimal_macros::dec;
use tokio::sync::mpsc;
use tokio_test::assert_ok;
use tokio_util::sync::CancellationToken;

use common::*;
use pipeline_core::constants::rpc;
use pipeline_core::domains::withdraw;
use pipeline_core::state_machine::WithdrawState;
use pipeline_core::{async_feed, cancelable_feed, retry, FeedOutcome, RetryScheduler};

#[tokio::test]
async fn blocked_feed_is_abandoned_on_cancel() {
    let token = CancellationToken::new();
    let (tx, mut rx) = mpsc::channel(1);
    tx.send("first").await.unwrap();

    let handle = async_feed(&token, "second", &tx);
    tokio::task::yield_now().await;
    assert!(!handle.is_finished());

    token.cancel();
    assert_eq!(assert_ok!(handle.await), FeedOutcome::Abandoned);
    assert_eq!(rx.recv().await, Some("first"));
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn feed_to_closed_stage_reports_closed() {
    let token = CancellationToken::new();
    let (tx, rx) = mpsc::channel::<u32>(1);
    drop(rx);

    assert_eq!(cancelable_feed(&token, 1, &tx).await, FeedOutcome::Closed);
}

#[tokio::test(start_paused = true)]
async fn pending_retry_is_dropped_on_cancel() {
    let token = CancellationToken::new();
    let (tx, mut rx) = mpsc::channel(1);

    let handle = retry(&token, "entity-1", &tx, Duration::from_secs(60));
    tokio::time::sleep(Duration::from_secs(30)).await;
    token.cancel();

    assert_eq!(assert_ok!(handle.await), FeedOutcome::Abandoned);
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert!(rx.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn scheduler_tracks_pending_retries() {
    let token = CancellationToken::new();
    let scheduler = RetryScheduler::new(Duration::from_secs(60), token.clone());
    let (tx, _rx) = mpsc::channel(4);

    let handles: Vec<_> = (0..3).map(|i| scheduler.schedule(i, &tx)).collect();
    assert_eq!(scheduler.pending(), 3);

    token.cancel();
    for handle in handles {
        assert_eq!(handle.await.unwrap(), FeedOutcome::Abandoned);
    }
    assert_eq!(scheduler.pending(), 0);
    assert_eq!(scheduler.scheduled(), 3);
}

#[tokio::test]
async fn parent_cancel_stops_handler_and_abandons_retries() {
    let platform = withdraw_platform(dec!(1000)).await;
    platform.insert_withdraw(withdraw("w1", "100")).await;
    platform.fail_rpc(rpc::UPDATE_WITHDRAW, 1);

    let mut config = fast_config();
    config.retry.cooldown_ms = 60_000;
    config.scan.interval_ms = 60_000;
    let ctx = context(&platform, config);
    let token = CancellationToken::new();

    let handler = withdraw::review::build(&ctx, &token).unwrap().unwrap();

    assert!(eventually(Duration::from_secs(5), || async { handler.retrier().pending() == 1 }).await);

    token.cancel();
    assert!(eventually(Duration::from_secs(5), || async { handler.retrier().pending() == 0 }).await);
    handler.finalize().await;

    assert!(!handler.is_running());
    assert_eq!(
        platform.withdraw("w1").await.unwrap().state,
        WithdrawState::Reviewing
    );
}

#[tokio::test]
async fn finalize_releases_the_lease_for_the_next_owner() {
    let platform = withdraw_platform(dec!(1000)).await;
    let ctx = context(&platform, fast_config());
    let token = CancellationToken::new();

    let first = withdraw::review::build(&ctx, &token).unwrap().unwrap();
    assert!(eventually(Duration::from_secs(5), || async { first.has_lease() }).await);

    let second = withdraw::review::build(&ctx, &token).unwrap().unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!second.has_lease());

    first.finalize().await;
    assert!(eventually(Duration::from_secs(5), || async { second.has_lease() }).await);

    second.finalize().await;
}
