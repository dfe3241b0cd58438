//! Admission control in front of routing
//!
//! Rejected callers never reach a provider and leave no routing decision.

mod common;

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use common::{catalog, Providers};
use gateway_core::{
    ErrorCode, GatewayError, GatewayRequest, RateLimitConfig, RateLimiter, TimeRange,
};

fn limited(config: RateLimitConfig) -> gateway_core::GatewayConfig {
    let mut gateway = catalog();
    gateway.rate_limit = config;
    gateway
}

#[tokio::test(start_paused = true)]
async fn test_burst_admits_exactly_bucket_capacity() {
    let providers = Providers::new();
    let router = Arc::new(providers.router(limited(
        RateLimitConfig::default()
            .with_token_limit(5)
            .with_refill(5, 60),
    )));

    let mut tasks = JoinSet::new();
    for _ in 0..20 {
        let router = Arc::clone(&router);
        tasks.spawn(async move {
            router
                .execute(GatewayRequest::completion("burst").with_api_key("key-a"))
                .await
        });
    }

    let mut served = 0;
    let mut rejected = 0;
    while let Some(outcome) = tasks.join_next().await {
        match outcome.unwrap() {
            Ok(_) => served += 1,
            Err(GatewayError::RateLimitExceeded { key, retry_after }) => {
                assert_eq!(key, "key-a");
                assert!(retry_after > Duration::ZERO);
                rejected += 1;
            }
            Err(other) => panic!("unexpected error: {other}"),
        }
    }

    assert_eq!(served, 5);
    assert_eq!(rejected, 15);
    assert_eq!(
        providers.openai.total_calls() + providers.anthropic.total_calls(),
        5
    );
    assert_eq!(router.decisions(TimeRange::all()).await.unwrap().len(), 5);
    assert_eq!(router.metrics().total_rate_limited.get(), 15);
}

#[tokio::test(start_paused = true)]
async fn test_keys_have_independent_buckets() {
    let providers = Providers::new();
    let router = providers.router(limited(RateLimitConfig::default().with_token_limit(1)));

    router
        .execute(GatewayRequest::completion("a").with_api_key("key-a"))
        .await
        .unwrap();
    router
        .execute(GatewayRequest::completion("b").with_api_key("key-b"))
        .await
        .unwrap();
    // Without an API key the user id partitions
    router
        .execute(GatewayRequest::completion("c").with_user("carol"))
        .await
        .unwrap();

    let err = router
        .execute(GatewayRequest::completion("a again").with_api_key("key-a"))
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::RateLimitExceededError);
    assert_eq!(router.limiter().len(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_tokens_refill_lazily_with_time() {
    let providers = Providers::new();
    let router = providers.router(limited(
        RateLimitConfig::default()
            .with_token_limit(2)
            .with_refill(1, 10),
    ));
    let request = || GatewayRequest::completion("tick").with_api_key("key-a");

    router.execute(request()).await.unwrap();
    router.execute(request()).await.unwrap();
    assert!(router.execute(request()).await.is_err());

    tokio::time::advance(Duration::from_secs(10)).await;
    router.execute(request()).await.unwrap();
    assert!(router.execute(request()).await.is_err());
    assert_eq!(router.limiter().available_tokens("key-a"), 0);
}

#[tokio::test(start_paused = true)]
async fn test_queued_callers_are_admitted_in_arrival_order() {
    let limiter = Arc::new(RateLimiter::new(
        RateLimitConfig::default()
            .with_token_limit(1)
            .with_refill(1, 1)
            .with_queue_limit(4),
    ));
    let cancel = CancellationToken::new();
    limiter.admit("key-a", &cancel).await.unwrap();

    let order = Arc::new(Mutex::new(Vec::new()));
    let mut tasks = JoinSet::new();
    for caller in 0..4 {
        let task_limiter = Arc::clone(&limiter);
        let order = Arc::clone(&order);
        let cancel = cancel.clone();
        tasks.spawn(async move {
            task_limiter.admit("key-a", &cancel).await.unwrap();
            order.lock().push(caller);
        });
        while limiter.key_stats("key-a").map_or(0, |s| s.waiting) < caller + 1 {
            tokio::task::yield_now().await;
        }
    }

    while let Some(joined) = tasks.join_next().await {
        joined.unwrap();
    }
    assert_eq!(*order.lock(), vec![0, 1, 2, 3]);
}

#[tokio::test(start_paused = true)]
async fn test_full_queue_rejects_through_router() {
    let providers = Providers::new();
    let router = Arc::new(providers.router(limited(
        RateLimitConfig::default()
            .with_token_limit(1)
            .with_refill(1, 60)
            .with_queue_limit(1),
    )));
    let request = || GatewayRequest::completion("q").with_api_key("key-a");

    router.execute(request()).await.unwrap();

    let waiting = {
        let router = Arc::clone(&router);
        tokio::spawn(async move { router.execute(request()).await })
    };
    while router.limiter().key_stats("key-a").map_or(0, |s| s.waiting) == 0 {
        tokio::task::yield_now().await;
    }

    let err = router.execute(request()).await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::RateLimitExceededError);

    // The queued caller is served once the bucket refills
    waiting.await.unwrap().unwrap();
    assert_eq!(providers.openai.total_calls() + providers.anthropic.total_calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_cancelled_wait_leaves_queue_and_reports_cancelled() {
    let providers = Providers::new();
    let router = Arc::new(providers.router(limited(
        RateLimitConfig::default()
            .with_token_limit(1)
            .with_refill(1, 60)
            .with_queue_limit(2),
    )));
    let request = || GatewayRequest::completion("c").with_api_key("key-a");
    router.execute(request()).await.unwrap();

    let cancel = CancellationToken::new();
    let waiting = {
        let router = Arc::clone(&router);
        let cancel = cancel.clone();
        tokio::spawn(async move { router.execute_with_cancel(request(), &cancel).await })
    };
    while router.limiter().key_stats("key-a").map_or(0, |s| s.waiting) == 0 {
        tokio::task::yield_now().await;
    }

    cancel.cancel();
    let err = waiting.await.unwrap().unwrap_err();
    assert!(matches!(err, GatewayError::Cancelled));
    assert_eq!(router.limiter().key_stats("key-a").unwrap().waiting, 0);
    assert_eq!(router.metrics().total_rate_limited.get(), 0);
    assert_eq!(router.decisions(TimeRange::all()).await.unwrap().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_disabled_limiter_admits_everything() {
    let providers = Providers::new();
    let router = providers.router(limited(RateLimitConfig {
        token_limit: 1,
        ..RateLimitConfig::disabled()
    }));

    for _ in 0..10 {
        router
            .execute(GatewayRequest::completion("free").with_api_key("key-a"))
            .await
            .unwrap();
    }
    assert!(router.limiter().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_cancel_mid_dispatch_consumes_exactly_one_token() {
    let providers = Providers::new();
    providers.openai.then("gpt-4", common::Behavior::Hang, 1);
    let router = providers.router(limited(
        RateLimitConfig::default()
            .with_token_limit(2)
            .with_refill(2, 60),
    ));
    let request = || {
        GatewayRequest::completion("slow")
            .with_model("gpt-4")
            .with_api_key("key-a")
    };

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(10)).await;
        trigger.cancel();
    });
    tokio_test::assert_err!(router.execute_with_cancel(request(), &cancel).await);
    assert_eq!(router.limiter().available_tokens("key-a"), 1);

    tokio_test::assert_ok!(router.execute(request()).await);
    assert_eq!(router.limiter().available_tokens("key-a"), 0);
    assert_eq!(router.limiter().key_stats("key-a").unwrap().admitted, 2);
}
