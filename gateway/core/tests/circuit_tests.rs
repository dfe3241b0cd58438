//! Circuit breaker behavior observed through the router
//!
//! Breakers are keyed by provider and model, open after repeated failures,
//! and admit exactly one probe once the cooldown elapses.

mod common;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Barrier;
use tokio::task::JoinSet;

use common::{catalog, permanent, solo_catalog, Behavior, Providers};
use gateway_core::routing::{CircuitState, ModelKey};
use gateway_core::{ErrorCode, GatewayError, GatewayRequest};

fn solo() -> GatewayRequest {
    GatewayRequest::completion("ping").with_model("solo")
}

async fn open_solo_circuit(router: &gateway_core::QueryRouter) {
    let threshold = router.breakers().config().failure_threshold;
    for _ in 0..threshold {
        let err = router.execute(solo()).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::PermanentProviderError);
    }
}

#[tokio::test(start_paused = true)]
async fn test_repeated_failures_open_the_circuit() {
    let providers = Providers::new();
    providers.local.always("solo", permanent());
    let router = providers.router(solo_catalog());
    let key = ModelKey::new("solo", "local");

    open_solo_circuit(&router).await;
    assert_eq!(router.breakers().state(&key), CircuitState::Open);

    // Only model left, so it stays as a last resort and is rejected locally
    let err = router.execute(solo()).await.unwrap_err();
    match err {
        GatewayError::CircuitOpen { retry_after, .. } => {
            assert!(retry_after <= Duration::from_secs(30));
            assert!(retry_after > Duration::ZERO);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(providers.local.calls("solo"), 5);
    assert_eq!(router.metrics().model_totals(&key).rejections, 1);
}

#[tokio::test(start_paused = true)]
async fn test_breakers_are_isolated_per_model() {
    let providers = Providers::new();
    providers.openai.always("gpt-4", permanent());
    let mut config = catalog();
    config.fallback.enabled = false;
    let router = providers.router(config);

    for _ in 0..5 {
        let _ = router
            .execute(GatewayRequest::completion("x").with_model("gpt-4"))
            .await;
    }

    let breakers = router.breakers();
    assert_eq!(
        breakers.state(&ModelKey::new("gpt-4", "openai")),
        CircuitState::Open
    );
    assert_eq!(
        breakers.state(&ModelKey::new("gpt-3.5-turbo", "openai")),
        CircuitState::Closed
    );
    assert!(!breakers.provider_available("openai"));

    let served = router
        .execute(GatewayRequest::completion("x").with_model("gpt-3.5-turbo"))
        .await
        .unwrap();
    assert_eq!(served.model.model_id, "gpt-3.5-turbo");
    assert!(breakers.provider_available("openai"));
}

#[tokio::test(start_paused = true)]
async fn test_successful_probe_closes_circuit() {
    let providers = Providers::new();
    providers.local.then("solo", permanent(), 5);
    let router = providers.router(solo_catalog());
    let key = ModelKey::new("solo", "local");

    open_solo_circuit(&router).await;
    tokio::time::advance(Duration::from_secs(30)).await;
    assert_eq!(router.breakers().state(&key), CircuitState::HalfOpen);

    router.execute(solo()).await.unwrap();
    assert_eq!(router.breakers().state(&key), CircuitState::Closed);
}

#[tokio::test(start_paused = true)]
async fn test_failed_probe_reopens_with_longer_cooldown() {
    let providers = Providers::new();
    providers.local.always("solo", permanent());
    let router = providers.router(solo_catalog());
    let key = ModelKey::new("solo", "local");

    open_solo_circuit(&router).await;
    tokio::time::advance(Duration::from_secs(30)).await;
    router.execute(solo()).await.unwrap_err();

    assert_eq!(router.breakers().state(&key), CircuitState::Open);
    tokio::time::advance(Duration::from_secs(30)).await;
    assert_eq!(router.breakers().state(&key), CircuitState::Open);
    tokio::time::advance(Duration::from_secs(30)).await;
    assert_eq!(router.breakers().state(&key), CircuitState::HalfOpen);
}

#[tokio::test(start_paused = true)]
async fn test_half_open_admits_exactly_one_concurrent_probe() {
    let providers = Providers::new();
    providers.local.then("solo", permanent(), 5);
    providers.local.with_latency("solo", Duration::from_secs(1));
    let router = Arc::new(providers.router(solo_catalog()));

    open_solo_circuit(&router).await;
    tokio::time::advance(Duration::from_secs(30)).await;

    let callers = 8;
    let barrier = Arc::new(Barrier::new(callers));
    let mut tasks = JoinSet::new();
    for _ in 0..callers {
        let router = Arc::clone(&router);
        let barrier = Arc::clone(&barrier);
        tasks.spawn(async move {
            barrier.wait().await;
            router.execute(solo()).await
        });
    }

    let mut served = 0;
    let mut rejected = 0;
    while let Some(outcome) = tasks.join_next().await {
        match outcome.unwrap() {
            Ok(_) => served += 1,
            Err(GatewayError::CircuitOpen { .. }) => rejected += 1,
            Err(other) => panic!("unexpected error: {other}"),
        }
    }

    assert_eq!(served, 1);
    assert_eq!(rejected, callers - 1);
    assert_eq!(providers.local.calls("solo"), 6);
    assert_eq!(
        router.breakers().state(&ModelKey::new("solo", "local")),
        CircuitState::Closed
    );
}

#[tokio::test(start_paused = true)]
async fn test_cancelled_probe_releases_half_open_slot() {
    let providers = Providers::new();
    providers.local.then("solo", permanent(), 5);
    providers.local.then("solo", Behavior::Hang, 1);
    let router = providers.router(solo_catalog());
    let key = ModelKey::new("solo", "local");

    open_solo_circuit(&router).await;
    tokio::time::advance(Duration::from_secs(30)).await;

    let cancel = tokio_util::sync::CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        trigger.cancel();
    });
    let err = router.execute_with_cancel(solo(), &cancel).await.unwrap_err();
    assert!(matches!(err, GatewayError::Cancelled));

    router.execute(solo()).await.unwrap();
    assert_eq!(router.breakers().state(&key), CircuitState::Closed);
}
