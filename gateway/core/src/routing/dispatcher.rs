//! Resilient Dispatcher
//!
//! Wraps a single provider call with two composed policies:
//!
//! ```text
//! invoke(model, request)
//!   |
//!   +--> circuit breaker: try_acquire ──(open)──> CircuitOpen (no provider call)
//!   |
//!   +--> adapter.send(..) under the attempt deadline
//!   |        |
//!   |        +-- ok ───────────────> record success, return
//!   |        +-- transient ────────> record failure, back off, retry (bounded)
//!   |        +-- permanent ────────> record failure, return PermanentProvider
//!   |
//!   +--> every attempt feeds the metrics registry
//! ```
//!
//! Deadline expiry counts as a transient failure. Caller cancellation aborts
//! the in-flight call or the pending backoff; an aborted attempt is neither a
//! success nor a failure for the breaker.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::config::{ModelProfile, RetryConfig};
use super::health::CircuitBreakerRegistry;
use super::metrics::{AttemptOutcome, MetricsRegistry};
use crate::config::GatewayConfig;
use crate::error::{GatewayError, ProviderError};
use crate::provider::{ProviderRegistry, ProviderResponse};
use crate::request::GatewayRequest;

/// Per-request dispatch parameters
#[derive(Clone, Debug)]
pub struct DispatchPolicy {
    pub retry: RetryConfig,

    /// Deadline for each provider call
    pub timeout: Duration,

    /// Feed outcomes into the metrics registry
    pub track_metrics: bool,
}

impl DispatchPolicy {
    /// Policy for `request` under a configuration snapshot
    #[must_use]
    pub fn for_request(config: &GatewayConfig, request: &GatewayRequest) -> Self {
        Self {
            retry: config.retry.clone(),
            timeout: request
                .timeout
                .unwrap_or_else(|| config.global.timeout_for(request.stream)),
            track_metrics: config.routing.track_model_metrics,
        }
    }
}

/// A successful dispatch
#[derive(Clone, Debug)]
pub struct Dispatched {
    pub response: ProviderResponse,

    /// Local retries spent before the successful call
    pub retries: u32,

    /// Time spent in the dispatcher, backoff included
    pub latency: Duration,
}

/// A failed dispatch, with the effort it took
#[derive(Clone, Debug)]
pub struct DispatchFailure {
    pub error: GatewayError,
    pub retries: u32,
    pub latency: Duration,
}

impl DispatchFailure {
    #[must_use]
    pub fn into_error(self) -> GatewayError {
        self.error
    }
}

/// Retry plus circuit-breaker wrapper around provider adapters
#[derive(Debug)]
pub struct ResilientDispatcher {
    providers: Arc<ProviderRegistry>,
    breakers: Arc<CircuitBreakerRegistry>,
    metrics: Arc<MetricsRegistry>,
}

impl ResilientDispatcher {
    pub fn new(
        providers: Arc<ProviderRegistry>,
        breakers: Arc<CircuitBreakerRegistry>,
        metrics: Arc<MetricsRegistry>,
    ) -> Self {
        Self {
            providers,
            breakers,
            metrics,
        }
    }

    #[must_use]
    pub fn breakers(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.breakers
    }

    /// Call the provider of `model`, retrying transient failures
    ///
    /// # Errors
    ///
    /// - [`GatewayError::CircuitOpen`] when the breaker rejects an attempt
    /// - [`GatewayError::TransientProvider`] once retries are exhausted
    /// - [`GatewayError::PermanentProvider`] on the first non-retryable failure
    /// - [`GatewayError::Cancelled`] when `cancel` fires
    pub async fn invoke(
        &self,
        model: &ModelProfile,
        request: &GatewayRequest,
        policy: &DispatchPolicy,
        cancel: &CancellationToken,
    ) -> Result<Dispatched, DispatchFailure> {
        let started = Instant::now();
        let key = model.key();
        let mut retries = 0u32;

        let fail = |error: GatewayError, retries: u32| DispatchFailure {
            error,
            retries,
            latency: started.elapsed(),
        };

        let Some(adapter) = self.providers.get(&model.provider) else {
            return Err(fail(
                GatewayError::PermanentProvider {
                    provider: model.provider.clone(),
                    model: model.model_id.clone(),
                    source: ProviderError::invalid_request("no adapter registered for provider"),
                },
                0,
            ));
        };
        let breaker = self.breakers.get_or_create(&key);

        loop {
            if cancel.is_cancelled() {
                return Err(fail(GatewayError::Cancelled, retries));
            }

            let permit = match breaker.try_acquire() {
                Ok(permit) => permit,
                Err(retry_after) => {
                    if policy.track_metrics {
                        self.metrics.record_attempt(&key, AttemptOutcome::Rejected);
                    }
                    tracing::debug!(
                        circuit = %key,
                        retry_after_ms = retry_after.as_millis() as u64,
                        "Attempt rejected by open circuit"
                    );
                    return Err(fail(
                        GatewayError::CircuitOpen {
                            provider: model.provider.clone(),
                            model: model.model_id.clone(),
                            retry_after,
                        },
                        retries,
                    ));
                }
            };

            let attempt_started = Instant::now();
            let deadline = attempt_started + policy.timeout;
            let call = tokio::time::timeout_at(deadline, adapter.send(model, request, deadline));
            let outcome = tokio::select! {
                biased;
                () = cancel.cancelled() => None,
                result = call => Some(result),
            };
            let latency = attempt_started.elapsed();

            let result = match outcome {
                // Dropping the permit frees a half-open probe slot
                None => {
                    drop(permit);
                    tracing::debug!(
                        request_id = %request.request_id,
                        circuit = %key,
                        "Attempt cancelled"
                    );
                    return Err(fail(GatewayError::Cancelled, retries));
                }
                Some(Ok(result)) => result,
                Some(Err(_elapsed)) => Err(ProviderError::timeout(policy.timeout)),
            };

            match result {
                Ok(response) => {
                    permit.record_success();
                    if policy.track_metrics {
                        self.metrics.record_attempt(
                            &key,
                            AttemptOutcome::Success {
                                latency,
                                tokens: response.usage.total_tokens,
                                cost_usd: model.estimate_cost(
                                    response.usage.prompt_tokens,
                                    response.usage.completion_tokens,
                                ),
                            },
                        );
                    }
                    return Ok(Dispatched {
                        response,
                        retries,
                        latency: started.elapsed(),
                    });
                }
                Err(error) => {
                    permit.record_failure();
                    if policy.track_metrics {
                        self.metrics
                            .record_attempt(&key, AttemptOutcome::Failure { latency });
                    }

                    if error.is_transient() && retries < policy.retry.max_retries {
                        retries += 1;
                        let backoff = policy.retry.retry_delay(retries, &mut rand::thread_rng());
                        tracing::debug!(
                            request_id = %request.request_id,
                            circuit = %key,
                            error = %error,
                            retry = retries,
                            backoff_ms = backoff.as_millis() as u64,
                            "Transient provider failure, retrying"
                        );
                        tokio::select! {
                            biased;
                            () = cancel.cancelled() => {
                                return Err(fail(GatewayError::Cancelled, retries));
                            }
                            () = tokio::time::sleep(backoff) => {}
                        }
                        continue;
                    }

                    let error = if error.is_transient() {
                        GatewayError::TransientProvider {
                            provider: model.provider.clone(),
                            model: model.model_id.clone(),
                            attempts: retries + 1,
                            source: error,
                        }
                    } else {
                        GatewayError::PermanentProvider {
                            provider: model.provider.clone(),
                            model: model.model_id.clone(),
                            source: error,
                        }
                    };
                    tracing::warn!(
                        request_id = %request.request_id,
                        circuit = %key,
                        error = %error,
                        "Dispatch failed"
                    );
                    return Err(fail(error, retries));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ErrorCode, ProviderErrorKind};
    use crate::routing::health::{CircuitBreakerConfig, CircuitState};
    use crate::routing::metrics::MetricsConfig;
    use crate::routing::test_utils::{
        fixture_config, fixture_providers, registry_of, ScriptedProvider, Step,
    };

    struct Harness {
        openai: Arc<ScriptedProvider>,
        dispatcher: ResilientDispatcher,
        metrics: Arc<MetricsRegistry>,
        model: ModelProfile,
        policy: DispatchPolicy,
    }

    fn harness(breaker: CircuitBreakerConfig) -> Harness {
        let config = fixture_config();
        let (openai, anthropic) = fixture_providers();
        let metrics = Arc::new(MetricsRegistry::new(MetricsConfig::default()));
        let dispatcher = ResilientDispatcher::new(
            Arc::new(registry_of(&openai, &anthropic)),
            Arc::new(CircuitBreakerRegistry::new(breaker)),
            Arc::clone(&metrics),
        );
        let request = GatewayRequest::completion("hello");
        Harness {
            openai,
            dispatcher,
            metrics,
            model: config.model("gpt-4").cloned().unwrap(),
            policy: DispatchPolicy::for_request(&config, &request),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_first_try() {
        let h = harness(CircuitBreakerConfig::default());
        let dispatched = h
            .dispatcher
            .invoke(
                &h.model,
                &GatewayRequest::completion("hello"),
                &h.policy,
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(dispatched.retries, 0);
        assert_eq!(dispatched.response.model, "gpt-4");
        assert_eq!(h.metrics.model_totals(&h.model.key()).successes, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failures_are_retried() {
        let h = harness(CircuitBreakerConfig::default());
        h.openai
            .script("gpt-4", Step::Fail(ProviderError::network("reset")), 2);

        let dispatched = h
            .dispatcher
            .invoke(
                &h.model,
                &GatewayRequest::completion("hello"),
                &h.policy,
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(dispatched.retries, 2);
        assert_eq!(h.openai.request_count("gpt-4"), 3);
        let totals = h.metrics.model_totals(&h.model.key());
        assert_eq!(totals.failures, 2);
        assert_eq!(totals.successes, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_failure_not_retried() {
        let h = harness(CircuitBreakerConfig::default());
        h.openai
            .always("gpt-4", Step::Fail(ProviderError::authentication("bad key")));

        let failure = h
            .dispatcher
            .invoke(
                &h.model,
                &GatewayRequest::completion("hello"),
                &h.policy,
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();

        assert_eq!(failure.error.code(), ErrorCode::PermanentProviderError);
        assert_eq!(failure.retries, 0);
        assert_eq!(h.openai.request_count("gpt-4"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_exhausted() {
        let h = harness(CircuitBreakerConfig::default());
        h.openai
            .always("gpt-4", Step::Fail(ProviderError::from_status(503, "busy")));

        let failure = h
            .dispatcher
            .invoke(
                &h.model,
                &GatewayRequest::completion("hello"),
                &h.policy,
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();

        match failure.error {
            GatewayError::TransientProvider { attempts, .. } => assert_eq!(attempts, 3),
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(h.openai.request_count("gpt-4"), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_is_transient_failure() {
        let mut h = harness(CircuitBreakerConfig::default());
        h.policy.retry = RetryConfig::disabled();
        h.policy.timeout = Duration::from_secs(2);
        h.openai.always("gpt-4", Step::Hang);

        let started = Instant::now();
        let failure = h
            .dispatcher
            .invoke(
                &h.model,
                &GatewayRequest::completion("hello"),
                &h.policy,
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();

        assert!(started.elapsed() >= Duration::from_secs(2));
        assert!(started.elapsed() < Duration::from_secs(3));
        match failure.error {
            GatewayError::TransientProvider { source, .. } => {
                assert_eq!(source.kind, ProviderErrorKind::Timeout);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_circuit_rejects_without_calling_provider() {
        let mut h = harness(CircuitBreakerConfig {
            failure_threshold: 2,
            ..CircuitBreakerConfig::default()
        });
        h.policy.retry = RetryConfig::disabled();
        h.openai
            .always("gpt-4", Step::Fail(ProviderError::from_status(500, "boom")));
        let request = GatewayRequest::completion("hello");
        let cancel = CancellationToken::new();

        for _ in 0..2 {
            let _ = h.dispatcher.invoke(&h.model, &request, &h.policy, &cancel).await;
        }
        assert_eq!(
            h.dispatcher.breakers().state(&h.model.key()),
            CircuitState::Open
        );

        let failure = h
            .dispatcher
            .invoke(&h.model, &request, &h.policy, &cancel)
            .await
            .unwrap_err();
        assert_eq!(failure.error.code(), ErrorCode::CircuitOpenError);
        assert_eq!(failure.error.retry_after(), Some(Duration::from_secs(30)));
        assert_eq!(h.openai.request_count("gpt-4"), 2);

        let totals = h.metrics.model_totals(&h.model.key());
        assert_eq!(totals.requests, 3);
        assert_eq!(totals.rejections, 1);
        assert_eq!(totals.latency_samples, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_after_cooldown_closes_circuit() {
        let mut h = harness(CircuitBreakerConfig {
            failure_threshold: 1,
            ..CircuitBreakerConfig::default()
        });
        h.policy.retry = RetryConfig::disabled();
        h.openai
            .script("gpt-4", Step::Fail(ProviderError::network("down")), 1);
        let request = GatewayRequest::completion("hello");
        let cancel = CancellationToken::new();

        let _ = h.dispatcher.invoke(&h.model, &request, &h.policy, &cancel).await;
        assert_eq!(h.dispatcher.breakers().state(&h.model.key()), CircuitState::Open);

        tokio::time::advance(Duration::from_secs(30)).await;
        h.dispatcher
            .invoke(&h.model, &request, &h.policy, &cancel)
            .await
            .unwrap();
        assert_eq!(h.dispatcher.breakers().state(&h.model.key()), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_aborts_in_flight_call() {
        let h = harness(CircuitBreakerConfig::default());
        h.openai.always("gpt-4", Step::Hang);
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let failure = h
            .dispatcher
            .invoke(&h.model, &GatewayRequest::completion("hello"), &h.policy, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(failure.error, GatewayError::Cancelled));
        assert_eq!(h.dispatcher.breakers().state(&h.model.key()), CircuitState::Closed);
        assert_eq!(h.metrics.model_totals(&h.model.key()).requests, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_during_backoff() {
        let mut h = harness(CircuitBreakerConfig::default());
        h.policy.retry.initial_backoff_ms = 60_000;
        h.policy.retry.max_backoff_ms = 60_000;
        h.openai
            .always("gpt-4", Step::Fail(ProviderError::network("flaky")));
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            trigger.cancel();
        });

        let started = Instant::now();
        let failure = h
            .dispatcher
            .invoke(&h.model, &GatewayRequest::completion("hello"), &h.policy, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(failure.error, GatewayError::Cancelled));
        assert_eq!(failure.retries, 1);
        assert!(started.elapsed() < Duration::from_secs(60));
        assert_eq!(h.openai.request_count("gpt-4"), 1);
    }
}
