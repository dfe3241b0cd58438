//! Query Router
//!
//! Entry point for every inference request. Drives one request through the
//! strictly ordered pipeline:
//!
//! ```text
//! admit (rate limiter) -> select candidates (routing engine)
//!   -> for each candidate up to the attempt limit:
//!        invoke (resilient dispatcher)
//!        success  -> usage record, decision record, return
//!        failure  -> fallback rule of the requested model decides: advance or stop
//!   -> decision record (unsuccessful), terminal error
//! ```
//!
//! Records are written only once an outcome is known. A usage-store failure
//! is logged and never fails a request that already has its response.

use std::sync::Arc;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::config::{ModelKey, ModelProfile, RoutingStrategy};
use super::dispatcher::{DispatchPolicy, ResilientDispatcher};
use super::fallback::{FallbackContext, FallbackStop};
use super::health::CircuitBreakerRegistry;
use super::metrics::{MetricsRegistry, ModelMetricsRecord, ProviderHealthRecord};
use super::policy::{CandidateList, RoutingContext, RoutingDecision, RoutingEngine};
use super::strategy::ExperimentSampler;
use crate::config::{ConfigError, ConfigHandle, GatewayConfig};
use crate::error::{ErrorCode, GatewayError};
use crate::provider::{ProviderAdapter, ProviderRegistry, ProviderResponse};
use crate::rate_limit::{RateLimitError, RateLimiter};
use crate::request::{GatewayRequest, AUTO_MODEL};
use crate::store::{AppendStore, StoreError, TimeRange};
use crate::usage::{TokenUsageRecord, UsageLedger};

// ============================================================================
// Response
// ============================================================================

/// Successful outcome of [`QueryRouter::execute`]
#[derive(Clone, Debug)]
pub struct GatewayResponse {
    pub response: ProviderResponse,

    /// Candidate that served the request
    pub model: ModelProfile,

    /// Audit record written for this request
    pub decision: RoutingDecision,

    /// Usage record, when usage tracking is on and tokens were consumed
    pub usage: Option<TokenUsageRecord>,
}

/// What one maintenance pass cleaned up
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MaintenanceReport {
    pub evicted_metric_buckets: usize,
    pub purged_usage_records: usize,
    pub purged_decisions: usize,
    pub idle_rate_limit_keys: usize,
    pub exported_health_records: usize,
}

// ============================================================================
// Query Router
// ============================================================================

/// Fallback orchestrator over routing, dispatch, admission and accounting
///
/// Rate-limit, circuit-breaker and metrics parameters are fixed when the
/// router is built; a [`reload`](Self::reload) swaps routing, fallback,
/// retry and usage-tracking settings for subsequent requests.
pub struct QueryRouter {
    config: ConfigHandle,
    engine: RoutingEngine,
    dispatcher: ResilientDispatcher,
    limiter: RateLimiter,
    breakers: Arc<CircuitBreakerRegistry>,
    metrics: Arc<MetricsRegistry>,
    usage: UsageLedger,
    decisions: Arc<dyn AppendStore<RoutingDecision>>,
    provider_health: Arc<dyn AppendStore<ProviderHealthRecord>>,
    model_metrics: Arc<dyn AppendStore<ModelMetricsRecord>>,
}

impl QueryRouter {
    /// Start building a router over a configuration
    #[must_use]
    pub fn builder(config: GatewayConfig) -> QueryRouterBuilder {
        QueryRouterBuilder::new(config)
    }

    /// Current configuration snapshot
    #[must_use]
    pub fn config(&self) -> Arc<GatewayConfig> {
        self.config.snapshot()
    }

    /// Validate and install a new configuration for subsequent requests
    ///
    /// # Errors
    ///
    /// Returns the validation error and keeps the current configuration.
    pub fn reload(&self, config: GatewayConfig) -> Result<(), ConfigError> {
        self.config.replace(config)
    }

    #[must_use]
    pub fn engine(&self) -> &RoutingEngine {
        &self.engine
    }

    #[must_use]
    pub fn metrics(&self) -> &Arc<MetricsRegistry> {
        &self.metrics
    }

    #[must_use]
    pub fn breakers(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.breakers
    }

    #[must_use]
    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    /// Usage reporting
    #[must_use]
    pub fn usage(&self) -> &UsageLedger {
        &self.usage
    }

    /// Routing decisions inside `range`
    ///
    /// # Errors
    ///
    /// Returns the decision store's error.
    pub async fn decisions(&self, range: TimeRange) -> Result<Vec<RoutingDecision>, StoreError> {
        self.decisions.range(range).await
    }

    /// Candidate list a request would get right now, without dispatching
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::NoEligibleModel`] as routing would.
    pub fn preview(&self, request: &GatewayRequest) -> Result<CandidateList, GatewayError> {
        let config = self.config.snapshot();
        let snapshot = self.metrics.snapshot();
        self.engine.select_candidates(
            request,
            &RoutingContext {
                config: &config,
                metrics: &snapshot,
                circuits: self.breakers.as_ref(),
            },
        )
    }

    /// Serve a request
    ///
    /// # Errors
    ///
    /// Any terminal [`GatewayError`].
    pub async fn execute(&self, request: GatewayRequest) -> Result<GatewayResponse, GatewayError> {
        self.execute_with_cancel(request, &CancellationToken::new())
            .await
    }

    /// Serve a request, aborting at the next suspension point once `cancel` fires
    ///
    /// # Errors
    ///
    /// Any terminal [`GatewayError`]; [`GatewayError::Cancelled`] on cancellation.
    pub async fn execute_with_cancel(
        &self,
        request: GatewayRequest,
        cancel: &CancellationToken,
    ) -> Result<GatewayResponse, GatewayError> {
        let config = self.config.snapshot();
        let started = Instant::now();
        self.metrics.total_requests.inc();

        // 1. Admission
        if let Err(e) = self.limiter.admit(request.caller_key(), cancel).await {
            self.metrics.total_failed_requests.inc();
            return Err(match e {
                RateLimitError::Cancelled { .. } => GatewayError::Cancelled,
                denied => {
                    self.metrics.total_rate_limited.inc();
                    tracing::warn!(
                        request_id = %request.request_id,
                        error = %denied,
                        "Request rejected by rate limiter"
                    );
                    GatewayError::RateLimitExceeded {
                        key: request.caller_key().to_string(),
                        retry_after: denied.retry_after().unwrap_or_default(),
                    }
                }
            });
        }

        // 2. Candidate selection
        let snapshot = self.metrics.snapshot();
        let selected = self.engine.select_candidates(
            &request,
            &RoutingContext {
                config: &config,
                metrics: &snapshot,
                circuits: self.breakers.as_ref(),
            },
        );
        let list = match selected {
            Ok(list) => list,
            Err(error) => {
                self.metrics.total_failed_requests.inc();
                let strategy = self
                    .engine
                    .effective_strategy(&config, &request, request.pinned_model());
                let record = DecisionDraft {
                    request: &request,
                    requested_model: request
                        .pinned_model()
                        .unwrap_or(AUTO_MODEL)
                        .to_string(),
                    strategy,
                    candidates: Vec::new(),
                    started,
                }
                .finish(FallbackContext::new(AUTO_MODEL), None, Some(error.code()));
                self.write_decision(&config, record).await;
                tracing::warn!(request_id = %request.request_id, error = %error, "Routing failed");
                return Err(error);
            }
        };

        // 3. Dispatch through the candidate list
        let policy = DispatchPolicy::for_request(&config, &request);
        let limit = config.fallback.attempt_limit(&list.rule_key, list.len());
        let mut attempts = FallbackContext::new(list.rule_key.clone());
        let mut stop = FallbackStop::Exhausted;
        let mut cancelled = false;
        let mut previous: Option<ModelKey> = None;

        for (index, candidate) in list.candidates.iter().take(limit).enumerate() {
            let model = &candidate.model;
            if let Some(from) = previous.take() {
                self.metrics.record_fallback(&from, &model.key());
                tracing::info!(
                    request_id = %request.request_id,
                    from = %from,
                    to = %model.key(),
                    reason = ?attempts.fallback_reason(),
                    "Falling back to next candidate"
                );
            }

            match self.dispatcher.invoke(model, &request, &policy, cancel).await {
                Ok(dispatched) => {
                    attempts.record_success(model, dispatched.retries, dispatched.latency);

                    let usage = if config.global.track_token_usage {
                        self.usage
                            .track_completion(&request, model, &dispatched.response.usage)
                            .await
                    } else {
                        None
                    };

                    let decision = DecisionDraft {
                        request: &request,
                        requested_model: list.requested_model.clone(),
                        strategy: list.strategy,
                        candidates: list.model_ids(),
                        started,
                    }
                    .finish(attempts, Some(model), None);
                    self.write_decision(&config, decision.clone()).await;

                    tracing::debug!(
                        request_id = %request.request_id,
                        model = %model.model_id,
                        attempt = index + 1,
                        "Request served"
                    );
                    return Ok(GatewayResponse {
                        response: dispatched.response,
                        model: model.clone(),
                        decision,
                        usage,
                    });
                }
                Err(failure) => {
                    if matches!(failure.error, GatewayError::Cancelled) {
                        cancelled = true;
                        break;
                    }
                    let code = failure.error.code();
                    attempts.record_failure(model, failure.error, failure.retries, failure.latency);

                    if !config.fallback.should_advance(&list.rule_key, code) {
                        stop = FallbackStop::NotTriggered;
                        break;
                    }
                    previous = Some(model.key());
                }
            }
        }

        // 4. Terminal failure
        self.metrics.total_failed_requests.inc();
        let error = if cancelled {
            GatewayError::Cancelled
        } else {
            attempts.terminal_error(stop)
        };
        let decision = DecisionDraft {
            request: &request,
            requested_model: list.requested_model.clone(),
            strategy: list.strategy,
            candidates: list.model_ids(),
            started,
        }
        .finish(attempts, None, Some(error.code()));
        self.write_decision(&config, decision).await;

        tracing::warn!(
            request_id = %request.request_id,
            requested = %list.requested_model,
            error = %error,
            "Request failed"
        );
        Err(error)
    }

    async fn write_decision(&self, config: &GatewayConfig, decision: RoutingDecision) {
        if !config.routing.track_routing_decisions {
            return;
        }
        if let Err(e) = self.decisions.append(decision).await {
            tracing::warn!(error = %e, "Failed to record routing decision");
        }
    }

    /// Append current health and model-metric snapshots to their stores
    ///
    /// # Errors
    ///
    /// Returns the first store error.
    pub async fn export_health(&self) -> Result<usize, StoreError> {
        let mut exported = 0;
        for record in self
            .metrics
            .provider_health_records(|provider| self.breakers.provider_available(provider))
        {
            self.provider_health.append(record).await?;
            exported += 1;
        }
        for record in self.metrics.model_metrics_records() {
            self.model_metrics.append(record).await?;
            exported += 1;
        }
        Ok(exported)
    }

    /// One pass of retention cleanup and health export
    pub async fn run_maintenance(&self) -> MaintenanceReport {
        let config = self.config.snapshot();
        let mut report = MaintenanceReport {
            evicted_metric_buckets: self.metrics.evict_expired(),
            idle_rate_limit_keys: self.limiter.evict_idle(),
            ..MaintenanceReport::default()
        };

        match self.usage.purge_expired().await {
            Ok(n) => report.purged_usage_records = n,
            Err(e) => tracing::warn!(error = %e, "Usage purge failed"),
        }
        match self
            .decisions
            .purge_before(Utc::now() - config.usage.retention())
            .await
        {
            Ok(n) => report.purged_decisions = n,
            Err(e) => tracing::warn!(error = %e, "Decision purge failed"),
        }
        match self.export_health().await {
            Ok(n) => report.exported_health_records = n,
            Err(e) => tracing::warn!(error = %e, "Health export failed"),
        }

        tracing::debug!(?report, "Maintenance pass complete");
        report
    }

    /// Run maintenance on the usage cleanup interval until `cancel` fires
    pub fn spawn_maintenance(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let router = Arc::clone(self);
        tokio::spawn(async move {
            let period = router.config.snapshot().usage.cleanup_interval();
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    () = cancel.cancelled() => {
                        tracing::debug!("Maintenance task stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        router.run_maintenance().await;
                    }
                }
            }
        })
    }
}

impl std::fmt::Debug for QueryRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryRouter")
            .field("engine", &self.engine)
            .field("breakers", &self.breakers.len())
            .field("rate_limit_keys", &self.limiter.len())
            .finish_non_exhaustive()
    }
}

/// Fields of a decision known before the outcome
struct DecisionDraft<'a> {
    request: &'a GatewayRequest,
    requested_model: String,
    strategy: RoutingStrategy,
    candidates: Vec<String>,
    started: Instant,
}

impl DecisionDraft<'_> {
    fn finish(
        self,
        attempts: FallbackContext,
        selected: Option<&ModelProfile>,
        error: Option<ErrorCode>,
    ) -> RoutingDecision {
        let is_fallback = attempts.is_fallback();
        let fallback_reason = if is_fallback {
            attempts.fallback_reason()
        } else {
            None
        };
        RoutingDecision {
            request_id: self.request.request_id.clone(),
            user_id: self.request.user_id.clone(),
            requested_model: self.requested_model,
            selected_model: selected.map(|m| m.model_id.clone()),
            provider: selected.map(|m| m.provider.clone()),
            strategy: self.strategy,
            success: selected.is_some(),
            response_time_ms: u64::try_from(self.started.elapsed().as_millis()).unwrap_or(u64::MAX),
            is_fallback,
            fallback_reason,
            error,
            attempt_count: attempts.attempt_count(),
            candidates: self.candidates,
            attempts: attempts.into_attempts(),
            timestamp: Utc::now(),
        }
    }
}

// ============================================================================
// Builder
// ============================================================================

/// Builder for [`QueryRouter`]
pub struct QueryRouterBuilder {
    config: GatewayConfig,
    adapters: Vec<Arc<dyn ProviderAdapter>>,
    sampler: Option<Arc<dyn ExperimentSampler>>,
    usage_store: Option<Arc<dyn AppendStore<TokenUsageRecord>>>,
    decision_store: Option<Arc<dyn AppendStore<RoutingDecision>>>,
    health_store: Option<Arc<dyn AppendStore<ProviderHealthRecord>>>,
    model_metrics_store: Option<Arc<dyn AppendStore<ModelMetricsRecord>>>,
}

impl QueryRouterBuilder {
    fn new(config: GatewayConfig) -> Self {
        Self {
            config,
            adapters: Vec::new(),
            sampler: None,
            usage_store: None,
            decision_store: None,
            health_store: None,
            model_metrics_store: None,
        }
    }

    /// Offer a provider adapter
    #[must_use]
    pub fn provider(mut self, adapter: Arc<dyn ProviderAdapter>) -> Self {
        self.adapters.push(adapter);
        self
    }

    #[must_use]
    pub fn sampler(mut self, sampler: Arc<dyn ExperimentSampler>) -> Self {
        self.sampler = Some(sampler);
        self
    }

    #[must_use]
    pub fn usage_store(mut self, store: Arc<dyn AppendStore<TokenUsageRecord>>) -> Self {
        self.usage_store = Some(store);
        self
    }

    #[must_use]
    pub fn decision_store(mut self, store: Arc<dyn AppendStore<RoutingDecision>>) -> Self {
        self.decision_store = Some(store);
        self
    }

    #[must_use]
    pub fn health_stores(
        mut self,
        providers: Arc<dyn AppendStore<ProviderHealthRecord>>,
        models: Arc<dyn AppendStore<ModelMetricsRecord>>,
    ) -> Self {
        self.health_store = Some(providers);
        self.model_metrics_store = Some(models);
        self
    }

    /// Validate the configuration and assemble the router
    ///
    /// With declared `[[providers]]`, only adapters matching an enabled
    /// declaration are registered; otherwise every offered adapter is.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::ValidationError`] for an invalid configuration.
    pub fn build(self) -> Result<QueryRouter, ConfigError> {
        let config = self.config;
        config.validate()?;

        let providers = Arc::new(if config.providers.is_empty() {
            self.adapters
                .into_iter()
                .fold(ProviderRegistry::builder(), |b, a| b.register(a))
                .build()
        } else {
            ProviderRegistry::from_config(&config.providers, self.adapters)
        });

        let mut engine = RoutingEngine::new(Arc::clone(&providers));
        if let Some(sampler) = self.sampler {
            engine = engine.with_sampler(sampler);
        }

        let breakers = Arc::new(CircuitBreakerRegistry::new(config.circuit_breaker.clone()));
        let metrics = Arc::new(MetricsRegistry::new(config.metrics.clone()));
        let dispatcher = ResilientDispatcher::new(
            Arc::clone(&providers),
            Arc::clone(&breakers),
            Arc::clone(&metrics),
        );

        let backend = config.usage.store;
        let usage = match self.usage_store {
            Some(store) => UsageLedger::with_store(config.usage.clone(), store),
            None => UsageLedger::new(config.usage.clone()),
        };

        for warning in config.fallback.lint() {
            tracing::warn!("{warning}");
        }
        tracing::info!(
            models = config.models.len(),
            providers = ?providers.names(),
            fallback_rules = config.fallback.rules.len(),
            "Query router ready"
        );

        Ok(QueryRouter {
            limiter: RateLimiter::new(config.rate_limit.clone()),
            engine,
            dispatcher,
            breakers,
            metrics,
            usage,
            decisions: self.decision_store.unwrap_or_else(|| backend.build()),
            provider_health: self.health_store.unwrap_or_else(|| backend.build()),
            model_metrics: self.model_metrics_store.unwrap_or_else(|| backend.build()),
            config: ConfigHandle::new(config),
        })
    }
}

// ============================================================================
// Tests
// ============================================================================
