//! Routing Policy
//!
//! Turns a request and the current configuration snapshot into an ordered
//! candidate list of provider/model pairs.
//!
//! # Candidate Selection Flow
//!
//! ```text
//! 1. Resolve the requested model through alias mappings
//! 2. Pick the effective strategy (request > user > model > default)
//! 3. Filter eligible models (active, capable, provider registered)
//! 4. Rank the pool with the strategy
//! 5. Compose: pinned model, its fallback rule entries, then the ranking
//! 6. Drop open circuits (keep the best one as a last resort if nothing else remains)
//! ```
//!
//! The engine holds no mutable state. Health data arrives as a
//! [`MetricsSnapshot`] and a [`CircuitView`], so for fixed inputs the
//! output ordering is reproducible.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::config::{Capabilities, ModelProfile, RoutingStrategy};
use super::fallback::AttemptRecord;
use super::health::CircuitView;
use super::metrics::MetricsSnapshot;
use super::strategy::{rank, ExperimentSampler, RandomSampler, RankContext};
use crate::config::GatewayConfig;
use crate::error::{ErrorCode, GatewayError};
use crate::provider::ProviderRegistry;
use crate::request::{GatewayRequest, AUTO_MODEL};
use crate::store::Timestamped;

// ============================================================================
// Routing Context
// ============================================================================

/// Read-only inputs for one routing decision
#[derive(Clone, Copy)]
pub struct RoutingContext<'a> {
    /// Configuration snapshot the request runs under
    pub config: &'a GatewayConfig,
    /// Health data read at call time
    pub metrics: &'a MetricsSnapshot,
    /// Derived circuit availability
    pub circuits: &'a dyn CircuitView,
}

// ============================================================================
// Candidate List
// ============================================================================

/// One entry of the ordered candidate list
#[derive(Clone, Debug, PartialEq)]
pub struct Candidate {
    pub model: ModelProfile,

    /// Kept despite an open circuit because nothing else remained
    pub last_resort: bool,
}

/// Routing output for one request
#[derive(Clone, Debug)]
pub struct CandidateList {
    /// Model id as the caller wrote it (`auto` when absent)
    pub requested_model: String,

    /// Concrete model the request resolved to, if it named or preferred one
    pub resolved_model: Option<String>,

    /// Model whose fallback rule governs this request
    pub rule_key: String,

    /// Strategy that ranked the tail of the list
    pub strategy: RoutingStrategy,

    /// Ordered candidates, never empty
    pub candidates: Vec<Candidate>,

    /// Models dropped because their circuit is open
    pub excluded_open: Vec<String>,
}

impl CandidateList {
    #[must_use]
    pub fn model_ids(&self) -> Vec<String> {
        self.candidates
            .iter()
            .map(|c| c.model.model_id.clone())
            .collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.candidates.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }

    #[must_use]
    pub fn first(&self) -> Option<&Candidate> {
        self.candidates.first()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Candidate> {
        self.candidates.iter()
    }

    #[must_use]
    pub fn contains(&self, model_id: &str) -> bool {
        self.candidates.iter().any(|c| c.model.model_id == model_id)
    }
}

/// Where the head of the list came from
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum PinSource {
    /// The request named a model
    Request,
    /// The user's preferred model
    UserPreference,
    /// `global.default_model` with smart routing off
    GlobalDefault,
}

// ============================================================================
// Routing Decision
// ============================================================================

/// Audit record written once per completed top-level request
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RoutingDecision {
    pub request_id: String,
    pub user_id: Option<String>,
    pub requested_model: String,

    /// Candidate that served the request (`None` when nothing succeeded)
    pub selected_model: Option<String>,
    pub provider: Option<String>,

    pub strategy: RoutingStrategy,
    pub success: bool,

    /// Wall time from admission to outcome
    pub response_time_ms: u64,

    /// Whether more than one candidate was attempted
    pub is_fallback: bool,

    /// Failure that moved the request past its first candidate
    pub fallback_reason: Option<ErrorCode>,

    /// Terminal error code for unsuccessful requests
    pub error: Option<ErrorCode>,

    pub attempt_count: u32,

    /// Ordered candidate list the engine produced
    pub candidates: Vec<String>,

    pub attempts: Vec<AttemptRecord>,
    pub timestamp: DateTime<Utc>,
}

impl Timestamped for RoutingDecision {
    fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
}

// ============================================================================
// Routing Engine
// ============================================================================

/// Stateless candidate selection
pub struct RoutingEngine {
    providers: Arc<ProviderRegistry>,
    sampler: Arc<dyn ExperimentSampler>,
}

impl RoutingEngine {
    pub fn new(providers: Arc<ProviderRegistry>) -> Self {
        Self {
            providers,
            sampler: Arc::new(RandomSampler),
        }
    }

    /// Replace the experimental sampling source
    #[must_use]
    pub fn with_sampler(mut self, sampler: Arc<dyn ExperimentSampler>) -> Self {
        self.sampler = sampler;
        self
    }

    #[must_use]
    pub fn providers(&self) -> &Arc<ProviderRegistry> {
        &self.providers
    }

    /// Whether a model may serve a request needing `required`
    #[must_use]
    pub fn is_eligible(&self, model: &ModelProfile, required: &Capabilities) -> bool {
        model.is_active
            && model.capabilities.covers(required)
            && self.providers.contains(&model.provider)
    }

    /// Strategy for a request, by precedence: request > user > model > default
    ///
    /// Sources naming a disabled strategy are skipped. With smart routing
    /// off, only the default applies; the default applies even if disabled.
    #[must_use]
    pub fn effective_strategy(
        &self,
        config: &GatewayConfig,
        request: &GatewayRequest,
        model_id: Option<&str>,
    ) -> RoutingStrategy {
        let routing = &config.routing;
        if !routing.enable_smart_routing {
            return routing.default_strategy;
        }

        let user = request
            .user_id
            .as_deref()
            .and_then(|u| config.user_preferences.strategy_for(u));
        let per_model = model_id.and_then(|m| routing.strategy_for_model(m));

        [request.strategy, user, per_model]
            .into_iter()
            .flatten()
            .find(|s| routing.is_strategy_enabled(*s))
            .unwrap_or(routing.default_strategy)
    }

    /// Produce the ordered candidate list for a request
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::NoEligibleModel`] when the request names a
    /// model that is not configured, or no active model with a registered
    /// provider satisfies the request's capabilities.
    pub fn select_candidates(
        &self,
        request: &GatewayRequest,
        ctx: &RoutingContext<'_>,
    ) -> Result<CandidateList, GatewayError> {
        let config = ctx.config;
        let routing = &config.routing;
        let required = request.required_capabilities();

        let requested = request
            .pinned_model()
            .map_or_else(|| AUTO_MODEL.to_string(), str::to_string);

        let pin = self.pinned_model(request, config)?;
        let resolved = pin.map(|(model, _)| model);

        let rule_key = [requested.as_str()]
            .into_iter()
            .chain(resolved.map(|m| m.model_id.as_str()))
            .find(|key| config.fallback.rule_for(key).is_some())
            .or(resolved.map(|m| m.model_id.as_str()))
            .unwrap_or(AUTO_MODEL)
            .to_string();

        // Per-model assignments may be keyed by the alias or the concrete id
        let strategy_model = [
            Some(requested.as_str()).filter(|r| *r != AUTO_MODEL),
            resolved.map(|m| m.model_id.as_str()),
        ]
        .into_iter()
        .flatten()
        .find(|k| routing.strategy_for_model(k).is_some());
        let strategy = self.effective_strategy(config, request, strategy_model);

        let pool: Vec<&ModelProfile> = config
            .models
            .iter()
            .filter(|m| self.is_eligible(m, &required))
            .collect();

        if pool.is_empty() {
            return Err(GatewayError::NoEligibleModel {
                requested,
                reason: "no active model on a registered provider has the required capabilities"
                    .into(),
            });
        }

        let rank_ctx = RankContext {
            config: routing,
            metrics: ctx.metrics,
            request,
            sampler: self.sampler.as_ref(),
        };
        let ranked = rank(strategy, pool, &rank_ctx);

        let mut ordered: Vec<&ModelProfile> = Vec::with_capacity(ranked.len() + 1);
        if let Some((model, source)) = pin {
            if self.is_eligible(model, &required) {
                ordered.push(model);
            } else {
                tracing::debug!(
                    request_id = %request.request_id,
                    model = %model.model_id,
                    source = ?source,
                    "Pinned model is not eligible, skipping"
                );
            }
        }
        if let Some(rule) = config.fallback.rule_for(&rule_key) {
            for id in &rule.fallback_models {
                let target = routing.resolve_alias(id);
                match config.model(target) {
                    Some(model) if self.is_eligible(model, &required) => ordered.push(model),
                    _ => tracing::debug!(
                        rule = %rule_key,
                        model = %id,
                        "Fallback entry is not eligible, skipping"
                    ),
                }
            }
        }
        ordered.extend(ranked);

        let mut seen = HashSet::new();
        ordered.retain(|m| seen.insert(m.model_id.clone()));

        let (available, open): (Vec<&ModelProfile>, Vec<&ModelProfile>) = ordered
            .into_iter()
            .partition(|m| ctx.circuits.is_available(&m.key()));

        let (candidates, excluded_open) = if available.is_empty() {
            let mut open = open.into_iter();
            let head = open.next().map(|m| Candidate {
                model: m.clone(),
                last_resort: true,
            });
            if let Some(head) = &head {
                tracing::warn!(
                    request_id = %request.request_id,
                    model = %head.model.model_id,
                    provider = %head.model.provider,
                    "Every candidate circuit is open, keeping the first as a last resort"
                );
            }
            (
                head.into_iter().collect::<Vec<_>>(),
                open.map(|m| m.model_id.clone()).collect(),
            )
        } else {
            (
                available
                    .into_iter()
                    .map(|m| Candidate {
                        model: m.clone(),
                        last_resort: false,
                    })
                    .collect(),
                open.into_iter().map(|m| m.model_id.clone()).collect(),
            )
        };

        let list = CandidateList {
            requested_model: requested,
            resolved_model: resolved.map(|m| m.model_id.clone()),
            rule_key,
            strategy,
            candidates,
            excluded_open,
        };

        tracing::debug!(
            request_id = %request.request_id,
            requested = %list.requested_model,
            strategy = %list.strategy,
            candidates = ?list.model_ids(),
            excluded_open = ?list.excluded_open,
            "Candidates selected"
        );

        Ok(list)
    }

    /// Model pinned to the head of the list, and why
    fn pinned_model<'c>(
        &self,
        request: &GatewayRequest,
        config: &'c GatewayConfig,
    ) -> Result<Option<(&'c ModelProfile, PinSource)>, GatewayError> {
        if let Some(requested) = request.pinned_model() {
            let target = config.routing.resolve_alias(requested);
            return match config.model(target) {
                Some(model) => Ok(Some((model, PinSource::Request))),
                None => Err(GatewayError::NoEligibleModel {
                    requested: requested.to_string(),
                    reason: format!("model '{target}' is not configured"),
                }),
            };
        }

        let required = request.required_capabilities();
        let preferred = request
            .user_id
            .as_deref()
            .and_then(|u| config.user_preferences.model_for(u))
            .and_then(|id| config.model(config.routing.resolve_alias(id)))
            .filter(|m| self.is_eligible(m, &required));
        if let Some(model) = preferred {
            return Ok(Some((model, PinSource::UserPreference)));
        }

        if !config.routing.enable_smart_routing {
            let default = config
                .global
                .default_model
                .as_deref()
                .and_then(|id| config.model(config.routing.resolve_alias(id)));
            if let Some(model) = default {
                return Ok(Some((model, PinSource::GlobalDefault)));
            }
        }

        Ok(None)
    }
}

impl std::fmt::Debug for RoutingEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoutingEngine")
            .field("providers", &self.providers)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Tests
// ============================================================================
