//! Candidate Ranking Strategies
//!
//! Each strategy is a deterministic ranking over the eligible pool. Sorting is
//! stable and every comparator ends with an explicit tie-break on model id and
//! provider, so a fixed pool and a fixed metrics snapshot always produce the
//! same order.
//!
//! | Strategy | Order |
//! |---|---|
//! | `LoadBalancing` | fewest recent requests first |
//! | `LatencyOptimized` | lowest average latency; unsampled models last |
//! | `CostOptimized` | cheapest estimate for the request's token profile |
//! | `QualityOptimized` | highest configured quality score |
//! | `ContentBased` | shortlist models the request fits, then a secondary strategy |
//! | `Experimental` | sometimes splice experimental models to the front |

use std::cmp::Ordering;

use super::config::{ModelProfile, RoutingConfig, RoutingStrategy};
use super::metrics::MetricsSnapshot;
use crate::request::GatewayRequest;

// ============================================================================
// Experiment Sampling
// ============================================================================

/// Source of the experimental sampling draw
pub trait ExperimentSampler: Send + Sync {
    /// Uniform draw in `[0, 1)`
    fn draw(&self) -> f64;
}

/// Thread-local RNG sampler
#[derive(Clone, Copy, Debug, Default)]
pub struct RandomSampler;

impl ExperimentSampler for RandomSampler {
    fn draw(&self) -> f64 {
        rand::random::<f64>()
    }
}

/// Always returns the same draw
#[derive(Clone, Copy, Debug)]
pub struct FixedSampler(pub f64);

impl ExperimentSampler for FixedSampler {
    fn draw(&self) -> f64 {
        self.0
    }
}

// ============================================================================
// Ranking
// ============================================================================

/// Inputs shared by every strategy
pub struct RankContext<'a> {
    pub config: &'a RoutingConfig,
    pub metrics: &'a MetricsSnapshot,
    pub request: &'a GatewayRequest,
    pub sampler: &'a dyn ExperimentSampler,
}

impl RankContext<'_> {
    fn prompt_tokens(&self) -> u64 {
        self.request.estimated_prompt_tokens()
    }

    fn completion_tokens(&self) -> u64 {
        self.request
            .estimated_completion_tokens(self.config.default_completion_tokens)
    }
}

fn tie_break(a: &ModelProfile, b: &ModelProfile) -> Ordering {
    a.model_id
        .cmp(&b.model_id)
        .then_with(|| a.provider.cmp(&b.provider))
}

/// Strategy used when a composite strategy names another composite one
fn simple_or_default(strategy: RoutingStrategy) -> RoutingStrategy {
    if strategy.is_composite() {
        RoutingStrategy::LoadBalancing
    } else {
        strategy
    }
}

/// Rank `pool` with `strategy`
pub fn rank<'m>(
    strategy: RoutingStrategy,
    mut pool: Vec<&'m ModelProfile>,
    ctx: &RankContext<'_>,
) -> Vec<&'m ModelProfile> {
    match strategy {
        RoutingStrategy::LoadBalancing => {
            pool.sort_by(|a, b| {
                ctx.metrics
                    .recent_requests(&a.key())
                    .cmp(&ctx.metrics.recent_requests(&b.key()))
                    .then_with(|| tie_break(a, b))
            });
            pool
        }
        RoutingStrategy::LatencyOptimized => {
            pool.sort_by(|a, b| {
                let la = ctx.metrics.avg_latency_ms(&a.key());
                let lb = ctx.metrics.avg_latency_ms(&b.key());
                match (la, lb) {
                    (Some(x), Some(y)) => x.total_cmp(&y),
                    (Some(_), None) => Ordering::Less,
                    (None, Some(_)) => Ordering::Greater,
                    (None, None) => Ordering::Equal,
                }
                .then_with(|| tie_break(a, b))
            });
            pool
        }
        RoutingStrategy::CostOptimized => {
            let prompt = ctx.prompt_tokens();
            let completion = ctx.completion_tokens();
            pool.sort_by(|a, b| {
                a.estimate_cost(prompt, completion)
                    .total_cmp(&b.estimate_cost(prompt, completion))
                    .then_with(|| tie_break(a, b))
            });
            pool
        }
        RoutingStrategy::QualityOptimized => {
            pool.sort_by(|a, b| {
                ctx.config
                    .quality_of(&b.model_id)
                    .total_cmp(&ctx.config.quality_of(&a.model_id))
                    .then_with(|| tie_break(a, b))
            });
            pool
        }
        RoutingStrategy::ContentBased => rank_content_based(pool, ctx),
        RoutingStrategy::Experimental => rank_experimental(pool, ctx),
    }
}

/// Shortlist models whose context window fits the request, then rank them
///
/// When nothing fits, the whole pool is ranked rather than returning nothing;
/// the provider will reject an oversized request with a proper error.
fn rank_content_based<'m>(
    pool: Vec<&'m ModelProfile>,
    ctx: &RankContext<'_>,
) -> Vec<&'m ModelProfile> {
    let prompt = ctx.prompt_tokens();
    let completion = ctx.completion_tokens();
    let shortlist: Vec<&ModelProfile> = pool
        .iter()
        .copied()
        .filter(|m| m.fits(prompt, completion))
        .collect();

    let secondary = simple_or_default(ctx.config.content_secondary_strategy);
    if shortlist.is_empty() {
        tracing::debug!(
            prompt_tokens = prompt,
            "No model fits the request content, ranking the full pool"
        );
        return rank(secondary, pool, ctx);
    }
    rank(secondary, shortlist, ctx)
}

fn rank_experimental<'m>(
    pool: Vec<&'m ModelProfile>,
    ctx: &RankContext<'_>,
) -> Vec<&'m ModelProfile> {
    let fallback = simple_or_default(ctx.config.experimental_fallback_strategy);
    let sampled = !ctx.config.experimental_models.is_empty()
        && ctx.sampler.draw() < ctx.config.experimental_sampling_rate;

    if !sampled {
        return rank(fallback, pool, ctx);
    }

    let (mut experimental, rest): (Vec<&ModelProfile>, Vec<&ModelProfile>) = pool
        .into_iter()
        .partition(|m| ctx.config.experimental_models.contains(&m.model_id));
    experimental.sort_by_key(|m| {
        ctx.config
            .experimental_models
            .iter()
            .position(|id| *id == m.model_id)
    });

    tracing::debug!(
        request_id = %ctx.request.request_id,
        promoted = experimental.len(),
        "Experimental models promoted"
    );

    experimental.extend(rank(fallback, rest, ctx));
    experimental
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routing::config::ModelKey;
    use crate::routing::metrics::ModelStats;

    fn pool() -> Vec<ModelProfile> {
        vec![
            ModelProfile::new("gpt-4", "openai")
                .with_costs(0.03, 0.06)
                .with_context_window(8192),
            ModelProfile::new("claude-3", "anthropic")
                .with_costs(0.015, 0.075)
                .with_context_window(200_000),
            ModelProfile::new("gpt-3.5-turbo", "openai")
                .with_costs(0.0005, 0.0015)
                .with_context_window(4096),
        ]
    }

    fn stats(requests: u64, latency: Option<f64>) -> ModelStats {
        ModelStats {
            recent_requests: requests,
            avg_latency_ms: latency,
            success_rate: 1.0,
        }
    }

    fn ids(ranked: &[&ModelProfile]) -> Vec<String> {
        ranked.iter().map(|m| m.model_id.clone()).collect()
    }

    fn ranked(
        strategy: RoutingStrategy,
        config: &RoutingConfig,
        metrics: &MetricsSnapshot,
        request: &GatewayRequest,
        draw: f64,
    ) -> Vec<String> {
        let models = pool();
        let sampler = FixedSampler(draw);
        let ctx = RankContext {
            config,
            metrics,
            request,
            sampler: &sampler,
        };
        ids(&rank(strategy, models.iter().collect(), &ctx))
    }

    #[test]
    fn test_load_balancing_prefers_idle_with_id_tie_break() {
        let metrics = MetricsSnapshot::new()
            .with(ModelKey::new("gpt-4", "openai"), stats(5, None))
            .with(ModelKey::new("claude-3", "anthropic"), stats(2, None));
        let order = ranked(
            RoutingStrategy::LoadBalancing,
            &RoutingConfig::default(),
            &metrics,
            &GatewayRequest::completion("hi"),
            0.5,
        );
        assert_eq!(order, vec!["gpt-3.5-turbo", "claude-3", "gpt-4"]);

        let empty = ranked(
            RoutingStrategy::LoadBalancing,
            &RoutingConfig::default(),
            &MetricsSnapshot::new(),
            &GatewayRequest::completion("hi"),
            0.5,
        );
        assert_eq!(empty, vec!["claude-3", "gpt-3.5-turbo", "gpt-4"]);
    }

    #[test]
    fn test_latency_ranks_unsampled_last() {
        let metrics = MetricsSnapshot::new()
            .with(ModelKey::new("gpt-4", "openai"), stats(5, Some(900.0)))
            .with(ModelKey::new("gpt-3.5-turbo", "openai"), stats(5, Some(300.0)));
        let order = ranked(
            RoutingStrategy::LatencyOptimized,
            &RoutingConfig::default(),
            &metrics,
            &GatewayRequest::completion("hi"),
            0.5,
        );
        assert_eq!(order, vec!["gpt-3.5-turbo", "gpt-4", "claude-3"]);
    }

    #[test]
    fn test_cost_uses_request_token_profile() {
        let request = GatewayRequest::completion("x".repeat(4000)).with_max_tokens(100);
        let order = ranked(
            RoutingStrategy::CostOptimized,
            &RoutingConfig::default(),
            &MetricsSnapshot::new(),
            &request,
            0.5,
        );
        // 1000 prompt + 100 completion: gpt-4 0.036, claude-3 0.0225
        assert_eq!(order, vec!["gpt-3.5-turbo", "claude-3", "gpt-4"]);
    }

    #[test]
    fn test_quality_descending() {
        let mut config = RoutingConfig::default();
        config.quality_scores.insert("gpt-4".into(), 0.9);
        config.quality_scores.insert("claude-3".into(), 0.95);
        let order = ranked(
            RoutingStrategy::QualityOptimized,
            &config,
            &MetricsSnapshot::new(),
            &GatewayRequest::completion("hi"),
            0.5,
        );
        assert_eq!(order, vec!["claude-3", "gpt-4", "gpt-3.5-turbo"]);
    }

    #[test]
    fn test_content_based_shortlists_by_context_window() {
        let mut config = RoutingConfig::default();
        config.content_secondary_strategy = RoutingStrategy::CostOptimized;
        // 6000 prompt tokens only fit gpt-4 and claude-3
        let request = GatewayRequest::completion("x".repeat(24_000)).with_max_tokens(500);
        let order = ranked(
            RoutingStrategy::ContentBased,
            &config,
            &MetricsSnapshot::new(),
            &request,
            0.5,
        );
        assert_eq!(order, vec!["claude-3", "gpt-4"]);

        let huge = GatewayRequest::completion("x".repeat(2_000_000));
        let order = ranked(
            RoutingStrategy::ContentBased,
            &config,
            &MetricsSnapshot::new(),
            &huge,
            0.5,
        );
        assert_eq!(order.len(), 3, "nothing fits, full pool ranked");
    }

    #[test]
    fn test_experimental_sampling() {
        let mut config = RoutingConfig::default();
        config.experimental_models = vec!["gpt-4".into()];
        config.experimental_sampling_rate = 0.1;

        let hit = ranked(
            RoutingStrategy::Experimental,
            &config,
            &MetricsSnapshot::new(),
            &GatewayRequest::completion("hi"),
            0.05,
        );
        assert_eq!(hit, vec!["gpt-4", "claude-3", "gpt-3.5-turbo"]);

        let miss = ranked(
            RoutingStrategy::Experimental,
            &config,
            &MetricsSnapshot::new(),
            &GatewayRequest::completion("hi"),
            0.5,
        );
        assert_eq!(miss, vec!["claude-3", "gpt-3.5-turbo", "gpt-4"]);
    }

    #[test]
    fn test_ranking_is_deterministic() {
        let metrics = MetricsSnapshot::new()
            .with(ModelKey::new("gpt-4", "openai"), stats(1, None))
            .with(ModelKey::new("claude-3", "anthropic"), stats(1, None));
        let request = GatewayRequest::completion("hi");
        let config = RoutingConfig::default();
        let first = ranked(RoutingStrategy::LoadBalancing, &config, &metrics, &request, 0.5);
        let second = ranked(RoutingStrategy::LoadBalancing, &config, &metrics, &request, 0.5);
        assert_eq!(first, second);
    }
}
