//! Routing Configuration
//!
//! Configuration types for model profiles, routing strategies, alias
//! resolution, user preferences and retry behavior.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

// ============================================================================
// Capabilities
// ============================================================================

/// Capability flags of a model, or the capabilities a request requires
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct Capabilities {
    /// Text completions
    pub completions: bool,
    /// Embedding vectors
    pub embeddings: bool,
    /// Streaming responses
    pub streaming: bool,
    /// Function/tool calling
    pub function_calling: bool,
    /// Image inputs
    pub vision: bool,
}

impl Capabilities {
    /// Completion-only capability set
    #[must_use]
    pub fn completions() -> Self {
        Self {
            completions: true,
            ..Self::default()
        }
    }

    /// Embedding-only capability set
    #[must_use]
    pub fn embeddings() -> Self {
        Self {
            embeddings: true,
            ..Self::default()
        }
    }

    /// Whether every flag set in `required` is also set here
    #[must_use]
    pub fn covers(&self, required: &Capabilities) -> bool {
        (!required.completions || self.completions)
            && (!required.embeddings || self.embeddings)
            && (!required.streaming || self.streaming)
            && (!required.function_calling || self.function_calling)
            && (!required.vision || self.vision)
    }
}

// ============================================================================
// Model Profile
// ============================================================================

/// Identity of a provider/model pair
///
/// Circuit breakers and metric series are keyed by this pair.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ModelKey {
    /// Gateway-facing model id
    pub model_id: String,
    /// Owning provider name
    pub provider: String,
}

impl ModelKey {
    pub fn new(model_id: impl Into<String>, provider: impl Into<String>) -> Self {
        Self {
            model_id: model_id.into(),
            provider: provider.into(),
        }
    }
}

impl fmt::Display for ModelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.provider, self.model_id)
    }
}

/// Profile of a model served through a provider
///
/// Immutable for the lifetime of a configuration snapshot.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ModelProfile {
    /// Gateway-facing model identifier
    pub model_id: String,

    /// Owning provider name
    pub provider: String,

    /// Identifier the provider expects (defaults to `model_id`)
    #[serde(default)]
    pub provider_model_id: Option<String>,

    /// What the model can do
    #[serde(default = "Capabilities::completions")]
    pub capabilities: Capabilities,

    /// Context window in tokens (0 = unknown)
    #[serde(default)]
    pub context_window: u32,

    /// USD per 1k prompt tokens
    #[serde(default)]
    pub prompt_cost_per_1k: f64,

    /// USD per 1k completion tokens
    #[serde(default)]
    pub completion_cost_per_1k: f64,

    /// Whether the model may be routed to
    #[serde(default = "default_true")]
    pub is_active: bool,
}

fn default_true() -> bool {
    true
}

impl ModelProfile {
    /// Create a completion model with no pricing and unknown context window
    pub fn new(model_id: impl Into<String>, provider: impl Into<String>) -> Self {
        Self {
            model_id: model_id.into(),
            provider: provider.into(),
            provider_model_id: None,
            capabilities: Capabilities::completions(),
            context_window: 0,
            prompt_cost_per_1k: 0.0,
            completion_cost_per_1k: 0.0,
            is_active: true,
        }
    }

    #[must_use]
    pub fn with_capabilities(mut self, capabilities: Capabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    #[must_use]
    pub fn with_costs(mut self, prompt_per_1k: f64, completion_per_1k: f64) -> Self {
        self.prompt_cost_per_1k = prompt_per_1k;
        self.completion_cost_per_1k = completion_per_1k;
        self
    }

    #[must_use]
    pub fn with_context_window(mut self, tokens: u32) -> Self {
        self.context_window = tokens;
        self
    }

    #[must_use]
    pub fn with_provider_model_id(mut self, id: impl Into<String>) -> Self {
        self.provider_model_id = Some(id.into());
        self
    }

    #[must_use]
    pub fn inactive(mut self) -> Self {
        self.is_active = false;
        self
    }

    /// Identifier to send upstream
    #[must_use]
    pub fn upstream_id(&self) -> &str {
        self.provider_model_id.as_deref().unwrap_or(&self.model_id)
    }

    #[must_use]
    pub fn key(&self) -> ModelKey {
        ModelKey::new(&self.model_id, &self.provider)
    }

    /// Cost in USD for a token profile, using per-1k pricing
    #[must_use]
    pub fn estimate_cost(&self, prompt_tokens: u64, completion_tokens: u64) -> f64 {
        (prompt_tokens as f64 / 1000.0) * self.prompt_cost_per_1k
            + (completion_tokens as f64 / 1000.0) * self.completion_cost_per_1k
    }

    /// Whether a request of this size fits the context window
    #[must_use]
    pub fn fits(&self, prompt_tokens: u64, completion_tokens: u64) -> bool {
        self.context_window == 0
            || prompt_tokens + completion_tokens <= u64::from(self.context_window)
    }
}

// ============================================================================
// Routing Strategy
// ============================================================================

/// Candidate ranking strategy
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutingStrategy {
    /// Fewest recent requests first
    #[default]
    LoadBalancing,
    /// Lowest rolling average response time first
    LatencyOptimized,
    /// Cheapest estimated cost first
    CostOptimized,
    /// Highest configured quality score first
    QualityOptimized,
    /// Shortlist by request content, then rank with a secondary strategy
    ContentBased,
    /// Occasionally promote experimental models
    Experimental,
}

impl RoutingStrategy {
    pub const ALL: [RoutingStrategy; 6] = [
        Self::LoadBalancing,
        Self::LatencyOptimized,
        Self::CostOptimized,
        Self::QualityOptimized,
        Self::ContentBased,
        Self::Experimental,
    ];

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::LoadBalancing => "load_balancing",
            Self::LatencyOptimized => "latency_optimized",
            Self::CostOptimized => "cost_optimized",
            Self::QualityOptimized => "quality_optimized",
            Self::ContentBased => "content_based",
            Self::Experimental => "experimental",
        }
    }

    /// Whether this strategy delegates to another one
    #[must_use]
    pub fn is_composite(&self) -> bool {
        matches!(self, Self::ContentBased | Self::Experimental)
    }
}

impl fmt::Display for RoutingStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RoutingStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace('-', "_");
        Self::ALL
            .iter()
            .copied()
            .find(|strategy| strategy.as_str() == normalized)
            .ok_or_else(|| format!("unknown routing strategy: {s}"))
    }
}

// ============================================================================
// Mappings and Preferences
// ============================================================================

/// Alias from a requested model id to a concrete model id
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelMapping {
    pub model_id: String,
    pub target_model_id: String,
}

/// Preferred strategy for requests targeting a model
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelStrategyAssignment {
    pub model_id: String,
    pub strategy: RoutingStrategy,
}

/// Per-user strategy override
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRoutingPreference {
    pub user_id: String,
    pub strategy: RoutingStrategy,
}

/// Per-user preferred model, used when a request does not pin one
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserModelPreference {
    pub user_id: String,
    pub preferred_model_id: String,
}

/// User preference set
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UserPreferences {
    pub routing: Vec<UserRoutingPreference>,
    pub models: Vec<UserModelPreference>,
}

impl UserPreferences {
    #[must_use]
    pub fn strategy_for(&self, user_id: &str) -> Option<RoutingStrategy> {
        self.routing
            .iter()
            .find(|p| p.user_id == user_id)
            .map(|p| p.strategy)
    }

    #[must_use]
    pub fn model_for(&self, user_id: &str) -> Option<&str> {
        self.models
            .iter()
            .find(|p| p.user_id == user_id)
            .map(|p| p.preferred_model_id.as_str())
    }
}

// ============================================================================
// Routing Configuration
// ============================================================================

/// Strategy selection and ranking inputs
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutingConfig {
    /// Consult per-request, per-user and per-model strategy sources
    pub enable_smart_routing: bool,

    pub enable_load_balancing: bool,
    pub enable_latency_optimized: bool,
    pub enable_cost_optimized: bool,
    pub enable_quality_optimized: bool,
    pub enable_content_based: bool,
    pub enable_experimental: bool,

    /// Append a `RoutingDecision` for every request
    pub track_routing_decisions: bool,

    /// Feed dispatch outcomes into the metrics registry
    pub track_model_metrics: bool,

    /// Strategy used when no other source applies
    pub default_strategy: RoutingStrategy,

    /// Probability (0.0 - 1.0) that the experimental strategy promotes its models
    pub experimental_sampling_rate: f64,

    /// Models promoted by the experimental strategy, in order
    pub experimental_models: Vec<String>,

    /// Ranking used by the experimental strategy when it does not promote
    pub experimental_fallback_strategy: RoutingStrategy,

    /// Ranking used inside the content-based shortlist
    pub content_secondary_strategy: RoutingStrategy,

    /// Completion length assumed when the request does not bound it
    pub default_completion_tokens: u32,

    /// Static quality score per model (higher is better)
    pub quality_scores: HashMap<String, f64>,

    /// Alias resolution table
    pub model_mappings: Vec<ModelMapping>,

    /// Per-model strategy assignments
    pub model_strategies: Vec<ModelStrategyAssignment>,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            enable_smart_routing: true,
            enable_load_balancing: true,
            enable_latency_optimized: true,
            enable_cost_optimized: true,
            enable_quality_optimized: true,
            enable_content_based: true,
            enable_experimental: false,
            track_routing_decisions: true,
            track_model_metrics: true,
            default_strategy: RoutingStrategy::LoadBalancing,
            experimental_sampling_rate: 0.1,
            experimental_models: Vec::new(),
            experimental_fallback_strategy: RoutingStrategy::LoadBalancing,
            content_secondary_strategy: RoutingStrategy::LoadBalancing,
            default_completion_tokens: 256,
            quality_scores: HashMap::new(),
            model_mappings: Vec::new(),
            model_strategies: Vec::new(),
        }
    }
}

impl RoutingConfig {
    #[must_use]
    pub fn is_strategy_enabled(&self, strategy: RoutingStrategy) -> bool {
        match strategy {
            RoutingStrategy::LoadBalancing => self.enable_load_balancing,
            RoutingStrategy::LatencyOptimized => self.enable_latency_optimized,
            RoutingStrategy::CostOptimized => self.enable_cost_optimized,
            RoutingStrategy::QualityOptimized => self.enable_quality_optimized,
            RoutingStrategy::ContentBased => self.enable_content_based,
            RoutingStrategy::Experimental => self.enable_experimental,
        }
    }

    /// Resolve an alias (single hop); unmapped ids resolve to themselves
    #[must_use]
    pub fn resolve_alias<'a>(&'a self, model_id: &'a str) -> &'a str {
        self.model_mappings
            .iter()
            .find(|m| m.model_id == model_id)
            .map_or(model_id, |m| m.target_model_id.as_str())
    }

    #[must_use]
    pub fn strategy_for_model(&self, model_id: &str) -> Option<RoutingStrategy> {
        self.model_strategies
            .iter()
            .find(|m| m.model_id == model_id)
            .map(|m| m.strategy)
    }

    #[must_use]
    pub fn quality_of(&self, model_id: &str) -> f64 {
        self.quality_scores.get(model_id).copied().unwrap_or(0.0)
    }
}

// ============================================================================
// Retry Configuration
// ============================================================================

/// Retry policy for transient provider failures
///
/// Retry `n` (1-based) waits `initial_backoff_ms * backoff_multiplier^(n-1)`,
/// held at `max_backoff_ms`. With jitter on, the wait is spread uniformly over
/// `[base * (1 - jitter_ratio), base * (1 + jitter_ratio)]` and still never
/// exceeds `max_backoff_ms`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Retries after the first call
    pub max_retries: u32,

    pub initial_backoff_ms: u64,

    pub max_backoff_ms: u64,

    /// Growth per retry (values below 1.0 are treated as 1.0)
    pub backoff_multiplier: f32,

    pub use_jitter: bool,

    /// Half-width of the jitter band as a fraction of the base delay
    pub jitter_ratio: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff_ms: 100,
            max_backoff_ms: 10_000,
            backoff_multiplier: 2.0,
            use_jitter: true,
            jitter_ratio: 0.25,
        }
    }
}

impl RetryConfig {
    /// No local retries
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    fn ceiling(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms.max(self.initial_backoff_ms))
    }

    /// Un-jittered delay before retry `retry` (1-based)
    #[must_use]
    pub fn base_delay(&self, retry: u32) -> Duration {
        let ceiling = self.ceiling();
        let growth = f64::from(self.backoff_multiplier).max(1.0);
        let mut delay = Duration::from_millis(self.initial_backoff_ms);
        for _ in 1..retry {
            if delay >= ceiling {
                break;
            }
            delay = Duration::try_from_secs_f64(delay.as_secs_f64() * growth).unwrap_or(ceiling);
        }
        delay.min(ceiling)
    }

    /// Delay before retry `retry` (1-based), jittered with `rng` when enabled
    pub fn retry_delay<R: Rng + ?Sized>(&self, retry: u32, rng: &mut R) -> Duration {
        let base = self.base_delay(retry);
        let ratio = self.jitter_ratio.clamp(0.0, 1.0);
        if !self.use_jitter || ratio == 0.0 || base.is_zero() {
            return base;
        }
        let factor = rng.gen_range((1.0 - ratio)..=(1.0 + ratio));
        Duration::try_from_secs_f64(base.as_secs_f64() * factor)
            .unwrap_or(base)
            .min(self.ceiling())
    }
}
