//! TOML Configuration File Support
//!
//! Centralized configuration for the gateway core, loaded from a TOML file at
//! `~/.config/llm-gateway/gateway.toml` by default.
//!
//! # Configuration Priority
//!
//! Configuration values are loaded with the following priority (highest first):
//! 1. CLI arguments (via [`ConfigOverrides`])
//! 2. Environment variables (`LLM_GATEWAY_*`)
//! 3. TOML configuration file
//! 4. Default values
//!
//! # Snapshots
//!
//! A loaded [`GatewayConfig`] is immutable. Components receive it by
//! reference (or as an `Arc` snapshot per request through [`ConfigHandle`]);
//! a reload validates the new configuration and swaps the pointer.
//!
//! # Example Configuration
//!
//! ```toml
//! [global]
//! default_timeout_secs = 30
//!
//! [routing]
//! default_strategy = "cost_optimized"
//! model_mappings = [{ model_id = "gpt4", target_model_id = "gpt-4" }]
//!
//! [fallback]
//! max_fallback_attempts = 3
//!
//! [[fallback.rules]]
//! model_id = "gpt-4"
//! fallback_models = ["gpt-4-fallback", "gpt-3.5-turbo"]
//! error_codes = ["PermanentProviderError"]
//!
//! [rate_limit]
//! token_limit = 100
//! tokens_per_period = 100
//! replenishment_period_secs = 60
//!
//! [[providers]]
//! name = "openai"
//! kind = "open_ai"
//!
//! [[models]]
//! model_id = "gpt-4"
//! provider = "openai"
//! context_window = 8192
//! prompt_cost_per_1k = 0.03
//! completion_cost_per_1k = 0.06
//! ```

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::provider::ProviderConfig;
use crate::rate_limit::RateLimitConfig;
use crate::request::AUTO_MODEL;
use crate::routing::config::{
    ModelProfile, RetryConfig, RoutingConfig, RoutingStrategy, UserPreferences,
};
use crate::routing::fallback::FallbackConfig;
use crate::routing::health::CircuitBreakerConfig;
use crate::routing::metrics::MetricsConfig;
use crate::usage::UsageConfig;

// =============================================================================
// Error Types
// =============================================================================

/// Errors that can occur when loading configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read config file
    #[error("Failed to read config file at {path}: {source}")]
    ReadError {
        /// The path that was attempted
        path: PathBuf,
        /// The underlying IO error
        source: std::io::Error,
    },

    /// Failed to parse TOML
    #[error("Failed to parse TOML config: {0}")]
    ParseError(#[from] toml::de::Error),

    /// Invalid configuration value
    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

// =============================================================================
// Configuration Source Tracking
// =============================================================================

/// Tracks where the effective configuration came from
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfigSource {
    /// Value from command-line argument
    Cli,
    /// Value from environment variable
    Env,
    /// Value from TOML configuration file
    File,
    /// Default value
    Default,
}

impl std::fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cli => write!(f, "CLI"),
            Self::Env => write!(f, "environment"),
            Self::File => write!(f, "config file"),
            Self::Default => write!(f, "default"),
        }
    }
}

// =============================================================================
// Configuration Structures
// =============================================================================

/// Gateway-wide switches and timeouts
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GlobalConfig {
    /// Carried for the caller's response cache; the core does not cache
    pub enable_caching: bool,

    /// Record token usage for successful requests
    pub track_token_usage: bool,

    /// Per-attempt deadline for non-streaming requests
    pub default_timeout_secs: u64,

    /// Per-attempt deadline for streaming requests
    pub default_stream_timeout_secs: u64,

    /// Model used for `auto` requests when smart routing is off
    pub default_model: Option<String>,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            enable_caching: true,
            track_token_usage: true,
            default_timeout_secs: 30,
            default_stream_timeout_secs: 120,
            default_model: None,
        }
    }
}

impl GlobalConfig {
    /// Deadline applied to each attempt when the request sets none
    #[must_use]
    pub fn timeout_for(&self, stream: bool) -> Duration {
        if stream {
            Duration::from_secs(self.default_stream_timeout_secs)
        } else {
            Duration::from_secs(self.default_timeout_secs)
        }
    }
}

/// Complete gateway configuration snapshot
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub global: GlobalConfig,
    pub routing: RoutingConfig,
    pub user_preferences: UserPreferences,
    pub fallback: FallbackConfig,
    pub rate_limit: RateLimitConfig,
    pub circuit_breaker: CircuitBreakerConfig,
    pub retry: RetryConfig,
    pub metrics: MetricsConfig,
    pub usage: UsageConfig,
    pub providers: Vec<ProviderConfig>,
    pub models: Vec<ModelProfile>,
}

impl GatewayConfig {
    /// Parse and validate a TOML document
    ///
    /// # Errors
    ///
    /// Returns an error if the document does not parse or fails validation.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    #[must_use]
    pub fn model(&self, model_id: &str) -> Option<&ModelProfile> {
        self.models.iter().find(|m| m.model_id == model_id)
    }

    /// Whether `id` names a configured model, an alias or `auto`
    #[must_use]
    pub fn is_known_model(&self, id: &str) -> bool {
        id == AUTO_MODEL
            || self.model(id).is_some()
            || self.routing.model_mappings.iter().any(|m| m.model_id == id)
    }

    /// Check cross-field consistency
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::ValidationError`] describing the first problem found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::ValidationError(msg));

        if self.global.default_timeout_secs == 0 || self.global.default_stream_timeout_secs == 0 {
            return invalid("timeouts must be greater than zero".into());
        }

        let routing = &self.routing;
        if !(0.0..=1.0).contains(&routing.experimental_sampling_rate) {
            return invalid(format!(
                "experimental_sampling_rate must be within [0, 1], got {}",
                routing.experimental_sampling_rate
            ));
        }

        if self.rate_limit.enabled
            && (self.rate_limit.token_limit == 0
                || self.rate_limit.tokens_per_period == 0
                || self.rate_limit.replenishment_period_secs == 0)
        {
            return invalid(
                "rate_limit needs non-zero token_limit, tokens_per_period and refill period".into(),
            );
        }

        if self.circuit_breaker.failure_threshold == 0 {
            return invalid("circuit_breaker.failure_threshold must be at least 1".into());
        }

        if self.retry.max_backoff_ms < self.retry.initial_backoff_ms {
            return invalid("retry.max_backoff_ms must not be below initial_backoff_ms".into());
        }

        if !(0.0..=1.0).contains(&self.retry.jitter_ratio) {
            return invalid("retry.jitter_ratio must be between 0.0 and 1.0".into());
        }

        let mut ids = HashSet::new();
        for model in &self.models {
            if !ids.insert(model.model_id.as_str()) {
                return invalid(format!("duplicate model id: {}", model.model_id));
            }
            if !self.providers.is_empty()
                && !self.providers.iter().any(|p| p.name == model.provider)
            {
                return invalid(format!(
                    "model {} references undeclared provider {}",
                    model.model_id, model.provider
                ));
            }
        }

        for mapping in &routing.model_mappings {
            if self.model(&mapping.target_model_id).is_none() {
                return invalid(format!(
                    "model mapping {} -> {} targets an unknown model",
                    mapping.model_id, mapping.target_model_id
                ));
            }
        }
        for assignment in &routing.model_strategies {
            if !self.is_known_model(&assignment.model_id) {
                return invalid(format!(
                    "strategy assignment references unknown model {}",
                    assignment.model_id
                ));
            }
        }
        for id in &routing.experimental_models {
            if self.model(id).is_none() {
                return invalid(format!("experimental model {id} is not configured"));
            }
        }
        for preference in &self.user_preferences.models {
            if !self.is_known_model(&preference.preferred_model_id) {
                return invalid(format!(
                    "user {} prefers unknown model {}",
                    preference.user_id, preference.preferred_model_id
                ));
            }
        }
        if let Some(default_model) = &self.global.default_model {
            if !self.is_known_model(default_model) {
                return invalid(format!("default model {default_model} is not configured"));
            }
        }

        self.fallback
            .rules
            .validate(|id| self.is_known_model(id))
            .map_err(|e| ConfigError::ValidationError(e.to_string()))
    }
}

/// A configuration together with where it came from
#[derive(Clone, Debug)]
pub struct LoadedConfig {
    pub config: GatewayConfig,

    /// Path to the config file that was loaded (if any)
    pub path: Option<PathBuf>,

    /// Highest-priority source that contributed a value
    pub source: ConfigSource,
}

// =============================================================================
// Configuration Loading
// =============================================================================

/// Get the default configuration file path
///
/// Returns `$XDG_CONFIG_HOME/llm-gateway/gateway.toml` or the platform
/// equivalent.
#[must_use]
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("llm-gateway").join("gateway.toml"))
}

/// Load configuration from the default path, environment and defaults
///
/// # Errors
///
/// Returns an error if the config file exists but cannot be parsed, or the
/// result fails validation. A missing config file is not an error.
pub fn load_config() -> Result<LoadedConfig, ConfigError> {
    load_config_from_path(default_config_path().as_deref())
}

/// Load configuration from a specific path
///
/// # Errors
///
/// Returns an error if the specified config file cannot be read or parsed,
/// or the result fails validation.
pub fn load_config_from_path(path: Option<&Path>) -> Result<LoadedConfig, ConfigError> {
    let mut loaded = LoadedConfig {
        config: GatewayConfig::default(),
        path: None,
        source: ConfigSource::Default,
    };

    if let Some(config_path) = path {
        if config_path.exists() {
            let content =
                std::fs::read_to_string(config_path).map_err(|e| ConfigError::ReadError {
                    path: config_path.to_path_buf(),
                    source: e,
                })?;
            loaded.config = toml::from_str(&content)?;
            loaded.path = Some(config_path.to_path_buf());
            loaded.source = ConfigSource::File;

            tracing::info!(
                path = %config_path.display(),
                models = loaded.config.models.len(),
                "Loaded configuration from file"
            );
        } else {
            tracing::debug!(
                path = %config_path.display(),
                "Config file not found, using defaults"
            );
        }
    }

    if apply_env_overrides(&mut loaded.config, |key| std::env::var(key).ok()) {
        loaded.source = ConfigSource::Env;
    }

    loaded.config.validate()?;
    Ok(loaded)
}

fn parse_flag(value: &str) -> bool {
    value != "0" && !value.eq_ignore_ascii_case("false")
}

fn parse_env<T: std::str::FromStr>(key: &str, value: &str) -> Option<T> {
    let parsed = value.trim().parse::<T>().ok();
    if parsed.is_none() {
        tracing::warn!(key, value, "Ignoring unparseable environment override");
    }
    parsed
}

/// Apply `LLM_GATEWAY_*` overrides read through `lookup`
///
/// Returns whether any override was applied.
pub fn apply_env_overrides(
    config: &mut GatewayConfig,
    lookup: impl Fn(&str) -> Option<String>,
) -> bool {
    let mut applied = false;

    if let Some(model) = lookup("LLM_GATEWAY_DEFAULT_MODEL") {
        config.global.default_model = Some(model);
        applied = true;
    }
    if let Some(value) = lookup("LLM_GATEWAY_TIMEOUT_SECS") {
        if let Some(secs) = parse_env::<u64>("LLM_GATEWAY_TIMEOUT_SECS", &value) {
            config.global.default_timeout_secs = secs;
            applied = true;
        }
    }
    if let Some(value) = lookup("LLM_GATEWAY_TRACK_USAGE") {
        config.global.track_token_usage = parse_flag(&value);
        applied = true;
    }
    if let Some(value) = lookup("LLM_GATEWAY_SMART_ROUTING") {
        config.routing.enable_smart_routing = parse_flag(&value);
        applied = true;
    }
    if let Some(value) = lookup("LLM_GATEWAY_DEFAULT_STRATEGY") {
        match value.parse::<RoutingStrategy>() {
            Ok(strategy) => {
                config.routing.default_strategy = strategy;
                applied = true;
            }
            Err(e) => tracing::warn!(error = %e, "Ignoring LLM_GATEWAY_DEFAULT_STRATEGY"),
        }
    }
    if let Some(value) = lookup("LLM_GATEWAY_FALLBACK") {
        config.fallback.enabled = parse_flag(&value);
        applied = true;
    }
    if let Some(value) = lookup("LLM_GATEWAY_MAX_FALLBACK_ATTEMPTS") {
        if let Some(n) = parse_env::<u32>("LLM_GATEWAY_MAX_FALLBACK_ATTEMPTS", &value) {
            config.fallback.max_fallback_attempts = n;
            applied = true;
        }
    }
    if let Some(value) = lookup("LLM_GATEWAY_RATE_LIMIT") {
        config.rate_limit.enabled = parse_flag(&value);
        applied = true;
    }
    if let Some(value) = lookup("LLM_GATEWAY_RATE_LIMIT_TOKENS") {
        if let Some(n) = parse_env::<u32>("LLM_GATEWAY_RATE_LIMIT_TOKENS", &value) {
            config.rate_limit.token_limit = n;
            applied = true;
        }
    }
    if let Some(value) = lookup("LLM_GATEWAY_RATE_LIMIT_QUEUE") {
        if let Some(n) = parse_env::<u32>("LLM_GATEWAY_RATE_LIMIT_QUEUE", &value) {
            config.rate_limit.queue_limit = n;
            applied = true;
        }
    }
    if let Some(value) = lookup("LLM_GATEWAY_USAGE_RETENTION_DAYS") {
        if let Some(days) = parse_env::<u32>("LLM_GATEWAY_USAGE_RETENTION_DAYS", &value) {
            config.usage.retention_days = days;
            applied = true;
        }
    }

    applied
}

// =============================================================================
// CLI Override Support
// =============================================================================

/// Builder for applying CLI overrides to configuration
///
/// Use this after [`load_config`] to apply command-line argument overrides.
#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    pub default_model: Option<String>,
    pub default_strategy: Option<RoutingStrategy>,
    pub enable_smart_routing: Option<bool>,
    pub enable_fallback: Option<bool>,
    pub max_fallback_attempts: Option<u32>,
    pub rate_limit_enabled: Option<bool>,
}

impl ConfigOverrides {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_default_model(mut self, model: impl Into<String>) -> Self {
        self.default_model = Some(model.into());
        self
    }

    #[must_use]
    pub fn with_default_strategy(mut self, strategy: RoutingStrategy) -> Self {
        self.default_strategy = Some(strategy);
        self
    }

    #[must_use]
    pub fn with_smart_routing(mut self, enabled: bool) -> Self {
        self.enable_smart_routing = Some(enabled);
        self
    }

    #[must_use]
    pub fn with_fallback(mut self, enabled: bool) -> Self {
        self.enable_fallback = Some(enabled);
        self
    }

    #[must_use]
    pub fn with_max_fallback_attempts(mut self, attempts: u32) -> Self {
        self.max_fallback_attempts = Some(attempts);
        self
    }

    #[must_use]
    pub fn with_rate_limit(mut self, enabled: bool) -> Self {
        self.rate_limit_enabled = Some(enabled);
        self
    }

    fn is_empty(&self) -> bool {
        self.default_model.is_none()
            && self.default_strategy.is_none()
            && self.enable_smart_routing.is_none()
            && self.enable_fallback.is_none()
            && self.max_fallback_attempts.is_none()
            && self.rate_limit_enabled.is_none()
    }

    /// Apply overrides and re-validate
    ///
    /// # Errors
    ///
    /// Returns an error if the overridden configuration is invalid.
    pub fn apply(&self, loaded: &mut LoadedConfig) -> Result<(), ConfigError> {
        if self.is_empty() {
            return Ok(());
        }
        loaded.source = ConfigSource::Cli;

        let config = &mut loaded.config;
        if let Some(model) = &self.default_model {
            config.global.default_model = Some(model.clone());
        }
        if let Some(strategy) = self.default_strategy {
            config.routing.default_strategy = strategy;
        }
        if let Some(enabled) = self.enable_smart_routing {
            config.routing.enable_smart_routing = enabled;
        }
        if let Some(enabled) = self.enable_fallback {
            config.fallback.enabled = enabled;
        }
        if let Some(attempts) = self.max_fallback_attempts {
            config.fallback.max_fallback_attempts = attempts;
        }
        if let Some(enabled) = self.rate_limit_enabled {
            config.rate_limit.enabled = enabled;
        }
        config.validate()
    }
}

// =============================================================================
// Shared Snapshot
// =============================================================================

/// Swappable pointer to the current configuration
#[derive(Debug)]
pub struct ConfigHandle {
    current: RwLock<Arc<GatewayConfig>>,
}

impl ConfigHandle {
    pub fn new(config: GatewayConfig) -> Self {
        Self {
            current: RwLock::new(Arc::new(config)),
        }
    }

    /// Snapshot for the duration of one request
    #[must_use]
    pub fn snapshot(&self) -> Arc<GatewayConfig> {
        Arc::clone(&self.current.read())
    }

    /// Validate and atomically install a new configuration
    ///
    /// # Errors
    ///
    /// Returns the validation error and keeps the current snapshot.
    pub fn replace(&self, config: GatewayConfig) -> Result<(), ConfigError> {
        config.validate()?;
        *self.current.write() = Arc::new(config);
        tracing::info!("Configuration snapshot replaced");
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================
