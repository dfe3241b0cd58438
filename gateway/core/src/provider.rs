//! Provider Adapter Contract
//!
//! The core never speaks to an upstream API directly. Surrounding code
//! supplies one [`ProviderAdapter`] per configured provider, and the
//! [`ProviderRegistry`] resolves provider names to adapters once at startup.
//!
//! # Design Philosophy
//!
//! - The set of provider kinds is closed ([`ProviderKind`]); configuration
//!   selects which of them are enabled.
//! - The registry is built once and never mutated; routing only asks whether
//!   a provider is registered, the dispatcher only looks adapters up by name.
//! - Adapters classify their own failures through [`ProviderError`] so the
//!   dispatcher can tell retryable from non-retryable errors.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::error::ProviderError;
use crate::request::{GatewayRequest, TokenUsage};
use crate::routing::config::ModelProfile;

// ============================================================================
// Provider Kinds
// ============================================================================

/// Upstream provider families the gateway knows how to host
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    /// OpenAI API
    OpenAi,
    /// Anthropic API
    Anthropic,
    /// Cohere API
    Cohere,
    /// Hugging Face inference endpoints
    HuggingFace,
    /// Any other adapter supplied by the host application
    Custom,
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OpenAi => write!(f, "openai"),
            Self::Anthropic => write!(f, "anthropic"),
            Self::Cohere => write!(f, "cohere"),
            Self::HuggingFace => write!(f, "huggingface"),
            Self::Custom => write!(f, "custom"),
        }
    }
}

/// Declared provider in configuration
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Provider name referenced by model profiles
    pub name: String,

    /// Provider family
    pub kind: ProviderKind,

    /// Whether models of this provider may be routed to
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

// ============================================================================
// Adapter Contract
// ============================================================================

/// Successful provider response
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProviderResponse {
    /// Upstream model that produced the response
    pub model: String,

    /// Response body, as returned by the adapter
    pub content: serde_json::Value,

    /// Token accounting reported by the provider
    pub usage: TokenUsage,
}

impl ProviderResponse {
    pub fn new(model: impl Into<String>, content: serde_json::Value, usage: TokenUsage) -> Self {
        Self {
            model: model.into(),
            content,
            usage,
        }
    }
}

/// Uniform capability over a heterogeneous upstream API
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    /// Provider name, matching [`ModelProfile::provider`]
    fn name(&self) -> &str;

    /// Provider family
    fn kind(&self) -> ProviderKind;

    /// Call the provider for `model`
    ///
    /// Implementations should stop work once `deadline` passes; the dispatcher
    /// also enforces it and treats expiry as a transient failure.
    async fn send(
        &self,
        model: &ModelProfile,
        request: &GatewayRequest,
        deadline: Instant,
    ) -> Result<ProviderResponse, ProviderError>;
}

// ============================================================================
// Registry
// ============================================================================

/// Immutable name → adapter table, resolved at startup
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    adapters: HashMap<String, Arc<dyn ProviderAdapter>>,
}

impl ProviderRegistry {
    /// Start building a registry
    #[must_use]
    pub fn builder() -> ProviderRegistryBuilder {
        ProviderRegistryBuilder::default()
    }

    /// Build the registry from declared providers and the adapters on offer
    ///
    /// Only enabled providers are registered. Adapters whose name is not
    /// declared, or whose kind disagrees with the declaration, are skipped.
    pub fn from_config(
        declared: &[ProviderConfig],
        adapters: impl IntoIterator<Item = Arc<dyn ProviderAdapter>>,
    ) -> Self {
        let mut builder = Self::builder();
        for adapter in adapters {
            match declared.iter().find(|p| p.name == adapter.name()) {
                Some(provider) if !provider.enabled => {
                    tracing::info!(provider = %provider.name, "Provider disabled in configuration");
                }
                Some(provider) if provider.kind != adapter.kind() => {
                    tracing::warn!(
                        provider = %provider.name,
                        declared = %provider.kind,
                        adapter = %adapter.kind(),
                        "Adapter kind does not match declaration, skipping"
                    );
                }
                Some(_) => builder = builder.register(adapter),
                None => {
                    tracing::warn!(
                        provider = %adapter.name(),
                        "Adapter has no provider declaration, skipping"
                    );
                }
            }
        }

        let registry = builder.build();
        for provider in declared.iter().filter(|p| p.enabled) {
            if !registry.contains(&provider.name) {
                tracing::warn!(provider = %provider.name, "Declared provider has no adapter");
            }
        }
        registry
    }

    /// Adapter for a provider name
    #[must_use]
    pub fn get(&self, provider: &str) -> Option<&Arc<dyn ProviderAdapter>> {
        self.adapters.get(provider)
    }

    /// Whether the provider has an adapter
    #[must_use]
    pub fn contains(&self, provider: &str) -> bool {
        self.adapters.contains_key(provider)
    }

    /// Registered provider names, sorted
    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.adapters.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.adapters.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }
}

impl fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("providers", &self.names())
            .finish()
    }
}

/// Builder for [`ProviderRegistry`]
#[derive(Default)]
pub struct ProviderRegistryBuilder {
    adapters: HashMap<String, Arc<dyn ProviderAdapter>>,
}

impl ProviderRegistryBuilder {
    /// Register an adapter under its own name; a later registration replaces an earlier one
    #[must_use]
    pub fn register(mut self, adapter: Arc<dyn ProviderAdapter>) -> Self {
        let name = adapter.name().to_string();
        if self.adapters.insert(name.clone(), adapter).is_some() {
            tracing::warn!(provider = %name, "Provider adapter registered twice, keeping the last");
        }
        self
    }

    #[must_use]
    pub fn build(self) -> ProviderRegistry {
        ProviderRegistry {
            adapters: self.adapters,
        }
    }
}
