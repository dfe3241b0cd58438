//! Test helpers for routing unit tests
//!
//! [`ScriptedProvider`] is a provider adapter whose behavior is set per
//! model, and the fixture functions build the small catalog most routing
//! tests share.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::Instant;

use super::config::{Capabilities, ModelMapping, ModelProfile, RetryConfig};
use super::fallback::{FallbackConfig, FallbackRule};
use crate::config::GatewayConfig;
use crate::error::{ErrorCode, ProviderError};
use crate::provider::{ProviderAdapter, ProviderKind, ProviderRegistry, ProviderResponse};
use crate::request::{GatewayRequest, TokenUsage};

/// What a scripted call does
#[derive(Clone, Debug)]
pub enum Step {
    /// Answer successfully
    Succeed,
    /// Fail with the given error
    Fail(ProviderError),
    /// Never answer; the caller's deadline decides
    Hang,
}

/// Provider adapter driven by per-model scripts
#[derive(Debug)]
pub struct ScriptedProvider {
    name: String,
    kind: ProviderKind,
    queued: Mutex<HashMap<String, VecDeque<Step>>>,
    standing: Mutex<HashMap<String, Step>>,
    latency: Mutex<HashMap<String, Duration>>,
    calls: Mutex<Vec<String>>,
}

impl ScriptedProvider {
    pub fn new(name: impl Into<String>, kind: ProviderKind) -> Self {
        Self {
            name: name.into(),
            kind,
            queued: Mutex::new(HashMap::new()),
            standing: Mutex::new(HashMap::new()),
            latency: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Queue `times` occurrences of `step` for `model`, ahead of its standing behavior
    pub fn script(&self, model: &str, step: Step, times: usize) -> &Self {
        self.queued
            .lock()
            .entry(model.to_string())
            .or_default()
            .extend(std::iter::repeat(step).take(times));
        self
    }

    /// Behavior for `model` once its queue is empty
    pub fn always(&self, model: &str, step: Step) -> &Self {
        self.standing.lock().insert(model.to_string(), step);
        self
    }

    /// Delay every answer for `model`
    pub fn delay(&self, model: &str, latency: Duration) -> &Self {
        self.latency.lock().insert(model.to_string(), latency);
        self
    }

    /// Calls made for `model`
    pub fn request_count(&self, model: &str) -> usize {
        self.calls.lock().iter().filter(|m| *m == model).count()
    }

    pub fn total_requests(&self) -> usize {
        self.calls.lock().len()
    }

    /// Model ids in call order
    pub fn call_order(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    fn next_step(&self, model: &str) -> Step {
        if let Some(step) = self.queued.lock().get_mut(model).and_then(VecDeque::pop_front) {
            return step;
        }
        self.standing
            .lock()
            .get(model)
            .cloned()
            .unwrap_or(Step::Succeed)
    }
}

#[async_trait]
impl ProviderAdapter for ScriptedProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> ProviderKind {
        self.kind
    }

    async fn send(
        &self,
        model: &ModelProfile,
        request: &GatewayRequest,
        _deadline: Instant,
    ) -> Result<ProviderResponse, ProviderError> {
        self.calls.lock().push(model.model_id.clone());
        let step = self.next_step(&model.model_id);
        let latency = self.latency.lock().get(&model.model_id).copied();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        match step {
            Step::Succeed => Ok(ProviderResponse::new(
                model.upstream_id(),
                serde_json::json!({ "text": format!("answer from {}", model.model_id) }),
                TokenUsage::new(
                    request.estimated_prompt_tokens(),
                    u64::from(request.max_tokens.unwrap_or(16)),
                ),
            )),
            Step::Fail(error) => Err(error),
            Step::Hang => std::future::pending().await,
        }
    }
}

/// Standard catalog: three OpenAI chat models, one Anthropic model and an embedding model
///
/// `gpt-4` falls back to `gpt-4-fallback` then `gpt-3.5-turbo` on permanent
/// failures; `gpt4` is an alias of `gpt-4`. Retries run without jitter.
pub fn fixture_config() -> GatewayConfig {
    let mut config = GatewayConfig {
        models: vec![
            ModelProfile::new("gpt-4", "openai")
                .with_costs(0.03, 0.06)
                .with_context_window(8192),
            ModelProfile::new("gpt-4-fallback", "openai")
                .with_costs(0.02, 0.04)
                .with_context_window(8192),
            ModelProfile::new("gpt-3.5-turbo", "openai")
                .with_costs(0.0015, 0.002)
                .with_context_window(4096),
            ModelProfile::new("claude-3", "anthropic")
                .with_costs(0.015, 0.075)
                .with_context_window(200_000),
            ModelProfile::new("embed-small", "openai")
                .with_capabilities(Capabilities::embeddings())
                .with_costs(0.0001, 0.0),
        ],
        fallback: FallbackConfig::default().with_rule(
            FallbackRule::new(
                "gpt-4",
                vec!["gpt-4-fallback".into(), "gpt-3.5-turbo".into()],
            )
            .on([ErrorCode::PermanentProviderError]),
        ),
        retry: RetryConfig {
            max_retries: 2,
            initial_backoff_ms: 10,
            max_backoff_ms: 100,
            use_jitter: false,
            ..RetryConfig::default()
        },
        ..GatewayConfig::default()
    };
    config.routing.model_mappings.push(ModelMapping {
        model_id: "gpt4".into(),
        target_model_id: "gpt-4".into(),
    });
    config.routing.quality_scores = [("gpt-4", 0.95), ("claude-3", 0.9), ("gpt-3.5-turbo", 0.7)]
        .into_iter()
        .map(|(id, score)| (id.to_string(), score))
        .collect();
    config
}

/// Scripted adapters for the fixture's two providers
pub fn fixture_providers() -> (Arc<ScriptedProvider>, Arc<ScriptedProvider>) {
    (
        Arc::new(ScriptedProvider::new("openai", ProviderKind::OpenAi)),
        Arc::new(ScriptedProvider::new("anthropic", ProviderKind::Anthropic)),
    )
}

/// Registry over freshly created fixture providers
pub fn fixture_registry() -> ProviderRegistry {
    let (openai, anthropic) = fixture_providers();
    registry_of(&openai, &anthropic)
}

pub fn registry_of(
    openai: &Arc<ScriptedProvider>,
    anthropic: &Arc<ScriptedProvider>,
) -> ProviderRegistry {
    ProviderRegistry::builder()
        .register(Arc::clone(openai) as Arc<dyn ProviderAdapter>)
        .register(Arc::clone(anthropic) as Arc<dyn ProviderAdapter>)
        .build()
}
