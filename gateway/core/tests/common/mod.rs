//! Shared harness for gateway integration tests
//!
//! [`MockProvider`] answers per model from a script, optionally failing at
//! random with a seeded generator so chaos runs are reproducible.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::time::Instant;

use gateway_core::{
    GatewayConfig, GatewayRequest, ModelProfile, ProviderAdapter, ProviderError, ProviderKind,
    ProviderResponse, QueryRouter, TokenUsage,
};

/// Catalog shared by the integration suites
///
/// `gpt-4` falls back to `gpt-4-fallback` then `gpt-3.5-turbo` on permanent
/// or circuit-open failures. `solo` is the only model of its provider.
pub const CATALOG: &str = r#"
[global]
default_timeout_secs = 30

[retry]
max_retries = 2
initial_backoff_ms = 10
max_backoff_ms = 100
use_jitter = false

[rate_limit]
token_limit = 1000
tokens_per_period = 1000

[[providers]]
name = "openai"
kind = "open_ai"

[[providers]]
name = "anthropic"
kind = "anthropic"

[[providers]]
name = "local"
kind = "custom"

[[models]]
model_id = "gpt-4"
provider = "openai"
prompt_cost_per_1k = 0.03
completion_cost_per_1k = 0.06
context_window = 8192

[[models]]
model_id = "gpt-4-fallback"
provider = "openai"
prompt_cost_per_1k = 0.02
completion_cost_per_1k = 0.04
context_window = 8192

[[models]]
model_id = "gpt-3.5-turbo"
provider = "openai"
prompt_cost_per_1k = 0.0015
completion_cost_per_1k = 0.002
context_window = 4096

[[models]]
model_id = "claude-3"
provider = "anthropic"
prompt_cost_per_1k = 0.015
completion_cost_per_1k = 0.075
context_window = 200000

[[fallback.rules]]
model_id = "gpt-4"
fallback_models = ["gpt-4-fallback", "gpt-3.5-turbo"]
error_codes = ["PermanentProviderError", "CircuitOpenError"]
"#;

pub fn catalog() -> GatewayConfig {
    GatewayConfig::from_toml(CATALOG).expect("catalog parses")
}

/// Catalog reduced to a single model on its own provider
pub fn solo_catalog() -> GatewayConfig {
    let mut config = catalog();
    config.fallback.rules.0.clear();
    config.models = vec![ModelProfile::new("solo", "local")];
    config
}

#[derive(Clone, Debug)]
pub enum Behavior {
    Succeed,
    Fail(ProviderError),
    Hang,
}

/// Scripted provider adapter
#[derive(Debug)]
pub struct MockProvider {
    name: String,
    kind: ProviderKind,
    queued: Mutex<HashMap<String, VecDeque<Behavior>>>,
    standing: Mutex<HashMap<String, Behavior>>,
    latency: Mutex<HashMap<String, Duration>>,
    chaos: Mutex<Option<(StdRng, f64)>>,
    calls: Mutex<Vec<String>>,
}

impl MockProvider {
    pub fn new(name: &str, kind: ProviderKind) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            kind,
            queued: Mutex::new(HashMap::new()),
            standing: Mutex::new(HashMap::new()),
            latency: Mutex::new(HashMap::new()),
            chaos: Mutex::new(None),
            calls: Mutex::new(Vec::new()),
        })
    }

    pub fn then(&self, model: &str, behavior: Behavior, times: usize) {
        self.queued
            .lock()
            .entry(model.to_string())
            .or_default()
            .extend(std::iter::repeat(behavior).take(times));
    }

    pub fn always(&self, model: &str, behavior: Behavior) {
        self.standing.lock().insert(model.to_string(), behavior);
    }

    pub fn with_latency(&self, model: &str, latency: Duration) {
        self.latency.lock().insert(model.to_string(), latency);
    }

    /// Fail unscripted calls with probability `rate`, reproducibly per `seed`
    pub fn chaos(&self, seed: u64, rate: f64) {
        *self.chaos.lock() = Some((StdRng::seed_from_u64(seed), rate));
    }

    pub fn calls(&self, model: &str) -> usize {
        self.calls.lock().iter().filter(|m| *m == model).count()
    }

    pub fn total_calls(&self) -> usize {
        self.calls.lock().len()
    }

    pub fn call_order(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    fn next(&self, model: &str) -> Behavior {
        if let Some(b) = self.queued.lock().get_mut(model).and_then(VecDeque::pop_front) {
            return b;
        }
        if let Some(b) = self.standing.lock().get(model) {
            return b.clone();
        }
        if let Some((rng, rate)) = self.chaos.lock().as_mut() {
            if rng.gen_bool(*rate) {
                return match rng.gen_range(0..3) {
                    0 => Behavior::Fail(ProviderError::from_status(503, "overloaded")),
                    1 => Behavior::Fail(ProviderError::network("connection reset")),
                    _ => Behavior::Fail(ProviderError::invalid_request("rejected")),
                };
            }
        }
        Behavior::Succeed
    }
}

#[async_trait]
impl ProviderAdapter for MockProvider {
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
        let behavior = self.next(&model.model_id);
        let latency = self.latency.lock().get(&model.model_id).copied();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        match behavior {
            Behavior::Succeed => Ok(ProviderResponse::new(
                model.upstream_id(),
                serde_json::json!({ "text": "ok" }),
                TokenUsage::new(
                    request.estimated_prompt_tokens(),
                    u64::from(request.max_tokens.unwrap_or(20)),
                ),
            )),
            Behavior::Fail(error) => Err(error),
            Behavior::Hang => std::future::pending().await,
        }
    }
}

/// Adapters for every provider the catalog declares
pub struct Providers {
    pub openai: Arc<MockProvider>,
    pub anthropic: Arc<MockProvider>,
    pub local: Arc<MockProvider>,
}

impl Providers {
    pub fn new() -> Self {
        Self {
            openai: MockProvider::new("openai", ProviderKind::OpenAi),
            anthropic: MockProvider::new("anthropic", ProviderKind::Anthropic),
            local: MockProvider::new("local", ProviderKind::Custom),
        }
    }

    pub fn router(&self, config: GatewayConfig) -> QueryRouter {
        QueryRouter::builder(config)
            .provider(Arc::clone(&self.openai) as Arc<dyn ProviderAdapter>)
            .provider(Arc::clone(&self.anthropic) as Arc<dyn ProviderAdapter>)
            .provider(Arc::clone(&self.local) as Arc<dyn ProviderAdapter>)
            .build()
            .expect("router builds")
    }
}

pub fn permanent() -> Behavior {
    Behavior::Fail(ProviderError::authentication("key revoked"))
}

pub fn transient() -> Behavior {
    Behavior::Fail(ProviderError::from_status(503, "unavailable"))
}
