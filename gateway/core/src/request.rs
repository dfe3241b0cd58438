//! Gateway request and usage types
//!
//! [`GatewayRequest`] is what callers hand to the orchestrator. The payload
//! is opaque to the core: provider adapters translate it, the core only looks
//! at routing signals (model, capabilities, size, caller identity).

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::routing::config::{Capabilities, RoutingStrategy};

/// Identifier for requests that name no model or name the literal `auto`
pub const AUTO_MODEL: &str = "auto";

/// Caller key used when a request carries neither API key nor user
pub const ANONYMOUS_CALLER: &str = "anonymous";

/// Kind of inference request
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestKind {
    /// Text completion / chat
    #[default]
    Completion,
    /// Embedding vectors
    Embedding,
}

impl RequestKind {
    /// Request type as recorded in usage records
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Completion => "completion",
            Self::Embedding => "embedding",
        }
    }
}

/// Inference request entering the gateway
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GatewayRequest {
    /// Unique request id
    pub request_id: String,

    /// Kind of request
    pub kind: RequestKind,

    /// Requested model id or alias (`None` or `auto` lets the router pick)
    pub model: Option<String>,

    /// Prompt text (or concatenated embedding inputs), used for sizing
    pub prompt: String,

    /// Provider-bound body, passed through untouched
    pub payload: serde_json::Value,

    /// Upper bound on completion tokens
    pub max_tokens: Option<u32>,

    /// Prompt token count if the caller already measured it
    pub prompt_tokens: Option<u32>,

    /// Streaming response requested
    pub stream: bool,

    /// Function/tool calling required
    pub function_calling: bool,

    /// Image inputs present
    pub vision: bool,

    /// Explicit strategy override
    pub strategy: Option<RoutingStrategy>,

    /// Owning user
    pub user_id: Option<String>,

    /// API key the request was authenticated with
    pub api_key_id: Option<String>,

    /// Per-attempt timeout override
    pub timeout: Option<Duration>,
}

impl GatewayRequest {
    /// Create a request of the given kind with a fresh request id
    pub fn new(kind: RequestKind, prompt: impl Into<String>) -> Self {
        Self {
            request_id: uuid::Uuid::new_v4().to_string(),
            kind,
            model: None,
            prompt: prompt.into(),
            payload: serde_json::Value::Null,
            max_tokens: None,
            prompt_tokens: None,
            stream: false,
            function_calling: false,
            vision: false,
            strategy: None,
            user_id: None,
            api_key_id: None,
            timeout: None,
        }
    }

    /// Completion request
    pub fn completion(prompt: impl Into<String>) -> Self {
        Self::new(RequestKind::Completion, prompt)
    }

    /// Embedding request
    pub fn embedding(input: impl Into<String>) -> Self {
        Self::new(RequestKind::Embedding, input)
    }

    /// Pin or alias a model
    #[must_use]
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    /// Override the routing strategy
    #[must_use]
    pub fn with_strategy(mut self, strategy: RoutingStrategy) -> Self {
        self.strategy = Some(strategy);
        self
    }

    /// Set the owning user
    #[must_use]
    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    /// Set the API key id
    #[must_use]
    pub fn with_api_key(mut self, api_key_id: impl Into<String>) -> Self {
        self.api_key_id = Some(api_key_id.into());
        self
    }

    /// Bound the completion length
    #[must_use]
    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    /// Supply a measured prompt token count
    #[must_use]
    pub fn with_prompt_tokens(mut self, tokens: u32) -> Self {
        self.prompt_tokens = Some(tokens);
        self
    }

    /// Attach the provider-bound body
    #[must_use]
    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    /// Override the per-attempt timeout
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Request a streaming response
    #[must_use]
    pub fn streaming(mut self) -> Self {
        self.stream = true;
        self
    }

    /// Require function calling
    #[must_use]
    pub fn with_function_calling(mut self) -> Self {
        self.function_calling = true;
        self
    }

    /// Mark the request as carrying images
    #[must_use]
    pub fn with_vision(mut self) -> Self {
        self.vision = true;
        self
    }

    /// Model as requested, with `auto` and blanks normalized to `None`
    #[must_use]
    pub fn pinned_model(&self) -> Option<&str> {
        self.model
            .as_deref()
            .map(str::trim)
            .filter(|m| !m.is_empty() && !m.eq_ignore_ascii_case(AUTO_MODEL))
    }

    /// Capabilities a model must have to serve this request
    #[must_use]
    pub fn required_capabilities(&self) -> Capabilities {
        Capabilities {
            completions: self.kind == RequestKind::Completion,
            embeddings: self.kind == RequestKind::Embedding,
            streaming: self.stream,
            function_calling: self.function_calling,
            vision: self.vision,
        }
    }

    /// Prompt size in tokens: the measured count, else roughly four characters per token
    #[must_use]
    pub fn estimated_prompt_tokens(&self) -> u64 {
        match self.prompt_tokens {
            Some(tokens) => u64::from(tokens),
            None => (self.prompt.chars().count() as u64).div_ceil(4),
        }
    }

    /// Completion size in tokens: the request bound, else the configured default
    #[must_use]
    pub fn estimated_completion_tokens(&self, default_tokens: u32) -> u64 {
        if self.kind == RequestKind::Embedding {
            return 0;
        }
        u64::from(self.max_tokens.unwrap_or(default_tokens))
    }

    /// Rate-limit partition key: API key, else user, else anonymous
    #[must_use]
    pub fn caller_key(&self) -> &str {
        self.api_key_id
            .as_deref()
            .or(self.user_id.as_deref())
            .unwrap_or(ANONYMOUS_CALLER)
    }
}

/// Token counts reported by a provider
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

impl TokenUsage {
    /// Build usage with a derived total
    #[must_use]
    pub fn new(prompt_tokens: u64, completion_tokens: u64) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
        }
    }

    /// Whether any tokens were consumed
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.total_tokens == 0
    }
}
