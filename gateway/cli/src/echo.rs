//! Offline provider adapter
//!
//! Stands in for every configured provider so routing can be exercised
//! without network access. Answers echo the prompt and report token counts
//! from the request's own estimates.

use async_trait::async_trait;
use tokio::time::Instant;

use gateway_core::{
    GatewayRequest, ModelProfile, ProviderAdapter, ProviderError, ProviderKind, ProviderResponse,
    TokenUsage,
};

pub struct EchoAdapter {
    name: String,
    kind: ProviderKind,
    default_completion_tokens: u32,
}

impl EchoAdapter {
    pub fn new(
        name: impl Into<String>,
        kind: ProviderKind,
        default_completion_tokens: u32,
    ) -> Self {
        Self {
            name: name.into(),
            kind,
            default_completion_tokens,
        }
    }
}

#[async_trait]
impl ProviderAdapter for EchoAdapter {
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
        Ok(ProviderResponse::new(
            model.upstream_id(),
            serde_json::json!({ "echo": request.prompt }),
            TokenUsage::new(
                request.estimated_prompt_tokens(),
                request.estimated_completion_tokens(self.default_completion_tokens),
            ),
        ))
    }
}
