//! Gateway Core - Routing, Fallback and Resiliency for an LLM Gateway
//!
//! This crate decides which upstream model serves each inference request and
//! keeps that decision honest under failure. It is transport-agnostic:
//! provider adapters and the outer HTTP surface live elsewhere and plug in
//! through [`provider::ProviderAdapter`].
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                     Inbound request                              │
//! └──────────────────────────────┬───────────────────────────────────┘
//!                                │
//! ┌──────────────────────────────┼───────────────────────────────────┐
//! │                         GATEWAY CORE                             │
//! │  ┌───────────────────────────┴──────────────────────────────┐    │
//! │  │                      QueryRouter                         │    │
//! │  │  ┌────────────┐  ┌────────────┐  ┌────────────────────┐  │    │
//! │  │  │   Rate     │  │  Routing   │  │     Resilient      │  │    │
//! │  │  │  Limiter   │─▶│  Engine    │─▶│    Dispatcher      │  │    │
//! │  │  └────────────┘  └────────────┘  └─────────┬──────────┘  │    │
//! │  │                                             │             │    │
//! │  │  ┌────────────┐  ┌────────────┐  ┌─────────┴──────────┐  │    │
//! │  │  │   Usage    │  │  Metrics   │  │  Circuit Breakers  │  │    │
//! │  │  │   Ledger   │  │  Registry  │  │ (provider + model) │  │    │
//! │  │  └────────────┘  └────────────┘  └────────────────────┘  │    │
//! │  └──────────────────────────────────────────────────────────┘    │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Key Types
//!
//! - [`QueryRouter`]: executes a request end to end with fallback
//! - [`RoutingEngine`]: produces the ordered candidate list
//! - [`ResilientDispatcher`]: retries and circuit-breaks a single candidate
//! - [`RateLimiter`]: per-caller token buckets
//! - [`UsageLedger`]: token and cost accounting
//! - [`MetricsRegistry`]: rolling per-model and per-provider health
//!
//! # Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use gateway_core::{config::load_config, GatewayRequest, QueryRouter};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let loaded = load_config()?;
//!     let router = QueryRouter::builder(loaded.config)
//!         .provider(Arc::new(MyOpenAiAdapter::new()))
//!         .build()?;
//!
//!     let served = router
//!         .execute(GatewayRequest::completion("Hello").with_model("gpt-4"))
//!         .await?;
//!     println!("{} answered", served.model.model_id);
//!     Ok(())
//! }
//! ```

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod error;
pub mod provider;
pub mod rate_limit;
pub mod request;
pub mod routing;
pub mod store;
pub mod usage;

pub use config::{ConfigError, ConfigHandle, GatewayConfig, GlobalConfig};
pub use error::{ErrorCode, GatewayError, ProviderError, ProviderErrorKind};
pub use provider::{ProviderAdapter, ProviderKind, ProviderRegistry, ProviderResponse};
pub use rate_limit::{RateLimitConfig, RateLimitError, RateLimiter};
pub use request::{GatewayRequest, RequestKind, TokenUsage};
pub use routing::{
    CircuitBreakerConfig, CircuitBreakerRegistry, FallbackConfig, FallbackRule, GatewayResponse,
    MetricsRegistry, ModelProfile, QueryRouter, ResilientDispatcher, RetryConfig, RoutingConfig,
    RoutingDecision, RoutingEngine, RoutingStrategy,
};
pub use store::{AppendStore, StoreBackend, StoreError, TimeRange};
pub use usage::{TokenUsageRecord, UsageLedger, UsageSummary};
