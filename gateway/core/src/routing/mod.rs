#![allow(missing_docs)]
//! Routing, Fallback and Resiliency
//!
//! Everything between an admitted request and a provider answer: which
//! models may serve it, in what order, how each call is protected, and what
//! gets recorded about the outcome.
//!
//! # Architecture
//!
//! ```text
//! +------------------+
//! |   QueryRouter    |  <-- Entry point; drives the fallback loop
//! +--------+---------+
//!          |
//!          v
//! +------------------+
//! |  RoutingEngine   |  <-- Ordered candidate list (pin, rule, strategy)
//! +--------+---------+
//!          |
//!          v
//! +--------------------+
//! | ResilientDispatcher|  <-- Retry with backoff, deadline, circuit breaker
//! +--------+-----------+
//!          |
//!    +-----+-----+
//!    |     |     |
//!    v     v     v
//! +------+ +---------+ +------+
//! |OpenAI| |Anthropic| |  ... |  <-- ProviderAdapter implementations
//! +------+ +---------+ +------+
//! ```
//!
//! # Design Principles
//!
//! 1. **Requested model first**: an explicit or preferred model always leads
//!    the candidate list; its fallback rule decides what follows
//! 2. **Isolation**: circuit state is kept per provider and model, so one
//!    failing model does not take its siblings down
//! 3. **Bounded work**: attempts, retries and waits are all capped
//! 4. **Observability**: every attempt feeds the metrics registry and every
//!    request leaves a routing decision

pub mod config;
pub mod dispatcher;
pub mod fallback;
pub mod health;
pub mod metrics;
pub mod policy;
pub mod router;
pub mod strategy;

#[cfg(test)]
pub mod test_utils;

pub use config::*;
pub use dispatcher::{DispatchFailure, DispatchPolicy, Dispatched, ResilientDispatcher};
pub use fallback::*;
pub use health::*;
pub use metrics::{MetricsConfig, MetricsRegistry, MetricsSnapshot, ModelStats};
pub use policy::{Candidate, CandidateList, RoutingContext, RoutingDecision, RoutingEngine};
pub use router::*;
pub use strategy::{ExperimentSampler, FixedSampler, RandomSampler};
