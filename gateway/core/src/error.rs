//! Gateway error taxonomy
//!
//! Every failure the gateway can surface maps onto a stable [`ErrorCode`].
//! The codes double as the vocabulary of fallback rules: a rule lists the
//! codes for which the orchestrator may move on to the next candidate.
//!
//! ```text
//! ProviderError ──(dispatcher: retries exhausted)──> TransientProvider
//!               ──(dispatcher: not retryable)──────> PermanentProvider
//! CircuitBreaker ─────────────────────────────────> CircuitOpen
//! RateLimiter ────────────────────────────────────> RateLimitExceeded
//! RoutingEngine ──────────────────────────────────> NoEligibleModel
//! Orchestrator (chain exhausted) ─────────────────> AllProvidersFailed
//! ```

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

// ============================================================================
// Error Codes
// ============================================================================

/// Stable, serializable identifier for each failure class
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ErrorCode {
    /// Admission denied by the rate limiter
    RateLimitExceededError,
    /// No active model satisfies the request's capabilities
    NoEligibleModelError,
    /// The provider/model pair is temporarily excluded by its circuit breaker
    CircuitOpenError,
    /// Retryable provider failure (timeout, network, 5xx)
    TransientProviderError,
    /// Non-retryable provider failure (auth, malformed request, provider quota)
    PermanentProviderError,
    /// Every attempted candidate failed
    AllProvidersFailedError,
    /// The caller cancelled the request
    CancelledError,
}

impl ErrorCode {
    /// All codes, in declaration order
    pub const ALL: [ErrorCode; 7] = [
        Self::RateLimitExceededError,
        Self::NoEligibleModelError,
        Self::CircuitOpenError,
        Self::TransientProviderError,
        Self::PermanentProviderError,
        Self::AllProvidersFailedError,
        Self::CancelledError,
    ];

    /// Code name as used in configuration files and audit records
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RateLimitExceededError => "RateLimitExceededError",
            Self::NoEligibleModelError => "NoEligibleModelError",
            Self::CircuitOpenError => "CircuitOpenError",
            Self::TransientProviderError => "TransientProviderError",
            Self::PermanentProviderError => "PermanentProviderError",
            Self::AllProvidersFailedError => "AllProvidersFailedError",
            Self::CancelledError => "CancelledError",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ErrorCode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|code| code.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown error code: {s}"))
    }
}

// ============================================================================
// Provider Errors
// ============================================================================

/// Failure classes a provider adapter reports
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderErrorKind {
    /// The call did not complete before its deadline
    Timeout,
    /// Connection could not be established or was reset
    Network,
    /// Upstream returned a 5xx-class response
    Server,
    /// Credentials were rejected
    Authentication,
    /// Upstream rejected the request as malformed
    InvalidRequest,
    /// Upstream quota for this account is exhausted
    QuotaExceeded,
}

impl ProviderErrorKind {
    /// Whether the dispatcher may retry this failure locally
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Timeout | Self::Network | Self::Server)
    }
}

impl fmt::Display for ProviderErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout => write!(f, "timeout"),
            Self::Network => write!(f, "network"),
            Self::Server => write!(f, "server"),
            Self::Authentication => write!(f, "authentication"),
            Self::InvalidRequest => write!(f, "invalid request"),
            Self::QuotaExceeded => write!(f, "quota exceeded"),
        }
    }
}

/// Error returned by a [`ProviderAdapter`](crate::provider::ProviderAdapter)
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("{kind} error from provider: {message}")]
pub struct ProviderError {
    /// Failure class
    pub kind: ProviderErrorKind,
    /// Upstream status code, when the failure came from an HTTP response
    pub status: Option<u16>,
    /// Human-readable detail
    pub message: String,
}

impl ProviderError {
    /// Create an error of the given kind
    pub fn new(kind: ProviderErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            status: None,
            message: message.into(),
        }
    }

    /// Deadline expired before the provider answered
    #[must_use]
    pub fn timeout(after: Duration) -> Self {
        Self::new(
            ProviderErrorKind::Timeout,
            format!("no response within {}ms", after.as_millis()),
        )
    }

    /// Connection-level failure
    pub fn network(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorKind::Network, message)
    }

    /// Credentials rejected
    pub fn authentication(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorKind::Authentication, message)
    }

    /// Malformed request
    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorKind::InvalidRequest, message)
    }

    /// Provider-side quota exhausted
    pub fn quota_exceeded(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorKind::QuotaExceeded, message)
    }

    /// Classify an upstream HTTP status
    ///
    /// 408 and 5xx are transient; 401/403 are authentication failures; 429 is
    /// treated as provider quota exhaustion; everything else is a malformed request.
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let kind = match status {
            408 => ProviderErrorKind::Timeout,
            401 | 403 => ProviderErrorKind::Authentication,
            429 => ProviderErrorKind::QuotaExceeded,
            500..=599 => ProviderErrorKind::Server,
            _ => ProviderErrorKind::InvalidRequest,
        };
        Self {
            kind,
            status: Some(status),
            message: message.into(),
        }
    }

    /// Whether the dispatcher may retry this failure
    #[must_use]
    pub fn is_transient(&self) -> bool {
        self.kind.is_transient()
    }
}

// ============================================================================
// Attempt Failures
// ============================================================================

/// Last error observed for one candidate in a fallback chain
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AttemptFailure {
    /// Candidate model id
    pub model_id: String,
    /// Candidate provider
    pub provider: String,
    /// Failure class
    pub code: ErrorCode,
    /// Rendered error message
    pub message: String,
}

impl fmt::Display for AttemptFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}: {} ({})",
            self.provider, self.model_id, self.code, self.message
        )
    }
}

// ============================================================================
// Gateway Errors
// ============================================================================

/// Terminal errors surfaced to callers of the gateway
#[derive(Clone, Debug, Error)]
pub enum GatewayError {
    /// Admission denied for the caller's key
    #[error("rate limit exceeded for key '{key}', retry after {}ms", .retry_after.as_millis())]
    RateLimitExceeded {
        /// Caller key whose bucket is empty
        key: String,
        /// Time until a token is expected to be available
        retry_after: Duration,
    },

    /// No active model satisfies the request
    #[error("no eligible model for '{requested}': {reason}")]
    NoEligibleModel {
        /// Model identifier as requested
        requested: String,
        /// Why nothing qualified
        reason: String,
    },

    /// Circuit breaker rejected the attempt without contacting the provider
    #[error("circuit open for {provider}/{model}, retry after {}ms", .retry_after.as_millis())]
    CircuitOpen {
        /// Provider name
        provider: String,
        /// Model id
        model: String,
        /// Remaining cooldown
        retry_after: Duration,
    },

    /// Retryable failure that survived every local retry
    #[error("transient failure from {provider}/{model} after {attempts} attempt(s): {source}")]
    TransientProvider {
        /// Provider name
        provider: String,
        /// Model id
        model: String,
        /// Calls made to the provider, including the first
        attempts: u32,
        /// Last adapter error
        source: ProviderError,
    },

    /// Non-retryable failure
    #[error("permanent failure from {provider}/{model}: {source}")]
    PermanentProvider {
        /// Provider name
        provider: String,
        /// Model id
        model: String,
        /// Adapter error
        source: ProviderError,
    },

    /// Fallback chain exhausted
    #[error(
        "all {} attempted candidate(s) failed: [{}]",
        .failures.len(),
        render_failures(.failures)
    )]
    AllProvidersFailed {
        /// Last error per attempted candidate, in attempt order
        failures: Vec<AttemptFailure>,
    },

    /// Caller cancelled the request
    #[error("request cancelled")]
    Cancelled,
}

fn render_failures(failures: &[AttemptFailure]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl GatewayError {
    /// Stable code for this error
    #[must_use]
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::RateLimitExceeded { .. } => ErrorCode::RateLimitExceededError,
            Self::NoEligibleModel { .. } => ErrorCode::NoEligibleModelError,
            Self::CircuitOpen { .. } => ErrorCode::CircuitOpenError,
            Self::TransientProvider { .. } => ErrorCode::TransientProviderError,
            Self::PermanentProvider { .. } => ErrorCode::PermanentProviderError,
            Self::AllProvidersFailed { .. } => ErrorCode::AllProvidersFailedError,
            Self::Cancelled => ErrorCode::CancelledError,
        }
    }

    /// Retry hint for callers, when the failure carries one
    #[must_use]
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimitExceeded { retry_after, .. } | Self::CircuitOpen { retry_after, .. } => {
                Some(*retry_after)
            }
            _ => None,
        }
    }

    /// Build the per-candidate failure entry for the fallback aggregate
    #[must_use]
    pub fn to_attempt_failure(&self, model_id: &str, provider: &str) -> AttemptFailure {
        AttemptFailure {
            model_id: model_id.to_string(),
            provider: provider.to_string(),
            code: self.code(),
            message: self.to_string(),
        }
    }
}
