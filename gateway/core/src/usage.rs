//! Usage Ledger
//!
//! Append-only record of token consumption, one [`TokenUsageRecord`] per
//! successfully dispatched request, with aggregate queries over time ranges.
//!
//! Records go to an [`AppendStore`]; the default in-memory store swaps in a
//! filtered copy on purge, so a query running during retention cleanup sees
//! either the pre- or post-purge set.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};

use crate::request::{GatewayRequest, TokenUsage, ANONYMOUS_CALLER};
use crate::routing::config::ModelProfile;
use crate::store::{AppendStore, StoreBackend, StoreError, TimeRange, Timestamped};

/// API-key id recorded when a request carries none
pub const UNKNOWN_API_KEY: &str = "unknown";

// ============================================================================
// Configuration
// ============================================================================

/// Retention and storage of usage records
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UsageConfig {
    /// Records older than this are purged
    pub retention_days: u32,

    /// How often the maintenance task purges
    pub cleanup_interval_secs: u64,

    pub store: StoreBackend,
}

impl Default for UsageConfig {
    fn default() -> Self {
        Self {
            retention_days: 90,
            cleanup_interval_secs: 3600,
            store: StoreBackend::Memory,
        }
    }
}

impl UsageConfig {
    #[must_use]
    pub fn retention(&self) -> ChronoDuration {
        ChronoDuration::days(i64::from(self.retention_days))
    }

    #[must_use]
    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs.max(1))
    }
}

// ============================================================================
// Records
// ============================================================================

/// Tokens consumed by one successful request
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TokenUsageRecord {
    pub request_id: String,
    pub user_id: String,
    pub api_key_id: String,
    pub model_id: String,
    pub provider: String,

    /// `completion` or `embedding`
    pub request_type: String,

    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
    pub estimated_cost_usd: f64,
    pub timestamp: DateTime<Utc>,
}

impl TokenUsageRecord {
    /// Build a record for `request` served by `model`
    #[must_use]
    pub fn from_completion(
        request: &GatewayRequest,
        model: &ModelProfile,
        usage: &TokenUsage,
    ) -> Self {
        Self {
            request_id: request.request_id.clone(),
            user_id: request
                .user_id
                .clone()
                .unwrap_or_else(|| ANONYMOUS_CALLER.to_string()),
            api_key_id: request
                .api_key_id
                .clone()
                .unwrap_or_else(|| UNKNOWN_API_KEY.to_string()),
            model_id: model.model_id.clone(),
            provider: model.provider.clone(),
            request_type: request.kind.as_str().to_string(),
            prompt_tokens: usage.prompt_tokens,
            completion_tokens: usage.completion_tokens,
            total_tokens: usage.prompt_tokens + usage.completion_tokens,
            estimated_cost_usd: model.estimate_cost(usage.prompt_tokens, usage.completion_tokens),
            timestamp: Utc::now(),
        }
    }

    #[must_use]
    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }
}

impl Timestamped for TokenUsageRecord {
    fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
}

// ============================================================================
// Aggregates
// ============================================================================

/// Summed usage over a set of records
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct UsageTotals {
    pub requests: u64,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
    pub cost_usd: f64,
}

impl UsageTotals {
    pub fn add(&mut self, record: &TokenUsageRecord) {
        self.requests += 1;
        self.prompt_tokens += record.prompt_tokens;
        self.completion_tokens += record.completion_tokens;
        self.total_tokens += record.total_tokens;
        self.cost_usd += record.estimated_cost_usd;
    }

    pub fn merge(&mut self, other: &UsageTotals) {
        self.requests += other.requests;
        self.prompt_tokens += other.prompt_tokens;
        self.completion_tokens += other.completion_tokens;
        self.total_tokens += other.total_tokens;
        self.cost_usd += other.cost_usd;
    }

    fn of<'a>(records: impl IntoIterator<Item = &'a TokenUsageRecord>) -> Self {
        let mut totals = Self::default();
        for record in records {
            totals.add(record);
        }
        totals
    }
}

/// Per-model line of a summary
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ModelUsage {
    pub model_id: String,
    pub provider: String,
    pub totals: UsageTotals,
}

/// Totals plus per-model, per-provider and per-user breakdowns
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct UsageSummary {
    pub range: TimeRange,
    pub totals: UsageTotals,
    pub by_model: Vec<ModelUsage>,
    pub by_provider: BTreeMap<String, UsageTotals>,
    pub by_user: BTreeMap<String, UsageTotals>,
}

impl UsageSummary {
    fn from_records(range: TimeRange, records: &[TokenUsageRecord]) -> Self {
        let mut by_model: BTreeMap<(String, String), UsageTotals> = BTreeMap::new();
        let mut by_provider: BTreeMap<String, UsageTotals> = BTreeMap::new();
        let mut by_user: BTreeMap<String, UsageTotals> = BTreeMap::new();

        for record in records {
            by_model
                .entry((record.model_id.clone(), record.provider.clone()))
                .or_default()
                .add(record);
            by_provider
                .entry(record.provider.clone())
                .or_default()
                .add(record);
            by_user.entry(record.user_id.clone()).or_default().add(record);
        }

        Self {
            range,
            totals: UsageTotals::of(records),
            by_model: by_model
                .into_iter()
                .map(|((model_id, provider), totals)| ModelUsage {
                    model_id,
                    provider,
                    totals,
                })
                .collect(),
            by_provider,
            by_user,
        }
    }
}

// ============================================================================
// Ledger
// ============================================================================

/// Usage recording and reporting
pub struct UsageLedger {
    config: UsageConfig,
    store: Arc<dyn AppendStore<TokenUsageRecord>>,
}

impl UsageLedger {
    /// Ledger over the store selected in `config`
    #[must_use]
    pub fn new(config: UsageConfig) -> Self {
        let store = config.store.build();
        Self { config, store }
    }

    /// Ledger over a caller-supplied store
    pub fn with_store(config: UsageConfig, store: Arc<dyn AppendStore<TokenUsageRecord>>) -> Self {
        Self { config, store }
    }

    #[must_use]
    pub fn config(&self) -> &UsageConfig {
        &self.config
    }

    /// Append one record
    ///
    /// # Errors
    ///
    /// Returns the store's error; callers on the request path log it and move on.
    pub async fn record(&self, record: TokenUsageRecord) -> Result<(), StoreError> {
        self.store.append(record).await
    }

    /// Record the usage of a completed request
    ///
    /// A store failure is logged and swallowed: the caller already has its
    /// response. Requests that consumed no tokens produce no record.
    pub async fn track_completion(
        &self,
        request: &GatewayRequest,
        model: &ModelProfile,
        usage: &TokenUsage,
    ) -> Option<TokenUsageRecord> {
        if usage.prompt_tokens + usage.completion_tokens == 0 {
            return None;
        }
        let record = TokenUsageRecord::from_completion(request, model, usage);
        match self.store.append(record.clone()).await {
            Ok(()) => Some(record),
            Err(e) => {
                tracing::warn!(
                    request_id = %request.request_id,
                    model = %model.model_id,
                    error = %e,
                    "Failed to record token usage"
                );
                None
            }
        }
    }

    /// Raw records inside `range`
    ///
    /// # Errors
    ///
    /// Returns the store's error.
    pub async fn records(&self, range: TimeRange) -> Result<Vec<TokenUsageRecord>, StoreError> {
        self.store.range(range).await
    }

    async fn totals_where(
        &self,
        range: TimeRange,
        keep: impl Fn(&TokenUsageRecord) -> bool,
    ) -> Result<UsageTotals, StoreError> {
        let records = self.store.range(range).await?;
        Ok(UsageTotals::of(records.iter().filter(|r| keep(r))))
    }

    /// Usage of one user
    ///
    /// # Errors
    ///
    /// Returns the store's error.
    pub async fn by_user(
        &self,
        user_id: &str,
        range: TimeRange,
    ) -> Result<UsageTotals, StoreError> {
        self.totals_where(range, |r| r.user_id == user_id).await
    }

    /// Usage through one API key
    ///
    /// # Errors
    ///
    /// Returns the store's error.
    pub async fn by_api_key(
        &self,
        api_key_id: &str,
        range: TimeRange,
    ) -> Result<UsageTotals, StoreError> {
        self.totals_where(range, |r| r.api_key_id == api_key_id).await
    }

    /// Usage of one model
    ///
    /// # Errors
    ///
    /// Returns the store's error.
    pub async fn by_model(
        &self,
        model_id: &str,
        range: TimeRange,
    ) -> Result<UsageTotals, StoreError> {
        self.totals_where(range, |r| r.model_id == model_id).await
    }

    /// Usage of one provider
    ///
    /// # Errors
    ///
    /// Returns the store's error.
    pub async fn by_provider(
        &self,
        provider: &str,
        range: TimeRange,
    ) -> Result<UsageTotals, StoreError> {
        self.totals_where(range, |r| r.provider == provider).await
    }

    /// Usage of everything
    ///
    /// # Errors
    ///
    /// Returns the store's error.
    pub async fn total(&self, range: TimeRange) -> Result<UsageTotals, StoreError> {
        self.totals_where(range, |_| true).await
    }

    /// Totals and breakdowns, computed from one snapshot of the range
    ///
    /// # Errors
    ///
    /// Returns the store's error.
    pub async fn summary(&self, range: TimeRange) -> Result<UsageSummary, StoreError> {
        let records = self.store.range(range).await?;
        Ok(UsageSummary::from_records(range, &records))
    }

    /// Drop records older than the retention window
    ///
    /// # Errors
    ///
    /// Returns the store's error.
    pub async fn purge_expired(&self) -> Result<usize, StoreError> {
        let cutoff = Utc::now() - self.config.retention();
        let removed = self.store.purge_before(cutoff).await?;
        if removed > 0 {
            tracing::info!(removed, cutoff = %cutoff, "Purged expired usage records");
        }
        Ok(removed)
    }

    /// Records currently held
    ///
    /// # Errors
    ///
    /// Returns the store's error.
    pub async fn len(&self) -> Result<usize, StoreError> {
        self.store.len().await
    }
}

impl std::fmt::Debug for UsageLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UsageLedger")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
