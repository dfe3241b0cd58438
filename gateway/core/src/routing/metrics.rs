//! Health and Metrics Registry
//!
//! Rolling view of per-provider and per-(model, provider) traffic:
//! - Request, success, failure and circuit-rejection counts
//! - Latency totals for rolling averages
//! - Tokens and cost
//!
//! Counters live in fixed-width time buckets. Writers only touch atomics in
//! the current bucket; the routing engine reads a [`MetricsSnapshot`] built
//! from the buckets inside the configured window. Buckets older than the
//! retention period are dropped by [`MetricsRegistry::evict_expired`], which
//! the maintenance task calls; nothing on the request path prunes.

use std::collections::{BTreeMap, HashMap};
use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use super::config::ModelKey;
use crate::store::Timestamped;

// ============================================================================
// Configuration
// ============================================================================

/// Bucketing and retention of the metrics registry
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Width of one time bucket
    pub bucket_secs: u64,

    /// Trailing window read by the routing engine
    pub window_secs: u64,

    /// Age after which buckets are evicted
    pub retention_secs: u64,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            bucket_secs: 60,
            window_secs: 300,
            retention_secs: 86_400,
        }
    }
}

impl MetricsConfig {
    fn bucket_start(&self, ts: DateTime<Utc>) -> i64 {
        let width = i64::try_from(self.bucket_secs.max(1)).unwrap_or(i64::MAX);
        ts.timestamp().div_euclid(width) * width
    }

    fn seconds(secs: u64) -> chrono::Duration {
        chrono::Duration::seconds(i64::try_from(secs).unwrap_or(i64::MAX))
    }
}

// ============================================================================
// Counter
// ============================================================================

/// A monotonically increasing counter
#[derive(Debug, Default)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(&self, n: u64) {
        self.value.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

// ============================================================================
// Buckets and Series
// ============================================================================

#[derive(Debug, Default)]
struct BucketCounters {
    requests: Counter,
    successes: Counter,
    failures: Counter,
    rejections: Counter,
    latency_ms_total: Counter,
    latency_samples: Counter,
    tokens: Counter,
    cost_micro_usd: Counter,
}

/// Aggregated counters over a set of buckets
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct SeriesTotals {
    pub requests: u64,
    pub successes: u64,
    pub failures: u64,
    pub rejections: u64,
    pub latency_ms_total: u64,
    pub latency_samples: u64,
    pub tokens: u64,
    pub cost_usd: f64,
}

impl SeriesTotals {
    fn absorb(&mut self, bucket: &BucketCounters) {
        self.requests += bucket.requests.get();
        self.successes += bucket.successes.get();
        self.failures += bucket.failures.get();
        self.rejections += bucket.rejections.get();
        self.latency_ms_total += bucket.latency_ms_total.get();
        self.latency_samples += bucket.latency_samples.get();
        self.tokens += bucket.tokens.get();
        self.cost_usd += bucket.cost_micro_usd.get() as f64 / 1_000_000.0;
    }

    /// Rolling average latency, `None` without samples
    #[must_use]
    pub fn avg_latency_ms(&self) -> Option<f64> {
        (self.latency_samples > 0)
            .then(|| self.latency_ms_total as f64 / self.latency_samples as f64)
    }

    #[must_use]
    pub fn success_rate(&self) -> f64 {
        if self.requests == 0 {
            1.0
        } else {
            self.successes as f64 / self.requests as f64
        }
    }
}

#[derive(Debug, Default)]
struct Series {
    buckets: RwLock<BTreeMap<i64, Arc<BucketCounters>>>,
}

impl Series {
    fn bucket(&self, start: i64) -> Arc<BucketCounters> {
        // Try read first
        if let Some(bucket) = self.buckets.read().get(&start) {
            return Arc::clone(bucket);
        }

        Arc::clone(self.buckets.write().entry(start).or_default())
    }

    fn totals_since(&self, from: i64) -> SeriesTotals {
        let mut totals = SeriesTotals::default();
        for bucket in self.buckets.read().range(from..).map(|(_, b)| b) {
            totals.absorb(bucket);
        }
        totals
    }

    fn per_bucket(&self) -> Vec<(i64, SeriesTotals)> {
        self.buckets
            .read()
            .iter()
            .map(|(start, bucket)| {
                let mut totals = SeriesTotals::default();
                totals.absorb(bucket);
                (*start, totals)
            })
            .collect()
    }

    fn evict_before(&self, cutoff: i64) -> usize {
        let mut buckets = self.buckets.write();
        let before = buckets.len();
        buckets.retain(|start, _| *start >= cutoff);
        before - buckets.len()
    }

    fn is_empty(&self) -> bool {
        self.buckets.read().is_empty()
    }
}

// ============================================================================
// Attempt Outcomes
// ============================================================================

/// Result of one dispatch attempt, as seen by the registry
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum AttemptOutcome {
    /// Provider answered
    Success {
        latency: Duration,
        tokens: u64,
        cost_usd: f64,
    },
    /// Provider call failed (including timeouts)
    Failure { latency: Duration },
    /// Circuit breaker rejected the attempt before any call
    Rejected,
}

// ============================================================================
// Snapshot
// ============================================================================

/// Windowed statistics for one provider/model pair
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct ModelStats {
    pub recent_requests: u64,
    pub avg_latency_ms: Option<f64>,
    pub success_rate: f64,
}

/// Point-in-time view the routing engine ranks against
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MetricsSnapshot {
    stats: HashMap<ModelKey, ModelStats>,
}

impl MetricsSnapshot {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder used to pin a snapshot in tests and dry runs
    #[must_use]
    pub fn with(mut self, key: ModelKey, stats: ModelStats) -> Self {
        self.stats.insert(key, stats);
        self
    }

    #[must_use]
    pub fn get(&self, key: &ModelKey) -> Option<&ModelStats> {
        self.stats.get(key)
    }

    #[must_use]
    pub fn recent_requests(&self, key: &ModelKey) -> u64 {
        self.stats.get(key).map_or(0, |s| s.recent_requests)
    }

    #[must_use]
    pub fn avg_latency_ms(&self, key: &ModelKey) -> Option<f64> {
        self.stats.get(key).and_then(|s| s.avg_latency_ms)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.stats.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.stats.is_empty()
    }
}

// ============================================================================
// Exported Records
// ============================================================================

/// Provider-level health sample
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProviderHealthRecord {
    pub provider: String,
    pub is_available: bool,
    pub timestamp: DateTime<Utc>,
    pub response_time_ms: Option<f64>,
    pub request_count: u64,
    pub failure_count: u64,
}

impl Timestamped for ProviderHealthRecord {
    fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
}

/// Per-bucket counters for one provider/model pair
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ModelMetricsRecord {
    pub model_id: String,
    pub provider: String,
    /// Start of the bucket
    pub timestamp: DateTime<Utc>,
    pub request_count: u64,
    pub success_count: u64,
    pub failure_count: u64,
    pub total_tokens: u64,
    pub average_response_time_ms: Option<f64>,
    pub total_cost_usd: f64,
}

impl Timestamped for ModelMetricsRecord {
    fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
}

// ============================================================================
// Registry
// ============================================================================

/// Registry-wide counters
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RegistrySummary {
    pub total_requests: u64,
    pub total_fallbacks: u64,
    pub total_rate_limited: u64,
    pub total_failed_requests: u64,
    pub tracked_models: usize,
    pub tracked_providers: usize,
}

/// Bucketed counters keyed by provider and by (model, provider)
#[derive(Debug)]
pub struct MetricsRegistry {
    config: MetricsConfig,
    models: DashMap<ModelKey, Arc<Series>>,
    providers: DashMap<String, Arc<Series>>,

    /// Top-level requests that reached routing
    pub total_requests: Counter,
    /// Candidate switches performed by the orchestrator
    pub total_fallbacks: Counter,
    /// Requests denied admission
    pub total_rate_limited: Counter,
    /// Requests that ended in a terminal error after routing
    pub total_failed_requests: Counter,
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new(MetricsConfig::default())
    }
}

impl MetricsRegistry {
    pub fn new(config: MetricsConfig) -> Self {
        Self {
            config,
            models: DashMap::new(),
            providers: DashMap::new(),
            total_requests: Counter::new(),
            total_fallbacks: Counter::new(),
            total_rate_limited: Counter::new(),
            total_failed_requests: Counter::new(),
        }
    }

    #[must_use]
    pub fn config(&self) -> &MetricsConfig {
        &self.config
    }

    /// Record one dispatch attempt
    pub fn record_attempt(&self, key: &ModelKey, outcome: AttemptOutcome) {
        self.record_attempt_at(key, outcome, Utc::now());
    }

    /// Record one dispatch attempt at an explicit time
    pub fn record_attempt_at(&self, key: &ModelKey, outcome: AttemptOutcome, now: DateTime<Utc>) {
        let start = self.config.bucket_start(now);
        let model_bucket = self.model_series(key).bucket(start);
        let provider_bucket = self.provider_series(&key.provider).bucket(start);

        for bucket in [&model_bucket, &provider_bucket] {
            bucket.requests.inc();
            match outcome {
                AttemptOutcome::Success {
                    latency,
                    tokens,
                    cost_usd,
                } => {
                    bucket.successes.inc();
                    bucket.latency_ms_total.add(duration_ms(latency));
                    bucket.latency_samples.inc();
                    bucket.tokens.add(tokens);
                    bucket.cost_micro_usd.add((cost_usd.max(0.0) * 1_000_000.0).round() as u64);
                }
                AttemptOutcome::Failure { latency } => {
                    bucket.failures.inc();
                    bucket.latency_ms_total.add(duration_ms(latency));
                    bucket.latency_samples.inc();
                }
                AttemptOutcome::Rejected => {
                    bucket.failures.inc();
                    bucket.rejections.inc();
                }
            }
        }
    }

    pub fn record_fallback(&self, from: &ModelKey, to: &ModelKey) {
        self.total_fallbacks.inc();
        tracing::debug!(from = %from, to = %to, "Fallback recorded");
    }

    fn model_series(&self, key: &ModelKey) -> Arc<Series> {
        if let Some(series) = self.models.get(key) {
            return Arc::clone(series.value());
        }
        Arc::clone(self.models.entry(key.clone()).or_default().value())
    }

    fn provider_series(&self, provider: &str) -> Arc<Series> {
        if let Some(series) = self.providers.get(provider) {
            return Arc::clone(series.value());
        }
        Arc::clone(
            self.providers
                .entry(provider.to_string())
                .or_default()
                .value(),
        )
    }

    fn window_start(&self, now: DateTime<Utc>) -> i64 {
        self.config
            .bucket_start(now - MetricsConfig::seconds(self.config.window_secs))
    }

    /// Windowed totals for a provider/model pair
    #[must_use]
    pub fn model_totals(&self, key: &ModelKey) -> SeriesTotals {
        self.model_totals_at(key, Utc::now())
    }

    #[must_use]
    pub fn model_totals_at(&self, key: &ModelKey, now: DateTime<Utc>) -> SeriesTotals {
        let from = self.window_start(now);
        self.models
            .get(key)
            .map(|s| s.totals_since(from))
            .unwrap_or_default()
    }

    /// Windowed totals for a provider
    #[must_use]
    pub fn provider_totals(&self, provider: &str) -> SeriesTotals {
        let from = self.window_start(Utc::now());
        self.providers
            .get(provider)
            .map(|s| s.totals_since(from))
            .unwrap_or_default()
    }

    /// Snapshot of every tracked pair over the trailing window
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        self.snapshot_at(Utc::now())
    }

    #[must_use]
    pub fn snapshot_at(&self, now: DateTime<Utc>) -> MetricsSnapshot {
        let from = self.window_start(now);
        let stats = self
            .models
            .iter()
            .map(|entry| {
                let totals = entry.value().totals_since(from);
                (
                    entry.key().clone(),
                    ModelStats {
                        recent_requests: totals.requests,
                        avg_latency_ms: totals.avg_latency_ms(),
                        success_rate: totals.success_rate(),
                    },
                )
            })
            .collect();
        MetricsSnapshot { stats }
    }

    /// Drop buckets older than the retention period, returning how many went
    pub fn evict_expired(&self) -> usize {
        self.evict_expired_at(Utc::now())
    }

    pub fn evict_expired_at(&self, now: DateTime<Utc>) -> usize {
        let cutoff = self
            .config
            .bucket_start(now - MetricsConfig::seconds(self.config.retention_secs));

        let mut evicted = 0;
        for entry in self.models.iter() {
            evicted += entry.value().evict_before(cutoff);
        }
        for entry in self.providers.iter() {
            evicted += entry.value().evict_before(cutoff);
        }
        self.models.retain(|_, series| !series.is_empty());
        self.providers.retain(|_, series| !series.is_empty());

        if evicted > 0 {
            tracing::debug!(evicted, "Evicted expired metric buckets");
        }
        evicted
    }

    /// Per-bucket records for every provider/model pair, sorted by key then time
    #[must_use]
    pub fn model_metrics_records(&self) -> Vec<ModelMetricsRecord> {
        let mut records: Vec<ModelMetricsRecord> = self
            .models
            .iter()
            .flat_map(|entry| {
                let key = entry.key().clone();
                entry
                    .value()
                    .per_bucket()
                    .into_iter()
                    .map(move |(start, totals)| ModelMetricsRecord {
                        model_id: key.model_id.clone(),
                        provider: key.provider.clone(),
                        timestamp: Utc.timestamp_opt(start, 0).single().unwrap_or_default(),
                        request_count: totals.requests,
                        success_count: totals.successes,
                        failure_count: totals.failures,
                        total_tokens: totals.tokens,
                        average_response_time_ms: totals.avg_latency_ms(),
                        total_cost_usd: totals.cost_usd,
                    })
            })
            .collect();
        records.sort_by(|a, b| {
            (&a.provider, &a.model_id, a.timestamp).cmp(&(&b.provider, &b.model_id, b.timestamp))
        });
        records
    }

    /// Current health sample per provider, sorted by provider
    #[must_use]
    pub fn provider_health_records(
        &self,
        is_available: impl Fn(&str) -> bool,
    ) -> Vec<ProviderHealthRecord> {
        let now = Utc::now();
        let from = self.window_start(now);
        let mut records: Vec<ProviderHealthRecord> = self
            .providers
            .iter()
            .map(|entry| {
                let totals = entry.value().totals_since(from);
                ProviderHealthRecord {
                    provider: entry.key().clone(),
                    is_available: is_available(entry.key()),
                    timestamp: now,
                    response_time_ms: totals.avg_latency_ms(),
                    request_count: totals.requests,
                    failure_count: totals.failures,
                }
            })
            .collect();
        records.sort_by(|a, b| a.provider.cmp(&b.provider));
        records
    }

    #[must_use]
    pub fn summary(&self) -> RegistrySummary {
        RegistrySummary {
            total_requests: self.total_requests.get(),
            total_fallbacks: self.total_fallbacks.get(),
            total_rate_limited: self.total_rate_limited.get(),
            total_failed_requests: self.total_failed_requests.get(),
            tracked_models: self.models.len(),
            tracked_providers: self.providers.len(),
        }
    }

    /// Export in Prometheus text format
    #[must_use]
    pub fn to_prometheus(&self) -> String {
        let mut output = String::new();

        let _ = write!(
            output,
            "# HELP gateway_requests_total Requests that reached routing\n\
             # TYPE gateway_requests_total counter\n\
             gateway_requests_total {}\n\n",
            self.total_requests.get()
        );
        let _ = write!(
            output,
            "# HELP gateway_fallbacks_total Candidate switches\n\
             # TYPE gateway_fallbacks_total counter\n\
             gateway_fallbacks_total {}\n\n",
            self.total_fallbacks.get()
        );
        let _ = write!(
            output,
            "# HELP gateway_rate_limited_total Requests denied admission\n\
             # TYPE gateway_rate_limited_total counter\n\
             gateway_rate_limited_total {}\n\n",
            self.total_rate_limited.get()
        );

        let snapshot = self.snapshot();
        let mut keys: Vec<&ModelKey> = snapshot.stats.keys().collect();
        keys.sort();

        output.push_str(
            "# HELP gateway_model_recent_requests Attempts in the trailing window\n\
             # TYPE gateway_model_recent_requests gauge\n",
        );
        for key in &keys {
            let _ = writeln!(
                output,
                "gateway_model_recent_requests{{model=\"{}\",provider=\"{}\"}} {}",
                key.model_id,
                key.provider,
                snapshot.recent_requests(key)
            );
        }
        output.push('\n');

        output.push_str(
            "# HELP gateway_model_latency_ms Rolling average latency\n\
             # TYPE gateway_model_latency_ms gauge\n",
        );
        for key in &keys {
            if let Some(latency) = snapshot.avg_latency_ms(key) {
                let _ = writeln!(
                    output,
                    "gateway_model_latency_ms{{model=\"{}\",provider=\"{}\"}} {:.1}",
                    key.model_id, key.provider, latency
                );
            }
        }

        output
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
