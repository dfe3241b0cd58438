//! Admission Control per Caller
//!
//! Every caller key (API key, else user id, else `anonymous`) owns a token
//! bucket:
//!
//! - Capacity `token_limit`; a fresh bucket starts full
//! - `tokens_per_period` tokens are added per `replenishment_period_secs`
//! - Each admitted request consumes one token
//! - Without a token the caller is queued (oldest first) up to
//!   `queue_limit`, or denied with a retry-after hint
//!
//! # Design
//!
//! Refill is computed lazily from elapsed time whenever a bucket is touched,
//! so there is no background timer and no drift from missed ticks. Tokens are
//! tracked in thousandths so fractional refill accumulates exactly.
//!
//! Buckets live in a `DashMap`, so admission checks for different keys never
//! contend. Each bucket's state sits behind a short `parking_lot::Mutex`
//! critical section that performs the refill-and-consume read-modify-write.
//!
//! # Usage
//!
//! ```
//! use gateway_core::rate_limit::{Admission, RateLimitConfig, RateLimiter};
//!
//! let limiter = RateLimiter::new(
//!     RateLimitConfig::default()
//!         .with_token_limit(10)
//!         .with_refill(10, 60),
//! );
//! assert!(matches!(limiter.try_admit("key-1"), Admission::Granted));
//! ```

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Thousandths of a token
const MILLI: u64 = 1000;

// =============================================================================
// Configuration
// =============================================================================

/// Token bucket parameters, shared by every caller key
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Whether admission control is applied at all
    pub enabled: bool,

    /// Bucket capacity
    pub token_limit: u32,

    /// Tokens added per replenishment period
    pub tokens_per_period: u32,

    /// Length of the replenishment period
    pub replenishment_period_secs: u64,

    /// Callers that may wait for a token; 0 denies immediately
    pub queue_limit: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            token_limit: 100,
            tokens_per_period: 100,
            replenishment_period_secs: 60,
            queue_limit: 0,
        }
    }
}

impl RateLimitConfig {
    /// Set the bucket capacity
    #[must_use]
    pub fn with_token_limit(mut self, limit: u32) -> Self {
        self.token_limit = limit;
        self
    }

    /// Set the refill rate as `tokens` per `period_secs`
    #[must_use]
    pub fn with_refill(mut self, tokens: u32, period_secs: u64) -> Self {
        self.tokens_per_period = tokens;
        self.replenishment_period_secs = period_secs;
        self
    }

    /// Set how many callers may queue for a token
    #[must_use]
    pub fn with_queue_limit(mut self, limit: u32) -> Self {
        self.queue_limit = limit;
        self
    }

    /// Create a disabled configuration (for testing)
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    fn capacity_milli(&self) -> u64 {
        u64::from(self.token_limit) * MILLI
    }

    fn rate_milli(&self) -> u128 {
        u128::from(self.tokens_per_period) * u128::from(MILLI)
    }

    fn period_nanos(&self) -> u128 {
        Duration::from_secs(self.replenishment_period_secs).as_nanos()
    }

    /// Time for the bucket to gain `deficit_milli` thousandths of a token
    fn time_to_refill(&self, deficit_milli: u64) -> Duration {
        let rate = self.rate_milli();
        if rate == 0 {
            return Duration::from_secs(self.replenishment_period_secs.max(1));
        }
        let nanos = (u128::from(deficit_milli) * self.period_nanos()).div_ceil(rate);
        Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX))
    }
}

// =============================================================================
// Error Types
// =============================================================================

/// Errors from admission control
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum RateLimitError {
    /// No token available and queueing is disabled
    #[error("rate limit exceeded for '{key}', retry after {}ms", .retry_after.as_millis())]
    Exceeded {
        /// Caller key
        key: String,
        /// Time until the next token
        retry_after: Duration,
    },

    /// No token available and the wait queue is full
    #[error(
        "rate limit queue full for '{key}' ({queued} waiting), retry after {}ms",
        .retry_after.as_millis()
    )]
    QueueFull {
        /// Caller key
        key: String,
        /// Callers already waiting
        queued: usize,
        /// Time until the next token
        retry_after: Duration,
    },

    /// The caller gave up while queued
    #[error("rate limit wait cancelled for '{key}'")]
    Cancelled {
        /// Caller key
        key: String,
    },
}

impl RateLimitError {
    /// Retry-after hint, if the error carries one
    #[must_use]
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::Exceeded { retry_after, .. } | Self::QueueFull { retry_after, .. } => {
                Some(*retry_after)
            }
            Self::Cancelled { .. } => None,
        }
    }
}

/// Result of a non-waiting admission check
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Admission {
    /// A token was consumed
    Granted,

    /// No token available
    Denied {
        /// Time until the next token
        retry_after: Duration,
    },
}

impl Admission {
    #[must_use]
    pub fn is_granted(&self) -> bool {
        matches!(self, Self::Granted)
    }
}

// =============================================================================
// Bucket
// =============================================================================

#[derive(Debug)]
struct BucketState {
    tokens_milli: u64,
    last_refill: Instant,
    waiters: VecDeque<u64>,
    next_ticket: u64,
}

#[derive(Debug)]
struct Bucket {
    state: Mutex<BucketState>,
    /// Wakes queued callers when the queue head changes
    queue_changed: Notify,
    admitted: AtomicU64,
    denied: AtomicU64,
    queued: AtomicU64,
}

impl Bucket {
    fn new(config: &RateLimitConfig) -> Self {
        Self {
            state: Mutex::new(BucketState {
                tokens_milli: config.capacity_milli(),
                last_refill: Instant::now(),
                waiters: VecDeque::new(),
                next_ticket: 0,
            }),
            queue_changed: Notify::new(),
            admitted: AtomicU64::new(0),
            denied: AtomicU64::new(0),
            queued: AtomicU64::new(0),
        }
    }
}

impl BucketState {
    /// Add the tokens earned since the last refill
    ///
    /// `last_refill` only advances by the time that produced whole
    /// thousandths, so no elapsed time is lost to rounding.
    fn refill(&mut self, config: &RateLimitConfig, now: Instant) {
        let capacity = config.capacity_milli();
        if self.tokens_milli >= capacity {
            self.tokens_milli = capacity;
            self.last_refill = now;
            return;
        }

        let rate = config.rate_milli();
        let period = config.period_nanos();
        if rate == 0 || period == 0 {
            return;
        }

        let elapsed = now.saturating_duration_since(self.last_refill).as_nanos();
        let earned = elapsed * rate / period;
        if earned == 0 {
            return;
        }

        let earned = u64::try_from(earned).unwrap_or(u64::MAX);
        self.tokens_milli = self.tokens_milli.saturating_add(earned).min(capacity);
        if self.tokens_milli == capacity {
            self.last_refill = now;
        } else {
            let used = u128::from(earned) * period / rate;
            self.last_refill += Duration::from_nanos(u64::try_from(used).unwrap_or(u64::MAX));
        }
    }

    fn take(&mut self) -> bool {
        if self.tokens_milli >= MILLI {
            self.tokens_milli -= MILLI;
            true
        } else {
            false
        }
    }

    /// Time until `needed` whole tokens are available
    fn wait_for(&self, config: &RateLimitConfig, needed: u64) -> Duration {
        config.time_to_refill((needed * MILLI).saturating_sub(self.tokens_milli))
    }

    fn remove_waiter(&mut self, ticket: u64) -> bool {
        if let Some(pos) = self.waiters.iter().position(|t| *t == ticket) {
            self.waiters.remove(pos);
            return true;
        }
        false
    }
}

/// Removes a queued ticket if the waiting caller goes away
struct QueueSlot {
    bucket: Arc<Bucket>,
    ticket: u64,
    armed: bool,
}

impl Drop for QueueSlot {
    fn drop(&mut self) {
        if self.armed {
            let removed = self.bucket.state.lock().remove_waiter(self.ticket);
            if removed {
                self.bucket.queue_changed.notify_waiters();
            }
        }
    }
}

// =============================================================================
// Statistics
// =============================================================================

/// Counters for a single caller key
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeyStats {
    pub key: String,
    pub available_tokens: u32,
    pub waiting: usize,
    pub admitted: u64,
    pub denied: u64,
    pub queued: u64,
}

/// Counters across all caller keys
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RateLimiterStats {
    pub keys: usize,
    pub admitted: u64,
    pub denied: u64,
    pub queued: u64,
    pub waiting: usize,
}

// =============================================================================
// Rate Limiter
// =============================================================================

/// Per-caller token buckets
#[derive(Debug)]
pub struct RateLimiter {
    config: RateLimitConfig,
    buckets: DashMap<String, Arc<Bucket>>,
}

impl RateLimiter {
    #[must_use]
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            buckets: DashMap::new(),
        }
    }

    #[must_use]
    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    fn bucket(&self, key: &str) -> Arc<Bucket> {
        if let Some(bucket) = self.buckets.get(key) {
            return Arc::clone(bucket.value());
        }
        Arc::clone(
            self.buckets
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(Bucket::new(&self.config)))
                .value(),
        )
    }

    /// Consume a token if one is available right now
    ///
    /// Never queues. Callers already waiting keep their place, so a
    /// non-waiting check is denied while the queue is non-empty.
    pub fn try_admit(&self, key: &str) -> Admission {
        if !self.config.enabled {
            return Admission::Granted;
        }

        let bucket = self.bucket(key);
        let mut state = bucket.state.lock();
        state.refill(&self.config, Instant::now());

        if state.waiters.is_empty() && state.take() {
            bucket.admitted.fetch_add(1, Ordering::Relaxed);
            return Admission::Granted;
        }

        bucket.denied.fetch_add(1, Ordering::Relaxed);
        let needed = state.waiters.len() as u64 + 1;
        Admission::Denied {
            retry_after: state.wait_for(&self.config, needed),
        }
    }

    /// Consume a token, waiting in the key's FIFO queue if allowed
    ///
    /// A cancelled wait leaves the queue without consuming a token.
    pub async fn admit(&self, key: &str, cancel: &CancellationToken) -> Result<(), RateLimitError> {
        if !self.config.enabled {
            return Ok(());
        }

        let bucket = self.bucket(key);
        let ticket = {
            let mut state = bucket.state.lock();
            state.refill(&self.config, Instant::now());

            if state.waiters.is_empty() && state.take() {
                bucket.admitted.fetch_add(1, Ordering::Relaxed);
                return Ok(());
            }

            let queued = state.waiters.len();
            let retry_after = state.wait_for(&self.config, queued as u64 + 1);
            if self.config.queue_limit == 0 {
                bucket.denied.fetch_add(1, Ordering::Relaxed);
                return Err(RateLimitError::Exceeded {
                    key: key.to_string(),
                    retry_after,
                });
            }
            if queued >= self.config.queue_limit as usize {
                bucket.denied.fetch_add(1, Ordering::Relaxed);
                return Err(RateLimitError::QueueFull {
                    key: key.to_string(),
                    queued,
                    retry_after,
                });
            }

            let ticket = state.next_ticket;
            state.next_ticket += 1;
            state.waiters.push_back(ticket);
            bucket.queued.fetch_add(1, Ordering::Relaxed);
            ticket
        };

        tracing::debug!(key, ticket, "Caller queued for rate-limit token");

        let mut slot = QueueSlot {
            bucket: Arc::clone(&bucket),
            ticket,
            armed: true,
        };

        loop {
            let changed = bucket.queue_changed.notified();
            let wait = {
                let mut state = bucket.state.lock();
                state.refill(&self.config, Instant::now());
                let position = state
                    .waiters
                    .iter()
                    .position(|t| *t == ticket)
                    .unwrap_or(0);

                if position == 0 && state.take() {
                    state.waiters.pop_front();
                    slot.armed = false;
                    bucket.admitted.fetch_add(1, Ordering::Relaxed);
                    drop(state);
                    bucket.queue_changed.notify_waiters();
                    return Ok(());
                }
                state.wait_for(&self.config, position as u64 + 1)
            };

            // Queue wait: woken by refill time or by the queue head moving
            tokio::select! {
                () = cancel.cancelled() => {
                    tracing::debug!(key, ticket, "Rate-limit wait cancelled");
                    return Err(RateLimitError::Cancelled { key: key.to_string() });
                }
                () = tokio::time::sleep(wait) => {}
                () = changed => {}
            }
        }
    }

    /// Whole tokens currently available to `key`
    #[must_use]
    pub fn available_tokens(&self, key: &str) -> u32 {
        let Some(bucket) = self.buckets.get(key).map(|b| Arc::clone(b.value())) else {
            return self.config.token_limit;
        };
        let mut state = bucket.state.lock();
        state.refill(&self.config, Instant::now());
        u32::try_from(state.tokens_milli / MILLI).unwrap_or(u32::MAX)
    }

    /// Counters for one key, if it has been seen
    #[must_use]
    pub fn key_stats(&self, key: &str) -> Option<KeyStats> {
        let bucket = self.buckets.get(key).map(|b| Arc::clone(b.value()))?;
        Some(Self::stats_for(key, &bucket, &self.config))
    }

    fn stats_for(key: &str, bucket: &Bucket, config: &RateLimitConfig) -> KeyStats {
        let mut state = bucket.state.lock();
        state.refill(config, Instant::now());
        KeyStats {
            key: key.to_string(),
            available_tokens: u32::try_from(state.tokens_milli / MILLI).unwrap_or(u32::MAX),
            waiting: state.waiters.len(),
            admitted: bucket.admitted.load(Ordering::Relaxed),
            denied: bucket.denied.load(Ordering::Relaxed),
            queued: bucket.queued.load(Ordering::Relaxed),
        }
    }

    /// Aggregate counters across every key
    #[must_use]
    pub fn stats(&self) -> RateLimiterStats {
        let mut stats = RateLimiterStats::default();
        for entry in self.buckets.iter() {
            let key_stats = Self::stats_for(entry.key(), entry.value(), &self.config);
            stats.keys += 1;
            stats.admitted += key_stats.admitted;
            stats.denied += key_stats.denied;
            stats.queued += key_stats.queued;
            stats.waiting += key_stats.waiting;
        }
        stats
    }

    /// Drop buckets that are full, idle and unreferenced
    ///
    /// A full bucket behaves exactly like a fresh one, so eviction is
    /// invisible to callers. Returns how many buckets were removed.
    pub fn evict_idle(&self) -> usize {
        let before = self.buckets.len();
        let now = Instant::now();
        self.buckets.retain(|_, bucket| {
            if Arc::strong_count(bucket) > 1 {
                return true;
            }
            let mut state = bucket.state.lock();
            state.refill(&self.config, now);
            !(state.waiters.is_empty() && state.tokens_milli >= self.config.capacity_milli())
        });
        before.saturating_sub(self.buckets.len())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }
}
