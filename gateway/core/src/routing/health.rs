//! Circuit Breakers per Provider/Model Pair
//!
//! Each provider/model pair gets a breaker that stops the dispatcher from
//! hammering a failing upstream:
//!
//! ```text
//! +--------+  threshold failures   +------+   cooldown elapsed   +-----------+
//! | Closed | --------------------> | Open | -------------------> | Half-Open |
//! +--------+   within the window   +------+                      +-----------+
//!     ^                               ^        probe fails             |
//!     |                               +--------------------------------+
//!     |                   probe succeeds                               |
//!     +----------------------------------------------------------------+
//! ```
//!
//! - **Closed**: attempts pass through; failures inside the rolling window
//!   are counted and a success resets the count.
//! - **Open**: attempts are rejected without contacting the provider until
//!   the cooldown elapses. Each reopen after a failed probe multiplies the
//!   cooldown, up to a cap.
//! - **Half-Open**: exactly one probe is let through. The slot is claimed by
//!   a compare-and-swap from "untried" to "in flight", so concurrent callers
//!   cannot both reach the provider.
//!
//! # Thread Safety
//!
//! Breaker state is a set of atomics moved by compare-and-swap. The registry
//! shards breakers in a `DashMap`, so unrelated pairs never contend.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use super::config::ModelKey;

// ============================================================================
// Circuit Breaker State
// ============================================================================

/// Circuit breaker state
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum CircuitState {
    /// Normal operation
    #[default]
    Closed,

    /// Rejecting attempts until the cooldown elapses
    Open,

    /// Cooldown elapsed; one probe decides the next state
    HalfOpen,
}

const CLOSED: u32 = 0;
const OPEN: u32 = 1;
const HALF_OPEN_UNTRIED: u32 = 2;
const HALF_OPEN_IN_FLIGHT: u32 = 3;

// ============================================================================
// Configuration
// ============================================================================

/// Thresholds and timings for circuit breakers
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Failures within the window that open the circuit
    pub failure_threshold: u32,

    /// Rolling window for counting failures
    pub window_secs: u64,

    /// Initial open duration
    pub cooldown_secs: u64,

    /// Growth factor applied to the cooldown after each failed probe
    pub cooldown_multiplier: f64,

    /// Upper bound on the cooldown
    pub max_cooldown_secs: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            window_secs: 60,
            cooldown_secs: 30,
            cooldown_multiplier: 2.0,
            max_cooldown_secs: 300,
        }
    }
}

impl CircuitBreakerConfig {
    /// Cooldown after the `opens`-th consecutive open (1-indexed)
    #[must_use]
    pub fn cooldown_for(&self, opens: u32) -> Duration {
        let exponent = i32::try_from(opens.saturating_sub(1)).unwrap_or(i32::MAX);
        let base = self.cooldown_secs as f64 * self.cooldown_multiplier.max(1.0).powi(exponent);
        let capped = base.min(self.max_cooldown_secs.max(self.cooldown_secs) as f64);
        Duration::from_millis((capped * 1000.0) as u64)
    }

    fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }
}

// ============================================================================
// Circuit Breaker
// ============================================================================

/// Breaker for a single provider/model pair
pub struct CircuitBreaker {
    key: ModelKey,
    config: CircuitBreakerConfig,

    /// One of `CLOSED`, `OPEN`, `HALF_OPEN_UNTRIED`, `HALF_OPEN_IN_FLIGHT`
    state: AtomicU32,

    /// Timestamps of the most recent failures (millis since `epoch`), oldest
    /// first, holding at most `failure_threshold` entries
    recent_failures: Mutex<VecDeque<u64>>,

    /// Last state transition (millis since `epoch`)
    last_transition_ms: AtomicU64,

    /// Consecutive opens without a successful probe
    opens: AtomicU32,

    /// Attempts rejected while open
    rejections: AtomicU64,

    epoch: Instant,
}

impl CircuitBreaker {
    pub fn new(key: ModelKey, config: CircuitBreakerConfig) -> Self {
        Self {
            key,
            config,
            state: AtomicU32::new(CLOSED),
            recent_failures: Mutex::new(VecDeque::new()),
            last_transition_ms: AtomicU64::new(0),
            opens: AtomicU32::new(0),
            rejections: AtomicU64::new(0),
            epoch: Instant::now(),
        }
    }

    #[must_use]
    pub fn key(&self) -> &ModelKey {
        &self.key
    }

    /// Current state, as observable from outside
    #[must_use]
    pub fn state(&self) -> CircuitState {
        match self.state.load(Ordering::Acquire) {
            OPEN if self.cooldown_elapsed() => CircuitState::HalfOpen,
            OPEN => CircuitState::Open,
            HALF_OPEN_UNTRIED | HALF_OPEN_IN_FLIGHT => CircuitState::HalfOpen,
            _ => CircuitState::Closed,
        }
    }

    /// Whether an attempt issued now would be let through
    #[must_use]
    pub fn is_available(&self) -> bool {
        match self.state.load(Ordering::Acquire) {
            CLOSED | HALF_OPEN_UNTRIED => true,
            OPEN => self.cooldown_elapsed(),
            _ => false,
        }
    }

    /// Claim permission for one attempt
    ///
    /// Returns the remaining cooldown when the circuit rejects the attempt.
    pub fn try_acquire(self: &Arc<Self>) -> Result<CircuitPermit, Duration> {
        loop {
            match self.state.load(Ordering::Acquire) {
                CLOSED => return Ok(CircuitPermit::new(Arc::clone(self), false)),
                OPEN => {
                    if !self.maybe_transition_to_half_open() && !self.cooldown_elapsed() {
                        return Err(self.reject());
                    }
                }
                HALF_OPEN_UNTRIED => {
                    if self
                        .state
                        .compare_exchange(
                            HALF_OPEN_UNTRIED,
                            HALF_OPEN_IN_FLIGHT,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        )
                        .is_ok()
                    {
                        tracing::debug!(circuit = %self.key, "Half-open probe claimed");
                        return Ok(CircuitPermit::new(Arc::clone(self), true));
                    }
                }
                _ => return Err(self.reject()),
            }
        }
    }

    fn reject(&self) -> Duration {
        self.rejections.fetch_add(1, Ordering::Relaxed);
        self.remaining_cooldown()
    }

    /// Time left before a probe may be attempted
    #[must_use]
    pub fn remaining_cooldown(&self) -> Duration {
        let elapsed = Duration::from_millis(
            self.now_millis()
                .saturating_sub(self.last_transition_ms.load(Ordering::Acquire)),
        );
        self.current_cooldown().saturating_sub(elapsed)
    }

    fn current_cooldown(&self) -> Duration {
        self.config
            .cooldown_for(self.opens.load(Ordering::Acquire).max(1))
    }

    fn cooldown_elapsed(&self) -> bool {
        self.remaining_cooldown().is_zero()
    }

    /// Move Open -> `HalfOpen` once the cooldown has elapsed
    fn maybe_transition_to_half_open(&self) -> bool {
        if !self.cooldown_elapsed() {
            return false;
        }
        if self
            .state
            .compare_exchange(OPEN, HALF_OPEN_UNTRIED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            self.last_transition_ms
                .store(self.now_millis(), Ordering::Release);
            tracing::info!(circuit = %self.key, "Circuit breaker transitioning to half-open");
            return true;
        }
        false
    }

    fn on_success(&self, probe: bool) {
        if probe {
            if self
                .state
                .compare_exchange(HALF_OPEN_IN_FLIGHT, CLOSED, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                self.transition_to_closed();
            }
        } else if self.state.load(Ordering::Acquire) == CLOSED {
            self.recent_failures.lock().clear();
        }
    }

    fn on_failure(&self, probe: bool) {
        if probe {
            if self
                .state
                .compare_exchange(HALF_OPEN_IN_FLIGHT, OPEN, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                let opens = self.opens.fetch_add(1, Ordering::AcqRel) + 1;
                self.last_transition_ms
                    .store(self.now_millis(), Ordering::Release);
                tracing::warn!(
                    circuit = %self.key,
                    cooldown_ms = self.config.cooldown_for(opens).as_millis() as u64,
                    "Half-open probe failed, circuit reopened"
                );
            }
            return;
        }

        if self.state.load(Ordering::Acquire) != CLOSED {
            return;
        }

        let failures = self.count_failure();
        if failures >= self.config.failure_threshold
            && self
                .state
                .compare_exchange(CLOSED, OPEN, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        {
            self.opens.store(1, Ordering::Release);
            self.last_transition_ms
                .store(self.now_millis(), Ordering::Release);
            tracing::warn!(
                circuit = %self.key,
                failures,
                "Circuit breaker opened"
            );
        }
    }

    /// Record a failure and return how many fall inside the rolling window
    fn count_failure(&self) -> u32 {
        let now = self.now_millis();
        let capacity = self.config.failure_threshold.max(1) as usize;

        let mut recent = self.recent_failures.lock();
        self.prune_expired(&mut recent, now);
        if recent.len() == capacity {
            recent.pop_front();
        }
        recent.push_back(now);
        u32::try_from(recent.len()).unwrap_or(u32::MAX)
    }

    fn prune_expired(&self, recent: &mut VecDeque<u64>, now: u64) {
        let window_ms = u64::try_from(self.config.window().as_millis()).unwrap_or(u64::MAX);
        while recent
            .front()
            .is_some_and(|&at| now.saturating_sub(at) > window_ms)
        {
            recent.pop_front();
        }
    }

    /// Failures currently inside the rolling window
    fn failures_in_window(&self) -> u32 {
        let mut recent = self.recent_failures.lock();
        self.prune_expired(&mut recent, self.now_millis());
        u32::try_from(recent.len()).unwrap_or(u32::MAX)
    }

    fn transition_to_closed(&self) {
        self.recent_failures.lock().clear();
        self.opens.store(0, Ordering::Release);
        self.last_transition_ms
            .store(self.now_millis(), Ordering::Release);

        tracing::info!(circuit = %self.key, "Circuit breaker closed, provider recovered");
    }

    /// A probe permit was dropped without an outcome; free the slot
    fn release_probe(&self) {
        let _ = self.state.compare_exchange(
            HALF_OPEN_IN_FLIGHT,
            HALF_OPEN_UNTRIED,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    /// Force a specific state (administrative override)
    pub fn force_state(&self, state: CircuitState) {
        let raw = match state {
            CircuitState::Closed => CLOSED,
            CircuitState::Open => OPEN,
            CircuitState::HalfOpen => HALF_OPEN_UNTRIED,
        };
        self.state.store(raw, Ordering::Release);
        if state == CircuitState::Open && self.opens.load(Ordering::Acquire) == 0 {
            self.opens.store(1, Ordering::Release);
        }
        if state == CircuitState::Closed {
            self.recent_failures.lock().clear();
            self.opens.store(0, Ordering::Release);
        }
        self.last_transition_ms
            .store(self.now_millis(), Ordering::Release);
        tracing::info!(circuit = %self.key, ?state, "Circuit state forced");
    }

    /// Return to a fresh closed breaker
    pub fn reset(&self) {
        self.state.store(CLOSED, Ordering::Release);
        self.recent_failures.lock().clear();
        self.opens.store(0, Ordering::Release);
        self.rejections.store(0, Ordering::Release);
        self.last_transition_ms
            .store(self.now_millis(), Ordering::Release);
    }

    fn now_millis(&self) -> u64 {
        u64::try_from(self.epoch.elapsed().as_millis()).unwrap_or(u64::MAX)
    }

    #[must_use]
    pub fn snapshot(&self) -> CircuitSnapshot {
        CircuitSnapshot {
            key: self.key.clone(),
            state: self.state(),
            failures: self.failures_in_window(),
            opens: self.opens.load(Ordering::Relaxed),
            rejections: self.rejections.load(Ordering::Relaxed),
            since_transition: Duration::from_millis(
                self.now_millis()
                    .saturating_sub(self.last_transition_ms.load(Ordering::Relaxed)),
            ),
        }
    }
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("key", &self.key)
            .field("state", &self.state())
            .field("failures", &self.failures_in_window())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Permit
// ============================================================================

/// Permission for one attempt through a breaker
///
/// Report the outcome with [`record_success`](Self::record_success) or
/// [`record_failure`](Self::record_failure). Dropping an unsettled probe
/// permit (for example on cancellation) frees the half-open slot.
#[must_use = "report the attempt outcome through the permit"]
pub struct CircuitPermit {
    breaker: Arc<CircuitBreaker>,
    probe: bool,
    settled: bool,
}

impl CircuitPermit {
    fn new(breaker: Arc<CircuitBreaker>, probe: bool) -> Self {
        Self {
            breaker,
            probe,
            settled: false,
        }
    }

    /// Whether this permit is the half-open probe
    #[must_use]
    pub fn is_probe(&self) -> bool {
        self.probe
    }

    pub fn record_success(mut self) {
        self.settled = true;
        self.breaker.on_success(self.probe);
    }

    pub fn record_failure(mut self) {
        self.settled = true;
        self.breaker.on_failure(self.probe);
    }
}

impl Drop for CircuitPermit {
    fn drop(&mut self) {
        if !self.settled && self.probe {
            self.breaker.release_probe();
        }
    }
}

// ============================================================================
// Snapshots and Registry
// ============================================================================

/// Point-in-time breaker state for observability
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CircuitSnapshot {
    pub key: ModelKey,
    pub state: CircuitState,
    pub failures: u32,
    pub opens: u32,
    pub rejections: u64,
    pub since_transition: Duration,
}

/// Read-only availability view used by the routing engine
pub trait CircuitView: Send + Sync {
    /// Whether an attempt against `key` would currently be let through
    fn is_available(&self, key: &ModelKey) -> bool;
}

/// All breakers, keyed by provider/model pair
#[derive(Debug, Default)]
pub struct CircuitBreakerRegistry {
    config: CircuitBreakerConfig,
    breakers: DashMap<ModelKey, Arc<CircuitBreaker>>,
}

impl CircuitBreakerRegistry {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            breakers: DashMap::new(),
        }
    }

    #[must_use]
    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    pub fn get(&self, key: &ModelKey) -> Option<Arc<CircuitBreaker>> {
        self.breakers.get(key).map(|b| Arc::clone(b.value()))
    }

    pub fn get_or_create(&self, key: &ModelKey) -> Arc<CircuitBreaker> {
        if let Some(breaker) = self.get(key) {
            return breaker;
        }
        Arc::clone(
            self.breakers
                .entry(key.clone())
                .or_insert_with(|| Arc::new(CircuitBreaker::new(key.clone(), self.config.clone())))
                .value(),
        )
    }

    #[must_use]
    pub fn state(&self, key: &ModelKey) -> CircuitState {
        self.get(key).map_or(CircuitState::Closed, |b| b.state())
    }

    /// Whether any model of `provider` would accept an attempt
    #[must_use]
    pub fn provider_available(&self, provider: &str) -> bool {
        let mut seen = false;
        for entry in self.breakers.iter() {
            if entry.key().provider == provider {
                seen = true;
                if entry.value().is_available() {
                    return true;
                }
            }
        }
        !seen
    }

    /// Snapshots of every breaker, sorted by key
    #[must_use]
    pub fn snapshots(&self) -> Vec<CircuitSnapshot> {
        let mut snapshots: Vec<CircuitSnapshot> =
            self.breakers.iter().map(|b| b.value().snapshot()).collect();
        snapshots.sort_by(|a, b| a.key.cmp(&b.key));
        snapshots
    }

    pub fn reset_all(&self) {
        for entry in self.breakers.iter() {
            entry.value().reset();
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.breakers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.breakers.is_empty()
    }
}

impl CircuitView for CircuitBreakerRegistry {
    fn is_available(&self, key: &ModelKey) -> bool {
        self.get(key).map_or(true, |b| b.is_available())
    }
}
