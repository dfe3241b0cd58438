//! Fallback Rules
//!
//! A fallback rule names, for one model, the ordered substitutes to try and
//! the error codes that justify trying them:
//!
//! ```text
//! Request for gpt-4 fails with PermanentProviderError
//!         |
//!         v
//! rule(gpt-4).error_codes contains PermanentProviderError?
//!         |  yes                               | no
//!         v                                    v
//! next candidate (gpt-4-fallback)       surface the failure
//!         |
//!         v
//! ... until max_fallback_attempts or the candidates run out
//! ```
//!
//! The rule consulted is always the one for the originally requested model,
//! never the rule of whichever candidate just failed.
//!
//! # Features
//!
//! - Rule-set validation: self-references, repeated entries, unknown models
//!   and cycles across rules
//! - Lints for rules that can never fire or can never be fully walked
//! - Per-request attempt tracking that decides which error reaches the caller

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::config::ModelProfile;
use crate::error::{AttemptFailure, ErrorCode, GatewayError};

// ============================================================================
// Rules
// ============================================================================

/// Fallback sequence for one model
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FallbackRule {
    /// Model this rule applies to
    pub model_id: String,

    /// Substitutes, in the order they are tried
    pub fallback_models: Vec<String>,

    /// Failure codes that trigger fallback; empty never triggers
    #[serde(default)]
    pub error_codes: Vec<ErrorCode>,
}

impl FallbackRule {
    pub fn new(model_id: impl Into<String>, fallback_models: Vec<String>) -> Self {
        Self {
            model_id: model_id.into(),
            fallback_models,
            error_codes: Vec::new(),
        }
    }

    #[must_use]
    pub fn on(mut self, codes: impl IntoIterator<Item = ErrorCode>) -> Self {
        self.error_codes.extend(codes);
        self
    }

    /// Whether a failure with `code` should advance to the next candidate
    #[must_use]
    pub fn triggers(&self, code: ErrorCode) -> bool {
        self.error_codes.contains(&code)
    }
}

/// Every configured rule, at most one per model
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FallbackRuleSet(pub Vec<FallbackRule>);

impl FallbackRuleSet {
    #[must_use]
    pub fn get(&self, model_id: &str) -> Option<&FallbackRule> {
        self.0.iter().find(|r| r.model_id == model_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &FallbackRule> {
        self.0.iter()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Validate every rule against the known model ids
    pub fn validate(&self, is_known: impl Fn(&str) -> bool) -> Result<(), FallbackRuleError> {
        let mut seen_rules = HashSet::new();
        for rule in &self.0 {
            if !seen_rules.insert(rule.model_id.as_str()) {
                return Err(FallbackRuleError::DuplicateRule {
                    model: rule.model_id.clone(),
                });
            }
            Self::validate_chain(rule, &is_known)?;
        }
        self.detect_cycles()
    }

    /// Check a single rule for self-references, repeats and unknown models
    fn validate_chain(
        rule: &FallbackRule,
        is_known: &impl Fn(&str) -> bool,
    ) -> Result<(), FallbackRuleError> {
        if !is_known(&rule.model_id) {
            return Err(FallbackRuleError::UnknownModel {
                rule: rule.model_id.clone(),
                model: rule.model_id.clone(),
            });
        }

        let mut seen = HashSet::new();
        for fallback in &rule.fallback_models {
            if *fallback == rule.model_id {
                return Err(FallbackRuleError::SelfReference {
                    model: rule.model_id.clone(),
                });
            }
            if !seen.insert(fallback.as_str()) {
                return Err(FallbackRuleError::DuplicateEntry {
                    rule: rule.model_id.clone(),
                    model: fallback.clone(),
                });
            }
            if !is_known(fallback) {
                return Err(FallbackRuleError::UnknownModel {
                    rule: rule.model_id.clone(),
                    model: fallback.clone(),
                });
            }
        }
        Ok(())
    }

    /// Reject rules that reach back to themselves through other rules
    fn detect_cycles(&self) -> Result<(), FallbackRuleError> {
        let edges: HashMap<&str, Vec<&str>> = self
            .0
            .iter()
            .map(|r| {
                (
                    r.model_id.as_str(),
                    r.fallback_models.iter().map(String::as_str).collect(),
                )
            })
            .collect();

        let mut done: HashSet<&str> = HashSet::new();
        for start in edges.keys().copied() {
            let mut path = Vec::new();
            Self::visit(start, &edges, &mut path, &mut done)?;
        }
        Ok(())
    }

    fn visit<'a>(
        node: &'a str,
        edges: &HashMap<&'a str, Vec<&'a str>>,
        path: &mut Vec<&'a str>,
        done: &mut HashSet<&'a str>,
    ) -> Result<(), FallbackRuleError> {
        if let Some(pos) = path.iter().position(|n| *n == node) {
            let mut cycle: Vec<String> = path[pos..].iter().map(|s| (*s).to_string()).collect();
            cycle.push(node.to_string());
            return Err(FallbackRuleError::CycleDetected { path: cycle });
        }
        if done.contains(node) {
            return Ok(());
        }

        path.push(node);
        for &next in edges.get(node).into_iter().flatten() {
            Self::visit(next, edges, path, done)?;
        }
        path.pop();
        done.insert(node);
        Ok(())
    }
}

// ============================================================================
// Configuration
// ============================================================================

/// Fallback behavior
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FallbackConfig {
    /// Master switch
    pub enabled: bool,

    /// Upper bound on candidates attempted per request, first included
    pub max_fallback_attempts: u32,

    pub rules: FallbackRuleSet,
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_fallback_attempts: 3,
            rules: FallbackRuleSet::default(),
        }
    }
}

impl FallbackConfig {
    #[must_use]
    pub fn with_rule(mut self, rule: FallbackRule) -> Self {
        self.rules.0.push(rule);
        self
    }

    #[must_use]
    pub fn rule_for(&self, model_id: &str) -> Option<&FallbackRule> {
        self.rules.get(model_id)
    }

    /// Candidates that may be attempted for a request keyed by `rule_key`
    ///
    /// Without an applicable rule only the first candidate is tried.
    #[must_use]
    pub fn attempt_limit(&self, rule_key: &str, candidates: usize) -> usize {
        if self.enabled && self.rule_for(rule_key).is_some() {
            candidates.min(self.max_fallback_attempts.max(1) as usize)
        } else {
            candidates.min(1)
        }
    }

    /// Whether a failure with `code` lets the request move to the next candidate
    #[must_use]
    pub fn should_advance(&self, rule_key: &str, code: ErrorCode) -> bool {
        self.enabled && self.rule_for(rule_key).is_some_and(|r| r.triggers(code))
    }

    /// Human-readable warnings about rules that cannot behave as written
    #[must_use]
    pub fn lint(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        let reachable = self.max_fallback_attempts.saturating_sub(1) as usize;
        for rule in self.rules.iter() {
            if rule.error_codes.is_empty() {
                warnings.push(format!(
                    "fallback rule for '{}' has no error codes and never triggers",
                    rule.model_id
                ));
            }
            if rule.fallback_models.len() > reachable {
                warnings.push(format!(
                    "fallback rule for '{}' lists {} substitutes, max_fallback_attempts reaches {}",
                    rule.model_id,
                    rule.fallback_models.len(),
                    reachable
                ));
            }
        }
        warnings
    }
}

// ============================================================================
// Errors
// ============================================================================

/// Invalid fallback rule set
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum FallbackRuleError {
    #[error("More than one fallback rule for model: {model}")]
    DuplicateRule { model: String },

    #[error("Fallback rule for {model} lists itself")]
    SelfReference { model: String },

    #[error("Fallback rule for {rule} lists {model} twice")]
    DuplicateEntry { rule: String, model: String },

    /// A rule mentions a model that is not configured
    #[error("Fallback rule for {rule} references unknown model: {model}")]
    UnknownModel { rule: String, model: String },

    /// Rules reach back to where they started
    #[error("Cycle detected in fallback rules: {}", path.join(" -> "))]
    CycleDetected { path: Vec<String> },
}

// ============================================================================
// Per-Request Tracking
// ============================================================================

/// One candidate attempt, as kept in the decision log
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub model_id: String,
    pub provider: String,

    /// Failure code, `None` for the successful attempt
    pub error: Option<ErrorCode>,

    /// Local retries spent inside the dispatcher
    pub retries: u32,

    pub latency_ms: u64,
}

/// Why the fallback loop stopped without a success
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FallbackStop {
    /// The failure's code is not in the rule's trigger set (or no rule applies)
    NotTriggered,

    /// The attempt limit or the candidate list ran out
    Exhausted,
}

/// Attempts made for one request
#[derive(Clone, Debug)]
pub struct FallbackContext {
    /// Model whose rule governs this request
    pub rule_key: String,

    attempts: Vec<AttemptRecord>,
    failures: Vec<AttemptFailure>,
    last_error: Option<GatewayError>,
}

impl FallbackContext {
    pub fn new(rule_key: impl Into<String>) -> Self {
        Self {
            rule_key: rule_key.into(),
            attempts: Vec::new(),
            failures: Vec::new(),
            last_error: None,
        }
    }

    pub fn record_failure(
        &mut self,
        model: &ModelProfile,
        error: GatewayError,
        retries: u32,
        latency: Duration,
    ) {
        self.attempts.push(AttemptRecord {
            model_id: model.model_id.clone(),
            provider: model.provider.clone(),
            error: Some(error.code()),
            retries,
            latency_ms: millis(latency),
        });
        self.failures
            .push(error.to_attempt_failure(&model.model_id, &model.provider));
        self.last_error = Some(error);
    }

    pub fn record_success(&mut self, model: &ModelProfile, retries: u32, latency: Duration) {
        self.attempts.push(AttemptRecord {
            model_id: model.model_id.clone(),
            provider: model.provider.clone(),
            error: None,
            retries,
            latency_ms: millis(latency),
        });
    }

    #[must_use]
    pub fn has_tried(&self, model_id: &str) -> bool {
        self.attempts.iter().any(|a| a.model_id == model_id)
    }

    #[must_use]
    pub fn attempt_count(&self) -> u32 {
        u32::try_from(self.attempts.len()).unwrap_or(u32::MAX)
    }

    /// Whether anything beyond the first candidate was attempted
    #[must_use]
    pub fn is_fallback(&self) -> bool {
        self.attempts.len() > 1
    }

    /// Code of the most recent failure, which is what moved the request on
    #[must_use]
    pub fn fallback_reason(&self) -> Option<ErrorCode> {
        self.last_error.as_ref().map(GatewayError::code)
    }

    #[must_use]
    pub fn attempts(&self) -> &[AttemptRecord] {
        &self.attempts
    }

    #[must_use]
    pub fn failures(&self) -> &[AttemptFailure] {
        &self.failures
    }

    /// Error to surface when the loop stops without a success
    ///
    /// A stop on a non-triggering failure, or after a single attempt, surfaces
    /// that failure unchanged. Running through more than one candidate
    /// surfaces the aggregate.
    #[must_use]
    pub fn terminal_error(&self, stop: FallbackStop) -> GatewayError {
        let last = self.last_error.clone();
        match (stop, last) {
            (FallbackStop::Exhausted, _) if self.failures.len() > 1 => {
                GatewayError::AllProvidersFailed {
                    failures: self.failures.clone(),
                }
            }
            (_, Some(error)) => error,
            (_, None) => GatewayError::AllProvidersFailed {
                failures: self.failures.clone(),
            },
        }
    }

    pub fn into_attempts(self) -> Vec<AttemptRecord> {
        self.attempts
    }
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}
