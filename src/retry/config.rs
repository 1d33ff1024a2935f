//! Retry policy configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Error message patterns that indicate a transient failure.
pub const DEFAULT_RETRYABLE_PATTERNS: &[&str] = &[
    r"rate.?limit",
    r"too many requests",
    r"\b429\b",
    r"\b5\d\d\b",
    r"overloaded",
    r"timed? ?out",
    r"timeout",
    r"ECONNRESET",
    r"ETIMEDOUT",
    r"ECONNREFUSED",
    r"socket hang up",
    r"connection reset",
    r"network",
    r"temporarily unavailable",
];

/// Error message patterns that must never be retried.
pub const DEFAULT_NON_RETRYABLE_PATTERNS: &[&str] = &[
    r"\b401\b",
    r"\b403\b",
    r"\b404\b",
    r"unauthori[sz]ed",
    r"forbidden",
    r"permission denied",
    r"invalid api key",
    r"authentication",
    r"not found",
];

/// Configuration for [`super::execute_with_retry`].
///
/// `max_retries` counts retries after the first attempt, so a call is tried
/// at most `max_retries + 1` times.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub exponential_backoff: bool,
    /// Symmetric jitter as a fraction of the computed delay (0.0 - 1.0).
    pub jitter_factor: f64,
    pub retryable_patterns: Vec<String>,
    /// Checked first; a match here wins over any retryable pattern.
    pub non_retryable_patterns: Vec<String>,
    /// Retry every failure regardless of patterns.
    pub retry_on_any_failure: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
            exponential_backoff: true,
            jitter_factor: 0.1,
            retryable_patterns: to_owned(DEFAULT_RETRYABLE_PATTERNS),
            non_retryable_patterns: to_owned(DEFAULT_NON_RETRYABLE_PATTERNS),
            retry_on_any_failure: false,
        }
    }
}

impl RetryConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Policy for agent sessions: slow, capped exponential backoff.
    pub fn agent_default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 2_000,
            max_delay_ms: 60_000,
            jitter_factor: 0.2,
            ..Self::default()
        }
    }

    /// Policy for AI-assisted conflict resolution during merges.
    pub fn merge_default() -> Self {
        Self {
            max_retries: 2,
            base_delay_ms: 1_000,
            max_delay_ms: 10_000,
            ..Self::default()
        }
    }

    /// A policy that makes a single attempt.
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay_ms = delay.as_millis() as u64;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay_ms = delay.as_millis() as u64;
        self
    }

    pub fn with_exponential_backoff(mut self, enabled: bool) -> Self {
        self.exponential_backoff = enabled;
        self
    }

    pub fn with_jitter_factor(mut self, factor: f64) -> Self {
        self.jitter_factor = factor;
        self
    }

    pub fn with_retry_on_any_failure(mut self, enabled: bool) -> Self {
        self.retry_on_any_failure = enabled;
        self
    }

    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

fn to_owned(patterns: &[&str]) -> Vec<String> {
    patterns.iter().map(|p| p.to_string()).collect()
}
