//! Pattern-based classification of error messages.

use regex::{RegexSet, RegexSetBuilder};

use super::config::RetryConfig;

/// Whether a failure should be retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Retryable,
    NonRetryable,
}

/// Compiled retry/non-retry pattern sets.
///
/// Patterns are matched case-insensitively against the error message.
#[derive(Debug, Clone)]
pub struct ErrorClassifier {
    retryable: RegexSet,
    non_retryable: RegexSet,
    retry_on_any_failure: bool,
}

impl ErrorClassifier {
    pub fn new(
        retryable: &[String],
        non_retryable: &[String],
        retry_on_any_failure: bool,
    ) -> Result<Self, regex::Error> {
        Ok(Self {
            retryable: build_set(retryable)?,
            non_retryable: build_set(non_retryable)?,
            retry_on_any_failure,
        })
    }

    pub fn from_config(config: &RetryConfig) -> Result<Self, regex::Error> {
        Self::new(
            &config.retryable_patterns,
            &config.non_retryable_patterns,
            config.retry_on_any_failure,
        )
    }

    /// Classify an error message.
    ///
    /// Non-retryable patterns take precedence over retryable ones, unless
    /// `retry_on_any_failure` is set.
    pub fn classify(&self, message: &str) -> ErrorClass {
        if self.retry_on_any_failure {
            return ErrorClass::Retryable;
        }
        if self.non_retryable.is_match(message) {
            return ErrorClass::NonRetryable;
        }
        if self.retryable.is_match(message) {
            ErrorClass::Retryable
        } else {
            ErrorClass::NonRetryable
        }
    }

    pub fn is_retryable(&self, message: &str) -> bool {
        self.classify(message) == ErrorClass::Retryable
    }
}

fn build_set(patterns: &[String]) -> Result<RegexSet, regex::Error> {
    RegexSetBuilder::new(patterns).case_insensitive(true).build()
}
