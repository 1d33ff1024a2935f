//! Bounded retry with backoff around a single call site.

use std::fmt;
use std::future::Future;
use std::time::{Duration, Instant};

use rand::Rng;
use thiserror::Error;
use tracing::{debug, warn};

use super::classify::ErrorClassifier;
use super::config::RetryConfig;
use crate::cancel::CancelSignal;

/// Why a retried call ultimately failed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RetryError {
    /// The error matched no retryable pattern (or a non-retryable one).
    #[error("{message}")]
    NonRetryable { message: String },

    /// Every allowed attempt failed with a retryable error.
    #[error("gave up after {attempts} attempts: {message}")]
    Exhausted { attempts: u32, message: String },

    /// Cancellation was requested; carries the last error seen, if any.
    #[error("cancelled: {message}")]
    Cancelled { message: String },

    /// The configured patterns could not be compiled.
    #[error("invalid retry pattern: {0}")]
    InvalidPattern(String),
}

impl RetryError {
    /// The underlying error message without the retry framing.
    pub fn message(&self) -> &str {
        match self {
            RetryError::NonRetryable { message }
            | RetryError::Exhausted { message, .. }
            | RetryError::Cancelled { message } => message,
            RetryError::InvalidPattern(message) => message,
        }
    }
}

/// One attempt made by [`execute_with_retry`].
#[derive(Debug, Clone, PartialEq)]
pub struct AttemptRecord {
    /// 1-based attempt number.
    pub attempt: u32,
    pub duration: Duration,
    pub error: Option<String>,
    /// Backoff slept after this attempt, if another attempt followed.
    pub delay: Option<Duration>,
}

/// Result of a retried call plus its attempt history.
#[derive(Debug)]
pub struct RetryOutcome<T> {
    pub result: Result<T, RetryError>,
    pub attempts: Vec<AttemptRecord>,
}

impl<T> RetryOutcome<T> {
    pub fn success(&self) -> bool {
        self.result.is_ok()
    }

    pub fn attempt_count(&self) -> u32 {
        self.attempts.len() as u32
    }

    pub fn into_result(self) -> Result<T, RetryError> {
        self.result
    }
}

/// Delay after attempt `attempt` (1-based) for a given jitter sample in
/// `[-1.0, 1.0]`.
///
/// `exponential ? base * 2^(a-1) : base * a`, plus `±delay * jitter_factor`,
/// clamped to `[0, max_delay]`.
pub fn backoff_delay(config: &RetryConfig, attempt: u32, jitter_sample: f64) -> Duration {
    let attempt = attempt.max(1);
    let base = config.base_delay_ms as f64;
    let raw = if config.exponential_backoff {
        base * 2f64.powi(attempt.saturating_sub(1).min(i32::MAX as u32) as i32)
    } else {
        base * attempt as f64
    };
    let raw = if raw.is_finite() { raw } else { f64::MAX };
    let jitter = raw * config.jitter_factor * jitter_sample.clamp(-1.0, 1.0);
    let millis = (raw + jitter).clamp(0.0, config.max_delay_ms as f64);
    Duration::from_millis(millis as u64)
}

/// Delay after `attempt` with a random jitter sample.
pub fn sample_delay(config: &RetryConfig, attempt: u32) -> Duration {
    let sample = if config.jitter_factor > 0.0 {
        rand::thread_rng().gen_range(-1.0..=1.0)
    } else {
        0.0
    };
    backoff_delay(config, attempt, sample)
}

/// Run `op` until it succeeds, fails with a non-retryable error, exhausts
/// `max_retries`, or `cancel` fires.
///
/// `op` receives the 1-based attempt number. The sleep between attempts is
/// interrupted by cancellation, in which case the last error is returned.
pub async fn execute_with_retry<T, E, F, Fut>(
    config: &RetryConfig,
    cancel: &CancelSignal,
    mut op: F,
) -> RetryOutcome<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: fmt::Display,
{
    let mut attempts = Vec::new();
    let classifier = match ErrorClassifier::from_config(config) {
        Ok(classifier) => classifier,
        Err(err) => {
            return RetryOutcome {
                result: Err(RetryError::InvalidPattern(err.to_string())),
                attempts,
            }
        }
    };

    let mut cancel = cancel.clone();
    let max_attempts = config.max_retries.saturating_add(1);
    let mut last_error = String::from("cancelled before first attempt");

    for attempt in 1..=max_attempts {
        if cancel.is_cancelled() {
            return RetryOutcome {
                result: Err(RetryError::Cancelled {
                    message: last_error,
                }),
                attempts,
            };
        }

        let started = Instant::now();
        let error = match op(attempt).await {
            Ok(value) => {
                attempts.push(AttemptRecord {
                    attempt,
                    duration: started.elapsed(),
                    error: None,
                    delay: None,
                });
                return RetryOutcome {
                    result: Ok(value),
                    attempts,
                };
            }
            Err(err) => err.to_string(),
        };
        let duration = started.elapsed();

        if !classifier.is_retryable(&error) {
            debug!(attempt, error = %error, "non-retryable failure");
            attempts.push(AttemptRecord {
                attempt,
                duration,
                error: Some(error.clone()),
                delay: None,
            });
            return RetryOutcome {
                result: Err(RetryError::NonRetryable { message: error }),
                attempts,
            };
        }

        if attempt == max_attempts {
            attempts.push(AttemptRecord {
                attempt,
                duration,
                error: Some(error.clone()),
                delay: None,
            });
            warn!(attempts = attempt, error = %error, "retries exhausted");
            return RetryOutcome {
                result: Err(RetryError::Exhausted {
                    attempts: attempt,
                    message: error,
                }),
                attempts,
            };
        }

        let delay = sample_delay(config, attempt);
        debug!(
            attempt,
            delay_ms = delay.as_millis() as u64,
            error = %error,
            "retryable failure, backing off"
        );
        attempts.push(AttemptRecord {
            attempt,
            duration,
            error: Some(error.clone()),
            delay: Some(delay),
        });
        last_error = error;

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = cancel.cancelled() => {
                return RetryOutcome {
                    result: Err(RetryError::Cancelled { message: last_error }),
                    attempts,
                };
            }
        }
    }

    RetryOutcome {
        result: Err(RetryError::Exhausted {
            attempts: max_attempts,
            message: last_error,
        }),
        attempts,
    }
}
