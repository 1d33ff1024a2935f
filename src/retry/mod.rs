//! Generic bounded-retry-with-backoff runtime.
//!
//! Every remote call in the pipeline (agent sessions, AI conflict
//! resolution) goes through [`execute_with_retry`]. The runtime wraps exactly
//! one call site and knows nothing about tasks or branches; callers compose
//! it.
//!
//! # Example
//!
//! ```ignore
//! use patchwright::cancel::CancelSignal;
//! use patchwright::retry::{execute_with_retry, RetryConfig};
//!
//! let outcome = execute_with_retry(&RetryConfig::agent_default(), &CancelSignal::never(), |attempt| {
//!     async move { call_remote(attempt).await }
//! })
//! .await;
//! ```

mod classify;
mod config;
mod executor;

pub use classify::{ErrorClass, ErrorClassifier};
pub use config::{RetryConfig, DEFAULT_NON_RETRYABLE_PATTERNS, DEFAULT_RETRYABLE_PATTERNS};
pub use executor::{
    backoff_delay, execute_with_retry, sample_delay, AttemptRecord, RetryError, RetryOutcome,
};
