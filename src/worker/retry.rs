//! Bounded retry with exponential backoff for failed requests.
//!
//! A failed request is classified into a [`FailureType`]. Transient and
//! rate-limited failures are requeued after a backoff delay until the policy's
//! attempt budget is spent; everything else is dropped and the requester is
//! told. A `Retry-After` value sent by the provider replaces the computed
//! delay for that attempt.
//!
//! # Example
//!
//! ```
//! use relay_core::provider::ProviderError;
//! use relay_core::worker::{RelayError, RetryDecision, RetryPolicy, classify_error};
//!
//! let policy = RetryPolicy::default();
//! let error = RelayError::from(ProviderError::http_status("https://api.example/v1/disk/", 503));
//!
//! match policy.should_retry(classify_error(&error), 1) {
//!     RetryDecision::Retry { delay, attempt } => println!("attempt {attempt} in {delay:?}"),
//!     RetryDecision::DoNotRetry { reason } => println!("dropping: {reason}"),
//! }
//! ```

use std::time::Duration;

use rand::Rng;
use tracing::{debug, instrument};

use super::RelayError;
use crate::delivery::DeliveryError;
use crate::provider::ProviderError;

/// Default attempts per request, including the first.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Default delay before the first requeue.
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(10);

/// Default cap on any single delay.
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(300);

const DEFAULT_BACKOFF_MULTIPLIER: f32 = 2.0;

const MAX_JITTER: Duration = Duration::from_millis(500);

/// Classification of a request failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureType {
    /// Connectivity problem or server-side error that may clear up.
    Transient,

    /// The provider or recipient asked us to slow down.
    RateLimited,

    /// Retrying would not change the outcome.
    Permanent,
}

/// Whether and when to retry a failed request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Requeue after `delay`; `attempt` is the number the next try will carry.
    Retry {
        /// How long to wait before requeueing.
        delay: Duration,
        /// 1-indexed number of the upcoming attempt.
        attempt: u32,
    },

    /// Drop the request.
    DoNotRetry {
        /// Why the request is not retried.
        reason: String,
    },
}

/// Retry budget and backoff shape.
///
/// ```text
/// delay = min(base_delay * multiplier^(attempt - 1), max_delay) + jitter
/// ```
///
/// With defaults the delays are roughly 10s, 20s, 40s, 80s before the fifth
/// failure drops the request.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_delay: Duration,
    max_delay: Duration,
    backoff_multiplier: f32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay: DEFAULT_BASE_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
            backoff_multiplier: DEFAULT_BACKOFF_MULTIPLIER,
        }
    }
}

impl RetryPolicy {
    /// Creates a policy. `max_attempts` is clamped to at least 1.
    #[must_use]
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay,
            backoff_multiplier: DEFAULT_BACKOFF_MULTIPLIER,
        }
    }

    /// Returns the maximum number of attempts configured.
    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Decides what to do after attempt number `attempt` (1-indexed) failed.
    #[instrument(skip(self), fields(max_attempts = self.max_attempts))]
    pub fn should_retry(&self, failure_type: FailureType, attempt: u32) -> RetryDecision {
        if failure_type == FailureType::Permanent {
            return RetryDecision::DoNotRetry {
                reason: "permanent failure".to_string(),
            };
        }

        if attempt >= self.max_attempts {
            debug!(attempt, "max attempts reached");
            return RetryDecision::DoNotRetry {
                reason: format!("max attempts ({}) exhausted", self.max_attempts),
            };
        }

        let delay = self.calculate_delay(attempt);
        debug!(
            attempt,
            next_attempt = attempt + 1,
            delay_ms = delay.as_millis(),
            "will retry"
        );

        RetryDecision::Retry {
            delay,
            attempt: attempt + 1,
        }
    }

    /// Like [`should_retry`](Self::should_retry) for a concrete error, letting
    /// a server-sent `Retry-After` replace the computed delay.
    #[must_use]
    pub fn decide(&self, error: &RelayError, attempt: u32) -> RetryDecision {
        match self.should_retry(classify_error(error), attempt) {
            RetryDecision::Retry { delay, attempt } => RetryDecision::Retry {
                delay: error.retry_after().unwrap_or(delay),
                attempt,
            },
            decision @ RetryDecision::DoNotRetry { .. } => decision,
        }
    }

    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::cast_precision_loss
    )]
    fn calculate_delay(&self, attempt: u32) -> Duration {
        let base_ms = self.base_delay.as_millis() as f64;
        let exponent = f64::from(attempt.saturating_sub(1));
        let delay_ms = base_ms * f64::from(self.backoff_multiplier).powf(exponent);
        let capped_ms = delay_ms.min(self.max_delay.as_millis() as f64);

        Duration::from_millis(capped_ms as u64) + calculate_jitter()
    }
}

#[allow(clippy::cast_possible_truncation)]
fn calculate_jitter() -> Duration {
    let mut rng = rand::thread_rng();
    Duration::from_millis(rng.gen_range(0..=MAX_JITTER.as_millis() as u64))
}

/// Classifies a request failure for retry decisions.
///
/// | Error | Type |
/// |-------|------|
/// | provider HTTP 408, 5xx | Transient |
/// | provider HTTP 429 | RateLimited |
/// | provider timeout, non-TLS network error | Transient |
/// | provider operation failed or timed out | Permanent |
/// | delivery timeout, non-TLS network error, API 5xx | Transient |
/// | delivery API 429 | RateLimited |
/// | anything else | Permanent |
#[instrument]
pub fn classify_error(error: &RelayError) -> FailureType {
    match error {
        RelayError::Provider(provider) => classify_provider_error(provider),
        RelayError::Delivery(delivery) => classify_delivery_error(delivery),
        RelayError::Cache(_)
        | RelayError::Archive(_)
        | RelayError::Stats(_)
        | RelayError::Io { .. }
        | RelayError::NotAFile { .. }
        | RelayError::Blocking(_) => FailureType::Permanent,
    }
}

fn classify_provider_error(error: &ProviderError) -> FailureType {
    match error {
        ProviderError::HttpStatus { status, .. } => classify_http_status(*status),
        ProviderError::Timeout { .. } => FailureType::Transient,
        ProviderError::Network { source, .. } => classify_network(source),
        ProviderError::Malformed { .. }
        | ProviderError::InvalidUrl { .. }
        | ProviderError::OperationFailed { .. }
        | ProviderError::OperationTimedOut { .. }
        | ProviderError::Io { .. }
        | ProviderError::Client(_) => FailureType::Permanent,
    }
}

fn classify_delivery_error(error: &DeliveryError) -> FailureType {
    match error {
        DeliveryError::Api { status, .. } => classify_http_status(*status),
        DeliveryError::Timeout { .. } => FailureType::Transient,
        DeliveryError::Network { source, .. } => classify_network(source),
        DeliveryError::Malformed { .. } | DeliveryError::Io { .. } | DeliveryError::Client(_) => {
            FailureType::Permanent
        }
    }
}

#[allow(clippy::match_same_arms)]
fn classify_http_status(status: u16) -> FailureType {
    match status {
        408 => FailureType::Transient,
        429 => FailureType::RateLimited,
        500..=599 => FailureType::Transient,
        _ => FailureType::Permanent,
    }
}

fn classify_network(error: &reqwest::Error) -> FailureType {
    if is_tls_error(error) {
        FailureType::Permanent
    } else {
        FailureType::Transient
    }
}

fn is_tls_error(error: &reqwest::Error) -> bool {
    let error_string = error.to_string().to_lowercase();
    error_string.contains("certificate")
        || error_string.contains("tls")
        || error_string.contains("ssl")
        || error_string.contains("handshake")
}
