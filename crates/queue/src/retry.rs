//! Failure classification and exponential backoff.

use std::time::Duration;

use herald_common::DeliveryConfig;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use tracing::debug;

use crate::error::TransportError;
use crate::message::Message;
use crate::rate_limit::{RateLimiter, SAFETY_BUFFER};

/// Shortest delay ever returned for a retry.
pub const MIN_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Platform codes that no retry can fix: unknown resources and missing
/// permissions.
const NON_RETRYABLE_CODES: &[i64] = &[
    10003, // Unknown channel
    10004, // Unknown guild
    10008, // Unknown message
    10013, // Unknown user
    50001, // Missing access
    50007, // Cannot message this user
    50013, // Missing permissions
    50035, // Invalid form body
];

/// Network failures worth another attempt.
const RETRYABLE_NETWORK_CODES: &[&str] = &[
    "ECONNRESET",
    "ETIMEDOUT",
    "ENOTFOUND",
    "ECONNREFUSED",
    "EPIPE",
];

const RETRYABLE_STATUSES: &[u16] = &[500, 502, 503, 504];

/// Lower-case fragments that mark an error message as transient.
const RETRYABLE_MESSAGE_PATTERNS: &[&str] = &[
    "timeout",
    "connection reset",
    "connection refused",
    "network error",
    "temporary failure",
    "service unavailable",
    "internal server error",
    "bad gateway",
    "gateway timeout",
];

/// Retry policy with exponential backoff.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of retry attempts.
    pub max_retries: u32,
    /// Delay before the first retry.
    pub base_retry_delay: Duration,
    /// Multiplier for exponential backoff.
    pub backoff_multiplier: f64,
    /// Upper bound for any retry delay.
    pub max_backoff_delay: Duration,
    /// Whether to randomize delays.
    pub jitter_enabled: bool,
    /// Proportional jitter width.
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_retry_delay: Duration::from_secs(1),
            backoff_multiplier: 2.0,
            max_backoff_delay: Duration::from_secs(30),
            jitter_enabled: true,
            jitter_factor: 0.1,
        }
    }
}

impl From<&DeliveryConfig> for RetryPolicy {
    fn from(config: &DeliveryConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            base_retry_delay: Duration::from_millis(config.base_retry_delay_ms),
            backoff_multiplier: config.backoff_multiplier,
            max_backoff_delay: Duration::from_millis(config.max_backoff_delay_ms),
            jitter_enabled: config.jitter_enabled,
            jitter_factor: config.jitter_factor,
        }
    }
}

/// Running delay statistics shared by the retry handler and rate limiter.
#[derive(Debug, Clone, Default)]
pub(crate) struct DelayTracker {
    average_ms: f64,
    max_ms: u64,
}

impl DelayTracker {
    /// Fold one applied delay into the statistics.
    ///
    /// `observations` is the owner's event count including this one; the
    /// mean stays at zero while it is zero.
    pub(crate) fn observe(&mut self, delay: Duration, observations: u64) {
        let ms = delay.as_millis() as u64;
        self.max_ms = self.max_ms.max(ms);
        if observations > 0 {
            let n = observations as f64;
            self.average_ms = self.average_ms.mul_add(n - 1.0, ms as f64) / n;
        }
    }

    pub(crate) const fn average_ms(&self) -> f64 {
        self.average_ms
    }

    pub(crate) const fn max_ms(&self) -> u64 {
        self.max_ms
    }
}

/// Retry counters.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryMetrics {
    /// Retry decisions made.
    pub total_retry_attempts: u64,
    /// Retried messages that eventually succeeded.
    pub successful_retries: u64,
    /// Retried messages that eventually failed.
    pub failed_retries: u64,
    /// Mean computed delay, in milliseconds.
    pub average_retry_delay_ms: f64,
    /// Longest computed delay, in milliseconds.
    pub max_retry_delay_ms: u64,
    /// Successful retries as a percentage of attempts.
    pub success_rate: f64,
    /// Policy in effect.
    pub max_retries: u32,
    /// Policy in effect.
    pub base_retry_delay_ms: u64,
    /// Policy in effect.
    pub max_backoff_delay_ms: u64,
    /// Policy in effect.
    pub jitter_enabled: bool,
}

/// Outcome of [`RetryHandler::handle_retry`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryDecision {
    /// Whether the message should be attempted again.
    pub should_retry: bool,
    /// Delay before the next attempt. Computed even when not retrying.
    pub retry_delay: Duration,
    /// The message's retry count after this decision.
    pub retry_count: u32,
    /// Policy limit.
    pub max_retries: u32,
}

/// Decides retry-or-fail and computes backoff delays.
#[derive(Debug)]
pub struct RetryHandler {
    policy: RetryPolicy,
    rng: StdRng,
    total_retry_attempts: u64,
    successful_retries: u64,
    failed_retries: u64,
    delays: DelayTracker,
}

impl RetryHandler {
    /// Create a handler with the given policy.
    #[must_use]
    pub fn new(policy: RetryPolicy) -> Self {
        Self::with_rng(policy, StdRng::from_entropy())
    }

    /// Create a handler with a fixed jitter source.
    #[must_use]
    pub fn with_rng(policy: RetryPolicy, rng: StdRng) -> Self {
        Self {
            policy,
            rng,
            total_retry_attempts: 0,
            successful_retries: 0,
            failed_retries: 0,
            delays: DelayTracker::default(),
        }
    }

    /// Policy in effect.
    #[must_use]
    pub const fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Whether a failure after `retry_count` retries deserves another attempt.
    #[must_use]
    pub fn should_retry(&self, error: &TransportError, retry_count: u32) -> bool {
        if retry_count >= self.policy.max_retries {
            return false;
        }

        if let Some(code) = error.code.as_ref().and_then(|code| code.as_number()) {
            if NON_RETRYABLE_CODES.contains(&code) {
                return false;
            }
        }

        if RateLimiter::is_rate_limit_error(error) || error.retryable {
            return true;
        }

        if let Some(name) = error.code.as_ref().and_then(|code| code.as_name()) {
            if RETRYABLE_NETWORK_CODES.contains(&name) {
                return true;
            }
        }

        if RETRYABLE_STATUSES
            .iter()
            .any(|status| error.has_status_or_code(*status))
        {
            return true;
        }

        Self::has_retryable_message(&error.message)
    }

    /// Whether `text` mentions a transient failure.
    #[must_use]
    pub fn has_retryable_message(text: &str) -> bool {
        let text = text.to_lowercase();
        RETRYABLE_MESSAGE_PATTERNS
            .iter()
            .any(|pattern| text.contains(pattern))
    }

    /// Delay before retry number `retry_count`.
    ///
    /// A retry hint on the error wins over exponential backoff. Otherwise the
    /// delay is `base * multiplier^(retry_count - 1)`, capped at
    /// `max_backoff_delay`, with optional jitter applied to the capped value.
    /// The result is always within `[MIN_RETRY_DELAY, max_backoff_delay]`, so
    /// once the cap is reached jitter can only shorten the delay.
    pub fn calculate_retry_delay(
        &mut self,
        retry_count: u32,
        error: Option<&TransportError>,
    ) -> Duration {
        let max_ms = self.policy.max_backoff_delay.as_millis() as f64;

        let delay_ms = if let Some(seconds) = error.and_then(TransportError::retry_after_secs) {
            (seconds * 1000.0 + SAFETY_BUFFER.as_millis() as f64).min(max_ms)
        } else {
            let exponent = i32::try_from(retry_count).unwrap_or(i32::MAX) - 1;
            let base = self.policy.base_retry_delay.as_millis() as f64
                * self.policy.backoff_multiplier.powi(exponent);
            let mut delay = base.min(max_ms).max(MIN_RETRY_DELAY.as_millis() as f64);
            if self.policy.jitter_enabled {
                let spread = self.rng.gen_range(0.0..1.0) - 0.5;
                delay += delay * self.policy.jitter_factor * spread;
            }
            delay
        };

        let delay_ms = delay_ms
            .max(MIN_RETRY_DELAY.as_millis() as f64)
            .min(max_ms.max(MIN_RETRY_DELAY.as_millis() as f64));
        let delay = Duration::from_millis(delay_ms.round() as u64);

        self.delays.observe(delay, self.total_retry_attempts);
        delay
    }

    /// Record a failed attempt on `message` and decide what happens next.
    pub fn handle_retry(&mut self, message: &mut Message, error: &TransportError) -> RetryDecision {
        self.total_retry_attempts += 1;
        message.record_retry(error);

        let retry_count = message.retry_count();
        let should_retry = self.should_retry(error, retry_count);
        let retry_delay = self.calculate_retry_delay(retry_count, Some(error));

        debug!(
            message_id = %message.id(),
            retry_count,
            should_retry,
            delay_ms = retry_delay.as_millis() as u64,
            "Retry decision"
        );

        RetryDecision {
            should_retry,
            retry_delay,
            retry_count,
            max_retries: self.policy.max_retries,
        }
    }

    /// A retried message eventually went through.
    pub fn mark_retry_success(&mut self) {
        self.successful_retries += 1;
    }

    /// A retried message eventually gave up.
    pub fn mark_retry_failure(&mut self) {
        self.failed_retries += 1;
    }

    /// Wrap `message` in an error that is always classified as retryable.
    #[must_use]
    pub fn create_retryable_error(message: &str, retry_after: Duration) -> TransportError {
        TransportError {
            message: message.to_string(),
            retry_after: Some(retry_after.as_secs_f64()),
            retryable: true,
            original: Some(Box::new(TransportError::new(message))),
            ..TransportError::default()
        }
    }

    /// Get a snapshot of the counters.
    #[must_use]
    pub fn metrics(&self) -> RetryMetrics {
        let success_rate = if self.total_retry_attempts > 0 {
            self.successful_retries as f64 / self.total_retry_attempts as f64 * 100.0
        } else {
            0.0
        };

        RetryMetrics {
            total_retry_attempts: self.total_retry_attempts,
            successful_retries: self.successful_retries,
            failed_retries: self.failed_retries,
            average_retry_delay_ms: self.delays.average_ms(),
            max_retry_delay_ms: self.delays.max_ms(),
            success_rate,
            max_retries: self.policy.max_retries,
            base_retry_delay_ms: self.policy.base_retry_delay.as_millis() as u64,
            max_backoff_delay_ms: self.policy.max_backoff_delay.as_millis() as u64,
            jitter_enabled: self.policy.jitter_enabled,
        }
    }

    /// Zero all counters.
    pub fn reset_metrics(&mut self) {
        self.total_retry_attempts = 0;
        self.successful_retries = 0;
        self.failed_retries = 0;
        self.delays = DelayTracker::default();
    }
}
