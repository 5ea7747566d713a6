//! Error types for the delivery pipeline.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use herald_common::AppError;
use serde::Serialize;
use thiserror::Error;

use crate::message::RetryRecord;

/// Platform error code: either a numeric API code or a named OS/network code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum ErrorCode {
    /// Numeric code such as `50013` or `429`.
    Numeric(i64),
    /// Named code such as `ECONNRESET`.
    Named(String),
}

impl ErrorCode {
    /// Numeric value, if this is a numeric code.
    #[must_use]
    pub const fn as_number(&self) -> Option<i64> {
        match self {
            Self::Numeric(code) => Some(*code),
            Self::Named(_) => None,
        }
    }

    /// Name, if this is a named code.
    #[must_use]
    pub fn as_name(&self) -> Option<&str> {
        match self {
            Self::Numeric(_) => None,
            Self::Named(name) => Some(name),
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Numeric(code) => write!(f, "{code}"),
            Self::Named(name) => f.write_str(name),
        }
    }
}

impl From<i64> for ErrorCode {
    fn from(code: i64) -> Self {
        Self::Numeric(code)
    }
}

impl From<i32> for ErrorCode {
    fn from(code: i32) -> Self {
        Self::Numeric(i64::from(code))
    }
}

impl From<&str> for ErrorCode {
    fn from(name: &str) -> Self {
        Self::Named(name.to_string())
    }
}

/// Failure reported by a [`Transport`](crate::Transport).
///
/// Classification by the rate limiter and retry handler reads these fields
/// verbatim.
#[derive(Debug, Clone, Default, Error)]
#[error("{message}")]
pub struct TransportError {
    /// Human readable description.
    pub message: String,
    /// Platform or network error code.
    pub code: Option<ErrorCode>,
    /// HTTP status.
    pub status: Option<u16>,
    /// Client-side retry hint, in seconds.
    pub retry_after: Option<f64>,
    /// Retry hint from the response body, in seconds.
    pub body_retry_after: Option<f64>,
    /// Response headers with lower-cased names.
    pub headers: HashMap<String, String>,
    /// Explicitly tagged as a rate limit signal.
    pub rate_limited: bool,
    /// Explicitly tagged as safe to retry.
    pub retryable: bool,
    /// Wrapped underlying error.
    pub original: Option<Box<TransportError>>,
}

impl TransportError {
    /// Create an error with only a message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Self::default()
        }
    }

    /// Set the error code.
    #[must_use]
    pub fn with_code(mut self, code: impl Into<ErrorCode>) -> Self {
        self.code = Some(code.into());
        self
    }

    /// Set the HTTP status.
    #[must_use]
    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    /// Set the client-side retry hint in seconds.
    #[must_use]
    pub fn with_retry_after(mut self, seconds: f64) -> Self {
        self.retry_after = Some(seconds);
        self
    }

    /// Set the response body retry hint in seconds.
    #[must_use]
    pub fn with_body_retry_after(mut self, seconds: f64) -> Self {
        self.body_retry_after = Some(seconds);
        self
    }

    /// Add a response header. The name is lower-cased.
    #[must_use]
    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
        self
    }

    /// Tag the error as a rate limit signal.
    #[must_use]
    pub fn rate_limited(mut self) -> Self {
        self.rate_limited = true;
        self
    }

    /// Look up a header by case-insensitive name.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    /// Retry hint from either error field, in seconds.
    #[must_use]
    pub fn retry_after_secs(&self) -> Option<f64> {
        self.retry_after.or(self.body_retry_after)
    }

    /// Whether the code or the status equals `value`.
    #[must_use]
    pub fn has_status_or_code(&self, value: u16) -> bool {
        self.status == Some(value)
            || self
                .code
                .as_ref()
                .and_then(ErrorCode::as_number)
                .is_some_and(|code| code == i64::from(value))
    }
}

/// Kind of local rate limit denial.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum RateLimitKind {
    /// Local burst budget exhausted.
    Proactive,
    /// Server-issued cooldown in effect.
    Reactive,
}

impl fmt::Display for RateLimitKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Proactive => f.write_str("proactive"),
            Self::Reactive => f.write_str("reactive"),
        }
    }
}

/// Send attempt denied by the rate limiter.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct RateLimitError {
    /// Human readable description.
    pub message: String,
    /// Time until a send may be authorized.
    pub retry_after: Duration,
    /// Why the send was denied.
    pub kind: RateLimitKind,
}

/// Rejection delivered to a producer awaiting a queued message.
#[derive(Debug, Clone, Error)]
pub enum SendError {
    /// The message failed terminally.
    #[error("message {id} failed after {retry_count} retries: {error}")]
    Failed {
        /// Message ID.
        id: String,
        /// Final transport error.
        error: TransportError,
        /// Retries performed before giving up.
        retry_count: u32,
        /// Every recorded retry, oldest first.
        retry_history: Vec<RetryRecord>,
    },
    /// The message was removed from the queue before delivery.
    #[error("message {id} cancelled: {reason}")]
    Cancelled {
        /// Message ID.
        id: String,
        /// Reason given to `clear_queue` or `shutdown`.
        reason: String,
    },
    /// The sender no longer accepts messages.
    #[error("sender is shutting down")]
    ShuttingDown,
    /// The sender was dropped before the message settled.
    #[error("message {id} was dropped before it settled")]
    Dropped {
        /// Message ID.
        id: String,
    },
}

impl SendError {
    /// Retry count carried by a terminal failure.
    #[must_use]
    pub const fn retry_count(&self) -> u32 {
        match self {
            Self::Failed { retry_count, .. } => *retry_count,
            _ => 0,
        }
    }
}

impl From<SendError> for AppError {
    fn from(err: SendError) -> Self {
        match err {
            SendError::Failed { .. } => Self::Transport(err.to_string()),
            SendError::Cancelled { reason, .. } => Self::Cancelled(reason),
            SendError::ShuttingDown => Self::ShuttingDown,
            SendError::Dropped { .. } => Self::Queue(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_headers_are_case_insensitive() {
        let err = TransportError::new("slow down").with_header("Retry-After", "2");
        assert_eq!(err.header("retry-after"), Some("2"));
        assert_eq!(err.header("RETRY-AFTER"), Some("2"));
    }

    #[test]
    fn test_has_status_or_code() {
        assert!(TransportError::new("x").with_status(429).has_status_or_code(429));
        assert!(TransportError::new("x").with_code(429).has_status_or_code(429));
        assert!(!TransportError::new("x").with_code("ECONNRESET").has_status_or_code(429));
    }

    #[test]
    fn test_retry_after_prefers_client_hint() {
        let err = TransportError::new("x")
            .with_retry_after(2.0)
            .with_body_retry_after(7.0);
        assert_eq!(err.retry_after_secs(), Some(2.0));

        let err = TransportError::new("x").with_body_retry_after(7.0);
        assert_eq!(err.retry_after_secs(), Some(7.0));
    }

    #[test]
    fn test_send_error_into_app_error() {
        let err: AppError = SendError::Cancelled {
            id: "m1".to_string(),
            reason: "shutdown".to_string(),
        }
        .into();
        assert!(matches!(err, AppError::Cancelled(ref reason) if reason == "shutdown"));

        let err: AppError = SendError::ShuttingDown.into();
        assert_eq!(err.error_code(), "SHUTTING_DOWN");
    }

    #[test]
    fn test_error_code_display() {
        assert_eq!(ErrorCode::from(50013).to_string(), "50013");
        assert_eq!(ErrorCode::from("EPIPE").to_string(), "EPIPE");
    }
}
