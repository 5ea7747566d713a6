//! Error types for herald.

use thiserror::Error;

/// Application result type.
pub type AppResult<T> = Result<T, AppError>;

/// Application error type.
#[derive(Debug, Error)]
pub enum AppError {
    // === Caller Errors ===
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Sender is shutting down")]
    ShuttingDown,

    #[error("Message cancelled: {0}")]
    Cancelled(String),

    // === Delivery Errors ===
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Queue error: {0}")]
    Queue(String),

    // === Setup Errors ===
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// Returns the stable error code used in logs and events.
    #[must_use]
    pub const fn error_code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "VALIDATION_ERROR",
            Self::ShuttingDown => "SHUTTING_DOWN",
            Self::Cancelled(_) => "CANCELLED",
            Self::Transport(_) => "TRANSPORT_ERROR",
            Self::Queue(_) => "QUEUE_ERROR",
            Self::Config(_) => "CONFIG_ERROR",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Returns whether the error originates on our side rather than the caller's.
    #[must_use]
    pub const fn is_internal(&self) -> bool {
        matches!(
            self,
            Self::Transport(_) | Self::Queue(_) | Self::Config(_) | Self::Internal(_)
        )
    }

    /// Log this error at a level matching its origin.
    pub fn log(&self) {
        let code = self.error_code();
        if self.is_internal() {
            tracing::error!(error = %self, code = code, "Delivery error occurred");
        } else {
            tracing::debug!(error = %self, code = code, "Caller error occurred");
        }
    }
}

// === From implementations ===

impl From<validator::ValidationErrors> for AppError {
    fn from(err: validator::ValidationErrors) -> Self {
        Self::Validation(err.to_string())
    }
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        Self::Config(err.to_string())
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        Self::Internal(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(AppError::ShuttingDown.error_code(), "SHUTTING_DOWN");
        assert_eq!(
            AppError::Transport("reset".to_string()).error_code(),
            "TRANSPORT_ERROR"
        );
        assert_eq!(AppError::Config("x".to_string()).error_code(), "CONFIG_ERROR");
    }

    #[test]
    fn test_is_internal() {
        assert!(AppError::Queue("closed".to_string()).is_internal());
        assert!(!AppError::Validation("bad".to_string()).is_internal());
        assert!(!AppError::Cancelled("shutdown".to_string()).is_internal());
    }

    #[test]
    fn test_from_anyhow() {
        let err: AppError = anyhow::anyhow!("boom").into();
        assert!(matches!(err, AppError::Internal(ref msg) if msg == "boom"));
    }
}
