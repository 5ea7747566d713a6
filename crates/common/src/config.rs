//! Application configuration.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use validator::Validate;

use crate::AppResult;

/// Application configuration.
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct Config {
    /// Delivery pipeline configuration.
    #[serde(default)]
    #[validate(nested)]
    pub delivery: DeliveryConfig,
    /// Outbound transport configuration.
    #[validate(nested)]
    pub transport: TransportConfig,
}

/// Delivery pipeline configuration.
///
/// All durations are expressed in milliseconds.
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct DeliveryConfig {
    /// Maximum retry attempts for a single message.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Delay before the first retry.
    #[serde(default = "default_base_retry_delay_ms")]
    #[validate(range(min = 1))]
    pub base_retry_delay_ms: u64,
    /// Multiplier for exponential backoff.
    #[serde(default = "default_backoff_multiplier")]
    #[validate(range(min = 1.0))]
    pub backoff_multiplier: f64,
    /// Upper bound for any retry delay.
    #[serde(default = "default_max_backoff_delay_ms")]
    #[validate(range(min = 100))]
    pub max_backoff_delay_ms: u64,
    /// Whether to randomize retry delays.
    #[serde(default = "default_true")]
    pub jitter_enabled: bool,
    /// Proportional jitter width.
    #[serde(default = "default_jitter_factor")]
    #[validate(range(min = 0.0, max = 1.0))]
    pub jitter_factor: f64,
    /// Sends permitted per burst window.
    #[serde(default = "default_burst_allowance")]
    #[validate(range(min = 1))]
    pub burst_allowance: u32,
    /// Length of the burst window.
    #[serde(default = "default_burst_reset_time_ms")]
    #[validate(range(min = 1))]
    pub burst_reset_time_ms: u64,
    /// Pacing delay between consecutive sends.
    #[serde(default = "default_base_send_delay_ms")]
    pub base_send_delay_ms: u64,
    /// Poll interval while the queue is empty.
    #[serde(default = "default_idle_poll_interval_ms")]
    #[validate(range(min = 1))]
    pub idle_poll_interval_ms: u64,
    /// Collapse all timing to virtual time.
    #[serde(default)]
    pub test_mode: bool,
    /// Capacity of the lifecycle event channel.
    #[serde(default = "default_event_capacity")]
    #[validate(range(min = 1))]
    pub event_capacity: usize,
    /// Default drain timeout used on shutdown.
    #[serde(default = "default_shutdown_timeout_ms")]
    pub shutdown_timeout_ms: u64,
}

/// Outbound transport configuration.
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct TransportConfig {
    /// Base URL of the chat platform API.
    #[validate(url)]
    pub base_url: String,
    /// Bearer token sent with every request.
    #[serde(default)]
    pub token: Option<String>,
    /// Per-request timeout.
    #[serde(default = "default_request_timeout_ms")]
    #[validate(range(min = 1))]
    pub request_timeout_ms: u64,
    /// User agent header value.
    #[serde(default = "default_user_agent")]
    #[validate(length(min = 1))]
    pub user_agent: String,
}

const fn default_max_retries() -> u32 {
    3
}

const fn default_base_retry_delay_ms() -> u64 {
    1000
}

const fn default_backoff_multiplier() -> f64 {
    2.0
}

const fn default_max_backoff_delay_ms() -> u64 {
    30_000
}

const fn default_true() -> bool {
    true
}

const fn default_jitter_factor() -> f64 {
    0.1
}

const fn default_burst_allowance() -> u32 {
    5
}

const fn default_burst_reset_time_ms() -> u64 {
    60_000
}

const fn default_base_send_delay_ms() -> u64 {
    1000
}

const fn default_idle_poll_interval_ms() -> u64 {
    1000
}

const fn default_event_capacity() -> usize {
    256
}

const fn default_shutdown_timeout_ms() -> u64 {
    10_000
}

const fn default_request_timeout_ms() -> u64 {
    15_000
}

fn default_user_agent() -> String {
    format!("herald/{}", env!("CARGO_PKG_VERSION"))
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_retry_delay_ms: default_base_retry_delay_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            max_backoff_delay_ms: default_max_backoff_delay_ms(),
            jitter_enabled: default_true(),
            jitter_factor: default_jitter_factor(),
            burst_allowance: default_burst_allowance(),
            burst_reset_time_ms: default_burst_reset_time_ms(),
            base_send_delay_ms: default_base_send_delay_ms(),
            idle_poll_interval_ms: default_idle_poll_interval_ms(),
            test_mode: false,
            event_capacity: default_event_capacity(),
            shutdown_timeout_ms: default_shutdown_timeout_ms(),
        }
    }
}

impl DeliveryConfig {
    /// Configuration for deterministic tests: virtual time, no jitter.
    #[must_use]
    pub fn for_tests() -> Self {
        Self {
            jitter_enabled: false,
            test_mode: true,
            ..Self::default()
        }
    }

    /// Pacing delay between consecutive sends.
    #[must_use]
    pub const fn base_send_delay(&self) -> Duration {
        Duration::from_millis(self.base_send_delay_ms)
    }

    /// Poll interval while the queue is empty.
    #[must_use]
    pub const fn idle_poll_interval(&self) -> Duration {
        Duration::from_millis(self.idle_poll_interval_ms)
    }

    /// Default drain timeout used on shutdown.
    #[must_use]
    pub const fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}

impl TransportConfig {
    /// Per-request timeout.
    #[must_use]
    pub const fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

impl Config {
    /// Load configuration from files and environment variables.
    ///
    /// Configuration is loaded in the following order:
    /// 1. `config/default.toml`
    /// 2. `config/{environment}.toml` (based on `HERALD_ENV`)
    /// 3. Environment variables with `HERALD_` prefix
    pub fn load() -> Result<Self, config::ConfigError> {
        let env = std::env::var("HERALD_ENV").unwrap_or_else(|_| "development".to_string());

        let config = config::Config::builder()
            .add_source(config::File::with_name("config/default").required(false))
            .add_source(config::File::with_name(&format!("config/{env}")).required(false))
            .add_source(
                config::Environment::with_prefix("HERALD")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }

    /// Load configuration from a specific file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, config::ConfigError> {
        let config = config::Config::builder()
            .add_source(config::File::from(path.as_ref()))
            .add_source(
                config::Environment::with_prefix("HERALD")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }

    /// Check value ranges that serde cannot express.
    pub fn check(&self) -> AppResult<()> {
        self.validate()?;
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_delivery_config_default() {
        let config = DeliveryConfig::default();
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.base_retry_delay_ms, 1000);
        assert_eq!(config.backoff_multiplier, 2.0);
        assert_eq!(config.max_backoff_delay_ms, 30_000);
        assert!(config.jitter_enabled);
        assert_eq!(config.jitter_factor, 0.1);
        assert_eq!(config.burst_allowance, 5);
        assert_eq!(config.burst_reset_time_ms, 60_000);
        assert_eq!(config.base_send_delay(), Duration::from_secs(1));
        assert!(!config.test_mode);
    }

    #[test]
    fn test_for_tests_disables_jitter() {
        let config = DeliveryConfig::for_tests();
        assert!(config.test_mode);
        assert!(!config.jitter_enabled);
        assert_eq!(config.max_retries, 3);
    }

    #[test]
    fn test_deserialize_with_defaults() {
        let config: Config = serde_json::from_str(
            r#"{"transport": {"base_url": "https://chat.example.com/api"}}"#,
        )
        .unwrap();

        assert_eq!(config.delivery.burst_allowance, 5);
        assert_eq!(config.transport.request_timeout(), Duration::from_secs(15));
        assert!(config.transport.token.is_none());
        assert!(config.check().is_ok());
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut config: Config = serde_json::from_str(
            r#"{"transport": {"base_url": "https://chat.example.com/api"}}"#,
        )
        .unwrap();
        config.delivery.jitter_factor = 1.5;
        assert!(config.check().is_err());

        config.delivery.jitter_factor = 0.1;
        config.transport.base_url = "not a url".to_string();
        assert!(config.check().is_err());
    }
}
