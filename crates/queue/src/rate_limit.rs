//! Send gating: a local burst budget plus server-issued cooldowns.
//!
//! The limiter is owned by the single scheduler step, so it needs no
//! synchronization of its own.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use herald_common::DeliveryConfig;
use serde::Serialize;
use tracing::{debug, warn};

use crate::clock::Clock;
use crate::error::{RateLimitError, RateLimitKind, TransportError};
use crate::retry::DelayTracker;

/// Extra wait added on top of every server-issued cooldown.
pub const SAFETY_BUFFER: Duration = Duration::from_millis(500);

/// Cooldown applied when the server gives no retry hint.
pub const DEFAULT_COOLDOWN: Duration = Duration::from_secs(1);

/// Longest pause the limiter installs. Longer hints are clamped to this.
pub const MAX_COOLDOWN: Duration = Duration::from_secs(60 * 60);

/// Rate limiter configuration.
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Sends permitted per burst window.
    pub burst_allowance: u32,
    /// Length of the burst window.
    pub burst_reset_time: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            burst_allowance: 5,
            burst_reset_time: Duration::from_secs(60),
        }
    }
}

impl From<&DeliveryConfig> for RateLimitConfig {
    fn from(config: &DeliveryConfig) -> Self {
        Self {
            burst_allowance: config.burst_allowance,
            burst_reset_time: Duration::from_millis(config.burst_reset_time_ms),
        }
    }
}

/// Active cooldown window.
#[derive(Debug, Clone)]
struct Pause {
    until: Instant,
    reason: String,
}

/// Rate limiter counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimiterMetrics {
    /// Server-issued rate limits handled.
    pub rate_limit_hits: u64,
    /// Sends denied because the burst budget was spent.
    pub burst_limits_hit: u64,
    /// When the last server-issued rate limit arrived.
    pub last_rate_limit_hit: Option<DateTime<Utc>>,
    /// Mean cooldown applied, in milliseconds.
    pub average_delay_ms: f64,
    /// Longest cooldown applied, in milliseconds.
    pub max_delay_ms: u64,
}

/// Point-in-time view of the limiter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitStatus {
    /// Whether a cooldown is in effect.
    pub is_paused: bool,
    /// Why the cooldown was installed.
    pub pause_reason: Option<String>,
    /// Time left in the cooldown, in milliseconds.
    pub pause_remaining_ms: u64,
    /// Sends made in the current burst window.
    pub burst_counter: u32,
    /// Sends permitted per burst window.
    pub burst_allowance: u32,
    /// Time left in the current burst window, in milliseconds.
    pub burst_remaining_ms: u64,
    /// Whether a send would be authorized right now.
    pub can_send_immediately: bool,
}

/// Local burst budget plus reactive server cooldowns.
#[derive(Debug)]
pub struct RateLimiter {
    config: RateLimitConfig,
    clock: Arc<dyn Clock>,
    burst_counter: u32,
    last_burst_reset: Instant,
    pause: Option<Pause>,
    delays: DelayTracker,
    metrics: RateLimiterMetrics,
}

impl RateLimiter {
    /// Create a new rate limiter with the given configuration.
    #[must_use]
    pub fn new(config: RateLimitConfig, clock: Arc<dyn Clock>) -> Self {
        let now = clock.now();
        Self {
            config,
            clock,
            burst_counter: 0,
            last_burst_reset: now,
            pause: None,
            delays: DelayTracker::default(),
            metrics: RateLimiterMetrics::default(),
        }
    }

    /// Authorize one send, or explain why it must wait.
    pub fn check_rate_limit(&mut self) -> Result<(), RateLimitError> {
        let now = self.clock.now();

        if let Some(pause) = &self.pause {
            if now < pause.until {
                return Err(RateLimitError {
                    message: format!("Rate limited: {}", pause.reason),
                    retry_after: pause.until - now,
                    kind: RateLimitKind::Reactive,
                });
            }
            debug!(reason = %pause.reason, "Cooldown elapsed");
            self.clear_pause();
        }

        if now.duration_since(self.last_burst_reset) >= self.config.burst_reset_time {
            self.burst_counter = 0;
            self.last_burst_reset = now;
        }

        if self.burst_counter >= self.config.burst_allowance {
            self.metrics.burst_limits_hit += 1;
            return Err(RateLimitError {
                message: format!(
                    "Burst limit reached: {} sends per {}ms",
                    self.config.burst_allowance,
                    self.config.burst_reset_time.as_millis()
                ),
                retry_after: self.burst_remaining(now),
                kind: RateLimitKind::Proactive,
            });
        }

        self.burst_counter += 1;
        Ok(())
    }

    /// Install a cooldown after the server signalled throttling.
    ///
    /// The cooldown comes from the first available hint: the error's client
    /// retry hint, its body retry hint, the `retry-after` header, the
    /// `x-ratelimit-reset-after` header, then a one second default. Returns
    /// the total pause applied, safety buffer included. Hints longer than
    /// [`MAX_COOLDOWN`] are clamped.
    pub fn handle_rate_limit(&mut self, error: &TransportError) -> Duration {
        let cooldown = Self::cooldown_for(error);
        let applied = cooldown + SAFETY_BUFFER;

        warn!(
            cooldown_ms = cooldown.as_millis() as u64,
            pause_ms = applied.as_millis() as u64,
            error = %error,
            "Server rate limit hit, pausing sends"
        );

        self.set_pause(applied, &format!("Server rate limit: {}", error.message));
        self.metrics.rate_limit_hits += 1;
        self.metrics.last_rate_limit_hit = Some(Utc::now());
        self.delays.observe(applied, self.metrics.rate_limit_hits);
        self.sync_delay_metrics();

        applied
    }

    fn cooldown_for(error: &TransportError) -> Duration {
        let header_secs = |name: &str| {
            error
                .header(name)
                .and_then(|value| value.trim().parse::<f64>().ok())
        };

        error
            .retry_after
            .or(error.body_retry_after)
            .or_else(|| header_secs("retry-after"))
            .or_else(|| header_secs("x-ratelimit-reset-after"))
            .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
            .map_or(DEFAULT_COOLDOWN, |cooldown| cooldown.min(MAX_COOLDOWN))
    }

    /// Pause all sends for `duration`, at most [`MAX_COOLDOWN`] plus the
    /// safety buffer.
    pub fn set_pause(&mut self, duration: Duration, reason: &str) {
        let now = self.clock.now();
        let duration = duration.min(MAX_COOLDOWN + SAFETY_BUFFER);
        self.pause = Some(Pause {
            until: now.checked_add(duration).unwrap_or(now),
            reason: reason.to_string(),
        });
    }

    /// Lift any cooldown.
    pub fn clear_pause(&mut self) {
        self.pause = None;
    }

    /// Start a fresh burst window.
    pub fn reset_burst_counter(&mut self) {
        self.burst_counter = 0;
        self.last_burst_reset = self.clock.now();
    }

    /// Simulate a server cooldown.
    pub fn force_rate_limit(&mut self, duration: Duration, reason: &str) {
        warn!(
            duration_ms = duration.as_millis() as u64,
            reason = %reason,
            "Forcing rate limit"
        );
        self.set_pause(duration, reason);
    }

    /// Whether `error` is a rate limit signal from the server.
    #[must_use]
    pub fn is_rate_limit_error(error: &TransportError) -> bool {
        error.rate_limited || error.has_status_or_code(429)
    }

    fn burst_remaining(&self, now: Instant) -> Duration {
        self.config
            .burst_reset_time
            .saturating_sub(now.duration_since(self.last_burst_reset))
    }

    /// Get a point-in-time view of the limiter.
    #[must_use]
    pub fn status(&self) -> RateLimitStatus {
        let now = self.clock.now();
        let active_pause = self.pause.as_ref().filter(|pause| now < pause.until);
        let window_expired =
            now.duration_since(self.last_burst_reset) >= self.config.burst_reset_time;
        let burst_counter = if window_expired { 0 } else { self.burst_counter };

        RateLimitStatus {
            is_paused: active_pause.is_some(),
            pause_reason: active_pause.map(|pause| pause.reason.clone()),
            pause_remaining_ms: active_pause
                .map_or(0, |pause| (pause.until - now).as_millis() as u64),
            burst_counter,
            burst_allowance: self.config.burst_allowance,
            burst_remaining_ms: self.burst_remaining(now).as_millis() as u64,
            can_send_immediately: active_pause.is_none()
                && burst_counter < self.config.burst_allowance,
        }
    }

    fn sync_delay_metrics(&mut self) {
        self.metrics.average_delay_ms = self.delays.average_ms();
        self.metrics.max_delay_ms = self.delays.max_ms();
    }

    /// Get a snapshot of the counters.
    #[must_use]
    pub fn metrics(&self) -> RateLimiterMetrics {
        self.metrics.clone()
    }

    /// Return to construction-time state.
    pub fn reset(&mut self) {
        self.burst_counter = 0;
        self.last_burst_reset = self.clock.now();
        self.pause = None;
        self.delays = DelayTracker::default();
        self.metrics = RateLimiterMetrics::default();
    }
}
