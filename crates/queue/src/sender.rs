//! Public entry point of the delivery pipeline.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use herald_common::{DeliveryConfig, DeliverySnapshot, IdGenerator, Timer};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::clock::{Clock, ManualClock, SystemClock};
use crate::error::{SendError, TransportError};
use crate::events::SenderEvent;
use crate::message::{DeliveryHandle, Message, MessageInfo, QueueOptions};
use crate::rate_limit::{RateLimitStatus, RateLimiterMetrics};
use crate::retry::RetryMetrics;
use crate::scheduler::{Pipeline, ProcessingScheduler};
use crate::transport::Transport;

/// Reason given to messages cancelled by [`Sender::shutdown`].
pub const SHUTDOWN_REASON: &str = "Sender shutting down";

/// Aggregate view over every counter the sender keeps.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SenderMetrics {
    /// Message outcome counters.
    pub delivery: DeliverySnapshot,
    /// Rate limiter counters.
    pub rate_limiter: RateLimiterMetrics,
    /// Retry counters.
    pub retry: RetryMetrics,
    /// Rate limiter state right now.
    pub rate_limit_status: RateLimitStatus,
    /// Pending messages, delayed retries included.
    pub queue_length: usize,
    /// Whether the drain loop is running.
    pub is_processing: bool,
}

/// Rate-limited, retrying message sender.
///
/// Producers call [`Sender::queue_message`] and await the returned
/// [`DeliveryHandle`]; one background task drains the queue against the
/// [`Transport`] once [`Sender::start_processing`] is called.
pub struct Sender {
    pipeline: Arc<Pipeline>,
    scheduler: ProcessingScheduler,
    ids: IdGenerator,
    accepting: AtomicBool,
    config: DeliveryConfig,
}

impl Sender {
    /// Create a sender. Test mode runs on a [`ManualClock`], otherwise on
    /// real time.
    #[must_use]
    pub fn new(config: DeliveryConfig, transport: Arc<dyn Transport>) -> Self {
        let clock: Arc<dyn Clock> = if config.test_mode {
            Arc::new(ManualClock::new())
        } else {
            Arc::new(SystemClock)
        };
        Self::with_clock(config, transport, clock)
    }

    /// Create a sender on an explicit time source.
    #[must_use]
    pub fn with_clock(
        config: DeliveryConfig,
        transport: Arc<dyn Transport>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let pipeline = Arc::new(Pipeline::new(&config, transport, clock));
        Self {
            scheduler: ProcessingScheduler::new(Arc::clone(&pipeline)),
            pipeline,
            ids: IdGenerator::with_prefix("msg"),
            accepting: AtomicBool::new(true),
            config,
        }
    }

    /// Configuration in effect.
    #[must_use]
    pub const fn config(&self) -> &DeliveryConfig {
        &self.config
    }

    /// Queue `payload` for delivery to `target`.
    ///
    /// The returned handle resolves once the message is delivered, fails
    /// terminally, or is cancelled.
    pub fn queue_message(
        &self,
        target: impl Into<String>,
        payload: Value,
        options: QueueOptions,
    ) -> Result<DeliveryHandle, SendError> {
        if !self.accepting.load(Ordering::Acquire) {
            return Err(SendError::ShuttingDown);
        }

        let (message, handle) = Message::new(
            self.ids.generate(),
            target,
            payload,
            options.priority,
            self.pipeline.clock.now(),
        );
        let id = message.id().to_string();
        let target = message.target().to_string();

        let queue_length = self.pipeline.enqueue(message);
        self.pipeline.metrics.record_queued();

        debug!(
            message_id = %id,
            channel = %target,
            priority = ?options.priority,
            queue_length,
            "Message queued"
        );
        self.pipeline.events.emit(SenderEvent::MessageQueued {
            id,
            target,
            priority: options.priority,
            queue_length,
        });

        Ok(handle)
    }

    /// Send directly, bypassing the queue, the rate limiter and retries.
    pub async fn send_immediate(
        &self,
        target: &str,
        payload: &Value,
    ) -> Result<Value, TransportError> {
        let timer = Timer::start();
        self.pipeline.metrics.record_immediate();

        let result = self.pipeline.transport.send(target, payload).await;
        let elapsed_ms = timer.elapsed().as_millis() as u64;
        match &result {
            Ok(_) => info!(channel = %target, elapsed_ms, "Immediate send delivered"),
            Err(e) => warn!(channel = %target, elapsed_ms, error = %e, "Immediate send failed"),
        }
        result
    }

    /// Start draining the queue. Returns `false` if already running.
    pub fn start_processing(&self) -> bool {
        self.scheduler.start()
    }

    /// Stop draining after any in-flight send completes.
    pub async fn stop_processing(&self) -> bool {
        self.scheduler.stop().await
    }

    /// Whether the drain loop is running.
    #[must_use]
    pub fn is_processing(&self) -> bool {
        self.scheduler.is_running()
    }

    /// Cancel every pending message with `reason`.
    ///
    /// A send already in flight is not affected. Returns the number of
    /// messages cancelled.
    pub fn clear_queue(&self, reason: &str) -> usize {
        let cancelled = self
            .pipeline
            .with_state(|state| state.queue.clear(reason));
        self.pipeline.metrics.record_cancelled(cancelled as u64);

        info!(cancelled, reason = %reason, "Queue cleared");
        self.pipeline.events.emit(SenderEvent::QueueCleared {
            reason: reason.to_string(),
            cancelled,
        });
        cancelled
    }

    /// Stop accepting messages, wait up to `timeout` for the queue to drain,
    /// stop processing and cancel whatever is left.
    ///
    /// A send in flight at the deadline completes before the queue is
    /// cleared, so a retry it schedules is cancelled too. Returns the number
    /// of messages cancelled.
    pub async fn shutdown(&self, timeout: Duration) -> usize {
        self.accepting.store(false, Ordering::Release);
        info!(timeout_ms = timeout.as_millis() as u64, "Shutting down sender");

        let mut pending = self.pipeline.watch_pending();
        let drained = tokio::time::timeout(timeout, pending.wait_for(|count| *count == 0))
            .await
            .is_ok_and(|result| result.is_ok());

        self.stop_processing().await;

        let cancelled = if drained && self.queue_len() == 0 {
            0
        } else {
            warn!(
                remaining = self.queue_len(),
                "Queue did not drain before shutdown timeout"
            );
            self.clear_queue(SHUTDOWN_REASON)
        };

        info!(cancelled, "Sender shut down");
        cancelled
    }

    /// Whether `shutdown` has been called.
    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        !self.accepting.load(Ordering::Acquire)
    }

    /// Subscribe to lifecycle events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<SenderEvent> {
        self.pipeline.events.subscribe()
    }

    /// Pending messages, delayed retries included.
    #[must_use]
    pub fn queue_len(&self) -> usize {
        self.pipeline.with_state(|state| state.queue.len())
    }

    /// Pending messages in drain order.
    #[must_use]
    pub fn queue_snapshot(&self) -> Vec<MessageInfo> {
        self.pipeline.with_state(|state| state.queue.snapshot())
    }

    /// Rate limiter state right now.
    #[must_use]
    pub fn rate_limit_status(&self) -> RateLimitStatus {
        self.pipeline.with_state(|state| state.limiter.status())
    }

    /// Pause all sends for `duration` as if the server had asked for it.
    pub fn force_rate_limit(&self, duration: Duration, reason: &str) {
        self.pipeline
            .with_state(|state| state.limiter.force_rate_limit(duration, reason));
    }

    /// Aggregate counters.
    #[must_use]
    pub fn metrics(&self) -> SenderMetrics {
        let (rate_limiter, retry, rate_limit_status, queue_length) =
            self.pipeline.with_state(|state| {
                (
                    state.limiter.metrics(),
                    state.retry.metrics(),
                    state.limiter.status(),
                    state.queue.len(),
                )
            });

        SenderMetrics {
            delivery: self.pipeline.metrics.snapshot(),
            rate_limiter,
            retry,
            rate_limit_status,
            queue_length,
            is_processing: self.is_processing(),
        }
    }

    /// Zero every counter and return the rate limiter to its initial state.
    pub fn reset_metrics(&self) {
        self.pipeline.metrics.reset();
        self.pipeline.with_state(|state| {
            state.limiter.reset();
            state.retry.reset_metrics();
        });
    }

    /// Export metrics in Prometheus format.
    #[must_use]
    pub fn prometheus(&self) -> String {
        let metrics = self.metrics();
        let mut output = self.pipeline.metrics.to_prometheus();

        output.push_str("# HELP herald_queue_length Pending messages\n");
        output.push_str("# TYPE herald_queue_length gauge\n");
        output.push_str(&format!("herald_queue_length {}\n", metrics.queue_length));

        output.push_str("# HELP herald_rate_limit_hits Server rate limits handled\n");
        output.push_str("# TYPE herald_rate_limit_hits counter\n");
        output.push_str(&format!(
            "herald_rate_limit_hits {}\n",
            metrics.rate_limiter.rate_limit_hits
        ));

        output.push_str("# HELP herald_burst_limits_hit Sends held by the burst budget\n");
        output.push_str("# TYPE herald_burst_limits_hit counter\n");
        output.push_str(&format!(
            "herald_burst_limits_hit {}\n",
            metrics.rate_limiter.burst_limits_hit
        ));

        output.push_str("# HELP herald_retry_attempts Retry decisions made\n");
        output.push_str("# TYPE herald_retry_attempts counter\n");
        output.push_str(&format!(
            "herald_retry_attempts {}\n",
            metrics.retry.total_retry_attempts
        ));

        output.push_str("# HELP herald_processing Whether the drain loop is running\n");
        output.push_str("# TYPE herald_processing gauge\n");
        output.push_str(&format!(
            "herald_processing {}\n",
            u8::from(metrics.is_processing)
        ));

        output
    }
}

impl std::fmt::Debug for Sender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sender")
            .field("scheduler", &self.scheduler)
            .field("accepting", &self.accepting)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::message::Priority;
    use async_trait::async_trait;
    use serde_json::json;

    struct EchoTransport;

    #[async_trait]
    impl Transport for EchoTransport {
        async fn send(&self, target: &str, payload: &Value) -> Result<Value, TransportError> {
            Ok(json!({"target": target, "payload": payload}))
        }
    }

    fn sender() -> Sender {
        Sender::new(DeliveryConfig::for_tests(), Arc::new(EchoTransport))
    }

    #[tokio::test]
    async fn test_queue_message_emits_event() {
        let sender = sender();
        let mut events = sender.subscribe();

        let handle = sender
            .queue_message("c1", json!({"content": "hi"}), QueueOptions::default())
            .unwrap();

        assert!(handle.id().starts_with("msg_"));
        assert_eq!(sender.queue_len(), 1);
        match events.recv().await.unwrap() {
            SenderEvent::MessageQueued {
                id, queue_length, ..
            } => {
                assert_eq!(id, handle.id());
                assert_eq!(queue_length, 1);
            }
            other => panic!("Expected MessageQueued, got {other:?}"),
        }
        assert_eq!(sender.metrics().delivery.messages_queued, 1);
    }

    #[tokio::test]
    async fn test_send_immediate_bypasses_queue() {
        let sender = sender();
        let response = sender.send_immediate("c1", &json!({"n": 1})).await.unwrap();

        assert_eq!(response["target"], "c1");
        assert_eq!(sender.queue_len(), 0);
        assert_eq!(sender.metrics().delivery.immediate_sends, 1);
        assert_eq!(sender.rate_limit_status().burst_counter, 0);
    }

    #[tokio::test]
    async fn test_processing_delivers_queued_message() {
        let sender = sender();
        sender.start_processing();
        assert!(sender.is_processing());

        let delivery = sender
            .queue_message("c1", json!({"n": 1}), QueueOptions::priority(Priority::High))
            .unwrap()
            .await
            .unwrap();

        assert_eq!(delivery.response["payload"]["n"], 1);
        assert_eq!(delivery.retry_count, 0);
        assert!(sender.stop_processing().await);
        assert!(!sender.is_processing());
    }

    #[tokio::test]
    async fn test_force_rate_limit_shows_in_status() {
        let sender = sender();
        sender.force_rate_limit(Duration::from_secs(5), "maintenance");

        let status = sender.rate_limit_status();
        assert!(status.is_paused);
        assert!(!status.can_send_immediately);
        assert_eq!(status.pause_reason.as_deref(), Some("maintenance"));

        sender.reset_metrics();
        assert!(!sender.rate_limit_status().is_paused);
    }

    #[tokio::test]
    async fn test_rejects_after_shutdown() {
        let sender = sender();
        assert_eq!(sender.shutdown(Duration::from_millis(10)).await, 0);
        assert!(sender.is_shutting_down());

        let err = sender
            .queue_message("c1", json!({}), QueueOptions::default())
            .unwrap_err();
        assert!(matches!(err, SendError::ShuttingDown));
    }

    #[test]
    fn test_prometheus_export() {
        let sender = sender();
        let output = sender.prometheus();

        assert!(output.contains("herald_messages_queued 0"));
        assert!(output.contains("herald_queue_length 0"));
        assert!(output.contains("herald_processing 0"));
    }
}
