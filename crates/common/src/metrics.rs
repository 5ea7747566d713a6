//! Delivery counters for herald.
//!
//! Each sender owns one [`DeliveryMetrics`] instance. Counters are
//! monotonic until [`DeliveryMetrics::reset`] is called explicitly.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Message outcome counters.
#[derive(Debug)]
pub struct DeliveryMetrics {
    /// Messages accepted by `queue_message`
    pub messages_queued: AtomicU64,
    /// Messages delivered through the queue
    pub successful_sends: AtomicU64,
    /// Messages that failed terminally
    pub failed_sends: AtomicU64,
    /// Messages cancelled before delivery
    pub cancelled_messages: AtomicU64,
    /// Sends that bypassed the queue
    pub immediate_sends: AtomicU64,
    /// Total time delivered messages spent queued, in milliseconds
    pub queue_time_ms_total: AtomicU64,
    /// Longest time a delivered message spent queued, in milliseconds
    pub queue_time_ms_max: AtomicU64,
}

impl DeliveryMetrics {
    /// Create a new metrics instance with all counters at zero.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            messages_queued: AtomicU64::new(0),
            successful_sends: AtomicU64::new(0),
            failed_sends: AtomicU64::new(0),
            cancelled_messages: AtomicU64::new(0),
            immediate_sends: AtomicU64::new(0),
            queue_time_ms_total: AtomicU64::new(0),
            queue_time_ms_max: AtomicU64::new(0),
        }
    }

    /// Record a message entering the queue.
    pub fn record_queued(&self) {
        self.messages_queued.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a delivered message and how long it waited.
    pub fn record_success(&self, queue_time: Duration) {
        let ms = queue_time.as_millis() as u64;
        self.successful_sends.fetch_add(1, Ordering::Relaxed);
        self.queue_time_ms_total.fetch_add(ms, Ordering::Relaxed);
        self.queue_time_ms_max.fetch_max(ms, Ordering::Relaxed);
    }

    /// Record a terminal failure.
    pub fn record_failure(&self) {
        self.failed_sends.fetch_add(1, Ordering::Relaxed);
    }

    /// Record cancelled messages.
    pub fn record_cancelled(&self, count: u64) {
        self.cancelled_messages.fetch_add(count, Ordering::Relaxed);
    }

    /// Record a send that bypassed the queue.
    pub fn record_immediate(&self) {
        self.immediate_sends.fetch_add(1, Ordering::Relaxed);
    }

    /// Zero every counter.
    pub fn reset(&self) {
        for counter in [
            &self.messages_queued,
            &self.successful_sends,
            &self.failed_sends,
            &self.cancelled_messages,
            &self.immediate_sends,
            &self.queue_time_ms_total,
            &self.queue_time_ms_max,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }

    /// Get a snapshot of all metrics.
    #[must_use]
    pub fn snapshot(&self) -> DeliverySnapshot {
        DeliverySnapshot {
            messages_queued: self.messages_queued.load(Ordering::Relaxed),
            successful_sends: self.successful_sends.load(Ordering::Relaxed),
            failed_sends: self.failed_sends.load(Ordering::Relaxed),
            cancelled_messages: self.cancelled_messages.load(Ordering::Relaxed),
            immediate_sends: self.immediate_sends.load(Ordering::Relaxed),
            average_queue_time_ms: self.average_queue_time_ms(),
            max_queue_time_ms: self.queue_time_ms_max.load(Ordering::Relaxed),
        }
    }

    /// Calculate average queue time of delivered messages.
    fn average_queue_time_ms(&self) -> u64 {
        let total = self.queue_time_ms_total.load(Ordering::Relaxed);
        let count = self.successful_sends.load(Ordering::Relaxed);
        if count > 0 {
            total / count
        } else {
            0
        }
    }

    /// Export metrics in Prometheus format.
    #[must_use]
    pub fn to_prometheus(&self) -> String {
        let snapshot = self.snapshot();
        let mut output = String::new();

        output.push_str("# HELP herald_messages_queued Messages accepted into the queue\n");
        output.push_str("# TYPE herald_messages_queued counter\n");
        output.push_str(&format!(
            "herald_messages_queued {}\n",
            snapshot.messages_queued
        ));

        output.push_str("# HELP herald_messages_by_outcome Messages by final outcome\n");
        output.push_str("# TYPE herald_messages_by_outcome counter\n");
        output.push_str(&format!(
            "herald_messages_by_outcome{{outcome=\"succeeded\"}} {}\n",
            snapshot.successful_sends
        ));
        output.push_str(&format!(
            "herald_messages_by_outcome{{outcome=\"failed\"}} {}\n",
            snapshot.failed_sends
        ));
        output.push_str(&format!(
            "herald_messages_by_outcome{{outcome=\"cancelled\"}} {}\n",
            snapshot.cancelled_messages
        ));

        output.push_str("# HELP herald_immediate_sends Sends that bypassed the queue\n");
        output.push_str("# TYPE herald_immediate_sends counter\n");
        output.push_str(&format!(
            "herald_immediate_sends {}\n",
            snapshot.immediate_sends
        ));

        output.push_str("# HELP herald_queue_time_avg_ms Average time delivered messages waited\n");
        output.push_str("# TYPE herald_queue_time_avg_ms gauge\n");
        output.push_str(&format!(
            "herald_queue_time_avg_ms {}\n",
            snapshot.average_queue_time_ms
        ));

        output.push_str("# HELP herald_queue_time_max_ms Longest time a delivered message waited\n");
        output.push_str("# TYPE herald_queue_time_max_ms gauge\n");
        output.push_str(&format!(
            "herald_queue_time_max_ms {}\n",
            snapshot.max_queue_time_ms
        ));

        output
    }
}

impl Default for DeliveryMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of delivery counters at a point in time.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliverySnapshot {
    /// Messages accepted by `queue_message`.
    pub messages_queued: u64,
    /// Messages delivered through the queue.
    pub successful_sends: u64,
    /// Messages that failed terminally.
    pub failed_sends: u64,
    /// Messages cancelled before delivery.
    pub cancelled_messages: u64,
    /// Sends that bypassed the queue.
    pub immediate_sends: u64,
    /// Average queue time of delivered messages.
    pub average_queue_time_ms: u64,
    /// Longest queue time of a delivered message.
    pub max_queue_time_ms: u64,
}

/// Timer guard for measuring operation duration.
pub struct Timer {
    start: Instant,
}

impl Timer {
    /// Start a new timer.
    #[must_use]
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    /// Get elapsed duration since timer start.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_new() {
        let metrics = DeliveryMetrics::new();
        assert_eq!(metrics.snapshot(), DeliverySnapshot::default());
    }

    #[test]
    fn test_record_outcomes() {
        let metrics = DeliveryMetrics::new();

        metrics.record_queued();
        metrics.record_queued();
        metrics.record_queued();
        metrics.record_success(Duration::from_millis(100));
        metrics.record_failure();
        metrics.record_cancelled(1);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.messages_queued, 3);
        assert_eq!(snapshot.successful_sends, 1);
        assert_eq!(snapshot.failed_sends, 1);
        assert_eq!(snapshot.cancelled_messages, 1);
    }

    #[test]
    fn test_average_queue_time() {
        let metrics = DeliveryMetrics::new();
        assert_eq!(metrics.average_queue_time_ms(), 0);

        metrics.record_success(Duration::from_millis(100));
        metrics.record_success(Duration::from_millis(300));

        assert_eq!(metrics.average_queue_time_ms(), 200);
        assert_eq!(metrics.snapshot().max_queue_time_ms, 300);
    }

    #[test]
    fn test_reset() {
        let metrics = DeliveryMetrics::new();
        metrics.record_queued();
        metrics.record_immediate();
        metrics.record_success(Duration::from_millis(50));

        metrics.reset();

        assert_eq!(metrics.snapshot(), DeliverySnapshot::default());
    }

    #[test]
    fn test_prometheus_export() {
        let metrics = DeliveryMetrics::new();
        metrics.record_queued();
        metrics.record_success(Duration::from_millis(20));

        let prometheus = metrics.to_prometheus();
        assert!(prometheus.contains("herald_messages_queued 1"));
        assert!(prometheus.contains("herald_messages_by_outcome{outcome=\"succeeded\"} 1"));
        assert!(prometheus.contains("herald_queue_time_avg_ms 20"));
    }

    #[test]
    fn test_timer() {
        let timer = Timer::start();
        std::thread::sleep(Duration::from_millis(10));
        assert!(timer.elapsed() >= Duration::from_millis(10));
    }
}
