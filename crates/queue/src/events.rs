//! Lifecycle events emitted by the sender.
//!
//! Events go out on a `tokio::sync::broadcast` channel. Slow subscribers
//! lag and lose events; delivery never waits on them.

use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;

use crate::error::RateLimitKind;
use crate::message::Priority;

/// Sender lifecycle event.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum SenderEvent {
    /// The drain loop started.
    ProcessingStarted,
    /// The drain loop stopped.
    ProcessingStopped,
    /// A message entered the queue.
    #[serde(rename_all = "camelCase")]
    MessageQueued {
        id: String,
        target: String,
        priority: Priority,
        queue_length: usize,
    },
    /// A message was delivered.
    #[serde(rename_all = "camelCase")]
    MessageProcessed {
        id: String,
        target: String,
        retry_count: u32,
        response: Value,
    },
    /// A message failed and will be attempted again.
    #[serde(rename_all = "camelCase")]
    MessageRetry {
        id: String,
        retry_count: u32,
        delay_ms: u64,
        error: String,
    },
    /// A message failed terminally.
    #[serde(rename_all = "camelCase")]
    MessageFailed {
        id: String,
        retry_count: u32,
        error: String,
    },
    /// Sends are being held back.
    #[serde(rename_all = "camelCase")]
    RateLimited {
        kind: RateLimitKind,
        retry_after_ms: u64,
        reason: String,
        message_id: Option<String>,
    },
    /// Pending messages were cancelled.
    #[serde(rename_all = "camelCase")]
    QueueCleared { reason: String, cancelled: usize },
}

impl SenderEvent {
    /// Event name as it appears in the serialized `type` field.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::ProcessingStarted => "processingStarted",
            Self::ProcessingStopped => "processingStopped",
            Self::MessageQueued { .. } => "messageQueued",
            Self::MessageProcessed { .. } => "messageProcessed",
            Self::MessageRetry { .. } => "messageRetry",
            Self::MessageFailed { .. } => "messageFailed",
            Self::RateLimited { .. } => "rateLimited",
            Self::QueueCleared { .. } => "queueCleared",
        }
    }
}

/// Fan-out of sender events to any number of subscribers.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<SenderEvent>,
}

impl EventBus {
    /// Create a bus holding up to `capacity` unread events per subscriber.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publish an event. Having no subscribers is not an error.
    pub fn emit(&self, event: SenderEvent) {
        let _ = self.tx.send(event);
    }

    /// Subscribe to events published from now on.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<SenderEvent> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_event_has_type_field() {
        let event = SenderEvent::MessageRetry {
            id: "m1".to_string(),
            retry_count: 1,
            delay_ms: 1000,
            error: "reset".to_string(),
        };

        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"messageRetry\""));
        assert!(json.contains("\"delayMs\":1000"));
        assert_eq!(event.name(), "messageRetry");
    }

    #[test]
    fn test_rate_limited_serialization() {
        let event = SenderEvent::RateLimited {
            kind: RateLimitKind::Reactive,
            retry_after_ms: 3500,
            reason: "429".to_string(),
            message_id: None,
        };

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "rateLimited");
        assert_eq!(json["kind"], "reactive");
        assert_eq!(json["retryAfterMs"], 3500);
    }

    #[tokio::test]
    async fn test_bus_delivers_to_subscribers() {
        let bus = EventBus::new(8);
        bus.emit(SenderEvent::ProcessingStarted);

        let mut rx = bus.subscribe();
        bus.emit(SenderEvent::ProcessingStopped);

        assert!(matches!(rx.recv().await.unwrap(), SenderEvent::ProcessingStopped));
    }
}
