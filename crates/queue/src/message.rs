//! Queued message model and its lifecycle state machine.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll, ready};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::warn;

use crate::error::{SendError, TransportError};

/// Delivery priority. Higher priorities drain first.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Priority {
    /// Background traffic.
    Low,
    /// Regular traffic.
    #[default]
    Normal,
    /// Time-sensitive traffic.
    High,
    /// Alerts that should jump every other message.
    Urgent,
}

/// Options accepted by `queue_message`.
#[derive(Debug, Clone, Copy, Default)]
pub struct QueueOptions {
    /// Delivery priority.
    pub priority: Priority,
}

impl QueueOptions {
    /// Options with the given priority.
    #[must_use]
    pub const fn priority(priority: Priority) -> Self {
        Self { priority }
    }
}

/// Lifecycle state of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum MessageStatus {
    /// Waiting in the queue.
    Queued,
    /// Handed to the transport.
    Sending,
    /// Delivered.
    Succeeded,
    /// Waiting out a backoff delay.
    Retrying,
    /// Gave up.
    Failed,
    /// Removed before delivery.
    Cancelled,
}

impl MessageStatus {
    /// Whether no further transitions are possible.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }

    /// Whether moving from `self` to `next` is a legal transition.
    ///
    /// `Sending -> Queued` covers a server cooldown putting the message back
    /// at the head of the queue without counting a retry.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Queued, Self::Sending | Self::Cancelled)
                | (
                    Self::Sending,
                    Self::Succeeded | Self::Retrying | Self::Failed | Self::Queued
                )
                | (Self::Retrying, Self::Queued | Self::Cancelled)
        )
    }
}

impl fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Queued => "queued",
            Self::Sending => "sending",
            Self::Succeeded => "succeeded",
            Self::Retrying => "retrying",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// One failed attempt that led to a retry decision.
#[derive(Debug, Clone)]
pub struct RetryRecord {
    /// When the failure was recorded.
    pub at: DateTime<Utc>,
    /// The failure.
    pub error: TransportError,
}

/// Successful delivery of a queued message.
#[derive(Debug, Clone)]
pub struct Delivery {
    /// Message ID.
    pub id: String,
    /// Destination the message was sent to.
    pub target: String,
    /// Response returned by the transport.
    pub response: Value,
    /// Transport calls that failed before this one succeeded.
    pub retry_count: u32,
    /// Time between enqueue and delivery.
    pub queue_time: Duration,
}

/// Outcome a producer receives for a queued message.
pub type DeliveryResult = Result<Delivery, SendError>;

/// Future resolving to the outcome of a queued message.
#[derive(Debug)]
#[must_use = "dropping the handle discards the delivery outcome"]
pub struct DeliveryHandle {
    id: String,
    rx: oneshot::Receiver<DeliveryResult>,
}

impl DeliveryHandle {
    /// ID of the message this handle tracks.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }
}

impl Future for DeliveryHandle {
    type Output = DeliveryResult;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let outcome = ready!(Pin::new(&mut self.rx).poll(cx));
        Poll::Ready(outcome.unwrap_or_else(|_| {
            Err(SendError::Dropped {
                id: self.id.clone(),
            })
        }))
    }
}

/// A message moving through the pipeline.
///
/// The queue owns a message until the scheduler pops it; from then on the
/// scheduler owns it until it settles or goes back into the queue.
#[derive(Debug)]
pub struct Message {
    id: String,
    target: String,
    payload: Value,
    priority: Priority,
    status: MessageStatus,
    retry_count: u32,
    retry_history: Vec<RetryRecord>,
    created_at: DateTime<Utc>,
    enqueued_at: Instant,
    pub(crate) sequence: u64,
    responder: Option<oneshot::Sender<DeliveryResult>>,
}

impl Message {
    /// Create a queued message and the handle that observes its outcome.
    pub fn new(
        id: impl Into<String>,
        target: impl Into<String>,
        payload: Value,
        priority: Priority,
        enqueued_at: Instant,
    ) -> (Self, DeliveryHandle) {
        let id = id.into();
        let (tx, rx) = oneshot::channel();
        let message = Self {
            id: id.clone(),
            target: target.into(),
            payload,
            priority,
            status: MessageStatus::Queued,
            retry_count: 0,
            retry_history: Vec::new(),
            created_at: Utc::now(),
            enqueued_at,
            sequence: 0,
            responder: Some(tx),
        };
        (message, DeliveryHandle { id, rx })
    }

    /// Message ID.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Destination.
    #[must_use]
    pub fn target(&self) -> &str {
        &self.target
    }

    /// Content to send.
    #[must_use]
    pub const fn payload(&self) -> &Value {
        &self.payload
    }

    /// Delivery priority.
    #[must_use]
    pub const fn priority(&self) -> Priority {
        self.priority
    }

    /// Current lifecycle state.
    #[must_use]
    pub const fn status(&self) -> MessageStatus {
        self.status
    }

    /// Retries recorded so far.
    #[must_use]
    pub const fn retry_count(&self) -> u32 {
        self.retry_count
    }

    /// Every recorded retry, oldest first.
    #[must_use]
    pub fn retry_history(&self) -> &[RetryRecord] {
        &self.retry_history
    }

    /// Wall-clock creation time.
    #[must_use]
    pub const fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Monotonic enqueue time, used for queue-time metrics.
    #[must_use]
    pub const fn enqueued_at(&self) -> Instant {
        self.enqueued_at
    }

    /// Move to `next` if the state machine allows it.
    ///
    /// Returns `false` and leaves the status unchanged otherwise.
    pub fn transition(&mut self, next: MessageStatus) -> bool {
        if self.status.can_transition_to(next) {
            self.status = next;
            true
        } else {
            warn!(
                message_id = %self.id,
                from = %self.status,
                to = %next,
                "Rejected invalid message status transition"
            );
            false
        }
    }

    /// Append a failure to the retry history and bump the retry count.
    pub fn record_retry(&mut self, error: &TransportError) {
        self.retry_history.push(RetryRecord {
            at: Utc::now(),
            error: error.clone(),
        });
        self.retry_count += 1;
    }

    /// Whether the producer is still waiting on this message.
    #[must_use]
    pub const fn is_pending(&self) -> bool {
        self.responder.is_some()
    }

    /// Resolve the producer's handle with a successful delivery.
    pub fn succeed(&mut self, response: Value, now: Instant) -> bool {
        if !self.transition(MessageStatus::Succeeded) {
            return false;
        }
        let delivery = Delivery {
            id: self.id.clone(),
            target: self.target.clone(),
            response,
            retry_count: self.retry_count,
            queue_time: now.saturating_duration_since(self.enqueued_at),
        };
        self.settle(Ok(delivery))
    }

    /// Reject the producer's handle with the final transport error.
    pub fn fail(&mut self, error: TransportError) -> bool {
        if !self.transition(MessageStatus::Failed) {
            return false;
        }
        let rejection = SendError::Failed {
            id: self.id.clone(),
            error,
            retry_count: self.retry_count,
            retry_history: self.retry_history.clone(),
        };
        self.settle(Err(rejection))
    }

    /// Reject the producer's handle because the message left the queue undelivered.
    pub fn cancel(&mut self, reason: &str) -> bool {
        if !self.transition(MessageStatus::Cancelled) {
            return false;
        }
        let rejection = SendError::Cancelled {
            id: self.id.clone(),
            reason: reason.to_string(),
        };
        self.settle(Err(rejection))
    }

    /// Settle at most once; later calls are ignored.
    fn settle(&mut self, outcome: DeliveryResult) -> bool {
        match self.responder.take() {
            // A dropped handle is not an error: the producer stopped listening.
            Some(tx) => {
                let _ = tx.send(outcome);
                true
            }
            None => false,
        }
    }

    /// Introspection view of this message.
    #[must_use]
    pub fn info(&self) -> MessageInfo {
        MessageInfo {
            id: self.id.clone(),
            target: self.target.clone(),
            priority: self.priority,
            status: self.status,
            retry_count: self.retry_count,
            created_at: self.created_at,
        }
    }
}

/// Read-only summary of a queued message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageInfo {
    /// Message ID.
    pub id: String,
    /// Destination.
    pub target: String,
    /// Delivery priority.
    pub priority: Priority,
    /// Current lifecycle state.
    pub status: MessageStatus,
    /// Retries recorded so far.
    pub retry_count: u32,
    /// Wall-clock creation time.
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;

    fn message() -> (Message, DeliveryHandle) {
        Message::new(
            "m1",
            "channel-1",
            json!({"content": "hi"}),
            Priority::Normal,
            Instant::now(),
        )
    }

    #[test]
    fn test_priority_order() {
        assert!(Priority::Urgent > Priority::High);
        assert!(Priority::High > Priority::Normal);
        assert!(Priority::Normal > Priority::Low);
        assert_eq!(Priority::default(), Priority::Normal);
    }

    #[test]
    fn test_state_machine() {
        use MessageStatus::*;

        assert!(Queued.can_transition_to(Sending));
        assert!(Queued.can_transition_to(Cancelled));
        assert!(Sending.can_transition_to(Retrying));
        assert!(Sending.can_transition_to(Queued));
        assert!(Retrying.can_transition_to(Queued));
        assert!(!Queued.can_transition_to(Succeeded));
        assert!(!Succeeded.can_transition_to(Queued));
        assert!(!Failed.can_transition_to(Retrying));
        assert!(!Cancelled.can_transition_to(Queued));
        assert!(Failed.is_terminal());
        assert!(!Retrying.is_terminal());
    }

    #[test]
    fn test_invalid_transition_is_rejected() {
        let (mut msg, _handle) = message();
        assert!(!msg.transition(MessageStatus::Succeeded));
        assert_eq!(msg.status(), MessageStatus::Queued);
    }

    #[test]
    fn test_record_retry() {
        let (mut msg, _handle) = message();
        msg.record_retry(&TransportError::new("reset").with_code("ECONNRESET"));
        msg.record_retry(&TransportError::new("timeout").with_code("ETIMEDOUT"));

        assert_eq!(msg.retry_count(), 2);
        assert_eq!(msg.retry_history().len(), 2);
        assert_eq!(msg.retry_history()[1].error.message, "timeout");
    }

    #[tokio::test]
    async fn test_settles_exactly_once() {
        let (mut msg, handle) = message();
        assert!(msg.transition(MessageStatus::Sending));
        assert!(msg.succeed(json!({"id": "remote-1"}), Instant::now()));

        // Terminal: nothing further can settle or change the state.
        assert!(!msg.fail(TransportError::new("late")));
        assert!(!msg.is_pending());
        assert_eq!(msg.status(), MessageStatus::Succeeded);

        let delivery = handle.await.unwrap();
        assert_eq!(delivery.id, "m1");
        assert_eq!(delivery.response["id"], "remote-1");
    }

    #[tokio::test]
    async fn test_fail_carries_history() {
        let (mut msg, handle) = message();
        msg.transition(MessageStatus::Sending);
        msg.record_retry(&TransportError::new("reset"));
        msg.fail(TransportError::new("gave up"));

        match handle.await {
            Err(SendError::Failed {
                retry_count,
                retry_history,
                error,
                ..
            }) => {
                assert_eq!(retry_count, 1);
                assert_eq!(retry_history.len(), 1);
                assert_eq!(error.message, "gave up");
            }
            other => panic!("Expected Failed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_dropped_message_rejects_handle() {
        let (msg, handle) = message();
        drop(msg);
        assert!(matches!(handle.await, Err(SendError::Dropped { ref id }) if id == "m1"));
    }
}
