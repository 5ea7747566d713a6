//! Priority-ordered holding area for pending messages.

use std::cmp::{Ordering, Reverse};
use std::collections::{BTreeMap, BinaryHeap};
use std::time::{Duration, Instant};

use crate::message::{Message, MessageInfo, MessageStatus, Priority};

/// Heap entry ordering messages by priority, then arrival.
#[derive(Debug)]
struct Ready(Message);

impl Ready {
    fn key(&self) -> (Priority, Reverse<u64>) {
        (self.0.priority(), Reverse(self.0.sequence))
    }
}

impl PartialEq for Ready {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for Ready {}

impl PartialOrd for Ready {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Ready {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key().cmp(&other.key())
    }
}

/// Pending messages: a ready heap plus retries waiting out their backoff.
///
/// Ready messages pop highest priority first, FIFO within a priority.
/// Delayed retries become ready once [`MessageQueue::promote_due`] sees their
/// due time pass.
#[derive(Debug, Default)]
pub struct MessageQueue {
    ready: BinaryHeap<Ready>,
    delayed: BTreeMap<(Instant, u64), Message>,
    next_sequence: u64,
}

impl MessageQueue {
    /// Create an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn assign_sequence(&mut self, message: &mut Message) {
        message.sequence = self.next_sequence;
        self.next_sequence += 1;
    }

    /// Append a fresh message behind everything of the same priority.
    pub fn push(&mut self, mut message: Message) {
        self.assign_sequence(&mut message);
        self.ready.push(Ready(message));
    }

    /// Put a message back at the position it was popped from.
    ///
    /// The original arrival order is kept, so the message is again the head
    /// unless something of higher priority arrived meanwhile.
    pub fn requeue_front(&mut self, mut message: Message) {
        message.transition(MessageStatus::Queued);
        self.ready.push(Ready(message));
    }

    /// Hold a retrying message until `due`.
    pub fn schedule_retry(&mut self, mut message: Message, due: Instant) {
        self.assign_sequence(&mut message);
        self.delayed.insert((due, message.sequence), message);
    }

    /// Move every retry whose due time has passed into the ready heap.
    ///
    /// Promoted retries queue behind messages of the same priority that
    /// arrived before the promotion.
    pub fn promote_due(&mut self, now: Instant) -> usize {
        let still_waiting = self.delayed.split_off(&(now, u64::MAX));
        let due = std::mem::replace(&mut self.delayed, still_waiting);
        let promoted = due.len();
        for (_, mut message) in due {
            message.transition(MessageStatus::Queued);
            self.push(message);
        }
        promoted
    }

    /// Time until the earliest delayed retry is due.
    #[must_use]
    pub fn next_due_in(&self, now: Instant) -> Option<Duration> {
        self.delayed
            .keys()
            .next()
            .map(|(due, _)| due.saturating_duration_since(now))
    }

    /// Highest priority ready message.
    #[must_use]
    pub fn peek(&self) -> Option<&Message> {
        self.ready.peek().map(|entry| &entry.0)
    }

    /// Remove and return the highest priority ready message.
    pub fn pop(&mut self) -> Option<Message> {
        self.ready.pop().map(|entry| entry.0)
    }

    /// Messages ready to send.
    #[must_use]
    pub fn ready_len(&self) -> usize {
        self.ready.len()
    }

    /// Retries waiting out a backoff.
    #[must_use]
    pub fn delayed_len(&self) -> usize {
        self.delayed.len()
    }

    /// All pending messages.
    #[must_use]
    pub fn len(&self) -> usize {
        self.ready.len() + self.delayed.len()
    }

    /// Whether nothing is pending.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Pending messages in drain order: ready ones first, then retries by due time.
    #[must_use]
    pub fn snapshot(&self) -> Vec<MessageInfo> {
        let mut ready: Vec<&Ready> = self.ready.iter().collect();
        ready.sort_by(|a, b| b.cmp(a));
        ready
            .into_iter()
            .map(|entry| entry.0.info())
            .chain(self.delayed.values().map(Message::info))
            .collect()
    }

    /// Cancel every pending message, rejecting each producer with `reason`.
    ///
    /// Returns the number of messages cancelled.
    pub fn clear(&mut self, reason: &str) -> usize {
        let ready = std::mem::take(&mut self.ready).into_vec();
        let delayed = std::mem::take(&mut self.delayed);

        let mut cancelled = 0;
        for mut message in ready
            .into_iter()
            .map(|entry| entry.0)
            .chain(delayed.into_values())
        {
            if message.cancel(reason) {
                cancelled += 1;
            }
        }
        cancelled
    }
}
