//! Rate-limited outbound message delivery for herald.
//!
//! This crate drains a priority queue of messages against a throttled chat
//! platform API:
//!
//! - **Queue**: Priority ordering, FIFO within a priority, delayed retries
//! - **Rate limiting**: Local burst budget plus server-issued cooldowns
//! - **Retry**: Failure classification and jittered exponential backoff
//! - **Scheduler**: A single drain loop on an injectable [`Clock`]
//! - **Sender**: The producer-facing facade with lifecycle events
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use herald_common::Config;
//! use herald_queue::{HttpTransport, QueueOptions, Sender};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = Config::load()?;
//! let transport = Arc::new(HttpTransport::new(&config.transport)?);
//! let sender = Sender::new(config.delivery, transport);
//! sender.start_processing();
//!
//! let handle = sender.queue_message(
//!     "123456",
//!     serde_json::json!({"content": "deploy finished"}),
//!     QueueOptions::default(),
//! )?;
//! let delivery = handle.await?;
//! println!("delivered {} after {} retries", delivery.id, delivery.retry_count);
//! # Ok(())
//! # }
//! ```

pub mod clock;
pub mod error;
pub mod events;
pub mod message;
pub mod queue;
pub mod rate_limit;
pub mod retry;
pub mod scheduler;
pub mod sender;
pub mod transport;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{ErrorCode, RateLimitError, RateLimitKind, SendError, TransportError};
pub use events::{EventBus, SenderEvent};
pub use message::{
    Delivery, DeliveryHandle, DeliveryResult, Message, MessageInfo, MessageStatus, Priority,
    QueueOptions, RetryRecord,
};
pub use queue::MessageQueue;
pub use rate_limit::{RateLimitConfig, RateLimitStatus, RateLimiter, RateLimiterMetrics};
pub use retry::{RetryDecision, RetryHandler, RetryMetrics, RetryPolicy};
pub use scheduler::ProcessingScheduler;
pub use sender::{SHUTDOWN_REASON, Sender, SenderMetrics};
pub use transport::{HttpTransport, Transport};
