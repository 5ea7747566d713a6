//! The single drain loop moving messages from the queue to the transport.
//!
//! One worker task owns every send. Each step promotes due retries, asks the
//! rate limiter for authorization, hands the head message to the transport
//! and settles the outcome. Shared state sits behind one mutex that is never
//! held across an await, so producers can enqueue while a send is in flight.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use herald_common::{DeliveryConfig, DeliveryMetrics};
use rand::Rng;
use serde_json::Value;
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::clock::Clock;
use crate::error::{RateLimitKind, TransportError};
use crate::events::{EventBus, SenderEvent};
use crate::message::{Message, MessageStatus};
use crate::queue::MessageQueue;
use crate::rate_limit::{RateLimitConfig, RateLimiter};
use crate::retry::{RetryHandler, RetryPolicy};
use crate::transport::Transport;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Everything the drain loop mutates.
#[derive(Debug)]
pub(crate) struct PipelineState {
    pub(crate) queue: MessageQueue,
    pub(crate) limiter: RateLimiter,
    pub(crate) retry: RetryHandler,
    pub(crate) in_flight: usize,
}

impl PipelineState {
    /// Messages not yet settled: queued, waiting on a retry, or being sent.
    fn pending(&self) -> usize {
        self.queue.len() + self.in_flight
    }
}

/// Waits between steps.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct Timing {
    /// Pause after every send.
    pub(crate) send_delay: Duration,
    /// Proportional randomization of `send_delay`.
    pub(crate) jitter_factor: f64,
    /// Re-check interval while idle. `None` waits for a wake-up only.
    pub(crate) idle_poll: Option<Duration>,
}

impl From<&DeliveryConfig> for Timing {
    fn from(config: &DeliveryConfig) -> Self {
        if config.test_mode {
            return Self {
                send_delay: Duration::ZERO,
                jitter_factor: 0.0,
                idle_poll: None,
            };
        }

        Self {
            send_delay: config.base_send_delay(),
            jitter_factor: if config.jitter_enabled {
                config.jitter_factor
            } else {
                0.0
            },
            idle_poll: Some(config.idle_poll_interval()).filter(|interval| !interval.is_zero()),
        }
    }
}

/// What the next step should do.
enum Action {
    Send(Message),
    Idle,
    Throttled(Duration),
    Waiting(Duration),
}

/// What one step did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Step {
    /// A message went to the transport.
    Sent,
    /// Nothing is pending.
    Idle,
    /// The rate limiter denied the head message for this long.
    Throttled(Duration),
    /// Only delayed retries remain; the earliest is due after this long.
    Waiting(Duration),
}

/// Shared core of a sender: state, collaborators and signals.
pub(crate) struct Pipeline {
    state: Mutex<PipelineState>,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) events: EventBus,
    pub(crate) metrics: DeliveryMetrics,
    timing: Timing,
    wake: Notify,
    pending: watch::Sender<usize>,
}

impl Pipeline {
    pub(crate) fn new(
        config: &DeliveryConfig,
        transport: Arc<dyn Transport>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let state = PipelineState {
            queue: MessageQueue::new(),
            limiter: RateLimiter::new(RateLimitConfig::from(config), Arc::clone(&clock)),
            retry: RetryHandler::new(RetryPolicy::from(config)),
            in_flight: 0,
        };
        let (pending, _) = watch::channel(0);

        Self {
            state: Mutex::new(state),
            transport,
            clock,
            events: EventBus::new(config.event_capacity),
            metrics: DeliveryMetrics::new(),
            timing: Timing::from(config),
            wake: Notify::new(),
            pending,
        }
    }

    /// Run `f` against the shared state, then publish the pending count.
    pub(crate) fn with_state<R>(&self, f: impl FnOnce(&mut PipelineState) -> R) -> R {
        let mut state = lock(&self.state);
        let result = f(&mut *state);
        self.pending.send_replace(state.pending());
        result
    }

    /// Add a message to the queue and wake the worker. Returns the queue length.
    pub(crate) fn enqueue(&self, message: Message) -> usize {
        let queue_length = self.with_state(|state| {
            state.queue.push(message);
            state.queue.len()
        });
        self.wake.notify_one();
        queue_length
    }

    /// Watch the number of unsettled messages.
    pub(crate) fn watch_pending(&self) -> watch::Receiver<usize> {
        self.pending.subscribe()
    }

    /// Run one drain step.
    pub(crate) async fn step(&self) -> Step {
        let message = match self.next_action() {
            Action::Send(message) => message,
            Action::Idle => return Step::Idle,
            Action::Throttled(wait) => return Step::Throttled(wait),
            Action::Waiting(wait) => return Step::Waiting(wait),
        };

        let result = self
            .transport
            .send(message.target(), message.payload())
            .await;
        self.settle(message, result);
        Step::Sent
    }

    fn next_action(&self) -> Action {
        self.with_state(|state| {
            let now = self.clock.now();
            let promoted = state.queue.promote_due(now);
            if promoted > 0 {
                debug!(promoted, "Promoted due retries");
            }

            let Some(head) = state.queue.peek() else {
                return state
                    .queue
                    .next_due_in(now)
                    .map_or(Action::Idle, Action::Waiting);
            };
            let head_id = head.id().to_string();

            if let Err(denied) = state.limiter.check_rate_limit() {
                debug!(
                    message_id = %head_id,
                    kind = %denied.kind,
                    retry_after_ms = denied.retry_after.as_millis() as u64,
                    "Send held by rate limiter"
                );
                if denied.kind == RateLimitKind::Proactive {
                    self.events.emit(SenderEvent::RateLimited {
                        kind: denied.kind,
                        retry_after_ms: denied.retry_after.as_millis() as u64,
                        reason: denied.message,
                        message_id: Some(head_id),
                    });
                }
                return Action::Throttled(denied.retry_after);
            }

            match state.queue.pop() {
                Some(mut message) => {
                    message.transition(MessageStatus::Sending);
                    state.in_flight += 1;
                    debug!(
                        message_id = %message.id(),
                        channel = %message.target(),
                        retry_count = message.retry_count(),
                        "Sending message"
                    );
                    Action::Send(message)
                }
                None => Action::Idle,
            }
        })
    }

    fn settle(&self, message: Message, result: Result<Value, TransportError>) {
        self.with_state(|state| {
            state.in_flight = state.in_flight.saturating_sub(1);
            match result {
                Ok(response) => self.complete(state, message, response),
                Err(error) => self.handle_failure(state, message, error),
            }
        });
    }

    fn complete(&self, state: &mut PipelineState, mut message: Message, response: Value) {
        let now = self.clock.now();
        let queue_time = now.saturating_duration_since(message.enqueued_at());

        if message.retry_count() > 0 {
            state.retry.mark_retry_success();
        }
        self.metrics.record_success(queue_time);

        info!(
            message_id = %message.id(),
            channel = %message.target(),
            retry_count = message.retry_count(),
            queue_time_ms = queue_time.as_millis() as u64,
            "Message delivered"
        );
        self.events.emit(SenderEvent::MessageProcessed {
            id: message.id().to_string(),
            target: message.target().to_string(),
            retry_count: message.retry_count(),
            response: response.clone(),
        });
        message.succeed(response, now);
    }

    fn handle_failure(&self, state: &mut PipelineState, mut message: Message, error: TransportError) {
        if RateLimiter::is_rate_limit_error(&error) {
            let pause = state.limiter.handle_rate_limit(&error);
            self.events.emit(SenderEvent::RateLimited {
                kind: RateLimitKind::Reactive,
                retry_after_ms: pause.as_millis() as u64,
                reason: error.message.clone(),
                message_id: Some(message.id().to_string()),
            });
            state.queue.requeue_front(message);
            return;
        }

        if !state.retry.should_retry(&error, message.retry_count()) {
            self.give_up(state, message, error);
            return;
        }

        let decision = state.retry.handle_retry(&mut message, &error);
        if !decision.should_retry {
            self.give_up(state, message, error);
            return;
        }

        warn!(
            message_id = %message.id(),
            retry_count = decision.retry_count,
            max_retries = decision.max_retries,
            delay_ms = decision.retry_delay.as_millis() as u64,
            error = %error,
            "Message send failed, retrying"
        );
        self.events.emit(SenderEvent::MessageRetry {
            id: message.id().to_string(),
            retry_count: decision.retry_count,
            delay_ms: decision.retry_delay.as_millis() as u64,
            error: error.message.clone(),
        });

        message.transition(MessageStatus::Retrying);
        let now = self.clock.now();
        let due = now.checked_add(decision.retry_delay).unwrap_or(now);
        state.queue.schedule_retry(message, due);
    }

    fn give_up(&self, state: &mut PipelineState, mut message: Message, error: TransportError) {
        if message.retry_count() > 0 {
            state.retry.mark_retry_failure();
        }
        self.metrics.record_failure();

        error!(
            message_id = %message.id(),
            channel = %message.target(),
            retry_count = message.retry_count(),
            error = %error,
            "Message delivery failed"
        );
        self.events.emit(SenderEvent::MessageFailed {
            id: message.id().to_string(),
            retry_count: message.retry_count(),
            error: error.message.clone(),
        });
        message.fail(error);
    }

    /// Pause after a send, randomized by the jitter factor.
    fn pacing_delay(&self) -> Duration {
        let Timing {
            send_delay,
            jitter_factor,
            ..
        } = self.timing;
        if send_delay.is_zero() || jitter_factor <= 0.0 {
            return send_delay;
        }
        let spread = rand::thread_rng().gen_range(0.0..1.0) - 0.5;
        send_delay.mul_f64(jitter_factor.mul_add(spread, 1.0).max(0.0))
    }
}

async fn idle_wait(interval: Option<Duration>) {
    match interval {
        Some(interval) => tokio::time::sleep(interval).await,
        None => std::future::pending().await,
    }
}

/// The drain loop. Exits once `stop` flips to `true` or its sender is
/// dropped; an in-flight send always completes first.
async fn run(pipeline: Arc<Pipeline>, mut stop: watch::Receiver<bool>) {
    info!("Message processing started");

    loop {
        let stopped = *stop.borrow();
        if stopped {
            break;
        }

        match pipeline.step().await {
            Step::Sent => {
                let pause = pipeline.pacing_delay();
                if pause.is_zero() {
                    tokio::task::yield_now().await;
                } else {
                    tokio::select! {
                        () = pipeline.clock.sleep(pause) => {}
                        changed = stop.changed() => {
                            if changed.is_err() {
                                break;
                            }
                        }
                    }
                }
            }
            Step::Throttled(wait) => {
                tokio::select! {
                    () = pipeline.clock.sleep(wait) => {}
                    changed = stop.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
            }
            Step::Waiting(wait) => {
                tokio::select! {
                    () = pipeline.clock.sleep(wait) => {}
                    () = pipeline.wake.notified() => {}
                    changed = stop.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
            }
            Step::Idle => {
                debug!("Queue empty, waiting for messages");
                tokio::select! {
                    () = pipeline.wake.notified() => {}
                    () = idle_wait(pipeline.timing.idle_poll) => {}
                    changed = stop.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
            }
        }
    }

    info!("Message processing stopped");
    pipeline.events.emit(SenderEvent::ProcessingStopped);
}

struct Worker {
    stop: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Starts and stops the drain loop of one pipeline.
pub struct ProcessingScheduler {
    pipeline: Arc<Pipeline>,
    worker: Mutex<Option<Worker>>,
}

impl ProcessingScheduler {
    pub(crate) fn new(pipeline: Arc<Pipeline>) -> Self {
        Self {
            pipeline,
            worker: Mutex::new(None),
        }
    }

    /// Spawn the drain loop. Returns `false` if it is already running.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&self) -> bool {
        let mut worker = lock(&self.worker);
        if worker
            .as_ref()
            .is_some_and(|worker| !worker.handle.is_finished())
        {
            debug!("Message processing already running");
            return false;
        }

        let (stop, stop_rx) = watch::channel(false);
        let handle = tokio::spawn(run(Arc::clone(&self.pipeline), stop_rx));
        *worker = Some(Worker { stop, handle });
        self.pipeline.events.emit(SenderEvent::ProcessingStarted);
        true
    }

    /// Stop the drain loop after any in-flight send completes.
    ///
    /// Returns `false` if it was not running.
    pub async fn stop(&self) -> bool {
        let worker = lock(&self.worker).take();
        let Some(worker) = worker else {
            return false;
        };

        let _ = worker.stop.send(true);
        if let Err(e) = worker.handle.await {
            error!(error = %e, "Message processing task failed");
        }
        true
    }

    /// Whether the drain loop is running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        lock(&self.worker)
            .as_ref()
            .is_some_and(|worker| !worker.handle.is_finished())
    }
}

impl std::fmt::Debug for ProcessingScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessingScheduler")
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::message::Priority;
    use async_trait::async_trait;
    use serde_json::json;

    /// Fails every send with a fixed error, or succeeds when none is set.
    struct FixedTransport(Option<TransportError>);

    #[async_trait]
    impl Transport for FixedTransport {
        async fn send(&self, _target: &str, _payload: &Value) -> Result<Value, TransportError> {
            match &self.0 {
                Some(error) => Err(error.clone()),
                None => Ok(json!({"ok": true})),
            }
        }
    }

    fn pipeline(error: Option<TransportError>) -> (Pipeline, ManualClock) {
        let clock = ManualClock::new();
        let pipeline = Pipeline::new(
            &DeliveryConfig::for_tests(),
            Arc::new(FixedTransport(error)),
            Arc::new(clock.clone()),
        );
        (pipeline, clock)
    }

    fn enqueue(pipeline: &Pipeline, id: &str) -> crate::message::DeliveryHandle {
        let (message, handle) =
            Message::new(id, "c1", json!({}), Priority::Normal, pipeline.clock.now());
        pipeline.enqueue(message);
        handle
    }

    #[test]
    fn test_timing_in_test_mode() {
        let timing = Timing::from(&DeliveryConfig::for_tests());
        assert_eq!(timing.send_delay, Duration::ZERO);
        assert_eq!(timing.idle_poll, None);

        let timing = Timing::from(&DeliveryConfig::default());
        assert_eq!(timing.send_delay, Duration::from_secs(1));
        assert_eq!(timing.idle_poll, Some(Duration::from_secs(1)));
    }

    #[tokio::test]
    async fn test_step_on_empty_queue_is_idle() {
        let (pipeline, _clock) = pipeline(None);
        assert_eq!(pipeline.step().await, Step::Idle);
    }

    #[tokio::test]
    async fn test_step_delivers_head() {
        let (pipeline, _clock) = pipeline(None);
        let handle = enqueue(&pipeline, "m1");
        assert_eq!(*pipeline.watch_pending().borrow(), 1);

        assert_eq!(pipeline.step().await, Step::Sent);
        assert_eq!(handle.await.unwrap().response["ok"], true);
        assert_eq!(*pipeline.watch_pending().borrow(), 0);
        assert_eq!(pipeline.metrics.snapshot().successful_sends, 1);
    }

    #[tokio::test]
    async fn test_step_schedules_retry_then_waits() {
        let (pipeline, clock) = pipeline(Some(TransportError::new("reset").with_code("ECONNRESET")));
        let _handle = enqueue(&pipeline, "m1");

        assert_eq!(pipeline.step().await, Step::Sent);
        assert_eq!(pipeline.step().await, Step::Waiting(Duration::from_secs(1)));

        clock.advance(Duration::from_secs(1));
        assert_eq!(pipeline.step().await, Step::Sent);
        assert_eq!(pipeline.step().await, Step::Waiting(Duration::from_secs(2)));
    }

    #[tokio::test]
    async fn test_step_throttles_after_burst() {
        let (pipeline, _clock) = pipeline(None);
        let mut handles = Vec::new();
        for i in 0..6 {
            handles.push(enqueue(&pipeline, &format!("m{i}")));
        }

        for _ in 0..5 {
            assert_eq!(pipeline.step().await, Step::Sent);
        }
        assert_eq!(pipeline.step().await, Step::Throttled(Duration::from_secs(60)));
        assert_eq!(pipeline.with_state(|state| state.queue.len()), 1);
    }

    #[tokio::test]
    async fn test_scheduler_start_and_stop() {
        let (pipeline, _clock) = pipeline(None);
        let pipeline = Arc::new(pipeline);
        let scheduler = ProcessingScheduler::new(Arc::clone(&pipeline));
        let mut events = pipeline.events.subscribe();

        assert!(scheduler.start());
        assert!(!scheduler.start());
        assert!(scheduler.is_running());

        let handle = enqueue(&pipeline, "m1");
        handle.await.unwrap();

        assert!(scheduler.stop().await);
        assert!(!scheduler.is_running());
        assert!(!scheduler.stop().await);

        assert!(matches!(events.recv().await.unwrap(), SenderEvent::ProcessingStarted));
    }

    #[tokio::test]
    async fn test_dropped_scheduler_releases_pipeline() {
        let (pipeline, _clock) = pipeline(None);
        let pipeline = Arc::new(pipeline);
        let scheduler = ProcessingScheduler::new(Arc::clone(&pipeline));
        assert!(scheduler.start());
        drop(scheduler);

        tokio::time::timeout(Duration::from_secs(1), async {
            while Arc::strong_count(&pipeline) > 1 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
    }
}
