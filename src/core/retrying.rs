//! Bounded-retry delivery of payloads.
//!
//! [`RetryingPublisher::submit`] never waits: it appends to a bounded queue
//! and returns. A worker task takes payloads off the queue and runs each one
//! through its own state machine:
//!
//! ```text
//! Pending ──> Attempting ──(ack)──────────────> Delivered
//!                 │  ▲
//!          (error)│  │(delay elapsed)
//!                 ▼  │
//!               Backoff ──(attempts spent)──> Exhausted
//!
//! shutdown: Pending/Backoff ──> Abandoned
//! ```
//!
//! The delay before retry `k` is `min(base * 2^(k-1), max_delay)`, optionally
//! drawn from `[d/2, d]`. When the queue is full the oldest pending payload
//! is evicted and counted as dropped.

use std::{
    collections::VecDeque,
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
    time::Duration,
};

use serde::Serialize;
use thiserror::Error;
use tokio::{
    sync::{broadcast, Notify, Semaphore},
    task::{JoinHandle, JoinSet},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};
use weatherbee_mqtt::Backoff;

use super::{
    client::{MessageId, PublishClient, PublishError},
    encoder::Payload,
};
use crate::config::delivery::DeliveryConfig;

const REPORT_CHANNEL_CAPACITY: usize = 256;

/// Returned by [`RetryingPublisher::submit`] when the queue overflowed.
///
/// The submitted payload was accepted; the one carried here was evicted.
#[derive(Error, Debug)]
#[error("Delivery queue full, dropped payload #{}", .dropped.sequence())]
pub struct QueueFullError {
    dropped: Payload,
}

impl QueueFullError {
    pub fn dropped(&self) -> &Payload {
        &self.dropped
    }

    pub fn into_dropped(self) -> Payload {
        self.dropped
    }
}

#[derive(Error, Debug)]
pub enum SubmitError {
    #[error(transparent)]
    QueueFull(#[from] QueueFullError),

    #[error("Publisher is shutting down")]
    Closed,
}

/// Retry budget and delay schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_delay: Duration,
    max_delay: Duration,
    jitter: bool,
}

impl RetryPolicy {
    /// `max_attempts` counts the first attempt and is raised to at least 1.
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration, jitter: bool) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay: max_delay.max(base_delay),
            jitter,
        }
    }

    pub fn from_config(config: &DeliveryConfig) -> Self {
        Self::new(
            config.max_attempts,
            config.base_delay(),
            config.max_delay(),
            config.jitter,
        )
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn base_delay(&self) -> Duration {
        self.base_delay
    }

    pub fn max_delay(&self) -> Duration {
        self.max_delay
    }

    pub fn jitter(&self) -> bool {
        self.jitter
    }

    /// Fresh delay schedule for one payload. Retry `k` waits
    /// `min(base * 2^(k-1), max_delay)`. The attempt budget is enforced by
    /// the caller, so the schedule itself is unbounded.
    fn schedule(&self) -> Backoff {
        Backoff::new(self.base_delay, self.max_delay, 2.0)
            .with_max_attempts(0)
            .with_jitter(self.jitter)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&DeliveryConfig::default())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryState {
    Pending,
    Attempting,
    Backoff,
    Delivered,
    Exhausted,
    Abandoned,
}

impl DeliveryState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DeliveryState::Delivered | DeliveryState::Exhausted | DeliveryState::Abandoned
        )
    }
}

impl fmt::Display for DeliveryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DeliveryState::Pending => "pending",
            DeliveryState::Attempting => "attempting",
            DeliveryState::Backoff => "backoff",
            DeliveryState::Delivered => "delivered",
            DeliveryState::Exhausted => "exhausted",
            DeliveryState::Abandoned => "abandoned",
        };
        f.write_str(name)
    }
}

/// Delivery progress of a single payload. Lives only while the payload is
/// being delivered.
#[derive(Debug)]
pub struct PublishAttempt {
    payload: Payload,
    attempt_count: u32,
    last_error: Option<PublishError>,
    state: DeliveryState,
}

impl PublishAttempt {
    fn new(payload: Payload) -> Self {
        Self {
            payload,
            attempt_count: 0,
            last_error: None,
            state: DeliveryState::Pending,
        }
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn attempt_count(&self) -> u32 {
        self.attempt_count
    }

    pub fn last_error(&self) -> Option<&PublishError> {
        self.last_error.as_ref()
    }

    pub fn state(&self) -> DeliveryState {
        self.state
    }

    fn transition(&mut self, next: DeliveryState) {
        trace!(
            "Payload #{}: {} -> {}",
            self.payload.sequence(),
            self.state,
            next
        );
        self.state = next;
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Delivered(MessageId),
    /// Carries the last publish error.
    Exhausted(String),
    /// Evicted from a full queue before any attempt.
    Dropped,
    /// Discarded at shutdown.
    Abandoned,
}

/// Broadcast once per payload when it reaches a terminal state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryReport {
    pub sequence: u64,
    pub attempts: u32,
    pub outcome: DeliveryOutcome,
}

#[derive(Debug, Default)]
pub struct DeliveryStats {
    submitted: AtomicU64,
    attempts: AtomicU64,
    retries: AtomicU64,
    delivered: AtomicU64,
    exhausted: AtomicU64,
    dropped: AtomicU64,
    abandoned: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DeliveryStatsSnapshot {
    pub submitted: u64,
    pub attempts: u64,
    pub retries: u64,
    pub delivered: u64,
    pub exhausted: u64,
    pub dropped: u64,
    pub abandoned: u64,
}

impl DeliveryStats {
    pub fn snapshot(&self) -> DeliveryStatsSnapshot {
        DeliveryStatsSnapshot {
            submitted: self.submitted.load(Ordering::Relaxed),
            attempts: self.attempts.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            exhausted: self.exhausted.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            abandoned: self.abandoned.load(Ordering::Relaxed),
        }
    }
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

#[derive(Debug, Default)]
struct Queue {
    items: VecDeque<Payload>,
    closed: bool,
}

struct Shared {
    queue: Mutex<Queue>,
    notify: Notify,
    capacity: usize,
    next_sequence: AtomicU64,
    stats: DeliveryStats,
    reports: broadcast::Sender<DeliveryReport>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Queue> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn next_payload(&self) -> Payload {
        loop {
            let notified = self.notify.notified();
            if let Some(payload) = self.lock().items.pop_front() {
                return payload;
            }
            notified.await;
        }
    }

    /// Stops accepting payloads and abandons everything still queued.
    fn close(&self) {
        let pending: Vec<Payload> = {
            let mut queue = self.lock();
            queue.closed = true;
            queue.items.drain(..).collect()
        };
        if !pending.is_empty() {
            warn!("Abandoning {} pending payload(s)", pending.len());
        }
        for payload in pending {
            self.settle(payload.sequence(), 0, DeliveryOutcome::Abandoned);
        }
    }

    fn settle(&self, sequence: u64, attempts: u32, outcome: DeliveryOutcome) {
        match &outcome {
            DeliveryOutcome::Delivered(_) => bump(&self.stats.delivered),
            DeliveryOutcome::Exhausted(_) => bump(&self.stats.exhausted),
            DeliveryOutcome::Dropped => bump(&self.stats.dropped),
            DeliveryOutcome::Abandoned => bump(&self.stats.abandoned),
        }
        let _ = self.reports.send(DeliveryReport {
            sequence,
            attempts,
            outcome,
        });
    }
}

/// Settles the attempt as abandoned if its task is dropped before reaching
/// a terminal state (aborted after the shutdown grace period, or panicked).
struct InFlight {
    attempt: PublishAttempt,
    shared: Arc<Shared>,
}

impl InFlight {
    fn finish(&mut self, state: DeliveryState, outcome: DeliveryOutcome) {
        self.attempt.transition(state);
        self.shared.settle(
            self.attempt.payload.sequence(),
            self.attempt.attempt_count,
            outcome,
        );
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        if !self.attempt.state.is_terminal() {
            warn!(
                "Payload #{} abandoned after {} attempt(s)",
                self.attempt.payload.sequence(),
                self.attempt.attempt_count
            );
            self.finish(DeliveryState::Abandoned, DeliveryOutcome::Abandoned);
        }
    }
}

struct Worker {
    shared: Arc<Shared>,
    client: Arc<dyn PublishClient>,
    policy: RetryPolicy,
    max_in_flight: usize,
    shutdown_grace: Duration,
    cancel: CancellationToken,
}

impl Worker {
    async fn run(self) {
        let slots = Arc::new(Semaphore::new(self.max_in_flight));
        let mut tasks = JoinSet::new();

        loop {
            let permit = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                Some(result) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(e) = result {
                        error!("Delivery task failed: {}", e);
                    }
                    continue;
                }
                permit = slots.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let payload = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                payload = self.shared.next_payload() => payload,
            };

            let attempt = InFlight {
                attempt: PublishAttempt::new(payload),
                shared: self.shared.clone(),
            };
            let client = self.client.clone();
            let policy = self.policy;
            let cancel = self.cancel.clone();
            tasks.spawn(async move {
                deliver(attempt, client.as_ref(), policy, cancel).await;
                drop(permit);
            });
        }

        if tasks.is_empty() {
            return;
        }

        debug!(
            "Waiting up to {:?} for {} delivery attempt(s) to finish",
            self.shutdown_grace,
            tasks.len()
        );
        let drained = tokio::time::timeout(self.shutdown_grace, async {
            while tasks.join_next().await.is_some() {}
        })
        .await;

        if drained.is_err() {
            warn!(
                "Aborting {} delivery attempt(s) still running after {:?}",
                tasks.len(),
                self.shutdown_grace
            );
            tasks.shutdown().await;
        }
    }
}

async fn deliver(
    mut inflight: InFlight,
    client: &dyn PublishClient,
    policy: RetryPolicy,
    cancel: CancellationToken,
) {
    let shared = inflight.shared.clone();
    let mut schedule = policy.schedule();
    let sequence = inflight.attempt.payload.sequence();

    loop {
        let attempt = &mut inflight.attempt;
        attempt.transition(DeliveryState::Attempting);
        attempt.attempt_count += 1;
        bump(&shared.stats.attempts);
        if attempt.attempt_count > 1 {
            bump(&shared.stats.retries);
        }

        match client.publish(&attempt.payload).await {
            Ok(message_id) => {
                debug!(
                    "Payload #{} delivered as {} after {} attempt(s)",
                    sequence, message_id, attempt.attempt_count
                );
                inflight.finish(
                    DeliveryState::Delivered,
                    DeliveryOutcome::Delivered(message_id),
                );
                return;
            }
            Err(e) => {
                warn!(
                    "Payload #{} attempt {}/{} failed: {}",
                    sequence,
                    attempt.attempt_count,
                    policy.max_attempts(),
                    e
                );
                attempt.last_error = Some(e);
            }
        }

        if attempt.attempt_count >= policy.max_attempts() {
            let last_error = attempt
                .last_error
                .as_ref()
                .map(ToString::to_string)
                .unwrap_or_default();
            error!(
                "Payload #{} exhausted after {} attempt(s), discarding: {}",
                sequence, attempt.attempt_count, last_error
            );
            inflight.finish(
                DeliveryState::Exhausted,
                DeliveryOutcome::Exhausted(last_error),
            );
            return;
        }

        let delay = schedule.next_sleep().unwrap_or(policy.max_delay());
        attempt.transition(DeliveryState::Backoff);
        debug!("Payload #{} retrying in {:?}", sequence, delay);

        tokio::select! {
            biased;
            // Dropping `inflight` settles it as abandoned.
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

/// Accepts payloads without blocking and delivers them in the background.
///
/// Must be created inside a Tokio runtime.
pub struct RetryingPublisher {
    shared: Arc<Shared>,
    policy: RetryPolicy,
    cancel: CancellationToken,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl RetryingPublisher {
    pub fn new(client: Arc<dyn PublishClient>, config: &DeliveryConfig) -> Self {
        Self::with_policy(
            client,
            RetryPolicy::from_config(config),
            config.queue_capacity,
            config.max_in_flight,
            config.shutdown_grace(),
        )
    }

    /// `queue_capacity` and `max_in_flight` are raised to at least 1.
    pub fn with_policy(
        client: Arc<dyn PublishClient>,
        policy: RetryPolicy,
        queue_capacity: usize,
        max_in_flight: usize,
        shutdown_grace: Duration,
    ) -> Self {
        let (reports, _) = broadcast::channel(REPORT_CHANNEL_CAPACITY);
        let shared = Arc::new(Shared {
            queue: Mutex::new(Queue::default()),
            notify: Notify::new(),
            capacity: queue_capacity.max(1),
            next_sequence: AtomicU64::new(0),
            stats: DeliveryStats::default(),
            reports,
        });
        let cancel = CancellationToken::new();

        let worker = Worker {
            shared: shared.clone(),
            client,
            policy,
            max_in_flight: max_in_flight.max(1),
            shutdown_grace,
            cancel: cancel.clone(),
        };
        let handle = tokio::spawn(worker.run());

        info!(
            "Delivery started: {} attempt(s), delay {:?}..{:?}, jitter {}, queue {}, in flight {}",
            policy.max_attempts(),
            policy.base_delay(),
            policy.max_delay(),
            policy.jitter(),
            shared.capacity,
            max_in_flight.max(1)
        );

        Self {
            shared,
            policy,
            cancel,
            worker: Mutex::new(Some(handle)),
        }
    }

    /// Queues `payload` for delivery and returns immediately.
    ///
    /// On overflow the new payload is still queued and the oldest pending
    /// one is returned inside [`SubmitError::QueueFull`].
    pub fn submit(&self, payload: Payload) -> Result<(), SubmitError> {
        let evicted = {
            let mut queue = self.shared.lock();
            if queue.closed {
                return Err(SubmitError::Closed);
            }

            let sequence = self.shared.next_sequence.fetch_add(1, Ordering::Relaxed) + 1;
            queue.items.push_back(payload.with_sequence(sequence));
            bump(&self.shared.stats.submitted);
            trace!("Payload #{} queued ({} pending)", sequence, queue.items.len());

            if queue.items.len() > self.shared.capacity {
                queue.items.pop_front()
            } else {
                None
            }
        };
        self.shared.notify.notify_one();

        match evicted {
            Some(dropped) => {
                warn!(
                    "Delivery queue full ({}), dropped oldest payload #{}",
                    self.shared.capacity,
                    dropped.sequence()
                );
                self.shared
                    .settle(dropped.sequence(), 0, DeliveryOutcome::Dropped);
                Err(QueueFullError { dropped }.into())
            }
            None => Ok(()),
        }
    }

    /// Terminal outcome of every payload submitted after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<DeliveryReport> {
        self.shared.reports.subscribe()
    }

    pub fn stats(&self) -> DeliveryStatsSnapshot {
        self.shared.stats.snapshot()
    }

    pub fn pending(&self) -> usize {
        self.shared.lock().items.len()
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn is_closed(&self) -> bool {
        self.shared.lock().closed
    }

    /// Stops accepting payloads and winds down delivery.
    ///
    /// Pending payloads and payloads waiting to retry are abandoned.
    /// Attempts already talking to the broker get the shutdown grace period
    /// to finish, then are aborted. Safe to call more than once.
    pub async fn shutdown(&self) -> DeliveryStatsSnapshot {
        self.shared.close();
        self.cancel.cancel();
        let worker = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = worker {
            if let Err(e) = handle.await {
                error!("Delivery worker failed: {}", e);
            }
        }

        let stats = self.stats();
        info!(
            "Delivery stopped: {} delivered, {} exhausted, {} dropped, {} abandoned",
            stats.delivered, stats.exhausted, stats.dropped, stats.abandoned
        );
        stats
    }
}

impl Drop for RetryingPublisher {
    fn drop(&mut self) {
        self.shared.close();
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU32;

    use async_trait::async_trait;
    use tokio::time::Instant;
    use tracing_test::traced_test;

    use super::*;

    /// Fails the first `failures` calls, then succeeds.
    struct FlakyClient {
        failures: u32,
        calls: AtomicU32,
        at: Mutex<Vec<Instant>>,
    }

    impl FlakyClient {
        fn new(failures: u32) -> Arc<Self> {
            Arc::new(Self {
                failures,
                calls: AtomicU32::new(0),
                at: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl PublishClient for FlakyClient {
        async fn publish(&self, payload: &Payload) -> Result<MessageId, PublishError> {
            self.at.lock().unwrap().push(Instant::now());
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call <= self.failures {
                Err(PublishError::Unavailable(format!("call {call}")))
            } else {
                Ok(MessageId::new(payload.sequence().to_string()))
            }
        }
    }

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::new(
            max_attempts,
            Duration::from_secs(1),
            Duration::from_secs(8),
            false,
        )
    }

    #[test]
    fn test_delay_schedule() {
        let mut schedule = policy(6).schedule();
        let delays: Vec<_> = (0..8)
            .map(|_| schedule.next_sleep().unwrap().as_secs())
            .collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 8, 8, 8, 8]);
    }

    #[test]
    fn test_jittered_schedule_stays_within_half_to_full() {
        let policy = RetryPolicy::new(6, Duration::from_secs(1), Duration::from_secs(8), true);
        let mut schedule = policy.schedule();
        for want in [1, 2, 4, 8, 8].map(Duration::from_secs) {
            let delay = schedule.next_sleep().unwrap();
            assert!(
                delay >= want / 2 && delay <= want,
                "delay {delay:?} outside [{:?}, {want:?}]",
                want / 2
            );
        }
    }

    #[test]
    fn test_policy_clamps() {
        let policy = RetryPolicy::new(0, Duration::from_secs(5), Duration::from_secs(1), true);
        assert_eq!(policy.max_attempts(), 1);
        assert_eq!(policy.max_delay(), Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_delivered_after_transient_failures() {
        let client = FlakyClient::new(2);
        let publisher =
            RetryingPublisher::with_policy(client.clone(), policy(3), 8, 1, Duration::ZERO);
        let mut reports = publisher.subscribe();

        publisher.submit(Payload::new("a")).unwrap();
        let report = reports.recv().await.unwrap();

        assert_eq!(report.attempts, 3);
        assert!(matches!(report.outcome, DeliveryOutcome::Delivered(_)));
        assert_eq!(client.calls(), 3);

        let stats = publisher.stats();
        assert_eq!(stats.delivered, 1);
        assert_eq!(stats.retries, 2);
    }

    #[tokio::test(start_paused = true)]
    #[traced_test]
    async fn test_exhausted_after_max_attempts() {
        let client = FlakyClient::new(u32::MAX);
        let publisher =
            RetryingPublisher::with_policy(client.clone(), policy(4), 8, 1, Duration::ZERO);
        let mut reports = publisher.subscribe();

        publisher.submit(Payload::new("a")).unwrap();
        let report = reports.recv().await.unwrap();

        assert_eq!(report.attempts, 4);
        assert!(matches!(report.outcome, DeliveryOutcome::Exhausted(_)));

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(client.calls(), 4);
        assert_eq!(publisher.stats().exhausted, 1);
        assert!(logs_contain("exhausted after 4 attempt(s)"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_abandons_backoff() {
        let client = FlakyClient::new(u32::MAX);
        let publisher =
            RetryingPublisher::with_policy(client.clone(), policy(10), 8, 1, Duration::ZERO);
        let mut reports = publisher.subscribe();

        publisher.submit(Payload::new("a")).unwrap();
        while client.calls() == 0 {
            tokio::task::yield_now().await;
        }

        let stats = publisher.shutdown().await;
        assert_eq!(stats.abandoned, 1);
        assert_eq!(reports.recv().await.unwrap().outcome, DeliveryOutcome::Abandoned);
        assert!(matches!(
            publisher.submit(Payload::new("b")),
            Err(SubmitError::Closed)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_drop_abandons_queued_payloads() {
        let client = FlakyClient::new(u32::MAX);
        let publisher =
            RetryingPublisher::with_policy(client.clone(), policy(10), 8, 1, Duration::ZERO);
        let mut reports = publisher.subscribe();

        for body in ["a", "b", "c"] {
            publisher.submit(Payload::new(body)).unwrap();
        }
        while client.calls() == 0 {
            tokio::task::yield_now().await;
        }
        drop(publisher);

        let mut abandoned = Vec::new();
        while let Ok(report) = reports.recv().await {
            assert_eq!(report.outcome, DeliveryOutcome::Abandoned);
            abandoned.push(report.sequence);
        }
        abandoned.sort_unstable();
        assert_eq!(abandoned, vec![1, 2, 3]);
        assert_eq!(client.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sequence_numbers_increase() {
        let client = FlakyClient::new(0);
        let publisher =
            RetryingPublisher::with_policy(client.clone(), policy(1), 8, 1, Duration::ZERO);
        let mut reports = publisher.subscribe();

        for _ in 0..3 {
            publisher.submit(Payload::new("a")).unwrap();
        }
        let sequences: Vec<u64> = [
            reports.recv().await.unwrap(),
            reports.recv().await.unwrap(),
            reports.recv().await.unwrap(),
        ]
        .iter()
        .map(|r| r.sequence)
        .collect();

        assert_eq!(sequences, vec![1, 2, 3]);
    }
}
