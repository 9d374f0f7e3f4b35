//! Shared fixtures for sync integration tests.
#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

use fieldqueue_sync::{
    ConnectivityMonitor, DeliveryAdapter, DeliveryError, EntryId, EntryStore, InMemoryEntryStore,
    OfflineQueue, Outcome, QueueConfig, QueueCounts, QueueEntry, RetryPolicy, StoreError,
};

/// Delivery adapter that replays a script of outcomes, one per call, and
/// records what it was asked to deliver.
pub struct ScriptedAdapter {
    script: Mutex<VecDeque<Outcome>>,
    fallback: Outcome,
    delay: Option<Duration>,
    calls: Mutex<Vec<EntryId>>,
    accepted: Mutex<Vec<EntryId>>,
}

impl ScriptedAdapter {
    pub fn new(script: impl IntoIterator<Item = Outcome>) -> Self {
        Self {
            script: Mutex::new(script.into_iter().collect()),
            fallback: Outcome::Success,
            delay: None,
            calls: Mutex::new(Vec::new()),
            accepted: Mutex::new(Vec::new()),
        }
    }

    pub fn always(outcome: Outcome) -> Self {
        Self::new([]).with_fallback(outcome)
    }

    pub fn with_fallback(mut self, outcome: Outcome) -> Self {
        self.fallback = outcome;
        self
    }

    /// Every call takes this long before answering.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> Vec<EntryId> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    /// Entries the "server" applied, in order.
    pub fn accepted(&self) -> Vec<EntryId> {
        self.accepted.lock().unwrap().clone()
    }
}

#[async_trait]
impl DeliveryAdapter for ScriptedAdapter {
    async fn deliver(&self, entry: &QueueEntry) -> Outcome {
        self.calls.lock().unwrap().push(entry.id);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let outcome = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone());

        if outcome.is_success() {
            self.accepted.lock().unwrap().push(entry.id);
        }
        outcome
    }
}

/// In-memory store that can be told to fail specific writes.
#[derive(Default)]
pub struct FlakyStore {
    inner: InMemoryEntryStore,
    fail_enqueue: AtomicBool,
    completion_failures: AtomicUsize,
}

impl FlakyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every `enqueue` fails until cleared.
    pub fn set_enqueue_failing(&self, failing: bool) {
        self.fail_enqueue.store(failing, Ordering::SeqCst);
    }

    /// The next `n` calls to `mark_completed` fail.
    pub fn fail_completions(&self, n: usize) {
        self.completion_failures.store(n, Ordering::SeqCst);
    }

    fn locked() -> StoreError {
        StoreError::Database("database is locked".into())
    }
}

#[async_trait]
impl EntryStore for FlakyStore {
    async fn enqueue(&self, endpoint: &str, method: &str, payload: Value) -> Result<EntryId, StoreError> {
        if self.fail_enqueue.load(Ordering::SeqCst) {
            return Err(Self::locked());
        }
        self.inner.enqueue(endpoint, method, payload).await
    }

    async fn get(&self, id: EntryId) -> Result<Option<QueueEntry>, StoreError> {
        self.inner.get(id).await
    }

    async fn peek_oldest_pending(&self) -> Result<Option<QueueEntry>, StoreError> {
        self.inner.peek_oldest_pending().await
    }

    async fn mark_in_flight(&self, id: EntryId) -> Result<(), StoreError> {
        self.inner.mark_in_flight(id).await
    }

    async fn mark_completed(&self, id: EntryId) -> Result<(), StoreError> {
        let failing = self
            .completion_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(Self::locked());
        }
        self.inner.mark_completed(id).await
    }

    async fn mark_failed_retryable(&self, id: EntryId, error: &DeliveryError) -> Result<(), StoreError> {
        self.inner.mark_failed_retryable(id, error).await
    }

    async fn mark_dead_lettered(&self, id: EntryId, error: &DeliveryError) -> Result<(), StoreError> {
        self.inner.mark_dead_lettered(id, error).await
    }

    async fn list(&self) -> Result<Vec<QueueEntry>, StoreError> {
        self.inner.list().await
    }

    async fn counts(&self) -> Result<QueueCounts, StoreError> {
        self.inner.counts().await
    }

    async fn recover_in_flight(&self) -> Result<usize, StoreError> {
        self.inner.recover_in_flight().await
    }

    async fn acknowledge(&self, id: EntryId) -> Result<(), StoreError> {
        self.inner.acknowledge(id).await
    }

    async fn clear_dead_lettered(&self) -> Result<usize, StoreError> {
        self.inner.clear_dead_lettered().await
    }

    async fn resubmit(&self, id: EntryId) -> Result<(), StoreError> {
        self.inner.resubmit(id).await
    }

    async fn prune_completed(&self, before: DateTime<Utc>) -> Result<usize, StoreError> {
        self.inner.prune_completed(before).await
    }
}

pub fn retryable() -> Outcome {
    Outcome::RetryableFailure(DeliveryError::server_transient("503 service unavailable"))
}

pub fn permanent() -> Outcome {
    Outcome::PermanentFailure(DeliveryError::validation("422 title is required"))
}

/// Fast timings so the loop runs many times within a test.
pub fn fast_config() -> QueueConfig {
    QueueConfig::default()
        .with_retry(
            RetryPolicy::exponential(8, Duration::from_millis(10), Duration::from_millis(40))
                .without_jitter(),
        )
        .with_drain_interval(Duration::from_millis(50))
        .with_delivery_timeout(Duration::from_secs(2))
}

pub struct Harness {
    pub queue: OfflineQueue,
    pub adapter: Arc<ScriptedAdapter>,
    pub monitor: Arc<ConnectivityMonitor>,
}

pub fn harness(adapter: ScriptedAdapter, online: bool, config: QueueConfig) -> Harness {
    harness_with_store(Arc::new(InMemoryEntryStore::new()), adapter, online, config)
}

pub fn harness_with_store(
    store: Arc<dyn EntryStore>,
    adapter: ScriptedAdapter,
    online: bool,
    config: QueueConfig,
) -> Harness {
    let _ = fieldqueue_observability::tracing::init_with(fieldqueue_observability::LogFormat::Pretty);

    let adapter = Arc::new(adapter);
    let monitor = Arc::new(if online {
        ConnectivityMonitor::online()
    } else {
        ConnectivityMonitor::offline()
    });
    let queue = OfflineQueue::with_store(
        store,
        config,
        adapter.clone(),
        monitor.clone(),
    )
    .expect("valid config");

    Harness {
        queue,
        adapter,
        monitor,
    }
}

/// Poll the queue until its counts satisfy `check`, failing after a few seconds.
pub async fn wait_for_counts(queue: &OfflineQueue, what: &str, check: impl Fn(QueueCounts) -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let counts = queue.counts().await.expect("counts");
        if check(counts) {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for: {what} (last counts {counts:?})"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Wait until the adapter has been called `n` times.
pub async fn wait_for_calls(adapter: &ScriptedAdapter, n: usize) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while adapter.call_count() < n {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {n} delivery calls"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
