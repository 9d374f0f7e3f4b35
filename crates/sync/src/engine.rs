//! The sync engine: drains the queue oldest-first while the device is online.
//!
//! One entry is in flight at a time. A retryable failure puts the entry back
//! at the head of the queue and pauses draining for a backoff period, so the
//! next entry is never delivered ahead of an older one. Permanent failures
//! (and entries whose retry budget is spent) are dead-lettered, and draining
//! continues with the next entry.
//!
//! Drains are triggered by:
//! - startup, after orphaned in-flight entries are recovered
//! - a transition to online, or a manual retry (both clear any backoff)
//! - a nudge after `submit`, and a periodic tick (both respect backoff)
//! - the backoff deadline itself

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use fieldqueue_core::{DeliveryError, ErrorKind, Outcome, QueueEntry};
use fieldqueue_store::{EntryStore, StoreError};

use crate::config::QueueConfig;
use crate::connectivity::{ConnectivityEvent, ConnectivityPort};
use crate::delivery::DeliveryAdapter;
use crate::error::QueueResult;
use crate::status::StatusReporter;

/// What a single drain did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
    /// Another drain was already running; nothing was done.
    pub skipped: bool,
    pub delivered: usize,
    pub dead_lettered: usize,
    /// Set when the drain stopped on a retryable failure.
    pub backoff: Option<Duration>,
    /// Stopped because the device went offline.
    pub went_offline: bool,
    /// Stopped by shutdown while a delivery was in progress.
    pub cancelled: bool,
}

impl DrainReport {
    fn skipped() -> Self {
        Self {
            skipped: true,
            ..Default::default()
        }
    }
}

/// What to do with an entry after a failed attempt.
enum Verdict {
    Retry(Duration),
    DeadLetter,
}

/// Delivers queued entries through a [`DeliveryAdapter`].
pub struct SyncEngine {
    store: Arc<dyn EntryStore>,
    adapter: Arc<dyn DeliveryAdapter>,
    connectivity: Arc<dyn ConnectivityPort>,
    config: QueueConfig,
    status: Arc<StatusReporter>,
    drain_lock: Mutex<()>,
    cancellation: CancellationToken,
}

impl SyncEngine {
    pub fn new(
        store: Arc<dyn EntryStore>,
        adapter: Arc<dyn DeliveryAdapter>,
        connectivity: Arc<dyn ConnectivityPort>,
        config: QueueConfig,
    ) -> Self {
        let status = Arc::new(StatusReporter::new(store.clone()));
        Self {
            store,
            adapter,
            connectivity,
            config,
            status,
            drain_lock: Mutex::new(()),
            cancellation: CancellationToken::new(),
        }
    }

    pub fn status(&self) -> Arc<StatusReporter> {
        self.status.clone()
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    pub fn is_stopped(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Demote entries left in flight by a previous process.
    pub async fn recover(&self) -> QueueResult<usize> {
        let recovered = self.store.recover_in_flight().await?;
        if recovered > 0 {
            warn!(recovered, "recovered entries left in flight by a previous run");
        }
        self.status.refresh().await;
        Ok(recovered)
    }

    /// Deliver pending entries oldest-first until the queue is empty, the
    /// device goes offline, or a retryable failure calls for backoff.
    ///
    /// Single-flight: if a drain is already running this returns a skipped
    /// report without touching the store.
    pub async fn drain(&self) -> QueueResult<DrainReport> {
        let Ok(_guard) = self.drain_lock.try_lock() else {
            debug!("drain already running, skipping");
            return Ok(DrainReport::skipped());
        };

        let mut report = DrainReport::default();
        let mut recovered_stale = false;

        loop {
            if self.cancellation.is_cancelled() {
                report.cancelled = true;
                break;
            }
            if !self.connectivity.is_online() {
                report.went_offline = true;
                break;
            }

            let Some(entry) = self.store.peek_oldest_pending().await? else {
                // Holding the drain lock, so anything still in flight was
                // abandoned by an earlier drain.
                if !recovered_stale && self.store.counts().await?.in_flight > 0 {
                    self.recover_stale().await?;
                    recovered_stale = true;
                    continue;
                }
                break;
            };

            match self.store.mark_in_flight(entry.id).await {
                Ok(()) => {}
                Err(StoreError::InFlightConflict { blocking, .. }) if !recovered_stale => {
                    warn!(entry_id = %blocking, "found stale in-flight entry");
                    self.recover_stale().await?;
                    recovered_stale = true;
                    continue;
                }
                Err(err) => return Err(err.into()),
            }
            self.status.refresh().await;

            let attempt = entry.attempt_count + 1;
            debug!(entry_id = %entry.id, attempt, endpoint = %entry.endpoint, "delivering entry");

            let Some(outcome) = self.attempt(&entry).await else {
                // Left in flight; recovered on next start.
                info!(entry_id = %entry.id, "delivery abandoned by shutdown");
                report.cancelled = true;
                break;
            };

            let settled = self.settle(&entry, outcome, &mut report).await;
            self.status.refresh().await;
            match settled {
                Ok(true) => {}
                Ok(false) => break,
                Err(err) => {
                    self.release(&entry).await;
                    return Err(err);
                }
            }
        }

        Ok(report)
    }

    /// Record the outcome of an attempt. `Ok(false)` means stop and back off.
    async fn settle(
        &self,
        entry: &QueueEntry,
        outcome: Outcome,
        report: &mut DrainReport,
    ) -> QueueResult<bool> {
        let attempt = entry.attempt_count + 1;
        match outcome {
            Outcome::Success => {
                self.store.mark_completed(entry.id).await?;
                report.delivered += 1;
                info!(entry_id = %entry.id, attempt, "entry delivered");
            }
            Outcome::PermanentFailure(err) => {
                self.store.mark_dead_lettered(entry.id, &err).await?;
                report.dead_lettered += 1;
                warn!(
                    entry_id = %entry.id,
                    attempt,
                    kind = %err.kind,
                    error = %err.message,
                    "entry rejected, moved to dead letter"
                );
            }
            Outcome::RetryableFailure(err) => match self.verdict(entry, &err) {
                Verdict::DeadLetter => {
                    self.store.mark_dead_lettered(entry.id, &err).await?;
                    report.dead_lettered += 1;
                    warn!(
                        entry_id = %entry.id,
                        attempt,
                        kind = %err.kind,
                        error = %err.message,
                        "retries exhausted, moved to dead letter"
                    );
                }
                Verdict::Retry(delay) => {
                    self.store.mark_failed_retryable(entry.id, &err).await?;
                    report.backoff = Some(delay);
                    info!(
                        entry_id = %entry.id,
                        attempt,
                        kind = %err.kind,
                        delay_ms = delay.as_millis() as u64,
                        "delivery failed, backing off"
                    );
                    return Ok(false);
                }
            },
        }
        Ok(true)
    }

    /// Put an entry whose outcome could not be recorded back in line. The
    /// next attempt reuses its id, so a delivery that did land is deduplicated
    /// by the server.
    async fn release(&self, entry: &QueueEntry) {
        match self.store.recover_in_flight().await {
            Ok(_) => warn!(entry_id = %entry.id, "outcome not recorded, entry returned to pending"),
            Err(err) => error!(
                entry_id = %entry.id,
                error = %err,
                "failed to return entry to pending; retried on the next drain"
            ),
        }
        self.status.refresh().await;
    }

    async fn recover_stale(&self) -> QueueResult<()> {
        let recovered = self.store.recover_in_flight().await?;
        warn!(recovered, "recovered stale in-flight entries");
        self.status.refresh().await;
        Ok(())
    }

    /// One bounded, cancellable delivery. `None` if shutdown interrupted it.
    async fn attempt(&self, entry: &QueueEntry) -> Option<Outcome> {
        let timeout = self.config.delivery_timeout;
        tokio::select! {
            _ = self.cancellation.cancelled() => None,
            result = tokio::time::timeout(timeout, self.adapter.deliver(entry)) => {
                Some(result.unwrap_or_else(|_| {
                    Outcome::RetryableFailure(DeliveryError::timeout(timeout))
                }))
            }
        }
    }

    fn verdict(&self, entry: &QueueEntry, err: &DeliveryError) -> Verdict {
        let attempts = entry.attempts_in_budget() + 1;

        // Credentials get one refresh cycle; a second expiry in a row is final.
        let repeated_auth = err.kind == ErrorKind::AuthExpired
            && entry.attempts_in_budget() > 0
            && entry
                .last_error
                .as_ref()
                .is_some_and(|last| last.kind == ErrorKind::AuthExpired);

        if repeated_auth || !self.config.retry.should_retry(attempts) {
            Verdict::DeadLetter
        } else {
            Verdict::Retry(self.config.retry.delay_for_attempt(attempts))
        }
    }

    /// Delete completed entries older than the retention window.
    pub async fn prune(&self) -> QueueResult<usize> {
        let retention = chrono::Duration::from_std(self.config.completed_retention)
            .unwrap_or(chrono::Duration::MAX);
        let cutoff = Utc::now()
            .checked_sub_signed(retention)
            .unwrap_or(chrono::DateTime::<Utc>::MIN_UTC);

        let pruned = self.store.prune_completed(cutoff).await?;
        if pruned > 0 {
            debug!(pruned, "pruned completed entries");
            self.status.refresh().await;
        }
        Ok(pruned)
    }

    /// Start the background loop.
    pub fn spawn(self: Arc<Self>) -> SyncHandle {
        let trigger = Arc::new(Notify::new());
        let cancellation = self.cancellation.clone();
        let task = tokio::spawn(run(self, trigger.clone()));

        SyncHandle {
            trigger,
            cancellation,
            task: Mutex::new(Some(task)),
        }
    }

    /// Drain and turn the result into the next backoff deadline.
    async fn drain_logged(&self, backoff_until: &mut Option<Instant>) {
        match self.drain().await {
            Ok(report) if report.skipped => {}
            Ok(report) => {
                if report.delivered > 0 || report.dead_lettered > 0 {
                    info!(
                        delivered = report.delivered,
                        dead_lettered = report.dead_lettered,
                        "drain finished"
                    );
                }
                *backoff_until = report.backoff.map(|delay| Instant::now() + delay);
            }
            Err(err) => {
                error!(error = %err, "drain failed");
                // Store trouble: wait a base delay rather than spin.
                *backoff_until = Some(Instant::now() + self.config.retry.base_delay);
            }
        }
    }
}

impl std::fmt::Debug for SyncEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncEngine")
            .field("config", &self.config)
            .field("stopped", &self.is_stopped())
            .finish_non_exhaustive()
    }
}

async fn run(engine: Arc<SyncEngine>, trigger: Arc<Notify>) {
    info!("sync engine started");

    // Subscribe first so a transition during startup is not missed.
    let mut events = engine.connectivity.subscribe();
    let mut events_open = true;

    if let Err(err) = engine.recover().await {
        error!(error = %err, "failed to recover in-flight entries");
    }

    let mut backoff_until: Option<Instant> = None;
    engine.drain_logged(&mut backoff_until).await;

    let period = engine.config.drain_interval.max(Duration::from_millis(1));
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        let deadline = backoff_until;
        let backoff = async move {
            match deadline {
                Some(at) => tokio::time::sleep_until(at).await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            _ = engine.cancellation.cancelled() => {
                info!("sync engine received shutdown signal");
                break;
            }
            event = events.recv(), if events_open => match event {
                Some(ConnectivityEvent::Online) => {
                    debug!("online, draining");
                    backoff_until = None;
                    engine.drain_logged(&mut backoff_until).await;
                }
                Some(ConnectivityEvent::RetryRequested) => {
                    debug!("manual retry, draining");
                    backoff_until = None;
                    engine.drain_logged(&mut backoff_until).await;
                }
                Some(ConnectivityEvent::Offline) => debug!("offline, pausing"),
                None => {
                    warn!("connectivity events closed; relying on timer and nudges");
                    events_open = false;
                }
            },
            _ = trigger.notified() => {
                if backoff_until.is_some_and(|at| at > Instant::now()) {
                    debug!("nudged during backoff, waiting");
                } else {
                    engine.drain_logged(&mut backoff_until).await;
                }
            }
            _ = backoff => {
                backoff_until = None;
                engine.drain_logged(&mut backoff_until).await;
            }
            _ = ticker.tick() => {
                if let Err(err) = engine.prune().await {
                    warn!(error = %err, "failed to prune completed entries");
                }
                if backoff_until.is_none() && engine.connectivity.is_online() {
                    engine.drain_logged(&mut backoff_until).await;
                }
            }
        }
    }

    info!("sync engine stopped");
}

/// Control handle for a spawned engine.
#[derive(Debug)]
pub struct SyncHandle {
    trigger: Arc<Notify>,
    cancellation: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl SyncHandle {
    /// Ask for a drain soon. Ignored while backing off.
    pub fn nudge(&self) {
        self.trigger.notify_one();
    }

    pub fn is_stopped(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Stop the loop, abandoning any backoff wait or delivery in progress, and
    /// wait for it to exit.
    pub async fn shutdown(&self) {
        self.cancellation.cancel();
        let task = self.task.lock().await.take();
        if let Some(task) = task {
            if let Err(err) = task.await {
                warn!(error = %err, "sync engine task ended abnormally");
            }
        }
    }
}

impl Drop for SyncHandle {
    /// A dropped handle stops the loop; it never outlives its owner.
    fn drop(&mut self) {
        self.cancellation.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use fieldqueue_core::RetryPolicy;
    use fieldqueue_store::InMemoryEntryStore;

    use crate::connectivity::ConnectivityMonitor;

    struct Always(Outcome);

    #[async_trait]
    impl DeliveryAdapter for Always {
        async fn deliver(&self, _entry: &QueueEntry) -> Outcome {
            self.0.clone()
        }
    }

    fn engine(outcome: Outcome, max_attempts: u32) -> SyncEngine {
        let config = QueueConfig::default().with_retry(
            RetryPolicy::exponential(max_attempts, Duration::from_secs(2), Duration::from_secs(60))
                .without_jitter(),
        );
        SyncEngine::new(
            Arc::new(InMemoryEntryStore::new()),
            Arc::new(Always(outcome)),
            Arc::new(ConnectivityMonitor::online()),
            config,
        )
    }

    fn entry_with(attempt_count: u32, retry_base: u32, last: Option<DeliveryError>) -> QueueEntry {
        let mut entry = QueueEntry::new("r", "POST", serde_json::Value::Null);
        entry.attempt_count = attempt_count;
        entry.retry_base = retry_base;
        entry.last_error = last;
        entry
    }

    #[test]
    fn verdict_retries_until_budget_is_spent() {
        let engine = engine(Outcome::Success, 3);
        let err = DeliveryError::network("down");

        assert!(matches!(
            engine.verdict(&entry_with(0, 0, None), &err),
            Verdict::Retry(d) if d == Duration::from_secs(2)
        ));
        assert!(matches!(
            engine.verdict(&entry_with(1, 0, Some(err.clone())), &err),
            Verdict::Retry(d) if d == Duration::from_secs(4)
        ));
        assert!(matches!(
            engine.verdict(&entry_with(2, 0, Some(err.clone())), &err),
            Verdict::DeadLetter
        ));
        // A resubmitted entry starts a new budget.
        assert!(matches!(
            engine.verdict(&entry_with(3, 3, Some(err.clone())), &err),
            Verdict::Retry(_)
        ));
    }

    #[test]
    fn verdict_gives_auth_one_retry() {
        let engine = engine(Outcome::Success, 8);
        let auth = DeliveryError::auth_expired("token expired");

        assert!(matches!(
            engine.verdict(&entry_with(0, 0, None), &auth),
            Verdict::Retry(_)
        ));
        assert!(matches!(
            engine.verdict(&entry_with(1, 0, Some(auth.clone())), &auth),
            Verdict::DeadLetter
        ));
        // Not consecutive: the previous failure was a network error.
        assert!(matches!(
            engine.verdict(&entry_with(1, 0, Some(DeliveryError::network("x"))), &auth),
            Verdict::Retry(_)
        ));
    }

    #[tokio::test]
    async fn drain_is_skipped_while_another_runs() {
        let engine = engine(Outcome::Success, 8);
        let _guard = engine.drain_lock.lock().await;

        let report = engine.drain().await.unwrap();
        assert!(report.skipped);
    }

    #[tokio::test]
    async fn drain_recovers_a_lone_stale_in_flight_entry() {
        let engine = engine(Outcome::Success, 8);
        let id = engine.store.enqueue("r", "POST", serde_json::json!({})).await.unwrap();
        engine.store.mark_in_flight(id).await.unwrap();

        let report = engine.drain().await.unwrap();
        assert_eq!(report.delivered, 1);
        assert_eq!(engine.store.counts().await.unwrap().in_flight, 0);
    }

    #[tokio::test]
    async fn dropping_the_handle_stops_the_loop() {
        let engine = Arc::new(engine(Outcome::Success, 8));
        let handle = engine.clone().spawn();
        assert!(!engine.is_stopped());

        drop(handle);
        assert!(engine.is_stopped());
    }

    #[tokio::test]
    async fn prune_respects_retention() {
        let engine = engine(Outcome::Success, 8);
        engine.store.enqueue("r", "POST", serde_json::json!({})).await.unwrap();
        engine.drain().await.unwrap();

        assert_eq!(engine.prune().await.unwrap(), 0);

        let engine = SyncEngine {
            config: engine.config.clone().with_completed_retention(Duration::ZERO),
            ..engine
        };
        tokio::time::sleep(Duration::from_millis(2)).await;
        assert_eq!(engine.prune().await.unwrap(), 1);
    }
}
