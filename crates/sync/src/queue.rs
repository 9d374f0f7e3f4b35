//! The queue as the UI sees it.

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::watch;

use fieldqueue_core::{EntryId, QueueCounts, QueueEntry};
use fieldqueue_store::{EntryStore, SqliteEntryStore};

use crate::config::QueueConfig;
use crate::connectivity::ConnectivityPort;
use crate::delivery::DeliveryAdapter;
use crate::engine::{SyncEngine, SyncHandle};
use crate::error::{QueueError, QueueResult};
use crate::status::StatusReporter;

/// Offline-first submission queue.
///
/// `submit` returns once the entry is on disk; delivery happens in the
/// background. Must be created inside a Tokio runtime.
pub struct OfflineQueue {
    store: Arc<dyn EntryStore>,
    engine: Arc<SyncEngine>,
    status: Arc<StatusReporter>,
    handle: SyncHandle,
}

impl OfflineQueue {
    /// Open the SQLite queue at `config.database_path` and start syncing.
    pub async fn open(
        config: QueueConfig,
        adapter: Arc<dyn DeliveryAdapter>,
        connectivity: Arc<dyn ConnectivityPort>,
    ) -> QueueResult<Self> {
        config.validate()?;
        let store = SqliteEntryStore::open(&config.database_path).await?;
        Self::with_store(Arc::new(store), config, adapter, connectivity)
    }

    /// Start syncing on top of any store.
    pub fn with_store(
        store: Arc<dyn EntryStore>,
        config: QueueConfig,
        adapter: Arc<dyn DeliveryAdapter>,
        connectivity: Arc<dyn ConnectivityPort>,
    ) -> QueueResult<Self> {
        config.validate()?;
        let engine = Arc::new(SyncEngine::new(store.clone(), adapter, connectivity, config));
        let status = engine.status();
        let handle = engine.clone().spawn();

        Ok(Self {
            store,
            engine,
            status,
            handle,
        })
    }

    /// Durably record a submission and schedule its delivery.
    ///
    /// Storage failures are returned here; nothing is queued in that case.
    pub async fn submit(
        &self,
        endpoint: impl AsRef<str>,
        method: impl AsRef<str>,
        payload: Value,
    ) -> QueueResult<EntryId> {
        if self.handle.is_stopped() {
            return Err(QueueError::EngineStopped);
        }

        let id = self
            .store
            .enqueue(endpoint.as_ref(), method.as_ref(), payload)
            .await?;
        tracing::info!(entry_id = %id, endpoint = endpoint.as_ref(), "submission queued");

        self.status.refresh().await;
        self.handle.nudge();
        Ok(id)
    }

    pub async fn counts(&self) -> QueueResult<QueueCounts> {
        self.status.counts().await
    }

    pub async fn entries(&self) -> QueueResult<std::vec::IntoIter<QueueEntry>> {
        self.status.entries().await
    }

    pub fn subscribe(&self) -> watch::Receiver<QueueCounts> {
        self.status.subscribe()
    }

    pub fn status(&self) -> &StatusReporter {
        &self.status
    }

    pub fn engine(&self) -> &SyncEngine {
        &self.engine
    }

    /// Dismiss a dead-lettered entry after the user has seen it.
    pub async fn acknowledge(&self, id: EntryId) -> QueueResult<()> {
        self.store.acknowledge(id).await?;
        tracing::info!(entry_id = %id, "dead-lettered entry acknowledged");
        self.status.refresh().await;
        Ok(())
    }

    /// Dismiss every dead-lettered entry at once. Returns how many were removed.
    pub async fn clear_dead_lettered(&self) -> QueueResult<usize> {
        let cleared = self.store.clear_dead_lettered().await?;
        tracing::info!(cleared, "dead-lettered entries cleared");
        self.status.refresh().await;
        Ok(cleared)
    }

    /// Put a dead-lettered entry back in line with a fresh retry budget.
    pub async fn resubmit(&self, id: EntryId) -> QueueResult<()> {
        if self.handle.is_stopped() {
            return Err(QueueError::EngineStopped);
        }
        self.store.resubmit(id).await?;
        tracing::info!(entry_id = %id, "dead-lettered entry resubmitted");
        self.status.refresh().await;
        self.handle.nudge();
        Ok(())
    }

    /// Stop background delivery. Queued entries stay on disk.
    pub async fn shutdown(&self) {
        self.handle.shutdown().await;
    }
}

impl std::fmt::Debug for OfflineQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OfflineQueue")
            .field("engine", &self.engine)
            .field("handle", &self.handle)
            .finish_non_exhaustive()
    }
}
