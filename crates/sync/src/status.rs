//! Read-only view of the queue for the UI.

use std::sync::Arc;

use fieldqueue_core::{QueueCounts, QueueEntry};
use fieldqueue_store::EntryStore;
use tokio::sync::watch;

use crate::error::QueueResult;

/// Counts and entry snapshots, plus a live feed of count changes.
pub struct StatusReporter {
    store: Arc<dyn EntryStore>,
    counts: watch::Sender<QueueCounts>,
}

impl StatusReporter {
    pub fn new(store: Arc<dyn EntryStore>) -> Self {
        let (counts, _) = watch::channel(QueueCounts::default());
        Self { store, counts }
    }

    /// Current counts, read from the store.
    pub async fn counts(&self) -> QueueResult<QueueCounts> {
        Ok(self.store.counts().await?)
    }

    /// A fresh snapshot of every entry in queue order. Call again to re-read.
    pub async fn entries(&self) -> QueueResult<std::vec::IntoIter<QueueEntry>> {
        Ok(self.store.list().await?.into_iter())
    }

    /// Receives the counts after every change made through the queue.
    pub fn subscribe(&self) -> watch::Receiver<QueueCounts> {
        self.counts.subscribe()
    }

    /// Re-read the counts and notify subscribers if they changed.
    pub(crate) async fn refresh(&self) {
        match self.store.counts().await {
            Ok(counts) => {
                self.counts.send_if_modified(|current| {
                    if *current == counts {
                        return false;
                    }
                    *current = counts;
                    true
                });
            }
            Err(err) => tracing::warn!(error = %err, "failed to refresh queue counts"),
        }
    }
}

impl std::fmt::Debug for StatusReporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatusReporter")
            .field("counts", &*self.counts.borrow())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fieldqueue_core::EntryStatus;
    use fieldqueue_store::InMemoryEntryStore;
    use serde_json::json;

    #[tokio::test]
    async fn snapshots_are_fresh_per_call() {
        let store: Arc<dyn EntryStore> = Arc::new(InMemoryEntryStore::new());
        let status = StatusReporter::new(store.clone());

        let a = store.enqueue("requests", "POST", json!({})).await.unwrap();
        let first: Vec<_> = status.entries().await.unwrap().collect();
        assert_eq!(first.len(), 1);

        store.enqueue("requests", "POST", json!({})).await.unwrap();
        store.mark_in_flight(a).await.unwrap();
        let second: Vec<_> = status.entries().await.unwrap().collect();
        assert_eq!(second.len(), 2);
        assert_eq!(second[0].status, EntryStatus::InFlight);

        let counts = status.counts().await.unwrap();
        assert_eq!((counts.pending, counts.in_flight), (1, 1));
    }

    #[tokio::test]
    async fn refresh_notifies_only_on_change() {
        let store: Arc<dyn EntryStore> = Arc::new(InMemoryEntryStore::new());
        let status = StatusReporter::new(store.clone());
        let mut rx = status.subscribe();

        status.refresh().await;
        assert!(!rx.has_changed().unwrap());

        store.enqueue("requests", "POST", json!({})).await.unwrap();
        status.refresh().await;
        assert!(rx.has_changed().unwrap());
        assert_eq!(rx.borrow_and_update().pending, 1);
    }
}
