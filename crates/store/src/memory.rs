//! In-memory entry store for tests/dev.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::Mutex;

use fieldqueue_core::{DeliveryError, EntryId, EntryStatus, QueueCounts, QueueEntry};

use crate::error::{StoreError, StoreResult};
use crate::store::EntryStore;

#[derive(Debug, Default)]
struct Inner {
    next_seq: u64,
    /// Keyed by insertion sequence.
    entries: BTreeMap<u64, QueueEntry>,
}

impl Inner {
    fn find_mut(&mut self, id: EntryId) -> StoreResult<&mut QueueEntry> {
        self.entries
            .values_mut()
            .find(|e| e.id == id)
            .ok_or(StoreError::NotFound(id))
    }

    fn in_flight(&self) -> Option<EntryId> {
        self.entries
            .values()
            .find(|e| e.status == EntryStatus::InFlight)
            .map(|e| e.id)
    }

    /// Insertion order.
    fn ordered(&self) -> impl Iterator<Item = &QueueEntry> {
        self.entries.values()
    }

    /// Apply `f` to the entry if it currently has status `expected`.
    fn transition(
        &mut self,
        id: EntryId,
        expected: EntryStatus,
        f: impl FnOnce(&mut QueueEntry),
    ) -> StoreResult<()> {
        let entry = self.find_mut(id)?;
        if entry.status != expected {
            return Err(StoreError::invalid_transition(id, expected, entry.status));
        }
        f(&mut *entry);
        entry.updated_at = Utc::now();
        Ok(())
    }
}

/// Mutex-guarded store that lives as long as the process.
#[derive(Debug, Default)]
pub struct InMemoryEntryStore {
    inner: Mutex<Inner>,
}

impl InMemoryEntryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl EntryStore for InMemoryEntryStore {
    async fn enqueue(&self, endpoint: &str, method: &str, payload: Value) -> StoreResult<EntryId> {
        let entry = QueueEntry::new(endpoint, method, payload);
        let id = entry.id;

        let mut inner = self.inner.lock().await;
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.entries.insert(seq, entry);
        Ok(id)
    }

    async fn get(&self, id: EntryId) -> StoreResult<Option<QueueEntry>> {
        let inner = self.inner.lock().await;
        Ok(inner.entries.values().find(|e| e.id == id).cloned())
    }

    async fn peek_oldest_pending(&self) -> StoreResult<Option<QueueEntry>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .ordered()
            .find(|e| e.status == EntryStatus::Pending)
            .cloned())
    }

    async fn mark_in_flight(&self, id: EntryId) -> StoreResult<()> {
        let mut inner = self.inner.lock().await;
        if let Some(blocking) = inner.in_flight() {
            if blocking != id {
                // Report a wrong-state entry before the conflict.
                let entry = inner.find_mut(id)?;
                if entry.status != EntryStatus::Pending {
                    return Err(StoreError::invalid_transition(
                        id,
                        EntryStatus::Pending,
                        entry.status,
                    ));
                }
                return Err(StoreError::InFlightConflict { id, blocking });
            }
        }
        inner.transition(id, EntryStatus::Pending, |e| {
            e.status = EntryStatus::InFlight;
        })
    }

    async fn mark_completed(&self, id: EntryId) -> StoreResult<()> {
        let mut inner = self.inner.lock().await;
        inner.transition(id, EntryStatus::InFlight, |e| {
            e.status = EntryStatus::Completed;
            e.completed_at = Some(Utc::now());
            e.last_error = None;
        })
    }

    async fn mark_failed_retryable(&self, id: EntryId, error: &DeliveryError) -> StoreResult<()> {
        let mut inner = self.inner.lock().await;
        inner.transition(id, EntryStatus::InFlight, |e| {
            e.status = EntryStatus::Pending;
            e.attempt_count += 1;
            e.last_error = Some(error.clone());
        })
    }

    async fn mark_dead_lettered(&self, id: EntryId, error: &DeliveryError) -> StoreResult<()> {
        let mut inner = self.inner.lock().await;
        inner.transition(id, EntryStatus::InFlight, |e| {
            e.status = EntryStatus::DeadLettered;
            e.attempt_count += 1;
            e.last_error = Some(error.clone());
        })
    }

    async fn list(&self) -> StoreResult<Vec<QueueEntry>> {
        let inner = self.inner.lock().await;
        Ok(inner.ordered().cloned().collect())
    }

    async fn counts(&self) -> StoreResult<QueueCounts> {
        let inner = self.inner.lock().await;
        Ok(QueueCounts::tally(inner.entries.values()))
    }

    async fn recover_in_flight(&self) -> StoreResult<usize> {
        let mut inner = self.inner.lock().await;
        let now = Utc::now();
        let mut recovered = 0;
        for entry in inner.entries.values_mut() {
            if entry.status == EntryStatus::InFlight {
                entry.status = EntryStatus::Pending;
                entry.updated_at = now;
                recovered += 1;
            }
        }
        Ok(recovered)
    }

    async fn acknowledge(&self, id: EntryId) -> StoreResult<()> {
        let mut inner = self.inner.lock().await;
        let (seq, status) = inner
            .entries
            .iter()
            .find(|(_, e)| e.id == id)
            .map(|(seq, e)| (*seq, e.status))
            .ok_or(StoreError::NotFound(id))?;

        if status != EntryStatus::DeadLettered {
            return Err(StoreError::invalid_transition(
                id,
                EntryStatus::DeadLettered,
                status,
            ));
        }
        inner.entries.remove(&seq);
        Ok(())
    }

    async fn clear_dead_lettered(&self) -> StoreResult<usize> {
        let mut inner = self.inner.lock().await;
        let len = inner.entries.len();
        inner
            .entries
            .retain(|_, e| e.status != EntryStatus::DeadLettered);
        Ok(len - inner.entries.len())
    }

    async fn resubmit(&self, id: EntryId) -> StoreResult<()> {
        let mut inner = self.inner.lock().await;
        inner.transition(id, EntryStatus::DeadLettered, |e| {
            e.status = EntryStatus::Pending;
            e.retry_base = e.attempt_count;
        })
    }

    async fn prune_completed(&self, before: DateTime<Utc>) -> StoreResult<usize> {
        let mut inner = self.inner.lock().await;
        let len = inner.entries.len();
        inner.entries.retain(|_, e| {
            !(e.status == EntryStatus::Completed && e.completed_at.is_some_and(|at| at < before))
        });
        Ok(len - inner.entries.len())
    }
}
