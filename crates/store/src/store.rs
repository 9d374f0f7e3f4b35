//! Entry store abstraction.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

use fieldqueue_core::{DeliveryError, EntryId, QueueCounts, QueueEntry};

use crate::error::StoreResult;

/// Durable, ordered storage of queued submissions.
///
/// Entries are ordered by insertion, whatever the wall clock says; `created_at`
/// is informational. Only the sync engine drives `mark_*` transitions; at most
/// one entry is in flight at any time.
#[async_trait]
pub trait EntryStore: Send + Sync {
    /// Persist a new pending entry. The entry is durable once this returns.
    async fn enqueue(&self, endpoint: &str, method: &str, payload: Value) -> StoreResult<EntryId>;

    /// Get an entry by ID.
    async fn get(&self, id: EntryId) -> StoreResult<Option<QueueEntry>>;

    /// Oldest pending entry, without changing it.
    async fn peek_oldest_pending(&self) -> StoreResult<Option<QueueEntry>>;

    /// `pending -> in_flight`. Fails if another entry is already in flight.
    async fn mark_in_flight(&self, id: EntryId) -> StoreResult<()>;

    /// `in_flight -> completed`, clearing the last error.
    async fn mark_completed(&self, id: EntryId) -> StoreResult<()>;

    /// `in_flight -> pending`, counting the attempt and recording the error.
    async fn mark_failed_retryable(&self, id: EntryId, error: &DeliveryError) -> StoreResult<()>;

    /// `in_flight -> dead_lettered`, counting the attempt and recording the error.
    async fn mark_dead_lettered(&self, id: EntryId, error: &DeliveryError) -> StoreResult<()>;

    /// Every entry in queue order. Each call reads the store afresh.
    async fn list(&self) -> StoreResult<Vec<QueueEntry>>;

    async fn counts(&self) -> StoreResult<QueueCounts>;

    /// Demote entries left in flight by a previous process to pending.
    async fn recover_in_flight(&self) -> StoreResult<usize>;

    /// Remove a dead-lettered entry once the user has seen it.
    async fn acknowledge(&self, id: EntryId) -> StoreResult<()>;

    /// Remove every dead-lettered entry. Entries in any other state are kept.
    async fn clear_dead_lettered(&self) -> StoreResult<usize>;

    /// `dead_lettered -> pending` with a fresh retry budget. The id, queue
    /// position and attempt count are kept.
    async fn resubmit(&self, id: EntryId) -> StoreResult<()>;

    /// Delete completed entries finished before `before`.
    async fn prune_completed(&self, before: DateTime<Utc>) -> StoreResult<usize>;
}
