//! SQLite-backed entry store.
//!
//! Entries live in a single `queue_entries` table. The database runs in WAL mode
//! with `synchronous = FULL`, so an insert that returned is on disk even if
//! the process is killed right after.
//!
//! Every transition is one `UPDATE ... WHERE id = ? AND status = ?`. When no
//! row matches, the entry is re-read to tell `NotFound`, `InvalidTransition`
//! and `InFlightConflict` apart.

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::Value;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow, SqliteSynchronous,
};
use sqlx::{Row, SqlitePool};
use tracing::instrument;

use fieldqueue_core::{
    DeliveryError, EntryId, EntryStatus, ErrorKind, QueueCounts, QueueEntry,
};

use crate::error::{StoreError, StoreResult};
use crate::store::EntryStore;

const SELECT_COLUMNS: &str = r#"
    SELECT
        id,
        endpoint,
        method,
        payload,
        status,
        attempt_count,
        retry_base,
        last_error_kind,
        last_error_message,
        created_at,
        updated_at,
        completed_at
    FROM queue_entries
"#;

/// SQLite-backed entry store.
///
/// Cheap to clone; clones share the same pool.
#[derive(Debug, Clone)]
pub struct SqliteEntryStore {
    pool: SqlitePool,
}

impl SqliteEntryStore {
    /// Open (or create) the database file at `path` and ensure the schema exists.
    pub async fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                StoreError::Database(format!(
                    "failed to create queue directory at {}: {e}",
                    parent.display()
                ))
            })?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Full)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;

        tracing::info!(path = %path.display(), "opened queue database");
        Self::with_pool(pool).await
    }

    /// Private in-memory database. Lives as long as the store.
    pub async fn open_in_memory() -> StoreResult<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| map_sqlx_error("connect", e))?;

        // Every connection to `:memory:` is a separate database.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;

        Self::with_pool(pool).await
    }

    /// Use an existing pool, creating the schema if needed.
    pub async fn with_pool(pool: SqlitePool) -> StoreResult<Self> {
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    async fn migrate(&self) -> StoreResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS queue_entries (
                seq                 INTEGER PRIMARY KEY AUTOINCREMENT,
                id                  TEXT NOT NULL UNIQUE,
                endpoint            TEXT NOT NULL,
                method              TEXT NOT NULL,
                payload             TEXT NOT NULL,
                status              TEXT NOT NULL,
                attempt_count       INTEGER NOT NULL DEFAULT 0,
                retry_base          INTEGER NOT NULL DEFAULT 0,
                last_error_kind     TEXT NULL,
                last_error_message  TEXT NULL,
                created_at          TEXT NOT NULL,
                updated_at          TEXT NOT NULL,
                completed_at        TEXT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("create_table", e))?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS queue_entries_order
                ON queue_entries (status, seq)
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("create_order_index", e))?;

        // At most one in-flight row, enforced by the database itself.
        sqlx::query(
            r#"
            CREATE UNIQUE INDEX IF NOT EXISTS queue_entries_single_in_flight
                ON queue_entries (status)
                WHERE status = 'in_flight'
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("create_in_flight_index", e))?;

        Ok(())
    }

    /// Work out why a guarded update matched no row.
    async fn rejection(&self, id: EntryId, expected: EntryStatus) -> StoreError {
        let current = match self.get(id).await {
            Ok(Some(entry)) => entry,
            Ok(None) => return StoreError::NotFound(id),
            Err(err) => return err,
        };

        if current.status != expected {
            return StoreError::invalid_transition(id, expected, current.status);
        }

        if expected == EntryStatus::Pending {
            if let Ok(Some(blocking)) = self.in_flight_id().await {
                return StoreError::InFlightConflict { id, blocking };
            }
        }

        // The row changed between the update and the re-read.
        StoreError::Database(format!(
            "entry {id} changed concurrently while {}",
            expected.as_str()
        ))
    }

    async fn in_flight_id(&self) -> StoreResult<Option<EntryId>> {
        let row = sqlx::query("SELECT id FROM queue_entries WHERE status = 'in_flight' LIMIT 1")
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("in_flight_id", e))?;

        row.map(|row| {
            let id: String = row
                .try_get("id")
                .map_err(|e| map_sqlx_error("in_flight_id", e))?;
            parse_id(&id)
        })
        .transpose()
    }

    async fn record_failure(
        &self,
        operation: &'static str,
        id: EntryId,
        next: EntryStatus,
        error: &DeliveryError,
    ) -> StoreResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE queue_entries
            SET status = ?2,
                attempt_count = attempt_count + 1,
                last_error_kind = ?3,
                last_error_message = ?4,
                updated_at = ?5
            WHERE id = ?1
              AND status = 'in_flight'
            "#,
        )
        .bind(id.to_string())
        .bind(next.as_str())
        .bind(error.kind.as_str())
        .bind(&error.message)
        .bind(timestamp(Utc::now()))
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error(operation, e))?;

        if result.rows_affected() == 0 {
            return Err(self.rejection(id, EntryStatus::InFlight).await);
        }
        Ok(())
    }
}

#[async_trait]
impl EntryStore for SqliteEntryStore {
    #[instrument(skip(self, payload), err)]
    async fn enqueue(&self, endpoint: &str, method: &str, payload: Value) -> StoreResult<EntryId> {
        let id = EntryId::new();
        let now = timestamp(Utc::now());
        let payload = serde_json::to_string(&payload)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;

        sqlx::query(
            r#"
            INSERT INTO queue_entries (
                id,
                endpoint,
                method,
                payload,
                status,
                attempt_count,
                retry_base,
                created_at,
                updated_at
            )
            VALUES (?1, ?2, ?3, ?4, 'pending', 0, 0, ?5, ?5)
            "#,
        )
        .bind(id.to_string())
        .bind(endpoint)
        .bind(method)
        .bind(payload)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("enqueue", e))?;

        tracing::debug!(entry_id = %id, "entry enqueued");
        Ok(id)
    }

    async fn get(&self, id: EntryId) -> StoreResult<Option<QueueEntry>> {
        let row = sqlx::query(&format!("{SELECT_COLUMNS} WHERE id = ?1"))
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("get", e))?;

        row.map(row_to_entry).transpose()
    }

    async fn peek_oldest_pending(&self) -> StoreResult<Option<QueueEntry>> {
        let row = sqlx::query(&format!(
            "{SELECT_COLUMNS} WHERE status = 'pending' ORDER BY seq ASC LIMIT 1"
        ))
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("peek_oldest_pending", e))?;

        row.map(row_to_entry).transpose()
    }

    async fn mark_in_flight(&self, id: EntryId) -> StoreResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE queue_entries
            SET status = 'in_flight',
                updated_at = ?2
            WHERE id = ?1
              AND status = 'pending'
              AND NOT EXISTS (
                  SELECT 1 FROM queue_entries WHERE status = 'in_flight'
              )
            "#,
        )
        .bind(id.to_string())
        .bind(timestamp(Utc::now()))
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("mark_in_flight", e))?;

        if result.rows_affected() == 0 {
            return Err(self.rejection(id, EntryStatus::Pending).await);
        }
        Ok(())
    }

    async fn mark_completed(&self, id: EntryId) -> StoreResult<()> {
        let now = timestamp(Utc::now());
        let result = sqlx::query(
            r#"
            UPDATE queue_entries
            SET status = 'completed',
                last_error_kind = NULL,
                last_error_message = NULL,
                completed_at = ?2,
                updated_at = ?2
            WHERE id = ?1
              AND status = 'in_flight'
            "#,
        )
        .bind(id.to_string())
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("mark_completed", e))?;

        if result.rows_affected() == 0 {
            return Err(self.rejection(id, EntryStatus::InFlight).await);
        }
        Ok(())
    }

    async fn mark_failed_retryable(&self, id: EntryId, error: &DeliveryError) -> StoreResult<()> {
        self.record_failure("mark_failed_retryable", id, EntryStatus::Pending, error)
            .await
    }

    async fn mark_dead_lettered(&self, id: EntryId, error: &DeliveryError) -> StoreResult<()> {
        self.record_failure("mark_dead_lettered", id, EntryStatus::DeadLettered, error)
            .await
    }

    async fn list(&self) -> StoreResult<Vec<QueueEntry>> {
        let rows = sqlx::query(&format!("{SELECT_COLUMNS} ORDER BY seq ASC"))
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("list", e))?;

        rows.into_iter().map(row_to_entry).collect()
    }

    async fn counts(&self) -> StoreResult<QueueCounts> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS n FROM queue_entries GROUP BY status")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("counts", e))?;

        let mut counts = QueueCounts::default();
        for row in rows {
            let status: String = row.try_get("status").map_err(|e| map_sqlx_error("counts", e))?;
            let n: i64 = row.try_get("n").map_err(|e| map_sqlx_error("counts", e))?;
            let n = usize::try_from(n).map_err(|_| StoreError::Corrupt(format!("count {n}")))?;
            match parse_status(&status)? {
                EntryStatus::Pending => counts.pending = n,
                EntryStatus::InFlight => counts.in_flight = n,
                EntryStatus::Completed => counts.completed = n,
                EntryStatus::DeadLettered => counts.dead_lettered = n,
            }
        }
        Ok(counts)
    }

    #[instrument(skip(self), err)]
    async fn recover_in_flight(&self) -> StoreResult<usize> {
        let result = sqlx::query(
            r#"
            UPDATE queue_entries
            SET status = 'pending',
                updated_at = ?1
            WHERE status = 'in_flight'
            "#,
        )
        .bind(timestamp(Utc::now()))
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("recover_in_flight", e))?;

        Ok(result.rows_affected() as usize)
    }

    async fn acknowledge(&self, id: EntryId) -> StoreResult<()> {
        let result = sqlx::query(
            r#"
            DELETE FROM queue_entries
            WHERE id = ?1
              AND status = 'dead_lettered'
            "#,
        )
        .bind(id.to_string())
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("acknowledge", e))?;

        if result.rows_affected() == 0 {
            return Err(self.rejection(id, EntryStatus::DeadLettered).await);
        }
        Ok(())
    }

    async fn clear_dead_lettered(&self) -> StoreResult<usize> {
        let result = sqlx::query("DELETE FROM queue_entries WHERE status = 'dead_lettered'")
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("clear_dead_lettered", e))?;

        Ok(result.rows_affected() as usize)
    }

    async fn resubmit(&self, id: EntryId) -> StoreResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE queue_entries
            SET status = 'pending',
                retry_base = attempt_count,
                updated_at = ?2
            WHERE id = ?1
              AND status = 'dead_lettered'
            "#,
        )
        .bind(id.to_string())
        .bind(timestamp(Utc::now()))
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("resubmit", e))?;

        if result.rows_affected() == 0 {
            return Err(self.rejection(id, EntryStatus::DeadLettered).await);
        }
        Ok(())
    }

    async fn prune_completed(&self, before: DateTime<Utc>) -> StoreResult<usize> {
        let result = sqlx::query(
            r#"
            DELETE FROM queue_entries
            WHERE status = 'completed'
              AND completed_at IS NOT NULL
              AND completed_at < ?1
            "#,
        )
        .bind(timestamp(before))
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("prune_completed", e))?;

        Ok(result.rows_affected() as usize)
    }
}

/// Fixed-width RFC 3339 so that text order matches time order.
fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(column: &str, value: &str) -> StoreResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt(format!("invalid {column} '{value}': {e}")))
}

fn parse_id(value: &str) -> StoreResult<EntryId> {
    value
        .parse::<EntryId>()
        .map_err(|e| StoreError::Corrupt(e.to_string()))
}

fn parse_status(value: &str) -> StoreResult<EntryStatus> {
    value
        .parse::<EntryStatus>()
        .map_err(|e| StoreError::Corrupt(e.to_string()))
}

fn parse_count(column: &str, value: i64) -> StoreResult<u32> {
    u32::try_from(value).map_err(|_| StoreError::Corrupt(format!("invalid {column} {value}")))
}

/// Map a database row into a `QueueEntry`.
fn row_to_entry(row: SqliteRow) -> StoreResult<QueueEntry> {
    let get_err = |e| map_sqlx_error("decode_row", e);

    let id: String = row.try_get("id").map_err(get_err)?;
    let endpoint: String = row.try_get("endpoint").map_err(get_err)?;
    let method: String = row.try_get("method").map_err(get_err)?;

    let payload: String = row.try_get("payload").map_err(get_err)?;
    let payload: Value = serde_json::from_str(&payload)
        .map_err(|e| StoreError::Serialization(format!("invalid JSON payload for {id}: {e}")))?;

    let status: String = row.try_get("status").map_err(get_err)?;
    let attempt_count: i64 = row.try_get("attempt_count").map_err(get_err)?;
    let retry_base: i64 = row.try_get("retry_base").map_err(get_err)?;

    let error_kind: Option<String> = row.try_get("last_error_kind").map_err(get_err)?;
    let error_message: Option<String> = row.try_get("last_error_message").map_err(get_err)?;
    let last_error = match error_kind {
        Some(kind) => {
            let kind = kind
                .parse::<ErrorKind>()
                .map_err(|e| StoreError::Corrupt(e.to_string()))?;
            Some(DeliveryError::new(kind, error_message.unwrap_or_default()))
        }
        None => None,
    };

    let created_at: String = row.try_get("created_at").map_err(get_err)?;
    let updated_at: String = row.try_get("updated_at").map_err(get_err)?;
    let completed_at: Option<String> = row.try_get("completed_at").map_err(get_err)?;

    Ok(QueueEntry {
        id: parse_id(&id)?,
        endpoint,
        method,
        payload,
        created_at: parse_timestamp("created_at", &created_at)?,
        updated_at: parse_timestamp("updated_at", &updated_at)?,
        completed_at: completed_at
            .map(|s| parse_timestamp("completed_at", &s))
            .transpose()?,
        attempt_count: parse_count("attempt_count", attempt_count)?,
        retry_base: parse_count("retry_base", retry_base)?,
        last_error,
        status: parse_status(&status)?,
    })
}

/// Map SQLx errors to `StoreError`.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            if db_err.is_unique_violation() {
                StoreError::Database(format!(
                    "constraint violated in {}: {}",
                    operation,
                    db_err.message()
                ))
            } else {
                StoreError::Database(format!("database error in {}: {}", operation, db_err.message()))
            }
        }
        sqlx::Error::PoolClosed => {
            StoreError::Database(format!("connection pool closed in {}", operation))
        }
        sqlx::Error::ColumnDecode { index, source } => {
            StoreError::Corrupt(format!("column {} in {}: {}", index, operation, source))
        }
        _ => StoreError::Database(format!("sqlx error in {}: {}", operation, err)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn payload_is_stored_verbatim() {
        let store = SqliteEntryStore::open_in_memory().await.unwrap();
        let payload = json!({
            "title": "Need insulin",
            "location": {"lat": -6.2, "lng": 106.8},
            "tags": ["medical", "urgent"],
        });
        let id = store.enqueue("requests", "POST", payload.clone()).await.unwrap();

        let entry = store.get(id).await.unwrap().unwrap();
        assert_eq!(entry.payload, payload);
        assert_eq!(entry.endpoint, "requests");
        assert_eq!(entry.method, "POST");
        assert_eq!(entry.status, EntryStatus::Pending);
    }

    #[tokio::test]
    async fn single_in_flight_is_enforced_by_the_update() {
        let store = SqliteEntryStore::open_in_memory().await.unwrap();
        let a = store.enqueue("r", "POST", json!({})).await.unwrap();
        let b = store.enqueue("r", "POST", json!({})).await.unwrap();

        store.mark_in_flight(a).await.unwrap();
        let err = store.mark_in_flight(b).await.unwrap_err();
        assert_eq!(err, StoreError::InFlightConflict { id: b, blocking: a });
        assert_eq!(store.get(b).await.unwrap().unwrap().status, EntryStatus::Pending);
    }

    #[tokio::test]
    async fn error_is_round_tripped_through_columns() {
        let store = SqliteEntryStore::open_in_memory().await.unwrap();
        let id = store.enqueue("r", "POST", json!({})).await.unwrap();
        store.mark_in_flight(id).await.unwrap();
        store
            .mark_failed_retryable(id, &DeliveryError::server_transient("503 from gateway"))
            .await
            .unwrap();

        let entry = store.get(id).await.unwrap().unwrap();
        assert_eq!(
            entry.last_error,
            Some(DeliveryError::server_transient("503 from gateway"))
        );
    }

    #[tokio::test]
    async fn order_follows_insertion_not_clock() {
        let store = SqliteEntryStore::open_in_memory().await.unwrap();
        let a = store.enqueue("r", "POST", json!({})).await.unwrap();
        let b = store.enqueue("r", "POST", json!({})).await.unwrap();

        // b was stamped after the clock stepped back an hour.
        sqlx::query("UPDATE queue_entries SET created_at = ?1 WHERE id = ?2")
            .bind(timestamp(Utc::now() - chrono::Duration::hours(1)))
            .bind(b.to_string())
            .execute(&store.pool)
            .await
            .unwrap();

        let ids: Vec<_> = store.list().await.unwrap().into_iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![a, b]);
        assert_eq!(store.peek_oldest_pending().await.unwrap().map(|e| e.id), Some(a));
    }

    #[test]
    fn timestamps_sort_as_text() {
        let earlier = Utc::now();
        let later = earlier + chrono::Duration::microseconds(1);
        assert!(timestamp(earlier) < timestamp(later));
        assert_eq!(timestamp(earlier).len(), timestamp(later).len());
    }
}
