//! The unit of durable work.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{DeliveryError, ParseStatusError};
use crate::id::EntryId;

/// Lifecycle state of a queued entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryStatus {
    /// Waiting to be delivered (new, or backing off after a retryable failure).
    Pending,
    /// Currently handed to the delivery adapter.
    InFlight,
    /// Accepted by the server.
    Completed,
    /// Terminal failure; needs explicit user acknowledgement.
    DeadLettered,
}

impl EntryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryStatus::Pending => "pending",
            EntryStatus::InFlight => "in_flight",
            EntryStatus::Completed => "completed",
            EntryStatus::DeadLettered => "dead_lettered",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, EntryStatus::Completed | EntryStatus::DeadLettered)
    }
}

impl core::fmt::Display for EntryStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl core::str::FromStr for EntryStatus {
    type Err = ParseStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(EntryStatus::Pending),
            "in_flight" => Ok(EntryStatus::InFlight),
            "completed" => Ok(EntryStatus::Completed),
            "dead_lettered" => Ok(EntryStatus::DeadLettered),
            other => Err(ParseStatusError(other.to_string())),
        }
    }
}

/// A submission captured on the device, awaiting delivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueEntry {
    /// Unique id; also the idempotency key sent with every attempt.
    pub id: EntryId,
    /// Target operation, opaque to the queue.
    pub endpoint: String,
    pub method: String,
    /// Caller payload, stored as-is.
    pub payload: Value,
    /// Enqueue time; defines FIFO order.
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Delivery attempts made so far. Never decreases.
    pub attempt_count: u32,
    /// Attempt count at which the current retry budget started.
    pub retry_base: u32,
    /// Last classified failure, cleared on success.
    pub last_error: Option<DeliveryError>,
    pub status: EntryStatus,
}

impl QueueEntry {
    /// Create a fresh pending entry.
    pub fn new(endpoint: impl Into<String>, method: impl Into<String>, payload: Value) -> Self {
        let now = Utc::now();
        Self {
            id: EntryId::new(),
            endpoint: endpoint.into(),
            method: method.into(),
            payload,
            created_at: now,
            updated_at: now,
            completed_at: None,
            attempt_count: 0,
            retry_base: 0,
            last_error: None,
            status: EntryStatus::Pending,
        }
    }

    /// Attempts consumed from the current retry budget.
    pub fn attempts_in_budget(&self) -> u32 {
        self.attempt_count.saturating_sub(self.retry_base)
    }
}

/// Snapshot of how many entries sit in each state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueCounts {
    pub pending: usize,
    pub in_flight: usize,
    pub dead_lettered: usize,
    pub completed: usize,
}

impl QueueCounts {
    /// Entries that still have to reach the server.
    pub fn waiting(&self) -> usize {
        self.pending + self.in_flight
    }

    /// Tally a sequence of entries.
    pub fn tally<'a>(entries: impl IntoIterator<Item = &'a QueueEntry>) -> Self {
        entries
            .into_iter()
            .fold(Self::default(), |mut counts, entry| {
                match entry.status {
                    EntryStatus::Pending => counts.pending += 1,
                    EntryStatus::InFlight => counts.in_flight += 1,
                    EntryStatus::Completed => counts.completed += 1,
                    EntryStatus::DeadLettered => counts.dead_lettered += 1,
                }
                counts
            })
    }
}
