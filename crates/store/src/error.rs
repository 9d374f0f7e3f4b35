//! Store error type.

use fieldqueue_core::{EntryId, EntryStatus};

pub type StoreResult<T> = Result<T, StoreError>;

/// Entry store error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("entry not found: {0}")]
    NotFound(EntryId),
    #[error("entry {id} is {actual}, expected {expected}")]
    InvalidTransition {
        id: EntryId,
        expected: EntryStatus,
        actual: EntryStatus,
    },
    #[error("cannot start {id}: entry {blocking} is already in flight")]
    InFlightConflict { id: EntryId, blocking: EntryId },
    #[error("database error: {0}")]
    Database(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("corrupt row: {0}")]
    Corrupt(String),
}

impl StoreError {
    pub fn invalid_transition(id: EntryId, expected: EntryStatus, actual: EntryStatus) -> Self {
        Self::InvalidTransition {
            id,
            expected,
            actual,
        }
    }
}
