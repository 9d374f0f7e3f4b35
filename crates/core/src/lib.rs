//! `fieldqueue-core`: types shared by the queue store and the sync engine.
//!
//! This crate is **pure data**: no I/O, no async runtime.

pub mod entry;
pub mod error;
pub mod id;
pub mod outcome;
pub mod retry;

pub use entry::{EntryStatus, QueueCounts, QueueEntry};
pub use error::{DeliveryError, ErrorKind, ParseIdError, ParseKindError, ParseStatusError};
pub use id::EntryId;
pub use outcome::Outcome;
pub use retry::RetryPolicy;
