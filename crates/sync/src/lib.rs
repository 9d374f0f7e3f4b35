//! `fieldqueue-sync`: delivers queued submissions when the device is online.
//!
//! - [`OfflineQueue`]: what the UI talks to (submit, status, dead-letter actions)
//! - [`SyncEngine`]: drains the store in FIFO order, exactly once per entry
//! - [`ConnectivityPort`] / [`DeliveryAdapter`]: injected collaborators
//! - [`StatusReporter`]: read-only counts and entry snapshots

pub mod config;
pub mod connectivity;
pub mod delivery;
pub mod engine;
pub mod error;
pub mod queue;
pub mod status;

pub use config::QueueConfig;
pub use connectivity::{
    ConnectivityEvent, ConnectivityMonitor, ConnectivityPort, ConnectivityState,
    ConnectivitySubscription,
};
pub use delivery::DeliveryAdapter;
pub use engine::{DrainReport, SyncEngine, SyncHandle};
pub use error::{QueueError, QueueResult};
pub use queue::OfflineQueue;
pub use status::StatusReporter;

pub use fieldqueue_core::{
    DeliveryError, EntryId, EntryStatus, ErrorKind, Outcome, QueueCounts, QueueEntry, RetryPolicy,
};
pub use fieldqueue_store::{EntryStore, InMemoryEntryStore, SqliteEntryStore, StoreError};
