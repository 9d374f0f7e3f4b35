//! `fieldqueue-store`: durable storage for queued submissions.
//!
//! [`EntryStore`] is the only shared mutable resource of the queue. Every
//! transition is a single guarded update that fails when the entry is not in
//! the expected state, so a crash between two calls never leaves an entry in
//! a state it could not have reached.

pub mod error;
pub mod memory;
pub mod sqlite;
pub mod store;

pub use error::{StoreError, StoreResult};
pub use memory::InMemoryEntryStore;
pub use sqlite::SqliteEntryStore;
pub use store::EntryStore;
