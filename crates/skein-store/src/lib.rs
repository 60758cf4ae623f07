//! # skein-store
//!
//! SQLite persistence for room timelines.
//!
//! Two tables carry the timeline: `fragments` (span metadata, keyed by
//! room + fragment id) and `timeline_events` (payloads, keyed by room +
//! fragment id + entry index so that bounded range scans work in both
//! directions). A third table, `room_keys`, holds decryption key material so
//! that a read can look keys up inside the same transaction that produced its
//! events.
//!
//! All access goes through [`TimelineStore::read`] and
//! [`TimelineStore::write`], which scope a transaction to a synchronous
//! closure. A transaction therefore can never be held across an `.await`.

mod error;
mod store;

pub use error::{StoreError, StoreResult};
pub use store::{ReadTxn, StoredEvent, TimelineStore, WriteTxn};
