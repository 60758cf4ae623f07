//! Shared identity, fragment and event types for skein.
//!
//! This crate is the leaf of the workspace: typed IDs, pagination direction,
//! sort keys, fragment metadata and event payloads. It has **no internal skein
//! dependencies**; the store and the timeline engine build on it.
//!
//! # Relationships
//!
//! ```text
//! Room (RoomId)
//!     └── owns Fragments (FragmentId, creation order only)
//!             └── linked by previous_id / next_id as pagination discovers them
//!             └── holds events at EntryIndex positions
//!     └── owns a pending send queue (TxnId, queue index)
//! ```
//!
//! # Key Types
//!
//! |-------------------|----------------------------------------------|
//! | Type              | Purpose                                      |
//! |-------------------|----------------------------------------------|
//! | [`RoomId`]        | Which room (`!opaque:server`)                |
//! | [`EventId`]       | Which remote event (`$opaque`)               |
//! | [`FragmentId`]    | Which stored span of history                 |
//! | [`TxnId`]         | Which locally queued message                 |
//! | [`SortKey`]       | Fragment + entry index position              |
//! | [`Direction`]     | Forward / backward traversal                 |
//! | [`Fragment`]      | Span metadata: links, tokens, edge flags     |
//! | [`TimelineEvent`] | A confirmed remote event                     |
//! | [`PendingEvent`]  | A queued, unconfirmed local event            |
//! |-------------------|----------------------------------------------|

pub mod direction;
pub mod event;
pub mod fragment;
pub mod ids;
pub mod sort_key;

pub use direction::Direction;
pub use event::{PendingEvent, TimelineEvent};
pub use fragment::Fragment;
pub use ids::{EventId, FragmentId, IdError, PENDING_FRAGMENT_ID, RoomId, TxnId};
pub use sort_key::{EntryIndex, SortKey};

/// Current time as Unix milliseconds.
pub fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
