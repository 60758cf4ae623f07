//! Storage error types.

use skein_types::{EventId, FragmentId, IdError, RoomId};
use thiserror::Error;

/// Errors from the timeline store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Underlying SQLite failure (I/O, constraint, aborted transaction).
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Stored payload could not be (de)serialized.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A stored identifier failed validation.
    #[error("invalid stored id: {0}")]
    InvalidId(#[from] IdError),

    /// A fragment referenced by a link or key is not stored.
    #[error("fragment {fragment} not found in {room}")]
    MissingFragment { room: RoomId, fragment: FragmentId },

    /// The event id is already stored for this room.
    #[error("event already stored: {0}")]
    DuplicateEvent(EventId),
}

/// Result type for store operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;
