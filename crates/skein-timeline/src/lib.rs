//! # skein-timeline
//!
//! Timeline ordering and pagination engine for a room.
//!
//! A room's history is stored as disjoint *fragments*, each the result of one
//! fetch, joined only as pagination discovers the links between them. This
//! crate presents those fragments as one gapless, bidirectionally readable
//! timeline:
//!
//! - [`FragmentIdComparer`] orders fragments by the links seen so far.
//! - [`TimelineEntry`] is the uniform unit of content: a stored event, a
//!   fragment boundary (possibly a gap), or a pending local message.
//! - [`TimelineReader`] reads N entries from a position in a direction,
//!   crossing fragment links and stopping at gaps.
//! - [`GapFiller`] resolves a gap through a [`PaginationSource`] with a
//!   single-flight guard per gap.
//! - [`SyncWriter`] ingests live sync batches and retires confirmed pending
//!   entries.
//!
//! # Ownership
//!
//! ```text
//!   RoomTimeline (one per open room)
//!     ├── Arc<FragmentIdComparer>   shared by reader, filler, sync writer
//!     ├── Arc<PendingQueue>         shared by reader and sync writer
//!     ├── TimelineReader ──┐
//!     ├── GapFiller ───────┼──▶ Arc<TimelineStore> (scoped transactions)
//!     └── SyncWriter ──────┘
//! ```
//!
//! Dropping the `RoomTimeline` discards all fragment knowledge for the room.

pub mod comparer;
pub mod config;
pub mod decrypt;
pub mod entry;
pub mod error;
pub mod gap;
pub mod pending;
pub mod reader;
pub mod room;
pub mod sync;

pub use comparer::FragmentIdComparer;
pub use config::{ConfigError, TimelineConfig, default_database_path};
pub use decrypt::{DecryptedPayload, DecryptionPreparation, DecryptionState, Decryptor};
pub use entry::{EventEntry, FragmentBoundaryEntry, PendingEntry, TimelineEntry};
pub use error::{ComparerError, DecryptError, FetchError, GapFillError, TimelineError};
pub use gap::{FillOutcome, GapFiller, GapState, PaginationResponse, PaginationSource};
pub use pending::PendingQueue;
pub use reader::TimelineReader;
pub use room::RoomTimeline;
pub use sync::{SyncTimeline, SyncWriter};

/// Result type for timeline reads and sync writes.
pub type Result<T> = std::result::Result<T, TimelineError>;
