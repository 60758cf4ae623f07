//! Error types for the timeline engine.

use skein_store::StoreError;
use skein_types::{Direction, FragmentId};
use thiserror::Error;

/// The comparer was asked about a fragment it was never told about.
///
/// This is an internal consistency bug: every fragment an entry references
/// must be registered before entries are compared.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ComparerError {
    #[error("unknown fragment {0}")]
    UnknownFragment(FragmentId),
}

/// Errors from reading or writing the timeline.
#[derive(Error, Debug)]
pub enum TimelineError {
    /// Storage engine failure.
    #[error("storage error: {0}")]
    Storage(#[from] StoreError),

    /// Comparer invariant violation.
    #[error(transparent)]
    Comparer(#[from] ComparerError),

    /// No free entry index remains at this end of the fragment.
    #[error("entry indexes exhausted in fragment {0}")]
    IndexExhausted(FragmentId),

    /// Every fragment id below the pending pseudo-fragment is taken.
    #[error("fragment ids exhausted after {0}")]
    FragmentIdsExhausted(FragmentId),
}

/// Failure reported by a [`PaginationSource`](crate::PaginationSource).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    /// Transport-level failure (timeout, connection reset, ...).
    #[error("network error: {0}")]
    Network(String),

    /// The server answered with an error.
    #[error("server error {status}: {message}")]
    Server { status: u16, message: String },
}

/// Errors from resolving a gap.
#[derive(Error, Debug)]
pub enum GapFillError {
    #[error("fetch failed: {0}")]
    Fetch(#[from] FetchError),

    #[error("storage error: {0}")]
    Storage(#[from] StoreError),

    /// The fragment's token changed since the gap entry was read.
    #[error("stale {direction} token on fragment {fragment}")]
    StaleToken {
        fragment: FragmentId,
        direction: Direction,
    },

    #[error("entry indexes exhausted in fragment {0}")]
    IndexExhausted(FragmentId),
}

/// Per-entry decryption failure. Degrades one entry, never the batch.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecryptError {
    #[error("no key for session {0}")]
    MissingKey(String),

    #[error("malformed encrypted payload: {0}")]
    MalformedPayload(String),

    #[error("decryption failed: {0}")]
    Cipher(String),
}
