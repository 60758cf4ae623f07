//! Timeline entries: the uniform unit the reader hands to the UI.
//!
//! Every entry has a [`SortKey`]. Entries from the same fragment compare by
//! index alone; across fragments they need a [`FragmentIdComparer`].

use std::cmp::Ordering;

use skein_store::StoredEvent;
use skein_types::{
    Direction, EntryIndex, Fragment, FragmentId, PendingEvent, SortKey, TimelineEvent,
};

use crate::comparer::FragmentIdComparer;
use crate::decrypt::DecryptionState;
use crate::error::ComparerError;

// ============================================================================
// TimelineEntry
// ============================================================================

/// One position in the timeline.
#[derive(Debug, Clone, PartialEq)]
pub enum TimelineEntry {
    /// A stored remote event.
    Event(EventEntry),
    /// The start or end edge of a fragment; a gap when more history can be
    /// fetched there.
    Boundary(FragmentBoundaryEntry),
    /// A local message not yet confirmed by the server.
    Pending(PendingEntry),
}

impl TimelineEntry {
    pub fn sort_key(&self) -> SortKey {
        match self {
            Self::Event(e) => e.key,
            Self::Boundary(b) => b.sort_key(),
            Self::Pending(p) => p.sort_key(),
        }
    }

    pub fn fragment_id(&self) -> FragmentId {
        self.sort_key().fragment_id
    }

    pub fn entry_index(&self) -> EntryIndex {
        self.sort_key().entry_index
    }

    /// Whether this entry marks unfetched history.
    pub fn is_gap(&self) -> bool {
        matches!(self, Self::Boundary(b) if b.is_gap())
    }

    /// Timeline order of two entries.
    pub fn compare(
        &self,
        other: &TimelineEntry,
        comparer: &FragmentIdComparer,
    ) -> Result<Ordering, ComparerError> {
        comparer.compare(self.sort_key(), other.sort_key())
    }

    /// Event content as the UI should render it: decrypted content when
    /// available, otherwise the raw payload.
    pub fn content(&self) -> Option<&serde_json::Value> {
        match self {
            Self::Event(e) => Some(e.content()),
            Self::Pending(p) => Some(&p.event.content),
            Self::Boundary(_) => None,
        }
    }

    pub fn as_event(&self) -> Option<&EventEntry> {
        match self {
            Self::Event(e) => Some(e),
            _ => None,
        }
    }

    pub fn as_boundary(&self) -> Option<&FragmentBoundaryEntry> {
        match self {
            Self::Boundary(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_pending(&self) -> Option<&PendingEntry> {
        match self {
            Self::Pending(p) => Some(p),
            _ => None,
        }
    }
}

// ============================================================================
// EventEntry
// ============================================================================

/// A stored event at its position.
#[derive(Debug, Clone, PartialEq)]
pub struct EventEntry {
    pub key: SortKey,
    pub event: TimelineEvent,
    pub decryption: DecryptionState,
}

impl EventEntry {
    pub fn new(key: SortKey, event: TimelineEvent) -> Self {
        let decryption = if event.is_encrypted() {
            DecryptionState::Encrypted
        } else {
            DecryptionState::NotEncrypted
        };
        Self { key, event, decryption }
    }

    /// Effective event type after decryption.
    pub fn event_type(&self) -> &str {
        match &self.decryption {
            DecryptionState::Decrypted { event_type, .. } => event_type,
            _ => &self.event.event_type,
        }
    }

    /// Effective content after decryption.
    pub fn content(&self) -> &serde_json::Value {
        match &self.decryption {
            DecryptionState::Decrypted { content, .. } => content,
            _ => &self.event.content,
        }
    }
}

impl From<StoredEvent> for EventEntry {
    fn from(stored: StoredEvent) -> Self {
        Self::new(stored.key, stored.event)
    }
}

// ============================================================================
// FragmentBoundaryEntry
// ============================================================================

/// The start (`Backward`) or end (`Forward`) edge of a fragment.
///
/// Carries a snapshot of the fragment so that token, link and edge flags can
/// be inspected without another storage round trip.
#[derive(Debug, Clone, PartialEq)]
pub struct FragmentBoundaryEntry {
    pub fragment: Fragment,
    pub direction: Direction,
}

impl FragmentBoundaryEntry {
    pub fn new(fragment: Fragment, direction: Direction) -> Self {
        Self { fragment, direction }
    }

    pub fn start(fragment: Fragment) -> Self {
        Self::new(fragment, Direction::Backward)
    }

    pub fn end(fragment: Fragment) -> Self {
        Self::new(fragment, Direction::Forward)
    }

    pub fn fragment_id(&self) -> FragmentId {
        self.fragment.id
    }

    pub fn is_start(&self) -> bool {
        self.direction.is_backward()
    }

    pub fn is_end(&self) -> bool {
        self.direction.is_forward()
    }

    pub fn sort_key(&self) -> SortKey {
        match self.direction {
            Direction::Backward => SortKey::fragment_start(self.fragment.id),
            Direction::Forward => SortKey::fragment_end(self.fragment.id),
        }
    }

    /// Pagination token at this edge.
    pub fn token(&self) -> Option<&str> {
        self.fragment.token(self.direction)
    }

    pub fn edge_reached(&self) -> bool {
        self.fragment.edge_reached(self.direction)
    }

    /// The fragment on the other side of this edge, if a link is known.
    pub fn linked_fragment_id(&self) -> Option<FragmentId> {
        self.fragment.linked_id(self.direction)
    }

    /// A gap: more history can be fetched here and the room edge was not hit.
    pub fn is_gap(&self) -> bool {
        self.token().is_some() && !self.edge_reached()
    }

    /// The facing boundary of the linked fragment.
    ///
    /// `self` being the end of A and `next` the fragment B it links to, this
    /// is the start of B.
    pub fn neighbour(&self, next: Fragment) -> Self {
        Self::new(next, self.direction.opposite())
    }
}

// ============================================================================
// PendingEntry
// ============================================================================

/// A queued local message, ordered after every stored event.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingEntry {
    pub event: PendingEvent,
}

impl PendingEntry {
    pub fn new(event: PendingEvent) -> Self {
        Self { event }
    }

    pub fn sort_key(&self) -> SortKey {
        self.event.sort_key()
    }
}
