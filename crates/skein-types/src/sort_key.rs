//! Positions inside the timeline.
//!
//! A [`SortKey`] is `(fragment, entry index)`. Indexes are only comparable
//! within one fragment; ordering across fragments needs the fragment graph,
//! which is why `SortKey` deliberately does not implement `Ord`.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::ids::{FragmentId, PENDING_FRAGMENT_ID};

/// Position of an entry inside its fragment.
///
/// Forward appends count up from [`EntryIndex::FIRST`], backfill counts down.
/// The two extreme values are reserved for fragment boundaries.
#[derive(Clone, Copy, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntryIndex(i64);

impl EntryIndex {
    /// Sentinel before the first event of a fragment.
    pub const MIN: EntryIndex = EntryIndex(i64::MIN);
    /// Sentinel after the last event of a fragment.
    pub const MAX: EntryIndex = EntryIndex(i64::MAX);
    /// Index of the first event written into an empty fragment.
    pub const FIRST: EntryIndex = EntryIndex(0);

    pub const fn new(raw: i64) -> Self {
        Self(raw)
    }

    pub const fn get(self) -> i64 {
        self.0
    }

    pub fn is_sentinel(self) -> bool {
        self == Self::MIN || self == Self::MAX
    }

    /// Index one step towards the live edge; `None` when it would hit a sentinel.
    pub fn next(self) -> Option<Self> {
        self.0
            .checked_add(1)
            .map(Self)
            .filter(|i| *i != Self::MAX)
    }

    /// Index one step towards older history; `None` when it would hit a sentinel.
    pub fn previous(self) -> Option<Self> {
        self.0
            .checked_sub(1)
            .map(Self)
            .filter(|i| *i != Self::MIN)
    }
}

impl fmt::Display for EntryIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::MIN => f.write_str("start"),
            Self::MAX => f.write_str("end"),
            EntryIndex(i) => write!(f, "{i}"),
        }
    }
}

impl fmt::Debug for EntryIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EntryIndex({self})")
    }
}

/// Comparable position of a timeline entry.
#[derive(Clone, Copy, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct SortKey {
    pub fragment_id: FragmentId,
    pub entry_index: EntryIndex,
}

impl SortKey {
    pub fn new(fragment_id: FragmentId, entry_index: EntryIndex) -> Self {
        Self { fragment_id, entry_index }
    }

    /// Position of the start boundary of a fragment.
    pub fn fragment_start(fragment_id: FragmentId) -> Self {
        Self::new(fragment_id, EntryIndex::MIN)
    }

    /// Position of the end boundary of a fragment.
    pub fn fragment_end(fragment_id: FragmentId) -> Self {
        Self::new(fragment_id, EntryIndex::MAX)
    }

    /// Position of a pending entry with the given send-queue index.
    pub fn pending(queue_index: u32) -> Self {
        Self::new(PENDING_FRAGMENT_ID, EntryIndex::new(queue_index as i64))
    }

    pub fn is_fragment_start(&self) -> bool {
        self.entry_index == EntryIndex::MIN
    }

    pub fn is_fragment_end(&self) -> bool {
        self.entry_index == EntryIndex::MAX
    }

    pub fn is_pending(&self) -> bool {
        self.fragment_id.is_pending()
    }

    /// Key of the next event slot in the same fragment.
    pub fn next_key(&self) -> Option<Self> {
        self.entry_index.next().map(|i| Self::new(self.fragment_id, i))
    }

    /// Key of the previous event slot in the same fragment.
    pub fn previous_key(&self) -> Option<Self> {
        self.entry_index.previous().map(|i| Self::new(self.fragment_id, i))
    }
}

impl fmt::Display for SortKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.fragment_id, self.entry_index)
    }
}

impl fmt::Debug for SortKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SortKey({self})")
    }
}
