//! Fragment metadata: one contiguous span of history from a single fetch.

use serde::{Deserialize, Serialize};

use crate::direction::Direction;
use crate::ids::{FragmentId, RoomId};

/// Metadata for one independently fetched span of room history.
///
/// Fragments form doubly-linked chains through `previous_id` / `next_id`.
/// Chains stay disconnected until pagination finds the events that join them.
/// The `id` reflects creation order only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fragment {
    pub room_id: RoomId,
    pub id: FragmentId,
    pub previous_id: Option<FragmentId>,
    pub next_id: Option<FragmentId>,
    /// Cursor to paginate backward from the start of this fragment.
    pub previous_token: Option<String>,
    /// Cursor to paginate forward from the end of this fragment.
    pub next_token: Option<String>,
    /// The start of the room's history is inside this fragment.
    pub start_reached: bool,
    /// Nothing newer exists past this fragment's end.
    pub end_reached: bool,
}

impl Fragment {
    /// A fresh, unlinked fragment.
    pub fn new(room_id: RoomId, id: FragmentId) -> Self {
        Self {
            room_id,
            id,
            previous_id: None,
            next_id: None,
            previous_token: None,
            next_token: None,
            start_reached: false,
            end_reached: false,
        }
    }

    pub fn with_previous_token(mut self, token: impl Into<String>) -> Self {
        self.previous_token = Some(token.into());
        self
    }

    pub fn with_next_token(mut self, token: impl Into<String>) -> Self {
        self.next_token = Some(token.into());
        self
    }

    /// The live fragment receives synced events: nothing is known past its end.
    pub fn is_live(&self) -> bool {
        self.next_id.is_none() && self.next_token.is_none()
    }

    /// Pagination token at the edge facing `direction`.
    pub fn token(&self, direction: Direction) -> Option<&str> {
        match direction {
            Direction::Backward => self.previous_token.as_deref(),
            Direction::Forward => self.next_token.as_deref(),
        }
    }

    pub fn set_token(&mut self, direction: Direction, token: Option<String>) {
        match direction {
            Direction::Backward => self.previous_token = token,
            Direction::Forward => self.next_token = token,
        }
    }

    /// Neighbouring fragment at the edge facing `direction`.
    pub fn linked_id(&self, direction: Direction) -> Option<FragmentId> {
        match direction {
            Direction::Backward => self.previous_id,
            Direction::Forward => self.next_id,
        }
    }

    pub fn set_linked_id(&mut self, direction: Direction, id: Option<FragmentId>) {
        match direction {
            Direction::Backward => self.previous_id = id,
            Direction::Forward => self.next_id = id,
        }
    }

    /// Whether history provably ends at the edge facing `direction`.
    pub fn edge_reached(&self, direction: Direction) -> bool {
        match direction {
            Direction::Backward => self.start_reached,
            Direction::Forward => self.end_reached,
        }
    }

    pub fn set_edge_reached(&mut self, direction: Direction, reached: bool) {
        match direction {
            Direction::Backward => self.start_reached = reached,
            Direction::Forward => self.end_reached = reached,
        }
    }
}
