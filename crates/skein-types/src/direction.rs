//! Traversal direction through a timeline.

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// Which way a read or a pagination request walks.
///
/// Serializes to the single-letter form used by pagination requests
/// (`"b"` / `"f"`).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
pub enum Direction {
    /// Towards older history.
    #[serde(rename = "b")]
    #[strum(to_string = "b", serialize = "backward")]
    Backward,
    /// Towards the live edge.
    #[serde(rename = "f")]
    #[strum(to_string = "f", serialize = "forward")]
    Forward,
}

impl Direction {
    pub fn is_forward(self) -> bool {
        matches!(self, Direction::Forward)
    }

    pub fn is_backward(self) -> bool {
        matches!(self, Direction::Backward)
    }

    pub fn opposite(self) -> Self {
        match self {
            Direction::Backward => Direction::Forward,
            Direction::Forward => Direction::Backward,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Direction::Backward => "b",
            Direction::Forward => "f",
        }
    }
}
