//! Typed identifiers for rooms, events, fragments and local transactions.
//!
//! Room and event IDs are server-assigned opaque strings with a leading sigil
//! (`!` for rooms, `$` for events). They are validated once at the edge and
//! then passed around as typed values.
//!
//! `FragmentId` is a per-room sequence number handed out when a fragment is
//! created. It says nothing about where the fragment lands in the timeline.
//!
//! `TxnId` wraps a UUIDv4 and identifies a message in the local send queue
//! until the server echoes it back.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Error from parsing a string identifier.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IdError {
    #[error("empty {0}")]
    Empty(&'static str),
    #[error("{kind} must start with '{sigil}': {value}")]
    MissingSigil {
        kind: &'static str,
        sigil: char,
        value: String,
    },
}

/// A room identifier (`!opaque:server`).
#[derive(Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RoomId(String);

/// A remote event identifier (`$opaque`).
#[derive(Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct EventId(String);

// ── String IDs ──────────────────────────────────────────────────────────────

macro_rules! impl_sigil_id {
    ($T:ident, $kind:literal, $sigil:literal) => {
        impl $T {
            /// Parse and validate an identifier.
            pub fn parse(s: impl Into<String>) -> Result<Self, IdError> {
                let s = s.into();
                if s.is_empty() {
                    return Err(IdError::Empty($kind));
                }
                if !s.starts_with($sigil) {
                    return Err(IdError::MissingSigil {
                        kind: $kind,
                        sigil: $sigil,
                        value: s,
                    });
                }
                Ok(Self(s))
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl TryFrom<String> for $T {
            type Error = IdError;

            fn try_from(s: String) -> Result<Self, Self::Error> {
                Self::parse(s)
            }
        }

        impl From<$T> for String {
            fn from(id: $T) -> String {
                id.0
            }
        }

        impl AsRef<str> for $T {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $T {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl fmt::Debug for $T {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($T), self.0)
            }
        }
    };
}

impl_sigil_id!(RoomId, "room id", '!');
impl_sigil_id!(EventId, "event id", '$');

// ── FragmentId ──────────────────────────────────────────────────────────────

/// Identifier of one stored span of history, unique per room.
#[derive(Clone, Copy, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FragmentId(u32);

/// Reserved id of the pseudo-fragment that holds pending local entries.
///
/// Never stored; always sorts after every real fragment.
pub const PENDING_FRAGMENT_ID: FragmentId = FragmentId(u32::MAX);

impl FragmentId {
    /// The id given to the first fragment of a room.
    pub const FIRST: FragmentId = FragmentId(0);

    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    pub const fn get(self) -> u32 {
        self.0
    }

    /// The id the next created fragment gets, or `None` once the next id
    /// would collide with [`PENDING_FRAGMENT_ID`].
    pub fn next(self) -> Option<Self> {
        self.0
            .checked_add(1)
            .map(Self)
            .filter(|next| !next.is_pending())
    }

    pub fn is_pending(self) -> bool {
        self == PENDING_FRAGMENT_ID
    }
}

impl fmt::Display for FragmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_pending() {
            f.write_str("pending")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

impl fmt::Debug for FragmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FragmentId({self})")
    }
}

// ── TxnId ───────────────────────────────────────────────────────────────────

/// Local transaction id of a queued message (UUIDv4).
#[derive(Clone, Copy, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TxnId(uuid::Uuid);

impl TxnId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }

    /// First 8 hex characters, for display only.
    pub fn short(&self) -> String {
        self.0.as_simple().to_string()[..8].to_string()
    }

    /// Parse the string form echoed back in `unsigned.transaction_id`.
    pub fn parse(s: &str) -> Result<Self, uuid::Error> {
        uuid::Uuid::parse_str(s).map(Self)
    }
}

impl Default for TxnId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TxnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for TxnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TxnId({})", self.short())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_room_id_requires_sigil() {
        assert!(RoomId::parse("!abc:example.org").is_ok());
        assert_eq!(
            RoomId::parse("abc:example.org"),
            Err(IdError::MissingSigil {
                kind: "room id",
                sigil: '!',
                value: "abc:example.org".into(),
            })
        );
        assert_eq!(RoomId::parse(""), Err(IdError::Empty("room id")));
    }

    #[test]
    fn test_event_id_serde_validates() {
        let id: EventId = serde_json::from_str("\"$ev1\"").unwrap();
        assert_eq!(id.as_str(), "$ev1");
        assert!(serde_json::from_str::<EventId>("\"ev1\"").is_err());
    }

    #[test]
    fn test_fragment_id_next_and_pending() {
        assert_eq!(FragmentId::FIRST.next(), Some(FragmentId::new(1)));
        assert_eq!(FragmentId::new(u32::MAX - 1).next(), None);
        assert_eq!(PENDING_FRAGMENT_ID.next(), None);
        assert!(PENDING_FRAGMENT_ID.is_pending());
        assert!(!FragmentId::FIRST.is_pending());
        assert_eq!(PENDING_FRAGMENT_ID.to_string(), "pending");
    }

    #[test]
    fn test_txn_id_roundtrips_through_string() {
        let txn = TxnId::new();
        assert_eq!(TxnId::parse(&txn.to_string()).unwrap(), txn);
        assert_eq!(txn.short().len(), 8);
    }
}
