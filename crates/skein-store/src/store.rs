//! Transaction-scoped access to the timeline tables.

use std::ops::Deref;
use std::path::Path;

use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension, Transaction, TransactionBehavior, params};
use skein_types::{EntryIndex, EventId, Fragment, FragmentId, RoomId, SortKey, TimelineEvent};

use crate::error::{StoreError, StoreResult};

const SCHEMA: &str = r#"
-- Fragment metadata (links + pagination tokens)
CREATE TABLE IF NOT EXISTS fragments (
    room_id TEXT NOT NULL,
    fragment_id INTEGER NOT NULL,
    previous_id INTEGER,
    next_id INTEGER,
    previous_token TEXT,
    next_token TEXT,
    start_reached INTEGER NOT NULL DEFAULT 0,
    end_reached INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (room_id, fragment_id)
);

-- Timeline events (composite key doubles as the range-scan order)
CREATE TABLE IF NOT EXISTS timeline_events (
    room_id TEXT NOT NULL,
    fragment_id INTEGER NOT NULL,
    entry_index INTEGER NOT NULL,
    event_id TEXT NOT NULL,
    event_json TEXT NOT NULL,
    PRIMARY KEY (room_id, fragment_id, entry_index),
    FOREIGN KEY (room_id, fragment_id) REFERENCES fragments(room_id, fragment_id)
);
CREATE UNIQUE INDEX IF NOT EXISTS idx_timeline_events_event_id
    ON timeline_events(room_id, event_id);

-- Key material for encrypted events
CREATE TABLE IF NOT EXISTS room_keys (
    room_id TEXT NOT NULL,
    session_id TEXT NOT NULL,
    key BLOB NOT NULL,
    PRIMARY KEY (room_id, session_id)
);
"#;

// =============================================================================
// Row Structs (module-private helpers)
// =============================================================================

/// Maps a row from the fragments table.
#[derive(Debug)]
struct FragmentRow {
    room_id: String,
    fragment_id: u32,
    previous_id: Option<u32>,
    next_id: Option<u32>,
    previous_token: Option<String>,
    next_token: Option<String>,
    start_reached: bool,
    end_reached: bool,
}

/// Maps a row from the timeline_events table.
#[derive(Debug)]
struct EventRow {
    fragment_id: u32,
    entry_index: i64,
    event_json: String,
}

const FRAGMENT_COLUMNS: &str = "room_id, fragment_id, previous_id, next_id, \
     previous_token, next_token, start_reached, end_reached";

fn fragment_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<FragmentRow> {
    Ok(FragmentRow {
        room_id: row.get(0)?,
        fragment_id: row.get(1)?,
        previous_id: row.get(2)?,
        next_id: row.get(3)?,
        previous_token: row.get(4)?,
        next_token: row.get(5)?,
        start_reached: row.get(6)?,
        end_reached: row.get(7)?,
    })
}

fn event_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<EventRow> {
    Ok(EventRow {
        fragment_id: row.get(0)?,
        entry_index: row.get(1)?,
        event_json: row.get(2)?,
    })
}

// =============================================================================
// Conversion Functions
// =============================================================================

fn row_to_fragment(row: FragmentRow) -> StoreResult<Fragment> {
    Ok(Fragment {
        room_id: RoomId::parse(row.room_id)?,
        id: FragmentId::new(row.fragment_id),
        previous_id: row.previous_id.map(FragmentId::new),
        next_id: row.next_id.map(FragmentId::new),
        previous_token: row.previous_token,
        next_token: row.next_token,
        start_reached: row.start_reached,
        end_reached: row.end_reached,
    })
}

fn row_to_event(row: EventRow) -> StoreResult<StoredEvent> {
    Ok(StoredEvent {
        key: SortKey::new(FragmentId::new(row.fragment_id), EntryIndex::new(row.entry_index)),
        event: serde_json::from_str(&row.event_json)?,
    })
}

/// An event together with the position it is stored at.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredEvent {
    pub key: SortKey,
    pub event: TimelineEvent,
}

// =============================================================================
// Store
// =============================================================================

/// Database handle for timeline persistence.
///
/// The connection sits behind a mutex; each `read`/`write` call holds it for
/// the duration of one transaction.
pub struct TimelineStore {
    conn: Mutex<Connection>,
}

impl TimelineStore {
    /// Open or create a database at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> StoreResult<Self> {
        let conn = Connection::open(path)?;
        Self::init(conn)
    }

    /// Create an in-memory database (for testing).
    pub fn in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> StoreResult<Self> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    /// Run `f` inside a read transaction.
    pub fn read<T>(&self, f: impl FnOnce(&ReadTxn<'_>) -> StoreResult<T>) -> StoreResult<T> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Deferred)?;
        let txn = ReadTxn { tx };
        let value = f(&txn)?;
        txn.tx.commit()?;
        Ok(value)
    }

    /// Run `f` inside a read-write transaction.
    ///
    /// Commits when `f` returns `Ok`; any error rolls the whole transaction
    /// back, so callers never observe a partial write.
    pub fn write<T, E>(&self, f: impl FnOnce(&WriteTxn<'_>) -> Result<T, E>) -> Result<T, E>
    where
        E: From<StoreError>,
    {
        let mut conn = self.conn.lock();
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(StoreError::from)?;
        let txn = WriteTxn { read: ReadTxn { tx } };
        match f(&txn) {
            Ok(value) => {
                txn.read.tx.commit().map_err(StoreError::from)?;
                Ok(value)
            }
            Err(e) => {
                if let Err(rollback) = txn.read.tx.rollback() {
                    tracing::warn!("rollback failed: {rollback}");
                }
                Err(e)
            }
        }
    }
}

// =============================================================================
// Read transaction
// =============================================================================

/// A read transaction spanning fragments, events and room keys.
pub struct ReadTxn<'conn> {
    tx: Transaction<'conn>,
}

impl ReadTxn<'_> {
    // =========================================================================
    // Fragments
    // =========================================================================

    /// Get a fragment by id.
    pub fn fragment(&self, room: &RoomId, id: FragmentId) -> StoreResult<Option<Fragment>> {
        let row = self
            .tx
            .query_row(
                &format!(
                    "SELECT {FRAGMENT_COLUMNS} FROM fragments
                     WHERE room_id = ?1 AND fragment_id = ?2"
                ),
                params![room.as_str(), id.get()],
                fragment_row,
            )
            .optional()?;
        row.map(row_to_fragment).transpose()
    }

    /// Get a fragment that must exist.
    pub fn require_fragment(&self, room: &RoomId, id: FragmentId) -> StoreResult<Fragment> {
        self.fragment(room, id)?.ok_or_else(|| StoreError::MissingFragment {
            room: room.clone(),
            fragment: id,
        })
    }

    /// The fragment receiving live events: no next link, no next token.
    ///
    /// If inconsistent data leaves several candidates, the newest wins.
    pub fn live_fragment(&self, room: &RoomId) -> StoreResult<Option<Fragment>> {
        let row = self
            .tx
            .query_row(
                &format!(
                    "SELECT {FRAGMENT_COLUMNS} FROM fragments
                     WHERE room_id = ?1 AND next_id IS NULL AND next_token IS NULL
                     ORDER BY fragment_id DESC LIMIT 1"
                ),
                params![room.as_str()],
                fragment_row,
            )
            .optional()?;
        row.map(row_to_fragment).transpose()
    }

    /// All fragments of a room, in creation order.
    pub fn fragments(&self, room: &RoomId) -> StoreResult<Vec<Fragment>> {
        let mut stmt = self.tx.prepare(&format!(
            "SELECT {FRAGMENT_COLUMNS} FROM fragments
             WHERE room_id = ?1 ORDER BY fragment_id"
        ))?;
        let rows = stmt
            .query_map(params![room.as_str()], fragment_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.into_iter().map(row_to_fragment).collect()
    }

    /// Highest fragment id used in a room.
    pub fn max_fragment_id(&self, room: &RoomId) -> StoreResult<Option<FragmentId>> {
        let max: Option<u32> = self.tx.query_row(
            "SELECT MAX(fragment_id) FROM fragments WHERE room_id = ?1",
            params![room.as_str()],
            |row| row.get(0),
        )?;
        Ok(max.map(FragmentId::new))
    }

    // =========================================================================
    // Events
    // =========================================================================

    /// Up to `limit` events after `key` in the same fragment, ascending.
    pub fn events_after(
        &self,
        room: &RoomId,
        key: SortKey,
        limit: usize,
    ) -> StoreResult<Vec<StoredEvent>> {
        self.scan(
            "SELECT fragment_id, entry_index, event_json FROM timeline_events
             WHERE room_id = ?1 AND fragment_id = ?2 AND entry_index > ?3
             ORDER BY entry_index ASC LIMIT ?4",
            room,
            key,
            limit,
        )
    }

    /// Up to `limit` events before `key` in the same fragment, nearest first
    /// (descending).
    pub fn events_before(
        &self,
        room: &RoomId,
        key: SortKey,
        limit: usize,
    ) -> StoreResult<Vec<StoredEvent>> {
        self.scan(
            "SELECT fragment_id, entry_index, event_json FROM timeline_events
             WHERE room_id = ?1 AND fragment_id = ?2 AND entry_index < ?3
             ORDER BY entry_index DESC LIMIT ?4",
            room,
            key,
            limit,
        )
    }

    fn scan(
        &self,
        sql: &str,
        room: &RoomId,
        key: SortKey,
        limit: usize,
    ) -> StoreResult<Vec<StoredEvent>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let mut stmt = self.tx.prepare_cached(sql)?;
        let rows = stmt
            .query_map(
                params![room.as_str(), key.fragment_id.get(), key.entry_index.get(), limit],
                event_row,
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.into_iter().map(row_to_event).collect()
    }

    /// Lowest entry index stored in a fragment.
    pub fn first_index(&self, room: &RoomId, fragment: FragmentId) -> StoreResult<Option<EntryIndex>> {
        self.index_bound("MIN", room, fragment)
    }

    /// Highest entry index stored in a fragment.
    pub fn last_index(&self, room: &RoomId, fragment: FragmentId) -> StoreResult<Option<EntryIndex>> {
        self.index_bound("MAX", room, fragment)
    }

    fn index_bound(
        &self,
        agg: &str,
        room: &RoomId,
        fragment: FragmentId,
    ) -> StoreResult<Option<EntryIndex>> {
        let bound: Option<i64> = self.tx.query_row(
            &format!(
                "SELECT {agg}(entry_index) FROM timeline_events
                 WHERE room_id = ?1 AND fragment_id = ?2"
            ),
            params![room.as_str(), fragment.get()],
            |row| row.get(0),
        )?;
        Ok(bound.map(EntryIndex::new))
    }

    /// Where an event is stored, if it is.
    pub fn event_key(&self, room: &RoomId, event_id: &EventId) -> StoreResult<Option<SortKey>> {
        let key = self
            .tx
            .query_row(
                "SELECT fragment_id, entry_index FROM timeline_events
                 WHERE room_id = ?1 AND event_id = ?2",
                params![room.as_str(), event_id.as_str()],
                |row| Ok((row.get::<_, u32>(0)?, row.get::<_, i64>(1)?)),
            )
            .optional()?;
        Ok(key.map(|(f, i)| SortKey::new(FragmentId::new(f), EntryIndex::new(i))))
    }

    /// Number of events stored in a fragment.
    pub fn event_count(&self, room: &RoomId, fragment: FragmentId) -> StoreResult<usize> {
        let count: i64 = self.tx.query_row(
            "SELECT COUNT(*) FROM timeline_events WHERE room_id = ?1 AND fragment_id = ?2",
            params![room.as_str(), fragment.get()],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    // =========================================================================
    // Room keys
    // =========================================================================

    /// Key material for a megolm-style session.
    pub fn room_key(&self, room: &RoomId, session_id: &str) -> StoreResult<Option<Vec<u8>>> {
        Ok(self
            .tx
            .query_row(
                "SELECT key FROM room_keys WHERE room_id = ?1 AND session_id = ?2",
                params![room.as_str(), session_id],
                |row| row.get(0),
            )
            .optional()?)
    }
}

// =============================================================================
// Write transaction
// =============================================================================

/// A read-write transaction. Dereferences to [`ReadTxn`] for lookups.
pub struct WriteTxn<'conn> {
    read: ReadTxn<'conn>,
}

impl<'conn> Deref for WriteTxn<'conn> {
    type Target = ReadTxn<'conn>;

    fn deref(&self) -> &Self::Target {
        &self.read
    }
}

impl WriteTxn<'_> {
    /// Insert or update a fragment in place; stored events keep their parent row.
    pub fn put_fragment(&self, fragment: &Fragment) -> StoreResult<()> {
        self.read.tx.execute(
            "INSERT INTO fragments (
                room_id, fragment_id, previous_id, next_id,
                previous_token, next_token, start_reached, end_reached
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            ON CONFLICT (room_id, fragment_id) DO UPDATE SET
                previous_id = excluded.previous_id,
                next_id = excluded.next_id,
                previous_token = excluded.previous_token,
                next_token = excluded.next_token,
                start_reached = excluded.start_reached,
                end_reached = excluded.end_reached",
            params![
                fragment.room_id.as_str(),
                fragment.id.get(),
                fragment.previous_id.map(FragmentId::get),
                fragment.next_id.map(FragmentId::get),
                fragment.previous_token,
                fragment.next_token,
                fragment.start_reached,
                fragment.end_reached,
            ],
        )?;
        Ok(())
    }

    /// Store an event at `key`. Fails if the key or the event id is taken.
    pub fn insert_event(&self, room: &RoomId, key: SortKey, event: &TimelineEvent) -> StoreResult<()> {
        if self.read.event_key(room, &event.event_id)?.is_some() {
            return Err(StoreError::DuplicateEvent(event.event_id.clone()));
        }
        let json = serde_json::to_string(event)?;
        self.read.tx.execute(
            "INSERT INTO timeline_events (room_id, fragment_id, entry_index, event_id, event_json)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                room.as_str(),
                key.fragment_id.get(),
                key.entry_index.get(),
                event.event_id.as_str(),
                json,
            ],
        )?;
        Ok(())
    }

    /// Insert or replace key material for a session.
    pub fn put_room_key(&self, room: &RoomId, session_id: &str, key: &[u8]) -> StoreResult<()> {
        self.read.tx.execute(
            "INSERT OR REPLACE INTO room_keys (room_id, session_id, key) VALUES (?1, ?2, ?3)",
            params![room.as_str(), session_id, key],
        )?;
        Ok(())
    }
}
