//! Per-room timeline session.

use std::sync::Arc;

use skein_store::TimelineStore;
use skein_types::{Direction, FragmentId, PendingEvent, RoomId, SortKey, TxnId};

use crate::Result;
use crate::comparer::FragmentIdComparer;
use crate::config::TimelineConfig;
use crate::decrypt::Decryptor;
use crate::entry::{EventEntry, FragmentBoundaryEntry, TimelineEntry};
use crate::error::GapFillError;
use crate::gap::{FillOutcome, GapFiller, GapState, PaginationSource};
use crate::pending::PendingQueue;
use crate::reader::TimelineReader;
use crate::sync::{SyncTimeline, SyncWriter};

/// Everything needed to read, paginate and sync one open room.
///
/// Owns the room's comparer and pending queue; both live exactly as long as
/// the session.
pub struct RoomTimeline {
    room_id: RoomId,
    config: TimelineConfig,
    store: Arc<TimelineStore>,
    comparer: Arc<FragmentIdComparer>,
    pending: Arc<PendingQueue>,
    reader: TimelineReader,
    filler: GapFiller,
    sync: SyncWriter,
}

impl RoomTimeline {
    pub fn open(
        room_id: RoomId,
        store: Arc<TimelineStore>,
        source: Arc<dyn PaginationSource>,
        config: &TimelineConfig,
    ) -> Self {
        let comparer = Arc::new(FragmentIdComparer::new());
        let pending = Arc::new(PendingQueue::new());
        Self {
            reader: TimelineReader::new(
                room_id.clone(),
                store.clone(),
                comparer.clone(),
                pending.clone(),
            ),
            filler: GapFiller::new(room_id.clone(), store.clone(), comparer.clone(), source),
            sync: SyncWriter::new(room_id.clone(), store.clone(), comparer.clone(), pending.clone()),
            room_id,
            config: config.clone(),
            store,
            comparer,
            pending,
        }
    }

    pub fn with_decryptor(mut self, decryptor: Arc<dyn Decryptor>) -> Self {
        self.reader = self.reader.with_decryptor(decryptor);
        self
    }

    pub fn room_id(&self) -> &RoomId {
        &self.room_id
    }

    pub fn config(&self) -> &TimelineConfig {
        &self.config
    }

    pub fn comparer(&self) -> &FragmentIdComparer {
        &self.comparer
    }

    pub fn pending(&self) -> &PendingQueue {
        &self.pending
    }

    pub fn reader(&self) -> &TimelineReader {
        &self.reader
    }

    pub fn gap_filler(&self) -> &GapFiller {
        &self.filler
    }

    /// Register every stored fragment of the room with the comparer.
    ///
    /// Returns the number of fragments loaded.
    pub fn load_fragments(&self) -> Result<usize> {
        let fragments = self.store.read(|txn| txn.fragments(&self.room_id))?;
        self.comparer.add_all(&fragments);
        tracing::debug!(room = %self.room_id, fragments = fragments.len(), "loaded fragments");
        Ok(fragments.len())
    }

    /// Load all fragments, then read the newest page of the live fragment.
    pub async fn load_live(&self) -> Result<Vec<TimelineEntry>> {
        self.load_fragments()?;
        self.reader.read_from_live_edge(self.config.page_size).await
    }

    pub async fn read_from(
        &self,
        from: SortKey,
        direction: Direction,
        amount: usize,
    ) -> Result<Vec<TimelineEntry>> {
        self.reader.read_from(from, direction, amount).await
    }

    /// One configured page in `direction` from `from`.
    pub async fn read_page(&self, from: SortKey, direction: Direction) -> Result<Vec<TimelineEntry>> {
        self.reader.read_from(from, direction, self.config.page_size).await
    }

    /// End boundary key of the live fragment.
    pub fn live_edge(&self) -> Result<Option<SortKey>> {
        self.reader.live_edge()
    }

    pub async fn read_from_live_edge(&self, amount: usize) -> Result<Vec<TimelineEntry>> {
        self.reader.read_from_live_edge(amount).await
    }

    pub fn pending_entries(&self) -> Vec<TimelineEntry> {
        self.reader.pending_entries()
    }

    /// Fill a gap with one configured page.
    pub async fn fill_gap(&self, gap: &FragmentBoundaryEntry) -> std::result::Result<FillOutcome, GapFillError> {
        self.filler.fill_gap(gap, self.config.gap_fill_size).await
    }

    pub fn gap_state(&self, fragment: FragmentId, direction: Direction) -> GapState {
        self.filler.state(fragment, direction)
    }

    /// Queue a local message; it shows up as a pending entry until sync
    /// echoes it back.
    pub fn enqueue(&self, event_type: impl Into<String>, content: serde_json::Value) -> PendingEvent {
        self.pending.enqueue(event_type, content)
    }

    /// Drop a queued message that will never be sent.
    pub fn cancel_pending(&self, txn_id: &TxnId) -> Option<PendingEvent> {
        self.pending.retire(txn_id)
    }

    pub fn write_sync(&self, sync: &SyncTimeline) -> Result<Vec<EventEntry>> {
        self.sync.write_sync(sync)
    }
}
