//! Ingesting live sync batches into the live fragment.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use skein_store::{TimelineStore, WriteTxn};
use skein_types::{EntryIndex, Fragment, FragmentId, RoomId, SortKey, TimelineEvent};

use crate::Result;
use crate::comparer::FragmentIdComparer;
use crate::entry::EventEntry;
use crate::error::TimelineError;
use crate::pending::PendingQueue;

/// The timeline section of one sync response for a room.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncTimeline {
    /// New events, oldest first.
    #[serde(default)]
    pub events: Vec<TimelineEvent>,
    /// The server skipped events between the previous batch and this one.
    #[serde(default)]
    pub limited: bool,
    /// Token to paginate backward from the first event of this batch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prev_batch: Option<String>,
}

/// Appends sync batches to the live fragment and retires confirmed pending
/// messages.
pub struct SyncWriter {
    room_id: RoomId,
    store: Arc<TimelineStore>,
    comparer: Arc<FragmentIdComparer>,
    pending: Arc<PendingQueue>,
}

impl SyncWriter {
    pub fn new(
        room_id: RoomId,
        store: Arc<TimelineStore>,
        comparer: Arc<FragmentIdComparer>,
        pending: Arc<PendingQueue>,
    ) -> Self {
        Self {
            room_id,
            store,
            comparer,
            pending,
        }
    }

    /// Write one sync batch. Returns the entries that were stored; events
    /// already present are skipped.
    ///
    /// A limited batch with a `prev_batch` token starts a new live fragment:
    /// the old live fragment keeps the token as its forward gap, the new one
    /// as its backward gap.
    #[tracing::instrument(skip(self, sync), fields(room = %self.room_id, events = sync.events.len(), limited = sync.limited), name = "timeline.sync")]
    pub fn write_sync(&self, sync: &SyncTimeline) -> Result<Vec<EventEntry>> {
        let (written, touched) = self.store.write(|txn| self.apply(txn, sync))?;
        self.comparer.add_all(&touched);

        let retired = self.pending.retire_confirmed(&sync.events);
        tracing::debug!(written = written.len(), retired = retired.len(), "applied sync batch");
        Ok(written)
    }

    fn apply(
        &self,
        txn: &WriteTxn<'_>,
        sync: &SyncTimeline,
    ) -> Result<(Vec<EventEntry>, Vec<Fragment>)> {
        let room = &self.room_id;
        let mut touched = Vec::new();

        let live = match txn.live_fragment(room)? {
            None => {
                let live = self.create_fragment(txn, sync.prev_batch.clone())?;
                touched.push(live.clone());
                live
            }
            Some(mut old) if sync.limited => match &sync.prev_batch {
                Some(token) => {
                    old.next_token = Some(token.clone());
                    txn.put_fragment(&old)?;
                    touched.push(old);
                    let live = self.create_fragment(txn, Some(token.clone()))?;
                    touched.push(live.clone());
                    live
                }
                None => {
                    tracing::warn!(fragment = %old.id, "limited sync without prev_batch, appending to live fragment");
                    old
                }
            },
            Some(live) => live,
        };

        let mut cursor = match txn.last_index(room, live.id)? {
            Some(last) => last.next(),
            None => Some(EntryIndex::FIRST),
        };

        let mut written = Vec::new();
        for event in &sync.events {
            if let Some(existing) = txn.event_key(room, &event.event_id)? {
                tracing::debug!(event_id = %event.event_id, key = %existing, "skipping already stored sync event");
                continue;
            }
            let index = cursor.ok_or(TimelineError::IndexExhausted(live.id))?;
            let key = SortKey::new(live.id, index);
            txn.insert_event(room, key, event)?;
            written.push(EventEntry::new(key, event.clone()));
            cursor = index.next();
        }

        if touched.is_empty() {
            touched.push(live);
        }
        Ok((written, touched))
    }

    fn create_fragment(&self, txn: &WriteTxn<'_>, previous_token: Option<String>) -> Result<Fragment> {
        let id = match txn.max_fragment_id(&self.room_id)? {
            Some(max) => max.next().ok_or(TimelineError::FragmentIdsExhausted(max))?,
            None => FragmentId::FIRST,
        };
        let mut fragment = Fragment::new(self.room_id.clone(), id);
        fragment.previous_token = previous_token;
        txn.put_fragment(&fragment)?;
        tracing::info!(fragment = %id, gap = fragment.previous_token.is_some(), "created live fragment");
        Ok(fragment)
    }
}
