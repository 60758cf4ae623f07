//! Local send queue surfaced as pending timeline entries.

use parking_lot::Mutex;
use skein_types::{EntryIndex, PendingEvent, TimelineEvent, TxnId};

use crate::entry::{PendingEntry, TimelineEntry};

#[derive(Debug, Default)]
struct QueueState {
    next_index: u32,
    events: Vec<PendingEvent>,
}

/// Messages sent locally and not yet echoed back by sync.
///
/// Queue indexes increase monotonically and are never reused within a
/// session, so pending entries keep a stable order as earlier ones retire.
#[derive(Debug, Default)]
pub struct PendingQueue {
    state: Mutex<QueueState>,
}

impl PendingQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a message and return its pending record.
    pub fn enqueue(&self, event_type: impl Into<String>, content: serde_json::Value) -> PendingEvent {
        let mut state = self.state.lock();
        let event = PendingEvent {
            queue_index: state.next_index,
            txn_id: TxnId::new(),
            event_type: event_type.into(),
            content,
        };
        state.next_index = state.next_index.saturating_add(1);
        state.events.push(event.clone());
        tracing::debug!(txn = %event.txn_id.short(), index = event.queue_index, "queued local event");
        event
    }

    /// Drop a pending message, e.g. after the send was cancelled.
    pub fn retire(&self, txn_id: &TxnId) -> Option<PendingEvent> {
        let mut state = self.state.lock();
        let pos = state.events.iter().position(|e| &e.txn_id == txn_id)?;
        Some(state.events.remove(pos))
    }

    /// Retire every pending message whose transaction id is echoed by one of
    /// `events`. Returns the retired records.
    pub fn retire_confirmed(&self, events: &[TimelineEvent]) -> Vec<PendingEvent> {
        let confirmed: Vec<TxnId> = events.iter().filter_map(TimelineEvent::transaction_id).collect();
        if confirmed.is_empty() {
            return Vec::new();
        }
        let mut state = self.state.lock();
        let (retired, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut state.events)
            .into_iter()
            .partition(|e| confirmed.contains(&e.txn_id));
        state.events = kept;
        for event in &retired {
            tracing::debug!(txn = %event.txn_id.short(), "pending event confirmed by sync");
        }
        retired
    }

    /// All pending entries in queue order.
    pub fn entries(&self) -> Vec<TimelineEntry> {
        self.state
            .lock()
            .events
            .iter()
            .cloned()
            .map(|e| TimelineEntry::Pending(PendingEntry::new(e)))
            .collect()
    }

    /// Up to `limit` pending entries after queue position `index`, ascending.
    ///
    /// `EntryIndex::MIN` starts from the beginning of the queue.
    pub fn after(&self, index: EntryIndex, limit: usize) -> Vec<TimelineEntry> {
        self.state
            .lock()
            .events
            .iter()
            .filter(|e| EntryIndex::new(i64::from(e.queue_index)) > index)
            .take(limit)
            .cloned()
            .map(|e| TimelineEntry::Pending(PendingEntry::new(e)))
            .collect()
    }

    /// Up to `limit` pending entries before queue position `index`, nearest
    /// first (descending).
    pub fn before(&self, index: EntryIndex, limit: usize) -> Vec<TimelineEntry> {
        self.state
            .lock()
            .events
            .iter()
            .rev()
            .filter(|e| EntryIndex::new(i64::from(e.queue_index)) < index)
            .take(limit)
            .cloned()
            .map(|e| TimelineEntry::Pending(PendingEntry::new(e)))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.state.lock().events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().events.is_empty()
    }
}
