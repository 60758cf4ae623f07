//! Bidirectional reads over the fragment graph.
//!
//! A read walks from a position in one direction, collecting stored events.
//! At a fragment edge it emits the boundary entry and, if a link is known,
//! the neighbour's facing boundary before continuing into the neighbour. An
//! edge without a link ends the read: it is either a gap or the end of
//! history. Reading forward off the live fragment continues into the pending
//! queue.
//!
//! Results are always returned in ascending timeline order, whatever the
//! read direction. `amount` bounds the number of events and pending entries;
//! boundary entries come on top.

use std::collections::HashSet;
use std::sync::Arc;

use skein_store::{ReadTxn, StoreResult, TimelineStore};
use skein_types::{Direction, EntryIndex, RoomId, SortKey};

use crate::Result;
use crate::comparer::FragmentIdComparer;
use crate::decrypt::{Decryptor, decrypt_entries};
use crate::entry::{EventEntry, FragmentBoundaryEntry, TimelineEntry};
use crate::pending::PendingQueue;

/// Reads timeline entries for one room.
pub struct TimelineReader {
    room_id: RoomId,
    store: Arc<TimelineStore>,
    comparer: Arc<FragmentIdComparer>,
    pending: Arc<PendingQueue>,
    decryptor: Option<Arc<dyn Decryptor>>,
}

impl TimelineReader {
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
            decryptor: None,
        }
    }

    /// Decrypt encrypted events on every read.
    pub fn with_decryptor(mut self, decryptor: Arc<dyn Decryptor>) -> Self {
        self.decryptor = Some(decryptor);
        self
    }

    pub fn room_id(&self) -> &RoomId {
        &self.room_id
    }

    /// Read up to `amount` entries starting after `from` in `direction`.
    ///
    /// `from` itself is never returned. Every fragment the read touches is
    /// registered with the comparer, so the returned entries can be compared
    /// right away.
    #[tracing::instrument(skip(self), fields(room = %self.room_id), name = "timeline.read")]
    pub async fn read_from(
        &self,
        from: SortKey,
        direction: Direction,
        amount: usize,
    ) -> Result<Vec<TimelineEntry>> {
        let decryptor = self.decryptor.as_deref();
        let (mut entries, preparation) = self.store.read(|txn| {
            let entries = self.collect(txn, from, direction, amount)?;
            let preparation = match decryptor {
                Some(d) => Some(d.prepare(txn, &self.room_id, &entries)?),
                None => None,
            };
            Ok((entries, preparation))
        })?;

        if let (Some(decryptor), Some(preparation)) = (decryptor, preparation.as_ref()) {
            decrypt_entries(decryptor, preparation, &mut entries).await;
        }
        if direction.is_backward() {
            entries.reverse();
        }

        tracing::debug!(count = entries.len(), "read timeline entries");
        Ok(entries)
    }

    /// End boundary key of the live fragment, if the room has one.
    pub fn live_edge(&self) -> Result<Option<SortKey>> {
        let live = self.store.read(|txn| txn.live_fragment(&self.room_id))?;
        Ok(live.map(|live| {
            self.comparer.add(&live);
            SortKey::fragment_end(live.id)
        }))
    }

    /// The newest `amount` stored events ending at the live fragment.
    ///
    /// Pending entries are not included; see [`pending_entries`](Self::pending_entries).
    /// Returns nothing for a room without stored history.
    pub async fn read_from_live_edge(&self, amount: usize) -> Result<Vec<TimelineEntry>> {
        match self.live_edge()? {
            Some(edge) => self.read_from(edge, Direction::Backward, amount).await,
            None => Ok(Vec::new()),
        }
    }

    /// All pending entries in queue order.
    pub fn pending_entries(&self) -> Vec<TimelineEntry> {
        self.pending.entries()
    }

    /// Collect entries in traversal order.
    fn collect(
        &self,
        txn: &ReadTxn<'_>,
        from: SortKey,
        direction: Direction,
        amount: usize,
    ) -> StoreResult<Vec<TimelineEntry>> {
        let mut out = Vec::new();
        let mut remaining = amount;
        if remaining == 0 {
            return Ok(out);
        }

        let mut cursor = from;
        if from.is_pending() {
            match direction {
                Direction::Forward => {
                    out.extend(self.pending.after(from.entry_index, remaining));
                    return Ok(out);
                }
                Direction::Backward => {
                    let before = self.pending.before(from.entry_index, remaining);
                    remaining -= before.len();
                    out.extend(before);
                    // Leaving the pending queue crosses the live fragment's end
                    // boundary, the same one a forward read passes on its way in.
                    let Some(live) = txn.live_fragment(&self.room_id)? else {
                        return Ok(out);
                    };
                    self.comparer.add(&live);
                    cursor = SortKey::fragment_end(live.id);
                    out.push(TimelineEntry::Boundary(FragmentBoundaryEntry::end(live)));
                    if remaining == 0 {
                        return Ok(out);
                    }
                }
            }
        }

        let mut fragment = txn.require_fragment(&self.room_id, cursor.fragment_id)?;
        self.comparer.add(&fragment);
        let mut visited = HashSet::from([fragment.id]);

        loop {
            // One row of lookahead tells whether the fragment edge was reached.
            let rows = match direction {
                Direction::Forward => txn.events_after(&self.room_id, cursor, remaining + 1)?,
                Direction::Backward => txn.events_before(&self.room_id, cursor, remaining + 1)?,
            };
            let at_edge = rows.len() <= remaining;
            for row in rows.into_iter().take(remaining) {
                out.push(TimelineEntry::Event(EventEntry::from(row)));
                remaining -= 1;
            }
            if !at_edge {
                break;
            }

            let boundary = FragmentBoundaryEntry::new(fragment.clone(), direction);
            if boundary.sort_key() != cursor {
                out.push(TimelineEntry::Boundary(boundary.clone()));
            }
            if remaining == 0 {
                break;
            }

            let Some(next_id) = boundary.linked_fragment_id() else {
                if direction.is_forward() && fragment.is_live() {
                    out.extend(self.pending.after(EntryIndex::MIN, remaining));
                }
                break;
            };
            if !visited.insert(next_id) {
                tracing::warn!(fragment = %fragment.id, next = %next_id, "cycle in fragment links, stopping read");
                break;
            }
            let Some(next) = txn.fragment(&self.room_id, next_id)? else {
                tracing::warn!(fragment = %fragment.id, next = %next_id, "linked fragment is missing");
                break;
            };

            self.comparer.add(&next);
            let neighbour = boundary.neighbour(next.clone());
            cursor = neighbour.sort_key();
            out.push(TimelineEntry::Boundary(neighbour));
            fragment = next;
        }

        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use skein_types::{EventId, Fragment, FragmentId, PENDING_FRAGMENT_ID, TimelineEvent};

    fn room() -> RoomId {
        RoomId::parse("!reader:example.org").unwrap()
    }

    fn event(id: &str) -> TimelineEvent {
        TimelineEvent::new(
            EventId::parse(id).unwrap(),
            "@amy:example.org",
            "m.room.message",
            json!({"body": id}),
        )
    }

    fn key(fragment: u32, index: i64) -> SortKey {
        SortKey::new(FragmentId::new(fragment), EntryIndex::new(index))
    }

    fn seed(store: &TimelineStore, fragments: &[Fragment], events: &[(u32, i64, &str)]) {
        store
            .write(|txn| {
                for f in fragments {
                    txn.put_fragment(f)?;
                }
                for (fragment, index, id) in events {
                    txn.insert_event(&room(), key(*fragment, *index), &event(id))?;
                }
                Ok::<_, skein_store::StoreError>(())
            })
            .unwrap();
    }

    fn open_reader(store: TimelineStore) -> TimelineReader {
        TimelineReader::new(
            room(),
            Arc::new(store),
            Arc::new(FragmentIdComparer::new()),
            Arc::new(PendingQueue::new()),
        )
    }

    /// Compact rendering: event ids, `[n` / `n]` for boundaries (`?` marks a
    /// gap), `~n` for pending entries.
    fn render(entries: &[TimelineEntry]) -> Vec<String> {
        entries
            .iter()
            .map(|e| match e {
                TimelineEntry::Event(ev) => ev.event.event_id.to_string(),
                TimelineEntry::Boundary(b) => {
                    let gap = if b.is_gap() { "?" } else { "" };
                    if b.is_start() {
                        format!("{gap}[{}", b.fragment_id())
                    } else {
                        format!("{}]{gap}", b.fragment_id())
                    }
                }
                TimelineEntry::Pending(p) => format!("~{}", p.event.queue_index),
            })
            .collect()
    }

    fn two_linked_fragments() -> TimelineStore {
        let store = TimelineStore::in_memory().unwrap();
        let mut older = Fragment::new(room(), FragmentId::new(0));
        older.next_id = Some(FragmentId::new(1));
        older.start_reached = true;
        let mut live = Fragment::new(room(), FragmentId::new(1));
        live.previous_id = Some(FragmentId::new(0));
        seed(
            &store,
            &[older, live],
            &[(0, -1, "$a"), (0, 0, "$b"), (1, 0, "$c"), (1, 1, "$d")],
        );
        store
    }

    #[tokio::test]
    async fn test_backward_from_end_stops_at_gap() {
        let store = TimelineStore::in_memory().unwrap();
        let f1 = Fragment::new(room(), FragmentId::new(1)).with_previous_token("t1");
        seed(&store, &[f1], &[(1, 0, "$e1"), (1, 1, "$e2"), (1, 2, "$e3")]);
        let reader = open_reader(store);

        let entries = reader
            .read_from(SortKey::fragment_end(FragmentId::new(1)), Direction::Backward, 10)
            .await
            .unwrap();
        assert_eq!(render(&entries), vec!["?[1", "$e1", "$e2", "$e3"]);
        assert!(entries[0].is_gap());
        assert_eq!(entries[0].as_boundary().unwrap().token(), Some("t1"));
    }

    #[tokio::test]
    async fn test_exact_amount_still_reports_edge() {
        let store = TimelineStore::in_memory().unwrap();
        let f1 = Fragment::new(room(), FragmentId::new(1)).with_previous_token("t1");
        seed(&store, &[f1], &[(1, 0, "$e1"), (1, 1, "$e2"), (1, 2, "$e3")]);
        let reader = open_reader(store);

        let end = SortKey::fragment_end(FragmentId::new(1));
        let three = reader.read_from(end, Direction::Backward, 3).await.unwrap();
        assert_eq!(render(&three), vec!["?[1", "$e1", "$e2", "$e3"]);

        let two = reader.read_from(end, Direction::Backward, 2).await.unwrap();
        assert_eq!(render(&two), vec!["$e2", "$e3"]);
    }

    #[tokio::test]
    async fn test_forward_crosses_links_into_pending() {
        let reader = open_reader(two_linked_fragments());
        reader.pending.enqueue("m.room.message", json!({"body": "queued"}));

        let entries = reader
            .read_from(SortKey::fragment_start(FragmentId::new(0)), Direction::Forward, 10)
            .await
            .unwrap();
        assert_eq!(
            render(&entries),
            vec!["$a", "$b", "0]", "[1", "$c", "$d", "1]", "~0"]
        );
    }

    #[tokio::test]
    async fn test_backward_crosses_links() {
        let reader = open_reader(two_linked_fragments());

        let entries = reader
            .read_from(SortKey::fragment_end(FragmentId::new(1)), Direction::Backward, 10)
            .await
            .unwrap();
        assert_eq!(render(&entries), vec!["[0", "$a", "$b", "0]", "[1", "$c", "$d"]);
        assert!(!entries[0].is_gap());
    }

    #[tokio::test]
    async fn test_results_are_sorted_by_comparer() {
        let reader = open_reader(two_linked_fragments());
        let entries = reader
            .read_from(SortKey::fragment_end(FragmentId::new(1)), Direction::Backward, 10)
            .await
            .unwrap();

        for pair in entries.windows(2) {
            let order = pair[0].compare(&pair[1], &reader.comparer).unwrap();
            assert_eq!(order, std::cmp::Ordering::Less, "{:?} vs {:?}", pair[0], pair[1]);
        }
    }

    #[tokio::test]
    async fn test_single_steps_visit_every_event_once() {
        let reader = open_reader(two_linked_fragments());

        let mut cursor = SortKey::fragment_end(FragmentId::new(1));
        let mut seen = Vec::new();
        for _ in 0..10 {
            let page = reader.read_from(cursor, Direction::Backward, 1).await.unwrap();
            let Some(first) = page.first() else {
                break;
            };
            cursor = first.sort_key();
            seen.extend(
                page.iter()
                    .filter_map(TimelineEntry::as_event)
                    .map(|e| e.event.event_id.to_string()),
            );
        }
        assert_eq!(seen, vec!["$d", "$c", "$b", "$a"]);
    }

    #[tokio::test]
    async fn test_re_read_from_boundary_skips_it() {
        let reader = open_reader(two_linked_fragments());

        let entries = reader
            .read_from(SortKey::fragment_start(FragmentId::new(0)), Direction::Backward, 5)
            .await
            .unwrap();
        assert!(entries.is_empty());

        let entries = reader
            .read_from(SortKey::fragment_end(FragmentId::new(1)), Direction::Forward, 5)
            .await
            .unwrap();
        assert!(entries.is_empty());
    }

    #[tokio::test]
    async fn test_read_from_pending_key() {
        let reader = open_reader(two_linked_fragments());
        for n in 0..3 {
            reader.pending.enqueue("m.room.message", json!({"n": n}));
        }

        let forward = reader
            .read_from(SortKey::pending(0), Direction::Forward, 5)
            .await
            .unwrap();
        assert_eq!(render(&forward), vec!["~1", "~2"]);

        let backward = reader
            .read_from(SortKey::pending(2), Direction::Backward, 4)
            .await
            .unwrap();
        assert_eq!(render(&backward), vec!["[1", "$c", "$d", "1]", "~0", "~1"]);
    }

    #[tokio::test]
    async fn test_pending_seam_reads_the_same_both_ways() {
        let store = TimelineStore::in_memory().unwrap();
        let mut live = Fragment::new(room(), FragmentId::new(0));
        live.start_reached = true;
        seed(&store, &[live], &[(0, 0, "$a"), (0, 1, "$b")]);
        let reader = open_reader(store);
        for n in 0..2 {
            reader.pending.enqueue("m.room.message", json!({"n": n}));
        }

        let forward = reader
            .read_from(SortKey::fragment_start(FragmentId::new(0)), Direction::Forward, 10)
            .await
            .unwrap();
        assert_eq!(render(&forward), vec!["$a", "$b", "0]", "~0", "~1"]);

        let backward = reader
            .read_from(SortKey::fragment_end(PENDING_FRAGMENT_ID), Direction::Backward, 10)
            .await
            .unwrap();
        assert_eq!(render(&backward), vec!["[0", "$a", "$b", "0]", "~0", "~1"]);
        assert_eq!(render(&backward[1..]), render(&forward));

        // Budget spent on pending entries still reports the boundary.
        let short = reader
            .read_from(SortKey::fragment_end(PENDING_FRAGMENT_ID), Direction::Backward, 2)
            .await
            .unwrap();
        assert_eq!(render(&short), vec!["0]", "~0", "~1"]);
    }

    #[tokio::test]
    async fn test_live_edge() {
        let reader = open_reader(two_linked_fragments());
        reader.pending.enqueue("m.room.message", json!({}));

        let entries = reader.read_from_live_edge(3).await.unwrap();
        assert_eq!(render(&entries), vec!["$b", "0]", "[1", "$c", "$d"]);
        assert_eq!(reader.pending_entries().len(), 1);

        let empty = open_reader(TimelineStore::in_memory().unwrap());
        assert!(empty.read_from_live_edge(3).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cyclic_links_terminate() {
        let store = TimelineStore::in_memory().unwrap();
        let mut a = Fragment::new(room(), FragmentId::new(0));
        a.next_id = Some(FragmentId::new(1));
        a.previous_id = Some(FragmentId::new(1));
        let mut b = Fragment::new(room(), FragmentId::new(1));
        b.next_id = Some(FragmentId::new(0));
        b.previous_id = Some(FragmentId::new(0));
        seed(&store, &[a, b], &[(0, 0, "$x"), (1, 0, "$y")]);
        let reader = open_reader(store);

        let entries = reader
            .read_from(SortKey::fragment_start(FragmentId::new(0)), Direction::Forward, 50)
            .await
            .unwrap();
        assert_eq!(render(&entries), vec!["$x", "0]", "[1", "$y", "1]"]);
    }

    #[tokio::test]
    async fn test_zero_amount_reads_nothing() {
        let reader = open_reader(two_linked_fragments());
        let entries = reader
            .read_from(key(1, 0), Direction::Forward, 0)
            .await
            .unwrap();
        assert!(entries.is_empty());
    }
}
