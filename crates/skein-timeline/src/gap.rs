//! Resolving gaps through a remote pagination source.
//!
//! A gap is a fragment boundary with a pagination token and no reached edge.
//! Filling it fetches one page in the boundary's direction and writes the
//! events into the same fragment, extending it outwards. When a fetched event
//! is already stored in another fragment the two fragments are linked and
//! the gap disappears.
//!
//! At most one fill runs per `(fragment, direction)`. A second request for a
//! gap that is already loading returns [`FillOutcome::AlreadyLoading`]
//! without issuing a fetch.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use skein_store::{TimelineStore, WriteTxn};
use skein_types::{Direction, EntryIndex, Fragment, FragmentId, RoomId, SortKey, TimelineEvent};
use tracing::Instrument;

use crate::comparer::FragmentIdComparer;
use crate::entry::FragmentBoundaryEntry;
use crate::error::{FetchError, GapFillError};

// ============================================================================
// Pagination source
// ============================================================================

/// One page of history from the server.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PaginationResponse {
    /// Events in traversal order: newest first for backward pagination,
    /// oldest first for forward.
    pub events: Vec<TimelineEvent>,
    /// Token to continue from, if the server has more.
    pub next_token: Option<String>,
    /// The server says history ends in this direction.
    pub reached_edge: bool,
}

/// Remote history, e.g. a `/messages` endpoint.
#[async_trait]
pub trait PaginationSource: Send + Sync {
    async fn fetch_more(
        &self,
        room: &RoomId,
        token: &str,
        direction: Direction,
        amount: usize,
    ) -> Result<PaginationResponse, FetchError>;
}

// ============================================================================
// Gap state
// ============================================================================

/// Load state of one fragment edge.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum GapState {
    #[default]
    Idle,
    Loading,
    /// The last fill completed.
    Resolved,
    /// The last fill failed; filling again retries.
    Failed(String),
}

/// Result of a fill request that did not error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FillOutcome {
    /// The entry has no token or its edge was reached; nothing to do.
    NotAGap,
    /// Another fill for the same gap is in flight.
    AlreadyLoading,
    Filled {
        /// Events written into the fragment.
        written: usize,
        /// Fragment this one was linked to, if an overlap was found.
        linked: Option<FragmentId>,
        /// History provably ends at this edge now.
        edge_reached: bool,
    },
}

type GapKey = (FragmentId, Direction);

/// Resets a gap to `Idle` if the fill future is dropped before finishing.
struct LoadingGuard<'a> {
    states: &'a DashMap<GapKey, GapState>,
    key: GapKey,
    finished: bool,
}

impl LoadingGuard<'_> {
    fn finish(mut self, state: GapState) {
        self.states.insert(self.key, state);
        self.finished = true;
    }
}

impl Drop for LoadingGuard<'_> {
    fn drop(&mut self) {
        if !self.finished {
            tracing::debug!(fragment = %self.key.0, direction = %self.key.1, "gap fill cancelled");
            self.states.insert(self.key, GapState::Idle);
        }
    }
}

// ============================================================================
// GapFiller
// ============================================================================

/// Fills gaps for one room.
pub struct GapFiller {
    room_id: RoomId,
    store: Arc<TimelineStore>,
    comparer: Arc<FragmentIdComparer>,
    source: Arc<dyn PaginationSource>,
    states: DashMap<GapKey, GapState>,
}

impl GapFiller {
    pub fn new(
        room_id: RoomId,
        store: Arc<TimelineStore>,
        comparer: Arc<FragmentIdComparer>,
        source: Arc<dyn PaginationSource>,
    ) -> Self {
        Self {
            room_id,
            store,
            comparer,
            source,
            states: DashMap::new(),
        }
    }

    /// Current load state of a fragment edge.
    pub fn state(&self, fragment: FragmentId, direction: Direction) -> GapState {
        self.states
            .get(&(fragment, direction))
            .map(|s| s.clone())
            .unwrap_or_default()
    }

    /// Fetch up to `amount` events into the gap at `gap`.
    ///
    /// Fails with [`GapFillError::StaleToken`] if the fragment's token changed
    /// since `gap` was read. The fetch runs outside any storage transaction;
    /// the write is atomic.
    pub async fn fill_gap(
        &self,
        gap: &FragmentBoundaryEntry,
        amount: usize,
    ) -> Result<FillOutcome, GapFillError> {
        if !gap.is_gap() {
            return Ok(FillOutcome::NotAGap);
        }

        let key = (gap.fragment_id(), gap.direction);
        {
            let mut state = self.states.entry(key).or_default();
            if *state == GapState::Loading {
                tracing::debug!(fragment = %key.0, direction = %key.1, "gap already loading");
                return Ok(FillOutcome::AlreadyLoading);
            }
            *state = GapState::Loading;
        }
        let guard = LoadingGuard {
            states: &self.states,
            key,
            finished: false,
        };

        let span = tracing::info_span!(
            "timeline.fill_gap",
            room = %self.room_id,
            fragment = %key.0,
            direction = %key.1,
            amount,
        );
        let result = self.fill(gap, amount).instrument(span).await;

        guard.finish(match &result {
            Ok(_) | Err(GapFillError::StaleToken { .. }) => GapState::Resolved,
            Err(e) => GapState::Failed(e.to_string()),
        });
        result
    }

    async fn fill(
        &self,
        gap: &FragmentBoundaryEntry,
        amount: usize,
    ) -> Result<FillOutcome, GapFillError> {
        let direction = gap.direction;
        let Some(token) = gap.token() else {
            return Ok(FillOutcome::NotAGap);
        };

        let current = self
            .store
            .read(|txn| txn.require_fragment(&self.room_id, gap.fragment_id()))?;
        if current.token(direction) != Some(token) {
            return Err(GapFillError::StaleToken {
                fragment: current.id,
                direction,
            });
        }

        let response = match self
            .source
            .fetch_more(&self.room_id, token, direction, amount)
            .await
        {
            Ok(response) => response,
            Err(e) => {
                tracing::warn!(error = %e, "pagination fetch failed");
                return Err(e.into());
            }
        };

        let (outcome, touched) = self
            .store
            .write(|txn| self.apply(txn, gap.fragment_id(), direction, token, &response))?;
        self.comparer.add_all(&touched);

        if let FillOutcome::Filled { written, linked, edge_reached } = &outcome {
            tracing::info!(
                written,
                linked = ?linked,
                edge_reached,
                next_token = ?response.next_token,
                "filled gap"
            );
        }
        Ok(outcome)
    }

    /// Write one page into the fragment. Returns the outcome and every
    /// fragment whose metadata changed.
    fn apply(
        &self,
        txn: &WriteTxn<'_>,
        fragment_id: FragmentId,
        direction: Direction,
        token: &str,
        response: &PaginationResponse,
    ) -> Result<(FillOutcome, Vec<Fragment>), GapFillError> {
        let room = &self.room_id;
        let mut fragment = txn.require_fragment(room, fragment_id)?;
        if fragment.token(direction) != Some(token) {
            return Err(GapFillError::StaleToken {
                fragment: fragment_id,
                direction,
            });
        }

        let mut cursor = match direction {
            Direction::Backward => match txn.first_index(room, fragment_id)? {
                Some(first) => first.previous(),
                None => Some(EntryIndex::FIRST),
            },
            Direction::Forward => match txn.last_index(room, fragment_id)? {
                Some(last) => last.next(),
                None => Some(EntryIndex::FIRST),
            },
        };

        let mut written = 0;
        let mut linked = None;
        let mut touched = Vec::new();

        for event in &response.events {
            if let Some(existing) = txn.event_key(room, &event.event_id)? {
                if existing.fragment_id == fragment_id {
                    tracing::debug!(event_id = %event.event_id, "skipping event already in fragment");
                    continue;
                }
                if let Some(other) = Self::link(txn, &mut fragment, existing.fragment_id, direction)? {
                    linked = Some(other.id);
                    touched.push(other);
                }
                break;
            }

            let Some(index) = cursor else {
                return Err(GapFillError::IndexExhausted(fragment_id));
            };
            txn.insert_event(room, SortKey::new(fragment_id, index), event)?;
            written += 1;
            cursor = match direction {
                Direction::Backward => index.previous(),
                Direction::Forward => index.next(),
            };
        }

        if linked.is_none() {
            let reached = response.reached_edge || response.next_token.is_none();
            if !reached {
                fragment.set_token(direction, response.next_token.clone());
            } else if direction.is_backward() {
                fragment.previous_token = None;
                fragment.start_reached = true;
            } else {
                // Caught up with the present; join the live fragment if one exists.
                fragment.next_token = None;
                match txn.live_fragment(room)? {
                    Some(live) if live.id != fragment_id => {
                        match Self::link(txn, &mut fragment, live.id, direction)? {
                            Some(other) => {
                                linked = Some(other.id);
                                touched.push(other);
                            }
                            None => fragment.end_reached = true,
                        }
                    }
                    _ => fragment.end_reached = true,
                }
            }
        }

        txn.put_fragment(&fragment)?;
        let edge_reached = fragment.edge_reached(direction);
        touched.push(fragment);

        Ok((
            FillOutcome::Filled {
                written,
                linked,
                edge_reached,
            },
            touched,
        ))
    }

    /// Link `fragment`'s `direction` edge to `other_id`'s facing edge and clear
    /// both tokens. Writes `other` and returns it; `fragment` is updated in
    /// place for the caller to write.
    ///
    /// Refuses, returning `None`, when the facing edge is already linked to a
    /// different fragment.
    fn link(
        txn: &WriteTxn<'_>,
        fragment: &mut Fragment,
        other_id: FragmentId,
        direction: Direction,
    ) -> Result<Option<Fragment>, GapFillError> {
        let mut other = txn.require_fragment(&fragment.room_id, other_id)?;
        let facing = direction.opposite();
        if let Some(existing) = other.linked_id(facing).filter(|id| *id != fragment.id) {
            tracing::warn!(
                fragment = %fragment.id,
                other = %other_id,
                existing = %existing,
                "overlapping fragment already linked elsewhere"
            );
            return Ok(None);
        }

        other.set_linked_id(facing, Some(fragment.id));
        other.set_token(facing, None);
        txn.put_fragment(&other)?;

        fragment.set_linked_id(direction, Some(other_id));
        fragment.set_token(direction, None);
        tracing::debug!(fragment = %fragment.id, other = %other_id, direction = %direction, "linked fragments");
        Ok(Some(other))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use serde_json::json;
    use skein_store::StoreError;
    use skein_types::EventId;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct ScriptedSource {
        responses: Mutex<VecDeque<Result<PaginationResponse, FetchError>>>,
        requests: Mutex<Vec<(String, Direction)>>,
        calls: AtomicUsize,
    }

    impl ScriptedSource {
        fn new(responses: Vec<Result<PaginationResponse, FetchError>>) -> Arc<Self> {
            Arc::new(Self {
                responses: Mutex::new(responses.into()),
                requests: Mutex::new(Vec::new()),
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl PaginationSource for ScriptedSource {
        async fn fetch_more(
            &self,
            _room: &RoomId,
            token: &str,
            direction: Direction,
            _amount: usize,
        ) -> Result<PaginationResponse, FetchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.requests.lock().push((token.to_string(), direction));
            self.responses
                .lock()
                .pop_front()
                .unwrap_or_else(|| Err(FetchError::Network("script exhausted".into())))
        }
    }

    fn room() -> RoomId {
        RoomId::parse("!gap:example.org").unwrap()
    }

    fn event(id: &str) -> TimelineEvent {
        TimelineEvent::new(
            EventId::parse(id).unwrap(),
            "@amy:example.org",
            "m.room.message",
            json!({"body": id}),
        )
    }

    fn page(ids: &[&str], next_token: Option<&str>, reached_edge: bool) -> PaginationResponse {
        PaginationResponse {
            events: ids.iter().map(|id| event(id)).collect(),
            next_token: next_token.map(str::to_string),
            reached_edge,
        }
    }

    fn setup(
        fragments: &[Fragment],
        events: &[(u32, i64, &str)],
        source: Arc<ScriptedSource>,
    ) -> (Arc<TimelineStore>, GapFiller) {
        let store = Arc::new(TimelineStore::in_memory().unwrap());
        store
            .write(|txn| {
                for f in fragments {
                    txn.put_fragment(f)?;
                }
                for (f, i, id) in events {
                    let key = SortKey::new(FragmentId::new(*f), EntryIndex::new(*i));
                    txn.insert_event(&room(), key, &event(id))?;
                }
                Ok::<_, StoreError>(())
            })
            .unwrap();
        let comparer = Arc::new(FragmentIdComparer::new());
        comparer.add_all(fragments);
        let filler = GapFiller::new(room(), store.clone(), comparer, source);
        (store, filler)
    }

    fn fragment(store: &TimelineStore, id: u32) -> Fragment {
        store.read(|txn| txn.require_fragment(&room(), FragmentId::new(id))).unwrap()
    }

    fn ids_in(store: &TimelineStore, id: u32) -> Vec<String> {
        store
            .read(|txn| txn.events_after(&room(), SortKey::fragment_start(FragmentId::new(id)), 100))
            .unwrap()
            .into_iter()
            .map(|s| s.event.event_id.to_string())
            .collect()
    }

    #[tokio::test]
    async fn test_backward_fill_prepends_and_reaches_start() {
        let source = ScriptedSource::new(vec![Ok(page(&["$e0", "$e-1"], None, true))]);
        let f1 = Fragment::new(room(), FragmentId::new(1)).with_previous_token("t1");
        let (store, filler) = setup(&[f1.clone()], &[(1, 0, "$e1"), (1, 1, "$e2")], source.clone());

        let outcome = filler
            .fill_gap(&FragmentBoundaryEntry::start(f1), 20)
            .await
            .unwrap();
        assert_eq!(
            outcome,
            FillOutcome::Filled { written: 2, linked: None, edge_reached: true }
        );
        assert_eq!(ids_in(&store, 1), vec!["$e-1", "$e0", "$e1", "$e2"]);

        let f1 = fragment(&store, 1);
        assert!(f1.start_reached);
        assert_eq!(f1.previous_token, None);
        assert_eq!(filler.state(f1.id, Direction::Backward), GapState::Resolved);
        assert_eq!(source.requests.lock()[0], ("t1".to_string(), Direction::Backward));
    }

    #[tokio::test]
    async fn test_partial_page_advances_token() {
        let source = ScriptedSource::new(vec![Ok(page(&["$old"], Some("t2"), false))]);
        let f1 = Fragment::new(room(), FragmentId::new(1)).with_previous_token("t1");
        let (store, filler) = setup(&[f1.clone()], &[], source);

        let outcome = filler.fill_gap(&FragmentBoundaryEntry::start(f1), 1).await.unwrap();
        assert_eq!(
            outcome,
            FillOutcome::Filled { written: 1, linked: None, edge_reached: false }
        );
        let f1 = fragment(&store, 1);
        assert_eq!(f1.previous_token.as_deref(), Some("t2"));
        assert!(FragmentBoundaryEntry::start(f1).is_gap());
    }

    #[tokio::test]
    async fn test_overlap_links_fragments() {
        // Fragment 0 is an older span whose forward token leads into the
        // live fragment 1.
        let older = Fragment::new(room(), FragmentId::new(0)).with_next_token("n0");
        let live = Fragment::new(room(), FragmentId::new(1)).with_previous_token("p1");
        let source = ScriptedSource::new(vec![Ok(page(&["$c", "$b", "$a"], Some("p2"), false))]);
        let (store, filler) = setup(
            &[older, live.clone()],
            &[(0, 0, "$a"), (1, 0, "$d")],
            source,
        );

        let outcome = filler.fill_gap(&FragmentBoundaryEntry::start(live), 10).await.unwrap();
        assert_eq!(
            outcome,
            FillOutcome::Filled { written: 2, linked: Some(FragmentId::new(0)), edge_reached: false }
        );
        assert_eq!(ids_in(&store, 1), vec!["$b", "$c", "$d"]);

        let (older, live) = (fragment(&store, 0), fragment(&store, 1));
        assert_eq!(older.next_id, Some(FragmentId::new(1)));
        assert_eq!(older.next_token, None);
        assert_eq!(live.previous_id, Some(FragmentId::new(0)));
        assert_eq!(live.previous_token, None);
        assert!(filler.comparer.precedes(older.id, live.id).unwrap());
    }

    #[tokio::test]
    async fn test_forward_fill_joins_live_fragment() {
        let older = Fragment::new(room(), FragmentId::new(0)).with_next_token("n0");
        let live = Fragment::new(room(), FragmentId::new(1)).with_previous_token("p1");
        let source = ScriptedSource::new(vec![Ok(page(&["$b"], None, true))]);
        let (store, filler) = setup(&[older.clone(), live], &[(0, 0, "$a")], source);

        let outcome = filler.fill_gap(&FragmentBoundaryEntry::end(older), 10).await.unwrap();
        assert_eq!(
            outcome,
            FillOutcome::Filled { written: 1, linked: Some(FragmentId::new(1)), edge_reached: false }
        );
        assert_eq!(fragment(&store, 1).previous_id, Some(FragmentId::new(0)));
        assert_eq!(ids_in(&store, 0), vec!["$a", "$b"]);
    }

    #[tokio::test]
    async fn test_forward_fill_without_live_fragment_becomes_live() {
        let only = Fragment::new(room(), FragmentId::new(0)).with_next_token("n0");
        let source = ScriptedSource::new(vec![Ok(page(&["$b"], None, true))]);
        let (store, filler) = setup(&[only.clone()], &[(0, 0, "$a")], source);

        let outcome = filler.fill_gap(&FragmentBoundaryEntry::end(only), 10).await.unwrap();
        assert_eq!(
            outcome,
            FillOutcome::Filled { written: 1, linked: None, edge_reached: true }
        );
        assert_eq!(ids_in(&store, 0), vec!["$a", "$b"]);

        let only = fragment(&store, 0);
        assert!(only.end_reached);
        assert_eq!(only.next_token, None);
        let live = store.read(|txn| txn.live_fragment(&room())).unwrap();
        assert_eq!(live.map(|f| f.id), Some(FragmentId::new(0)));
    }

    #[tokio::test]
    async fn test_overlap_with_already_linked_fragment_is_not_relinked() {
        // Fragment 0's forward edge already leads to fragment 2, so the
        // overlap found while filling fragment 1 must not steal it.
        let mut older = Fragment::new(room(), FragmentId::new(0));
        older.next_id = Some(FragmentId::new(2));
        let mut middle = Fragment::new(room(), FragmentId::new(2)).with_next_token("n2");
        middle.previous_id = Some(FragmentId::new(0));
        let live = Fragment::new(room(), FragmentId::new(1)).with_previous_token("t1");
        let source = ScriptedSource::new(vec![Ok(page(&["$c", "$a", "$older"], Some("t2"), false))]);
        let (store, filler) = setup(
            &[older, middle, live.clone()],
            &[(0, 0, "$a"), (2, 0, "$z"), (1, 0, "$d")],
            source,
        );

        let outcome = filler.fill_gap(&FragmentBoundaryEntry::start(live), 10).await.unwrap();
        assert_eq!(
            outcome,
            FillOutcome::Filled { written: 1, linked: None, edge_reached: false }
        );
        assert_eq!(ids_in(&store, 1), vec!["$c", "$d"]);

        let (older, live) = (fragment(&store, 0), fragment(&store, 1));
        assert_eq!(older.next_id, Some(FragmentId::new(2)));
        assert_eq!(live.previous_id, None);
        assert_eq!(live.previous_token.as_deref(), Some("t2"));
        assert!(FragmentBoundaryEntry::start(live).is_gap());
    }

    #[tokio::test]
    async fn test_failure_is_recorded_and_retryable() {
        let source = ScriptedSource::new(vec![
            Err(FetchError::Server { status: 502, message: "bad gateway".into() }),
            Ok(page(&["$x"], None, true)),
        ]);
        let f1 = Fragment::new(room(), FragmentId::new(1)).with_previous_token("t1");
        let (store, filler) = setup(&[f1.clone()], &[], source.clone());
        let gap = FragmentBoundaryEntry::start(f1);

        let err = filler.fill_gap(&gap, 5).await.unwrap_err();
        assert!(matches!(err, GapFillError::Fetch(FetchError::Server { status: 502, .. })));
        assert!(matches!(filler.state(gap.fragment_id(), Direction::Backward), GapState::Failed(_)));
        assert!(ids_in(&store, 1).is_empty());
        assert_eq!(fragment(&store, 1).previous_token.as_deref(), Some("t1"));

        filler.fill_gap(&gap, 5).await.unwrap();
        assert_eq!(source.calls.load(Ordering::SeqCst), 2);
        assert_eq!(ids_in(&store, 1), vec!["$x"]);
    }

    #[tokio::test]
    async fn test_not_a_gap_and_stale_token() {
        let source = ScriptedSource::new(vec![]);
        let f1 = Fragment::new(room(), FragmentId::new(1)).with_previous_token("t1");
        let (_store, filler) = setup(&[f1.clone()], &[], source.clone());

        let no_token = FragmentBoundaryEntry::end(f1.clone());
        assert_eq!(filler.fill_gap(&no_token, 5).await.unwrap(), FillOutcome::NotAGap);

        let stale = FragmentBoundaryEntry::start(f1.with_previous_token("t0"));
        let err = filler.fill_gap(&stale, 5).await.unwrap_err();
        assert!(matches!(err, GapFillError::StaleToken { .. }));
        assert_eq!(source.calls.load(Ordering::SeqCst), 0);
    }
}
