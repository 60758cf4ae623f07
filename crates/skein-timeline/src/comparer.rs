//! Relative order of fragments, derived from the links discovered so far.
//!
//! Fragment ids are handed out in creation order, which says nothing about
//! timeline order: a backfill started after the live fragment can still turn
//! out to precede it. The only source of truth is the `previous_id` /
//! `next_id` graph.
//!
//! The comparer keeps that graph and a rank table computed from it. Each
//! connected chain of fragments is an *island*; a rank is
//! `(island ordinal, position in chain)`. Ranks are rebuilt lazily, on the
//! first comparison after a registration changed the graph.
//!
//! Islands not yet joined by a link are ordered deterministically: the island
//! holding the live fragment sorts last, the others by their lowest fragment
//! id. Discovering a link merges islands and the next rebuild reflects it.
//!
//! The pending pseudo-fragment ([`PENDING_FRAGMENT_ID`]) is never registered
//! and always sorts after every real fragment.

use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};

use parking_lot::{RwLock, RwLockUpgradableReadGuard, RwLockWriteGuard};
use skein_types::{Fragment, FragmentId, PENDING_FRAGMENT_ID, SortKey};

use crate::error::ComparerError;

/// What the graph knows about one fragment id.
#[derive(Debug, Clone, Default)]
struct Node {
    /// Registered through `add`, as opposed to only being named by a link.
    registered: bool,
    previous: Option<FragmentId>,
    next: Option<FragmentId>,
    live: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct Rank {
    island: usize,
    position: usize,
}

#[derive(Debug, Default)]
struct Graph {
    nodes: HashMap<FragmentId, Node>,
    ranks: HashMap<FragmentId, Rank>,
    dirty: bool,
}

impl Graph {
    fn link(&mut self, from: FragmentId, to: FragmentId, forward: bool) {
        let node = self.nodes.entry(from).or_default();
        let slot = if forward { &mut node.next } else { &mut node.previous };
        match *slot {
            Some(existing) if existing == to => return,
            Some(existing) => {
                tracing::warn!(
                    fragment = %from,
                    old = %existing,
                    new = %to,
                    "fragment link changed, keeping the newer one"
                );
            }
            None => {}
        }
        *slot = Some(to);
        self.dirty = true;
    }

    fn rebuild(&mut self) {
        let mut ids: Vec<FragmentId> = self.nodes.keys().copied().collect();
        ids.sort();

        let mut visited: HashSet<FragmentId> = HashSet::new();
        let mut islands: Vec<Vec<FragmentId>> = Vec::new();

        for id in ids {
            if visited.contains(&id) {
                continue;
            }

            // Walk back to the head of this chain, stopping at anything
            // already placed or at a cycle.
            let mut head = id;
            let mut walked = HashSet::from([id]);
            while let Some(prev) = self.nodes.get(&head).and_then(|n| n.previous) {
                if visited.contains(&prev) || !self.nodes.contains_key(&prev) {
                    break;
                }
                if !walked.insert(prev) {
                    tracing::warn!(fragment = %prev, "cycle in fragment links");
                    break;
                }
                head = prev;
            }

            let mut chain = Vec::new();
            let mut cursor = Some(head);
            while let Some(current) = cursor {
                if !visited.insert(current) {
                    break;
                }
                chain.push(current);
                cursor = self
                    .nodes
                    .get(&current)
                    .and_then(|n| n.next)
                    .filter(|next| self.nodes.contains_key(next));
            }
            islands.push(chain);
        }

        let is_live = |chain: &Vec<FragmentId>| {
            chain.iter().any(|id| self.nodes.get(id).is_some_and(|n| n.live))
        };
        islands.sort_by_key(|chain| {
            let lowest = chain.iter().min().copied().unwrap_or(FragmentId::FIRST);
            (is_live(chain), lowest)
        });

        self.ranks.clear();
        for (island, chain) in islands.iter().enumerate() {
            for (position, id) in chain.iter().enumerate() {
                self.ranks.insert(*id, Rank { island, position });
            }
        }
        self.dirty = false;
    }

    fn rank(&self, id: FragmentId) -> Result<Rank, ComparerError> {
        match self.nodes.get(&id) {
            Some(node) if node.registered => self
                .ranks
                .get(&id)
                .copied()
                .ok_or(ComparerError::UnknownFragment(id)),
            _ => Err(ComparerError::UnknownFragment(id)),
        }
    }

    fn check_registered(&self, id: FragmentId) -> Result<(), ComparerError> {
        if id == PENDING_FRAGMENT_ID || self.nodes.get(&id).is_some_and(|n| n.registered) {
            Ok(())
        } else {
            Err(ComparerError::UnknownFragment(id))
        }
    }
}

/// Answers "does fragment A come before fragment B?" for registered fragments.
///
/// Shared between the reader, gap filler and sync writer of one room session
/// and safe to use from any of them concurrently.
#[derive(Debug, Default)]
pub struct FragmentIdComparer {
    graph: RwLock<Graph>,
}

impl FragmentIdComparer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a fragment and the links it currently knows about.
    ///
    /// Idempotent; registering the same fragment again with more links
    /// extends the graph. Links are never removed.
    pub fn add(&self, fragment: &Fragment) {
        let mut graph = self.graph.write();
        let node = graph.nodes.entry(fragment.id).or_default();
        if !node.registered || node.live != fragment.is_live() {
            node.registered = true;
            node.live = fragment.is_live();
            graph.dirty = true;
        }
        if let Some(prev) = fragment.previous_id {
            graph.link(fragment.id, prev, false);
            graph.link(prev, fragment.id, true);
        }
        if let Some(next) = fragment.next_id {
            graph.link(fragment.id, next, true);
            graph.link(next, fragment.id, false);
        }
    }

    /// Register several fragments at once.
    pub fn add_all<'a>(&self, fragments: impl IntoIterator<Item = &'a Fragment>) {
        for fragment in fragments {
            self.add(fragment);
        }
    }

    pub fn contains(&self, id: FragmentId) -> bool {
        self.graph.read().nodes.get(&id).is_some_and(|n| n.registered)
    }

    /// Number of registered fragments.
    pub fn len(&self) -> usize {
        self.graph.read().nodes.values().filter(|n| n.registered).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Order two fragments.
    pub fn compare_fragments(&self, a: FragmentId, b: FragmentId) -> Result<Ordering, ComparerError> {
        self.with_ranks(|graph| {
            graph.check_registered(a)?;
            graph.check_registered(b)?;
            if a == b {
                return Ok(Ordering::Equal);
            }
            match (a == PENDING_FRAGMENT_ID, b == PENDING_FRAGMENT_ID) {
                (true, _) => Ok(Ordering::Greater),
                (_, true) => Ok(Ordering::Less),
                _ => Ok(graph.rank(a)?.cmp(&graph.rank(b)?)),
            }
        })
    }

    /// Order two positions. Within one fragment this is a plain index
    /// comparison; across fragments it follows the fragment order.
    pub fn compare(&self, a: SortKey, b: SortKey) -> Result<Ordering, ComparerError> {
        match self.compare_fragments(a.fragment_id, b.fragment_id)? {
            Ordering::Equal => Ok(a.entry_index.cmp(&b.entry_index)),
            other => Ok(other),
        }
    }

    /// Whether `a` comes strictly before `b`.
    pub fn precedes(&self, a: FragmentId, b: FragmentId) -> Result<bool, ComparerError> {
        Ok(self.compare_fragments(a, b)? == Ordering::Less)
    }

    fn with_ranks<T>(&self, f: impl FnOnce(&Graph) -> T) -> T {
        let graph = self.graph.upgradable_read();
        if graph.dirty {
            let mut graph = RwLockUpgradableReadGuard::upgrade(graph);
            graph.rebuild();
            let graph = RwLockWriteGuard::downgrade(graph);
            f(&graph)
        } else {
            f(&graph)
        }
    }
}
