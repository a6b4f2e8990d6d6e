//! Building blocks for walking a commit graph from its heads downwards.
//!
//! Walks pop commits from a [`CommitQueue`] highest `(level, id)` first.
//! Parents always have a lower level than their children, so by the time a
//! commit is popped every descendant reachable from the start set has been
//! handled already.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::collections::BinaryHeap;
use std::collections::HashSet;

use super::commit::OTCommit;
use super::system::OTSystem;

struct Queued<K, D>(OTCommit<K, D>);

impl<K: Ord, D> PartialEq for Queued<K, D> {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl<K: Ord, D> Eq for Queued<K, D> {}

impl<K: Ord, D> PartialOrd for Queued<K, D> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<K: Ord, D> Ord for Queued<K, D> {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.0.level, &self.0.id).cmp(&(other.0.level, &other.0.id))
    }
}

/// Max-heap of loaded commits that admits every id at most once.
pub struct CommitQueue<K, D> {
    heap: BinaryHeap<Queued<K, D>>,
    seen: HashSet<K>,
}

impl<K, D> Default for CommitQueue<K, D>
where
    K: Ord + Clone + std::hash::Hash,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, D> CommitQueue<K, D>
where
    K: Ord + Clone + std::hash::Hash,
{
    pub fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
            seen: HashSet::new(),
        }
    }

    /// Queues `commit` unless a commit with the same id was queued before.
    pub fn push(&mut self, commit: OTCommit<K, D>) -> bool {
        if !self.seen.insert(commit.id.clone()) {
            return false;
        }
        self.heap.push(Queued(commit));
        true
    }

    pub fn pop(&mut self) -> Option<OTCommit<K, D>> {
        self.heap.pop().map(|q| q.0)
    }

    pub fn peek(&self) -> Option<&OTCommit<K, D>> {
        self.heap.peek().map(|q| &q.0)
    }

    /// Whether `id` was ever queued during this walk.
    pub fn was_queued(&self, id: &K) -> bool {
        self.seen.contains(id)
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &OTCommit<K, D>> {
        self.heap.iter().map(|q| &q.0)
    }
}

/// What a walk does after a commit was handed to a reducer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Walk<R> {
    /// Load and queue the commit's parents.
    Resume,
    /// Do not descend below this commit.
    Skip,
    /// Stop the walk with a result.
    Done(R),
}

/// Incremental computation over a backward walk.
pub trait GraphReducer<K, D> {
    type Output;

    /// Called once with the loaded start commits before the first pop.
    fn on_start(&mut self, _heads: &[OTCommit<K, D>]) {}

    fn on_commit(&mut self, commit: &OTCommit<K, D>) -> Walk<Self::Output>;

    /// Result for a walk that ran out of commits, if the reducer has one.
    fn on_exhausted(&mut self) -> Option<Self::Output> {
        None
    }
}

/// Folds the diffs along a path into an accumulated value.
///
/// Walks go from children to parents, so `accumulate` receives the diffs of
/// an edge that lies *before* everything accumulated so far.
pub trait DiffsReducer<D> {
    type Acc: Clone;

    fn initial(&self) -> Self::Acc;

    fn accumulate(&self, acc: &Self::Acc, diffs: &[D]) -> Self::Acc;

    /// Joins two values that reached the same commit along different paths.
    fn combine(&self, existing: Self::Acc, _other: Self::Acc) -> Self::Acc {
        existing
    }
}

/// Concatenates the diffs of the path.
#[derive(Debug, Clone, Copy, Default)]
pub struct ToList;

impl<D: Clone> DiffsReducer<D> for ToList {
    type Acc = Vec<D>;

    fn initial(&self) -> Vec<D> {
        Vec::new()
    }

    fn accumulate(&self, acc: &Vec<D>, diffs: &[D]) -> Vec<D> {
        let mut result = Vec::with_capacity(diffs.len() + acc.len());
        result.extend_from_slice(diffs);
        result.extend_from_slice(acc);
        result
    }
}

/// Tracks reachability only.
#[derive(Debug, Clone, Copy, Default)]
pub struct ToVoid;

impl<D> DiffsReducer<D> for ToVoid {
    type Acc = ();

    fn initial(&self) {}

    fn accumulate(&self, _acc: &(), _diffs: &[D]) {}
}

/// Concatenates and squashes, keeping accumulated paths short.
#[derive(Debug, Clone, Copy)]
pub struct ToSquashedList<S>(pub S);

impl<D: Clone, S: OTSystem<D>> DiffsReducer<D> for ToSquashedList<S> {
    type Acc = Vec<D>;

    fn initial(&self) -> Vec<D> {
        Vec::new()
    }

    fn accumulate(&self, acc: &Vec<D>, diffs: &[D]) -> Vec<D> {
        let mut result = Vec::with_capacity(diffs.len() + acc.len());
        result.extend_from_slice(diffs);
        result.extend_from_slice(acc);
        self.0.squash(&result)
    }
}

/// Per commit, the accumulated value from that commit to every start node
/// that reaches it.
pub(crate) struct Accumulators<K, A> {
    entries: BTreeMap<K, BTreeMap<K, A>>,
}

impl<K: Ord + Clone, A: Clone> Accumulators<K, A> {
    pub(crate) fn new(start: impl IntoIterator<Item = K>, initial: A) -> Self {
        let entries = start
            .into_iter()
            .map(|k| {
                let mut own = BTreeMap::new();
                own.insert(k.clone(), initial.clone());
                (k, own)
            })
            .collect();
        Self { entries }
    }

    pub(crate) fn take(&mut self, id: &K) -> BTreeMap<K, A> {
        self.entries.remove(id).unwrap_or_default()
    }

    /// Hands the values of a popped commit on to its parents.
    pub(crate) fn propagate<D, R>(
        &mut self,
        commit: &OTCommit<K, D>,
        values: &BTreeMap<K, A>,
        reducer: &R,
    ) where
        R: DiffsReducer<D, Acc = A>,
    {
        for (parent, diffs) in &commit.parents {
            let parent_entry = self.entries.entry(parent.clone()).or_default();
            for (start, acc) in values {
                let next = reducer.accumulate(acc, diffs);
                let combined = match parent_entry.remove(start) {
                    Some(existing) => reducer.combine(existing, next),
                    None => next,
                };
                parent_entry.insert(start.clone(), combined);
            }
        }
    }
}
