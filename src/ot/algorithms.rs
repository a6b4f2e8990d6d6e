//! Graph queries over an [`OTRepository`].
//!
//! Every query is a backward walk from a set of start commits driven by a
//! [`CommitQueue`], so each commit is loaded at most once per query.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::collections::HashMap;
use std::error::Error;
use std::fmt;
use std::future::Future;

use futures::stream::FuturesUnordered;
use futures::TryStreamExt;
use tracing::debug;
use tracing::trace;

use super::commit::OTCommit;
use super::graph::GraphError;
use super::graph::GraphNode;
use super::graph::OTLoadedGraph;
use super::reducer::Accumulators;
use super::reducer::CommitQueue;
use super::reducer::DiffsReducer;
use super::reducer::GraphReducer;
use super::reducer::ToList;
use super::reducer::Walk;
use super::repository::CommitOf;
use super::repository::OTRepository;
use super::system::OTSystem;

#[derive(Debug)]
pub enum AlgorithmError<E> {
    /// The repository failed to serve a request.
    Repository(E),
    /// Merging the loaded graph failed.
    Graph(GraphError),
    /// The walk ran out of commits before it found what it looked for.
    GraphExhausted,
    /// The loaded history has no common frontier for the heads.
    IncompleteGraph,
    /// The repository has no heads.
    NoHeads,
}

impl<E: fmt::Display> fmt::Display for AlgorithmError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AlgorithmError::Repository(e) => write!(f, "repository failed: {e}"),
            AlgorithmError::Graph(e) => write!(f, "{e}"),
            AlgorithmError::GraphExhausted => write!(f, "commit graph exhausted"),
            AlgorithmError::IncompleteGraph => write!(f, "incomplete commit graph"),
            AlgorithmError::NoHeads => write!(f, "repository has no heads"),
        }
    }
}

impl<E: Error + 'static> Error for AlgorithmError<E> {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            AlgorithmError::Repository(e) => Some(e),
            AlgorithmError::Graph(e) => Some(e),
            _ => None,
        }
    }
}

impl<E> From<GraphError> for AlgorithmError<E> {
    fn from(e: GraphError) -> Self {
        AlgorithmError::Graph(e)
    }
}

/// A commit matched by [`OTAlgorithms::find_parent`].
#[derive(Debug, Clone)]
pub struct FindResult<K, A, P> {
    pub commit: K,
    pub parents: BTreeSet<K>,
    pub level: u64,
    /// The start node the match was reached from.
    pub child: K,
    pub child_level: u64,
    /// Reduced diffs from `commit` to `child`.
    pub accumulated: A,
    pub payload: P,
}

struct FindEntry<K, A> {
    child: K,
    child_level: Option<u64>,
    acc: A,
}

pub struct OTAlgorithms<R, S> {
    repository: R,
    system: S,
}

type Result<T, R> = std::result::Result<T, AlgorithmError<<R as OTRepository>::Error>>;

impl<R, S> OTAlgorithms<R, S>
where
    R: OTRepository,
    S: OTSystem<R::Diff>,
{
    pub fn new(repository: R, system: S) -> Self {
        Self { repository, system }
    }

    pub fn repository(&self) -> &R {
        &self.repository
    }

    pub fn system(&self) -> &S {
        &self.system
    }

    async fn load(&self, id: &R::Key) -> Result<CommitOf<R>, R> {
        self.repository
            .load_commit(id.clone())
            .await
            .map_err(AlgorithmError::Repository)
    }

    /// Loads `ids` concurrently, in no particular order.
    async fn load_all(&self, ids: &BTreeSet<R::Key>) -> Result<Vec<CommitOf<R>>, R> {
        ids.iter()
            .map(|id| self.load(id))
            .collect::<FuturesUnordered<_>>()
            .try_collect()
            .await
    }

    async fn queue_parents(
        &self,
        queue: &mut CommitQueue<R::Key, R::Diff>,
        commit: &CommitOf<R>,
    ) -> Result<(), R> {
        let unqueued: BTreeSet<R::Key> = commit
            .parents
            .keys()
            .filter(|parent| !queue.was_queued(parent))
            .cloned()
            .collect();
        for parent in self.load_all(&unqueued).await? {
            queue.push(parent);
        }
        Ok(())
    }

    /// Drives `reducer` over the history of `heads`.
    pub async fn reduce<G>(&self, heads: &BTreeSet<R::Key>, reducer: &mut G) -> Result<G::Output, R>
    where
        G: GraphReducer<R::Key, R::Diff>,
    {
        let start = self.load_all(heads).await?;
        reducer.on_start(&start);
        let mut queue = CommitQueue::new();
        for commit in start {
            queue.push(commit);
        }
        while let Some(commit) = queue.pop() {
            trace!(commit = ?commit.id, level = commit.level, "walk");
            match reducer.on_commit(&commit) {
                Walk::Done(output) => return Ok(output),
                Walk::Skip => {}
                Walk::Resume => self.queue_parents(&mut queue, &commit).await?,
            }
        }
        reducer.on_exhausted().ok_or(AlgorithmError::GraphExhausted)
    }

    /// Walks from `start` until `matcher` accepts a commit.
    ///
    /// The accumulated value of the result covers the path from the matched
    /// commit down to the start node it was first reached from.
    pub async fn find_parent<Red, P, M, Fut>(
        &self,
        start: &BTreeSet<R::Key>,
        reducer: &Red,
        mut matcher: M,
    ) -> Result<Option<FindResult<R::Key, Red::Acc, P>>, R>
    where
        Red: DiffsReducer<R::Diff>,
        M: FnMut(&CommitOf<R>) -> Fut,
        Fut: Future<Output = std::result::Result<Option<P>, R::Error>>,
    {
        let mut entries: HashMap<R::Key, FindEntry<R::Key, Red::Acc>> = start
            .iter()
            .map(|k| {
                let entry = FindEntry {
                    child: k.clone(),
                    child_level: None,
                    acc: reducer.initial(),
                };
                (k.clone(), entry)
            })
            .collect();
        let mut queue = CommitQueue::new();
        for commit in self.load_all(start).await? {
            queue.push(commit);
        }
        while let Some(commit) = queue.pop() {
            let Some(entry) = entries.remove(&commit.id) else {
                continue;
            };
            let child_level = entry.child_level.unwrap_or(commit.level);
            if let Some(payload) = matcher(&commit).await.map_err(AlgorithmError::Repository)? {
                return Ok(Some(FindResult {
                    commit: commit.id.clone(),
                    parents: commit.parent_ids(),
                    level: commit.level,
                    child: entry.child,
                    child_level,
                    accumulated: entry.acc,
                    payload,
                }));
            }
            for (parent, diffs) in &commit.parents {
                entries.entry(parent.clone()).or_insert_with(|| FindEntry {
                    child: entry.child.clone(),
                    child_level: Some(child_level),
                    acc: reducer.accumulate(&entry.acc, diffs),
                });
            }
            self.queue_parents(&mut queue, &commit).await?;
        }
        Ok(None)
    }

    /// Returns the queued ids once `predicate` holds for the queued commits.
    pub async fn find_cut<F>(&self, start: &BTreeSet<R::Key>, mut predicate: F) -> Result<BTreeSet<R::Key>, R>
    where
        F: FnMut(&[&CommitOf<R>]) -> bool,
    {
        let mut queue = CommitQueue::new();
        for commit in self.load_all(start).await? {
            queue.push(commit);
        }
        loop {
            let cut = {
                let commits: Vec<&CommitOf<R>> = queue.iter().collect();
                if commits.is_empty() {
                    return Err(AlgorithmError::GraphExhausted);
                }
                predicate(&commits).then(|| commits.iter().map(|c| c.id.clone()).collect())
            };
            if let Some(cut) = cut {
                return Ok(cut);
            }
            if let Some(commit) = queue.pop() {
                self.queue_parents(&mut queue, &commit).await?;
            }
        }
    }

    /// Some commit reachable from every node of `start`, nearest first.
    pub async fn find_any_common_parent(&self, start: &BTreeSet<R::Key>) -> Result<R::Key, R> {
        let mut reducer = CommonParents::new(start, false);
        match self.reduce(start, &mut reducer).await? {
            CommonResult::Any(k) => Ok(k),
            CommonResult::All(_) => Err(AlgorithmError::GraphExhausted),
        }
    }

    /// The frontier of commits reachable from every node of `start`.
    pub async fn find_all_common_parents(
        &self,
        start: &BTreeSet<R::Key>,
    ) -> Result<BTreeSet<R::Key>, R> {
        let mut reducer = CommonParents::new(start, true);
        match self.reduce(start, &mut reducer).await? {
            CommonResult::All(all) => Ok(all),
            CommonResult::Any(k) => Ok(BTreeSet::from([k])),
        }
    }

    /// Drops every node of `start` that is an ancestor of another.
    ///
    /// The walk stops at the lowest level among `start`.
    pub async fn exclude_parents(&self, start: &BTreeSet<R::Key>) -> Result<BTreeSet<R::Key>, R> {
        if start.len() <= 1 {
            return Ok(start.clone());
        }
        let mut reducer = ExcludeParents {
            nodes: start.clone(),
            min_level: 0,
        };
        self.reduce(start, &mut reducer).await
    }

    /// Reduced diffs from `parent` to each of `heads`.
    ///
    /// Heads that do not descend from `parent` are missing from the result.
    pub async fn reduce_edges<Red>(
        &self,
        heads: &BTreeSet<R::Key>,
        parent: &R::Key,
        reducer: &Red,
    ) -> Result<BTreeMap<R::Key, Red::Acc>, R>
    where
        Red: DiffsReducer<R::Diff>,
    {
        let mut walker = ReduceEdges {
            parent: parent.clone(),
            accumulators: Accumulators::new(heads.iter().cloned(), reducer.initial()),
            reducer,
        };
        self.reduce(heads, &mut walker).await
    }

    /// Operations taking the state at `from` to the state at `to`.
    pub async fn diff(&self, from: &R::Key, to: &R::Key) -> Result<Vec<R::Diff>, R> {
        let common = self
            .find_any_common_parent(&BTreeSet::from([from.clone(), to.clone()]))
            .await?;
        let mut to_from = self
            .reduce_edges(&BTreeSet::from([from.clone()]), &common, &ToList)
            .await?;
        let mut to_to = self
            .reduce_edges(&BTreeSet::from([to.clone()]), &common, &ToList)
            .await?;
        let common_to_from = to_from
            .remove(from)
            .ok_or(AlgorithmError::Graph(GraphError::UnreachableParent))?;
        let common_to_to = to_to
            .remove(to)
            .ok_or(AlgorithmError::Graph(GraphError::UnreachableParent))?;
        let mut diffs = self.system.invert(&common_to_from);
        diffs.extend(common_to_to);
        Ok(self.system.squash(&diffs))
    }

    /// Loads just enough history below `heads` to merge them.
    pub async fn load_for_merge(
        &self,
        heads: &BTreeSet<R::Key>,
    ) -> Result<OTLoadedGraph<R::Key, R::Diff>, R> {
        let mut loader = MergeLoader::new();
        self.reduce(heads, &mut loader)
            .await
            .map_err(|e| match e {
                AlgorithmError::GraphExhausted => AlgorithmError::IncompleteGraph,
                e => e,
            })?;
        debug!(heads = heads.len(), "loaded graph for merge");
        Ok(loader.graph)
    }

    /// Loads the whole history below `heads`.
    pub async fn load_graph(
        &self,
        heads: &BTreeSet<R::Key>,
    ) -> Result<OTLoadedGraph<R::Key, R::Diff>, R> {
        let mut loader = GraphLoader {
            graph: OTLoadedGraph::new(),
        };
        self.reduce(heads, &mut loader).await?;
        Ok(loader.graph)
    }

    /// Per head, the diffs to the merged state of all `heads`.
    pub async fn load_and_merge(
        &self,
        heads: &BTreeSet<R::Key>,
    ) -> Result<BTreeMap<R::Key, Vec<R::Diff>>, R> {
        let mut graph = self.load_for_merge(heads).await?;
        Ok(graph.merge(&self.system, heads)?)
    }

    /// Merges `heads` into one commit and pushes it.
    ///
    /// A single head is returned unchanged.
    pub async fn merge(&self, heads: &BTreeSet<R::Key>) -> Result<R::Key, R> {
        let Some(first) = heads.first() else {
            return Err(AlgorithmError::NoHeads);
        };
        if heads.len() == 1 {
            return Ok(first.clone());
        }
        let diffs = self.load_and_merge(heads).await?;
        let level = self
            .load_all(heads)
            .await?
            .iter()
            .map(|head| head.level)
            .max()
            .unwrap_or(0);
        let commit = self
            .repository
            .create_commit(diffs, level + 1)
            .await
            .map_err(AlgorithmError::Repository)?;
        let id = commit.id.clone();
        self.repository
            .push(vec![commit])
            .await
            .map_err(AlgorithmError::Repository)?;
        debug!(merge = ?id, heads = heads.len(), "pushed merge commit");
        Ok(id)
    }

    /// Merges the current heads of the repository.
    pub async fn merge_heads_and_push(&self) -> Result<R::Key, R> {
        let heads = self
            .repository
            .get_heads()
            .await
            .map_err(AlgorithmError::Repository)?;
        self.merge(&heads).await
    }

    /// The full state at `id`, from the nearest stored snapshot.
    pub async fn checkout_at(&self, id: &R::Key) -> Result<Vec<R::Diff>, R> {
        let repository = &self.repository;
        let found = self
            .find_parent(&BTreeSet::from([id.clone()]), &ToList, |commit| {
                let id = commit.id.clone();
                let hint = commit.snapshot_hint;
                let is_root = commit.is_root();
                async move {
                    if hint != Some(false) {
                        match repository.load_snapshot(id).await {
                            Ok(Some(snapshot)) => return Ok(Some(snapshot)),
                            Ok(None) => {}
                            Err(e) => return Err(e),
                        }
                    }
                    Ok::<_, R::Error>(is_root.then(Vec::new))
                }
            })
            .await?;
        let Some(found) = found else {
            return Err(AlgorithmError::GraphExhausted);
        };
        let mut diffs = found.payload;
        diffs.extend(found.accumulated);
        Ok(self.system.squash(&diffs))
    }

    /// Checks out the first head of the repository.
    pub async fn checkout(&self) -> Result<(R::Key, Vec<R::Diff>), R> {
        let heads = self
            .repository
            .get_heads()
            .await
            .map_err(AlgorithmError::Repository)?;
        let head = heads.first().ok_or(AlgorithmError::NoHeads)?;
        let diffs = self.checkout_at(head).await?;
        Ok((head.clone(), diffs))
    }

    pub async fn save_snapshot(&self, id: &R::Key) -> Result<(), R> {
        let diffs = self.checkout_at(id).await?;
        self.repository
            .save_snapshot(id.clone(), diffs)
            .await
            .map_err(AlgorithmError::Repository)
    }
}

enum CommonResult<K> {
    Any(K),
    All(BTreeSet<K>),
}

/// Tracks which start nodes reach each frontier commit.
struct CommonParents<K> {
    heads: BTreeSet<K>,
    node_heads: BTreeMap<K, BTreeSet<K>>,
    all: bool,
}

impl<K: Ord + Clone> CommonParents<K> {
    fn new(heads: &BTreeSet<K>, all: bool) -> Self {
        Self {
            heads: heads.clone(),
            node_heads: heads
                .iter()
                .map(|h| (h.clone(), BTreeSet::from([h.clone()])))
                .collect(),
            all,
        }
    }

    fn result(&self) -> Option<CommonResult<K>> {
        if self.all {
            self.node_heads
                .values()
                .all(|h| *h == self.heads)
                .then(|| CommonResult::All(self.node_heads.keys().cloned().collect()))
        } else {
            self.node_heads
                .iter()
                .rev()
                .find(|(_, h)| **h == self.heads)
                .map(|(k, _)| CommonResult::Any(k.clone()))
        }
    }
}

impl<K: Ord + Clone, D> GraphReducer<K, D> for CommonParents<K> {
    type Output = CommonResult<K>;

    fn on_commit(&mut self, commit: &OTCommit<K, D>) -> Walk<CommonResult<K>> {
        if self.heads.len() == 1 {
            if let Some(result) = self.result() {
                return Walk::Done(result);
            }
        }
        let commit_heads = self.node_heads.remove(&commit.id).unwrap_or_default();
        for parent in commit.parents.keys() {
            self.node_heads
                .entry(parent.clone())
                .or_default()
                .extend(commit_heads.iter().cloned());
        }
        match self.result() {
            Some(result) => Walk::Done(result),
            None => Walk::Resume,
        }
    }
}

struct ExcludeParents<K> {
    nodes: BTreeSet<K>,
    min_level: u64,
}

impl<K: Ord + Clone, D> GraphReducer<K, D> for ExcludeParents<K> {
    type Output = BTreeSet<K>;

    fn on_start(&mut self, heads: &[OTCommit<K, D>]) {
        self.min_level = heads.iter().map(|c| c.level).min().unwrap_or(0);
    }

    fn on_commit(&mut self, commit: &OTCommit<K, D>) -> Walk<BTreeSet<K>> {
        for parent in commit.parents.keys() {
            self.nodes.remove(parent);
        }
        if commit.level <= self.min_level {
            return Walk::Done(self.nodes.clone());
        }
        Walk::Resume
    }

    fn on_exhausted(&mut self) -> Option<BTreeSet<K>> {
        Some(self.nodes.clone())
    }
}

struct ReduceEdges<'a, K, A, Red> {
    parent: K,
    accumulators: Accumulators<K, A>,
    reducer: &'a Red,
}

impl<K, D, A, Red> GraphReducer<K, D> for ReduceEdges<'_, K, A, Red>
where
    K: Ord + Clone,
    A: Clone,
    Red: DiffsReducer<D, Acc = A>,
{
    type Output = BTreeMap<K, A>;

    fn on_commit(&mut self, commit: &OTCommit<K, D>) -> Walk<BTreeMap<K, A>> {
        let values = self.accumulators.take(&commit.id);
        if commit.id == self.parent {
            return Walk::Done(values);
        }
        self.accumulators.propagate(commit, &values, self.reducer);
        Walk::Resume
    }
}

struct GraphLoader<K, D> {
    graph: OTLoadedGraph<K, D>,
}

impl<K, D> GraphReducer<K, D> for GraphLoader<K, D>
where
    K: Ord + Clone + std::hash::Hash,
    D: Clone,
{
    type Output = ();

    fn on_commit(&mut self, commit: &OTCommit<K, D>) -> Walk<()> {
        self.graph.add_node(commit);
        Walk::Resume
    }

    fn on_exhausted(&mut self) -> Option<()> {
        Some(())
    }
}

/// Loads commits until some head descends from every known root.
struct MergeLoader<K, D> {
    graph: OTLoadedGraph<K, D>,
    head_roots: BTreeMap<K, BTreeSet<K>>,
    root_heads: BTreeMap<K, BTreeSet<K>>,
}

impl<K, D> MergeLoader<K, D>
where
    K: Ord + Clone + std::hash::Hash,
    D: Clone,
{
    fn new() -> Self {
        Self {
            graph: OTLoadedGraph::new(),
            head_roots: BTreeMap::new(),
            root_heads: BTreeMap::new(),
        }
    }

    fn has_common_frontier(&self) -> bool {
        self.head_roots.values().any(|roots| {
            roots.len() == self.root_heads.len() && roots.iter().all(|r| self.root_heads.contains_key(r))
        })
    }
}

impl<K, D> GraphReducer<K, D> for MergeLoader<K, D>
where
    K: Ord + Clone + std::hash::Hash,
    D: Clone,
{
    type Output = ();

    fn on_start(&mut self, heads: &[OTCommit<K, D>]) {
        for head in heads {
            self.head_roots
                .insert(head.id.clone(), BTreeSet::from([head.id.clone()]));
            self.root_heads
                .insert(head.id.clone(), BTreeSet::from([head.id.clone()]));
        }
    }

    fn on_commit(&mut self, commit: &OTCommit<K, D>) -> Walk<()> {
        self.graph.add_node(commit);
        let heads = self.root_heads.remove(&commit.id).unwrap_or_default();
        let roots: BTreeSet<K> = self
            .graph
            .roots(&GraphNode::Commit(commit.id.clone()))
            .into_iter()
            .filter_map(|node| node.commit().cloned())
            .collect();
        for head in heads {
            if let Some(head_roots) = self.head_roots.get_mut(&head) {
                head_roots.remove(&commit.id);
                head_roots.extend(roots.iter().cloned());
            }
            for root in &roots {
                self.root_heads
                    .entry(root.clone())
                    .or_default()
                    .insert(head.clone());
            }
        }
        match self.has_common_frontier() {
            true => Walk::Done(()),
            false => Walk::Resume,
        }
    }
}
