//! The in-memory commit graph the merge algorithm works on.
//!
//! Commits are added as they are loaded from a repository, newest first.
//! Merging adds synthetic nodes to the graph: each one joins a pivot head
//! with the merge of the remaining heads. Those nodes never leave the
//! graph; only the diff paths from the requested heads to the final merge
//! node are handed back to the caller.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::collections::BinaryHeap;
use std::collections::HashMap;
use std::collections::HashSet;
use std::error::Error;
use std::fmt;
use std::fmt::Write as _;

use itertools::Itertools;
use tracing::trace;

use super::commit::OTCommit;
use super::system::OTSystem;
use super::system::TransformError;

/// A node of a loaded graph: either a real commit or a merge node
/// created while merging.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum GraphNode<K> {
    Commit(K),
    Merge(usize),
}

impl<K> GraphNode<K> {
    pub fn commit(&self) -> Option<&K> {
        match self {
            GraphNode::Commit(k) => Some(k),
            GraphNode::Merge(_) => None,
        }
    }
}

#[derive(Debug)]
pub enum GraphError {
    /// The heads share no mergeable ancestry in the loaded graph.
    CannotMerge,
    /// A path between two nodes was expected but is missing.
    UnreachableParent,
    /// A requested head could not be reached from the merge node.
    UnreachableHead,
    /// Two diff paths could not be transformed against each other.
    Transform(TransformError),
}

impl fmt::Display for GraphError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GraphError::CannotMerge => write!(f, "graph cannot be merged"),
            GraphError::UnreachableParent => write!(f, "parent is not reachable in loaded graph"),
            GraphError::UnreachableHead => write!(f, "head is not reachable from merge node"),
            GraphError::Transform(e) => write!(f, "merge transform failed: {e}"),
        }
    }
}

impl Error for GraphError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            GraphError::Transform(e) => Some(e),
            _ => None,
        }
    }
}

impl From<TransformError> for GraphError {
    fn from(e: TransformError) -> Self {
        GraphError::Transform(e)
    }
}

/// Child to parent adjacency with the diffs of every edge.
pub struct OTLoadedGraph<K, D> {
    parents: HashMap<GraphNode<K>, BTreeMap<GraphNode<K>, Vec<D>>>,
    children: HashMap<GraphNode<K>, BTreeSet<GraphNode<K>>>,
    levels: HashMap<GraphNode<K>, u64>,
    visited: HashSet<K>,
    merge_nodes: usize,
}

impl<K, D> Default for OTLoadedGraph<K, D>
where
    K: Ord + Clone + std::hash::Hash,
    D: Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, D> OTLoadedGraph<K, D>
where
    K: Ord + Clone + std::hash::Hash,
    D: Clone,
{
    pub fn new() -> Self {
        Self {
            parents: HashMap::new(),
            children: HashMap::new(),
            levels: HashMap::new(),
            visited: HashSet::new(),
            merge_nodes: 0,
        }
    }

    /// Records a loaded commit and the edges to its parents.
    pub fn add_node(&mut self, commit: &OTCommit<K, D>) {
        let node = GraphNode::Commit(commit.id.clone());
        self.visited.insert(commit.id.clone());
        self.levels.insert(node.clone(), commit.level);
        for (parent, diffs) in &commit.parents {
            let parent = GraphNode::Commit(parent.clone());
            // Unloaded parents sit right below their child until loaded.
            self.levels
                .entry(parent.clone())
                .or_insert(commit.level.saturating_sub(1));
            self.add_edge(parent, node.clone(), diffs.clone());
        }
    }

    pub fn has_visited(&self, id: &K) -> bool {
        self.visited.contains(id)
    }

    pub fn parents(&self, node: &GraphNode<K>) -> Option<&BTreeMap<GraphNode<K>, Vec<D>>> {
        self.parents.get(node)
    }

    pub fn children(&self, node: &GraphNode<K>) -> Option<&BTreeSet<GraphNode<K>>> {
        self.children.get(node)
    }

    pub fn level(&self, node: &GraphNode<K>) -> u64 {
        self.levels.get(node).copied().unwrap_or(0)
    }

    /// Number of synthetic merge nodes created so far.
    pub fn merge_node_count(&self) -> usize {
        self.merge_nodes
    }

    fn add_edge(&mut self, parent: GraphNode<K>, child: GraphNode<K>, diffs: Vec<D>) {
        self.children
            .entry(parent.clone())
            .or_default()
            .insert(child.clone());
        self.parents.entry(child).or_default().insert(parent, diffs);
    }

    fn new_merge_node(&mut self, level: u64) -> GraphNode<K> {
        let node = GraphNode::Merge(self.merge_nodes);
        self.merge_nodes += 1;
        self.levels.insert(node.clone(), level);
        node
    }

    fn has_parents(&self, node: &GraphNode<K>) -> bool {
        self.parents.get(node).is_some_and(|p| !p.is_empty())
    }

    /// The parentless nodes `node` descends from (itself if it has no
    /// loaded parents).
    pub fn roots(&self, node: &GraphNode<K>) -> BTreeSet<GraphNode<K>> {
        let mut result = BTreeSet::new();
        let mut visited = HashSet::new();
        let mut stack = vec![node.clone()];
        while let Some(node) = stack.pop() {
            if !visited.insert(node.clone()) {
                continue;
            }
            match self.parents.get(&node) {
                Some(parents) if !parents.is_empty() => stack.extend(parents.keys().cloned()),
                _ => {
                    result.insert(node);
                }
            }
        }
        result
    }

    /// Drops every node that is an ancestor of another node in `nodes`.
    pub fn exclude_parents(&self, nodes: &BTreeSet<GraphNode<K>>) -> BTreeSet<GraphNode<K>> {
        let mut result = nodes.clone();
        if result.len() <= 1 {
            return result;
        }
        let mut visited = HashSet::new();
        let mut stack: Vec<GraphNode<K>> = nodes.iter().cloned().collect();
        while let Some(node) = stack.pop() {
            if !visited.insert(node.clone()) {
                continue;
            }
            if let Some(parents) = self.parents.get(&node) {
                for parent in parents.keys() {
                    result.remove(parent);
                    if !visited.contains(parent) {
                        stack.push(parent.clone());
                    }
                }
            }
        }
        result
    }

    /// The concatenated diffs along some path from `parent` down to `child`.
    pub fn find_path(
        &self,
        parent: &GraphNode<K>,
        child: &GraphNode<K>,
    ) -> Result<Vec<D>, GraphError> {
        if parent == child {
            return Ok(Vec::new());
        }
        let mut queue = BinaryHeap::new();
        let mut paths: HashMap<GraphNode<K>, Vec<D>> = HashMap::new();
        let mut visited = HashSet::new();
        queue.push((self.level(child), child.clone()));
        paths.insert(child.clone(), Vec::new());
        while let Some((_, node)) = queue.pop() {
            let Some(node_to_child) = paths.remove(&node) else {
                continue;
            };
            if !visited.insert(node.clone()) {
                continue;
            }
            let Some(node_parents) = self.parents.get(&node) else {
                continue;
            };
            for (node_parent, diffs) in node_parents {
                if visited.contains(node_parent) || paths.contains_key(node_parent) {
                    continue;
                }
                let mut parent_to_child = diffs.clone();
                parent_to_child.extend(node_to_child.iter().cloned());
                if node_parent == parent {
                    return Ok(parent_to_child);
                }
                paths.insert(node_parent.clone(), parent_to_child);
                queue.push((self.level(node_parent), node_parent.clone()));
            }
        }
        Err(GraphError::UnreachableParent)
    }

    /// Computes, for every head, the diffs that bring it to one common
    /// merged state.
    ///
    /// Heads that are ancestors of other heads are fast-forwarded along
    /// their path. The result does not depend on the order heads are
    /// given in.
    pub fn merge<S>(&mut self, system: &S, heads: &BTreeSet<K>) -> Result<BTreeMap<K, Vec<D>>, GraphError>
    where
        S: OTSystem<D> + ?Sized,
    {
        if heads.len() <= 1 {
            return Ok(heads.iter().map(|h| (h.clone(), Vec::new())).collect());
        }
        let requested: BTreeSet<GraphNode<K>> =
            heads.iter().cloned().map(GraphNode::Commit).collect();
        let merge_node = self.merge_nodes_of(system, self.exclude_parents(&requested))?;

        let mut queue = BinaryHeap::new();
        let mut paths: HashMap<GraphNode<K>, Vec<D>> = HashMap::new();
        let mut visited = HashSet::new();
        let mut result = BTreeMap::new();
        queue.push((self.level(&merge_node), merge_node.clone()));
        paths.insert(merge_node, Vec::new());
        while let Some((_, node)) = queue.pop() {
            let Some(path) = paths.remove(&node) else {
                continue;
            };
            if !visited.insert(node.clone()) {
                continue;
            }
            let Some(parents) = self.parents.get(&node) else {
                if let GraphNode::Commit(k) = &node {
                    if heads.contains(k) {
                        result.insert(k.clone(), path);
                    }
                }
                continue;
            };
            for (parent, diffs) in parents {
                if visited.contains(parent) || paths.contains_key(parent) {
                    continue;
                }
                let mut parent_path = diffs.clone();
                parent_path.extend(path.iter().cloned());
                paths.insert(parent.clone(), parent_path);
                queue.push((self.level(parent), parent.clone()));
            }
            if let GraphNode::Commit(k) = &node {
                if heads.contains(k) {
                    result.insert(k.clone(), path);
                    if result.len() == heads.len() {
                        break;
                    }
                }
            }
        }
        if result.len() != heads.len() {
            return Err(GraphError::UnreachableHead);
        }
        Ok(result
            .into_iter()
            .map(|(k, path)| (k, system.squash(&path)))
            .collect())
    }

    /// Joins `nodes` into a single node, adding merge nodes as needed.
    ///
    /// Each round picks the node with the fewest roots as pivot and
    /// replaces it by its parents. Once a single node remains, the
    /// recorded pivots are joined back one by one, last pivot first.
    fn merge_nodes_of<S>(
        &mut self,
        system: &S,
        mut nodes: BTreeSet<GraphNode<K>>,
    ) -> Result<GraphNode<K>, GraphError>
    where
        S: OTSystem<D> + ?Sized,
    {
        let mut pivots = Vec::new();
        while nodes.len() > 1 {
            let pivot = nodes
                .iter()
                .map(|n| (self.roots(n).len(), n))
                .min()
                .map(|(_, n)| n.clone())
                .ok_or(GraphError::CannotMerge)?;
            if !self.has_parents(&pivot) {
                return Err(GraphError::CannotMerge);
            }
            let mut next: BTreeSet<GraphNode<K>> = self
                .parents
                .get(&pivot)
                .map(|p| p.keys().cloned().collect())
                .unwrap_or_default();
            next.extend(nodes.iter().filter(|n| **n != pivot).cloned());
            nodes = self.exclude_parents(&next);
            pivots.push(pivot);
        }

        let mut merge_node = nodes.into_iter().next().ok_or(GraphError::CannotMerge)?;
        while let Some(pivot) = pivots.pop() {
            let pivot_parents = self.parents.get(&pivot).ok_or(GraphError::CannotMerge)?;
            let (parent, parent_to_pivot) = pivot_parents
                .iter()
                .next()
                .map(|(p, d)| (p.clone(), d.clone()))
                .ok_or(GraphError::CannotMerge)?;
            let parent_count = pivot_parents.len();
            let parent_to_merge = self.find_path(&parent, &merge_node)?;
            let level = self.level(&pivot).max(self.level(&merge_node)) + 1;

            let result = self.new_merge_node(level);
            if parent_count > 1 {
                let mut pivot_to_result = system.invert(&parent_to_pivot);
                pivot_to_result.extend(parent_to_merge);
                let pivot_to_result = system.squash(&pivot_to_result);
                self.add_edge(merge_node.clone(), result.clone(), Vec::new());
                self.add_edge(pivot.clone(), result.clone(), pivot_to_result);
            } else {
                let transformed = system.transform(&parent_to_pivot, &parent_to_merge)?;
                self.add_edge(merge_node.clone(), result.clone(), transformed.left);
                self.add_edge(pivot.clone(), result.clone(), transformed.right);
            }
            trace!(level, "joined pivot with merged remainder");
            merge_node = result;
        }
        Ok(merge_node)
    }
}

impl<K, D> OTLoadedGraph<K, D>
where
    K: Ord + Clone + std::hash::Hash + fmt::Debug,
    D: Clone + fmt::Debug,
{
    /// Renders the graph in Graphviz dot syntax, parents above children.
    pub fn to_graphviz(&self) -> String {
        let mut out = String::from("digraph {\n");
        for (child, parents) in self.parents.iter().sorted_by(|a, b| a.0.cmp(b.0)) {
            for (parent, diffs) in parents {
                let _ = writeln!(
                    out,
                    "\t\"{}\" -> \"{}\" [dir=\"back\", label=\"{:?}\"];",
                    node_label(parent),
                    node_label(child),
                    diffs
                );
            }
        }
        out.push('}');
        out
    }
}

fn node_label<K: fmt::Debug>(node: &GraphNode<K>) -> String {
    match node {
        GraphNode::Commit(k) => format!("{k:?}"),
        GraphNode::Merge(n) => format!("@{n}"),
    }
}
