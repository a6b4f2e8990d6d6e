//! Per-key bookkeeping of a [`LocalGlobalOTNode`](super::localnode::LocalGlobalOTNode).

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::time::Instant;

use super::node::GlobalOTNode;
use super::types::RawServerId;
use super::types::RepoId;

/// Data an intermediate node refreshes from masters at most once per
/// latency margin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum Refresh {
    Heads,
    Snapshots,
    PullRequests,
}

fn is_fresh(stamp: Option<Instant>, margin: Duration) -> bool {
    stamp.is_some_and(|at| at + margin > Instant::now())
}

pub(crate) struct Namespace {
    masters: Vec<(RawServerId, Arc<dyn GlobalOTNode>)>,
    masters_updated: Option<Instant>,
    /// Discovery lists this node among the masters of the key.
    pub(crate) announced_self: bool,
    repositories_updated: Option<Instant>,
    repositories: BTreeMap<String, Arc<RepositoryEntry>>,
}

impl Namespace {
    pub(crate) fn new() -> Self {
        Self {
            masters: Vec::new(),
            masters_updated: None,
            announced_self: false,
            repositories_updated: None,
            repositories: BTreeMap::new(),
        }
    }

    /// Cached masters, `None` once the cache is older than `margin`.
    pub(crate) fn masters(&self, margin: Duration) -> Option<Vec<Arc<dyn GlobalOTNode>>> {
        is_fresh(self.masters_updated, margin)
            .then(|| self.masters.iter().map(|(_, node)| node.clone()).collect())
    }

    pub(crate) fn cached_masters(&self) -> Vec<Arc<dyn GlobalOTNode>> {
        self.masters.iter().map(|(_, node)| node.clone()).collect()
    }

    pub(crate) fn set_masters(&mut self, masters: Vec<(RawServerId, Arc<dyn GlobalOTNode>)>) {
        self.masters = masters;
        self.masters_updated = Some(Instant::now());
    }

    pub(crate) fn master_ids(&self) -> Vec<RawServerId> {
        self.masters.iter().map(|(id, _)| id.clone()).collect()
    }

    pub(crate) fn repositories_fresh(&self, margin: Duration) -> bool {
        is_fresh(self.repositories_updated, margin)
    }

    pub(crate) fn touch_repositories(&mut self) {
        self.repositories_updated = Some(Instant::now());
    }

    pub(crate) fn ensure_repository(&mut self, repo: &RepoId) -> Arc<RepositoryEntry> {
        self.repositories
            .entry(repo.name.clone())
            .or_insert_with(|| Arc::new(RepositoryEntry::new(repo.clone())))
            .clone()
    }

    pub(crate) fn repositories(&self) -> impl Iterator<Item = &Arc<RepositoryEntry>> {
        self.repositories.values()
    }
}

pub(crate) struct RepositoryEntry {
    pub(crate) repo: RepoId,
    refreshed: Mutex<HashMap<Refresh, Instant>>,
    heads_changed: watch::Sender<u64>,
    /// Serializes head updates of this repository.
    pub(crate) save_heads: tokio::sync::Mutex<()>,
}

impl RepositoryEntry {
    fn new(repo: RepoId) -> Self {
        let (heads_changed, _) = watch::channel(0);
        Self {
            repo,
            refreshed: Mutex::new(HashMap::new()),
            heads_changed,
            save_heads: tokio::sync::Mutex::new(()),
        }
    }

    pub(crate) fn is_fresh(&self, what: Refresh, margin: Duration) -> bool {
        is_fresh(self.refreshed.lock().get(&what).copied(), margin)
    }

    pub(crate) fn touch(&self, what: Refresh) {
        self.refreshed.lock().insert(what, Instant::now());
    }

    pub(crate) fn notify_heads(&self) {
        self.heads_changed.send_modify(|version| *version += 1);
    }

    pub(crate) fn subscribe_heads(&self) -> watch::Receiver<u64> {
        self.heads_changed.subscribe()
    }
}
