//! A node that is master for some keys and caching relay for the rest.
//!
//! Masters of a key are looked up through discovery and cached for the
//! latency margin. Requests for keys this node masters are served from
//! storage; for other keys, writes are forwarded to the masters and reads
//! are refreshed from them.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::collections::BinaryHeap;
use std::collections::HashMap;
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream;
use futures::stream::FuturesUnordered;
use futures::StreamExt;
use parking_lot::Mutex;
use tracing::debug;
use tracing::trace;
use tracing::warn;

use super::discovery::DiscoveryService;
use super::keys::PubKey;
use super::namespace::Namespace;
use super::namespace::Refresh;
use super::namespace::RepositoryEntry;
use super::node::EntryStream;
use super::node::GlobalOTNode;
use super::node::NodeError;
use super::node::NodeFactory;
use super::node::Result;
use super::storage::CommitStorage;
use super::types::CommitEntry;
use super::types::CommitId;
use super::types::HeadsInfo;
use super::types::RawCommit;
use super::types::RawServerId;
use super::types::RepoId;
use super::types::SignedHead;
use super::types::SignedPullRequest;
use super::types::SignedSnapshot;
use crate::config::NodeConfig;

pub struct LocalGlobalOTNode {
    config: NodeConfig,
    storage: Arc<dyn CommitStorage>,
    discovery: Arc<dyn DiscoveryService>,
    factory: Arc<dyn NodeFactory>,
    namespaces: Mutex<HashMap<PubKey, Namespace>>,
}

impl LocalGlobalOTNode {
    pub fn new(
        config: NodeConfig,
        storage: Arc<dyn CommitStorage>,
        discovery: Arc<dyn DiscoveryService>,
        factory: Arc<dyn NodeFactory>,
    ) -> Self {
        Self {
            config,
            storage,
            discovery,
            factory,
            namespaces: Mutex::new(HashMap::new()),
        }
    }

    pub fn id(&self) -> &RawServerId {
        &self.config.server_id
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn storage(&self) -> &Arc<dyn CommitStorage> {
        &self.storage
    }

    /// Whether this node is authoritative for `key`, by configuration or
    /// because discovery announced it.
    pub fn is_master_for(&self, key: &PubKey) -> bool {
        self.config.managed_keys.contains(key)
            || self
                .namespaces
                .lock()
                .get(key)
                .is_some_and(|namespace| namespace.announced_self)
    }

    /// Server ids of the known masters of `key`, excluding this node.
    pub fn master_ids(&self, key: &PubKey) -> Vec<RawServerId> {
        self.namespaces
            .lock()
            .get(key)
            .map(Namespace::master_ids)
            .unwrap_or_default()
    }

    fn ensure_repository(&self, repo: &RepoId) -> Arc<RepositoryEntry> {
        self.namespaces
            .lock()
            .entry(repo.owner)
            .or_insert_with(Namespace::new)
            .ensure_repository(repo)
    }

    /// Masters of `key` other than this node, from cache or discovery.
    async fn ensure_masters(&self, key: &PubKey) -> Vec<Arc<dyn GlobalOTNode>> {
        let margin = self.config.latency_margin;
        if let Some(masters) = self
            .namespaces
            .lock()
            .get(key)
            .and_then(|namespace| namespace.masters(margin))
        {
            return masters;
        }
        let announcement = match self.discovery.find(*key).await {
            Ok(announcement) => announcement,
            Err(error) => {
                warn!(key = ?key, %error, "master lookup failed");
                return self
                    .namespaces
                    .lock()
                    .get(key)
                    .map(Namespace::cached_masters)
                    .unwrap_or_default();
            }
        };
        let server_ids = announcement
            .filter(|announcement| announcement.verify(key))
            .map(|announcement| announcement.into_value().server_ids)
            .unwrap_or_default();
        let announced_self = server_ids.contains(self.id());
        let masters: Vec<_> = server_ids
            .into_iter()
            .filter(|id| id != self.id())
            .filter_map(|id| match self.factory.create(&id) {
                Some(node) => Some((id, node)),
                None => {
                    warn!(server = %id, "announced master is unreachable");
                    None
                }
            })
            .collect();
        debug!(key = ?key, masters = masters.len(), "masters updated");
        let mut namespaces = self.namespaces.lock();
        let namespace = namespaces.entry(*key).or_insert_with(Namespace::new);
        namespace.announced_self = announced_self;
        namespace.set_masters(masters);
        namespace.cached_masters()
    }

    /// Runs `request` until it succeeds, fails for good, or the retry
    /// policy gives up.
    async fn with_retry<T, F, Fut>(&self, mut request: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut backoff = self.config.retry.build_backoff();
        loop {
            match request().await {
                Ok(value) => return Ok(value),
                Err(error) if error.is_retryable() => match backoff.next() {
                    Some(delay) => {
                        debug!(%error, ?delay, "retrying");
                        tokio::time::sleep(delay).await;
                    }
                    None => return Err(error),
                },
                Err(error) => return Err(error),
            }
        }
    }

    /// Forwards a write to the masters of `repo` until one accepts it.
    ///
    /// Does nothing on a master; failures are logged, the local write stands.
    async fn to_master<F, Fut>(&self, repo: &RepoId, request: F)
    where
        F: Fn(Arc<dyn GlobalOTNode>) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let masters = self.ensure_masters(&repo.owner).await;
        if self.is_master_for(&repo.owner) {
            return;
        }
        for master in masters {
            match request(master).await {
                Ok(()) => return,
                Err(error) => warn!(repo = %repo, %error, "forwarding to master failed"),
            }
        }
    }

    /// First successful answer of a master, `None` on a master or when all
    /// masters fail.
    async fn from_master<T, F, Fut>(&self, repo: &RepoId, request: F) -> Option<T>
    where
        F: Fn(Arc<dyn GlobalOTNode>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let masters = self.ensure_masters(&repo.owner).await;
        if self.is_master_for(&repo.owner) {
            return None;
        }
        for master in masters {
            match request(master).await {
                Ok(value) => return Some(value),
                Err(error) => debug!(repo = %repo, %error, "master request failed"),
            }
        }
        None
    }

    /// Runs `round` against every master of `repo` concurrently, each with
    /// retries.
    ///
    /// Succeeds when any master succeeded; the others get the latency margin
    /// to finish. When all fail, the last error is returned.
    async fn for_each_master<F, Fut>(&self, repo: &RepoId, round: F) -> Result<()>
    where
        F: Fn(Arc<dyn GlobalOTNode>) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let masters = self.ensure_masters(&repo.owner).await;
        if self.is_master_for(&repo.owner) {
            return Ok(());
        }
        if masters.is_empty() {
            return Err(NodeError::NoMasters(repo.owner));
        }
        let round = &round;
        let mut rounds: FuturesUnordered<_> = masters
            .into_iter()
            .map(|master| self.with_retry(move || round(master.clone())))
            .collect();
        let mut last_error = None;
        while let Some(result) = rounds.next().await {
            match result {
                Ok(()) => {
                    let rest = async {
                        while let Some(result) = rounds.next().await {
                            if let Err(error) = result {
                                warn!(repo = %repo, %error, "master round failed");
                            }
                        }
                    };
                    if tokio::time::timeout(self.config.latency_margin, rest)
                        .await
                        .is_err()
                    {
                        debug!(repo = %repo, "left slow masters behind");
                    }
                    return Ok(());
                }
                Err(error) => {
                    warn!(repo = %repo, %error, "master round failed");
                    last_error = Some(error);
                }
            }
        }
        Err(last_error.unwrap_or(NodeError::NoMasters(repo.owner)))
    }

    /// Loads a commit from storage, falling back to the masters and caching
    /// what they return.
    async fn get_commit(&self, repo: &RepoId, id: CommitId) -> Result<Option<RawCommit>> {
        if id.is_root() {
            return Ok(None);
        }
        if let Some(commit) = self.storage.load_commit(id).await? {
            return Ok(Some(commit));
        }
        let Some(commit) = self
            .from_master(repo, |master| async move { master.load_commit(repo, id).await })
            .await
        else {
            return Ok(None);
        };
        self.storage.save_commit(id, commit.clone()).await?;
        Ok(Some(commit))
    }

    /// Drops the ids in `heads` that are ancestors of other ids in `heads`.
    async fn exclude_parents(
        &self,
        repo: &RepoId,
        heads: BTreeSet<CommitId>,
    ) -> Result<BTreeSet<CommitId>> {
        let mut result = heads.clone();
        let mut queue = BinaryHeap::new();
        let mut queued = HashSet::new();
        let mut commits = HashMap::new();
        for head in heads {
            if head.is_root() {
                continue;
            }
            let commit = self
                .get_commit(repo, head)
                .await?
                .ok_or(NodeError::CommitNotFound(head))?;
            commits.insert(head, commit);
            queued.insert(head);
            queue.push(head);
        }
        let min_level = queue.iter().map(CommitId::level).min().unwrap_or(0);
        while let Some(id) = queue.pop() {
            if id.level() < min_level {
                break;
            }
            let Some(commit) = commits.remove(&id) else {
                continue;
            };
            for parent in &commit.parents {
                result.remove(parent);
                if parent.is_root() || parent.level() < min_level || !queued.insert(*parent) {
                    continue;
                }
                if let Some(parent_commit) = self.get_commit(repo, *parent).await? {
                    commits.insert(*parent, parent_commit);
                    queue.push(*parent);
                }
            }
        }
        Ok(result)
    }

    /// Merges `signed` into the stored heads of `repo`, dropping heads that
    /// became ancestors.
    async fn save_heads_local(&self, repo: &RepoId, signed: BTreeSet<SignedHead>) -> Result<()> {
        if signed.is_empty() {
            return Ok(());
        }
        let entry = self.ensure_repository(repo);
        let _guard = entry.save_heads.lock().await;
        let existing: BTreeSet<CommitId> = self.storage.get_heads(repo).await?.into_keys().collect();
        let new: BTreeSet<CommitId> = signed.iter().map(|head| head.value().commit_id).collect();
        if new.is_subset(&existing) {
            return Ok(());
        }
        let real = self
            .exclude_parents(repo, existing.union(&new).copied().collect())
            .await?;
        let added: BTreeSet<SignedHead> = signed
            .into_iter()
            .filter(|head| real.contains(&head.value().commit_id))
            .collect();
        let excluded: BTreeSet<CommitId> = existing.difference(&real).copied().collect();
        debug!(repo = %repo, added = added.len(), excluded = excluded.len(), "heads updated");
        self.storage.update_heads(repo, added, excluded).await?;
        entry.notify_heads();
        Ok(())
    }

    async fn update_heads(&self, repo: &RepoId) -> Result<()> {
        let entry = self.ensure_repository(repo);
        if entry.is_fresh(Refresh::Heads, self.config.latency_margin) {
            return Ok(());
        }
        trace!(repo = %repo, "updating heads");
        let heads = self
            .from_master(repo, |master| async move { master.get_heads(repo).await })
            .await
            .unwrap_or_default();
        self.save_heads_local(repo, heads).await?;
        entry.touch(Refresh::Heads);
        Ok(())
    }

    async fn update_snapshots(&self, repo: &RepoId) -> Result<()> {
        let entry = self.ensure_repository(repo);
        if entry.is_fresh(Refresh::Snapshots, self.config.latency_margin) {
            return Ok(());
        }
        trace!(repo = %repo, "updating snapshots");
        let local = self.storage.list_snapshot_ids(repo).await?;
        let local = &local;
        let snapshots = self
            .from_master(repo, |master| async move {
                let mut snapshots = Vec::new();
                for id in master.list_snapshots(repo, local.clone()).await? {
                    if let Some(snapshot) = master.load_snapshot(repo, id).await? {
                        snapshots.push(snapshot);
                    }
                }
                Ok(snapshots)
            })
            .await
            .unwrap_or_default();
        for snapshot in snapshots {
            self.storage.save_snapshot(snapshot).await?;
        }
        entry.touch(Refresh::Snapshots);
        Ok(())
    }

    async fn update_pull_requests(&self, repo: &RepoId) -> Result<()> {
        let entry = self.ensure_repository(repo);
        if entry.is_fresh(Refresh::PullRequests, self.config.latency_margin) {
            return Ok(());
        }
        trace!(repo = %repo, "updating pull requests");
        let pull_requests = self
            .from_master(repo, |master| async move { master.get_pull_requests(repo).await })
            .await
            .unwrap_or_default();
        for pull_request in pull_requests {
            self.storage.save_pull_request(pull_request).await?;
        }
        entry.touch(Refresh::PullRequests);
        Ok(())
    }

    /// Negotiation state from this node's storage alone.
    pub async fn local_heads_info(&self, repo: &RepoId) -> Result<HeadsInfo> {
        let mut info = HeadsInfo::default();
        let mut queue = BinaryHeap::new();
        let mut queued = HashSet::new();
        let mut commits = HashMap::new();
        for head in self.storage.get_heads(repo).await?.into_keys() {
            match self.storage.load_commit(head).await? {
                Some(commit) => {
                    info.existing.insert(head);
                    commits.insert(head, commit);
                    queued.insert(head);
                    queue.push(head);
                }
                None => {
                    info.required.insert(head);
                }
            }
        }
        while let Some(id) = queue.pop() {
            let Some(commit) = commits.remove(&id) else {
                continue;
            };
            for parent in commit.parents {
                if !queued.insert(parent) || self.storage.is_complete_commit(parent).await? {
                    continue;
                }
                match self.storage.load_commit(parent).await? {
                    Some(parent_commit) => {
                        commits.insert(parent, parent_commit);
                        queue.push(parent);
                    }
                    None => {
                        info.required.insert(parent);
                    }
                }
            }
        }
        Ok(info)
    }

    /// Accepts an upload session into local storage only.
    pub async fn upload_local(
        &self,
        repo: &RepoId,
        mut entries: EntryStream,
        heads: BTreeSet<SignedHead>,
    ) -> Result<()> {
        let mut session = BTreeMap::new();
        let mut new_heads = heads;
        while let Some(entry) = entries.next().await {
            let entry = entry?;
            for parent in &entry.commit.parents {
                if parent.is_root() || session.contains_key(parent) {
                    continue;
                }
                if !self.storage.has_commit(*parent).await? {
                    return Err(NodeError::UnexpectedCommit(entry.commit_id));
                }
            }
            if let Some(head) = entry.head {
                new_heads.insert(head);
            }
            session.insert(entry.commit_id, entry.commit);
        }
        debug!(repo = %repo, commits = session.len(), heads = new_heads.len(), "upload accepted");
        self.ensure_repository(repo);
        for (id, commit) in session {
            self.storage.save_commit(id, commit).await?;
        }
        self.storage.mark_complete_commits().await?;
        self.save_heads_local(repo, new_heads).await
    }

    async fn fetch_from(&self, repo: &RepoId, master: Arc<dyn GlobalOTNode>) -> Result<()> {
        trace!(repo = %repo, "fetching from master");
        let info = self.local_heads_info(repo).await?;
        let entries = master.download(repo, info.required, info.existing).await?;
        self.upload_local(repo, entries, BTreeSet::new()).await
    }

    async fn push_to(&self, repo: &RepoId, master: Arc<dyn GlobalOTNode>) -> Result<()> {
        trace!(repo = %repo, "pushing to master");
        let info = master.get_heads_info(repo).await?;
        let entries = self.download(repo, info.required, info.existing).await?;
        master.upload(repo, entries, BTreeSet::new()).await
    }

    /// Sends snapshots the masters lack.
    pub async fn push_snapshots(&self, repo: &RepoId) -> Result<()> {
        self.for_each_master(repo, |master| async move {
            let remote = master.list_snapshots(repo, BTreeSet::new()).await?;
            for id in self.storage.list_snapshot_ids(repo).await? {
                if remote.contains(&id) {
                    continue;
                }
                if let Some(snapshot) = self.storage.load_snapshot(repo, id).await? {
                    master.save_snapshot(repo, snapshot).await?;
                }
            }
            Ok(())
        })
        .await
    }

    /// Sends pull requests the masters lack.
    pub async fn push_pull_requests(&self, repo: &RepoId) -> Result<()> {
        self.for_each_master(repo, |master| async move {
            let remote = master.get_pull_requests(repo).await?;
            for pull_request in self.storage.get_pull_requests(repo).await? {
                if !remote.contains(&pull_request) {
                    master.send_pull_request(pull_request).await?;
                }
            }
            Ok(())
        })
        .await
    }

    fn known_repositories(&self) -> Vec<RepoId> {
        self.namespaces
            .lock()
            .values()
            .flat_map(Namespace::repositories)
            .map(|entry| entry.repo.clone())
            .collect()
    }

    /// Fetches every repository this node has seen; failures are logged.
    pub async fn fetch_all(&self) {
        for repo in self.known_repositories() {
            if let Err(error) = self.fetch(&repo).await {
                warn!(repo = %repo, %error, "fetch failed");
            }
        }
    }

    /// Pushes commits, snapshots and pull requests of every repository
    /// this node has seen; failures are logged.
    pub async fn push_all(&self) {
        for repo in self.known_repositories() {
            if let Err(error) = self.push(&repo).await {
                warn!(repo = %repo, %error, "push failed");
            }
            if let Err(error) = self.push_snapshots(&repo).await {
                warn!(repo = %repo, %error, "pushing snapshots failed");
            }
            if let Err(error) = self.push_pull_requests(&repo).await {
                warn!(repo = %repo, %error, "pushing pull requests failed");
            }
        }
    }
}

#[async_trait]
impl GlobalOTNode for LocalGlobalOTNode {
    async fn list(&self, pub_key: PubKey) -> Result<BTreeSet<String>> {
        self.ensure_masters(&pub_key).await;
        let fresh = self
            .namespaces
            .lock()
            .get(&pub_key)
            .is_some_and(|namespace| namespace.repositories_fresh(self.config.latency_margin));
        if !self.is_master_for(&pub_key) && !fresh {
            let mut names = BTreeSet::new();
            for master in self.ensure_masters(&pub_key).await {
                match master.list(pub_key).await {
                    Ok(listed) => {
                        names = listed;
                        break;
                    }
                    Err(error) => debug!(key = ?pub_key, %error, "listing on master failed"),
                }
            }
            let mut namespaces = self.namespaces.lock();
            let namespace = namespaces.entry(pub_key).or_insert_with(Namespace::new);
            for name in names {
                namespace.ensure_repository(&RepoId::new(pub_key, name));
            }
            namespace.touch_repositories();
        }
        let mut names = self.storage.list_repositories(pub_key).await?;
        if let Some(namespace) = self.namespaces.lock().get(&pub_key) {
            names.extend(namespace.repositories().map(|entry| entry.repo.name.clone()));
        }
        Ok(names)
    }

    async fn save(&self, repo: &RepoId, commits: BTreeMap<CommitId, RawCommit>) -> Result<()> {
        self.ensure_repository(repo);
        let mut saved_any = false;
        for (id, commit) in &commits {
            saved_any |= self.storage.save_commit(*id, commit.clone()).await?;
        }
        if !saved_any {
            return Ok(());
        }
        self.storage.mark_complete_commits().await?;
        let commits = &commits;
        self.to_master(repo, |master| async move { master.save(repo, commits.clone()).await })
            .await;
        Ok(())
    }

    async fn save_heads(&self, repo: &RepoId, heads: BTreeSet<SignedHead>) -> Result<()> {
        if heads.is_empty() {
            return Ok(());
        }
        self.save_heads_local(repo, heads.clone()).await?;
        let heads = &heads;
        self.to_master(repo, |master| async move { master.save_heads(repo, heads.clone()).await })
            .await;
        Ok(())
    }

    async fn load_commit(&self, repo: &RepoId, id: CommitId) -> Result<RawCommit> {
        self.get_commit(repo, id)
            .await?
            .ok_or(NodeError::CommitNotFound(id))
    }

    async fn has_commit(&self, _repo: &RepoId, id: CommitId) -> Result<bool> {
        Ok(self.storage.has_commit(id).await?)
    }

    async fn get_heads_info(&self, repo: &RepoId) -> Result<HeadsInfo> {
        self.ensure_masters(&repo.owner).await;
        if !self.is_master_for(&repo.owner) {
            self.update_heads(repo).await?;
        }
        self.local_heads_info(repo).await
    }

    async fn get_heads(&self, repo: &RepoId) -> Result<BTreeSet<SignedHead>> {
        self.ensure_masters(&repo.owner).await;
        if !self.is_master_for(&repo.owner) {
            self.update_heads(repo).await?;
        }
        Ok(self.storage.get_heads(repo).await?.into_values().collect())
    }

    async fn poll_heads(
        &self,
        repo: &RepoId,
        known: BTreeSet<CommitId>,
    ) -> Result<BTreeSet<SignedHead>> {
        let entry = self.ensure_repository(repo);
        let mut changed = entry.subscribe_heads();
        loop {
            let heads = self.storage.get_heads(repo).await?;
            if heads.keys().any(|id| !known.contains(id)) {
                return Ok(heads.into_values().collect());
            }
            changed
                .changed()
                .await
                .map_err(|_| NodeError::Unavailable("heads channel closed".into()))?;
        }
    }

    async fn download(
        &self,
        repo: &RepoId,
        required: BTreeSet<CommitId>,
        existing: BTreeSet<CommitId>,
    ) -> Result<EntryStream> {
        if !required.is_disjoint(&existing) {
            return Err(NodeError::InvalidArgument(
                "required and existing commits overlap".into(),
            ));
        }
        self.ensure_repository(repo);
        let heads = self.storage.get_heads(repo).await?;
        let mut skip = existing.clone();
        let mut queue = BinaryHeap::new();
        let mut queued = HashSet::new();
        let mut commits = HashMap::new();
        let start: BTreeSet<CommitId> = heads
            .keys()
            .chain(&required)
            .chain(&existing)
            .copied()
            .collect();
        for id in start {
            if let Some(commit) = self.get_commit(repo, id).await? {
                commits.insert(id, commit);
                queued.insert(id);
                queue.push(id);
            }
        }
        let mut selected = Vec::new();
        while queue.iter().any(|id| !skip.contains(id)) {
            let Some(id) = queue.pop() else {
                break;
            };
            let skipped = skip.remove(&id);
            let Some(commit) = commits.remove(&id) else {
                continue;
            };
            for parent in &commit.parents {
                if existing.contains(parent) {
                    continue;
                }
                if queued.contains(parent) {
                    // Reachable from a selected commit, so it must be sent too.
                    if !skipped {
                        skip.remove(parent);
                    }
                    continue;
                }
                if let Some(parent_commit) = self.get_commit(repo, *parent).await? {
                    if skipped && !required.contains(parent) {
                        skip.insert(*parent);
                    }
                    commits.insert(*parent, parent_commit);
                    queued.insert(*parent);
                    queue.push(*parent);
                }
            }
            if !skipped {
                selected.push((id, commit));
            }
        }
        debug!(repo = %repo, commits = selected.len(), "download selected");
        let entries: Vec<Result<CommitEntry>> = selected
            .into_iter()
            .rev()
            .map(|(id, commit)| {
                let entry = CommitEntry::new(id, commit);
                Ok(match heads.get(&id) {
                    Some(head) => entry.with_head(head.clone()),
                    None => entry,
                })
            })
            .collect();
        Ok(stream::iter(entries).boxed())
    }

    async fn upload(
        &self,
        repo: &RepoId,
        entries: EntryStream,
        heads: BTreeSet<SignedHead>,
    ) -> Result<()> {
        self.ensure_masters(&repo.owner).await;
        self.upload_local(repo, entries, heads).await?;
        if !self.is_master_for(&repo.owner) {
            if let Err(error) = self.push(repo).await {
                warn!(repo = %repo, %error, "relaying upload to masters failed");
            }
        }
        Ok(())
    }

    async fn save_snapshot(&self, repo: &RepoId, snapshot: SignedSnapshot) -> Result<()> {
        self.ensure_repository(repo);
        if !self.storage.save_snapshot(snapshot.clone()).await? {
            return Ok(());
        }
        let snapshot = &snapshot;
        self.to_master(repo, |master| async move {
            master.save_snapshot(repo, snapshot.clone()).await
        })
        .await;
        Ok(())
    }

    async fn load_snapshot(&self, repo: &RepoId, id: CommitId) -> Result<Option<SignedSnapshot>> {
        if let Some(snapshot) = self.storage.load_snapshot(repo, id).await? {
            return Ok(Some(snapshot));
        }
        let snapshot = self
            .from_master(repo, |master| async move { master.load_snapshot(repo, id).await })
            .await
            .flatten();
        if let Some(snapshot) = &snapshot {
            self.storage.save_snapshot(snapshot.clone()).await?;
        }
        Ok(snapshot)
    }

    async fn list_snapshots(
        &self,
        repo: &RepoId,
        known: BTreeSet<CommitId>,
    ) -> Result<BTreeSet<CommitId>> {
        self.ensure_masters(&repo.owner).await;
        if !self.is_master_for(&repo.owner) {
            self.update_snapshots(repo).await?;
        }
        let local = self.storage.list_snapshot_ids(repo).await?;
        Ok(local.difference(&known).copied().collect())
    }

    async fn send_pull_request(&self, pull_request: SignedPullRequest) -> Result<()> {
        let repo = pull_request.value().repository.clone();
        self.ensure_repository(&repo);
        if !self.storage.save_pull_request(pull_request.clone()).await? {
            return Ok(());
        }
        let pull_request = &pull_request;
        self.to_master(&repo, |master| async move {
            master.send_pull_request(pull_request.clone()).await
        })
        .await;
        Ok(())
    }

    async fn get_pull_requests(&self, repo: &RepoId) -> Result<BTreeSet<SignedPullRequest>> {
        self.ensure_masters(&repo.owner).await;
        if !self.is_master_for(&repo.owner) {
            self.update_pull_requests(repo).await?;
        }
        Ok(self.storage.get_pull_requests(repo).await?)
    }

    async fn fetch(&self, repo: &RepoId) -> Result<()> {
        self.ensure_repository(repo);
        self.for_each_master(repo, |master| self.fetch_from(repo, master))
            .await
    }

    async fn push(&self, repo: &RepoId) -> Result<()> {
        self.ensure_repository(repo);
        self.for_each_master(repo, |master| self.push_to(repo, master))
            .await
    }
}
