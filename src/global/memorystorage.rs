use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::collections::HashMap;
use std::collections::HashSet;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::keys::PubKey;
use super::storage::CommitStorage;
use super::types::CommitId;
use super::types::RawCommit;
use super::types::RepoId;
use super::types::SignedHead;
use super::types::SignedPullRequest;
use super::types::SignedSnapshot;

#[derive(Default)]
struct Tables {
    commits: HashMap<CommitId, RawCommit>,
    complete: HashSet<CommitId>,
    heads: BTreeMap<RepoId, BTreeMap<CommitId, SignedHead>>,
    snapshots: BTreeMap<RepoId, BTreeMap<CommitId, SignedSnapshot>>,
    pull_requests: BTreeMap<RepoId, BTreeSet<SignedPullRequest>>,
}

impl Tables {
    fn is_complete(&self, id: &CommitId) -> bool {
        id.is_root() || self.complete.contains(id)
    }
}

/// In-memory [`CommitStorage`].
#[derive(Default)]
pub struct CommitStorageStub {
    tables: Mutex<Tables>,
}

impl CommitStorageStub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn commit_count(&self) -> usize {
        self.tables.lock().commits.len()
    }
}

#[async_trait]
impl CommitStorage for CommitStorageStub {
    async fn list_repositories(&self, owner: PubKey) -> anyhow::Result<BTreeSet<String>> {
        let tables = self.tables.lock();
        Ok(tables
            .heads
            .keys()
            .chain(tables.snapshots.keys())
            .filter(|repo| repo.owner == owner)
            .map(|repo| repo.name.clone())
            .collect())
    }

    async fn has_commit(&self, id: CommitId) -> anyhow::Result<bool> {
        Ok(id.is_root() || self.tables.lock().commits.contains_key(&id))
    }

    async fn load_commit(&self, id: CommitId) -> anyhow::Result<Option<RawCommit>> {
        Ok(self.tables.lock().commits.get(&id).cloned())
    }

    async fn save_commit(&self, id: CommitId, commit: RawCommit) -> anyhow::Result<bool> {
        let mut tables = self.tables.lock();
        if tables.commits.contains_key(&id) {
            return Ok(false);
        }
        tables.commits.insert(id, commit);
        Ok(true)
    }

    async fn get_heads(&self, repo: &RepoId) -> anyhow::Result<BTreeMap<CommitId, SignedHead>> {
        Ok(self
            .tables
            .lock()
            .heads
            .get(repo)
            .cloned()
            .unwrap_or_default())
    }

    async fn update_heads(
        &self,
        repo: &RepoId,
        new: BTreeSet<SignedHead>,
        excluded: BTreeSet<CommitId>,
    ) -> anyhow::Result<()> {
        let mut tables = self.tables.lock();
        let heads = tables.heads.entry(repo.clone()).or_default();
        for id in &excluded {
            heads.remove(id);
        }
        for head in new {
            heads.insert(head.value().commit_id, head);
        }
        Ok(())
    }

    async fn load_snapshot(
        &self,
        repo: &RepoId,
        id: CommitId,
    ) -> anyhow::Result<Option<SignedSnapshot>> {
        Ok(self
            .tables
            .lock()
            .snapshots
            .get(repo)
            .and_then(|snapshots| snapshots.get(&id))
            .cloned())
    }

    async fn save_snapshot(&self, snapshot: SignedSnapshot) -> anyhow::Result<bool> {
        let mut tables = self.tables.lock();
        let raw = snapshot.value();
        let snapshots = tables.snapshots.entry(raw.repo_id.clone()).or_default();
        if snapshots.contains_key(&raw.commit_id) {
            return Ok(false);
        }
        snapshots.insert(raw.commit_id, snapshot);
        Ok(true)
    }

    async fn list_snapshot_ids(&self, repo: &RepoId) -> anyhow::Result<BTreeSet<CommitId>> {
        Ok(self
            .tables
            .lock()
            .snapshots
            .get(repo)
            .map(|snapshots| snapshots.keys().copied().collect())
            .unwrap_or_default())
    }

    async fn get_pull_requests(
        &self,
        repo: &RepoId,
    ) -> anyhow::Result<BTreeSet<SignedPullRequest>> {
        Ok(self
            .tables
            .lock()
            .pull_requests
            .get(repo)
            .cloned()
            .unwrap_or_default())
    }

    async fn save_pull_request(&self, pull_request: SignedPullRequest) -> anyhow::Result<bool> {
        let mut tables = self.tables.lock();
        let repo = pull_request.value().repository.clone();
        Ok(tables.pull_requests.entry(repo).or_default().insert(pull_request))
    }

    async fn is_complete_commit(&self, id: CommitId) -> anyhow::Result<bool> {
        Ok(self.tables.lock().is_complete(&id))
    }

    async fn mark_complete_commits(&self) -> anyhow::Result<()> {
        let mut tables = self.tables.lock();
        loop {
            let newly: Vec<CommitId> = tables
                .commits
                .iter()
                .filter(|(id, _)| !tables.complete.contains(id))
                .filter(|(_, commit)| commit.parents.iter().all(|p| tables.is_complete(p)))
                .map(|(id, _)| *id)
                .collect();
            if newly.is_empty() {
                return Ok(());
            }
            tables.complete.extend(newly);
        }
    }
}
