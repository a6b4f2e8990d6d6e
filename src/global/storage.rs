use std::collections::BTreeMap;
use std::collections::BTreeSet;

use async_trait::async_trait;

use super::keys::PubKey;
use super::types::CommitId;
use super::types::RawCommit;
use super::types::RepoId;
use super::types::SignedHead;
use super::types::SignedPullRequest;
use super::types::SignedSnapshot;

/// Persistence behind a node.
///
/// A commit is *complete* once it and all of its ancestors are stored.
/// The virtual root counts as stored and complete.
#[async_trait]
pub trait CommitStorage: Send + Sync {
    async fn list_repositories(&self, owner: PubKey) -> anyhow::Result<BTreeSet<String>>;

    async fn has_commit(&self, id: CommitId) -> anyhow::Result<bool>;

    async fn load_commit(&self, id: CommitId) -> anyhow::Result<Option<RawCommit>>;

    /// Returns `false` when the commit was already stored.
    async fn save_commit(&self, id: CommitId, commit: RawCommit) -> anyhow::Result<bool>;

    async fn get_heads(&self, repo: &RepoId) -> anyhow::Result<BTreeMap<CommitId, SignedHead>>;

    /// Adds `new` heads and drops the heads listed in `excluded`.
    async fn update_heads(
        &self,
        repo: &RepoId,
        new: BTreeSet<SignedHead>,
        excluded: BTreeSet<CommitId>,
    ) -> anyhow::Result<()>;

    async fn load_snapshot(
        &self,
        repo: &RepoId,
        id: CommitId,
    ) -> anyhow::Result<Option<SignedSnapshot>>;

    async fn save_snapshot(&self, snapshot: SignedSnapshot) -> anyhow::Result<bool>;

    async fn list_snapshot_ids(&self, repo: &RepoId) -> anyhow::Result<BTreeSet<CommitId>>;

    async fn get_pull_requests(
        &self,
        repo: &RepoId,
    ) -> anyhow::Result<BTreeSet<SignedPullRequest>>;

    async fn save_pull_request(&self, pull_request: SignedPullRequest) -> anyhow::Result<bool>;

    async fn is_complete_commit(&self, id: CommitId) -> anyhow::Result<bool>;

    /// Marks every stored commit whose parents are all complete as
    /// complete, until nothing changes.
    async fn mark_complete_commits(&self) -> anyhow::Result<()>;
}
