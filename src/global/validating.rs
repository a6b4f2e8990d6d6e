//! Integrity checks around an untrusted [`GlobalOTNode`].
//!
//! Every commit is checked against its content address, heads and
//! snapshots against the signature of the repository owner and pull
//! requests against the signature of the fork owner, both on the way in
//! and on the way out. A rejected request reaches the
//! wrapped node either not at all or as a failed upload session, so nothing
//! of it is persisted.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream;
use futures::StreamExt;
use tracing::warn;

use super::keys::PubKey;
use super::node::EntryStream;
use super::node::GlobalOTNode;
use super::node::NodeError;
use super::node::Result;
use super::types::CommitEntry;
use super::types::CommitId;
use super::types::HeadsInfo;
use super::types::RawCommit;
use super::types::RepoId;
use super::types::SignedHead;
use super::types::SignedPullRequest;
use super::types::SignedSnapshot;

fn check_commit_id(id: CommitId, commit: &RawCommit) -> Result<()> {
    match commit.commit_id()? == id {
        true => Ok(()),
        false => Err(NodeError::InvalidCommitId(id)),
    }
}

fn check_head(repo: &RepoId, head: &SignedHead) -> Result<()> {
    if head.value().repo_id != *repo {
        return Err(NodeError::InvalidRepository(repo.clone()));
    }
    if !head.verify(&repo.owner) {
        return Err(NodeError::InvalidSignature);
    }
    Ok(())
}

fn check_snapshot(repo: &RepoId, snapshot: &SignedSnapshot) -> Result<()> {
    if snapshot.value().repo_id != *repo {
        return Err(NodeError::InvalidRepository(repo.clone()));
    }
    if !snapshot.verify(&repo.owner) {
        return Err(NodeError::InvalidSignature);
    }
    Ok(())
}

fn check_pull_request(pull_request: &SignedPullRequest) -> Result<()> {
    match pull_request.verify(&pull_request.value().fork.owner) {
        true => Ok(()),
        false => Err(NodeError::InvalidSignature),
    }
}

/// Tracks a download: every parent of a received commit must be received
/// as well or be known to the receiver.
struct DownloadCheck {
    existing: BTreeSet<CommitId>,
    received: HashSet<CommitId>,
    missing: BTreeSet<CommitId>,
    done: bool,
}

impl DownloadCheck {
    fn accept(&mut self, entry: &CommitEntry) -> Result<()> {
        if entry.commit.commit_id()? != entry.commit_id {
            return Err(NodeError::CommitIdException(entry.commit_id));
        }
        self.missing.remove(&entry.commit_id);
        self.received.insert(entry.commit_id);
        for parent in &entry.commit.parents {
            if parent.is_root() || self.received.contains(parent) || self.existing.contains(parent) {
                continue;
            }
            self.missing.insert(*parent);
        }
        Ok(())
    }
}

/// Tracks an upload session against what the wrapped node already has.
struct UploadCheck {
    node: Arc<dyn GlobalOTNode>,
    repo: RepoId,
    received: HashSet<CommitId>,
    done: bool,
}

impl UploadCheck {
    async fn accept(&mut self, entry: &CommitEntry) -> Result<()> {
        check_commit_id(entry.commit_id, &entry.commit)?;
        if let Some(head) = &entry.head {
            check_head(&self.repo, head)?;
        }
        for parent in &entry.commit.parents {
            if parent.is_root() || self.received.contains(parent) {
                continue;
            }
            if !self.node.has_commit(&self.repo, *parent).await? {
                return Err(NodeError::UnexpectedCommit(entry.commit_id));
            }
        }
        self.received.insert(entry.commit_id);
        Ok(())
    }
}

pub struct ValidatingGlobalOTNode {
    node: Arc<dyn GlobalOTNode>,
}

impl ValidatingGlobalOTNode {
    pub fn new(node: Arc<dyn GlobalOTNode>) -> Self {
        Self { node }
    }

    pub fn inner(&self) -> &Arc<dyn GlobalOTNode> {
        &self.node
    }
}

#[async_trait]
impl GlobalOTNode for ValidatingGlobalOTNode {
    async fn list(&self, pub_key: PubKey) -> Result<BTreeSet<String>> {
        self.node.list(pub_key).await
    }

    async fn save(&self, repo: &RepoId, commits: BTreeMap<CommitId, RawCommit>) -> Result<()> {
        for (id, commit) in &commits {
            check_commit_id(*id, commit)?;
        }
        self.node.save(repo, commits).await
    }

    async fn save_heads(&self, repo: &RepoId, heads: BTreeSet<SignedHead>) -> Result<()> {
        for head in &heads {
            check_head(repo, head)?;
        }
        self.node.save_heads(repo, heads).await
    }

    async fn load_commit(&self, repo: &RepoId, id: CommitId) -> Result<RawCommit> {
        let commit = self.node.load_commit(repo, id).await?;
        check_commit_id(id, &commit)?;
        Ok(commit)
    }

    async fn has_commit(&self, repo: &RepoId, id: CommitId) -> Result<bool> {
        self.node.has_commit(repo, id).await
    }

    async fn get_heads_info(&self, repo: &RepoId) -> Result<HeadsInfo> {
        self.node.get_heads_info(repo).await
    }

    async fn get_heads(&self, repo: &RepoId) -> Result<BTreeSet<SignedHead>> {
        let heads = self.node.get_heads(repo).await?;
        for head in &heads {
            check_head(repo, head)?;
        }
        Ok(heads)
    }

    async fn poll_heads(
        &self,
        repo: &RepoId,
        known: BTreeSet<CommitId>,
    ) -> Result<BTreeSet<SignedHead>> {
        let heads = self.node.poll_heads(repo, known).await?;
        for head in &heads {
            check_head(repo, head)?;
        }
        Ok(heads)
    }

    async fn download(
        &self,
        repo: &RepoId,
        required: BTreeSet<CommitId>,
        existing: BTreeSet<CommitId>,
    ) -> Result<EntryStream> {
        let entries = self.node.download(repo, required, existing.clone()).await?;
        let check = DownloadCheck {
            existing,
            received: HashSet::new(),
            missing: BTreeSet::new(),
            done: false,
        };
        let checked = stream::unfold((entries, check), |(mut entries, mut check)| async move {
            if check.done {
                return None;
            }
            let item = match entries.next().await {
                Some(Ok(entry)) => check.accept(&entry).map(|()| entry),
                Some(Err(error)) => Err(error),
                None if check.missing.is_empty() => return None,
                None => {
                    warn!(missing = ?check.missing, "download ended with missing parents");
                    Err(NodeError::UnexpectedEndOfStream)
                }
            };
            check.done = item.is_err();
            Some((item, (entries, check)))
        });
        Ok(checked.boxed())
    }

    async fn upload(
        &self,
        repo: &RepoId,
        entries: EntryStream,
        heads: BTreeSet<SignedHead>,
    ) -> Result<()> {
        for head in &heads {
            check_head(repo, head)?;
        }
        let check = UploadCheck {
            node: self.node.clone(),
            repo: repo.clone(),
            received: HashSet::new(),
            done: false,
        };
        let checked = stream::unfold((entries, check), |(mut entries, mut check)| async move {
            if check.done {
                return None;
            }
            let item = match entries.next().await? {
                Ok(entry) => check.accept(&entry).await.map(|()| entry),
                Err(error) => Err(error),
            };
            check.done = item.is_err();
            Some((item, (entries, check)))
        });
        self.node.upload(repo, checked.boxed(), heads).await
    }

    async fn save_snapshot(&self, repo: &RepoId, snapshot: SignedSnapshot) -> Result<()> {
        check_snapshot(repo, &snapshot)?;
        self.node.save_snapshot(repo, snapshot).await
    }

    async fn load_snapshot(&self, repo: &RepoId, id: CommitId) -> Result<Option<SignedSnapshot>> {
        let snapshot = self.node.load_snapshot(repo, id).await?;
        if let Some(snapshot) = &snapshot {
            check_snapshot(repo, snapshot)?;
        }
        Ok(snapshot)
    }

    async fn list_snapshots(
        &self,
        repo: &RepoId,
        known: BTreeSet<CommitId>,
    ) -> Result<BTreeSet<CommitId>> {
        self.node.list_snapshots(repo, known).await
    }

    async fn send_pull_request(&self, pull_request: SignedPullRequest) -> Result<()> {
        check_pull_request(&pull_request)?;
        self.node.send_pull_request(pull_request).await
    }

    async fn get_pull_requests(&self, repo: &RepoId) -> Result<BTreeSet<SignedPullRequest>> {
        let pull_requests = self.node.get_pull_requests(repo).await?;
        for pull_request in &pull_requests {
            if pull_request.value().repository != *repo {
                return Err(NodeError::InvalidRepository(repo.clone()));
            }
            check_pull_request(pull_request)?;
        }
        Ok(pull_requests)
    }

    async fn fetch(&self, repo: &RepoId) -> Result<()> {
        self.node.fetch(repo).await
    }

    async fn push(&self, repo: &RepoId) -> Result<()> {
        self.node.push(repo).await
    }
}
