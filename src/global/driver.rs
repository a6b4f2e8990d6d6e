//! Client side of the protocol: turns logical commits into encrypted,
//! content-addressed raw commits and signed heads, and back.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tracing::debug;
use tracing::warn;

use super::crypto::decode;
use super::crypto::encode;
use super::crypto::CryptoError;
use super::crypto::SimKey;
use super::crypto::SimKeyHash;
use super::keys::KeyPair;
use super::keys::PubKey;
use super::keys::SignedData;
use super::node::GlobalOTNode;
use super::node::NodeError;
use super::types::CommitId;
use super::types::RawCommit;
use super::types::RawCommitHead;
use super::types::RawPullRequest;
use super::types::RawSnapshot;
use super::types::RepoId;
use super::types::SignedHead;
use crate::ot::commit::now_millis;
use crate::ot::commit::OTCommit;

#[derive(Debug, Error)]
pub enum DriverError {
    #[error(transparent)]
    Node(#[from] NodeError),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error("encoding failed: {0}")]
    Encoding(#[from] postcard::Error),
    #[error("commit {commit} has {parents} parents but {diffs} diff lists")]
    DiffCountMismatch {
        commit: CommitId,
        parents: usize,
        diffs: usize,
    },
    #[error("commit {0} was not created by a driver")]
    NotSerialized(CommitId),
    #[error("snapshot of {0} is not signed by the repository owner")]
    InvalidSignature(CommitId),
}

pub type Result<T, E = DriverError> = std::result::Result<T, E>;

pub struct OTDriver {
    node: Arc<dyn GlobalOTNode>,
    keys: KeyPair,
    sim_keys: Mutex<HashMap<SimKeyHash, SimKey>>,
    current_sim_key: Mutex<SimKey>,
}

impl OTDriver {
    pub fn new(node: Arc<dyn GlobalOTNode>, keys: KeyPair, sim_key: SimKey) -> Self {
        let sim_keys = HashMap::from([(sim_key.hash(), sim_key.clone())]);
        Self {
            node,
            keys,
            sim_keys: Mutex::new(sim_keys),
            current_sim_key: Mutex::new(sim_key),
        }
    }

    pub fn node(&self) -> &Arc<dyn GlobalOTNode> {
        &self.node
    }

    pub fn pub_key(&self) -> PubKey {
        self.keys.pub_key()
    }

    /// Makes `key` available for decryption.
    pub fn add_sim_key(&self, key: SimKey) {
        self.sim_keys.lock().insert(key.hash(), key);
    }

    /// Encrypts new commits and snapshots with `key` from now on.
    pub fn change_current_sim_key(&self, key: SimKey) {
        self.add_sim_key(key.clone());
        *self.current_sim_key.lock() = key;
    }

    fn sim_key(&self, hash: &SimKeyHash) -> Result<SimKey> {
        self.sim_keys
            .lock()
            .get(hash)
            .cloned()
            .ok_or(DriverError::Crypto(CryptoError::UnknownKey(*hash)))
    }

    /// Builds an encrypted commit; nothing leaves the driver until `push`.
    ///
    /// The diffs are stored as one list per parent, in parent order.
    pub fn create_commit<D: Serialize>(
        &self,
        parent_diffs: BTreeMap<CommitId, Vec<D>>,
        level: u64,
    ) -> Result<OTCommit<CommitId, D>> {
        let key = self.current_sim_key.lock().clone();
        let diff_lists: Vec<&Vec<D>> = parent_diffs.values().collect();
        let raw = RawCommit {
            epoch: 0,
            parents: parent_diffs.keys().copied().collect(),
            encrypted_diffs: key.encrypt(&encode(&diff_lists)?)?,
            sim_key_hash: key.hash(),
            level,
            timestamp: now_millis(),
        };
        let id = raw.commit_id()?;
        let serialized = Bytes::from(encode(&raw)?);
        Ok(OTCommit::new(id, parent_diffs, level)
            .with_timestamp(raw.timestamp)
            .with_serialized(serialized))
    }

    /// Saves driver-created commits on the node without touching heads.
    pub async fn push<D>(&self, repo: &RepoId, commits: &[OTCommit<CommitId, D>]) -> Result<()> {
        let mut raw = BTreeMap::new();
        for commit in commits {
            let serialized = commit
                .serialized
                .as_ref()
                .ok_or(DriverError::NotSerialized(commit.id))?;
            raw.insert(commit.id, decode::<RawCommit>(serialized)?);
        }
        debug!(repo = %repo, commits = raw.len(), "pushing commits");
        self.node.save(repo, raw).await?;
        Ok(())
    }

    /// Signs `new` as heads of `repo`; the node retires their ancestors.
    pub async fn update_heads(&self, repo: &RepoId, new: &BTreeSet<CommitId>) -> Result<()> {
        let timestamp = now_millis();
        let heads = new
            .iter()
            .filter(|id| !id.is_root())
            .map(|id| SignedData::sign(RawCommitHead::new(repo.clone(), *id, timestamp), &self.keys))
            .collect::<Result<BTreeSet<SignedHead>, _>>()?;
        self.node.save_heads(repo, heads).await?;
        Ok(())
    }

    fn head_ids(repo: &RepoId, heads: BTreeSet<SignedHead>) -> BTreeSet<CommitId> {
        let ids: BTreeSet<CommitId> = heads
            .into_iter()
            .filter(|head| {
                let valid = head.verify(&repo.owner) && head.value().repo_id == *repo;
                if !valid {
                    warn!(repo = %repo, head = %head.value().commit_id, "ignoring invalid head");
                }
                valid
            })
            .map(|head| head.value().commit_id)
            .collect();
        match ids.is_empty() {
            true => BTreeSet::from([CommitId::root()]),
            false => ids,
        }
    }

    /// Verified heads; an empty repository has the root as its only head.
    pub async fn get_heads(&self, repo: &RepoId) -> Result<BTreeSet<CommitId>> {
        let heads = self.node.get_heads(repo).await?;
        Ok(Self::head_ids(repo, heads))
    }

    pub async fn poll_heads(
        &self,
        repo: &RepoId,
        known: BTreeSet<CommitId>,
    ) -> Result<BTreeSet<CommitId>> {
        let heads = self.node.poll_heads(repo, known).await?;
        Ok(Self::head_ids(repo, heads))
    }

    pub async fn load_commit<D: DeserializeOwned>(
        &self,
        repo: &RepoId,
        id: CommitId,
    ) -> Result<OTCommit<CommitId, D>> {
        if id.is_root() {
            return Ok(OTCommit::root(id));
        }
        let raw = self.node.load_commit(repo, id).await?;
        let key = self.sim_key(&raw.sim_key_hash)?;
        let diff_lists: Vec<Vec<D>> = decode(&key.decrypt(&raw.encrypted_diffs)?)?;
        if diff_lists.len() != raw.parents.len() {
            return Err(DriverError::DiffCountMismatch {
                commit: id,
                parents: raw.parents.len(),
                diffs: diff_lists.len(),
            });
        }
        let serialized = Bytes::from(encode(&raw)?);
        let parents = raw.parents.iter().copied().zip(diff_lists).collect();
        Ok(OTCommit::new(id, parents, raw.level)
            .with_epoch(raw.epoch)
            .with_timestamp(raw.timestamp)
            .with_serialized(serialized))
    }

    pub async fn has_commit(&self, repo: &RepoId, id: CommitId) -> Result<bool> {
        if id.is_root() {
            return Ok(true);
        }
        Ok(self.node.has_commit(repo, id).await?)
    }

    /// The root snapshot is empty; other snapshots must be signed by the
    /// repository owner.
    pub async fn load_snapshot<D: DeserializeOwned>(
        &self,
        repo: &RepoId,
        id: CommitId,
    ) -> Result<Option<Vec<D>>> {
        if id.is_root() {
            return Ok(Some(Vec::new()));
        }
        let Some(snapshot) = self.node.load_snapshot(repo, id).await? else {
            return Ok(None);
        };
        if !snapshot.verify(&repo.owner) {
            return Err(DriverError::InvalidSignature(id));
        }
        let raw = snapshot.into_value();
        let key = self.sim_key(&raw.sim_key_hash)?;
        Ok(Some(decode(&key.decrypt(&raw.encrypted_diffs)?)?))
    }

    pub async fn save_snapshot<D: Serialize>(
        &self,
        repo: &RepoId,
        id: CommitId,
        diffs: &[D],
    ) -> Result<()> {
        let key = self.current_sim_key.lock().clone();
        let raw = RawSnapshot {
            repo_id: repo.clone(),
            commit_id: id,
            encrypted_diffs: key.encrypt(&encode(diffs)?)?,
            sim_key_hash: key.hash(),
        };
        self.node
            .save_snapshot(repo, SignedData::sign(raw, &self.keys)?)
            .await?;
        Ok(())
    }

    /// Asks the owner of `repository` to merge `fork`, which must be ours.
    pub async fn send_pull_request(&self, repository: &RepoId, fork: &RepoId) -> Result<()> {
        let pull_request = RawPullRequest {
            repository: repository.clone(),
            fork: fork.clone(),
        };
        self.node
            .send_pull_request(SignedData::sign(pull_request, &self.keys)?)
            .await?;
        Ok(())
    }

    /// Forks proposed for `repo`.
    pub async fn get_pull_requests(&self, repo: &RepoId) -> Result<BTreeSet<RepoId>> {
        Ok(self
            .node
            .get_pull_requests(repo)
            .await?
            .into_iter()
            .map(|pull_request| pull_request.into_value().fork)
            .collect())
    }
}
