use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::fmt;

use serde::Deserialize;
use serde::Serialize;

use super::crypto::encode;
use super::crypto::EncryptedData;
use super::crypto::SimKeyHash;
use super::keys::PubKey;

/// A repository: a name in the namespace of its owner's key.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RepoId {
    pub owner: PubKey,
    pub name: String,
}

impl RepoId {
    pub fn new(owner: PubKey, name: impl Into<String>) -> Self {
        Self {
            owner,
            name: name.into(),
        }
    }
}

impl fmt::Display for RepoId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}/{}", self.owner, self.name)
    }
}

impl fmt::Debug for RepoId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RepoId({self})")
    }
}

/// Content address of a [`RawCommit`], prefixed with its level so ids
/// order parents before children.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CommitId {
    level: u64,
    hash: [u8; 32],
}

impl CommitId {
    pub fn new(level: u64, hash: [u8; 32]) -> Self {
        Self { level, hash }
    }

    /// The virtual commit every history starts from.
    pub fn root() -> Self {
        Self {
            level: 0,
            hash: [0; 32],
        }
    }

    pub fn is_root(&self) -> bool {
        *self == Self::root()
    }

    pub fn level(&self) -> u64 {
        self.level
    }

    pub fn hash(&self) -> &[u8; 32] {
        &self.hash
    }
}

impl Ord for CommitId {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.level, &self.hash).cmp(&(other.level, &other.hash))
    }
}

impl PartialOrd for CommitId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for CommitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.level, hex::encode(&self.hash[..6]))
    }
}

impl fmt::Debug for CommitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CommitId({self})")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RawCommit {
    pub epoch: u32,
    pub parents: BTreeSet<CommitId>,
    pub encrypted_diffs: EncryptedData,
    pub sim_key_hash: SimKeyHash,
    pub level: u64,
    pub timestamp: u64,
}

impl RawCommit {
    /// Recomputes the content address of this commit.
    pub fn commit_id(&self) -> Result<CommitId, postcard::Error> {
        let bytes = encode(self)?;
        Ok(CommitId::new(self.level, *blake3::hash(&bytes).as_bytes()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RawCommitHead {
    pub repo_id: RepoId,
    pub commit_id: CommitId,
    pub timestamp: u64,
}

impl RawCommitHead {
    pub fn new(repo_id: RepoId, commit_id: CommitId, timestamp: u64) -> Self {
        Self {
            repo_id,
            commit_id,
            timestamp,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RawSnapshot {
    pub repo_id: RepoId,
    pub commit_id: CommitId,
    pub encrypted_diffs: EncryptedData,
    pub sim_key_hash: SimKeyHash,
}

/// Asks the owner of `repository` to merge `fork`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RawPullRequest {
    pub repository: RepoId,
    pub fork: RepoId,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RawServerId(pub String);

impl RawServerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl fmt::Display for RawServerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Where the masters of a key can be reached.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AnnounceData {
    pub timestamp: u64,
    pub server_ids: BTreeSet<RawServerId>,
}

/// One element of a download or upload stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitEntry {
    pub commit_id: CommitId,
    pub commit: RawCommit,
    /// Set when the commit is a head on the sending side.
    pub head: Option<SignedHead>,
}

impl CommitEntry {
    pub fn new(commit_id: CommitId, commit: RawCommit) -> Self {
        Self {
            commit_id,
            commit,
            head: None,
        }
    }

    pub fn with_head(mut self, head: SignedHead) -> Self {
        self.head = Some(head);
        self
    }
}

/// Commit negotiation state: what a node has, and what it still needs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeadsInfo {
    pub existing: BTreeSet<CommitId>,
    pub required: BTreeSet<CommitId>,
}

pub type SignedHead = super::keys::SignedData<RawCommitHead>;
pub type SignedSnapshot = super::keys::SignedData<RawSnapshot>;
pub type SignedPullRequest = super::keys::SignedData<RawPullRequest>;

#[cfg(feature = "proptest")]
pub mod strategies {
    use proptest::prelude::*;

    use super::CommitId;

    /// Arbitrary non-root commit ids up to `max_level`.
    pub fn commit_id(max_level: u64) -> impl Strategy<Value = CommitId> {
        (1..=max_level, any::<[u8; 32]>()).prop_map(|(level, hash)| CommitId::new(level, hash))
    }
}
