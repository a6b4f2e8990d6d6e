use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;
use parking_lot::RwLock;
use thiserror::Error;

use super::crypto::CryptoError;
use super::discovery::DiscoveryError;
use super::keys::PubKey;
use super::types::CommitEntry;
use super::types::CommitId;
use super::types::HeadsInfo;
use super::types::RawCommit;
use super::types::RawServerId;
use super::types::RepoId;
use super::types::SignedHead;
use super::types::SignedPullRequest;
use super::types::SignedSnapshot;

#[derive(Debug, Error)]
pub enum NodeError {
    #[error("commit id {0} does not match the commit contents")]
    InvalidCommitId(CommitId),
    #[error("invalid signature")]
    InvalidSignature,
    #[error("data belongs to another repository than {0}")]
    InvalidRepository(RepoId),
    #[error("commit {0} has a parent that was never sent")]
    UnexpectedCommit(CommitId),
    #[error("stream ended while parents of sent commits are missing")]
    UnexpectedEndOfStream,
    #[error("received commit {0} whose id does not match its contents")]
    CommitIdException(CommitId),
    #[error("commit {0} not found")]
    CommitNotFound(CommitId),
    #[error("no masters known for {0:?}")]
    NoMasters(PubKey),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("storage failed: {0}")]
    Storage(#[from] anyhow::Error),
    #[error("encoding failed: {0}")]
    Encoding(#[from] postcard::Error),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error(transparent)]
    Discovery(#[from] DiscoveryError),
    #[error("node unavailable: {0}")]
    Unavailable(String),
}

impl NodeError {
    /// Whether repeating the request may succeed.
    ///
    /// Rejected data stays rejected, so validation failures are final.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            NodeError::Storage(_)
                | NodeError::Discovery(_)
                | NodeError::Unavailable(_)
                | NodeError::CommitNotFound(_)
                | NodeError::NoMasters(_)
        )
    }
}

pub type Result<T, E = NodeError> = std::result::Result<T, E>;

/// Commits in transit, parents before children.
pub type EntryStream = BoxStream<'static, Result<CommitEntry>>;

/// The replication protocol spoken between nodes and by clients.
#[async_trait]
pub trait GlobalOTNode: Send + Sync {
    /// Names of the repositories owned by `pub_key`.
    async fn list(&self, pub_key: PubKey) -> Result<BTreeSet<String>>;

    async fn save(&self, repo: &RepoId, commits: BTreeMap<CommitId, RawCommit>) -> Result<()>;

    async fn save_heads(&self, repo: &RepoId, heads: BTreeSet<SignedHead>) -> Result<()>;

    async fn load_commit(&self, repo: &RepoId, id: CommitId) -> Result<RawCommit>;

    /// Whether the commit is in this node's own storage.
    async fn has_commit(&self, repo: &RepoId, id: CommitId) -> Result<bool>;

    async fn get_heads_info(&self, repo: &RepoId) -> Result<HeadsInfo>;

    async fn get_heads(&self, repo: &RepoId) -> Result<BTreeSet<SignedHead>>;

    /// Resolves once a head outside `known` is present.
    async fn poll_heads(
        &self,
        repo: &RepoId,
        known: BTreeSet<CommitId>,
    ) -> Result<BTreeSet<SignedHead>>;

    /// Streams the commits a peer holding `existing` needs to reach
    /// `required` and this node's heads.
    async fn download(
        &self,
        repo: &RepoId,
        required: BTreeSet<CommitId>,
        existing: BTreeSet<CommitId>,
    ) -> Result<EntryStream>;

    /// Accepts a session of commits; nothing is persisted unless the whole
    /// stream is accepted.
    async fn upload(
        &self,
        repo: &RepoId,
        entries: EntryStream,
        heads: BTreeSet<SignedHead>,
    ) -> Result<()>;

    async fn save_snapshot(&self, repo: &RepoId, snapshot: SignedSnapshot) -> Result<()>;

    async fn load_snapshot(&self, repo: &RepoId, id: CommitId) -> Result<Option<SignedSnapshot>>;

    /// Ids of snapshots this node has beyond `known`.
    async fn list_snapshots(
        &self,
        repo: &RepoId,
        known: BTreeSet<CommitId>,
    ) -> Result<BTreeSet<CommitId>>;

    async fn send_pull_request(&self, pull_request: SignedPullRequest) -> Result<()>;

    async fn get_pull_requests(&self, repo: &RepoId) -> Result<BTreeSet<SignedPullRequest>>;

    /// Pulls commits from the masters of `repo`.
    async fn fetch(&self, repo: &RepoId) -> Result<()>;

    /// Pushes local commits to the masters of `repo`.
    async fn push(&self, repo: &RepoId) -> Result<()>;
}

/// Resolves server ids to nodes.
pub trait NodeFactory: Send + Sync {
    fn create(&self, server: &RawServerId) -> Option<Arc<dyn GlobalOTNode>>;
}

/// In-process [`NodeFactory`] backed by an explicit table.
#[derive(Default)]
pub struct NodeRegistry {
    nodes: RwLock<HashMap<RawServerId, Arc<dyn GlobalOTNode>>>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, server: RawServerId, node: Arc<dyn GlobalOTNode>) {
        self.nodes.write().insert(server, node);
    }

    pub fn unregister(&self, server: &RawServerId) -> Option<Arc<dyn GlobalOTNode>> {
        self.nodes.write().remove(server)
    }
}

impl NodeFactory for NodeRegistry {
    fn create(&self, server: &RawServerId) -> Option<Arc<dyn GlobalOTNode>> {
        self.nodes.read().get(server).cloned()
    }
}
