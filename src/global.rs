//! Replication of commit graphs between nodes.
//!
//! Repositories belong to the owner of a key. Nodes listed for that key in
//! discovery are its *masters* and hold the authoritative copy; every other
//! node relays requests to them and caches what passes through. Commits
//! travel encrypted and content addressed ([`types::CommitId`]), heads and
//! snapshots travel signed by the owner, so a client needs to trust neither
//! relays nor masters: [`ValidatingGlobalOTNode`] checks everything it
//! passes on.
//!
//! [`OTDriver`] and [`OTRepositoryAdapter`] connect this layer to
//! [`crate::ot`]: the adapter is an [`OTRepository`](crate::ot::OTRepository)
//! whose commits live on a [`GlobalOTNode`].

pub mod adapter;
pub mod crypto;
pub mod discovery;
pub mod driver;
pub mod keys;
pub mod localnode;
pub mod memorystorage;
mod namespace;
pub mod node;
pub mod storage;
pub mod types;
pub mod validating;

pub use adapter::OTRepositoryAdapter;
pub use crypto::EncryptedData;
pub use crypto::SimKey;
pub use crypto::SimKeyHash;
pub use discovery::DiscoveryService;
pub use discovery::LocalDiscoveryService;
pub use driver::DriverError;
pub use driver::OTDriver;
pub use keys::KeyPair;
pub use keys::PubKey;
pub use keys::SignedData;
pub use localnode::LocalGlobalOTNode;
pub use memorystorage::CommitStorageStub;
pub use node::EntryStream;
pub use node::GlobalOTNode;
pub use node::NodeError;
pub use node::NodeFactory;
pub use node::NodeRegistry;
pub use storage::CommitStorage;
pub use types::AnnounceData;
pub use types::CommitEntry;
pub use types::CommitId;
pub use types::HeadsInfo;
pub use types::RawCommit;
pub use types::RawCommitHead;
pub use types::RawPullRequest;
pub use types::RawServerId;
pub use types::RawSnapshot;
pub use types::RepoId;
pub use validating::ValidatingGlobalOTNode;
