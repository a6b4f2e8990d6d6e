//! Operational transformation over a commit graph.
//!
//! A replica records the operations it applies as commits: every commit
//! stores, per parent, the diffs leading from that parent to it. Replicas
//! that diverge are reconciled by loading enough of the graph to find a
//! common frontier and transforming the branches against each other (see
//! [`OTLoadedGraph::merge`]). No commit is ever rewritten; merges add new
//! commits on top of the heads.
//!
//! The pieces, bottom up:
//! - [`OTSystem`] is the operation algebra supplied by the application.
//! - [`OTRepository`] stores commits and heads.
//! - [`OTAlgorithms`] answers graph queries and merges heads.
//! - [`OTStateManager`] keeps a local state in sync with a repository.

pub mod algorithms;
pub mod commit;
pub mod graph;
pub mod memoryrepo;
pub mod reducer;
pub mod repository;
pub mod state;
pub mod system;

pub use algorithms::AlgorithmError;
pub use algorithms::FindResult;
pub use algorithms::OTAlgorithms;
pub use commit::OTCommit;
pub use graph::GraphError;
pub use graph::GraphNode;
pub use graph::OTLoadedGraph;
pub use memoryrepo::OTRepositoryStub;
pub use memoryrepo::StubError;
pub use memoryrepo::StubOp;
pub use reducer::DiffsReducer;
pub use reducer::GraphReducer;
pub use reducer::ToList;
pub use reducer::ToSquashedList;
pub use reducer::ToVoid;
pub use reducer::Walk;
pub use repository::CommitKey;
pub use repository::CommitOf;
pub use repository::OTRepository;
pub use state::OTState;
pub use state::OTStateManager;
pub use state::StateError;
pub use system::MergedDiff;
pub use system::MergedOTSystem;
pub use system::OTSystem;
pub use system::TransformError;
pub use system::TransformResult;
