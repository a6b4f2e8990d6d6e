#![allow(dead_code)]

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use otsync::global::crypto::EncryptedData;
use otsync::global::crypto::SimKey;
use otsync::global::types::SignedHead;
use otsync::global::CommitId;
use otsync::global::CommitStorageStub;
use otsync::global::DiscoveryService;
use otsync::global::GlobalOTNode;
use otsync::global::KeyPair;
use otsync::global::LocalDiscoveryService;
use otsync::global::LocalGlobalOTNode;
use otsync::global::NodeFactory;
use otsync::global::NodeRegistry;
use otsync::global::RawCommit;
use otsync::global::RawCommitHead;
use otsync::global::RawServerId;
use otsync::global::RepoId;
use otsync::global::SignedData;
use otsync::global::AnnounceData;
use otsync::ot::OTCommit;
use otsync::ot::OTLoadedGraph;
use otsync::ot::OTRepositoryStub;
use otsync::ot::OTState;
use otsync::ot::OTSystem;
use otsync::ot::TransformError;
use otsync::ot::TransformResult;
use otsync::NodeConfig;
use otsync::RetryPolicy;
use serde::Deserialize;
use serde::Serialize;

/// Operations on a single integer register.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TestOp {
    Add(i64),
    Set { prev: i64, next: i64 },
}

pub fn add(delta: i64) -> TestOp {
    TestOp::Add(delta)
}

pub fn set(prev: i64, next: i64) -> TestOp {
    TestOp::Set { prev, next }
}

/// Adds commute; of two concurrent sets the larger value wins, and a set
/// always wins over an add.
#[derive(Debug, Clone, Copy, Default)]
pub struct TestOpSystem;

impl OTSystem<TestOp> for TestOpSystem {
    fn transform_op(
        &self,
        left: &TestOp,
        right: &TestOp,
    ) -> Result<TransformResult<TestOp>, TransformError> {
        use TestOp::*;
        Ok(match (left, right) {
            (Add(l), Add(r)) => TransformResult::new(vec![Add(*l)], vec![Add(*r)]),
            (Set { prev: lp, next: ln }, Set { prev: rp, next: rn }) => {
                if lp != rp {
                    return Err(TransformError::new("sets from different states"));
                }
                match ln.cmp(rn) {
                    std::cmp::Ordering::Equal => TransformResult::empty(),
                    std::cmp::Ordering::Greater => TransformResult::left_wins(vec![set(*rn, *ln)]),
                    std::cmp::Ordering::Less => TransformResult::right_wins(vec![set(*ln, *rn)]),
                }
            }
            (Add(delta), Set { prev, next }) => {
                TransformResult::right_wins(vec![set(prev + delta, *next)])
            }
            (Set { prev, next }, Add(delta)) => {
                TransformResult::left_wins(vec![set(prev + delta, *next)])
            }
        })
    }

    fn try_squash(&self, first: &TestOp, second: &TestOp) -> Option<TestOp> {
        use TestOp::*;
        Some(match (first, second) {
            (Add(a), Add(b)) => Add(a + b),
            (Set { prev, .. }, Set { next, .. }) => set(*prev, *next),
            (Add(delta), Set { prev, next }) => set(prev - delta, *next),
            (Set { prev, next }, Add(delta)) => set(*prev, next + delta),
        })
    }

    fn invert_op(&self, op: &TestOp) -> Vec<TestOp> {
        match op {
            TestOp::Add(delta) => vec![add(-delta)],
            TestOp::Set { prev, next } => vec![set(*next, *prev)],
        }
    }

    fn is_empty(&self, op: &TestOp) -> bool {
        match op {
            TestOp::Add(delta) => *delta == 0,
            TestOp::Set { prev, next } => prev == next,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TestState {
    pub value: i64,
}

impl OTState<TestOp> for TestState {
    fn init(&mut self) {
        self.value = 0;
    }

    fn apply(&mut self, op: &TestOp) {
        match op {
            TestOp::Add(delta) => self.value += delta,
            TestOp::Set { next, .. } => self.value = *next,
        }
    }
}

pub fn apply_all(value: i64, ops: &[TestOp]) -> i64 {
    let mut state = TestState { value };
    for op in ops {
        state.apply(op);
    }
    state.value
}

/// Commits of `edges` (parent, child, added value) with levels assigned
/// bottom up, parents before children.
pub fn commits_of(edges: &[(char, char, i64)]) -> Vec<OTCommit<char, TestOp>> {
    let mut parents: BTreeMap<char, BTreeMap<char, Vec<TestOp>>> = BTreeMap::new();
    for &(parent, child, delta) in edges {
        parents.entry(parent).or_default();
        parents
            .entry(child)
            .or_default()
            .insert(parent, vec![add(delta)]);
    }
    let mut levels: BTreeMap<char, u64> = BTreeMap::new();
    let mut commits = Vec::new();
    while levels.len() < parents.len() {
        for (id, node_parents) in &parents {
            if levels.contains_key(id) || !node_parents.keys().all(|p| levels.contains_key(p)) {
                continue;
            }
            let level = node_parents.keys().map(|p| levels[p]).max().unwrap_or(0) + 1;
            levels.insert(*id, level);
            commits.push(OTCommit::new(*id, node_parents.clone(), level));
        }
    }
    commits
}

pub fn graph_of(edges: &[(char, char, i64)]) -> OTLoadedGraph<char, TestOp> {
    let mut graph = OTLoadedGraph::new();
    for commit in commits_of(edges) {
        graph.add_node(&commit);
    }
    graph
}

pub fn heads(ids: &str) -> BTreeSet<char> {
    ids.chars().collect()
}

/// A repository stub holding the commits of `edges`, ids assigned in
/// commit order.
pub struct Fixture {
    pub repo: OTRepositoryStub<TestOp>,
    pub ids: BTreeMap<char, u64>,
}

impl Fixture {
    pub fn new(edges: &[(char, char, i64)]) -> Self {
        let repo = OTRepositoryStub::new();
        let mut ids = BTreeMap::new();
        for (n, commit) in commits_of(edges).into_iter().enumerate() {
            ids.insert(commit.id, n as u64);
            let parents = commit
                .parents
                .iter()
                .map(|(p, diffs)| (ids[p], diffs.clone()))
                .collect();
            repo.add(OTCommit::new(n as u64, parents, commit.level));
        }
        Self { repo, ids }
    }

    pub fn id(&self, name: char) -> u64 {
        self.ids[&name]
    }

    pub fn ids(&self, names: &str) -> BTreeSet<u64> {
        names.chars().map(|name| self.id(name)).collect()
    }
}

pub fn test_config(server: &str) -> NodeConfig {
    NodeConfig::new(RawServerId::new(server))
        .with_latency_margin(Duration::ZERO)
        .with_retry(RetryPolicy::none())
}

/// A repository owner, its discovery record and the nodes serving it.
pub struct Network {
    pub owner: KeyPair,
    pub repo: RepoId,
    pub discovery: Arc<LocalDiscoveryService>,
    pub registry: Arc<NodeRegistry>,
}

impl Network {
    pub fn new() -> Self {
        let owner = KeyPair::generate();
        let repo = RepoId::new(owner.pub_key(), "repo");
        Self {
            owner,
            repo,
            discovery: Arc::new(LocalDiscoveryService::new()),
            registry: Arc::new(NodeRegistry::new()),
        }
    }

    pub fn node(&self, config: NodeConfig) -> Arc<LocalGlobalOTNode> {
        let id = config.server_id.clone();
        let discovery: Arc<dyn DiscoveryService> = self.discovery.clone();
        let factory: Arc<dyn NodeFactory> = self.registry.clone();
        let node = Arc::new(LocalGlobalOTNode::new(
            config,
            Arc::new(CommitStorageStub::new()),
            discovery,
            factory,
        ));
        self.registry.register(id, node.clone());
        node
    }

    pub fn master(&self, server: &str) -> Arc<LocalGlobalOTNode> {
        self.node(test_config(server).with_managed_key(self.owner.pub_key()))
    }

    pub fn relay(&self, server: &str) -> Arc<LocalGlobalOTNode> {
        self.node(test_config(server))
    }

    pub fn register(&self, server: &str, node: Arc<dyn GlobalOTNode>) {
        self.registry.register(RawServerId::new(server), node);
    }

    pub async fn announce(&self, timestamp: u64, servers: &[&str]) {
        let data = AnnounceData {
            timestamp,
            server_ids: servers.iter().copied().map(RawServerId::new).collect(),
        };
        let signed = SignedData::sign(data, &self.owner).expect("sign announcement");
        self.discovery
            .announce(self.owner.pub_key(), signed)
            .await
            .expect("announce");
    }

    pub fn head(&self, id: CommitId) -> SignedHead {
        signed_head(&self.repo, id, &self.owner)
    }
}

pub fn signed_head(repo: &RepoId, id: CommitId, keys: &KeyPair) -> SignedHead {
    SignedData::sign(RawCommitHead::new(repo.clone(), id, 1), keys).expect("sign head")
}

/// A raw commit over `parents` whose payload is `tag`; the payload is not
/// encrypted, nodes never look inside.
pub fn raw_commit(parents: &[CommitId], tag: u8) -> (CommitId, RawCommit) {
    let commit = RawCommit {
        epoch: 0,
        parents: parents.iter().copied().collect(),
        encrypted_diffs: EncryptedData {
            nonce: [0; 12],
            ciphertext: vec![tag],
        },
        sim_key_hash: SimKey::from_bytes([7; 32]).hash(),
        level: parents.iter().map(CommitId::level).max().unwrap_or(0) + 1,
        timestamp: tag as u64,
    };
    let id = commit.commit_id().expect("commit id");
    (id, commit)
}

/// A linear chain of `len` raw commits on top of the root.
pub fn raw_chain(len: u8) -> Vec<(CommitId, RawCommit)> {
    let mut parent = CommitId::root();
    let mut chain = Vec::new();
    for tag in 0..len {
        let (id, commit) = raw_commit(&[parent], tag);
        parent = id;
        chain.push((id, commit));
    }
    chain
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
