use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::collections::HashMap;
use std::collections::HashSet;
use std::error::Error;
use std::fmt;

use parking_lot::Mutex;
use tokio::sync::watch;

use super::commit::now_millis;
use super::commit::OTCommit;
use super::repository::OTRepository;

/// Operations of [`OTRepositoryStub`] that can be made to fail once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StubOp {
    CreateCommit,
    Push,
    GetHeads,
    LoadCommit,
    LoadSnapshot,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StubError {
    CommitNotFound(u64),
    Injected(StubOp),
    Closed,
}

impl fmt::Display for StubError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StubError::CommitNotFound(id) => write!(f, "commit {id} not found"),
            StubError::Injected(op) => write!(f, "injected failure in {op:?}"),
            StubError::Closed => write!(f, "repository closed"),
        }
    }
}

impl Error for StubError {}

struct StubState<D> {
    next_id: u64,
    commits: BTreeMap<u64, OTCommit<u64, D>>,
    snapshots: HashMap<u64, Vec<D>>,
    failures: HashSet<StubOp>,
}

/// In-memory [`OTRepository`] keyed by sequentially assigned ids.
///
/// Cloning is not supported; share it behind an `Arc` or a reference.
pub struct OTRepositoryStub<D> {
    state: Mutex<StubState<D>>,
    heads: watch::Sender<BTreeSet<u64>>,
}

impl<D: Clone> Default for OTRepositoryStub<D> {
    fn default() -> Self {
        Self::new()
    }
}

impl<D: Clone> OTRepositoryStub<D> {
    pub fn new() -> Self {
        let (heads, _) = watch::channel(BTreeSet::new());
        Self {
            state: Mutex::new(StubState {
                next_id: 0,
                commits: BTreeMap::new(),
                snapshots: HashMap::new(),
                failures: HashSet::new(),
            }),
            heads,
        }
    }

    /// Creates and pushes a root commit with an empty snapshot.
    pub fn init_root(&self) -> u64 {
        let id = {
            let mut state = self.state.lock();
            let id = state.next_id;
            state.next_id += 1;
            state
                .commits
                .insert(id, OTCommit::root(id).with_timestamp(now_millis()));
            state.snapshots.insert(id, Vec::new());
            id
        };
        self.heads.send_modify(|heads| {
            heads.insert(id);
        });
        id
    }

    /// Adds a commit with an explicit id, bypassing `create_commit`.
    ///
    /// Parents must already be present; the graph fixtures of the tests
    /// are built this way.
    pub fn add(&self, commit: OTCommit<u64, D>) {
        let mut state = self.state.lock();
        state.next_id = state.next_id.max(commit.id + 1);
        let id = commit.id;
        let parents = commit.parent_ids();
        state.commits.insert(id, commit);
        drop(state);
        self.heads.send_modify(|heads| {
            for parent in &parents {
                heads.remove(parent);
            }
            heads.insert(id);
        });
    }

    /// Makes the next call of `op` fail with [`StubError::Injected`].
    pub fn fail_next(&self, op: StubOp) {
        self.state.lock().failures.insert(op);
    }

    pub fn commit_count(&self) -> usize {
        self.state.lock().commits.len()
    }

    pub fn heads_now(&self) -> BTreeSet<u64> {
        self.heads.borrow().clone()
    }

    fn check(&self, op: StubOp) -> Result<(), StubError> {
        if self.state.lock().failures.remove(&op) {
            return Err(StubError::Injected(op));
        }
        Ok(())
    }
}

impl<D: Clone> OTRepository for OTRepositoryStub<D> {
    type Key = u64;
    type Diff = D;
    type Error = StubError;

    async fn create_commit(
        &self,
        parent_diffs: BTreeMap<u64, Vec<D>>,
        level: u64,
    ) -> Result<OTCommit<u64, D>, StubError> {
        self.check(StubOp::CreateCommit)?;
        let mut state = self.state.lock();
        let id = state.next_id;
        state.next_id += 1;
        Ok(OTCommit::new(id, parent_diffs, level).with_timestamp(now_millis()))
    }

    async fn push(&self, commits: Vec<OTCommit<u64, D>>) -> Result<(), StubError> {
        self.check(StubOp::Push)?;
        let mut new = BTreeSet::new();
        let mut excluded = BTreeSet::new();
        {
            let mut state = self.state.lock();
            for commit in commits {
                excluded.extend(commit.parent_ids());
                new.insert(commit.id);
                state.commits.insert(commit.id, commit);
            }
        }
        self.update_heads(new, excluded).await
    }

    async fn update_heads(
        &self,
        new: BTreeSet<u64>,
        excluded: BTreeSet<u64>,
    ) -> Result<(), StubError> {
        self.heads.send_if_modified(|heads| {
            let before = heads.clone();
            for id in &excluded {
                heads.remove(id);
            }
            for id in &new {
                if !excluded.contains(id) {
                    heads.insert(*id);
                }
            }
            *heads != before
        });
        Ok(())
    }

    async fn get_heads(&self) -> Result<BTreeSet<u64>, StubError> {
        self.check(StubOp::GetHeads)?;
        Ok(self.heads.borrow().clone())
    }

    async fn poll_heads(&self, known: BTreeSet<u64>) -> Result<BTreeSet<u64>, StubError> {
        let mut receiver = self.heads.subscribe();
        let heads = receiver
            .wait_for(|heads| *heads != known)
            .await
            .map_err(|_| StubError::Closed)?;
        Ok(heads.clone())
    }

    async fn load_commit(&self, id: u64) -> Result<OTCommit<u64, D>, StubError> {
        self.check(StubOp::LoadCommit)?;
        let state = self.state.lock();
        let commit = state
            .commits
            .get(&id)
            .cloned()
            .ok_or(StubError::CommitNotFound(id))?;
        Ok(match state.snapshots.contains_key(&id) {
            true => commit,
            false => commit.with_snapshot_hint(false),
        })
    }

    async fn has_commit(&self, id: u64) -> Result<bool, StubError> {
        Ok(self.state.lock().commits.contains_key(&id))
    }

    async fn load_snapshot(&self, id: u64) -> Result<Option<Vec<D>>, StubError> {
        self.check(StubOp::LoadSnapshot)?;
        Ok(self.state.lock().snapshots.get(&id).cloned())
    }

    async fn save_snapshot(&self, id: u64, diffs: Vec<D>) -> Result<(), StubError> {
        self.state.lock().snapshots.insert(id, diffs);
        Ok(())
    }
}
