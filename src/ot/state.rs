use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::error::Error;
use std::fmt;

use futures::future;
use tracing::debug;
use tracing::warn;

use super::algorithms::AlgorithmError;
use super::algorithms::OTAlgorithms;
use super::reducer::ToList;
use super::repository::CommitOf;
use super::repository::OTRepository;
use super::system::OTSystem;
use super::system::TransformError;

/// Application state that operations are applied to.
pub trait OTState<D> {
    /// Resets to the empty state.
    fn init(&mut self);

    fn apply(&mut self, op: &D);
}

#[derive(Debug)]
pub enum StateError<E> {
    Algorithm(AlgorithmError<E>),
    Repository(E),
    Transform(TransformError),
    /// Nothing has been checked out yet.
    NotCheckedOut,
}

impl<E: fmt::Display> fmt::Display for StateError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StateError::Algorithm(e) => write!(f, "{e}"),
            StateError::Repository(e) => write!(f, "repository failed: {e}"),
            StateError::Transform(e) => write!(f, "rebase failed: {e}"),
            StateError::NotCheckedOut => write!(f, "no revision checked out"),
        }
    }
}

impl<E: Error + 'static> Error for StateError<E> {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            StateError::Algorithm(e) => Some(e),
            StateError::Repository(e) => Some(e),
            StateError::Transform(e) => Some(e),
            StateError::NotCheckedOut => None,
        }
    }
}

impl<E> From<AlgorithmError<E>> for StateError<E> {
    fn from(e: AlgorithmError<E>) -> Self {
        StateError::Algorithm(e)
    }
}

impl<E> From<TransformError> for StateError<E> {
    fn from(e: TransformError) -> Self {
        StateError::Transform(e)
    }
}

/// Diffs from the current revision to a newer head that were fetched but
/// not rebased onto yet.
struct Fetched<K, D> {
    revision: K,
    level: u64,
    diffs: Vec<D>,
}

type Result<T, R> = std::result::Result<T, StateError<<R as OTRepository>::Error>>;

/// A client replica: local state plus the bookkeeping needed to exchange
/// operations with a repository.
///
/// Local operations go to the working diffs, `commit` turns them into a
/// pending commit and `push` hands pending commits to the repository.
/// Failures never discard working diffs or pending commits, so a failed
/// `sync` can simply be retried.
pub struct OTStateManager<R: OTRepository, S, St> {
    algorithms: OTAlgorithms<R, S>,
    state: St,
    revision: Option<R::Key>,
    revision_level: u64,
    working_diffs: Vec<R::Diff>,
    fetched: Option<Fetched<R::Key, R::Diff>>,
    pending_commits: BTreeMap<R::Key, CommitOf<R>>,
}

impl<R, S, St> OTStateManager<R, S, St>
where
    R: OTRepository,
    S: OTSystem<R::Diff>,
    St: OTState<R::Diff>,
{
    pub fn new(algorithms: OTAlgorithms<R, S>, state: St) -> Self {
        Self {
            algorithms,
            state,
            revision: None,
            revision_level: 0,
            working_diffs: Vec::new(),
            fetched: None,
            pending_commits: BTreeMap::new(),
        }
    }

    pub fn algorithms(&self) -> &OTAlgorithms<R, S> {
        &self.algorithms
    }

    pub fn state(&self) -> &St {
        &self.state
    }

    /// The commit the local state is based on.
    pub fn revision(&self) -> Option<&R::Key> {
        self.revision.as_ref()
    }

    pub fn commit_id(&self) -> Option<&R::Key> {
        self.revision()
    }

    pub fn revision_level(&self) -> u64 {
        self.revision_level
    }

    pub fn working_diffs(&self) -> &[R::Diff] {
        &self.working_diffs
    }

    pub fn has_working_diffs(&self) -> bool {
        !self.working_diffs.is_empty()
    }

    pub fn has_pending_commits(&self) -> bool {
        !self.pending_commits.is_empty()
    }

    pub fn has_fetched_diffs(&self) -> bool {
        self.fetched.is_some()
    }

    fn apply(&mut self, diffs: &[R::Diff]) {
        for op in diffs {
            self.state.apply(op);
        }
    }

    /// Checks out the first head of the repository and pulls.
    pub async fn checkout(&mut self) -> Result<R::Key, R> {
        let heads = self
            .algorithms
            .repository()
            .get_heads()
            .await
            .map_err(StateError::Repository)?;
        let head = heads
            .first()
            .cloned()
            .ok_or(StateError::Algorithm(AlgorithmError::NoHeads))?;
        self.checkout_at(head).await?;
        self.pull().await?;
        self.revision.clone().ok_or(StateError::NotCheckedOut)
    }

    /// Replaces the local state by the state at `id`.
    ///
    /// Working diffs and pending commits are dropped.
    pub async fn checkout_at(&mut self, id: R::Key) -> Result<R::Key, R> {
        let commit = self
            .algorithms
            .repository()
            .load_commit(id.clone())
            .await
            .map_err(StateError::Repository)?;
        let diffs = self.algorithms.checkout_at(&id).await?;
        self.state.init();
        self.apply(&diffs);
        self.working_diffs.clear();
        self.pending_commits.clear();
        self.revision = Some(commit.id);
        self.revision_level = commit.level;
        self.fetched = None;
        debug!(revision = ?id, "checked out");
        Ok(id)
    }

    /// Fetches the diffs leading from the current revision to a head.
    ///
    /// Does nothing while there are pending commits.
    pub async fn fetch(&mut self) -> Result<Option<R::Key>, R> {
        if !self.pending_commits.is_empty() {
            return Ok(None);
        }
        let heads = self
            .algorithms
            .repository()
            .get_heads()
            .await
            .map_err(StateError::Repository)?;
        self.fetch_from(heads).await
    }

    /// Fetches towards `head` only, discarding earlier fetched diffs.
    pub async fn fetch_head(&mut self, head: R::Key) -> Result<Option<R::Key>, R> {
        self.fetched = None;
        self.fetch_from(BTreeSet::from([head])).await
    }

    async fn fetch_from(&mut self, heads: BTreeSet<R::Key>) -> Result<Option<R::Key>, R> {
        if !self.pending_commits.is_empty() {
            return Ok(None);
        }
        let target = match (&self.fetched, &self.revision) {
            (Some(fetched), _) => fetched.revision.clone(),
            (None, Some(revision)) => revision.clone(),
            (None, None) => return Err(StateError::NotCheckedOut),
        };
        let found = self
            .algorithms
            .find_parent(&heads, &ToList, |commit| {
                future::ready(Ok::<_, R::Error>((commit.id == target).then_some(())))
            })
            .await?;
        let Some(found) = found else {
            warn!(revision = ?target, heads = ?heads, "revision not reachable from heads");
            return Ok(None);
        };
        let mut diffs = self
            .fetched
            .take()
            .map(|fetched| fetched.diffs)
            .unwrap_or_default();
        diffs.extend(found.accumulated);
        let diffs = self.algorithms.system().squash(&diffs);
        debug!(revision = ?found.child, diffs = diffs.len(), "fetched");
        self.fetched = Some(Fetched {
            revision: found.child.clone(),
            level: found.child_level,
            diffs,
        });
        Ok(Some(found.child))
    }

    /// Moves the revision to the fetched head, transforming the working
    /// diffs over the fetched ones.
    pub fn rebase(&mut self) -> Result<Option<R::Key>, R> {
        let Some(fetched) = &self.fetched else {
            return Ok(None);
        };
        let system = self.algorithms.system();
        let transformed = system.transform(
            &system.squash(&self.working_diffs),
            &system.squash(&fetched.diffs),
        )?;
        let Some(fetched) = self.fetched.take() else {
            return Ok(None);
        };
        self.apply(&transformed.right);
        self.working_diffs = transformed.left;
        self.revision = Some(fetched.revision.clone());
        self.revision_level = fetched.level;
        Ok(Some(fetched.revision))
    }

    pub async fn pull(&mut self) -> Result<Option<R::Key>, R> {
        match self.fetch().await? {
            Some(_) => self.rebase(),
            None => Ok(None),
        }
    }

    pub async fn pull_head(&mut self, head: R::Key) -> Result<Option<R::Key>, R> {
        match self.fetch_head(head).await? {
            Some(_) => self.rebase(),
            None => Ok(None),
        }
    }

    /// Undoes all working diffs.
    pub fn reset(&mut self) {
        let inverted = self.algorithms.system().invert(&self.working_diffs);
        self.apply(&inverted);
        self.working_diffs.clear();
    }

    /// Applies local operations, skipping empty ones.
    pub fn add(&mut self, diffs: impl IntoIterator<Item = R::Diff>) {
        for diff in diffs {
            if self.algorithms.system().is_empty(&diff) {
                continue;
            }
            self.state.apply(&diff);
            self.working_diffs.push(diff);
        }
    }

    /// Turns the working diffs into a pending commit on top of the revision.
    pub async fn commit(&mut self) -> Result<Option<R::Key>, R> {
        if self.working_diffs.is_empty() {
            return Ok(None);
        }
        let revision = self.revision.clone().ok_or(StateError::NotCheckedOut)?;
        let diffs = self.algorithms.system().squash(&self.working_diffs);
        let commit = self
            .algorithms
            .repository()
            .create_commit(BTreeMap::from([(revision, diffs)]), self.revision_level + 1)
            .await
            .map_err(StateError::Repository)?;
        let id = commit.id.clone();
        self.revision = Some(id.clone());
        self.revision_level = commit.level;
        self.pending_commits.insert(id.clone(), commit);
        self.working_diffs.clear();
        self.fetched = None;
        debug!(commit = ?id, "committed");
        Ok(Some(id))
    }

    /// Pushes pending commits; they stay pending if the push fails.
    pub async fn push(&mut self) -> Result<(), R> {
        if self.pending_commits.is_empty() {
            return Ok(());
        }
        let commits: Vec<_> = self.pending_commits.values().cloned().collect();
        let ids: Vec<_> = commits.iter().map(|c| c.id.clone()).collect();
        self.algorithms
            .repository()
            .push(commits)
            .await
            .map_err(StateError::Repository)?;
        for id in &ids {
            self.pending_commits.remove(id);
        }
        debug!(commits = ids.len(), "pushed");
        Ok(())
    }

    pub async fn commit_and_push(&mut self) -> Result<Option<R::Key>, R> {
        let id = self.commit().await?;
        self.push().await?;
        Ok(id)
    }

    /// Pulls, commits and pushes local work, merges the repository heads
    /// and pulls the merge.
    pub async fn sync(&mut self) -> Result<Option<R::Key>, R> {
        self.pull().await?;
        self.commit().await?;
        self.push().await?;
        self.algorithms.merge_heads_and_push().await?;
        self.pull().await?;
        Ok(self.revision.clone())
    }
}
