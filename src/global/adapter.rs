use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::marker::PhantomData;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;

use super::driver::DriverError;
use super::driver::OTDriver;
use super::types::CommitId;
use super::types::RepoId;
use crate::ot::commit::OTCommit;
use crate::ot::repository::OTRepository;

/// One repository of a global node seen through an [`OTDriver`].
pub struct OTRepositoryAdapter<D> {
    driver: Arc<OTDriver>,
    repo: RepoId,
    _diff: PhantomData<fn() -> D>,
}

impl<D> OTRepositoryAdapter<D> {
    pub fn new(driver: Arc<OTDriver>, repo: RepoId) -> Self {
        Self {
            driver,
            repo,
            _diff: PhantomData,
        }
    }

    pub fn driver(&self) -> &Arc<OTDriver> {
        &self.driver
    }

    pub fn repo(&self) -> &RepoId {
        &self.repo
    }
}

impl<D> OTRepository for OTRepositoryAdapter<D>
where
    D: Serialize + DeserializeOwned + Clone,
{
    type Key = CommitId;
    type Diff = D;
    type Error = DriverError;

    async fn create_commit(
        &self,
        parent_diffs: BTreeMap<CommitId, Vec<D>>,
        level: u64,
    ) -> Result<OTCommit<CommitId, D>, DriverError> {
        self.driver.create_commit(parent_diffs, level)
    }

    async fn push(&self, commits: Vec<OTCommit<CommitId, D>>) -> Result<(), DriverError> {
        self.driver.push(&self.repo, &commits).await?;
        let parents: BTreeSet<CommitId> = commits.iter().flat_map(|c| c.parent_ids()).collect();
        let new: BTreeSet<CommitId> = commits
            .iter()
            .map(|c| c.id)
            .filter(|id| !parents.contains(id))
            .collect();
        self.update_heads(new, parents).await
    }

    async fn update_heads(
        &self,
        new: BTreeSet<CommitId>,
        _excluded: BTreeSet<CommitId>,
    ) -> Result<(), DriverError> {
        self.driver.update_heads(&self.repo, &new).await
    }

    async fn get_heads(&self) -> Result<BTreeSet<CommitId>, DriverError> {
        self.driver.get_heads(&self.repo).await
    }

    async fn poll_heads(&self, known: BTreeSet<CommitId>) -> Result<BTreeSet<CommitId>, DriverError> {
        self.driver.poll_heads(&self.repo, known).await
    }

    async fn load_commit(&self, id: CommitId) -> Result<OTCommit<CommitId, D>, DriverError> {
        self.driver.load_commit(&self.repo, id).await
    }

    async fn has_commit(&self, id: CommitId) -> Result<bool, DriverError> {
        self.driver.has_commit(&self.repo, id).await
    }

    async fn load_snapshot(&self, id: CommitId) -> Result<Option<Vec<D>>, DriverError> {
        self.driver.load_snapshot(&self.repo, id).await
    }

    async fn save_snapshot(&self, id: CommitId, diffs: Vec<D>) -> Result<(), DriverError> {
        self.driver.save_snapshot(&self.repo, id, &diffs).await
    }
}
