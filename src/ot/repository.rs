use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::error::Error;
use std::fmt::Debug;
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;

use super::commit::OTCommit;

/// Requirements on commit identifiers.
///
/// Keys must be totally ordered so that every replica walks and merges
/// heads in the same order.
pub trait CommitKey: Clone + Ord + Hash + Debug + Send + Sync + 'static {}

impl<T> CommitKey for T where T: Clone + Ord + Hash + Debug + Send + Sync + 'static {}

/// Shorthand for the commits handled by a repository.
pub type CommitOf<R> = OTCommit<<R as OTRepository>::Key, <R as OTRepository>::Diff>;

/// Storage of an operation history as a commit graph.
///
/// Commits are immutable once pushed. Pushing makes the pushed commits
/// heads and retires their parents as heads.
pub trait OTRepository {
    type Key: CommitKey;
    type Diff: Clone;
    type Error: Error + Send + Sync + 'static;

    /// Builds a commit with a fresh id; nothing is stored until `push`.
    fn create_commit(
        &self,
        parent_diffs: BTreeMap<Self::Key, Vec<Self::Diff>>,
        level: u64,
    ) -> impl Future<Output = Result<CommitOf<Self>, Self::Error>>;

    fn push(&self, commits: Vec<CommitOf<Self>>) -> impl Future<Output = Result<(), Self::Error>>;

    fn push_and_update_head(
        &self,
        commit: CommitOf<Self>,
    ) -> impl Future<Output = Result<(), Self::Error>> {
        self.push(vec![commit])
    }

    /// Adds `new` to the heads and drops `excluded` from them.
    fn update_heads(
        &self,
        new: BTreeSet<Self::Key>,
        excluded: BTreeSet<Self::Key>,
    ) -> impl Future<Output = Result<(), Self::Error>>;

    fn get_heads(&self) -> impl Future<Output = Result<BTreeSet<Self::Key>, Self::Error>>;

    /// Resolves once the heads differ from `known`.
    fn poll_heads(
        &self,
        known: BTreeSet<Self::Key>,
    ) -> impl Future<Output = Result<BTreeSet<Self::Key>, Self::Error>>;

    fn load_commit(
        &self,
        id: Self::Key,
    ) -> impl Future<Output = Result<CommitOf<Self>, Self::Error>>;

    fn has_commit(&self, id: Self::Key) -> impl Future<Output = Result<bool, Self::Error>>;

    fn load_snapshot(
        &self,
        id: Self::Key,
    ) -> impl Future<Output = Result<Option<Vec<Self::Diff>>, Self::Error>>;

    fn save_snapshot(
        &self,
        id: Self::Key,
        diffs: Vec<Self::Diff>,
    ) -> impl Future<Output = Result<(), Self::Error>>;
}

macro_rules! forward_repository {
    ($($wrapper:ty),*) => {$(
        impl<R: OTRepository + ?Sized> OTRepository for $wrapper {
            type Key = R::Key;
            type Diff = R::Diff;
            type Error = R::Error;

            fn create_commit(
                &self,
                parent_diffs: BTreeMap<Self::Key, Vec<Self::Diff>>,
                level: u64,
            ) -> impl Future<Output = Result<CommitOf<Self>, Self::Error>> {
                (**self).create_commit(parent_diffs, level)
            }

            fn push(&self, commits: Vec<CommitOf<Self>>) -> impl Future<Output = Result<(), Self::Error>> {
                (**self).push(commits)
            }

            fn push_and_update_head(
                &self,
                commit: CommitOf<Self>,
            ) -> impl Future<Output = Result<(), Self::Error>> {
                (**self).push_and_update_head(commit)
            }

            fn update_heads(
                &self,
                new: BTreeSet<Self::Key>,
                excluded: BTreeSet<Self::Key>,
            ) -> impl Future<Output = Result<(), Self::Error>> {
                (**self).update_heads(new, excluded)
            }

            fn get_heads(&self) -> impl Future<Output = Result<BTreeSet<Self::Key>, Self::Error>> {
                (**self).get_heads()
            }

            fn poll_heads(
                &self,
                known: BTreeSet<Self::Key>,
            ) -> impl Future<Output = Result<BTreeSet<Self::Key>, Self::Error>> {
                (**self).poll_heads(known)
            }

            fn load_commit(
                &self,
                id: Self::Key,
            ) -> impl Future<Output = Result<CommitOf<Self>, Self::Error>> {
                (**self).load_commit(id)
            }

            fn has_commit(&self, id: Self::Key) -> impl Future<Output = Result<bool, Self::Error>> {
                (**self).has_commit(id)
            }

            fn load_snapshot(
                &self,
                id: Self::Key,
            ) -> impl Future<Output = Result<Option<Vec<Self::Diff>>, Self::Error>> {
                (**self).load_snapshot(id)
            }

            fn save_snapshot(
                &self,
                id: Self::Key,
                diffs: Vec<Self::Diff>,
            ) -> impl Future<Output = Result<(), Self::Error>> {
                (**self).save_snapshot(id, diffs)
            }
        }
    )*};
}

forward_repository!(&R, Arc<R>);
