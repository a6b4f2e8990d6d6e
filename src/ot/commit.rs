use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::fmt;

use bytes::Bytes;
use hifitime::Epoch;

/// A storage agnostic commit: the diffs leading from each parent to it.
///
/// The merge algorithm and every graph walk only ever see this
/// representation; encrypted raw commits are decoded into it by the
/// repository that loaded them.
#[derive(Clone, PartialEq, Eq)]
pub struct OTCommit<K, D> {
    pub id: K,
    pub parents: BTreeMap<K, Vec<D>>,
    pub level: u64,
    pub epoch: u32,
    /// Creation time in unix milliseconds.
    pub timestamp: u64,
    /// `Some(false)` marks commits known to have no stored snapshot.
    pub snapshot_hint: Option<bool>,
    /// Encoded form kept by repositories that need to ship it unchanged.
    pub serialized: Option<Bytes>,
}

impl<K: Ord + Clone, D> OTCommit<K, D> {
    pub fn new(id: K, parents: BTreeMap<K, Vec<D>>, level: u64) -> Self {
        Self {
            id,
            parents,
            level,
            epoch: 0,
            timestamp: 0,
            snapshot_hint: None,
            serialized: None,
        }
    }

    /// A commit without parents.
    pub fn root(id: K) -> Self {
        Self::new(id, BTreeMap::new(), 0)
    }

    pub fn with_epoch(mut self, epoch: u32) -> Self {
        self.epoch = epoch;
        self
    }

    pub fn with_timestamp(mut self, timestamp: u64) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn with_snapshot_hint(mut self, hint: bool) -> Self {
        self.snapshot_hint = Some(hint);
        self
    }

    pub fn with_serialized(mut self, serialized: Bytes) -> Self {
        self.serialized = Some(serialized);
        self
    }

    pub fn is_root(&self) -> bool {
        self.parents.is_empty()
    }

    pub fn parent_ids(&self) -> BTreeSet<K> {
        self.parents.keys().cloned().collect()
    }
}

impl<K: fmt::Debug, D> fmt::Debug for OTCommit<K, D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OTCommit")
            .field("id", &self.id)
            .field("parents", &self.parents.keys().collect::<Vec<_>>())
            .field("level", &self.level)
            .finish()
    }
}

/// Current wall clock time in unix milliseconds, zero if unavailable.
pub fn now_millis() -> u64 {
    Epoch::now()
        .map(|now| now.to_unix_milliseconds().max(0.0) as u64)
        .unwrap_or(0)
}
