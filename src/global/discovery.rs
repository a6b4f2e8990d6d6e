use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::Mutex;
use thiserror::Error;
use tracing::debug;

use super::keys::PubKey;
use super::keys::SignedData;
use super::types::AnnounceData;

pub type SignedAnnounce = SignedData<AnnounceData>;

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("announcement for {0:?} is not signed by that key")]
    InvalidSignature(PubKey),
    #[error("announcement for {0:?} is older than the known one")]
    Outdated(PubKey),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Maps keys to the servers that master them.
#[async_trait]
pub trait DiscoveryService: Send + Sync {
    async fn announce(
        &self,
        pub_key: PubKey,
        announcement: SignedAnnounce,
    ) -> Result<(), DiscoveryError>;

    async fn find(&self, pub_key: PubKey) -> Result<Option<SignedAnnounce>, DiscoveryError>;
}

/// In-process [`DiscoveryService`].
#[derive(Default)]
pub struct LocalDiscoveryService {
    announcements: Mutex<HashMap<PubKey, SignedAnnounce>>,
}

impl LocalDiscoveryService {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DiscoveryService for LocalDiscoveryService {
    async fn announce(
        &self,
        pub_key: PubKey,
        announcement: SignedAnnounce,
    ) -> Result<(), DiscoveryError> {
        if !announcement.verify(&pub_key) {
            return Err(DiscoveryError::InvalidSignature(pub_key));
        }
        let mut announcements = self.announcements.lock();
        if let Some(known) = announcements.get(&pub_key) {
            if known.value().timestamp > announcement.value().timestamp {
                return Err(DiscoveryError::Outdated(pub_key));
            }
        }
        debug!(key = ?pub_key, servers = ?announcement.value().server_ids, "announced");
        announcements.insert(pub_key, announcement);
        Ok(())
    }

    async fn find(&self, pub_key: PubKey) -> Result<Option<SignedAnnounce>, DiscoveryError> {
        Ok(self.announcements.lock().get(&pub_key).cloned())
    }
}
