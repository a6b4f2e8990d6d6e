//! Node configuration.
//!
//! ```toml
//! server_id = "node-a"
//! managed_keys = ["5f0b...e1"]
//! latency_margin_ms = 200
//!
//! [retry]
//! max_attempts = 3
//! min_delay_ms = 10
//! max_delay_ms = 1000
//! jitter = true
//! ```

use std::collections::BTreeSet;
use std::time::Duration;

use backon::BackoffBuilder;
use backon::ExponentialBackoff;
use backon::ExponentialBuilder;
use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;

use crate::global::keys::PubKey;
use crate::global::types::RawServerId;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Id under which this node is announced and reached.
    pub server_id: RawServerId,
    /// Keys this node is master for, whatever discovery says.
    #[serde(with = "hex_keys")]
    pub managed_keys: BTreeSet<PubKey>,
    /// How long master lookups and refreshed data are trusted, and how long
    /// slower masters get once one master answered.
    #[serde(rename = "latency_margin_ms", with = "millis")]
    pub latency_margin: Duration,
    pub retry: RetryPolicy,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            server_id: RawServerId::new("local"),
            managed_keys: BTreeSet::new(),
            latency_margin: Duration::from_millis(200),
            retry: RetryPolicy::default(),
        }
    }
}

impl NodeConfig {
    pub fn new(server_id: RawServerId) -> Self {
        Self {
            server_id,
            ..Self::default()
        }
    }

    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(source)?)
    }

    pub fn with_managed_key(mut self, key: PubKey) -> Self {
        self.managed_keys.insert(key);
        self
    }

    pub fn with_latency_margin(mut self, latency_margin: Duration) -> Self {
        self.latency_margin = latency_margin;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

/// Exponential backoff for requests to a single master.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_attempts: usize,
    #[serde(rename = "min_delay_ms", with = "millis")]
    pub min_delay: Duration,
    #[serde(rename = "max_delay_ms", with = "millis")]
    pub max_delay: Duration,
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            min_delay: Duration::from_millis(10),
            max_delay: Duration::from_secs(1),
            jitter: true,
        }
    }
}

impl RetryPolicy {
    pub fn none() -> Self {
        Self {
            max_attempts: 0,
            ..Self::default()
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: usize) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_delays(mut self, min_delay: Duration, max_delay: Duration) -> Self {
        self.min_delay = min_delay;
        self.max_delay = max_delay;
        self
    }

    pub fn build_backoff(&self) -> ExponentialBackoff {
        let builder = ExponentialBuilder::new()
            .with_min_delay(self.min_delay)
            .with_max_delay(self.max_delay)
            .with_max_times(self.max_attempts);
        match self.jitter {
            true => builder.with_jitter().build(),
            false => builder.build(),
        }
    }
}

mod millis {
    use std::time::Duration;

    use serde::Deserialize;
    use serde::Deserializer;
    use serde::Serializer;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

mod hex_keys {
    use std::collections::BTreeSet;

    use serde::de::Error;
    use serde::Deserialize;
    use serde::Deserializer;
    use serde::Serializer;

    use crate::global::keys::PubKey;

    pub fn serialize<S: Serializer>(keys: &BTreeSet<PubKey>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(keys.iter().map(|key| key.to_string()))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<BTreeSet<PubKey>, D::Error> {
        Vec::<String>::deserialize(deserializer)?
            .iter()
            .map(|hex| PubKey::from_hex(hex).map_err(D::Error::custom))
            .collect()
    }
}
