//! Configuration and dependency wiring.

mod dependencies;

use std::env;
use std::sync::Arc;
use std::time::Duration;

use tracing::warn;

use crate::model::{FirstMemberPolicy, VersionMetadataPolicy};

pub use dependencies::{ConnectionMode, Dependencies};

const DEFAULT_STORE_TIMEOUT_SECS: u64 = 10;
const DEFAULT_INDEX_TIMEOUT_SECS: u64 = 10;
const DEFAULT_LOCK_TIMEOUT_SECS: u64 = 5;
const DEFAULT_INDEX_BATCH_SIZE: usize = 500;

/// Settings of the merge engine and the index sync.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Bound on every relationship store call.
    pub store_timeout: Duration,
    /// Bound on every search index call.
    pub index_timeout: Duration,
    /// Bound on waiting for cluster locks.
    pub lock_timeout: Duration,
    /// Documents per bulk upsert.
    pub index_batch_size: usize,
    /// Which Identity member renders a Version group's metadata.
    pub metadata_policy: Arc<dyn VersionMetadataPolicy>,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            store_timeout: Duration::from_secs(DEFAULT_STORE_TIMEOUT_SECS),
            index_timeout: Duration::from_secs(DEFAULT_INDEX_TIMEOUT_SECS),
            lock_timeout: Duration::from_secs(DEFAULT_LOCK_TIMEOUT_SECS),
            index_batch_size: DEFAULT_INDEX_BATCH_SIZE,
            metadata_policy: Arc::new(FirstMemberPolicy),
        }
    }
}

impl BrokerConfig {
    /// Read the configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `BROKER_STORE_TIMEOUT_SECS`: Store call timeout (default: 10)
    /// - `BROKER_INDEX_TIMEOUT_SECS`: Index call timeout (default: 10)
    /// - `BROKER_LOCK_TIMEOUT_SECS`: Cluster lock timeout (default: 5)
    /// - `BROKER_INDEX_BATCH_SIZE`: Documents per bulk request (default: 500)
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            store_timeout: secs_from_env("BROKER_STORE_TIMEOUT_SECS", defaults.store_timeout),
            index_timeout: secs_from_env("BROKER_INDEX_TIMEOUT_SECS", defaults.index_timeout),
            lock_timeout: secs_from_env("BROKER_LOCK_TIMEOUT_SECS", defaults.lock_timeout),
            index_batch_size: parse_env("BROKER_INDEX_BATCH_SIZE")
                .filter(|n: &usize| *n > 0)
                .unwrap_or(defaults.index_batch_size),
            metadata_policy: defaults.metadata_policy,
        }
    }

    pub fn with_metadata_policy(mut self, policy: Arc<dyn VersionMetadataPolicy>) -> Self {
        self.metadata_policy = policy;
        self
    }
}

fn parse_env<T: std::str::FromStr>(name: &str) -> Option<T> {
    let raw = env::var(name).ok()?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(variable = name, value = %raw, "Ignoring invalid value");
            None
        }
    }
}

fn secs_from_env(name: &str, default: Duration) -> Duration {
    parse_env::<u64>(name)
        .map(Duration::from_secs)
        .unwrap_or(default)
}
