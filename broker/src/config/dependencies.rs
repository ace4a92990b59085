//! Dependency initialization and wiring for the broker.

use std::env;
use std::sync::Arc;
use std::time::Duration;

use broker_repository::{GroupStore, MemoryGroupStore, PostgresGroupStore};
use broker_search_repository::opensearch::IndexConfig;
use broker_search_repository::{
    InMemorySearchProvider, OpenSearchProvider, SearchIndexProvider, SearchIndexService,
};
use sqlx::postgres::PgPoolOptions;
use tokio::time::sleep;
use tracing::{info, warn};

use crate::config::BrokerConfig;
use crate::errors::StartupError;
use crate::orchestrator::Broker;
use crate::retry::RetryPolicy;

/// Default index alias.
const DEFAULT_INDEX_ALIAS: &str = "relationships";

/// Default connection retry interval in seconds.
const DEFAULT_RETRY_INTERVAL_SECS: u64 = 15;

/// Default size of the PostgreSQL pool.
const DEFAULT_MAX_CONNECTIONS: u32 = 10;

/// Connection mode for OpenSearch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionMode {
    /// Fail immediately if connection fails.
    FailFast,
    /// Retry connection every `OPENSEARCH_RETRY_INTERVAL_SECS` until successful.
    Retry,
}

/// Container for all initialized dependencies.
pub struct Dependencies {
    /// The broker, wired to its store and search index.
    pub broker: Broker,
    /// Retry policy for ingestion calls.
    pub retry: RetryPolicy,
}

impl ConnectionMode {
    /// Parse connection mode from environment variable.
    ///
    /// Valid values: "fail-fast" or "retry" (case-insensitive)
    /// Defaults to "retry" if not set or invalid.
    pub fn from_env() -> Self {
        match env::var("OPENSEARCH_CONNECTION_MODE")
            .unwrap_or_else(|_| "retry".to_string())
            .to_lowercase()
            .as_str()
        {
            "fail-fast" | "failfast" | "fail_fast" => Self::FailFast,
            "retry" => Self::Retry,
            _ => {
                warn!("Invalid OPENSEARCH_CONNECTION_MODE, defaulting to 'retry'");
                Self::Retry
            }
        }
    }
}

impl Dependencies {
    /// Initialize all dependencies from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `DATABASE_URL`: PostgreSQL URL; the in-memory store is used when unset
    /// - `OPENSEARCH_URL`: OpenSearch server URL; the in-memory index is used when unset
    /// - `INDEX_ALIAS`: Index alias name (default: "relationships")
    /// - `RELATIONSHIPS_INDEX_VERSION`: Index version number (default: 0)
    /// - `OPENSEARCH_CONNECTION_MODE`: Connection mode - "fail-fast" or "retry" (default: retry)
    /// - `OPENSEARCH_RETRY_INTERVAL_SECS`: Retry interval in seconds (default: 15)
    /// - `BROKER_*`: see [`BrokerConfig::from_env`] and [`RetryPolicy::from_env`]
    ///
    /// # Returns
    ///
    /// * `Ok(Dependencies)` - Initialized dependencies
    /// * `Err(StartupError)` - If initialization fails
    pub async fn new() -> Result<Self, StartupError> {
        let config = BrokerConfig::from_env();
        let retry = RetryPolicy::from_env();
        info!(
            store_timeout_secs = config.store_timeout.as_secs(),
            index_timeout_secs = config.index_timeout.as_secs(),
            lock_timeout_secs = config.lock_timeout.as_secs(),
            index_batch_size = config.index_batch_size,
            retry_attempts = retry.max_attempts,
            "Initializing dependencies"
        );

        let store = Self::connect_store().await?;
        let provider = Self::connect_search().await?;
        let search = SearchIndexService::new(provider);

        Ok(Self {
            broker: Broker::new(store, search, config),
            retry,
        })
    }

    async fn connect_store() -> Result<Arc<dyn GroupStore>, StartupError> {
        let Ok(database_url) = env::var("DATABASE_URL") else {
            warn!("DATABASE_URL not set, using the in-memory store");
            return Ok(Arc::new(MemoryGroupStore::new()));
        };

        let pool = PgPoolOptions::new()
            .max_connections(DEFAULT_MAX_CONNECTIONS)
            .connect(&database_url)
            .await
            .map_err(|e| StartupError::config(format!("Failed to connect to PostgreSQL: {}", e)))?;
        let store = PostgresGroupStore::new(pool);
        store
            .migrate()
            .await
            .map_err(|e| StartupError::config(format!("Failed to run migrations: {}", e)))?;

        info!("PostgreSQL connection established");
        Ok(Arc::new(store))
    }

    async fn connect_search() -> Result<Box<dyn SearchIndexProvider>, StartupError> {
        let Ok(opensearch_url) = env::var("OPENSEARCH_URL") else {
            warn!("OPENSEARCH_URL not set, using the in-memory search index");
            return Ok(Box::new(InMemorySearchProvider::new()));
        };

        let connection_mode = ConnectionMode::from_env();
        let retry_interval = env::var("OPENSEARCH_RETRY_INTERVAL_SECS")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .unwrap_or(DEFAULT_RETRY_INTERVAL_SECS);
        let index_alias =
            env::var("INDEX_ALIAS").unwrap_or_else(|_| DEFAULT_INDEX_ALIAS.to_string());
        let index_version = env::var("RELATIONSHIPS_INDEX_VERSION")
            .ok()
            .and_then(|v| v.parse::<u32>().ok())
            .unwrap_or(0);

        info!(
            opensearch_url = %opensearch_url,
            index_alias = %index_alias,
            index_version,
            connection_mode = ?connection_mode,
            retry_interval_secs = retry_interval,
            "Connecting to OpenSearch"
        );

        let provider = Self::connect_to_opensearch(
            &opensearch_url,
            IndexConfig::new(index_alias, index_version),
            connection_mode,
            Duration::from_secs(retry_interval),
        )
        .await?;

        info!("OpenSearch connection established");
        Ok(Box::new(provider))
    }

    /// Connect to OpenSearch with retry logic based on connection mode.
    async fn connect_to_opensearch(
        url: &str,
        index_config: IndexConfig,
        mode: ConnectionMode,
        retry_interval: Duration,
    ) -> Result<OpenSearchProvider, StartupError> {
        loop {
            match Self::try_connect_opensearch(url, index_config.clone()).await {
                Ok(provider) => return Ok(provider),
                Err(e) => match mode {
                    ConnectionMode::FailFast => {
                        return Err(StartupError::config(format!(
                            "Failed to connect to OpenSearch: {}",
                            e
                        )));
                    }
                    ConnectionMode::Retry => {
                        warn!(
                            opensearch_url = %url,
                            error = %e,
                            retry_interval_secs = retry_interval.as_secs(),
                            "Failed to connect to OpenSearch, retrying..."
                        );
                        sleep(retry_interval).await;
                    }
                },
            }
        }
    }

    /// Create the client and make sure the index and its alias exist.
    async fn try_connect_opensearch(
        url: &str,
        index_config: IndexConfig,
    ) -> Result<OpenSearchProvider, StartupError> {
        let provider = OpenSearchProvider::new(url, index_config)
            .await
            .map_err(|e| {
                StartupError::config(format!("Failed to create OpenSearch provider: {}", e))
            })?;
        provider
            .ensure_index_exists()
            .await
            .map_err(|e| StartupError::config(format!("Failed to ensure index exists: {}", e)))?;
        Ok(provider)
    }
}
