//! Error types for the broker.

use std::future::Future;
use std::time::Duration;

use broker_repository::StoreError;
use broker_search_repository::SearchIndexError;
use thiserror::Error;

/// Errors surfaced by the Group Model, the Merge Engine and the Index Sync Protocol.
///
/// `Validation` and `InvalidMerge` are fatal to the request. `Conflict`,
/// `IndexWrite` and `Timeout` may be retried (see [`BrokerError::is_retryable`]).
#[derive(Error, Debug)]
pub enum BrokerError {
    /// Malformed or conflicting group construction.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Attempt to merge groups of different kinds.
    #[error("Invalid merge: {0}")]
    InvalidMerge(String),

    /// A concurrent unit of work touched the same cluster. Nothing was applied.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Publishing or retracting index documents failed.
    #[error("Index write error: {0}")]
    IndexWrite(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    /// Relationship store failure.
    #[error("Store error: {0}")]
    Store(StoreError),

    /// Search index failure that retrying cannot fix.
    #[error("Search error: {0}")]
    Search(SearchIndexError),
}

impl BrokerError {
    /// Create a validation error.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create an invalid merge error.
    pub fn invalid_merge(msg: impl Into<String>) -> Self {
        Self::InvalidMerge(msg.into())
    }

    /// Create a conflict error.
    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    /// Create an index write error.
    pub fn index_write(msg: impl Into<String>) -> Self {
        Self::IndexWrite(msg.into())
    }

    /// Create a not found error.
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    /// Create a timeout error.
    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
    }

    /// Whether retrying the whole call may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Conflict(_) | Self::IndexWrite(_) | Self::Timeout(_)
        )
    }
}

impl From<StoreError> for BrokerError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Conflict(msg) => Self::Conflict(msg),
            StoreError::Validation(msg) => Self::Validation(msg),
            StoreError::NotFound(msg) => Self::NotFound(msg),
            other => Self::Store(other),
        }
    }
}

impl From<SearchIndexError> for BrokerError {
    fn from(err: SearchIndexError) -> Self {
        if err.is_permanent() {
            Self::Search(err)
        } else {
            Self::IndexWrite(err.to_string())
        }
    }
}

/// Run a store or index call, failing with `Timeout` once `limit` elapses.
pub async fn within<T, E, F>(limit: Duration, operation: &str, fut: F) -> Result<T, BrokerError>
where
    F: Future<Output = Result<T, E>>,
    E: Into<BrokerError>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result.map_err(Into::into),
        Err(_) => Err(BrokerError::timeout(format!(
            "{} did not complete within {:?}",
            operation, limit
        ))),
    }
}

/// Errors that can occur while wiring the broker at startup.
#[derive(Error, Debug)]
pub enum StartupError {
    /// Configuration error.
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Broker error while running a command.
    #[error("Broker error: {0}")]
    BrokerError(#[from] BrokerError),
}

impl StartupError {
    /// Create a configuration error.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::ConfigError(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_kinds() {
        assert!(BrokerError::conflict("x").is_retryable());
        assert!(BrokerError::index_write("x").is_retryable());
        assert!(BrokerError::timeout("x").is_retryable());
        assert!(!BrokerError::validation("x").is_retryable());
        assert!(!BrokerError::invalid_merge("x").is_retryable());
        assert!(!BrokerError::not_found("x").is_retryable());
    }

    #[test]
    fn test_store_errors_keep_their_kind() {
        let err: BrokerError = StoreError::conflict("group changed").into();
        assert!(matches!(err, BrokerError::Conflict(_)));

        let err: BrokerError = StoreError::validation("bad member").into();
        assert!(matches!(err, BrokerError::Validation(_)));

        let err: BrokerError = StoreError::serialization("bad json").into();
        assert!(matches!(err, BrokerError::Store(_)));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_search_errors() {
        let err: BrokerError = SearchIndexError::delete("timeout").into();
        assert!(matches!(err, BrokerError::IndexWrite(_)));
        assert!(err.is_retryable());

        let err: BrokerError = SearchIndexError::validation("bad key").into();
        assert!(matches!(err, BrokerError::Search(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_within_times_out() {
        let slow = async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok::<_, StoreError>(())
        };
        let err = within(Duration::from_secs(1), "commit", slow).await.unwrap_err();
        assert!(matches!(err, BrokerError::Timeout(_)));

        let fast = async { Err::<(), _>(StoreError::conflict("moved")) };
        let err = within(Duration::from_secs(1), "commit", fast).await.unwrap_err();
        assert!(matches!(err, BrokerError::Conflict(_)));
    }
}
