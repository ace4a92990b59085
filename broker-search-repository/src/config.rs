//! Configuration types for the SearchIndexService.

/// Configuration for the SearchIndexService.
///
/// Bounds the size of requests sent to the search backend. Upserts larger than
/// `max_batch_size` are rejected; callers split them into chunks.
#[derive(Debug, Clone)]
pub struct SearchIndexServiceConfig {
    /// Maximum number of documents in a single bulk upsert.
    ///
    /// `None` disables the limit. Defaults to 1000.
    pub max_batch_size: Option<usize>,
    /// Maximum number of group ids in a single retraction query.
    ///
    /// OpenSearch rejects `terms` queries above `index.max_terms_count`
    /// (65536 by default). Larger retractions are split by the service.
    pub max_retraction_ids: usize,
}

impl Default for SearchIndexServiceConfig {
    fn default() -> Self {
        Self {
            max_batch_size: Some(1000),
            max_retraction_ids: 1024,
        }
    }
}

impl SearchIndexServiceConfig {
    /// Create a config with no batch size limit.
    ///
    /// # Warning
    ///
    /// Very large bulk requests can time out on the backend. Not recommended for production.
    pub fn unlimited() -> Self {
        Self {
            max_batch_size: None,
            ..Self::default()
        }
    }

    /// Create a config with a custom batch size limit.
    ///
    /// # Arguments
    ///
    /// * `max_batch_size` - Maximum number of documents allowed in a single bulk upsert
    pub fn with_max_batch_size(max_batch_size: usize) -> Self {
        Self {
            max_batch_size: Some(max_batch_size),
            ..Self::default()
        }
    }
}
