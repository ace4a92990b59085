//! Search index service implementation.
//!
//! This module provides the main service for interacting with the relationship
//! index. The broker uses it to publish rebuilt documents and to retract every
//! document that references a set of groups.
//!
//! # Note on Document Updates
//!
//! There is no separate `create` or `update` function. Documents are rebuilt in
//! full from the relationship store and replaced by key, so every write is an
//! upsert.

use broker_shared::{GroupId, RelationshipDocument};
use tracing::debug;

use crate::config::SearchIndexServiceConfig;
use crate::errors::SearchIndexError;
use crate::interfaces::SearchIndexProvider;
use crate::types::BatchOperationSummary;
use crate::utils;

/// The main service for interacting with the search index.
///
/// Provides input validation and request sizing, and delegates to a
/// `SearchIndexProvider` for the backend operations.
///
/// # Example
///
/// ```no_run
/// use broker_search_repository::SearchIndexService;
/// use broker_search_repository::opensearch::{IndexConfig, OpenSearchProvider};
///
/// # async fn example(group: broker_shared::GroupId) -> Result<(), Box<dyn std::error::Error>> {
/// let config = IndexConfig::new("relationships", 0);
/// let provider = Box::new(OpenSearchProvider::new("http://localhost:9200", config).await?);
/// let service = SearchIndexService::new(provider);
///
/// service.ensure_index().await?;
/// let deleted = service.retract_groups(&[group]).await?;
/// # Ok(())
/// # }
/// ```
pub struct SearchIndexService {
    provider: Box<dyn SearchIndexProvider>,
    config: SearchIndexServiceConfig,
}

impl SearchIndexService {
    /// Create a new SearchIndexService with default configuration.
    ///
    /// The default configuration includes a batch size limit of 1000 documents.
    pub fn new(provider: Box<dyn SearchIndexProvider>) -> Self {
        Self {
            provider,
            config: SearchIndexServiceConfig::default(),
        }
    }

    /// Create a new SearchIndexService with custom configuration.
    ///
    /// # Arguments
    ///
    /// * `provider` - A boxed implementation of `SearchIndexProvider` (e.g., `OpenSearchProvider`)
    /// * `config` - Custom configuration for the service
    pub fn with_config(
        provider: Box<dyn SearchIndexProvider>,
        config: SearchIndexServiceConfig,
    ) -> Self {
        Self { provider, config }
    }

    pub fn config(&self) -> &SearchIndexServiceConfig {
        &self.config
    }

    /// Check if batch size exceeds the configured limit.
    fn validate_batch_size(&self, size: usize) -> Result<(), SearchIndexError> {
        if let Some(max) = self.config.max_batch_size {
            if size > max {
                return Err(SearchIndexError::batch_size_exceeded(size, max));
            }
        }
        Ok(())
    }

    /// Ensure the backing index exists. Call once at startup.
    pub async fn ensure_index(&self) -> Result<(), SearchIndexError> {
        self.provider.ensure_index_exists().await
    }

    /// Create or replace a single relationship document.
    ///
    /// # Returns
    ///
    /// * `Ok(())` - If the document was stored
    /// * `Err(SearchIndexError::ValidationError)` - If the endpoints or key are invalid
    /// * `Err(SearchIndexError)` - If the operation fails
    pub async fn upsert(&self, document: &RelationshipDocument) -> Result<(), SearchIndexError> {
        utils::parse_endpoint_ids(document)?;
        self.provider.upsert_document(document).await
    }

    /// Create or replace multiple documents and return a summary of successful
    /// and failed operations.
    ///
    /// # Returns
    ///
    /// * `Ok(BatchOperationSummary)` - Per-document results
    /// * `Err(SearchIndexError::BatchSizeExceeded)` - If the batch size exceeds the configured maximum
    /// * `Err(SearchIndexError::ValidationError)` - If any document is invalid
    /// * `Err(SearchIndexError)` - If the bulk operation fails entirely
    ///
    /// # Note
    ///
    /// Individual failures are reported in the summary rather than failing the
    /// whole call. Callers that publish more than `max_batch_size` documents
    /// split them first.
    pub async fn batch_upsert(
        &self,
        documents: Vec<RelationshipDocument>,
    ) -> Result<BatchOperationSummary, SearchIndexError> {
        if documents.is_empty() {
            return Ok(BatchOperationSummary::default());
        }

        self.validate_batch_size(documents.len())?;

        for document in &documents {
            utils::parse_endpoint_ids(document)?;
        }

        self.provider.bulk_upsert_documents(&documents).await
    }

    /// Delete every document with an endpoint in `group_ids`.
    ///
    /// Large id sets are split into several queries of at most
    /// `max_retraction_ids` ids. The first failing query aborts the call; the
    /// retraction is idempotent, so the caller retries it as a whole.
    ///
    /// # Returns
    ///
    /// * `Ok(count)` - Total number of deleted documents
    /// * `Err(SearchIndexError)` - If any query fails
    pub async fn retract_groups(&self, group_ids: &[GroupId]) -> Result<u64, SearchIndexError> {
        if group_ids.is_empty() {
            return Ok(0);
        }

        let chunk_size = self.config.max_retraction_ids.max(1);
        let mut deleted = 0;
        for chunk in group_ids.chunks(chunk_size) {
            deleted += self.provider.delete_documents_referencing(chunk).await?;
        }
        debug!(groups = group_ids.len(), deleted, "Retracted group documents");
        Ok(deleted)
    }

    /// Fetch the documents that reference `group_id` on either side.
    pub async fn search_by_group(
        &self,
        group_id: &GroupId,
    ) -> Result<Vec<RelationshipDocument>, SearchIndexError> {
        self.provider.search_by_group(group_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::BatchOperationResult;
    use async_trait::async_trait;
    use broker_shared::{GroupKind, Relation};
    use serde_json::json;
    use std::sync::Arc;
    use tokio::sync::Mutex;

    /// Mock provider for testing
    struct MockProvider {
        upserted: Arc<Mutex<Vec<String>>>,
        retraction_calls: Arc<Mutex<Vec<usize>>>,
        should_fail: bool,
    }

    impl MockProvider {
        fn new() -> Self {
            Self {
                upserted: Arc::new(Mutex::new(Vec::new())),
                retraction_calls: Arc::new(Mutex::new(Vec::new())),
                should_fail: false,
            }
        }
    }

    #[async_trait]
    impl SearchIndexProvider for MockProvider {
        async fn ensure_index_exists(&self) -> Result<(), SearchIndexError> {
            Ok(())
        }

        async fn upsert_document(
            &self,
            document: &RelationshipDocument,
        ) -> Result<(), SearchIndexError> {
            if self.should_fail {
                return Err(SearchIndexError::index("Mock failure"));
            }
            self.upserted.lock().await.push(document.id.clone());
            Ok(())
        }

        async fn bulk_upsert_documents(
            &self,
            documents: &[RelationshipDocument],
        ) -> Result<BatchOperationSummary, SearchIndexError> {
            if self.should_fail {
                return Err(SearchIndexError::bulk_index("Mock failure"));
            }
            let mut results = Vec::new();
            for document in documents {
                self.upserted.lock().await.push(document.id.clone());
                results.push(BatchOperationResult::succeeded(document.id.clone()));
            }
            Ok(BatchOperationSummary::from_results(results))
        }

        async fn delete_documents_referencing(
            &self,
            group_ids: &[GroupId],
        ) -> Result<u64, SearchIndexError> {
            if self.should_fail {
                return Err(SearchIndexError::delete("Mock failure"));
            }
            self.retraction_calls.lock().await.push(group_ids.len());
            Ok(group_ids.len() as u64)
        }

        async fn search_by_group(
            &self,
            _group_id: &GroupId,
        ) -> Result<Vec<RelationshipDocument>, SearchIndexError> {
            Ok(vec![])
        }
    }

    fn create_test_document() -> RelationshipDocument {
        let source = GroupId::new();
        let target = GroupId::new();
        RelationshipDocument::new(
            GroupKind::Version,
            Relation::IsSupplementTo,
            source,
            target,
            json!({"ID": source.to_string()}),
            json!({"ID": target.to_string()}),
            vec![],
        )
    }

    #[tokio::test]
    async fn test_batch_upsert_empty() {
        let service = SearchIndexService::new(Box::new(MockProvider::new()));

        let result = service.batch_upsert(vec![]).await.unwrap();

        assert_eq!(result.total, 0);
        assert_eq!(result.succeeded, 0);
        assert_eq!(result.failed, 0);
        assert!(result.results.is_empty());
    }

    #[tokio::test]
    async fn test_batch_upsert_multiple() {
        let provider = MockProvider::new();
        let upserted = provider.upserted.clone();
        let service = SearchIndexService::new(Box::new(provider));

        let documents = vec![
            create_test_document(),
            create_test_document(),
            create_test_document(),
        ];
        let result = service.batch_upsert(documents).await.unwrap();

        assert_eq!(result.total, 3);
        assert_eq!(result.succeeded, 3);
        assert_eq!(upserted.lock().await.len(), 3);
    }

    #[tokio::test]
    async fn test_batch_upsert_rejects_mismatched_key() {
        let service = SearchIndexService::new(Box::new(MockProvider::new()));

        let mut document = create_test_document();
        document.id = "not-a-key".to_string();

        let err = service.batch_upsert(vec![document]).await.unwrap_err();
        assert!(matches!(err, SearchIndexError::ValidationError(_)));
    }

    #[tokio::test]
    async fn test_upsert_validation() {
        let service = SearchIndexService::new(Box::new(MockProvider::new()));

        let mut document = create_test_document();
        document.target = json!({"ID": "not-a-uuid"});
        assert!(service.upsert(&document).await.is_err());

        assert!(service.upsert(&create_test_document()).await.is_ok());
    }

    #[tokio::test]
    async fn test_batch_size_exceeded() {
        let service = SearchIndexService::with_config(
            Box::new(MockProvider::new()),
            SearchIndexServiceConfig::with_max_batch_size(2),
        );

        let documents = (0..3).map(|_| create_test_document()).collect();
        let err = service.batch_upsert(documents).await.unwrap_err();
        assert!(matches!(
            err,
            SearchIndexError::BatchSizeExceeded {
                provided: 3,
                max: 2
            }
        ));
    }

    #[tokio::test]
    async fn test_retraction_is_chunked() {
        let provider = MockProvider::new();
        let calls = provider.retraction_calls.clone();
        let config = SearchIndexServiceConfig {
            max_retraction_ids: 2,
            ..SearchIndexServiceConfig::default()
        };
        let service = SearchIndexService::with_config(Box::new(provider), config);

        let ids: Vec<GroupId> = (0..5).map(|_| GroupId::new()).collect();
        let deleted = service.retract_groups(&ids).await.unwrap();

        assert_eq!(deleted, 5);
        assert_eq!(*calls.lock().await, vec![2, 2, 1]);
        assert_eq!(service.retract_groups(&[]).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_provider_failure_is_propagated() {
        let mut provider = MockProvider::new();
        provider.should_fail = true;
        let service = SearchIndexService::new(Box::new(provider));

        assert!(service.retract_groups(&[GroupId::new()]).await.is_err());
        assert!(service
            .batch_upsert(vec![create_test_document()])
            .await
            .is_err());
    }
}
