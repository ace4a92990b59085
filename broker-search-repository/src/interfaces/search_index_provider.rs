//! Search index provider trait definition.
//!
//! This module defines the abstract interface for relationship document
//! storage, allowing for different backend implementations (OpenSearch,
//! in-memory, mocks in tests).

use async_trait::async_trait;
use broker_shared::{GroupId, RelationshipDocument};

use crate::errors::SearchIndexError;
use crate::types::BatchOperationSummary;

/// Abstracts the underlying search index implementation.
///
/// Implementations are injected into `SearchIndexService` to enable dependency
/// injection and easy testing with mock implementations.
///
/// # Document Identity
///
/// Documents are keyed by `RelationshipDocument::id`. Upserting a document
/// whose key already exists replaces it (last writer wins), so republishing
/// a relationship never produces a second live document.
///
/// # Index Initialization
///
/// Call `ensure_index_exists` during application startup, before any
/// document operation.
#[async_trait]
pub trait SearchIndexProvider: Send + Sync {
    /// Ensure the search index and any required aliases exist, creating them if necessary.
    async fn ensure_index_exists(&self) -> Result<(), SearchIndexError>;

    /// Create or replace a single document.
    async fn upsert_document(&self, document: &RelationshipDocument)
        -> Result<(), SearchIndexError>;

    /// Create or replace multiple documents and return a summary of successful
    /// and failed operations.
    ///
    /// # Returns
    ///
    /// * `Ok(BatchOperationSummary)` - Per-document results; individual failures do not abort the batch
    /// * `Err(SearchIndexError)` - If the bulk request fails entirely
    async fn bulk_upsert_documents(
        &self,
        documents: &[RelationshipDocument],
    ) -> Result<BatchOperationSummary, SearchIndexError>;

    /// Delete every document whose `Source.ID` or `Target.ID` is one of `group_ids`.
    ///
    /// # Returns
    ///
    /// * `Ok(count)` - The number of documents deleted
    /// * `Err(SearchIndexError)` - If the deletion could not be completed
    async fn delete_documents_referencing(
        &self,
        group_ids: &[GroupId],
    ) -> Result<u64, SearchIndexError>;

    /// Fetch the documents whose `Source.ID` or `Target.ID` is `group_id`.
    async fn search_by_group(
        &self,
        group_id: &GroupId,
    ) -> Result<Vec<RelationshipDocument>, SearchIndexError>;
}

/// Shared providers, so a caller can keep a handle on the backend it hands to
/// [`crate::SearchIndexService`].
#[async_trait]
impl<T: SearchIndexProvider + ?Sized> SearchIndexProvider for std::sync::Arc<T> {
    async fn ensure_index_exists(&self) -> Result<(), SearchIndexError> {
        (**self).ensure_index_exists().await
    }

    async fn upsert_document(
        &self,
        document: &RelationshipDocument,
    ) -> Result<(), SearchIndexError> {
        (**self).upsert_document(document).await
    }

    async fn bulk_upsert_documents(
        &self,
        documents: &[RelationshipDocument],
    ) -> Result<BatchOperationSummary, SearchIndexError> {
        (**self).bulk_upsert_documents(documents).await
    }

    async fn delete_documents_referencing(
        &self,
        group_ids: &[GroupId],
    ) -> Result<u64, SearchIndexError> {
        (**self).delete_documents_referencing(group_ids).await
    }

    async fn search_by_group(
        &self,
        group_id: &GroupId,
    ) -> Result<Vec<RelationshipDocument>, SearchIndexError> {
        (**self).search_by_group(group_id).await
    }
}
