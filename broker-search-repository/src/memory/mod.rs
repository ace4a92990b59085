//! In-memory search index.
//!
//! Keeps relationship documents in a sorted map keyed by document ID. Used by
//! tests and local runs without `OPENSEARCH_URL`. Failures can be injected to
//! exercise partial publication and failed retraction.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use broker_shared::{GroupId, RelationshipDocument};
use tokio::sync::RwLock;
use tracing::debug;

use crate::errors::SearchIndexError;
use crate::interfaces::SearchIndexProvider;
use crate::types::{BatchOperationResult, BatchOperationSummary};
use crate::utils;

#[derive(Debug, Default)]
pub struct InMemorySearchProvider {
    documents: RwLock<BTreeMap<String, RelationshipDocument>>,
    failing_groups: RwLock<HashSet<GroupId>>,
    failing_retractions: AtomicUsize,
}

impl InMemorySearchProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject every upsert of a document with `group` as an endpoint.
    pub async fn fail_upserts_for_group(&self, group: GroupId) {
        self.failing_groups.write().await.insert(group);
    }

    /// Fail the next `count` calls to `delete_documents_referencing`.
    pub fn fail_next_retractions(&self, count: usize) {
        self.failing_retractions.store(count, Ordering::SeqCst);
    }

    /// Remove all injected failures.
    pub async fn clear_failures(&self) {
        self.failing_groups.write().await.clear();
        self.failing_retractions.store(0, Ordering::SeqCst);
    }

    /// All stored documents, ordered by document ID.
    pub async fn documents(&self) -> Vec<RelationshipDocument> {
        self.documents.read().await.values().cloned().collect()
    }

    pub async fn document(&self, id: &str) -> Option<RelationshipDocument> {
        self.documents.read().await.get(id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.documents.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.documents.read().await.is_empty()
    }

    async fn check_upsert(&self, document: &RelationshipDocument) -> Result<(), SearchIndexError> {
        let (source, target) = utils::parse_endpoint_ids(document)?;
        let failing = self.failing_groups.read().await;
        if failing.contains(&source) || failing.contains(&target) {
            return Err(SearchIndexError::index(format!(
                "Injected failure for document {}",
                document.id
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl SearchIndexProvider for InMemorySearchProvider {
    async fn ensure_index_exists(&self) -> Result<(), SearchIndexError> {
        Ok(())
    }

    async fn upsert_document(
        &self,
        document: &RelationshipDocument,
    ) -> Result<(), SearchIndexError> {
        self.check_upsert(document).await?;
        self.documents
            .write()
            .await
            .insert(document.id.clone(), document.clone());
        Ok(())
    }

    async fn bulk_upsert_documents(
        &self,
        documents: &[RelationshipDocument],
    ) -> Result<BatchOperationSummary, SearchIndexError> {
        let mut results = Vec::with_capacity(documents.len());
        for document in documents {
            match self.check_upsert(document).await {
                Ok(()) => {
                    self.documents
                        .write()
                        .await
                        .insert(document.id.clone(), document.clone());
                    results.push(BatchOperationResult::succeeded(document.id.clone()));
                }
                Err(e) => results.push(BatchOperationResult::failed(document.id.clone(), e)),
            }
        }
        Ok(BatchOperationSummary::from_results(results))
    }

    async fn delete_documents_referencing(
        &self,
        group_ids: &[GroupId],
    ) -> Result<u64, SearchIndexError> {
        let remaining = self.failing_retractions.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failing_retractions.store(remaining - 1, Ordering::SeqCst);
            return Err(SearchIndexError::delete("Injected retraction failure"));
        }

        let targets: HashSet<GroupId> = group_ids.iter().copied().collect();
        let mut documents = self.documents.write().await;
        let before = documents.len();
        documents.retain(|_, doc| {
            !doc.source_id().is_some_and(|id| targets.contains(&id))
                && !doc.target_id().is_some_and(|id| targets.contains(&id))
        });
        let deleted = (before - documents.len()) as u64;
        debug!(groups = group_ids.len(), deleted, "Documents retracted");
        Ok(deleted)
    }

    async fn search_by_group(
        &self,
        group_id: &GroupId,
    ) -> Result<Vec<RelationshipDocument>, SearchIndexError> {
        Ok(self
            .documents
            .read()
            .await
            .values()
            .filter(|doc| doc.references(*group_id))
            .cloned()
            .collect())
    }
}
