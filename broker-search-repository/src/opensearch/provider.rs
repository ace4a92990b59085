//! OpenSearch provider implementation.
//!
//! This module provides the concrete implementation of `SearchIndexProvider`
//! using the OpenSearch Rust crate.

use std::collections::HashMap;

use async_trait::async_trait;
use broker_shared::{GroupId, RelationshipDocument};
use opensearch::{
    http::request::JsonBody,
    http::transport::{SingleNodeConnectionPool, TransportBuilder},
    indices::{
        IndicesCreateParts, IndicesExistsAliasParts, IndicesPutAliasParts, IndicesRefreshParts,
    },
    params::Refresh,
    BulkParts, DeleteByQueryParts, IndexParts, OpenSearch, SearchParts,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, error, info, warn};
use url::Url;

use crate::errors::SearchIndexError;
use crate::interfaces::SearchIndexProvider;
use crate::opensearch::index_config::{get_index_settings, IndexConfig};
use crate::types::{BatchOperationResult, BatchOperationSummary};
use crate::utils;

/// Upper bound on documents returned by `search_by_group` (the default
/// `index.max_result_window`).
const MAX_SEARCH_RESULTS: usize = 10_000;

/// OpenSearch provider implementation.
///
/// All operations go through the configured alias, which `ensure_index_exists`
/// points at the versioned index.
///
/// # Example
///
/// ```ignore
/// use broker_search_repository::opensearch::{IndexConfig, OpenSearchProvider};
///
/// let provider = OpenSearchProvider::new("http://localhost:9200", IndexConfig::new("relationships", 0)).await?;
/// provider.ensure_index_exists().await?;
/// provider.delete_documents_referencing(&[retired_group_id]).await?;
/// ```
pub struct OpenSearchProvider {
    client: OpenSearch,
    index_config: IndexConfig,
}

#[derive(Debug, Deserialize)]
struct BulkResponse {
    #[serde(default)]
    items: Vec<HashMap<String, BulkItem>>,
}

#[derive(Debug, Deserialize)]
struct BulkItem {
    #[serde(rename = "_id")]
    id: Option<String>,
    status: u16,
    error: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct DeleteByQueryResponse {
    #[serde(default)]
    deleted: u64,
    #[serde(default)]
    failures: Vec<Value>,
}

impl OpenSearchProvider {
    /// Create a new OpenSearch provider connected to the specified URL.
    ///
    /// # Arguments
    ///
    /// * `url` - The OpenSearch server URL (e.g., "http://localhost:9200")
    /// * `index_config` - The index configuration containing alias and version
    ///
    /// # Returns
    ///
    /// * `Ok(OpenSearchProvider)` - A new provider instance
    /// * `Err(SearchIndexError)` - If connection setup fails
    pub async fn new(url: &str, index_config: IndexConfig) -> Result<Self, SearchIndexError> {
        let parsed_url =
            Url::parse(url).map_err(|e| SearchIndexError::connection(e.to_string()))?;

        let conn_pool = SingleNodeConnectionPool::new(parsed_url);
        let transport = TransportBuilder::new(conn_pool)
            .disable_proxy()
            .build()
            .map_err(|e| SearchIndexError::connection(e.to_string()))?;

        let client = OpenSearch::new(transport);

        info!(
            url = %url,
            alias = %index_config.alias,
            version = index_config.version,
            "Created OpenSearch provider"
        );

        Ok(Self {
            client,
            index_config,
        })
    }

    /// Make every write acknowledged so far visible to search.
    async fn refresh(&self) -> Result<(), SearchIndexError> {
        let response = self
            .client
            .indices()
            .refresh(IndicesRefreshParts::Index(&[&self.index_config.alias]))
            .send()
            .await
            .map_err(|e| SearchIndexError::delete(e.to_string()))?;

        let status = response.status_code();
        if !status.is_success() {
            let error_body = response.text().await.unwrap_or_default();
            error!(status = %status, body = %error_body, "Refresh failed");
            return Err(SearchIndexError::delete(format!(
                "Refresh failed with status {}: {}",
                status, error_body
            )));
        }
        Ok(())
    }

    /// Query matching documents with either endpoint in `group_ids`.
    fn referencing_query(group_ids: &[GroupId]) -> Value {
        let ids: Vec<String> = group_ids.iter().map(|id| id.to_string()).collect();
        json!({
            "bool": {
                "should": [
                    { "terms": { "Source.ID": ids } },
                    { "terms": { "Target.ID": ids } }
                ],
                "minimum_should_match": 1
            }
        })
    }

    /// Build the NDJSON lines of a bulk index request.
    ///
    /// Documents that fail validation are reported in the returned results and
    /// left out of the body.
    fn bulk_body(
        documents: &[RelationshipDocument],
    ) -> (Vec<JsonBody<Value>>, Vec<String>, Vec<BatchOperationResult>) {
        let mut body = Vec::with_capacity(documents.len() * 2);
        let mut sent = Vec::with_capacity(documents.len());
        let mut rejected = Vec::new();

        for document in documents {
            if let Err(e) = utils::parse_endpoint_ids(document) {
                rejected.push(BatchOperationResult::failed(document.id.clone(), e));
                continue;
            }
            let source = match serde_json::to_value(document) {
                Ok(source) => source,
                Err(e) => {
                    rejected.push(BatchOperationResult::failed(
                        document.id.clone(),
                        SearchIndexError::serialization(e.to_string()),
                    ));
                    continue;
                }
            };
            body.push(JsonBody::new(json!({ "index": { "_id": document.id } })));
            body.push(JsonBody::new(source));
            sent.push(document.id.clone());
        }
        (body, sent, rejected)
    }

    fn item_result(fallback_id: &str, item: Option<&BulkItem>) -> BatchOperationResult {
        match item {
            Some(item) => {
                let id = item.id.clone().unwrap_or_else(|| fallback_id.to_string());
                if (200..300).contains(&item.status) && item.error.is_none() {
                    BatchOperationResult::succeeded(id)
                } else {
                    let reason = item
                        .error
                        .as_ref()
                        .map(|e| e.to_string())
                        .unwrap_or_else(|| format!("status {}", item.status));
                    BatchOperationResult::failed(id, SearchIndexError::index(reason))
                }
            }
            None => BatchOperationResult::failed(
                fallback_id,
                SearchIndexError::parse("Missing item in bulk response"),
            ),
        }
    }
}

#[async_trait]
impl SearchIndexProvider for OpenSearchProvider {
    /// Create the versioned index and point the alias at it, unless the alias
    /// already exists.
    async fn ensure_index_exists(&self) -> Result<(), SearchIndexError> {
        let alias = self.index_config.alias.as_str();
        let response = self
            .client
            .indices()
            .exists_alias(IndicesExistsAliasParts::Name(&[alias]))
            .send()
            .await
            .map_err(|e| SearchIndexError::connection(e.to_string()))?;
        if response.status_code().is_success() {
            debug!(alias = %alias, "Index alias already exists");
            return Ok(());
        }

        let index_name = self.index_config.versioned_index_name();
        let response = self
            .client
            .indices()
            .create(IndicesCreateParts::Index(&index_name))
            .body(get_index_settings())
            .send()
            .await
            .map_err(|e| SearchIndexError::index_creation(e.to_string()))?;
        let status = response.status_code();
        if !status.is_success() {
            let error_body = response.text().await.unwrap_or_default();
            if !error_body.contains("resource_already_exists_exception") {
                error!(status = %status, body = %error_body, "Index creation failed");
                return Err(SearchIndexError::index_creation(format!(
                    "Index creation failed with status {}: {}",
                    status, error_body
                )));
            }
        }

        let response = self
            .client
            .indices()
            .put_alias(IndicesPutAliasParts::IndexName(&[&index_name], alias))
            .send()
            .await
            .map_err(|e| SearchIndexError::index_creation(e.to_string()))?;
        let status = response.status_code();
        if !status.is_success() {
            let error_body = response.text().await.unwrap_or_default();
            error!(status = %status, body = %error_body, "Alias creation failed");
            return Err(SearchIndexError::index_creation(format!(
                "Alias creation failed with status {}: {}",
                status, error_body
            )));
        }

        info!(index = %index_name, alias = %alias, "Created search index");
        Ok(())
    }

    async fn upsert_document(
        &self,
        document: &RelationshipDocument,
    ) -> Result<(), SearchIndexError> {
        utils::parse_endpoint_ids(document)?;

        let response = self
            .client
            .index(IndexParts::IndexId(&self.index_config.alias, &document.id))
            .refresh(Refresh::WaitFor)
            .body(document)
            .send()
            .await
            .map_err(|e| SearchIndexError::index(e.to_string()))?;

        let status = response.status_code();
        if !status.is_success() {
            let error_body = response.text().await.unwrap_or_default();
            error!(
                status = %status,
                body = %error_body,
                doc_id = %document.id,
                "Index request failed"
            );
            return Err(SearchIndexError::index(format!(
                "Index failed with status {}: {}",
                status, error_body
            )));
        }

        debug!(doc_id = %document.id, "Document indexed");
        Ok(())
    }

    /// Index documents with one `_bulk` request and report per-document results.
    async fn bulk_upsert_documents(
        &self,
        documents: &[RelationshipDocument],
    ) -> Result<BatchOperationSummary, SearchIndexError> {
        let (body, sent, mut results) = Self::bulk_body(documents);
        if sent.is_empty() {
            return Ok(BatchOperationSummary::from_results(results));
        }

        let response = self
            .client
            .bulk(BulkParts::Index(&self.index_config.alias))
            .refresh(Refresh::WaitFor)
            .body(body)
            .send()
            .await
            .map_err(|e| SearchIndexError::bulk_index(e.to_string()))?;

        let status = response.status_code();
        if !status.is_success() {
            let error_body = response.text().await.unwrap_or_default();
            error!(status = %status, body = %error_body, "Bulk request failed");
            return Err(SearchIndexError::bulk_index(format!(
                "Bulk request failed with status {}: {}",
                status, error_body
            )));
        }

        let parsed: BulkResponse = response
            .json()
            .await
            .map_err(|e| SearchIndexError::parse(e.to_string()))?;

        for (i, doc_id) in sent.iter().enumerate() {
            let item = parsed.items.get(i).and_then(|m| m.get("index"));
            results.push(Self::item_result(doc_id, item));
        }

        let summary = BatchOperationSummary::from_results(results);
        if summary.failed > 0 {
            warn!(
                total = summary.total,
                failed = summary.failed,
                "Bulk upsert completed with failures"
            );
        } else {
            debug!(total = summary.total, "Bulk upsert completed");
        }
        Ok(summary)
    }

    async fn delete_documents_referencing(
        &self,
        group_ids: &[GroupId],
    ) -> Result<u64, SearchIndexError> {
        if group_ids.is_empty() {
            return Ok(0);
        }

        // Delete-by-query only sees refreshed documents.
        self.refresh().await?;

        // Version conflicts abort the request; the caller retries the whole retraction.
        let response = self
            .client
            .delete_by_query(DeleteByQueryParts::Index(&[&self.index_config.alias]))
            .refresh(true)
            .body(json!({ "query": Self::referencing_query(group_ids) }))
            .send()
            .await
            .map_err(|e| SearchIndexError::delete(e.to_string()))?;

        let status = response.status_code();
        if !status.is_success() {
            let error_body = response.text().await.unwrap_or_default();
            error!(status = %status, body = %error_body, "Delete by query failed");
            return Err(SearchIndexError::delete(format!(
                "Delete by query failed with status {}: {}",
                status, error_body
            )));
        }

        let parsed: DeleteByQueryResponse = response
            .json()
            .await
            .map_err(|e| SearchIndexError::parse(e.to_string()))?;
        if !parsed.failures.is_empty() {
            return Err(SearchIndexError::delete(format!(
                "Delete by query reported {} failures: {}",
                parsed.failures.len(),
                Value::Array(parsed.failures)
            )));
        }

        debug!(groups = group_ids.len(), deleted = parsed.deleted, "Documents retracted");
        Ok(parsed.deleted)
    }

    async fn search_by_group(
        &self,
        group_id: &GroupId,
    ) -> Result<Vec<RelationshipDocument>, SearchIndexError> {
        let response = self
            .client
            .search(SearchParts::Index(&[&self.index_config.alias]))
            .body(json!({
                "size": MAX_SEARCH_RESULTS,
                "query": Self::referencing_query(std::slice::from_ref(group_id))
            }))
            .send()
            .await
            .map_err(|e| SearchIndexError::search(e.to_string()))?;

        let status = response.status_code();
        if !status.is_success() {
            let error_body = response.text().await.unwrap_or_default();
            return Err(SearchIndexError::search(format!(
                "Search failed with status {}: {}",
                status, error_body
            )));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| SearchIndexError::parse(e.to_string()))?;
        let hits = body["hits"]["hits"].as_array().cloned().unwrap_or_default();
        hits.into_iter()
            .map(|hit| {
                serde_json::from_value(hit["_source"].clone())
                    .map_err(|e| SearchIndexError::parse(e.to_string()))
            })
            .collect()
    }
}
