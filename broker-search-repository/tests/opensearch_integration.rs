//! Integration tests for the OpenSearch provider.
//!
//! These tests require a running OpenSearch node (`OPENSEARCH_URL`, default
//! `http://localhost:9200`). Each test works on its own alias.
//!
//! Run with: `cargo test --test opensearch_integration -- --ignored`

use std::env;

use broker_search_repository::opensearch::IndexConfig;
use broker_search_repository::{OpenSearchProvider, SearchIndexProvider};
use broker_shared::{GroupId, GroupKind, Relation, RelationshipDocument};
use serde_json::json;

async fn provider() -> OpenSearchProvider {
    let url = env::var("OPENSEARCH_URL").unwrap_or_else(|_| "http://localhost:9200".to_string());
    let alias = format!("relationships_test_{}", GroupId::new().to_string().replace('-', ""));
    let provider = OpenSearchProvider::new(&url, IndexConfig::new(alias, 0))
        .await
        .unwrap();
    provider.ensure_index_exists().await.unwrap();
    provider
}

fn citation(source: GroupId, target: GroupId) -> RelationshipDocument {
    RelationshipDocument::new(
        GroupKind::Identity,
        Relation::Cites,
        source,
        target,
        json!({"ID": source.to_string(), "Identifier": []}),
        json!({"ID": target.to_string(), "Identifier": []}),
        vec![],
    )
}

#[tokio::test]
#[ignore = "requires OpenSearch"]
async fn test_retraction_covers_bulk_writes_just_made() {
    let provider = provider().await;
    let (a, b) = (GroupId::new(), GroupId::new());

    let summary = provider
        .bulk_upsert_documents(&[citation(a, b)])
        .await
        .unwrap();
    assert_eq!(summary.succeeded, 1);

    let deleted = provider.delete_documents_referencing(&[a]).await.unwrap();

    assert_eq!(deleted, 1);
    assert!(provider.search_by_group(&b).await.unwrap().is_empty());
}

#[tokio::test]
#[ignore = "requires OpenSearch"]
async fn test_retraction_covers_single_writes_just_made() {
    let provider = provider().await;
    let (a, b) = (GroupId::new(), GroupId::new());

    provider.upsert_document(&citation(a, b)).await.unwrap();
    let deleted = provider.delete_documents_referencing(&[b]).await.unwrap();

    assert_eq!(deleted, 1);
    assert!(provider.search_by_group(&a).await.unwrap().is_empty());
}
