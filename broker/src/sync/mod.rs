//! Index sync: keep the search documents in line with the store after merges.
//!
//! A resync first retracts every document referencing an affected group, then
//! rebuilds the documents of the affected Version groups from a snapshot read
//! under their cluster locks. Retraction always completes before the rebuild
//! starts; if the rebuild fails the relationships stay unindexed until the
//! resync is retried.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use broker_search_repository::SearchIndexService;
use broker_shared::{ClusterSnapshot, GroupId, GroupKind, RelationshipDocument};
use futures::future::try_join_all;
use serde::Serialize;
use tracing::{debug, error, info, instrument, warn};

use crate::config::BrokerConfig;
use crate::document::build_document;
use crate::errors::{within, BrokerError};
use crate::merge::MergeEngine;

/// Outcome of one resync.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ResyncReport {
    /// Documents deleted by the retraction step.
    pub retracted: u64,
    /// Documents written successfully.
    pub published: usize,
    /// IDs of documents that could not be written.
    pub failed: Vec<String>,
}

impl ResyncReport {
    /// Turn per-document failures into an `IndexWrite` error.
    pub fn ensure_complete(self) -> Result<Self, BrokerError> {
        if self.failed.is_empty() {
            Ok(self)
        } else {
            Err(BrokerError::index_write(format!(
                "{} documents failed to publish: {}",
                self.failed.len(),
                self.failed.join(", ")
            )))
        }
    }
}

pub struct IndexSync {
    engine: Arc<MergeEngine>,
    search: Arc<SearchIndexService>,
    config: BrokerConfig,
}

impl IndexSync {
    pub fn new(
        engine: Arc<MergeEngine>,
        search: Arc<SearchIndexService>,
        config: BrokerConfig,
    ) -> Self {
        Self {
            engine,
            search,
            config,
        }
    }

    pub fn search(&self) -> &Arc<SearchIndexService> {
        &self.search
    }

    /// Retract and republish the documents of `affected` groups.
    ///
    /// # Arguments
    ///
    /// * `affected` - Group ids changed by a merge, retired ones included
    ///
    /// # Returns
    ///
    /// * `Ok(report)` - Retraction succeeded; `report.failed` lists documents
    ///   whose publication failed
    /// * `Err(BrokerError::IndexWrite)` - Retraction failed; nothing was rebuilt
    /// * `Err(_)` - The rebuild snapshot could not be read
    #[instrument(skip(self, affected), fields(groups = affected.len()))]
    pub async fn resync(&self, affected: &BTreeSet<GroupId>) -> Result<ResyncReport, BrokerError> {
        if affected.is_empty() {
            return Ok(ResyncReport::default());
        }
        let ids: Vec<GroupId> = affected.iter().copied().collect();

        let retracted = within(
            self.config.index_timeout,
            "retract documents",
            self.search.retract_groups(&ids),
        )
        .await
        .map_err(|e| {
            error!(error = %e, "Retraction failed, rebuild skipped");
            match e {
                BrokerError::Search(inner) => BrokerError::index_write(inner.to_string()),
                other => other,
            }
        })?;

        let live = self.live_ids(&ids).await?;
        if live.is_empty() {
            info!(retracted, "No live groups left to publish");
            return Ok(ResyncReport {
                retracted,
                ..Default::default()
            });
        }

        // Hold the cluster locks, neighbours included, while reading and
        // publishing, so a merge committed after this snapshot retracts what
        // is published here.
        let session = self.engine.begin(&live).await?;
        let snapshot = session.working().snapshot();
        let roots = version_roots(&live, snapshot, |id| session.resolved(id));
        let documents = self.collect_documents(snapshot, &roots);
        debug!(
            roots = roots.len(),
            documents = documents.len(),
            "Rebuilding documents"
        );

        let mut report = self.publish(documents).await;
        report.retracted = retracted;
        drop(session);

        if report.failed.is_empty() {
            info!(
                retracted = report.retracted,
                published = report.published,
                "Resync complete"
            );
        } else {
            warn!(
                retracted = report.retracted,
                published = report.published,
                failed = report.failed.len(),
                "Resync finished with failures"
            );
        }
        Ok(report)
    }

    /// Live ids among `ids`; ids the store never saw are dropped.
    async fn live_ids(&self, ids: &[GroupId]) -> Result<Vec<GroupId>, BrokerError> {
        let store = self.engine.store();
        let resolved = try_join_all(ids.iter().map(|id| async move {
            let live = within(self.config.store_timeout, "resolve", store.resolve(*id)).await?;
            if live.is_none() {
                debug!(group_id = %id, "Skipping unknown group");
            }
            Ok::<_, BrokerError>(live)
        }))
        .await?;
        let live: BTreeSet<GroupId> = resolved.into_iter().flatten().collect();
        Ok(live.into_iter().collect())
    }

    /// Documents for the Version relationships touching `roots` and the
    /// Identity relationships with an endpoint inside `roots`.
    fn collect_documents(
        &self,
        snapshot: &ClusterSnapshot,
        roots: &BTreeSet<GroupId>,
    ) -> Vec<RelationshipDocument> {
        let policy = self.config.metadata_policy.as_ref();
        let in_roots = |id: GroupId| roots.contains(&id);
        let contained_in_roots =
            |id: GroupId| snapshot.container_of(id).is_some_and(|vg| roots.contains(&vg));

        let mut documents: BTreeMap<String, RelationshipDocument> = BTreeMap::new();
        for relationship in snapshot.relationships.values() {
            let publish = match relationship.kind {
                GroupKind::Version => {
                    in_roots(relationship.source) || in_roots(relationship.target)
                }
                GroupKind::Identity => {
                    contained_in_roots(relationship.source)
                        || contained_in_roots(relationship.target)
                }
            };
            if publish {
                let document = build_document(relationship, snapshot, policy);
                documents.insert(document.id.clone(), document);
            }
        }
        documents.into_values().collect()
    }

    /// Write `documents` in batches. Failed writes are logged and reported;
    /// they never stop the remaining batches.
    async fn publish(&self, documents: Vec<RelationshipDocument>) -> ResyncReport {
        let mut report = ResyncReport::default();
        let batch_size = self.config.index_batch_size.max(1);

        let mut remaining = documents.into_iter().peekable();
        while remaining.peek().is_some() {
            let batch: Vec<RelationshipDocument> = remaining.by_ref().take(batch_size).collect();
            let ids: Vec<String> = batch.iter().map(|d| d.id.clone()).collect();

            match within(
                self.config.index_timeout,
                "publish documents",
                self.search.batch_upsert(batch),
            )
            .await
            {
                Ok(summary) => {
                    report.published += summary.succeeded;
                    for failure in summary.failures() {
                        error!(
                            document_id = %failure.document_id,
                            error = ?failure.error,
                            "Failed to publish document"
                        );
                        report.failed.push(failure.document_id.clone());
                    }
                }
                Err(e) => {
                    for id in &ids {
                        error!(document_id = %id, error = %e, "Failed to publish document");
                    }
                    report.failed.extend(ids);
                }
            }
        }
        report
    }
}

/// The Version groups whose documents are rebuilt: each live id, with Identity
/// groups replaced by their container.
fn version_roots(
    live: &[GroupId],
    snapshot: &ClusterSnapshot,
    resolve: impl Fn(GroupId) -> GroupId,
) -> BTreeSet<GroupId> {
    live.iter()
        .map(|id| resolve(*id))
        .filter_map(|id| {
            let group = snapshot.group(id)?;
            match group.kind {
                GroupKind::Version => Some(id),
                GroupKind::Identity => group.container,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use broker_repository::{GroupStore, MemoryGroupStore};
    use broker_search_repository::InMemorySearchProvider;
    use broker_shared::{Changeset, Group, GroupRelationship, Identifier, Relation};
    use serde_json::json;

    use crate::locks::ClusterLocks;

    struct Harness {
        store: Arc<MemoryGroupStore>,
        index: Arc<InMemorySearchProvider>,
        sync: IndexSync,
    }

    fn harness() -> Harness {
        let store = Arc::new(MemoryGroupStore::new());
        let index = Arc::new(InMemorySearchProvider::new());
        let config = BrokerConfig::default();
        let engine = Arc::new(MergeEngine::new(
            store.clone(),
            Arc::new(ClusterLocks::new()),
            config.clone(),
        ));
        let search = Arc::new(SearchIndexService::new(Box::new(index.clone())));
        Harness {
            store,
            index,
            sync: IndexSync::new(engine, search, config),
        }
    }

    /// Two singleton clusters with `a` citing `b` at both levels.
    /// Returns (ig_a, vg_a, ig_b, vg_b).
    async fn seed_citation(store: &MemoryGroupStore) -> (GroupId, GroupId, GroupId, GroupId) {
        let mut ig_a = Group::identity(vec![Identifier::doi("10.1/a")]);
        let vg_a = Group::version(vec![ig_a.id]);
        ig_a.container = Some(vg_a.id);
        let mut ig_b = Group::identity(vec![Identifier::doi("10.1/b")]);
        let vg_b = Group::version(vec![ig_b.id]);
        ig_b.container = Some(vg_b.id);

        let identity_rel =
            GroupRelationship::new(GroupKind::Identity, ig_a.id, ig_b.id, Relation::Cites);
        let mut version_rel =
            GroupRelationship::new(GroupKind::Version, vg_a.id, vg_b.id, Relation::Cites);
        version_rel.add_subrelationship(identity_rel.id);

        let ids = (ig_a.id, vg_a.id, ig_b.id, vg_b.id);
        store
            .commit(&Changeset {
                created_groups: vec![ig_a, vg_a, ig_b, vg_b],
                created_relationships: vec![identity_rel, version_rel],
                ..Default::default()
            })
            .await
            .unwrap();
        ids
    }

    #[tokio::test]
    async fn test_resync_publishes_both_groupings() {
        let h = harness();
        let (ig_a, vg_a, _, vg_b) = seed_citation(&h.store).await;

        let report = h.sync.resync(&BTreeSet::from([ig_a])).await.unwrap();

        assert_eq!(report.published, 2);
        assert!(report.failed.is_empty());
        let docs = h.index.documents().await;
        assert!(docs.iter().any(|d| d.grouping == GroupKind::Identity));
        let version = docs
            .iter()
            .find(|d| d.grouping == GroupKind::Version)
            .unwrap();
        assert_eq!(version.source_id(), Some(vg_a));
        assert_eq!(version.target_id(), Some(vg_b));
        assert_eq!(version.source["Identifier"][0]["ID"], "10.1/a");
    }

    #[tokio::test]
    async fn test_resync_is_idempotent() {
        let h = harness();
        let (_, vg_a, _, vg_b) = seed_citation(&h.store).await;
        let affected = BTreeSet::from([vg_a, vg_b]);

        h.sync.resync(&affected).await.unwrap();
        let first = h.index.documents().await;
        let report = h.sync.resync(&affected).await.unwrap();

        // Only the Version document references the affected ids; the
        // Identity document is overwritten in place.
        assert_eq!(report.retracted, 1);
        assert_eq!(report.published, 2);
        assert_eq!(h.index.documents().await, first);
    }

    #[tokio::test]
    async fn test_stale_documents_are_retracted() {
        let h = harness();
        let (_, vg_a, _, _) = seed_citation(&h.store).await;
        let gone = GroupId::new();
        let stale = RelationshipDocument::new(
            GroupKind::Version,
            Relation::Cites,
            gone,
            vg_a,
            json!({"ID": gone.to_string()}),
            json!({"ID": vg_a.to_string()}),
            vec![],
        );
        h.sync.search().upsert(&stale).await.unwrap();

        let report = h.sync.resync(&BTreeSet::from([gone, vg_a])).await.unwrap();

        assert_eq!(report.retracted, 1);
        assert!(h.index.document(&stale.id).await.is_none());
        assert!(h.index.documents().await.iter().all(|d| !d.references(gone)));
    }

    #[tokio::test]
    async fn test_failed_retraction_skips_rebuild() {
        let h = harness();
        let (_, vg_a, _, _) = seed_citation(&h.store).await;
        h.index.fail_next_retractions(1);

        let err = h.sync.resync(&BTreeSet::from([vg_a])).await.unwrap_err();

        assert!(matches!(err, BrokerError::IndexWrite(_)));
        assert!(h.index.is_empty().await);
    }

    #[tokio::test]
    async fn test_partial_publication_is_reported() {
        let h = harness();
        let (ig_a, vg_a, _, _) = seed_citation(&h.store).await;
        h.index.fail_upserts_for_group(ig_a).await;

        let report = h.sync.resync(&BTreeSet::from([vg_a])).await.unwrap();

        assert_eq!(report.published, 1);
        assert_eq!(report.failed.len(), 1);
        assert!(report.clone().ensure_complete().is_err());
    }

    #[tokio::test]
    async fn test_unknown_groups_only_retract() {
        let h = harness();
        let report = h
            .sync
            .resync(&BTreeSet::from([GroupId::new()]))
            .await
            .unwrap();
        assert_eq!(report, ResyncReport::default());
    }
}
