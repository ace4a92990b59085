//! The ingestion facade.
//!
//! [`Broker`] turns observed facts into group merges and relationship history,
//! commits each fact as one unit of work, and then resyncs the search index for
//! the groups it affected. Index failures never undo a commit: the affected
//! groups are kept as pending and resynced again by
//! [`Broker::retry_pending_resyncs`] or the next resync touching them.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use broker_repository::GroupStore;
use broker_search_repository::SearchIndexService;
use broker_shared::{
    Fact, GroupId, GroupKind, Identifier, RawFact, Relation, RelationshipKey,
};
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, error, info, instrument, warn};

use crate::config::BrokerConfig;
use crate::errors::{within, BrokerError};
use crate::locks::ClusterLocks;
use crate::merge::{MergeEngine, MergeResult, MergeSession, LOCK_ATTEMPTS};
use crate::model::{overlay_metadata, WorkingSet};
use crate::sync::{IndexSync, ResyncReport};

/// Result of a committed unit of work.
#[derive(Debug)]
pub struct ObserveOutcome {
    /// What the store commit changed.
    pub result: MergeResult,
    /// Outcome of the index resync that followed the commit. An error here
    /// leaves the affected groups pending; the commit stands.
    pub resync: Result<ResyncReport, BrokerError>,
}

impl ObserveOutcome {
    /// Whether the index caught up with the commit.
    pub fn is_indexed(&self) -> bool {
        matches!(&self.resync, Ok(report) if report.failed.is_empty())
    }
}

/// Ingestion facade over the merge engine and the index sync.
pub struct Broker {
    store: Arc<dyn GroupStore>,
    engine: Arc<MergeEngine>,
    sync: IndexSync,
    pending: Mutex<BTreeSet<GroupId>>,
    config: BrokerConfig,
}

impl Broker {
    pub fn new(
        store: Arc<dyn GroupStore>,
        search: SearchIndexService,
        config: BrokerConfig,
    ) -> Self {
        let engine = Arc::new(MergeEngine::new(
            store.clone(),
            Arc::new(ClusterLocks::new()),
            config.clone(),
        ));
        let sync = IndexSync::new(engine.clone(), Arc::new(search), config.clone());
        Self {
            store,
            engine,
            sync,
            pending: Mutex::new(BTreeSet::new()),
            config,
        }
    }

    pub fn store(&self) -> &Arc<dyn GroupStore> {
        &self.store
    }

    pub fn search(&self) -> &Arc<SearchIndexService> {
        self.sync.search()
    }

    pub fn engine(&self) -> &Arc<MergeEngine> {
        &self.engine
    }

    /// Record an observed fact.
    ///
    /// Unknown identifiers get a new Identity group inside a new Version
    /// group. `IsIdenticalTo` merges the two Identity groups and, when they
    /// sat in different Version groups, those as well. `HasVersion` merges the
    /// two Version groups. Any other relation is recorded as an Identity-level
    /// and a Version-level relationship, each wherever its endpoints differ,
    /// with the fact appended to their histories. Source and target metadata
    /// are merged into the endpoint Identity groups.
    ///
    /// # Errors
    ///
    /// * `Validation` - an identifier is blank
    /// * `Conflict` - a concurrent unit of work changed the same cluster; retry the call
    /// * `Timeout` - a lock or store call did not complete in time
    ///
    /// Index failures are reported in [`ObserveOutcome::resync`].
    #[instrument(
        skip(self, fact),
        fields(source = %fact.source, relation = %fact.relation, target = %fact.target)
    )]
    pub async fn observe_fact(&self, fact: Fact) -> Result<ObserveOutcome, BrokerError> {
        if fact.source.is_blank() || fact.target.is_blank() {
            return Err(BrokerError::validation(
                "fact identifiers need a scheme and a value",
            ));
        }

        let identifiers = vec![fact.source.clone(), fact.target.clone()];
        let mut session = self.begin_for_identifiers(&identifiers).await?;
        let result = apply_fact(&mut session, &fact)?;
        let changed = session.working().has_changes();
        session.commit().await?;

        if !changed {
            debug!("Fact already recorded");
            return Ok(ObserveOutcome {
                result,
                resync: Ok(ResyncReport::default()),
            });
        }
        if let (Some(survivor), Some(retired)) = (result.survivor, result.retired) {
            info!(survivor = %survivor, retired = %retired, "Fact merged groups");
        }
        let resync = self.resync(&result.affected_group_ids).await;
        Ok(ObserveOutcome { result, resync })
    }

    /// Record a fact in its wire shape.
    pub async fn observe_raw(&self, raw: RawFact) -> Result<ObserveOutcome, BrokerError> {
        let fact = raw.into_fact().map_err(BrokerError::validation)?;
        self.observe_fact(fact).await
    }

    /// Rebuild the index documents of one cluster.
    ///
    /// Retired ids are followed to their survivor and Identity groups are
    /// expanded to their Version group. Documents still referencing `group_id`
    /// itself are retracted too.
    ///
    /// # Errors
    ///
    /// * `NotFound` - the group was never recorded
    /// * `IndexWrite` - retraction or publication failed; the group stays pending
    #[instrument(skip(self))]
    pub async fn reindex_group(&self, group_id: GroupId) -> Result<ResyncReport, BrokerError> {
        let live = within(
            self.config.store_timeout,
            "resolve",
            self.store.resolve(group_id),
        )
        .await?
        .ok_or_else(|| BrokerError::not_found(format!("group {}", group_id)))?;

        let mut affected = BTreeSet::from([group_id, live]);
        let groups = within(
            self.config.store_timeout,
            "get groups",
            self.store.get_groups(&[live]),
        )
        .await?;
        if let Some(container) = groups.first().and_then(|g| g.container) {
            affected.insert(container);
        }

        self.resync(&affected).await?.ensure_complete()
    }

    /// Run [`Broker::reindex_group`] for every id in order.
    ///
    /// A failing id is reported with its error; it does not stop the others.
    pub async fn reindex_groups(
        &self,
        group_ids: &[GroupId],
    ) -> Vec<(GroupId, Result<ResyncReport, BrokerError>)> {
        let mut results = Vec::with_capacity(group_ids.len());
        for group_id in group_ids {
            results.push((*group_id, self.reindex_group(*group_id).await));
        }
        results
    }

    /// Create an Identity group owning `identifiers`, inside a new Version group.
    ///
    /// # Errors
    ///
    /// `Validation` if `identifiers` is empty or one of them already belongs to
    /// an Identity group.
    #[instrument(skip(self, identifiers), fields(count = identifiers.len()))]
    pub async fn create_identity_group(
        &self,
        identifiers: Vec<Identifier>,
    ) -> Result<GroupId, BrokerError> {
        let identifiers: Vec<Identifier> =
            identifiers.into_iter().map(Identifier::normalized).collect();
        let owned = self.lookup(&identifiers).await?;
        if let Some((identifier, owner)) = owned.iter().next() {
            return Err(BrokerError::validation(format!(
                "identifier {} already belongs to group {}",
                identifier, owner
            )));
        }

        let mut session = self.engine.begin(&[]).await?;
        let working = session.working_mut();
        let identity = working.create_identity_group(identifiers)?;
        let version = working.create_version_group(&[identity])?;
        session.commit().await?;

        info!(group_id = %identity, version_group_id = %version, "Identity group created");
        Ok(identity)
    }

    /// Gather Identity groups into one Version group and return its id.
    ///
    /// Every Identity group always belongs to a Version group, so the Version
    /// groups currently holding `identity_group_ids` are merged. Each of them
    /// may contain only groups from the list.
    ///
    /// # Errors
    ///
    /// * `Validation` - the list is empty, names a Version group, or names an
    ///   Identity group whose Version group also holds groups outside the list
    /// * `NotFound` - a group was never recorded
    #[instrument(skip(self, identity_group_ids), fields(count = identity_group_ids.len()))]
    pub async fn create_version_group(
        &self,
        identity_group_ids: &[GroupId],
    ) -> Result<GroupId, BrokerError> {
        if identity_group_ids.is_empty() {
            return Err(BrokerError::validation(
                "a version group needs at least one identity group",
            ));
        }

        let mut session = self.engine.begin(identity_group_ids).await?;
        let requested: BTreeSet<GroupId> = identity_group_ids
            .iter()
            .map(|id| session.resolved(*id))
            .collect();

        let mut containers: Vec<GroupId> = Vec::new();
        for id in &requested {
            let group = session.working().require_group(*id)?;
            if group.kind != GroupKind::Identity {
                return Err(BrokerError::validation(format!(
                    "group {} is not an identity group",
                    id
                )));
            }
            let container = group.container.ok_or_else(|| {
                BrokerError::validation(format!("identity group {} has no version group", id))
            })?;
            let version = session.working().require_group(container)?;
            if let Some(outsider) = version.members.iter().find(|m| !requested.contains(*m)) {
                return Err(BrokerError::validation(format!(
                    "identity group {} already belongs to version group {} with {}",
                    id, container, outsider
                )));
            }
            if !containers.contains(&container) {
                containers.push(container);
            }
        }

        let mut result = MergeResult::default();
        let mut survivor = containers[0];
        for other in &containers[1..] {
            let step = session.merge(survivor, *other)?;
            if let Some(id) = step.survivor {
                survivor = id;
            }
            result.absorb(step);
        }
        session.commit().await?;

        if !result.is_noop() {
            if let Err(e) = self.resync(&result.affected_group_ids).await {
                warn!(error = %e, "Version group committed but not indexed");
            }
        }
        info!(version_group_id = %survivor, members = requested.len(), "Version group formed");
        Ok(survivor)
    }

    /// Merge two groups of the same kind and resync the index.
    ///
    /// One level only; see [`MergeEngine::merge`].
    pub async fn merge(&self, a: GroupId, b: GroupId) -> Result<ObserveOutcome, BrokerError> {
        let result = self.engine.merge(a, b).await?;
        let resync = if result.is_noop() {
            Ok(ResyncReport::default())
        } else {
            self.resync(&result.affected_group_ids).await
        };
        Ok(ObserveOutcome { result, resync })
    }

    /// Groups whose last resync did not complete.
    pub async fn pending_resyncs(&self) -> BTreeSet<GroupId> {
        self.pending.lock().await.clone()
    }

    /// Resync every pending group once more.
    pub async fn retry_pending_resyncs(&self) -> Result<ResyncReport, BrokerError> {
        let pending = std::mem::take(&mut *self.pending.lock().await);
        if pending.is_empty() {
            return Ok(ResyncReport::default());
        }
        info!(groups = pending.len(), "Retrying pending resyncs");
        self.resync(&pending).await?.ensure_complete()
    }

    /// Resync `affected`, keeping the groups pending unless every document
    /// was retracted and published.
    async fn resync(&self, affected: &BTreeSet<GroupId>) -> Result<ResyncReport, BrokerError> {
        let outcome = self.sync.resync(affected).await;
        let complete = matches!(&outcome, Ok(report) if report.failed.is_empty());
        if !complete {
            if let Err(e) = &outcome {
                error!(error = %e, groups = affected.len(), "Resync failed");
            }
            self.pending.lock().await.extend(affected.iter().copied());
        }
        outcome
    }

    async fn lookup(
        &self,
        identifiers: &[Identifier],
    ) -> Result<HashMap<Identifier, GroupId>, BrokerError> {
        within(
            self.config.store_timeout,
            "find groups",
            self.store.find_groups_by_identifiers(identifiers),
        )
        .await
    }

    /// Lock and load the clusters owning `identifiers`.
    ///
    /// The identifiers are looked up again under the locks; if one moved to
    /// another group or was claimed by a concurrent unit of work, the session
    /// is reopened.
    async fn begin_for_identifiers(
        &self,
        identifiers: &[Identifier],
    ) -> Result<MergeSession, BrokerError> {
        for attempt in 1..=LOCK_ATTEMPTS {
            let before = self.lookup(identifiers).await?;
            let roots: Vec<GroupId> = before.values().copied().collect();
            let session = self.engine.begin(&roots).await?;

            let after = self.lookup(identifiers).await?;
            let stable = after.len() == before.len()
                && before.iter().all(|(identifier, group)| {
                    after.get(identifier) == Some(&session.resolved(*group))
                });
            if stable {
                return Ok(session);
            }
            debug!(attempt, "Identifiers moved while waiting for their clusters");
        }
        Err(BrokerError::conflict(
            "identifiers kept moving while waiting for their clusters",
        ))
    }
}

/// Apply one fact to a locked session.
fn apply_fact(session: &mut MergeSession, fact: &Fact) -> Result<MergeResult, BrokerError> {
    let source = ensure_identity_group(session.working_mut(), &fact.source)?;
    let target = ensure_identity_group(session.working_mut(), &fact.target)?;
    let mut result = MergeResult::default();

    match fact.relation {
        Relation::IsIdenticalTo => {
            let merged = session.merge(source, target)?;
            if let Some(shift) = merged.version_shift.filter(|s| s.needs_version_merge()) {
                if let (Some(kept), Some(folded)) = (shift.survivor_before, shift.retired_before) {
                    let cascade = session.merge(kept, folded)?;
                    result.absorb(merged);
                    result.absorb(cascade);
                } else {
                    result.absorb(merged);
                }
            } else {
                result.absorb(merged);
            }
        }
        Relation::HasVersion => {
            let working = session.working();
            let source_version = container(working, source)?;
            let target_version = container(working, target)?;
            result.absorb(session.merge(source_version, target_version)?);
        }
        _ => record_relationship(session.working_mut(), fact, source, target, &mut result)?,
    }

    apply_metadata(session.working_mut(), fact, &mut result)?;
    result
        .affected_group_ids
        .extend(session.working().touched_group_ids().into_iter().filter_map(|id| {
            // Documents are rebuilt per Version group.
            match session.working().group(id) {
                Some(group) if group.kind == GroupKind::Identity => group.container,
                _ => Some(id),
            }
        }));
    Ok(result)
}

/// The Identity group owning `identifier`, created with its own Version group
/// when the identifier is new.
fn ensure_identity_group(
    working: &mut WorkingSet,
    identifier: &Identifier,
) -> Result<GroupId, BrokerError> {
    if let Some(id) = working.identity_group_of(identifier) {
        return Ok(id);
    }
    let identity = working.create_identity_group(vec![identifier.clone()])?;
    working.create_version_group(&[identity])?;
    debug!(identifier = %identifier, group_id = %identity, "New identifier");
    Ok(identity)
}

fn container(working: &WorkingSet, identity: GroupId) -> Result<GroupId, BrokerError> {
    working.require_group(identity)?.container.ok_or_else(|| {
        BrokerError::validation(format!("identity group {} has no version group", identity))
    })
}

/// Record a non-merging fact at both levels.
fn record_relationship(
    working: &mut WorkingSet,
    fact: &Fact,
    source: GroupId,
    target: GroupId,
    result: &mut MergeResult,
) -> Result<(), BrokerError> {
    let entry = fact.history_entry();
    let source_version = container(working, source)?;
    let target_version = container(working, target)?;

    let mut identity_rel = None;
    for (kind, from, to) in [
        (GroupKind::Identity, source, target),
        (GroupKind::Version, source_version, target_version),
    ] {
        if from == to {
            continue;
        }
        let key = RelationshipKey {
            kind,
            source: from,
            target: to,
            relation: fact.relation,
        };
        let id = working.get_or_create_relationship(key)?;
        let recorded = working
            .relationship(id)
            .is_some_and(|r| r.history.iter().any(|h| h.fact == entry.fact));
        if !recorded {
            working.relationship_mut(id)?.append_history(entry.clone());
        }
        if kind == GroupKind::Version {
            if let Some(sub) = identity_rel {
                let linked = working
                    .relationship(id)
                    .is_some_and(|r| r.subrelationships.contains(&sub));
                if !linked {
                    working.relationship_mut(id)?.add_subrelationship(sub);
                }
            }
        } else {
            identity_rel = Some(id);
        }
        result.affected_relationship_ids.insert(id);
    }
    result.affected_group_ids.insert(source_version);
    result.affected_group_ids.insert(target_version);
    Ok(())
}

/// Merge the fact's source and target documents into their Identity groups.
fn apply_metadata(
    working: &mut WorkingSet,
    fact: &Fact,
    result: &mut MergeResult,
) -> Result<(), BrokerError> {
    let updates: [(&Identifier, Option<&Value>); 2] = [
        (&fact.source, fact.metadata.source.as_ref()),
        (&fact.target, fact.metadata.target.as_ref()),
    ];
    for (identifier, incoming) in updates {
        let Some(incoming) = incoming else {
            continue;
        };
        let Some(owner) = working.identity_group_of(identifier) else {
            continue;
        };
        let group = working.require_group(owner)?;
        let (merged, changed) = overlay_metadata(group.data.as_ref(), incoming);
        if changed {
            let container = group.container;
            working.group_mut(owner)?.data = merged;
            result.affected_group_ids.extend(container);
        }
    }
    Ok(())
}
