//! Units of work against the relationship store.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use broker_repository::GroupStore;
use broker_shared::{ClusterSnapshot, Group, GroupId, GroupKind};
use tracing::{debug, info, instrument};

use crate::config::BrokerConfig;
use crate::errors::{within, BrokerError};
use crate::locks::{ClusterGuard, ClusterLocks};
use crate::merge::{merge_groups, MergeResult};
use crate::model::WorkingSet;

/// Times [`MergeEngine::begin`] takes the locks before giving up.
pub const LOCK_ATTEMPTS: usize = 3;

/// Runs merges against the store, one locked unit of work at a time.
pub struct MergeEngine {
    store: Arc<dyn GroupStore>,
    locks: Arc<ClusterLocks>,
    config: BrokerConfig,
}

/// A locked, loaded unit of work.
///
/// Changes are made on [`MergeSession::working_mut`] and applied atomically
/// by [`MergeSession::commit`]. Dropping a session without committing
/// discards them. Locks are held until the session is dropped.
pub struct MergeSession {
    store: Arc<dyn GroupStore>,
    config: BrokerConfig,
    resolved: HashMap<GroupId, GroupId>,
    working: WorkingSet,
    _guard: ClusterGuard,
}

impl std::fmt::Debug for MergeSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MergeSession")
            .field("config", &self.config)
            .field("resolved", &self.resolved)
            .field("working", &self.working)
            .field("_guard", &self._guard)
            .finish_non_exhaustive()
    }
}

impl MergeEngine {
    pub fn new(store: Arc<dyn GroupStore>, locks: Arc<ClusterLocks>, config: BrokerConfig) -> Self {
        Self {
            store,
            locks,
            config,
        }
    }

    pub fn store(&self) -> &Arc<dyn GroupStore> {
        &self.store
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    /// Merge two groups of the same kind and commit the result.
    ///
    /// Only one level is merged. For Identity groups the result's
    /// `version_shift` tells whether their Version groups should be merged too.
    ///
    /// # Errors
    ///
    /// * `NotFound` - a group was never recorded
    /// * `InvalidMerge` - the groups have different kinds
    /// * `Conflict` - a concurrent unit of work changed the cluster; nothing was applied
    /// * `Timeout` - a lock or store call did not complete in time
    #[instrument(skip(self))]
    pub async fn merge(&self, a: GroupId, b: GroupId) -> Result<MergeResult, BrokerError> {
        let mut session = self.begin(&[a, b]).await?;
        let result = session.merge(a, b)?;
        session.commit().await?;
        if let (Some(survivor), Some(retired)) = (result.survivor, result.retired) {
            info!(survivor = %survivor, retired = %retired, "Groups merged");
        }
        Ok(result)
    }

    /// Lock the clusters of `roots` and load them.
    ///
    /// Retired ids are resolved to their survivors first. The Version group of
    /// every root is locked, along with the Version groups of every group
    /// related to the loaded clusters. If a root was retired, or the set of
    /// groups to lock changed while waiting, the locks are released and taken
    /// again; after [`LOCK_ATTEMPTS`] tries the call fails with `Conflict`.
    pub async fn begin(&self, roots: &[GroupId]) -> Result<MergeSession, BrokerError> {
        for attempt in 1..=LOCK_ATTEMPTS {
            if let Some(session) = self.try_begin(roots).await? {
                return Ok(session);
            }
            debug!(attempt, "Cluster changed while waiting for its lock");
        }
        Err(BrokerError::conflict(
            "clusters kept changing while waiting for their locks",
        ))
    }

    async fn try_begin(&self, roots: &[GroupId]) -> Result<Option<MergeSession>, BrokerError> {
        let resolved = self.resolve_all(roots).await?;
        let live: Vec<GroupId> = dedup(resolved.values().copied());

        // Unlocked read, only used to pick the locks.
        let preview = self.load_cluster(&live).await?;
        let lock_targets = self.lock_targets(&guarded_by(&live, &preview), &preview).await?;
        let guard = self
            .locks
            .acquire(&lock_targets, self.config.lock_timeout)
            .await?;

        if self.resolve_all(roots).await? != resolved {
            return Ok(None);
        }
        let snapshot = self.load_cluster(&live).await?;
        if live.iter().any(|id| snapshot.group(*id).is_none()) {
            return Ok(None);
        }
        let unguarded: Vec<GroupId> = guarded_by(&live, &snapshot)
            .into_iter()
            .filter(|id| !guard.holds(*id))
            .collect();
        if !unguarded.is_empty() {
            debug!(unguarded = unguarded.len(), "Cluster gained neighbours while locking");
            return Ok(None);
        }
        debug!(
            roots = live.len(),
            locked = guard.ids().len(),
            groups = snapshot.groups.len(),
            relationships = snapshot.relationships.len(),
            "Loaded cluster"
        );

        Ok(Some(MergeSession {
            store: self.store.clone(),
            config: self.config.clone(),
            resolved,
            working: WorkingSet::new(snapshot),
            _guard: guard,
        }))
    }

    async fn resolve_all(
        &self,
        ids: &[GroupId],
    ) -> Result<HashMap<GroupId, GroupId>, BrokerError> {
        let mut resolved = HashMap::with_capacity(ids.len());
        for id in ids {
            let live = within(self.config.store_timeout, "resolve", self.store.resolve(*id))
                .await?
                .ok_or_else(|| BrokerError::not_found(format!("group {}", id)))?;
            resolved.insert(*id, live);
        }
        Ok(resolved)
    }

    async fn load_cluster(&self, live: &[GroupId]) -> Result<ClusterSnapshot, BrokerError> {
        within(
            self.config.store_timeout,
            "load cluster",
            self.store.load_cluster(live),
        )
        .await
    }

    /// The groups behind `ids`, taken from `snapshot` when it has them.
    async fn lock_targets(
        &self,
        ids: &BTreeSet<GroupId>,
        snapshot: &ClusterSnapshot,
    ) -> Result<Vec<Group>, BrokerError> {
        let mut targets: Vec<Group> = Vec::with_capacity(ids.len());
        let mut missing: Vec<GroupId> = Vec::new();
        for id in ids {
            match snapshot.group(*id) {
                Some(group) => targets.push(group.clone()),
                None => missing.push(*id),
            }
        }
        if !missing.is_empty() {
            targets.extend(
                within(
                    self.config.store_timeout,
                    "get groups",
                    self.store.get_groups(&missing),
                )
                .await?,
            );
        }
        Ok(targets)
    }
}

impl MergeSession {
    /// The live id `id` resolved to when the session began.
    pub fn resolved(&self, id: GroupId) -> GroupId {
        self.resolved.get(&id).copied().unwrap_or(id)
    }

    pub fn working(&self) -> &WorkingSet {
        &self.working
    }

    pub fn working_mut(&mut self) -> &mut WorkingSet {
        &mut self.working
    }

    /// Merge two groups of the loaded clusters.
    pub fn merge(&mut self, a: GroupId, b: GroupId) -> Result<MergeResult, BrokerError> {
        let a = self.resolved(a);
        let b = self.resolved(b);
        merge_groups(&mut self.working, a, b)
    }

    /// Check the invariants and apply all changes in one store transaction.
    pub async fn commit(self) -> Result<(), BrokerError> {
        if !self.working.has_changes() {
            return Ok(());
        }
        let changeset = self.working.into_changeset()?;
        within(
            self.config.store_timeout,
            "commit",
            self.store.commit(&changeset),
        )
        .await
    }
}

/// The group whose lock guards `group`: its Version group.
fn cluster_owner(group: &Group) -> GroupId {
    match group.kind {
        GroupKind::Identity => group.container.unwrap_or(group.id),
        GroupKind::Version => group.id,
    }
}

/// The Version groups a unit of work on `live` must hold: the clusters of
/// `live` and the clusters at the far end of every loaded relationship.
///
/// A merge rewrites the relationships of its neighbours and a resync
/// publishes them, so both take the neighbours' locks too.
fn guarded_by(live: &[GroupId], snapshot: &ClusterSnapshot) -> BTreeSet<GroupId> {
    let owner = |id: GroupId| snapshot.group(id).map(cluster_owner).unwrap_or(id);
    live.iter()
        .copied()
        .chain(
            snapshot
                .relationships
                .values()
                .flat_map(|r| [r.source, r.target]),
        )
        .map(owner)
        .collect()
}

fn dedup(ids: impl Iterator<Item = GroupId>) -> Vec<GroupId> {
    let mut ids: Vec<GroupId> = ids.collect();
    ids.sort();
    ids.dedup();
    ids
}
