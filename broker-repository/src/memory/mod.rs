//! In-memory implementation of the relationship store.
//!
//! Used by tests and by local runs without `DATABASE_URL`. A commit is applied
//! to a copy of the state which replaces the live state only if every change
//! and every integrity check succeeded, so a rejected changeset leaves no trace.
use std::collections::{BTreeSet, HashMap};

use async_trait::async_trait;
use broker_shared::{
    Changeset, ClusterSnapshot, Group, GroupId, GroupKind, GroupRelationship, Identifier,
    RelationshipId, RelationshipKey,
};
use tokio::sync::RwLock;
use tracing::debug;

use crate::{GroupStore, StoreError};

#[derive(Debug, Clone, Default)]
struct MemoryState {
    groups: HashMap<GroupId, Group>,
    identifiers: HashMap<Identifier, GroupId>,
    relationships: HashMap<RelationshipId, GroupRelationship>,
    relationship_keys: HashMap<RelationshipKey, RelationshipId>,
    redirects: HashMap<GroupId, GroupId>,
}

/// Relationship store kept entirely in memory.
#[derive(Debug, Default)]
pub struct MemoryGroupStore {
    state: RwLock<MemoryState>,
}

impl MemoryGroupStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// All live groups, ordered by id.
    pub async fn groups(&self) -> Vec<Group> {
        let state = self.state.read().await;
        let mut groups: Vec<Group> = state.groups.values().cloned().collect();
        groups.sort_by_key(|g| g.id);
        groups
    }

    /// All group relationships, ordered by id.
    pub async fn relationships(&self) -> Vec<GroupRelationship> {
        let state = self.state.read().await;
        let mut relationships: Vec<GroupRelationship> =
            state.relationships.values().cloned().collect();
        relationships.sort_by_key(|r| r.id);
        relationships
    }

    pub async fn group_count(&self, kind: GroupKind) -> usize {
        let state = self.state.read().await;
        state.groups.values().filter(|g| g.kind == kind).count()
    }

    /// Ids that were retired by a merge.
    pub async fn retired_ids(&self) -> Vec<GroupId> {
        let state = self.state.read().await;
        let mut ids: Vec<GroupId> = state.redirects.keys().copied().collect();
        ids.sort();
        ids
    }
}

impl MemoryState {
    fn resolve(&self, id: GroupId) -> Option<GroupId> {
        let mut current = id;
        // Redirects are compressed on every retirement, so this is at most one hop
        // in practice; the bound guards against a corrupted chain.
        for _ in 0..=self.redirects.len() {
            if self.groups.contains_key(&current) {
                return Some(current);
            }
            current = *self.redirects.get(&current)?;
        }
        None
    }

    fn cluster(&self, roots: &[GroupId]) -> ClusterSnapshot {
        let mut version_ids = BTreeSet::new();
        let mut identity_ids = BTreeSet::new();
        for group in roots.iter().filter_map(|id| self.groups.get(id)) {
            match group.kind {
                GroupKind::Version => {
                    version_ids.insert(group.id);
                }
                GroupKind::Identity => {
                    identity_ids.insert(group.id);
                    version_ids.extend(group.container);
                }
            }
        }
        for version in version_ids.iter().filter_map(|id| self.groups.get(id)) {
            identity_ids.extend(version.members.iter().copied());
        }

        let mut relationship_ids: BTreeSet<RelationshipId> = self
            .relationships
            .values()
            .filter(|r| {
                let level = match r.kind {
                    GroupKind::Version => &version_ids,
                    GroupKind::Identity => &identity_ids,
                };
                level.contains(&r.source) || level.contains(&r.target)
            })
            .map(|r| r.id)
            .collect();
        let parents: Vec<RelationshipId> = self
            .relationships
            .values()
            .filter(|r| r.subrelationships.iter().any(|s| relationship_ids.contains(s)))
            .map(|r| r.id)
            .collect();
        relationship_ids.extend(parents);

        let mut group_ids: BTreeSet<GroupId> = version_ids.union(&identity_ids).copied().collect();
        for relationship in relationship_ids.iter().filter_map(|id| self.relationships.get(id)) {
            group_ids.insert(relationship.source);
            group_ids.insert(relationship.target);
        }
        let mut expanded = group_ids.clone();
        for group in group_ids.iter().filter_map(|id| self.groups.get(id)) {
            expanded.extend(group.container);
            expanded.extend(group.members.iter().copied());
        }

        let mut snapshot = ClusterSnapshot::new();
        for group in expanded.iter().filter_map(|id| self.groups.get(id)) {
            snapshot.insert_group(group.clone());
        }
        for relationship in relationship_ids.iter().filter_map(|id| self.relationships.get(id)) {
            snapshot.insert_relationship(relationship.clone());
        }
        snapshot
    }

    fn check_group_version(&self, id: GroupId, expected: i64) -> Result<&Group, StoreError> {
        match self.groups.get(&id) {
            Some(group) if group.version == expected => Ok(group),
            Some(group) => Err(StoreError::conflict(format!(
                "group {} is at version {}, expected {}",
                id, group.version, expected
            ))),
            None => Err(StoreError::conflict(format!("group {} no longer exists", id))),
        }
    }

    fn check_relationship_version(
        &self,
        id: RelationshipId,
        expected: i64,
    ) -> Result<&GroupRelationship, StoreError> {
        match self.relationships.get(&id) {
            Some(rel) if rel.version == expected => Ok(rel),
            Some(rel) => Err(StoreError::conflict(format!(
                "relationship {} is at version {}, expected {}",
                id, rel.version, expected
            ))),
            None => Err(StoreError::conflict(format!(
                "relationship {} no longer exists",
                id
            ))),
        }
    }

    fn apply(&mut self, changeset: &Changeset) -> Result<(), StoreError> {
        // Groups
        for retirement in &changeset.retired_groups {
            let retired = self
                .check_group_version(retirement.retired, retirement.expected_version)?
                .clone();
            for identifier in &retired.identifiers {
                if self.identifiers.get(identifier) == Some(&retired.id) {
                    self.identifiers.remove(identifier);
                }
            }
            self.groups.remove(&retired.id);
            for survivor in self.redirects.values_mut() {
                if *survivor == retirement.retired {
                    *survivor = retirement.survivor;
                }
            }
            self.redirects
                .insert(retirement.retired, retirement.survivor);
        }

        for group in &changeset.updated_groups {
            let previous = self.check_group_version(group.id, group.version)?.clone();
            for identifier in &previous.identifiers {
                if self.identifiers.get(identifier) == Some(&group.id) {
                    self.identifiers.remove(identifier);
                }
            }
        }
        for group in &changeset.created_groups {
            if self.groups.contains_key(&group.id) || self.redirects.contains_key(&group.id) {
                return Err(StoreError::conflict(format!("group {} already exists", group.id)));
            }
        }

        let written = changeset
            .created_groups
            .iter()
            .map(|g| (g, 0))
            .chain(changeset.updated_groups.iter().map(|g| (g, g.version + 1)));
        for (group, version) in written {
            for identifier in &group.identifiers {
                if let Some(owner) = self.identifiers.insert(identifier.clone(), group.id) {
                    if owner != group.id {
                        return Err(StoreError::conflict(format!(
                            "identifier {} is owned by group {}",
                            identifier, owner
                        )));
                    }
                }
            }
            let mut stored = group.clone();
            stored.version = version;
            self.groups.insert(stored.id, stored);
        }

        // Relationships
        for removed in &changeset.removed_relationships {
            let key = self
                .check_relationship_version(removed.id, removed.expected_version)?
                .key();
            self.relationships.remove(&removed.id);
            self.relationship_keys.remove(&key);
            for rel in self.relationships.values_mut() {
                rel.subrelationships.retain(|s| *s != removed.id);
            }
        }
        for rel in &changeset.updated_relationships {
            let key = self.check_relationship_version(rel.id, rel.version)?.key();
            self.relationship_keys.remove(&key);
        }
        for rel in &changeset.created_relationships {
            if self.relationships.contains_key(&rel.id) {
                return Err(StoreError::conflict(format!(
                    "relationship {} already exists",
                    rel.id
                )));
            }
        }

        let written = changeset
            .created_relationships
            .iter()
            .map(|r| (r, 0))
            .chain(
                changeset
                    .updated_relationships
                    .iter()
                    .map(|r| (r, r.version + 1)),
            );
        for (rel, version) in written {
            if let Some(other) = self.relationship_keys.insert(rel.key(), rel.id) {
                if other != rel.id {
                    return Err(StoreError::conflict(format!(
                        "relationship {} already links {} -> {}",
                        other, rel.source, rel.target
                    )));
                }
            }
            let mut stored = rel.clone();
            stored.version = version;
            self.relationships.insert(stored.id, stored);
        }

        self.check_integrity(changeset)
    }

    /// Integrity rules a relational schema would enforce with foreign keys and
    /// unique constraints.
    fn check_integrity(&self, changeset: &Changeset) -> Result<(), StoreError> {
        let written = changeset
            .created_groups
            .iter()
            .chain(changeset.updated_groups.iter())
            .map(|g| g.id);
        for id in written {
            let Some(group) = self.groups.get(&id) else {
                continue;
            };
            match group.kind {
                GroupKind::Version => {
                    for member in &group.members {
                        let member_group = self.groups.get(member).ok_or_else(|| {
                            StoreError::conflict(format!("member {} no longer exists", member))
                        })?;
                        if member_group.kind != GroupKind::Identity
                            || member_group.container != Some(group.id)
                        {
                            return Err(StoreError::validation(format!(
                                "group {} is not an identity member of {}",
                                member, group.id
                            )));
                        }
                    }
                }
                GroupKind::Identity => {
                    if let Some(container) = group.container {
                        let listed = self
                            .groups
                            .get(&container)
                            .map(|c| c.members.contains(&group.id))
                            .unwrap_or(false);
                        if !listed {
                            return Err(StoreError::conflict(format!(
                                "container {} does not list {}",
                                container, group.id
                            )));
                        }
                    }
                }
            }
        }

        let written = changeset
            .created_relationships
            .iter()
            .chain(changeset.updated_relationships.iter())
            .map(|r| r.id);
        for id in written {
            let Some(rel) = self.relationships.get(&id) else {
                continue;
            };
            for endpoint in [rel.source, rel.target] {
                let group = self.groups.get(&endpoint).ok_or_else(|| {
                    StoreError::conflict(format!("endpoint {} no longer exists", endpoint))
                })?;
                if group.kind != rel.kind {
                    return Err(StoreError::validation(format!(
                        "{} relationship {} has {} endpoint {}",
                        rel.kind, rel.id, group.kind, endpoint
                    )));
                }
            }
            for sub in &rel.subrelationships {
                if !self.relationships.contains_key(sub) {
                    return Err(StoreError::conflict(format!(
                        "subrelationship {} no longer exists",
                        sub
                    )));
                }
            }
        }

        for retirement in &changeset.retired_groups {
            let retired = retirement.retired;
            if let Some(rel) = self.relationships.values().find(|r| r.touches(retired)) {
                return Err(StoreError::conflict(format!(
                    "relationship {} still references retired group {}",
                    rel.id, retired
                )));
            }
            if let Some(group) = self
                .groups
                .values()
                .find(|g| g.container == Some(retired) || g.members.contains(&retired))
            {
                return Err(StoreError::conflict(format!(
                    "group {} still references retired group {}",
                    group.id, retired
                )));
            }
        }
        Ok(())
    }
}

#[async_trait]
impl GroupStore for MemoryGroupStore {
    async fn find_groups_by_identifiers(
        &self,
        identifiers: &[Identifier],
    ) -> Result<HashMap<Identifier, GroupId>, StoreError> {
        let state = self.state.read().await;
        Ok(identifiers
            .iter()
            .filter_map(|i| state.identifiers.get(i).map(|g| (i.clone(), *g)))
            .collect())
    }

    async fn resolve(&self, id: GroupId) -> Result<Option<GroupId>, StoreError> {
        Ok(self.state.read().await.resolve(id))
    }

    async fn get_groups(&self, ids: &[GroupId]) -> Result<Vec<Group>, StoreError> {
        let state = self.state.read().await;
        Ok(ids.iter().filter_map(|id| state.groups.get(id).cloned()).collect())
    }

    async fn load_cluster(&self, roots: &[GroupId]) -> Result<ClusterSnapshot, StoreError> {
        Ok(self.state.read().await.cluster(roots))
    }

    async fn commit(&self, changeset: &Changeset) -> Result<(), StoreError> {
        if changeset.is_empty() {
            return Ok(());
        }
        let mut state = self.state.write().await;
        let mut next = state.clone();
        next.apply(changeset)?;
        *state = next;
        debug!(
            created_groups = changeset.created_groups.len(),
            updated_groups = changeset.updated_groups.len(),
            retired_groups = changeset.retired_groups.len(),
            created_relationships = changeset.created_relationships.len(),
            updated_relationships = changeset.updated_relationships.len(),
            removed_relationships = changeset.removed_relationships.len(),
            "Committed changeset"
        );
        Ok(())
    }
}
