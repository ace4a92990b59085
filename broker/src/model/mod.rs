//! The Group Model.
//!
//! A [`WorkingSet`] is a cluster snapshot being mutated by one unit of work.
//! It records which groups and relationships were created, rewritten, retired
//! or removed so the changes can be committed as one [`Changeset`], and it
//! enforces the group invariants before anything leaves it:
//!
//! - an identifier belongs to exactly one Identity group;
//! - every Identity group belongs to exactly one Version group, which lists it;
//! - Version groups contain only Identity groups, never themselves;
//! - relationship endpoints have the relationship's kind;
//! - nothing references a retired group.

mod metadata;

use std::collections::{BTreeSet, HashMap};

use broker_shared::{
    Changeset, ClusterSnapshot, Group, GroupId, GroupKind, GroupRelationship, Identifier,
    RelationshipId, RelationshipKey, RemovedRelationship, Retirement,
};

use crate::errors::BrokerError;

pub use metadata::{
    absorb_metadata, group_metadata, overlay_metadata, FirstMemberPolicy, VersionMetadataPolicy,
};

/// A mutable view of one or more clusters inside a unit of work.
#[derive(Debug, Clone, Default)]
pub struct WorkingSet {
    snapshot: ClusterSnapshot,
    created_groups: BTreeSet<GroupId>,
    dirty_groups: BTreeSet<GroupId>,
    retired: Vec<Retirement>,
    created_relationships: BTreeSet<RelationshipId>,
    dirty_relationships: BTreeSet<RelationshipId>,
    removed_relationships: Vec<RemovedRelationship>,
}

impl WorkingSet {
    pub fn new(snapshot: ClusterSnapshot) -> Self {
        Self {
            snapshot,
            ..Self::default()
        }
    }

    /// The current state, including uncommitted changes.
    pub fn snapshot(&self) -> &ClusterSnapshot {
        &self.snapshot
    }

    pub fn group(&self, id: GroupId) -> Option<&Group> {
        self.snapshot.group(id)
    }

    pub fn require_group(&self, id: GroupId) -> Result<&Group, BrokerError> {
        self.snapshot
            .group(id)
            .ok_or_else(|| BrokerError::not_found(format!("group {}", id)))
    }

    /// Borrow a group for modification; it will be written on commit.
    pub fn group_mut(&mut self, id: GroupId) -> Result<&mut Group, BrokerError> {
        let group = self
            .snapshot
            .groups
            .get_mut(&id)
            .ok_or_else(|| BrokerError::not_found(format!("group {}", id)))?;
        if !self.created_groups.contains(&id) {
            self.dirty_groups.insert(id);
        }
        Ok(group)
    }

    /// The Identity group owning `identifier`, among the loaded groups.
    pub fn identity_group_of(&self, identifier: &Identifier) -> Option<GroupId> {
        self.snapshot
            .groups
            .values()
            .find(|g| g.kind == GroupKind::Identity && g.owns(identifier))
            .map(|g| g.id)
    }

    /// Create an Identity group owning `identifiers`.
    ///
    /// The group has no Version group yet; pass it to
    /// [`WorkingSet::create_version_group`] before committing.
    ///
    /// # Errors
    ///
    /// `Validation` if `identifiers` is empty, contains a blank identifier, or
    /// names an identifier already owned by a loaded Identity group.
    pub fn create_identity_group(
        &mut self,
        identifiers: Vec<Identifier>,
    ) -> Result<GroupId, BrokerError> {
        let mut unique: Vec<Identifier> = Vec::with_capacity(identifiers.len());
        for identifier in identifiers.into_iter().map(Identifier::normalized) {
            if identifier.is_blank() {
                return Err(BrokerError::validation("identifier scheme and value are required"));
            }
            if let Some(owner) = self.identity_group_of(&identifier) {
                return Err(BrokerError::validation(format!(
                    "identifier {} already belongs to group {}",
                    identifier, owner
                )));
            }
            if !unique.contains(&identifier) {
                unique.push(identifier);
            }
        }
        if unique.is_empty() {
            return Err(BrokerError::validation(
                "an identity group needs at least one identifier",
            ));
        }

        let group = Group::identity(unique);
        let id = group.id;
        self.snapshot.insert_group(group);
        self.created_groups.insert(id);
        Ok(id)
    }

    /// Create a Version group containing `identity_group_ids`.
    ///
    /// # Errors
    ///
    /// `Validation` if the list is empty, names a group that is not an
    /// Identity group, or names one that already belongs to a Version group.
    pub fn create_version_group(
        &mut self,
        identity_group_ids: &[GroupId],
    ) -> Result<GroupId, BrokerError> {
        if identity_group_ids.is_empty() {
            return Err(BrokerError::validation(
                "a version group needs at least one identity group",
            ));
        }
        let mut members: Vec<GroupId> = Vec::with_capacity(identity_group_ids.len());
        for id in identity_group_ids {
            let group = self.require_group(*id)?;
            if group.kind != GroupKind::Identity {
                return Err(BrokerError::validation(format!(
                    "group {} is not an identity group",
                    id
                )));
            }
            if let Some(container) = group.container {
                return Err(BrokerError::validation(format!(
                    "identity group {} already belongs to version group {}",
                    id, container
                )));
            }
            if !members.contains(id) {
                members.push(*id);
            }
        }

        let version = Group::version(members.clone());
        let version_id = version.id;
        self.snapshot.insert_group(version);
        self.created_groups.insert(version_id);
        for member in members {
            self.group_mut(member)?.container = Some(version_id);
        }
        Ok(version_id)
    }

    /// Remove a group, redirecting its id to `survivor`.
    ///
    /// Callers move its identifiers, memberships and relationships first;
    /// [`WorkingSet::check_invariants`] rejects any reference left behind.
    pub fn retire(&mut self, id: GroupId, survivor: GroupId) -> Result<(), BrokerError> {
        let group = self
            .snapshot
            .groups
            .remove(&id)
            .ok_or_else(|| BrokerError::not_found(format!("group {}", id)))?;
        self.dirty_groups.remove(&id);
        if !self.created_groups.remove(&id) {
            self.retired.push(Retirement {
                retired: id,
                survivor,
                expected_version: group.version,
            });
        }
        for retirement in self.retired.iter_mut() {
            if retirement.survivor == id {
                retirement.survivor = survivor;
            }
        }
        Ok(())
    }

    pub fn relationship(&self, id: RelationshipId) -> Option<&GroupRelationship> {
        self.snapshot.relationship(id)
    }

    pub fn find_relationship(&self, key: &RelationshipKey) -> Option<RelationshipId> {
        self.snapshot.find_relationship(key).map(|r| r.id)
    }

    /// Borrow a relationship for modification; it will be written on commit.
    pub fn relationship_mut(
        &mut self,
        id: RelationshipId,
    ) -> Result<&mut GroupRelationship, BrokerError> {
        let relationship = self
            .snapshot
            .relationships
            .get_mut(&id)
            .ok_or_else(|| BrokerError::not_found(format!("relationship {}", id)))?;
        if !self.created_relationships.contains(&id) {
            self.dirty_relationships.insert(id);
        }
        Ok(relationship)
    }

    /// Return the relationship with `key`, creating it if needed.
    ///
    /// # Errors
    ///
    /// `Validation` if an endpoint is not a loaded group of `key.kind`.
    pub fn get_or_create_relationship(
        &mut self,
        key: RelationshipKey,
    ) -> Result<RelationshipId, BrokerError> {
        if let Some(id) = self.find_relationship(&key) {
            return Ok(id);
        }
        for endpoint in [key.source, key.target] {
            let group = self.require_group(endpoint)?;
            if group.kind != key.kind {
                return Err(BrokerError::validation(format!(
                    "{} relationship cannot reference {} group {}",
                    key.kind, group.kind, endpoint
                )));
            }
        }
        let relationship = GroupRelationship::new(key.kind, key.source, key.target, key.relation);
        let id = relationship.id;
        self.snapshot.insert_relationship(relationship);
        self.created_relationships.insert(id);
        Ok(id)
    }

    /// Delete a relationship and unlink it from the relationships it supported.
    pub fn remove_relationship(&mut self, id: RelationshipId) -> Result<(), BrokerError> {
        let relationship = self
            .snapshot
            .relationships
            .remove(&id)
            .ok_or_else(|| BrokerError::not_found(format!("relationship {}", id)))?;
        let parents: Vec<RelationshipId> = self.snapshot.parents_of(id).map(|r| r.id).collect();
        for parent in parents {
            self.relationship_mut(parent)?
                .subrelationships
                .retain(|s| *s != id);
        }
        self.dirty_relationships.remove(&id);
        if !self.created_relationships.remove(&id) {
            self.removed_relationships.push(RemovedRelationship {
                id,
                expected_version: relationship.version,
            });
        }
        Ok(())
    }

    /// Ids of groups created, rewritten or retired so far.
    pub fn touched_group_ids(&self) -> BTreeSet<GroupId> {
        self.created_groups
            .iter()
            .chain(self.dirty_groups.iter())
            .copied()
            .chain(self.retired.iter().map(|r| r.retired))
            .collect()
    }

    pub fn has_changes(&self) -> bool {
        !(self.created_groups.is_empty()
            && self.dirty_groups.is_empty()
            && self.retired.is_empty()
            && self.created_relationships.is_empty()
            && self.dirty_relationships.is_empty()
            && self.removed_relationships.is_empty())
    }

    /// Check the group invariants on everything this unit of work touched.
    ///
    /// Groups outside the snapshot are the store's responsibility.
    pub fn check_invariants(&self) -> Result<(), BrokerError> {
        let mut owners: HashMap<&Identifier, GroupId> = HashMap::new();
        for group in self.snapshot.groups.values() {
            for identifier in &group.identifiers {
                if let Some(owner) = owners.insert(identifier, group.id) {
                    if owner != group.id {
                        return Err(BrokerError::validation(format!(
                            "identifier {} belongs to groups {} and {}",
                            identifier, owner, group.id
                        )));
                    }
                }
            }
        }

        let touched = self.created_groups.iter().chain(self.dirty_groups.iter());
        for group in touched.filter_map(|id| self.snapshot.group(*id)) {
            self.check_group(group)?;
        }

        let touched = self
            .created_relationships
            .iter()
            .chain(self.dirty_relationships.iter());
        for relationship in touched.filter_map(|id| self.snapshot.relationship(*id)) {
            self.check_relationship(relationship)?;
        }

        for retirement in &self.retired {
            let retired = retirement.retired;
            if let Some(group) = self
                .snapshot
                .groups
                .values()
                .find(|g| g.container == Some(retired) || g.members.contains(&retired))
            {
                return Err(BrokerError::validation(format!(
                    "group {} still references retired group {}",
                    group.id, retired
                )));
            }
            if let Some(relationship) = self.snapshot.relationships_touching(retired).next() {
                return Err(BrokerError::validation(format!(
                    "relationship {} still references retired group {}",
                    relationship.id, retired
                )));
            }
        }
        Ok(())
    }

    fn check_group(&self, group: &Group) -> Result<(), BrokerError> {
        match group.kind {
            GroupKind::Identity => {
                if group.identifiers.is_empty() {
                    return Err(BrokerError::validation(format!(
                        "identity group {} has no identifiers",
                        group.id
                    )));
                }
                if !group.members.is_empty() {
                    return Err(BrokerError::validation(format!(
                        "identity group {} cannot contain groups",
                        group.id
                    )));
                }
                let container = group.container.ok_or_else(|| {
                    BrokerError::validation(format!(
                        "identity group {} has no version group",
                        group.id
                    ))
                })?;
                if let Some(version) = self.snapshot.group(container) {
                    if version.kind != GroupKind::Version || !version.members.contains(&group.id) {
                        return Err(BrokerError::validation(format!(
                            "group {} does not contain identity group {}",
                            container, group.id
                        )));
                    }
                }
            }
            GroupKind::Version => {
                if !group.identifiers.is_empty() || group.container.is_some() {
                    return Err(BrokerError::validation(format!(
                        "version group {} cannot own identifiers or belong to a group",
                        group.id
                    )));
                }
                let mut seen = BTreeSet::new();
                for member in &group.members {
                    if *member == group.id {
                        return Err(BrokerError::validation(format!(
                            "group {} contains itself",
                            group.id
                        )));
                    }
                    if !seen.insert(*member) {
                        return Err(BrokerError::validation(format!(
                            "group {} lists member {} twice",
                            group.id, member
                        )));
                    }
                    if let Some(identity) = self.snapshot.group(*member) {
                        if identity.kind != GroupKind::Identity
                            || identity.container != Some(group.id)
                        {
                            return Err(BrokerError::validation(format!(
                                "group {} is not an identity member of {}",
                                member, group.id
                            )));
                        }
                    }
                }
            }
        }
        Ok(())
    }

    fn check_relationship(&self, relationship: &GroupRelationship) -> Result<(), BrokerError> {
        for endpoint in [relationship.source, relationship.target] {
            let group = self.snapshot.group(endpoint).ok_or_else(|| {
                BrokerError::validation(format!(
                    "relationship {} references missing group {}",
                    relationship.id, endpoint
                ))
            })?;
            if group.kind != relationship.kind {
                return Err(BrokerError::validation(format!(
                    "{} relationship {} has {} endpoint {}",
                    relationship.kind, relationship.id, group.kind, endpoint
                )));
            }
        }
        for sub in &relationship.subrelationships {
            let valid = relationship.kind == GroupKind::Version
                && self
                    .snapshot
                    .relationship(*sub)
                    .is_some_and(|s| s.kind == GroupKind::Identity);
            if !valid {
                return Err(BrokerError::validation(format!(
                    "relationship {} cannot be supported by {}",
                    relationship.id, sub
                )));
            }
        }
        Ok(())
    }

    /// Check the invariants and turn the recorded changes into a changeset.
    ///
    /// Rewritten rows keep the version they were loaded with, which the store
    /// compares against the current row.
    pub fn into_changeset(self) -> Result<Changeset, BrokerError> {
        self.check_invariants()?;

        let groups = |ids: &BTreeSet<GroupId>| -> Vec<Group> {
            ids.iter()
                .filter_map(|id| self.snapshot.group(*id).cloned())
                .collect()
        };
        let relationships = |ids: &BTreeSet<RelationshipId>| -> Vec<GroupRelationship> {
            ids.iter()
                .filter_map(|id| self.snapshot.relationship(*id).cloned())
                .collect()
        };

        Ok(Changeset {
            created_groups: groups(&self.created_groups),
            updated_groups: groups(&self.dirty_groups),
            retired_groups: self.retired.clone(),
            created_relationships: relationships(&self.created_relationships),
            updated_relationships: relationships(&self.dirty_relationships),
            removed_relationships: self.removed_relationships.clone(),
        })
    }
}
