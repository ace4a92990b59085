//! Consistent read of a group cluster.

use std::collections::BTreeMap;

use crate::types::{Group, GroupId, GroupRelationship, RelationshipId, RelationshipKey};

/// The groups and relationships of one or more clusters, read at a single
/// point in time.
///
/// A snapshot is closed over what a merge or a resync needs: the requested
/// groups, their Version groups and all Identity members of those, every
/// relationship touching any of them, the parents of those relationships,
/// and the far endpoints of the relationships (with their containers and
/// members so that metadata can be rendered).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ClusterSnapshot {
    pub groups: BTreeMap<GroupId, Group>,
    pub relationships: BTreeMap<RelationshipId, GroupRelationship>,
}

impl ClusterSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_group(&mut self, group: Group) {
        self.groups.insert(group.id, group);
    }

    pub fn insert_relationship(&mut self, relationship: GroupRelationship) {
        self.relationships.insert(relationship.id, relationship);
    }

    pub fn group(&self, id: GroupId) -> Option<&Group> {
        self.groups.get(&id)
    }

    pub fn relationship(&self, id: RelationshipId) -> Option<&GroupRelationship> {
        self.relationships.get(&id)
    }

    /// The Version group containing `id`, if `id` is a known Identity group.
    pub fn container_of(&self, id: GroupId) -> Option<GroupId> {
        self.group(id).and_then(|g| g.container)
    }

    /// Relationships with `id` as source or target, in id order.
    pub fn relationships_touching(
        &self,
        id: GroupId,
    ) -> impl Iterator<Item = &GroupRelationship> + '_ {
        self.relationships.values().filter(move |r| r.touches(id))
    }

    pub fn find_relationship(&self, key: &RelationshipKey) -> Option<&GroupRelationship> {
        self.relationships.values().find(|r| r.key() == *key)
    }

    /// Higher-level relationships listing `id` as a subrelationship.
    pub fn parents_of(
        &self,
        id: RelationshipId,
    ) -> impl Iterator<Item = &GroupRelationship> + '_ {
        self.relationships
            .values()
            .filter(move |r| r.subrelationships.contains(&id))
    }

    /// Absorb another snapshot. Entries already present are kept.
    pub fn extend(&mut self, other: ClusterSnapshot) {
        for (id, group) in other.groups {
            self.groups.entry(id).or_insert(group);
        }
        for (id, relationship) in other.relationships {
            self.relationships.entry(id).or_insert(relationship);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{GroupKind, Identifier, Relation};

    #[test]
    fn test_relationship_lookups() {
        let a = Group::identity(vec![Identifier::doi("10.1/a")]);
        let b = Group::identity(vec![Identifier::doi("10.1/b")]);
        let mut identity_rel =
            GroupRelationship::new(GroupKind::Identity, a.id, b.id, Relation::Cites);
        let mut version_rel = GroupRelationship::new(
            GroupKind::Version,
            GroupId::new(),
            GroupId::new(),
            Relation::Cites,
        );
        version_rel.add_subrelationship(identity_rel.id);
        identity_rel.version = 3;

        let mut snapshot = ClusterSnapshot::new();
        snapshot.insert_group(a.clone());
        snapshot.insert_group(b.clone());
        snapshot.insert_relationship(identity_rel.clone());
        snapshot.insert_relationship(version_rel.clone());

        assert_eq!(snapshot.relationships_touching(a.id).count(), 1);
        assert_eq!(
            snapshot.find_relationship(&identity_rel.key()).map(|r| r.version),
            Some(3)
        );
        let parents: Vec<_> = snapshot.parents_of(identity_rel.id).map(|r| r.id).collect();
        assert_eq!(parents, vec![version_rel.id]);
    }

    #[test]
    fn test_extend_keeps_existing_entries() {
        let mut group = Group::version(vec![]);
        let mut first = ClusterSnapshot::new();
        first.insert_group(group.clone());

        group.version = 7;
        let mut second = ClusterSnapshot::new();
        second.insert_group(group.clone());

        first.extend(second);
        assert_eq!(first.group(group.id).map(|g| g.version), Some(0));
    }
}
