//! The set of row changes produced by one unit of work.
//!
//! A changeset is committed to the relationship store atomically. Rows that
//! are rewritten or deleted carry the `version` they had in the snapshot the
//! unit of work was computed from; the store rejects the whole changeset if
//! any of them moved on in the meantime.

use crate::types::{Group, GroupId, GroupRelationship, RelationshipId};

/// A group retired by a merge, redirected to its survivor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Retirement {
    pub retired: GroupId,
    pub survivor: GroupId,
    pub expected_version: i64,
}

/// A relationship deleted after being merged into a duplicate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemovedRelationship {
    pub id: RelationshipId,
    pub expected_version: i64,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Changeset {
    /// New groups; their `version` is ignored.
    pub created_groups: Vec<Group>,
    /// Full new state of existing groups; `version` is the expected version.
    pub updated_groups: Vec<Group>,
    pub retired_groups: Vec<Retirement>,
    pub created_relationships: Vec<GroupRelationship>,
    /// Full new state of existing relationships; `version` is the expected version.
    pub updated_relationships: Vec<GroupRelationship>,
    pub removed_relationships: Vec<RemovedRelationship>,
}

impl Changeset {
    pub fn is_empty(&self) -> bool {
        self.created_groups.is_empty()
            && self.updated_groups.is_empty()
            && self.retired_groups.is_empty()
            && self.created_relationships.is_empty()
            && self.updated_relationships.is_empty()
            && self.removed_relationships.is_empty()
    }

    /// Ids of every group created, rewritten or retired.
    pub fn touched_group_ids(&self) -> Vec<GroupId> {
        self.created_groups
            .iter()
            .chain(self.updated_groups.iter())
            .map(|g| g.id)
            .chain(self.retired_groups.iter().map(|r| r.retired))
            .collect()
    }
}
