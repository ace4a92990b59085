//! The Merge Engine.
//!
//! [`merge_groups`] unions two same-kind groups inside a [`WorkingSet`]:
//! the older group survives, takes over the identifiers or members of the
//! other, and every relationship touching the retired group is re-pointed to
//! the survivor. Relationships that become duplicates are folded into the one
//! already holding the key.
//!
//! Merges act on one level only. Merging Identity groups reports their
//! Version groups in [`VersionGroupShift`] so the caller can decide whether
//! the Version groups must be merged too.
//!
//! [`MergeEngine`] runs merges as units of work against the store.

mod engine;

use std::collections::BTreeSet;

use broker_shared::{GroupId, GroupKind, RelationshipId, RelationshipKey};
use serde::Serialize;
use tracing::debug;

use crate::errors::BrokerError;
use crate::model::{absorb_metadata, WorkingSet};

pub use engine::{MergeEngine, MergeSession, LOCK_ATTEMPTS};

/// Version groups of the two merged Identity groups, before and after.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct VersionGroupShift {
    pub survivor_before: Option<GroupId>,
    pub retired_before: Option<GroupId>,
    /// Version group of the surviving Identity group after the merge. The
    /// retired group's identifiers now live there too.
    pub after: Option<GroupId>,
}

impl VersionGroupShift {
    /// Whether the merged Identity groups came from different Version groups.
    pub fn needs_version_merge(&self) -> bool {
        match (self.survivor_before, self.retired_before) {
            (Some(survivor), Some(retired)) => survivor != retired,
            _ => false,
        }
    }
}

/// What a merge (or a whole unit of work) changed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MergeResult {
    pub survivor: Option<GroupId>,
    pub retired: Option<GroupId>,
    /// Groups whose documents must be retracted and rebuilt.
    pub affected_group_ids: BTreeSet<GroupId>,
    pub affected_relationship_ids: BTreeSet<RelationshipId>,
    /// Set when Identity groups were merged.
    pub version_shift: Option<VersionGroupShift>,
}

impl MergeResult {
    pub fn is_noop(&self) -> bool {
        self.survivor.is_none()
            && self.affected_group_ids.is_empty()
            && self.affected_relationship_ids.is_empty()
    }

    /// Fold a later step of the same unit of work into this result.
    ///
    /// The first merge's survivor and shift are kept; affected sets are united.
    pub fn absorb(&mut self, other: MergeResult) {
        if self.survivor.is_none() {
            self.survivor = other.survivor;
            self.retired = other.retired;
        }
        if self.version_shift.is_none() {
            self.version_shift = other.version_shift;
        }
        self.affected_group_ids.extend(other.affected_group_ids);
        self.affected_relationship_ids
            .extend(other.affected_relationship_ids);
    }
}

/// Merge `a` and `b` inside `ws`.
///
/// # Errors
///
/// * `NotFound` - either group is not in the working set
/// * `InvalidMerge` - the groups have different kinds
pub fn merge_groups(
    ws: &mut WorkingSet,
    a: GroupId,
    b: GroupId,
) -> Result<MergeResult, BrokerError> {
    let group_a = ws.require_group(a)?;
    let group_b = ws.require_group(b)?;
    if group_a.kind != group_b.kind {
        return Err(BrokerError::invalid_merge(format!(
            "cannot merge {} group {} with {} group {}",
            group_a.kind, a, group_b.kind, b
        )));
    }
    if a == b {
        return Ok(MergeResult::default());
    }

    let (survivor, retired) = if group_a.precedes(group_b) {
        (group_a.clone(), group_b.clone())
    } else {
        (group_b.clone(), group_a.clone())
    };

    let mut result = MergeResult {
        survivor: Some(survivor.id),
        retired: Some(retired.id),
        ..MergeResult::default()
    };
    result.affected_group_ids.insert(survivor.id);
    result.affected_group_ids.insert(retired.id);

    match survivor.kind {
        GroupKind::Identity => {
            let shift = VersionGroupShift {
                survivor_before: survivor.container,
                retired_before: retired.container,
                after: survivor.container,
            };
            result.affected_group_ids.extend(survivor.container);
            result.affected_group_ids.extend(retired.container);
            result.version_shift = Some(shift);

            {
                let target = ws.group_mut(survivor.id)?;
                for identifier in &retired.identifiers {
                    if !target.identifiers.contains(identifier) {
                        target.identifiers.push(identifier.clone());
                    }
                }
                target.data = absorb_metadata(target.data.as_ref(), retired.data.as_ref());
            }
            if let Some(container) = retired.container {
                ws.group_mut(container)?
                    .members
                    .retain(|m| *m != retired.id);
            }
        }
        GroupKind::Version => {
            {
                let target = ws.group_mut(survivor.id)?;
                for member in &retired.members {
                    if !target.members.contains(member) {
                        target.members.push(*member);
                    }
                }
                target.data = absorb_metadata(target.data.as_ref(), retired.data.as_ref());
            }
            for member in &retired.members {
                ws.group_mut(*member)?.container = Some(survivor.id);
            }
        }
    }

    repoint_relationships(ws, retired.id, survivor.id, &mut result)?;
    ws.retire(retired.id, survivor.id)?;

    debug!(
        kind = %survivor.kind,
        survivor = %survivor.id,
        retired = %retired.id,
        relationships = result.affected_relationship_ids.len(),
        "Merged groups"
    );
    Ok(result)
}

/// Re-point every relationship touching `retired` to `survivor`, folding
/// duplicates into the relationship already holding the key.
fn repoint_relationships(
    ws: &mut WorkingSet,
    retired: GroupId,
    survivor: GroupId,
    result: &mut MergeResult,
) -> Result<(), BrokerError> {
    let touching: Vec<RelationshipId> = ws
        .snapshot()
        .relationships_touching(retired)
        .map(|r| r.id)
        .collect();

    for id in touching {
        let Some(current) = ws.relationship(id).cloned() else {
            continue;
        };
        let replace = |g: GroupId| if g == retired { survivor } else { g };
        let key = RelationshipKey {
            kind: current.kind,
            source: replace(current.source),
            target: replace(current.target),
            relation: current.relation,
        };
        result.affected_relationship_ids.insert(id);

        match ws.find_relationship(&key) {
            Some(existing) if existing != id => {
                fold_relationship(ws, id, existing)?;
                result.affected_relationship_ids.insert(existing);
            }
            _ => {
                let relationship = ws.relationship_mut(id)?;
                relationship.source = key.source;
                relationship.target = key.target;
            }
        }
    }
    Ok(())
}

/// Fold `duplicate` into `kept`: histories are concatenated, supporting
/// relationships united, and parents re-linked to `kept`.
fn fold_relationship(
    ws: &mut WorkingSet,
    duplicate: RelationshipId,
    kept: RelationshipId,
) -> Result<(), BrokerError> {
    let Some(folded) = ws.relationship(duplicate).cloned() else {
        return Ok(());
    };
    let parents: Vec<RelationshipId> = ws
        .snapshot()
        .parents_of(duplicate)
        .map(|r| r.id)
        .collect();

    {
        let target = ws.relationship_mut(kept)?;
        target.absorb_history(&folded.history);
        for sub in &folded.subrelationships {
            target.add_subrelationship(*sub);
        }
    }
    for parent in parents {
        ws.relationship_mut(parent)?.add_subrelationship(kept);
    }
    ws.remove_relationship(duplicate)
}

#[cfg(test)]
mod tests {
    use super::*;
    use broker_shared::{
        ClusterSnapshot, FactKey, Group, GroupRelationship, HistoryEntry, Identifier, Relation,
    };
    use chrono::{TimeZone, Utc};
    use serde_json::json;

    struct Fixture {
        snapshot: ClusterSnapshot,
        day: u32,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                snapshot: ClusterSnapshot::new(),
                day: 1,
            }
        }

        /// Add an Identity group in its own Version group. Later calls create
        /// younger groups.
        fn cluster(&mut self, doi: &str) -> (GroupId, GroupId) {
            let created_at = Utc.with_ymd_and_hms(2018, 1, self.day, 0, 0, 0).unwrap();
            self.day += 1;
            let mut identity = Group::identity(vec![Identifier::doi(doi)]);
            let mut version = Group::version(vec![identity.id]);
            identity.container = Some(version.id);
            identity.created_at = created_at;
            version.created_at = created_at;
            let ids = (identity.id, version.id);
            self.snapshot.insert_group(identity);
            self.snapshot.insert_group(version);
            ids
        }

        fn relate(
            &mut self,
            kind: GroupKind,
            source: GroupId,
            target: GroupId,
            day: u32,
        ) -> RelationshipId {
            let mut rel = GroupRelationship::new(kind, source, target, Relation::Cites);
            rel.append_history(HistoryEntry {
                fact: FactKey {
                    source: Identifier::doi(format!("src-{}", day)),
                    relation: Relation::Cites,
                    target: Identifier::doi("tgt"),
                    observed_at: Utc.with_ymd_and_hms(2019, 1, day, 0, 0, 0).unwrap(),
                },
                metadata: json!({}),
            });
            let id = rel.id;
            self.snapshot.insert_relationship(rel);
            id
        }

        fn working_set(&self) -> WorkingSet {
            WorkingSet::new(self.snapshot.clone())
        }
    }

    #[test]
    fn test_identity_merge_moves_identifiers_to_older_group() {
        let mut fx = Fixture::new();
        let (a, va) = fx.cluster("10.1/a");
        let (b, vb) = fx.cluster("10.1/b");
        let mut ws = fx.working_set();

        let result = merge_groups(&mut ws, b, a).unwrap();

        assert_eq!(result.survivor, Some(a));
        assert_eq!(result.retired, Some(b));
        assert_eq!(
            ws.group(a).unwrap().identifiers,
            vec![Identifier::doi("10.1/a"), Identifier::doi("10.1/b")]
        );
        assert!(ws.group(b).is_none());
        assert!(ws.group(vb).unwrap().members.is_empty());
        assert_eq!(result.affected_group_ids, [a, b, va, vb].into_iter().collect());
        let shift = result.version_shift.unwrap();
        assert!(shift.needs_version_merge());
        assert_eq!(shift.retired_before, Some(vb));
        assert_eq!(shift.after, Some(va));

        let changeset = ws.into_changeset().unwrap();
        assert_eq!(changeset.retired_groups.len(), 1);
        assert_eq!(changeset.retired_groups[0].survivor, a);
    }

    #[test]
    fn test_merge_order_does_not_change_survivor() {
        let mut fx = Fixture::new();
        let (a, _) = fx.cluster("10.1/a");
        let (b, _) = fx.cluster("10.1/b");

        let forward = merge_groups(&mut fx.working_set(), a, b).unwrap();
        let backward = merge_groups(&mut fx.working_set(), b, a).unwrap();

        assert_eq!(forward.survivor, backward.survivor);
        assert_eq!(forward.affected_group_ids, backward.affected_group_ids);
    }

    #[test]
    fn test_mismatched_kinds_are_rejected() {
        let mut fx = Fixture::new();
        let (a, _) = fx.cluster("10.1/a");
        let (_, vb) = fx.cluster("10.1/b");
        let mut ws = fx.working_set();

        let err = merge_groups(&mut ws, a, vb).unwrap_err();

        assert!(matches!(err, BrokerError::InvalidMerge(_)));
        assert!(!ws.has_changes());
    }

    #[test]
    fn test_merging_a_group_with_itself_is_a_noop() {
        let mut fx = Fixture::new();
        let (a, _) = fx.cluster("10.1/a");
        let mut ws = fx.working_set();

        assert!(merge_groups(&mut ws, a, a).unwrap().is_noop());
        assert!(!ws.has_changes());
    }

    #[test]
    fn test_version_merge_moves_members() {
        let mut fx = Fixture::new();
        let (a, va) = fx.cluster("10.1/a");
        let (b, vb) = fx.cluster("10.1/b");
        let mut ws = fx.working_set();

        let result = merge_groups(&mut ws, vb, va).unwrap();

        assert_eq!(result.survivor, Some(va));
        assert!(result.version_shift.is_none());
        assert_eq!(ws.group(va).unwrap().members, vec![a, b]);
        assert_eq!(ws.group(b).unwrap().container, Some(va));
        ws.check_invariants().unwrap();
    }

    #[test]
    fn test_relationships_are_repointed() {
        let mut fx = Fixture::new();
        let (a, _) = fx.cluster("10.1/a");
        let (b, _) = fx.cluster("10.1/b");
        let (c, _) = fx.cluster("10.1/c");
        let b_cites_c = fx.relate(GroupKind::Identity, b, c, 1);
        let c_cites_b = fx.relate(GroupKind::Identity, c, b, 2);
        let mut ws = fx.working_set();

        let result = merge_groups(&mut ws, a, b).unwrap();

        assert_eq!(ws.relationship(b_cites_c).unwrap().source, a);
        assert_eq!(ws.relationship(c_cites_b).unwrap().target, a);
        assert!(result.affected_relationship_ids.contains(&b_cites_c));
        assert!(ws.snapshot().relationships_touching(b).next().is_none());
    }

    #[test]
    fn test_duplicate_relationships_are_folded() {
        let mut fx = Fixture::new();
        let (a, va) = fx.cluster("10.1/a");
        let (b, vb) = fx.cluster("10.1/b");
        let (c, vc) = fx.cluster("10.1/c");
        let a_cites_c = fx.relate(GroupKind::Identity, a, c, 1);
        let b_cites_c = fx.relate(GroupKind::Identity, b, c, 2);
        let vb_cites_vc = fx.relate(GroupKind::Version, vb, vc, 2);
        fx.snapshot
            .relationships
            .get_mut(&vb_cites_vc)
            .unwrap()
            .add_subrelationship(b_cites_c);
        let mut ws = fx.working_set();

        merge_groups(&mut ws, a, b).unwrap();

        assert!(ws.relationship(b_cites_c).is_none());
        let kept = ws.relationship(a_cites_c).unwrap();
        assert_eq!(kept.history.len(), 2);
        assert_eq!(
            ws.relationship(vb_cites_vc).unwrap().subrelationships,
            vec![a_cites_c]
        );

        // The Version groups are still apart until the caller merges them.
        let result = merge_groups(&mut ws, va, vb).unwrap();
        assert_eq!(result.survivor, Some(va));
        assert_eq!(ws.relationship(vb_cites_vc).unwrap().source, va);

        let changeset = ws.into_changeset().unwrap();
        assert_eq!(changeset.removed_relationships.len(), 1);
        assert_eq!(changeset.removed_relationships[0].id, b_cites_c);
    }

    #[test]
    fn test_merge_keeps_survivor_metadata() {
        let mut fx = Fixture::new();
        let (a, _) = fx.cluster("10.1/a");
        let (b, _) = fx.cluster("10.1/b");
        fx.snapshot.groups.get_mut(&a).unwrap().data = Some(json!({"Title": "A"}));
        fx.snapshot.groups.get_mut(&b).unwrap().data =
            Some(json!({"Title": "B", "Type": "dataset"}));
        let mut ws = fx.working_set();

        merge_groups(&mut ws, a, b).unwrap();

        assert_eq!(
            ws.group(a).unwrap().data,
            Some(json!({"Title": "A", "Type": "dataset"}))
        );
    }

    #[test]
    fn test_result_absorb() {
        let first = GroupId::new();
        let second = GroupId::new();
        let mut result = MergeResult {
            survivor: Some(first),
            affected_group_ids: [first].into_iter().collect(),
            ..MergeResult::default()
        };
        result.absorb(MergeResult {
            survivor: Some(second),
            affected_group_ids: [second].into_iter().collect(),
            ..MergeResult::default()
        });

        assert_eq!(result.survivor, Some(first));
        assert_eq!(result.affected_group_ids.len(), 2);
    }
}
