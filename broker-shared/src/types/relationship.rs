//! Group relationships and their provenance history.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::{GroupId, GroupKind, Identifier, Relation, RelationshipId};

/// Natural key of an observed raw fact.
///
/// Two observations with the same key are the same fact; history entries are
/// deduplicated on it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FactKey {
    pub source: Identifier,
    pub relation: Relation,
    pub target: Identifier,
    pub observed_at: DateTime<Utc>,
}

/// One contributing raw fact in a relationship's history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub fact: FactKey,
    /// Link metadata supplied with the fact (provider, publication date, ...).
    #[serde(default)]
    pub metadata: Value,
}

/// Unique key of a group relationship: one edge per `(kind, source, target, relation)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RelationshipKey {
    pub kind: GroupKind,
    pub source: GroupId,
    pub target: GroupId,
    pub relation: Relation,
}

/// A directed, typed edge between two groups of the same kind.
///
/// Version-level relationships list the Identity-level relationships that
/// support them in `subrelationships` (the relationship membership edges).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupRelationship {
    pub id: RelationshipId,
    pub kind: GroupKind,
    pub source: GroupId,
    pub target: GroupId,
    pub relation: Relation,
    #[serde(default)]
    pub history: Vec<HistoryEntry>,
    #[serde(default)]
    pub subrelationships: Vec<RelationshipId>,
    #[serde(default)]
    pub version: i64,
}

impl GroupRelationship {
    pub fn new(kind: GroupKind, source: GroupId, target: GroupId, relation: Relation) -> Self {
        Self {
            id: RelationshipId::new(),
            kind,
            source,
            target,
            relation,
            history: Vec::new(),
            subrelationships: Vec::new(),
            version: 0,
        }
    }

    pub fn key(&self) -> RelationshipKey {
        RelationshipKey {
            kind: self.kind,
            source: self.source,
            target: self.target,
            relation: self.relation,
        }
    }

    /// Returns true if `group` is the source or the target.
    pub fn touches(&self, group: GroupId) -> bool {
        self.source == group || self.target == group
    }

    /// Append a history entry unless a fact with the same key is already recorded.
    ///
    /// Returns whether the history changed.
    pub fn append_history(&mut self, entry: HistoryEntry) -> bool {
        if self.history.iter().any(|h| h.fact == entry.fact) {
            return false;
        }
        self.history.push(entry);
        true
    }

    /// Concatenate another history onto this one, keeping first occurrences.
    pub fn absorb_history(&mut self, entries: &[HistoryEntry]) {
        for entry in entries {
            self.append_history(entry.clone());
        }
    }

    /// Add a supporting relationship if it is not listed yet.
    pub fn add_subrelationship(&mut self, id: RelationshipId) -> bool {
        if self.subrelationships.contains(&id) {
            return false;
        }
        self.subrelationships.push(id);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn entry(day: u32) -> HistoryEntry {
        HistoryEntry {
            fact: FactKey {
                source: Identifier::doi("10.1/a"),
                relation: Relation::Cites,
                target: Identifier::doi("10.1/b"),
                observed_at: Utc.with_ymd_and_hms(2018, 1, day, 0, 0, 0).unwrap(),
            },
            metadata: json!({"LinkProvider": {"Name": "Provider"}}),
        }
    }

    fn citation() -> GroupRelationship {
        GroupRelationship::new(
            GroupKind::Identity,
            GroupId::new(),
            GroupId::new(),
            Relation::Cites,
        )
    }

    #[test]
    fn test_duplicate_fact_is_not_appended_twice() {
        let mut rel = citation();
        assert!(rel.append_history(entry(1)));
        assert!(!rel.append_history(entry(1)));
        assert!(rel.append_history(entry(2)));
        assert_eq!(rel.history.len(), 2);
    }

    #[test]
    fn test_absorb_history_keeps_order_and_first_occurrence() {
        let mut a = citation();
        a.append_history(entry(2));
        a.absorb_history(&[entry(1), entry(2), entry(3)]);
        let days: Vec<_> = a
            .history
            .iter()
            .map(|h| h.fact.observed_at.format("%d").to_string())
            .collect();
        assert_eq!(days, vec!["02", "01", "03"]);
    }

    #[test]
    fn test_touches() {
        let source = GroupId::new();
        let target = GroupId::new();
        let rel = GroupRelationship::new(GroupKind::Version, source, target, Relation::Cites);
        assert!(rel.touches(source));
        assert!(rel.touches(target));
        assert!(!rel.touches(GroupId::new()));
    }
}
