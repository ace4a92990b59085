//! Relationship documents for the search index.
//!
//! This module defines the document structure that is indexed in the search engine:
//!
//! ```json
//! {
//!   "ID": "<source>_<relation>_<target>_<grouping>",
//!   "Grouping": "identity",
//!   "RelationshipType": "Cites",
//!   "History": [ ... ],
//!   "Source": {"ID": "<group id>", "Identifier": [{"ID": "...", "IDScheme": "doi"}], ...},
//!   "Target": { ... }
//! }
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::{GroupId, GroupKind, Relation};

/// One published group relationship.
///
/// `Source` and `Target` hold the rendered group metadata; their `ID` field is
/// the group id that retraction filters on.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct RelationshipDocument {
    #[serde(rename = "ID")]
    pub id: String,
    pub grouping: GroupKind,
    pub relationship_type: Relation,
    #[serde(default)]
    pub history: Vec<Value>,
    pub source: Value,
    pub target: Value,
}

impl RelationshipDocument {
    /// Create a document keyed by its `(source, relation, target, grouping)` tuple.
    pub fn new(
        grouping: GroupKind,
        relationship_type: Relation,
        source_id: GroupId,
        target_id: GroupId,
        source: Value,
        target: Value,
        history: Vec<Value>,
    ) -> Self {
        Self {
            id: document_key(grouping, source_id, relationship_type, target_id),
            grouping,
            relationship_type,
            history,
            source,
            target,
        }
    }

    /// Group id of the source endpoint, read from `Source.ID`.
    pub fn source_id(&self) -> Option<GroupId> {
        endpoint_id(&self.source)
    }

    /// Group id of the target endpoint, read from `Target.ID`.
    pub fn target_id(&self) -> Option<GroupId> {
        endpoint_id(&self.target)
    }

    /// Returns true if either endpoint is `group`.
    pub fn references(&self, group: GroupId) -> bool {
        self.source_id() == Some(group) || self.target_id() == Some(group)
    }
}

/// The stable key of a relationship document.
///
/// Republishing the same logical relationship always yields the same key, so
/// publication is last-writer-wins per key.
pub fn document_key(
    grouping: GroupKind,
    source: GroupId,
    relation: Relation,
    target: GroupId,
) -> String {
    format!("{}_{}_{}_{}", source, relation, target, grouping)
}

fn endpoint_id(endpoint: &Value) -> Option<GroupId> {
    endpoint.get("ID")?.as_str()?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_document_serializes_with_stable_field_names() {
        let source = GroupId::new();
        let target = GroupId::new();
        let doc = RelationshipDocument::new(
            GroupKind::Version,
            Relation::Cites,
            source,
            target,
            json!({"ID": source.to_string(), "Identifier": []}),
            json!({"ID": target.to_string(), "Identifier": []}),
            vec![],
        );

        let value = serde_json::to_value(&doc).unwrap();
        assert_eq!(value["Grouping"], "version");
        assert_eq!(value["RelationshipType"], "Cites");
        assert_eq!(value["Source"]["ID"], source.to_string());
        assert_eq!(value["ID"], format!("{}_Cites_{}_version", source, target));
        assert!(value["History"].as_array().unwrap().is_empty());
    }

    #[test]
    fn test_endpoint_ids() {
        let source = GroupId::new();
        let doc = RelationshipDocument::new(
            GroupKind::Identity,
            Relation::IsSupplementTo,
            source,
            GroupId::new(),
            json!({"ID": source.to_string()}),
            json!({}),
            vec![],
        );
        assert_eq!(doc.source_id(), Some(source));
        assert_eq!(doc.target_id(), None);
        assert!(doc.references(source));
    }

    #[test]
    fn test_key_differs_per_grouping() {
        let a = GroupId::new();
        let b = GroupId::new();
        assert_ne!(
            document_key(GroupKind::Identity, a, Relation::Cites, b),
            document_key(GroupKind::Version, a, Relation::Cites, b)
        );
    }
}
