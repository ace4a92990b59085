//! Projection of group relationships into search documents.

use broker_shared::{
    ClusterSnapshot, GroupId, GroupRelationship, HistoryEntry, RelationshipDocument,
};
use serde_json::{json, Map, Value};

use crate::model::{group_metadata, VersionMetadataPolicy};

/// Build the search document of a group relationship.
///
/// `Source` and `Target` render the endpoint groups with
/// [`group_metadata`]; an endpoint missing from `snapshot` renders as
/// `{ID, Identifier: []}`. The grouping tag is the relationship's kind.
pub fn build_document(
    relationship: &GroupRelationship,
    snapshot: &ClusterSnapshot,
    policy: &dyn VersionMetadataPolicy,
) -> RelationshipDocument {
    RelationshipDocument::new(
        relationship.kind,
        relationship.relation,
        relationship.source,
        relationship.target,
        endpoint(relationship.source, snapshot, policy),
        endpoint(relationship.target, snapshot, policy),
        relationship.history.iter().map(history_item).collect(),
    )
}

fn endpoint(id: GroupId, snapshot: &ClusterSnapshot, policy: &dyn VersionMetadataPolicy) -> Value {
    match snapshot.group(id) {
        Some(group) => group_metadata(group, snapshot, policy),
        None => json!({ "ID": id.to_string(), "Identifier": [] }),
    }
}

/// One history item: the link metadata plus the observed fact.
fn history_item(entry: &HistoryEntry) -> Value {
    let mut item = match &entry.metadata {
        Value::Object(map) => map.clone(),
        _ => Map::new(),
    };
    let fact = &entry.fact;
    item.insert(
        "Source".to_string(),
        json!({ "ID": fact.source.value, "IDScheme": fact.source.scheme }),
    );
    item.insert(
        "RelationshipType".to_string(),
        Value::String(fact.relation.as_str().to_string()),
    );
    item.insert(
        "Target".to_string(),
        json!({ "ID": fact.target.value, "IDScheme": fact.target.scheme }),
    );
    item.insert(
        "ObservedAt".to_string(),
        Value::String(fact.observed_at.to_rfc3339()),
    );
    Value::Object(item)
}

#[cfg(test)]
mod tests {
    use super::*;
    use broker_shared::{Fact, FactMetadata, Group, GroupKind, Identifier, Relation};
    use chrono::{TimeZone, Utc};

    use crate::model::FirstMemberPolicy;

    #[test]
    fn test_identity_document() {
        let mut source = Group::identity(vec![Identifier::doi("10.1/a")]);
        source.data = Some(json!({"Title": "Paper"}));
        let target = Group::identity(vec![Identifier::doi("10.1/b")]);

        let fact = Fact::new(
            Identifier::doi("10.1/a"),
            Relation::Cites,
            Identifier::doi("10.1/b"),
            Utc.with_ymd_and_hms(2018, 3, 1, 0, 0, 0).unwrap(),
        )
        .with_metadata(FactMetadata {
            link: Some(json!({"LinkProvider": [{"Name": "Crossref"}]})),
            ..Default::default()
        });
        let mut rel =
            GroupRelationship::new(GroupKind::Identity, source.id, target.id, Relation::Cites);
        rel.append_history(fact.history_entry());

        let mut snapshot = ClusterSnapshot::new();
        snapshot.insert_group(source.clone());
        snapshot.insert_group(target.clone());

        let doc = build_document(&rel, &snapshot, &FirstMemberPolicy);
        let value = serde_json::to_value(&doc).unwrap();

        assert_eq!(value["Grouping"], "identity");
        assert_eq!(value["RelationshipType"], "Cites");
        assert_eq!(value["Source"]["ID"], source.id.to_string());
        assert_eq!(value["Source"]["Title"], "Paper");
        assert_eq!(value["Source"]["Identifier"][0]["ID"], "10.1/a");
        assert_eq!(value["Target"]["Identifier"][0]["IDScheme"], "doi");

        let history = value["History"].as_array().unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0]["LinkProvider"][0]["Name"], "Crossref");
        assert_eq!(history[0]["Target"]["ID"], "10.1/b");
        assert_eq!(history[0]["ObservedAt"], "2018-03-01T00:00:00+00:00");
    }

    #[test]
    fn test_version_document_uses_first_member() {
        let mut first = Group::identity(vec![Identifier::doi("10.1/a.v1")]);
        first.data = Some(json!({"Title": "First"}));
        let mut second = Group::identity(vec![Identifier::doi("10.1/a.v2")]);
        second.data = Some(json!({"Title": "Second"}));
        let source = Group::version(vec![first.id, second.id]);
        let target = Group::version(vec![]);

        let mut snapshot = ClusterSnapshot::new();
        for group in [first, second, source.clone(), target.clone()] {
            snapshot.insert_group(group);
        }
        let rel = GroupRelationship::new(
            GroupKind::Version,
            source.id,
            target.id,
            Relation::IsSupplementTo,
        );

        let doc = build_document(&rel, &snapshot, &FirstMemberPolicy);

        assert_eq!(doc.grouping, GroupKind::Version);
        assert_eq!(doc.source["Title"], "First");
        assert_eq!(doc.source["ID"], source.id.to_string());
        assert_eq!(doc.target, json!({"ID": target.id.to_string(), "Identifier": []}));
        assert!(doc.history.is_empty());
    }

    #[test]
    fn test_missing_endpoint_renders_empty() {
        let rel = GroupRelationship::new(
            GroupKind::Identity,
            GroupId::new(),
            GroupId::new(),
            Relation::IsRelatedTo,
        );
        let doc = build_document(&rel, &ClusterSnapshot::new(), &FirstMemberPolicy);

        assert_eq!(doc.source_id(), Some(rel.source));
        assert_eq!(doc.target["Identifier"], json!([]));
    }
}
