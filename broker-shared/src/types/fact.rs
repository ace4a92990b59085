//! Observed relationship facts.
//!
//! A [`Fact`] is the normalized form consumed by the broker. [`RawFact`] is the
//! Scholix-style wire shape (`Source`/`Target` objects, a `RelationshipType`
//! that may carry a DataCite sub-type) and is converted with
//! [`RawFact::into_fact`].

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::types::{FactKey, HistoryEntry, Identifier, Relation};

/// Optional metadata travelling with a fact.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FactMetadata {
    /// Descriptive document for the source object (title, creators, ...).
    pub source: Option<Value>,
    /// Descriptive document for the target object.
    pub target: Option<Value>,
    /// Link metadata recorded in the relationship history.
    pub link: Option<Value>,
}

/// A typed relationship between two identifiers, observed at a point in time.
#[derive(Debug, Clone, PartialEq)]
pub struct Fact {
    pub source: Identifier,
    pub relation: Relation,
    pub target: Identifier,
    pub observed_at: DateTime<Utc>,
    pub metadata: FactMetadata,
}

impl Fact {
    /// Create a fact from a canonical relation.
    pub fn new(
        source: Identifier,
        relation: Relation,
        target: Identifier,
        observed_at: DateTime<Utc>,
    ) -> Self {
        Self {
            source: source.normalized(),
            relation,
            target: target.normalized(),
            observed_at,
            metadata: FactMetadata::default(),
        }
    }

    /// Create a fact from a DataCite relation name, swapping source and target
    /// for inverse relations such as `IsCitedBy`.
    pub fn from_datacite(
        source: Identifier,
        relation: &str,
        target: Identifier,
        observed_at: DateTime<Utc>,
    ) -> Self {
        let (relation, inverted) = Relation::from_datacite(relation);
        if inverted {
            Self::new(target, relation, source, observed_at)
        } else {
            Self::new(source, relation, target, observed_at)
        }
    }

    pub fn with_metadata(mut self, metadata: FactMetadata) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn key(&self) -> FactKey {
        FactKey {
            source: self.source.clone(),
            relation: self.relation,
            target: self.target.clone(),
            observed_at: self.observed_at,
        }
    }

    /// The history entry this fact contributes to a group relationship.
    pub fn history_entry(&self) -> HistoryEntry {
        HistoryEntry {
            fact: self.key(),
            metadata: self
                .metadata
                .link
                .clone()
                .unwrap_or_else(|| Value::Object(Map::new())),
        }
    }
}

/// An object on either side of a raw fact: its identifier plus free-form metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawObject {
    #[serde(rename = "Identifier")]
    pub identifier: Identifier,
    #[serde(flatten)]
    pub metadata: Map<String, Value>,
}

/// `RelationshipType` as sent by link providers: either a bare name or a
/// Scholix object whose DataCite sub-type takes precedence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawRelationType {
    Name(String),
    Scholix {
        #[serde(rename = "Name")]
        name: String,
        #[serde(rename = "SubType", default)]
        sub_type: Option<String>,
        #[serde(rename = "SubTypeSchema", default)]
        sub_type_schema: Option<String>,
    },
}

impl RawRelationType {
    /// The relation name to map through [`Relation::from_datacite`].
    pub fn relation_name(&self) -> &str {
        match self {
            RawRelationType::Name(name) => name,
            RawRelationType::Scholix {
                name,
                sub_type,
                sub_type_schema,
            } => match (sub_type, sub_type_schema.as_deref()) {
                (Some(sub_type), Some("DataCite")) => sub_type,
                _ => name,
            },
        }
    }
}

/// Wire shape of a single relationship payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawFact {
    #[serde(rename = "Source")]
    pub source: RawObject,
    #[serde(rename = "RelationshipType")]
    pub relationship_type: RawRelationType,
    #[serde(rename = "Target")]
    pub target: RawObject,
    #[serde(rename = "LinkPublicationDate")]
    pub link_publication_date: String,
    /// Remaining link-level fields (`LinkProvider`, ...).
    #[serde(flatten)]
    pub link: Map<String, Value>,
}

impl RawFact {
    /// Normalize into a [`Fact`], applying relation inversion.
    ///
    /// `LinkPublicationDate` accepts RFC 3339 timestamps or plain `YYYY-MM-DD`
    /// dates (taken as midnight UTC).
    pub fn into_fact(self) -> Result<Fact, String> {
        let observed_at = parse_timestamp(&self.link_publication_date)?;

        let mut link = self.link;
        link.insert(
            "LinkPublicationDate".to_string(),
            Value::String(self.link_publication_date),
        );

        let (relation, inverted) = Relation::from_datacite(self.relationship_type.relation_name());
        let (source, target) = if inverted {
            (self.target, self.source)
        } else {
            (self.source, self.target)
        };

        let metadata = FactMetadata {
            source: non_empty(source.metadata),
            target: non_empty(target.metadata),
            link: Some(Value::Object(link)),
        };

        Ok(Fact::new(source.identifier, relation, target.identifier, observed_at)
            .with_metadata(metadata))
    }
}

fn non_empty(map: Map<String, Value>) -> Option<Value> {
    if map.is_empty() {
        None
    } else {
        Some(Value::Object(map))
    }
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, String> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Ok(ts.with_timezone(&Utc));
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc())
        .ok_or_else(|| format!("Invalid LinkPublicationDate: {}", raw))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn payload(relation: Value) -> Value {
        json!({
            "Source": {
                "Identifier": {"ID": "10.1/a", "IDScheme": "DOI"},
                "Title": "Title for A"
            },
            "RelationshipType": relation,
            "Target": {
                "Identifier": {"ID": "10.1/b", "IDScheme": "doi"},
                "Type": {"Name": "dataset"}
            },
            "LinkPublicationDate": "2018-01-01",
            "LinkProvider": [{"Name": "Link Provider Ltd."}]
        })
    }

    #[test]
    fn test_raw_fact_with_plain_relation() {
        let raw: RawFact = serde_json::from_value(payload(json!("Cites"))).unwrap();
        let fact = raw.into_fact().unwrap();

        assert_eq!(fact.source, Identifier::doi("10.1/a"));
        assert_eq!(fact.target, Identifier::doi("10.1/b"));
        assert_eq!(fact.relation, Relation::Cites);
        assert_eq!(fact.observed_at.to_rfc3339(), "2018-01-01T00:00:00+00:00");
        assert_eq!(fact.metadata.source.unwrap()["Title"], "Title for A");
        let link = fact.metadata.link.unwrap();
        assert_eq!(link["LinkProvider"][0]["Name"], "Link Provider Ltd.");
        assert_eq!(link["LinkPublicationDate"], "2018-01-01");
    }

    #[test]
    fn test_raw_fact_datacite_subtype_is_inverted() {
        let relation = json!({
            "Name": "IsRelatedTo",
            "SubType": "IsCitedBy",
            "SubTypeSchema": "DataCite"
        });
        let raw: RawFact = serde_json::from_value(payload(relation)).unwrap();
        let fact = raw.into_fact().unwrap();

        assert_eq!(fact.relation, Relation::Cites);
        assert_eq!(fact.source, Identifier::doi("10.1/b"));
        assert_eq!(fact.target, Identifier::doi("10.1/a"));
        assert_eq!(fact.metadata.source.unwrap()["Type"]["Name"], "dataset");
    }

    #[test]
    fn test_subtype_without_datacite_schema_uses_name() {
        let relation = RawRelationType::Scholix {
            name: "References".to_string(),
            sub_type: Some("IsCitedBy".to_string()),
            sub_type_schema: None,
        };
        assert_eq!(relation.relation_name(), "References");
    }

    #[test]
    fn test_invalid_publication_date() {
        let mut value = payload(json!("Cites"));
        value["LinkPublicationDate"] = json!("yesterday");
        let raw: RawFact = serde_json::from_value(value).unwrap();
        assert!(raw.into_fact().is_err());
    }

    #[test]
    fn test_history_entry_defaults_to_empty_metadata() {
        let fact = Fact::new(
            Identifier::doi("10.1/a"),
            Relation::Cites,
            Identifier::doi("10.1/b"),
            Utc::now(),
        );
        let entry = fact.history_entry();
        assert_eq!(entry.fact, fact.key());
        assert_eq!(entry.metadata, json!({}));
    }
}
