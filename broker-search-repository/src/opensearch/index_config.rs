//! OpenSearch index configuration and mappings.
//!
//! This module defines the index settings and mappings for the relationship index.

use serde_json::{json, Value};

/// Configuration for the search index.
#[derive(Debug, Clone)]
pub struct IndexConfig {
    /// The alias name for the search index (used for all operations).
    pub alias: String,
    /// The version number for the index (e.g., 0 for "relationships_v0").
    pub version: u32,
}

impl IndexConfig {
    /// Create a new index configuration.
    ///
    /// # Arguments
    ///
    /// * `alias` - The index alias name
    /// * `version` - The version number
    pub fn new(alias: impl Into<String>, version: u32) -> Self {
        Self {
            alias: alias.into(),
            version,
        }
    }

    /// The concrete index the alias points at.
    pub fn versioned_index_name(&self) -> String {
        get_versioned_index_name(Some(self.version))
    }
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self::new(INDEX_NAME, 0)
    }
}

/// The base name of the search index (without version).
pub const INDEX_NAME: &str = "relationships";

/// Get the versioned index name.
///
/// # Returns
///
/// The versioned index name (e.g., "relationships_v0")
pub fn get_versioned_index_name(version: Option<u32>) -> String {
    let v = version.unwrap_or(0);
    format!("{}_v{}", INDEX_NAME, v)
}

/// Get the index settings and mappings for the relationship index.
///
/// `Source.ID`/`Target.ID` are keyword fields so retraction can run exact
/// `terms` queries on them. Identifier values are keywords for exact lookup;
/// the free-form metadata under `Source`/`Target` and the history entries are
/// stored but mapped dynamically.
pub fn get_index_settings() -> Value {
    let endpoint = json!({
        "properties": {
            "ID": { "type": "keyword" },
            "Identifier": {
                "properties": {
                    "ID": { "type": "keyword" },
                    "IDScheme": { "type": "keyword" }
                }
            }
        }
    });
    json!({
        "settings": {
            "number_of_shards": 1,
            "number_of_replicas": 1
        },
        "mappings": {
            "properties": {
                "ID": { "type": "keyword" },
                "Grouping": { "type": "keyword" },
                "RelationshipType": { "type": "keyword" },
                "History": { "type": "object", "enabled": false },
                "Source": endpoint.clone(),
                "Target": endpoint
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_ids_are_keywords() {
        let settings = get_index_settings();
        let properties = &settings["mappings"]["properties"];

        assert_eq!(properties["Source"]["properties"]["ID"]["type"], "keyword");
        assert_eq!(properties["Target"]["properties"]["ID"]["type"], "keyword");
        assert_eq!(properties["Grouping"]["type"], "keyword");
        assert_eq!(
            properties["Source"]["properties"]["Identifier"]["properties"]["IDScheme"]["type"],
            "keyword"
        );
    }

    #[test]
    fn test_versioned_index_name() {
        assert_eq!(get_versioned_index_name(None), "relationships_v0");
        assert_eq!(get_versioned_index_name(Some(3)), "relationships_v3");
        assert_eq!(IndexConfig::new("relationships", 7).versioned_index_name(), "relationships_v7");
    }
}
