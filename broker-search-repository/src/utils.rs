//! Utility functions for the broker search repository.

use broker_shared::{document_key, GroupId, RelationshipDocument};

use crate::errors::SearchIndexError;

/// Parse and validate the endpoint group ids of a relationship document.
///
/// Retraction filters on `Source.ID` and `Target.ID`, so a document whose
/// endpoints do not carry parseable group ids could never be retracted and is
/// rejected. The document key must also match its endpoints, relation and
/// grouping, otherwise two keys could describe one relationship.
///
/// # Returns
///
/// * `Ok((GroupId, GroupId))` - Parsed source and target group ids
/// * `Err(SearchIndexError)` - If either id is missing or invalid, or the key does not match
pub fn parse_endpoint_ids(
    document: &RelationshipDocument,
) -> Result<(GroupId, GroupId), SearchIndexError> {
    let source = endpoint(document, "Source", &document.source)?;
    let target = endpoint(document, "Target", &document.target)?;

    let expected = document_key(document.grouping, source, document.relationship_type, target);
    if document.id != expected {
        return Err(SearchIndexError::validation(format!(
            "Document ID {} does not match its endpoints (expected {})",
            document.id, expected
        )));
    }
    Ok((source, target))
}

fn endpoint(
    document: &RelationshipDocument,
    side: &str,
    value: &serde_json::Value,
) -> Result<GroupId, SearchIndexError> {
    let raw = value.get("ID").and_then(|v| v.as_str()).ok_or_else(|| {
        SearchIndexError::validation(format!("{}.ID is required (document {})", side, document.id))
    })?;
    raw.parse().map_err(|e| {
        SearchIndexError::validation(format!("{}.ID must be a valid group id: {}", side, e))
    })
}
