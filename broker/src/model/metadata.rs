//! Group metadata rendering.

use std::fmt;

use broker_shared::{ClusterSnapshot, Group, GroupKind, Identifier};
use serde_json::{json, Map, Value};

/// Chooses which Identity member supplies the metadata of a Version group.
pub trait VersionMetadataPolicy: fmt::Debug + Send + Sync {
    /// Pick the member to render. `members` are in insertion order; only
    /// members present in the snapshot are passed.
    fn select<'a>(&self, version: &Group, members: &[&'a Group]) -> Option<&'a Group>;
}

/// Takes the first Identity member by insertion order.
///
/// Richer policies (most complete, most recent) can replace it through
/// [`crate::config::BrokerConfig::metadata_policy`].
#[derive(Debug, Clone, Copy, Default)]
pub struct FirstMemberPolicy;

impl VersionMetadataPolicy for FirstMemberPolicy {
    fn select<'a>(&self, _version: &Group, members: &[&'a Group]) -> Option<&'a Group> {
        members.first().copied()
    }
}

/// Render the metadata document of a group.
///
/// Identity groups render their own `data` with their identifiers. Version
/// groups render the member chosen by `policy`. `ID` is always the group's own
/// id. Missing data renders as an empty document, never an error.
pub fn group_metadata(
    group: &Group,
    snapshot: &ClusterSnapshot,
    policy: &dyn VersionMetadataPolicy,
) -> Value {
    let (data, identifiers) = match group.kind {
        GroupKind::Identity => (group.data.as_ref(), group.identifiers.as_slice()),
        GroupKind::Version => {
            let members: Vec<&Group> = group
                .members
                .iter()
                .filter_map(|id| snapshot.group(*id))
                .collect();
            match policy.select(group, &members) {
                Some(member) => (member.data.as_ref(), member.identifiers.as_slice()),
                None => (None, [].as_slice()),
            }
        }
    };

    let mut doc = match data {
        Some(Value::Object(map)) => map.clone(),
        _ => Map::new(),
    };
    doc.insert("Identifier".to_string(), render_identifiers(identifiers));
    doc.insert("ID".to_string(), Value::String(group.id.to_string()));
    Value::Object(doc)
}

fn render_identifiers(identifiers: &[Identifier]) -> Value {
    Value::Array(
        identifiers
            .iter()
            .map(|i| json!({ "ID": i.value, "IDScheme": i.scheme }))
            .collect(),
    )
}

/// Merge `incoming` into `existing`, with incoming keys overwriting.
///
/// Returns the merged document and whether anything changed. Non-object
/// payloads are ignored.
pub fn overlay_metadata(existing: Option<&Value>, incoming: &Value) -> (Option<Value>, bool) {
    let Value::Object(incoming) = incoming else {
        return (existing.cloned(), false);
    };
    let mut merged = match existing {
        Some(Value::Object(map)) => map.clone(),
        _ => Map::new(),
    };
    let mut changed = false;
    for (key, value) in incoming {
        if merged.get(key) != Some(value) {
            merged.insert(key.clone(), value.clone());
            changed = true;
        }
    }
    if !changed {
        return (existing.cloned(), false);
    }
    (Some(Value::Object(merged)), true)
}

/// Copy keys that only `retired` has into `survivor`.
pub fn absorb_metadata(survivor: Option<&Value>, retired: Option<&Value>) -> Option<Value> {
    let Some(Value::Object(retired)) = retired else {
        return survivor.cloned();
    };
    let mut merged = match survivor {
        Some(Value::Object(map)) => map.clone(),
        Some(_) => return survivor.cloned(),
        None => Map::new(),
    };
    for (key, value) in retired {
        merged.entry(key.clone()).or_insert_with(|| value.clone());
    }
    if merged.is_empty() {
        return survivor.cloned();
    }
    Some(Value::Object(merged))
}
