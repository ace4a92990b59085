//! Identity and Version groups.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::{GroupId, Identifier};

/// The level of a group in the two-level hierarchy.
///
/// Serialized as `"identity"` / `"version"`, which is also the `Grouping` tag of
/// published relationship documents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GroupKind {
    /// Cluster of identifiers denoting one object.
    Identity,
    /// Cluster of Identity groups that are versions of one work.
    Version,
}

impl GroupKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            GroupKind::Identity => "identity",
            GroupKind::Version => "version",
        }
    }
}

impl fmt::Display for GroupKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for GroupKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "identity" => Ok(GroupKind::Identity),
            "version" => Ok(GroupKind::Version),
            other => Err(format!("Unknown group kind: {}", other)),
        }
    }
}

/// A group record together with its memberships.
///
/// Which membership fields are meaningful depends on `kind`:
///
/// - Identity groups own `identifiers`, may carry a `data` document, and
///   point at their Version group through `container`.
/// - Version groups list their Identity groups in `members`, in insertion
///   order.
///
/// `version` is the optimistic-concurrency counter of the stored row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Group {
    pub id: GroupId,
    pub kind: GroupKind,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default)]
    pub identifiers: Vec<Identifier>,
    #[serde(default)]
    pub members: Vec<GroupId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container: Option<GroupId>,
    #[serde(default)]
    pub version: i64,
}

impl Group {
    /// Create a new Identity group owning `identifiers`.
    pub fn identity(identifiers: Vec<Identifier>) -> Self {
        Self {
            id: GroupId::new(),
            kind: GroupKind::Identity,
            created_at: now(),
            data: None,
            identifiers,
            members: Vec::new(),
            container: None,
            version: 0,
        }
    }

    /// Create a new Version group over `members`.
    pub fn version(members: Vec<GroupId>) -> Self {
        Self {
            id: GroupId::new(),
            kind: GroupKind::Version,
            created_at: now(),
            data: None,
            identifiers: Vec::new(),
            members,
            container: None,
            version: 0,
        }
    }

    /// Key deciding which group survives a merge: the lower key wins.
    ///
    /// This is also the order in which cluster locks are taken.
    pub fn merge_order_key(&self) -> (DateTime<Utc>, GroupId) {
        (self.created_at, self.id)
    }

    /// Returns true if `self` survives a merge with `other`.
    pub fn precedes(&self, other: &Group) -> bool {
        self.merge_order_key() < other.merge_order_key()
    }

    pub fn owns(&self, identifier: &Identifier) -> bool {
        self.identifiers.contains(identifier)
    }
}

/// Creation timestamps are kept at microsecond precision so that the survivor
/// order is identical before and after a round trip through the store.
fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_older_group_precedes() {
        let mut a = Group::identity(vec![Identifier::doi("10.1/a")]);
        let mut b = Group::identity(vec![Identifier::doi("10.1/b")]);
        a.created_at = Utc.with_ymd_and_hms(2018, 1, 1, 0, 0, 0).unwrap();
        b.created_at = Utc.with_ymd_and_hms(2018, 1, 2, 0, 0, 0).unwrap();
        assert!(a.precedes(&b));
        assert!(!b.precedes(&a));
    }

    #[test]
    fn test_tie_breaks_on_lower_id() {
        let mut a = Group::version(vec![]);
        let mut b = Group::version(vec![]);
        b.created_at = a.created_at;
        if a.id > b.id {
            std::mem::swap(&mut a, &mut b);
        }
        assert!(a.precedes(&b));
    }

    #[test]
    fn test_kind_serializes_as_grouping_tag() {
        assert_eq!(
            serde_json::to_string(&GroupKind::Identity).unwrap(),
            "\"identity\""
        );
        assert_eq!("version".parse::<GroupKind>().unwrap(), GroupKind::Version);
    }
}
