//! Relation vocabulary between scholarly objects.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// The relation carried by a fact or a group relationship.
///
/// `IsIdenticalTo` and `HasVersion` are equivalence relations that drive
/// group merges; the others become group relationships.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Relation {
    Cites,
    IsSupplementTo,
    HasVersion,
    IsIdenticalTo,
    IsRelatedTo,
}

impl Relation {
    pub const ALL: [Relation; 5] = [
        Relation::Cites,
        Relation::IsSupplementTo,
        Relation::HasVersion,
        Relation::IsIdenticalTo,
        Relation::IsRelatedTo,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Relation::Cites => "Cites",
            Relation::IsSupplementTo => "IsSupplementTo",
            Relation::HasVersion => "HasVersion",
            Relation::IsIdenticalTo => "IsIdenticalTo",
            Relation::IsRelatedTo => "IsRelatedTo",
        }
    }

    /// Map a DataCite relation name onto the broker vocabulary.
    ///
    /// Returns the relation and whether source and target must be swapped
    /// (e.g. `IsCitedBy` is stored as an inverted `Cites`). Unknown names fall
    /// back to `IsRelatedTo`.
    ///
    /// # Example
    ///
    /// ```
    /// use broker_shared::Relation;
    ///
    /// assert_eq!(Relation::from_datacite("IsCitedBy"), (Relation::Cites, true));
    /// assert_eq!(Relation::from_datacite("HasPart"), (Relation::HasVersion, false));
    /// ```
    pub fn from_datacite(name: &str) -> (Relation, bool) {
        match name {
            "Cites" | "References" => (Relation::Cites, false),
            "IsCitedBy" | "IsReferencedBy" => (Relation::Cites, true),
            "IsSupplementTo" => (Relation::IsSupplementTo, false),
            "IsSupplementedBy" => (Relation::IsSupplementTo, true),
            "HasVersion" | "HasPart" => (Relation::HasVersion, false),
            "IsVersionOf" | "IsPartOf" => (Relation::HasVersion, true),
            "IsIdenticalTo" => (Relation::IsIdenticalTo, false),
            _ => (Relation::IsRelatedTo, false),
        }
    }
}

impl fmt::Display for Relation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Relation {
    type Err = String;

    /// Parse a stored relation name. Unlike [`Relation::from_datacite`], this
    /// only accepts the canonical names.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Relation::ALL
            .iter()
            .copied()
            .find(|r| r.as_str() == s)
            .ok_or_else(|| format!("Unknown relation: {}", s))
    }
}
